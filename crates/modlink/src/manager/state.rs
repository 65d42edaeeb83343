//! Manager-side state machine: `Select` until a module is running, then
//! `Communicate` relaying requests to it.

use std::sync::Arc;
use std::time::Duration;

use super::launcher::ModuleLauncher;
use crate::config::{AppConfig, ClientConfig};
use crate::error::{CommunicationError, ControllerError};
use crate::module::ModuleRegistry;
use crate::transport::Client;
use crate::wire::{ConnectionInfo, Message, Operation};

/// Payload of the `SELECT` sent to a freshly launched module.
const SELECT_GREETING: &str = "gogogo";
/// Payload of the `EXIT` sent when tearing a module down.
const EXIT_FAREWELL: &str = "rip";

/// Everything the states need besides the session itself.
pub struct ManagerContext {
    pub launcher: Arc<dyn ModuleLauncher>,
    pub registry: ModuleRegistry,
    pub app: AppConfig,
}

impl ManagerContext {
    pub fn new(launcher: Arc<dyn ModuleLauncher>, registry: ModuleRegistry, app: AppConfig) -> Self {
        Self {
            launcher,
            registry,
            app,
        }
    }
}

/// A selected module: the internal client connected to it and its process.
#[derive(Debug)]
pub struct Session {
    client: Client,
    pid: u32,
    module: String,
}

impl Session {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn module(&self) -> &str {
        &self.module
    }
}

#[derive(Debug, Default)]
pub enum ManagerState {
    #[default]
    Select,
    Communicate(Session),
}

impl ManagerState {
    pub fn is_select(&self) -> bool {
        matches!(self, ManagerState::Select)
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            ManagerState::Communicate(session) => Some(session),
            ManagerState::Select => None,
        }
    }

    /// Launches `module`, connects to it and completes the module `SELECT`.
    pub async fn select(&mut self, ctx: &ManagerContext, module: &str) -> Result<(), ControllerError> {
        if let ManagerState::Communicate(_) = self {
            return Err(ControllerError::invalid_transition(
                "Cannot SELECT in COMMUNICATE - state. There is already a selected module.",
            ));
        }

        let config = ctx
            .registry
            .config(module, &ctx.app)
            .ok_or_else(|| ControllerError::operation("Failed to find vulnerable module."))?;
        let manager = &ctx.app.manager;

        let client = Client::user();
        client.set_configuration(config.client.clone()).await;

        let launched = ctx
            .launcher
            .launch(module, &manager.factory)
            .await
            .map_err(|e| ControllerError::ModuleCreation(format!("Failed to launch module: {e}")))?;

        match establish(ctx, &client).await {
            Ok(pid) => {
                tracing::info!(module, pid, "Module selected");
                *self = ManagerState::Communicate(Session {
                    client,
                    pid,
                    module: module.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                client.disconnect().await;
                if let Some(pid) = launched {
                    reap(ctx, pid).await;
                }
                Err(e)
            }
        }
    }

    /// Tears the selected module down and returns to `Select`.
    pub async fn exit(&mut self, ctx: &ManagerContext) -> Result<(), ControllerError> {
        match std::mem::take(self) {
            ManagerState::Select => Err(ControllerError::invalid_transition(
                "Cannot EXIT from SELECT - state. There is not a selected module.",
            )),
            ManagerState::Communicate(session) => {
                close_session(ctx, session).await;
                Ok(())
            }
        }
    }

    /// Like [`exit`](Self::exit) but a no-op in `Select`.
    pub async fn teardown(&mut self, ctx: &ManagerContext) {
        if let ManagerState::Communicate(session) = std::mem::take(self) {
            close_session(ctx, session).await;
        }
    }

    /// Relays a `FORWARD` request to the module.
    pub async fn forward(&mut self, ctx: &ManagerContext, message: &Message) -> Result<(), ControllerError> {
        if self.is_select() {
            return Err(ControllerError::invalid_transition(
                "Cannot FORWARD message in SELECT - state. There is not a selected module.",
            ));
        }
        self.relay(ctx, message, "Failed to forward data.").await.map(|_| ())
    }

    /// Relays a `FETCH` request and returns the module's reply unchanged.
    pub async fn fetch(&mut self, ctx: &ManagerContext, message: &Message) -> Result<Message, ControllerError> {
        if self.is_select() {
            return Err(ControllerError::invalid_transition(
                "Cannot FETCH message in SELECT - state. There is not a selected module.",
            ));
        }
        self.relay(ctx, message, "Failed to fetch data.").await
    }

    async fn relay(
        &mut self,
        ctx: &ManagerContext,
        message: &Message,
        failure: &str,
    ) -> Result<Message, ControllerError> {
        let (client, module) = match &*self {
            ManagerState::Communicate(session) => (session.client.clone(), session.module.clone()),
            ManagerState::Select => {
                return Err(ControllerError::invalid_transition("No module selected."));
            }
        };

        match request(&client, message.clone()).await {
            Ok(reply) if reply.operation() == Operation::Exit => {
                tracing::info!(module = %module, "Module terminated itself");
                self.teardown(ctx).await;
                Err(terminated_itself(&reply))
            }
            Ok(reply) if reply.operation() != Operation::Success => Err(unsuccessful(&reply)),
            Ok(reply) => Ok(reply),
            Err(e) => {
                tracing::warn!(module = %module, error = %e, "Lost module connection");
                self.teardown(ctx).await;
                Err(ControllerError::communication(failure, e))
            }
        }
    }
}

// Only the reply's content is quoted: a serialized frame would carry a second
// CONTENT token and the peer would cut the detail at it.
fn terminated_itself(reply: &Message) -> ControllerError {
    ControllerError::ModuleExit(format!(
        "Vulnerable module terminated itself: {}",
        reply.content_lossy()
    ))
}

fn unsuccessful(reply: &Message) -> ControllerError {
    ControllerError::operation(format!(
        "Operation was not successful: {}",
        reply.content_lossy()
    ))
}

/// One request/response exchange with the module.
async fn request(client: &Client, message: Message) -> Result<Message, CommunicationError> {
    client.send(message).await?;
    client
        .receive()
        .await?
        .ok_or_else(|| CommunicationError::connection("Module closed the connection."))
}

/// Connects to the launched module with retries and returns its reported pid.
async fn establish(ctx: &ManagerContext, client: &Client) -> Result<u32, ControllerError> {
    let manager = &ctx.app.manager;
    let info = ConnectionInfo::new(manager.module_address.host.clone(), manager.module_address.port)
        .with_timeout(Duration::from_millis(manager.connect_timeout_ms));

    let attempts = manager.connect_retries.max(1);
    let mut connected = false;
    for attempt in 1..=attempts {
        match client.connect(&info).await {
            Ok(()) => {
                connected = true;
                break;
            }
            Err(e) => {
                tracing::debug!(attempt, address = %info, error = %e, "Module not reachable yet");
                if attempt < attempts {
                    tokio::time::sleep(manager.connect_retry_delay()).await;
                }
            }
        }
    }
    if !connected {
        return Err(ControllerError::ModuleCreation(
            "Failed to connect to vulnerable module.".to_string(),
        ));
    }

    let reply = request(client, Message::new(Operation::Select, SELECT_GREETING))
        .await
        .map_err(|e| ControllerError::ModuleCreation(format!("Failed to select vulnerable module: {e}")))?;
    if reply.operation() != Operation::Success {
        return Err(ControllerError::ModuleCreation(format!(
            "Vulnerable module refused selection: {}",
            reply.content_lossy()
        )));
    }
    reply.content_lossy().trim().parse::<u32>().map_err(|_| {
        ControllerError::ModuleCreation(format!(
            "Failed retrieving pid of vulnerable module: {}",
            reply.content_lossy()
        ))
    })
}

/// Asks the module to exit, drops the connection and kills its process.
async fn close_session(ctx: &ManagerContext, session: Session) {
    let Session { client, pid, module } = session;
    tracing::info!(module = %module, pid, "Closing module");

    client.set_configuration(ClientConfig::exit()).await;
    if client
        .send(Message::new(Operation::Exit, EXIT_FAREWELL))
        .await
        .is_ok()
    {
        let _ = client.receive().await;
    }
    client.disconnect().await;
    reap(ctx, pid).await;
}

/// Terminates `pid` and blocks until the launcher no longer reports it alive.
async fn reap(ctx: &ManagerContext, pid: u32) {
    if let Err(e) = ctx.launcher.terminate(pid).await {
        tracing::warn!(pid, error = %e, "Failed to terminate module");
    }
    let poll = ctx.app.manager.liveness_poll();
    while ctx.launcher.is_alive(pid).await {
        tokio::time::sleep(poll).await;
    }
    tracing::debug!(pid, "Module process gone");
}
