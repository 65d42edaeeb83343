//! Manager-side controller: serves one external peer at a time and drives the
//! selected module on its behalf.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::launcher::ModuleLauncher;
use super::state::{ManagerContext, ManagerState};
use crate::config::{AppConfig, ClientConfig};
use crate::module::ModuleRegistry;
use crate::transport::{Client, ClientEvent, CommunicationListener};
use crate::wire::{Message, Operation};

pub struct ManagerController {
    context: ManagerContext,
    state: Mutex<ManagerState>,
    main_client: Mutex<Option<Client>>,
    reply_retries: u32,
    shutdown: CancellationToken,
}

impl ManagerController {
    pub fn new(launcher: Arc<dyn ModuleLauncher>, registry: ModuleRegistry, app: AppConfig) -> Self {
        let reply_retries = app.manager.reply_retries.max(1);
        Self {
            context: ManagerContext::new(launcher, registry, app),
            state: Mutex::new(ManagerState::Select),
            main_client: Mutex::new(None),
            reply_retries,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelled once the manager should exit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The peer currently being served.
    pub async fn main_client(&self) -> Option<Client> {
        self.main_client.lock().await.clone()
    }

    /// Name of the selected module, if any.
    pub async fn selected(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .session()
            .map(|session| session.module().to_string())
    }

    /// Tears down the selected module and signals the host to exit.
    pub async fn shutdown(&self) {
        self.state.lock().await.teardown(&self.context).await;
        if !self.shutdown.is_cancelled() {
            tracing::info!("Manager shutting down");
        }
        self.shutdown.cancel();
    }

    /// Computes the reply to one request. `None` means no reply is sent; a set
    /// flag asks for shutdown once the reply is out.
    async fn handle(&self, message: &Message) -> (Option<Message>, bool) {
        let result = {
            let mut state = self.state.lock().await;
            match message.operation() {
                Operation::Select => state
                    .select(&self.context, message.content_lossy().trim())
                    .await
                    .map(|()| Message::new(Operation::Success, "Successfully selected module.")),
                Operation::Exit => state
                    .exit(&self.context)
                    .await
                    .map(|()| Message::new(Operation::Success, "Successfully closed module.")),
                Operation::Forward => state
                    .forward(&self.context, message)
                    .await
                    .map(|()| Message::new(Operation::Success, "Successfully forwarded message.")),
                Operation::Fetch => state.fetch(&self.context, message).await,
                Operation::Shutdown => {
                    drop(state);
                    self.shutdown().await;
                    return (None, false);
                }
                other => Ok(Message::new(
                    Operation::Invalid,
                    format!("Invalid operation: {other}"),
                )),
            }
        };

        match result {
            Ok(reply) => (Some(reply), false),
            Err(e) if e.is_recoverable() => {
                tracing::debug!(operation = %message.operation(), error = %e, "Request failed");
                (Some(Message::new(Operation::Invalid, e.detail())), false)
            }
            Err(e) => {
                tracing::error!(error = %e, "Unrecoverable manager error");
                (Some(Message::new(Operation::Invalid, e.detail())), true)
            }
        }
    }

    /// Sends `reply` with the retry budget. Exhausting it drops the peer.
    async fn send_retry(&self, client: &Client, reply: Message) {
        for attempt in 1..=self.reply_retries {
            match client.send(reply.clone()).await {
                Ok(()) => return,
                Err(e) => tracing::warn!(client_id = %client.id(), attempt, error = %e, "Failed to send reply"),
            }
        }
        client.disconnect().await;
    }

    async fn on_connected(&self, client: &Client) {
        {
            let mut main = self.main_client.lock().await;
            match main.as_ref() {
                None => {
                    tracing::info!(client_id = %client.id(), "Serving new peer");
                    *main = Some(client.clone());
                    return;
                }
                Some(current) if current == client => return,
                Some(_) => {}
            }
        }
        tracing::warn!(client_id = %client.id(), "Rejecting peer, another one is being served");
        client.set_configuration(ClientConfig::exit()).await;
        client.disconnect().await;
    }

    async fn on_disconnected(&self, client: &Client) {
        let mut main = self.main_client.lock().await;
        if main.as_ref() != Some(client) {
            return;
        }
        tracing::info!(client_id = %client.id(), "Peer left, closing selected module");
        // The slot stays taken until the module is gone so a new peer starts clean.
        self.state.lock().await.teardown(&self.context).await;
        *main = None;
    }
}

#[async_trait]
impl CommunicationListener for ManagerController {
    async fn on_event(&self, client: &Client, event: ClientEvent) {
        match event {
            ClientEvent::Received(message) => {
                let (reply, fatal) = self.handle(&message).await;
                if let Some(reply) = reply {
                    self.send_retry(client, reply).await;
                }
                if fatal {
                    self.shutdown().await;
                }
            }
            ClientEvent::InvalidMessage(raw) => {
                let reply = Message::new(
                    Operation::Invalid,
                    format!("Invalid message: {}", String::from_utf8_lossy(&raw)),
                );
                self.send_retry(client, reply).await;
            }
            ClientEvent::Connected => self.on_connected(client).await,
            ClientEvent::Disconnected => self.on_disconnected(client).await,
            ClientEvent::Sent(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::launcher::LaunchError;

    struct RefusingLauncher;

    #[async_trait]
    impl ModuleLauncher for RefusingLauncher {
        async fn launch(&self, _module: &str, _factory: &str) -> Result<Option<u32>, LaunchError> {
            Err(LaunchError::Other("no launches here".to_string()))
        }

        async fn terminate(&self, _pid: u32) -> Result<(), LaunchError> {
            Ok(())
        }

        async fn is_alive(&self, _pid: u32) -> bool {
            false
        }
    }

    fn controller() -> ManagerController {
        ManagerController::new(Arc::new(RefusingLauncher), ModuleRegistry::builtin(), AppConfig::default())
    }

    #[tokio::test]
    async fn replies_without_module() {
        let ctl = controller();
        let cases = [
            (Message::empty(Operation::Fetch), "Cannot FETCH message in SELECT - state. There is not a selected module."),
            (Message::empty(Operation::Exit), "Cannot EXIT from SELECT - state. There is not a selected module."),
            (Message::empty(Operation::Init), "Invalid operation: INIT"),
            (Message::new(Operation::Select, "Nope"), "Failed to find vulnerable module."),
        ];
        for (request, expected) in cases {
            let (reply, fatal) = ctl.handle(&request).await;
            assert_eq!(reply, Some(Message::new(Operation::Invalid, expected)));
            assert!(!fatal);
        }
    }

    #[tokio::test]
    async fn failed_launch_is_recoverable() {
        let ctl = controller();
        let (reply, fatal) = ctl.handle(&Message::new(Operation::Select, "EchoModule")).await;
        let reply = reply.unwrap();
        assert_eq!(reply.operation(), Operation::Invalid);
        assert!(reply.content_lossy().starts_with("Failed to launch module"));
        assert!(!fatal);
        assert!(ctl.selected().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_sends_nothing_and_cancels() {
        let ctl = controller();
        let (reply, _) = ctl.handle(&Message::empty(Operation::Shutdown)).await;
        assert!(reply.is_none());
        assert!(ctl.shutdown_token().is_cancelled());
    }
}
