//! Module-side controller: answers the manager's requests against the local
//! worker.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::bridge::ModuleBridge;
use super::registry::{Module, ModuleRegistry};
use super::state::{ModuleContext, ModuleState};
use super::worker::Worker;
use crate::config::{AppConfig, ModuleConfig};
use crate::error::ControllerError;
use crate::transport::{Client, ClientEvent, CommunicationListener};
use crate::wire::{Message, Operation};

pub struct ModuleController {
    context: ModuleContext,
    state: Mutex<ModuleState>,
    process_id: u32,
    reply_retries: u32,
    shutdown: CancellationToken,
}

impl ModuleController {
    pub fn new(name: impl Into<String>, module: Box<dyn Module>, config: &ModuleConfig) -> Self {
        let worker = Worker::new(name, module, ModuleBridge::new(config.bridge.clone()));
        Self {
            context: ModuleContext::new(worker),
            state: Mutex::new(ModuleState::default()),
            process_id: std::process::id(),
            reply_retries: 2,
            shutdown: CancellationToken::new(),
        }
    }

    /// Instantiates `name` from the registry with its resolved configuration.
    pub fn from_registry(
        registry: &ModuleRegistry,
        name: &str,
        app: &AppConfig,
    ) -> Result<Self, ControllerError> {
        let module = registry
            .create(name)
            .ok_or_else(|| ControllerError::Initialization(format!("Failed to instantiate {name}")))?;
        let config = registry
            .config(name, app)
            .ok_or_else(|| ControllerError::Initialization(format!("No configuration for {name}")))?;
        Ok(Self::new(name, module, &config).with_reply_retries(app.module.reply_retries))
    }

    /// Identifier reported in the `SELECT` reply.
    pub fn with_process_id(mut self, pid: u32) -> Self {
        self.process_id = pid;
        self
    }

    pub fn with_reply_retries(mut self, retries: u32) -> Self {
        self.reply_retries = retries.max(1);
        self
    }

    pub fn name(&self) -> &str {
        self.context.worker().name()
    }

    pub async fn state(&self) -> ModuleState {
        *self.state.lock().await
    }

    /// Cancelled once the host should exit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Interrupts the worker and signals the host to exit.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(module = %self.name(), "Module shutting down");
        }
        self.context.worker().interrupt();
        self.shutdown.cancel();
    }

    /// Computes the reply to one request. `None` means no reply is sent.
    async fn handle(&self, message: &Message) -> Option<Message> {
        let result = {
            let mut state = self.state.lock().await;
            match message.operation() {
                Operation::Select => state
                    .select(&self.context)
                    .map(|()| Message::new(Operation::Success, self.process_id.to_string())),
                Operation::Forward => state
                    .forward(&self.context, message.content().clone())
                    .await
                    .map(|()| Message::new(Operation::Success, "Successfully forwarded data.")),
                Operation::Fetch => state.fetch(&self.context).await,
                Operation::Exit => {
                    self.context.request_exit();
                    Ok(Message::new(Operation::Success, "Module exiting."))
                }
                Operation::Shutdown => {
                    self.context.request_exit();
                    return None;
                }
                other => Ok(Message::new(
                    Operation::Invalid,
                    format!("Invalid operation: {other}"),
                )),
            }
        };

        Some(match result {
            Ok(reply) => reply,
            Err(e @ ControllerError::ModuleExit(_)) => {
                tracing::info!(module = %self.name(), error = %e, "Worker is gone");
                Message::new(Operation::Exit, e.detail())
            }
            Err(e @ (ControllerError::InvalidTransition(_) | ControllerError::ModuleOperation(_))) => {
                tracing::debug!(module = %self.name(), error = %e, "Request rejected");
                Message::new(Operation::Invalid, e.detail())
            }
            Err(e) => {
                tracing::error!(module = %self.name(), error = %e, "Unrecoverable module error");
                self.context.request_exit();
                Message::new(Operation::Invalid, e.detail())
            }
        })
    }

    /// Sends `reply` with the retry budget. Exhausting it shuts the module down.
    async fn send_retry(&self, client: &Client, reply: Message) {
        for attempt in 1..=self.reply_retries {
            match client.send(reply.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(module = %self.name(), attempt, error = %e, "Failed to send reply")
                }
            }
        }
        self.shutdown();
    }

    fn finish_request(&self) {
        if self.context.exit_requested() {
            self.shutdown();
        }
    }
}

#[async_trait]
impl CommunicationListener for ModuleController {
    async fn on_event(&self, client: &Client, event: ClientEvent) {
        match event {
            ClientEvent::Received(message) => {
                if let Some(reply) = self.handle(&message).await {
                    self.send_retry(client, reply).await;
                }
                self.finish_request();
            }
            ClientEvent::InvalidMessage(raw) => {
                let reply = Message::new(
                    Operation::Invalid,
                    format!("Invalid message: {}", String::from_utf8_lossy(&raw)),
                );
                self.send_retry(client, reply).await;
            }
            ClientEvent::Disconnected => {
                tracing::info!(module = %self.name(), client_id = %client.id(), "Manager disconnected");
                self.shutdown();
            }
            ClientEvent::Connected => {
                tracing::info!(module = %self.name(), client_id = %client.id(), "Manager connected");
            }
            ClientEvent::Sent(_) => {}
        }
    }
}
