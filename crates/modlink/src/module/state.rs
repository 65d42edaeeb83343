//! Module-side state machine. `Communicate` is terminal: only process exit
//! leaves it.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use super::worker::Worker;
use crate::error::ControllerError;
use crate::wire::{Message, Operation};

/// What the states act on.
pub struct ModuleContext {
    worker: Worker,
    exit_requested: AtomicBool,
}

impl ModuleContext {
    pub fn new(worker: Worker) -> Self {
        Self {
            worker,
            exit_requested: AtomicBool::new(false),
        }
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Marks the host for shutdown once the current reply is out.
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ModuleState {
    #[default]
    Select,
    Communicate,
}

impl ModuleState {
    /// Starts the worker and enters `Communicate`.
    pub fn select(&mut self, ctx: &ModuleContext) -> Result<(), ControllerError> {
        match self {
            ModuleState::Select => {
                if !ctx.worker().is_alive() {
                    ctx.worker().start();
                }
                *self = ModuleState::Communicate;
                Ok(())
            }
            ModuleState::Communicate => Err(ControllerError::invalid_transition(
                "Cannot SELECT new module, if there is already a module running.",
            )),
        }
    }

    /// Hands `content` to the worker.
    ///
    /// A finished worker with nothing left to fetch yields
    /// [`ControllerError::ModuleExit`] and requests shutdown.
    pub async fn forward(&mut self, ctx: &ModuleContext, content: Bytes) -> Result<(), ControllerError> {
        match self {
            ModuleState::Select => Err(ControllerError::invalid_transition(
                "Cannot FORWARD message, if module is not running.",
            )),
            ModuleState::Communicate => {
                let worker = ctx.worker();
                if !worker.is_alive() {
                    if worker.bridge().is_fetchable() {
                        return Err(ControllerError::operation(
                            "Module terminated. Try fetching remaining data.",
                        ));
                    }
                    ctx.request_exit();
                    return Err(ControllerError::ModuleExit("Module terminated.".to_string()));
                }
                worker
                    .bridge()
                    .forward(content)
                    .await
                    .map_err(|e| ControllerError::operation(e.to_string()))
            }
        }
    }

    /// Takes the next worker output as a `SUCCESS` message.
    pub async fn fetch(&mut self, ctx: &ModuleContext) -> Result<Message, ControllerError> {
        match self {
            ModuleState::Select => Err(ControllerError::invalid_transition(
                "Cannot FETCH message, if module is not running.",
            )),
            ModuleState::Communicate => {
                let worker = ctx.worker();
                if !worker.is_alive() && !worker.bridge().is_fetchable() {
                    ctx.request_exit();
                    return Err(ControllerError::operation("Module terminated."));
                }
                let data = worker
                    .bridge()
                    .fetch()
                    .await
                    .map_err(|e| ControllerError::operation(e.to_string()))?;
                Ok(Message::new(Operation::Success, data))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::module::bridge::ModuleBridge;
    use crate::module::registry::{EchoModule, OneShotModule};
    use std::time::Duration;

    fn context(module: Box<dyn crate::module::Module>) -> ModuleContext {
        ModuleContext::new(Worker::new("test", module, ModuleBridge::new(BridgeConfig::default())))
    }

    #[tokio::test]
    async fn select_state_rejects_io() {
        let ctx = context(Box::new(EchoModule));
        let mut state = ModuleState::Select;
        assert!(matches!(
            state.forward(&ctx, Bytes::from_static(b"x")).await,
            Err(ControllerError::InvalidTransition(_))
        ));
        assert!(matches!(state.fetch(&ctx).await, Err(ControllerError::InvalidTransition(_))));
        assert_eq!(state, ModuleState::Select);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn communicate_rejects_second_select() {
        let ctx = context(Box::new(EchoModule));
        let mut state = ModuleState::Select;
        state.select(&ctx).unwrap();
        assert_eq!(state, ModuleState::Communicate);
        assert!(matches!(state.select(&ctx), Err(ControllerError::InvalidTransition(_))));
        assert_eq!(state, ModuleState::Communicate);
        ctx.worker().interrupt();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn finished_worker_drains_then_exits() {
        let ctx = context(Box::new(OneShotModule));
        let mut state = ModuleState::Select;
        state.select(&ctx).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while ctx.worker().is_alive() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let err = state.forward(&ctx, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, ControllerError::ModuleOperation(_)));
        assert!(!ctx.exit_requested());

        let out = state.fetch(&ctx).await.unwrap();
        assert_eq!(out.content().as_ref(), OneShotModule::OUTPUT.as_bytes());

        let err = state.forward(&ctx, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, ControllerError::ModuleExit(_)));
        assert!(ctx.exit_requested());
    }
}
