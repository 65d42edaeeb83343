//! Runs a [`Module`] on a blocking thread and tracks whether it is still alive.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::bridge::{BridgeError, ModuleBridge, ModuleIo};
use super::registry::{Module, ModuleError};

pub struct Worker {
    name: String,
    bridge: Arc<ModuleBridge>,
    module: StdMutex<Option<Box<dyn Module>>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(name: impl Into<String>, module: Box<dyn Module>, bridge: ModuleBridge) -> Self {
        Self {
            name: name.into(),
            bridge: Arc::new(bridge),
            module: StdMutex::new(Some(module)),
            task: StdMutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bridge(&self) -> &ModuleBridge {
        &self.bridge
    }

    /// Starts the routine unless it was started before. Must be called from
    /// within the runtime.
    pub fn start(&self) {
        let Some(module) = self.module.lock().ok().and_then(|mut m| m.take()) else {
            return;
        };
        let bridge = self.bridge.clone();
        let name = self.name.clone();
        let handle = Handle::current();

        let task = tokio::task::spawn_blocking(move || {
            let io = ModuleIo::new(&bridge, handle);
            match module.main(&io) {
                Ok(()) => tracing::info!(module = %name, "Module finished"),
                Err(ModuleError::Bridge(BridgeError::Interrupted)) => {
                    tracing::debug!(module = %name, "Module interrupted")
                }
                Err(e) => tracing::warn!(module = %name, error = %e, "Module failed"),
            }
        });
        tracing::info!(module = %self.name, "Module started");

        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }
    }

    /// True while the routine is running. False before `start` and after it returned.
    pub fn is_alive(&self) -> bool {
        match self.task.lock() {
            Ok(slot) => slot.as_ref().is_some_and(|t| !t.is_finished()),
            Err(_) => false,
        }
    }

    /// Asks the routine to stop waiting on its queues.
    pub fn interrupt(&self) {
        self.bridge.interrupt();
    }
}
