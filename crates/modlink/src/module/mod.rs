//! Module side: the worker routine, the queues feeding it and the controller
//! answering the manager.

pub mod bridge;
pub mod controller;
pub mod registry;
pub mod state;
pub mod worker;

pub use bridge::{BridgeError, ModuleBridge, ModuleIo};
pub use controller::ModuleController;
pub use registry::{EchoModule, Module, ModuleError, ModuleFactory, ModuleRegistry, OneShotModule};
pub use state::{ModuleContext, ModuleState};
pub use worker::Worker;
