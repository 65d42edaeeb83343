//! modlink: remote control of sandboxed modules.
//!
//! A *manager* accepts one external peer at a time and, on request, launches a
//! *module* host, connects to it and relays `FORWARD`/`FETCH` traffic to the
//! worker routine running inside it. Both sides speak the same framed,
//! plain-text protocol:
//!
//! - [`wire`]: framing, messages, status capsules, endpoint and handshake
//! - [`transport`]: event-driven [`Client`] and accepting [`Server`]
//! - [`module`]: worker, queues and the module-side controller
//! - [`manager`]: launcher, session state and the manager-side controller
//! - [`service`]: binds a role and runs it until shutdown

pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod module;
pub mod service;
pub mod transport;
pub mod wire;

pub use config::{Address, AppConfig, ClientConfig, ManagerConfig, ModuleConfig, ServerConfig};
pub use error::{CommunicationError, ControllerError};
pub use manager::{ManagerController, ModuleLauncher, ProcessLauncher, TaskLauncher};
pub use module::{Module, ModuleController, ModuleIo, ModuleRegistry};
pub use service::{ManagerService, ModuleHost, ServiceError, run_manager, run_module};
pub use transport::{Client, ClientEvent, CommunicationListener, Server};
pub use wire::{Message, Operation};
