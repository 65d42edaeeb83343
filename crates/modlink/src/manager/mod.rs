//! Manager side: accepts one external peer and drives a launched module on
//! its behalf.

pub mod controller;
pub mod launcher;
pub mod state;

pub use controller::ManagerController;
pub use launcher::{LaunchError, ModuleLauncher, ProcessLauncher, TaskLauncher};
pub use state::{ManagerContext, ManagerState, Session};
