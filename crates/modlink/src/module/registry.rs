//! Closed set of runnable modules, resolved by name.

use std::collections::BTreeMap;

use super::bridge::{BridgeError, ModuleIo};
use crate::config::{AppConfig, ModuleConfig};

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("{0}")]
    Failed(String),
}

/// A worker routine. `main` runs on a dedicated blocking thread until it
/// returns or its I/O is interrupted.
pub trait Module: Send + 'static {
    fn main(&self, io: &ModuleIo<'_>) -> Result<(), ModuleError>;
}

pub type ModuleFactory = fn() -> Box<dyn Module>;

#[derive(Clone)]
struct Entry {
    factory: ModuleFactory,
    config: ModuleConfig,
}

/// Name to factory mapping, built once at startup and passed to whatever
/// constructs controllers.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    entries: BTreeMap<String, Entry>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled demo modules.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            "EchoModule",
            || Box::new(EchoModule) as Box<dyn Module>,
            ModuleConfig::default(),
        );
        registry.register(
            "OneShotModule",
            || Box::new(OneShotModule) as Box<dyn Module>,
            ModuleConfig::default(),
        );
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: ModuleFactory, config: ModuleConfig) {
        self.entries.insert(name.into(), Entry { factory, config });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn Module>> {
        self.entries.get(name).map(|e| (e.factory)())
    }

    /// Built-in defaults of `name` with the override table applied.
    pub fn config(&self, name: &str, app: &AppConfig) -> Option<ModuleConfig> {
        self.entries
            .get(name)
            .map(|e| app.module_config(name, e.config.clone()))
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

/// Greets, then echoes every input upper-cased until it receives `EXIT`.
pub struct EchoModule;

impl EchoModule {
    pub const GREETING: &'static str = "Welcome to the latest version of the echo service >:)";
}

impl Module for EchoModule {
    fn main(&self, io: &ModuleIo<'_>) -> Result<(), ModuleError> {
        io.output(Self::GREETING)?;
        loop {
            let message = io.input()?;
            if message.as_ref() == b"EXIT" {
                io.output("Exiting...")?;
                return Ok(());
            }
            io.output(message.to_ascii_uppercase())?;
        }
    }
}

/// Outputs a single line and returns.
pub struct OneShotModule;

impl OneShotModule {
    pub const OUTPUT: &'static str = "One shot fired.";
}

impl Module for OneShotModule {
    fn main(&self, io: &ModuleIo<'_>) -> Result<(), ModuleError> {
        io.output(Self::OUTPUT)?;
        Ok(())
    }
}
