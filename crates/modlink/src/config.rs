//! Flat per-role configuration.
//!
//! Every timeout is stored in milliseconds. Endpoint and server timeouts use
//! `0` for "wait forever"; bridge queue timeouts use any negative value.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Converts an endpoint-style timeout (0 = infinite) into an optional deadline.
pub fn endpoint_deadline(millis: u64) -> Option<Duration> {
    (millis > 0).then(|| Duration::from_millis(millis))
}

/// Converts a queue-style timeout (negative = infinite) into an optional deadline.
pub fn queue_deadline(millis: i64) -> Option<Duration> {
    u64::try_from(millis).ok().map(Duration::from_millis)
}

/// Timeouts applied to a client's endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoint_timeout_ms: u64,
    /// Applied only while the handshake runs.
    pub handshake_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint_timeout_ms: 5000,
            handshake_timeout_ms: 2000,
        }
    }
}

impl ClientConfig {
    /// Short endpoint timeout used while tearing a connection down.
    pub fn exit() -> Self {
        Self {
            endpoint_timeout_ms: 1000,
            ..Self::default()
        }
    }

    /// Configuration for peers accepted by a server: an idle peer is never timed out.
    pub fn server_side() -> Self {
        Self {
            endpoint_timeout_ms: 0,
            ..Self::default()
        }
    }

    pub fn with_endpoint_timeout(mut self, timeout: Duration) -> Self {
        self.endpoint_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// How long a single `accept` waits. `0` waits forever.
    pub accept_timeout_ms: u64,
    /// Accept at most this many clients. `0` is unbounded.
    pub num_clients: usize,
    /// Delay between two iterations of the asynchronous accept loop.
    pub accept_loop_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            accept_timeout_ms: 0,
            num_clients: 0,
            accept_loop_delay_ms: 50,
        }
    }
}

impl ServerConfig {
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_num_clients(mut self, n: usize) -> Self {
        self.num_clients = n;
        self
    }

    pub fn with_accept_loop_delay(mut self, delay: Duration) -> Self {
        self.accept_loop_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn accept_loop_delay(&self) -> Duration {
        Duration::from_millis(self.accept_loop_delay_ms)
    }
}

/// Timeouts of the two queues between a controller and its worker routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub fetch_timeout_ms: i64,
    pub forward_timeout_ms: i64,
    pub output_timeout_ms: i64,
    pub input_timeout_ms: i64,
    /// Capacity of each queue.
    pub capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 10_000,
            forward_timeout_ms: 10_000,
            output_timeout_ms: -1,
            input_timeout_ms: -1,
            capacity: 64,
        }
    }
}

impl BridgeConfig {
    pub fn fetch_timeout(&self) -> Option<Duration> {
        queue_deadline(self.fetch_timeout_ms)
    }

    pub fn forward_timeout(&self) -> Option<Duration> {
        queue_deadline(self.forward_timeout_ms)
    }

    pub fn output_timeout(&self) -> Option<Duration> {
        queue_deadline(self.output_timeout_ms)
    }

    pub fn input_timeout(&self) -> Option<Duration> {
        queue_deadline(self.input_timeout_ms)
    }
}

/// Resolved configuration of one module: the manager's client timeouts towards
/// it and the module's own queue timeouts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    pub client: ClientConfig,
    pub bridge: BridgeConfig,
}

/// Per-module overrides keyed by module name in [`AppConfig::modules`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleOverride {
    pub endpoint_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub fetch_timeout_ms: Option<i64>,
    pub forward_timeout_ms: Option<i64>,
    pub output_timeout_ms: Option<i64>,
    pub input_timeout_ms: Option<i64>,
    pub capacity: Option<usize>,
}

impl ModuleOverride {
    pub fn apply(&self, mut config: ModuleConfig) -> ModuleConfig {
        if let Some(v) = self.endpoint_timeout_ms {
            config.client.endpoint_timeout_ms = v;
        }
        if let Some(v) = self.handshake_timeout_ms {
            config.client.handshake_timeout_ms = v;
        }
        if let Some(v) = self.fetch_timeout_ms {
            config.bridge.fetch_timeout_ms = v;
        }
        if let Some(v) = self.forward_timeout_ms {
            config.bridge.forward_timeout_ms = v;
        }
        if let Some(v) = self.output_timeout_ms {
            config.bridge.output_timeout_ms = v;
        }
        if let Some(v) = self.input_timeout_ms {
            config.bridge.input_timeout_ms = v;
        }
        if let Some(v) = self.capacity {
            config.bridge.capacity = v;
        }
        config
    }
}

/// Host and port pair, used both for binding and connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Where external peers connect.
    pub bind: Address,
    /// Where a launched module listens.
    pub module_address: Address,
    pub connect_timeout_ms: u64,
    pub connect_retries: u32,
    pub connect_retry_delay_ms: u64,
    pub reply_retries: u32,
    /// Poll interval while waiting for a terminated module to disappear.
    pub liveness_poll_ms: u64,
    /// Transport identifier handed to the launcher.
    pub factory: String,
    pub server: ServerConfig,
    /// Applied to accepted external peers.
    pub client: ClientConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bind: Address::new("127.0.0.1", 8080),
            module_address: Address::new("127.0.0.1", 8081),
            connect_timeout_ms: 10_000,
            connect_retries: 5,
            connect_retry_delay_ms: 1000,
            reply_retries: 2,
            liveness_poll_ms: 200,
            factory: "tcp".to_string(),
            server: ServerConfig::default(),
            client: ClientConfig::server_side(),
        }
    }
}

impl ManagerConfig {
    pub fn with_bind(mut self, bind: Address) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_module_address(mut self, address: Address) -> Self {
        self.module_address = address;
        self
    }

    pub fn with_connect_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.connect_retries = retries;
        self.connect_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_liveness_poll(mut self, interval: Duration) -> Self {
        self.liveness_poll_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleHostConfig {
    pub bind: Address,
    pub reply_retries: u32,
    pub server: ServerConfig,
    /// Applied to the accepted manager connection.
    pub client: ClientConfig,
}

impl Default for ModuleHostConfig {
    fn default() -> Self {
        Self {
            bind: Address::new("127.0.0.1", 8081),
            reply_retries: 2,
            server: ServerConfig::default(),
            client: ClientConfig::server_side(),
        }
    }
}

impl ModuleHostConfig {
    pub fn with_bind(mut self, bind: Address) -> Self {
        self.bind = bind;
        self
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub manager: ManagerConfig,
    pub module: ModuleHostConfig,
    /// Overrides keyed by module name.
    pub modules: HashMap<String, ModuleOverride>,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: shown.clone(),
            source,
        })?;
        let config = serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: shown,
            source,
        })?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Applies the override table on top of a module's built-in defaults.
    pub fn module_config(&self, name: &str, defaults: ModuleConfig) -> ModuleConfig {
        match self.modules.get(name) {
            Some(ov) => ov.apply(defaults),
            None => defaults,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_defaults() {
        insta::assert_json_snapshot!(ClientConfig::default(), @r#"
        {
          "endpoint_timeout_ms": 5000,
          "handshake_timeout_ms": 2000
        }
        "#);
    }

    #[test]
    fn server_config_defaults() {
        insta::assert_json_snapshot!(ServerConfig::default(), @r#"
        {
          "accept_timeout_ms": 0,
          "num_clients": 0,
          "accept_loop_delay_ms": 50
        }
        "#);
    }

    #[test]
    fn exit_and_server_side_presets() {
        assert_eq!(ClientConfig::exit().endpoint_timeout_ms, 1000);
        assert_eq!(ClientConfig::server_side().endpoint_timeout_ms, 0);
        assert_eq!(ClientConfig::server_side().handshake_timeout_ms, 2000);
    }

    #[test]
    fn negative_queue_timeout_is_infinite() {
        let bridge = BridgeConfig::default();
        assert_eq!(bridge.input_timeout(), None);
        assert_eq!(bridge.fetch_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(endpoint_deadline(0), None);
        assert_eq!(endpoint_deadline(5), Some(Duration::from_millis(5)));
    }

    #[test]
    fn override_table_applies_by_name() {
        let json = r#"{
            "modules": {
                "EchoModule": { "endpoint_timeout_ms": 0, "forward_timeout_ms": -1 }
            }
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        let echo = config.module_config("EchoModule", ModuleConfig::default());
        assert_eq!(echo.client.endpoint_timeout_ms, 0);
        assert_eq!(echo.bridge.forward_timeout(), None);
        assert_eq!(echo.bridge.fetch_timeout_ms, 10_000);

        let other = config.module_config("Other", ModuleConfig::default());
        assert_eq!(other, ModuleConfig::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "manager": { "bind": { "host": "0.0.0.0", "port": 9000 } } }"#)
                .unwrap();
        assert_eq!(config.manager.bind, Address::new("0.0.0.0", 9000));
        assert_eq!(config.manager.connect_retries, 5);
        assert_eq!(config.module.bind.port, 8081);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = AppConfig::load("/nonexistent/modlink.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_reads_file_and_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("modlink.json");
        std::fs::write(
            &good,
            r#"{ "modules": { "EchoModule": { "fetch_timeout_ms": 250 } } }"#,
        )
        .unwrap();
        let config = AppConfig::load(&good).unwrap();
        assert_eq!(config.modules["EchoModule"].fetch_timeout_ms, Some(250));

        let bad = dir.path().join("broken.json");
        std::fs::write(&bad, "{ not json").unwrap();
        let err = AppConfig::load(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
