//! Error taxonomy shared by the wire, transport and controller layers.
//!
//! Transport-level failures ([`CommunicationError`]) always propagate up through
//! the client; controller-level failures ([`ControllerError`]) are turned into
//! `INVALID` replies by the controllers.

use bytes::Bytes;

/// Failures of the endpoint, protocol and client/server layers.
#[derive(Debug, thiserror::Error)]
pub enum CommunicationError {
    /// Transport broken, closed, or never connected.
    #[error("connection error: {0}")]
    Connection(String),

    /// A deadline elapsed. The connection is not necessarily broken.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Malformed frame. `raw` is the offending frame as received.
    #[error("parsing message failed: {reason}")]
    Parse { reason: String, raw: Bytes },

    /// The handshake exchange was malformed.
    #[error("failed performing handshake: {0}")]
    Handshake(String),

    /// The peer reported a client type it is not allowed to use.
    #[error("invalid client: {0}")]
    InvalidClient(String),

    #[error("failed to bind: {0}")]
    Bind(String),

    #[error("failed accepting connection: {0}")]
    Accept(String),
}

impl CommunicationError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    pub fn parse(reason: impl Into<String>, raw: impl Into<Bytes>) -> Self {
        Self::Parse {
            reason: reason.into(),
            raw: raw.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Connection-class failure: the transport is gone or a deadline elapsed.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }

    /// Raw bytes of a frame that failed to parse.
    pub fn invalid_message(&self) -> Option<&Bytes> {
        match self {
            Self::Parse { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

/// Failures raised by the controller state machines.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// The current state does not accept the requested operation.
    #[error("failed to transition to new state: {0}")]
    InvalidTransition(String),

    /// Worker-level failure (timeout, bad state, unknown module).
    #[error("operation not successful: {0}")]
    ModuleOperation(String),

    /// The worker terminated itself.
    #[error("module quit: {0}")]
    ModuleExit(String),

    /// The module became unreachable.
    #[error("failed to communicate with module: {message}")]
    ModuleCommunication {
        message: String,
        #[source]
        source: Option<CommunicationError>,
    },

    /// The module could not be launched or did not complete its handshake.
    #[error("failed to create module: {0}")]
    ModuleCreation(String),

    /// Unrecoverable setup failure.
    #[error("initialization failed: {0}")]
    Initialization(String),
}

impl ControllerError {
    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::InvalidTransition(message.into())
    }

    pub fn operation(message: impl Into<String>) -> Self {
        Self::ModuleOperation(message.into())
    }

    pub fn communication(message: impl Into<String>, source: CommunicationError) -> Self {
        Self::ModuleCommunication {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Recoverable errors become an `INVALID` reply and processing continues.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Initialization(_))
    }

    /// Text sent back to the peer: the bare message, plus the source for
    /// communication failures.
    pub fn detail(&self) -> String {
        match self {
            Self::InvalidTransition(m)
            | Self::ModuleOperation(m)
            | Self::ModuleExit(m)
            | Self::ModuleCreation(m)
            | Self::Initialization(m) => m.clone(),
            Self::ModuleCommunication {
                message,
                source: Some(source),
            } => format!("{message} ({source})"),
            Self::ModuleCommunication { message, .. } => message.clone(),
        }
    }
}
