//! Wire stack: framing, the plain-text message format, status capsules, the
//! TCP endpoint and the capsule protocol.
//!
//! - **codec**: 4-byte big-endian length-prefixed frames
//! - **message**: `Operation` + parameters, parse/serialize
//! - **capsule**: `Status` wrapper used for handshake/shutdown bookkeeping
//! - **endpoint**: one TCP connection with receive timeout
//! - **protocol**: client/server capsule exchanges

pub mod capsule;
pub mod codec;
pub mod endpoint;
pub mod message;
pub mod protocol;

pub use capsule::{Capsule, Status};
pub use endpoint::{ConnectionInfo, Endpoint};
pub use message::{Message, Operation, Parameter};
pub use protocol::{ClientProtocol, ClientType, Protocol, ServerProtocol};
