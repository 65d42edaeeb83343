//! Capsule exchange on top of an [`Endpoint`]: payload traffic, the opening
//! handshake and the cooperative close.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use super::capsule::{Capsule, Status};
use super::endpoint::Endpoint;
use super::message::{Message, Operation};
use crate::error::CommunicationError;

/// Role a client announces during the handshake.
///
/// `Manager` is reserved for clients a server constructs for accepted peers;
/// a connecting party announcing it is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientType {
    User,
    Command,
    Io,
    Manager,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::User => "USER",
            ClientType::Command => "COMMAND",
            ClientType::Io => "IO",
            ClientType::Manager => "MANAGER",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientType {
    type Err = CommunicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(ClientType::User),
            "COMMAND" => Ok(ClientType::Command),
            "IO" => Ok(ClientType::Io),
            "MANAGER" => Ok(ClientType::Manager),
            other => Err(CommunicationError::InvalidClient(format!(
                "Unknown client type {other:?}."
            ))),
        }
    }
}

#[async_trait]
pub trait Protocol: Send + Sync {
    /// Sends `message` inside a `CONTENT` capsule.
    async fn send(&self, ep: &Endpoint, message: &Message) -> Result<(), CommunicationError> {
        if !ep.is_connected() {
            return Err(CommunicationError::connection("Endpoint is not connected."));
        }
        ep.send(Capsule::content(message.clone()).to_bytes()).await
    }

    /// Reads one capsule and returns its payload. A `SHUTDOWN` capsule is
    /// acknowledged before returning.
    async fn receive(&self, ep: &Endpoint) -> Result<Option<Message>, CommunicationError> {
        if !ep.is_connected() {
            return Err(CommunicationError::connection("Endpoint is not connected."));
        }
        let capsule = Capsule::parse(&ep.receive().await?)?;
        if capsule.status() == Status::Shutdown {
            tracing::debug!(peer = ?ep.peer_addr(), "Peer requested shutdown, acknowledging");
            ep.send(Capsule::bare(Status::Ack).to_bytes()).await?;
        }
        Ok(capsule.into_payload())
    }

    /// Opens the connection. The client side announces `client_type`; the
    /// server side validates what the peer announced.
    async fn handshake(&self, ep: &Endpoint, client_type: ClientType) -> Result<(), CommunicationError>;

    /// Sends `SHUTDOWN` and waits for the peer's `ACK`.
    async fn shutdown(&self, ep: &Endpoint) -> Result<(), CommunicationError> {
        ep.send(Capsule::bare(Status::Shutdown).to_bytes()).await?;
        wait_for_status(ep, Status::Ack).await?;
        Ok(())
    }
}

/// Receives until a capsule with `status` arrives. Capsules with any other
/// status are discarded. A peer closing at the same time still gets its
/// `SHUTDOWN` acknowledged so neither side waits for the other.
async fn wait_for_status(ep: &Endpoint, status: Status) -> Result<Capsule, CommunicationError> {
    loop {
        let capsule = Capsule::parse(&ep.receive().await?)?;
        if capsule.status() == status {
            return Ok(capsule);
        }
        if capsule.status() == Status::Shutdown && status == Status::Ack {
            ep.send(Capsule::bare(Status::Ack).to_bytes()).await?;
        }
        tracing::warn!(
            expected = %status,
            received = %capsule.status(),
            "Discarding capsule while waiting for status"
        );
    }
}

/// Protocol side of the connecting party.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientProtocol;

#[async_trait]
impl Protocol for ClientProtocol {
    async fn handshake(&self, ep: &Endpoint, client_type: ClientType) -> Result<(), CommunicationError> {
        let hello = Message::new(Operation::Init, client_type.as_str());
        ep.send(Capsule::new(Status::Init, Some(hello)).to_bytes()).await?;
        wait_for_status(ep, Status::Ack).await?;
        Ok(())
    }
}

/// Protocol side of the accepting party.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerProtocol;

#[async_trait]
impl Protocol for ServerProtocol {
    async fn handshake(&self, ep: &Endpoint, _local: ClientType) -> Result<(), CommunicationError> {
        let capsule = wait_for_status(ep, Status::Init).await?;
        let hello = capsule
            .payload()
            .ok_or_else(|| CommunicationError::Handshake("INIT capsule without payload.".to_string()))?;

        if hello.operation() != Operation::Init {
            return Err(CommunicationError::Handshake(format!(
                "Invalid message operation {}. Expected {}.",
                hello.operation(),
                Operation::Init
            )));
        }

        let announced: ClientType = hello.content_lossy().parse()?;
        if announced == ClientType::Manager {
            return Err(CommunicationError::InvalidClient(format!(
                "Client identifies as {announced}, which is not allowed."
            )));
        }

        ep.send(Capsule::bare(Status::Ack).to_bytes()).await?;
        tracing::debug!(peer = ?ep.peer_addr(), client_type = %announced, "Handshake accepted");
        Ok(())
    }
}
