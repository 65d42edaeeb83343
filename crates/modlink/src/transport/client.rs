//! Connection-oriented client façade over one endpoint and one protocol side.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::CommunicationError;
use crate::wire::{ClientProtocol, ClientType, ConnectionInfo, Endpoint, Message, Protocol};

/// Identity of a client handle. Clones of a [`Client`] share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happened on a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Handshake completed.
    Connected,
    /// `disconnect` was called. May be delivered more than once.
    Disconnected,
    /// About to send this message.
    Sent(Message),
    /// A message arrived.
    Received(Message),
    /// A frame arrived that could not be parsed. Carries the raw bytes.
    InvalidMessage(Bytes),
}

/// Receives every event of the clients it is registered on.
///
/// Handlers may call back into the client, e.g. to reply from
/// [`ClientEvent::Received`]. Replying to [`ClientEvent::Sent`] loops forever.
#[async_trait]
pub trait CommunicationListener: Send + Sync {
    async fn on_event(&self, client: &Client, event: ClientEvent);
}

/// Listener forwarding events into a channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<(ClientId, ClientEvent)>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(ClientId, ClientEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl CommunicationListener for ChannelListener {
    async fn on_event(&self, client: &Client, event: ClientEvent) {
        let _ = self.tx.send((client.id(), event));
    }
}

struct ClientInner {
    id: ClientId,
    client_type: RwLock<ClientType>,
    endpoint: RwLock<Option<Arc<Endpoint>>>,
    protocol: Arc<dyn Protocol>,
    listeners: RwLock<Vec<Arc<dyn CommunicationListener>>>,
    config: RwLock<ClientConfig>,
}

/// Cheaply clonable handle to one logical peer connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(protocol: Arc<dyn Protocol>) -> Self {
        Self::build(protocol, None, ClientType::User, ClientConfig::default())
    }

    /// A connecting `USER` client speaking the client side of the protocol.
    pub fn user() -> Self {
        Self::new(Arc::new(ClientProtocol))
    }

    /// Wraps an accepted connection.
    pub(crate) fn accepted(
        endpoint: Endpoint,
        protocol: Arc<dyn Protocol>,
        client_type: ClientType,
        config: ClientConfig,
    ) -> Self {
        endpoint.set_timeout(config.endpoint_timeout_ms);
        Self::build(protocol, Some(Arc::new(endpoint)), client_type, config)
    }

    fn build(
        protocol: Arc<dyn Protocol>,
        endpoint: Option<Arc<Endpoint>>,
        client_type: ClientType,
        config: ClientConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id: ClientId::new(),
                client_type: RwLock::new(client_type),
                endpoint: RwLock::new(endpoint),
                protocol,
                listeners: RwLock::new(Vec::new()),
                config: RwLock::new(config),
            }),
        }
    }

    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    pub async fn client_type(&self) -> ClientType {
        *self.inner.client_type.read().await
    }

    /// Type announced in the next handshake.
    pub async fn set_type(&self, client_type: ClientType) {
        *self.inner.client_type.write().await = client_type;
    }

    pub async fn add_listener(&self, listener: Arc<dyn CommunicationListener>) {
        self.inner.listeners.write().await.push(listener);
    }

    pub async fn remove_listener(&self, listener: &Arc<dyn CommunicationListener>) {
        self.inner
            .listeners
            .write()
            .await
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub async fn configuration(&self) -> ClientConfig {
        self.inner.config.read().await.clone()
    }

    /// Stores `config` and applies its endpoint timeout to a live endpoint.
    pub async fn set_configuration(&self, config: ClientConfig) {
        if let Some(ep) = self.inner.endpoint.read().await.as_ref() {
            ep.set_timeout(config.endpoint_timeout_ms);
        }
        *self.inner.config.write().await = config;
    }

    pub async fn is_connected(&self) -> bool {
        match self.inner.endpoint.read().await.as_ref() {
            Some(ep) => ep.is_connected(),
            None => false,
        }
    }

    async fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.inner.endpoint.read().await.clone()
    }

    async fn connected_endpoint(&self) -> Result<Arc<Endpoint>, CommunicationError> {
        match self.endpoint().await {
            Some(ep) if ep.is_connected() => Ok(ep),
            _ => Err(CommunicationError::connection("Client is not connected.")),
        }
    }

    async fn emit(&self, event: ClientEvent) {
        let listeners = self.inner.listeners.read().await.clone();
        for listener in listeners {
            listener.on_event(self, event.clone()).await;
        }
    }

    /// Connects a fresh endpoint to `info` unless already connected, then runs
    /// the handshake. A failed handshake tears the endpoint down.
    pub async fn connect(&self, info: &ConnectionInfo) -> Result<(), CommunicationError> {
        if !self.is_connected().await {
            let ep = Arc::new(Endpoint::new());
            ep.set_timeout(self.inner.config.read().await.endpoint_timeout_ms);
            ep.connect(info).await?;
            *self.inner.endpoint.write().await = Some(ep);
        }
        self.handshake().await
    }

    /// Runs this side's handshake on the current endpoint and announces the
    /// connection to listeners.
    pub(crate) async fn handshake(&self) -> Result<(), CommunicationError> {
        let ep = self.connected_endpoint().await?;
        let config = self.configuration().await;
        let client_type = self.client_type().await;

        let previous = ep.timeout();
        ep.set_timeout(config.handshake_timeout_ms);
        let result = self.inner.protocol.handshake(&ep, client_type).await;
        ep.set_timeout(previous);

        if let Err(e) = result {
            tracing::warn!(client_id = %self.id(), peer = ?ep.peer_addr(), error = %e, "Handshake failed");
            ep.disconnect().await;
            return Err(e);
        }

        tracing::debug!(client_id = %self.id(), peer = ?ep.peer_addr(), %client_type, "Client connected");
        self.emit(ClientEvent::Connected).await;
        Ok(())
    }

    /// Notifies listeners, attempts a graceful protocol shutdown and closes the
    /// endpoint. Never fails and is safe to call repeatedly.
    pub async fn disconnect(&self) {
        self.emit(ClientEvent::Disconnected).await;

        let Some(ep) = self.endpoint().await else {
            return;
        };
        if ep.is_connected() {
            if let Err(e) = self.inner.protocol.shutdown(&ep).await {
                tracing::debug!(client_id = %self.id(), error = %e, "Graceful shutdown failed");
            }
        }
        ep.disconnect().await;
        tracing::debug!(client_id = %self.id(), "Client disconnected");
    }

    /// Sends a message. Any failure disconnects the client before returning.
    pub async fn send(&self, message: Message) -> Result<(), CommunicationError> {
        let ep = self.connected_endpoint().await?;
        tracing::debug!(client_id = %self.id(), operation = %message.operation(), "Sending message");
        self.emit(ClientEvent::Sent(message.clone())).await;

        if let Err(e) = self.inner.protocol.send(&ep, &message).await {
            self.disconnect().await;
            return Err(e);
        }
        Ok(())
    }

    /// Receives one message. `None` means the frame carried no payload, e.g.
    /// an acknowledged shutdown request.
    ///
    /// Connection failures and timeouts disconnect the client. Parse failures
    /// are reported as [`ClientEvent::InvalidMessage`] and leave it connected.
    pub async fn receive(&self) -> Result<Option<Message>, CommunicationError> {
        let ep = self.connected_endpoint().await?;
        match self.inner.protocol.receive(&ep).await {
            Ok(Some(message)) => {
                tracing::debug!(client_id = %self.id(), operation = %message.operation(), "Received message");
                self.emit(ClientEvent::Received(message.clone())).await;
                Ok(Some(message))
            }
            Ok(None) => Ok(None),
            Err(e) if e.is_connection_failure() => {
                self.disconnect().await;
                Err(e)
            }
            Err(e) => {
                if let Some(raw) = e.invalid_message() {
                    tracing::debug!(client_id = %self.id(), error = %e, "Received malformed message");
                    self.emit(ClientEvent::InvalidMessage(raw.clone())).await;
                }
                Err(e)
            }
        }
    }
}

impl PartialEq for Client {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Client {}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("id", &self.inner.id).finish()
    }
}
