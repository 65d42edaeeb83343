//! Accepting side: turns incoming connections into [`Client`]s and pumps each
//! one in its own receive loop.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::client::{Client, CommunicationListener};
use crate::config::{Address, ClientConfig, ServerConfig, endpoint_deadline};
use crate::error::CommunicationError;
use crate::wire::{ClientType, Endpoint, Protocol, ServerProtocol};

struct ServerInner {
    protocol: Arc<dyn Protocol>,
    socket: Mutex<Option<Arc<TcpListener>>>,
    clients: Mutex<Vec<Client>>,
    listeners: RwLock<Vec<Arc<dyn CommunicationListener>>>,
    message_loops: Mutex<Vec<JoinHandle<()>>>,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
    config: RwLock<ServerConfig>,
    client_config: RwLock<ClientConfig>,
}

/// Cheaply clonable server handle.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_protocol(config, Arc::new(ServerProtocol))
    }

    pub fn with_protocol(config: ServerConfig, protocol: Arc<dyn Protocol>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                protocol,
                socket: Mutex::new(None),
                clients: Mutex::new(Vec::new()),
                listeners: RwLock::new(Vec::new()),
                message_loops: Mutex::new(Vec::new()),
                accept_loop: Mutex::new(None),
                config: RwLock::new(config),
                client_config: RwLock::new(ClientConfig::server_side()),
            }),
        }
    }

    /// Binds the listening socket. Binding while bound closes the server first.
    pub async fn bind(&self, info: &Address) -> Result<(), CommunicationError> {
        if self.is_bound().await {
            self.close().await;
        }
        let socket = TcpListener::bind((info.host.as_str(), info.port))
            .await
            .map_err(|e| CommunicationError::Bind(format!("Failed to bind server socket to {info}: {e}")))?;
        let local = socket.local_addr().ok();
        *self.inner.socket.lock().await = Some(Arc::new(socket));
        tracing::info!(address = ?local, "Server bound");
        Ok(())
    }

    pub async fn is_bound(&self) -> bool {
        self.inner.socket.lock().await.is_some()
    }

    /// Address actually bound, useful after binding port 0.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .socket
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    pub async fn configuration(&self) -> ServerConfig {
        self.inner.config.read().await.clone()
    }

    pub async fn set_configuration(&self, config: ServerConfig) {
        *self.inner.config.write().await = config;
    }

    pub async fn client_configuration(&self) -> ClientConfig {
        self.inner.client_config.read().await.clone()
    }

    /// Sets the configuration of accepted clients and re-applies it to every
    /// tracked client.
    pub async fn set_client_configuration(&self, config: ClientConfig) {
        *self.inner.client_config.write().await = config.clone();
        for client in self.clients().await {
            client.set_configuration(config.clone()).await;
        }
    }

    /// Snapshot of the tracked clients.
    pub async fn clients(&self) -> Vec<Client> {
        self.inner.clients.lock().await.clone()
    }

    /// Listeners are attached to every client accepted afterwards.
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

    /// Accepts one connection, runs the server side of the handshake and starts
    /// the client's receive loop.
    pub async fn accept(&self) -> Result<Client, CommunicationError> {
        let socket = self.inner.socket.lock().await.clone().ok_or_else(|| {
            CommunicationError::Accept("Server needs to be bound in order to accept clients.".to_string())
        })?;

        let accept_timeout = endpoint_deadline(self.inner.config.read().await.accept_timeout_ms);
        let accepted = match accept_timeout {
            Some(limit) => tokio::time::timeout(limit, socket.accept())
                .await
                .map_err(|_| CommunicationError::timeout("Server socket timed out while waiting for connection(s)."))?,
            None => socket.accept().await,
        };
        let (stream, peer) = accepted.map_err(|e| {
            CommunicationError::Accept(format!("Server socket failed accepting connection(s): {e}"))
        })?;
        tracing::debug!(%peer, "Accepted connection");

        let client = Client::accepted(
            Endpoint::from_stream(stream),
            self.inner.protocol.clone(),
            ClientType::Manager,
            self.client_configuration().await,
        );
        for listener in self.inner.listeners.read().await.iter() {
            client.add_listener(listener.clone()).await;
        }
        client.handshake().await?;

        self.inner.clients.lock().await.push(client.clone());
        let handle = tokio::spawn(message_loop(client.clone(), Arc::downgrade(&self.inner)));
        let mut loops = self.inner.message_loops.lock().await;
        loops.retain(|h| !h.is_finished());
        loops.push(handle);

        tracing::info!(%peer, client_id = %client.id(), "Client accepted");
        Ok(client)
    }

    /// Accepts clients inline until `num_clients` were accepted (forever if
    /// unbounded). Any failure closes the server and is returned.
    pub async fn start(&self) -> Result<(), CommunicationError> {
        let limit = self.inner.config.read().await.num_clients;
        let mut accepted = 0usize;
        while limit == 0 || accepted < limit {
            if let Err(e) = self.accept().await {
                tracing::error!(error = %e, "Accept failed, closing server");
                self.close().await;
                return Err(e);
            }
            accepted += 1;
        }
        Ok(())
    }

    /// Runs the accept step on a background task with a fixed delay between
    /// iterations. Failures of a single peer are skipped; a failing listening
    /// socket closes the server.
    pub async fn start_async(&self) {
        let server = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let config = server.configuration().await;
                let tracked = server.inner.clients.lock().await.len();
                if config.num_clients == 0 || tracked < config.num_clients {
                    match server.accept().await {
                        Ok(_) => {}
                        Err(e @ CommunicationError::Accept(_)) => {
                            tracing::error!(error = %e, "Accept loop failed, closing server");
                            server.release().await;
                            return;
                        }
                        Err(e) if e.is_timeout() => {
                            tracing::trace!(error = %e, "No client connected");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Dropped connecting peer");
                        }
                    }
                }
                tokio::time::sleep(config.accept_loop_delay()).await;
            }
        });
        if let Some(previous) = self.inner.accept_loop.lock().await.replace(task) {
            previous.abort();
        }
    }

    /// Stops accepting, interrupts every receive loop, disconnects all tracked
    /// clients and releases the socket. Safe to call when never bound.
    pub async fn close(&self) {
        let accept_loop = self.inner.accept_loop.lock().await.take();
        if let Some(task) = accept_loop {
            task.abort();
            let _ = task.await;
        }
        self.release().await;
    }

    async fn release(&self) {
        let loops: Vec<_> = self.inner.message_loops.lock().await.drain(..).collect();
        for task in loops {
            task.abort();
            let _ = task.await;
        }

        // Accepted clients may wait forever by default; bound the shutdown exchange.
        let clients = std::mem::take(&mut *self.inner.clients.lock().await);
        for client in clients {
            client.set_configuration(ClientConfig::exit()).await;
            client.disconnect().await;
        }

        if self.inner.socket.lock().await.take().is_some() {
            tracing::info!("Server closed");
        }
    }
}

/// Request/response engine of one accepted client. It does not interpret
/// messages; listeners react to the events `receive` emits.
async fn message_loop(client: Client, server: Weak<ServerInner>) {
    loop {
        match client.receive().await {
            Ok(_) => {}
            Err(e) if e.is_parse() => {}
            Err(e) => {
                tracing::debug!(client_id = %client.id(), error = %e, "Message loop ended");
                break;
            }
        }
    }
    client.disconnect().await;
    if let Some(inner) = server.upgrade() {
        inner.clients.lock().await.retain(|c| c != &client);
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::client::{ChannelListener, ClientEvent};
    use crate::wire::{ConnectionInfo, Message, Operation};
    use std::time::Duration;

    async fn bound(config: ServerConfig) -> (Server, u16) {
        let server = Server::new(config);
        server.bind(&Address::new("127.0.0.1", 0)).await.unwrap();
        let port = server.local_addr().await.unwrap().port();
        (server, port)
    }

    #[tokio::test]
    async fn accept_requires_bind() {
        let server = Server::default();
        let err = server.accept().await.unwrap_err();
        assert!(matches!(err, CommunicationError::Accept(_)));
        server.close().await;
    }

    #[tokio::test]
    async fn accept_times_out() {
        let (server, _) = bound(ServerConfig::default().with_accept_timeout(Duration::from_millis(30))).await;
        assert!(server.accept().await.unwrap_err().is_timeout());
        server.close().await;
        assert!(!server.is_bound().await);
    }

    #[tokio::test]
    async fn rebind_closes_previous_socket() {
        let (server, first) = bound(ServerConfig::default()).await;
        server.bind(&Address::new("127.0.0.1", 0)).await.unwrap();
        let second = server.local_addr().await.unwrap().port();
        assert_ne!(first, second);
        server.close().await;
    }

    #[tokio::test]
    async fn accepted_client_pumps_events() {
        let (server, port) = bound(ServerConfig::default()).await;
        let (listener, mut events) = ChannelListener::new();
        server.add_listener(listener).await;

        let user = Client::user();
        let info = ConnectionInfo::new("127.0.0.1", port);
        let (accepted, connected) = tokio::join!(
            server.accept(),
            user.connect(&info)
        );
        connected.unwrap();
        let accepted = accepted.unwrap();
        assert_eq!(accepted.client_type().await, ClientType::Manager);
        assert_eq!(events.recv().await.unwrap().1, ClientEvent::Connected);

        user.send(Message::new(Operation::Fetch, "x")).await.unwrap();
        let (id, event) = events.recv().await.unwrap();
        assert_eq!(id, accepted.id());
        assert!(matches!(event, ClientEvent::Received(m) if m.operation() == Operation::Fetch));

        user.disconnect().await;
        assert_eq!(events.recv().await.unwrap().1, ClientEvent::Disconnected);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !server.clients().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        server.close().await;
    }

    #[tokio::test]
    async fn async_loop_respects_client_limit() {
        let (server, port) = bound(
            ServerConfig::default()
                .with_num_clients(1)
                .with_accept_loop_delay(Duration::from_millis(10)),
        )
        .await;
        server.start_async().await;

        let first = Client::user();
        first.connect(&ConnectionInfo::new("127.0.0.1", port)).await.unwrap();

        let second = Client::user();
        second
            .set_configuration(ClientConfig::default().with_handshake_timeout(Duration::from_millis(100)))
            .await;
        let err = second
            .connect(&ConnectionInfo::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(server.clients().await.len(), 1);
        first.disconnect().await;
        server.close().await;
    }

    #[tokio::test]
    async fn start_returns_after_client_limit() {
        let (server, port) = bound(ServerConfig::default().with_num_clients(2)).await;
        let runner = server.clone();
        let accepting = tokio::spawn(async move { runner.start().await });

        let info = ConnectionInfo::new("127.0.0.1", port);
        let first = Client::user();
        first.connect(&info).await.unwrap();
        let second = Client::user();
        second.connect(&info).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), accepting)
            .await
            .expect("start kept accepting past the limit")
            .unwrap()
            .unwrap();
        assert_eq!(server.clients().await.len(), 2);

        let third = Client::user();
        third
            .set_configuration(ClientConfig::default().with_handshake_timeout(Duration::from_millis(100)))
            .await;
        assert!(third.connect(&info).await.unwrap_err().is_timeout());

        first.disconnect().await;
        second.disconnect().await;
        server.close().await;
    }

    #[tokio::test]
    async fn peer_announcing_manager_is_dropped() {
        let (server, port) = bound(ServerConfig::default()).await;
        let impostor = Client::user();
        impostor.set_type(ClientType::Manager).await;
        impostor
            .set_configuration(ClientConfig::default().with_handshake_timeout(Duration::from_millis(500)))
            .await;

        let info = ConnectionInfo::new("127.0.0.1", port);
        let (accepted, connected) = tokio::join!(server.accept(), impostor.connect(&info));

        match accepted.unwrap_err() {
            CommunicationError::InvalidClient(reason) => {
                assert_eq!(reason, "Client identifies as MANAGER, which is not allowed.")
            }
            other => panic!("unexpected accept error: {other}"),
        }
        assert!(connected.unwrap_err().is_connection_failure());
        assert!(!impostor.is_connected().await);
        assert!(server.clients().await.is_empty());
        server.close().await;
    }
}
