//! TCP endpoint carrying length-prefixed frames.
//!
//! An endpoint owns exactly one connection. It moves from unconnected to
//! connected to closed and never back; reconnecting needs a fresh endpoint.

use std::fmt;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::FrameCodec;
use crate::config::endpoint_deadline;
use crate::error::CommunicationError;

const UNCONNECTED: u8 = 0;
const CONNECTED: u8 = 1;
const CLOSED: u8 = 2;
/// A `connect` call owns the endpoint until it settles.
const CONNECTING: u8 = 3;

/// Where to connect, and how long the connect call itself may take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    /// Connect timeout in milliseconds. `0` waits forever.
    pub timeout_ms: u64,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout_ms: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub struct Endpoint {
    reader: Mutex<Option<FramedRead<OwnedReadHalf, FrameCodec>>>,
    writer: Mutex<Option<FramedWrite<OwnedWriteHalf, FrameCodec>>>,
    state: AtomicU8,
    /// Receive timeout in milliseconds, `0` = infinite.
    timeout_ms: AtomicU64,
    closed: CancellationToken,
    peer: OnceLock<SocketAddr>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Endpoint {
    /// Unconnected endpoint.
    pub fn new() -> Self {
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            state: AtomicU8::new(UNCONNECTED),
            timeout_ms: AtomicU64::new(0),
            closed: CancellationToken::new(),
            peer: OnceLock::new(),
        }
    }

    /// Wraps an already established connection, e.g. one returned by `accept`.
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer = OnceLock::new();
        let (reader, writer) = split(stream, &peer);
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            state: AtomicU8::new(CONNECTED),
            timeout_ms: AtomicU64::new(0),
            closed: CancellationToken::new(),
            peer,
        }
    }

    pub async fn connect(&self, info: &ConnectionInfo) -> Result<(), CommunicationError> {
        if let Err(current) = self.state.compare_exchange(
            UNCONNECTED,
            CONNECTING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return Err(match current {
                CLOSED => CommunicationError::connection(
                    "Endpoint is closed. A new endpoint is required to reconnect.",
                ),
                _ => CommunicationError::connection("Socket is already connected."),
            });
        }

        let target = (info.host.as_str(), info.port);
        let connected = match endpoint_deadline(info.timeout_ms) {
            Some(limit) => match tokio::time::timeout(limit, TcpStream::connect(target)).await {
                Ok(result) => result,
                Err(_) => {
                    self.abandon_connect();
                    return Err(CommunicationError::timeout(format!(
                        "Timed out while trying to connect to {info}."
                    )));
                }
            },
            None => TcpStream::connect(target).await,
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                self.abandon_connect();
                return Err(CommunicationError::connection(format!(
                    "Connecting to {info} failed: {e}"
                )));
            }
        };

        let (reader, writer) = split(stream, &self.peer);
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        if self
            .state
            .compare_exchange(CONNECTING, CONNECTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.reader.lock().await.take();
            self.writer.lock().await.take();
            return Err(CommunicationError::connection(
                "Endpoint was closed while connecting.",
            ));
        }
        tracing::trace!(peer = %info, "Endpoint connected");
        Ok(())
    }

    /// Returns a failed `connect` to the unconnected state unless a concurrent
    /// `disconnect` already closed the endpoint.
    fn abandon_connect(&self) {
        let _ = self.state.compare_exchange(CONNECTING, UNCONNECTED, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Closes the connection. Safe to call repeatedly or before `connect`.
    pub async fn disconnect(&self) {
        if self.state.swap(CLOSED, Ordering::SeqCst) == CLOSED {
            return;
        }
        self.closed.cancel();
        // Dropping the write half shuts down our side of the stream.
        drop(self.writer.lock().await.take());
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        tracing::trace!(peer = ?self.peer_addr(), "Endpoint disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CONNECTED
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.get().copied()
    }

    pub fn set_timeout(&self, timeout_ms: u64) {
        self.timeout_ms.store(timeout_ms, Ordering::SeqCst);
    }

    pub fn timeout(&self) -> u64 {
        self.timeout_ms.load(Ordering::SeqCst)
    }

    /// Writes one frame and flushes it.
    pub async fn send(&self, frame: Bytes) -> Result<(), CommunicationError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| CommunicationError::connection("Endpoint is not connected."))?;

        tokio::select! {
            _ = self.closed.cancelled() => {
                Err(CommunicationError::connection("Endpoint closed while sending."))
            }
            res = writer.send(frame) => res.map_err(|e| {
                CommunicationError::connection(format!("Connection closed. Failed to send message: {e}"))
            }),
        }
    }

    /// Reads one frame, honoring the receive timeout.
    pub async fn receive(&self) -> Result<Bytes, CommunicationError> {
        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| CommunicationError::connection("Endpoint is not connected."))?;

        let deadline = endpoint_deadline(self.timeout());
        let next = async {
            match deadline {
                Some(limit) => tokio::time::timeout(limit, reader.next()).await.map_err(|_| {
                    CommunicationError::timeout("Timed out while trying to receive a message.")
                }),
                None => Ok(reader.next().await),
            }
        };

        let outcome = tokio::select! {
            _ = self.closed.cancelled() => None,
            res = next => Some(res),
        };

        match outcome {
            None => {
                guard.take();
                Err(CommunicationError::connection("Endpoint closed while receiving."))
            }
            Some(res) => match res? {
                Some(Ok(frame)) => Ok(frame),
                Some(Err(e)) => Err(CommunicationError::connection(format!(
                    "Connection closed. Failed to receive message: {e}"
                ))),
                None => Err(CommunicationError::connection("Connection closed by peer.")),
            },
        }
    }
}

type Halves = (
    FramedRead<OwnedReadHalf, FrameCodec>,
    FramedWrite<OwnedWriteHalf, FrameCodec>,
);

fn split(stream: TcpStream, peer: &OnceLock<SocketAddr>) -> Halves {
    if let Ok(addr) = stream.peer_addr() {
        let _ = peer.set(addr);
    }
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    (
        FramedRead::new(read, FrameCodec::new()),
        FramedWrite::new(write, FrameCodec::new()),
    )
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("peer", &self.peer_addr())
            .field("connected", &self.is_connected())
            .field("timeout_ms", &self.timeout())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (Endpoint, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = Endpoint::new();
        let info = ConnectionInfo::new("127.0.0.1", port);
        let (accepted, connected) = tokio::join!(
            listener.accept(),
            client.connect(&info)
        );
        connected.unwrap();
        (client, Endpoint::from_stream(accepted.unwrap().0))
    }

    #[tokio::test]
    async fn frames_cross_the_connection() {
        let (client, server) = pair().await;
        client.send(Bytes::from_static(b"INIT")).await.unwrap();
        client.send(Bytes::new()).await.unwrap();
        assert_eq!(server.receive().await.unwrap().as_ref(), b"INIT");
        assert!(server.receive().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn connect_twice_fails() {
        let (client, _server) = pair().await;
        let err = client
            .connect(&ConnectionInfo::new("127.0.0.1", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CommunicationError::Connection(_)));
    }

    #[tokio::test]
    async fn concurrent_connects_admit_one() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = Endpoint::new();
        let info = ConnectionInfo::new("127.0.0.1", port);

        let (a, b) = tokio::join!(endpoint.connect(&info), endpoint.connect(&info));
        assert_eq!(
            [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(),
            1,
            "exactly one connect may win"
        );
        assert!(endpoint.is_connected());
    }

    #[tokio::test]
    async fn failed_connect_can_be_retried() {
        let endpoint = Endpoint::new();
        assert!(endpoint.connect(&ConnectionInfo::new("127.0.0.1", 1)).await.is_err());
        assert!(!endpoint.is_connected());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        endpoint
            .connect(&ConnectionInfo::new("127.0.0.1", port))
            .await
            .unwrap();
        assert!(endpoint.is_connected());
    }

    #[tokio::test]
    async fn closed_endpoint_cannot_reconnect() {
        let endpoint = Endpoint::new();
        endpoint.disconnect().await;
        endpoint.disconnect().await;
        assert!(!endpoint.is_connected());
        assert!(endpoint.connect(&ConnectionInfo::new("127.0.0.1", 1)).await.is_err());
    }

    #[tokio::test]
    async fn receive_times_out() {
        let (client, _server) = pair().await;
        client.set_timeout(200);
        let started = std::time::Instant::now();
        let err = client.receive().await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(err.is_timeout());
        assert!(elapsed >= std::time::Duration::from_millis(200), "returned early: {elapsed:?}");
        assert!(elapsed < std::time::Duration::from_millis(450), "returned late: {elapsed:?}");
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn peer_close_is_connection_error() {
        let (client, server) = pair().await;
        server.disconnect().await;
        let err = client.receive().await.unwrap_err();
        assert!(matches!(err, CommunicationError::Connection(_)));
    }

    #[tokio::test]
    async fn disconnect_interrupts_pending_receive() {
        let (client, _server) = pair().await;
        let client = std::sync::Arc::new(client);
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.receive().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.disconnect().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, CommunicationError::Connection(_)));
    }

    #[tokio::test]
    async fn send_after_disconnect_fails() {
        let (client, _server) = pair().await;
        client.disconnect().await;
        assert!(client.send(Bytes::from_static(b"x")).await.is_err());
    }
}
