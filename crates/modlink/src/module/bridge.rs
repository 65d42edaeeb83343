//! Two bounded queues between the protocol side and a long-running worker
//! routine.
//!
//! The controller side (`forward`, `fetch`) is async. The worker side
//! ([`ModuleIo`]) blocks its own thread through a runtime handle.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("{0}")]
    Timeout(&'static str),
    #[error("module was interrupted")]
    Interrupted,
    #[error("module queue closed")]
    Closed,
}

pub struct ModuleBridge {
    input_tx: mpsc::Sender<Bytes>,
    input_rx: Mutex<mpsc::Receiver<Bytes>>,
    output_tx: mpsc::Sender<Bytes>,
    output_rx: Mutex<mpsc::Receiver<Bytes>>,
    config: BridgeConfig,
    interrupted: CancellationToken,
}

impl ModuleBridge {
    pub fn new(config: BridgeConfig) -> Self {
        let capacity = config.capacity.max(1);
        let (input_tx, input_rx) = mpsc::channel(capacity);
        let (output_tx, output_rx) = mpsc::channel(capacity);
        Self {
            input_tx,
            input_rx: Mutex::new(input_rx),
            output_tx,
            output_rx: Mutex::new(output_rx),
            config,
            interrupted: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Hands `data` to the worker, waiting at most the forward timeout for room.
    pub async fn forward(&self, data: Bytes) -> Result<(), BridgeError> {
        bounded(
            self.config.forward_timeout(),
            &self.interrupted,
            self.input_tx.send(data),
            "Timed out while forwarding data.",
        )
        .await?
        .map_err(|_| BridgeError::Closed)
    }

    /// Takes the next worker output, waiting at most the fetch timeout.
    pub async fn fetch(&self) -> Result<Bytes, BridgeError> {
        let mut rx = self.output_rx.lock().await;
        bounded(
            self.config.fetch_timeout(),
            &self.interrupted,
            rx.recv(),
            "Timed out while fetching data.",
        )
        .await?
        .ok_or(BridgeError::Closed)
    }

    /// Whether worker output is waiting to be fetched. Never blocks.
    pub fn is_fetchable(&self) -> bool {
        self.output_tx.capacity() < self.output_tx.max_capacity()
    }

    /// Makes pending and future worker-side waits return [`BridgeError::Interrupted`].
    pub fn interrupt(&self) {
        self.interrupted.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.is_cancelled()
    }

    async fn input(&self) -> Result<Bytes, BridgeError> {
        let mut rx = self.input_rx.lock().await;
        bounded(
            self.config.input_timeout(),
            &self.interrupted,
            rx.recv(),
            "Timed out while waiting for input.",
        )
        .await?
        .ok_or(BridgeError::Closed)
    }

    async fn output(&self, data: Bytes) -> Result<(), BridgeError> {
        bounded(
            self.config.output_timeout(),
            &self.interrupted,
            self.output_tx.send(data),
            "Timed out while outputting data.",
        )
        .await?
        .map_err(|_| BridgeError::Closed)
    }
}

async fn bounded<F: Future>(
    limit: Option<Duration>,
    interrupted: &CancellationToken,
    fut: F,
    timeout_message: &'static str,
) -> Result<F::Output, BridgeError> {
    let timed = async {
        match limit {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| BridgeError::Timeout(timeout_message)),
            None => Ok(fut.await),
        }
    };
    tokio::select! {
        _ = interrupted.cancelled() => Err(BridgeError::Interrupted),
        res = timed => res,
    }
}

/// Worker-side view of a [`ModuleBridge`]. Calls block the calling thread and
/// must not be made from inside the async runtime.
pub struct ModuleIo<'a> {
    bridge: &'a ModuleBridge,
    handle: Handle,
}

impl<'a> ModuleIo<'a> {
    pub fn new(bridge: &'a ModuleBridge, handle: Handle) -> Self {
        Self { bridge, handle }
    }

    /// Blocks for the next forwarded payload, honoring the input timeout.
    pub fn input(&self) -> Result<Bytes, BridgeError> {
        self.handle.block_on(self.bridge.input())
    }

    /// Queues `data` for fetching, honoring the output timeout.
    pub fn output(&self, data: impl Into<Bytes>) -> Result<(), BridgeError> {
        self.handle.block_on(self.bridge.output(data.into()))
    }

    pub fn is_interrupted(&self) -> bool {
        self.bridge.is_interrupted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> BridgeConfig {
        BridgeConfig {
            fetch_timeout_ms: 50,
            forward_timeout_ms: 50,
            output_timeout_ms: 50,
            input_timeout_ms: 50,
            capacity: 1,
        }
    }

    #[tokio::test]
    async fn fetch_times_out_when_empty() {
        let bridge = ModuleBridge::new(quick());
        assert!(!bridge.is_fetchable());
        assert_eq!(
            bridge.fetch().await.unwrap_err(),
            BridgeError::Timeout("Timed out while fetching data.")
        );
    }

    #[tokio::test]
    async fn forward_times_out_when_full() {
        let bridge = ModuleBridge::new(quick());
        bridge.forward(Bytes::from_static(b"a")).await.unwrap();
        let err = bridge.forward(Bytes::from_static(b"b")).await.unwrap_err();
        assert_eq!(err.to_string(), "Timed out while forwarding data.");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_round_trip() {
        let bridge = std::sync::Arc::new(ModuleBridge::new(BridgeConfig::default()));
        let handle = Handle::current();
        let worker = tokio::task::spawn_blocking({
            let bridge = bridge.clone();
            move || {
                let io = ModuleIo::new(&bridge, handle);
                let data = io.input()?;
                io.output(data.to_ascii_uppercase())
            }
        });

        bridge.forward(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(bridge.fetch().await.unwrap().as_ref(), b"HELLO");
        worker.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interrupt_releases_blocked_worker() {
        let bridge = std::sync::Arc::new(ModuleBridge::new(BridgeConfig::default()));
        let handle = Handle::current();
        let worker = tokio::task::spawn_blocking({
            let bridge = bridge.clone();
            move || ModuleIo::new(&bridge, handle).input()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bridge.interrupt();
        assert_eq!(worker.await.unwrap().unwrap_err(), BridgeError::Interrupted);
    }

    #[tokio::test]
    async fn fetchable_tracks_pending_output() {
        let bridge = ModuleBridge::new(BridgeConfig::default());
        bridge.output(Bytes::from_static(b"x")).await.unwrap();
        assert!(bridge.is_fetchable());
        bridge.fetch().await.unwrap();
        assert!(!bridge.is_fetchable());
    }
}
