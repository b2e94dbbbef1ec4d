//! Persistent control channel to the coordinating endpoint.
//!
//! A [`SignalingChannel`] has a bounded, non-blocking send side and an
//! unbounded receive side that ends with exactly one `Close(reason)` message.

mod websocket;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::SessionConfig;
use crate::error::ConnectionError;
use crate::protocol::SignalingMessage;

const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Non-blocking send failure; the rejected value is handed back.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError<T> {
    #[error("writer queue full")]
    Full(T),
    #[error("channel closed")]
    Closed(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            SendError::Full(value) | SendError::Closed(value) => value,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, SendError::Full(_))
    }
}

/// Cloneable write half of a signaling channel.
#[derive(Clone, Debug)]
pub struct SignalingSender {
    tx: mpsc::Sender<SignalingMessage>,
    open: Arc<AtomicBool>,
}

impl SignalingSender {
    pub fn send(&self, message: SignalingMessage) -> Result<(), SendError<SignalingMessage>> {
        if !self.is_open() {
            return Err(SendError::Closed(message));
        }
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => Err(SendError::Full(message)),
            Err(TrySendError::Closed(message)) => {
                self.open.store(false, Ordering::SeqCst);
                Err(SendError::Closed(message))
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}

/// Read half of a signaling channel.
#[derive(Debug)]
pub struct SignalingReceiver {
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
    open: Arc<AtomicBool>,
    finished: bool,
}

impl SignalingReceiver {
    /// Next inbound message. The last item is always `Close(reason)`; `None`
    /// follows it.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        if self.finished {
            return None;
        }
        let message = match self.rx.recv().await {
            Some(SignalingMessage::Close(reason)) => SignalingMessage::Close(reason),
            Some(message) => return Some(message),
            None => SignalingMessage::Close("signaling channel ended".into()),
        };
        self.finished = true;
        self.open.store(false, Ordering::SeqCst);
        Some(message)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

pub struct SignalingChannel {
    sender: SignalingSender,
    receiver: SignalingReceiver,
    tasks: IoTasks,
}

/// Writer first, then reader. Aborted on drop unless detached.
#[derive(Default)]
struct IoTasks(Vec<JoinHandle<()>>);

impl IoTasks {
    fn detach(mut self) {
        self.0.clear();
    }
}

impl Drop for IoTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

impl SignalingChannel {
    /// Connect to `config.endpoint`, suspending until the WebSocket handshake
    /// completes or `connect_timeout` elapses.
    pub async fn open(config: &SessionConfig) -> Result<Self, ConnectionError> {
        let url = config.endpoint_url()?;
        websocket::connect(url, config).await
    }

    /// In-memory channel whose far end is driven by the caller.
    pub fn pair(capacity: usize) -> (Self, RemoteSignaling) {
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let channel = Self::from_parts(out_tx, in_rx, Vec::new());
        let remote = RemoteSignaling {
            inbound: out_rx,
            outbound: in_tx,
        };
        (channel, remote)
    }

    fn from_parts(
        tx: mpsc::Sender<SignalingMessage>,
        rx: mpsc::UnboundedReceiver<SignalingMessage>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        let open = Arc::new(AtomicBool::new(true));
        Self {
            sender: SignalingSender {
                tx,
                open: open.clone(),
            },
            receiver: SignalingReceiver {
                rx,
                open,
                finished: false,
            },
            tasks: IoTasks(tasks),
        }
    }

    pub fn send(&self, message: SignalingMessage) -> Result<(), SendError<SignalingMessage>> {
        self.sender.send(message)
    }

    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.receiver.recv().await
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open() && !self.receiver.is_finished()
    }

    /// Detach the I/O tasks and hand out both halves.
    pub fn split(self) -> (SignalingSender, SignalingReceiver) {
        let SignalingChannel {
            sender,
            receiver,
            tasks,
        } = self;
        tasks.detach();
        (sender, receiver)
    }

    /// Send `Close(reason)` to the remote side, give the writer a moment to
    /// flush it, then stop the I/O tasks.
    pub async fn close(mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.sender.is_open() {
            match self.sender.tx.try_send(SignalingMessage::Close(reason.clone())) {
                Ok(()) => trace!(target: "webtty::signaling", %reason, "close queued"),
                Err(err) => debug!(target: "webtty::signaling", error = %err, "close not queued"),
            }
        }
        self.sender.open.store(false, Ordering::SeqCst);

        let mut tasks = std::mem::take(&mut self.tasks.0).into_iter();
        if let Some(mut writer) = tasks.next() {
            if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        for task in tasks {
            task.abort();
        }
    }
}

/// Coordinating side of an in-memory [`SignalingChannel::pair`].
#[derive(Debug)]
pub struct RemoteSignaling {
    inbound: mpsc::Receiver<SignalingMessage>,
    outbound: mpsc::UnboundedSender<SignalingMessage>,
}

impl RemoteSignaling {
    /// Deliver a message to the local side. Returns false once the local
    /// receiver is gone.
    pub fn send(&self, message: SignalingMessage) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// Next message written by the local side.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.inbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SignalingMessage> {
        self.inbound.try_recv().ok()
    }

    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.outbound.send(SignalingMessage::Close(reason.into()));
    }
}

/// Opens the signaling channel for a session.
#[async_trait]
pub trait SignalingConnector: Send + Sync + 'static {
    async fn connect(&self, config: &SessionConfig) -> Result<SignalingChannel, ConnectionError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<SignalingChannel, ConnectionError> {
        SignalingChannel::open(config).await
    }
}

/// Hands out a pre-built in-memory channel once.
pub struct PairedConnector {
    channel: Mutex<Option<SignalingChannel>>,
}

impl PairedConnector {
    pub fn new(capacity: usize) -> (Self, RemoteSignaling) {
        let (channel, remote) = SignalingChannel::pair(capacity);
        (
            Self {
                channel: Mutex::new(Some(channel)),
            },
            remote,
        )
    }
}

#[async_trait]
impl SignalingConnector for PairedConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<SignalingChannel, ConnectionError> {
        self.channel
            .lock()
            .take()
            .ok_or_else(|| ConnectionError::Unreachable {
                endpoint: config.endpoint.clone(),
                reason: "paired channel already taken".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test_timeout::tokio_timeout_test]
    async fn pair_delivers_in_order() {
        let (mut channel, mut remote) = SignalingChannel::pair(8);
        channel.send(SignalingMessage::Hello).unwrap();
        channel.send(SignalingMessage::data("ls\n")).unwrap();
        assert_eq!(remote.recv().await, Some(SignalingMessage::Hello));
        assert_eq!(remote.recv().await, Some(SignalingMessage::data("ls\n")));

        remote.send(SignalingMessage::Offer("sdp".into()));
        assert_eq!(channel.recv().await, Some(SignalingMessage::Offer("sdp".into())));
    }

    #[test_timeout::tokio_timeout_test]
    async fn full_writer_queue_hands_payload_back() {
        let (channel, _remote) = SignalingChannel::pair(1);
        channel.send(SignalingMessage::data("a")).unwrap();
        let err = channel.send(SignalingMessage::data("b")).unwrap_err();
        assert!(err.is_full());
        assert_eq!(err.into_inner().into_data(), Some(Bytes::from_static(b"b")));
    }

    #[test_timeout::tokio_timeout_test]
    async fn remote_close_is_terminal() {
        let (channel, remote) = SignalingChannel::pair(4);
        let (sender, mut receiver) = channel.split();
        remote.close("bye");
        assert_eq!(receiver.recv().await, Some(SignalingMessage::Close("bye".into())));
        assert_eq!(receiver.recv().await, None);
        assert!(matches!(
            sender.send(SignalingMessage::Hello),
            Err(SendError::Closed(_))
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropped_remote_synthesizes_close() {
        let (mut channel, remote) = SignalingChannel::pair(4);
        drop(remote);
        assert!(matches!(channel.recv().await, Some(SignalingMessage::Close(_))));
        assert_eq!(channel.recv().await, None);
        assert!(!channel.is_open());
    }

    #[test_timeout::tokio_timeout_test]
    async fn paired_connector_hands_out_once() {
        let (connector, _remote) = PairedConnector::new(4);
        let config = SessionConfig::default();
        assert!(connector.connect(&config).await.is_ok());
        assert!(matches!(
            connector.connect(&config).await,
            Err(ConnectionError::Unreachable { .. })
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn open_reports_unreachable_endpoint() {
        let config = SessionConfig::builder()
            .endpoint("ws://127.0.0.1:1/ws")
            .build();
        assert!(matches!(
            SignalingChannel::open(&config).await,
            Err(ConnectionError::Unreachable { .. } | ConnectionError::Timeout { .. })
        ));
    }
}
