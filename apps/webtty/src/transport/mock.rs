//! Scriptable peer backend for exercising negotiation without a network.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Generation, PeerChannelEvent, PeerChannelHandle};
use crate::error::NegotiationError;
use crate::negotiator::{BackendEvent, PeerBackend, PeerBackendFactory};
use crate::protocol::IceCandidate;

const MOCK_CHANNEL_CAPACITY: usize = 64;

/// Handle plus the remote end of an in-memory data channel.
pub fn channel_pair(generation: Generation, capacity: usize) -> (PeerChannelHandle, MockPeerRemote) {
    let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let torn_down = Arc::new(AtomicBool::new(false));
    let flag = torn_down.clone();
    let handle = PeerChannelHandle::new(generation, out_tx, event_rx, move || {
        flag.store(true, Ordering::SeqCst);
    });
    let remote = MockPeerRemote {
        generation,
        outbound: out_rx,
        events: event_tx,
        torn_down,
    };
    (handle, remote)
}

/// Far end of a mock data channel.
#[derive(Debug)]
pub struct MockPeerRemote {
    generation: Generation,
    outbound: mpsc::Receiver<Bytes>,
    events: mpsc::UnboundedSender<PeerChannelEvent>,
    torn_down: Arc<AtomicBool>,
}

impl MockPeerRemote {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Deliver the readiness sentinel.
    pub fn ready(&self) {
        let _ = self.events.send(PeerChannelEvent::Ready);
    }

    pub fn send(&self, bytes: impl Into<Bytes>) {
        let _ = self.events.send(PeerChannelEvent::Data(bytes.into()));
    }

    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.events.send(PeerChannelEvent::Closed(reason.into()));
    }

    /// Next payload written by the local side.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.outbound.try_recv().ok()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateOffer,
    AcceptOffer(String),
    ApplyAnswer(String),
    AddCandidate(IceCandidate),
    Close,
}

struct FactoryShared {
    controls: mpsc::UnboundedSender<MockPeerControl>,
    fail_descriptions: AtomicBool,
}

/// Creates [`MockBackend`]s and publishes a [`MockPeerControl`] for each.
#[derive(Clone)]
pub struct MockPeerFactory {
    shared: Arc<FactoryShared>,
}

impl MockPeerFactory {
    pub fn new() -> (Self, MockPeerControls) {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = Self {
            shared: Arc::new(FactoryShared {
                controls: tx,
                fail_descriptions: AtomicBool::new(false),
            }),
        };
        (factory, MockPeerControls { rx })
    }

    /// Make every backend created from now on fail to build descriptions.
    pub fn fail_descriptions(&self, fail: bool) {
        self.shared.fail_descriptions.store(fail, Ordering::SeqCst);
    }
}

impl PeerBackendFactory for MockPeerFactory {
    fn create(&self, generation: Generation) -> Result<Box<dyn PeerBackend>, NegotiationError> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let control = MockPeerControl {
            generation,
            calls: calls.clone(),
            events: event_tx,
            closed: closed.clone(),
        };
        let _ = self.shared.controls.send(control);
        Ok(Box::new(MockBackend {
            generation,
            calls,
            events: event_rx,
            closed,
            fail_descriptions: self.shared.fail_descriptions.load(Ordering::SeqCst),
        }))
    }
}

/// Stream of controls, one per backend the factory created.
pub struct MockPeerControls {
    rx: mpsc::UnboundedReceiver<MockPeerControl>,
}

impl MockPeerControls {
    pub async fn next(&mut self) -> Option<MockPeerControl> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<MockPeerControl> {
        self.rx.try_recv().ok()
    }
}

/// Test-side driver of one mock backend.
pub struct MockPeerControl {
    generation: Generation,
    calls: Arc<Mutex<Vec<MockCall>>>,
    events: mpsc::UnboundedSender<BackendEvent>,
    closed: Arc<AtomicBool>,
}

impl MockPeerControl {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(BackendEvent::LocalCandidate(candidate));
    }

    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.events.send(BackendEvent::Failed(reason.into()));
    }

    /// Report the data channel open and return its far end.
    pub fn open_channel(&self) -> MockPeerRemote {
        let (handle, remote) = channel_pair(self.generation, MOCK_CHANNEL_CAPACITY);
        let _ = self.events.send(BackendEvent::ChannelOpen(handle));
        remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct MockBackend {
    generation: Generation,
    calls: Arc<Mutex<Vec<MockCall>>>,
    events: mpsc::UnboundedReceiver<BackendEvent>,
    closed: Arc<AtomicBool>,
    fail_descriptions: bool,
}

impl MockBackend {
    fn record(&self, call: MockCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerBackend for MockBackend {
    async fn create_offer(&mut self) -> Result<String, NegotiationError> {
        self.record(MockCall::CreateOffer);
        if self.fail_descriptions {
            return Err(NegotiationError::Description("mock offer refused".into()));
        }
        Ok(format!("mock-offer-{}", self.generation))
    }

    async fn accept_offer(&mut self, sdp: String) -> Result<String, NegotiationError> {
        self.record(MockCall::AcceptOffer(sdp));
        if self.fail_descriptions {
            return Err(NegotiationError::Description("mock answer refused".into()));
        }
        Ok(format!("mock-answer-{}", self.generation))
    }

    async fn apply_answer(&mut self, sdp: String) -> Result<(), NegotiationError> {
        self.record(MockCall::ApplyAnswer(sdp));
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.record(MockCall::AddCandidate(candidate));
        Ok(())
    }

    async fn next_event(&mut self) -> Option<BackendEvent> {
        self.events.recv().await
    }

    async fn close(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record(MockCall::Close);
        }
    }
}
