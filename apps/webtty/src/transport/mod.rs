//! Terminal byte transports and the peer channel handle shared by the
//! negotiator and the selector.

pub mod mock;
pub mod webrtc;

use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::signaling::SendError;

/// Identifies one negotiation attempt and the channel it produced.
pub type Generation = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActiveTransport {
    Signaling,
    Peer(Generation),
}

impl fmt::Display for ActiveTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveTransport::Signaling => f.write_str("signaling"),
            ActiveTransport::Peer(generation) => write!(f, "peer#{generation}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerChannelEvent {
    /// Remote side wrote the readiness sentinel.
    Ready,
    Data(Bytes),
    Closed(String),
}

type Teardown = Box<dyn FnOnce() + Send>;

/// An open peer data channel.
///
/// Sends are non-blocking and go through a bounded writer queue. After
/// [`teardown`](Self::teardown) every send is refused and no further events
/// are yielded.
pub struct PeerChannelHandle {
    generation: Generation,
    outbound: mpsc::Sender<Bytes>,
    events: mpsc::UnboundedReceiver<PeerChannelEvent>,
    teardown: Option<Teardown>,
    torn_down: bool,
    closed: bool,
}

impl PeerChannelHandle {
    pub fn new(
        generation: Generation,
        outbound: mpsc::Sender<Bytes>,
        events: mpsc::UnboundedReceiver<PeerChannelEvent>,
        teardown: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            generation,
            outbound,
            events,
            teardown: Some(Box::new(teardown)),
            torn_down: false,
            closed: false,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn send(&self, bytes: Bytes) -> Result<(), SendError<Bytes>> {
        if !self.is_open() {
            return Err(SendError::Closed(bytes));
        }
        match self.outbound.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(bytes)) => Err(SendError::Full(bytes)),
            Err(TrySendError::Closed(bytes)) => Err(SendError::Closed(bytes)),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.torn_down && !self.closed && !self.outbound.is_closed()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Next event from the channel. A lost event source is reported as
    /// `Closed` once; afterwards, and after teardown, this yields `None`.
    pub async fn next_event(&mut self) -> Option<PeerChannelEvent> {
        if self.torn_down || self.closed {
            return None;
        }
        match self.events.recv().await {
            Some(PeerChannelEvent::Closed(reason)) => {
                self.closed = true;
                Some(PeerChannelEvent::Closed(reason))
            }
            Some(event) => Some(event),
            None => {
                self.closed = true;
                Some(PeerChannelEvent::Closed("peer channel event source ended".into()))
            }
        }
    }

    /// Release the underlying channel. Idempotent.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.events.close();
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for PeerChannelHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for PeerChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerChannelHandle")
            .field("generation", &self.generation)
            .field("torn_down", &self.torn_down)
            .field("closed", &self.closed)
            .finish()
    }
}
