//! Single source of truth for which transport carries terminal I/O.
//!
//! Outbound input switches to a peer channel as soon as it is adopted.
//! Inbound output switches once the peer writes the readiness sentinel.
//! Frames that still arrive on the other path are delivered and counted.

mod queue;

pub use queue::RetryQueue;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::protocol::SignalingMessage;
use crate::signaling::{SendError, SignalingSender};
use crate::transport::{ActiveTransport, Generation, PeerChannelEvent, PeerChannelHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(ActiveTransport),
    /// Held in the retry queue; `dropped` is set when an older entry was evicted.
    Queued { depth: usize, dropped: bool },
    /// No transport is open; the payload was discarded.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFailureOutcome {
    /// Reverted to signaling.
    Degraded,
    /// Signaling was already gone.
    Exhausted,
    /// Not the live generation.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingLossOutcome {
    /// A live peer channel still carries input.
    PeerOnly,
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectorStats {
    pub queued: usize,
    pub dropped: usize,
    pub sent_signaling: u64,
    pub sent_peer: u64,
    pub late_inbound: u64,
    pub handovers: u64,
}

enum Forward {
    Sent(ActiveTransport),
    Full(Bytes),
    Unavailable(Bytes),
}

pub struct TransportSelector {
    signaling: SignalingSender,
    signaling_open: bool,
    peer: Option<PeerChannelHandle>,
    outbound: ActiveTransport,
    inbound: ActiveTransport,
    queue: RetryQueue,
    stats: SelectorStats,
}

impl TransportSelector {
    pub fn new(signaling: SignalingSender, retry_capacity: usize) -> Self {
        Self {
            signaling,
            signaling_open: true,
            peer: None,
            outbound: ActiveTransport::Signaling,
            inbound: ActiveTransport::Signaling,
            queue: RetryQueue::new(retry_capacity),
            stats: SelectorStats::default(),
        }
    }

    pub fn outbound(&self) -> ActiveTransport {
        self.outbound
    }

    pub fn inbound(&self) -> ActiveTransport {
        self.inbound
    }

    pub fn peer_generation(&self) -> Option<Generation> {
        self.peer.as_ref().map(PeerChannelHandle::generation)
    }

    pub fn has_live_peer(&self) -> bool {
        self.peer.as_ref().is_some_and(PeerChannelHandle::is_open)
    }

    pub fn signaling_open(&self) -> bool {
        self.signaling_open && self.signaling.is_open()
    }

    pub fn stats(&self) -> SelectorStats {
        SelectorStats {
            queued: self.queue.len(),
            dropped: self.queue.dropped(),
            ..self.stats
        }
    }

    /// Forward `bytes` on the active outbound transport, queueing behind any
    /// earlier payloads that are still waiting.
    pub fn send(&mut self, bytes: Bytes) -> SendOutcome {
        self.flush();
        if !self.queue.is_empty() {
            return self.enqueue(bytes);
        }
        match self.forward(bytes) {
            Forward::Sent(transport) => SendOutcome::Sent(transport),
            Forward::Full(bytes) => self.enqueue(bytes),
            Forward::Unavailable(bytes) => {
                warn!(target: "webtty::selector", len = bytes.len(), "no transport open; input discarded");
                SendOutcome::Unavailable
            }
        }
    }

    /// Drain the retry queue to the active transport; returns how many
    /// payloads went out.
    pub fn flush(&mut self) -> usize {
        let mut flushed = 0;
        while let Some(bytes) = self.queue.pop_front() {
            match self.forward(bytes) {
                Forward::Sent(_) => flushed += 1,
                Forward::Full(bytes) | Forward::Unavailable(bytes) => {
                    self.queue.push_front(bytes);
                    break;
                }
            }
        }
        if flushed > 0 {
            trace!(target: "webtty::selector", flushed, remaining = self.queue.len(), "retry queue flushed");
        }
        flushed
    }

    /// Make `handle` the outbound transport, tearing down any previous one.
    pub fn adopt_peer(&mut self, handle: PeerChannelHandle) {
        let generation = handle.generation();
        if let Some(mut previous) = self.peer.take() {
            debug!(target: "webtty::selector", generation = previous.generation(), "tearing down superseded peer channel");
            previous.teardown();
        }
        self.peer = Some(handle);
        self.outbound = ActiveTransport::Peer(generation);
        self.inbound = ActiveTransport::Signaling;
        self.stats.handovers += 1;
        info!(target: "webtty::selector", generation, "outbound switched to peer channel");
        self.flush();
    }

    /// The peer wrote its readiness sentinel; switch inbound to it.
    pub fn on_peer_ready(&mut self, generation: Generation) -> bool {
        if self.peer_generation() != Some(generation) || !self.has_live_peer() {
            debug!(target: "webtty::selector", generation, "readiness from stale peer channel");
            return false;
        }
        self.inbound = ActiveTransport::Peer(generation);
        info!(target: "webtty::selector", generation, "inbound switched to peer channel");
        true
    }

    /// Record an inbound frame; returns true when it arrived off the active path.
    pub fn accept_inbound(&mut self, origin: ActiveTransport, len: usize) -> bool {
        if origin == self.inbound {
            return false;
        }
        self.stats.late_inbound += 1;
        trace!(
            target: "webtty::selector",
            %origin,
            active = %self.inbound,
            len,
            late = self.stats.late_inbound,
            "inbound frame on inactive path"
        );
        true
    }

    pub fn on_peer_failure(&mut self, generation: Generation) -> PeerFailureOutcome {
        if self.peer_generation() != Some(generation) {
            debug!(target: "webtty::selector", generation, "ignoring failure of stale peer channel");
            return PeerFailureOutcome::Ignored;
        }
        self.teardown_peer();
        if self.signaling_open() {
            self.flush();
            PeerFailureOutcome::Degraded
        } else {
            PeerFailureOutcome::Exhausted
        }
    }

    pub fn on_signaling_lost(&mut self) -> SignalingLossOutcome {
        self.signaling_open = false;
        if matches!(self.outbound, ActiveTransport::Peer(_)) && self.has_live_peer() {
            SignalingLossOutcome::PeerOnly
        } else {
            SignalingLossOutcome::Exhausted
        }
    }

    /// Tear down the live peer channel, if any, and revert to signaling.
    pub fn teardown_peer(&mut self) {
        if let Some(mut handle) = self.peer.take() {
            info!(target: "webtty::selector", generation = handle.generation(), "peer channel released");
            handle.teardown();
        }
        self.outbound = ActiveTransport::Signaling;
        self.inbound = ActiveTransport::Signaling;
    }

    /// Next event from the live peer channel; pends while there is none.
    pub async fn next_peer_event(&mut self) -> (Generation, PeerChannelEvent) {
        if let Some(handle) = self.peer.as_mut() {
            let generation = handle.generation();
            if let Some(event) = handle.next_event().await {
                return (generation, event);
            }
        }
        std::future::pending().await
    }

    fn enqueue(&mut self, bytes: Bytes) -> SendOutcome {
        let dropped = self.queue.push_back(bytes);
        if dropped {
            warn!(
                target: "webtty::selector",
                capacity = self.queue.capacity(),
                dropped = self.queue.dropped(),
                "retry queue overflow; oldest input dropped"
            );
        }
        SendOutcome::Queued {
            depth: self.queue.len(),
            dropped,
        }
    }

    fn forward(&mut self, bytes: Bytes) -> Forward {
        let primary = self.outbound;
        let bytes = match self.send_via(primary, bytes) {
            Ok(()) => return Forward::Sent(primary),
            Err(SendError::Full(bytes)) => return Forward::Full(bytes),
            Err(SendError::Closed(bytes)) => bytes,
        };
        let Some(fallback) = self.alternate(primary) else {
            return Forward::Unavailable(bytes);
        };
        debug!(target: "webtty::selector", from = %primary, to = %fallback, "active path closed; falling back");
        match self.send_via(fallback, bytes) {
            Ok(()) => Forward::Sent(fallback),
            Err(SendError::Full(bytes)) => Forward::Full(bytes),
            Err(SendError::Closed(bytes)) => Forward::Unavailable(bytes),
        }
    }

    fn alternate(&self, transport: ActiveTransport) -> Option<ActiveTransport> {
        match transport {
            ActiveTransport::Peer(_) if self.signaling_open() => Some(ActiveTransport::Signaling),
            ActiveTransport::Signaling if self.has_live_peer() => {
                self.peer_generation().map(ActiveTransport::Peer)
            }
            _ => None,
        }
    }

    fn send_via(&mut self, transport: ActiveTransport, bytes: Bytes) -> Result<(), SendError<Bytes>> {
        match transport {
            ActiveTransport::Signaling => {
                if !self.signaling_open {
                    return Err(SendError::Closed(bytes));
                }
                self.signaling
                    .send(SignalingMessage::Data(bytes))
                    .map_err(|err| match err {
                        SendError::Full(message) => {
                            SendError::Full(message.into_data().unwrap_or_default())
                        }
                        SendError::Closed(message) => {
                            SendError::Closed(message.into_data().unwrap_or_default())
                        }
                    })?;
                self.stats.sent_signaling += 1;
            }
            ActiveTransport::Peer(generation) => {
                let Some(handle) = self.peer.as_ref().filter(|h| h.generation() == generation) else {
                    return Err(SendError::Closed(bytes));
                };
                handle.send(bytes)?;
                self.stats.sent_peer += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{RemoteSignaling, SignalingChannel};
    use crate::transport::mock::{MockPeerRemote, channel_pair};

    fn selector(capacity: usize) -> (TransportSelector, SignalingChannel, RemoteSignaling) {
        let (channel, remote) = SignalingChannel::pair(64);
        let selector = TransportSelector::new(channel.sender(), capacity);
        (selector, channel, remote)
    }

    fn data(remote: &mut RemoteSignaling) -> Vec<Bytes> {
        std::iter::from_fn(|| remote.try_recv())
            .filter_map(SignalingMessage::into_data)
            .collect()
    }

    fn drain(remote: &mut MockPeerRemote) -> Vec<Bytes> {
        std::iter::from_fn(|| remote.try_recv()).collect()
    }

    #[test_timeout::tokio_timeout_test]
    async fn starts_on_signaling() {
        let (mut selector, _channel, mut remote) = selector(4);
        assert_eq!(
            selector.send(Bytes::from_static(b"ls\n")),
            SendOutcome::Sent(ActiveTransport::Signaling)
        );
        assert_eq!(data(&mut remote), vec![Bytes::from_static(b"ls\n")]);
        assert_eq!(selector.stats().sent_signaling, 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn inbound_waits_for_readiness() {
        let (mut selector, _channel, mut remote) = selector(4);
        let (handle, mut peer) = channel_pair(1, 8);
        selector.adopt_peer(handle);

        assert_eq!(selector.outbound(), ActiveTransport::Peer(1));
        assert_eq!(selector.inbound(), ActiveTransport::Signaling);
        assert_eq!(
            selector.send(Bytes::from_static(b"a")),
            SendOutcome::Sent(ActiveTransport::Peer(1))
        );
        assert_eq!(drain(&mut peer), vec![Bytes::from_static(b"a")]);
        assert!(data(&mut remote).is_empty());

        assert!(!selector.accept_inbound(ActiveTransport::Signaling, 3));
        assert!(selector.on_peer_ready(1));
        assert_eq!(selector.inbound(), ActiveTransport::Peer(1));
        assert!(selector.accept_inbound(ActiveTransport::Signaling, 3));
        assert_eq!(selector.stats().late_inbound, 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn full_peer_queue_preserves_order() {
        let (mut selector, _channel, _remote) = selector(8);
        let (handle, mut peer) = channel_pair(1, 1);
        selector.adopt_peer(handle);

        assert!(matches!(selector.send(Bytes::from_static(b"1")), SendOutcome::Sent(_)));
        assert_eq!(
            selector.send(Bytes::from_static(b"2")),
            SendOutcome::Queued { depth: 1, dropped: false }
        );
        assert_eq!(
            selector.send(Bytes::from_static(b"3")),
            SendOutcome::Queued { depth: 2, dropped: false }
        );

        let mut received = Vec::new();
        while received.len() < 3 {
            received.push(peer.recv().await.unwrap());
            selector.flush();
        }
        assert_eq!(
            received,
            vec![
                Bytes::from_static(b"1"),
                Bytes::from_static(b"2"),
                Bytes::from_static(b"3")
            ]
        );
        let stats = selector.stats();
        assert_eq!((stats.queued, stats.dropped, stats.sent_peer), (0, 0, 3));
    }

    #[test_timeout::tokio_timeout_test]
    async fn retry_overflow_drops_oldest() {
        let (channel, _remote) = SignalingChannel::pair(1);
        let mut selector = TransportSelector::new(channel.sender(), 2);

        assert!(matches!(selector.send(Bytes::from_static(b"0")), SendOutcome::Sent(_)));
        selector.send(Bytes::from_static(b"1"));
        selector.send(Bytes::from_static(b"2"));
        assert_eq!(
            selector.send(Bytes::from_static(b"3")),
            SendOutcome::Queued { depth: 2, dropped: true }
        );
        let stats = selector.stats();
        assert_eq!((stats.queued, stats.dropped), (2, 1));
    }

    #[test_timeout::tokio_timeout_test]
    async fn handover_never_points_at_torn_down_handle() {
        let (mut selector, _channel, mut remote) = selector(4);
        let (first, first_remote) = channel_pair(1, 8);
        let (second, mut second_remote) = channel_pair(2, 8);

        selector.adopt_peer(first);
        selector.adopt_peer(second);
        assert!(first_remote.is_torn_down());
        assert_eq!(selector.outbound(), ActiveTransport::Peer(2));

        assert_eq!(selector.on_peer_failure(1), PeerFailureOutcome::Ignored);
        assert_eq!(selector.outbound(), ActiveTransport::Peer(2));
        selector.send(Bytes::from_static(b"x"));
        assert_eq!(drain(&mut second_remote), vec![Bytes::from_static(b"x")]);

        assert_eq!(selector.on_peer_failure(2), PeerFailureOutcome::Degraded);
        assert!(second_remote.is_torn_down());
        assert_eq!(selector.outbound(), ActiveTransport::Signaling);
        assert_eq!(selector.inbound(), ActiveTransport::Signaling);
        assert_eq!(selector.peer_generation(), None);

        selector.send(Bytes::from_static(b"y"));
        assert_eq!(data(&mut remote), vec![Bytes::from_static(b"y")]);
        assert_eq!(selector.stats().handovers, 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn closed_peer_falls_back_to_signaling() {
        let (mut selector, _channel, mut remote) = selector(4);
        let (handle, peer) = channel_pair(1, 8);
        selector.adopt_peer(handle);
        drop(peer);

        assert_eq!(
            selector.send(Bytes::from_static(b"z")),
            SendOutcome::Sent(ActiveTransport::Signaling)
        );
        assert_eq!(data(&mut remote), vec![Bytes::from_static(b"z")]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn signaling_loss_with_and_without_peer() {
        let (mut bare, _bare_channel, _bare_remote) = selector(4);
        assert_eq!(bare.on_signaling_lost(), SignalingLossOutcome::Exhausted);

        let (mut with_peer, _channel, _remote) = selector(4);
        let (handle, _peer) = channel_pair(1, 8);
        with_peer.adopt_peer(handle);
        assert_eq!(with_peer.on_signaling_lost(), SignalingLossOutcome::PeerOnly);
        assert!(matches!(with_peer.send(Bytes::from_static(b"p")), SendOutcome::Sent(_)));
        assert_eq!(with_peer.on_peer_failure(1), PeerFailureOutcome::Exhausted);
        assert_eq!(with_peer.send(Bytes::from_static(b"q")), SendOutcome::Unavailable);
    }
}
