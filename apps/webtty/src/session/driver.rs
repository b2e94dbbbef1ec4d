use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tracing::{debug, info, trace, warn};

use super::{Command, SessionEvent, SessionState};
use crate::config::{MIN_TIMER_INTERVAL, PeerMode, SessionConfig};
use crate::error::{ConnectionError, NegotiationError, ProtocolViolation, SessionError};
use crate::negotiator::{
    BackendEvent, CandidateDisposition, NegotiationFault, PeerBackendFactory, PeerNegotiator,
};
use crate::protocol::{IceCandidate, SignalingMessage};
use crate::selector::{
    PeerFailureOutcome, RetryQueue, SendOutcome, SignalingLossOutcome, TransportSelector,
};
use crate::signaling::{SignalingChannel, SignalingConnector};
use crate::transport::{ActiveTransport, Generation, PeerChannelEvent};

/// Everything that exists once signaling is up.
struct Link {
    signaling: SignalingChannel,
    selector: TransportSelector,
    negotiator: Option<PeerNegotiator>,
    signaling_finished: bool,
    exhausted: bool,
}

/// Sole owner and mutator of the session state.
pub(super) struct SessionDriver {
    config: SessionConfig,
    connector: Box<dyn SignalingConnector>,
    factory: Box<dyn PeerBackendFactory>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
    state: SessionState,
    /// Where a failed negotiation returns to.
    resume_state: SessionState,
    next_generation: Generation,
}

impl SessionDriver {
    pub(super) fn new(
        config: SessionConfig,
        connector: Box<dyn SignalingConnector>,
        factory: Box<dyn PeerBackendFactory>,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<SessionEvent>,
        state_tx: watch::Sender<SessionState>,
    ) -> Self {
        Self {
            config,
            connector,
            factory,
            commands,
            events,
            state_tx,
            state: SessionState::Connecting,
            resume_state: SessionState::SignalingActive,
            next_generation: 1,
        }
    }

    pub(super) async fn run(mut self) {
        let mut close_ack = None;
        let Some(mut link) = self.connect(&mut close_ack).await else {
            self.set_state(SessionState::Closed);
            if let Some(ack) = close_ack {
                let _ = ack.send(());
            }
            return;
        };

        if self.config.peer_mode == PeerMode::Initiate {
            self.start_negotiation(&mut link).await;
        }

        let mut flush = interval(self.config.flush_interval.max(MIN_TIMER_INTERVAL));
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            let deadline = link.negotiator.as_ref().and_then(PeerNegotiator::deadline);
            let signaling_live = !link.signaling_finished;
            let pending_retries = link.selector.stats().queued > 0;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Input(bytes)) => self.handle_input(&mut link, bytes),
                    Some(Command::Renegotiate) => self.renegotiate(&mut link).await,
                    Some(Command::Close(ack)) => {
                        close_ack = Some(ack);
                        break "session closed";
                    }
                    None => break "session handle dropped",
                },
                message = link.signaling.recv(), if signaling_live => match message {
                    Some(message) => self.handle_signaling(&mut link, message).await,
                    None => link.signaling_finished = true,
                },
                event = next_backend_event(&mut link.negotiator) => {
                    self.handle_backend_event(&mut link, event).await;
                }
                (generation, event) = link.selector.next_peer_event() => {
                    self.handle_peer_event(&mut link, generation, event);
                }
                _ = sleep_until_deadline(deadline) => self.handle_deadline(&mut link).await,
                _ = flush.tick(), if pending_retries => {
                    link.selector.flush();
                }
            }

            if link.exhausted {
                break "transport exhausted";
            }
        };

        self.shutdown(link, reason).await;
        if let Some(ack) = close_ack {
            let _ = ack.send(());
        }
    }

    /// Open signaling while buffering early input. `None` means the session
    /// is over before it started.
    async fn connect(&mut self, close_ack: &mut Option<oneshot::Sender<()>>) -> Option<Link> {
        let mut early = RetryQueue::new(self.config.retry_queue_capacity);
        let mut connect = self.connector.connect(&self.config);

        let result = loop {
            tokio::select! {
                result = &mut connect => break result,
                command = self.commands.recv() => match command {
                    Some(Command::Input(bytes)) => {
                        early.push_back(bytes);
                    }
                    Some(Command::Renegotiate) => {
                        debug!(target: "webtty::session", "renegotiate ignored while connecting");
                    }
                    Some(Command::Close(ack)) => {
                        *close_ack = Some(ack);
                        return None;
                    }
                    None => return None,
                },
            }
        };
        drop(connect);

        let signaling = match result {
            Ok(signaling) => signaling,
            Err(err) => {
                warn!(target: "webtty::session", error = %err, "signaling connection failed");
                self.emit(SessionEvent::Error(err.into()));
                return None;
            }
        };

        if let Err(err) = signaling.send(SignalingMessage::Hello) {
            debug!(target: "webtty::session", error = %err, "hello not sent");
        }
        let mut selector = TransportSelector::new(signaling.sender(), self.config.retry_queue_capacity);
        if early.dropped() > 0 {
            warn!(target: "webtty::session", dropped = early.dropped(), "early input dropped while connecting");
        }
        for bytes in early.drain() {
            selector.send(bytes);
        }

        self.set_state(SessionState::SignalingActive);
        Some(Link {
            signaling,
            selector,
            negotiator: None,
            signaling_finished: false,
            exhausted: false,
        })
    }

    fn handle_input(&mut self, link: &mut Link, bytes: Bytes) {
        let len = bytes.len();
        match link.selector.send(bytes) {
            SendOutcome::Sent(transport) => {
                trace!(target: "webtty::session", len, %transport, "input forwarded");
            }
            SendOutcome::Queued { depth, dropped } => {
                debug!(target: "webtty::session", len, depth, dropped, "input queued");
            }
            SendOutcome::Unavailable => {
                warn!(target: "webtty::session", len, "input dropped; no transport open");
            }
        }
    }

    async fn handle_signaling(&mut self, link: &mut Link, message: SignalingMessage) {
        trace!(target: "webtty::session", kind = message.kind(), state = %self.state, "signaling message");
        match message {
            SignalingMessage::Hello => {
                debug!(target: "webtty::session", "remote hello");
            }
            SignalingMessage::Data(bytes) => {
                link.selector.accept_inbound(ActiveTransport::Signaling, bytes.len());
                self.emit(SessionEvent::Output(bytes));
            }
            SignalingMessage::Offer(sdp) => self.handle_remote_offer(link, sdp).await,
            SignalingMessage::Answer(sdp) => self.handle_remote_answer(link, sdp).await,
            SignalingMessage::Candidate(candidate) => {
                self.handle_remote_candidate(link, candidate).await;
            }
            SignalingMessage::Close(reason) => self.handle_signaling_lost(link, reason).await,
        }
    }

    async fn handle_remote_offer(&mut self, link: &mut Link, sdp: String) {
        if self.config.peer_mode == PeerMode::Disabled {
            self.report_violation(ProtocolViolation::PeerDisabled);
            return;
        }
        let reusable = link
            .negotiator
            .as_ref()
            .is_some_and(|n| !n.is_terminal());
        if !reusable && !self.replace_negotiator(link).await {
            return;
        }
        let Some(negotiator) = link.negotiator.as_mut() else {
            return;
        };
        if negotiator.is_active() {
            let violation = ProtocolViolation::UnexpectedMessage {
                message: "offer",
                state: negotiator.state().to_string(),
            };
            self.report_violation(violation);
            return;
        }

        self.enter_negotiating();
        let sender = link.signaling.sender();
        match negotiator.on_remote_offer(sdp, &sender).await {
            Ok(()) => {}
            Err(NegotiationFault::Violation(violation)) => self.report_violation(violation),
            Err(NegotiationFault::Failed(err)) => self.negotiation_failed(err),
        }
    }

    async fn handle_remote_answer(&mut self, link: &mut Link, sdp: String) {
        let Some(negotiator) = link.negotiator.as_mut() else {
            self.report_violation(ProtocolViolation::UnexpectedMessage {
                message: "answer",
                state: "no negotiation".into(),
            });
            return;
        };
        match negotiator.on_remote_answer(sdp).await {
            Ok(()) => {}
            Err(NegotiationFault::Violation(violation)) => self.report_violation(violation),
            Err(NegotiationFault::Failed(err)) => self.negotiation_failed(err),
        }
    }

    async fn handle_remote_candidate(&mut self, link: &mut Link, candidate: IceCandidate) {
        if self.config.peer_mode == PeerMode::Disabled {
            self.report_violation(ProtocolViolation::PeerDisabled);
            return;
        }
        // A spent negotiator cannot take candidates that overtake the next offer.
        let spent = link
            .negotiator
            .as_ref()
            .is_none_or(PeerNegotiator::is_terminal);
        if spent && !self.replace_negotiator(link).await {
            return;
        }
        let Some(negotiator) = link.negotiator.as_mut() else {
            return;
        };
        match negotiator.on_remote_candidate(candidate).await {
            CandidateDisposition::Applied => {}
            CandidateDisposition::Buffered => {
                trace!(target: "webtty::session", buffered = negotiator.buffered_candidates(), "remote candidate buffered");
            }
            CandidateDisposition::Ignored => {
                debug!(target: "webtty::session", ignored = negotiator.ignored_candidates(), "remote candidate ignored");
            }
        }
    }

    async fn handle_signaling_lost(&mut self, link: &mut Link, reason: String) {
        info!(target: "webtty::session", %reason, "signaling lost");
        link.signaling_finished = true;

        if let Some(negotiator) = link.negotiator.as_mut() {
            if !negotiator.is_terminal() {
                negotiator.cancel().await;
                if self.state == SessionState::Negotiating {
                    self.negotiation_failed(NegotiationError::SignalingUnavailable);
                }
            }
        }

        match link.selector.on_signaling_lost() {
            SignalingLossOutcome::PeerOnly => {
                warn!(target: "webtty::session", "signaling lost; continuing on peer channel only");
                self.emit(SessionEvent::TransportDegraded { reason });
            }
            SignalingLossOutcome::Exhausted => {
                self.emit(SessionEvent::Error(ConnectionError::Dropped(reason).into()));
                link.exhausted = true;
            }
        }
    }

    async fn handle_backend_event(&mut self, link: &mut Link, event: BackendEvent) {
        let Some(negotiator) = link.negotiator.as_mut() else {
            return;
        };
        match event {
            BackendEvent::LocalCandidate(candidate) => {
                let sender = link.signaling.sender();
                negotiator.on_local_candidate(candidate, &sender);
            }
            BackendEvent::ChannelOpen(handle) => {
                let Some(handle) = negotiator.on_channel_open(handle) else {
                    return;
                };
                link.selector.adopt_peer(handle);
                self.set_state(SessionState::PeerActive);
            }
            BackendEvent::Failed(reason) => {
                if let Some(err) = negotiator.on_backend_failure(reason).await {
                    self.negotiation_failed(err);
                }
            }
        }
    }

    fn handle_peer_event(&mut self, link: &mut Link, generation: Generation, event: PeerChannelEvent) {
        match event {
            PeerChannelEvent::Ready => {
                link.selector.on_peer_ready(generation);
            }
            PeerChannelEvent::Data(bytes) => {
                link.selector.accept_inbound(ActiveTransport::Peer(generation), bytes.len());
                self.emit(SessionEvent::Output(bytes));
            }
            PeerChannelEvent::Closed(reason) => match link.selector.on_peer_failure(generation) {
                PeerFailureOutcome::Degraded => {
                    warn!(target: "webtty::session", generation, %reason, "peer channel lost; reverted to signaling");
                    self.emit(SessionEvent::TransportDegraded { reason });
                    if self.state == SessionState::Negotiating {
                        self.resume_state = SessionState::Degraded;
                    } else {
                        self.set_state(SessionState::Degraded);
                    }
                }
                PeerFailureOutcome::Exhausted => {
                    warn!(target: "webtty::session", generation, %reason, "peer channel lost with no signaling left");
                    self.emit(SessionEvent::Error(SessionError::TransportExhausted));
                    link.exhausted = true;
                }
                PeerFailureOutcome::Ignored => {}
            },
        }
    }

    async fn handle_deadline(&mut self, link: &mut Link) {
        let Some(negotiator) = link.negotiator.as_mut() else {
            return;
        };
        if let Some(err) = negotiator.check_timeout(Instant::now()).await {
            self.negotiation_failed(err);
        }
    }

    async fn renegotiate(&mut self, link: &mut Link) {
        if !matches!(self.state, SessionState::SignalingActive | SessionState::Degraded) {
            debug!(target: "webtty::session", state = %self.state, "renegotiate ignored");
            return;
        }
        if self.config.peer_mode == PeerMode::Disabled {
            debug!(target: "webtty::session", "renegotiate ignored; peer mode disabled");
            return;
        }
        self.start_negotiation(link).await;
    }

    /// Begin a fresh initiator-side attempt.
    async fn start_negotiation(&mut self, link: &mut Link) {
        if !self.replace_negotiator(link).await {
            return;
        }
        let Some(negotiator) = link.negotiator.as_mut() else {
            return;
        };
        self.enter_negotiating();
        let sender = link.signaling.sender();
        if let Err(err) = negotiator.initiate(&sender).await {
            self.negotiation_failed(err);
        }
    }

    /// Cancel the current negotiator and install a new one with the next
    /// generation.
    async fn replace_negotiator(&mut self, link: &mut Link) -> bool {
        if let Some(mut previous) = link.negotiator.take() {
            previous.cancel().await;
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        match self.factory.create(generation) {
            Ok(backend) => {
                debug!(target: "webtty::session", generation, "negotiator created");
                link.negotiator = Some(PeerNegotiator::new(
                    generation,
                    backend,
                    self.config.negotiation_timeout,
                ));
                true
            }
            Err(err) => {
                warn!(target: "webtty::session", generation, error = %err, "peer backend unavailable");
                self.emit(SessionEvent::Error(err.into()));
                false
            }
        }
    }

    fn enter_negotiating(&mut self) {
        if matches!(self.state, SessionState::SignalingActive | SessionState::Degraded) {
            self.resume_state = self.state;
            self.set_state(SessionState::Negotiating);
        }
    }

    fn negotiation_failed(&mut self, err: NegotiationError) {
        self.emit(SessionEvent::Error(err.into()));
        if self.state == SessionState::Negotiating {
            self.set_state(self.resume_state);
        }
    }

    fn report_violation(&self, violation: ProtocolViolation) {
        warn!(target: "webtty::session", state = %self.state, error = %violation, "ignoring signaling message");
    }

    /// Negotiator, then peer channel, then signaling.
    async fn shutdown(&mut self, mut link: Link, reason: &str) {
        debug!(target: "webtty::session", %reason, "shutting down");
        if let Some(mut negotiator) = link.negotiator.take() {
            negotiator.cancel().await;
        }
        link.selector.teardown_peer();
        let stats = link.selector.stats();
        link.signaling.close(reason).await;
        info!(
            target: "webtty::session",
            %reason,
            sent_signaling = stats.sent_signaling,
            sent_peer = stats.sent_peer,
            dropped = stats.dropped,
            late_inbound = stats.late_inbound,
            "session closed"
        );
        self.set_state(SessionState::Closed);
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        info!(target: "webtty::session", from = %self.state, to = %next, "session state");
        self.state = next;
        self.state_tx.send_replace(next);
        self.emit(SessionEvent::StateChanged(next));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_backend_event(negotiator: &mut Option<PeerNegotiator>) -> BackendEvent {
    match negotiator {
        Some(negotiator) => negotiator.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
