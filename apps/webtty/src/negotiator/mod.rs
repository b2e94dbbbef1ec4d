//! Offer/answer/candidate exchange that produces a [`PeerChannelHandle`].
//!
//! A [`PeerNegotiator`] covers exactly one attempt. It never retries; a new
//! attempt means a new negotiator with a new generation.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{NegotiationError, ProtocolViolation};
use crate::protocol::{IceCandidate, SignalingMessage};
use crate::signaling::SignalingSender;
use crate::transport::{Generation, PeerChannelHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferCreated,
    OfferSent,
    AnswerReceived,
    OfferReceived,
    AnswerSent,
    ChannelOpen,
    NegotiationFailed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NegotiationState::ChannelOpen | NegotiationState::NegotiationFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferCreated => "offer_created",
            NegotiationState::OfferSent => "offer_sent",
            NegotiationState::AnswerReceived => "answer_received",
            NegotiationState::OfferReceived => "offer_received",
            NegotiationState::AnswerSent => "answer_sent",
            NegotiationState::ChannelOpen => "channel_open",
            NegotiationState::NegotiationFailed => "negotiation_failed",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events a backend reports asynchronously.
#[derive(Debug)]
pub enum BackendEvent {
    LocalCandidate(IceCandidate),
    ChannelOpen(PeerChannelHandle),
    Failed(String),
}

/// The peer connection stack behind a negotiator.
#[async_trait]
pub trait PeerBackend: Send {
    async fn create_offer(&mut self) -> Result<String, NegotiationError>;

    /// Apply a remote offer and return the local answer.
    async fn accept_offer(&mut self, sdp: String) -> Result<String, NegotiationError>;

    async fn apply_answer(&mut self, sdp: String) -> Result<(), NegotiationError>;

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Must be cancel safe. `None` once the backend has no more events.
    async fn next_event(&mut self) -> Option<BackendEvent>;

    async fn close(&mut self);
}

pub trait PeerBackendFactory: Send + Sync + 'static {
    fn create(&self, generation: Generation) -> Result<Box<dyn PeerBackend>, NegotiationError>;
}

/// Why a remote negotiation message was not acted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationFault {
    /// Out-of-order message; state unchanged.
    Violation(ProtocolViolation),
    /// The attempt is over.
    Failed(NegotiationError),
}

impl From<ProtocolViolation> for NegotiationFault {
    fn from(violation: ProtocolViolation) -> Self {
        NegotiationFault::Violation(violation)
    }
}

impl From<NegotiationError> for NegotiationFault {
    fn from(error: NegotiationError) -> Self {
        NegotiationFault::Failed(error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Buffered,
    Ignored,
}

pub struct PeerNegotiator {
    generation: Generation,
    state: NegotiationState,
    backend: Option<Box<dyn PeerBackend>>,
    timeout: Duration,
    deadline: Option<Instant>,
    remote_description_applied: bool,
    pending_candidates: Vec<IceCandidate>,
    ignored_candidates: usize,
}

impl PeerNegotiator {
    pub fn new(generation: Generation, backend: Box<dyn PeerBackend>, timeout: Duration) -> Self {
        Self {
            generation,
            state: NegotiationState::Idle,
            backend: Some(backend),
            timeout,
            deadline: None,
            remote_description_applied: false,
            pending_candidates: Vec::new(),
            ignored_candidates: 0,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// In flight: left `Idle` but not yet terminal.
    pub fn is_active(&self) -> bool {
        self.state != NegotiationState::Idle && !self.is_terminal()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn buffered_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn ignored_candidates(&self) -> usize {
        self.ignored_candidates
    }

    /// Start as the offering side. Valid only in `Idle`.
    pub async fn initiate(&mut self, signaling: &SignalingSender) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::Idle {
            return Err(NegotiationError::AlreadyStarted(self.state));
        }
        self.arm_deadline();

        let created = self.backend_mut()?.create_offer().await;
        let offer = match created {
            Ok(offer) => offer,
            Err(err) => return Err(self.fail(err).await),
        };
        self.transition(NegotiationState::OfferCreated);

        if let Err(err) = signaling.send(SignalingMessage::Offer(offer)) {
            debug!(target: "webtty::negotiator", generation = self.generation, error = %err, "offer not sent");
            return Err(self.fail(NegotiationError::SignalingUnavailable).await);
        }
        self.transition(NegotiationState::OfferSent);
        Ok(())
    }

    /// Answer a remote offer. Valid only in `Idle`.
    pub async fn on_remote_offer(
        &mut self,
        sdp: String,
        signaling: &SignalingSender,
    ) -> Result<(), NegotiationFault> {
        if self.state != NegotiationState::Idle {
            return Err(self.unexpected("offer").into());
        }
        self.arm_deadline();
        self.transition(NegotiationState::OfferReceived);

        let accepted = self.backend_mut()?.accept_offer(sdp).await;
        let answer = match accepted {
            Ok(answer) => answer,
            Err(err) => return Err(self.fail(err).await.into()),
        };
        self.remote_description_applied = true;
        self.flush_candidates().await;

        if let Err(err) = signaling.send(SignalingMessage::Answer(answer)) {
            debug!(target: "webtty::negotiator", generation = self.generation, error = %err, "answer not sent");
            return Err(self.fail(NegotiationError::SignalingUnavailable).await.into());
        }
        self.transition(NegotiationState::AnswerSent);
        Ok(())
    }

    /// Apply the remote answer. Valid only in `OfferSent`; anything else is a
    /// violation that leaves the state untouched.
    pub async fn on_remote_answer(&mut self, sdp: String) -> Result<(), NegotiationFault> {
        if self.state != NegotiationState::OfferSent {
            return Err(self.unexpected("answer").into());
        }
        let applied = self.backend_mut()?.apply_answer(sdp).await;
        if let Err(err) = applied {
            return Err(self.fail(err).await.into());
        }
        self.remote_description_applied = true;
        self.transition(NegotiationState::AnswerReceived);
        self.flush_candidates().await;
        Ok(())
    }

    pub async fn on_remote_candidate(&mut self, candidate: IceCandidate) -> CandidateDisposition {
        if self.is_terminal() {
            self.ignored_candidates += 1;
            trace!(
                target: "webtty::negotiator",
                generation = self.generation,
                state = %self.state,
                ignored = self.ignored_candidates,
                "ignoring remote candidate"
            );
            return CandidateDisposition::Ignored;
        }
        if !self.remote_description_applied {
            self.pending_candidates.push(candidate);
            return CandidateDisposition::Buffered;
        }
        self.apply_candidate(candidate).await
    }

    /// Forward a locally gathered candidate; dropped once the attempt is over.
    pub fn on_local_candidate(&mut self, candidate: IceCandidate, signaling: &SignalingSender) {
        if self.is_terminal() {
            return;
        }
        if let Err(err) = signaling.send(SignalingMessage::Candidate(candidate)) {
            debug!(target: "webtty::negotiator", generation = self.generation, error = %err, "local candidate not sent");
        }
    }

    /// Accept the opened channel. Valid in `AnswerReceived` or `AnswerSent`;
    /// otherwise the handle is stale and is torn down.
    pub fn on_channel_open(&mut self, mut handle: PeerChannelHandle) -> Option<PeerChannelHandle> {
        let expected = matches!(
            self.state,
            NegotiationState::AnswerReceived | NegotiationState::AnswerSent
        );
        if !expected || handle.generation() != self.generation {
            warn!(
                target: "webtty::negotiator",
                generation = self.generation,
                handle_generation = handle.generation(),
                state = %self.state,
                "tearing down stale peer channel"
            );
            handle.teardown();
            return None;
        }
        self.transition(NegotiationState::ChannelOpen);
        self.deadline = None;
        info!(target: "webtty::negotiator", generation = self.generation, "peer channel open");
        Some(handle)
    }

    /// Backend-reported failure; `None` once the attempt is already over.
    pub async fn on_backend_failure(&mut self, reason: String) -> Option<NegotiationError> {
        if self.is_terminal() {
            debug!(target: "webtty::negotiator", generation = self.generation, %reason, "backend failure after completion");
            return None;
        }
        Some(self.fail(NegotiationError::Backend(reason)).await)
    }

    /// Fails the attempt once `now` passes the deadline. Reports at most once.
    pub async fn check_timeout(&mut self, now: Instant) -> Option<NegotiationError> {
        let deadline = self.deadline?;
        if now < deadline || self.is_terminal() {
            return None;
        }
        Some(self.fail(NegotiationError::Timeout(self.timeout)).await)
    }

    /// Abandon the attempt and release the backend.
    pub async fn cancel(&mut self) {
        if !self.is_terminal() {
            self.transition(NegotiationState::NegotiationFailed);
        }
        self.deadline = None;
        self.pending_candidates.clear();
        if let Some(mut backend) = self.backend.take() {
            backend.close().await;
        }
    }

    /// Next backend event; pends forever once the backend is gone.
    pub async fn next_event(&mut self) -> BackendEvent {
        if let Some(backend) = self.backend.as_mut() {
            if let Some(event) = backend.next_event().await {
                return event;
            }
        }
        std::future::pending().await
    }

    fn backend_mut(&mut self) -> Result<&mut Box<dyn PeerBackend>, NegotiationError> {
        self.backend.as_mut().ok_or(NegotiationError::Cancelled)
    }

    fn arm_deadline(&mut self) {
        self.deadline = Some(Instant::now() + self.timeout);
    }

    fn transition(&mut self, next: NegotiationState) {
        debug!(
            target: "webtty::negotiator",
            generation = self.generation,
            from = %self.state,
            to = %next,
            "negotiation state"
        );
        self.state = next;
    }

    fn unexpected(&self, message: &'static str) -> ProtocolViolation {
        let violation = ProtocolViolation::UnexpectedMessage {
            message,
            state: self.state.to_string(),
        };
        warn!(target: "webtty::negotiator", generation = self.generation, error = %violation, "protocol violation");
        violation
    }

    async fn fail(&mut self, error: NegotiationError) -> NegotiationError {
        warn!(target: "webtty::negotiator", generation = self.generation, state = %self.state, error = %error, "negotiation failed");
        self.transition(NegotiationState::NegotiationFailed);
        self.deadline = None;
        self.pending_candidates.clear();
        if let Some(mut backend) = self.backend.take() {
            backend.close().await;
        }
        error
    }

    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(target: "webtty::negotiator", generation = self.generation, count = pending.len(), "flushing buffered candidates");
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) -> CandidateDisposition {
        let Some(backend) = self.backend.as_mut() else {
            self.ignored_candidates += 1;
            return CandidateDisposition::Ignored;
        };
        match backend.add_remote_candidate(candidate).await {
            Ok(()) => CandidateDisposition::Applied,
            Err(err) => {
                warn!(target: "webtty::negotiator", generation = self.generation, error = %err, "remote candidate rejected");
                self.ignored_candidates += 1;
                CandidateDisposition::Ignored
            }
        }
    }
}

impl fmt::Debug for PeerNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerNegotiator")
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("deadline", &self.deadline)
            .field("buffered_candidates", &self.pending_candidates.len())
            .field("ignored_candidates", &self.ignored_candidates)
            .finish()
    }
}
