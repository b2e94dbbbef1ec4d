//! Terminal session lifecycle.
//!
//! [`TerminalSession::start`] spawns a driver task that owns the signaling
//! channel, the transport selector and the current negotiator. The returned
//! [`SessionHandle`] talks to it over channels only.

mod driver;

use std::fmt;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::negotiator::PeerBackendFactory;
use crate::signaling::{SignalingConnector, WebSocketConnector};
use crate::transport::webrtc::WebRtcBackendFactory;

use driver::SessionDriver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    SignalingActive,
    Negotiating,
    PeerActive,
    Degraded,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::SignalingActive => "signaling_active",
            SessionState::Negotiating => "negotiating",
            SessionState::PeerActive => "peer_active",
            SessionState::Degraded => "degraded",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Remote terminal output, in arrival order per transport.
    Output(Bytes),
    StateChanged(SessionState),
    TransportDegraded { reason: String },
    Error(SessionError),
}

pub(crate) enum Command {
    Input(Bytes),
    Renegotiate,
    Close(oneshot::Sender<()>),
}

pub struct TerminalSession;

impl TerminalSession {
    /// Start a session over WebSocket signaling with the WebRTC peer backend.
    ///
    /// Fails only for an invalid endpoint. Must be called from within a Tokio
    /// runtime.
    pub fn start(config: SessionConfig) -> Result<SessionHandle, SessionError> {
        let factory = WebRtcBackendFactory::from_session_config(&config);
        Self::start_with(config, WebSocketConnector, factory)
    }

    pub fn start_with<C, F>(
        config: SessionConfig,
        connector: C,
        factory: F,
    ) -> Result<SessionHandle, SessionError>
    where
        C: SignalingConnector,
        F: PeerBackendFactory,
    {
        let endpoint = config.endpoint_url()?;
        debug!(target: "webtty::session", %endpoint, peer_mode = %config.peer_mode, "starting session");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

        let driver = SessionDriver::new(
            config,
            Box::new(connector),
            Box::new(factory),
            command_rx,
            event_tx,
            state_tx,
        );
        let task = tokio::spawn(driver.run());

        Ok(SessionHandle {
            input: SessionInput { commands: command_tx },
            events: event_rx,
            state: state_rx,
            driver: Some(task),
            closed: false,
        })
    }
}

/// Cloneable, non-blocking input side of a session.
#[derive(Clone)]
pub struct SessionInput {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionInput {
    pub fn send(&self, bytes: impl Into<Bytes>) -> Result<(), SessionError> {
        self.commands
            .send(Command::Input(bytes.into()))
            .map_err(|_| SessionError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

pub struct SessionHandle {
    input: SessionInput,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    state: watch::Receiver<SessionState>,
    driver: Option<JoinHandle<()>>,
    closed: bool,
}

impl SessionHandle {
    /// Forward keystrokes to the active transport. Never blocks.
    pub fn input(&self, bytes: impl Into<Bytes>) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        self.input.send(bytes)
    }

    pub fn input_sender(&self) -> SessionInput {
        self.input.clone()
    }

    /// Ask for a fresh initiator-side negotiation. Ignored unless the session
    /// is `SignalingActive` or `Degraded`.
    pub fn renegotiate(&self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        self.input
            .commands
            .send(Command::Renegotiate)
            .map_err(|_| SessionError::Closed)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Next session event; `None` once the driver has exited and every
    /// buffered event was consumed, or after [`close`](Self::close).
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.closed {
            return None;
        }
        self.events.recv().await
    }

    /// Tear down negotiator, peer channel and signaling, in that order, and
    /// wait for the driver to exit. Buffered events are discarded.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.input.commands.send(Command::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        if let Some(driver) = self.driver.take() {
            if let Err(err) = driver.await {
                debug!(target: "webtty::session", error = %err, "session driver ended abnormally");
            }
        }
        self.events.close();
        while self.events.try_recv().is_ok() {}
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &self.state())
            .field("closed", &self.closed)
            .finish()
    }
}
