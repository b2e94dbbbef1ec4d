use std::time::Duration;

use thiserror::Error;

use crate::negotiator::NegotiationState;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("signaling endpoint {endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },
    #[error("signaling endpoint {endpoint} did not answer within {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
    #[error("signaling connection dropped: {0}")]
    Dropped(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("failed to create local description: {0}")]
    Description(String),
    #[error("failed to apply remote description: {0}")]
    RemoteDescription(String),
    #[error("peer backend error: {0}")]
    Backend(String),
    #[error("signaling channel unavailable")]
    SignalingUnavailable,
    #[error("negotiation timed out after {0:?}")]
    Timeout(Duration),
    #[error("negotiation cancelled")]
    Cancelled,
    #[error("negotiation already started (state {0})")]
    AlreadyStarted(NegotiationState),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("unexpected {message} message in state {state}")]
    UnexpectedMessage { message: &'static str, state: String },
    #[error("malformed signaling message: {0}")]
    Malformed(String),
    #[error("peer connections are disabled for this session")]
    PeerDisabled,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
    #[error("no transport remains open")]
    TransportExhausted,
    #[error("session closed")]
    Closed,
}
