pub mod config;
pub mod error;
pub mod negotiator;
pub mod protocol;
pub mod selector;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod terminal;
pub mod transport;

pub use config::{PeerMode, SessionConfig, SessionConfigBuilder};
pub use error::{ConnectionError, NegotiationError, ProtocolViolation, SessionError};
pub use session::{SessionEvent, SessionHandle, SessionInput, SessionState, TerminalSession};
