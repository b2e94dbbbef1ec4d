pub mod peer;
pub mod signaling;

pub use peer::{PeerFrame, READY_SENTINEL};
pub use signaling::{IceCandidate, SignalingMessage};
