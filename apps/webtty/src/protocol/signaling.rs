use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolViolation;

/// Control message exchanged with the coordinating endpoint.
///
/// On the wire every message is a single JSON text frame of the form
/// `{"type": <tag>, "payload": <value>}`; `hello` carries no payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalingMessage {
    Hello,
    Offer(String),
    Answer(String),
    Candidate(IceCandidate),
    Data(#[serde(with = "data_payload")] Bytes),
    Close(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Hello => "hello",
            SignalingMessage::Offer(_) => "offer",
            SignalingMessage::Answer(_) => "answer",
            SignalingMessage::Candidate(_) => "candidate",
            SignalingMessage::Data(_) => "data",
            SignalingMessage::Close(_) => "close",
        }
    }

    pub fn data(bytes: impl Into<Bytes>) -> Self {
        SignalingMessage::Data(bytes.into())
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolViolation> {
        serde_json::from_str(text).map_err(|err| ProtocolViolation::Malformed(err.to_string()))
    }

    pub fn into_data(self) -> Option<Bytes> {
        match self {
            SignalingMessage::Data(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Terminal bytes travel as a JSON string when they are valid UTF-8 and as
/// `{"base64": ...}` otherwise.
mod data_payload {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Binary { base64: String },
    }

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(bytes) {
            Ok(text) => Repr::Text(text.to_owned()).serialize(serializer),
            Err(_) => Repr::Binary {
                base64: STANDARD.encode(bytes),
            }
            .serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => Ok(Bytes::from(text)),
            Repr::Binary { base64 } => STANDARD
                .decode(base64.as_bytes())
                .map(Bytes::from)
                .map_err(D::Error::custom),
        }
    }
}
