use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::config::{DEFAULT_DATA_CHANNEL_LABEL, DEFAULT_STUN_SERVER, SessionConfig};

/// Configuration for the WebRTC peer backend
#[derive(Clone, Debug)]
pub struct WebRtcConfig {
    /// ICE servers for connection establishment
    pub ice_servers: Vec<RTCIceServer>,
    /// Data channel label
    pub data_channel_label: String,
    /// Whether the data channel should be ordered
    pub ordered: bool,
    /// Maximum number of retransmissions; `None` keeps the channel reliable
    pub max_retransmits: Option<u16>,
    /// Depth of the per-channel writer queue
    pub outbound_capacity: usize,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_SERVER.to_string()],
                ..Default::default()
            }],
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            ordered: true,
            max_retransmits: None,
            outbound_capacity: 256,
        }
    }
}

impl WebRtcConfig {
    pub fn from_session_config(config: &SessionConfig) -> Self {
        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        Self {
            ice_servers,
            data_channel_label: config.data_channel_label.clone(),
            outbound_capacity: config.retry_queue_capacity.max(1),
            ..Default::default()
        }
    }

    /// Host candidates only (no STUN/TURN)
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ice_servers_are_grouped() {
        let session = SessionConfig::builder()
            .ice_servers(["stun:a.example:3478", "stun:b.example:3478"])
            .data_channel_label("tty")
            .build();
        let config = WebRtcConfig::from_session_config(&session);
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls.len(), 2);
        assert_eq!(config.data_channel_label, "tty");
        assert!(config.ordered);
        assert_eq!(config.max_retransmits, None);
    }

    #[test]
    fn empty_ice_list_means_host_only() {
        let session = SessionConfig::builder().ice_servers(Vec::<String>::new()).build();
        assert!(WebRtcConfig::from_session_config(&session).ice_servers.is_empty());
        assert!(WebRtcConfig::localhost().ice_servers.is_empty());
    }
}
