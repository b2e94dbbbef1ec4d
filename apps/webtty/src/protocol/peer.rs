use bytes::Bytes;

/// First text message each side writes once the data channel opens.
pub const READY_SENTINEL: &str = "__ready__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerFrame {
    Ready,
    Data(Bytes),
}

impl PeerFrame {
    pub fn from_message(is_string: bool, data: Bytes) -> Self {
        if is_string && data.as_ref() == READY_SENTINEL.as_bytes() {
            PeerFrame::Ready
        } else {
            PeerFrame::Data(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_text_sentinel_signals_readiness() {
        assert_eq!(
            PeerFrame::from_message(true, Bytes::from_static(b"__ready__")),
            PeerFrame::Ready
        );
        assert_eq!(
            PeerFrame::from_message(false, Bytes::from_static(b"__ready__")),
            PeerFrame::Data(Bytes::from_static(b"__ready__"))
        );
        assert_eq!(
            PeerFrame::from_message(true, Bytes::from_static(b"ls\n")),
            PeerFrame::Data(Bytes::from_static(b"ls\n"))
        );
    }
}
