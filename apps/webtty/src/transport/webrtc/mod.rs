//! Production peer backend built on `webrtc`.
//!
//! The initiator creates the `terminal` data channel before its offer; the
//! responder picks it up through `on_data_channel`. Once the channel opens,
//! the readiness sentinel is written and the handle is reported through
//! [`BackendEvent::ChannelOpen`].

mod config;

pub use config::WebRtcConfig;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::SessionConfig;
use crate::error::NegotiationError;
use crate::negotiator::{BackendEvent, PeerBackend, PeerBackendFactory};
use crate::protocol::{IceCandidate, PeerFrame, READY_SENTINEL};
use crate::transport::{Generation, PeerChannelEvent, PeerChannelHandle};

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WebRtcBackendFactory {
    config: WebRtcConfig,
}

impl WebRtcBackendFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }

    pub fn from_session_config(config: &SessionConfig) -> Self {
        Self::new(WebRtcConfig::from_session_config(config))
    }
}

impl PeerBackendFactory for WebRtcBackendFactory {
    fn create(&self, generation: Generation) -> Result<Box<dyn PeerBackend>, NegotiationError> {
        Ok(Box::new(WebRtcBackend::new(generation, self.config.clone())))
    }
}

/// Per-channel state shared with the `webrtc` callbacks.
struct ChannelSlot {
    generation: Generation,
    capacity: usize,
    backend_events: mpsc::UnboundedSender<BackendEvent>,
    channel_events: Mutex<Option<mpsc::UnboundedSender<PeerChannelEvent>>>,
    handed_out: AtomicBool,
}

impl ChannelSlot {
    fn emit(&self, event: PeerChannelEvent) {
        if let Some(tx) = self.channel_events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn is_handed_out(&self) -> bool {
        self.handed_out.load(Ordering::SeqCst)
    }
}

/// One RTCPeerConnection per negotiation attempt, created lazily.
pub struct WebRtcBackend {
    generation: Generation,
    config: WebRtcConfig,
    peer_connection: Option<Arc<RTCPeerConnection>>,
    slot: Arc<ChannelSlot>,
    events: mpsc::UnboundedReceiver<BackendEvent>,
}

impl WebRtcBackend {
    pub fn new(generation: Generation, config: WebRtcConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let slot = Arc::new(ChannelSlot {
            generation,
            capacity: config.outbound_capacity.max(1),
            backend_events: tx,
            channel_events: Mutex::new(None),
            handed_out: AtomicBool::new(false),
        });
        Self {
            generation,
            config,
            peer_connection: None,
            slot,
            events: rx,
        }
    }

    async fn peer_connection(&mut self) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        if let Some(pc) = &self.peer_connection {
            return Ok(pc.clone());
        }

        let api = APIBuilder::new().build();
        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|err| NegotiationError::Backend(format!("create peer connection: {err}")))?,
        );
        debug!(target: "webtty::webrtc", generation = self.generation, "peer connection created");

        let slot = self.slot.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let slot = slot.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!(target: "webtty::webrtc", generation = slot.generation, "candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = slot.backend_events.send(BackendEvent::LocalCandidate(init.into()));
                    }
                    Err(err) => {
                        warn!(target: "webtty::webrtc", generation = slot.generation, error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let slot = self.slot.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let slot = slot.clone();
            Box::pin(async move {
                debug!(target: "webtty::webrtc", generation = slot.generation, ?state, "peer connection state");
                if matches!(state, RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed) {
                    let reason = format!("peer connection {state}");
                    if slot.is_handed_out() {
                        slot.emit(PeerChannelEvent::Closed(reason));
                    } else {
                        let _ = slot.backend_events.send(BackendEvent::Failed(reason));
                    }
                }
            })
        }));

        self.peer_connection = Some(pc.clone());
        Ok(pc)
    }
}

#[async_trait]
impl PeerBackend for WebRtcBackend {
    async fn create_offer(&mut self) -> Result<String, NegotiationError> {
        let pc = self.peer_connection().await?;
        let init = RTCDataChannelInit {
            ordered: Some(self.config.ordered),
            max_retransmits: self.config.max_retransmits,
            ..Default::default()
        };
        let dc = pc
            .create_data_channel(&self.config.data_channel_label, Some(init))
            .await
            .map_err(|err| NegotiationError::Description(format!("create data channel: {err}")))?;
        wire_data_channel(dc, pc.clone(), self.slot.clone());

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|err| NegotiationError::Description(format!("create offer: {err}")))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|err| NegotiationError::Description(format!("set local description: {err}")))?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&mut self, sdp: String) -> Result<String, NegotiationError> {
        let pc = self.peer_connection().await?;

        let slot = self.slot.clone();
        let label = self.config.data_channel_label.clone();
        let weak_pc = Arc::downgrade(&pc);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let slot = slot.clone();
            let label = label.clone();
            let weak_pc = weak_pc.clone();
            Box::pin(async move {
                if dc.label() != label {
                    warn!(target: "webtty::webrtc", generation = slot.generation, label = dc.label(), "ignoring unexpected data channel");
                    return;
                }
                if let Some(pc) = weak_pc.upgrade() {
                    wire_data_channel(dc, pc, slot);
                }
            })
        }));

        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|err| NegotiationError::RemoteDescription(format!("invalid offer: {err}")))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|err| NegotiationError::RemoteDescription(err.to_string()))?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(|err| NegotiationError::Description(format!("create answer: {err}")))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|err| NegotiationError::Description(format!("set local description: {err}")))?;
        Ok(answer.sdp)
    }

    async fn apply_answer(&mut self, sdp: String) -> Result<(), NegotiationError> {
        let pc = self.peer_connection().await?;
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|err| NegotiationError::RemoteDescription(format!("invalid answer: {err}")))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|err| NegotiationError::RemoteDescription(err.to_string()))
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let pc = self.peer_connection().await?;
        pc.add_ice_candidate(candidate.into())
            .await
            .map_err(|err| NegotiationError::Backend(format!("add candidate: {err}")))
    }

    async fn next_event(&mut self) -> Option<BackendEvent> {
        self.events.recv().await
    }

    async fn close(&mut self) {
        let Some(pc) = self.peer_connection.take() else {
            return;
        };
        if self.slot.is_handed_out() {
            // The channel handle owns the connection now and closes it on teardown.
            return;
        }
        if let Err(err) = pc.close().await {
            debug!(target: "webtty::webrtc", generation = self.generation, error = %err, "peer connection close failed");
        }
    }
}

fn wire_data_channel(dc: Arc<RTCDataChannel>, pc: Arc<RTCPeerConnection>, slot: Arc<ChannelSlot>) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    *slot.channel_events.lock() = Some(event_tx);
    let pending_events = Arc::new(Mutex::new(Some(event_rx)));

    let message_slot = slot.clone();
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let slot = message_slot.clone();
        Box::pin(async move {
            let event = match PeerFrame::from_message(message.is_string, message.data) {
                PeerFrame::Ready => PeerChannelEvent::Ready,
                PeerFrame::Data(bytes) => PeerChannelEvent::Data(bytes),
            };
            slot.emit(event);
        })
    }));

    let close_slot = slot.clone();
    dc.on_close(Box::new(move || {
        let slot = close_slot.clone();
        Box::pin(async move {
            debug!(target: "webtty::webrtc", generation = slot.generation, "data channel closed");
            slot.emit(PeerChannelEvent::Closed("data channel closed".into()));
        })
    }));

    let weak_dc: Weak<RTCDataChannel> = Arc::downgrade(&dc);
    let weak_pc = Arc::downgrade(&pc);
    dc.on_open(Box::new(move || {
        let slot = slot.clone();
        let pending_events = pending_events.clone();
        let weak_dc = weak_dc.clone();
        let weak_pc = weak_pc.clone();
        Box::pin(async move {
            let (Some(dc), Some(pc)) = (weak_dc.upgrade(), weak_pc.upgrade()) else {
                return;
            };
            let Some(events) = pending_events.lock().take() else {
                return;
            };
            info!(target: "webtty::webrtc", generation = slot.generation, label = dc.label(), "data channel open");

            if let Err(err) = dc.send_text(READY_SENTINEL.to_string()).await {
                warn!(target: "webtty::webrtc", generation = slot.generation, error = %err, "failed to write readiness sentinel");
            }

            let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(slot.capacity);
            let writer_dc = dc.clone();
            let generation = slot.generation;
            tokio::spawn(async move {
                while let Some(bytes) = out_rx.recv().await {
                    if let Err(err) = writer_dc.send(&bytes).await {
                        debug!(target: "webtty::webrtc", generation, error = %err, "data channel write failed");
                        break;
                    }
                }
            });

            let handle = PeerChannelHandle::new(slot.generation, out_tx, events, move || {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    return;
                };
                runtime.spawn(async move {
                    let _ = dc.close().await;
                    let _ = pc.close().await;
                });
            });
            slot.handed_out.store(true, Ordering::SeqCst);
            if slot.backend_events.send(BackendEvent::ChannelOpen(handle)).is_err() {
                debug!(target: "webtty::webrtc", generation = slot.generation, "backend gone before channel open");
            }
        })
    }));
}
