//! Room-based signaling relay.
//!
//! Every WebSocket joins a room (`/ws/{room}`, or `default` for `/ws`).
//! Frames from one member go verbatim to every other member of the room.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, trace, warn};
use webtty_core::protocol::SignalingMessage;

use crate::config::RelayConfig;

pub const DEFAULT_ROOM: &str = "default";

type PeerId = u64;

/// Shared room membership.
#[derive(Clone)]
pub struct RelayState {
    /// room -> (peer id -> outbound queue)
    rooms: Arc<DashMap<String, DashMap<PeerId, mpsc::UnboundedSender<Message>>>>,
    next_peer: Arc<AtomicU64>,
    echo: bool,
}

impl RelayState {
    pub fn new(echo: bool) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            next_peer: Arc::new(AtomicU64::new(1)),
            echo,
        }
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map(|peers| peers.len()).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn join(&self, room: &str, tx: mpsc::UnboundedSender<Message>) -> PeerId {
        let peer_id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let peers = self.rooms.entry(room.to_owned()).or_default();
        peers.insert(peer_id, tx);
        peer_id
    }

    fn leave(&self, room: &str, peer_id: PeerId) {
        let mut remove_room = false;
        if let Some(peers) = self.rooms.get(room) {
            peers.remove(&peer_id);
            remove_room = peers.is_empty();
        }
        if remove_room {
            self.rooms.remove_if(room, |_, peers| peers.is_empty());
        }
    }

    /// Queue `message` for every member of `room` except `from`; returns the
    /// number of recipients.
    fn broadcast_except(&self, room: &str, from: PeerId, message: &Message) -> usize {
        let Some(peers) = self.rooms.get(room) else {
            return 0;
        };
        let mut delivered = 0;
        for peer in peers.iter() {
            if *peer.key() == from {
                continue;
            }
            if peer.value().send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new(false)
    }
}

pub fn router(config: &RelayConfig, state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(default_room_handler))
        .route("/ws/:room", get(room_handler))
        .nest_service("/static", ServeDir::new(&config.static_dir))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(listener: TcpListener, config: RelayConfig) -> Result<()> {
    let state = RelayState::new(config.echo);
    serve_with(listener, config, state).await
}

pub async fn serve_with(listener: TcpListener, config: RelayConfig, state: RelayState) -> Result<()> {
    let app = router(&config, state);
    info!(
        target: "webtty_relay",
        addr = ?listener.local_addr().ok(),
        static_dir = %config.static_dir.display(),
        echo = config.echo,
        "relay listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}

async fn default_room_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, DEFAULT_ROOM.to_owned()))
}

async fn room_handler(
    ws: WebSocketUpgrade,
    Path(room): Path<String>,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, room))
}

/// What to do with one inbound frame.
#[derive(Debug, PartialEq, Eq)]
enum Relay {
    Forward,
    ForwardAndEcho,
    /// A peer's `close` message ends its own channel only.
    Drop,
}

fn classify(message: &Message, echo: bool) -> Relay {
    let data_relay = if echo {
        Relay::ForwardAndEcho
    } else {
        Relay::Forward
    };
    match message {
        Message::Binary(_) => data_relay,
        Message::Text(text) => match SignalingMessage::decode(text) {
            Ok(SignalingMessage::Close(_)) => Relay::Drop,
            Ok(SignalingMessage::Data(_)) => data_relay,
            Ok(_) => Relay::Forward,
            Err(err) => {
                debug!(target: "webtty_relay", error = %err, "forwarding undecodable frame verbatim");
                Relay::Forward
            }
        },
        _ => Relay::Drop,
    }
}

async fn handle_socket(socket: WebSocket, state: RelayState, room: String) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let peer_id = state.join(&room, tx.clone());
    info!(target: "webtty_relay", %room, peer_id, members = state.room_size(&room), "peer joined");

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        let message = match frame {
            Ok(Message::Close(frame)) => {
                debug!(target: "webtty_relay", %room, peer_id, ?frame, "peer sent close frame");
                break;
            }
            Ok(message) => message,
            Err(err) => {
                warn!(target: "webtty_relay", %room, peer_id, error = %err, "websocket read failed");
                break;
            }
        };
        match classify(&message, state.echo) {
            Relay::Drop => {
                trace!(target: "webtty_relay", %room, peer_id, "frame not relayed");
            }
            relay => {
                if relay == Relay::ForwardAndEcho {
                    let _ = tx.send(message.clone());
                }
                let delivered = state.broadcast_except(&room, peer_id, &message);
                trace!(target: "webtty_relay", %room, peer_id, delivered, "frame relayed");
            }
        }
    }

    state.leave(&room, peer_id);
    drop(tx);
    if let Err(err) = writer.await {
        debug!(target: "webtty_relay", %room, peer_id, error = %err, "writer task ended abnormally");
    }
    info!(target: "webtty_relay", %room, peer_id, "peer left");
}
