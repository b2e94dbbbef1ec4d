use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::SignalingChannel;
use crate::config::{MIN_TIMER_INTERVAL, SessionConfig};
use crate::error::ConnectionError;
use crate::protocol::SignalingMessage;

pub(super) async fn connect(
    url: Url,
    config: &SessionConfig,
) -> Result<SignalingChannel, ConnectionError> {
    let endpoint = url.to_string();
    debug!(target: "webtty::signaling", %endpoint, "connecting");

    let (ws_stream, _response) = match timeout(config.connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(err)) => {
            return Err(ConnectionError::Unreachable {
                endpoint,
                reason: err.to_string(),
            });
        }
        Err(_) => {
            return Err(ConnectionError::Timeout {
                endpoint,
                timeout: config.connect_timeout,
            });
        }
    };
    info!(target: "webtty::signaling", %endpoint, "websocket established");

    let (sink, stream) = ws_stream.split();
    let (out_tx, out_rx) = mpsc::channel(config.signaling_capacity.max(1));
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    let writer = tokio::spawn(run_writer(sink, out_rx, config.keepalive_interval));
    let reader = tokio::spawn(run_reader(stream, in_tx));

    Ok(SignalingChannel::from_parts(out_tx, in_rx, vec![writer, reader]))
}

async fn run_writer<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<SignalingMessage>,
    keepalive: Duration,
) where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let keepalive = keepalive.max(MIN_TIMER_INTERVAL);
    let mut ticker = interval_at(Instant::now() + keepalive, keepalive);
    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let closing = matches!(message, SignalingMessage::Close(_));
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(target: "webtty::signaling", kind = message.kind(), error = %err, "failed to encode message");
                        continue;
                    }
                };
                trace!(target: "webtty::signaling", kind = message.kind(), len = text.len(), "send");
                if let Err(err) = sink.send(Message::Text(text)).await {
                    debug!(target: "webtty::signaling", error = %err, "websocket write failed");
                    break;
                }
                if closing {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
            _ = ticker.tick() => {
                trace!(target: "webtty::signaling", "keepalive ping");
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn run_reader<S>(mut stream: S, inbound: mpsc::UnboundedSender<SignalingMessage>)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match SignalingMessage::decode(&text) {
                Ok(SignalingMessage::Close(reason)) => break reason,
                Ok(message) => {
                    trace!(target: "webtty::signaling", kind = message.kind(), "recv");
                    if inbound.send(message).is_err() {
                        return;
                    }
                }
                Err(violation) => {
                    warn!(target: "webtty::signaling", error = %violation, "dropping malformed frame");
                }
            },
            Some(Ok(Message::Binary(bytes))) => {
                if inbound.send(SignalingMessage::Data(Bytes::from(bytes))).is_err() {
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|frame| frame.reason.to_string())
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or_else(|| "remote closed".to_string());
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => break format!("read error: {err}"),
            None => break "connection ended".to_string(),
        }
    };
    debug!(target: "webtty::signaling", %reason, "signaling closed");
    let _ = inbound.send(SignalingMessage::Close(reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::sink;

    #[test_timeout::tokio_timeout_test]
    async fn zero_keepalive_still_pings_and_closes() {
        let (frames_tx, mut frames) = mpsc::unbounded_channel();
        let sink = Box::pin(sink::unfold(frames_tx, |tx, message: Message| async move {
            let _ = tx.send(message);
            Ok::<_, WsError>(tx)
        }));
        let (outbound, outbound_rx) = mpsc::channel(4);
        let writer = tokio::spawn(run_writer(sink, outbound_rx, Duration::ZERO));

        assert!(matches!(frames.recv().await, Some(Message::Ping(_))));
        drop(outbound);
        writer.await.unwrap();

        let mut last = None;
        while let Some(frame) = frames.recv().await {
            last = Some(frame);
        }
        assert!(matches!(last, Some(Message::Close(None))));
    }
}
