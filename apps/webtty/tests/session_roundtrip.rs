use std::time::Duration;

use bytes::Bytes;
use tokio::time::sleep;
use webtty_core::config::{PeerMode, SessionConfig};
use webtty_core::error::{ConnectionError, NegotiationError, SessionError};
use webtty_core::protocol::{IceCandidate, SignalingMessage};
use webtty_core::session::{SessionEvent, SessionHandle, SessionState, TerminalSession};
use webtty_core::signaling::{PairedConnector, RemoteSignaling, WebSocketConnector};
use webtty_core::transport::mock::{MockCall, MockPeerControl, MockPeerControls, MockPeerFactory};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("webtty=debug")
        .try_init();
}

fn config(mode: PeerMode) -> SessionConfig {
    SessionConfig::builder()
        .endpoint("localhost:8080/ws")
        .peer_mode(mode)
        .build()
}

fn start(config: SessionConfig) -> (SessionHandle, RemoteSignaling, MockPeerControls) {
    let (factory, controls) = MockPeerFactory::new();
    let (handle, remote) = start_with_factory(config, factory);
    (handle, remote, controls)
}

fn start_with_factory(
    config: SessionConfig,
    factory: MockPeerFactory,
) -> (SessionHandle, RemoteSignaling) {
    init_tracing();
    let (connector, remote) = PairedConnector::new(config.signaling_capacity);
    let handle = TerminalSession::start_with(config, connector, factory).expect("session starts");
    (handle, remote)
}

async fn next(handle: &mut SessionHandle) -> SessionEvent {
    handle.next_event().await.expect("session event")
}

async fn expect_state(handle: &mut SessionHandle, state: SessionState) {
    assert_eq!(next(handle).await, SessionEvent::StateChanged(state));
}

async fn expect_output(handle: &mut SessionHandle, bytes: &'static [u8]) {
    assert_eq!(next(handle).await, SessionEvent::Output(Bytes::from_static(bytes)));
}

async fn recv(remote: &mut RemoteSignaling) -> SignalingMessage {
    remote.recv().await.expect("signaling message")
}

async fn wait_for_call(control: &MockPeerControl, call: MockCall) {
    while !control.calls().contains(&call) {
        sleep(Duration::from_millis(5)).await;
    }
}

fn candidate(value: &str) -> IceCandidate {
    IceCandidate {
        candidate: value.into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

#[test_timeout::tokio_timeout_test(10)]
async fn websocket_only_session_relays_both_directions() {
    let (mut handle, mut remote, mut controls) = start(config(PeerMode::Disabled));

    assert_eq!(recv(&mut remote).await, SignalingMessage::Hello);
    expect_state(&mut handle, SessionState::SignalingActive).await;

    handle.input(Bytes::from_static(b"ls\n")).unwrap();
    assert_eq!(recv(&mut remote).await, SignalingMessage::data("ls\n"));

    remote.send(SignalingMessage::data("file.txt\n"));
    expect_output(&mut handle, b"file.txt\n").await;

    // offers are ignored while peer mode is disabled
    remote.send(SignalingMessage::Offer("v=0".into()));
    remote.send(SignalingMessage::data("after"));
    expect_output(&mut handle, b"after").await;
    assert_eq!(handle.state(), SessionState::SignalingActive);
    assert!(controls.try_next().is_none());

    handle.close().await;
    assert_eq!(handle.state(), SessionState::Closed);
    assert_eq!(
        recv(&mut remote).await,
        SignalingMessage::Close("session closed".into())
    );
    assert!(handle.next_event().await.is_none());
    assert_eq!(handle.input(Bytes::from_static(b"x")), Err(SessionError::Closed));
}

#[test_timeout::tokio_timeout_test(10)]
async fn input_sent_before_connect_follows_hello() {
    let (handle, mut remote, _controls) = start(config(PeerMode::Disabled));
    handle.input(Bytes::from_static(b"early")).unwrap();

    assert_eq!(recv(&mut remote).await, SignalingMessage::Hello);
    assert_eq!(recv(&mut remote).await, SignalingMessage::data("early"));
}

#[test_timeout::tokio_timeout_test(10)]
async fn responder_upgrades_then_degrades_and_renegotiates() {
    let (mut handle, mut remote, mut controls) = start(config(PeerMode::Respond));
    assert_eq!(recv(&mut remote).await, SignalingMessage::Hello);
    expect_state(&mut handle, SessionState::SignalingActive).await;

    // a candidate that overtakes the offer is held until the offer lands
    let early = candidate("candidate:1 1 udp 1 10.0.0.2 5000 typ host");
    remote.send(SignalingMessage::Candidate(early.clone()));
    let control = controls.next().await.expect("backend created");
    assert_eq!(control.generation(), 1);

    remote.send(SignalingMessage::Offer("remote-offer".into()));
    expect_state(&mut handle, SessionState::Negotiating).await;
    assert_eq!(
        recv(&mut remote).await,
        SignalingMessage::Answer("mock-answer-1".into())
    );
    wait_for_call(&control, MockCall::AddCandidate(early.clone())).await;
    assert_eq!(
        control.calls(),
        vec![
            MockCall::AcceptOffer("remote-offer".into()),
            MockCall::AddCandidate(early),
        ]
    );

    let mut peer = control.open_channel();
    expect_state(&mut handle, SessionState::PeerActive).await;

    handle.input(Bytes::from_static(b"a")).unwrap();
    assert_eq!(peer.recv().await, Some(Bytes::from_static(b"a")));

    // output keeps flowing over signaling until the peer says it is ready
    remote.send(SignalingMessage::data("late"));
    expect_output(&mut handle, b"late").await;
    peer.ready();
    peer.send(Bytes::from_static(b"fast"));
    expect_output(&mut handle, b"fast").await;

    peer.close("ice failed");
    assert_eq!(
        next(&mut handle).await,
        SessionEvent::TransportDegraded {
            reason: "ice failed".into()
        }
    );
    expect_state(&mut handle, SessionState::Degraded).await;
    assert!(peer.is_torn_down());

    handle.input(Bytes::from_static(b"c")).unwrap();
    assert_eq!(recv(&mut remote).await, SignalingMessage::data("c"));

    handle.renegotiate().unwrap();
    expect_state(&mut handle, SessionState::Negotiating).await;
    assert_eq!(
        recv(&mut remote).await,
        SignalingMessage::Offer("mock-offer-2".into())
    );
    let second = controls.next().await.expect("second backend");
    assert_eq!(second.generation(), 2);
    assert_eq!(second.calls(), vec![MockCall::CreateOffer]);

    handle.close().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn candidate_ahead_of_reoffer_reaches_new_negotiator() {
    let (mut handle, mut remote, mut controls) = start(config(PeerMode::Respond));
    assert_eq!(recv(&mut remote).await, SignalingMessage::Hello);
    expect_state(&mut handle, SessionState::SignalingActive).await;

    remote.send(SignalingMessage::Offer("o1".into()));
    expect_state(&mut handle, SessionState::Negotiating).await;
    assert_eq!(
        recv(&mut remote).await,
        SignalingMessage::Answer("mock-answer-1".into())
    );
    let first = controls.next().await.expect("first backend");
    let peer = first.open_channel();
    expect_state(&mut handle, SessionState::PeerActive).await;

    peer.close("ice failed");
    assert_eq!(
        next(&mut handle).await,
        SessionEvent::TransportDegraded {
            reason: "ice failed".into()
        }
    );
    expect_state(&mut handle, SessionState::Degraded).await;

    // the remote restarts ICE and its first candidate beats the new offer
    let early = candidate("candidate:3 1 udp 1 10.0.0.4 5002 typ host");
    remote.send(SignalingMessage::Candidate(early.clone()));
    remote.send(SignalingMessage::Offer("o2".into()));

    let second = controls.next().await.expect("second backend");
    assert_eq!(second.generation(), 2);
    expect_state(&mut handle, SessionState::Negotiating).await;
    assert_eq!(
        recv(&mut remote).await,
        SignalingMessage::Answer("mock-answer-2".into())
    );
    wait_for_call(&second, MockCall::AddCandidate(early.clone())).await;
    assert_eq!(
        second.calls(),
        vec![
            MockCall::AcceptOffer("o2".into()),
            MockCall::AddCandidate(early),
        ]
    );
    assert!(first.is_closed());

    handle.close().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn zero_timer_periods_do_not_stop_the_session() {
    let mut settings = config(PeerMode::Disabled);
    settings.flush_interval = Duration::ZERO;
    settings.keepalive_interval = Duration::ZERO;
    let (mut handle, mut remote, _controls) = start(settings);

    assert_eq!(recv(&mut remote).await, SignalingMessage::Hello);
    expect_state(&mut handle, SessionState::SignalingActive).await;
    handle.input(Bytes::from_static(b"pwd\n")).unwrap();
    assert_eq!(recv(&mut remote).await, SignalingMessage::data("pwd\n"));
    remote.send(SignalingMessage::data("/root\n"));
    expect_output(&mut handle, b"/root\n").await;

    handle.close().await;
    assert_eq!(handle.state(), SessionState::Closed);
}

#[test_timeout::tokio_timeout_test(10)]
async fn offer_that_cannot_be_built_falls_back_to_signaling() {
    let (factory, mut controls) = MockPeerFactory::new();
    factory.fail_descriptions(true);
    let (mut handle, mut remote) = start_with_factory(config(PeerMode::Initiate), factory);

    assert_eq!(recv(&mut remote).await, SignalingMessage::Hello);
    expect_state(&mut handle, SessionState::SignalingActive).await;
    expect_state(&mut handle, SessionState::Negotiating).await;
    assert!(matches!(
        next(&mut handle).await,
        SessionEvent::Error(SessionError::Negotiation(NegotiationError::Description(_)))
    ));
    expect_state(&mut handle, SessionState::SignalingActive).await;

    let control = controls.next().await.expect("backend created");
    assert!(control.is_closed());
    assert_eq!(control.calls(), vec![MockCall::CreateOffer, MockCall::Close]);

    // no offer went out; the next frame is plain input
    handle.input(Bytes::from_static(b"x")).unwrap();
    assert_eq!(recv(&mut remote).await, SignalingMessage::data("x"));
    handle.close().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn answer_before_offer_is_ignored() {
    let (mut handle, mut remote, mut controls) = start(config(PeerMode::Respond));
    assert_eq!(recv(&mut remote).await, SignalingMessage::Hello);
    expect_state(&mut handle, SessionState::SignalingActive).await;

    remote.send(SignalingMessage::Candidate(candidate(
        "candidate:4 1 udp 1 10.0.0.5 5003 typ host",
    )));
    let control = controls.next().await.expect("backend created");

    remote.send(SignalingMessage::Answer("stray".into()));
    remote.send(SignalingMessage::data("still signaling"));
    expect_output(&mut handle, b"still signaling").await;
    assert_eq!(handle.state(), SessionState::SignalingActive);

    // the negotiator is still idle and takes the real offer
    remote.send(SignalingMessage::Offer("remote-offer".into()));
    expect_state(&mut handle, SessionState::Negotiating).await;
    assert_eq!(
        recv(&mut remote).await,
        SignalingMessage::Answer("mock-answer-1".into())
    );
    assert!(!control
        .calls()
        .iter()
        .any(|call| matches!(call, MockCall::ApplyAnswer(_))));
    assert!(controls.try_next().is_none());

    handle.close().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn initiator_survives_signaling_loss_until_peer_fails() {
    let (mut handle, mut remote, mut controls) = start(config(PeerMode::Initiate));
    assert_eq!(recv(&mut remote).await, SignalingMessage::Hello);
    expect_state(&mut handle, SessionState::SignalingActive).await;
    expect_state(&mut handle, SessionState::Negotiating).await;
    assert_eq!(
        recv(&mut remote).await,
        SignalingMessage::Offer("mock-offer-1".into())
    );

    let control = controls.next().await.expect("backend created");
    control.emit_local_candidate(candidate("candidate:2 1 udp 1 10.0.0.3 5001 typ host"));
    assert!(matches!(
        recv(&mut remote).await,
        SignalingMessage::Candidate(_)
    ));

    remote.send(SignalingMessage::Answer("remote-answer".into()));
    wait_for_call(&control, MockCall::ApplyAnswer("remote-answer".into())).await;
    let mut peer = control.open_channel();
    expect_state(&mut handle, SessionState::PeerActive).await;

    remote.close("relay restarted");
    assert_eq!(
        next(&mut handle).await,
        SessionEvent::TransportDegraded {
            reason: "relay restarted".into()
        }
    );
    assert_eq!(handle.state(), SessionState::PeerActive);
    assert_eq!(*handle.subscribe_state().borrow(), SessionState::PeerActive);

    handle.input(Bytes::from_static(b"still here")).unwrap();
    assert_eq!(peer.recv().await, Some(Bytes::from_static(b"still here")));

    peer.close("peer gone");
    assert_eq!(
        next(&mut handle).await,
        SessionEvent::Error(SessionError::TransportExhausted)
    );
    expect_state(&mut handle, SessionState::Closed).await;
    assert!(handle.next_event().await.is_none());
}

#[test_timeout::tokio_timeout_test(10)]
async fn signaling_loss_without_peer_closes_session() {
    let (mut handle, mut remote, _controls) = start(config(PeerMode::Respond));
    assert_eq!(recv(&mut remote).await, SignalingMessage::Hello);
    expect_state(&mut handle, SessionState::SignalingActive).await;

    remote.close("server shutdown");
    assert_eq!(
        next(&mut handle).await,
        SessionEvent::Error(SessionError::Connection(ConnectionError::Dropped(
            "server shutdown".into()
        )))
    );
    expect_state(&mut handle, SessionState::Closed).await;
    assert!(handle.next_event().await.is_none());
    assert_eq!(handle.state(), SessionState::Closed);
}

#[test_timeout::tokio_timeout_test(10)]
async fn close_tears_down_peer_before_signaling() {
    let (mut handle, mut remote, mut controls) = start(config(PeerMode::Initiate));
    assert_eq!(recv(&mut remote).await, SignalingMessage::Hello);
    assert!(matches!(recv(&mut remote).await, SignalingMessage::Offer(_)));
    let control = controls.next().await.expect("backend created");
    remote.send(SignalingMessage::Answer("remote-answer".into()));
    wait_for_call(&control, MockCall::ApplyAnswer("remote-answer".into())).await;
    let peer = control.open_channel();
    while handle.state() != SessionState::PeerActive {
        next(&mut handle).await;
    }

    handle.close().await;
    assert!(peer.is_torn_down());
    assert_eq!(
        recv(&mut remote).await,
        SignalingMessage::Close("session closed".into())
    );
    assert_eq!(handle.state(), SessionState::Closed);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn negotiation_timeout_returns_to_signaling() {
    let config = SessionConfig::builder()
        .endpoint("localhost:8080/ws")
        .peer_mode(PeerMode::Initiate)
        .negotiation_timeout(Duration::from_secs(10))
        .build();
    let (mut handle, mut remote, mut controls) = start(config);
    assert_eq!(recv(&mut remote).await, SignalingMessage::Hello);
    expect_state(&mut handle, SessionState::SignalingActive).await;
    expect_state(&mut handle, SessionState::Negotiating).await;
    let control = controls.next().await.expect("backend created");

    assert_eq!(
        next(&mut handle).await,
        SessionEvent::Error(SessionError::Negotiation(NegotiationError::Timeout(
            Duration::from_secs(10)
        )))
    );
    expect_state(&mut handle, SessionState::SignalingActive).await;
    assert!(control.is_closed());

    // signaling still carries traffic
    handle.input(Bytes::from_static(b"x")).unwrap();
    assert!(matches!(recv(&mut remote).await, SignalingMessage::Offer(_)));
    assert_eq!(recv(&mut remote).await, SignalingMessage::data("x"));
    handle.close().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn unreachable_endpoint_reports_connection_error() {
    init_tracing();
    let config = SessionConfig::builder()
        .endpoint("127.0.0.1:1/ws")
        .connect_timeout(Duration::from_secs(2))
        .build();
    let (factory, _controls) = MockPeerFactory::new();
    let mut handle =
        TerminalSession::start_with(config, WebSocketConnector, factory).expect("valid endpoint");

    match next(&mut handle).await {
        SessionEvent::Error(SessionError::Connection(
            ConnectionError::Unreachable { .. } | ConnectionError::Timeout { .. },
        )) => {}
        other => panic!("unexpected event {other:?}"),
    }
    expect_state(&mut handle, SessionState::Closed).await;
    assert!(handle.next_event().await.is_none());
}

#[test_timeout::tokio_timeout_test]
async fn invalid_endpoint_is_rejected_up_front() {
    let config = SessionConfig::builder().endpoint("ftp://example.com/ws").build();
    let (factory, _controls) = MockPeerFactory::new();
    let err = TerminalSession::start_with(config, WebSocketConnector, factory).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Connection(ConnectionError::InvalidEndpoint { .. })
    ));
}
