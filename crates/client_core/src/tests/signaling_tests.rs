use super::*;
use crate::test_support::{FakeConnector, FakePeer};
use shared::{
    domain::Credential,
    protocol::{IceCandidate, SessionDescription},
};
use std::time::Duration;

fn session() -> Session {
    Session::new(Credential::new("tok"), "alice")
}

fn endpoints() -> RealtimeEndpoints {
    RealtimeEndpoints::new("https://chat.local").expect("endpoints")
}

async fn next_peer(peers: &mut mpsc::UnboundedReceiver<FakePeer>) -> FakePeer {
    tokio::time::timeout(Duration::from_secs(5), peers.recv())
        .await
        .expect("peer in time")
        .expect("peer")
}

async fn next_notice(rx: &mut mpsc::UnboundedReceiver<SignalNotice>) -> SignalNotice {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("notice in time")
        .expect("notice")
}

#[tokio::test]
async fn joins_room_then_flushes_queued_messages() {
    let (connector, mut peers) = FakeConnector::new(true);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let room = RoomId::for_pair("alice", "bob");
    let client = SignalingClient::join(&session(), &endpoints(), room.clone(), connector, tx);
    client.send(SignalingMessage::Hangup).expect("queued");

    let mut peer = next_peer(&mut peers).await;
    assert_eq!(
        peer.url.as_str(),
        "wss://chat.local/api/ws/calls/alice__bob?token=tok"
    );
    assert_eq!(peer.next_frame().await.as_deref(), Some(r#"{"type":"join"}"#));
    assert_eq!(peer.next_frame().await.as_deref(), Some(r#"{"type":"hangup"}"#));
    assert_eq!(next_notice(&mut rx).await, SignalNotice::Opened);
    assert_eq!(client.room(), &room);
}

#[tokio::test]
async fn relays_inbound_signals_and_drops_garbage() {
    let (connector, mut peers) = FakeConnector::new(true);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _client = SignalingClient::join(
        &session(),
        &endpoints(),
        RoomId::for_pair("alice", "bob"),
        connector,
        tx,
    );
    let peer = next_peer(&mut peers).await;
    assert_eq!(next_notice(&mut rx).await, SignalNotice::Opened);

    peer.push("{oops");
    peer.push(r#"{"type":"offer","sdp":{"type":"offer","sdp":"v=0"}}"#);
    peer.push(r#"{"type":"ice","candidate":{"candidate":"cand-1","sdpMid":"0","sdpMLineIndex":0}}"#);

    assert_eq!(
        next_notice(&mut rx).await,
        SignalNotice::Message(SignalingMessage::Offer {
            sdp: SessionDescription::offer("v=0")
        })
    );
    assert_eq!(
        next_notice(&mut rx).await,
        SignalNotice::Message(SignalingMessage::IceCandidate {
            candidate: IceCandidate {
                candidate: "cand-1".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }
        })
    );
}

#[tokio::test]
async fn peer_close_is_reported_once() {
    let (connector, mut peers) = FakeConnector::new(true);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _client = SignalingClient::join(
        &session(),
        &endpoints(),
        RoomId::for_pair("alice", "bob"),
        connector,
        tx,
    );
    let peer = next_peer(&mut peers).await;
    assert_eq!(next_notice(&mut rx).await, SignalNotice::Opened);

    drop(peer);
    assert_eq!(next_notice(&mut rx).await, SignalNotice::Closed);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn failed_connect_reports_closed_without_retrying() {
    let (connector, _peers) = FakeConnector::new(false);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _client = SignalingClient::join(
        &session(),
        &endpoints(),
        RoomId::for_pair("alice", "bob"),
        Arc::clone(&connector) as Arc<dyn WireConnector>,
        tx,
    );

    assert_eq!(next_notice(&mut rx).await, SignalNotice::Closed);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.attempt_count(), 1);
}

#[tokio::test]
async fn shutdown_flushes_hangup_before_closing() {
    let (connector, mut peers) = FakeConnector::new(true);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = SignalingClient::join(
        &session(),
        &endpoints(),
        RoomId::for_pair("alice", "bob"),
        connector,
        tx,
    );
    let mut peer = next_peer(&mut peers).await;
    assert_eq!(next_notice(&mut rx).await, SignalNotice::Opened);
    assert_eq!(peer.next_frame().await.as_deref(), Some(r#"{"type":"join"}"#));

    client.send(SignalingMessage::Hangup).expect("send");
    client.shutdown().await;

    assert_eq!(peer.next_frame().await.as_deref(), Some(r#"{"type":"hangup"}"#));
    assert_eq!(peer.next_frame().await, None);
}
