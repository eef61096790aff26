//! End-to-end tests for meshline-signal.
//!
//! Requires the relay running on localhost:8765. Start it with:
//! `cargo run` in the meshline-signal directory.
//!
//! Tests verify:
//! 1. Bidirectional envelope relay between two public keys
//! 2. Offline recipients silently drop the envelope (no persistent mailbox)
//! 3. Pair-capacity enforcement (a third identity cannot join an existing pair)
//! 4. A full dial/offer/answer/ice envelope flow
//! 5. `peer_left` is delivered only to the leaving peer's pair partners

use async_tungstenite::tokio::connect_async;
use async_tungstenite::tungstenite::Message;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{timeout, Duration};

static KEY_COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_key(prefix: &str) -> String {
    let n = KEY_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}-{}", prefix, n)
}

const SERVER_URL: &str = "ws://localhost:8765/ws";
const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = async_tungstenite::WebSocketStream<
    async_tungstenite::stream::Stream<
        async_tungstenite::tokio::TokioAdapter<tokio::net::TcpStream>,
        async_tungstenite::tokio::TokioAdapter<
            tokio_rustls::client::TlsStream<tokio::net::TcpStream>,
        >,
    >,
>;
type Rx = SplitStream<WsStream>;
type Tx = SplitSink<WsStream, Message>;

async fn recv_json(rx: &mut Rx) -> Value {
    let msg = timeout(TIMEOUT, rx.next())
        .await
        .expect("timeout waiting for message")
        .expect("stream ended")
        .expect("ws error");
    match msg {
        Message::Text(t) => serde_json::from_str(&t).expect("invalid json"),
        other => panic!("expected text, got: {:?}", other),
    }
}

async fn send_json(tx: &mut Tx, val: Value) {
    SinkExt::send(tx, Message::Text(val.to_string()))
        .await
        .unwrap();
}

async fn connect() -> (Tx, Rx) {
    let (ws, _) = connect_async(SERVER_URL).await.unwrap();
    ws.split()
}

async fn join(tx: &mut Tx, public_key: &str) {
    send_json(tx, json!({"type": "join", "public_key": public_key})).await;
}

fn fake_envelope(tag: &str) -> Value {
    json!({"kind": "dial", "body": tag, "signature": "sig"})
}

#[tokio::test]
async fn test_basic_bidirectional_relay() {
    let a = unique_key("a");
    let b = unique_key("b");
    let (mut tx_a, mut rx_a) = connect().await;
    let (mut tx_b, mut rx_b) = connect().await;

    join(&mut tx_a, &a).await;
    join(&mut tx_b, &b).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    send_json(
        &mut tx_a,
        json!({"type": "relay", "to": &b, "envelope": fake_envelope("hello")}),
    )
    .await;
    let m = recv_json(&mut rx_b).await;
    assert_eq!(m["type"], "relay");
    assert_eq!(m["from"], a);
    assert_eq!(m["envelope"]["body"], "hello");

    send_json(
        &mut tx_b,
        json!({"type": "relay", "to": &a, "envelope": fake_envelope("world")}),
    )
    .await;
    let m = recv_json(&mut rx_a).await;
    assert_eq!(m["from"], b);
    assert_eq!(m["envelope"]["body"], "world");
}

#[tokio::test]
async fn test_offline_recipient_is_silently_dropped() {
    let a = unique_key("a");
    let missing = unique_key("missing");
    let (mut tx_a, mut rx_a) = connect().await;

    join(&mut tx_a, &a).await;
    send_json(
        &mut tx_a,
        json!({"type": "relay", "to": &missing, "envelope": fake_envelope("x")}),
    )
    .await;

    // No echo, no error frame — the envelope is just dropped.
    let result = timeout(Duration::from_millis(300), rx_a.next()).await;
    assert!(result.is_err(), "sender should receive nothing back");
}

#[tokio::test]
async fn test_pair_capacity_rejects_third_identity() {
    let a = unique_key("a");
    let b = unique_key("b");
    let c = unique_key("c");
    let (mut tx_a, mut rx_a) = connect().await;
    let (mut tx_b, mut rx_b) = connect().await;
    let (mut tx_c, _rx_c) = connect().await;

    join(&mut tx_a, &a).await;
    join(&mut tx_b, &b).await;
    join(&mut tx_c, &c).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // a <-> b establishes the pair.
    send_json(
        &mut tx_a,
        json!({"type": "relay", "to": &b, "envelope": fake_envelope("1")}),
    )
    .await;
    let m = recv_json(&mut rx_b).await;
    assert_eq!(m["envelope"]["body"], "1");

    // c tries to relay into the same (a, b) pair by impersonating traffic
    // toward b while addressed from c — rejected, b hears nothing.
    send_json(
        &mut tx_c,
        json!({"type": "relay", "to": &b, "envelope": fake_envelope("intrude")}),
    )
    .await;
    let result = timeout(Duration::from_millis(300), rx_b.next()).await;
    assert!(result.is_err(), "b should not receive envelopes from a third identity");

    // a and b can still talk to each other.
    send_json(
        &mut tx_b,
        json!({"type": "relay", "to": &a, "envelope": fake_envelope("2")}),
    )
    .await;
    let m = recv_json(&mut rx_a).await;
    assert_eq!(m["envelope"]["body"], "2");
}

#[tokio::test]
async fn test_full_signaling_flow() {
    let creator = unique_key("creator");
    let joiner = unique_key("joiner");
    let (mut tx_c, mut rx_c) = connect().await;
    let (mut tx_j, mut rx_j) = connect().await;

    join(&mut tx_c, &creator).await;
    join(&mut tx_j, &joiner).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let kinds = ["dial", "offer", "ice", "ice", "ice"];
    for (i, kind) in kinds.iter().enumerate() {
        let envelope = json!({"kind": kind, "body": format!("payload-{}", i), "signature": "sig"});
        send_json(
            &mut tx_c,
            json!({"type": "relay", "to": &joiner, "envelope": envelope}),
        )
        .await;
        let m = recv_json(&mut rx_j).await;
        assert_eq!(m["envelope"]["kind"], *kind);
    }

    let answer = json!({"kind": "answer", "body": "answer-payload", "signature": "sig"});
    send_json(
        &mut tx_j,
        json!({"type": "relay", "to": &creator, "envelope": answer}),
    )
    .await;
    let m = recv_json(&mut rx_c).await;
    assert_eq!(m["envelope"]["kind"], "answer");
}

#[tokio::test]
async fn test_peer_left_notifies_only_pair_partners() {
    let a = unique_key("a");
    let b = unique_key("b");
    let bystander = unique_key("bystander");
    let (mut tx_a, mut rx_a) = connect().await;
    let (mut tx_b, rx_b) = connect().await;
    let (mut tx_bystander, mut rx_bystander) = connect().await;

    join(&mut tx_a, &a).await;
    join(&mut tx_b, &b).await;
    join(&mut tx_bystander, &bystander).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // a <-> b establishes the pair; bystander is never part of it.
    send_json(
        &mut tx_a,
        json!({"type": "relay", "to": &b, "envelope": fake_envelope("hi")}),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    drop(tx_b);
    drop(rx_b);

    let n = recv_json(&mut rx_a).await;
    assert_eq!(n["type"], "peer_left");
    assert_eq!(n["public_key"], b);

    let result = timeout(Duration::from_millis(300), rx_bystander.next()).await;
    assert!(result.is_err(), "bystander should not learn about unrelated peers leaving");
}
