//! The untrusted signaling relay client (spec.md §6.3).
//!
//! Generalizes the donor's `SignalingClient` (`sync/signaling.rs`): instead
//! of a WebSocket room keyed by a SHA-256 pairing-code hash carrying opaque
//! SPAKE2/SDP/ICE byte blobs, peers here register under their long-lived
//! public key and exchange signed `CallEnvelope`s routed by recipient public
//! key. The relay is untrusted (spec.md §1 Non-goals: "server-side trust");
//! it only ever needs to read the envelope's plaintext `sender`/`recipient`
//! fields to route, never the encrypted SDP/ICE/message payloads inside.

use async_tungstenite::tokio::connect_async;
use async_tungstenite::tungstenite::Message;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;

use crate::envelope::{CallEnvelope, EnvelopeBody};
use crate::error::SagaError;

/// Outbound-only contract a saga uses to emit signed envelopes. Matches
/// spec.md §6.3's `dial`/`offer`/`answer`/`ice`/`close` sends, unified into
/// one method since `CallEnvelope` already carries its own `kind`.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, envelope: CallEnvelope) -> Result<(), SagaError>;
}

// ---------------------------------------------------------------------------
// Wire protocol types (match meshline-signal)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "join")]
    Join { public_key: String },
    #[serde(rename = "relay")]
    Relay { to: String, envelope: CallEnvelope },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerMessage {
    #[serde(rename = "relay")]
    Relay {
        #[allow(dead_code)]
        from: String,
        envelope: CallEnvelope,
    },
    #[serde(rename = "peer_left")]
    PeerLeft {
        #[allow(dead_code)]
        public_key: String,
    },
}

struct OutboundFrame {
    to: String,
    envelope: CallEnvelope,
}

/// A live connection to the signaling relay for one local identity.
///
/// Sending is available to every saga via a cloned `Arc`; the inbound stream
/// has a single consumer (the [`crate::dispatch::Dispatcher`]), taken once
/// with [`WsSignalingClient::take_inbound`].
pub struct WsSignalingClient {
    outbound_tx: mpsc::Sender<OutboundFrame>,
    inbound_rx: StdMutex<Option<mpsc::Receiver<CallEnvelope>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl WsSignalingClient {
    /// Connect to the relay and announce this identity's public key.
    pub async fn connect(url: &str, own_public_key_base64: &str) -> Result<Self, SagaError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| SagaError::Transport(format!("failed to connect to signaling relay: {}", e)))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let join = ClientMessage::Join {
            public_key: own_public_key_base64.to_string(),
        };
        let json = serde_json::to_string(&join).map_err(|e| SagaError::Fatal(e.to_string()))?;
        ws_write
            .send(Message::Text(json))
            .await
            .map_err(|e| SagaError::Transport(format!("failed to join signaling relay: {}", e)))?;

        tracing::info!("signaling: joined relay as {}", own_public_key_base64);

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(64);
        let (inbound_tx, inbound_rx) = mpsc::channel::<CallEnvelope>(64);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => {
                        match outbound {
                            Some(frame) => {
                                let msg = ClientMessage::Relay { to: frame.to, envelope: frame.envelope };
                                let json = match serde_json::to_string(&msg) {
                                    Ok(j) => j,
                                    Err(_) => continue,
                                };
                                if ws_write.send(Message::Text(json)).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    incoming = ws_read.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerMessage>(&text) {
                                    Ok(ServerMessage::Relay { envelope, .. }) => {
                                        if inbound_tx.send(envelope).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(ServerMessage::PeerLeft { .. }) => {}
                                    Err(e) => tracing::warn!("signaling: malformed server message: {}", e),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            _ => {}
                        }
                    }
                }
            }
        });

        Ok(Self {
            outbound_tx,
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            _task: task,
        })
    }

    /// Take ownership of the inbound envelope stream. Call exactly once.
    pub fn take_inbound(&self) -> mpsc::Receiver<CallEnvelope> {
        self.inbound_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .expect("take_inbound called more than once")
    }
}

#[async_trait]
impl SignalingTransport for WsSignalingClient {
    async fn send(&self, envelope: CallEnvelope) -> Result<(), SagaError> {
        let body_bytes = BASE64
            .decode(&envelope.body)
            .map_err(|e| SagaError::MalformedInput(format!("invalid envelope body base64: {}", e)))?;
        let body: EnvelopeBody = serde_json::from_slice(&body_bytes)
            .map_err(|e| SagaError::MalformedInput(format!("invalid envelope body: {}", e)))?;

        self.outbound_tx
            .send(OutboundFrame {
                to: body.recipient,
                envelope,
            })
            .await
            .map_err(|_| SagaError::Transport("signaling relay connection closed".into()))
    }
}

// ---------------------------------------------------------------------------
// In-memory loopback, used by the saga/connection/dispatch test suites to
// simulate two peers talking without a real relay.
// ---------------------------------------------------------------------------

pub struct LoopbackSignaling {
    outbound_tx: mpsc::UnboundedSender<CallEnvelope>,
}

#[async_trait]
impl SignalingTransport for LoopbackSignaling {
    async fn send(&self, envelope: CallEnvelope) -> Result<(), SagaError> {
        self.outbound_tx
            .send(envelope)
            .map_err(|_| SagaError::Transport("loopback signaling channel closed".into()))
    }
}

/// Build a pair of connected loopback transports: `a`'s sends arrive on
/// `b_inbound`, and `b`'s sends arrive on `a_inbound`.
pub fn loopback_pair() -> (
    Arc<LoopbackSignaling>,
    mpsc::UnboundedReceiver<CallEnvelope>,
    Arc<LoopbackSignaling>,
    mpsc::UnboundedReceiver<CallEnvelope>,
) {
    let (tx_to_b, rx_for_b) = mpsc::unbounded_channel();
    let (tx_to_a, rx_for_a) = mpsc::unbounded_channel();
    let a = Arc::new(LoopbackSignaling { outbound_tx: tx_to_b });
    let b = Arc::new(LoopbackSignaling { outbound_tx: tx_to_a });
    (a, rx_for_a, b, rx_for_b)
}
