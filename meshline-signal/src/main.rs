//! meshline-signal — opaque WebSocket relay for meshline call signaling.
//!
//! This server never sees plaintext SDP, ICE, or message data. It only
//! relays signed, opaque `CallEnvelope`s between peers addressed by their
//! long-lived public key. It reads only the envelope's wire-level routing
//! (who the caller says the recipient is); the envelope's signature, body
//! encryption, and freshness are verified by the recipient's `Dispatcher`,
//! never here (spec.md §1: "server-side trust" is explicitly out of scope,
//! so this relay does not attempt it).
//!
//! Wire protocol (JSON text frames):
//! - Client→Server: { "type": "join",  "public_key": "<base64>" }
//! - Client→Server: { "type": "relay", "to": "<base64>", "envelope": {...} }
//! - Server→Client: { "type": "relay", "from": "<base64>", "envelope": {...} }
//! - Server→Client: { "type": "peer_left",   "public_key": "<other>" }

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

/// CLI flags for the relay binary, grounded in the CLI-argument style used
/// throughout `Tonksthebear-trybotster/cli` (`clap::Parser` over manual
/// `std::env::args` parsing).
#[derive(Parser, Debug)]
#[command(name = "meshline-signal", about = "Opaque WebSocket relay for meshline call signaling")]
struct Args {
    /// Address to bind the WebSocket listener on.
    #[arg(long, env = "MESHLINE_SIGNAL_BIND", default_value = "0.0.0.0:8765")]
    bind: String,

    /// Max distinct identities the relay will track per ordered public-key
    /// pair. This is a 1:1 call model, so a third identity routing through
    /// an existing pair is rejected rather than silently admitted.
    #[arg(long, env = "MESHLINE_SIGNAL_MAX_CLIENTS_PER_PAIR", default_value_t = 2)]
    max_clients_per_pair: usize,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Registry of currently-connected clients by public key.
type Clients = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<String>>>>;

/// Bookkeeping of which distinct identities have been observed relaying
/// within a given ordered public-key pair, purely to enforce
/// `max_clients_per_pair` and to clean up once both sides have left.
type Pairs = Arc<RwLock<HashMap<(String, String), std::collections::HashSet<String>>>>;

#[derive(Clone)]
struct AppState {
    clients: Clients,
    pairs: Pairs,
    max_clients_per_pair: usize,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "join")]
    Join { public_key: String },
    #[serde(rename = "relay")]
    Relay { to: String, envelope: Value },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ServerMessage {
    #[serde(rename = "relay")]
    Relay { from: String, envelope: Value },
    #[serde(rename = "peer_left")]
    PeerLeft { public_key: String },
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let state = AppState {
        clients: Arc::new(RwLock::new(HashMap::new())),
        pairs: Arc::new(RwLock::new(HashMap::new())),
        max_clients_per_pair: args.max_clients_per_pair,
    };

    let app = Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    tracing::info!("meshline-signal listening on {}", args.bind);

    let listener = tokio::net::TcpListener::bind(&args.bind).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<String>();
    let mut own_public_key: Option<String> = None;

    loop {
        tokio::select! {
            Some(msg) = relay_rx.recv() => {
                if socket.send(Message::Text(msg.into())).await.is_err() {
                    break;
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        let parsed: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(e) => {
                                tracing::warn!("meshline-signal: malformed client frame: {}", e);
                                continue;
                            }
                        };

                        match parsed {
                            ClientMessage::Join { public_key } => {
                                let mut clients = state.clients.write().await;
                                if clients.contains_key(&public_key) {
                                    tracing::warn!("meshline-signal: {} re-joined, replacing prior connection", public_key);
                                }
                                clients.insert(public_key.clone(), relay_tx.clone());
                                drop(clients);

                                own_public_key = Some(public_key.clone());
                                tracing::info!("meshline-signal: {} joined", public_key);
                            }
                            ClientMessage::Relay { to, envelope } => {
                                let Some(from) = own_public_key.clone() else {
                                    tracing::warn!("meshline-signal: relay frame before join, dropping");
                                    continue;
                                };

                                let key = pair_key(&from, &to);
                                {
                                    let mut pairs = state.pairs.write().await;
                                    let members = pairs.entry(key).or_default();
                                    if !members.contains(&from) && members.len() >= state.max_clients_per_pair {
                                        tracing::warn!("meshline-signal: pair ({}, {}) full, rejecting relay from {}", from, to, from);
                                        continue;
                                    }
                                    members.insert(from.clone());
                                }

                                let clients = state.clients.read().await;
                                match clients.get(&to) {
                                    Some(tx) => {
                                        let msg = ServerMessage::Relay { from: from.clone(), envelope };
                                        if let Ok(json) = serde_json::to_string(&msg) {
                                            let _ = tx.send(json);
                                        }
                                    }
                                    None => {
                                        // Recipient offline: this is exactly the seam the push-wake
                                        // hook (SPEC_FULL.md §10 PushNotifier) plugs into. The relay
                                        // itself has no persistent mailbox (spec.md Non-goals: no
                                        // recovery of lost messages), so the envelope is dropped.
                                        tracing::info!("meshline-signal: {} offline, dropping envelope from {} (push-wake hook point)", to, from);
                                    }
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => continue,
                }
            }
        }
    }

    if let Some(public_key) = own_public_key {
        let mut clients = state.clients.write().await;
        clients.remove(&public_key);
        drop(clients);

        // Notify only identities this peer has actually exchanged envelopes
        // with (its pair partners), never every connected client — the
        // relay is untrusted and must not leak presence beyond who already
        // knows this public key (spec.md §1 Non-goals: no server-side trust).
        let mut pairs = state.pairs.write().await;
        let mut partners = std::collections::HashSet::new();
        let mut empty_pairs = Vec::new();
        for (key, members) in pairs.iter_mut() {
            if members.remove(&public_key) {
                partners.extend(members.iter().cloned());
                if members.is_empty() {
                    empty_pairs.push(key.clone());
                }
            }
        }
        for key in empty_pairs {
            pairs.remove(&key);
        }
        drop(pairs);

        let clients = state.clients.read().await;
        let notice = ServerMessage::PeerLeft { public_key: public_key.clone() };
        if let Ok(json) = serde_json::to_string(&notice) {
            for partner in &partners {
                if let Some(tx) = clients.get(partner) {
                    let _ = tx.send(json.clone());
                }
            }
        }

        tracing::info!("meshline-signal: {} left", public_key);
    }
}
