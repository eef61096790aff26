//! The duplex coordinator (spec.md §4.2): owns one incoming and one outgoing
//! `Saga` for the same peer and projects them into a single aggregate state,
//! message stream, and `send`. Generalizes the donor's single `SyncState`
//! (one transport per session) into "two sagas racing for the same peer",
//! since this spec's asymmetric handshake (spec.md §9) has no leader
//! election and either leg may win.

use std::cmp::max;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::envelope::{CallEnvelope, EnvelopeBody, EnvelopeKind};
use crate::error::SagaError;
use crate::identity::PeerIdentity;
use crate::media::MediaProvider;
use crate::push::PushNotifier;
use crate::saga::{Direction, EntryPoint, Saga, SagaEvent, SagaHandle, SagaState};
use crate::signaling::SignalingTransport;
use crate::time::Clock;

/// Derived connection state (spec.md §3's aggregation rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Open,
    Closed,
}

/// What a `Connection` reports to its observers (spec.md §4.1.4's callback
/// set, lifted to the connection level since `onStateChanged`/`onProgress`
/// describe the aggregate, not either saga alone).
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged { from: ConnectionState, to: ConnectionState },
    Progress(u8),
    Message(String),
}

/// A peer-pair connection: one incoming saga (answers dials), one outgoing
/// saga (places dials), raced against each other (spec.md §9).
pub struct Connection {
    peer_public_key: String,
    incoming: SagaHandle,
    outgoing: SagaHandle,
    identity: Arc<PeerIdentity>,
    signaling: Arc<dyn SignalingTransport>,
    clock: Arc<dyn Clock>,
    push_notifier: Arc<dyn PushNotifier>,
    state_rx: watch::Receiver<ConnectionState>,
    opened_at_millis: std::sync::Mutex<Option<i64>>,
}

impl Connection {
    /// Construct a `Connection` and spawn both sagas (spec.md §3: "sagas are
    /// created when the Connection is created"). The returned
    /// `mpsc::UnboundedReceiver<ConnectionEvent>` is the connection's single
    /// unified event stream (state changes, progress, and messages).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer_public_key: String,
        identity: Arc<PeerIdentity>,
        media_provider: Arc<dyn MediaProvider>,
        signaling: Arc<dyn SignalingTransport>,
        clock: Arc<dyn Clock>,
        push_notifier: Arc<dyn PushNotifier>,
        config: Config,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (incoming, incoming_events) = Saga::spawn(
            Direction::Incoming,
            peer_public_key.clone(),
            identity.clone(),
            media_provider.clone(),
            signaling.clone(),
            clock.clone(),
            config.clone(),
        );
        let (outgoing, outgoing_events) = Saga::spawn(
            Direction::Outgoing,
            peer_public_key.clone(),
            identity.clone(),
            media_provider,
            signaling.clone(),
            clock.clone(),
            config,
        );

        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        spawn_aggregator(
            incoming.watch_state(),
            outgoing.watch_state(),
            incoming_events,
            outgoing_events,
            state_tx,
            events_tx,
        );

        let connection = Self {
            peer_public_key,
            incoming,
            outgoing,
            identity,
            signaling,
            clock,
            push_notifier,
            state_rx,
            opened_at_millis: std::sync::Mutex::new(None),
        };
        (connection, events_rx)
    }

    pub fn peer_public_key(&self) -> &str {
        &self.peer_public_key
    }

    pub fn incoming(&self) -> &SagaHandle {
        &self.incoming
    }

    pub fn outgoing(&self) -> &SagaHandle {
        &self.outgoing
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn opened_at_millis(&self) -> Option<i64> {
        *self.opened_at_millis.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drive both sagas from a local dial (spec.md §4.2). Best-effort wakes
    /// the peer via push before the dial goes out, since the peer may be
    /// offline (spec.md §1, SPEC_FULL §10's push-wake hook).
    pub async fn open_outgoing(&self) -> Result<(), SagaError> {
        self.push_notifier.notify_dial(&self.peer_public_key).await;
        let (incoming_result, outgoing_result) = tokio::join!(
            self.incoming.open(EntryPoint::AwaitDial),
            self.outgoing.open(EntryPoint::SendDial),
        );
        incoming_result?;
        outgoing_result?;
        self.stamp_opened_at();
        Ok(())
    }

    /// Drive both sagas when a dial for this peer already arrived before this
    /// `Connection` existed (spec.md §4.2): the incoming saga resumes from
    /// `SendOffer` (it may already be mid-flight), the outgoing saga starts a
    /// fresh dial.
    pub async fn open_incoming(&self) -> Result<(), SagaError> {
        let (incoming_result, outgoing_result) = tokio::join!(
            self.incoming.open(EntryPoint::SendOffer),
            self.outgoing.open(EntryPoint::SendDial),
        );
        incoming_result?;
        outgoing_result?;
        self.stamp_opened_at();
        Ok(())
    }

    fn stamp_opened_at(&self) {
        let mut guard = self.opened_at_millis.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_none() {
            *guard = Some(self.clock.now_millis());
        }
    }

    /// Send on whichever saga is `Connected`, incoming preferred when both
    /// are (spec.md §4.2).
    pub async fn send(&self, text: impl Into<String>) -> Result<(), SagaError> {
        let text = text.into();
        if self.incoming.current_state() == SagaState::Connected {
            self.incoming.send(text).await
        } else if self.outgoing.current_state() == SagaState::Connected {
            self.outgoing.send(text).await
        } else {
            Err(SagaError::InvalidState("no saga is connected".into()))
        }
    }

    /// Abort both sagas and best-effort notify the peer (spec.md §4.2).
    pub async fn close(&self) {
        let _ = tokio::join!(self.incoming.abort(), self.outgoing.abort());
        if let Err(e) = self.send_close_envelope().await {
            tracing::warn!("close(): failed to notify peer {}: {}", self.peer_public_key, e);
        }
    }

    async fn send_close_envelope(&self) -> Result<(), SagaError> {
        let body = EnvelopeBody {
            sender: self.identity.public_key_base64(),
            recipient: self.peer_public_key.clone(),
            timestamp_millis: 0,
            ephemeral_pub: None,
            encrypted: None,
            source: None,
        };
        let envelope = CallEnvelope::sign(&self.identity, EnvelopeKind::Close, &body, self.clock.as_ref())?;
        self.signaling.send(envelope).await.map_err(|e| SagaError::Transport(e.to_string()))
    }
}

/// `onProgress` (spec.md §4.2): `min(100, ceil(max(inState, outState) * 100 /
/// Connected))`, states ordered by their declaration order in `SagaState`.
fn progress_percent(incoming: SagaState, outgoing: SagaState) -> u8 {
    let connected_ordinal = SagaState::Connected as usize;
    let furthest = max(incoming as usize, outgoing as usize);
    let scaled = (furthest * 100).div_ceil(connected_ordinal);
    scaled.min(100) as u8
}

/// §3's aggregation rule: `Open` iff either saga is `Connected`; `Closed` iff
/// either is `Closed`; `New` iff both are `New`; else `Connecting`.
fn aggregate_state(incoming: SagaState, outgoing: SagaState) -> ConnectionState {
    if incoming == SagaState::Closed || outgoing == SagaState::Closed {
        ConnectionState::Closed
    } else if incoming == SagaState::Connected || outgoing == SagaState::Connected {
        ConnectionState::Open
    } else if incoming == SagaState::New && outgoing == SagaState::New {
        ConnectionState::New
    } else {
        ConnectionState::Connecting
    }
}

/// Spawns the background task that watches both sagas' state and drains
/// both event streams, projecting them into the connection's unified
/// `ConnectionEvent` stream. Runs independently of any `Connection` method
/// call so state changes triggered purely by timers/media events are still
/// observed (spec.md §5: callbacks fire in triggering-event order, never
/// reentrantly — each event here is handled to completion before the next).
fn spawn_aggregator(
    mut incoming_state: watch::Receiver<SagaState>,
    mut outgoing_state: watch::Receiver<SagaState>,
    mut incoming_events: mpsc::UnboundedReceiver<SagaEvent>,
    mut outgoing_events: mpsc::UnboundedReceiver<SagaEvent>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
) {
    tokio::spawn(async move {
        let mut last_state = ConnectionState::New;
        loop {
            tokio::select! {
                changed = incoming_state.changed() => {
                    if changed.is_err() { break; }
                    recompute(&incoming_state, &outgoing_state, &mut last_state, &state_tx, &events_tx);
                }
                changed = outgoing_state.changed() => {
                    if changed.is_err() { break; }
                    recompute(&incoming_state, &outgoing_state, &mut last_state, &state_tx, &events_tx);
                }
                event = incoming_events.recv() => {
                    match event {
                        Some(SagaEvent::Message(text)) => { let _ = events_tx.send(ConnectionEvent::Message(text)); }
                        Some(SagaEvent::StateChanged { .. }) => {}
                        None => break,
                    }
                }
                event = outgoing_events.recv() => {
                    match event {
                        Some(SagaEvent::Message(text)) => { let _ = events_tx.send(ConnectionEvent::Message(text)); }
                        Some(SagaEvent::StateChanged { .. }) => {}
                        None => break,
                    }
                }
            }
        }
    });
}

fn recompute(
    incoming_state: &watch::Receiver<SagaState>,
    outgoing_state: &watch::Receiver<SagaState>,
    last_state: &mut ConnectionState,
    state_tx: &watch::Sender<ConnectionState>,
    events_tx: &mpsc::UnboundedSender<ConnectionEvent>,
) {
    let incoming = *incoming_state.borrow();
    let outgoing = *outgoing_state.borrow();

    let new_state = aggregate_state(incoming, outgoing);
    if new_state != *last_state {
        let _ = state_tx.send(new_state);
        let _ = events_tx.send(ConnectionEvent::StateChanged { from: *last_state, to: new_state });
        *last_state = new_state;
    }
    let _ = events_tx.send(ConnectionEvent::Progress(progress_percent(incoming, outgoing)));
}
