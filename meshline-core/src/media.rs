//! The minimal WebRTC-like media provider contract (spec.md §6.2).
//!
//! The donor wires a concrete FFI peer connection (`datachannel-rs` /
//! libdatachannel) directly into `sync/webrtc.rs`'s `PcHandler`/`DcHandler`
//! pair, bridging its synchronous callbacks to async channels. The real media
//! engine is explicitly out of scope here (spec.md §1), so this module
//! generalizes that bridging pattern into a trait contract any concrete
//! engine — or, for tests, an in-memory mock — can implement. The saga only
//! ever depends on these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;

use crate::error::SagaError;

/// An SDP-like session description (spec.md §6.1's decrypted offer/answer body).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// The minimal fields of an ICE candidate that cross the wire (spec.md §4.1.6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<i32>,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "usernameFragment", skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// A candidate-pair entry from `getStats()` (spec.md §6.2), enough to detect
/// relay usage in `Connected` (spec.md §4.1.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedCandidate {
    pub candidate_type: String,
    pub address: String,
}

/// Connection readiness of a `DataChannel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// An event delivered from a `DataChannel` to its owner: either it opened, a
/// message arrived, or it was closed by the remote side.
#[derive(Debug, Clone)]
pub enum DataChannelEvent {
    Open,
    /// Non-byte payloads never reach here — the media provider is contracted
    /// to only surface byte messages (spec.md §4.1.6 classifies the non-byte
    /// case as a warn-and-drop at the adapter boundary).
    Message(Vec<u8>),
    Closed,
}

/// A bidirectional data channel. The donor's `DataChannelStream`/
/// `DataChannelSink` (futures `Stream`/`Sink` impls over an FFI callback
/// bridge) are generalized here into an explicit event channel plus a send
/// method, which is easier to drive from the saga's single-threaded actor
/// loop than polling two separate futures traits.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn ready_state(&self) -> ReadyState;
    async fn send(&self, bytes: &[u8]) -> Result<(), SagaError>;
    /// Take ownership of this channel's event stream. Called exactly once by
    /// the saga right after the channel is created or received.
    fn take_events(&self) -> mpsc::UnboundedReceiver<DataChannelEvent>;
    /// Safe-killer (spec.md §4.1.3): idempotent, suppresses but logs errors.
    async fn close(&self);
}

/// An event delivered from a `PeerConnection`: a freshly gathered local ICE
/// candidate (`None` signals "gathering complete"), or a freshly offered
/// remote data channel.
pub enum PeerConnectionEvent {
    IceCandidate(Option<IceCandidate>),
    DataChannel(Arc<dyn DataChannel>),
}

/// The peer connection contract (spec.md §6.2). One instance is owned per
/// saga at a time; `open()` re-entry tears down and replaces it wholesale
/// (spec.md §4.1.5).
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, SagaError>;
    async fn create_offer(&self) -> Result<SessionDescription, SagaError>;
    async fn create_answer(&self) -> Result<SessionDescription, SagaError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SagaError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SagaError>;
    fn remote_description(&self) -> Option<SessionDescription>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SagaError>;
    async fn get_selected_candidate(&self) -> Result<Option<SelectedCandidate>, SagaError>;
    /// Take ownership of this connection's event stream. Called exactly once
    /// right after construction.
    fn take_events(&self) -> mpsc::UnboundedReceiver<PeerConnectionEvent>;
    async fn close(&self);
}

/// A factory producing fresh `PeerConnection` instances, one per saga
/// `open()`/re-`open()` (spec.md §4.1.5: "a fresh `PeerConnection`... are
/// constructed").
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn create_peer_connection(&self) -> Result<Arc<dyn PeerConnection>, SagaError>;
}

// ---------------------------------------------------------------------------
// In-memory mock, used by the saga/connection test suites (no real ICE/SDP
// negotiation — just enough fidelity to drive the state machine and let two
// mock peer connections "discover" each other's descriptions deterministically).
// ---------------------------------------------------------------------------

struct MockChannelState {
    ready_state: ReadyState,
}

pub struct MockDataChannel {
    label: String,
    state: StdMutex<MockChannelState>,
    events_tx: mpsc::UnboundedSender<DataChannelEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<DataChannelEvent>>>,
    sent: StdMutex<Vec<Vec<u8>>>,
    /// The other end of a connected pair, wired by `MockMediaProvider::link`.
    peer: StdMutex<Option<Arc<MockDataChannel>>>,
}

impl MockDataChannel {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.into(),
            state: StdMutex::new(MockChannelState {
                ready_state: ReadyState::Connecting,
            }),
            events_tx: tx,
            events_rx: StdMutex::new(Some(rx)),
            sent: StdMutex::new(Vec::new()),
            peer: StdMutex::new(None),
        })
    }

    /// Wire two mock channels together so `send` on one delivers to the
    /// other, and mark both open.
    pub fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *a.peer.lock().unwrap() = Some(b.clone());
        *b.peer.lock().unwrap() = Some(a.clone());
        a.mark_open();
        b.mark_open();
    }

    pub fn mark_open(&self) {
        self.state.lock().unwrap().ready_state = ReadyState::Open;
        let _ = self.events_tx.send(DataChannelEvent::Open);
    }

    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ReadyState {
        self.state.lock().unwrap().ready_state
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), SagaError> {
        self.sent.lock().unwrap().push(bytes.to_vec());
        if let Some(peer) = self.peer.lock().unwrap().clone() {
            let _ = peer.events_tx.send(DataChannelEvent::Message(bytes.to_vec()));
        }
        Ok(())
    }

    fn take_events(&self) -> mpsc::UnboundedReceiver<DataChannelEvent> {
        self.events_rx
            .lock()
            .unwrap()
            .take()
            .expect("take_events called more than once")
    }

    async fn close(&self) {
        self.state.lock().unwrap().ready_state = ReadyState::Closed;
        let _ = self.events_tx.send(DataChannelEvent::Closed);
    }
}

pub struct MockPeerConnection {
    local_description: StdMutex<Option<SessionDescription>>,
    remote_description: StdMutex<Option<SessionDescription>>,
    selected_candidate: StdMutex<Option<SelectedCandidate>>,
    events_tx: mpsc::UnboundedSender<PeerConnectionEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<PeerConnectionEvent>>>,
    send_channels: StdMutex<Vec<Arc<MockDataChannel>>>,
    /// Number of times `set_remote_description` actually ran, so tests can
    /// assert a duplicate `setDescription` call is a no-op (spec.md §4.1.4).
    set_remote_description_calls: AtomicUsize,
    /// Every candidate handed to `add_ice_candidate`, in call order, so tests
    /// can assert the ICE cache drains exactly once in FIFO order (spec.md §3).
    applied_ice_candidates: StdMutex<Vec<IceCandidate>>,
}

impl MockPeerConnection {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            local_description: StdMutex::new(None),
            remote_description: StdMutex::new(None),
            selected_candidate: StdMutex::new(None),
            events_tx: tx,
            events_rx: StdMutex::new(Some(rx)),
            send_channels: StdMutex::new(Vec::new()),
            set_remote_description_calls: AtomicUsize::new(0),
            applied_ice_candidates: StdMutex::new(Vec::new()),
        })
    }

    pub fn set_remote_description_call_count(&self) -> usize {
        self.set_remote_description_calls.load(Ordering::SeqCst)
    }

    pub fn applied_ice_candidates(&self) -> Vec<IceCandidate> {
        self.applied_ice_candidates.lock().unwrap().clone()
    }

    /// Simulate stats reporting a relay-routed candidate-pair for this
    /// connection (spec.md §8 scenario 4).
    pub fn set_selected_candidate(&self, candidate: SelectedCandidate) {
        *self.selected_candidate.lock().unwrap() = Some(candidate);
    }

    /// Simulate the remote offering a data channel (`ondatachannel`).
    pub fn simulate_incoming_data_channel(&self, channel: Arc<MockDataChannel>) {
        let _ = self.events_tx.send(PeerConnectionEvent::DataChannel(channel));
    }

    pub fn simulate_ice_candidate(&self, candidate: Option<IceCandidate>) {
        let _ = self.events_tx.send(PeerConnectionEvent::IceCandidate(candidate));
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, SagaError> {
        let channel = MockDataChannel::new(label);
        self.send_channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, SagaError> {
        Ok(SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: "mock-offer-sdp".into(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, SagaError> {
        Ok(SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: "mock-answer-sdp".into(),
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SagaError> {
        *self.local_description.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SagaError> {
        self.set_remote_description_calls.fetch_add(1, Ordering::SeqCst);
        *self.remote_description.lock().unwrap() = Some(desc);
        Ok(())
    }

    fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().unwrap().clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SagaError> {
        self.applied_ice_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn get_selected_candidate(&self) -> Result<Option<SelectedCandidate>, SagaError> {
        Ok(self.selected_candidate.lock().unwrap().clone())
    }

    fn take_events(&self) -> mpsc::UnboundedReceiver<PeerConnectionEvent> {
        self.events_rx
            .lock()
            .unwrap()
            .take()
            .expect("take_events called more than once")
    }

    async fn close(&self) {
        for channel in self.send_channels.lock().unwrap().iter() {
            channel.close().await;
        }
    }
}

pub struct MockMediaProvider;

#[async_trait]
impl MediaProvider for MockMediaProvider {
    async fn create_peer_connection(&self) -> Result<Arc<dyn PeerConnection>, SagaError> {
        Ok(MockPeerConnection::new())
    }
}
