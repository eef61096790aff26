//! meshline-core — end-to-end encrypted peer-to-peer message channel core.
//!
//! Establishes encrypted channels between peers identified by long-lived
//! Ed25519 signing keys. Two peers rendezvous through an untrusted signaling
//! relay, perform an authenticated X25519 Diffie-Hellman exchange, negotiate
//! a WebRTC-like media-transport session, and exchange symmetrically
//! encrypted text over a direct data channel.
//!
//! The core of the crate is the per-`(peer, direction)` handshake state
//! machine in [`saga`], the duplex coordinator in [`connection`] that owns
//! one incoming and one outgoing saga per peer, and the envelope router in
//! [`dispatch`]. [`media`] and [`signaling`] define the trait contracts for
//! the external media-transport engine and signaling transport this crate
//! depends on but does not implement.

pub mod config;
pub mod connection;
pub mod crypto;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod media;
pub mod push;
pub mod saga;
pub mod signaling;
pub mod time;

pub use config::Config;
pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use dispatch::{Dispatcher, DispatcherEvent};
pub use envelope::{CallEnvelope, EnvelopeBody, EnvelopeKind, Source};
pub use error::SagaError;
pub use identity::{EphemeralKeyPair, PeerIdentity};
pub use saga::{Direction, EntryPoint, SagaEvent, SagaHandle, SagaState};
