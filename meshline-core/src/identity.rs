//! Long-lived signing identity and per-saga ephemeral key agreement.
//!
//! `PeerIdentity` is the long-lived Ed25519 pair that addresses a user and
//! signs outgoing envelopes. `EphemeralKeyPair` is generated fresh at saga
//! construction (and again on every `open()` re-entry) and is used solely to
//! derive a `SharedSymmetricKey` with the remote peer's ephemeral public key.
//!
//! We back the ephemeral pair with `x25519_dalek::StaticSecret` rather than
//! `EphemeralSecret`: the pair is generated once at saga construction and is
//! *retained* across `open()` re-entry (spec.md §4.1.5), and `setEncryption`
//! (spec.md §4.1.4) permits being called more than once against it with
//! "last call wins" semantics. Both require deriving the shared secret more
//! than once from the same local secret, which `EphemeralSecret::diffie_hellman`
//! cannot do since it consumes `self` by design. It earns the name "ephemeral"
//! from the protocol's perspective (one per saga, not one per process), not
//! from the key type (see DESIGN.md).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::crypto::SharedSymmetricKey;
use crate::error::SagaError;

/// A long-lived Ed25519 signing identity. The verifying key, base64-encoded,
/// is the addressable identity used throughout the rest of this crate.
pub struct PeerIdentity {
    signing_key: SigningKey,
}

impl PeerIdentity {
    /// Generate a fresh identity. Key generation UX (persistence, recovery,
    /// import) is out of scope for this crate (spec.md §1).
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Reconstruct an identity from previously generated key material.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// The addressable, base64-printable public key.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Sign a message (the envelope's `kind || body` per spec.md §6.1).
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

/// Decode a base64 Ed25519 verifying key as used on the wire.
pub fn decode_verifying_key(public_key_base64: &str) -> Result<VerifyingKey, SagaError> {
    let bytes = BASE64
        .decode(public_key_base64)
        .map_err(|e| SagaError::MalformedInput(format!("invalid public key base64: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SagaError::MalformedInput("public key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| SagaError::MalformedInput(format!("invalid verifying key: {}", e)))
}

/// Verify a signature over `message` against a sender's public key.
pub fn verify_signature(verifying_key: &VerifyingKey, message: &[u8], signature: &Signature) -> bool {
    verifying_key.verify(message, signature).is_ok()
}

/// Per-saga ephemeral X25519 key pair, used once per handshake attempt to
/// derive a `SharedSymmetricKey` with the peer's ephemeral public key.
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a fresh ephemeral pair. Called once at saga construction and
    /// retained across `open()` re-entry (spec.md §4.1.5).
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Derive the shared symmetric key from this pair's secret and the
    /// remote peer's base64-encoded ephemeral public key.
    pub fn derive_shared(&self, remote_public_key_base64: &str) -> Result<SharedSymmetricKey, SagaError> {
        let remote_bytes = BASE64.decode(remote_public_key_base64).map_err(|e| {
            SagaError::MalformedInput(format!("invalid ephemeral public key base64: {}", e))
        })?;
        let remote_bytes: [u8; 32] = remote_bytes
            .try_into()
            .map_err(|_| SagaError::MalformedInput("ephemeral public key must be 32 bytes".into()))?;
        let remote_public = X25519PublicKey::from(remote_bytes);
        let shared_secret = self.secret.diffie_hellman(&remote_public);
        SharedSymmetricKey::from_shared_secret(shared_secret.as_bytes())
    }
}
