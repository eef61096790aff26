//! Symmetric encryption layer for SDP, ICE, and data-channel payloads.
//!
//! Cipher: AES-256-GCM via the `ring` crate. Key derivation: HKDF-SHA256 from
//! the X25519 shared secret. Nonces: 96-bit, counter-based, monotonically
//! increasing per `SharedSymmetricKey` instance — mirrors the donor's
//! `SessionEncryption` (`sync/encryption.rs`), generalized from a SPAKE2+
//! shared secret to an X25519 Diffie-Hellman shared secret.

use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, NONCE_LEN};
use ring::hkdf;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::SagaError;

/// An AEAD-encrypted, base64-opaque payload as carried inside an envelope body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Counter used to construct the nonce the sealer used.
    pub counter: u64,
    /// AES-256-GCM ciphertext with its 16-byte authentication tag appended.
    pub ciphertext: Vec<u8>,
}

/// The AEAD key derived once per saga handshake attempt from the X25519
/// shared secret. Encrypts SDP offers/answers, ICE candidates, and data
/// channel messages.
pub struct SharedSymmetricKey {
    key_material: Vec<u8>,
    seal_counter: AtomicU64,
}

impl SharedSymmetricKey {
    /// Expand a raw X25519 shared secret into a 256-bit AES key via HKDF-SHA256.
    pub fn from_shared_secret(secret: &[u8]) -> Result<Self, SagaError> {
        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, b"meshline-saga-v1");
        let prk = salt.extract(secret);

        let mut key_material = vec![0u8; 32];
        prk.expand(&[b"aes-256-gcm-key"], HkdfLen(32))
            .map_err(|_| SagaError::Fatal("HKDF expand failed".into()))?
            .fill(&mut key_material)
            .map_err(|_| SagaError::Fatal("HKDF fill failed".into()))?;

        Ok(Self {
            key_material,
            seal_counter: AtomicU64::new(0),
        })
    }

    /// Encrypt a plaintext payload (UTF-8 message bytes, or a serialized SDP
    /// description / ICE candidate JSON blob).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope, SagaError> {
        let counter = self.seal_counter.fetch_add(1, Ordering::SeqCst);
        let nonce_bytes = counter_to_nonce(counter);

        let unbound_key = UnboundKey::new(&aead::AES_256_GCM, &self.key_material)
            .map_err(|_| SagaError::Fatal("failed to construct AES key".into()))?;
        let mut sealing_key = SealingKey::new(unbound_key, SingleNonce::new(nonce_bytes));

        let mut in_out = plaintext.to_vec();
        sealing_key
            .seal_in_place_append_tag(Aad::empty(), &mut in_out)
            .map_err(|_| SagaError::Fatal("encryption failed".into()))?;

        Ok(EncryptedEnvelope {
            counter,
            ciphertext: in_out,
        })
    }

    /// Decrypt an envelope from the remote peer. A validation failure here is
    /// always an error, never a silent mis-decode (spec.md §9).
    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, SagaError> {
        let nonce_bytes = counter_to_nonce(envelope.counter);

        let unbound_key = UnboundKey::new(&aead::AES_256_GCM, &self.key_material)
            .map_err(|_| SagaError::Fatal("failed to construct AES key".into()))?;
        let mut opening_key = OpeningKey::new(unbound_key, SingleNonce::new(nonce_bytes));

        let mut in_out = envelope.ciphertext.clone();
        let plaintext = opening_key
            .open_in_place(Aad::empty(), &mut in_out)
            .map_err(|_| SagaError::MalformedInput("decryption failed — invalid key or tampered data".into()))?;

        Ok(plaintext.to_vec())
    }
}

impl Drop for SharedSymmetricKey {
    fn drop(&mut self) {
        for byte in self.key_material.iter_mut() {
            *byte = 0;
        }
    }
}

/// [0, 0, 0, 0, counter_be_bytes(8)] — matches the donor's nonce layout.
fn counter_to_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..12].copy_from_slice(&counter.to_be_bytes());
    nonce
}

struct SingleNonce {
    nonce: Option<[u8; NONCE_LEN]>,
}

impl SingleNonce {
    fn new(nonce: [u8; NONCE_LEN]) -> Self {
        Self { nonce: Some(nonce) }
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        self.nonce
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SharedSymmetricKey {
        SharedSymmetricKey::from_shared_secret(b"a 32 byte shared secret exactly!").unwrap()
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let k = key();
        let envelope = k.encrypt(b"hello world").unwrap();
        assert_ne!(envelope.ciphertext, b"hello world");
        assert_eq!(k.decrypt(&envelope).unwrap(), b"hello world");
    }

    #[test]
    fn counter_increments_per_key() {
        let k = key();
        let e1 = k.encrypt(b"a").unwrap();
        let e2 = k.encrypt(b"b").unwrap();
        assert_eq!(e1.counter, 0);
        assert_eq!(e2.counter, 1);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let k = key();
        let mut envelope = k.encrypt(b"secret").unwrap();
        envelope.ciphertext[0] ^= 0xFF;
        assert!(k.decrypt(&envelope).is_err());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let a = SharedSymmetricKey::from_shared_secret(b"secret-aaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        let b = SharedSymmetricKey::from_shared_secret(b"secret-bbbbbbbbbbbbbbbbbbbbbbbbbb").unwrap();
        let envelope = a.encrypt(b"private").unwrap();
        assert!(b.decrypt(&envelope).is_err());
    }
}
