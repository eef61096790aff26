//! The signed wire envelope exchanged through the untrusted signaling relay.
//!
//! Mirrors the donor's tagged `ClientMessage`/`ServerMessage` enums
//! (`sync/signaling.rs`) but generalized: the donor's relay only moved opaque
//! SPAKE2/SDP/ICE blobs inside a room keyed by a pairing-code hash, while here
//! every envelope carries its own sender/recipient public keys, a freshness
//! timestamp, and an Ed25519 signature so the relay never needs to be trusted.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::SagaError;
use crate::identity::{decode_verifying_key, verify_signature, PeerIdentity};
use crate::time::Clock;

/// Which of the two sagas an ICE candidate originated from. Needed so the
/// receiving dispatcher can feed it to the *other* direction's saga
/// (spec.md §4.3, §9 cross-linkage note).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Incoming,
    Outgoing,
}

/// Envelope kind, addressed by peer public key (spec.md §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Dial,
    Offer,
    Answer,
    Ice,
    Close,
}

/// The opaque, kind-specific body carried inside an envelope, before it is
/// base64-encoded into the wire field `b`. `ephemeral_pub` is absent for
/// `close`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeBody {
    pub sender: String,
    pub recipient: String,
    pub timestamp_millis: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ephemeral_pub: Option<String>,
    /// Encrypted SDP (for offer/answer) or encrypted candidate (for ice),
    /// base64 of the AEAD output. Absent for dial/close.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
}

/// A signed record with fields `a` (kind), `b` (body), `c` (signature over
/// `a || b`) — spec.md §6.1's wire format, field-named for readability the
/// way the donor names its wire types rather than literally `a`/`b`/`c`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub kind: EnvelopeKind,
    /// Base64 JSON-encoded `EnvelopeBody`.
    pub body: String,
    /// Base64 Ed25519 signature over `kind || body`.
    pub signature: String,
}

impl CallEnvelope {
    /// Build and sign an envelope. `identity` must be the sender's long-lived
    /// signing key.
    pub fn sign(identity: &PeerIdentity, kind: EnvelopeKind, body: &EnvelopeBody, clock: &dyn Clock) -> Result<Self, SagaError> {
        let mut body = body.clone();
        body.timestamp_millis = clock.now_millis();

        let body_json = serde_json::to_string(&body)
            .map_err(|e| SagaError::Fatal(format!("failed to serialize envelope body: {}", e)))?;
        let body_b64 = BASE64.encode(body_json.as_bytes());

        let message = signing_message(kind, &body_b64);
        let signature = identity.sign(&message);

        Ok(Self {
            kind,
            body: body_b64,
            signature: BASE64.encode(signature.to_bytes()),
        })
    }

    /// Verify the signature and freshness, then decode the body. `max_skew_millis`
    /// bounds how far the timestamp may lag behind `clock.now_millis()`; the
    /// library imposes no replay protection beyond this (spec.md Non-goals).
    pub fn verify_and_decode(&self, clock: &dyn Clock, max_skew_millis: i64) -> Result<(VerifyingKey, EnvelopeBody), SagaError> {
        let signature_bytes = BASE64
            .decode(&self.signature)
            .map_err(|e| SagaError::MalformedInput(format!("invalid signature base64: {}", e)))?;
        let signature_bytes: [u8; 64] = signature_bytes
            .try_into()
            .map_err(|_| SagaError::MalformedInput("signature must be 64 bytes".into()))?;
        let signature = Signature::from_bytes(&signature_bytes);

        let body_json = BASE64
            .decode(&self.body)
            .map_err(|e| SagaError::MalformedInput(format!("invalid body base64: {}", e)))?;
        let body: EnvelopeBody = serde_json::from_slice(&body_json)
            .map_err(|e| SagaError::MalformedInput(format!("invalid envelope body: {}", e)))?;

        let sender_key = decode_verifying_key(&body.sender)?;

        let message = signing_message(self.kind, &self.body);
        if !verify_signature(&sender_key, &message, &signature) {
            return Err(SagaError::MalformedInput("envelope signature verification failed".into()));
        }

        let age = clock.now_millis() - body.timestamp_millis;
        if age > max_skew_millis || age < -max_skew_millis {
            return Err(SagaError::MalformedInput(format!(
                "envelope timestamp outside freshness window: age_ms={}",
                age
            )));
        }

        Ok((sender_key, body))
    }
}

/// The bytes actually signed: `kind || body` per spec.md §6.1.
fn signing_message(kind: EnvelopeKind, body_b64: &str) -> Vec<u8> {
    let mut message = serde_json::to_vec(&kind).expect("EnvelopeKind always serializes");
    message.extend_from_slice(body_b64.as_bytes());
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemClock;

    fn body(sender: &str, recipient: &str) -> EnvelopeBody {
        EnvelopeBody {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            timestamp_millis: 0,
            ephemeral_pub: Some("ZXBoZW1lcmFsLXB1Yg==".into()),
            encrypted: None,
            source: None,
        }
    }

    #[test]
    fn sign_and_verify_round_trips() {
        let identity = PeerIdentity::generate();
        let clock = SystemClock;
        let body = body(&identity.public_key_base64(), "recipient-key");

        let envelope = CallEnvelope::sign(&identity, EnvelopeKind::Dial, &body, &clock).unwrap();
        let (verified_key, decoded) = envelope.verify_and_decode(&clock, 60_000).unwrap();

        assert_eq!(verified_key, identity.verifying_key());
        assert_eq!(decoded.recipient, "recipient-key");
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let identity = PeerIdentity::generate();
        let clock = SystemClock;
        let body = body(&identity.public_key_base64(), "recipient-key");

        let mut envelope = CallEnvelope::sign(&identity, EnvelopeKind::Dial, &body, &clock).unwrap();
        envelope.body = BASE64.encode(b"{\"sender\":\"tampered\"}");

        assert!(envelope.verify_and_decode(&clock, 60_000).is_err());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        use crate::time::MockClock;

        let identity = PeerIdentity::generate();
        let clock = MockClock::new(0);
        let body = body(&identity.public_key_base64(), "recipient-key");
        let envelope = CallEnvelope::sign(&identity, EnvelopeKind::Dial, &body, &clock).unwrap();

        clock.advance_millis(120_000);
        assert!(envelope.verify_and_decode(&clock, 60_000).is_err());
    }

    #[test]
    fn malformed_body_base64_is_rejected() {
        let envelope = CallEnvelope {
            kind: EnvelopeKind::Close,
            body: "not base64!!".into(),
            signature: BASE64.encode([0u8; 64]),
        };
        assert!(envelope.verify_and_decode(&SystemClock, 60_000).is_err());
    }
}
