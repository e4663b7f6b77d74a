// Signature & Rate Gate, verification half (spec §4.1). Grounded in the
// teacher's `verify_sig`: decode, length-check, reconstruct the signed bytes,
// verify. The difference from the teacher is the signed message shape (§6.2):
// `ASCII-decimal(timestamp) ∥ raw_data_bytes`, not a protobuf encoding with
// the signature field zeroed.

use crate::error::GateError;
use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::Deserialize;
use serde_json::value::RawValue;

/// The wire shape of `/v1/mesh/ingest`'s body (spec §6.1/§6.2). `data` is
/// kept as a `RawValue` so `data_bytes()` returns the exact received byte
/// span of the field — re-serializing a parsed `serde_json::Value` would not
/// reproduce the original bytes (key order, whitespace, number formatting),
/// and §6.2 requires signing/verifying over exactly what was received.
#[derive(Debug, Deserialize)]
pub struct EnvelopeWire {
    pub data: Box<RawValue>,
    pub public_key: String,
    pub signature: String,
    pub timestamp: i64,
}

impl EnvelopeWire {
    pub fn data_bytes(&self) -> &[u8] {
        self.data.get().as_bytes()
    }
}

pub struct VerifiedEnvelope {
    pub data_bytes: Vec<u8>,
    pub public_key: [u8; 32],
}

/// Freshness window from spec §4.1 step 3 / §6.2.
const TIMESTAMP_WINDOW_SECS: i64 = 300;

/// Verify the request body against the rules of §4.1 steps 1-4.
pub fn verify_envelope(envelope: &EnvelopeWire, now: i64) -> Result<VerifiedEnvelope, GateError> {
    let data_bytes = envelope.data_bytes();
    let public_key_bytes = STANDARD
        .decode(&envelope.public_key)
        .map_err(|_| GateError::InvalidPublicKey)?;
    let public_key: [u8; 32] = public_key_bytes
        .try_into()
        .map_err(|_| GateError::InvalidPublicKey)?;

    let signature_bytes = STANDARD
        .decode(&envelope.signature)
        .map_err(|_| GateError::InvalidSignature)?;
    let signature_bytes: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|_| GateError::InvalidSignature)?;

    if (now - envelope.timestamp).abs() > TIMESTAMP_WINDOW_SECS {
        return Err(GateError::ExpiredTimestamp);
    }

    let verifying_key =
        VerifyingKey::from_bytes(&public_key).map_err(|_| GateError::InvalidPublicKey)?;
    let signature = Signature::from_bytes(&signature_bytes);

    let mut signed_message = envelope.timestamp.to_string().into_bytes();
    signed_message.extend_from_slice(data_bytes);

    verifying_key
        .verify(&signed_message, &signature)
        .map_err(|_| GateError::InvalidSignature)?;

    Ok(VerifiedEnvelope {
        data_bytes: data_bytes.to_vec(),
        public_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    fn sign(sk: &SigningKey, timestamp: i64, data: &[u8]) -> String {
        let mut msg = timestamp.to_string().into_bytes();
        msg.extend_from_slice(data);
        STANDARD.encode(sk.sign(&msg).to_bytes())
    }

    fn raw(data: &str) -> Box<RawValue> {
        RawValue::from_string(data.to_string()).unwrap()
    }

    #[test]
    fn roundtrip_passes() {
        let sk = SigningKey::generate(&mut OsRng);
        let vk = sk.verifying_key();
        let now = 1_700_000_000i64;
        let data = r#"{"host":"1.2.3.4","port":22}"#;
        let envelope = EnvelopeWire {
            data: raw(data),
            public_key: STANDARD.encode(vk.to_bytes()),
            signature: sign(&sk, now, data.as_bytes()),
            timestamp: now,
        };
        assert!(verify_envelope(&envelope, now).is_ok());
    }

    #[test]
    fn tampered_data_fails() {
        let sk = SigningKey::generate(&mut OsRng);
        let vk = sk.verifying_key();
        let now = 1_700_000_000i64;
        let signed_data = r#"{"host":"1.2.3.4","port":22}"#;
        let envelope = EnvelopeWire {
            data: raw(r#"{"host":"1.2.3.4","port":23}"#),
            public_key: STANDARD.encode(vk.to_bytes()),
            signature: sign(&sk, now, signed_data.as_bytes()),
            timestamp: now,
        };
        assert!(verify_envelope(&envelope, now).is_err());
    }

    #[test]
    fn expired_timestamp_rejected_regardless_of_signature() {
        let sk = SigningKey::generate(&mut OsRng);
        let vk = sk.verifying_key();
        let old = 1_700_000_000i64;
        let now = old + 600;
        let data = r#"{"host":"1.2.3.4","port":22}"#;
        let envelope = EnvelopeWire {
            data: raw(data),
            public_key: STANDARD.encode(vk.to_bytes()),
            signature: sign(&sk, old, data.as_bytes()),
            timestamp: old,
        };
        let err = verify_envelope(&envelope, now).unwrap_err();
        assert!(matches!(err, GateError::ExpiredTimestamp));
    }

    #[test]
    fn bad_public_key_length_rejected() {
        let envelope = EnvelopeWire {
            data: raw("{}"),
            public_key: STANDARD.encode([0u8; 16]),
            signature: STANDARD.encode([0u8; 64]),
            timestamp: 1_700_000_000,
        };
        let err = verify_envelope(&envelope, 1_700_000_000).unwrap_err();
        assert!(matches!(err, GateError::InvalidPublicKey));
    }

    #[test]
    fn bad_signature_length_rejected() {
        let envelope = EnvelopeWire {
            data: raw("{}"),
            public_key: STANDARD.encode([0u8; 32]),
            signature: STANDARD.encode([0u8; 10]),
            timestamp: 1_700_000_000,
        };
        let err = verify_envelope(&envelope, 1_700_000_000).unwrap_err();
        assert!(matches!(err, GateError::InvalidSignature));
    }
}
