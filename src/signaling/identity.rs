//! Ed25519 Envelope-Signierung
//!
//! Jeder ausgehende Frame trägt einen Zeitstempel und eine Signatur über
//! das kanonische JSON (alphabetisch sortierte Keys, ohne `signature`).
//! Der Relay-Server kann damit `from` an einen registrierten Key binden.
//!
//! ## Verwendung
//! ```rust
//! use ringwire::signaling::EnvelopeSigner;
//!
//! let signer = EnvelopeSigner::generate();
//! let frame = serde_json::json!({ "event": "callEnded", "from": "alice" });
//! let signature = signer.sign_frame(&frame);
//! assert!(EnvelopeSigner::verify_frame(&signer.public_key_base64(), &frame, &signature).is_ok());
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Failed to decode key material: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid signature")]
    InvalidSignature,
}

// ============================================================================
// ENVELOPE SIGNER
// ============================================================================

/// Signiert ausgehende Relay-Frames
#[derive(Clone)]
pub struct EnvelopeSigner {
    signing_key: SigningKey,
}

impl EnvelopeSigner {
    /// Generiert einen neuen zufälligen Schlüssel (nur für diese Sitzung)
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    /// Lädt den Schlüssel aus einem Base64-kodierten 32-Byte Seed
    pub fn from_seed_base64(seed: &str) -> Result<Self, IdentityError> {
        let key_bytes = decode_32(seed)?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    /// Gibt den Public Key als Base64-encoded String zurück
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key().to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Signiert einen Frame und gibt die Signatur als Base64 zurück
    pub fn sign_frame(&self, frame: &Value) -> String {
        let signature: Signature = self.signing_key.sign(&canonical_bytes(frame));
        BASE64.encode(signature.to_bytes())
    }

    /// Prüft die Signatur eines Frames gegen einen Base64 Public Key
    pub fn verify_frame(
        public_key: &str,
        frame: &Value,
        signature: &str,
    ) -> Result<(), IdentityError> {
        let key_bytes = decode_32(public_key)?;
        let key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| IdentityError::InvalidPublicKey)?;

        let sig_bytes: [u8; 64] = BASE64
            .decode(signature)?
            .try_into()
            .map_err(|_| IdentityError::InvalidSignature)?;
        let signature = Signature::from_bytes(&sig_bytes);

        key.verify(&canonical_bytes(frame), &signature)
            .map_err(|_| IdentityError::InvalidSignature)
    }
}

impl std::fmt::Debug for EnvelopeSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeSigner")
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

fn decode_32(encoded: &str) -> Result<[u8; 32], IdentityError> {
    let bytes = BASE64.decode(encoded.trim())?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| IdentityError::InvalidKeyLength(len))
}

/// Kanonisches JSON: Keys sortiert, `signature` auf oberster Ebene entfernt
fn canonical_bytes(frame: &Value) -> Vec<u8> {
    let mut value = sort_keys(frame);
    if let Some(obj) = value.as_object_mut() {
        obj.remove("signature");
    }
    serde_json::to_vec(&value).unwrap_or_default()
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), sort_keys(v));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_length() {
        let signer = EnvelopeSigner::generate();
        // 32 bytes = 44 Zeichen Base64
        assert_eq!(signer.public_key_base64().len(), 44);
    }

    #[test]
    fn test_sign_and_verify_frame() {
        let signer = EnvelopeSigner::generate();
        let frame = serde_json::json!({
            "event": "offer",
            "from": "alice",
            "to": "bob",
            "payload": { "type": "offer", "sdp": "v=0" },
            "timestamp": 1234567890
        });

        let signature = signer.sign_frame(&frame);
        assert_eq!(signature.len(), 88);
        assert!(
            EnvelopeSigner::verify_frame(&signer.public_key_base64(), &frame, &signature).is_ok()
        );
    }

    #[test]
    fn test_signature_ignores_key_order_and_signature_field() {
        let signer = EnvelopeSigner::generate();
        let a = serde_json::json!({ "to": "bob", "from": "alice", "event": "callEnded" });
        let signature = signer.sign_frame(&a);

        let mut b = serde_json::json!({ "event": "callEnded", "from": "alice", "to": "bob" });
        b.as_object_mut()
            .unwrap()
            .insert("signature".to_string(), Value::String(signature.clone()));

        assert!(EnvelopeSigner::verify_frame(&signer.public_key_base64(), &b, &signature).is_ok());
    }

    #[test]
    fn test_tampered_frame_fails() {
        let signer = EnvelopeSigner::generate();
        let frame = serde_json::json!({ "event": "callUser", "from": "alice", "to": "bob" });
        let signature = signer.sign_frame(&frame);

        let forged = serde_json::json!({ "event": "callUser", "from": "mallory", "to": "bob" });
        assert!(matches!(
            EnvelopeSigner::verify_frame(&signer.public_key_base64(), &forged, &signature),
            Err(IdentityError::InvalidSignature)
        ));
    }

    #[test]
    fn test_seed_round_trip() {
        let seed = BASE64.encode([7u8; 32]);
        let a = EnvelopeSigner::from_seed_base64(&seed).unwrap();
        let b = EnvelopeSigner::from_seed_base64(&seed).unwrap();
        assert_eq!(a.public_key_base64(), b.public_key_base64());

        let short = BASE64.encode([1u8; 16]);
        assert!(matches!(
            EnvelopeSigner::from_seed_base64(&short),
            Err(IdentityError::InvalidKeyLength(16))
        ));
    }
}
