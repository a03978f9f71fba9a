//! Authenticated message encryption
//!
//! Messages are sealed with ChaCha20-Poly1305. The 12-byte random nonce is
//! prepended to the ciphertext, so an envelope payload is
//! `nonce || ciphertext || tag`. Envelope metadata travels in the clear but
//! is bound to the ciphertext as associated data: each entry is encoded as
//! `len(key) || key || len(value) || value` with 4-byte big-endian lengths,
//! in key order.

use crate::error::{SwarmError, SwarmResult};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_LEN: usize = 12;

/// HKDF salt used when the caller supplies none
const DEFAULT_KDF_SALT: &[u8] = b"synapsed-hive/shared-key/v1";
const KDF_INFO: &[u8] = b"chacha20poly1305 message key";

/// Symmetric key shared by the agents of a swarm
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; 32]);

impl SharedKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive a key from shared secret material with HKDF-SHA256
    pub fn derive(secret: &[u8]) -> SwarmResult<Self> {
        Self::derive_with_salt(DEFAULT_KDF_SALT, secret)
    }

    /// HKDF-SHA256 with a caller-chosen salt, e.g. one per swarm
    pub fn derive_with_salt(salt: &[u8], secret: &[u8]) -> SwarmResult<Self> {
        let hk = Hkdf::<Sha256>::new(Some(salt), secret);
        let mut bytes = [0u8; 32];
        hk.expand(KDF_INFO, &mut bytes)
            .map_err(|e| SwarmError::Other(anyhow::anyhow!("key derivation failed: {e}")))?;
        Ok(Self(bytes))
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// Message as carried between agents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Whether `payload` is ciphertext
    pub encrypted: bool,
    /// Plaintext or `nonce || ciphertext`
    pub payload: Vec<u8>,
    /// Routing metadata; authenticated but not encrypted when sealed
    pub metadata: BTreeMap<String, String>,
}

impl MessageEnvelope {
    pub fn plaintext(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            encrypted: false,
            payload: payload.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach metadata to a plaintext envelope
    ///
    /// Changing the metadata of a sealed envelope makes it fail to decrypt;
    /// use [`encrypt_with_metadata`] instead.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Encrypt `message` under `key`
pub fn encrypt_message(message: &[u8], key: &SharedKey) -> SwarmResult<MessageEnvelope> {
    encrypt_with_metadata(message, BTreeMap::new(), key)
}

/// Encrypt `message` and bind `metadata` to it as associated data
pub fn encrypt_with_metadata(
    message: &[u8],
    metadata: BTreeMap<String, String>,
    key: &SharedKey,
) -> SwarmResult<MessageEnvelope> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let aad = associated_data(&metadata);
    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: message, aad: &aad })
        .map_err(|_| SwarmError::Other(anyhow::anyhow!("encryption failed")))?;

    let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);

    Ok(MessageEnvelope {
        encrypted: true,
        payload,
        metadata,
    })
}

/// Decrypt an envelope; fails on wrong key or tampering
pub fn decrypt_message(envelope: &MessageEnvelope, key: &SharedKey) -> SwarmResult<Vec<u8>> {
    if !envelope.encrypted {
        return Err(SwarmError::Decryption("envelope is not encrypted".into()));
    }
    if envelope.payload.len() < NONCE_LEN {
        return Err(SwarmError::Decryption("payload shorter than nonce".into()));
    }

    let (nonce, ciphertext) = envelope.payload.split_at(NONCE_LEN);
    let aad = associated_data(&envelope.metadata);
    key.cipher()
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: &aad })
        .map_err(|_| SwarmError::Decryption("authentication tag mismatch".into()))
}

fn associated_data(metadata: &BTreeMap<String, String>) -> Vec<u8> {
    let mut aad = Vec::new();
    for (key, value) in metadata {
        for part in [key.as_bytes(), value.as_bytes()] {
            aad.extend_from_slice(&(part.len() as u32).to_be_bytes());
            aad.extend_from_slice(part);
        }
    }
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_round_trip() {
        let key = SharedKey::generate();
        let envelope = encrypt_message(b"rebalance BTC/USDT", &key).unwrap();
        assert!(envelope.encrypted);
        assert_ne!(&envelope.payload[NONCE_LEN..], b"rebalance BTC/USDT");
        assert_eq!(decrypt_message(&envelope, &key).unwrap(), b"rebalance BTC/USDT");
    }

    #[test]
    fn test_wrong_key_rejected() {
        let envelope = encrypt_message(b"secret", &SharedKey::derive(b"alpha").unwrap()).unwrap();
        let err = decrypt_message(&envelope, &SharedKey::derive(b"beta").unwrap()).unwrap_err();
        assert!(matches!(err, SwarmError::Decryption(_)));
    }

    #[test]
    fn test_tampering_rejected() {
        let key = SharedKey::generate();
        let mut envelope = encrypt_message(b"secret", &key).unwrap();
        let last = envelope.payload.len() - 1;
        envelope.payload[last] ^= 0x01;
        assert!(matches!(decrypt_message(&envelope, &key), Err(SwarmError::Decryption(_))));

        envelope.payload.truncate(4);
        assert!(matches!(decrypt_message(&envelope, &key), Err(SwarmError::Decryption(_))));
    }

    #[test]
    fn test_derivation_depends_on_salt() {
        let a = SharedKey::derive(b"desk-7").unwrap();
        let b = SharedKey::derive(b"desk-7").unwrap();
        let salted = SharedKey::derive_with_salt(b"swarm-s1", b"desk-7").unwrap();
        assert_eq!(a.0, b.0);
        assert_ne!(a.0, salted.0);
        assert_ne!(&a.0[..], &b"desk-7"[..]);
    }

    #[test]
    fn test_metadata_is_authenticated() {
        let key = SharedKey::generate();
        let metadata = BTreeMap::from([
            ("kind".to_string(), "signal".to_string()),
            ("desk".to_string(), "7".to_string()),
        ]);
        let envelope = encrypt_with_metadata(b"hedge", metadata, &key).unwrap();
        assert_eq!(envelope.metadata.get("kind").map(String::as_str), Some("signal"));
        assert_eq!(decrypt_message(&envelope, &key).unwrap(), b"hedge");

        let retagged = envelope.clone().with_metadata("kind", "order");
        assert!(matches!(decrypt_message(&retagged, &key), Err(SwarmError::Decryption(_))));

        let mut stripped = envelope.clone();
        stripped.metadata.clear();
        assert!(decrypt_message(&stripped, &key).is_err());

        // entry boundaries are part of the encoding
        let mut shifted = envelope;
        shifted.metadata = BTreeMap::from([
            ("desk7".to_string(), String::new()),
            ("kind".to_string(), "signal".to_string()),
        ]);
        assert!(decrypt_message(&shifted, &key).is_err());
    }

    #[test]
    fn test_plaintext_envelope_rejected() {
        let envelope = MessageEnvelope::plaintext("hello");
        assert!(decrypt_message(&envelope, &SharedKey::generate()).is_err());
    }

    proptest! {
        #[test]
        fn prop_round_trip_any_message(
            message in proptest::collection::vec(any::<u8>(), 0..512),
            key in any::<[u8; 32]>(),
        ) {
            let key = SharedKey::from_bytes(key);
            let envelope = encrypt_message(&message, &key).unwrap();
            prop_assert_eq!(decrypt_message(&envelope, &key).unwrap(), message);
        }
    }
}
