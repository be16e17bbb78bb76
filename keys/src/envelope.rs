// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Multi-recipient sealing for private-group POST payloads.
//!
//! One ciphertext is built so every announced user can unwrap it: the body
//! is AES-256-GCM under a random content key, and the content key is wrapped
//! once per recipient behind an ephemeral secp256k1 ECDH exchange
//! (shared secret → SHA-256 → AES key).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use k256::ecdh::diffie_hellman;
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cipher::{aes_decode, aes_encode};
use crate::error::KeyError;

/// One wrapped copy of the content key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeySlot {
    /// Compressed SEC1 point of the ephemeral key used for this slot.
    ephemeral_pubkey: Vec<u8>,
    wrapped_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedEnvelope {
    slots: Vec<KeySlot>,
    body: Vec<u8>,
}

fn derive_wrap_key(secret: &SecretKey, peer: &PublicKey) -> [u8; 32] {
    let shared = diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    Sha256::digest(shared.raw_secret_bytes()).into()
}

/// Seal `plain` to every recipient in `recipient_pubkeys`
/// (compressed base64url encryption keys).
pub fn seal(recipient_pubkeys: &[String], plain: &[u8]) -> Result<Vec<u8>, KeyError> {
    if recipient_pubkeys.is_empty() {
        return Err(KeyError::EncryptFailed);
    }

    let mut content_key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut content_key);
    let body = aes_encode(&content_key, plain)?;

    let mut slots = Vec::with_capacity(recipient_pubkeys.len());
    for encoded in recipient_pubkeys {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        let peer =
            PublicKey::from_sec1_bytes(&bytes).map_err(|e| KeyError::InvalidKey(e.to_string()))?;

        let ephemeral = SecretKey::random(&mut OsRng);
        let wrap_key = derive_wrap_key(&ephemeral, &peer);
        slots.push(KeySlot {
            ephemeral_pubkey: ephemeral
                .public_key()
                .to_sec1_bytes()
                .to_vec(),
            wrapped_key: aes_encode(&wrap_key, &content_key)?,
        });
    }

    bincode::serialize(&SealedEnvelope { slots, body }).map_err(|_| KeyError::EncryptFailed)
}

/// Open a sealed envelope with this node's encryption secret.
///
/// Every slot is tried; only a recipient's key yields the content key.
pub fn open(secret: &SecretKey, sealed: &[u8]) -> Result<Vec<u8>, KeyError> {
    let envelope: SealedEnvelope =
        bincode::deserialize(sealed).map_err(|_| KeyError::DecryptFailed)?;

    for slot in &envelope.slots {
        let Ok(ephemeral) = PublicKey::from_sec1_bytes(&slot.ephemeral_pubkey) else {
            continue;
        };
        let wrap_key = derive_wrap_key(secret, &ephemeral);
        let Ok(content_key) = aes_decode(&wrap_key, &slot.wrapped_key) else {
            continue;
        };
        let Ok(content_key) = <[u8; 32]>::try_from(content_key.as_slice()) else {
            continue;
        };
        if let Ok(plain) = aes_decode(&content_key, &envelope.body) {
            return Ok(plain);
        }
    }

    Err(KeyError::DecryptFailed)
}

/// Compressed base64url encoding of an encryption public key.
pub fn encrypt_pubkey_to_base64(key: &PublicKey) -> String {
    URL_SAFE_NO_PAD.encode(key.to_sec1_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient() -> (SecretKey, String) {
        let secret = SecretKey::random(&mut OsRng);
        let encoded = encrypt_pubkey_to_base64(&secret.public_key());
        (secret, encoded)
    }

    #[test]
    fn test_every_recipient_can_open() {
        let (s1, p1) = recipient();
        let (s2, p2) = recipient();
        let (s3, p3) = recipient();
        let sealed = seal(&[p1, p2, p3], b"private post").unwrap();
        for secret in [&s1, &s2, &s3] {
            assert_eq!(open(secret, &sealed).unwrap(), b"private post");
        }
    }

    #[test]
    fn test_outsider_cannot_open() {
        let (_, p1) = recipient();
        let (outsider, _) = recipient();
        let sealed = seal(&[p1], b"private post").unwrap();
        assert!(matches!(open(&outsider, &sealed), Err(KeyError::DecryptFailed)));
    }

    #[test]
    fn test_empty_recipient_list_rejected() {
        assert!(seal(&[], b"x").is_err());
    }
}
