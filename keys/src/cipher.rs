// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! AES-256-GCM symmetric cipher used with the group's shared key.
//!
//! Ciphertext layout: 12-byte random nonce followed by the GCM output.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use crate::error::KeyError;

const NONCE_LEN: usize = 12;

/// Parse a hex-encoded 32-byte group cipher key.
pub fn parse_cipher_key(hex_key: &str) -> Result<[u8; 32], KeyError> {
    let bytes = hex::decode(hex_key).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| KeyError::InvalidKey("cipher key must be 32 bytes".to_string()))
}

/// Encrypt with the group cipher key.
pub fn aes_encode(key: &[u8; 32], plain: &[u8]) -> Result<Vec<u8>, KeyError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| KeyError::EncryptFailed)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plain)
        .map_err(|_| KeyError::EncryptFailed)?;
    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt a nonce-prefixed ciphertext with the group cipher key.
pub fn aes_decode(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, KeyError> {
    if data.len() < NONCE_LEN {
        return Err(KeyError::DecryptFailed);
    }
    let (nonce, sealed) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| KeyError::DecryptFailed)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| KeyError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; 32] {
        let mut k = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut k);
        k
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let k = key();
        let plain = b"post content";
        let sealed = aes_encode(&k, plain).unwrap();
        assert_eq!(aes_decode(&k, &sealed).unwrap(), plain);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = aes_encode(&key(), b"secret").unwrap();
        assert!(matches!(
            aes_decode(&key(), &sealed),
            Err(KeyError::DecryptFailed)
        ));
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let k = key();
        let sealed = aes_encode(&k, b"secret").unwrap();
        assert!(aes_decode(&k, &sealed[..8]).is_err());
    }

    #[test]
    fn test_parse_cipher_key() {
        let hex_key = hex::encode([7u8; 32]);
        assert_eq!(parse_cipher_key(&hex_key).unwrap(), [7u8; 32]);
        assert!(parse_cipher_key("deadbeef").is_err());
    }
}
