// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! secp256k1 ECDSA signing and verification.
//!
//! Signatures are produced over a 32-byte SHA-256 prehash of the canonical
//! serialization. Public keys travel as compressed SEC1 points encoded
//! base64url without padding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::KeyError;

/// SHA-256 digest helper.
pub fn hash(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// Encode a verifying key as compressed base64url.
pub fn pubkey_to_base64(key: &VerifyingKey) -> String {
    URL_SAFE_NO_PAD.encode(key.to_encoded_point(true).as_bytes())
}

/// Decode a compressed base64url public key.
pub fn pubkey_from_base64(encoded: &str) -> Result<VerifyingKey, KeyError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
    VerifyingKey::from_sec1_bytes(&bytes).map_err(|e| KeyError::InvalidKey(e.to_string()))
}

/// Sign a 32-byte prehash, returning the fixed-size signature bytes.
pub fn sign_hash(key: &SigningKey, msg_hash: &[u8]) -> Result<Vec<u8>, KeyError> {
    let sig: Signature = key
        .sign_prehash(msg_hash)
        .map_err(|e| KeyError::SigningFailed(e.to_string()))?;
    Ok(sig.to_vec())
}

/// Verify a signature over a prehash against a base64url-encoded pubkey.
///
/// Returns `Ok(false)` for a well-formed but wrong signature; malformed
/// inputs are errors.
pub fn verify_sig(msg_hash: &[u8], sig: &[u8], pubkey: &str) -> Result<bool, KeyError> {
    let key = pubkey_from_base64(pubkey)?;
    let sig = Signature::from_slice(sig).map_err(|_| KeyError::MalformedSignature)?;
    Ok(key.verify_prehash(msg_hash, &sig).is_ok())
}

/// A secp256k1 signing keypair.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        Ok(Self {
            signing: SigningKey::from_slice(bytes)
                .map_err(|e| KeyError::InvalidKey(e.to_string()))?,
        })
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    /// Compressed base64url public key.
    pub fn public_base64(&self) -> String {
        pubkey_to_base64(self.signing.verifying_key())
    }

    pub fn sign_hash(&self, msg_hash: &[u8]) -> Result<Vec<u8>, KeyError> {
        sign_hash(&self.signing, msg_hash)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_base64())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let pair = KeyPair::generate();
        let digest = hash(b"canonical trx bytes");
        let sig = pair.sign_hash(&digest).unwrap();
        assert!(verify_sig(&digest, &sig, &pair.public_base64()).unwrap());
    }

    #[test]
    fn test_tampered_hash_rejected() {
        let pair = KeyPair::generate();
        let digest = hash(b"payload");
        let sig = pair.sign_hash(&digest).unwrap();
        let other = hash(b"payloae");
        assert!(!verify_sig(&other, &sig, &pair.public_base64()).unwrap());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let pair = KeyPair::generate();
        let intruder = KeyPair::generate();
        let digest = hash(b"payload");
        let sig = pair.sign_hash(&digest).unwrap();
        assert!(!verify_sig(&digest, &sig, &intruder.public_base64()).unwrap());
    }

    #[test]
    fn test_pubkey_base64_roundtrip() {
        let pair = KeyPair::generate();
        let encoded = pair.public_base64();
        let decoded = pubkey_from_base64(&encoded).unwrap();
        assert_eq!(encoded, pubkey_to_base64(&decoded));
    }
}
