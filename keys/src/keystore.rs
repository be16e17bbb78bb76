// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! The keystore capability.
//!
//! `AccountKeystore` is the seam the chain engine signs and decrypts
//! through. The trait is async because backends may suspend briefly on
//! hardware-backed signing; `InMemKeystore` is the deterministic in-memory
//! implementation used by nodes and tests alike.

use async_trait::async_trait;
use dashmap::DashMap;
use k256::SecretKey;
use rand::rngs::OsRng;

use crate::crypto::{verify_sig, KeyPair};
use crate::envelope;
use crate::error::KeyError;

/// Public halves of a group's key material.
#[derive(Debug, Clone)]
pub struct GroupKeyInfo {
    pub sign_pubkey: String,
    pub encrypt_pubkey: String,
}

/// Process-wide key management capability.
#[async_trait]
pub trait AccountKeystore: Send + Sync {
    /// Create fresh sign + encrypt keys for a group.
    async fn new_group_keys(&self, group_id: &str) -> Result<GroupKeyInfo, KeyError>;

    /// Import existing key material for a group (join/import flows).
    async fn import_group_keys(
        &self,
        group_id: &str,
        sign_secret: &[u8],
        encrypt_secret: &[u8],
    ) -> Result<GroupKeyInfo, KeyError>;

    /// Sign a 32-byte prehash with the group's sign key.
    async fn sign(&self, group_id: &str, msg_hash: &[u8]) -> Result<Vec<u8>, KeyError>;

    /// Seal a payload to a set of recipient encryption keys.
    async fn encrypt_to(
        &self,
        recipient_pubkeys: &[String],
        plain: &[u8],
    ) -> Result<Vec<u8>, KeyError>;

    /// Open a sealed payload with the group's encryption key.
    async fn decrypt(&self, group_id: &str, sealed: &[u8]) -> Result<Vec<u8>, KeyError>;

    async fn get_sign_pubkey(&self, group_id: &str) -> Result<String, KeyError>;

    async fn get_encrypt_pubkey(&self, group_id: &str) -> Result<String, KeyError>;

    /// Verification is stateless and never suspends.
    fn verify(&self, msg_hash: &[u8], sig: &[u8], pubkey: &str) -> Result<bool, KeyError> {
        verify_sig(msg_hash, sig, pubkey)
    }
}

struct GroupKeys {
    sign: KeyPair,
    encrypt: SecretKey,
}

/// In-memory keystore keyed by group id.
#[derive(Default)]
pub struct InMemKeystore {
    keys: DashMap<String, GroupKeys>,
}

impl InMemKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    fn info(&self, keys: &GroupKeys) -> GroupKeyInfo {
        GroupKeyInfo {
            sign_pubkey: keys.sign.public_base64(),
            encrypt_pubkey: envelope::encrypt_pubkey_to_base64(&keys.encrypt.public_key()),
        }
    }
}

#[async_trait]
impl AccountKeystore for InMemKeystore {
    async fn new_group_keys(&self, group_id: &str) -> Result<GroupKeyInfo, KeyError> {
        let keys = GroupKeys {
            sign: KeyPair::generate(),
            encrypt: SecretKey::random(&mut OsRng),
        };
        let info = self.info(&keys);
        self.keys.insert(group_id.to_string(), keys);
        Ok(info)
    }

    async fn import_group_keys(
        &self,
        group_id: &str,
        sign_secret: &[u8],
        encrypt_secret: &[u8],
    ) -> Result<GroupKeyInfo, KeyError> {
        let keys = GroupKeys {
            sign: KeyPair::from_bytes(sign_secret)?,
            encrypt: SecretKey::from_slice(encrypt_secret)
                .map_err(|e| KeyError::InvalidKey(e.to_string()))?,
        };
        let info = self.info(&keys);
        self.keys.insert(group_id.to_string(), keys);
        Ok(info)
    }

    async fn sign(&self, group_id: &str, msg_hash: &[u8]) -> Result<Vec<u8>, KeyError> {
        let keys = self
            .keys
            .get(group_id)
            .ok_or_else(|| KeyError::NoSuchGroup(group_id.to_string()))?;
        keys.sign.sign_hash(msg_hash)
    }

    async fn encrypt_to(
        &self,
        recipient_pubkeys: &[String],
        plain: &[u8],
    ) -> Result<Vec<u8>, KeyError> {
        envelope::seal(recipient_pubkeys, plain)
    }

    async fn decrypt(&self, group_id: &str, sealed: &[u8]) -> Result<Vec<u8>, KeyError> {
        let keys = self
            .keys
            .get(group_id)
            .ok_or_else(|| KeyError::NoSuchGroup(group_id.to_string()))?;
        envelope::open(&keys.encrypt, sealed)
    }

    async fn get_sign_pubkey(&self, group_id: &str) -> Result<String, KeyError> {
        let keys = self
            .keys
            .get(group_id)
            .ok_or_else(|| KeyError::NoSuchGroup(group_id.to_string()))?;
        Ok(keys.sign.public_base64())
    }

    async fn get_encrypt_pubkey(&self, group_id: &str) -> Result<String, KeyError> {
        let keys = self
            .keys
            .get(group_id)
            .ok_or_else(|| KeyError::NoSuchGroup(group_id.to_string()))?;
        Ok(envelope::encrypt_pubkey_to_base64(&keys.encrypt.public_key()))
    }
}
