// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Transactions, the unit of state mutation.
//!
//! A trx is immutable once signed: the signature covers the canonical
//! serialization with the signature field zeroed, so any byte flip breaks
//! verification. Payloads stay encrypted at rest; the engine only decrypts
//! transiently while applying.

use serde::{Deserialize, Serialize};

use crate::codec::{self, MessageCodec};
use crate::GroveResult;

/// Hard limit on a trx payload before compression.
pub const TRX_DATA_LIMIT: usize = 200 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrxType {
    Post,
    Announce,
    Producer,
    User,
    Schema,
    AppConfig,
    ChainConfig,
    /// Direct-stream block request, sync protocol only.
    ReqBlock,
    /// Direct-stream block response, sync protocol only.
    ReqBlockResp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trx {
    pub trx_id: String,
    pub group_id: String,
    pub trx_type: TrxType,
    /// Encrypted (and on the wire, compressed) payload bytes.
    pub data: Vec<u8>,
    /// Monotonic per-sender nonce. REQ trxs always carry 0.
    pub nonce: u64,
    pub timestamp: i64,
    pub version: String,
    pub sender_pubkey: String,
    pub sender_sign: Vec<u8>,
}

impl Trx {
    /// Canonical SHA-256 of this trx with the signature zeroed.
    ///
    /// This is the digest the sender signs and every receiver verifies.
    pub fn hash_bytes(&self) -> GroveResult<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.sender_sign = Vec::new();
        let bytes = MessageCodec::encode_to_vec(&unsigned)?;
        Ok(codec::sha256(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Trx {
        Trx {
            trx_id: "2f0cba01-9cb5-4dbd-a9be-0c0ba873e1b2".to_string(),
            group_id: "g1".to_string(),
            trx_type: TrxType::Post,
            data: vec![1, 2, 3],
            nonce: 7,
            timestamp: 1_700_000_000,
            version: "2.0.0".to_string(),
            sender_pubkey: "AslY".to_string(),
            sender_sign: vec![9, 9, 9],
        }
    }

    #[test]
    fn test_hash_ignores_signature() {
        let a = sample();
        let mut b = sample();
        b.sender_sign = vec![0xde, 0xad];
        assert_eq!(a.hash_bytes().unwrap(), b.hash_bytes().unwrap());
    }

    #[test]
    fn test_hash_covers_payload() {
        let a = sample();
        let mut b = sample();
        b.data[0] ^= 0xff;
        assert_ne!(a.hash_bytes().unwrap(), b.hash_bytes().unwrap());
    }
}
