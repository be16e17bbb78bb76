// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Blocks and the canonical block hash.

use serde::{Deserialize, Serialize};

use crate::codec::{self, MessageCodec};
use crate::trx::Trx;
use crate::GroveResult;

/// One block of a group chain.
///
/// Invariants enforced on apply: `epoch = parent.epoch + 1`, `prev_hash`
/// equals the parent's canonical hash, and `bookkeeping_pubkey` is in the
/// active producer set at build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub block_id: u64,
    pub group_id: String,
    pub epoch: u64,
    pub prev_hash: Vec<u8>,
    pub trxs: Vec<Trx>,
    pub bookkeeping_pubkey: String,
    pub bookkeeping_sign: Vec<u8>,
    pub timestamp: i64,
}

impl Block {
    /// Canonical SHA-256 of this block with the signature zeroed.
    pub fn compute_hash(&self) -> GroveResult<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.bookkeeping_sign = Vec::new();
        let bytes = MessageCodec::encode_to_vec(&unsigned)?;
        Ok(codec::sha256(&bytes))
    }

    /// Unsigned genesis block for a fresh group. The caller signs it with
    /// the owner key before persisting.
    pub fn genesis(group_id: &str, owner_pubkey: &str, timestamp: i64) -> Self {
        Self {
            block_id: 0,
            group_id: group_id.to_string(),
            epoch: 0,
            prev_hash: Vec::new(),
            trxs: Vec::new(),
            bookkeeping_pubkey: owner_pubkey.to_string(),
            bookkeeping_sign: Vec::new(),
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_stable_across_reserialization() {
        let blk = Block::genesis("g1", "ownerpk", 1_700_000_000);
        let h1 = blk.compute_hash().unwrap();
        let bytes = MessageCodec::encode_to_vec(&blk).unwrap();
        let back: Block = MessageCodec::decode(&bytes).unwrap();
        assert_eq!(h1, back.compute_hash().unwrap());
    }

    #[test]
    fn test_hash_ignores_signature() {
        let mut blk = Block::genesis("g1", "ownerpk", 1_700_000_000);
        let unsigned = blk.compute_hash().unwrap();
        blk.bookkeeping_sign = vec![1, 2, 3];
        assert_eq!(unsigned, blk.compute_hash().unwrap());
    }
}
