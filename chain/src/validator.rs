// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Signature and chain-linkage checks over untrusted input.

use grove_types::{Block, ChainError, GroveResult, Trx, TRX_DATA_LIMIT};

/// Verify a trx signature over its canonical hash.
pub fn verify_trx(trx: &Trx) -> GroveResult<bool> {
    if trx.data.len() > TRX_DATA_LIMIT {
        return Err(ChainError::InvalidData(format!(
            "trx <{}> payload over limit",
            trx.trx_id
        )));
    }
    let hash = trx.hash_bytes()?;
    Ok(grove_keys::verify_sig(&hash, &trx.sender_sign, &trx.sender_pubkey)?)
}

/// Verify a block's bookkeeping signature.
pub fn verify_block(block: &Block) -> GroveResult<bool> {
    let hash = block.compute_hash()?;
    Ok(grove_keys::verify_sig(
        &hash,
        &block.bookkeeping_sign,
        &block.bookkeeping_pubkey,
    )?)
}

/// Chain-linkage invariants against the parent: the epoch strictly
/// advances (empty agreement rounds may leave gaps) and `prev_hash`
/// commits to the parent bytes.
pub fn valid_block_with_parent(block: &Block, parent: &Block) -> GroveResult<()> {
    if block.epoch <= parent.epoch {
        return Err(ChainError::InvalidData(format!(
            "block <{}> epoch <{}> does not follow parent epoch <{}>",
            block.block_id, block.epoch, parent.epoch
        )));
    }
    if block.prev_hash != parent.compute_hash()? {
        return Err(ChainError::InvalidData(format!(
            "block <{}> prev_hash does not match parent",
            block.block_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_keys::KeyPair;
    use grove_types::{now_ts, TrxType};

    fn signed_trx(pair: &KeyPair) -> Trx {
        let mut trx = Trx {
            trx_id: "t1".to_string(),
            group_id: "g1".to_string(),
            trx_type: TrxType::Post,
            data: b"payload".to_vec(),
            nonce: 0,
            timestamp: now_ts(),
            version: "2.0.0".to_string(),
            sender_pubkey: pair.public_base64(),
            sender_sign: Vec::new(),
        };
        trx.sender_sign = pair.sign_hash(&trx.hash_bytes().unwrap()).unwrap();
        trx
    }

    #[test]
    fn test_valid_trx_passes() {
        let pair = KeyPair::generate();
        assert!(verify_trx(&signed_trx(&pair)).unwrap());
    }

    #[test]
    fn test_mutated_trx_fails() {
        let pair = KeyPair::generate();
        let mut trx = signed_trx(&pair);
        trx.data[0] ^= 0x01;
        assert!(!verify_trx(&trx).unwrap());
    }

    #[test]
    fn test_oversized_trx_rejected() {
        let pair = KeyPair::generate();
        let mut trx = signed_trx(&pair);
        trx.data = vec![0u8; TRX_DATA_LIMIT + 1];
        assert!(verify_trx(&trx).is_err());
    }

    #[test]
    fn test_block_linkage() {
        let pair = KeyPair::generate();
        let parent = Block::genesis("g1", &pair.public_base64(), now_ts());
        let mut child = Block {
            block_id: 1,
            group_id: "g1".to_string(),
            epoch: 1,
            prev_hash: parent.compute_hash().unwrap(),
            trxs: Vec::new(),
            bookkeeping_pubkey: pair.public_base64(),
            bookkeeping_sign: Vec::new(),
            timestamp: now_ts(),
        };
        assert!(valid_block_with_parent(&child, &parent).is_ok());

        // an empty-round gap is legal, a stale epoch is not
        child.epoch = 3;
        assert!(valid_block_with_parent(&child, &parent).is_ok());
        child.epoch = 0;
        assert!(valid_block_with_parent(&child, &parent).is_err());
        child.epoch = 1;
        child.prev_hash = vec![0u8; 32];
        assert!(valid_block_with_parent(&child, &parent).is_err());
    }
}
