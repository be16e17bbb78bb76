// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Provider-side block serving for the sync protocol.

use std::sync::Arc;

use grove_storage::ChainStorage;
use grove_types::{Block, GroveResult, ReqBlkResult, ReqBlock};

pub struct ChainData {
    group_id: String,
    storage: Arc<ChainStorage>,
}

impl ChainData {
    pub fn new(group_id: &str, storage: Arc<ChainStorage>) -> Self {
        Self {
            group_id: group_id.to_string(),
            storage,
        }
    }

    /// Answer a block request with the run of blocks after `from_block`.
    ///
    /// `BlockNotFound` when nothing follows, `BlockInRespOnTop` when the
    /// returned run reaches this node's highest stored block
    /// (`top_block_epoch`), `BlockInResp` otherwise.
    pub async fn get_req_blocks(
        &self,
        req: &ReqBlock,
        top_block_epoch: u64,
    ) -> GroveResult<(ReqBlkResult, Vec<Block>)> {
        let blocks = self
            .storage
            .get_blocks_after_epoch(&self.group_id, req.from_block, req.blks_requested)
            .await;

        if blocks.is_empty() {
            return Ok((ReqBlkResult::BlockNotFound, blocks));
        }
        let on_top = blocks
            .last()
            .map(|b| b.epoch >= top_block_epoch)
            .unwrap_or(false);
        if on_top {
            Ok((ReqBlkResult::BlockInRespOnTop, blocks))
        } else {
            Ok((ReqBlkResult::BlockInResp, blocks))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(epoch: u64) -> Block {
        let mut b = Block::genesis("g1", "owner", 1);
        b.block_id = epoch;
        b.epoch = epoch;
        b
    }

    async fn seeded(top: u64) -> ChainData {
        let storage = Arc::new(ChainStorage::new());
        for epoch in 0..=top {
            storage.add_block(&block(epoch)).await.unwrap();
        }
        ChainData::new("g1", storage)
    }

    fn req(from: u64, count: u32) -> ReqBlock {
        ReqBlock {
            group_id: "g1".to_string(),
            from_block: from,
            blks_requested: count,
            req_pubkey: "peer".to_string(),
        }
    }

    #[tokio::test]
    async fn test_serves_run_after_from_block() {
        let data = seeded(12).await;
        let (result, blocks) = data.get_req_blocks(&req(5, 20), 12).await.unwrap();
        assert_eq!(result, ReqBlkResult::BlockInRespOnTop);
        assert_eq!(blocks.len(), 7);
        assert_eq!(blocks[0].epoch, 6);
        assert_eq!(blocks.last().unwrap().epoch, 12);
    }

    #[tokio::test]
    async fn test_partial_run_is_not_on_top() {
        let data = seeded(12).await;
        let (result, blocks) = data.get_req_blocks(&req(5, 3), 12).await.unwrap();
        assert_eq!(result, ReqBlkResult::BlockInResp);
        assert_eq!(blocks.len(), 3);
    }

    #[tokio::test]
    async fn test_nothing_past_tip() {
        let data = seeded(12).await;
        let (result, blocks) = data.get_req_blocks(&req(12, 10), 12).await.unwrap();
        assert_eq!(result, ReqBlkResult::BlockNotFound);
        assert!(blocks.is_empty());
    }
}
