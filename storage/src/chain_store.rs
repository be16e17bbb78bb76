// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory chain store with concurrent access.
//!
//! ## Tables
//! - `groups`: chain head info per group
//! - `blocks`: primary storage `(group, block_id) -> Block`
//! - `blocks_by_epoch`: secondary index `(group, epoch) -> block_id`
//! - `trxs`: `(group, trx_id, nonce) -> Trx`, plus a latest-by-id view
//! - `posts`: content log, full nodes only
//! - `producers` / `users` / `announcements`: membership tables
//! - `app_configs` / `chain_configs`: config entries keyed by name
//! - `psync_sessions`: handled consensus-sync sessions + latest response
//! - `nonces`: strictly monotonic counters keyed `(group, role)`

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use grove_types::{
    AnnounceItem, AnnounceType, AppConfigItem, Block, ChainConfigItem, ChainError, ConsensusResp,
    GroupInfo, GroveResult, ProducerItem, Trx, UserItem,
};

/// One applied POST, stored decrypted in the content log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostItem {
    pub trx_id: String,
    pub group_id: String,
    pub sender_pubkey: String,
    pub content: Vec<u8>,
    pub timestamp: i64,
}

type GroupKey = (String, String);

/// In-memory chain store.
#[derive(Debug, Default)]
pub struct ChainStorage {
    groups: DashMap<String, GroupInfo>,
    blocks: DashMap<(String, u64), Block>,
    blocks_by_epoch: DashMap<(String, u64), u64>,
    trxs: DashMap<(String, String, u64), Trx>,
    trxs_latest: DashMap<GroupKey, Trx>,
    posts: DashMap<GroupKey, PostItem>,
    producers: DashMap<GroupKey, ProducerItem>,
    users: DashMap<GroupKey, UserItem>,
    announcements: DashMap<(String, AnnounceType, String), AnnounceItem>,
    app_configs: DashMap<GroupKey, AppConfigItem>,
    chain_configs: DashMap<GroupKey, ChainConfigItem>,
    psync_sessions: DashMap<GroupKey, ()>,
    psync_latest: DashMap<String, ConsensusResp>,
    nonces: DashMap<GroupKey, u64>,
}

impl ChainStorage {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- groups ----

    pub async fn save_group(&self, info: GroupInfo) -> GroveResult<()> {
        self.groups.insert(info.group_id.clone(), info);
        Ok(())
    }

    pub async fn get_group(&self, group_id: &str) -> GroveResult<GroupInfo> {
        self.groups
            .get(group_id)
            .map(|g| g.value().clone())
            .ok_or_else(|| ChainError::Storage(format!("group <{group_id}> not found")))
    }

    pub async fn all_groups(&self) -> Vec<GroupInfo> {
        self.groups.iter().map(|g| g.value().clone()).collect()
    }

    // ---- blocks ----

    pub async fn add_block(&self, block: &Block) -> GroveResult<()> {
        let group_id = block.group_id.clone();
        self.blocks_by_epoch
            .insert((group_id.clone(), block.epoch), block.block_id);
        self.blocks
            .insert((group_id, block.block_id), block.clone());
        Ok(())
    }

    pub async fn get_block(&self, group_id: &str, block_id: u64) -> GroveResult<Block> {
        self.blocks
            .get(&(group_id.to_string(), block_id))
            .map(|b| b.value().clone())
            .ok_or(ChainError::ParentNotExist(block_id))
    }

    pub async fn get_block_by_epoch(&self, group_id: &str, epoch: u64) -> Option<Block> {
        let block_id = *self.blocks_by_epoch.get(&(group_id.to_string(), epoch))?;
        self.blocks
            .get(&(group_id.to_string(), block_id))
            .map(|b| b.value().clone())
    }

    /// Up to `count` blocks with `epoch > after_epoch`, in epoch order.
    /// Epochs may have gaps: agreement rounds with an empty union advance
    /// the epoch without emitting a block.
    pub async fn get_blocks_after_epoch(
        &self,
        group_id: &str,
        after_epoch: u64,
        count: u32,
    ) -> Vec<Block> {
        let mut epochs: Vec<u64> = self
            .blocks_by_epoch
            .iter()
            .filter(|e| e.key().0 == group_id && e.key().1 > after_epoch)
            .map(|e| e.key().1)
            .collect();
        epochs.sort_unstable();
        let mut out = Vec::new();
        for epoch in epochs.into_iter().take(count as usize) {
            if let Some(block) = self.get_block_by_epoch(group_id, epoch).await {
                out.push(block);
            }
        }
        out
    }

    // ---- trxs ----

    /// Upsert a trx. Safe to call again for an already-applied trx.
    pub async fn add_trx(&self, trx: &Trx) -> GroveResult<()> {
        let group_id = trx.group_id.clone();
        self.trxs.insert(
            (group_id.clone(), trx.trx_id.clone(), trx.nonce),
            trx.clone(),
        );
        self.trxs_latest
            .insert((group_id, trx.trx_id.clone()), trx.clone());
        Ok(())
    }

    pub async fn get_trx(&self, group_id: &str, trx_id: &str) -> Option<Trx> {
        self.trxs_latest
            .get(&(group_id.to_string(), trx_id.to_string()))
            .map(|t| t.value().clone())
    }

    pub async fn is_trx_exist(&self, group_id: &str, trx_id: &str, nonce: u64) -> bool {
        self.trxs
            .contains_key(&(group_id.to_string(), trx_id.to_string(), nonce))
    }

    // ---- content log ----

    pub async fn add_post(&self, post: PostItem) -> GroveResult<()> {
        self.posts
            .insert((post.group_id.clone(), post.trx_id.clone()), post);
        Ok(())
    }

    pub async fn get_posts(&self, group_id: &str) -> Vec<PostItem> {
        let mut posts: Vec<PostItem> = self
            .posts
            .iter()
            .filter(|p| p.key().0 == group_id)
            .map(|p| p.value().clone())
            .collect();
        posts.sort_by_key(|p| p.timestamp);
        posts
    }

    // ---- producers / users ----

    pub async fn update_producer(&self, item: ProducerItem) -> GroveResult<()> {
        self.producers
            .insert((item.group_id.clone(), item.producer_pubkey.clone()), item);
        Ok(())
    }

    /// Replace the whole producer table for a group, e.g. after a completed
    /// consensus change.
    pub async fn replace_producers(
        &self,
        group_id: &str,
        items: Vec<ProducerItem>,
    ) -> GroveResult<()> {
        self.producers.retain(|k, _| k.0 != group_id);
        for item in items {
            self.update_producer(item).await?;
        }
        Ok(())
    }

    pub async fn get_producers(&self, group_id: &str) -> Vec<ProducerItem> {
        self.producers
            .iter()
            .filter(|p| p.key().0 == group_id)
            .map(|p| p.value().clone())
            .collect()
    }

    pub async fn update_user(&self, item: UserItem) -> GroveResult<()> {
        self.users
            .insert((item.group_id.clone(), item.user_pubkey.clone()), item);
        Ok(())
    }

    pub async fn get_users(&self, group_id: &str) -> Vec<UserItem> {
        self.users
            .iter()
            .filter(|u| u.key().0 == group_id)
            .map(|u| u.value().clone())
            .collect()
    }

    // ---- announcements ----

    pub async fn update_announce(&self, item: AnnounceItem) -> GroveResult<()> {
        self.announcements.insert(
            (
                item.group_id.clone(),
                item.announce_type,
                item.sign_pubkey.clone(),
            ),
            item,
        );
        Ok(())
    }

    pub async fn get_announcements(
        &self,
        group_id: &str,
        announce_type: AnnounceType,
    ) -> Vec<AnnounceItem> {
        self.announcements
            .iter()
            .filter(|a| a.key().0 == group_id && a.key().1 == announce_type)
            .map(|a| a.value().clone())
            .collect()
    }

    /// Refresh an announcement's approval flag against the current pool.
    pub async fn update_announce_result(
        &self,
        group_id: &str,
        announce_type: AnnounceType,
        sign_pubkey: &str,
        approved: bool,
    ) -> GroveResult<()> {
        use grove_types::AnnounceResult;
        if let Some(mut item) = self.announcements.get_mut(&(
            group_id.to_string(),
            announce_type,
            sign_pubkey.to_string(),
        )) {
            item.result = if approved {
                AnnounceResult::Approved
            } else {
                AnnounceResult::Announced
            };
        }
        Ok(())
    }

    // ---- configs ----

    pub async fn update_app_config(&self, item: AppConfigItem) -> GroveResult<()> {
        self.app_configs
            .insert((item.group_id.clone(), item.name.clone()), item);
        Ok(())
    }

    pub async fn get_app_config(&self, group_id: &str, name: &str) -> Option<AppConfigItem> {
        self.app_configs
            .get(&(group_id.to_string(), name.to_string()))
            .map(|c| c.value().clone())
    }

    pub async fn update_chain_config(&self, item: ChainConfigItem) -> GroveResult<()> {
        self.chain_configs
            .insert((item.group_id.clone(), item.name.clone()), item);
        Ok(())
    }

    pub async fn get_chain_config(&self, group_id: &str, name: &str) -> Option<ChainConfigItem> {
        self.chain_configs
            .get(&(group_id.to_string(), name.to_string()))
            .map(|c| c.value().clone())
    }

    // ---- consensus sync sessions ----

    pub async fn is_psync_session_exist(&self, group_id: &str, session_id: &str) -> bool {
        self.psync_sessions
            .contains_key(&(group_id.to_string(), session_id.to_string()))
    }

    pub async fn upd_psync_resp(
        &self,
        group_id: &str,
        session_id: &str,
        resp: ConsensusResp,
    ) -> GroveResult<()> {
        self.psync_sessions
            .insert((group_id.to_string(), session_id.to_string()), ());
        self.psync_latest.insert(group_id.to_string(), resp);
        Ok(())
    }

    pub async fn get_current_psync_resp(&self, group_id: &str) -> Option<ConsensusResp> {
        self.psync_latest.get(group_id).map(|r| r.value().clone())
    }

    // ---- nonces ----

    /// Next nonce for `(group, role)`. Starts at 0 and is strictly
    /// monotonic; 0 is a valid nonce.
    pub async fn next_nonce(&self, group_id: &str, role: &str) -> GroveResult<u64> {
        let mut entry = self
            .nonces
            .entry((group_id.to_string(), role.to_string()))
            .or_insert(0);
        let nonce = *entry;
        *entry = nonce + 1;
        Ok(nonce)
    }

    // ---- lifecycle ----

    /// Drop every row belonging to one group.
    pub async fn remove_group_data(&self, group_id: &str) -> GroveResult<()> {
        self.groups.remove(group_id);
        self.blocks.retain(|k, _| k.0 != group_id);
        self.blocks_by_epoch.retain(|k, _| k.0 != group_id);
        self.trxs.retain(|k, _| k.0 != group_id);
        self.trxs_latest.retain(|k, _| k.0 != group_id);
        self.posts.retain(|k, _| k.0 != group_id);
        self.producers.retain(|k, _| k.0 != group_id);
        self.users.retain(|k, _| k.0 != group_id);
        self.announcements.retain(|k, _| k.0 != group_id);
        self.app_configs.retain(|k, _| k.0 != group_id);
        self.chain_configs.retain(|k, _| k.0 != group_id);
        self.psync_sessions.retain(|k, _| k.0 != group_id);
        self.psync_latest.remove(group_id);
        self.nonces.retain(|k, _| k.0 != group_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_types::TrxType;

    fn trx(group: &str, id: &str, nonce: u64) -> Trx {
        Trx {
            trx_id: id.to_string(),
            group_id: group.to_string(),
            trx_type: TrxType::Post,
            data: vec![1],
            nonce,
            timestamp: 1,
            version: "2.0.0".to_string(),
            sender_pubkey: "pk".to_string(),
            sender_sign: vec![],
        }
    }

    #[tokio::test]
    async fn test_nonce_is_strictly_monotonic_per_role() {
        let store = ChainStorage::new();
        assert_eq!(store.next_nonce("g1", "chain").await.unwrap(), 0);
        assert_eq!(store.next_nonce("g1", "chain").await.unwrap(), 1);
        assert_eq!(store.next_nonce("g1", "consensus").await.unwrap(), 0);
        assert_eq!(store.next_nonce("g2", "chain").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_trx_upsert_is_idempotent() {
        let store = ChainStorage::new();
        let t = trx("g1", "t1", 0);
        store.add_trx(&t).await.unwrap();
        store.add_trx(&t).await.unwrap();
        assert!(store.is_trx_exist("g1", "t1", 0).await);
        assert!(!store.is_trx_exist("g1", "t1", 1).await);
        assert_eq!(store.get_trx("g1", "t1").await.unwrap().trx_id, "t1");
    }

    #[tokio::test]
    async fn test_block_epoch_index() {
        let store = ChainStorage::new();
        // epochs with a gap: round 2 emitted no block
        for (block_id, epoch) in [(0u64, 0u64), (1, 1), (2, 3), (3, 4)] {
            let mut block = Block::genesis("g1", "owner", 1);
            block.block_id = block_id;
            block.epoch = epoch;
            store.add_block(&block).await.unwrap();
        }
        let run = store.get_blocks_after_epoch("g1", 0, 10).await;
        assert_eq!(run.len(), 3);
        assert_eq!(run[0].epoch, 1);
        assert_eq!(run[1].epoch, 3, "gap must be skipped, not cut off");
        assert_eq!(store.get_blocks_after_epoch("g1", 1, 1).await[0].epoch, 3);
        assert!(store.get_block_by_epoch("g1", 9).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_group_data_scopes_by_group() {
        let store = ChainStorage::new();
        store.add_trx(&trx("g1", "t1", 0)).await.unwrap();
        store.add_trx(&trx("g2", "t2", 0)).await.unwrap();
        store.remove_group_data("g1").await.unwrap();
        assert!(!store.is_trx_exist("g1", "t1", 0).await);
        assert!(store.is_trx_exist("g2", "t2", 0).await);
    }
}
