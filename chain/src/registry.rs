// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! The node-wide chain registry.
//!
//! One registry per process owns the `group_id -> Chain` map together with
//! the shared storage and keystore handles. It is created once at startup
//! and passed explicitly wherever a chain must be looked up; there is no
//! module-level state.

use std::sync::Arc;

use dashmap::DashMap;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use grove_keys::AccountKeystore;
use grove_storage::ChainStorage;
use grove_types::{
    now_ts, Block, ChainError, ConsensusType, EncryptType, GroupInfo, GroveResult, NodeRole,
    ProducerItem,
};

use crate::chain::{Chain, ChainOptions};
use crate::conn::{ConnMgr, Delivery};
use crate::validator;

/// Everything a peer needs to join an existing group.
#[derive(Debug, Clone)]
pub struct GroupSeed {
    pub group_id: String,
    pub group_name: String,
    pub owner_pubkey: String,
    pub cipher_key: String,
    pub encrypt_type: EncryptType,
    pub consensus_type: ConsensusType,
    pub genesis: Block,
}

/// Transport hookup for one group membership: the conn manager plus the
/// inbox the dispatcher drains. Produced by the caller once the node's
/// sign key for the group is known.
pub type ConnectFn = Box<dyn FnOnce(&str) -> (Arc<dyn ConnMgr>, mpsc::UnboundedReceiver<Delivery>) + Send>;

pub struct ChainRegistry {
    node_name: String,
    storage: Arc<ChainStorage>,
    keystore: Arc<dyn AccountKeystore>,
    groups: DashMap<String, Arc<Chain>>,
    token: CancellationToken,
}

impl ChainRegistry {
    pub fn new(
        node_name: &str,
        storage: Arc<ChainStorage>,
        keystore: Arc<dyn AccountKeystore>,
    ) -> Self {
        Self {
            node_name: node_name.to_string(),
            storage,
            keystore,
            groups: DashMap::new(),
            token: CancellationToken::new(),
        }
    }

    pub fn storage(&self) -> &Arc<ChainStorage> {
        &self.storage
    }

    pub fn get_group(&self, group_id: &str) -> Option<Arc<Chain>> {
        self.groups.get(group_id).map(|g| Arc::clone(g.value()))
    }

    /// Create a fresh group owned by this node: new keys, a random cipher
    /// key, a signed genesis block, and the owner seeded as sole producer.
    pub async fn create_group(
        &self,
        group_name: &str,
        node_role: NodeRole,
        encrypt_type: EncryptType,
        options: ChainOptions,
        connect: ConnectFn,
    ) -> GroveResult<(Arc<Chain>, GroupSeed)> {
        let group_id = uuid::Uuid::new_v4().to_string();
        let keys = self.keystore.new_group_keys(&group_id).await?;

        let mut cipher_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut cipher_key);
        let cipher_key_hex = hex::encode(cipher_key);

        let mut genesis = Block::genesis(&group_id, &keys.sign_pubkey, now_ts());
        let hash = genesis.compute_hash()?;
        genesis.bookkeeping_sign = self.keystore.sign(&group_id, &hash).await?;

        let seed = GroupSeed {
            group_id: group_id.clone(),
            group_name: group_name.to_string(),
            owner_pubkey: keys.sign_pubkey.clone(),
            cipher_key: cipher_key_hex,
            encrypt_type,
            consensus_type: ConsensusType::Poa,
            genesis,
        };

        let chain = self
            .bootstrap_group(&seed, keys.sign_pubkey, keys.encrypt_pubkey, node_role, options, connect)
            .await?;
        info!("<{}> group <{}> created", group_id, group_name);
        Ok((chain, seed))
    }

    /// Join a group created elsewhere using its seed.
    pub async fn join_group(
        &self,
        seed: &GroupSeed,
        node_role: NodeRole,
        options: ChainOptions,
        connect: ConnectFn,
    ) -> GroveResult<Arc<Chain>> {
        if !validator::verify_block(&seed.genesis)? {
            return Err(ChainError::InvalidSignature);
        }
        if seed.genesis.bookkeeping_pubkey != seed.owner_pubkey {
            return Err(ChainError::InvalidData(
                "genesis not signed by the group owner".to_string(),
            ));
        }

        let keys = self.keystore.new_group_keys(&seed.group_id).await?;
        let chain = self
            .bootstrap_group(
                seed,
                keys.sign_pubkey,
                keys.encrypt_pubkey,
                node_role,
                options,
                connect,
            )
            .await?;
        info!("<{}> group <{}> joined", seed.group_id, seed.group_name);
        Ok(chain)
    }

    async fn bootstrap_group(
        &self,
        seed: &GroupSeed,
        sign_pubkey: String,
        encrypt_pubkey: String,
        node_role: NodeRole,
        options: ChainOptions,
        connect: ConnectFn,
    ) -> GroveResult<Arc<Chain>> {
        let info = GroupInfo {
            group_id: seed.group_id.clone(),
            group_name: seed.group_name.clone(),
            owner_pubkey: seed.owner_pubkey.clone(),
            user_sign_pubkey: sign_pubkey.clone(),
            user_encrypt_pubkey: encrypt_pubkey,
            cipher_key: seed.cipher_key.clone(),
            epoch: 0,
            curr_block_id: 0,
            last_update: now_ts(),
            encrypt_type: seed.encrypt_type,
            consensus_type: seed.consensus_type,
        };

        self.storage.save_group(info.clone()).await?;
        self.storage.add_block(&seed.genesis).await?;
        self.storage
            .update_producer(ProducerItem {
                group_id: seed.group_id.clone(),
                producer_pubkey: seed.owner_pubkey.clone(),
                blocks_produced: 0,
                memo: "group owner".to_string(),
                timestamp: now_ts(),
            })
            .await?;

        let (conn, inbox) = connect(&sign_pubkey);
        let chain = Chain::new(
            info,
            &self.node_name,
            node_role,
            Arc::clone(&self.storage),
            Arc::clone(&self.keystore),
            conn,
            options,
            self.token.child_token(),
        )?;

        chain.update_producer_list().await;
        chain.update_user_list().await;
        chain.create_consensus();
        chain.start(inbox);

        self.groups.insert(seed.group_id.clone(), Arc::clone(&chain));
        Ok(chain)
    }

    /// Stop a group's workers but keep its data.
    pub async fn stop_group(&self, group_id: &str) -> GroveResult<()> {
        let chain = self
            .get_group(group_id)
            .ok_or_else(|| ChainError::InvalidData(format!("no group <{group_id}>")))?;
        chain.stop().await;
        Ok(())
    }

    /// Leave a group: stop it and forget the engine, keeping stored data.
    pub async fn leave_group(&self, group_id: &str) -> GroveResult<()> {
        self.stop_group(group_id).await?;
        self.groups.remove(group_id);
        Ok(())
    }

    /// Leave a group and drop every row it owns.
    pub async fn clear_group(&self, group_id: &str) -> GroveResult<()> {
        self.leave_group(group_id).await?;
        self.storage.remove_group_data(group_id).await?;
        Ok(())
    }

    /// Stop every group, newest registrations last.
    pub async fn stop_all(&self) {
        for entry in self.groups.iter() {
            entry.value().stop().await;
        }
        self.token.cancel();
    }
}
