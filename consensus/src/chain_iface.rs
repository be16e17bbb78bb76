// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Capability surface the chain exposes to its consensus roles.
//!
//! The chain owns the consensus roles and the roles call back into the
//! chain, so the roles hold a `Weak` handle to this trait and upgrade per
//! call; a role outliving its chain sees the calls fail instead of keeping
//! the group alive.

use async_trait::async_trait;

use grove_types::{ChangeConsensusResultBundle, GroveResult, Package, Trx};

#[async_trait]
pub trait ChainIface: Send + Sync {
    async fn get_curr_epoch(&self) -> u64;

    async fn inc_curr_epoch(&self);

    async fn get_curr_block_id(&self) -> u64;

    async fn inc_curr_block_id(&self);

    async fn set_last_update(&self, ts: i64);

    /// Persist the group's chain head info.
    async fn save_chain_info(&self) -> GroveResult<()>;

    /// Apply a block's trxs with this node's role-appropriate applier.
    async fn apply_trxs(&self, trxs: &[Trx]) -> GroveResult<()>;

    /// Verify a signature against a compressed base64url pubkey.
    fn verify_sign(&self, msg_hash: &[u8], sig: &[u8], pubkey: &str) -> GroveResult<bool>;

    fn is_owner(&self) -> bool;

    /// Publish a package to the group's pubsub topic.
    async fn broadcast(&self, pkg: Package) -> GroveResult<()>;

    /// Consensus-change subprotocol finished for `trx_id`.
    async fn change_consensus_done(&self, trx_id: &str, result: ChangeConsensusResultBundle);
}
