// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Group metadata and the per-group membership records.
//!
//! A group is the root entity: an independent permissioned chain with its
//! own producer set, cipher key, and epoch counter. The epoch only advances
//! on a completed agreement round or on sync-applied blocks.

use serde::{Deserialize, Serialize};

/// How trx payloads in this group are encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptType {
    /// Payloads encrypted with the shared group cipher key.
    Public,
    /// POST payloads additionally sealed to every announced user key.
    Private,
}

/// Consensus flavor of the group. Only proof-of-authority quorums exist
/// today; the field is kept on the wire for forward compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusType {
    Poa,
}

/// Role this node plays for a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Keeps full content state (posts, app configs).
    FullNode,
    /// Orders blocks but skips content-only state.
    ProducerNode,
}

/// Mutable chain head info for one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_id: String,
    pub group_name: String,
    pub owner_pubkey: String,
    /// This node's signing key for the group, compressed base64url.
    pub user_sign_pubkey: String,
    /// This node's encryption key for sealed POST payloads.
    pub user_encrypt_pubkey: String,
    /// Hex-encoded 32-byte AES key shared by the group.
    pub cipher_key: String,
    pub epoch: u64,
    pub curr_block_id: u64,
    pub last_update: i64,
    pub encrypt_type: EncryptType,
    pub consensus_type: ConsensusType,
}

/// One registered producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerItem {
    pub group_id: String,
    pub producer_pubkey: String,
    pub blocks_produced: u64,
    pub memo: String,
    pub timestamp: i64,
}

/// One registered user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserItem {
    pub group_id: String,
    pub user_pubkey: String,
    pub encrypt_pubkey: String,
    pub memo: String,
    pub timestamp: i64,
}

/// What a node announced itself as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnnounceType {
    AsUser,
    AsProducer,
}

/// Approval state of an announcement, recomputed whenever the matching
/// pool changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnnounceResult {
    Announced,
    Approved,
}

/// An announcement record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceItem {
    pub group_id: String,
    pub sign_pubkey: String,
    pub encrypt_pubkey: String,
    pub announce_type: AnnounceType,
    pub result: AnnounceResult,
    pub memo: String,
    pub timestamp: i64,
}

/// Application-level config entry, visible to full nodes only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfigItem {
    pub group_id: String,
    pub name: String,
    pub value: String,
    pub memo: String,
    pub timestamp: i64,
}

/// Chain-level parameter entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfigItem {
    pub group_id: String,
    pub name: String,
    pub value: String,
    pub memo: String,
    pub timestamp: i64,
}
