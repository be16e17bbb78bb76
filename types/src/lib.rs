// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Core data model and wire messages for the Grove chain engine.
//!
//! Every group in Grove is an independent permissioned chain. This crate
//! defines the entities that cross crate boundaries: group metadata,
//! transactions, blocks, the pubsub/wire message envelopes, and the typed
//! errors the engine surfaces.

pub mod block;
pub mod codec;
pub mod group;
pub mod message;
pub mod trx;

pub use block::Block;
pub use codec::MessageCodec;
pub use group::{
    AnnounceItem, AnnounceResult, AnnounceType, AppConfigItem, ChainConfigItem, ConsensusType,
    EncryptType, GroupInfo, NodeRole, ProducerItem, UserItem,
};
pub use message::{
    AcsMsg, AcsPayload, BbaContent, BbaMsg, BlocksBundle, ChangeConsensusReq, ChangeConsensusResp,
    ChangeConsensusResult, ChangeConsensusResultBundle, ConsensusMsg, ConsensusMsgType,
    ConsensusProof, ConsensusReq, ConsensusReqPayload, ConsensusResp, HBMsg, HBPayloadType,
    Package, PackageType, ProducerBundle, RbcContent, RbcMsg, ReqBlkResult, ReqBlock, ReqBlockResp,
    TrxBundle, EMPTY_TRX_BUNDLE,
};
pub use trx::{Trx, TrxType, TRX_DATA_LIMIT};

/// Result alias used across the engine.
pub type GroveResult<T> = Result<T, ChainError>;

/// Wall-clock timestamp in nanoseconds, the time base for trxs and blocks.
pub fn now_ts() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Typed error kinds surfaced by the chain engine.
///
/// Validation failures on untrusted input are logged and dropped by the
/// dispatcher; `ParentNotExist` schedules a sync; storage failures are never
/// swallowed.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("version mismatch: got {got}, node runs {want}")]
    VersionMismatch { got: String, want: String },

    #[error("signature or hash verification failed")]
    InvalidSignature,

    #[error("block parent not found, block_id <{0}>")]
    ParentNotExist(u64),

    #[error("response epoch {got} does not match awaited epoch {want}")]
    EpochMismatch { got: u64, want: u64 },

    #[error("operation illegal in current syncer state: {0}")]
    SyncerStatus(String),

    #[error("response arrived with no outstanding task")]
    NoTaskWait,

    #[error("consensus response does not match awaited session")]
    ConsensusMismatch,

    #[error("consensus exceeded its tick budget")]
    ConsensusTimeout,

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("key error: {0}")]
    Key(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
