// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Wire message definitions for the Grove protocol.
//!
//! Everything that crosses the pubsub mesh travels inside a [`Package`]
//! envelope. Agreement-round traffic (reliable broadcast and binary
//! agreement sub-messages) is nested inside [`HBMsg`]; the consensus-change
//! subprotocol and the chain-info attestation share [`ConsensusMsg`].

use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::codec::{self, MessageCodec};
use crate::trx::Trx;
use crate::GroveResult;

/// Sentinel proposed when a producer has nothing buffered. Agreement still
/// completes and the epoch advances without emitting a block.
pub const EMPTY_TRX_BUNDLE: &[u8] = b"EMPTY_TRX_BUNDLE";

/// Pubsub envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageType {
    Block,
    Trx,
    Hbb,
    Consensus,
}

/// Pubsub envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub package_type: PackageType,
    pub data: Vec<u8>,
}

impl Package {
    pub fn wrap<T: Serialize>(package_type: PackageType, inner: &T) -> GroveResult<Self> {
        Ok(Self {
            package_type,
            data: MessageCodec::encode_to_vec(inner)?,
        })
    }
}

/// Payload discriminator for [`HBMsg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HBPayloadType {
    /// Trx agreement traffic, routed to the epoch proposer.
    HbTrx,
    /// Consensus-change agreement traffic, routed to the nested quorum.
    HbPsync,
}

/// Heartbeat envelope carrying one agreement sub-message.
///
/// `epoch` routes trx traffic to the propose task of that epoch; messages
/// for past epochs are dropped and future ones buffered briefly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HBMsg {
    pub epoch: u64,
    pub payload_type: HBPayloadType,
    pub payload: Vec<u8>,
}

/// One agreement sub-message, scoped by session.
///
/// The session is the epoch (as a string) for trx agreement, and the
/// change-consensus req id for the nested quorum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcsMsg {
    pub session_id: String,
    pub payload: AcsPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AcsPayload {
    Rbc(RbcMsg),
    Bba(BbaMsg),
}

/// Reliable-broadcast sub-message for one proposer slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RbcMsg {
    /// Whose proposal this broadcast instance carries.
    pub proposer: String,
    pub sender: String,
    pub content: RbcContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RbcContent {
    /// Proposer's value.
    Init(Vec<u8>),
    /// Echo of the received value.
    Echo(Vec<u8>),
    /// Ready for the value with this hash.
    Ready(Vec<u8>),
}

/// Binary-agreement sub-message for one proposer slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BbaMsg {
    pub proposer: String,
    pub sender: String,
    pub round: u32,
    pub content: BbaContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BbaContent {
    Bval(bool),
    Aux(bool),
}

/// Bundle of trxs proposed into one agreement round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrxBundle {
    pub trxs: Vec<Trx>,
}

/// Payload of a PRODUCER trx: the producer set the owner promotes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProducerBundle {
    pub producers: Vec<crate::group::ProducerItem>,
}

/// Consensus message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMsgType {
    Req,
    Resp,
}

/// Signed envelope for consensus-change requests and chain-info traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusMsg {
    pub group_id: String,
    pub session_id: String,
    pub msg_type: ConsensusMsgType,
    pub payload: Vec<u8>,
    pub sender_pubkey: String,
    pub sender_sign: Vec<u8>,
    pub msg_hash: Vec<u8>,
    pub timestamp: i64,
}

impl ConsensusMsg {
    /// Canonical SHA-256 with hash and signature fields zeroed.
    pub fn hash_bytes(&self) -> GroveResult<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.msg_hash = Vec::new();
        unsigned.sender_sign = Vec::new();
        let bytes = MessageCodec::encode_to_vec(&unsigned)?;
        Ok(codec::sha256(&bytes))
    }
}

/// What a `ConsensusMsg` REQ carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConsensusReqPayload {
    ChangeConsensus(ChangeConsensusReq),
    ChainInfo(ConsensusReq),
}

/// Chain-info query from a lagging node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusReq {
    pub session_id: String,
    pub req_pubkey: String,
}

/// Producer attestation of the current chain state, answering a
/// [`ConsensusReq`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResp {
    pub session_id: String,
    pub cur_chain_epoch: u64,
    pub cur_producers: Vec<String>,
    /// PRODUCER trx that promoted the current pool, when one exists.
    pub producer_proof: Option<Trx>,
    pub sender_pubkey: String,
    pub timestamp: i64,
}

/// Owner request to rotate the producer quorum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeConsensusReq {
    pub req_id: String,
    pub group_id: String,
    /// Strictly increasing per group; a higher nonce supersedes an
    /// in-flight request.
    pub nonce: u64,
    pub producer_pubkey_list: Vec<String>,
    pub agreement_tick_len_ms: u64,
    pub agreement_tick_count: u64,
    pub start_from_epoch: u64,
    pub trx_epoch_tick_len_ms: u64,
    pub sender_pubkey: String,
    pub msg_hash: Vec<u8>,
    pub sender_sign: Vec<u8>,
}

impl ChangeConsensusReq {
    pub fn hash_bytes(&self) -> GroveResult<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.msg_hash = Vec::new();
        unsigned.sender_sign = Vec::new();
        let bytes = MessageCodec::encode_to_vec(&unsigned)?;
        Ok(codec::sha256(&bytes))
    }
}

/// A producer's signed acceptance of a [`ChangeConsensusReq`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeConsensusResp {
    pub resp_id: String,
    pub group_id: String,
    pub sender_pubkey: String,
    pub req: ChangeConsensusReq,
    pub msg_hash: Vec<u8>,
    pub sender_sign: Vec<u8>,
}

impl ChangeConsensusResp {
    pub fn hash_bytes(&self) -> GroveResult<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.msg_hash = Vec::new();
        unsigned.sender_sign = Vec::new();
        let bytes = MessageCodec::encode_to_vec(&unsigned)?;
        Ok(codec::sha256(&bytes))
    }
}

/// Req/resp pair a producer feeds into the nested unanimity quorum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusProof {
    pub req: ChangeConsensusReq,
    pub resp: ChangeConsensusResp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeConsensusResult {
    Success,
    Timeout,
}

/// Outcome handed to the chain when the consensus-change subprotocol ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeConsensusResultBundle {
    pub result: ChangeConsensusResult,
    pub req: ChangeConsensusReq,
    pub resps: Vec<ChangeConsensusResp>,
}

/// Block request, sent as a REQ_BLOCK trx payload over a direct stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqBlock {
    pub group_id: String,
    /// Epoch to start from.
    pub from_block: u64,
    pub blks_requested: u32,
    pub req_pubkey: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReqBlkResult {
    BlockNotFound,
    BlockInRespOnTop,
    BlockInResp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlocksBundle {
    pub blocks: Vec<Block>,
}

/// Provider answer to a [`ReqBlock`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqBlockResp {
    pub group_id: String,
    pub requester_pubkey: String,
    pub provider_pubkey: String,
    pub result: ReqBlkResult,
    pub from_block: u64,
    pub blks_requested: u32,
    pub blks_provided: u32,
    pub blocks: BlocksBundle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_roundtrip() {
        let msg = HBMsg {
            epoch: 3,
            payload_type: HBPayloadType::HbTrx,
            payload: vec![1, 2, 3],
        };
        let pkg = Package::wrap(PackageType::Hbb, &msg).unwrap();
        assert_eq!(pkg.package_type, PackageType::Hbb);
        let back: HBMsg = MessageCodec::decode(&pkg.data).unwrap();
        assert_eq!(back.epoch, 3);
        assert_eq!(back.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_change_consensus_req_hash_zeroes_sign_fields() {
        let mut req = ChangeConsensusReq {
            req_id: "r1".into(),
            group_id: "g1".into(),
            nonce: 1,
            producer_pubkey_list: vec!["p1".into()],
            agreement_tick_len_ms: 1000,
            agreement_tick_count: 10,
            start_from_epoch: 0,
            trx_epoch_tick_len_ms: 5000,
            sender_pubkey: "owner".into(),
            msg_hash: Vec::new(),
            sender_sign: Vec::new(),
        };
        let clean = req.hash_bytes().unwrap();
        req.msg_hash = clean.clone();
        req.sender_sign = vec![7; 64];
        assert_eq!(clean, req.hash_bytes().unwrap());
    }
}
