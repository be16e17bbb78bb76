// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! The per-group chain engine.
//!
//! `Chain` owns a group's mutable state and routes every inbound package:
//! trxs to the validator and (on producers) the buffer, heartbeat traffic
//! to the agreement instances, consensus messages to the rotation
//! subprotocol or the chain-info responder, sync requests to the provider
//! path, and sync responses to the syncer. Block application is strictly
//! serialized per group; groups never share mutable state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use async_trait::async_trait;

use grove_consensus::{BftConfig, ChainIface, ConsensusProposer, TrxBft};
use grove_keys::{aes_decode, parse_cipher_key, AccountKeystore};
use grove_storage::{ChainStorage, PostItem};
use grove_types::{
    codec, now_ts, AnnounceItem, AnnounceType, AppConfigItem, Block, ChainConfigItem, ChainError,
    ChangeConsensusResult, ChangeConsensusResultBundle, ConsensusMsg, ConsensusMsgType,
    ConsensusReq, ConsensusReqPayload, ConsensusResp, ConsensusType, EncryptType, GroupInfo,
    GroveResult, HBMsg, HBPayloadType, MessageCodec, NodeRole, Package, PackageType, ProducerBundle,
    ProducerItem, ReqBlkResult, ReqBlock, ReqBlockResp, Trx, TrxType, UserItem,
};

use crate::chaindata::ChainData;
use crate::conn::{ConnMgr, Delivery, DirectStream};
use crate::factory::TrxFactory;
use crate::syncer::{SyncTaskType, SyncerConfig, SyncerRunner, SyncerStatus, TaskResult};
use crate::validator;

/// Protocol version stamped on every trx this node signs.
pub const NODE_VERSION: &str = "2.0.0";

/// Per-group engine knobs; defaults match production cadence, tests dial
/// the pulses down.
#[derive(Debug, Clone)]
pub struct ChainOptions {
    pub propose_pulse_ms: u64,
    pub agreement_tick_len_ms: u64,
    pub agreement_tick_count: u64,
    pub batch_size: usize,
    pub syncer: SyncerConfig,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            propose_pulse_ms: grove_consensus::DEFAULT_PROPOSE_PULSE_MS,
            agreement_tick_len_ms: grove_consensus::DEFAULT_AGREEMENT_TICK_LEN_MS,
            agreement_tick_count: grove_consensus::DEFAULT_AGREEMENT_TICK_COUNT,
            batch_size: grove_consensus::DEFAULT_BATCH_SIZE,
            syncer: SyncerConfig::default(),
        }
    }
}

struct HeadState {
    epoch: u64,
    curr_block_id: u64,
    last_update: i64,
}

struct ConsensusRoles {
    producer: Option<Arc<TrxBft>>,
    proposer: Option<Arc<ConsensusProposer>>,
}

pub struct Chain {
    node_name: String,
    group_id: String,
    group_name: String,
    node_role: NodeRole,
    owner_pubkey: String,
    user_sign_pubkey: String,
    user_encrypt_pubkey: String,
    cipher_key_hex: String,
    cipher_key: [u8; 32],
    encrypt_type: EncryptType,
    consensus_type: ConsensusType,
    options: ChainOptions,
    head: RwLock<HeadState>,
    producer_pool: RwLock<HashMap<String, ProducerItem>>,
    user_pool: RwLock<HashMap<String, UserItem>>,
    storage: Arc<ChainStorage>,
    keystore: Arc<dyn AccountKeystore>,
    conn: Arc<dyn ConnMgr>,
    factory: TrxFactory,
    chaindata: ChainData,
    consensus: RwLock<Option<ConsensusRoles>>,
    syncer: Arc<SyncerRunner>,
    token: CancellationToken,
}

impl Chain {
    pub fn new(
        info: GroupInfo,
        node_name: &str,
        node_role: NodeRole,
        storage: Arc<ChainStorage>,
        keystore: Arc<dyn AccountKeystore>,
        conn: Arc<dyn ConnMgr>,
        options: ChainOptions,
        token: CancellationToken,
    ) -> GroveResult<Arc<Self>> {
        let cipher_key = parse_cipher_key(&info.cipher_key)?;
        let factory = TrxFactory::new(
            &info.group_id,
            NODE_VERSION,
            &info.user_sign_pubkey,
            cipher_key,
            Arc::clone(&storage),
            Arc::clone(&keystore),
        );
        let chaindata = ChainData::new(&info.group_id, Arc::clone(&storage));
        let syncer_config = options.syncer.clone();
        let syncer_token = token.child_token();

        Ok(Arc::new_cyclic(|weak| Self {
            node_name: node_name.to_string(),
            group_id: info.group_id.clone(),
            group_name: info.group_name.clone(),
            node_role,
            owner_pubkey: info.owner_pubkey.clone(),
            user_sign_pubkey: info.user_sign_pubkey.clone(),
            user_encrypt_pubkey: info.user_encrypt_pubkey.clone(),
            cipher_key_hex: info.cipher_key.clone(),
            cipher_key,
            encrypt_type: info.encrypt_type,
            consensus_type: info.consensus_type,
            options,
            head: RwLock::new(HeadState {
                epoch: info.epoch,
                curr_block_id: info.curr_block_id,
                last_update: info.last_update,
            }),
            producer_pool: RwLock::new(HashMap::new()),
            user_pool: RwLock::new(HashMap::new()),
            storage,
            keystore,
            conn,
            factory,
            chaindata,
            consensus: RwLock::new(None),
            syncer: SyncerRunner::new(&info.group_id, weak.clone(), syncer_config, syncer_token),
            token,
        }))
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn user_sign_pubkey(&self) -> &str {
        &self.user_sign_pubkey
    }

    pub fn node_role(&self) -> NodeRole {
        self.node_role
    }

    pub fn storage(&self) -> &Arc<ChainStorage> {
        &self.storage
    }

    pub fn factory(&self) -> &TrxFactory {
        &self.factory
    }

    pub(crate) fn curr_epoch_now(&self) -> u64 {
        self.head.read().epoch
    }

    pub fn group_info(&self) -> GroupInfo {
        let head = self.head.read();
        GroupInfo {
            group_id: self.group_id.clone(),
            group_name: self.group_name.clone(),
            owner_pubkey: self.owner_pubkey.clone(),
            user_sign_pubkey: self.user_sign_pubkey.clone(),
            user_encrypt_pubkey: self.user_encrypt_pubkey.clone(),
            cipher_key: self.cipher_key_hex.clone(),
            epoch: head.epoch,
            curr_block_id: head.curr_block_id,
            last_update: head.last_update,
            encrypt_type: self.encrypt_type,
            consensus_type: self.consensus_type,
        }
    }

    pub fn is_producer(&self, pubkey: &str) -> bool {
        self.producer_pool.read().contains_key(pubkey)
    }

    fn i_am_approved_producer(&self) -> bool {
        self.is_producer(&self.user_sign_pubkey)
    }

    fn quorum_f(&self) -> usize {
        self.producer_pool.read().len().saturating_sub(1) / 3
    }

    fn producer_keys_sorted(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.producer_pool.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn roles(&self) -> (Option<Arc<TrxBft>>, Option<Arc<ConsensusProposer>>) {
        let roles = self.consensus.read();
        match roles.as_ref() {
            Some(r) => (r.producer.clone(), r.proposer.clone()),
            None => (None, None),
        }
    }

    /// Spawn the dispatcher loop over this node's group inbox.
    pub fn start(self: &Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Delivery>) {
        let chain = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = chain.token.cancelled() => break,
                    delivery = inbox.recv() => {
                        match delivery {
                            Some(d) => chain.handle_package(d.pkg, d.reply).await,
                            None => break,
                        }
                    }
                }
            }
            debug!("<{}> dispatcher stopped", chain.group_id);
        });
    }

    /// Stop everything this group runs, in order: ticker/BFT, rotation
    /// sender, sync task, then the dispatcher.
    pub async fn stop(&self) {
        let (producer, proposer) = self.roles();
        if let Some(bft) = producer {
            bft.stop();
        }
        if let Some(proposer) = proposer {
            proposer.stop();
        }
        self.syncer.stop();
        self.token.cancel();
        info!("<{}> chain stopped", self.group_id);
    }

    // ---- dispatch ----

    /// Route one inbound package; validation failures on untrusted input
    /// are logged and dropped here, storage failures are surfaced loudly.
    pub async fn handle_package(&self, pkg: Package, stream: Option<DirectStream>) {
        let result = match pkg.package_type {
            PackageType::Block => match MessageCodec::decode::<Block>(&pkg.data) {
                Ok(block) => self.handle_block_pubsub(block).await,
                Err(e) => Err(e),
            },
            PackageType::Trx => match MessageCodec::decode::<Trx>(&pkg.data) {
                Ok(trx) => match trx.trx_type {
                    TrxType::ReqBlock | TrxType::ReqBlockResp => {
                        self.handle_trx_direct(trx, stream).await
                    }
                    _ => self.handle_trx_pubsub(trx).await,
                },
                Err(e) => Err(e),
            },
            PackageType::Hbb => match MessageCodec::decode::<HBMsg>(&pkg.data) {
                Ok(hb) => self.handle_hb(hb).await,
                Err(e) => Err(e),
            },
            PackageType::Consensus => match MessageCodec::decode::<ConsensusMsg>(&pkg.data) {
                Ok(msg) => self.handle_consensus_msg(msg).await,
                Err(e) => Err(e),
            },
        };

        if let Err(e) = result {
            match e {
                ChainError::Storage(_) => {
                    error!("<{}> storage failure while handling package: {}", self.group_id, e)
                }
                _ => warn!("<{}> drop package: {}", self.group_id, e),
            }
        }
    }

    /// Trx from the pubsub topic (§ intake contract).
    pub async fn handle_trx_pubsub(&self, mut trx: Trx) -> GroveResult<()> {
        if trx.version != NODE_VERSION {
            return Err(ChainError::VersionMismatch {
                got: trx.version,
                want: NODE_VERSION.to_string(),
            });
        }
        trx.data = codec::decompress(&trx.data)?;
        if !validator::verify_trx(&trx)? {
            return Err(ChainError::InvalidSignature);
        }

        match trx.trx_type {
            TrxType::Post
            | TrxType::Announce
            | TrxType::Producer
            | TrxType::User
            | TrxType::Schema
            | TrxType::AppConfig
            | TrxType::ChainConfig => {
                self.producer_add_trx(trx);
                Ok(())
            }
            // sync trxs have no business on the ordering topic
            TrxType::ReqBlock | TrxType::ReqBlockResp => Ok(()),
        }
    }

    /// Trx from a direct exchange: the sync request/response protocol.
    pub async fn handle_trx_direct(
        &self,
        mut trx: Trx,
        stream: Option<DirectStream>,
    ) -> GroveResult<()> {
        if trx.version != NODE_VERSION {
            return Err(ChainError::VersionMismatch {
                got: trx.version,
                want: NODE_VERSION.to_string(),
            });
        }
        trx.data = codec::decompress(&trx.data)?;
        if !validator::verify_trx(&trx)? {
            return Err(ChainError::InvalidSignature);
        }

        match trx.trx_type {
            TrxType::ReqBlock => {
                if trx.sender_pubkey == self.user_sign_pubkey {
                    return Ok(());
                }
                let Some(stream) = stream else {
                    debug!("<{}> block request without reply stream, drop", self.group_id);
                    return Ok(());
                };
                self.handle_req_blocks(trx, stream).await
            }
            TrxType::ReqBlockResp => {
                if trx.sender_pubkey == self.user_sign_pubkey {
                    return Ok(());
                }
                self.handle_req_block_resp(trx).await
            }
            _ => Ok(()),
        }
    }

    /// Verified non-sync trx: only active producers feed the buffer.
    fn producer_add_trx(&self, trx: Trx) {
        let (producer, _) = self.roles();
        let Some(bft) = producer else {
            return;
        };
        if !self.i_am_approved_producer() {
            return;
        }
        bft.add_trx(trx);
    }

    // ---- blocks ----

    /// BLOCK broadcast from the mesh.
    pub async fn handle_block_pubsub(&self, block: Block) -> GroveResult<()> {
        let bookkeeper = block.bookkeeping_pubkey.clone();
        if !self.is_producer(&bookkeeper) {
            warn!(
                "<{}> block <{}> from unregistered producer <{}>, reject",
                self.group_id, block.epoch, bookkeeper
            );
            return Ok(());
        }

        let (producer, _) = self.roles();
        if producer.is_some() && self.i_am_approved_producer() {
            debug!("<{}> approved producer ignores broadcast block", self.group_id);
            return Ok(());
        }

        match self.add_block(&block).await {
            Ok(()) => Ok(()),
            Err(ChainError::ParentNotExist(id)) => {
                info!(
                    "<{}> parent <{}> missing for epoch <{}>, sync from epoch <{}>",
                    self.group_id,
                    id,
                    block.epoch,
                    self.curr_epoch_now()
                );
                if let Err(e) = self.start_sync() {
                    debug!("<{}> sync not started: {}", self.group_id, e);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Validate, persist, apply, and advance to one block.
    ///
    /// Re-applying an already-known epoch only refreshes the stored copy,
    /// and only when the incoming block matches it.
    pub async fn add_block(&self, block: &Block) -> GroveResult<()> {
        if block.block_id == 0 {
            return Err(ChainError::InvalidData("genesis cannot be re-applied".to_string()));
        }
        if !self.is_producer(&block.bookkeeping_pubkey) {
            return Err(ChainError::InvalidData(format!(
                "bookkeeper <{}> not in producer pool",
                block.bookkeeping_pubkey
            )));
        }
        // authenticate before anything touches the store; the pool check
        // above only names a key, it proves nothing
        if !validator::verify_block(block)? {
            return Err(ChainError::InvalidSignature);
        }
        if block.epoch <= self.curr_epoch_now() {
            return self.upsert_known_block(block).await;
        }

        let parent = self.storage.get_block(&self.group_id, block.block_id - 1).await?;
        validator::valid_block_with_parent(block, &parent)?;

        self.storage.add_block(block).await?;
        self.apply_trxs_local(&block.trxs).await?;

        {
            let mut head = self.head.write();
            head.epoch = block.epoch;
            head.curr_block_id = block.block_id;
            head.last_update = now_ts();
        }
        self.storage.save_group(self.group_info()).await?;
        debug!(
            "<{}> applied block <{}> epoch <{}>",
            self.group_id, block.block_id, block.epoch
        );
        Ok(())
    }

    /// A verified block for an epoch this chain already covered: refresh
    /// the stored copy only when it matches what we hold. A different
    /// payload for the same epoch is a conflict, never a silent
    /// overwrite.
    async fn upsert_known_block(&self, block: &Block) -> GroveResult<()> {
        match self
            .storage
            .get_block_by_epoch(&self.group_id, block.epoch)
            .await
        {
            Some(stored) if stored.compute_hash()? == block.compute_hash()? => {
                debug!(
                    "<{}> block epoch <{}> already covered, upsert only",
                    self.group_id, block.epoch
                );
                self.storage.add_block(block).await
            }
            Some(_) => Err(ChainError::InvalidData(format!(
                "conflicting block for covered epoch <{}>",
                block.epoch
            ))),
            None => {
                debug!(
                    "<{}> epoch <{}> covered without a block, drop",
                    self.group_id, block.epoch
                );
                Ok(())
            }
        }
    }

    // ---- heartbeat ----

    async fn handle_hb(&self, hb: HBMsg) -> GroveResult<()> {
        match hb.payload_type {
            HBPayloadType::HbTrx => {
                if !self.i_am_approved_producer() {
                    return Ok(());
                }
                let (producer, _) = self.roles();
                match producer {
                    Some(bft) => bft.handle_hb_msg(&hb).await,
                    None => Ok(()),
                }
            }
            HBPayloadType::HbPsync => {
                let (_, proposer) = self.roles();
                match proposer {
                    Some(proposer) => proposer.handle_hb_msg(&hb).await,
                    None => Ok(()),
                }
            }
        }
    }

    // ---- consensus messages ----

    async fn handle_consensus_msg(&self, msg: ConsensusMsg) -> GroveResult<()> {
        if msg.hash_bytes()? != msg.msg_hash {
            return Err(ChainError::InvalidSignature);
        }
        if !grove_keys::verify_sig(&msg.msg_hash, &msg.sender_sign, &msg.sender_pubkey)? {
            return Err(ChainError::InvalidSignature);
        }

        match msg.msg_type {
            ConsensusMsgType::Req => match MessageCodec::decode::<ConsensusReqPayload>(&msg.payload)? {
                ConsensusReqPayload::ChangeConsensus(req) => {
                    let (_, proposer) = self.roles();
                    match proposer {
                        Some(proposer) => proposer.handle_cc_req(req).await,
                        None => Ok(()),
                    }
                }
                ConsensusReqPayload::ChainInfo(query) => self.handle_chain_info_req(query).await,
            },
            ConsensusMsgType::Resp => {
                // own attestation echoing back
                if self.producer_pool.read().len() != 1
                    && msg.sender_pubkey == self.user_sign_pubkey
                {
                    return Ok(());
                }
                if self
                    .storage
                    .is_psync_session_exist(&self.group_id, &msg.session_id)
                    .await
                {
                    debug!("<{}> session <{}> handled, ignore", self.group_id, msg.session_id);
                    return Ok(());
                }
                let resp: ConsensusResp = MessageCodec::decode(&msg.payload)?;
                let known_producer = self.is_producer(&msg.sender_pubkey)
                    || resp.cur_producers.contains(&msg.sender_pubkey);
                if !known_producer {
                    debug!(
                        "<{}> chain info resp from non-producer <{}>, ignore",
                        self.group_id, msg.sender_pubkey
                    );
                    return Ok(());
                }
                self.handle_psync_resp(&msg.session_id, resp).await
            }
        }
    }

    /// Producer-side answer to a chain-info query.
    async fn handle_chain_info_req(&self, query: ConsensusReq) -> GroveResult<()> {
        if !self.i_am_approved_producer() {
            return Ok(());
        }
        let resp = ConsensusResp {
            session_id: query.session_id.clone(),
            cur_chain_epoch: self.curr_epoch_now(),
            cur_producers: self.producer_keys_sorted(),
            producer_proof: None,
            sender_pubkey: self.user_sign_pubkey.clone(),
            timestamp: now_ts(),
        };
        let msg = self
            .signed_consensus_msg(
                &query.session_id,
                ConsensusMsgType::Resp,
                MessageCodec::encode_to_vec(&resp)?,
            )
            .await?;
        self.conn
            .broadcast(Package::wrap(PackageType::Consensus, &msg)?)
            .await
    }

    /// Chain-info attestation matched against the awaited sync session.
    async fn handle_psync_resp(&self, session_id: &str, resp: ConsensusResp) -> GroveResult<()> {
        let (task_id, task_type, _) =
            self.syncer.current_task().map_err(|_| ChainError::ConsensusMismatch)?;
        if task_type != SyncTaskType::ConsensusSync || task_id != session_id {
            return Err(ChainError::ConsensusMismatch);
        }

        if let Some(saved) = self.storage.get_current_psync_resp(&self.group_id).await {
            if saved.cur_chain_epoch > resp.cur_chain_epoch {
                debug!("<{}> chain info resp from old epoch, ignore", self.group_id);
                return Ok(());
            }
        }
        self.storage
            .upd_psync_resp(&self.group_id, session_id, resp.clone())
            .await?;

        if resp.cur_chain_epoch == self.curr_epoch_now() {
            self.syncer
                .report_consensus_result(session_id, TaskResult::SyncDone);
        } else {
            self.syncer
                .report_consensus_result(session_id, TaskResult::ContinueGetEpoch);
        }
        Ok(())
    }

    async fn signed_consensus_msg(
        &self,
        session_id: &str,
        msg_type: ConsensusMsgType,
        payload: Vec<u8>,
    ) -> GroveResult<ConsensusMsg> {
        let mut msg = ConsensusMsg {
            group_id: self.group_id.clone(),
            session_id: session_id.to_string(),
            msg_type,
            payload,
            sender_pubkey: self.user_sign_pubkey.clone(),
            sender_sign: Vec::new(),
            msg_hash: Vec::new(),
            timestamp: now_ts(),
        };
        let hash = msg.hash_bytes()?;
        msg.msg_hash = hash.clone();
        msg.sender_sign = self.keystore.sign(&self.group_id, &hash).await?;
        Ok(msg)
    }

    // ---- sync protocol ----

    /// Serve a block request on its reply stream. Non-producers stay
    /// silent on `BlockNotFound` since they are not authoritative about
    /// the chain tip.
    async fn handle_req_blocks(&self, trx: Trx, stream: DirectStream) -> GroveResult<()> {
        let plain = aes_decode(&self.cipher_key, &trx.data)?;
        let req: ReqBlock = MessageCodec::decode(&plain)?;

        let top_epoch = {
            let block_id = self.head.read().curr_block_id;
            self.storage.get_block(&self.group_id, block_id).await?.epoch
        };
        let (result, blocks) = self.chaindata.get_req_blocks(&req, top_epoch).await?;

        if result == ReqBlkResult::BlockNotFound && !self.i_am_approved_producer() {
            debug!("<{}> not a producer, skip BlockNotFound reply", self.group_id);
            return Ok(());
        }

        debug!(
            "<{}> serve block request from <{}>: {:?}, {} blocks after epoch <{}>",
            self.group_id,
            req.req_pubkey,
            result,
            blocks.len(),
            req.from_block
        );
        let resp_trx = self
            .factory
            .req_blocks_resp_trx(&req.req_pubkey, req.from_block, req.blks_requested, blocks, result)
            .await?;
        self.conn
            .send_reply(self.wire_package(&resp_trx)?, &stream)
            .await
    }

    /// Block response matched against the awaited sync task (§ result ×
    /// source matrix).
    async fn handle_req_block_resp(&self, trx: Trx) -> GroveResult<()> {
        let plain = aes_decode(&self.cipher_key, &trx.data)?;
        let resp: ReqBlockResp = MessageCodec::decode(&plain)?;

        if trx.sender_pubkey != resp.provider_pubkey {
            debug!("<{}> response sender/provider mismatch, drop", self.group_id);
            return Ok(());
        }
        if resp.requester_pubkey != self.user_sign_pubkey {
            return Ok(());
        }

        let (task_id, task_type, waiting_epoch) = match self.syncer.current_task() {
            Ok(task) => task,
            Err(_) => {
                debug!("<{}> block response with no task waiting", self.group_id);
                return Ok(());
            }
        };
        if task_type != SyncTaskType::GetEpoch {
            debug!(
                "<{}> block response while syncer busy elsewhere: {}",
                self.group_id,
                ChainError::SyncerStatus(format!("{:?}", self.syncer.status()))
            );
            return Ok(());
        }
        if resp.from_block != waiting_epoch {
            warn!(
                "<{}> {}",
                self.group_id,
                ChainError::EpochMismatch {
                    got: resp.from_block,
                    want: waiting_epoch
                }
            );
            return Ok(());
        }

        let from_producer = self.is_producer(&resp.provider_pubkey);
        debug!(
            "<{}> block response from <{}>: {:?}, {} blocks",
            self.group_id,
            resp.provider_pubkey,
            resp.result,
            resp.blocks.blocks.len()
        );

        match resp.result {
            ReqBlkResult::BlockNotFound => {
                if !from_producer {
                    return Ok(());
                }
                let done = self.syncer.config().authoritative_not_found
                    || self
                        .syncer
                        .note_block_not_found(&resp.provider_pubkey, self.quorum_f());
                if done {
                    self.syncer.report_get_epoch_result(&task_id, TaskResult::SyncDone);
                }
                Ok(())
            }
            ReqBlkResult::BlockInRespOnTop => {
                self.apply_synced_blocks(&resp.blocks.blocks).await?;
                if !from_producer {
                    return Ok(());
                }
                // keep going until f+1 producers confirm the tip
                self.syncer
                    .report_get_epoch_result(&task_id, TaskResult::ContinueGetEpoch);
                Ok(())
            }
            ReqBlkResult::BlockInResp => {
                self.apply_synced_blocks(&resp.blocks.blocks).await?;
                self.syncer
                    .report_get_epoch_result(&task_id, TaskResult::ContinueGetEpoch);
                Ok(())
            }
        }
    }

    async fn apply_synced_blocks(&self, blocks: &[Block]) -> GroveResult<()> {
        for block in blocks {
            if let Err(e) = self.add_block(block).await {
                warn!(
                    "<{}> apply synced block <{}> failed: {}",
                    self.group_id, block.block_id, e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) async fn broadcast_req_blocks(&self, epoch: u64, count: u32) -> GroveResult<()> {
        let trx = self.factory.req_blocks_trx(epoch, count).await?;
        self.conn.broadcast(self.wire_package(&trx)?).await
    }

    pub(crate) async fn broadcast_chain_info_req(&self, session_id: &str) -> GroveResult<()> {
        let query = ConsensusReq {
            session_id: session_id.to_string(),
            req_pubkey: self.user_sign_pubkey.clone(),
        };
        let msg = self
            .signed_consensus_msg(
                session_id,
                ConsensusMsgType::Req,
                MessageCodec::encode_to_vec(&ConsensusReqPayload::ChainInfo(query))?,
            )
            .await?;
        self.conn
            .broadcast(Package::wrap(PackageType::Consensus, &msg)?)
            .await
    }

    /// Compress a trx payload for the wire and wrap the envelope.
    fn wire_package(&self, trx: &Trx) -> GroveResult<Package> {
        let mut wire = trx.clone();
        wire.data = codec::compress(&wire.data)?;
        Package::wrap(PackageType::Trx, &wire)
    }

    // ---- public surface ----

    /// Broadcast a signed trx and, on producers, feed the local buffer.
    pub async fn enqueue_trx(&self, trx: Trx) -> GroveResult<()> {
        self.conn.broadcast(self.wire_package(&trx)?).await?;
        self.producer_add_trx(trx);
        Ok(())
    }

    /// Submit opaque POST content. In private groups the payload is sealed
    /// to every announced user plus this node.
    pub async fn post_content(&self, content: &[u8]) -> GroveResult<String> {
        let trx = match self.encrypt_type {
            EncryptType::Public => self.factory.post_trx(content, None).await?,
            EncryptType::Private => {
                let recipients = self.user_encrypt_pubkeys();
                self.factory.post_trx(content, Some(&recipients)).await?
            }
        };
        let trx_id = trx.trx_id.clone();
        self.enqueue_trx(trx).await?;
        Ok(trx_id)
    }

    fn user_encrypt_pubkeys(&self) -> Vec<String> {
        let mut keys = vec![self.user_encrypt_pubkey.clone()];
        for user in self.user_pool.read().values() {
            if user.encrypt_pubkey != self.user_encrypt_pubkey {
                keys.push(user.encrypt_pubkey.clone());
            }
        }
        keys
    }

    /// Owner entry point for rotating the producer set.
    pub async fn update_consensus(
        &self,
        producers: Vec<String>,
        agreement_tick_len_ms: u64,
        agreement_tick_count: u64,
    ) -> GroveResult<()> {
        if !self.is_owner_inner() {
            return Err(ChainError::InvalidData(
                "only the group owner can change consensus".to_string(),
            ));
        }
        let (_, proposer) = self.roles();
        let Some(proposer) = proposer else {
            return Err(ChainError::InvalidData(
                "no consensus proposer on this node".to_string(),
            ));
        };
        let start_from = self.curr_epoch_now() + 1;
        proposer
            .start_change_consensus(
                producers,
                "",
                agreement_tick_len_ms,
                agreement_tick_count,
                start_from,
                self.options.propose_pulse_ms,
            )
            .await
    }

    pub fn start_sync(&self) -> GroveResult<()> {
        self.syncer.start()
    }

    pub fn stop_sync(&self) {
        self.syncer.stop();
    }

    /// Query the producers for the chain state before syncing.
    pub fn get_consensus(&self) -> GroveResult<()> {
        self.syncer.start_consensus_sync()
    }

    pub fn get_syncer_status(&self) -> SyncerStatus {
        self.syncer.status()
    }

    // ---- pools ----

    /// Reload the producer pool from the store.
    pub async fn update_producer_list(&self) {
        let producers = self.storage.get_producers(&self.group_id).await;
        let mut pool = HashMap::new();
        for item in producers {
            let prefix = if item.producer_pubkey == self.owner_pubkey {
                "(owner)"
            } else {
                "(producer)"
            };
            info!(
                "<{}> load producer <{}{}>",
                self.group_id, item.producer_pubkey, prefix
            );
            pool.insert(item.producer_pubkey.clone(), item);
        }
        *self.producer_pool.write() = pool;
    }

    /// Reload the user pool and refresh user announcements.
    pub async fn update_user_list(&self) {
        let users = self.storage.get_users(&self.group_id).await;
        let mut pool = HashMap::new();
        for item in users {
            pool.insert(item.user_pubkey.clone(), item);
        }
        *self.user_pool.write() = pool;

        let announced = self
            .storage
            .get_announcements(&self.group_id, AnnounceType::AsUser)
            .await;
        for item in announced {
            let approved = self.user_pool.read().contains_key(&item.sign_pubkey);
            if let Err(e) = self
                .storage
                .update_announce_result(&self.group_id, AnnounceType::AsUser, &item.sign_pubkey, approved)
                .await
            {
                warn!("<{}> update announce result failed: {}", self.group_id, e);
            }
        }
    }

    async fn update_announced_producer_status(&self) {
        let announced = self
            .storage
            .get_announcements(&self.group_id, AnnounceType::AsProducer)
            .await;
        for item in announced {
            let approved = self.is_producer(&item.sign_pubkey);
            if let Err(e) = self
                .storage
                .update_announce_result(
                    &self.group_id,
                    AnnounceType::AsProducer,
                    &item.sign_pubkey,
                    approved,
                )
                .await
            {
                warn!("<{}> update announce result failed: {}", self.group_id, e);
            }
        }
    }

    /// Hand the refreshed producer set to the running BFT.
    fn update_producer_config(&self) {
        let (producer, _) = self.roles();
        if let Some(bft) = producer {
            bft.recreate_config(self.producer_keys_sorted());
        }
    }

    // ---- consensus assembly ----

    /// Build this node's consensus roles for the group.
    ///
    /// Producer nodes and the owner run the block proposer and the
    /// rotation subprotocol; plain full nodes only apply.
    pub fn create_consensus(self: &Arc<Self>) {
        let should_propose = match self.node_role {
            NodeRole::ProducerNode => true,
            NodeRole::FullNode => self.is_owner_inner(),
        };

        let mut roles = ConsensusRoles {
            producer: None,
            proposer: None,
        };

        if should_propose {
            let iface: Arc<dyn ChainIface> = Arc::clone(self) as Arc<dyn ChainIface>;
            let weak = Arc::downgrade(&iface);

            let mut config = BftConfig::new(
                &self.group_id,
                &self.node_name,
                &self.user_sign_pubkey,
                &self.owner_pubkey,
                self.producer_keys_sorted(),
            );
            config.batch_size = self.options.batch_size;
            config.propose_pulse_ms = self.options.propose_pulse_ms;
            config.agreement_tick_len_ms = self.options.agreement_tick_len_ms;
            config.agreement_tick_count = self.options.agreement_tick_count;

            info!("<{}> create block proposer", self.group_id);
            let bft = TrxBft::new(
                config,
                weak.clone(),
                Arc::clone(&self.storage),
                Arc::clone(&self.keystore),
                self.token.child_token(),
            );

            info!("<{}> create consensus proposer", self.group_id);
            let proposer = ConsensusProposer::new(
                &self.group_id,
                &self.node_name,
                &self.user_sign_pubkey,
                &self.owner_pubkey,
                weak,
                Arc::clone(&self.storage),
                Arc::clone(&self.keystore),
                self.token.child_token(),
            );

            if self.i_am_approved_producer() {
                bft.start_propose();
            }
            roles.producer = Some(bft);
            roles.proposer = Some(proposer);
        }

        *self.consensus.write() = Some(roles);
    }

    /// Start proposing if this node just became an approved producer.
    fn start_propose_if_approved(&self) {
        if !self.i_am_approved_producer() {
            return;
        }
        let (producer, _) = self.roles();
        if let Some(bft) = producer {
            bft.start_propose();
        }
    }

    // ---- appliers ----

    async fn apply_trxs_local(&self, trxs: &[Trx]) -> GroveResult<()> {
        match self.node_role {
            NodeRole::FullNode => self.apply_trxs_full_node(trxs).await,
            NodeRole::ProducerNode => self.apply_trxs_producer_node(trxs).await,
        }
    }

    /// Full-node applier: every trx type lands in state.
    pub async fn apply_trxs_full_node(&self, trxs: &[Trx]) -> GroveResult<()> {
        for trx in trxs {
            if self
                .storage
                .is_trx_exist(&self.group_id, &trx.trx_id, trx.nonce)
                .await
            {
                debug!("<{}> trx <{}> exists, update only", self.group_id, trx.trx_id);
                self.storage.add_trx(trx).await?;
                continue;
            }

            let plain = match self.decrypt_trx_data(trx).await {
                Ok(plain) => plain,
                Err(e) => {
                    // a private post sealed to others is not ours to read
                    if trx.trx_type == TrxType::Post && self.encrypt_type == EncryptType::Private {
                        debug!(
                            "<{}> cannot open sealed post <{}>, store encrypted",
                            self.group_id, trx.trx_id
                        );
                        self.storage.add_trx(trx).await?;
                        continue;
                    }
                    return Err(e);
                }
            };

            debug!("<{}> apply trx <{}>", self.group_id, trx.trx_id);
            match trx.trx_type {
                TrxType::Post => {
                    self.storage
                        .add_post(PostItem {
                            trx_id: trx.trx_id.clone(),
                            group_id: self.group_id.clone(),
                            sender_pubkey: trx.sender_pubkey.clone(),
                            content: plain,
                            timestamp: trx.timestamp,
                        })
                        .await?;
                }
                TrxType::AppConfig => {
                    let item: AppConfigItem = MessageCodec::decode(&plain)?;
                    self.storage.update_app_config(item).await?;
                }
                other => self.apply_shared_trx(other, &plain).await?,
            }

            // the persisted form stays encrypted
            self.storage.add_trx(trx).await?;
        }
        Ok(())
    }

    /// Producer-node applier: content-only types are skipped.
    pub async fn apply_trxs_producer_node(&self, trxs: &[Trx]) -> GroveResult<()> {
        for trx in trxs {
            if matches!(trx.trx_type, TrxType::Post | TrxType::AppConfig) {
                debug!(
                    "<{}> producer node skips trx <{}> of type {:?}",
                    self.group_id, trx.trx_id, trx.trx_type
                );
                continue;
            }
            if self
                .storage
                .is_trx_exist(&self.group_id, &trx.trx_id, trx.nonce)
                .await
            {
                self.storage.add_trx(trx).await?;
                continue;
            }

            let plain = self.decrypt_trx_data(trx).await?;
            debug!("<{}> apply trx <{}>", self.group_id, trx.trx_id);
            self.apply_shared_trx(trx.trx_type, &plain).await?;
            self.storage.add_trx(trx).await?;
        }
        Ok(())
    }

    /// Types both node roles apply.
    async fn apply_shared_trx(&self, trx_type: TrxType, plain: &[u8]) -> GroveResult<()> {
        match trx_type {
            TrxType::Producer => {
                let bundle: ProducerBundle = MessageCodec::decode(plain)?;
                for item in bundle.producers {
                    self.storage.update_producer(item).await?;
                }
                self.update_producer_list().await;
                self.update_announced_producer_status().await;
                self.update_producer_config();
                self.start_propose_if_approved();
            }
            TrxType::User => {
                let item: UserItem = MessageCodec::decode(plain)?;
                self.storage.update_user(item).await?;
                self.update_user_list().await;
            }
            TrxType::Announce => {
                let item: AnnounceItem = MessageCodec::decode(plain)?;
                self.storage.update_announce(item).await?;
            }
            TrxType::ChainConfig => {
                let item: ChainConfigItem = MessageCodec::decode(plain)?;
                self.storage.update_chain_config(item).await?;
            }
            other => {
                warn!("<{}> unsupported trx type {:?}, skip", self.group_id, other);
            }
        }
        Ok(())
    }

    /// Decrypt per the group's rules: sealed envelope for private POSTs,
    /// the shared cipher key for everything else.
    async fn decrypt_trx_data(&self, trx: &Trx) -> GroveResult<Vec<u8>> {
        if trx.trx_type == TrxType::Post && self.encrypt_type == EncryptType::Private {
            Ok(self.keystore.decrypt(&self.group_id, &trx.data).await?)
        } else {
            Ok(aes_decode(&self.cipher_key, &trx.data)?)
        }
    }

    fn is_owner_inner(&self) -> bool {
        self.user_sign_pubkey == self.owner_pubkey
    }
}

#[async_trait]
impl ChainIface for Chain {
    async fn get_curr_epoch(&self) -> u64 {
        self.head.read().epoch
    }

    async fn inc_curr_epoch(&self) {
        self.head.write().epoch += 1;
    }

    async fn get_curr_block_id(&self) -> u64 {
        self.head.read().curr_block_id
    }

    async fn inc_curr_block_id(&self) {
        self.head.write().curr_block_id += 1;
    }

    async fn set_last_update(&self, ts: i64) {
        self.head.write().last_update = ts;
    }

    async fn save_chain_info(&self) -> GroveResult<()> {
        self.storage.save_group(self.group_info()).await
    }

    async fn apply_trxs(&self, trxs: &[Trx]) -> GroveResult<()> {
        self.apply_trxs_local(trxs).await
    }

    fn verify_sign(&self, msg_hash: &[u8], sig: &[u8], pubkey: &str) -> GroveResult<bool> {
        Ok(grove_keys::verify_sig(msg_hash, sig, pubkey)?)
    }

    fn is_owner(&self) -> bool {
        self.is_owner_inner()
    }

    async fn broadcast(&self, pkg: Package) -> GroveResult<()> {
        self.conn.broadcast(pkg).await
    }

    /// Rotation finished: the pool becomes the agreed list plus the owner.
    async fn change_consensus_done(&self, trx_id: &str, result: ChangeConsensusResultBundle) {
        if result.result == ChangeConsensusResult::Timeout {
            warn!(
                "<{}> change consensus <{}> timed out: {}",
                self.group_id,
                result.req.req_id,
                ChainError::ConsensusTimeout
            );
            return;
        }

        let mut pubkeys = result.req.producer_pubkey_list.clone();
        if !pubkeys.contains(&self.owner_pubkey) {
            pubkeys.push(self.owner_pubkey.clone());
        }
        let items: Vec<ProducerItem> = pubkeys
            .iter()
            .map(|pubkey| ProducerItem {
                group_id: self.group_id.clone(),
                producer_pubkey: pubkey.clone(),
                blocks_produced: 0,
                memo: String::new(),
                timestamp: now_ts(),
            })
            .collect();

        if let Err(e) = self.storage.replace_producers(&self.group_id, items).await {
            error!("<{}> persist rotated producers failed: {}", self.group_id, e);
            return;
        }

        // align with the agreed starting epoch; never move backwards
        {
            let mut head = self.head.write();
            let aligned = result.req.start_from_epoch.saturating_sub(1);
            if head.epoch < aligned {
                head.epoch = aligned;
            }
        }
        if let Err(e) = self.storage.save_group(self.group_info()).await {
            error!("<{}> persist chain info failed: {}", self.group_id, e);
        }

        self.update_producer_list().await;
        self.update_announced_producer_status().await;
        self.update_producer_config();
        self.start_propose_if_approved();

        info!(
            "<{}> change consensus done for trx <{}>, pool size {}",
            self.group_id,
            trx_id,
            self.producer_pool.read().len()
        );
    }
}
