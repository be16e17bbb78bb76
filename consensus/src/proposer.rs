// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Owner-initiated producer rotation.
//!
//! The owner signs a `ChangeConsensusReq` and rebroadcasts it every
//! agreement tick until the new quorum completes or the tick budget runs
//! out. Every producer named in the request answers with a signed proof
//! (req + resp) and feeds it into a nested unanimity quorum over the new
//! producer list (`f = 0`, batch 1). When that quorum outputs, the chain
//! is told the rotation is done; when the owner is missing from its own
//! list it appends itself locally so the quorum can complete.
//!
//! A request with a strictly higher nonce supersedes the in-flight session.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use grove_keys::AccountKeystore;
use grove_storage::ChainStorage;
use grove_types::{
    now_ts, AcsMsg, ChainError, ChangeConsensusReq, ChangeConsensusResp, ChangeConsensusResult,
    ChangeConsensusResultBundle, ConsensusMsg, ConsensusMsgType, ConsensusProof,
    ConsensusReqPayload, GroveResult, HBMsg, HBPayloadType, MessageCodec, Package, PackageType,
};

use crate::acs::Acs;
use crate::chain_iface::ChainIface;
use crate::config::BftConfig;
use crate::engine::drive as drive_session;

/// Consensus-nonce role key in the nonce table.
const CONSENSUS_NONCE_ROLE: &str = "consensus";

struct ChangeSession {
    req: ChangeConsensusReq,
    acs: Acs,
}

struct ProposerState {
    curr_session: Option<ChangeSession>,
    last_accepted_nonce: Option<u64>,
    /// Trx id of the PRODUCER trx this rotation answers; empty on nodes
    /// that only received the request.
    trx_id: String,
    sender_cancel: Option<CancellationToken>,
    /// Quorum traffic that raced ahead of its session's request,
    /// drained when the session opens.
    pending_msgs: HashMap<String, Vec<AcsMsg>>,
}

/// Bounds on the raced-ahead buffer.
const PENDING_SESSION_CAP: usize = 8;
const PENDING_MSG_CAP: usize = 1024;

pub struct ConsensusProposer {
    group_id: String,
    node_name: String,
    my_pubkey: String,
    owner_pubkey: String,
    chain: Weak<dyn ChainIface>,
    storage: Arc<ChainStorage>,
    keystore: Arc<dyn AccountKeystore>,
    state: Mutex<ProposerState>,
    token: CancellationToken,
}

impl ConsensusProposer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group_id: &str,
        node_name: &str,
        my_pubkey: &str,
        owner_pubkey: &str,
        chain: Weak<dyn ChainIface>,
        storage: Arc<ChainStorage>,
        keystore: Arc<dyn AccountKeystore>,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            group_id: group_id.to_string(),
            node_name: node_name.to_string(),
            my_pubkey: my_pubkey.to_string(),
            owner_pubkey: owner_pubkey.to_string(),
            chain,
            storage,
            keystore,
            state: Mutex::new(ProposerState {
                curr_session: None,
                last_accepted_nonce: None,
                trx_id: String::new(),
                sender_cancel: None,
                pending_msgs: HashMap::new(),
            }),
            token,
        })
    }

    fn chain(&self) -> GroveResult<Arc<dyn ChainIface>> {
        self.chain
            .upgrade()
            .ok_or_else(|| ChainError::InvalidData("chain engine dropped".to_string()))
    }

    pub fn stop(&self) {
        if let Some(cancel) = self.state.lock().sender_cancel.take() {
            cancel.cancel();
        }
        self.token.cancel();
    }

    /// Owner entry point: sign and keep broadcasting the rotation request.
    pub async fn start_change_consensus(
        self: &Arc<Self>,
        producers: Vec<String>,
        trx_id: &str,
        agreement_tick_len_ms: u64,
        agreement_tick_count: u64,
        start_from_epoch: u64,
        trx_epoch_tick_len_ms: u64,
    ) -> GroveResult<()> {
        debug!("<{}> start change consensus", self.group_id);

        let sender_cancel = {
            let mut state = self.state.lock();
            if let Some(prev) = state.sender_cancel.take() {
                prev.cancel();
            }
            state.trx_id = trx_id.to_string();
            let cancel = self.token.child_token();
            state.sender_cancel = Some(cancel.clone());
            cancel
        };

        let nonce = self
            .storage
            .next_nonce(&self.group_id, CONSENSUS_NONCE_ROLE)
            .await?;
        debug!("<{}> next consensus nonce <{}>", self.group_id, nonce);

        let mut req = ChangeConsensusReq {
            req_id: uuid::Uuid::new_v4().to_string(),
            group_id: self.group_id.clone(),
            nonce,
            producer_pubkey_list: producers,
            agreement_tick_len_ms,
            agreement_tick_count,
            start_from_epoch,
            trx_epoch_tick_len_ms,
            sender_pubkey: self.my_pubkey.clone(),
            msg_hash: Vec::new(),
            sender_sign: Vec::new(),
        };
        let hash = req.hash_bytes()?;
        req.msg_hash = hash.clone();
        req.sender_sign = self.keystore.sign(&self.group_id, &hash).await?;

        // the request must be on the wire before this node's own quorum
        // traffic, or peers drop messages for a session they never saw
        self.broadcast_req(&req).await?;
        self.handle_cc_req(req.clone()).await?;

        let proposer = Arc::clone(self);
        tokio::spawn(async move {
            let mut round = 1;
            while round < req.agreement_tick_count {
                tokio::select! {
                    _ = sender_cancel.cancelled() => {
                        debug!("<{}> change consensus sender cancelled", proposer.group_id);
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(req.agreement_tick_len_ms)) => {}
                }
                debug!(
                    "<{}> change consensus round <{}> send req <{}>",
                    proposer.group_id, round, req.req_id
                );
                if let Err(e) = proposer.broadcast_req(&req).await {
                    warn!("<{}> broadcast change consensus req failed: {}", proposer.group_id, e);
                }
                round += 1;
            }
            tokio::select! {
                _ = sender_cancel.cancelled() => {
                    return;
                }
                _ = tokio::time::sleep(Duration::from_millis(req.agreement_tick_len_ms)) => {}
            }

            // tick budget exhausted without agreement
            warn!(
                "<{}> change consensus <{}> failed: {}",
                proposer.group_id,
                req.req_id,
                ChainError::ConsensusTimeout
            );
            let trx_id = {
                let mut state = proposer.state.lock();
                state.curr_session = None;
                std::mem::take(&mut state.trx_id)
            };
            if let Ok(chain) = proposer.chain() {
                chain
                    .change_consensus_done(
                        &trx_id,
                        ChangeConsensusResultBundle {
                            result: ChangeConsensusResult::Timeout,
                            req: req.clone(),
                            resps: Vec::new(),
                        },
                    )
                    .await;
            }
        });

        Ok(())
    }

    async fn broadcast_req(&self, req: &ChangeConsensusReq) -> GroveResult<()> {
        let payload =
            MessageCodec::encode_to_vec(&ConsensusReqPayload::ChangeConsensus(req.clone()))?;
        let mut msg = ConsensusMsg {
            group_id: self.group_id.clone(),
            session_id: req.req_id.clone(),
            msg_type: ConsensusMsgType::Req,
            payload,
            sender_pubkey: self.my_pubkey.clone(),
            sender_sign: Vec::new(),
            msg_hash: Vec::new(),
            timestamp: now_ts(),
        };
        let hash = msg.hash_bytes()?;
        msg.msg_hash = hash.clone();
        msg.sender_sign = self.keystore.sign(&self.group_id, &hash).await?;

        self.chain()?
            .broadcast(Package::wrap(PackageType::Consensus, &msg)?)
            .await
    }

    /// Receiver side: validate the request and join the nested quorum.
    pub async fn handle_cc_req(&self, mut req: ChangeConsensusReq) -> GroveResult<()> {
        debug!("<{}> handle change consensus req <{}>", self.group_id, req.req_id);
        let chain = self.chain()?;

        if req.sender_pubkey != self.owner_pubkey {
            debug!(
                "<{}> req <{}> not from group owner, ignore",
                self.group_id, req.req_id
            );
            return Ok(());
        }

        if req.hash_bytes()? != req.msg_hash {
            return Err(ChainError::InvalidSignature);
        }
        if !chain.verify_sign(&req.msg_hash, &req.sender_sign, &req.sender_pubkey)? {
            return Err(ChainError::InvalidSignature);
        }

        {
            let state = self.state.lock();
            if let Some(session) = &state.curr_session {
                if session.req.req_id == req.req_id {
                    // periodic rebroadcast of the running session
                    return Ok(());
                }
            }
            if let Some(last) = state.last_accepted_nonce {
                if req.nonce <= last {
                    debug!(
                        "<{}> req <{}> nonce <{}> not above <{}>, ignore",
                        self.group_id, req.req_id, req.nonce, last
                    );
                    return Ok(());
                }
            }
        }

        let is_owner = chain.is_owner();
        let in_list = req.producer_pubkey_list.contains(&self.my_pubkey);
        if !is_owner && !in_list {
            debug!("<{}> req <{}> is not for me, ignore", self.group_id, req.req_id);
            return Ok(());
        }
        // every participant appends a missing owner so the quorum's node
        // sets agree and the owner can finish the round
        if !req.producer_pubkey_list.contains(&self.owner_pubkey) {
            debug!(
                "<{}> owner missing from producer list, append for liveness",
                self.group_id
            );
            req.producer_pubkey_list.push(self.owner_pubkey.clone());
        }

        // signed acceptance + proof for the nested quorum
        let mut resp = ChangeConsensusResp {
            resp_id: uuid::Uuid::new_v4().to_string(),
            group_id: self.group_id.clone(),
            sender_pubkey: self.my_pubkey.clone(),
            req: req.clone(),
            msg_hash: Vec::new(),
            sender_sign: Vec::new(),
        };
        let hash = resp.hash_bytes()?;
        resp.msg_hash = hash.clone();
        resp.sender_sign = self.keystore.sign(&self.group_id, &hash).await?;

        let proof = ConsensusProof {
            req: req.clone(),
            resp,
        };
        let proof_bytes = MessageCodec::encode_to_vec(&proof)?;

        let config = BftConfig::unanimity(
            &self.group_id,
            &self.node_name,
            &self.my_pubkey,
            &self.owner_pubkey,
            req.producer_pubkey_list.clone(),
        );

        let (outbound, output) = {
            let mut state = self.state.lock();
            if state.curr_session.is_some() {
                info!("<{}> supersede in-flight change consensus session", self.group_id);
            }
            state.last_accepted_nonce = Some(req.nonce);
            let mut acs = Acs::new(config, &req.req_id);
            let first = acs.propose(proof_bytes);
            let (mut outbound, mut output) = drive_session(&mut acs, first);

            // quorum traffic may have raced ahead of the request
            let buffered = state.pending_msgs.remove(&req.req_id).unwrap_or_default();
            state.pending_msgs.clear();
            for msg in buffered {
                let step = acs.handle_msg(&msg);
                let (more_out, more_output) = drive_session(&mut acs, step);
                outbound.extend(more_out);
                if more_output.is_some() {
                    output = more_output;
                }
            }

            state.curr_session = Some(ChangeSession { req, acs });
            (outbound, output)
        };

        self.broadcast_psync(outbound).await?;
        if let Some(result) = output {
            self.session_done(result).await?;
        }
        Ok(())
    }

    /// Inbound nested-quorum traffic for the running session.
    pub async fn handle_hb_msg(&self, hb: &HBMsg) -> GroveResult<()> {
        let msg: AcsMsg = MessageCodec::decode(&hb.payload)?;
        let (outbound, output) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.curr_session.as_mut() {
                Some(session) if session.acs.session_id() == msg.session_id => {
                    let step = session.acs.handle_msg(&msg);
                    drive_session(&mut session.acs, step)
                }
                _ => {
                    // not ours (yet): park it until the request shows up
                    if state.pending_msgs.len() >= PENDING_SESSION_CAP
                        && !state.pending_msgs.contains_key(&msg.session_id)
                    {
                        state.pending_msgs.clear();
                    }
                    let pending = state.pending_msgs.entry(msg.session_id.clone()).or_default();
                    if pending.len() < PENDING_MSG_CAP {
                        pending.push(msg);
                    }
                    return Ok(());
                }
            }
        };

        self.broadcast_psync(outbound).await?;
        if let Some(result) = output {
            self.session_done(result).await?;
        }
        Ok(())
    }

    async fn broadcast_psync(&self, outbound: Vec<AcsMsg>) -> GroveResult<()> {
        if outbound.is_empty() {
            return Ok(());
        }
        let chain = self.chain()?;
        for msg in outbound {
            let hb = HBMsg {
                epoch: 0,
                payload_type: HBPayloadType::HbPsync,
                payload: MessageCodec::encode_to_vec(&msg)?,
            };
            chain.broadcast(Package::wrap(PackageType::Hbb, &hb)?).await?;
        }
        Ok(())
    }

    /// The nested quorum agreed: collect proofs, notify the chain, stop
    /// the sender.
    async fn session_done(&self, result: BTreeMap<String, Vec<u8>>) -> GroveResult<()> {
        let (req, trx_id, sender_cancel) = {
            let mut state = self.state.lock();
            let Some(session) = state.curr_session.take() else {
                return Ok(());
            };
            (
                session.req,
                std::mem::take(&mut state.trx_id),
                state.sender_cancel.take(),
            )
        };

        let mut resps = Vec::new();
        for (proposer, bytes) in result {
            match MessageCodec::decode::<ConsensusProof>(&bytes) {
                Ok(proof) if proof.req.req_id == req.req_id => resps.push(proof.resp),
                Ok(_) => warn!(
                    "<{}> proof from <{}> for a different session, skip",
                    self.group_id, proposer
                ),
                Err(e) => warn!(
                    "<{}> undecodable proof from <{}>: {}",
                    self.group_id, proposer, e
                ),
            }
        }

        info!(
            "<{}> change consensus <{}> agreed with {} proofs",
            self.group_id,
            req.req_id,
            resps.len()
        );

        if let Some(cancel) = sender_cancel {
            cancel.cancel();
        }

        self.chain()?
            .change_consensus_done(
                &trx_id,
                ChangeConsensusResultBundle {
                    result: ChangeConsensusResult::Success,
                    req,
                    resps,
                },
            )
            .await;
        Ok(())
    }
}
