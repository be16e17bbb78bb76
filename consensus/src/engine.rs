// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! The per-epoch block proposer.
//!
//! `TrxBft` owns the propose ticker for one group. Every pulse it drains a
//! batch from the trx buffer, feeds it into a fresh ACS instance for
//! `current_epoch + 1`, and drives the instance with inbound heartbeat
//! messages until it outputs the epoch's agreed bundles. The union of the
//! bundles is deterministically ordered, packaged into a block, persisted,
//! applied, and broadcast; the epoch advances whether or not a block was
//! emitted.
//!
//! A round that outlives its agreement budget is abandoned and the next
//! tick starts fresh.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use grove_keys::AccountKeystore;
use grove_storage::ChainStorage;
use grove_types::{
    now_ts, AcsMsg, Block, ChainError, GroveResult, HBMsg, HBPayloadType, MessageCodec, Package,
    PackageType, Trx, TrxBundle, EMPTY_TRX_BUNDLE,
};

use crate::acs::{Acs, AcsStep};
use crate::buffer::TrxBuffer;
use crate::chain_iface::ChainIface;
use crate::config::{BftConfig, DEFAULT_TRX_BUFFER_CAP};

/// How many epochs ahead of the running task heartbeat messages are
/// buffered before being dropped.
const FUTURE_EPOCH_WINDOW: u64 = 8;

/// Most messages parked per future epoch.
const FUTURE_MSG_CAP: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposeStatus {
    Idle,
    Running,
    Closed,
}

struct ProposeTask {
    epoch: u64,
    acs: Acs,
    started: Instant,
}

struct EngineState {
    status: ProposeStatus,
    curr_task: Option<ProposeTask>,
    /// Epoch of the most recent propose task; anchors the buffering
    /// window while no task is running.
    last_epoch: u64,
    future_msgs: BTreeMap<u64, Vec<AcsMsg>>,
}

impl EngineState {
    /// Park a heartbeat for `epoch` if it sits inside the window after
    /// `anchor`; everything else is dropped.
    fn park_future_msg(&mut self, anchor: u64, epoch: u64, msg: AcsMsg) {
        if epoch <= anchor || epoch > anchor.saturating_add(FUTURE_EPOCH_WINDOW) {
            return;
        }
        let pending = self.future_msgs.entry(epoch).or_default();
        if pending.len() < FUTURE_MSG_CAP {
            pending.push(msg);
        }
    }
}

pub struct TrxBft {
    config: RwLock<BftConfig>,
    chain: Weak<dyn ChainIface>,
    storage: Arc<ChainStorage>,
    keystore: Arc<dyn AccountKeystore>,
    buffer: Arc<TrxBuffer>,
    state: Mutex<EngineState>,
    token: CancellationToken,
}

impl TrxBft {
    pub fn new(
        config: BftConfig,
        chain: Weak<dyn ChainIface>,
        storage: Arc<ChainStorage>,
        keystore: Arc<dyn AccountKeystore>,
        token: CancellationToken,
    ) -> Arc<Self> {
        let buffer = Arc::new(TrxBuffer::new(&config.group_id, DEFAULT_TRX_BUFFER_CAP));
        Arc::new(Self {
            config: RwLock::new(config),
            chain,
            storage,
            keystore,
            buffer,
            state: Mutex::new(EngineState {
                status: ProposeStatus::Idle,
                curr_task: None,
                last_epoch: 0,
                future_msgs: BTreeMap::new(),
            }),
            token,
        })
    }

    fn chain(&self) -> GroveResult<Arc<dyn ChainIface>> {
        self.chain
            .upgrade()
            .ok_or_else(|| ChainError::InvalidData("chain engine dropped".to_string()))
    }

    pub fn status(&self) -> ProposeStatus {
        self.state.lock().status
    }

    pub fn buffer(&self) -> &Arc<TrxBuffer> {
        &self.buffer
    }

    /// Queue a verified trx for inclusion in a future proposal.
    pub fn add_trx(&self, trx: Trx) {
        debug!(
            "<{}> buffer trx <{}>",
            self.config.read().group_id,
            trx.trx_id
        );
        self.buffer.push(trx);
    }

    /// Swap in a new producer set; the next propose task picks it up.
    pub fn recreate_config(&self, nodes: Vec<String>) {
        let mut config = self.config.write();
        info!(
            "<{}> rebuild bft config, quorum size {} -> {}",
            config.group_id,
            config.n,
            nodes.len()
        );
        config.n = nodes.len();
        config.f = config.n.saturating_sub(1) / 3;
        config.nodes = nodes;
    }

    /// Start the propose ticker. Cancelling the engine token stops it.
    pub fn start_propose(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.status == ProposeStatus::Running {
                return;
            }
            state.status = ProposeStatus::Running;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let pulse = Duration::from_millis(engine.config.read().propose_pulse_ms);
            // first pulse after one full interval, like a wall-clock ticker
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + pulse, pulse);
            loop {
                tokio::select! {
                    _ = engine.token.cancelled() => {
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = engine.propose_tick().await {
                            warn!("<{}> propose tick failed: {}", engine.config.read().group_id, e);
                        }
                    }
                }
            }
            engine.state.lock().status = ProposeStatus::Closed;
            debug!("<{}> propose ticker stopped", engine.config.read().group_id);
        });
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    /// One ticker pulse: skip if a round is still within budget, abandon a
    /// stalled round, otherwise open the next epoch's round.
    async fn propose_tick(&self) -> GroveResult<()> {
        let (group_id, batch_size, budget) = {
            let config = self.config.read();
            (
                config.group_id.clone(),
                config.batch_size,
                Duration::from_millis(config.agreement_budget_ms()),
            )
        };

        {
            let mut state = self.state.lock();
            if let Some(task) = &state.curr_task {
                if task.started.elapsed() < budget {
                    debug!("<{}> task <{}> still running, skip tick", group_id, task.epoch);
                    return Ok(());
                }
                warn!(
                    "<{}> task <{}> exceeded agreement budget: {}",
                    group_id,
                    task.epoch,
                    ChainError::ConsensusTimeout
                );
                // the next tick retries this epoch, keep it parkable
                state.last_epoch = task.epoch.saturating_sub(1);
                state.curr_task = None;
                return Ok(());
            }
        }

        let chain = self.chain()?;
        let epoch = chain.get_curr_epoch().await + 1;

        let trxs = self.buffer.get_n_random(batch_size);
        let proposal = if trxs.is_empty() {
            EMPTY_TRX_BUNDLE.to_vec()
        } else {
            MessageCodec::encode_to_vec(&TrxBundle { trxs })?
        };

        debug!("<{}> propose task for epoch <{}>", group_id, epoch);
        let (outbound, output) = {
            let mut state = self.state.lock();
            // a task may have appeared while we fetched the epoch
            if state.curr_task.is_some() {
                return Ok(());
            }
            let config = self.config.read().clone();
            let mut acs = Acs::new(config, &epoch.to_string());
            let first = acs.propose(proposal);
            let (mut outbound, mut output) = drive(&mut acs, first);

            state.curr_task = Some(ProposeTask {
                epoch,
                acs,
                started: Instant::now(),
            });
            state.last_epoch = epoch;

            // drain heartbeat traffic that arrived ahead of this round
            let buffered = state.future_msgs.remove(&epoch).unwrap_or_default();
            state
                .future_msgs
                .retain(|&e, _| e > epoch && e <= epoch + FUTURE_EPOCH_WINDOW);
            let task = state.curr_task.as_mut().expect("just set");
            for msg in buffered {
                let step = task.acs.handle_msg(&msg);
                let (more_out, more_output) = drive(&mut task.acs, step);
                outbound.extend(more_out);
                if more_output.is_some() {
                    output = more_output;
                }
            }
            (outbound, output)
        };

        self.broadcast_acs(epoch, outbound).await?;
        if let Some(result) = output {
            self.acs_done(epoch, result).await?;
        }
        Ok(())
    }

    /// Route one inbound heartbeat to the matching round.
    pub async fn handle_hb_msg(&self, hb: &HBMsg) -> GroveResult<()> {
        let msg: AcsMsg = MessageCodec::decode(&hb.payload)?;
        let (outbound, output, epoch) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.curr_task.as_mut() {
                None => {
                    let anchor = state.last_epoch;
                    state.park_future_msg(anchor, hb.epoch, msg);
                    return Ok(());
                }
                Some(task) if hb.epoch < task.epoch => {
                    debug!(
                        "<{}> drop hb msg for past epoch <{}>",
                        self.config.read().group_id,
                        hb.epoch
                    );
                    return Ok(());
                }
                Some(task) if hb.epoch > task.epoch => {
                    let anchor = task.epoch;
                    state.park_future_msg(anchor, hb.epoch, msg);
                    return Ok(());
                }
                Some(task) => {
                    let step = task.acs.handle_msg(&msg);
                    let (outbound, output) = drive(&mut task.acs, step);
                    (outbound, output, task.epoch)
                }
            }
        };

        self.broadcast_acs(epoch, outbound).await?;
        if let Some(result) = output {
            self.acs_done(epoch, result).await?;
        }
        Ok(())
    }

    async fn broadcast_acs(&self, epoch: u64, outbound: Vec<AcsMsg>) -> GroveResult<()> {
        if outbound.is_empty() {
            return Ok(());
        }
        let chain = self.chain()?;
        for msg in outbound {
            let hb = HBMsg {
                epoch,
                payload_type: HBPayloadType::HbTrx,
                payload: MessageCodec::encode_to_vec(&msg)?,
            };
            chain.broadcast(Package::wrap(PackageType::Hbb, &hb)?).await?;
        }
        Ok(())
    }

    /// Agreement reached for `epoch`: union, order, package, advance.
    async fn acs_done(&self, epoch: u64, result: BTreeMap<String, Vec<u8>>) -> GroveResult<()> {
        let (group_id, owner_pubkey) = {
            let config = self.config.read();
            (config.group_id.clone(), config.owner_pubkey.clone())
        };
        debug!("<{}> acs done, epoch <{}>", group_id, epoch);

        // union all bundles, dedup by trx id, first proposer (sorted) wins
        let mut union: BTreeMap<String, Trx> = BTreeMap::new();
        for (proposer, bytes) in &result {
            if bytes.as_slice() == EMPTY_TRX_BUNDLE {
                continue;
            }
            let bundle: TrxBundle = match MessageCodec::decode(bytes) {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!("<{}> undecodable bundle from <{}>: {}", group_id, proposer, e);
                    continue;
                }
            };
            for trx in bundle.trxs {
                union.entry(trx.trx_id.clone()).or_insert(trx);
            }
        }

        let chain = self.chain()?;
        if !union.is_empty() {
            let trxs = sort_trxs(union.into_values().collect(), &owner_pubkey);
            match self.build_block(epoch, trxs).await {
                Ok(packaged) => {
                    for trx in &packaged {
                        self.buffer.delete(&trx.trx_id);
                    }
                    chain.inc_curr_block_id().await;
                }
                Err(e) => {
                    warn!("<{}> build block failed at epoch <{}>: {}", group_id, epoch, e);
                    self.state.lock().curr_task = None;
                    return Err(e);
                }
            }
        }

        chain.inc_curr_epoch().await;
        chain.set_last_update(now_ts()).await;
        chain.save_chain_info().await?;
        info!("<{}> chain info updated, epoch <{}>", group_id, epoch);

        self.state.lock().curr_task = None;
        Ok(())
    }

    /// Build, persist, apply, and broadcast the block for this epoch.
    async fn build_block(&self, epoch: u64, trxs: Vec<Trx>) -> GroveResult<Vec<Trx>> {
        let (group_id, my_pubkey) = {
            let config = self.config.read();
            (config.group_id.clone(), config.my_pubkey.clone())
        };
        let chain = self.chain()?;

        let parent_id = chain.get_curr_block_id().await;
        let parent = self.storage.get_block(&group_id, parent_id).await?;

        let mut block = Block {
            block_id: parent.block_id + 1,
            group_id: group_id.clone(),
            epoch,
            prev_hash: parent.compute_hash()?,
            trxs: trxs.clone(),
            bookkeeping_pubkey: my_pubkey,
            bookkeeping_sign: Vec::new(),
            timestamp: now_ts(),
        };
        let hash = block.compute_hash()?;
        block.bookkeeping_sign = self.keystore.sign(&group_id, &hash).await?;

        self.storage.add_block(&block).await?;
        chain.apply_trxs(&block.trxs).await?;
        chain
            .broadcast(Package::wrap(PackageType::Block, &block)?)
            .await?;
        debug!(
            "<{}> built block <{}> epoch <{}> with {} trxs",
            group_id,
            block.block_id,
            epoch,
            block.trxs.len()
        );
        Ok(trxs)
    }
}

/// Feed the instance its own outbound messages until quiescent, returning
/// everything that must go on the wire plus the output if it completed.
pub(crate) fn drive(
    acs: &mut Acs,
    first: AcsStep,
) -> (Vec<AcsMsg>, Option<BTreeMap<String, Vec<u8>>>) {
    let mut outbound = Vec::new();
    let mut output = first.output;
    let mut queue: VecDeque<AcsMsg> = first.outbound.into();
    while let Some(msg) = queue.pop_front() {
        outbound.push(msg.clone());
        let step = acs.handle_msg(&msg);
        queue.extend(step.outbound);
        if step.output.is_some() {
            output = step.output;
        }
    }
    (outbound, output)
}

/// The deterministic in-block trx order: partition by sender, newest first
/// within a partition, partitions by sender key ascending, owner last.
pub fn sort_trxs(trxs: Vec<Trx>, owner_pubkey: &str) -> Vec<Trx> {
    let mut by_sender: BTreeMap<String, Vec<Trx>> = BTreeMap::new();
    for trx in trxs {
        by_sender.entry(trx.sender_pubkey.clone()).or_default().push(trx);
    }
    for partition in by_sender.values_mut() {
        partition.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }

    let owner_partition = by_sender.remove(owner_pubkey);
    let mut result: Vec<Trx> = by_sender.into_values().flatten().collect();
    if let Some(owner_trxs) = owner_partition {
        result.extend(owner_trxs);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_types::{AcsPayload, BbaContent, BbaMsg, TrxType};

    fn trx(id: &str, sender: &str, timestamp: i64) -> Trx {
        Trx {
            trx_id: id.to_string(),
            group_id: "g1".to_string(),
            trx_type: TrxType::Post,
            data: vec![],
            nonce: 0,
            timestamp,
            version: "2.0.0".to_string(),
            sender_pubkey: sender.to_string(),
            sender_sign: vec![],
        }
    }

    #[test]
    fn test_sort_partitions_by_sender_owner_last() {
        let sorted = sort_trxs(
            vec![
                trx("t1", "owner", 10),
                trx("t2", "bbb", 10),
                trx("t3", "aaa", 10),
            ],
            "owner",
        );
        let senders: Vec<&str> = sorted.iter().map(|t| t.sender_pubkey.as_str()).collect();
        assert_eq!(senders, vec!["aaa", "bbb", "owner"]);
    }

    #[test]
    fn test_sort_within_sender_newest_first() {
        let sorted = sort_trxs(
            vec![trx("old", "aaa", 1), trx("new", "aaa", 9), trx("mid", "aaa", 5)],
            "owner",
        );
        let ids: Vec<&str> = sorted.iter().map(|t| t.trx_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_sort_is_deterministic_across_input_orders() {
        let a = vec![trx("t1", "x", 3), trx("t2", "y", 1), trx("t3", "x", 7)];
        let mut b = a.clone();
        b.reverse();
        let sa: Vec<String> = sort_trxs(a, "z").into_iter().map(|t| t.trx_id).collect();
        let sb: Vec<String> = sort_trxs(b, "z").into_iter().map(|t| t.trx_id).collect();
        assert_eq!(sa, sb);
    }

    fn hb_payload(epoch: u64) -> AcsMsg {
        AcsMsg {
            session_id: epoch.to_string(),
            payload: AcsPayload::Bba(BbaMsg {
                proposer: "p0".to_string(),
                sender: "p1".to_string(),
                round: 1,
                content: BbaContent::Bval(true),
            }),
        }
    }

    #[test]
    fn test_future_parking_is_windowed_and_capped() {
        let mut state = EngineState {
            status: ProposeStatus::Idle,
            curr_task: None,
            last_epoch: 5,
            future_msgs: BTreeMap::new(),
        };

        // at or behind the anchor: dropped
        state.park_future_msg(5, 5, hb_payload(5));
        state.park_future_msg(5, 3, hb_payload(3));
        assert!(state.future_msgs.is_empty());

        // inside the window: parked; past it: dropped
        state.park_future_msg(5, 6, hb_payload(6));
        state.park_future_msg(5, 5 + FUTURE_EPOCH_WINDOW, hb_payload(5 + FUTURE_EPOCH_WINDOW));
        state.park_future_msg(5, 6 + FUTURE_EPOCH_WINDOW, hb_payload(6 + FUTURE_EPOCH_WINDOW));
        state.park_future_msg(5, u64::MAX, hb_payload(u64::MAX));
        assert_eq!(state.future_msgs.len(), 2);

        // one epoch never grows past the cap
        for _ in 0..(FUTURE_MSG_CAP + 16) {
            state.park_future_msg(5, 7, hb_payload(7));
        }
        assert_eq!(state.future_msgs[&7].len(), FUTURE_MSG_CAP);
    }
}
