// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Lagging-node catch-up.
//!
//! A single-slot task runner per group. `GetEpoch` tasks broadcast a block
//! request for everything past the current epoch and hand inbound
//! responses to the chain, which applies the blocks and reports back a
//! task result. A request that stays unanswered past its timeout is
//! retried as `ContinueGetEpoch` on the same epoch. A `GetEpoch` task ends
//! as `SyncDone` only once `f+1` distinct producers answered
//! `BlockNotFound` (the `authoritative_not_found` debug flag restores the
//! weak first-answer behavior).
//!
//! `ConsensusSync` tasks broadcast a chain-info query and wait for a
//! producer attestation of the current chain state; a response showing a
//! higher epoch chains straight into a `GetEpoch` run.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use grove_types::{ChainError, GroveResult};

use crate::chain::Chain;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncerStatus {
    Idle,
    SyncingForward,
    ConsensusSync,
    /// Reserved for replaying locally stored blocks.
    LocalSyncing,
    SyncFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTaskType {
    GetEpoch,
    ConsensusSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    SyncDone,
    ContinueGetEpoch,
    SyncFail,
}

#[derive(Debug, Clone)]
pub struct SyncerConfig {
    /// Blocks asked for per request.
    pub blocks_per_request: u32,
    /// Budget for one request before it is retried.
    pub req_timeout: Duration,
    /// Debug flag: accept the first producer `BlockNotFound` as
    /// authoritative instead of waiting for `f+1`.
    pub authoritative_not_found: bool,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            blocks_per_request: 10,
            req_timeout: Duration::from_secs(30),
            authoritative_not_found: false,
        }
    }
}

struct CurrentTask {
    task_id: String,
    task_type: SyncTaskType,
    waiting_epoch: u64,
    /// Producers that answered `BlockNotFound` for this epoch.
    not_found_from: HashSet<String>,
    result_tx: mpsc::UnboundedSender<TaskResult>,
}

struct SyncState {
    status: SyncerStatus,
    curr_task: Option<CurrentTask>,
    run_cancel: Option<CancellationToken>,
}

pub struct SyncerRunner {
    group_id: String,
    chain: Weak<Chain>,
    config: SyncerConfig,
    state: Mutex<SyncState>,
    token: CancellationToken,
}

impl SyncerRunner {
    pub fn new(
        group_id: &str,
        chain: Weak<Chain>,
        config: SyncerConfig,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            group_id: group_id.to_string(),
            chain,
            config,
            state: Mutex::new(SyncState {
                status: SyncerStatus::Idle,
                curr_task: None,
                run_cancel: None,
            }),
            token,
        })
    }

    pub fn config(&self) -> &SyncerConfig {
        &self.config
    }

    pub fn status(&self) -> SyncerStatus {
        self.state.lock().status
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.status(), SyncerStatus::Idle)
    }

    /// Start a forward sync from the current epoch.
    pub fn start(self: &Arc<Self>) -> GroveResult<()> {
        let cancel = self.begin(SyncerStatus::SyncingForward)?;
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner.run_get_epoch(cancel).await;
        });
        Ok(())
    }

    /// Ask the producers where the chain is before deciding to sync.
    pub fn start_consensus_sync(self: &Arc<Self>) -> GroveResult<()> {
        let cancel = self.begin(SyncerStatus::ConsensusSync)?;
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            if runner.run_consensus_sync(cancel.clone()).await {
                runner.state.lock().status = SyncerStatus::SyncingForward;
                runner.run_get_epoch(cancel).await;
            }
        });
        Ok(())
    }

    /// Cancel whatever task is in flight; late responses are dropped on
    /// arrival.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(cancel) = state.run_cancel.take() {
            cancel.cancel();
        }
        state.curr_task = None;
        state.status = SyncerStatus::Idle;
    }

    fn begin(&self, status: SyncerStatus) -> GroveResult<CancellationToken> {
        let mut state = self.state.lock();
        match state.status {
            SyncerStatus::Idle | SyncerStatus::SyncFailed => {}
            other => {
                return Err(ChainError::SyncerStatus(format!(
                    "syncer busy: {other:?}"
                )))
            }
        }
        state.status = status;
        let cancel = self.token.child_token();
        state.run_cancel = Some(cancel.clone());
        Ok(cancel)
    }

    async fn run_get_epoch(&self, cancel: CancellationToken) {
        debug!("<{}> get-epoch sync started", self.group_id);
        loop {
            let Some(chain) = self.chain.upgrade() else {
                return;
            };
            let epoch = chain.curr_epoch_now();
            let (tx, mut rx) = mpsc::unbounded_channel();
            {
                let mut state = self.state.lock();
                state.curr_task = Some(CurrentTask {
                    task_id: epoch.to_string(),
                    task_type: SyncTaskType::GetEpoch,
                    waiting_epoch: epoch,
                    not_found_from: HashSet::new(),
                    result_tx: tx,
                });
            }

            if let Err(e) = chain
                .broadcast_req_blocks(epoch, self.config.blocks_per_request)
                .await
            {
                warn!("<{}> broadcast block request failed: {}", self.group_id, e);
            }
            drop(chain);

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("<{}> sync cancelled", self.group_id);
                    self.finish(SyncerStatus::Idle);
                    return;
                }
                r = rx.recv() => r.unwrap_or(TaskResult::SyncFail),
                _ = tokio::time::sleep(self.config.req_timeout) => {
                    debug!(
                        "<{}> no valid response for epoch <{}>, retry",
                        self.group_id, epoch
                    );
                    TaskResult::ContinueGetEpoch
                }
            };

            match result {
                TaskResult::SyncDone => {
                    info!("<{}> sync done at epoch <{}>", self.group_id, epoch);
                    self.finish(SyncerStatus::Idle);
                    return;
                }
                TaskResult::ContinueGetEpoch => continue,
                TaskResult::SyncFail => {
                    warn!("<{}> sync failed at epoch <{}>", self.group_id, epoch);
                    self.finish(SyncerStatus::SyncFailed);
                    return;
                }
            }
        }
    }

    /// Returns true when the chain turned out to be ahead and a forward
    /// sync should follow.
    async fn run_consensus_sync(&self, cancel: CancellationToken) -> bool {
        loop {
            let Some(chain) = self.chain.upgrade() else {
                return false;
            };
            let session_id = uuid::Uuid::new_v4().to_string();
            let (tx, mut rx) = mpsc::unbounded_channel();
            {
                let mut state = self.state.lock();
                state.curr_task = Some(CurrentTask {
                    task_id: session_id.clone(),
                    task_type: SyncTaskType::ConsensusSync,
                    waiting_epoch: 0,
                    not_found_from: HashSet::new(),
                    result_tx: tx,
                });
            }

            if let Err(e) = chain.broadcast_chain_info_req(&session_id).await {
                warn!("<{}> broadcast chain info query failed: {}", self.group_id, e);
            }
            drop(chain);

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    self.finish(SyncerStatus::Idle);
                    return false;
                }
                r = rx.recv() => r.unwrap_or(TaskResult::SyncFail),
                _ = tokio::time::sleep(self.config.req_timeout) => {
                    debug!(
                        "<{}> chain info session <{}> unanswered, retry",
                        self.group_id, session_id
                    );
                    continue;
                }
            };

            match result {
                TaskResult::SyncDone => {
                    info!("<{}> chain info confirms local epoch, no sync", self.group_id);
                    self.finish(SyncerStatus::Idle);
                    return false;
                }
                TaskResult::ContinueGetEpoch => return true,
                TaskResult::SyncFail => {
                    self.finish(SyncerStatus::SyncFailed);
                    return false;
                }
            }
        }
    }

    fn finish(&self, status: SyncerStatus) {
        let mut state = self.state.lock();
        state.curr_task = None;
        state.run_cancel = None;
        state.status = status;
    }

    /// The task a response must match, or `NoTaskWait`.
    pub(crate) fn current_task(&self) -> GroveResult<(String, SyncTaskType, u64)> {
        let state = self.state.lock();
        state
            .curr_task
            .as_ref()
            .map(|t| (t.task_id.clone(), t.task_type, t.waiting_epoch))
            .ok_or(ChainError::NoTaskWait)
    }

    /// Record one producer's `BlockNotFound`; true once `f+1` distinct
    /// producers agree.
    pub(crate) fn note_block_not_found(&self, provider: &str, f: usize) -> bool {
        let mut state = self.state.lock();
        let Some(task) = state.curr_task.as_mut() else {
            return false;
        };
        task.not_found_from.insert(provider.to_string());
        task.not_found_from.len() >= f + 1
    }

    pub(crate) fn report_get_epoch_result(&self, task_id: &str, result: TaskResult) {
        self.report(SyncTaskType::GetEpoch, task_id, result);
    }

    pub(crate) fn report_consensus_result(&self, session_id: &str, result: TaskResult) {
        self.report(SyncTaskType::ConsensusSync, session_id, result);
    }

    fn report(&self, task_type: SyncTaskType, task_id: &str, result: TaskResult) {
        let state = self.state.lock();
        let Some(task) = state.curr_task.as_ref() else {
            return;
        };
        if task.task_type != task_type || task.task_id != task_id {
            debug!(
                "<{}> result for stale task <{}> dropped",
                self.group_id, task_id
            );
            return;
        }
        let _ = task.result_tx.send(result);
    }
}
