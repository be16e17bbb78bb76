// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Quorum parameters for one group's agreement instances.

/// Interval between propose ticks.
pub const DEFAULT_PROPOSE_PULSE_MS: u64 = 5000;

/// One agreement tick; also the consensus-change rebroadcast interval.
pub const DEFAULT_AGREEMENT_TICK_LEN_MS: u64 = 1000;

/// Ticks before an agreement round is abandoned.
pub const DEFAULT_AGREEMENT_TICK_COUNT: u64 = 10;

/// Trxs drained from the buffer into one proposal.
pub const DEFAULT_BATCH_SIZE: usize = 30;

/// Soft cap of the in-memory trx buffer.
pub const DEFAULT_TRX_BUFFER_CAP: usize = 4096;

/// Static configuration of one BFT instance.
#[derive(Debug, Clone)]
pub struct BftConfig {
    pub group_id: String,
    pub node_name: String,
    pub my_pubkey: String,
    pub owner_pubkey: String,
    /// Quorum size.
    pub n: usize,
    /// Tolerated faults; `(n - 1) / 3` for the trx quorum, 0 for the
    /// consensus-change quorum.
    pub f: usize,
    /// Producer sign keys, the proposer slots of every agreement round.
    pub nodes: Vec<String>,
    pub batch_size: usize,
    pub propose_pulse_ms: u64,
    pub agreement_tick_len_ms: u64,
    pub agreement_tick_count: u64,
}

impl BftConfig {
    /// Config for the per-epoch trx quorum.
    pub fn new(
        group_id: &str,
        node_name: &str,
        my_pubkey: &str,
        owner_pubkey: &str,
        nodes: Vec<String>,
    ) -> Self {
        let n = nodes.len();
        Self {
            group_id: group_id.to_string(),
            node_name: node_name.to_string(),
            my_pubkey: my_pubkey.to_string(),
            owner_pubkey: owner_pubkey.to_string(),
            n,
            f: n.saturating_sub(1) / 3,
            nodes,
            batch_size: DEFAULT_BATCH_SIZE,
            propose_pulse_ms: DEFAULT_PROPOSE_PULSE_MS,
            agreement_tick_len_ms: DEFAULT_AGREEMENT_TICK_LEN_MS,
            agreement_tick_count: DEFAULT_AGREEMENT_TICK_COUNT,
        }
    }

    /// Config for the consensus-change quorum: unanimity over the proposed
    /// producer list, one proof per proposal.
    pub fn unanimity(
        group_id: &str,
        node_name: &str,
        my_pubkey: &str,
        owner_pubkey: &str,
        nodes: Vec<String>,
    ) -> Self {
        let mut cfg = Self::new(group_id, node_name, my_pubkey, owner_pubkey, nodes);
        cfg.f = 0;
        cfg.batch_size = 1;
        cfg
    }

    /// Total stall budget for one agreement round.
    pub fn agreement_budget_ms(&self) -> u64 {
        self.agreement_tick_len_ms * self.agreement_tick_count
    }
}
