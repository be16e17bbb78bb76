// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Binary Byzantine agreement, one instance per proposer slot.
//!
//! Round structure per Mostéfaoui et al.: each node broadcasts `Bval(est)`,
//! relays a value on `f+1` supports, accepts it into `bin_values` on
//! `2f+1`, then broadcasts `Aux`. Once `n-f` aux votes carry accepted
//! values the round closes against the round coin. The coin is derived
//! deterministically from the slot id and round, which keeps all honest
//! nodes on the same schedule.
//!
//! After deciding, the instance keeps answering later rounds with the
//! decided value so lagging peers terminate too.

use std::collections::{HashMap, HashSet};

use grove_types::{codec, BbaContent};

/// Result of feeding one message into the instance.
#[derive(Debug, Default)]
pub struct BbaStep {
    /// (round, content) pairs to broadcast.
    pub outbound: Vec<(u32, BbaContent)>,
    pub decided: Option<bool>,
}

#[derive(Debug)]
pub struct Bba {
    n: usize,
    f: usize,
    proposer: String,
    round: u32,
    est: bool,
    input_given: bool,
    decided: Option<bool>,
    bvals_sent: HashSet<(u32, bool)>,
    aux_sent: HashSet<u32>,
    /// round -> value -> supporters
    bvals: HashMap<(u32, bool), HashSet<String>>,
    /// round -> sender -> aux value
    auxes: HashMap<u32, HashMap<String, bool>>,
    /// round -> accepted binary values
    bin_values: HashMap<u32, HashSet<bool>>,
}

impl Bba {
    pub fn new(n: usize, f: usize, proposer: &str) -> Self {
        Self {
            n,
            f,
            proposer: proposer.to_string(),
            round: 1,
            est: false,
            input_given: false,
            decided: None,
            bvals_sent: HashSet::new(),
            aux_sent: HashSet::new(),
            bvals: HashMap::new(),
            auxes: HashMap::new(),
            bin_values: HashMap::new(),
        }
    }

    pub fn decided(&self) -> Option<bool> {
        self.decided
    }

    pub fn input_given(&self) -> bool {
        self.input_given
    }

    /// Deterministic round coin shared by all nodes.
    fn coin(&self, round: u32) -> bool {
        let mut seed = self.proposer.clone().into_bytes();
        seed.extend_from_slice(&round.to_be_bytes());
        codec::sha256(&seed)[0] & 1 == 1
    }

    /// Supply this node's estimate and open round 1.
    pub fn input(&mut self, value: bool) -> BbaStep {
        let mut step = BbaStep::default();
        if self.input_given {
            return step;
        }
        self.input_given = true;
        self.est = value;
        self.send_bval(self.round, value, &mut step);
        step
    }

    pub fn handle(&mut self, sender: &str, round: u32, content: BbaContent) -> BbaStep {
        let mut step = BbaStep::default();
        match content {
            BbaContent::Bval(value) => {
                self.bvals
                    .entry((round, value))
                    .or_default()
                    .insert(sender.to_string());
                let supporters = self.bvals[&(round, value)].len();
                if supporters >= self.f + 1 {
                    self.send_bval(round, value, &mut step);
                }
                if supporters >= 2 * self.f + 1
                    && self.bin_values.entry(round).or_default().insert(value)
                    && self.aux_sent.insert(round)
                {
                    step.outbound.push((round, BbaContent::Aux(value)));
                }
            }
            BbaContent::Aux(value) => {
                self.auxes
                    .entry(round)
                    .or_default()
                    .insert(sender.to_string(), value);
            }
        }
        self.try_close_round(&mut step);
        step
    }

    fn send_bval(&mut self, round: u32, value: bool, step: &mut BbaStep) {
        if self.bvals_sent.insert((round, value)) {
            step.outbound.push((round, BbaContent::Bval(value)));
        }
    }

    /// Close the current round once `n-f` aux votes carry accepted values.
    fn try_close_round(&mut self, step: &mut BbaStep) {
        loop {
            let round = self.round;
            let Some(bin) = self.bin_values.get(&round) else {
                return;
            };
            if bin.is_empty() {
                return;
            }
            let Some(auxes) = self.auxes.get(&round) else {
                return;
            };
            let valid: Vec<bool> = auxes
                .values()
                .copied()
                .filter(|v| bin.contains(v))
                .collect();
            if valid.len() < self.n - self.f {
                return;
            }

            let vals: HashSet<bool> = valid.into_iter().collect();
            let coin = self.coin(round);
            if vals.len() == 1 {
                let v = *vals.iter().next().unwrap();
                self.est = v;
                if v == coin && self.decided.is_none() {
                    self.decided = Some(v);
                    step.decided = Some(v);
                }
            } else {
                self.est = coin;
            }

            // open the next round; a decided instance keeps echoing its
            // value so laggards catch up
            self.round += 1;
            let est = self.decided.unwrap_or(self.est);
            let next = self.round;
            self.send_bval(next, est, step);
        }
    }
}
