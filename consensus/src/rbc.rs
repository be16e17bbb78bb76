// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Reliable broadcast, one instance per proposer slot.
//!
//! Bracha-style three-phase broadcast: the proposer sends `Init(v)`, every
//! receiver echoes `v`, `⌈(n+f+1)/2⌉` matching echoes trigger `Ready(h(v))`,
//! `f+1` readies amplify, and `2f+1` readies deliver. The instance is a
//! pure state machine: `handle` consumes one message and returns what to
//! broadcast next plus the delivered value, if any.

use std::collections::HashMap;

use grove_types::{codec, RbcContent};

/// Result of feeding one message into the instance.
#[derive(Debug, Default)]
pub struct RbcStep {
    pub outbound: Vec<RbcContent>,
    pub delivered: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct Rbc {
    n: usize,
    f: usize,
    proposer: String,
    value: Option<Vec<u8>>,
    echo_sent: bool,
    ready_sent: bool,
    delivered: bool,
    /// sender -> hash of echoed value
    echos: HashMap<String, Vec<u8>>,
    /// first value seen per echo hash, so delivery can use an echoed value
    /// even if the Init never arrived
    echo_values: HashMap<Vec<u8>, Vec<u8>>,
    /// sender -> readied hash
    readys: HashMap<String, Vec<u8>>,
}

impl Rbc {
    pub fn new(n: usize, f: usize, proposer: &str) -> Self {
        Self {
            n,
            f,
            proposer: proposer.to_string(),
            value: None,
            echo_sent: false,
            ready_sent: false,
            delivered: false,
            echos: HashMap::new(),
            echo_values: HashMap::new(),
            readys: HashMap::new(),
        }
    }

    fn echo_threshold(&self) -> usize {
        (self.n + self.f + 2) / 2
    }

    /// Proposer-side entry: broadcast our value.
    pub fn propose(&mut self, value: Vec<u8>) -> RbcStep {
        RbcStep {
            outbound: vec![RbcContent::Init(value)],
            delivered: None,
        }
    }

    pub fn handle(&mut self, sender: &str, content: RbcContent) -> RbcStep {
        let mut step = RbcStep::default();
        match content {
            RbcContent::Init(value) => {
                // only the slot's proposer may init
                if sender != self.proposer {
                    return step;
                }
                if self.value.is_none() {
                    self.value = Some(value.clone());
                }
                if !self.echo_sent {
                    self.echo_sent = true;
                    step.outbound.push(RbcContent::Echo(value));
                }
            }
            RbcContent::Echo(value) => {
                let hash = codec::sha256(&value);
                self.echos.entry(sender.to_string()).or_insert(hash.clone());
                self.echo_values.entry(hash).or_insert(value);
            }
            RbcContent::Ready(hash) => {
                self.readys.entry(sender.to_string()).or_insert(hash);
            }
        }
        self.advance(&mut step);
        step
    }

    fn advance(&mut self, step: &mut RbcStep) {
        if !self.ready_sent {
            if let Some(hash) = self.quorum_hash(&self.echos, self.echo_threshold()) {
                self.ready_sent = true;
                step.outbound.push(RbcContent::Ready(hash));
            } else if let Some(hash) = self.quorum_hash(&self.readys, self.f + 1) {
                self.ready_sent = true;
                step.outbound.push(RbcContent::Ready(hash));
            }
        }

        if self.delivered {
            return;
        }
        if let Some(hash) = self.quorum_hash(&self.readys, 2 * self.f + 1) {
            let value = self
                .value
                .clone()
                .filter(|v| codec::sha256(v) == hash)
                .or_else(|| self.echo_values.get(&hash).cloned());
            if let Some(value) = value {
                self.delivered = true;
                step.delivered = Some(value);
            }
        }
    }

    fn quorum_hash(&self, votes: &HashMap<String, Vec<u8>>, threshold: usize) -> Option<Vec<u8>> {
        let mut counts: HashMap<&Vec<u8>, usize> = HashMap::new();
        for hash in votes.values() {
            let count = counts.entry(hash).or_insert(0);
            *count += 1;
            if *count >= threshold {
                return Some(hash.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deliver every node's outbound to every node (including the sender)
    /// until quiescent. Returns each node's delivered value.
    fn run_mesh(nodes: &mut Vec<(String, Rbc)>, initial: Vec<(String, RbcContent)>) -> Vec<Option<Vec<u8>>> {
        let mut queue = initial;
        let mut delivered: Vec<Option<Vec<u8>>> = vec![None; nodes.len()];
        while let Some((sender, content)) = queue.pop() {
            for (idx, (id, rbc)) in nodes.iter_mut().enumerate() {
                let step = rbc.handle(&sender, content.clone());
                for out in step.outbound {
                    queue.push((id.clone(), out));
                }
                if let Some(v) = step.delivered {
                    delivered[idx] = Some(v);
                }
            }
        }
        delivered
    }

    #[test]
    fn test_single_node_delivers_own_value() {
        let mut nodes = vec![("p0".to_string(), Rbc::new(1, 0, "p0"))];
        let init = nodes[0].1.propose(b"solo".to_vec());
        let delivered = run_mesh(&mut nodes, init.outbound.into_iter().map(|c| ("p0".to_string(), c)).collect());
        assert_eq!(delivered[0].as_deref(), Some(b"solo".as_ref()));
    }

    #[test]
    fn test_four_nodes_all_deliver() {
        let ids: Vec<String> = (0..4).map(|i| format!("p{i}")).collect();
        let mut nodes: Vec<(String, Rbc)> = ids
            .iter()
            .map(|id| (id.clone(), Rbc::new(4, 1, "p0")))
            .collect();
        let init = nodes[0].1.propose(b"bundle".to_vec());
        let delivered = run_mesh(
            &mut nodes,
            init.outbound.into_iter().map(|c| ("p0".to_string(), c)).collect(),
        );
        for d in delivered {
            assert_eq!(d.as_deref(), Some(b"bundle".as_ref()));
        }
    }

    #[test]
    fn test_init_from_non_proposer_ignored() {
        let mut rbc = Rbc::new(4, 1, "p0");
        let step = rbc.handle("p2", RbcContent::Init(b"forged".to_vec()));
        assert!(step.outbound.is_empty());
        assert!(step.delivered.is_none());
    }
}
