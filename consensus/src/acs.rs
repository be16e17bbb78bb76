// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous common subset over one epoch (or one consensus-change
//! session).
//!
//! One RBC slot and one BBA slot per proposer. A delivered RBC feeds `1`
//! into its slot's BBA; once `n-f` slots have decided `1`, every
//! still-undecided slot gets `0`. When all slots are decided and every
//! accepted slot's value is delivered, the instance outputs the map
//! `proposer -> value`. All honest nodes compute the same map.

use std::collections::{BTreeMap, HashMap};

use grove_types::{AcsMsg, AcsPayload, BbaMsg, RbcMsg};

use crate::bba::Bba;
use crate::config::BftConfig;
use crate::rbc::Rbc;

/// Result of feeding one message into the instance.
#[derive(Debug, Default)]
pub struct AcsStep {
    pub outbound: Vec<AcsMsg>,
    /// Agreed `proposer -> proposal bytes`, present exactly once.
    pub output: Option<BTreeMap<String, Vec<u8>>>,
}

pub struct Acs {
    config: BftConfig,
    session_id: String,
    rbcs: HashMap<String, Rbc>,
    bbas: HashMap<String, Bba>,
    rbc_out: BTreeMap<String, Vec<u8>>,
    done: bool,
}

impl Acs {
    pub fn new(config: BftConfig, session_id: &str) -> Self {
        let rbcs = config
            .nodes
            .iter()
            .map(|node| (node.clone(), Rbc::new(config.n, config.f, node)))
            .collect();
        let bbas = config
            .nodes
            .iter()
            .map(|node| (node.clone(), Bba::new(config.n, config.f, node)))
            .collect();
        Self {
            config,
            session_id: session_id.to_string(),
            rbcs,
            bbas,
            rbc_out: BTreeMap::new(),
            done: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Input this node's proposal into its own RBC slot.
    pub fn propose(&mut self, value: Vec<u8>) -> AcsStep {
        let mut step = AcsStep::default();
        let me = self.config.my_pubkey.clone();
        if let Some(rbc) = self.rbcs.get_mut(&me) {
            let rbc_step = rbc.propose(value);
            self.collect_rbc(&me, rbc_step, &mut step);
        }
        step
    }

    /// Feed one inbound sub-message. Unknown senders and proposer slots
    /// are dropped.
    pub fn handle_msg(&mut self, msg: &AcsMsg) -> AcsStep {
        let mut step = AcsStep::default();
        if msg.session_id != self.session_id {
            return step;
        }
        match &msg.payload {
            AcsPayload::Rbc(rbc_msg) => {
                if !self.is_member(&rbc_msg.sender) {
                    return step;
                }
                let Some(rbc) = self.rbcs.get_mut(&rbc_msg.proposer) else {
                    return step;
                };
                let rbc_step = rbc.handle(&rbc_msg.sender, rbc_msg.content.clone());
                let proposer = rbc_msg.proposer.clone();
                self.collect_rbc(&proposer, rbc_step, &mut step);
            }
            AcsPayload::Bba(bba_msg) => {
                if !self.is_member(&bba_msg.sender) {
                    return step;
                }
                let Some(bba) = self.bbas.get_mut(&bba_msg.proposer) else {
                    return step;
                };
                let bba_step = bba.handle(&bba_msg.sender, bba_msg.round, bba_msg.content.clone());
                let proposer = bba_msg.proposer.clone();
                self.collect_bba(&proposer, bba_step, &mut step);
            }
        }
        step
    }

    fn is_member(&self, pubkey: &str) -> bool {
        self.config.nodes.iter().any(|n| n == pubkey)
    }

    fn collect_rbc(&mut self, proposer: &str, rbc_step: crate::rbc::RbcStep, step: &mut AcsStep) {
        for content in rbc_step.outbound {
            step.outbound.push(AcsMsg {
                session_id: self.session_id.clone(),
                payload: AcsPayload::Rbc(RbcMsg {
                    proposer: proposer.to_string(),
                    sender: self.config.my_pubkey.clone(),
                    content,
                }),
            });
        }
        if let Some(value) = rbc_step.delivered {
            self.rbc_out.insert(proposer.to_string(), value);
            // a delivered proposal votes 1 on its own slot
            let bba_step = match self.bbas.get_mut(proposer) {
                Some(bba) if !bba.input_given() => Some(bba.input(true)),
                _ => None,
            };
            if let Some(bba_step) = bba_step {
                self.collect_bba(proposer, bba_step, step);
            }
        }
        self.try_finish(step);
    }

    fn collect_bba(&mut self, proposer: &str, bba_step: crate::bba::BbaStep, step: &mut AcsStep) {
        for (round, content) in bba_step.outbound {
            step.outbound.push(AcsMsg {
                session_id: self.session_id.clone(),
                payload: AcsPayload::Bba(BbaMsg {
                    proposer: proposer.to_string(),
                    sender: self.config.my_pubkey.clone(),
                    round,
                    content,
                }),
            });
        }
        if bba_step.decided.is_some() {
            self.vote_down_remaining(step);
        }
        self.try_finish(step);
    }

    /// Once `n-f` slots accepted, vote 0 on every slot still without input.
    fn vote_down_remaining(&mut self, step: &mut AcsStep) {
        let accepted = self
            .bbas
            .values()
            .filter(|b| b.decided() == Some(true))
            .count();
        if accepted < self.config.n - self.config.f {
            return;
        }
        let pending: Vec<String> = self
            .bbas
            .iter()
            .filter(|(_, b)| !b.input_given())
            .map(|(p, _)| p.clone())
            .collect();
        for proposer in pending {
            let bba_step = match self.bbas.get_mut(&proposer) {
                Some(bba) => bba.input(false),
                None => continue,
            };
            self.collect_bba(&proposer, bba_step, step);
        }
    }

    fn try_finish(&mut self, step: &mut AcsStep) {
        if self.done {
            return;
        }
        if !self.bbas.values().all(|b| b.decided().is_some()) {
            return;
        }
        // every accepted slot must have its value delivered before output
        let accepted: Vec<&String> = self
            .bbas
            .iter()
            .filter(|(_, b)| b.decided() == Some(true))
            .map(|(p, _)| p)
            .collect();
        if accepted.iter().any(|p| !self.rbc_out.contains_key(*p)) {
            return;
        }
        let output: BTreeMap<String, Vec<u8>> = accepted
            .into_iter()
            .map(|p| (p.clone(), self.rbc_out[p].clone()))
            .collect();
        self.done = true;
        step.output = Some(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(nodes: &[&str], me: &str) -> BftConfig {
        BftConfig::new(
            "g1",
            "node",
            me,
            nodes[0],
            nodes.iter().map(|s| s.to_string()).collect(),
        )
    }

    /// Full mesh with self-delivery, run to quiescence.
    fn run_mesh(nodes: &mut Vec<Acs>, proposals: Vec<Vec<u8>>) -> Vec<Option<BTreeMap<String, Vec<u8>>>> {
        let mut queue: Vec<AcsMsg> = Vec::new();
        let mut outputs: Vec<Option<BTreeMap<String, Vec<u8>>>> = vec![None; nodes.len()];
        for (idx, acs) in nodes.iter_mut().enumerate() {
            let step = acs.propose(proposals[idx].clone());
            queue.extend(step.outbound);
        }
        while let Some(msg) = queue.pop() {
            for (idx, acs) in nodes.iter_mut().enumerate() {
                let step = acs.handle_msg(&msg);
                queue.extend(step.outbound);
                if let Some(out) = step.output {
                    outputs[idx] = Some(out);
                }
            }
        }
        outputs
    }

    #[test]
    fn test_single_proposer_subset() {
        let mut nodes = vec![Acs::new(config(&["p0"], "p0"), "1")];
        let outputs = run_mesh(&mut nodes, vec![b"only".to_vec()]);
        let out = outputs[0].clone().expect("acs must finish");
        assert_eq!(out.len(), 1);
        assert_eq!(out["p0"], b"only".to_vec());
    }

    #[test]
    fn test_three_proposers_same_output_everywhere() {
        let ids = ["p0", "p1", "p2"];
        let mut nodes: Vec<Acs> = ids
            .iter()
            .map(|me| Acs::new(config(&ids, me), "7"))
            .collect();
        let proposals = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let outputs = run_mesh(&mut nodes, proposals);

        let first = outputs[0].clone().expect("acs must finish");
        assert!(first.len() >= 2, "at least n-f proposers in the subset");
        for out in outputs {
            assert_eq!(out.expect("all nodes finish"), first);
        }
    }

    #[test]
    fn test_wrong_session_ignored() {
        let mut acs = Acs::new(config(&["p0", "p1", "p2"], "p0"), "5");
        let msg = AcsMsg {
            session_id: "6".to_string(),
            payload: AcsPayload::Bba(BbaMsg {
                proposer: "p1".to_string(),
                sender: "p1".to_string(),
                round: 1,
                content: grove_types::BbaContent::Bval(true),
            }),
        };
        let step = acs.handle_msg(&msg);
        assert!(step.outbound.is_empty());
        assert!(step.output.is_none());
    }
}
