// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory queue of pending trxs awaiting block inclusion.
//!
//! Push and drain share a single lock; draining samples without removing,
//! and entries are deleted only after they land in an accepted block. The
//! soft cap drops oldest-first and is not part of consensus.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::VecDeque;

use grove_types::Trx;

#[derive(Debug)]
pub struct TrxBuffer {
    group_id: String,
    inner: Mutex<VecDeque<Trx>>,
    cap: usize,
}

impl TrxBuffer {
    pub fn new(group_id: &str, cap: usize) -> Self {
        Self {
            group_id: group_id.to_string(),
            inner: Mutex::new(VecDeque::new()),
            cap,
        }
    }

    /// Append a trx. Re-pushing an id already buffered is a no-op; when the
    /// soft cap is hit the oldest entry is dropped.
    pub fn push(&self, trx: Trx) {
        let mut queue = self.inner.lock();
        if queue.iter().any(|t| t.trx_id == trx.trx_id) {
            return;
        }
        if queue.len() >= self.cap {
            if let Some(dropped) = queue.pop_front() {
                tracing::warn!(
                    "<{}> trx buffer over cap, dropping oldest trx <{}>",
                    self.group_id,
                    dropped.trx_id
                );
            }
        }
        queue.push_back(trx);
    }

    /// Up to `n` randomly chosen trxs, left in place until deleted.
    pub fn get_n_random(&self, n: usize) -> Vec<Trx> {
        let queue = self.inner.lock();
        let mut indices: Vec<usize> = (0..queue.len()).collect();
        indices.shuffle(&mut rand::thread_rng());
        indices
            .into_iter()
            .take(n)
            .map(|i| queue[i].clone())
            .collect()
    }

    /// Remove a trx after it was included in an accepted block.
    pub fn delete(&self, trx_id: &str) {
        self.inner.lock().retain(|t| t.trx_id != trx_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_types::TrxType;

    fn trx(id: &str) -> Trx {
        Trx {
            trx_id: id.to_string(),
            group_id: "g1".to_string(),
            trx_type: TrxType::Post,
            data: vec![],
            nonce: 0,
            timestamp: 0,
            version: "2.0.0".to_string(),
            sender_pubkey: "pk".to_string(),
            sender_sign: vec![],
        }
    }

    #[test]
    fn test_push_get_delete() {
        let buf = TrxBuffer::new("g1", 16);
        buf.push(trx("a"));
        buf.push(trx("b"));
        assert_eq!(buf.len(), 2);

        let picked = buf.get_n_random(10);
        assert_eq!(picked.len(), 2);
        assert_eq!(buf.len(), 2, "draining must not remove");

        buf.delete("a");
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.get_n_random(10)[0].trx_id, "b");
    }

    #[test]
    fn test_duplicate_push_ignored() {
        let buf = TrxBuffer::new("g1", 16);
        buf.push(trx("a"));
        buf.push(trx("a"));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_cap_drops_oldest_first() {
        let buf = TrxBuffer::new("g1", 2);
        buf.push(trx("a"));
        buf.push(trx("b"));
        buf.push(trx("c"));
        assert_eq!(buf.len(), 2);
        let ids: Vec<String> = buf.get_n_random(10).into_iter().map(|t| t.trx_id).collect();
        assert!(!ids.contains(&"a".to_string()));
        assert!(ids.contains(&"c".to_string()));
    }

    #[test]
    fn test_get_n_random_bounds() {
        let buf = TrxBuffer::new("g1", 16);
        for i in 0..5 {
            buf.push(trx(&format!("t{i}")));
        }
        assert_eq!(buf.get_n_random(3).len(), 3);
        assert_eq!(buf.get_n_random(0).len(), 0);
    }
}
