// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared harness for the end-to-end chain tests: one in-process mesh,
//! one registry (storage + keystore) per simulated node, pulses dialed
//! down so scenarios finish in seconds.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use grove_chain::{ChainOptions, ChainRegistry, ConnMgr, ConnectFn, MeshHub, SyncerConfig};
use grove_keys::InMemKeystore;
use grove_storage::ChainStorage;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A registry backed by its own storage and keystore, like a separate
/// process would have.
pub fn node(name: &str) -> ChainRegistry {
    ChainRegistry::new(
        name,
        Arc::new(ChainStorage::new()),
        Arc::new(InMemKeystore::new()),
    )
}

/// Engine knobs for tests: fast pulses, short sync timeouts.
pub fn fast_options(pulse_ms: u64) -> ChainOptions {
    ChainOptions {
        propose_pulse_ms: pulse_ms,
        agreement_tick_len_ms: 200,
        agreement_tick_count: 50,
        batch_size: 30,
        syncer: SyncerConfig {
            blocks_per_request: 10,
            req_timeout: Duration::from_secs(2),
            authoritative_not_found: false,
        },
    }
}

/// Transport hookup closure joining the shared mesh under the node's
/// group sign key.
pub fn connect(hub: &Arc<MeshHub>) -> ConnectFn {
    let hub = Arc::clone(hub);
    Box::new(move |pubkey: &str| {
        let (conn, inbox) = hub.join(pubkey);
        (Arc::new(conn) as Arc<dyn ConnMgr>, inbox)
    })
}

/// Poll `cond` every 50 ms until it holds or `timeout` elapses.
pub async fn wait_for<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Async-condition variant of [`wait_for`].
pub async fn wait_for_async<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
