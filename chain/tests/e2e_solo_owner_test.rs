// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Single-producer group: the owner packages its own posts, a tampered
//! trx is dropped without a trace.

mod common;

use std::time::Duration;

use grove_types::{codec, EncryptType, NodeRole, Package, PackageType};

use common::{connect, fast_options, init_tracing, node, wait_for_async};

#[tokio::test(flavor = "multi_thread")]
async fn test_solo_owner_packages_post_into_block() {
    init_tracing();
    let hub = grove_chain::MeshHub::new();
    let registry = node("owner-node");
    let (chain, _seed) = registry
        .create_group(
            "plants",
            NodeRole::FullNode,
            EncryptType::Public,
            fast_options(200),
            connect(&hub),
        )
        .await
        .unwrap();
    let group_id = chain.group_id().to_string();

    let content = vec![7u8; 100];
    let trx_id = chain.post_content(&content).await.unwrap();

    let storage = chain.storage().clone();
    let found = wait_for_async(Duration::from_secs(10), || {
        let storage = storage.clone();
        let group_id = group_id.clone();
        async move { storage.get_block_by_epoch(&group_id, 1).await.is_some() }
    })
    .await;
    assert!(found, "first tick must package the post at epoch 1");

    let block = storage.get_block_by_epoch(&group_id, 1).await.unwrap();
    assert_eq!(block.block_id, 1);
    assert_eq!(block.trxs.len(), 1);
    assert_eq!(block.trxs[0].trx_id, trx_id);

    // full node applied the POST to the content log
    let applied = wait_for_async(Duration::from_secs(5), || {
        let storage = storage.clone();
        let group_id = group_id.clone();
        async move { storage.get_posts(&group_id).await.len() == 1 }
    })
    .await;
    assert!(applied);
    assert_eq!(storage.get_posts(&group_id).await[0].content, content);

    // trx persisted in its encrypted form, chain head advanced
    assert!(storage.get_trx(&group_id, &trx_id).await.is_some());
    let info = chain.group_info();
    assert!(info.epoch >= 1);
    assert_eq!(info.curr_block_id, 1);

    registry.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tampered_trx_is_dropped_silently() {
    init_tracing();
    let hub = grove_chain::MeshHub::new();
    let registry = node("owner-node");
    let (chain, _seed) = registry
        .create_group(
            "plants",
            NodeRole::FullNode,
            EncryptType::Public,
            fast_options(150),
            connect(&hub),
        )
        .await
        .unwrap();
    let group_id = chain.group_id().to_string();
    let storage = chain.storage().clone();

    // a correctly signed trx with one payload byte flipped afterwards
    let mut evil = chain.factory().post_trx(b"legit content", None).await.unwrap();
    let evil_id = evil.trx_id.clone();
    evil.data[0] ^= 0xff;
    evil.data = codec::compress(&evil.data).unwrap();
    let pkg = Package::wrap(PackageType::Trx, &evil).unwrap();

    chain.handle_package(pkg, None).await;

    // give the engine a few pulses; the trx must never surface
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(storage.get_trx(&group_id, &evil_id).await.is_none());
    assert!(storage.get_posts(&group_id).await.is_empty());

    // the engine still works afterwards
    let good_id = chain.post_content(b"good content").await.unwrap();
    let packaged = wait_for_async(Duration::from_secs(10), || {
        let storage = storage.clone();
        let group_id = group_id.clone();
        let good_id = good_id.clone();
        async move { storage.get_trx(&group_id, &good_id).await.is_some() }
    })
    .await;
    assert!(packaged);

    registry.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forged_block_cannot_overwrite_stored_block() {
    init_tracing();
    let hub = grove_chain::MeshHub::new();
    let registry = node("owner-node");
    let (chain, _seed) = registry
        .create_group(
            "plants",
            NodeRole::FullNode,
            EncryptType::Public,
            fast_options(150),
            connect(&hub),
        )
        .await
        .unwrap();
    let group_id = chain.group_id().to_string();
    let storage = chain.storage().clone();

    chain.post_content(b"the real entry").await.unwrap();
    let packaged = wait_for_async(Duration::from_secs(10), || {
        let storage = storage.clone();
        let group_id = group_id.clone();
        async move { storage.get_block_by_epoch(&group_id, 1).await.is_some() }
    })
    .await;
    assert!(packaged);
    let genuine = storage.get_block_by_epoch(&group_id, 1).await.unwrap();

    // claims the owner's (pool-registered) key, but carries fabricated
    // content and a garbage signature
    let mut forged = genuine.clone();
    forged.trxs.clear();
    forged.prev_hash = vec![0u8; 32];
    forged.bookkeeping_sign = vec![0u8; 64];

    let result = chain.add_block(&forged).await;
    assert!(result.is_err(), "forged block must be rejected");

    let stored = storage.get_block_by_epoch(&group_id, 1).await.unwrap();
    assert_eq!(
        stored.compute_hash().unwrap(),
        genuine.compute_hash().unwrap(),
        "stored block must be untouched"
    );

    registry.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_rounds_advance_epoch_without_blocks() {
    init_tracing();
    let hub = grove_chain::MeshHub::new();
    let registry = node("owner-node");
    let (chain, _seed) = registry
        .create_group(
            "plants",
            NodeRole::FullNode,
            EncryptType::Public,
            fast_options(100),
            connect(&hub),
        )
        .await
        .unwrap();
    let group_id = chain.group_id().to_string();

    tokio::time::sleep(Duration::from_millis(600)).await;
    let info = chain.group_info();
    assert!(info.epoch >= 2, "idle ticks must advance the epoch");
    assert_eq!(info.curr_block_id, 0, "no block without trxs");
    assert!(chain
        .storage()
        .get_blocks_after_epoch(&group_id, 0, 10)
        .await
        .is_empty());

    registry.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reapplying_a_trx_is_idempotent() {
    init_tracing();
    let hub = grove_chain::MeshHub::new();
    let registry = node("owner-node");
    let (chain, _seed) = registry
        .create_group(
            "plants",
            NodeRole::FullNode,
            EncryptType::Public,
            fast_options(150),
            connect(&hub),
        )
        .await
        .unwrap();
    let group_id = chain.group_id().to_string();
    let storage = chain.storage().clone();

    chain.post_content(b"once").await.unwrap();
    let packaged = wait_for_async(Duration::from_secs(10), || {
        let storage = storage.clone();
        let group_id = group_id.clone();
        async move { !storage.get_posts(&group_id).await.is_empty() }
    })
    .await;
    assert!(packaged);

    let block = storage.get_block_by_epoch(&group_id, 1).await.unwrap();
    chain.apply_trxs_full_node(&block.trxs).await.unwrap();
    chain.apply_trxs_full_node(&block.trxs).await.unwrap();
    assert_eq!(storage.get_posts(&group_id).await.len(), 1);

    registry.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_private_group_seals_posts() {
    init_tracing();
    let hub = grove_chain::MeshHub::new();
    let registry = node("owner-node");
    let (chain, _seed) = registry
        .create_group(
            "sealed",
            NodeRole::FullNode,
            EncryptType::Private,
            fast_options(150),
            connect(&hub),
        )
        .await
        .unwrap();
    let group_id = chain.group_id().to_string();
    let storage = chain.storage().clone();

    let trx_id = chain.post_content(b"for members only").await.unwrap();
    let applied = wait_for_async(Duration::from_secs(10), || {
        let storage = storage.clone();
        let group_id = group_id.clone();
        async move { storage.get_posts(&group_id).await.len() == 1 }
    })
    .await;
    assert!(applied, "owner can open a post sealed to itself");
    assert_eq!(
        storage.get_posts(&group_id).await[0].content,
        b"for members only"
    );

    // persisted bytes stay sealed
    let stored = storage.get_trx(&group_id, &trx_id).await.unwrap();
    assert_ne!(stored.data, b"for members only".to_vec());

    registry.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_undecodable_package_is_dropped() {
    init_tracing();
    let hub = grove_chain::MeshHub::new();
    let registry = node("owner-node");
    let (chain, _seed) = registry
        .create_group(
            "plants",
            NodeRole::FullNode,
            EncryptType::Public,
            fast_options(150),
            connect(&hub),
        )
        .await
        .unwrap();

    chain
        .handle_package(
            Package {
                package_type: PackageType::Block,
                data: b"not a block".to_vec(),
            },
            None,
        )
        .await;

    // the dispatcher survives garbage and keeps packaging
    let group_id = chain.group_id().to_string();
    let storage = chain.storage().clone();
    let trx_id = chain.post_content(b"still alive").await.unwrap();
    let packaged = wait_for_async(Duration::from_secs(10), || {
        let storage = storage.clone();
        let group_id = group_id.clone();
        let trx_id = trx_id.clone();
        async move { storage.get_trx(&group_id, &trx_id).await.is_some() }
    })
    .await;
    assert!(packaged);

    registry.stop_all().await;
}
