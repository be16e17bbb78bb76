// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Multi-producer agreement: producer rotation through the owner's
//! consensus-change subprotocol, then one block carrying every quorum
//! member's trx in the deterministic order.

mod common;

use std::sync::Arc;
use std::time::Duration;

use grove_chain::{Chain, ChainRegistry, MeshHub};
use grove_types::{EncryptType, NodeRole};

use common::{connect, fast_options, init_tracing, node, wait_for, wait_for_async};

struct Swarm {
    registries: Vec<ChainRegistry>,
    chains: Vec<Arc<Chain>>,
}

/// Owner (full node) plus `producers` producer nodes, all joined to one
/// group over one mesh, quorum not yet rotated.
async fn swarm(producers: usize, pulse_ms: u64) -> Swarm {
    let hub = MeshHub::new();
    let owner = node("owner-node");
    let (owner_chain, seed) = owner
        .create_group(
            "orchard",
            NodeRole::FullNode,
            EncryptType::Public,
            fast_options(pulse_ms),
            connect(&hub),
        )
        .await
        .unwrap();

    let mut registries = vec![owner];
    let mut chains = vec![owner_chain];
    for i in 0..producers {
        let registry = node(&format!("producer-{i}"));
        let chain = registry
            .join_group(&seed, NodeRole::ProducerNode, fast_options(pulse_ms), connect(&hub))
            .await
            .unwrap();
        registries.push(registry);
        chains.push(chain);
    }
    Swarm { registries, chains }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_three_producer_agreement_orders_trxs() {
    init_tracing();
    let swarm = swarm(2, 500).await;
    let owner = &swarm.chains[0];
    let group_id = owner.group_id().to_string();

    let members: Vec<String> = swarm
        .chains
        .iter()
        .map(|c| c.user_sign_pubkey().to_string())
        .collect();
    owner
        .update_consensus(members.clone(), 200, 50)
        .await
        .unwrap();

    // rotation lands on every node
    let rotated = wait_for(Duration::from_secs(10), || {
        swarm
            .chains
            .iter()
            .all(|c| members.iter().all(|m| c.is_producer(m)))
    })
    .await;
    assert!(rotated, "all nodes must see the rotated pool");

    // one trx per quorum member
    let mut trx_ids = Vec::new();
    for chain in &swarm.chains {
        let id = chain
            .post_content(format!("hello from {}", chain.user_sign_pubkey()).as_bytes())
            .await
            .unwrap();
        trx_ids.push(id);
    }

    // agreement packages all three into the epoch-1 block everywhere
    for chain in &swarm.chains {
        let storage = chain.storage().clone();
        let gid = group_id.clone();
        let done = wait_for_async(Duration::from_secs(20), || {
            let storage = storage.clone();
            let gid = gid.clone();
            async move {
                storage
                    .get_block_by_epoch(&gid, 1)
                    .await
                    .map(|b| b.trxs.len() == 3)
                    .unwrap_or(false)
            }
        })
        .await;
        assert!(done, "every producer must package the agreed union");
    }

    // deterministic order: same id sequence on every node, senders
    // ascending with the owner's partition last
    let reference = swarm.chains[0]
        .storage()
        .get_block_by_epoch(&group_id, 1)
        .await
        .unwrap();
    let reference_ids: Vec<String> = reference.trxs.iter().map(|t| t.trx_id.clone()).collect();

    let owner_pubkey = owner.user_sign_pubkey().to_string();
    let senders: Vec<String> = reference
        .trxs
        .iter()
        .map(|t| t.sender_pubkey.clone())
        .collect();
    assert_eq!(senders.last().unwrap(), &owner_pubkey, "owner partition last");
    let non_owner = &senders[..senders.len() - 1];
    let mut sorted = non_owner.to_vec();
    sorted.sort();
    assert_eq!(non_owner, sorted.as_slice(), "non-owner senders ascending");

    for chain in &swarm.chains[1..] {
        let block = chain
            .storage()
            .get_block_by_epoch(&group_id, 1)
            .await
            .unwrap();
        let ids: Vec<String> = block.trxs.iter().map(|t| t.trx_id.clone()).collect();
        assert_eq!(ids, reference_ids, "identical order on every honest node");
    }

    // content lands on the full node only
    assert_eq!(owner.storage().get_posts(&group_id).await.len(), 3);
    assert!(swarm.chains[1].storage().get_posts(&group_id).await.is_empty());

    for registry in &swarm.registries {
        registry.stop_all().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rotation_without_owner_appends_owner() {
    init_tracing();
    let swarm = swarm(3, 1000).await;
    let owner = &swarm.chains[0];
    let owner_pubkey = owner.user_sign_pubkey().to_string();

    // the owner names only the three producer nodes
    let list: Vec<String> = swarm.chains[1..]
        .iter()
        .map(|c| c.user_sign_pubkey().to_string())
        .collect();
    owner.update_consensus(list.clone(), 200, 50).await.unwrap();

    let rotated = wait_for(Duration::from_secs(10), || {
        swarm.chains.iter().all(|c| {
            list.iter().all(|m| c.is_producer(m)) && c.is_producer(&owner_pubkey)
        })
    })
    .await;
    assert!(
        rotated,
        "pool must equal the requested list plus the appended owner"
    );

    for registry in &swarm.registries {
        registry.stop_all().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_higher_nonce_rotation_supersedes() {
    init_tracing();
    let swarm = swarm(1, 1000).await;
    let owner = &swarm.chains[0];
    let producer = &swarm.chains[1];
    let both = vec![
        owner.user_sign_pubkey().to_string(),
        producer.user_sign_pubkey().to_string(),
    ];

    owner.update_consensus(both.clone(), 200, 50).await.unwrap();
    let rotated = wait_for(Duration::from_secs(10), || {
        both.iter().all(|m| producer.is_producer(m))
    })
    .await;
    assert!(rotated);

    // a second rotation with a fresh (higher) nonce supersedes cleanly
    let only_owner = vec![owner.user_sign_pubkey().to_string()];
    owner.update_consensus(only_owner, 200, 50).await.unwrap();
    let shrunk = wait_for(Duration::from_secs(10), || {
        !owner.is_producer(producer.user_sign_pubkey())
    })
    .await;
    assert!(shrunk, "higher-nonce rotation must replace the pool");

    for registry in &swarm.registries {
        registry.stop_all().await;
    }
}
