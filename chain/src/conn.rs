// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! The connection-manager capability.
//!
//! The real mesh (gossipsub + direct streams) lives outside the engine;
//! `ConnMgr` is the seam it implements. `ChannelConnMgr` is the in-process
//! implementation used by tests and local clusters: every node's inbox is
//! an unbounded channel on a shared hub, broadcast fans out to every other
//! member, and a delivery carries a reply stream pointing back at the
//! publisher's inbox.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use grove_types::{ChainError, GroveResult, Package};

/// One inbound unit: a package plus, for direct exchanges, the stream to
/// answer on.
#[derive(Debug)]
pub struct Delivery {
    pub pkg: Package,
    pub reply: Option<DirectStream>,
}

/// Reply handle of a direct exchange.
#[derive(Debug, Clone)]
pub struct DirectStream {
    peer: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl DirectStream {
    /// Pubkey of the peer on the other end.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// Transport capability of one group membership.
#[async_trait]
pub trait ConnMgr: Send + Sync + Debug {
    /// Publish to the group's topic. The publisher is not redelivered its
    /// own message.
    async fn broadcast(&self, pkg: Package) -> GroveResult<()>;

    /// Answer a direct exchange.
    async fn send_reply(&self, pkg: Package, stream: &DirectStream) -> GroveResult<()>;
}

/// Shared in-process mesh, one per simulated swarm.
#[derive(Debug, Default)]
pub struct MeshHub {
    nodes: DashMap<String, mpsc::UnboundedSender<Delivery>>,
}

impl MeshHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join the mesh under `peer_id` (the node's sign pubkey). Returns the
    /// inbox to drain and the conn manager to hand to the chain.
    pub fn join(self: &Arc<Self>, peer_id: &str) -> (ChannelConnMgr, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.insert(peer_id.to_string(), tx);
        (
            ChannelConnMgr {
                hub: Arc::clone(self),
                me: peer_id.to_string(),
            },
            rx,
        )
    }

    pub fn leave(&self, peer_id: &str) {
        self.nodes.remove(peer_id);
    }
}

/// Channel-backed [`ConnMgr`] over a [`MeshHub`].
#[derive(Debug, Clone)]
pub struct ChannelConnMgr {
    hub: Arc<MeshHub>,
    me: String,
}

#[async_trait]
impl ConnMgr for ChannelConnMgr {
    async fn broadcast(&self, pkg: Package) -> GroveResult<()> {
        let own_inbox = self
            .hub
            .nodes
            .get(&self.me)
            .map(|entry| entry.value().clone());
        for entry in self.hub.nodes.iter() {
            if entry.key() == &self.me {
                continue;
            }
            let reply = own_inbox.as_ref().map(|tx| DirectStream {
                peer: self.me.clone(),
                tx: tx.clone(),
            });
            // a lagging or departed peer is the mesh's problem, not ours
            let _ = entry.value().send(Delivery {
                pkg: pkg.clone(),
                reply,
            });
        }
        Ok(())
    }

    async fn send_reply(&self, pkg: Package, stream: &DirectStream) -> GroveResult<()> {
        stream
            .tx
            .send(Delivery { pkg, reply: None })
            .map_err(|_| ChainError::InvalidData(format!("peer <{}> gone", stream.peer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_types::PackageType;

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let hub = MeshHub::new();
        let (conn_a, mut rx_a) = hub.join("a");
        let (_conn_b, mut rx_b) = hub.join("b");

        let pkg = Package {
            package_type: PackageType::Trx,
            data: vec![1],
        };
        conn_a.broadcast(pkg).await.unwrap();

        let delivery = rx_b.recv().await.unwrap();
        assert_eq!(delivery.pkg.data, vec![1]);
        assert!(delivery.reply.is_some());
        assert!(rx_a.try_recv().is_err(), "sender must not hear itself");
    }

    #[tokio::test]
    async fn test_reply_reaches_requester_without_stream() {
        let hub = MeshHub::new();
        let (conn_a, mut rx_a) = hub.join("a");
        let (conn_b, mut rx_b) = hub.join("b");

        conn_a
            .broadcast(Package {
                package_type: PackageType::Trx,
                data: vec![7],
            })
            .await
            .unwrap();
        let delivery = rx_b.recv().await.unwrap();
        let stream = delivery.reply.unwrap();
        assert_eq!(stream.peer(), "a");

        conn_b
            .send_reply(
                Package {
                    package_type: PackageType::Trx,
                    data: vec![8],
                },
                &stream,
            )
            .await
            .unwrap();
        let back = rx_a.recv().await.unwrap();
        assert_eq!(back.pkg.data, vec![8]);
        assert!(back.reply.is_none());
    }
}
