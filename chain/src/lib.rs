// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-group chain engine.
//!
//! A Grove node runs one [`Chain`] per group it belongs to. The chain
//! dispatches inbound mesh traffic, validates and applies blocks, feeds
//! verified trxs to the producer quorum, serves and consumes the sync
//! protocol, and carries the owner's consensus-rotation subprotocol. The
//! [`registry::ChainRegistry`] owns the chains of one node together with
//! the shared storage and keystore capabilities.

pub mod chain;
pub mod chaindata;
pub mod conn;
pub mod factory;
pub mod registry;
pub mod syncer;
pub mod validator;

pub use chain::{Chain, ChainOptions, NODE_VERSION};
pub use chaindata::ChainData;
pub use conn::{ChannelConnMgr, ConnMgr, Delivery, DirectStream, MeshHub};
pub use factory::TrxFactory;
pub use registry::{ChainRegistry, ConnectFn, GroupSeed};
pub use syncer::{SyncTaskType, SyncerConfig, SyncerRunner, SyncerStatus, TaskResult};
