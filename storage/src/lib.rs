// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Group-scoped chain store.
//!
//! The engine treats persistence as a capability: the dispatcher is the
//! single writer per group, reads may be concurrent, and every key is
//! scoped by group id so groups stay isolated failure domains.
//!
//! This crate ships the in-memory implementation (DashMap-backed, lock-free
//! for most operations). Disk backends live behind the same surface and are
//! out of scope here.

mod chain_store;

pub use chain_store::{ChainStorage, PostItem};
