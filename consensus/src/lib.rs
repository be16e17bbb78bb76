// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! BFT agreement core for the Grove chain engine.
//!
//! Each epoch, the producer quorum runs an asynchronous common subset:
//! one reliable-broadcast instance per proposer carries that proposer's
//! trx bundle, and one binary-agreement instance per proposer decides
//! whether the bundle makes it into the epoch's output. Given `N`
//! producers with at most `f = (N-1)/3` faulty, every honest producer
//! computes the same output union and therefore the same block bytes.
//!
//! The sub-protocols (`rbc`, `bba`, `acs`) are synchronous state machines:
//! they consume one message and return the messages to send next, never
//! touching the network themselves. `TrxBft` is the async shell that owns
//! the ticker, feeds the state machines, and builds blocks from agreed
//! outputs. `ConsensusProposer` runs the owner-initiated producer-rotation
//! subprotocol on top of the same machinery.

pub mod acs;
pub mod bba;
pub mod buffer;
pub mod chain_iface;
pub mod config;
pub mod engine;
pub mod proposer;
pub mod rbc;

pub use acs::{Acs, AcsStep};
pub use buffer::TrxBuffer;
pub use chain_iface::ChainIface;
pub use config::{
    BftConfig, DEFAULT_AGREEMENT_TICK_COUNT, DEFAULT_AGREEMENT_TICK_LEN_MS, DEFAULT_BATCH_SIZE,
    DEFAULT_PROPOSE_PULSE_MS, DEFAULT_TRX_BUFFER_CAP,
};
pub use engine::TrxBft;
pub use proposer::ConsensusProposer;
