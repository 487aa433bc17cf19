// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! PoET Validator
//!
//! A single validator running the consensus engine over an in-memory local
//! chain, in PoET or dev mode.

pub mod config;
pub mod local_chain;
pub mod node;

pub use config::{Args, ConsensusModeKind, NodeConfig};
pub use local_chain::{genesis_block_id, LocalChain, GENESIS_PAYLOAD};
pub use node::{Node, NodeHandle};
