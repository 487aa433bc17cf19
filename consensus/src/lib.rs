// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! PoET Consensus Module
//!
//! Proof of Elapsed Time: every validator draws a random wait from a
//! trusted enclave, and whoever's timer expires first claims the next block.
//! The wait certificate proves the wait was honest; the claim rules keep
//! a validator from claiming too early, too often or with a stale key.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ConsensusEngine                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │ PendingForks │  │ ChainService │  │ ForkResolver │      │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │
//! │                  ┌──────────────────┐                       │
//! │                  │  ConsensusMode   │                       │
//! │                  │ (PoET / DevMode) │                       │
//! │                  └────────┬─────────┘                       │
//! │          ┌────────────────┴───────────────┐                 │
//! │  ┌───────▼────────┐              ┌────────▼───────┐         │
//! │  │ BlockPublisher │              │ BlockVerifier  │         │
//! │  └───────┬────────┘              └────────┬───────┘         │
//! │  ┌───────▼────────────────────────────────▼───────┐         │
//! │  │ WaitEngine (timers, certificates, enclave)     │         │
//! │  │ ConsensusState (+ store, claim rules)          │         │
//! │  │ ValidatorRegistry / BlockCache                 │         │
//! │  └────────────────────────────────────────────────┘         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod block_cache;
pub mod block_publisher;
pub mod block_verifier;
pub mod consensus_state;
pub mod consensus_state_store;
pub mod context;
pub mod devmode;
pub mod engine;
pub mod fork_resolver;
pub mod frequency;
pub mod mode;
pub mod pending;
pub mod settings;
pub mod validator_registry;
pub mod wait_certificate;
pub mod wait_engine;
pub mod wait_timer;

// Re-export main types
pub use block_cache::{BlockCache, ChainIter, InMemoryBlockCache};
pub use block_publisher::{
    genesis_validator_info, PoetBlockPublisher, PoetKeyState, PoetKeyStateStore, RegistrationSink,
};
pub use block_verifier::PoetBlockVerifier;
pub use consensus_state::{ConsensusState, PopulationSample, ValidatorState};
pub use consensus_state_store::{ConsensusStateStore, StoreStats};
pub use context::PoetContext;
pub use devmode::{DevModeConsensus, RotatingProposer, DEVMODE_PAYLOAD};
pub use engine::{ChainService, ConsensusEngine, EngineConfig, EngineStats, Update};
pub use fork_resolver::{compare_forks, ForkChoice};
pub use frequency::{ClaimFrequencyTest, EstimateInfo, ZTest};
pub use mode::{ConsensusMode, PoetConsensus};
pub use pending::PendingForks;
pub use settings::{PoetSettings, SettingsView};
pub use validator_registry::{
    InMemoryRegistryStore, RegistryViewFactory, ValidatorRegistry, ValidatorRegistryView,
};
pub use wait_certificate::{previous_certificate_id, WaitCertificate, POET_PAYLOAD_TAG};
pub use wait_engine::WaitEngine;
pub use wait_timer::{unix_time_now, WaitTimer};
