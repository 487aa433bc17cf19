// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Consensus Modes
//!
//! A consensus mode decides who may build the next block, how a claim is
//! proven and how competing forks are ordered. Exactly one mode drives an
//! engine; it is chosen at startup.
//!
//! ## Modes
//!
//! - [`PoetConsensus`]: Proof of Elapsed Time
//! - [`DevModeConsensus`](crate::devmode::DevModeConsensus): round-robin
//!   proposer rotation for development networks

use async_trait::async_trait;
use poet_types::{Block, BlockHeader, ConsensusResult};

use crate::block_publisher::PoetBlockPublisher;
use crate::block_verifier::PoetBlockVerifier;
use crate::fork_resolver::{compare_forks, ForkChoice};
use crate::settings::{PoetSettings, SettingsView};

#[async_trait]
pub trait ConsensusMode: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Prepare to build the block described by `candidate`. `false` means
    /// the local validator abstains from this candidate.
    async fn build_block(
        &mut self,
        candidate: &BlockHeader,
        settings: &dyn SettingsView,
    ) -> ConsensusResult<bool>;

    /// Whether the candidate may be claimed at `now` (seconds since epoch)
    fn check_claim_block(&self, candidate: &BlockHeader, now: f64) -> bool;

    /// Consensus payload for the candidate, or `None` to abandon it
    async fn claim_block(&mut self, candidate: &BlockHeader) -> ConsensusResult<Option<Vec<u8>>>;

    /// Forget the candidate being built
    fn cancel_block(&mut self);

    /// Check a block produced by any validator
    fn verify_block(&self, block: &Block, settings: &dyn SettingsView) -> ConsensusResult<()>;

    fn compare_forks(&self, current_head: &Block, candidate_head: &Block) -> ForkChoice;
}

/// Proof of Elapsed Time
pub struct PoetConsensus {
    publisher: PoetBlockPublisher,
    verifier: PoetBlockVerifier,
}

impl PoetConsensus {
    pub fn new(publisher: PoetBlockPublisher, verifier: PoetBlockVerifier) -> Self {
        Self {
            publisher,
            verifier,
        }
    }

    pub fn publisher(&self) -> &PoetBlockPublisher {
        &self.publisher
    }
}

#[async_trait]
impl ConsensusMode for PoetConsensus {
    fn name(&self) -> &'static str {
        "poet"
    }

    async fn build_block(
        &mut self,
        candidate: &BlockHeader,
        settings: &dyn SettingsView,
    ) -> ConsensusResult<bool> {
        let settings = PoetSettings::from_view(settings);
        self.publisher.initialize_block(candidate, &settings).await
    }

    fn check_claim_block(&self, _candidate: &BlockHeader, now: f64) -> bool {
        self.publisher.check_publish_block(now)
    }

    async fn claim_block(&mut self, candidate: &BlockHeader) -> ConsensusResult<Option<Vec<u8>>> {
        self.publisher.finalize_block(candidate).await
    }

    fn cancel_block(&mut self) {
        self.publisher.cancel_block();
    }

    fn verify_block(&self, block: &Block, settings: &dyn SettingsView) -> ConsensusResult<()> {
        self.verifier
            .check_block(block, &PoetSettings::from_view(settings))
    }

    fn compare_forks(&self, current_head: &Block, candidate_head: &Block) -> ForkChoice {
        compare_forks(current_head, candidate_head)
    }
}
