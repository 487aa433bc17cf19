// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Dev Mode
//!
//! Round-robin block production for development networks. Validators take
//! turns by block number; no enclave is involved.
//!
//! The rotation:
//! ```text
//! proposer_index = (block_num / contiguous_blocks) % num_validators
//! ```

use async_trait::async_trait;
use poet_types::{Block, BlockHeader, ConsensusError, ConsensusResult, ValidatorId};
use std::time::Duration;
use tracing::debug;

use crate::fork_resolver::{compare_forks, ForkChoice};
use crate::mode::ConsensusMode;
use crate::settings::SettingsView;
use crate::wait_timer::unix_time_now;

/// Consensus payload of dev mode blocks
pub const DEVMODE_PAYLOAD: &[u8] = b"Devmode";

/// Round-robin proposer rotation.
///
/// All validators must agree on the order of `proposers`; it is kept sorted
/// by id.
#[derive(Debug, Clone)]
pub struct RotatingProposer {
    proposers: Vec<ValidatorId>,
    /// Number of consecutive blocks a proposer builds
    contiguous_blocks: u64,
}

impl RotatingProposer {
    pub fn new(proposers: Vec<ValidatorId>) -> Self {
        Self::with_contiguous_blocks(proposers, 1)
    }

    pub fn with_contiguous_blocks(mut proposers: Vec<ValidatorId>, contiguous_blocks: u64) -> Self {
        proposers.sort();
        proposers.dedup();
        Self {
            proposers,
            contiguous_blocks: contiguous_blocks.max(1),
        }
    }

    /// The proposer of block `block_num`
    pub fn get_valid_proposer(&self, block_num: u64) -> Option<&ValidatorId> {
        if self.proposers.is_empty() {
            return None;
        }
        let index = (block_num / self.contiguous_blocks) % self.proposers.len() as u64;
        self.proposers.get(index as usize)
    }

    pub fn is_valid_proposer(&self, validator_id: &str, block_num: u64) -> bool {
        self.get_valid_proposer(block_num)
            .is_some_and(|proposer| proposer == validator_id)
    }

    pub fn proposer_count(&self) -> usize {
        self.proposers.len()
    }
}

pub struct DevModeConsensus {
    validator_id: ValidatorId,
    election: RotatingProposer,
    /// Minimum time between starting a block and claiming it
    block_interval: Duration,
    build_started: Option<f64>,
}

impl DevModeConsensus {
    pub fn new(validator_id: impl Into<ValidatorId>, election: RotatingProposer, block_interval: Duration) -> Self {
        Self {
            validator_id: validator_id.into(),
            election,
            block_interval,
            build_started: None,
        }
    }
}

#[async_trait]
impl ConsensusMode for DevModeConsensus {
    fn name(&self) -> &'static str {
        "devmode"
    }

    async fn build_block(
        &mut self,
        candidate: &BlockHeader,
        _settings: &dyn SettingsView,
    ) -> ConsensusResult<bool> {
        if !self.election.is_valid_proposer(&self.validator_id, candidate.block_num) {
            debug!(block_num = candidate.block_num, "Not our turn to build");
            return Ok(false);
        }
        self.build_started = Some(unix_time_now());
        Ok(true)
    }

    fn check_claim_block(&self, _candidate: &BlockHeader, now: f64) -> bool {
        self.build_started
            .is_some_and(|started| now >= started + self.block_interval.as_secs_f64())
    }

    async fn claim_block(&mut self, _candidate: &BlockHeader) -> ConsensusResult<Option<Vec<u8>>> {
        Ok(self.build_started.take().map(|_| DEVMODE_PAYLOAD.to_vec()))
    }

    fn cancel_block(&mut self) {
        self.build_started = None;
    }

    fn verify_block(&self, block: &Block, _settings: &dyn SettingsView) -> ConsensusResult<()> {
        if block.consensus() != DEVMODE_PAYLOAD {
            return Err(ConsensusError::InvalidCertificate(
                "block is not a dev mode block".into(),
            ));
        }
        if !self
            .election
            .is_valid_proposer(block.signer_public_key(), block.block_num())
        {
            return Err(ConsensusError::InvalidClaim(format!(
                "{} is not the proposer of block {}",
                block.signer_public_key(),
                block.block_num()
            )));
        }
        Ok(())
    }

    fn compare_forks(&self, current_head: &Block, candidate_head: &Block) -> ForkChoice {
        compare_forks(current_head, candidate_head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poet_types::test_utils::{test_block, test_block_with_consensus};
    use std::collections::HashMap;

    fn election() -> RotatingProposer {
        RotatingProposer::new(vec!["v3".to_string(), "v1".to_string(), "v2".to_string()])
    }

    #[test]
    fn test_rotation() {
        let election = election();
        assert_eq!(election.get_valid_proposer(0).map(String::as_str), Some("v1"));
        assert_eq!(election.get_valid_proposer(1).map(String::as_str), Some("v2"));
        assert_eq!(election.get_valid_proposer(2).map(String::as_str), Some("v3"));
        assert_eq!(election.get_valid_proposer(3).map(String::as_str), Some("v1"));

        assert!(RotatingProposer::new(vec![]).get_valid_proposer(0).is_none());
    }

    #[test]
    fn test_contiguous_blocks() {
        let election = RotatingProposer::with_contiguous_blocks(vec!["v1".into(), "v2".into(), "v1".into()], 2);
        assert_eq!(election.proposer_count(), 2);
        assert!(election.is_valid_proposer("v1", 0));
        assert!(election.is_valid_proposer("v1", 1));
        assert!(election.is_valid_proposer("v2", 2));
        assert!(election.is_valid_proposer("v2", 3));
        assert!(election.is_valid_proposer("v1", 4));
    }

    #[tokio::test]
    async fn test_build_and_claim_in_turn() {
        let mut mode = DevModeConsensus::new("v2", election(), Duration::from_secs(1));
        let settings: HashMap<String, String> = HashMap::new();
        let mut candidate = test_block("b", "a", 1).header;

        assert!(mode.build_block(&candidate, &settings).await.unwrap());
        assert!(!mode.check_claim_block(&candidate, 0.0));
        assert!(mode.check_claim_block(&candidate, f64::MAX));
        assert_eq!(mode.claim_block(&candidate).await.unwrap(), Some(DEVMODE_PAYLOAD.to_vec()));

        candidate.block_num = 2;
        assert!(!mode.build_block(&candidate, &settings).await.unwrap());
        assert_eq!(mode.claim_block(&candidate).await.unwrap(), None);
    }

    #[test]
    fn test_verify_block() {
        let mode = DevModeConsensus::new("v1", election(), Duration::ZERO);
        let settings: HashMap<String, String> = HashMap::new();

        let good = test_block_with_consensus("b", "a", 1, "v2", DEVMODE_PAYLOAD.to_vec());
        assert!(mode.verify_block(&good, &settings).is_ok());

        let wrong_turn = test_block_with_consensus("b", "a", 1, "v3", DEVMODE_PAYLOAD.to_vec());
        assert!(matches!(
            mode.verify_block(&wrong_turn, &settings),
            Err(ConsensusError::InvalidClaim(_))
        ));

        let poet = test_block_with_consensus("b", "a", 1, "v2", b"PoET1:...".to_vec());
        assert!(matches!(
            mode.verify_block(&poet, &settings),
            Err(ConsensusError::InvalidCertificate(_))
        ));
    }
}
