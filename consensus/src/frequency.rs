// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Claim Frequency Test
//!
//! Detects validators that win more often than their share of the population
//! allows. The test is pluggable; the default is a one-sided z-test over the
//! population-estimate history of recent blocks.

use poet_types::{BlockId, ValidatorId, ValidatorInfo};
use tracing::{debug, info};

use crate::settings::PoetSettings;

/// One block of history as seen by the frequency test
#[derive(Debug, Clone, PartialEq)]
pub struct EstimateInfo {
    /// Population estimate in effect when the block was claimed
    pub population_estimate: f64,
    /// Parent of the block this entry describes
    pub previous_block_id: BlockId,
    /// Validator that claimed the block
    pub validator_id: ValidatorId,
}

/// Decides whether a validator claims blocks too frequently
pub trait ClaimFrequencyTest: Send + Sync {
    /// `history` is ordered newest first; its first entry is the candidate
    /// block itself.
    fn is_claiming_too_frequently(
        &self,
        validator_info: &ValidatorInfo,
        history: &[EstimateInfo],
        settings: &PoetSettings,
    ) -> bool;
}

/// z-test on observed versus expected wins.
///
/// Walking the history from newest to oldest, each block contributes
/// `1 / population_estimate` expected wins. Once the validator's observed
/// wins exceed both `ztest_minimum_win_count` and the expectation, the
/// z-score of the observation must stay at or below
/// `ztest_maximum_win_deviation`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZTest;

impl ClaimFrequencyTest for ZTest {
    fn is_claiming_too_frequently(
        &self,
        validator_info: &ValidatorInfo,
        history: &[EstimateInfo],
        settings: &PoetSettings,
    ) -> bool {
        let mut observed_wins: u64 = 0;
        let mut expected_wins = 0.0;
        let mut block_count: u64 = 0;

        for estimate in history {
            block_count += 1;
            expected_wins += 1.0 / estimate.population_estimate;

            if estimate.validator_id != validator_info.id {
                continue;
            }
            observed_wins += 1;

            let observed = observed_wins as f64;
            if observed_wins > settings.ztest_minimum_win_count && observed > expected_wins {
                let probability = expected_wins / block_count as f64;
                let standard_deviation =
                    (block_count as f64 * probability * (1.0 - probability)).sqrt();
                let z_score = (observed - expected_wins) / standard_deviation;
                if z_score > settings.ztest_maximum_win_deviation {
                    info!(
                        name = %validator_info.name,
                        validator_id = %validator_info.short_id(),
                        depth = block_count,
                        z_score,
                        expected = expected_wins,
                        observed = observed_wins,
                        "zTest failed"
                    );
                    return true;
                }
            }
        }

        debug!(
            name = %validator_info.name,
            validator_id = %validator_info.short_id(),
            depth = block_count,
            expected = expected_wins,
            observed = observed_wins,
            "zTest succeeded"
        );
        false
    }
}
