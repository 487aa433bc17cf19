// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Consensus State
//!
//! PoET statistics as of one block: how many blocks each validator claimed
//! (in total and with its current PoET key), and the recent population
//! samples the next wait timer's local mean is derived from.
//!
//! State is derived purely from the ancestors of a block by replaying their
//! wait certificates. A non-PoET block resets the statistics.
//!
//! ## Claim rules
//!
//! ```text
//! committed_too_late          signup committed > signup_commit_maximum_delay
//!                             blocks after the block its nonce refers to
//! has_claimed_block_limit     current key claimed >= key_block_claim_limit
//! is_claiming_too_early       < min(block_claim_delay, validators - 1) blocks
//!                             since the registration block
//! is_claiming_too_frequently  claim frequency test (default: z-test)
//! ```

use poet_types::{
    block_id_is_genesis, block_id_to_nonce, BlockId, ConsensusError, ConsensusResult,
    ValidatorId, ValidatorInfo,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, error, info, warn};

use crate::block_cache::{BlockCache, ChainIter};
use crate::consensus_state_store::ConsensusStateStore;
use crate::frequency::{ClaimFrequencyTest, EstimateInfo};
use crate::settings::PoetSettings;
use crate::validator_registry::{RegistryViewFactory, ValidatorRegistryView};
use crate::wait_certificate::WaitCertificate;

/// Claim statistics of one validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorState {
    /// Blocks claimed with `poet_public_key`
    pub key_block_claim_count: u64,
    /// PoET key the validator last claimed with
    pub poet_public_key: String,
    /// Blocks claimed with any key
    pub total_block_claim_count: u64,
}

/// Duration and local mean of one claimed block
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PopulationSample {
    pub duration: f64,
    pub local_mean: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusState {
    /// Sum of local means since the last non-PoET block
    aggregate_local_mean: f64,
    /// Most recent samples, oldest first, at most the configured sample size
    population_samples: VecDeque<PopulationSample>,
    total_block_claim_count: u64,
    validators: BTreeMap<ValidatorId, ValidatorState>,
}

impl ConsensusState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregate_local_mean(&self) -> f64 {
        self.aggregate_local_mean
    }

    pub fn total_block_claim_count(&self) -> u64 {
        self.total_block_claim_count
    }

    pub fn population_samples(&self) -> &VecDeque<PopulationSample> {
        &self.population_samples
    }

    /// `sum(local_mean) / sum(duration - minimum_wait_time)` over the samples
    fn compute_population_estimate(&self, settings: &PoetSettings) -> Option<f64> {
        let (sum_means, sum_waits) = self.population_samples.iter().fold(
            (0.0, 0.0),
            |(means, waits), sample| {
                (
                    means + sample.local_mean,
                    waits + (sample.duration - settings.minimum_wait_time),
                )
            },
        );
        (sum_waits > 0.0).then(|| sum_means / sum_waits)
    }

    /// Local mean for the next wait timer built on this state.
    ///
    /// During bootstrap (fewer samples than the sample size) the mean ramps
    /// from `target_wait_time` towards `initial_wait_time` as
    /// `target * (1 - r^2) + initial * r^2`, `r = samples / sample_size`.
    /// Afterwards it is `target_wait_time` times the population estimate.
    pub fn compute_local_mean(&self, settings: &PoetSettings) -> f64 {
        let sample_size = settings.population_estimate_sample_size;
        let count = self.population_samples.len();

        if count < sample_size {
            let ratio = count as f64 / sample_size as f64;
            return settings.target_wait_time * (1.0 - ratio.powi(2))
                + settings.initial_wait_time * ratio.powi(2);
        }

        match self.compute_population_estimate(settings) {
            Some(population_estimate) => settings.target_wait_time * population_estimate,
            None => {
                warn!("Population samples have no waiting time, using target wait time");
                settings.target_wait_time
            }
        }
    }

    /// State of `validator_info`'s validator, or a fresh state with its
    /// current PoET key if it has not claimed any block yet
    pub fn get_validator_state(&self, validator_info: &ValidatorInfo) -> ValidatorState {
        self.validators
            .get(&validator_info.id)
            .cloned()
            .unwrap_or_else(|| ValidatorState {
                key_block_claim_count: 0,
                poet_public_key: validator_info.poet_public_key().to_string(),
                total_block_claim_count: 0,
            })
    }

    /// Record that `validator_info`'s validator claimed a block with
    /// `certificate`
    pub fn validator_did_claim_block(
        &mut self,
        validator_info: &ValidatorInfo,
        certificate: &WaitCertificate,
        settings: &PoetSettings,
    ) {
        self.aggregate_local_mean += certificate.local_mean();
        self.total_block_claim_count += 1;
        self.population_samples.push_back(PopulationSample {
            duration: certificate.duration(),
            local_mean: certificate.local_mean(),
        });
        while self.population_samples.len() > settings.population_estimate_sample_size {
            self.population_samples.pop_front();
        }

        let validator_state = self.get_validator_state(validator_info);
        let key_block_claim_count = if validator_state.poet_public_key == validator_info.poet_public_key() {
            validator_state.key_block_claim_count + 1
        } else {
            1
        };
        let total_block_claim_count = validator_state.total_block_claim_count + 1;

        debug!(
            name = %validator_info.name,
            validator_id = %validator_info.short_id(),
            key_block_claim_count,
            total_block_claim_count,
            "Update validator state"
        );

        self.validators.insert(
            validator_info.id.clone(),
            ValidatorState {
                key_block_claim_count,
                poet_public_key: validator_info.poet_public_key().to_string(),
                total_block_claim_count,
            },
        );
    }

    /// Consensus state as of `block_id`, built from the nearest stored
    /// ancestor state (or from scratch) by replaying certificates.
    ///
    /// Every intermediate PoET block's state is written to `store`.
    pub fn consensus_state_for_block_id(
        block_id: &str,
        block_cache: &dyn BlockCache,
        registry_factory: &dyn RegistryViewFactory,
        store: &ConsensusStateStore,
        settings: &PoetSettings,
    ) -> ConsensusResult<ConsensusState> {
        // Newest first; `None` marks a non-PoET block that resets the state
        let mut blocks: Vec<(BlockId, Option<(WaitCertificate, ValidatorInfo)>)> = Vec::new();
        let mut stored_state = None;
        let mut previous_was_poet = false;
        let mut current_id = block_id.to_string();

        while !block_id_is_genesis(&current_id) {
            if let Some(state) = store.get(&current_id) {
                stored_state = Some(state);
                break;
            }
            let Some(block) = block_cache.get_block(&current_id) else {
                error!(block_id = %current_id, "Failed to retrieve block");
                break;
            };

            match WaitCertificate::from_block(&block)? {
                Some(certificate) => {
                    let registry = registry_factory.create_view(block.state_root_hash())?;
                    let validator_info = registry.get_validator_info(block.signer_public_key())?;
                    debug!(block_id = %current_id, "Building consensus state for block");
                    blocks.push((current_id.clone(), Some((certificate, validator_info))));
                    previous_was_poet = true;
                }
                None => {
                    // One marker per run of consecutive non-PoET blocks
                    if blocks.is_empty() || previous_was_poet {
                        blocks.push((current_id.clone(), None));
                    }
                    previous_was_poet = false;
                }
            }
            current_id = block.previous_id().to_string();
        }

        let mut consensus_state = stored_state.unwrap_or_default();
        for (id, entry) in blocks.into_iter().rev() {
            match entry {
                None => consensus_state = ConsensusState::new(),
                Some((certificate, validator_info)) => {
                    consensus_state.validator_did_claim_block(&validator_info, &certificate, settings);
                    debug!(
                        block_id = %id,
                        aggregate_local_mean = consensus_state.aggregate_local_mean,
                        total_block_claim_count = consensus_state.total_block_claim_count,
                        "Created consensus state"
                    );
                    store.put(id, consensus_state.clone());
                }
            }
        }
        Ok(consensus_state)
    }

    /// Whether the validator's registration was committed more than
    /// `signup_commit_maximum_delay` blocks after the block its signup nonce
    /// was derived from.
    pub fn validator_signup_was_committed_too_late(
        &self,
        validator_info: &ValidatorInfo,
        settings: &PoetSettings,
        block_cache: &dyn BlockCache,
    ) -> bool {
        let commit_block_id = &validator_info.registration_block_id;
        let Some(mut block) = block_cache.get_block(commit_block_id) else {
            warn!(
                name = %validator_info.name,
                validator_id = %validator_info.short_id(),
                block_id = %commit_block_id,
                "Signup commit block not found"
            );
            return false;
        };

        for _ in 0..=settings.signup_commit_maximum_delay {
            if block_id_to_nonce(block.previous_id()) == validator_info.signup_info.nonce {
                debug!(
                    validator_id = %validator_info.short_id(),
                    commit_block = %commit_block_id,
                    chain_head = %block.previous_id(),
                    "Signup committed in time"
                );
                return false;
            }
            if block_id_is_genesis(block.previous_id()) {
                info!(
                    validator_id = %validator_info.short_id(),
                    commit_block = %commit_block_id,
                    nonce = %validator_info.signup_info.nonce,
                    "Hit start of blockchain looking for signup nonce"
                );
                return true;
            }
            match block_cache.get_block(block.previous_id()) {
                Some(previous) => block = previous,
                None => {
                    warn!(block_id = %block.previous_id(), "Chain walk hit unknown block");
                    return true;
                }
            }
        }

        info!(
            validator_id = %validator_info.short_id(),
            commit_block = %commit_block_id,
            nonce = %validator_info.signup_info.nonce,
            depth = settings.signup_commit_maximum_delay + 1,
            "Signup nonce not found within commit delay"
        );
        true
    }

    /// Whether the validator has claimed `key_block_claim_limit` blocks with
    /// its current PoET key
    pub fn validator_has_claimed_block_limit(
        &self,
        validator_info: &ValidatorInfo,
        settings: &PoetSettings,
    ) -> bool {
        let validator_state = self.get_validator_state(validator_info);
        if validator_state.poet_public_key != validator_info.poet_public_key() {
            return false;
        }
        if validator_state.key_block_claim_count >= settings.key_block_claim_limit {
            info!(
                name = %validator_info.name,
                validator_id = %validator_info.short_id(),
                claimed = validator_state.key_block_claim_count,
                limit = settings.key_block_claim_limit,
                "Reached block claim limit for PoET key"
            );
            return true;
        }
        false
    }

    /// Whether the validator tries to claim `block_number` before
    /// `min(block_claim_delay, validators - 1)` blocks have passed since its
    /// registration block
    pub fn validator_is_claiming_too_early(
        &self,
        validator_info: &ValidatorInfo,
        block_number: u64,
        registry: &dyn ValidatorRegistryView,
        settings: &PoetSettings,
        block_cache: &dyn BlockCache,
    ) -> bool {
        let number_of_validators = registry.get_validators().len() as u64;
        let block_claim_delay = settings
            .block_claim_delay
            .min(number_of_validators.saturating_sub(1));

        if self.total_block_claim_count <= block_claim_delay {
            debug!(
                claimed = self.total_block_claim_count,
                block_claim_delay,
                number_of_validators,
                "Skipping block claim delay check"
            );
            return false;
        }

        let Some(commit_block) = block_cache.get_block(&validator_info.registration_block_id) else {
            warn!(
                validator_id = %validator_info.short_id(),
                block_id = %validator_info.registration_block_id,
                "Registration block not found, skipping block claim delay check"
            );
            return false;
        };

        let blocks_claimed_since_registration = block_number as i64 - commit_block.block_num() as i64 - 1;
        if (block_claim_delay as i64) > blocks_claimed_since_registration {
            info!(
                name = %validator_info.name,
                validator_id = %validator_info.short_id(),
                committed_in = commit_block.block_num(),
                block_number,
                must_wait_until = commit_block.block_num() + block_claim_delay + 1,
                "Validator is claiming too early"
            );
            return true;
        }
        false
    }

    /// History for the claim frequency test: walks back
    /// `total_block_claim_count - population_estimate_sample_size` blocks
    /// from `block_id`, newest first. Stops early at a block that is unknown
    /// or carries no certificate.
    pub fn build_population_estimate_list(
        &self,
        block_id: &str,
        settings: &PoetSettings,
        block_cache: &dyn BlockCache,
        store: &ConsensusStateStore,
    ) -> Vec<EstimateInfo> {
        let number_of_blocks = self
            .total_block_claim_count
            .saturating_sub(settings.population_estimate_sample_size as u64);
        let mut estimates = Vec::new();
        let mut current_id = block_id.to_string();

        for _ in 0..number_of_blocks {
            if block_id_is_genesis(&current_id) {
                break;
            }
            let estimate = match store.get_estimate(&current_id) {
                Some(estimate) => estimate,
                None => {
                    let Some(block) = block_cache.get_block(&current_id) else {
                        break;
                    };
                    let Ok(Some(certificate)) = WaitCertificate::from_block(&block) else {
                        break;
                    };
                    let estimate = EstimateInfo {
                        population_estimate: certificate.population_estimate(settings),
                        previous_block_id: block.previous_id().to_string(),
                        validator_id: block.signer_public_key().to_string(),
                    };
                    store.put_estimate(current_id.clone(), estimate.clone());
                    estimate
                }
            };
            current_id = estimate.previous_block_id.clone();
            estimates.push(estimate);
        }
        estimates
    }

    /// Whether letting the validator claim the block after
    /// `previous_block_id` (with the candidate's `population_estimate`)
    /// would make it win more often than `frequency_test` allows
    #[allow(clippy::too_many_arguments)]
    pub fn validator_is_claiming_too_frequently(
        &self,
        validator_info: &ValidatorInfo,
        previous_block_id: &str,
        settings: &PoetSettings,
        population_estimate: f64,
        block_cache: &dyn BlockCache,
        store: &ConsensusStateStore,
        frequency_test: &dyn ClaimFrequencyTest,
    ) -> bool {
        if self.total_block_claim_count < settings.population_estimate_sample_size as u64 {
            return false;
        }

        let mut history = vec![EstimateInfo {
            population_estimate,
            previous_block_id: previous_block_id.to_string(),
            validator_id: validator_info.id.clone(),
        }];
        history.extend(self.build_population_estimate_list(
            previous_block_id,
            settings,
            block_cache,
            store,
        ));

        frequency_test.is_claiming_too_frequently(validator_info, &history, settings)
    }

    /// Whether a registration created with `signup_nonce` should be given
    /// up: no block within `signup_commit_maximum_delay + 1` blocks of the
    /// chain head produced that nonce.
    pub fn signup_attempt_timed_out(
        &self,
        signup_nonce: &str,
        settings: &PoetSettings,
        block_cache: &dyn BlockCache,
    ) -> bool {
        let commit_delay = settings.signup_commit_maximum_delay;
        for (depth, block) in ChainIter::from_head(block_cache).enumerate() {
            if depth as u64 > commit_delay {
                warn!(
                    nonce = %signup_nonce,
                    commit_delay,
                    "Registration has not committed in time"
                );
                return true;
            }
            if block_id_to_nonce(block.id()) == signup_nonce {
                return false;
            }
        }
        false
    }

    /// Encode for storage
    pub fn serialize_to_bytes(&self) -> ConsensusResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ConsensusError::Serialization(e.to_string()))
    }

    /// Decode and validate a state produced by [`Self::serialize_to_bytes`]
    pub fn parse_from_bytes(buffer: &[u8]) -> ConsensusResult<Self> {
        let state: ConsensusState = serde_json::from_slice(buffer)
            .map_err(|e| ConsensusError::Serialization(e.to_string()))?;
        state.validate()?;
        Ok(state)
    }

    fn validate(&self) -> ConsensusResult<()> {
        if !self.aggregate_local_mean.is_finite() || self.aggregate_local_mean < 0.0 {
            return Err(ConsensusError::InvalidState(format!(
                "aggregate_local_mean ({}) is invalid",
                self.aggregate_local_mean
            )));
        }
        for sample in &self.population_samples {
            if !sample.duration.is_finite() || sample.duration < 0.0 {
                return Err(ConsensusError::InvalidState(format!(
                    "duration ({}) is invalid",
                    sample.duration
                )));
            }
            if !sample.local_mean.is_finite() || sample.local_mean < 0.0 {
                return Err(ConsensusError::InvalidState(format!(
                    "local_mean ({}) is invalid",
                    sample.local_mean
                )));
            }
        }
        for (validator_id, validator_state) in &self.validators {
            if validator_state.poet_public_key.is_empty() {
                return Err(ConsensusError::InvalidState(format!(
                    "poet_public_key for {} is empty",
                    validator_id
                )));
            }
            if validator_state.key_block_claim_count > validator_state.total_block_claim_count {
                return Err(ConsensusError::InvalidState(format!(
                    "total_block_claim_count ({}) is less than key_block_claim_count ({})",
                    validator_state.total_block_claim_count, validator_state.key_block_claim_count
                )));
            }
        }
        Ok(())
    }
}
