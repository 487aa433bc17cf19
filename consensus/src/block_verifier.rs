// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Block Verifier
//!
//! Decides whether a block received from the network (or built locally) was
//! legitimately claimed:
//!
//! 1. The signer is registered in the registry as of the parent block
//! 2. The wait certificate checks out against the parent's consensus state
//! 3. None of the claim rules reject the signer

use poet_types::{Block, ConsensusError, ConsensusResult};
use tracing::{debug, info, warn};

use crate::context::PoetContext;
use crate::settings::PoetSettings;
use crate::wait_certificate::{previous_certificate_id, WaitCertificate};
use crate::wait_engine::WaitEngine;

pub struct PoetBlockVerifier {
    context: PoetContext,
    wait_engine: WaitEngine,
}

impl PoetBlockVerifier {
    pub fn new(context: PoetContext, wait_engine: WaitEngine) -> Self {
        Self {
            context,
            wait_engine,
        }
    }

    /// Check `block`, reporting why it fails.
    ///
    /// `UnknownBlock` means the parent is not known yet and the block should
    /// be retried later; every other error rejects the block.
    pub fn check_block(&self, block: &Block, settings: &PoetSettings) -> ConsensusResult<()> {
        let block_cache = self.context.block_cache.as_ref();
        let previous_block = block_cache
            .get_block(block.previous_id())
            .ok_or_else(|| ConsensusError::UnknownBlock(block.previous_id().to_string()))?;

        let certificate = WaitCertificate::from_block(block)?.ok_or_else(|| {
            ConsensusError::InvalidCertificate("block carries no wait certificate".into())
        })?;

        let registry = self
            .context
            .registry_factory
            .create_view(previous_block.state_root_hash())?;
        let validator_info = registry.get_validator_info(block.signer_public_key())?;

        let consensus_state = self.context.consensus_state_for(block.previous_id(), settings)?;

        let expected_previous_id = previous_certificate_id(block_cache, block.previous_id())?;
        self.wait_engine.verify_wait_certificate(
            &certificate,
            &expected_previous_id,
            validator_info.poet_public_key(),
            consensus_state.compute_local_mean(settings),
            settings,
        )?;
        if certificate.block_hash() != block.header.block_hash() {
            return Err(ConsensusError::InvalidCertificate(format!(
                "certificate is bound to block hash {}",
                certificate.block_hash()
            )));
        }
        debug!(block = %block, certificate = %certificate, "Wait certificate is valid");

        if consensus_state.validator_signup_was_committed_too_late(
            &validator_info,
            settings,
            block_cache,
        ) {
            return Err(ConsensusError::InvalidClaim(format!(
                "validator {} committed signup too late",
                validator_info.short_id()
            )));
        }

        if consensus_state.validator_has_claimed_block_limit(&validator_info, settings) {
            return Err(ConsensusError::InvalidClaim(format!(
                "validator {} has reached the block claim limit",
                validator_info.short_id()
            )));
        }

        if consensus_state.validator_is_claiming_too_early(
            &validator_info,
            block.block_num(),
            registry.as_ref(),
            settings,
            block_cache,
        ) {
            return Err(ConsensusError::InvalidClaim(format!(
                "validator {} is claiming too early",
                validator_info.short_id()
            )));
        }

        if consensus_state.validator_is_claiming_too_frequently(
            &validator_info,
            block.previous_id(),
            settings,
            certificate.population_estimate(settings),
            block_cache,
            &self.context.state_store,
            self.context.frequency_test.as_ref(),
        ) {
            return Err(ConsensusError::InvalidClaim(format!(
                "validator {} is claiming too frequently",
                validator_info.short_id()
            )));
        }

        Ok(())
    }

    /// Whether `block` is valid. Logs the reason when it is not.
    pub fn verify_block(&self, block: &Block, settings: &PoetSettings) -> bool {
        match self.check_block(block, settings) {
            Ok(()) => true,
            Err(e) if e.is_transient() => {
                warn!(block = %block, error = %e, "Block cannot be verified yet");
                false
            }
            Err(e) => {
                info!(block = %block, reason = %e, "Block rejected");
                false
            }
        }
    }
}
