// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Read access shared by the PoET verifier, publisher and fork resolver.

use poet_types::ConsensusResult;
use std::sync::Arc;

use crate::block_cache::BlockCache;
use crate::consensus_state::ConsensusState;
use crate::consensus_state_store::ConsensusStateStore;
use crate::frequency::{ClaimFrequencyTest, ZTest};
use crate::settings::PoetSettings;
use crate::validator_registry::RegistryViewFactory;

#[derive(Clone)]
pub struct PoetContext {
    pub block_cache: Arc<dyn BlockCache>,
    pub registry_factory: Arc<dyn RegistryViewFactory>,
    pub state_store: Arc<ConsensusStateStore>,
    pub frequency_test: Arc<dyn ClaimFrequencyTest>,
}

impl PoetContext {
    /// Context with a default-sized state store and the z-test
    pub fn new(
        block_cache: Arc<dyn BlockCache>,
        registry_factory: Arc<dyn RegistryViewFactory>,
    ) -> Self {
        Self {
            block_cache,
            registry_factory,
            state_store: Arc::new(ConsensusStateStore::default()),
            frequency_test: Arc::new(ZTest),
        }
    }

    pub fn with_state_store(mut self, state_store: Arc<ConsensusStateStore>) -> Self {
        self.state_store = state_store;
        self
    }

    pub fn with_frequency_test(mut self, frequency_test: Arc<dyn ClaimFrequencyTest>) -> Self {
        self.frequency_test = frequency_test;
        self
    }

    /// See [`ConsensusState::consensus_state_for_block_id`]
    pub fn consensus_state_for(
        &self,
        block_id: &str,
        settings: &PoetSettings,
    ) -> ConsensusResult<ConsensusState> {
        ConsensusState::consensus_state_for_block_id(
            block_id,
            self.block_cache.as_ref(),
            self.registry_factory.as_ref(),
            &self.state_store,
            settings,
        )
    }
}
