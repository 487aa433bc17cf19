// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Consensus State Store
//!
//! Bounded caches of derived consensus data:
//! - [`ConsensusState`] per block id, so the chain walk in
//!   [`ConsensusState::consensus_state_for_block_id`] stops at the first
//!   block whose state is already known
//! - [`EstimateInfo`] per block id, used by the claim frequency test
//!
//! Both caches are owned by the store instance; nothing is global.

use lru::LruCache;
use parking_lot::Mutex;
use poet_types::BlockId;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::consensus_state::ConsensusState;
use crate::frequency::EstimateInfo;

/// Default number of consensus states kept
pub const DEFAULT_STATE_CAPACITY: usize = 1024;

/// Default number of population estimates kept
pub const DEFAULT_ESTIMATE_CAPACITY: usize = 4096;

/// Hit/miss counters for the state cache
#[derive(Debug, Default)]
pub struct StoreStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

impl StoreStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}

fn capacity(requested: usize) -> NonZeroUsize {
    NonZeroUsize::new(requested).unwrap_or(NonZeroUsize::MIN)
}

pub struct ConsensusStateStore {
    states: Mutex<LruCache<BlockId, ConsensusState>>,
    estimates: Mutex<LruCache<BlockId, EstimateInfo>>,
    stats: StoreStats,
}

impl Default for ConsensusStateStore {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_CAPACITY, DEFAULT_ESTIMATE_CAPACITY)
    }
}

impl ConsensusStateStore {
    /// Capacities of zero are raised to one
    pub fn new(state_capacity: usize, estimate_capacity: usize) -> Self {
        Self {
            states: Mutex::new(LruCache::new(capacity(state_capacity))),
            estimates: Mutex::new(LruCache::new(capacity(estimate_capacity))),
            stats: StoreStats::default(),
        }
    }

    pub fn get(&self, block_id: &str) -> Option<ConsensusState> {
        let result = self.states.lock().get(block_id).cloned();
        if result.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub fn put(&self, block_id: impl Into<BlockId>, state: ConsensusState) {
        self.states.lock().put(block_id.into(), state);
    }

    pub fn contains(&self, block_id: &str) -> bool {
        self.states.lock().contains(block_id)
    }

    pub fn remove(&self, block_id: &str) -> Option<ConsensusState> {
        self.states.lock().pop(block_id)
    }

    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.lock().is_empty()
    }

    pub fn get_estimate(&self, block_id: &str) -> Option<EstimateInfo> {
        self.estimates.lock().get(block_id).cloned()
    }

    pub fn put_estimate(&self, block_id: impl Into<BlockId>, estimate: EstimateInfo) {
        self.estimates.lock().put(block_id.into(), estimate);
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }
}
