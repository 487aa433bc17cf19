// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Block Cache
//!
//! Read access to blocks the consensus core has seen. Every predecessor of a
//! block handed to the consensus core is expected to be present.

use parking_lot::RwLock;
use poet_types::{block_id_is_genesis, Block, BlockId};
use std::collections::HashMap;

/// Read-only access to known blocks
pub trait BlockCache: Send + Sync {
    /// Look up a block by id
    fn get_block(&self, block_id: &str) -> Option<Block>;

    /// The current head of the committed chain
    fn chain_head(&self) -> Option<Block>;
}

/// Walks `previous_block_id` links until genesis or an unknown block
pub struct ChainIter<'a, C: ?Sized> {
    cache: &'a C,
    next: Option<Block>,
}

impl<'a, C: BlockCache + ?Sized> ChainIter<'a, C> {
    /// Start walking at `block_id`
    pub fn from_block(cache: &'a C, block_id: &str) -> Self {
        let next = if block_id_is_genesis(block_id) {
            None
        } else {
            cache.get_block(block_id)
        };
        Self { cache, next }
    }

    /// Start walking at the chain head
    pub fn from_head(cache: &'a C) -> Self {
        Self {
            next: cache.chain_head(),
            cache,
        }
    }
}

impl<C: BlockCache + ?Sized> Iterator for ChainIter<'_, C> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let current = self.next.take()?;
        if !block_id_is_genesis(current.previous_id()) {
            self.next = self.cache.get_block(current.previous_id());
        }
        Some(current)
    }
}

/// Thread-safe in-memory block cache
#[derive(Debug, Default)]
pub struct InMemoryBlockCache {
    blocks: RwLock<HashMap<BlockId, Block>>,
    head: RwLock<Option<BlockId>>,
}

impl InMemoryBlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, block: Block) {
        self.blocks.write().insert(block.id().to_string(), block);
    }

    /// Make `block_id` the chain head. Unknown ids are ignored.
    pub fn set_chain_head(&self, block_id: &str) -> bool {
        if !self.blocks.read().contains_key(block_id) {
            return false;
        }
        *self.head.write() = Some(block_id.to_string());
        true
    }

    pub fn contains(&self, block_id: &str) -> bool {
        self.blocks.read().contains_key(block_id)
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl BlockCache for InMemoryBlockCache {
    fn get_block(&self, block_id: &str) -> Option<Block> {
        self.blocks.read().get(block_id).cloned()
    }

    fn chain_head(&self) -> Option<Block> {
        let head = self.head.read().clone()?;
        self.get_block(&head)
    }
}
