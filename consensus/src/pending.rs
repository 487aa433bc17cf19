// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Pending Forks
//!
//! Buffers validated blocks until the engine is free to resolve them. Each
//! slot holds the newest known tip of one fork: a block extending a queued
//! block takes over that block's slot, keeping the slot's position. Slots are
//! served oldest first, so independent forks are resolved in the order their
//! roots arrived.
//!
//! Blocks live in an arena keyed by id; `order` lists the occupied slots.

use poet_types::{Block, BlockId};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct PendingForks {
    blocks: HashMap<BlockId, Block>,
    order: Vec<BlockId>,
}

impl PendingForks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `block`, replacing its parent's slot if the parent is queued
    pub fn push(&mut self, block: Block) {
        let block_id = block.id().to_string();
        if self.blocks.contains_key(&block_id) {
            return;
        }

        let parent_slot = self
            .order
            .iter()
            .position(|queued| queued.as_str() == block.previous_id());
        match parent_slot {
            Some(slot) => {
                let parent_id = std::mem::replace(&mut self.order[slot], block_id.clone());
                self.blocks.remove(&parent_id);
            }
            None => self.order.push(block_id.clone()),
        }
        self.blocks.insert(block_id, block);
    }

    /// Remove and return the block in the oldest slot
    pub fn pop(&mut self) -> Option<Block> {
        if self.order.is_empty() {
            return None;
        }
        let block_id = self.order.remove(0);
        self.blocks.remove(&block_id)
    }

    pub fn contains(&self, block_id: &str) -> bool {
        self.blocks.contains_key(block_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
