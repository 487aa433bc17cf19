//! Helpers for building blocks in tests.

use crate::{Block, BlockHeader, NULL_BLOCK_IDENTIFIER};

/// An unsigned block with an arbitrary id; enough for queue and cache tests.
pub fn test_block(id: &str, previous_id: &str, block_num: u64) -> Block {
    Block::new(
        BlockHeader {
            block_num,
            previous_block_id: previous_id.to_string(),
            signer_public_key: "test-signer".to_string(),
            batch_ids: Vec::new(),
            state_root_hash: String::new(),
            consensus: Vec::new(),
        },
        id,
    )
}

/// A genesis block with the given id
pub fn genesis_block(id: &str) -> Block {
    test_block(id, NULL_BLOCK_IDENTIFIER, 0)
}

/// Same as [`test_block`] but with a consensus payload and signer
pub fn test_block_with_consensus(
    id: &str,
    previous_id: &str,
    block_num: u64,
    signer_public_key: &str,
    consensus: Vec<u8>,
) -> Block {
    let mut block = test_block(id, previous_id, block_num);
    block.header.signer_public_key = signer_public_key.to_string();
    block.header.consensus = consensus;
    block
}
