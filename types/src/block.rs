//! Block and block header.
//!
//! A block is identified by its header signature. The `consensus` field holds
//! the serialized wait certificate for PoET blocks and is empty (or carries a
//! mode tag) for blocks produced by other consensus modes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::signing::{verify_signature, Signer};
use crate::{block_id_is_genesis, BlockId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub block_num: u64,
    pub previous_block_id: BlockId,
    /// Hex public key of the validator that signed the block
    pub signer_public_key: String,
    pub batch_ids: Vec<String>,
    pub state_root_hash: String,
    pub consensus: Vec<u8>,
}

impl BlockHeader {
    /// Digest over every header field; this is what the signer signs.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.block_num.to_le_bytes());
        Self::update_field(&mut hasher, self.previous_block_id.as_bytes());
        Self::update_field(&mut hasher, self.signer_public_key.as_bytes());
        hasher.update((self.batch_ids.len() as u64).to_le_bytes());
        for batch_id in &self.batch_ids {
            Self::update_field(&mut hasher, batch_id.as_bytes());
        }
        Self::update_field(&mut hasher, self.state_root_hash.as_bytes());
        Self::update_field(&mut hasher, &self.consensus);
        hasher.finalize().into()
    }

    /// Hash bound into the wait certificate: previous block id plus batch ids.
    /// It excludes the consensus field, which is filled in afterwards.
    pub fn block_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.previous_block_id.as_bytes());
        for batch_id in &self.batch_ids {
            hasher.update(batch_id.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    /// Signature over the header digest; doubles as the block id
    pub header_signature: BlockId,
}

impl Block {
    pub fn new(header: BlockHeader, header_signature: impl Into<BlockId>) -> Self {
        Self {
            header,
            header_signature: header_signature.into(),
        }
    }

    /// Sign `header` and wrap it into a block
    pub fn sign(header: BlockHeader, signer: &dyn Signer) -> Self {
        let header_signature = signer.sign(&header.digest());
        Self::new(header, header_signature)
    }

    pub fn id(&self) -> &str {
        &self.header_signature
    }

    pub fn block_num(&self) -> u64 {
        self.header.block_num
    }

    pub fn previous_id(&self) -> &str {
        &self.header.previous_block_id
    }

    pub fn signer_public_key(&self) -> &str {
        &self.header.signer_public_key
    }

    pub fn state_root_hash(&self) -> &str {
        &self.header.state_root_hash
    }

    pub fn consensus(&self) -> &[u8] {
        &self.header.consensus
    }

    /// True for the first block of the chain
    pub fn is_genesis(&self) -> bool {
        block_id_is_genesis(&self.header.previous_block_id)
    }

    /// Check the header signature against the signer public key
    pub fn verify_signature(&self) -> bool {
        verify_signature(
            &self.header.signer_public_key,
            &self.header.digest(),
            &self.header_signature,
        )
    }
}

/// First eight characters of `id`, for log lines. Ids that cannot be cut
/// there are returned whole.
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let id = &self.header_signature;
        write!(
            f,
            "Block(num={}, id={}, prev={})",
            self.header.block_num,
            short_id(id),
            short_id(&self.header.previous_block_id)
        )
    }
}
