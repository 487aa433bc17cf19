// ========== Core Modules ==========
pub mod block; // Blocks and block headers
pub mod error;
pub mod signing; // Opaque sign/verify capability
pub mod validator; // Validator registry records

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

/// Identifier of a block (the hex header signature)
pub type BlockId = String;

/// Identifier of a wait certificate (content addressed)
pub type CertificateId = String;

/// Identifier of a validator (its signing public key, hex)
pub type ValidatorId = String;

/// Block id used as the predecessor of the genesis block, and as the previous
/// certificate id of a timer that does not build on a PoET block.
pub const NULL_BLOCK_IDENTIFIER: &str = "0000000000000000";

/// Returns true when `block_id` denotes the (virtual) parent of genesis
pub fn block_id_is_genesis(block_id: &str) -> bool {
    block_id == NULL_BLOCK_IDENTIFIER
}

// Export from block module
pub use block::{short_id, Block, BlockHeader};

// Export from validator module
pub use validator::{block_id_to_nonce, SignupInfo, ValidatorInfo, ValidatorRegistryPayload};

// Signing capability
pub use signing::{sha256_hex, verify_signature, Ed25519Signer, Signer};

// Error types
pub use error::{ConsensusError, ConsensusResult};
