//! Error kinds shared by the consensus core.
//!
//! Every per-block failure is terminal for that block only. The engine maps
//! each kind to an action:
//!
//! | Kind                   | Action                                   |
//! |------------------------|------------------------------------------|
//! | `EnclaveUnavailable`   | abstain from claiming this round         |
//! | `InvalidCertificate`   | reject the block                         |
//! | `UnknownBlock`         | re-buffer the block in the pending queue |
//! | `RegistryLookupFailed` | reject the block                         |

use crate::BlockId;

pub type ConsensusResult<T> = Result<T, ConsensusError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConsensusError {
    #[error("Enclave unavailable: {0}")]
    EnclaveUnavailable(String),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Unknown block: {0}")]
    UnknownBlock(BlockId),

    #[error("Registry lookup failed: {0}")]
    RegistryLookupFailed(String),

    #[error("Invalid claim: {0}")]
    InvalidClaim(String),

    #[error("Invalid consensus state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Chain service error: {0}")]
    Service(String),
}

impl ConsensusError {
    /// Whether the error only means "try again later" rather than "reject"
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConsensusError::EnclaveUnavailable(_) | ConsensusError::UnknownBlock(_)
        )
    }
}
