//! Validator registry records.

use serde::{Deserialize, Serialize};

use crate::{BlockId, ValidatorId};

/// Signup information produced by a validator's enclave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignupInfo {
    /// Hex public key the enclave signs timers and certificates with
    pub poet_public_key: String,
    /// Attestation evidence (a signed verification report, JSON)
    pub proof_data: String,
    /// Identifier binding the validator to one enclave instance
    pub anti_sybil_id: String,
    /// Nonce derived from the chain head at signup time
    pub nonce: String,
}

/// A committed validator registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    /// Signing public key of the validator
    pub id: ValidatorId,
    /// Human readable name
    pub name: String,
    pub signup_info: SignupInfo,
    /// Id of the registration transaction
    pub transaction_id: String,
    /// Block in which the registration was committed
    pub registration_block_id: BlockId,
}

impl ValidatorInfo {
    pub fn poet_public_key(&self) -> &str {
        &self.signup_info.poet_public_key
    }

    /// `id` abbreviated for log lines
    pub fn short_id(&self) -> &str {
        crate::block::short_id(&self.id)
    }
}

/// Registration transaction submitted by a validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRegistryPayload {
    pub name: String,
    /// Must equal the public key that signed the transaction
    pub id: ValidatorId,
    pub signup_info: SignupInfo,
}

/// Convert a block id into the nonce used in signup information.
///
/// The nonce is the last 16 characters of the block id, so a registration can
/// later be traced back to the chain head it was created against.
pub fn block_id_to_nonce(block_id: &str) -> String {
    match block_id.char_indices().rev().nth(15) {
        Some((start, _)) => block_id[start..].to_string(),
        None => block_id.to_string(),
    }
}
