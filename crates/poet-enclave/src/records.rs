//! Records produced by the enclave.
//!
//! Timers and certificates are signed over a canonical bincode encoding of
//! their fields (everything except the signature itself). The same encoding
//! is used on the wire, so floats survive a round trip bit for bit.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::traits::{EnclaveError, EnclaveResult};

/// A signed random wait duration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnclaveWaitTimer {
    pub validator_address: String,
    pub duration: f64,
    pub previous_certificate_id: String,
    pub local_mean: f64,
    /// Seconds since the Unix epoch
    pub request_time: f64,
    /// Hex signature by the PoET key over [`Self::signing_bytes`]
    pub signature: String,
}

impl EnclaveWaitTimer {
    pub fn signing_bytes(&self) -> EnclaveResult<Vec<u8>> {
        bincode::serialize(&(
            &self.validator_address,
            self.duration,
            &self.previous_certificate_id,
            self.local_mean,
            self.request_time,
        ))
        .map_err(|e| EnclaveError::Serialization(e.to_string()))
    }

    pub fn to_bytes(&self) -> EnclaveResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| EnclaveError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> EnclaveResult<Self> {
        bincode::deserialize(bytes).map_err(|e| EnclaveError::Serialization(e.to_string()))
    }
}

/// Proof that a wait timer expired and was converted into a block claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnclaveWaitCertificate {
    pub duration: f64,
    pub previous_certificate_id: String,
    pub local_mean: f64,
    pub request_time: f64,
    pub validator_address: String,
    pub nonce: String,
    pub block_hash: String,
    /// Hex signature by the PoET key over [`Self::signing_bytes`]
    pub signature: String,
}

impl EnclaveWaitCertificate {
    pub fn signing_bytes(&self) -> EnclaveResult<Vec<u8>> {
        bincode::serialize(&(
            self.duration,
            &self.previous_certificate_id,
            self.local_mean,
            self.request_time,
            &self.validator_address,
            &self.nonce,
            &self.block_hash,
        ))
        .map_err(|e| EnclaveError::Serialization(e.to_string()))
    }

    /// Content address of the certificate: the first 16 hex characters of
    /// SHA-256 over the signed fields and the signature.
    pub fn identifier(&self) -> EnclaveResult<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.signing_bytes()?);
        hasher.update(self.signature.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Ok(digest[..16].to_string())
    }

    pub fn to_bytes(&self) -> EnclaveResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| EnclaveError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> EnclaveResult<Self> {
        bincode::deserialize(bytes).map_err(|e| EnclaveError::Serialization(e.to_string()))
    }
}

/// Signup information as returned by the enclave. Unlike the registry
/// record it carries the sealed signup data, which never leaves the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveSignupInfo {
    pub poet_public_key: String,
    pub proof_data: String,
    pub anti_sybil_id: String,
    pub nonce: String,
    pub sealed_signup_data: String,
}

impl EnclaveSignupInfo {
    /// The registry-facing part of the signup information
    pub fn to_signup_info(&self) -> poet_types::SignupInfo {
        poet_types::SignupInfo {
            poet_public_key: self.poet_public_key.clone(),
            proof_data: self.proof_data.clone(),
            anti_sybil_id: self.anti_sybil_id.clone(),
            nonce: self.nonce.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn certificate() -> EnclaveWaitCertificate {
        EnclaveWaitCertificate {
            duration: 12.5,
            previous_certificate_id: "0000000000000000".to_string(),
            local_mean: 20.0,
            request_time: 1_700_000_000.25,
            validator_address: "validator".to_string(),
            nonce: "nonce".to_string(),
            block_hash: "hash".to_string(),
            signature: "sig".to_string(),
        }
    }

    #[test]
    fn test_identifier_is_content_addressed() {
        let cert = certificate();
        let id = cert.identifier().unwrap();
        assert_eq!(id.len(), 16);
        assert_eq!(id, certificate().identifier().unwrap());

        let mut other = certificate();
        other.duration = 12.6;
        assert_ne!(id, other.identifier().unwrap());

        let mut resigned = certificate();
        resigned.signature = "other".to_string();
        assert_ne!(id, resigned.identifier().unwrap());
    }

    #[test]
    fn test_signing_bytes_exclude_signature() {
        let mut cert = certificate();
        let before = cert.signing_bytes().unwrap();
        cert.signature = "changed".to_string();
        assert_eq!(before, cert.signing_bytes().unwrap());
    }

    #[test]
    fn test_wire_encoding_preserves_floats() {
        let cert = EnclaveWaitCertificate {
            duration: 0.1 + 0.2,
            ..certificate()
        };
        let parsed = EnclaveWaitCertificate::from_bytes(&cert.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.duration.to_bits(), cert.duration.to_bits());
        assert_eq!(parsed, cert);

        assert!(EnclaveWaitCertificate::from_bytes(b"garbage").is_err());
    }
}
