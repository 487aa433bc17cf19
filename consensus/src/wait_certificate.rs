// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Wait Certificate
//!
//! Proof that a validator's wait timer expired, bound to the block it claims.
//! The certificate travels in the block's consensus field, prefixed with
//! [`POET_PAYLOAD_TAG`]; a block without the tag is not a PoET block.

use poet_enclave::{EnclaveWaitCertificate, PoetEnclave};
use poet_types::{
    block_id_is_genesis, Block, CertificateId, ConsensusError, ConsensusResult,
    NULL_BLOCK_IDENTIFIER,
};
use std::fmt;

use crate::block_cache::BlockCache;
use crate::settings::PoetSettings;

/// Marks a consensus payload as carrying a wait certificate
pub const POET_PAYLOAD_TAG: &[u8] = b"PoET1:";

/// Local means are compared with this absolute tolerance
const LOCAL_MEAN_ABS_TOLERANCE: f64 = 0.001;
const LOCAL_MEAN_REL_TOLERANCE: f64 = 1e-9;

/// `a` and `b` are within `max(rel_tol * max(|a|, |b|), abs_tol)` of each other
pub fn is_close(a: f64, b: f64, rel_tol: f64, abs_tol: f64) -> bool {
    (a - b).abs() <= (rel_tol * a.abs().max(b.abs())).max(abs_tol)
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaitCertificate {
    enclave_certificate: EnclaveWaitCertificate,
    identifier: CertificateId,
}

impl WaitCertificate {
    pub fn new(enclave_certificate: EnclaveWaitCertificate) -> ConsensusResult<Self> {
        let identifier = enclave_certificate.identifier()?;
        Ok(Self {
            enclave_certificate,
            identifier,
        })
    }

    /// Parse a consensus payload. Fails if the payload is tagged but corrupt.
    pub fn from_payload(payload: &[u8]) -> ConsensusResult<Option<Self>> {
        let Some(body) = payload.strip_prefix(POET_PAYLOAD_TAG) else {
            return Ok(None);
        };
        let enclave_certificate = EnclaveWaitCertificate::from_bytes(body).map_err(|e| {
            ConsensusError::InvalidCertificate(format!("malformed wait certificate: {}", e))
        })?;
        Self::new(enclave_certificate).map(Some)
    }

    /// The certificate carried by `block`, if it is a PoET block
    pub fn from_block(block: &Block) -> ConsensusResult<Option<Self>> {
        Self::from_payload(block.consensus())
    }

    /// Encode as a block consensus payload
    pub fn to_payload(&self) -> ConsensusResult<Vec<u8>> {
        let mut payload = POET_PAYLOAD_TAG.to_vec();
        payload.extend(self.enclave_certificate.to_bytes()?);
        Ok(payload)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn duration(&self) -> f64 {
        self.enclave_certificate.duration
    }

    pub fn local_mean(&self) -> f64 {
        self.enclave_certificate.local_mean
    }

    pub fn request_time(&self) -> f64 {
        self.enclave_certificate.request_time
    }

    pub fn previous_certificate_id(&self) -> &str {
        &self.enclave_certificate.previous_certificate_id
    }

    pub fn validator_address(&self) -> &str {
        &self.enclave_certificate.validator_address
    }

    pub fn block_hash(&self) -> &str {
        &self.enclave_certificate.block_hash
    }

    pub fn enclave_certificate(&self) -> &EnclaveWaitCertificate {
        &self.enclave_certificate
    }

    pub fn population_estimate(&self, settings: &PoetSettings) -> f64 {
        self.local_mean() / settings.target_wait_time
    }

    /// Check the certificate against the chain it claims to extend.
    ///
    /// Checks run in order: duration floor, local mean, previous certificate
    /// linkage, then the enclave signature over the PoET public key on file.
    pub fn check_valid(
        &self,
        enclave: &dyn PoetEnclave,
        previous_certificate_id: &str,
        poet_public_key: &str,
        expected_local_mean: f64,
        settings: &PoetSettings,
    ) -> ConsensusResult<()> {
        if self.duration() < settings.minimum_wait_time {
            return Err(ConsensusError::InvalidCertificate(format!(
                "wait time less than minimum: {} < {}",
                self.duration(),
                settings.minimum_wait_time
            )));
        }

        if !is_close(
            self.local_mean(),
            expected_local_mean,
            LOCAL_MEAN_REL_TOLERANCE,
            LOCAL_MEAN_ABS_TOLERANCE,
        ) {
            return Err(ConsensusError::InvalidCertificate(format!(
                "local mean does not match: {} != {}",
                self.local_mean(),
                expected_local_mean
            )));
        }

        if self.previous_certificate_id() != previous_certificate_id {
            return Err(ConsensusError::InvalidCertificate(format!(
                "previous certificate id does not match: {} != {}",
                self.previous_certificate_id(),
                previous_certificate_id
            )));
        }

        enclave.verify_wait_certificate(&self.enclave_certificate, poet_public_key)?;
        Ok(())
    }
}

impl fmt::Display for WaitCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CERT, {:.2}, {:.2}, {}, {}",
            self.local_mean(),
            self.duration(),
            self.identifier,
            self.previous_certificate_id()
        )
    }
}

/// The certificate id a block built on `previous_block_id` must link to:
/// the parent's certificate id, or [`NULL_BLOCK_IDENTIFIER`] when the parent
/// is genesis or not a PoET block.
pub fn previous_certificate_id(
    block_cache: &dyn BlockCache,
    previous_block_id: &str,
) -> ConsensusResult<CertificateId> {
    if block_id_is_genesis(previous_block_id) {
        return Ok(NULL_BLOCK_IDENTIFIER.to_string());
    }
    let previous = block_cache
        .get_block(previous_block_id)
        .ok_or_else(|| ConsensusError::UnknownBlock(previous_block_id.to_string()))?;
    Ok(WaitCertificate::from_block(&previous)?
        .map(|certificate| certificate.identifier)
        .unwrap_or_else(|| NULL_BLOCK_IDENTIFIER.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_cache::InMemoryBlockCache;
    use poet_enclave::MockEnclave;
    use poet_types::test_utils::{genesis_block, test_block_with_consensus};

    async fn signed_certificate(enclave: &MockEnclave) -> (WaitCertificate, String) {
        let signup = enclave
            .create_signup_info("originator", NULL_BLOCK_IDENTIFIER)
            .await
            .unwrap();
        let timer = enclave
            .create_wait_timer(&signup.sealed_signup_data, "validator", NULL_BLOCK_IDENTIFIER, 20.0, 1.0)
            .await
            .unwrap();
        let certificate = enclave
            .create_wait_certificate(&signup.sealed_signup_data, &timer, "hash")
            .await
            .unwrap();
        (WaitCertificate::new(certificate).unwrap(), signup.poet_public_key)
    }

    #[test]
    fn test_is_close() {
        assert!(is_close(20.0, 20.0005, 1e-9, 0.001));
        assert!(!is_close(20.0, 20.002, 1e-9, 0.001));
        assert!(is_close(1e12, 1e12 + 100.0, 1e-9, 0.0));
    }

    #[tokio::test]
    async fn test_valid_certificate_passes() {
        let enclave = MockEnclave::default_with_validator_id("v1".into()).unwrap();
        let (certificate, poet_public_key) = signed_certificate(&enclave).await;
        let settings = PoetSettings::default();

        certificate
            .check_valid(&enclave, NULL_BLOCK_IDENTIFIER, &poet_public_key, 20.0, &settings)
            .unwrap();
    }

    #[tokio::test]
    async fn test_single_field_mutations_are_rejected() {
        let enclave = MockEnclave::default_with_validator_id("v1".into()).unwrap();
        let (certificate, poet_public_key) = signed_certificate(&enclave).await;
        let settings = PoetSettings::default();

        let mutations: Vec<fn(&mut EnclaveWaitCertificate)> = vec![
            |c: &mut EnclaveWaitCertificate| c.duration += 0.5,
            |c: &mut EnclaveWaitCertificate| c.local_mean += 1.0,
            |c: &mut EnclaveWaitCertificate| c.request_time += 1.0,
            |c: &mut EnclaveWaitCertificate| {
                c.previous_certificate_id = "1111111111111111".to_string()
            },
            |c: &mut EnclaveWaitCertificate| c.validator_address = "other".to_string(),
            |c: &mut EnclaveWaitCertificate| c.nonce = "other".to_string(),
            |c: &mut EnclaveWaitCertificate| c.block_hash = "other".to_string(),
            |c: &mut EnclaveWaitCertificate| c.signature = c.signature.chars().rev().collect(),
        ];
        for mutate in mutations {
            let mut tampered = certificate.enclave_certificate().clone();
            mutate(&mut tampered);
            let tampered = WaitCertificate::new(tampered).unwrap();
            let result = tampered.check_valid(
                &enclave,
                NULL_BLOCK_IDENTIFIER,
                &poet_public_key,
                20.0,
                &settings,
            );
            assert!(matches!(result, Err(ConsensusError::InvalidCertificate(_))));
        }

        // Wrong key on file
        let result = certificate.check_valid(&enclave, NULL_BLOCK_IDENTIFIER, "00", 20.0, &settings);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_duration_floor_is_checked_first() {
        let enclave = MockEnclave::default_with_validator_id("v1".into()).unwrap();
        let (certificate, poet_public_key) = signed_certificate(&enclave).await;
        let settings = PoetSettings {
            minimum_wait_time: certificate.duration() + 1.0,
            ..Default::default()
        };
        let err = certificate
            .check_valid(&enclave, NULL_BLOCK_IDENTIFIER, &poet_public_key, 20.0, &settings)
            .unwrap_err();
        assert!(err.to_string().contains("less than minimum"));
    }

    #[tokio::test]
    async fn test_payload_round_trip_verifies() {
        let enclave = MockEnclave::default_with_validator_id("v1".into()).unwrap();
        let (certificate, poet_public_key) = signed_certificate(&enclave).await;

        let parsed = WaitCertificate::from_payload(&certificate.to_payload().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(parsed, certificate);
        assert!(enclave
            .verify_wait_certificate(parsed.enclave_certificate(), &poet_public_key)
            .is_ok());

        assert!(WaitCertificate::from_payload(b"Devmode").unwrap().is_none());
        assert!(WaitCertificate::from_payload(b"").unwrap().is_none());
        assert!(WaitCertificate::from_payload(b"PoET1:garbage").is_err());
    }

    #[tokio::test]
    async fn test_previous_certificate_id() {
        let enclave = MockEnclave::default_with_validator_id("v1".into()).unwrap();
        let (certificate, _) = signed_certificate(&enclave).await;

        let cache = InMemoryBlockCache::new();
        cache.insert(genesis_block("A"));
        cache.insert(test_block_with_consensus(
            "B",
            "A",
            1,
            "signer",
            certificate.to_payload().unwrap(),
        ));

        assert_eq!(
            previous_certificate_id(&cache, NULL_BLOCK_IDENTIFIER).unwrap(),
            NULL_BLOCK_IDENTIFIER
        );
        assert_eq!(previous_certificate_id(&cache, "A").unwrap(), NULL_BLOCK_IDENTIFIER);
        assert_eq!(previous_certificate_id(&cache, "B").unwrap(), certificate.identifier());
        assert!(matches!(
            previous_certificate_id(&cache, "Z"),
            Err(ConsensusError::UnknownBlock(_))
        ));
    }
}
