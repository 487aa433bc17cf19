//! Simulated enclave for development and testing.
//!
//! The MockEnclave mimics a PoET enclave without requiring SGX hardware:
//! - PoET keys are "sealed" by plain encoding (no confidentiality)
//! - Durations are derived from a seal-key signature over the previous
//!   certificate id, so a validator cannot re-roll its wait on the same block
//! - Verification reports are signed by a local stand-in for the attestation
//!   service

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use poet_types::{
    sha256_hex, short_id, verify_signature, Ed25519Signer, Signer, NULL_BLOCK_IDENTIFIER,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    attestation::{
        anti_sybil_id, signup_report_data, AllowlistVerifier, EvidencePayload, SignupProof,
        VerificationReport, STATUS_OK,
    },
    records::{EnclaveSignupInfo, EnclaveWaitCertificate, EnclaveWaitTimer},
    sgx::{SgxBasename, SgxMeasurement, SgxQuote, SgxReportBody},
    traits::{EnclaveConfig, EnclaveError, EnclaveInfo, EnclavePlatform, EnclaveResult, PoetEnclave},
};

/// Simulator enclave measurement (constant for testing)
pub const SIMULATOR_MEASUREMENT: [u8; 32] = [
    0x50, 0x4f, 0x45, 0x54, // "POET"
    0x5f, 0x53, 0x49, 0x4d, // "_SIM"
    0x55, 0x4c, 0x41, 0x54, // "ULAT"
    0x4f, 0x52, 0x5f, 0x56, // "OR_V"
    0x31, 0x00, 0x00, 0x00, // "1\0"
    0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

/// Simulator quote basename
pub const SIMULATOR_BASENAME: [u8; 32] = [
    0x50, 0x4f, 0x45, 0x54, // "POET"
    0x5f, 0x42, 0x41, 0x53, // "_BAS"
    0x45, 0x4e, 0x41, 0x4d, // "ENAM"
    0x45, 0x00, 0x00, 0x00, // "E\0"
    0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

#[derive(Serialize, Deserialize)]
struct SealedSignupData {
    poet_public_key: String,
    poet_private_key: String,
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Simulated PoET enclave
pub struct MockEnclave {
    config: EnclaveConfig,
    /// Derives timer durations; never leaves the enclave
    seal_key: Ed25519Signer,
    /// Stand-in for the attestation service signing key
    report_key: Ed25519Signer,
    /// Live timer signature per PoET public key
    active_timers: RwLock<HashMap<String, String>>,
    released_keys: RwLock<HashSet<String>>,
    available: AtomicBool,
    /// Artificial delay added to every request
    latency: Duration,
    timers_created: AtomicU64,
}

impl MockEnclave {
    /// Initialize a simulated enclave. Fails if the configuration cannot
    /// identify a validator.
    pub fn initialize(config: EnclaveConfig) -> EnclaveResult<Self> {
        if config.validator_id.is_empty() {
            return Err(EnclaveError::Unavailable(
                "enclave requires a validator id".to_string(),
            ));
        }

        let enclave = Self {
            config,
            seal_key: Ed25519Signer::generate(),
            report_key: Ed25519Signer::generate(),
            active_timers: RwLock::new(HashMap::new()),
            released_keys: RwLock::new(HashSet::new()),
            available: AtomicBool::new(true),
            latency: Duration::ZERO,
            timers_created: AtomicU64::new(0),
        };

        info!(
            enclave_id = %enclave.config.enclave_id,
            validator_id = %enclave.config.validator_id,
            "Simulator enclave initialized"
        );
        Ok(enclave)
    }

    /// Create a simulated enclave with default configuration
    pub fn default_with_validator_id(validator_id: String) -> EnclaveResult<Self> {
        Self::initialize(EnclaveConfig::default().with_validator_id(validator_id))
    }

    pub fn config(&self) -> &EnclaveConfig {
        &self.config
    }

    /// Public key the simulated attestation service signs reports with
    pub fn report_public_key(&self) -> String {
        self.report_key.public_key()
    }

    /// A verifier that accepts signups produced by this enclave
    pub fn allowlist_verifier(&self) -> AllowlistVerifier {
        AllowlistVerifier::new()
            .with_measurement(SIMULATOR_MEASUREMENT)
            .with_basename(SIMULATOR_BASENAME)
            .with_report_public_key(self.report_public_key())
    }

    /// Simulate the enclave going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of wait timers created so far
    pub fn timers_created(&self) -> u64 {
        self.timers_created.load(Ordering::Relaxed)
    }

    async fn ensure_available(&self) -> EnclaveResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(EnclaveError::Unavailable(format!(
                "enclave {} is not available",
                self.config.enclave_id
            )));
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(())
    }

    async fn unseal(&self, sealed_signup_data: &str) -> EnclaveResult<(String, Ed25519Signer)> {
        let raw = BASE64
            .decode(sealed_signup_data.as_bytes())
            .map_err(|e| EnclaveError::InvalidSignupData(e.to_string()))?;
        let sealed: SealedSignupData = serde_json::from_slice(&raw)
            .map_err(|e| EnclaveError::InvalidSignupData(e.to_string()))?;
        let poet_key = Ed25519Signer::from_hex(&sealed.poet_private_key)
            .map_err(|e| EnclaveError::InvalidSignupData(e.to_string()))?;

        if poet_key.public_key() != sealed.poet_public_key {
            return Err(EnclaveError::InvalidSignupData(
                "PoET key pair mismatch".to_string(),
            ));
        }
        if self.released_keys.read().await.contains(&sealed.poet_public_key) {
            return Err(EnclaveError::InvalidSignupData(
                "signup data has been released".to_string(),
            ));
        }
        Ok((sealed.poet_public_key, poet_key))
    }

    /// Map the seal-key signature over `previous_certificate_id` into (0, 1]
    fn tag(&self, previous_certificate_id: &str) -> f64 {
        let signature = self.seal_key.sign_bytes(previous_certificate_id.as_bytes());
        let mut low = [0u8; 8];
        low.copy_from_slice(&signature[56..]);
        let tagd = u64::from_le_bytes(low) as f64 / u64::MAX as f64;
        tagd.max(f64::MIN_POSITIVE)
    }
}

#[async_trait]
impl PoetEnclave for MockEnclave {
    async fn create_signup_info(
        &self,
        originator_public_key_hash: &str,
        nonce: &str,
    ) -> EnclaveResult<EnclaveSignupInfo> {
        self.ensure_available().await?;

        let poet_key = Ed25519Signer::generate();
        let poet_public_key = poet_key.public_key();
        let sealed = serde_json::to_vec(&SealedSignupData {
            poet_public_key: poet_public_key.clone(),
            poet_private_key: poet_key.secret_hex(),
        })
        .map_err(|e| EnclaveError::Serialization(e.to_string()))?;

        let quote = SgxQuote {
            version: 2,
            basename: SgxBasename {
                name: SIMULATOR_BASENAME,
            },
            report_body: SgxReportBody {
                mr_enclave: SgxMeasurement {
                    m: SIMULATOR_MEASUREMENT,
                },
                report_data: signup_report_data(originator_public_key_hash, &poet_public_key),
                ..Default::default()
            },
            ..Default::default()
        };

        let anti_sybil_id = anti_sybil_id(&self.config.validator_id);
        let pse_manifest = sha256_hex(format!("pse_manifest:{}", anti_sybil_id)).into_bytes();
        let report = VerificationReport {
            id: uuid::Uuid::new_v4().to_string(),
            epid_pseudonym: anti_sybil_id.clone(),
            isv_enclave_quote_status: STATUS_OK.to_string(),
            isv_enclave_quote_body: BASE64.encode(quote.serialize_to_bytes()),
            pse_manifest_status: STATUS_OK.to_string(),
            pse_manifest_hash: sha256_hex(&pse_manifest),
            nonce: nonce.to_string(),
            timestamp: chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string(),
        };
        let verification_report = serde_json::to_string(&report)
            .map_err(|e| EnclaveError::Serialization(e.to_string()))?;

        let proof = SignupProof {
            evidence_payload: EvidencePayload {
                pse_manifest: BASE64.encode(&pse_manifest),
            },
            signature: self.report_key.sign(verification_report.as_bytes()),
            verification_report,
        };

        debug!(poet_public_key = %short_id(&poet_public_key), "Created signup info");

        Ok(EnclaveSignupInfo {
            poet_public_key,
            proof_data: proof.to_proof_data()?,
            anti_sybil_id,
            nonce: nonce.to_string(),
            sealed_signup_data: BASE64.encode(sealed),
        })
    }

    async fn unseal_signup_data(&self, sealed_signup_data: &str) -> EnclaveResult<String> {
        self.ensure_available().await?;
        let (poet_public_key, _) = self.unseal(sealed_signup_data).await?;
        Ok(poet_public_key)
    }

    async fn release_signup_data(&self, sealed_signup_data: &str) -> EnclaveResult<()> {
        self.ensure_available().await?;
        let (poet_public_key, _) = self.unseal(sealed_signup_data).await?;
        self.active_timers.write().await.remove(&poet_public_key);
        self.released_keys.write().await.insert(poet_public_key);
        Ok(())
    }

    async fn create_wait_timer(
        &self,
        sealed_signup_data: &str,
        validator_address: &str,
        previous_certificate_id: &str,
        local_mean: f64,
        minimum_wait_time: f64,
    ) -> EnclaveResult<EnclaveWaitTimer> {
        self.ensure_available().await?;
        if !local_mean.is_finite() || local_mean < 0.0 {
            return Err(EnclaveError::Refused(format!("invalid local mean {}", local_mean)));
        }
        let (poet_public_key, poet_key) = self.unseal(sealed_signup_data).await?;

        let duration = minimum_wait_time - local_mean * self.tag(previous_certificate_id).ln();
        let mut timer = EnclaveWaitTimer {
            validator_address: validator_address.to_string(),
            duration,
            previous_certificate_id: previous_certificate_id.to_string(),
            local_mean,
            request_time: now(),
            signature: String::new(),
        };
        timer.signature = poet_key.sign(&timer.signing_bytes()?);

        self.active_timers
            .write()
            .await
            .insert(poet_public_key, timer.signature.clone());
        self.timers_created.fetch_add(1, Ordering::Relaxed);

        if self.config.enable_debug_logging {
            debug!(duration, local_mean, previous_certificate_id, "Created wait timer");
        }
        Ok(timer)
    }

    async fn create_wait_certificate(
        &self,
        sealed_signup_data: &str,
        wait_timer: &EnclaveWaitTimer,
        block_hash: &str,
    ) -> EnclaveResult<EnclaveWaitCertificate> {
        self.ensure_available().await?;
        let (poet_public_key, poet_key) = self.unseal(sealed_signup_data).await?;

        if !verify_signature(&poet_public_key, &wait_timer.signing_bytes()?, &wait_timer.signature) {
            return Err(EnclaveError::Refused(
                "validator is not using the current wait timer".to_string(),
            ));
        }

        // Check and consume under one lock so a timer yields one certificate.
        let mut active_timers = self.active_timers.write().await;
        if active_timers.get(&poet_public_key) != Some(&wait_timer.signature) {
            return Err(EnclaveError::Refused(
                "wait timer is not the live timer for this key".to_string(),
            ));
        }

        // Timers building on no certificate (genesis) are exempt from the
        // expiry and timeout checks.
        let is_not_genesis = wait_timer.previous_certificate_id != NULL_BLOCK_IDENTIFIER;
        let now = now();
        // Expiry counts whole seconds, as validators do
        let expire_time = wait_timer.request_time + wait_timer.duration.ceil();
        if is_not_genesis && now < expire_time {
            return Err(EnclaveError::Refused(
                "timer has not expired".to_string(),
            ));
        }
        if is_not_genesis && expire_time + self.config.timer_timeout.as_secs_f64() < now {
            return Err(EnclaveError::Refused("timer has timed out".to_string()));
        }

        let nonce = sha256_hex(format!(
            "{}{}",
            wait_timer.signature,
            chrono::Utc::now().to_rfc3339()
        ));
        let mut certificate = EnclaveWaitCertificate {
            duration: wait_timer.duration,
            previous_certificate_id: wait_timer.previous_certificate_id.clone(),
            local_mean: wait_timer.local_mean,
            request_time: wait_timer.request_time,
            validator_address: wait_timer.validator_address.clone(),
            nonce,
            block_hash: block_hash.to_string(),
            signature: String::new(),
        };
        certificate.signature = poet_key.sign(&certificate.signing_bytes()?);

        active_timers.remove(&poet_public_key);
        Ok(certificate)
    }

    fn verify_wait_certificate(
        &self,
        certificate: &EnclaveWaitCertificate,
        poet_public_key: &str,
    ) -> EnclaveResult<()> {
        if verify_signature(poet_public_key, &certificate.signing_bytes()?, &certificate.signature) {
            Ok(())
        } else {
            Err(EnclaveError::InvalidSignature)
        }
    }

    fn info(&self) -> EnclaveInfo {
        EnclaveInfo {
            enclave_id: self.config.enclave_id.clone(),
            platform: EnclavePlatform::Simulator,
            measurement: SIMULATOR_MEASUREMENT,
            basename: SIMULATOR_BASENAME,
            version: env!("CARGO_PKG_VERSION").to_string(),
            is_simulated: true,
        }
    }

    fn measurement(&self) -> [u8; 32] {
        SIMULATOR_MEASUREMENT
    }

    fn basename(&self) -> [u8; 32] {
        SIMULATOR_BASENAME
    }

    fn is_simulated(&self) -> bool {
        true
    }

    async fn shutdown(&self) -> EnclaveResult<()> {
        self.set_available(false);
        self.active_timers.write().await.clear();
        info!(enclave_id = %self.config.enclave_id, "Simulator enclave shut down");
        Ok(())
    }
}

/// Builder for MockEnclave
pub struct MockEnclaveBuilder {
    validator_id: String,
    timer_timeout: Duration,
    request_timeout: Duration,
    latency: Duration,
    debug_logging: bool,
}

impl MockEnclaveBuilder {
    pub fn new(validator_id: impl Into<String>) -> Self {
        Self {
            validator_id: validator_id.into(),
            timer_timeout: crate::traits::TIMER_TIMEOUT_PERIOD,
            request_timeout: crate::traits::DEFAULT_REQUEST_TIMEOUT,
            latency: Duration::ZERO,
            debug_logging: false,
        }
    }

    pub fn timer_timeout(mut self, timeout: Duration) -> Self {
        self.timer_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Delay every enclave request by `latency`
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn debug_logging(mut self, enabled: bool) -> Self {
        self.debug_logging = enabled;
        self
    }

    pub fn build(self) -> EnclaveResult<MockEnclave> {
        let config = EnclaveConfig {
            enable_debug_logging: self.debug_logging,
            ..EnclaveConfig::new(self.validator_id)
        }
        .with_timer_timeout(self.timer_timeout)
        .with_request_timeout(self.request_timeout);

        let mut enclave = MockEnclave::initialize(config)?;
        enclave.latency = self.latency;
        Ok(enclave)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::AttestationVerifier;

    const ORIGINATOR_HASH: &str = "0123456789abcdef";

    async fn signed_up(enclave: &MockEnclave) -> EnclaveSignupInfo {
        enclave
            .create_signup_info(ORIGINATOR_HASH, NULL_BLOCK_IDENTIFIER)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_signup_info_verifies() {
        let enclave = MockEnclave::default_with_validator_id("validator-1".into()).unwrap();
        let signup = signed_up(&enclave).await;

        let verified = enclave
            .allowlist_verifier()
            .verify_signup(&signup.to_signup_info(), ORIGINATOR_HASH)
            .unwrap();
        assert_eq!(verified.measurement, SIMULATOR_MEASUREMENT);
        assert_eq!(verified.anti_sybil_id, anti_sybil_id("validator-1"));

        // Bound to the originator
        assert!(enclave
            .allowlist_verifier()
            .verify_signup(&signup.to_signup_info(), "someone-else")
            .is_err());

        assert_eq!(
            enclave.unseal_signup_data(&signup.sealed_signup_data).await.unwrap(),
            signup.poet_public_key
        );
    }

    #[tokio::test]
    async fn test_wait_timer_duration_is_deterministic_per_certificate() {
        let enclave = MockEnclave::default_with_validator_id("validator-1".into()).unwrap();
        let signup = signed_up(&enclave).await;

        let first = enclave
            .create_wait_timer(&signup.sealed_signup_data, "addr", "prev-cert-0001", 20.0, 1.0)
            .await
            .unwrap();
        let second = enclave
            .create_wait_timer(&signup.sealed_signup_data, "addr", "prev-cert-0001", 20.0, 1.0)
            .await
            .unwrap();

        assert_eq!(first.duration, second.duration);
        assert!(first.duration >= 1.0);
        assert_eq!(enclave.timers_created(), 2);
    }

    #[tokio::test]
    async fn test_certificate_refused_before_expiry() {
        let enclave = MockEnclave::default_with_validator_id("validator-1".into()).unwrap();
        let signup = signed_up(&enclave).await;
        let timer = enclave
            .create_wait_timer(&signup.sealed_signup_data, "addr", "prev-cert-0001", 20.0, 1.0)
            .await
            .unwrap();

        let result = enclave
            .create_wait_certificate(&signup.sealed_signup_data, &timer, "hash")
            .await;
        assert!(matches!(result, Err(EnclaveError::Refused(_))));
    }

    #[tokio::test]
    async fn test_genesis_certificate_and_single_use() {
        let enclave = MockEnclave::default_with_validator_id("validator-1".into()).unwrap();
        let signup = signed_up(&enclave).await;
        let timer = enclave
            .create_wait_timer(&signup.sealed_signup_data, "addr", NULL_BLOCK_IDENTIFIER, 20.0, 1.0)
            .await
            .unwrap();

        let certificate = enclave
            .create_wait_certificate(&signup.sealed_signup_data, &timer, "hash")
            .await
            .unwrap();
        assert_eq!(certificate.duration, timer.duration);
        assert!(enclave
            .verify_wait_certificate(&certificate, &signup.poet_public_key)
            .is_ok());

        let again = enclave
            .create_wait_certificate(&signup.sealed_signup_data, &timer, "hash")
            .await;
        assert!(matches!(again, Err(EnclaveError::Refused(_))));
    }

    #[tokio::test]
    async fn test_certificate_after_expiry_and_timeout() {
        let enclave = MockEnclaveBuilder::new("validator-1")
            .timer_timeout(Duration::ZERO)
            .build()
            .unwrap();
        let signup = signed_up(&enclave).await;

        let timer = enclave
            .create_wait_timer(&signup.sealed_signup_data, "addr", "prev-cert-0002", 0.0, 0.05)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let result = enclave
            .create_wait_certificate(&signup.sealed_signup_data, &timer, "hash")
            .await;
        assert!(matches!(result, Err(EnclaveError::Refused(_))));

        let patient = MockEnclave::default_with_validator_id("validator-2".into()).unwrap();
        let signup = signed_up(&patient).await;
        let timer = patient
            .create_wait_timer(&signup.sealed_signup_data, "addr", "prev-cert-0001", 0.0, 0.05)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(patient
            .create_wait_certificate(&signup.sealed_signup_data, &timer, "hash")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_certificate_waits_for_whole_seconds() {
        let enclave = MockEnclave::default_with_validator_id("validator-1".into()).unwrap();
        let signup = signed_up(&enclave).await;

        let timer = enclave
            .create_wait_timer(&signup.sealed_signup_data, "addr", "prev-cert-0003", 0.0, 0.05)
            .await
            .unwrap();
        assert_eq!(timer.duration, 0.05);

        // The raw duration has passed but the first whole second has not
        tokio::time::sleep(Duration::from_millis(200)).await;
        let early = enclave
            .create_wait_certificate(&signup.sealed_signup_data, &timer, "hash")
            .await;
        assert!(matches!(early, Err(EnclaveError::Refused(_))));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(enclave
            .create_wait_certificate(&signup.sealed_signup_data, &timer, "hash")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_verify_rejects_tampered_certificate() {
        let enclave = MockEnclave::default_with_validator_id("validator-1".into()).unwrap();
        let signup = signed_up(&enclave).await;
        let timer = enclave
            .create_wait_timer(&signup.sealed_signup_data, "addr", NULL_BLOCK_IDENTIFIER, 5.0, 1.0)
            .await
            .unwrap();
        let mut certificate = enclave
            .create_wait_certificate(&signup.sealed_signup_data, &timer, "hash")
            .await
            .unwrap();

        certificate.duration += 1.0;
        assert!(matches!(
            enclave.verify_wait_certificate(&certificate, &signup.poet_public_key),
            Err(EnclaveError::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn test_released_signup_data_is_unusable() {
        let enclave = MockEnclave::default_with_validator_id("validator-1".into()).unwrap();
        let signup = signed_up(&enclave).await;
        enclave
            .release_signup_data(&signup.sealed_signup_data)
            .await
            .unwrap();

        let result = enclave
            .create_wait_timer(&signup.sealed_signup_data, "addr", NULL_BLOCK_IDENTIFIER, 5.0, 1.0)
            .await;
        assert!(matches!(result, Err(EnclaveError::InvalidSignupData(_))));
    }

    #[tokio::test]
    async fn test_unavailable_enclave() {
        let enclave = MockEnclave::default_with_validator_id("validator-1".into()).unwrap();
        enclave.set_available(false);

        let result = enclave.create_signup_info(ORIGINATOR_HASH, "nonce").await;
        assert!(matches!(result, Err(EnclaveError::Unavailable(_))));

        assert!(MockEnclave::default_with_validator_id(String::new()).is_err());
    }
}
