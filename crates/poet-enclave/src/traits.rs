//! PoetEnclave trait and related types.
//!
//! This module defines the contract the consensus core requires of an
//! enclave, whether simulated or hardware backed.

use async_trait::async_trait;
use poet_types::ConsensusError;
use std::time::Duration;
use thiserror::Error;

use crate::attestation::AttestationError;
use crate::records::{EnclaveSignupInfo, EnclaveWaitCertificate, EnclaveWaitTimer};

/// Certificates cannot be created for a timer this long after it expired
pub const TIMER_TIMEOUT_PERIOD: Duration = Duration::from_secs(30);

/// Callers give up on an enclave request after this long
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Enclave errors
#[derive(Debug, Error)]
pub enum EnclaveError {
    #[error("Enclave unavailable: {0}")]
    Unavailable(String),

    #[error("Enclave request timed out after {0:?}")]
    Timeout(Duration),

    /// The enclave declined the request (e.g. the timer was already used)
    #[error("Request refused: {0}")]
    Refused(String),

    #[error("Invalid signup data: {0}")]
    InvalidSignupData(String),

    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Attestation error: {0}")]
    Attestation(#[from] AttestationError),
}

pub type EnclaveResult<T> = Result<T, EnclaveError>;

impl From<EnclaveError> for ConsensusError {
    fn from(err: EnclaveError) -> Self {
        match err {
            EnclaveError::Unavailable(_) | EnclaveError::Timeout(_) => {
                ConsensusError::EnclaveUnavailable(err.to_string())
            }
            EnclaveError::Serialization(msg) => ConsensusError::Serialization(msg),
            other => ConsensusError::InvalidCertificate(other.to_string()),
        }
    }
}

/// Configuration for enclave initialization
#[derive(Debug, Clone)]
pub struct EnclaveConfig {
    /// Unique identifier for this enclave instance
    pub enclave_id: String,
    /// Validator that owns this enclave; seeds the anti-Sybil id
    pub validator_id: String,
    /// Grace period after expiry during which a certificate may be created
    pub timer_timeout: Duration,
    /// Upper bound on a single enclave request, enforced by the wait engine
    /// wrapping the enclave
    pub request_timeout: Duration,
    /// Whether to enable detailed logging (may leak info in production)
    pub enable_debug_logging: bool,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            enclave_id: uuid::Uuid::new_v4().to_string(),
            validator_id: "default-validator".to_string(),
            timer_timeout: TIMER_TIMEOUT_PERIOD,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            enable_debug_logging: false,
        }
    }
}

impl EnclaveConfig {
    pub fn new(validator_id: String) -> Self {
        Self {
            validator_id,
            ..Default::default()
        }
    }

    pub fn with_validator_id(mut self, validator_id: String) -> Self {
        self.validator_id = validator_id;
        self
    }

    pub fn with_timer_timeout(mut self, timer_timeout: Duration) -> Self {
        self.timer_timeout = timer_timeout;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

/// Information about the enclave
#[derive(Debug, Clone)]
pub struct EnclaveInfo {
    /// Unique enclave instance ID
    pub enclave_id: String,
    /// TEE platform type
    pub platform: EnclavePlatform,
    /// Enclave measurement (MRENCLAVE)
    pub measurement: [u8; 32],
    /// Basename used in quotes
    pub basename: [u8; 32],
    /// Software version running inside enclave
    pub version: String,
    /// Whether this is a simulated enclave
    pub is_simulated: bool,
}

/// Supported TEE platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnclavePlatform {
    /// Simulated enclave (no real TEE)
    Simulator,
    /// Intel SGX
    IntelSgx,
}

impl std::fmt::Display for EnclavePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnclavePlatform::Simulator => write!(f, "Simulator"),
            EnclavePlatform::IntelSgx => write!(f, "Intel-SGX"),
        }
    }
}

/// Core trait for PoET enclave implementations.
///
/// Sealed signup data is opaque to callers: it is produced by
/// [`create_signup_info`](PoetEnclave::create_signup_info) and handed back on
/// every timer and certificate request.
#[async_trait]
pub trait PoetEnclave: Send + Sync {
    /// Create a new PoET key pair and attestation evidence binding it to
    /// `originator_public_key_hash` and `nonce`.
    async fn create_signup_info(
        &self,
        originator_public_key_hash: &str,
        nonce: &str,
    ) -> EnclaveResult<EnclaveSignupInfo>;

    /// Unseal previously created signup data, returning its PoET public key.
    async fn unseal_signup_data(&self, sealed_signup_data: &str) -> EnclaveResult<String>;

    /// Permanently retire sealed signup data.
    async fn release_signup_data(&self, sealed_signup_data: &str) -> EnclaveResult<()>;

    /// Draw a random duration with mean `local_mean`, floored at
    /// `minimum_wait_time`, and bind it to `previous_certificate_id`.
    ///
    /// The new timer replaces any earlier live timer of the same key.
    async fn create_wait_timer(
        &self,
        sealed_signup_data: &str,
        validator_address: &str,
        previous_certificate_id: &str,
        local_mean: f64,
        minimum_wait_time: f64,
    ) -> EnclaveResult<EnclaveWaitTimer>;

    /// Convert an expired timer into a certificate for `block_hash`.
    ///
    /// Fails with [`EnclaveError::Refused`] if the timer is not the key's
    /// live timer, has not expired, or has timed out.
    async fn create_wait_certificate(
        &self,
        sealed_signup_data: &str,
        wait_timer: &EnclaveWaitTimer,
        block_hash: &str,
    ) -> EnclaveResult<EnclaveWaitCertificate>;

    /// Check a certificate signature against a PoET public key.
    fn verify_wait_certificate(
        &self,
        certificate: &EnclaveWaitCertificate,
        poet_public_key: &str,
    ) -> EnclaveResult<()>;

    /// Get information about this enclave.
    fn info(&self) -> EnclaveInfo;

    /// Get the enclave's measurement (used for registry allowlists).
    fn measurement(&self) -> [u8; 32];

    /// Get the basename embedded in this enclave's quotes.
    fn basename(&self) -> [u8; 32];

    /// Check if this is a simulated enclave.
    fn is_simulated(&self) -> bool;

    /// Release enclave resources. Later requests fail as unavailable.
    async fn shutdown(&self) -> EnclaveResult<()>;
}
