//! Signup attestation types and verification.
//!
//! A validator proves that its PoET key was generated inside an allowed
//! enclave by publishing a verification report (issued by the attestation
//! service) that wraps an SGX quote whose report data commits to the key.
//!
//! ## Verification Flow
//!
//! ```text
//! Registry receives SignupInfo.proof_data
//!        │
//!        ▼
//! ┌───────────────────────────────────────────────────────┐
//! │  1. Verify report signature (attestation service key) │
//! │  2. Check report id, pseudonym == anti_sybil_id       │
//! │  3. Check quote and PSE manifest status               │
//! │  4. Parse quote, check MRENCLAVE and basename         │
//! │  5. Check report data commits to originator + key     │
//! │  6. Check nonce matches the signup nonce              │
//! └───────────────────────────────────────────────────────┘
//!        │
//!        ▼
//!   Accept or reject
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use poet_types::{sha256_hex, verify_signature, SignupInfo};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;

use crate::sgx::{SgxQuote, SgxReportData, SgxStructError};

/// Status value reported for a healthy quote / PSE manifest
pub const STATUS_OK: &str = "OK";

/// Attestation errors
#[derive(Debug, Error)]
pub enum AttestationError {
    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("Missing field in verification report: {0}")]
    MissingField(&'static str),

    #[error("Anti-Sybil id does not match report pseudonym")]
    AntiSybilMismatch,

    #[error("Unexpected quote status: {0}")]
    QuoteStatus(String),

    #[error("Unexpected PSE manifest status: {0}")]
    PseManifestStatus(String),

    #[error("PSE manifest hash mismatch")]
    PseManifestHashMismatch,

    #[error("Enclave measurement not in allowlist: {measurement}")]
    UnknownMeasurement { measurement: String },

    #[error("Basename not in allowlist: {basename}")]
    UnknownBasename { basename: String },

    #[error("Report data mismatch: expected {expected}, got {actual}")]
    ReportDataMismatch { expected: String, actual: String },

    #[error("Nonce mismatch: expected {expected}, got {actual}")]
    NonceMismatch { expected: String, actual: String },

    #[error("Quote parsing failed: {0}")]
    Quote(#[from] SgxStructError),

    #[error("Document parsing failed: {0}")]
    ParseError(String),
}

pub type AttestationResult<T> = Result<T, AttestationError>;

/// Attestation service verification report (the IAS JSON schema)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub epid_pseudonym: String,
    #[serde(default)]
    pub isv_enclave_quote_status: String,
    /// Base64 encoded `sgx_quote_t`
    #[serde(default)]
    pub isv_enclave_quote_body: String,
    #[serde(default)]
    pub pse_manifest_status: String,
    #[serde(default)]
    pub pse_manifest_hash: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub timestamp: String,
}

/// Extra evidence supplied next to the report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidencePayload {
    /// Base64 encoded PSE manifest
    pub pse_manifest: String,
}

/// Contents of `SignupInfo::proof_data`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignupProof {
    pub evidence_payload: EvidencePayload,
    /// The report as the exact JSON text that was signed
    pub verification_report: String,
    /// Hex signature over `verification_report`
    pub signature: String,
}

impl SignupProof {
    pub fn from_proof_data(proof_data: &str) -> AttestationResult<Self> {
        serde_json::from_str(proof_data).map_err(|e| AttestationError::ParseError(e.to_string()))
    }

    pub fn to_proof_data(&self) -> AttestationResult<String> {
        serde_json::to_string(self).map_err(|e| AttestationError::ParseError(e.to_string()))
    }

    pub fn report(&self) -> AttestationResult<VerificationReport> {
        serde_json::from_str(&self.verification_report)
            .map_err(|e| AttestationError::ParseError(e.to_string()))
    }
}

/// Report data a signup quote must carry:
/// `SHA256(UPPER(originator_public_key_hash) || UPPER(poet_public_key))`,
/// zero padded to 64 bytes.
pub fn signup_report_data(originator_public_key_hash: &str, poet_public_key: &str) -> SgxReportData {
    let mut hasher = Sha256::new();
    hasher.update(originator_public_key_hash.to_uppercase().as_bytes());
    hasher.update(poet_public_key.to_uppercase().as_bytes());
    let digest = hasher.finalize();

    let mut report_data = SgxReportData::default();
    report_data.d[..32].copy_from_slice(&digest);
    report_data
}

/// Anti-Sybil id for a validator identity
pub fn anti_sybil_id(validator_id: &str) -> String {
    sha256_hex(validator_id.as_bytes())
}

/// Result of successful signup verification
#[derive(Debug, Clone)]
pub struct VerifiedSignup {
    pub measurement: [u8; 32],
    pub basename: [u8; 32],
    pub anti_sybil_id: String,
    pub report_id: String,
}

/// Signup attestation verifier trait
pub trait AttestationVerifier: Send + Sync {
    /// Verify the attestation evidence in `signup_info`
    fn verify_signup(
        &self,
        signup_info: &SignupInfo,
        originator_public_key_hash: &str,
    ) -> AttestationResult<VerifiedSignup>;

    /// Check if a measurement is in the allowlist
    fn is_measurement_allowed(&self, measurement: &[u8; 32]) -> bool;

    /// Check if a basename is in the allowlist
    fn is_basename_allowed(&self, basename: &[u8; 32]) -> bool;
}

/// Allowlist-based verifier
#[derive(Debug, Clone, Default)]
pub struct AllowlistVerifier {
    allowed_measurements: HashSet<[u8; 32]>,
    allowed_basenames: HashSet<[u8; 32]>,
    /// Hex public keys trusted to sign verification reports
    report_public_keys: HashSet<String>,
}

impl AllowlistVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_measurement(&mut self, measurement: [u8; 32]) {
        self.allowed_measurements.insert(measurement);
    }

    pub fn add_basename(&mut self, basename: [u8; 32]) {
        self.allowed_basenames.insert(basename);
    }

    pub fn add_report_public_key(&mut self, public_key: impl Into<String>) {
        self.report_public_keys.insert(public_key.into());
    }

    pub fn with_measurement(mut self, measurement: [u8; 32]) -> Self {
        self.add_measurement(measurement);
        self
    }

    pub fn with_basename(mut self, basename: [u8; 32]) -> Self {
        self.add_basename(basename);
        self
    }

    pub fn with_report_public_key(mut self, public_key: impl Into<String>) -> Self {
        self.add_report_public_key(public_key);
        self
    }

    fn check_report_signature(&self, proof: &SignupProof) -> AttestationResult<()> {
        let trusted = self.report_public_keys.iter().any(|key| {
            verify_signature(key, proof.verification_report.as_bytes(), &proof.signature)
        });
        if trusted {
            Ok(())
        } else {
            Err(AttestationError::InvalidSignature)
        }
    }
}

impl AttestationVerifier for AllowlistVerifier {
    fn verify_signup(
        &self,
        signup_info: &SignupInfo,
        originator_public_key_hash: &str,
    ) -> AttestationResult<VerifiedSignup> {
        let proof = SignupProof::from_proof_data(&signup_info.proof_data)?;
        self.check_report_signature(&proof)?;

        let report = proof.report()?;
        if report.id.is_empty() {
            return Err(AttestationError::MissingField("id"));
        }
        if report.epid_pseudonym.is_empty() {
            return Err(AttestationError::MissingField("epidPseudonym"));
        }
        if report.epid_pseudonym != signup_info.anti_sybil_id {
            return Err(AttestationError::AntiSybilMismatch);
        }
        if report.isv_enclave_quote_status != STATUS_OK {
            return Err(AttestationError::QuoteStatus(report.isv_enclave_quote_status));
        }
        if report.pse_manifest_status != STATUS_OK {
            return Err(AttestationError::PseManifestStatus(report.pse_manifest_status));
        }

        let manifest = BASE64
            .decode(proof.evidence_payload.pse_manifest.as_bytes())
            .map_err(|e| AttestationError::ParseError(format!("pse manifest: {}", e)))?;
        if !report.pse_manifest_hash.eq_ignore_ascii_case(&sha256_hex(&manifest)) {
            return Err(AttestationError::PseManifestHashMismatch);
        }

        if report.isv_enclave_quote_body.is_empty() {
            return Err(AttestationError::MissingField("isvEnclaveQuoteBody"));
        }
        let quote_bytes = BASE64
            .decode(report.isv_enclave_quote_body.as_bytes())
            .map_err(|e| AttestationError::ParseError(format!("quote body: {}", e)))?;
        let quote = SgxQuote::parse_from_bytes(&quote_bytes)?;

        let measurement = quote.report_body.mr_enclave.m;
        if !self.is_measurement_allowed(&measurement) {
            return Err(AttestationError::UnknownMeasurement {
                measurement: hex::encode(measurement),
            });
        }
        let basename = quote.basename.name;
        if !self.is_basename_allowed(&basename) {
            return Err(AttestationError::UnknownBasename {
                basename: hex::encode(basename),
            });
        }

        let expected = signup_report_data(originator_public_key_hash, &signup_info.poet_public_key);
        if quote.report_body.report_data != expected {
            return Err(AttestationError::ReportDataMismatch {
                expected: hex::encode(expected.d),
                actual: hex::encode(quote.report_body.report_data.d),
            });
        }

        if report.nonce != signup_info.nonce {
            return Err(AttestationError::NonceMismatch {
                expected: signup_info.nonce.clone(),
                actual: report.nonce,
            });
        }

        Ok(VerifiedSignup {
            measurement,
            basename,
            anti_sybil_id: report.epid_pseudonym,
            report_id: report.id,
        })
    }

    fn is_measurement_allowed(&self, measurement: &[u8; 32]) -> bool {
        self.allowed_measurements.contains(measurement)
    }

    fn is_basename_allowed(&self, basename: &[u8; 32]) -> bool {
        self.allowed_basenames.contains(basename)
    }
}
