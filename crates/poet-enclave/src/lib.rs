//! # PoET Enclave
//!
//! Trusted-execution abstraction for Proof of Elapsed Time.
//!
//! The enclave is the only party able to draw wait durations and to turn an
//! expired wait timer into a wait certificate. The consensus core talks to it
//! exclusively through the [`PoetEnclave`] trait.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            PoET Enclave                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                      PoetEnclave Trait                          │   │
//! │  │  • create_signup_info()      - PoET key pair + attestation      │   │
//! │  │  • create_wait_timer()       - Draw a random wait               │   │
//! │  │  • create_wait_certificate() - Prove the wait elapsed           │   │
//! │  │  • verify_wait_certificate() - Check a peer's certificate       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                              │                                         │
//! │                              ▼                                         │
//! │  ┌───────────────────────┐      ┌───────────────────────┐             │
//! │  │     MockEnclave       │      │  AttestationVerifier  │             │
//! │  │   (feature: mock)     │      │                       │             │
//! │  │                       │      │  • Report signature   │             │
//! │  │  • No real TEE        │      │  • Quote status       │             │
//! │  │  • Simulated quotes   │      │  • Measurement and    │             │
//! │  │  • For dev/test       │      │    basename allowlist │             │
//! │  └───────────────────────┘      └───────────────────────┘             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use poet_enclave::{create_default_enclave, PoetEnclave};
//!
//! let enclave = create_default_enclave("validator-1")?;
//! let signup = enclave.create_signup_info(&originator_hash, &nonce).await?;
//!
//! let timer = enclave
//!     .create_wait_timer(&signup.sealed_signup_data, &address, &prev_cert_id, local_mean, 1.0)
//!     .await?;
//! // ... wait until the timer expires ...
//! let certificate = enclave
//!     .create_wait_certificate(&signup.sealed_signup_data, &timer, &block_hash)
//!     .await?;
//! ```

pub mod attestation;
pub mod records;
pub mod sgx;
pub mod traits;

#[cfg(feature = "mock")]
pub mod mock;

// Re-export main types
pub use attestation::{
    anti_sybil_id, signup_report_data, AllowlistVerifier, AttestationError, AttestationResult,
    AttestationVerifier, EvidencePayload, SignupProof, VerificationReport, VerifiedSignup,
};
pub use records::{EnclaveSignupInfo, EnclaveWaitCertificate, EnclaveWaitTimer};
pub use sgx::{SgxQuote, SgxReport, SgxReportBody, SgxReportData, SgxStruct, SgxStructError};
pub use traits::{
    EnclaveConfig, EnclaveError, EnclaveInfo, EnclavePlatform, EnclaveResult, PoetEnclave,
    DEFAULT_REQUEST_TIMEOUT, TIMER_TIMEOUT_PERIOD,
};

#[cfg(feature = "mock")]
pub use mock::{MockEnclave, MockEnclaveBuilder, SIMULATOR_BASENAME, SIMULATOR_MEASUREMENT};

/// Create the default enclave based on enabled features
#[cfg(feature = "mock")]
pub fn create_default_enclave(validator_id: &str) -> EnclaveResult<MockEnclave> {
    MockEnclave::default_with_validator_id(validator_id.to_string())
}
