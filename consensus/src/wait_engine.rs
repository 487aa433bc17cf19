// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Wait Engine
//!
//! Front end to the enclave for the election protocol. Every request is
//! bounded by a timeout so an unresponsive enclave makes the node abstain
//! for the round rather than stall the engine loop.

use poet_enclave::{
    EnclaveError, EnclaveSignupInfo, PoetEnclave, DEFAULT_REQUEST_TIMEOUT,
};
use poet_types::{ConsensusError, ConsensusResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::settings::PoetSettings;
use crate::wait_certificate::WaitCertificate;
use crate::wait_timer::WaitTimer;

#[derive(Clone)]
pub struct WaitEngine {
    enclave: Arc<dyn PoetEnclave>,
    request_timeout: Duration,
}

impl WaitEngine {
    pub fn new(enclave: Arc<dyn PoetEnclave>) -> Self {
        Self::with_request_timeout(enclave, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_request_timeout(enclave: Arc<dyn PoetEnclave>, request_timeout: Duration) -> Self {
        Self {
            enclave,
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn enclave(&self) -> &dyn PoetEnclave {
        self.enclave.as_ref()
    }

    async fn bounded<T, F>(&self, request: F) -> Result<T, EnclaveError>
    where
        F: Future<Output = Result<T, EnclaveError>>,
    {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?self.request_timeout, "Enclave request timed out");
                Err(EnclaveError::Timeout(self.request_timeout))
            }
        }
    }

    pub async fn create_signup_info(
        &self,
        originator_public_key_hash: &str,
        nonce: &str,
    ) -> ConsensusResult<EnclaveSignupInfo> {
        Ok(self
            .bounded(self.enclave.create_signup_info(originator_public_key_hash, nonce))
            .await?)
    }

    /// Returns the PoET public key sealed in `sealed_signup_data`
    pub async fn unseal_signup_data(&self, sealed_signup_data: &str) -> ConsensusResult<String> {
        Ok(self
            .bounded(self.enclave.unseal_signup_data(sealed_signup_data))
            .await?)
    }

    pub async fn release_signup_data(&self, sealed_signup_data: &str) -> ConsensusResult<()> {
        Ok(self
            .bounded(self.enclave.release_signup_data(sealed_signup_data))
            .await?)
    }

    /// Draw a new wait timer; replaces the validator's previous live timer.
    ///
    /// Fails with `EnclaveUnavailable` if the enclave cannot be reached or
    /// does not answer in time.
    pub async fn create_wait_timer(
        &self,
        sealed_signup_data: &str,
        validator_address: &str,
        previous_certificate_id: &str,
        local_mean: f64,
        settings: &PoetSettings,
    ) -> ConsensusResult<WaitTimer> {
        let enclave_timer = self
            .bounded(self.enclave.create_wait_timer(
                sealed_signup_data,
                validator_address,
                previous_certificate_id,
                local_mean,
                settings.minimum_wait_time,
            ))
            .await
            .map_err(|e| match e {
                // A refusal to draw a timer leaves nothing to claim with
                EnclaveError::Refused(reason) => ConsensusError::EnclaveUnavailable(reason),
                other => other.into(),
            })?;
        Ok(WaitTimer::new(enclave_timer))
    }

    /// Convert an expired timer into a certificate.
    ///
    /// `Ok(None)` means the enclave declined: the timer was already used, is
    /// no longer the validator's live timer, or is outside its window.
    pub async fn create_wait_certificate(
        &self,
        sealed_signup_data: &str,
        wait_timer: &WaitTimer,
        block_hash: &str,
    ) -> ConsensusResult<Option<WaitCertificate>> {
        match self
            .bounded(self.enclave.create_wait_certificate(
                sealed_signup_data,
                wait_timer.enclave_timer(),
                block_hash,
            ))
            .await
        {
            Ok(certificate) => WaitCertificate::new(certificate).map(Some),
            Err(EnclaveError::Refused(reason)) => {
                debug!(%reason, "Enclave refused to create wait certificate");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// See [`WaitCertificate::check_valid`]
    pub fn verify_wait_certificate(
        &self,
        certificate: &WaitCertificate,
        previous_certificate_id: &str,
        poet_public_key: &str,
        expected_local_mean: f64,
        settings: &PoetSettings,
    ) -> ConsensusResult<()> {
        certificate.check_valid(
            self.enclave.as_ref(),
            previous_certificate_id,
            poet_public_key,
            expected_local_mean,
            settings,
        )
    }
}
