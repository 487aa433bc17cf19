// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Wait Timer
//!
//! A wait timer is a random duration drawn by the enclave. The validator may
//! claim a block once the timer has expired. Timers live for one claim
//! attempt only and are never persisted.

use poet_enclave::EnclaveWaitTimer;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::settings::PoetSettings;

/// Current wall-clock time in seconds since the Unix epoch
pub fn unix_time_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaitTimer {
    enclave_timer: EnclaveWaitTimer,
}

impl WaitTimer {
    pub fn new(enclave_timer: EnclaveWaitTimer) -> Self {
        Self { enclave_timer }
    }

    pub fn duration(&self) -> f64 {
        self.enclave_timer.duration
    }

    pub fn local_mean(&self) -> f64 {
        self.enclave_timer.local_mean
    }

    pub fn request_time(&self) -> f64 {
        self.enclave_timer.request_time
    }

    pub fn previous_certificate_id(&self) -> &str {
        &self.enclave_timer.previous_certificate_id
    }

    pub fn validator_address(&self) -> &str {
        &self.enclave_timer.validator_address
    }

    /// The signed record as produced by the enclave
    pub fn enclave_timer(&self) -> &EnclaveWaitTimer {
        &self.enclave_timer
    }

    /// Earliest time (seconds since epoch) at which the timer counts as expired
    pub fn expires_at(&self) -> f64 {
        self.request_time() + self.duration().ceil()
    }

    /// Pure function of `now`: once true it stays true for any later `now`
    pub fn is_expired(&self, now: f64) -> bool {
        now >= self.expires_at()
    }

    pub fn population_estimate(&self, settings: &PoetSettings) -> f64 {
        self.local_mean() / settings.target_wait_time
    }
}

impl fmt::Display for WaitTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TIMER, {:.2}, {:.2}, {}",
            self.local_mean(),
            self.duration(),
            self.previous_certificate_id()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poet_enclave::{MockEnclave, PoetEnclave};
    use poet_types::NULL_BLOCK_IDENTIFIER;

    fn timer(duration: f64, request_time: f64) -> WaitTimer {
        WaitTimer::new(EnclaveWaitTimer {
            validator_address: "validator".to_string(),
            duration,
            previous_certificate_id: "0000000000000000".to_string(),
            local_mean: 20.0,
            request_time,
            signature: String::new(),
        })
    }

    #[test]
    fn test_expiry_uses_whole_seconds() {
        let timer = timer(2.3, 100.0);
        assert_eq!(timer.expires_at(), 103.0);
        assert!(!timer.is_expired(102.9));
        assert!(timer.is_expired(103.0));
    }

    #[test]
    fn test_expiry_is_monotonic() {
        let timer = timer(4.7, 1_700_000_000.5);
        let mut expired = false;
        for step in 0..200 {
            let now = 1_700_000_000.0 + step as f64 * 0.05;
            let is_expired = timer.is_expired(now);
            assert!(!expired || is_expired, "expiry went backwards at {}", now);
            // Idempotent
            assert_eq!(is_expired, timer.is_expired(now));
            expired = is_expired;
        }
        assert!(expired);
    }

    #[test]
    fn test_population_estimate_and_display() {
        let timer = timer(5.0, 0.0);
        let settings = PoetSettings::default();
        assert_eq!(timer.population_estimate(&settings), 1.0);
        assert_eq!(timer.to_string(), "TIMER, 20.00, 5.00, 0000000000000000");
    }

    #[tokio::test]
    async fn test_decoded_timer_yields_verifiable_certificate() {
        let enclave = MockEnclave::default_with_validator_id("v1".into()).unwrap();
        let signup = enclave
            .create_signup_info("originator", NULL_BLOCK_IDENTIFIER)
            .await
            .unwrap();
        let issued = enclave
            .create_wait_timer(&signup.sealed_signup_data, "v1", NULL_BLOCK_IDENTIFIER, 20.0, 1.0)
            .await
            .unwrap();

        let decoded = EnclaveWaitTimer::from_bytes(&issued.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, issued);
        let timer = WaitTimer::new(decoded);

        let certificate = enclave
            .create_wait_certificate(&signup.sealed_signup_data, timer.enclave_timer(), "hash")
            .await
            .unwrap();
        assert_eq!(certificate.duration, timer.duration());
        assert_eq!(certificate.local_mean, timer.local_mean());
        assert_eq!(certificate.previous_certificate_id, timer.previous_certificate_id());
        enclave
            .verify_wait_certificate(&certificate, &signup.poet_public_key)
            .unwrap();
    }
}
