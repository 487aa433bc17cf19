// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! PoET Settings
//!
//! On-chain settings that tune PoET. They are read from a [`SettingsView`]
//! (string key/value pairs as stored in chain state). A missing value uses the
//! default; an unparsable or out-of-range value is logged and replaced by the
//! default so a bad setting can never halt block validation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use tracing::warn;

pub const BLOCK_CLAIM_DELAY: &str = "poet.block_claim_delay";
pub const INITIAL_WAIT_TIME: &str = "poet.initial_wait_time";
pub const KEY_BLOCK_CLAIM_LIMIT: &str = "poet.key_block_claim_limit";
pub const MINIMUM_WAIT_TIME: &str = "poet.minimum_wait_time";
pub const POPULATION_ESTIMATE_SAMPLE_SIZE: &str = "poet.population_estimate_sample_size";
pub const SIGNUP_COMMIT_MAXIMUM_DELAY: &str = "poet.signup_commit_maximum_delay";
pub const TARGET_WAIT_TIME: &str = "poet.target_wait_time";
pub const ZTEST_MAXIMUM_WIN_DEVIATION: &str = "poet.ztest_maximum_win_deviation";
pub const ZTEST_MINIMUM_WIN_COUNT: &str = "poet.ztest_minimum_win_count";

/// Read-only access to settings stored in chain state
pub trait SettingsView: Send + Sync {
    fn get_setting(&self, key: &str) -> Option<String>;
}

impl SettingsView for HashMap<String, String> {
    fn get_setting(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl SettingsView for BTreeMap<String, String> {
    fn get_setting(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Resolved PoET settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoetSettings {
    /// Blocks a newly registered validator must wait before claiming
    pub block_claim_delay: u64,
    /// Local mean the bootstrap ramp converges from
    pub initial_wait_time: f64,
    /// Blocks one PoET key may claim before it must be refreshed
    pub key_block_claim_limit: u64,
    /// Floor of every wait duration (seconds)
    pub minimum_wait_time: f64,
    /// Number of recent claims the population estimate is computed over
    pub population_estimate_sample_size: usize,
    /// Blocks allowed between signup creation and its commit
    pub signup_commit_maximum_delay: u64,
    /// Desired average time between blocks (seconds)
    pub target_wait_time: f64,
    /// z-score above which a validator is winning too often
    pub ztest_maximum_win_deviation: f64,
    /// Wins tolerated before the z-test applies
    pub ztest_minimum_win_count: u64,
}

impl Default for PoetSettings {
    fn default() -> Self {
        Self {
            block_claim_delay: 1,
            initial_wait_time: 3000.0,
            key_block_claim_limit: 250,
            minimum_wait_time: 1.0,
            population_estimate_sample_size: 50,
            signup_commit_maximum_delay: 0,
            target_wait_time: 20.0,
            ztest_maximum_win_deviation: 3.075,
            ztest_minimum_win_count: 3,
        }
    }
}

fn read_setting<T>(view: &dyn SettingsView, key: &str, default: T, is_valid: fn(&T) -> bool) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    let Some(raw) = view.get_setting(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if is_valid(&value) => value,
        Ok(value) => {
            warn!(key, %value, %default, "Setting out of range, using default");
            default
        }
        Err(_) => {
            warn!(key, raw = %raw, %default, "Setting is not parsable, using default");
            default
        }
    }
}

fn non_negative(value: &f64) -> bool {
    value.is_finite() && *value >= 0.0
}

fn positive(value: &f64) -> bool {
    value.is_finite() && *value > 0.0
}

impl PoetSettings {
    /// Resolve settings from `view`, falling back to defaults per key
    pub fn from_view(view: &dyn SettingsView) -> Self {
        let defaults = Self::default();
        Self {
            block_claim_delay: read_setting(view, BLOCK_CLAIM_DELAY, defaults.block_claim_delay, |_| true),
            initial_wait_time: read_setting(view, INITIAL_WAIT_TIME, defaults.initial_wait_time, non_negative),
            key_block_claim_limit: read_setting(
                view,
                KEY_BLOCK_CLAIM_LIMIT,
                defaults.key_block_claim_limit,
                |v| *v > 0,
            ),
            minimum_wait_time: read_setting(view, MINIMUM_WAIT_TIME, defaults.minimum_wait_time, positive),
            population_estimate_sample_size: read_setting(
                view,
                POPULATION_ESTIMATE_SAMPLE_SIZE,
                defaults.population_estimate_sample_size,
                |v| *v > 0,
            ),
            signup_commit_maximum_delay: read_setting(
                view,
                SIGNUP_COMMIT_MAXIMUM_DELAY,
                defaults.signup_commit_maximum_delay,
                |_| true,
            ),
            target_wait_time: read_setting(view, TARGET_WAIT_TIME, defaults.target_wait_time, positive),
            ztest_maximum_win_deviation: read_setting(
                view,
                ZTEST_MAXIMUM_WIN_DEVIATION,
                defaults.ztest_maximum_win_deviation,
                positive,
            ),
            ztest_minimum_win_count: read_setting(
                view,
                ZTEST_MINIMUM_WIN_COUNT,
                defaults.ztest_minimum_win_count,
                |_| true,
            ),
        }
    }

    /// The settings as chain-state key/value pairs
    pub fn to_entries(&self) -> BTreeMap<String, String> {
        [
            (BLOCK_CLAIM_DELAY, self.block_claim_delay.to_string()),
            (INITIAL_WAIT_TIME, self.initial_wait_time.to_string()),
            (KEY_BLOCK_CLAIM_LIMIT, self.key_block_claim_limit.to_string()),
            (MINIMUM_WAIT_TIME, self.minimum_wait_time.to_string()),
            (
                POPULATION_ESTIMATE_SAMPLE_SIZE,
                self.population_estimate_sample_size.to_string(),
            ),
            (SIGNUP_COMMIT_MAXIMUM_DELAY, self.signup_commit_maximum_delay.to_string()),
            (TARGET_WAIT_TIME, self.target_wait_time.to_string()),
            (ZTEST_MAXIMUM_WIN_DEVIATION, self.ztest_maximum_win_deviation.to_string()),
            (ZTEST_MINIMUM_WIN_COUNT, self.ztest_minimum_win_count.to_string()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
    }
}
