// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Node configuration.
//!
//! Values are layered: built-in defaults, then the TOML file, then command
//! line flags (each flag also reads a `POET_*` environment variable).

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use poet_consensus::settings::{INITIAL_WAIT_TIME, TARGET_WAIT_TIME};
use poet_consensus::PoetSettings;
use poet_enclave::DEFAULT_REQUEST_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Block claim limit used by a standalone node. A single node cannot commit
/// its own key refresh, so the limit is kept out of reach.
const SINGLE_NODE_KEY_BLOCK_CLAIM_LIMIT: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusModeKind {
    /// Proof of Elapsed Time with the simulator enclave
    #[default]
    Poet,
    /// Round-robin dev mode
    Devmode,
}

#[derive(Debug, Parser)]
#[command(name = "poet-validator", version, about = "PoET validator node running a local chain")]
pub struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "POET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Consensus mode
    #[arg(short, long, env = "POET_MODE", value_enum)]
    pub mode: Option<ConsensusModeKind>,

    /// Name used in the validator registry
    #[arg(long, env = "POET_VALIDATOR_NAME")]
    pub validator_name: Option<String>,

    /// Hex ed25519 secret key; a fresh key is generated when absent
    #[arg(long, env = "POET_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,

    /// How often the engine polls for a claimable block (milliseconds)
    #[arg(long, env = "POET_POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<u64>,

    /// Upper bound on a single enclave request (milliseconds)
    #[arg(long, env = "POET_ENCLAVE_REQUEST_TIMEOUT_MS")]
    pub enclave_request_timeout_ms: Option<u64>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "POET_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Stop after this many committed blocks
    #[arg(long, env = "POET_MAX_BLOCKS")]
    pub max_blocks: Option<u64>,

    /// Override a chain setting, e.g. `--set poet.target_wait_time=5`
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_setting)]
    pub settings: Vec<(String, String)>,
}

fn parse_setting(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{}`", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("setting key is empty".to_string());
    }
    Ok((key.to_string(), value.trim().to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub mode: ConsensusModeKind,
    pub validator_name: Option<String>,
    pub private_key: Option<String>,
    pub poll_interval_ms: u64,
    /// Time a dev mode proposer waits before claiming its block
    pub devmode_block_interval_ms: u64,
    pub enclave_request_timeout_ms: u64,
    pub log_level: String,
    pub max_blocks: Option<u64>,
    /// Chain settings (`poet.*` keys) layered over the node defaults
    pub settings: BTreeMap<String, String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mode: ConsensusModeKind::Poet,
            validator_name: None,
            private_key: None,
            poll_interval_ms: 100,
            devmode_block_interval_ms: 1000,
            enclave_request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            log_level: "info".to_string(),
            max_blocks: None,
            settings: BTreeMap::new(),
        }
    }
}

impl NodeConfig {
    /// Defaults, then the file named by `args.config`, then the flags
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(mode) = args.mode {
            self.mode = mode;
        }
        if let Some(name) = &args.validator_name {
            self.validator_name = Some(name.clone());
        }
        if let Some(key) = &args.private_key {
            self.private_key = Some(key.clone());
        }
        if let Some(interval) = args.poll_interval_ms {
            self.poll_interval_ms = interval;
        }
        if let Some(timeout) = args.enclave_request_timeout_ms {
            self.enclave_request_timeout_ms = timeout;
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }
        if args.max_blocks.is_some() {
            self.max_blocks = args.max_blocks;
        }
        for (key, value) in &args.settings {
            self.settings.insert(key.clone(), value.clone());
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be positive");
        }
        if self.enclave_request_timeout_ms == 0 {
            bail!("enclave_request_timeout_ms must be positive");
        }
        if let Some(key) = &self.private_key {
            if key.len() != 64 || hex::decode(key).is_err() {
                bail!("private_key must be 32 bytes of hex");
            }
        }
        if let Some(key) = self.settings.keys().find(|key| !key.starts_with("poet.")) {
            bail!("unknown chain setting `{}`", key);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn devmode_block_interval(&self) -> Duration {
        Duration::from_millis(self.devmode_block_interval_ms)
    }

    pub fn enclave_request_timeout(&self) -> Duration {
        Duration::from_millis(self.enclave_request_timeout_ms)
    }

    /// Settings stored on the local chain.
    ///
    /// A standalone node starts its local mean at the target wait time and
    /// never hits the key claim limit; explicit settings override both.
    pub fn chain_settings(&self) -> BTreeMap<String, String> {
        let node_defaults = PoetSettings {
            key_block_claim_limit: SINGLE_NODE_KEY_BLOCK_CLAIM_LIMIT,
            ..PoetSettings::default()
        };
        let mut settings = node_defaults.to_entries();
        settings.extend(self.settings.clone());
        if !self.settings.contains_key(INITIAL_WAIT_TIME) {
            if let Some(target) = settings.get(TARGET_WAIT_TIME).cloned() {
                settings.insert(INITIAL_WAIT_TIME.to_string(), target);
            }
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.mode, ConsensusModeKind::Poet);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.enclave_request_timeout(), DEFAULT_REQUEST_TIMEOUT);

        let settings = PoetSettings::from_view(&config.chain_settings());
        assert_eq!(settings.initial_wait_time, settings.target_wait_time);
        assert_eq!(settings.key_block_claim_limit, SINGLE_NODE_KEY_BLOCK_CLAIM_LIMIT);
    }

    #[test]
    fn test_from_toml() {
        let config = NodeConfig::from_toml(
            r#"
            mode = "devmode"
            validator_name = "alice"
            devmode_block_interval_ms = 250
            enclave_request_timeout_ms = 1500

            [settings]
            "poet.target_wait_time" = "5"
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, ConsensusModeKind::Devmode);
        assert_eq!(config.validator_name.as_deref(), Some("alice"));
        assert_eq!(config.devmode_block_interval(), Duration::from_millis(250));
        assert_eq!(config.enclave_request_timeout(), Duration::from_millis(1500));
        assert_eq!(config.poll_interval_ms, 100);

        let settings = PoetSettings::from_view(&config.chain_settings());
        assert_eq!(settings.target_wait_time, 5.0);
        assert_eq!(settings.initial_wait_time, 5.0);
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mode = \"devmode\"\npoll_interval_ms = 50").unwrap();

        let args = Args::parse_from([
            "poet-validator",
            "--config",
            file.path().to_str().unwrap(),
            "--mode",
            "poet",
            "--enclave-request-timeout-ms",
            "250",
            "--set",
            "poet.minimum_wait_time=0.5",
        ]);
        let config = NodeConfig::load(&args).unwrap();

        assert_eq!(config.mode, ConsensusModeKind::Poet);
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.enclave_request_timeout_ms, 250);
        assert_eq!(
            config.settings.get("poet.minimum_wait_time").map(String::as_str),
            Some("0.5")
        );
    }

    #[test]
    fn test_validation() {
        let mut config = NodeConfig::default();
        config.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.enclave_request_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.private_key = Some("zz".to_string());
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.settings.insert("chain.batch_size".into(), "1".into());
        assert!(config.validate().is_err());

        assert!(parse_setting("no-equals").is_err());
        assert_eq!(
            parse_setting("poet.a = 1").unwrap(),
            ("poet.a".to_string(), "1".to_string())
        );
    }
}
