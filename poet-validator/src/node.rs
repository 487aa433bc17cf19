// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Node assembly: local chain, enclave, consensus mode and engine.

use poet_consensus::{
    genesis_validator_info, ConsensusEngine, ConsensusMode, DevModeConsensus, EngineConfig,
    EngineStats, PoetBlockPublisher, PoetBlockVerifier, PoetConsensus, PoetContext, PoetKeyState,
    PoetKeyStateStore, RotatingProposer, Update, ValidatorRegistry, WaitEngine,
};
use poet_enclave::{AllowlistVerifier, MockEnclave, MockEnclaveBuilder};
use poet_types::{
    block_id_to_nonce, sha256_hex, short_id, Ed25519Signer, Signer, NULL_BLOCK_IDENTIFIER,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ConsensusModeKind, NodeConfig};
use crate::local_chain::{genesis_block_id, LocalChain};

const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// Interval at which `max_blocks` is checked
const HEAD_WATCH_INTERVAL: Duration = Duration::from_millis(50);

pub struct Node {
    config: NodeConfig,
    chain: Arc<LocalChain>,
    engine: ConsensusEngine,
    updates: mpsc::Receiver<Update>,
    update_tx: mpsc::Sender<Update>,
}

/// Controls a running node
#[derive(Clone)]
pub struct NodeHandle {
    chain: Arc<LocalChain>,
    update_tx: mpsc::Sender<Update>,
}

impl NodeHandle {
    pub fn chain(&self) -> &Arc<LocalChain> {
        &self.chain
    }

    /// Ask the engine to stop
    pub async fn shutdown(&self) {
        if self.update_tx.send(Update::Shutdown).await.is_err() {
            warn!("Engine already stopped");
        }
    }
}

impl Node {
    pub async fn build(config: NodeConfig) -> anyhow::Result<Self> {
        let signer = match &config.private_key {
            Some(secret) => Ed25519Signer::from_hex(secret)?,
            None => Ed25519Signer::generate(),
        };
        let validator_id = signer.public_key();
        let validator_name = config
            .validator_name
            .clone()
            .unwrap_or_else(|| format!("validator-{}", short_id(&validator_id)));
        let (update_tx, updates) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let settings = config.chain_settings();

        let (chain, mode): (Arc<LocalChain>, Box<dyn ConsensusMode>) = match config.mode {
            ConsensusModeKind::Poet => {
                let (enclave, wait_engine) = simulator_enclave(&config, &validator_id)?;

                // The founding registration is part of genesis
                let nonce = block_id_to_nonce(NULL_BLOCK_IDENTIFIER);
                let signup = wait_engine
                    .create_signup_info(&sha256_hex(&validator_id), &nonce)
                    .await?;
                let mut registry = ValidatorRegistry::new();
                registry.register(genesis_validator_info(
                    validator_id.clone(),
                    validator_name.clone(),
                    signup.to_signup_info(),
                    genesis_block_id(&validator_id),
                ));

                let chain = Arc::new(LocalChain::new(
                    signer,
                    registry,
                    settings,
                    Box::new(enclave.allowlist_verifier()),
                    update_tx.clone(),
                ));

                let mut key_states = PoetKeyStateStore::new();
                key_states.insert(
                    signup.poet_public_key.clone(),
                    PoetKeyState {
                        sealed_signup_data: Some(signup.sealed_signup_data.clone()),
                        has_been_refreshed: false,
                        signup_nonce: nonce,
                    },
                );
                key_states.set_active_key(Some(signup.poet_public_key.clone()));

                let context = PoetContext::new(chain.block_cache(), chain.registry_store());
                let publisher = PoetBlockPublisher::new(
                    validator_id.clone(),
                    context.clone(),
                    wait_engine.clone(),
                    chain.clone(),
                    key_states,
                )
                .with_validator_name(validator_name.clone());
                let verifier = PoetBlockVerifier::new(context, wait_engine);
                (chain, Box::new(PoetConsensus::new(publisher, verifier)))
            }
            ConsensusModeKind::Devmode => {
                let chain = Arc::new(LocalChain::new(
                    signer,
                    ValidatorRegistry::new(),
                    settings,
                    Box::new(AllowlistVerifier::new()),
                    update_tx.clone(),
                ));
                let election = RotatingProposer::new(vec![validator_id.clone()]);
                let mode = DevModeConsensus::new(
                    validator_id.clone(),
                    election,
                    config.devmode_block_interval(),
                );
                (chain, Box::new(mode))
            }
        };

        let engine = ConsensusEngine::with_config(
            mode,
            chain.clone(),
            EngineConfig {
                poll_interval: config.poll_interval(),
            },
        );
        info!(
            name = %validator_name,
            validator_id = %short_id(&validator_id),
            mode = ?config.mode,
            "Node assembled"
        );

        Ok(Self {
            config,
            chain,
            engine,
            updates,
            update_tx,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            chain: self.chain.clone(),
            update_tx: self.update_tx.clone(),
        }
    }

    /// Run the engine until shutdown or until `max_blocks` blocks are on
    /// the chain
    pub async fn run(self) -> EngineStats {
        let watcher = self
            .config
            .max_blocks
            .map(|max_blocks| watch_chain_height(self.handle(), max_blocks));

        let stats = self.engine.run(self.updates).await;
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        stats
    }
}

/// Simulator enclave and the wait engine bounding its requests
fn simulator_enclave(
    config: &NodeConfig,
    validator_id: &str,
) -> anyhow::Result<(Arc<MockEnclave>, WaitEngine)> {
    let enclave = Arc::new(
        MockEnclaveBuilder::new(validator_id)
            .request_timeout(config.enclave_request_timeout())
            .build()?,
    );
    let request_timeout = enclave.config().request_timeout;
    let wait_engine = WaitEngine::with_request_timeout(enclave.clone(), request_timeout);
    Ok((enclave, wait_engine))
}

fn watch_chain_height(handle: NodeHandle, max_blocks: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEAD_WATCH_INTERVAL);
        loop {
            ticker.tick().await;
            let height = handle.chain().head().map_or(0, |head| head.block_num());
            if height >= max_blocks {
                info!(height, "Reached block limit");
                handle.shutdown().await;
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_engine_uses_configured_request_timeout() {
        let config = NodeConfig {
            enclave_request_timeout_ms: 2500,
            ..NodeConfig::default()
        };
        let (enclave, wait_engine) = simulator_enclave(&config, "validator-1").unwrap();

        assert_eq!(enclave.config().request_timeout, Duration::from_millis(2500));
        assert_eq!(wait_engine.request_timeout(), Duration::from_millis(2500));
    }
}
