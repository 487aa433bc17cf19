// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Local Chain
//!
//! An in-memory chain that lets a single validator run the consensus engine
//! without a network or transaction executor.
//!
//! ## Block contents
//!
//! The only transactions are validator registrations. A registration
//! submitted by the publisher is carried by the next block built; it takes
//! effect in the registry snapshot of that block's child, recording the
//! carrying block as its commit block. The genesis registry is given
//! directly.
//!
//! Every state change is reported to the engine through the update channel,
//! as a networked chain service would.

use async_trait::async_trait;
use parking_lot::Mutex;
use poet_consensus::{
    BlockCache, ChainService, InMemoryBlockCache, InMemoryRegistryStore, RegistrationSink,
    Update, ValidatorRegistry,
};
use poet_enclave::AttestationVerifier;
use poet_types::{
    sha256_hex, Block, BlockHeader, BlockId, ConsensusError, ConsensusResult, Ed25519Signer,
    Signer, ValidatorRegistryPayload, NULL_BLOCK_IDENTIFIER,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Consensus field of the genesis block
pub const GENESIS_PAYLOAD: &[u8] = b"Genesis";

/// Id of the genesis block of a chain started by `validator_id`.
///
/// Genesis is not signed: its registry names it as the commit block of the
/// founding registration, so the id cannot depend on the header.
pub fn genesis_block_id(validator_id: &str) -> BlockId {
    sha256_hex(format!("genesis:{}", validator_id))
}

#[derive(Debug, Clone)]
struct Registration {
    transaction_id: String,
    signer_public_key: String,
    payload: ValidatorRegistryPayload,
}

struct Candidate {
    header: BlockHeader,
    registrations: Vec<Registration>,
}

#[derive(Default)]
struct ChainState {
    /// Submitted, not yet carried by a block
    pending: VecDeque<Registration>,
    candidate: Option<Candidate>,
    /// Registrations carried by each block
    carried: HashMap<BlockId, Vec<Registration>>,
}

pub struct LocalChain {
    signer: Ed25519Signer,
    blocks: Arc<InMemoryBlockCache>,
    registries: Arc<InMemoryRegistryStore>,
    attestation_verifier: Box<dyn AttestationVerifier>,
    settings: BTreeMap<String, String>,
    updates: mpsc::Sender<Update>,
    state: Mutex<ChainState>,
}

impl LocalChain {
    /// Start a chain whose genesis block holds `genesis_registry`
    pub fn new(
        signer: Ed25519Signer,
        genesis_registry: ValidatorRegistry,
        settings: BTreeMap<String, String>,
        attestation_verifier: Box<dyn AttestationVerifier>,
        updates: mpsc::Sender<Update>,
    ) -> Self {
        let registries = Arc::new(InMemoryRegistryStore::new());
        let state_root_hash = registries.insert(genesis_registry);

        let genesis = Block::new(
            BlockHeader {
                block_num: 0,
                previous_block_id: NULL_BLOCK_IDENTIFIER.to_string(),
                signer_public_key: signer.public_key(),
                batch_ids: Vec::new(),
                state_root_hash,
                consensus: GENESIS_PAYLOAD.to_vec(),
            },
            genesis_block_id(&signer.public_key()),
        );
        info!(block = %genesis, "Created genesis block");

        let blocks = Arc::new(InMemoryBlockCache::new());
        let genesis_id = genesis.id().to_string();
        blocks.insert(genesis);
        blocks.set_chain_head(&genesis_id);

        Self {
            signer,
            blocks,
            registries,
            attestation_verifier,
            settings,
            updates,
            state: Mutex::new(ChainState::default()),
        }
    }

    pub fn validator_id(&self) -> String {
        self.signer.public_key()
    }

    pub fn block_cache(&self) -> Arc<InMemoryBlockCache> {
        self.blocks.clone()
    }

    pub fn registry_store(&self) -> Arc<InMemoryRegistryStore> {
        self.registries.clone()
    }

    pub fn head(&self) -> Option<Block> {
        self.blocks.chain_head()
    }

    /// Registry snapshot as of `block_id`
    pub fn registry_at(&self, block_id: &str) -> Option<Arc<ValidatorRegistry>> {
        let block = self.blocks.get_block(block_id)?;
        self.registries.get(block.state_root_hash())
    }

    pub fn pending_registrations(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn notify(&self, update: Update) -> ConsensusResult<()> {
        self.updates
            .try_send(update)
            .map_err(|e| ConsensusError::Service(format!("cannot deliver update: {}", e)))
    }

    /// Registry of the child of `previous`: the parent's snapshot plus the
    /// registrations `previous` carried
    fn child_state_root(&self, previous: &Block, carried: &[Registration]) -> ConsensusResult<String> {
        let mut registry = self
            .registries
            .get(previous.state_root_hash())
            .map(|registry| (*registry).clone())
            .ok_or_else(|| {
                ConsensusError::Service(format!(
                    "no registry snapshot for block {}",
                    previous.id()
                ))
            })?;

        for registration in carried {
            if let Err(e) = registry.apply_registration(
                &registration.payload,
                &registration.signer_public_key,
                &registration.transaction_id,
                previous.id(),
                self.attestation_verifier.as_ref(),
            ) {
                warn!(
                    transaction_id = %registration.transaction_id,
                    error = %e,
                    "Registration rejected"
                );
            }
        }
        Ok(self.registries.insert(registry))
    }
}

#[async_trait]
impl ChainService for LocalChain {
    async fn chain_head(&self) -> ConsensusResult<Block> {
        self.blocks
            .chain_head()
            .ok_or_else(|| ConsensusError::Service("chain has no head".to_string()))
    }

    async fn get_block(&self, block_id: &str) -> ConsensusResult<Block> {
        self.blocks
            .get_block(block_id)
            .ok_or_else(|| ConsensusError::UnknownBlock(block_id.to_string()))
    }

    async fn get_settings(&self, block_id: &str) -> ConsensusResult<BTreeMap<String, String>> {
        if !self.blocks.contains(block_id) {
            return Err(ConsensusError::UnknownBlock(block_id.to_string()));
        }
        Ok(self.settings.clone())
    }

    async fn initialize_block(&self, previous_id: &str) -> ConsensusResult<()> {
        let previous = self.get_block(previous_id).await?;
        let mut state = self.state.lock();

        if let Some(stale) = state.candidate.take() {
            debug!(block_num = stale.header.block_num, "Replacing unfinished candidate");
            for registration in stale.registrations.into_iter().rev() {
                state.pending.push_front(registration);
            }
        }

        let carried = state.carried.get(previous_id).cloned().unwrap_or_default();
        let state_root_hash = self.child_state_root(&previous, &carried)?;
        let registrations: Vec<Registration> = state.pending.drain(..).collect();

        let header = BlockHeader {
            block_num: previous.block_num() + 1,
            previous_block_id: previous_id.to_string(),
            signer_public_key: self.signer.public_key(),
            batch_ids: registrations
                .iter()
                .map(|registration| registration.transaction_id.clone())
                .collect(),
            state_root_hash,
            consensus: Vec::new(),
        };
        state.candidate = Some(Candidate {
            header,
            registrations,
        });
        Ok(())
    }

    async fn summarize_block(&self) -> ConsensusResult<BlockHeader> {
        self.state
            .lock()
            .candidate
            .as_ref()
            .map(|candidate| candidate.header.clone())
            .ok_or_else(|| ConsensusError::Service("no block in progress".to_string()))
    }

    async fn finalize_block(&self, consensus: Vec<u8>) -> ConsensusResult<BlockId> {
        let block = {
            let mut state = self.state.lock();
            let Candidate {
                mut header,
                registrations,
            } = state
                .candidate
                .take()
                .ok_or_else(|| ConsensusError::Service("no block in progress".to_string()))?;

            header.consensus = consensus;
            let block = Block::sign(header, &self.signer);
            state.carried.insert(block.id().to_string(), registrations);
            block
        };

        let block_id = block.id().to_string();
        debug!(block = %block, "Finalized block");
        self.blocks.insert(block.clone());
        self.notify(Update::BlockNew(block))?;
        Ok(block_id)
    }

    async fn cancel_block(&self) -> ConsensusResult<()> {
        let mut state = self.state.lock();
        if let Some(candidate) = state.candidate.take() {
            for registration in candidate.registrations.into_iter().rev() {
                state.pending.push_front(registration);
            }
        }
        Ok(())
    }

    async fn check_blocks(&self, block_ids: Vec<BlockId>) -> ConsensusResult<()> {
        for block_id in block_ids {
            let valid = self
                .blocks
                .get_block(&block_id)
                .is_some_and(|block| block.verify_signature());
            if valid {
                self.notify(Update::BlockValid(block_id))?;
            } else {
                self.notify(Update::BlockInvalid(block_id))?;
            }
        }
        Ok(())
    }

    async fn commit_block(&self, block_id: &str) -> ConsensusResult<()> {
        if !self.blocks.set_chain_head(block_id) {
            return Err(ConsensusError::UnknownBlock(block_id.to_string()));
        }
        info!(block_id = %block_id, "Committed block");
        self.notify(Update::BlockCommit(block_id.to_string()))
    }

    async fn ignore_block(&self, block_id: &str) -> ConsensusResult<()> {
        debug!(block_id = %block_id, "Ignored block");
        Ok(())
    }

    async fn fail_block(&self, block_id: &str) -> ConsensusResult<()> {
        warn!(block_id = %block_id, "Block failed");
        self.state.lock().carried.remove(block_id);
        Ok(())
    }
}

#[async_trait]
impl RegistrationSink for LocalChain {
    async fn submit_registration(&self, payload: ValidatorRegistryPayload) -> ConsensusResult<()> {
        let transaction_id = sha256_hex(format!(
            "{}:{}:{}",
            payload.id, payload.signup_info.poet_public_key, payload.signup_info.nonce
        ));
        info!(
            name = %payload.name,
            transaction_id = %transaction_id,
            "Queued registration"
        );
        self.state.lock().pending.push_back(Registration {
            transaction_id,
            signer_public_key: self.signer.public_key(),
            payload,
        });
        Ok(())
    }
}
