// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Block Publisher
//!
//! Races for the next block on behalf of the local validator.
//!
//! ## Main Flow
//!
//! 1. `initialize_block`: make sure the validator is registered with a usable
//!    PoET key, run the claim rules against the parent's consensus state and
//!    draw a wait timer
//! 2. `check_publish_block`: poll until the timer has expired
//! 3. `finalize_block`: trade the expired timer for a wait certificate and
//!    return it as the block's consensus payload
//!
//! ## Key management
//!
//! Every registration produces a new PoET key pair. The sealed signup data of
//! each key is kept in a [`PoetKeyStateStore`]. A key is refreshed (a new
//! registration submitted) once it reaches the block claim limit or its
//! registration was committed too late; the validator abstains until the new
//! registration is committed, or re-registers if that does not happen within
//! `signup_commit_maximum_delay` blocks.

use async_trait::async_trait;
use poet_types::{
    block_id_to_nonce, sha256_hex, short_id, BlockHeader, BlockId, ConsensusError, ConsensusResult,
    ValidatorId, ValidatorInfo, ValidatorRegistryPayload,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::context::PoetContext;
use crate::settings::PoetSettings;
use crate::wait_certificate::previous_certificate_id;
use crate::wait_engine::WaitEngine;
use crate::wait_timer::WaitTimer;

/// Nonce recorded for keys whose registration attempt is unknown
const UNKNOWN_SIGNUP_NONCE: &str = "unknown";

/// Local knowledge about one PoET key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoetKeyState {
    /// `None` for keys found in the registry without matching sealed data
    pub sealed_signup_data: Option<String>,
    /// A replacement registration has been submitted for this key
    pub has_been_refreshed: bool,
    /// Nonce of the registration that introduced this key
    pub signup_nonce: String,
}

/// PoET key states by PoET public key, plus the key currently in use
#[derive(Debug, Default, Clone)]
pub struct PoetKeyStateStore {
    states: HashMap<String, PoetKeyState>,
    active_key: Option<String>,
}

impl PoetKeyStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, poet_public_key: &str) -> Option<&PoetKeyState> {
        self.states.get(poet_public_key)
    }

    pub fn insert(&mut self, poet_public_key: impl Into<String>, state: PoetKeyState) {
        self.states.insert(poet_public_key.into(), state);
    }

    pub fn remove(&mut self, poet_public_key: &str) -> Option<PoetKeyState> {
        self.states.remove(poet_public_key)
    }

    pub fn active_key(&self) -> Option<&str> {
        self.active_key.as_deref()
    }

    pub fn set_active_key(&mut self, poet_public_key: Option<String>) {
        self.active_key = poet_public_key;
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Where the publisher sends its registration transactions
#[async_trait]
pub trait RegistrationSink: Send + Sync {
    async fn submit_registration(&self, payload: ValidatorRegistryPayload) -> ConsensusResult<()>;
}

pub struct PoetBlockPublisher {
    validator_id: ValidatorId,
    validator_name: String,
    context: PoetContext,
    wait_engine: WaitEngine,
    registration_sink: Arc<dyn RegistrationSink>,
    key_states: PoetKeyStateStore,
    wait_timer: Option<WaitTimer>,
    /// Parent of the last candidate we declined to build on
    last_attempt: Option<BlockId>,
}

impl PoetBlockPublisher {
    pub fn new(
        validator_id: impl Into<ValidatorId>,
        context: PoetContext,
        wait_engine: WaitEngine,
        registration_sink: Arc<dyn RegistrationSink>,
        key_states: PoetKeyStateStore,
    ) -> Self {
        let validator_id = validator_id.into();
        let validator_name = format!("validator-{}", short_id(&validator_id));
        Self {
            validator_id,
            validator_name,
            context,
            wait_engine,
            registration_sink,
            key_states,
            wait_timer: None,
            last_attempt: None,
        }
    }

    /// Name used in registration transactions
    pub fn with_validator_name(mut self, validator_name: impl Into<String>) -> Self {
        self.validator_name = validator_name.into();
        self
    }

    pub fn validator_id(&self) -> &str {
        &self.validator_id
    }

    pub fn key_states(&self) -> &PoetKeyStateStore {
        &self.key_states
    }

    pub fn wait_timer(&self) -> Option<&WaitTimer> {
        self.wait_timer.as_ref()
    }

    /// Prepare to claim the block described by `header`.
    ///
    /// Returns `Ok(false)` when the validator abstains from this candidate.
    /// A parent that was already declined is not attempted again, unless the
    /// attempt failed on a transient error.
    pub async fn initialize_block(
        &mut self,
        header: &BlockHeader,
        settings: &PoetSettings,
    ) -> ConsensusResult<bool> {
        if self.last_attempt.as_deref() == Some(header.previous_block_id.as_str()) {
            return Ok(false);
        }
        self.last_attempt = Some(header.previous_block_id.clone());
        self.wait_timer = None;

        let result = self.try_initialize_block(header, settings).await;
        match &result {
            Ok(true) => self.last_attempt = None,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Abstaining from this round");
                self.last_attempt = None;
            }
            _ => {}
        }
        result
    }

    async fn try_initialize_block(
        &mut self,
        header: &BlockHeader,
        settings: &PoetSettings,
    ) -> ConsensusResult<bool> {
        let previous_block_id = header.previous_block_id.as_str();
        let previous_block = self
            .context
            .block_cache
            .get_block(previous_block_id)
            .ok_or_else(|| ConsensusError::UnknownBlock(previous_block_id.to_string()))?;
        let registry = self
            .context
            .registry_factory
            .create_view(previous_block.state_root_hash())?;

        if !registry.has_validator_info(&self.validator_id) {
            self.handle_unregistered(header, settings).await?;
            return Ok(false);
        }
        let validator_info = registry.get_validator_info(&self.validator_id)?;
        let poet_public_key = validator_info.poet_public_key().to_string();

        let Some(key_state) = self.key_states.get(&poet_public_key).cloned() else {
            debug!(
                poet_public_key = %short_id(&poet_public_key),
                "PoET public key in validator registry not found in key state store, sign up again"
            );
            self.register_signup_information(header).await?;
            self.key_states.insert(
                poet_public_key,
                PoetKeyState {
                    sealed_signup_data: None,
                    has_been_refreshed: true,
                    signup_nonce: UNKNOWN_SIGNUP_NONCE.to_string(),
                },
            );
            return Ok(false);
        };

        if key_state.has_been_refreshed {
            debug!(
                poet_public_key = %short_id(&poet_public_key),
                "PoET public key has been refreshed, waiting for new key to show up in validator registry"
            );
            self.handle_pending_registration(header, settings).await?;
            return Ok(false);
        }

        if self.key_states.active_key() != Some(poet_public_key.as_str()) {
            self.key_states.set_active_key(Some(poet_public_key.clone()));
        }

        let Some(sealed_signup_data) = key_state.sealed_signup_data.clone() else {
            warn!(poet_public_key = %short_id(&poet_public_key), "No sealed signup data for active key");
            self.key_states.set_active_key(None);
            return Ok(false);
        };
        match self.wait_engine.unseal_signup_data(&sealed_signup_data).await {
            Ok(unsealed) if unsealed == poet_public_key => {}
            Ok(unsealed) => {
                error!(
                    expected = %short_id(&poet_public_key),
                    unsealed = %short_id(&unsealed),
                    "Sealed signup data belongs to another key"
                );
                self.key_states.set_active_key(None);
                return Ok(false);
            }
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                error!(poet_public_key = %short_id(&poet_public_key), error = %e, "Could not unseal signup data");
                self.key_states.set_active_key(None);
                return Ok(false);
            }
        }
        debug!(poet_public_key = %short_id(&poet_public_key), "Using PoET public key");

        let consensus_state = self.context.consensus_state_for(previous_block_id, settings)?;
        let block_cache = self.context.block_cache.as_ref();

        if consensus_state.validator_signup_was_committed_too_late(&validator_info, settings, block_cache) {
            info!(
                previous_block = %short_id(previous_block_id),
                "Reject building on block: validator signup information not committed in a timely manner"
            );
            self.refresh_key(header, &poet_public_key, key_state, false).await?;
            return Ok(false);
        }

        if consensus_state.validator_has_claimed_block_limit(&validator_info, settings) {
            self.refresh_key(header, &poet_public_key, key_state, true).await?;
            info!(
                previous_block = %short_id(previous_block_id),
                "Reject building on block: validator has reached maximum number of blocks with key pair"
            );
            return Ok(false);
        }

        if consensus_state.validator_is_claiming_too_early(
            &validator_info,
            header.block_num,
            registry.as_ref(),
            settings,
            block_cache,
        ) {
            info!(
                previous_block = %short_id(previous_block_id),
                "Reject building on block: validator has not waited long enough since registering"
            );
            return Ok(false);
        }

        let previous_certificate_id = previous_certificate_id(block_cache, previous_block_id)?;
        let wait_timer = self
            .wait_engine
            .create_wait_timer(
                &sealed_signup_data,
                &self.validator_id,
                &previous_certificate_id,
                consensus_state.compute_local_mean(settings),
                settings,
            )
            .await?;

        if consensus_state.validator_is_claiming_too_frequently(
            &validator_info,
            previous_block_id,
            settings,
            wait_timer.population_estimate(settings),
            block_cache,
            &self.context.state_store,
            self.context.frequency_test.as_ref(),
        ) {
            info!(
                previous_block = %short_id(previous_block_id),
                validator_id = %validator_info.short_id(),
                "Reject building on block: validator is claiming blocks too frequently"
            );
            return Ok(false);
        }

        debug!(timer = %wait_timer, "Created wait timer");
        self.wait_timer = Some(wait_timer);
        Ok(true)
    }

    /// Whether the candidate may be claimed at `now` (seconds since epoch)
    pub fn check_publish_block(&self, now: f64) -> bool {
        self.wait_timer
            .as_ref()
            .is_some_and(|wait_timer| wait_timer.is_expired(now))
    }

    /// Consensus payload claiming the block described by `header`, or `None`
    /// if the enclave declined to issue a certificate.
    pub async fn finalize_block(&mut self, header: &BlockHeader) -> ConsensusResult<Option<Vec<u8>>> {
        let Some(wait_timer) = self.wait_timer.take() else {
            warn!("No wait timer to finalize the block with");
            return Ok(None);
        };
        let Some(sealed_signup_data) = self
            .key_states
            .active_key()
            .and_then(|key| self.key_states.get(key))
            .and_then(|state| state.sealed_signup_data.clone())
        else {
            warn!("No active PoET key to finalize the block with");
            return Ok(None);
        };

        let block_hash = header.block_hash();
        match self
            .wait_engine
            .create_wait_certificate(&sealed_signup_data, &wait_timer, &block_hash)
            .await?
        {
            Some(certificate) => {
                debug!(certificate = %certificate, "Created wait certificate");
                Ok(Some(certificate.to_payload()?))
            }
            None => {
                error!(timer = %wait_timer, "Failed to create wait certificate");
                Ok(None)
            }
        }
    }

    /// Drop the wait timer of an abandoned candidate
    pub fn cancel_block(&mut self) {
        self.wait_timer = None;
    }

    async fn handle_unregistered(
        &mut self,
        header: &BlockHeader,
        settings: &PoetSettings,
    ) -> ConsensusResult<()> {
        if self.key_states.active_key().is_none() {
            debug!("No public key found, registering new signup information");
            return self.register_signup_information(header).await;
        }
        self.handle_pending_registration(header, settings).await
    }

    /// Re-register if the registration of the active key has not been
    /// committed in time
    async fn handle_pending_registration(
        &mut self,
        header: &BlockHeader,
        settings: &PoetSettings,
    ) -> ConsensusResult<()> {
        let Some(active_key) = self.key_states.active_key().map(str::to_string) else {
            return Ok(());
        };
        let Some(signup_nonce) = self
            .key_states
            .get(&active_key)
            .map(|state| state.signup_nonce.clone())
        else {
            warn!(active_key = %short_id(&active_key), "Key state store has no entry for active key, clearing it");
            self.key_states.set_active_key(None);
            return Ok(());
        };

        let consensus_state = self
            .context
            .consensus_state_for(&header.previous_block_id, settings)?;
        if consensus_state.signup_attempt_timed_out(
            &signup_nonce,
            settings,
            self.context.block_cache.as_ref(),
        ) {
            error!(
                poet_public_key = %short_id(&active_key),
                previous_block = %short_id(&header.previous_block_id),
                "Registration has not committed, creating new registration"
            );
            self.key_states.remove(&active_key);
            self.register_signup_information(header).await?;
        }
        Ok(())
    }

    /// Mark `poet_public_key` refreshed and register a replacement key
    async fn refresh_key(
        &mut self,
        header: &BlockHeader,
        poet_public_key: &str,
        key_state: PoetKeyState,
        release: bool,
    ) -> ConsensusResult<()> {
        if key_state.has_been_refreshed {
            return Ok(());
        }
        info!(poet_public_key = %short_id(poet_public_key), "Refreshing PoET key");

        if release {
            if let Some(sealed_signup_data) = &key_state.sealed_signup_data {
                if let Err(e) = self.wait_engine.release_signup_data(sealed_signup_data).await {
                    warn!(error = %e, "Failed to release signup data");
                }
            }
        }
        self.key_states.insert(
            poet_public_key,
            PoetKeyState {
                has_been_refreshed: true,
                ..key_state
            },
        );
        self.register_signup_information(header).await
    }

    async fn register_signup_information(&mut self, header: &BlockHeader) -> ConsensusResult<()> {
        let originator_public_key_hash = sha256_hex(&self.validator_id);
        let nonce = block_id_to_nonce(&header.previous_block_id);
        let signup = self
            .wait_engine
            .create_signup_info(&originator_public_key_hash, &nonce)
            .await?;

        let payload = ValidatorRegistryPayload {
            name: self.validator_name.clone(),
            id: self.validator_id.clone(),
            signup_info: signup.to_signup_info(),
        };
        info!(
            name = %payload.name,
            validator_id = %short_id(&payload.id),
            poet_public_key = %short_id(&signup.poet_public_key),
            nonce = %nonce,
            "Register validator"
        );
        self.registration_sink.submit_registration(payload).await?;

        self.key_states.insert(
            signup.poet_public_key.clone(),
            PoetKeyState {
                sealed_signup_data: Some(signup.sealed_signup_data),
                has_been_refreshed: false,
                signup_nonce: nonce,
            },
        );
        self.key_states.set_active_key(Some(signup.poet_public_key));
        Ok(())
    }
}

/// Registry entry for a validator whose registration is part of genesis
pub fn genesis_validator_info(
    validator_id: impl Into<ValidatorId>,
    validator_name: impl Into<String>,
    signup_info: poet_types::SignupInfo,
    genesis_block_id: impl Into<BlockId>,
) -> ValidatorInfo {
    let validator_id = validator_id.into();
    ValidatorInfo {
        transaction_id: format!("genesis-{}", short_id(&validator_id)),
        id: validator_id,
        name: validator_name.into(),
        signup_info,
        registration_block_id: genesis_block_id.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_cache::InMemoryBlockCache;
    use crate::block_verifier::PoetBlockVerifier;
    use crate::validator_registry::{InMemoryRegistryStore, ValidatorRegistry};
    use poet_enclave::{EnclaveSignupInfo, MockEnclave};
    use poet_types::test_utils::genesis_block;
    use poet_types::{Block, NULL_BLOCK_IDENTIFIER};
    use tokio::sync::Mutex;

    const VALIDATOR: &str = "0123456789abcdef-validator";
    const GENESIS: &str = "genesis-block";

    #[derive(Default)]
    struct RecordingSink {
        payloads: Mutex<Vec<ValidatorRegistryPayload>>,
    }

    #[async_trait]
    impl RegistrationSink for RecordingSink {
        async fn submit_registration(&self, payload: ValidatorRegistryPayload) -> ConsensusResult<()> {
            self.payloads.lock().await.push(payload);
            Ok(())
        }
    }

    struct Harness {
        cache: Arc<InMemoryBlockCache>,
        registries: Arc<InMemoryRegistryStore>,
        state_root: String,
        context: PoetContext,
        wait_engine: WaitEngine,
        sink: Arc<RecordingSink>,
        signup: EnclaveSignupInfo,
    }

    impl Harness {
        /// Genesis block whose registry contains `VALIDATOR` if `registered`
        async fn new(registered: bool) -> Self {
            let enclave = Arc::new(MockEnclave::default_with_validator_id(VALIDATOR.into()).unwrap());
            let wait_engine = WaitEngine::new(enclave);
            let signup = wait_engine
                .create_signup_info(&sha256_hex(VALIDATOR), NULL_BLOCK_IDENTIFIER)
                .await
                .unwrap();

            let mut registry = ValidatorRegistry::new();
            if registered {
                registry.register(genesis_validator_info(
                    VALIDATOR,
                    "validator-0",
                    signup.to_signup_info(),
                    GENESIS,
                ));
            }
            let registries = Arc::new(InMemoryRegistryStore::new());
            let state_root = registries.insert(registry);

            let cache = Arc::new(InMemoryBlockCache::new());
            let mut genesis = genesis_block(GENESIS);
            genesis.header.state_root_hash = state_root.clone();
            cache.insert(genesis);
            cache.set_chain_head(GENESIS);

            let context = PoetContext::new(cache.clone(), registries.clone());
            Self {
                cache,
                registries,
                state_root,
                context,
                wait_engine,
                sink: Arc::new(RecordingSink::default()),
                signup,
            }
        }

        fn seeded_key_states(&self) -> PoetKeyStateStore {
            let mut key_states = PoetKeyStateStore::new();
            key_states.insert(
                self.signup.poet_public_key.clone(),
                PoetKeyState {
                    sealed_signup_data: Some(self.signup.sealed_signup_data.clone()),
                    has_been_refreshed: false,
                    signup_nonce: NULL_BLOCK_IDENTIFIER.to_string(),
                },
            );
            key_states
        }

        fn publisher(&self, key_states: PoetKeyStateStore) -> PoetBlockPublisher {
            PoetBlockPublisher::new(
                VALIDATOR,
                self.context.clone(),
                self.wait_engine.clone(),
                self.sink.clone(),
                key_states,
            )
        }

        fn verifier(&self) -> PoetBlockVerifier {
            PoetBlockVerifier::new(self.context.clone(), self.wait_engine.clone())
        }

        fn candidate(&self, previous_block_id: &str, block_num: u64) -> BlockHeader {
            BlockHeader {
                block_num,
                previous_block_id: previous_block_id.to_string(),
                signer_public_key: VALIDATOR.to_string(),
                batch_ids: vec![format!("batch-{}", block_num)],
                state_root_hash: self.state_root.clone(),
                consensus: Vec::new(),
            }
        }

        async fn registrations(&self) -> usize {
            self.sink.payloads.lock().await.len()
        }
    }

    /// Build, claim and store the block after genesis
    async fn claim_first_block(harness: &Harness, publisher: &mut PoetBlockPublisher) -> Block {
        let settings = PoetSettings::default();
        let mut header = harness.candidate(GENESIS, 1);
        assert!(publisher.initialize_block(&header, &settings).await.unwrap());
        header.consensus = publisher.finalize_block(&header).await.unwrap().unwrap();
        let block = Block::new(header, "block-1");
        harness.cache.insert(block.clone());
        block
    }

    #[tokio::test]
    async fn test_publish_and_verify() {
        let harness = Harness::new(true).await;
        let mut publisher = harness.publisher(harness.seeded_key_states());
        let settings = PoetSettings::default();

        let header = harness.candidate(GENESIS, 1);
        assert!(publisher.initialize_block(&header, &settings).await.unwrap());
        let timer = publisher.wait_timer().unwrap().clone();
        assert_eq!(timer.previous_certificate_id(), NULL_BLOCK_IDENTIFIER);
        assert_eq!(timer.local_mean(), settings.target_wait_time);

        assert!(!publisher.check_publish_block(timer.request_time()));
        assert!(publisher.check_publish_block(timer.expires_at()));

        let block = claim_first_block(&harness, &mut publisher).await;
        let verifier = harness.verifier();
        verifier.check_block(&block, &settings).unwrap();
        assert!(verifier.verify_block(&block, &settings));
        assert_eq!(harness.registrations().await, 0);
    }

    #[tokio::test]
    async fn test_verifier_rejections() {
        let harness = Harness::new(true).await;
        let mut publisher = harness.publisher(harness.seeded_key_states());
        let block = claim_first_block(&harness, &mut publisher).await;
        let verifier = harness.verifier();
        let settings = PoetSettings::default();

        let mut rebound = block.clone();
        rebound.header.batch_ids.push("extra-batch".to_string());
        assert!(matches!(
            verifier.check_block(&rebound, &settings),
            Err(ConsensusError::InvalidCertificate(_))
        ));

        let mut orphan = block.clone();
        orphan.header.previous_block_id = "missing".to_string();
        assert!(matches!(
            verifier.check_block(&orphan, &settings),
            Err(ConsensusError::UnknownBlock(_))
        ));

        let mut impostor = block.clone();
        impostor.header.signer_public_key = "someone-else".to_string();
        assert!(matches!(
            verifier.check_block(&impostor, &settings),
            Err(ConsensusError::RegistryLookupFailed(_))
        ));

        let mut plain = block.clone();
        plain.header.consensus = b"Devmode".to_vec();
        assert!(matches!(
            verifier.check_block(&plain, &settings),
            Err(ConsensusError::InvalidCertificate(_))
        ));
        assert!(!verifier.verify_block(&plain, &settings));
    }

    #[tokio::test]
    async fn test_claim_limit_rejects_valid_certificate() {
        let harness = Harness::new(true).await;
        let mut publisher = harness.publisher(harness.seeded_key_states());
        let fast = PoetSettings {
            initial_wait_time: 0.001,
            minimum_wait_time: 0.001,
            target_wait_time: 0.001,
            key_block_claim_limit: 2,
            ..Default::default()
        };
        let limited = PoetSettings {
            key_block_claim_limit: 1,
            ..fast.clone()
        };

        let mut header = harness.candidate(GENESIS, 1);
        assert!(publisher.initialize_block(&header, &fast).await.unwrap());
        header.consensus = publisher.finalize_block(&header).await.unwrap().unwrap();
        harness.cache.insert(Block::new(header, "block-1"));

        // Second block on top of our own; the enclave wants the timer expired
        let mut header = harness.candidate("block-1", 2);
        assert!(publisher.initialize_block(&header, &fast).await.unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        header.consensus = publisher.finalize_block(&header).await.unwrap().unwrap();
        let second = Block::new(header, "block-2");

        let verifier = harness.verifier();
        verifier.check_block(&second, &fast).unwrap();
        assert!(matches!(
            verifier.check_block(&second, &limited),
            Err(ConsensusError::InvalidClaim(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_limit_refreshes_key() {
        let harness = Harness::new(true).await;
        let mut publisher = harness.publisher(harness.seeded_key_states());
        claim_first_block(&harness, &mut publisher).await;

        let limited = PoetSettings {
            key_block_claim_limit: 1,
            ..Default::default()
        };
        let header = harness.candidate("block-1", 2);
        assert!(!publisher.initialize_block(&header, &limited).await.unwrap());

        assert_eq!(harness.registrations().await, 1);
        let old_key = publisher.key_states().get(&harness.signup.poet_public_key).unwrap();
        assert!(old_key.has_been_refreshed);
        let active_key = publisher.key_states().active_key().unwrap();
        assert_ne!(active_key, harness.signup.poet_public_key);

        // Same parent again: already declined
        assert!(!publisher.initialize_block(&header, &limited).await.unwrap());
        assert_eq!(harness.registrations().await, 1);
    }

    #[tokio::test]
    async fn test_unregistered_validator_registers_once() {
        let harness = Harness::new(false).await;
        let mut publisher = harness.publisher(PoetKeyStateStore::new());
        let settings = PoetSettings::default();
        let header = harness.candidate(GENESIS, 1);

        assert!(!publisher.initialize_block(&header, &settings).await.unwrap());
        assert!(!publisher.initialize_block(&header, &settings).await.unwrap());
        assert_eq!(harness.registrations().await, 1);

        let payload = harness.sink.payloads.lock().await[0].clone();
        assert_eq!(payload.id, VALIDATOR);
        assert_eq!(payload.name, "validator-01234567");
        assert_eq!(payload.signup_info.nonce, block_id_to_nonce(GENESIS));
        assert_eq!(
            publisher.key_states().active_key(),
            Some(payload.signup_info.poet_public_key.as_str())
        );
    }

    #[tokio::test]
    async fn test_unknown_registry_key_signs_up_again() {
        let harness = Harness::new(true).await;
        let mut publisher = harness.publisher(PoetKeyStateStore::new());
        let settings = PoetSettings::default();

        assert!(!publisher
            .initialize_block(&harness.candidate(GENESIS, 1), &settings)
            .await
            .unwrap());
        assert_eq!(harness.registrations().await, 1);

        let placeholder = publisher.key_states().get(&harness.signup.poet_public_key).unwrap();
        assert!(placeholder.has_been_refreshed);
        assert_eq!(placeholder.sealed_signup_data, None);
        assert_eq!(publisher.key_states().len(), 2);
    }

    #[tokio::test]
    async fn test_pending_registration_times_out() {
        let harness = Harness::new(false).await;
        let mut publisher = harness.publisher(PoetKeyStateStore::new());
        let settings = PoetSettings::default();

        assert!(!publisher
            .initialize_block(&harness.candidate(GENESIS, 1), &settings)
            .await
            .unwrap());
        assert_eq!(harness.registrations().await, 1);

        // Two blocks later the registration is still not committed
        let mut block_1 = genesis_block("block-1");
        block_1.header.previous_block_id = GENESIS.to_string();
        block_1.header.block_num = 1;
        block_1.header.state_root_hash = harness.state_root.clone();
        let mut block_2 = block_1.clone();
        block_2.header.previous_block_id = "block-1".to_string();
        block_2.header.block_num = 2;
        block_2.header_signature = "block-2".to_string();
        harness.cache.insert(block_1);
        harness.cache.insert(block_2);
        harness.cache.set_chain_head("block-2");

        assert!(!publisher
            .initialize_block(&harness.candidate("block-2", 3), &settings)
            .await
            .unwrap());
        assert_eq!(harness.registrations().await, 2);
        assert_eq!(publisher.key_states().len(), 1);
        assert!(harness.registries.get(&harness.state_root).is_some());
    }
}
