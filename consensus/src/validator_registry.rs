// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Validator Registry
//!
//! The registry maps validator ids to their committed signup information.
//! Consensus code only ever sees an immutable snapshot of it, selected by the
//! state root of the block being evaluated.

use parking_lot::RwLock;
use poet_enclave::AttestationVerifier;
use poet_types::{
    sha256_hex, ConsensusError, ConsensusResult, ValidatorId, ValidatorInfo,
    ValidatorRegistryPayload,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Read-only view of the registry at one state root
pub trait ValidatorRegistryView: Send + Sync {
    /// Fails with `RegistryLookupFailed` if `validator_id` is not registered
    fn get_validator_info(&self, validator_id: &str) -> ConsensusResult<ValidatorInfo>;

    fn has_validator_info(&self, validator_id: &str) -> bool;

    /// All registered validators, ordered by id
    fn get_validators(&self) -> Vec<ValidatorInfo>;
}

/// Produces registry views for a given state root
pub trait RegistryViewFactory: Send + Sync {
    fn create_view(&self, state_root_hash: &str) -> ConsensusResult<Arc<dyn ValidatorRegistryView>>;
}

/// A registry snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRegistry {
    validators: BTreeMap<ValidatorId, ValidatorInfo>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Insert `info`. An existing entry with the same anti-Sybil id (the
    /// same enclave under any validator id) is removed first, as is a
    /// previous entry for the same validator id. Returns the removed entry.
    pub fn register(&mut self, info: ValidatorInfo) -> Option<ValidatorInfo> {
        let previous_holder = self
            .validators
            .values()
            .find(|existing| existing.signup_info.anti_sybil_id == info.signup_info.anti_sybil_id)
            .map(|existing| existing.id.clone());

        let mut replaced = previous_holder.and_then(|id| self.validators.remove(&id));
        if let Some(old) = self.validators.insert(info.id.clone(), info) {
            replaced = Some(old);
        }
        replaced
    }

    /// Validate a registration transaction and apply it.
    ///
    /// The payload id must be the transaction signer, and the signup proof
    /// must verify against the hash of the signer's public key.
    pub fn apply_registration(
        &mut self,
        payload: &ValidatorRegistryPayload,
        signer_public_key: &str,
        transaction_id: &str,
        block_id: &str,
        verifier: &dyn AttestationVerifier,
    ) -> ConsensusResult<ValidatorInfo> {
        if payload.id != signer_public_key {
            return Err(ConsensusError::InvalidClaim(format!(
                "registration id {} does not match signer {}",
                payload.id, signer_public_key
            )));
        }
        if payload.name.is_empty() {
            return Err(ConsensusError::InvalidClaim(
                "registration name is empty".to_string(),
            ));
        }

        let originator_public_key_hash = sha256_hex(signer_public_key.as_bytes());
        verifier
            .verify_signup(&payload.signup_info, &originator_public_key_hash)
            .map_err(|e| ConsensusError::InvalidClaim(format!("invalid signup info: {}", e)))?;

        let info = ValidatorInfo {
            id: payload.id.clone(),
            name: payload.name.clone(),
            signup_info: payload.signup_info.clone(),
            transaction_id: transaction_id.to_string(),
            registration_block_id: block_id.to_string(),
        };
        if let Some(replaced) = self.register(info.clone()) {
            debug!(
                validator_id = %replaced.short_id(),
                "Replaced registry entry"
            );
        }
        info!(
            name = %info.name,
            validator_id = %info.short_id(),
            block_id = %block_id,
            "Validator registered"
        );
        Ok(info)
    }

    /// Content hash of the registry, used as the block state root
    pub fn state_root(&self) -> String {
        state_root_of(&self.validators)
    }
}

/// Hash every entry in id order; equal registries give equal roots.
fn state_root_of(validators: &BTreeMap<ValidatorId, ValidatorInfo>) -> String {
    let mut material = String::new();
    for info in validators.values() {
        for field in [
            info.id.as_str(),
            info.name.as_str(),
            info.signup_info.poet_public_key.as_str(),
            info.signup_info.anti_sybil_id.as_str(),
            info.signup_info.nonce.as_str(),
            info.transaction_id.as_str(),
            info.registration_block_id.as_str(),
        ] {
            material.push_str(&field.len().to_string());
            material.push(':');
            material.push_str(field);
        }
    }
    sha256_hex(material.as_bytes())
}

impl ValidatorRegistryView for ValidatorRegistry {
    fn get_validator_info(&self, validator_id: &str) -> ConsensusResult<ValidatorInfo> {
        self.validators
            .get(validator_id)
            .cloned()
            .ok_or_else(|| ConsensusError::RegistryLookupFailed(validator_id.to_string()))
    }

    fn has_validator_info(&self, validator_id: &str) -> bool {
        self.validators.contains_key(validator_id)
    }

    fn get_validators(&self) -> Vec<ValidatorInfo> {
        self.validators.values().cloned().collect()
    }
}

/// Registry snapshots keyed by state root
#[derive(Debug, Default)]
pub struct InMemoryRegistryStore {
    snapshots: RwLock<HashMap<String, Arc<ValidatorRegistry>>>,
}

impl InMemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a snapshot and return its state root
    pub fn insert(&self, registry: ValidatorRegistry) -> String {
        let state_root = registry.state_root();
        self.snapshots
            .write()
            .entry(state_root.clone())
            .or_insert_with(|| Arc::new(registry));
        state_root
    }

    pub fn get(&self, state_root_hash: &str) -> Option<Arc<ValidatorRegistry>> {
        self.snapshots.read().get(state_root_hash).cloned()
    }
}

impl RegistryViewFactory for InMemoryRegistryStore {
    fn create_view(&self, state_root_hash: &str) -> ConsensusResult<Arc<dyn ValidatorRegistryView>> {
        self.get(state_root_hash)
            .map(|registry| registry as Arc<dyn ValidatorRegistryView>)
            .ok_or_else(|| {
                ConsensusError::RegistryLookupFailed(format!(
                    "no registry snapshot for state root {}",
                    state_root_hash
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poet_enclave::{MockEnclave, PoetEnclave};
    use poet_types::{SignupInfo, NULL_BLOCK_IDENTIFIER};

    fn info(id: &str, anti_sybil_id: &str) -> ValidatorInfo {
        ValidatorInfo {
            id: id.to_string(),
            name: format!("validator-{}", id),
            signup_info: SignupInfo {
                poet_public_key: format!("ppk-{}", id),
                proof_data: String::new(),
                anti_sybil_id: anti_sybil_id.to_string(),
                nonce: NULL_BLOCK_IDENTIFIER.to_string(),
            },
            transaction_id: format!("txn-{}", id),
            registration_block_id: "genesis".to_string(),
        }
    }

    #[test]
    fn test_lookup() {
        let mut registry = ValidatorRegistry::new();
        registry.register(info("v1", "s1"));
        registry.register(info("v2", "s2"));

        assert!(registry.has_validator_info("v1"));
        assert_eq!(registry.get_validator_info("v2").unwrap().name, "validator-v2");
        assert!(matches!(
            registry.get_validator_info("v3"),
            Err(ConsensusError::RegistryLookupFailed(_))
        ));
        let ids: Vec<String> = registry.get_validators().into_iter().map(|v| v.id).collect();
        assert_eq!(ids, vec!["v1", "v2"]);
    }

    #[test]
    fn test_same_anti_sybil_id_replaces_entry() {
        let mut registry = ValidatorRegistry::new();
        registry.register(info("v1", "s1"));
        let replaced = registry.register(info("v2", "s1"));

        assert_eq!(replaced.unwrap().id, "v1");
        assert_eq!(registry.len(), 1);
        assert!(registry.has_validator_info("v2"));
    }

    #[test]
    fn test_state_root_tracks_content() {
        let mut registry = ValidatorRegistry::new();
        let empty_root = registry.state_root();
        registry.register(info("v1", "s1"));
        let root = registry.state_root();
        assert_ne!(empty_root, root);
        assert_eq!(root, registry.clone().state_root());

        let store = InMemoryRegistryStore::new();
        let stored = store.insert(registry);
        assert_eq!(stored, root);
        assert!(store.create_view(&root).unwrap().has_validator_info("v1"));
        assert!(store.create_view("unknown").is_err());
    }

    #[tokio::test]
    async fn test_apply_registration() {
        let signer = "ab".repeat(32);
        let enclave = MockEnclave::default_with_validator_id(signer.clone()).unwrap();
        let signup = enclave
            .create_signup_info(&sha256_hex(signer.as_bytes()), NULL_BLOCK_IDENTIFIER)
            .await
            .unwrap();
        let payload = ValidatorRegistryPayload {
            name: "validator-abababab".to_string(),
            id: signer.clone(),
            signup_info: signup.to_signup_info(),
        };
        let verifier = enclave.allowlist_verifier();

        let mut registry = ValidatorRegistry::new();
        let applied = registry
            .apply_registration(&payload, &signer, "txn-1", "block-1", &verifier)
            .unwrap();
        assert_eq!(applied.registration_block_id, "block-1");
        assert_eq!(applied.poet_public_key(), signup.poet_public_key);

        // Signed by someone else
        let result = registry.apply_registration(&payload, "cd", "txn-2", "block-2", &verifier);
        assert!(matches!(result, Err(ConsensusError::InvalidClaim(_))));
    }
}
