// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Consensus Engine
//!
//! Drives one [`ConsensusMode`] against the chain service that owns blocks,
//! batches and state.
//!
//! ## Main Flow
//!
//! 1. On every tick, start a candidate on the chain head if none is being
//!    built, and claim it once the mode allows
//! 2. `BlockNew`: verify the block; valid blocks go to the service for
//!    validation. A block whose parent is unknown, or is itself waiting,
//!    is held in the [`OrphanPool`] under that parent and released once
//!    the parent has been passed on or committed
//! 3. `BlockValid`: queue the block in [`PendingForks`] and resolve the
//!    queue while no commit is in flight
//! 4. `BlockCommit`: abandon the candidate, retry the held blocks whose
//!    parent is no longer waiting, then resolve the next queued fork
//!
//! Per-block failures never stop the loop.

use async_trait::async_trait;
use poet_types::{Block, BlockHeader, BlockId, ConsensusResult};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::fork_resolver::ForkChoice;
use crate::mode::ConsensusMode;
use crate::pending::PendingForks;
use crate::wait_timer::unix_time_now;

/// Operations the engine needs from the node hosting it
#[async_trait]
pub trait ChainService: Send + Sync {
    async fn chain_head(&self) -> ConsensusResult<Block>;

    async fn get_block(&self, block_id: &str) -> ConsensusResult<Block>;

    /// On-chain settings as of `block_id`
    async fn get_settings(&self, block_id: &str) -> ConsensusResult<BTreeMap<String, String>>;

    /// Start a candidate block on top of `previous_id`
    async fn initialize_block(&self, previous_id: &str) -> ConsensusResult<()>;

    /// Header of the current candidate, without the consensus payload
    async fn summarize_block(&self) -> ConsensusResult<BlockHeader>;

    /// Seal the candidate with `consensus` and broadcast it
    async fn finalize_block(&self, consensus: Vec<u8>) -> ConsensusResult<BlockId>;

    async fn cancel_block(&self) -> ConsensusResult<()>;

    /// Ask the service to validate the blocks' batches
    async fn check_blocks(&self, block_ids: Vec<BlockId>) -> ConsensusResult<()>;

    async fn commit_block(&self, block_id: &str) -> ConsensusResult<()>;

    async fn ignore_block(&self, block_id: &str) -> ConsensusResult<()>;

    async fn fail_block(&self, block_id: &str) -> ConsensusResult<()>;
}

/// Notifications from the chain service
#[derive(Debug, Clone)]
pub enum Update {
    BlockNew(Block),
    BlockValid(BlockId),
    BlockInvalid(BlockId),
    BlockCommit(BlockId),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the engine tries to build or claim a block
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Counters reported when the engine stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub blocks_published: u64,
    pub blocks_committed: u64,
    pub blocks_failed: u64,
    pub blocks_ignored: u64,
}

pub struct ConsensusEngine {
    mode: Box<dyn ConsensusMode>,
    service: Arc<dyn ChainService>,
    config: EngineConfig,
    /// Validated blocks waiting for fork resolution
    pending_forks: PendingForks,
    /// Blocks that could not be verified yet
    orphans: OrphanPool,
    published: bool,
    building: bool,
    committing: bool,
    stats: EngineStats,
}

impl ConsensusEngine {
    pub fn new(mode: Box<dyn ConsensusMode>, service: Arc<dyn ChainService>) -> Self {
        Self::with_config(mode, service, EngineConfig::default())
    }

    pub fn with_config(
        mode: Box<dyn ConsensusMode>,
        service: Arc<dyn ChainService>,
        config: EngineConfig,
    ) -> Self {
        Self {
            mode,
            service,
            config,
            pending_forks: PendingForks::new(),
            orphans: OrphanPool::default(),
            published: false,
            building: false,
            committing: false,
            stats: EngineStats::default(),
        }
    }

    /// Run until `Shutdown` arrives or the update channel closes
    pub async fn run(mut self, mut updates: mpsc::Receiver<Update>) -> EngineStats {
        info!(mode = self.mode.name(), "Consensus engine started");

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Some(Update::Shutdown) | None => break,
                    Some(update) => {
                        if let Err(e) = self.handle_update(update).await {
                            error!(error = %e, "Failed to handle update");
                        }
                    }
                },
                _ = ticker.tick() => {
                    if !self.published {
                        if let Err(e) = self.try_to_publish().await {
                            warn!(error = %e, "Failed to publish block");
                        }
                    }
                }
            }
        }

        if self.building {
            self.abandon_candidate().await;
        }
        info!(stats = ?self.stats, "Consensus engine stopped");
        self.stats
    }

    async fn handle_update(&mut self, update: Update) -> ConsensusResult<()> {
        match update {
            Update::BlockNew(block) => {
                self.handle_new_block(block).await;
                Ok(())
            }
            Update::BlockValid(block_id) => {
                let block = self.service.get_block(&block_id).await?;
                debug!(block = %block, "Block is valid");
                self.pending_forks.push(block);
                self.process_pending_forks().await
            }
            Update::BlockInvalid(block_id) => {
                info!(block_id = %block_id, "Block failed validation");
                self.stats.blocks_failed += 1;
                self.service.fail_block(&block_id).await
            }
            Update::BlockCommit(block_id) => self.handle_committed_block(&block_id).await,
            Update::Shutdown => Ok(()),
        }
    }

    /// Verify `block` and every held descendant it unblocks
    async fn handle_new_block(&mut self, block: Block) {
        let mut ready = VecDeque::from([block]);
        while let Some(block) = ready.pop_front() {
            let block_id = block.id().to_string();
            match self.verify_new_block(block).await {
                Ok(Verdict::Passed) => ready.extend(self.orphans.release_children(&block_id)),
                Ok(Verdict::Held) => {}
                Ok(Verdict::Rejected) => self.fail_descendants(&block_id).await,
                Err(e) => warn!(block_id = %block_id, error = %e, "Failed to handle new block"),
            }
        }
    }

    async fn verify_new_block(&mut self, block: Block) -> ConsensusResult<Verdict> {
        if self.orphans.is_held(block.previous_id()) {
            debug!(block = %block, "Parent is waiting, holding block");
            self.orphans.hold(block);
            return Ok(Verdict::Held);
        }

        let settings = match self.service.get_settings(block.previous_id()).await {
            Ok(settings) => settings,
            Err(e) if e.is_transient() => {
                debug!(block = %block, "Parent unknown, holding block");
                self.orphans.hold(block);
                return Ok(Verdict::Held);
            }
            Err(e) => return Err(e),
        };

        match self.mode.verify_block(&block, &settings) {
            Ok(()) => {
                debug!(block = %block, "Consensus checks passed");
                self.service
                    .check_blocks(vec![block.id().to_string()])
                    .await?;
                Ok(Verdict::Passed)
            }
            Err(e) if e.is_transient() => {
                debug!(block = %block, error = %e, "Holding block for a later retry");
                self.orphans.hold(block);
                Ok(Verdict::Held)
            }
            Err(e) => {
                info!(block = %block, reason = %e, "Block rejected");
                self.stats.blocks_failed += 1;
                if let Err(e) = self.service.fail_block(block.id()).await {
                    warn!(block = %block, error = %e, "Service could not fail block");
                }
                Ok(Verdict::Rejected)
            }
        }
    }

    /// Fail the held blocks built on a rejected block
    async fn fail_descendants(&mut self, block_id: &str) {
        let mut doomed = self.orphans.release_children(block_id);
        while let Some(block) = doomed.pop() {
            info!(block = %block, "Ancestor rejected, failing block");
            self.stats.blocks_failed += 1;
            if let Err(e) = self.service.fail_block(block.id()).await {
                warn!(block = %block, error = %e, "Service could not fail block");
            }
            doomed.extend(self.orphans.release_children(block.id()));
        }
    }

    async fn handle_committed_block(&mut self, block_id: &str) -> ConsensusResult<()> {
        info!(block_id = %block_id, "Chain head updated");
        if self.building {
            self.abandon_candidate().await;
        }
        self.published = false;
        self.committing = false;
        self.stats.blocks_committed += 1;

        for block in self.orphans.release_roots() {
            self.handle_new_block(block).await;
        }

        self.process_pending_forks().await
    }

    async fn process_pending_forks(&mut self) -> ConsensusResult<()> {
        while !self.committing {
            let Some(block) = self.pending_forks.pop() else {
                break;
            };
            let chain_head = self.service.chain_head().await?;
            match self.mode.compare_forks(&chain_head, &block) {
                ForkChoice::ChooseNew => {
                    info!(block = %block, "Committing block");
                    self.service.commit_block(block.id()).await?;
                    self.committing = true;
                }
                ForkChoice::KeepCurrent => {
                    debug!(block = %block, head = %chain_head, "Ignoring block");
                    self.stats.blocks_ignored += 1;
                    self.service.ignore_block(block.id()).await?;
                }
            }
        }
        Ok(())
    }

    async fn try_to_publish(&mut self) -> ConsensusResult<()> {
        if !self.building {
            let chain_head = self.service.chain_head().await?;
            self.service.initialize_block(chain_head.id()).await?;
            let candidate = self.service.summarize_block().await?;
            let settings = self.service.get_settings(chain_head.id()).await?;

            match self.mode.build_block(&candidate, &settings).await {
                Ok(true) => {
                    debug!(block_num = candidate.block_num, "Building candidate block");
                    self.building = true;
                }
                Ok(false) => self.service.cancel_block().await?,
                Err(e) => {
                    self.service.cancel_block().await?;
                    return Err(e);
                }
            }
        }

        if self.building {
            let candidate = self.service.summarize_block().await?;
            if !self.mode.check_claim_block(&candidate, unix_time_now()) {
                return Ok(());
            }

            self.building = false;
            match self.mode.claim_block(&candidate).await? {
                Some(consensus) => {
                    let block_id = self.service.finalize_block(consensus).await?;
                    info!(block_num = candidate.block_num, block_id = %block_id, "Published block");
                    self.published = true;
                    self.stats.blocks_published += 1;
                }
                None => {
                    debug!(block_num = candidate.block_num, "Candidate abandoned");
                    self.service.cancel_block().await?;
                }
            }
        }
        Ok(())
    }

    async fn abandon_candidate(&mut self) {
        self.mode.cancel_block();
        self.building = false;
        if let Err(e) = self.service.cancel_block().await {
            warn!(error = %e, "Failed to cancel candidate block");
        }
    }
}

enum Verdict {
    /// Passed consensus checks and went to the service
    Passed,
    Held,
    Rejected,
}

/// Blocks waiting for a parent, keyed by the parent they wait on
#[derive(Debug, Default)]
pub struct OrphanPool {
    by_parent: HashMap<BlockId, Vec<Block>>,
    /// Parent ids in the order their first child arrived
    parents: Vec<BlockId>,
    held: HashSet<BlockId>,
}

impl OrphanPool {
    pub fn hold(&mut self, block: Block) {
        if !self.held.insert(block.id().to_string()) {
            return;
        }
        let parent_id = block.previous_id().to_string();
        if !self.by_parent.contains_key(&parent_id) {
            self.parents.push(parent_id.clone());
        }
        self.by_parent.entry(parent_id).or_default().push(block);
    }

    pub fn is_held(&self, block_id: &str) -> bool {
        self.held.contains(block_id)
    }

    /// Remove and return the blocks waiting directly on `parent_id`
    pub fn release_children(&mut self, parent_id: &str) -> Vec<Block> {
        let Some(children) = self.by_parent.remove(parent_id) else {
            return Vec::new();
        };
        self.parents.retain(|id| *id != parent_id);
        for child in &children {
            self.held.remove(child.id());
        }
        children
    }

    /// Remove and return the blocks whose parent is not itself held
    pub fn release_roots(&mut self) -> Vec<Block> {
        let roots: Vec<BlockId> = self
            .parents
            .iter()
            .filter(|parent_id| !self.held.contains(*parent_id))
            .cloned()
            .collect();
        roots
            .iter()
            .flat_map(|parent_id| self.release_children(parent_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devmode::{DevModeConsensus, RotatingProposer, DEVMODE_PAYLOAD};
    use parking_lot::Mutex;
    use poet_types::test_utils::{genesis_block, test_block_with_consensus};
    use poet_types::ConsensusError;

    /// Records every call; blocks are only known once inserted.
    #[derive(Default)]
    struct FakeService {
        blocks: Mutex<HashMap<BlockId, Block>>,
        head: Mutex<BlockId>,
        calls: Mutex<Vec<String>>,
        /// Blocks the service refuses to check
        unreachable: Mutex<HashSet<BlockId>>,
    }

    impl FakeService {
        fn with_genesis() -> Arc<Self> {
            let service = Self::default();
            let genesis = genesis_block("genesis");
            *service.head.lock() = genesis.id().to_string();
            service.blocks.lock().insert(genesis.id().to_string(), genesis);
            Arc::new(service)
        }

        fn insert(&self, block: Block) {
            self.blocks.lock().insert(block.id().to_string(), block);
        }

        fn record(&self, call: String) {
            self.calls.lock().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ChainService for FakeService {
        async fn chain_head(&self) -> ConsensusResult<Block> {
            let head = self.head.lock().clone();
            self.get_block(&head).await
        }

        async fn get_block(&self, block_id: &str) -> ConsensusResult<Block> {
            self.blocks
                .lock()
                .get(block_id)
                .cloned()
                .ok_or_else(|| ConsensusError::UnknownBlock(block_id.to_string()))
        }

        async fn get_settings(&self, block_id: &str) -> ConsensusResult<BTreeMap<String, String>> {
            self.get_block(block_id).await.map(|_| BTreeMap::new())
        }

        async fn initialize_block(&self, previous_id: &str) -> ConsensusResult<()> {
            self.record(format!("initialize:{previous_id}"));
            Ok(())
        }

        async fn summarize_block(&self) -> ConsensusResult<BlockHeader> {
            let head = self.chain_head().await?;
            let mut header = head.header.clone();
            header.block_num += 1;
            header.previous_block_id = head.id().to_string();
            Ok(header)
        }

        async fn finalize_block(&self, consensus: Vec<u8>) -> ConsensusResult<BlockId> {
            self.record(format!("finalize:{}", String::from_utf8_lossy(&consensus)));
            Ok("published".to_string())
        }

        async fn cancel_block(&self) -> ConsensusResult<()> {
            self.record("cancel".to_string());
            Ok(())
        }

        async fn check_blocks(&self, block_ids: Vec<BlockId>) -> ConsensusResult<()> {
            self.record(format!("check:{}", block_ids.join(",")));
            let unreachable = self.unreachable.lock();
            match block_ids.iter().find(|id| unreachable.contains(*id)) {
                Some(id) => Err(ConsensusError::Service(format!("cannot check {id}"))),
                None => Ok(()),
            }
        }

        async fn commit_block(&self, block_id: &str) -> ConsensusResult<()> {
            self.record(format!("commit:{block_id}"));
            *self.head.lock() = block_id.to_string();
            Ok(())
        }

        async fn ignore_block(&self, block_id: &str) -> ConsensusResult<()> {
            self.record(format!("ignore:{block_id}"));
            Ok(())
        }

        async fn fail_block(&self, block_id: &str) -> ConsensusResult<()> {
            self.record(format!("fail:{block_id}"));
            Ok(())
        }
    }

    fn devmode(validator_id: &str) -> Box<dyn ConsensusMode> {
        let election = RotatingProposer::new(vec!["v1".to_string(), "v2".to_string()]);
        Box::new(DevModeConsensus::new(validator_id, election, Duration::ZERO))
    }

    fn engine(validator_id: &str, service: Arc<FakeService>) -> ConsensusEngine {
        // Poll rarely so only the updates drive the tests
        let config = EngineConfig {
            poll_interval: Duration::from_secs(3600),
        };
        ConsensusEngine::with_config(devmode(validator_id), service, config)
    }

    fn devmode_block(id: &str, previous_id: &str, block_num: u64, signer: &str) -> Block {
        test_block_with_consensus(id, previous_id, block_num, signer, DEVMODE_PAYLOAD.to_vec())
    }

    #[tokio::test]
    async fn test_new_block_flow_commits_valid_block() {
        let service = FakeService::with_genesis();
        let mut engine = engine("v1", service.clone());

        let block = devmode_block("b1", "genesis", 1, "v2");
        service.insert(block.clone());

        engine.handle_update(Update::BlockNew(block)).await.unwrap();
        engine.handle_update(Update::BlockValid("b1".into())).await.unwrap();
        assert!(engine.committing);
        engine.handle_update(Update::BlockCommit("b1".into())).await.unwrap();

        assert_eq!(service.calls(), vec!["check:b1", "commit:b1"]);
        assert!(!engine.committing);
        assert_eq!(engine.stats.blocks_committed, 1);
    }

    #[tokio::test]
    async fn test_wrong_proposer_is_failed() {
        let service = FakeService::with_genesis();
        let mut engine = engine("v1", service.clone());

        let block = devmode_block("b1", "genesis", 1, "v1");
        engine.handle_update(Update::BlockNew(block)).await.unwrap();

        assert_eq!(service.calls(), vec!["fail:b1"]);
        assert_eq!(engine.stats.blocks_failed, 1);
    }

    #[tokio::test]
    async fn test_orphan_is_retried_after_commit() {
        let service = FakeService::with_genesis();
        let mut engine = engine("v1", service.clone());

        let parent = devmode_block("b1", "genesis", 1, "v2");
        let child = devmode_block("b2", "b1", 2, "v1");

        engine.handle_update(Update::BlockNew(child.clone())).await.unwrap();
        assert!(service.calls().is_empty());
        assert!(engine.orphans.is_held("b2"));

        service.insert(parent);
        service.insert(child);
        engine.handle_update(Update::BlockCommit("b1".into())).await.unwrap();

        assert_eq!(service.calls(), vec!["check:b2"]);
        assert!(engine.orphans.is_empty());
    }

    #[tokio::test]
    async fn test_chain_arriving_in_reverse_is_checked_parent_first() {
        let service = FakeService::with_genesis();
        let mut engine = engine("v1", service.clone());

        let x = devmode_block("x", "genesis", 1, "v2");
        let b1 = devmode_block("b1", "x", 2, "v1");
        let b2 = devmode_block("b2", "b1", 3, "v2");

        engine.handle_update(Update::BlockNew(b2.clone())).await.unwrap();
        engine.handle_update(Update::BlockNew(b1.clone())).await.unwrap();
        assert!(engine.orphans.is_held("b1"));
        assert!(engine.orphans.is_held("b2"));
        assert!(service.calls().is_empty());

        service.insert(x);
        service.insert(b1);
        service.insert(b2);
        engine.handle_update(Update::BlockCommit("x".into())).await.unwrap();

        assert_eq!(service.calls(), vec!["check:b1", "check:b2"]);
        assert!(engine.orphans.is_empty());
    }

    #[tokio::test]
    async fn test_child_of_held_block_waits_even_if_parent_is_known() {
        let service = FakeService::with_genesis();
        let mut engine = engine("v1", service.clone());

        let b1 = devmode_block("b1", "x", 2, "v1");
        let b2 = devmode_block("b2", "b1", 3, "v2");
        service.insert(b1.clone());
        service.insert(b2.clone());

        engine.handle_update(Update::BlockNew(b1)).await.unwrap();
        engine.handle_update(Update::BlockNew(b2)).await.unwrap();
        assert!(service.calls().is_empty());
        assert_eq!(engine.orphans.len(), 2);

        service.insert(devmode_block("x", "genesis", 1, "v2"));
        engine.handle_update(Update::BlockCommit("x".into())).await.unwrap();
        assert_eq!(service.calls(), vec!["check:b1", "check:b2"]);
    }

    #[tokio::test]
    async fn test_rejected_block_fails_held_descendants() {
        let service = FakeService::with_genesis();
        let mut engine = engine("v1", service.clone());

        // Block 2 belongs to v1
        let b1 = devmode_block("b1", "x", 2, "v2");
        let b2 = devmode_block("b2", "b1", 3, "v2");
        let b3 = devmode_block("b3", "b2", 4, "v1");
        engine.handle_update(Update::BlockNew(b3)).await.unwrap();
        engine.handle_update(Update::BlockNew(b2)).await.unwrap();
        engine.handle_update(Update::BlockNew(b1)).await.unwrap();

        service.insert(devmode_block("x", "genesis", 1, "v2"));
        engine.handle_update(Update::BlockCommit("x".into())).await.unwrap();

        assert_eq!(service.calls(), vec!["fail:b1", "fail:b2", "fail:b3"]);
        assert_eq!(engine.stats.blocks_failed, 3);
        assert!(engine.orphans.is_empty());
    }

    #[tokio::test]
    async fn test_retry_continues_past_a_failing_block() {
        let service = FakeService::with_genesis();
        let mut engine = engine("v1", service.clone());

        let c1 = devmode_block("c1", "x", 2, "v1");
        let d1 = devmode_block("d1", "x", 2, "v1");
        engine.handle_update(Update::BlockNew(c1.clone())).await.unwrap();
        engine.handle_update(Update::BlockNew(d1.clone())).await.unwrap();

        let x = devmode_block("x", "genesis", 1, "v2");
        service.insert(x.clone());
        service.insert(c1);
        service.insert(d1);
        service.unreachable.lock().insert("c1".to_string());
        engine.pending_forks.push(x);

        engine.handle_update(Update::BlockCommit("x".into())).await.unwrap();

        assert_eq!(service.calls(), vec!["check:c1", "check:d1", "commit:x"]);
        assert!(engine.orphans.is_empty());
    }

    #[tokio::test]
    async fn test_forks_wait_for_commit() {
        let service = FakeService::with_genesis();
        let mut engine = engine("v1", service.clone());

        service.insert(devmode_block("b1", "genesis", 1, "v2"));
        service.insert(devmode_block("c1", "genesis", 1, "v2"));

        engine.handle_update(Update::BlockValid("b1".into())).await.unwrap();
        engine.handle_update(Update::BlockValid("c1".into())).await.unwrap();
        assert_eq!(service.calls(), vec!["commit:b1"]);

        // c1 has the same height as the new head and a higher id
        engine.handle_update(Update::BlockCommit("b1".into())).await.unwrap();
        assert_eq!(service.calls(), vec!["commit:b1", "commit:c1"]);
    }

    #[tokio::test]
    async fn test_publish_in_turn() {
        let service = FakeService::with_genesis();
        let mut engine = engine("v2", service.clone());

        engine.try_to_publish().await.unwrap();

        assert_eq!(
            service.calls(),
            vec!["initialize:genesis", "finalize:Devmode"]
        );
        assert!(engine.published);
        assert_eq!(engine.stats.blocks_published, 1);
    }

    #[tokio::test]
    async fn test_abstain_out_of_turn() {
        let service = FakeService::with_genesis();
        let mut engine = engine("v1", service.clone());

        engine.try_to_publish().await.unwrap();

        assert_eq!(service.calls(), vec!["initialize:genesis", "cancel"]);
        assert!(!engine.building);
        assert!(!engine.published);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let service = FakeService::with_genesis();
        let engine = engine("v1", service.clone());
        let (tx, rx) = mpsc::channel(4);

        let handle = tokio::spawn(engine.run(rx));
        tx.send(Update::Shutdown).await.unwrap();
        let stats = handle.await.unwrap();

        assert_eq!(stats.blocks_published, 0);
    }
}
