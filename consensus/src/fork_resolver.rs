// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Fork Resolver
//!
//! Picks between two valid chain heads. Both heads have already passed block
//! verification, so certificate validity is settled; the resolver only has
//! to break ties, deterministically across nodes:
//!
//! 1. A PoET block beats a non-PoET block
//! 2. The greater `block_num` wins
//! 3. Equal `block_num`: the lexicographically larger certificate id wins
//! 4. Still equal: the lexicographically larger block id wins

use poet_types::Block;
use std::cmp::Ordering;
use tracing::{debug, info, warn};

use crate::wait_certificate::WaitCertificate;

/// Outcome of a fork comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkChoice {
    /// Switch the chain head to the candidate
    ChooseNew,
    /// Keep the current chain head
    KeepCurrent,
}

impl ForkChoice {
    pub fn is_new(self) -> bool {
        matches!(self, ForkChoice::ChooseNew)
    }
}

/// Ordering key of a chain head; larger wins
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ForkRank<'a> {
    is_poet: bool,
    block_num: u64,
    certificate_id: Option<&'a str>,
    block_id: &'a str,
}

fn certificate_of(block: &Block) -> Option<WaitCertificate> {
    match WaitCertificate::from_block(block) {
        Ok(certificate) => certificate,
        Err(e) => {
            // Verified blocks carry a well-formed payload; rank a corrupt one
            // as non-PoET
            warn!(block_id = %block.id(), error = %e, "Unreadable certificate on verified block");
            None
        }
    }
}

/// Compare `current_head` with `candidate_head`
pub fn compare_forks(current_head: &Block, candidate_head: &Block) -> ForkChoice {
    let current_certificate = certificate_of(current_head);
    let candidate_certificate = certificate_of(candidate_head);

    let current = ForkRank {
        is_poet: current_certificate.is_some(),
        block_num: current_head.block_num(),
        certificate_id: current_certificate.as_ref().map(|c| c.identifier()),
        block_id: current_head.id(),
    };
    let candidate = ForkRank {
        is_poet: candidate_certificate.is_some(),
        block_num: candidate_head.block_num(),
        certificate_id: candidate_certificate.as_ref().map(|c| c.identifier()),
        block_id: candidate_head.id(),
    };

    let choice = match candidate.cmp(&current) {
        Ordering::Greater => ForkChoice::ChooseNew,
        Ordering::Less | Ordering::Equal => ForkChoice::KeepCurrent,
    };

    if current.is_poet != candidate.is_poet {
        info!(
            current = %current_head,
            candidate = %candidate_head,
            ?choice,
            "Fork decided by PoET block preference"
        );
    } else if current.block_num != candidate.block_num {
        debug!(
            current_num = current.block_num,
            candidate_num = candidate.block_num,
            ?choice,
            "Fork decided by block number"
        );
    } else {
        info!(
            current = %current_head,
            candidate = %candidate_head,
            current_certificate = ?current.certificate_id,
            candidate_certificate = ?candidate.certificate_id,
            ?choice,
            "Fork tie broken by identifiers"
        );
    }
    choice
}
