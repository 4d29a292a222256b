//! Sync job scheduling.
//!
//! Tracks what peers claim to have and hands out at most one sync job at a
//! time. A job carries a snapshot of recent best chain hashes for the peer
//! layer to build a locator from.

use cairn_common::{BlockHash, Height};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Instant;
use tracing::debug;

/// Remote height while unknown block hashes are pending.
pub const UNBOUNDED_HEIGHT: Height = Height::MAX;

/// Unknown hashes pinned more than this far below the best tip are dropped.
pub const UNKNOWN_HASH_TOLERANCE: Height = 2;

/// A unit of sync work. Dropping it frees the slot for the next job.
#[derive(Debug)]
pub struct SyncJob {
    recent_hashes: Vec<BlockHash>,
    target: Height,
    issued: Instant,
    outstanding: Arc<AtomicBool>,
}

impl SyncJob {
    pub fn recent_hashes(&self) -> &[BlockHash] {
        &self.recent_hashes
    }

    /// Height the chain should reach
    pub fn target(&self) -> Height {
        self.target
    }

    pub fn issued(&self) -> Instant {
        self.issued
    }
}

impl Drop for SyncJob {
    fn drop(&mut self) {
        self.outstanding.store(false, Ordering::Release);
        debug!(target = self.target, "Sync job released");
    }
}

/// Peer heights and unknown hashes as reported by the sync layer
#[derive(Debug)]
pub struct SyncState {
    highest_peer_height: Height,
    effective_remote_height: Height,

    /// Unknown hash -> best height when it was reported
    unknown_hashes: HashMap<BlockHash, Height>,

    outstanding: Arc<AtomicBool>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            highest_peer_height: -1,
            effective_remote_height: -1,
            unknown_hashes: HashMap::new(),
            outstanding: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl SyncState {
    pub fn highest_peer_height(&self) -> Height {
        self.highest_peer_height
    }

    pub fn effective_remote_height(&self) -> Height {
        self.effective_remote_height
    }

    pub fn unknown_hash_count(&self) -> usize {
        self.unknown_hashes.len()
    }

    pub fn unknown_hashes(&self) -> impl Iterator<Item = &BlockHash> {
        self.unknown_hashes.keys()
    }

    pub fn is_synchronized(&self, best_height: Height) -> bool {
        best_height >= self.effective_remote_height
    }

    /// Height the chain should sync towards.
    pub fn target(&self, best_height: Height) -> Height {
        if self.effective_remote_height == UNBOUNDED_HEIGHT {
            self.highest_peer_height.max(best_height + 1)
        } else {
            self.highest_peer_height.max(best_height)
        }
    }

    pub fn job_outstanding(&self) -> bool {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Issue a job if the chain is behind and no job is outstanding.
    pub fn issue_job(&self, best_height: Height, recent_hashes: Vec<BlockHash>) -> Option<SyncJob> {
        if self.is_synchronized(best_height) {
            return None;
        }
        if self
            .outstanding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let target = self.target(best_height);
        debug!(best_height, target, "Sync job issued");
        Some(SyncJob {
            recent_hashes,
            target,
            issued: Instant::now(),
            outstanding: self.outstanding.clone(),
        })
    }

    /// Record a peer height; returns whether it raised the highest seen.
    pub fn update_remote_height(&mut self, height: Height) -> bool {
        if height <= self.highest_peer_height {
            return false;
        }
        self.highest_peer_height = height;
        if self.unknown_hashes.is_empty() {
            self.effective_remote_height = height;
        }
        true
    }

    /// Record a hash a peer referenced that is not in storage.
    pub fn add_unknown_hash(&mut self, hash: BlockHash, best_height: Height) {
        self.unknown_hashes.entry(hash).or_insert(best_height);
        self.effective_remote_height = UNBOUNDED_HEIGHT;
    }

    /// Forget hashes that arrived or went stale.
    pub fn prune_known_hashes<F>(&mut self, best_height: Height, is_known: F)
    where
        F: Fn(&BlockHash) -> bool,
    {
        if self.unknown_hashes.is_empty() {
            return;
        }
        self.unknown_hashes.retain(|hash, pinned| {
            best_height - *pinned <= UNKNOWN_HASH_TOLERANCE && !is_known(hash)
        });
        if self.unknown_hashes.is_empty() {
            self.effective_remote_height = self.highest_peer_height;
        }
    }
}
