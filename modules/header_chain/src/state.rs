//! Lock-guarded chain state shared by readers and the single writer.

use crate::stores::{HeaderStore, HeaderUpdate};
use crate::sync::SyncState;
use anyhow::Result;
use cairn_common::{BlockHash, Height, Position};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug)]
pub struct ChainState {
    best: Position,
    checkpoint: Position,

    /// Missing parent hash -> children waiting on it
    disconnected: HashMap<BlockHash, BTreeSet<BlockHash>>,

    /// Tips of known branches that are not the best chain
    siblings: HashSet<BlockHash>,

    sync: SyncState,
}

impl ChainState {
    /// Rebuild the in-memory view from a store.
    pub fn load(store: &dyn HeaderStore) -> Result<Self> {
        let mut disconnected: HashMap<BlockHash, BTreeSet<BlockHash>> = HashMap::new();
        for (parent, child) in store.disconnected_hashes()? {
            disconnected.entry(parent).or_default().insert(child);
        }
        Ok(Self {
            best: store.current_best()?,
            checkpoint: store.current_checkpoint()?,
            disconnected,
            siblings: store.sibling_hashes()?,
            sync: SyncState::default(),
        })
    }

    pub fn best(&self) -> Position {
        self.best
    }

    pub fn checkpoint(&self) -> Position {
        self.checkpoint
    }

    pub fn disconnected(&self) -> &HashMap<BlockHash, BTreeSet<BlockHash>> {
        &self.disconnected
    }

    pub fn disconnected_count(&self) -> usize {
        self.disconnected.values().map(BTreeSet::len).sum()
    }

    pub fn siblings(&self) -> &HashSet<BlockHash> {
        &self.siblings
    }

    pub fn sync(&self) -> &SyncState {
        &self.sync
    }

    pub fn sync_mut(&mut self) -> &mut SyncState {
        &mut self.sync
    }

    pub fn is_synchronized(&self) -> bool {
        self.sync.is_synchronized(self.best.height)
    }

    pub fn target(&self) -> Height {
        self.sync.target(self.best.height)
    }

    pub fn job_is_available(&self) -> bool {
        !self.sync.job_outstanding() && !self.is_synchronized()
    }

    /// Fold a committed update into the in-memory view.
    pub(crate) fn apply(&mut self, update: &HeaderUpdate) {
        self.best = update.best;
        if let Some(checkpoint) = update.checkpoint {
            self.checkpoint = checkpoint;
        }
        for hash in &update.siblings_removed {
            self.siblings.remove(hash);
        }
        self.siblings.extend(update.siblings_added.iter().copied());
        for (parent, child) in &update.disconnected_removed {
            if let Some(children) = self.disconnected.get_mut(parent) {
                children.remove(child);
                if children.is_empty() {
                    self.disconnected.remove(parent);
                }
            }
        }
        for (parent, child) in &update.disconnected_added {
            self.disconnected.entry(*parent).or_default().insert(*child);
        }
    }
}
