use crate::header::Header;
use anyhow::{anyhow, Result};
use cairn_common::{BlockHash, Height, Network, Position};
use std::collections::{BTreeMap, HashSet};

pub mod fjall;
pub mod memory;

/// Persistent home of headers and the best chain index.
///
/// Readers see either the state before or after an `apply_update`, never
/// a mix. A fresh store always holds the network's genesis header at
/// height 0 as its best tip.
pub trait HeaderStore: Send + Sync {
    fn network(&self) -> Network;

    fn try_load_header(&self, hash: &BlockHash) -> Result<Option<Header>>;

    fn load_header(&self, hash: &BlockHash) -> Result<Header> {
        self.try_load_header(hash)?.ok_or_else(|| anyhow!("Header {hash} not found"))
    }

    fn header_exists(&self, hash: &BlockHash) -> Result<bool> {
        Ok(self.try_load_header(hash)?.is_some())
    }

    /// Hash of the best chain block at `height`; `None` above the best tip.
    fn best_block(&self, height: Height) -> Result<Option<BlockHash>>;

    fn current_best(&self) -> Result<Position>;

    fn current_checkpoint(&self) -> Result<Position>;

    /// Tips of known branches that are not the best chain
    fn sibling_hashes(&self) -> Result<HashSet<BlockHash>>;

    /// `(parent, child)` pairs for headers waiting on an unknown parent
    fn disconnected_hashes(&self) -> Result<Vec<(BlockHash, BlockHash)>>;

    /// Up to `count` best chain hashes, tip first.
    fn recent_hashes(&self, count: usize) -> Result<Vec<BlockHash>>;

    /// Atomically apply a staged update.
    fn apply_update(&self, update: &HeaderUpdate) -> Result<()>;
}

/// Everything one transaction changed, ready to be committed
#[derive(Debug, Default, Clone)]
pub struct HeaderUpdate {
    /// Tip before the transaction
    pub previous_best: Position,

    /// Tip after the transaction; best chain entries above it are dropped
    pub best: Position,

    /// Lowest block shared by the old and new chains when the old tip was abandoned
    pub reorg_parent: Option<Position>,

    /// New or modified headers
    pub headers: Vec<Header>,

    /// Best chain entries to (over)write
    pub best_chain: BTreeMap<Height, BlockHash>,

    /// Replacement checkpoint; blank when it was deleted
    pub checkpoint: Option<Position>,

    pub siblings_added: HashSet<BlockHash>,
    pub siblings_removed: HashSet<BlockHash>,

    pub disconnected_added: Vec<(BlockHash, BlockHash)>,
    pub disconnected_removed: Vec<(BlockHash, BlockHash)>,
}

impl HeaderUpdate {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
            && self.best_chain.is_empty()
            && self.best == self.previous_best
            && self.checkpoint.is_none()
            && self.siblings_added.is_empty()
            && self.siblings_removed.is_empty()
            && self.disconnected_added.is_empty()
            && self.disconnected_removed.is_empty()
    }

    pub fn best_changed(&self) -> bool {
        self.best != self.previous_best
    }

    /// Check the update describes a consistent best chain before touching storage.
    pub(crate) fn validate(&self, store: &dyn HeaderStore) -> Result<()> {
        if self.best.height < 0 {
            return Err(anyhow!("Best tip {} has no height", self.best));
        }
        let tip = match self.best_chain.get(&self.best.height) {
            Some(hash) => *hash,
            None => store
                .best_block(self.best.height)?
                .ok_or_else(|| anyhow!("No best chain entry for tip {}", self.best))?,
        };
        if tip != self.best.hash {
            return Err(anyhow!(
                "Best chain entry {tip} at height {} does not match tip {}",
                self.best.height,
                self.best
            ));
        }
        if let Some((height, _)) = self.best_chain.range(self.best.height + 1..).next() {
            return Err(anyhow!("Best chain entry at {height} above tip {}", self.best));
        }
        let stored_tip = store.current_best()?.height;
        if let Some(height) =
            (stored_tip + 1..=self.best.height).find(|h| !self.best_chain.contains_key(h))
        {
            return Err(anyhow!("Gap in best chain at height {height}"));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_utils::*;

    /// Behaviour every store implementation must share
    pub(crate) fn exercise_store(store: &dyn HeaderStore) {
        let genesis = regtest_genesis();
        assert_eq!(store.network(), Network::Regtest);
        assert_eq!(store.current_best().unwrap(), genesis.position());
        assert_eq!(store.best_block(0).unwrap(), Some(genesis.hash()));
        assert_eq!(store.best_block(1).unwrap(), None);
        assert!(store.current_checkpoint().unwrap().is_blank());
        assert!(store.header_exists(&genesis.hash()).unwrap());

        // Extend by two, park one orphan
        let chain = mine_chain(&genesis, 2, EASY_BITS, 1);
        let orphan = mine(&mine(&genesis, EASY_BITS, 9), EASY_BITS, 9);
        let mut update = HeaderUpdate {
            previous_best: genesis.position(),
            best: Position::new(2, chain[1].hash()),
            headers: chain.clone(),
            ..Default::default()
        };
        update.headers.push(orphan.clone());
        update.best_chain.insert(1, chain[0].hash());
        update.best_chain.insert(2, chain[1].hash());
        update.disconnected_added.push((orphan.parent_hash(), orphan.hash()));
        update.siblings_added.insert(orphan.hash());
        store.apply_update(&update).unwrap();

        assert_eq!(store.current_best().unwrap().height, 2);
        assert_eq!(
            store.recent_hashes(5).unwrap(),
            vec![chain[1].hash(), chain[0].hash(), genesis.hash()]
        );
        assert_eq!(store.recent_hashes(1).unwrap(), vec![chain[1].hash()]);
        assert_eq!(
            store.disconnected_hashes().unwrap(),
            vec![(orphan.parent_hash(), orphan.hash())]
        );
        assert!(store.sibling_hashes().unwrap().contains(&orphan.hash()));
        assert_eq!(store.load_header(&chain[0].hash()).unwrap(), chain[0]);

        // Reorg down to height 1 and install a checkpoint
        let checkpoint = Position::new(1, chain[0].hash());
        let mut update = HeaderUpdate {
            previous_best: Position::new(2, chain[1].hash()),
            best: checkpoint,
            checkpoint: Some(checkpoint),
            ..Default::default()
        };
        update.disconnected_removed.push((orphan.parent_hash(), orphan.hash()));
        update.siblings_removed.insert(orphan.hash());
        store.apply_update(&update).unwrap();

        assert_eq!(store.current_best().unwrap(), checkpoint);
        assert_eq!(store.best_block(2).unwrap(), None);
        assert_eq!(store.current_checkpoint().unwrap(), checkpoint);
        assert!(store.disconnected_hashes().unwrap().is_empty());
        assert!(store.sibling_hashes().unwrap().is_empty());
        // Headers are never deleted
        assert!(store.header_exists(&chain[1].hash()).unwrap());
    }

    pub(crate) fn rejects_inconsistent_update(store: &dyn HeaderStore) {
        let genesis = regtest_genesis();
        let child = mine(&genesis, EASY_BITS, 1);
        let update = HeaderUpdate {
            previous_best: genesis.position(),
            best: Position::new(1, child.hash()),
            headers: vec![child.clone()],
            ..Default::default()
        };
        assert!(store.apply_update(&update).is_err());
        assert_eq!(store.current_best().unwrap(), genesis.position());
        assert!(!store.header_exists(&child.hash()).unwrap());
    }

    #[test]
    fn empty_update_is_empty() {
        let update = HeaderUpdate::default();
        assert!(update.is_empty());
        assert!(!update.best_changed());
    }
}
