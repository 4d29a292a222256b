//! Copy-on-write view of the chain for one write operation.
//!
//! Reads fall through to the committed store and state; writes stay local
//! until [`StagingTransaction::finish`] turns them into a [`HeaderUpdate`].
//! Dropping a transaction discards everything it staged.

use crate::header::Header;
use crate::header_error::{HeaderChainError, Result};
use crate::state::ChainState;
use crate::stores::{HeaderStore, HeaderUpdate};
use cairn_common::{BlockHash, Height, Position};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

pub struct StagingTransaction<'a> {
    store: &'a dyn HeaderStore,
    state: &'a ChainState,
    headers: HashMap<BlockHash, Header>,
    best: Position,
    best_chain: BTreeMap<Height, BlockHash>,
    checkpoint: Position,
    siblings: HashSet<BlockHash>,
    disconnected: HashMap<BlockHash, BTreeSet<BlockHash>>,
    reorg_root: Option<Position>,
}

impl<'a> StagingTransaction<'a> {
    pub fn new(store: &'a dyn HeaderStore, state: &'a ChainState) -> Self {
        Self {
            store,
            state,
            headers: HashMap::new(),
            best: state.best(),
            best_chain: BTreeMap::new(),
            checkpoint: state.checkpoint(),
            siblings: state.siblings().clone(),
            disconnected: state.disconnected().clone(),
            reorg_root: None,
        }
    }

    pub fn load_header(&self, hash: &BlockHash) -> Result<Option<Header>> {
        match self.headers.get(hash) {
            Some(header) => Ok(Some(header.clone())),
            None => Ok(self.store.try_load_header(hash)?),
        }
    }

    pub fn require_header(&self, hash: &BlockHash) -> Result<Header> {
        self.load_header(hash)?.ok_or(HeaderChainError::HeaderNotFound { hash: *hash })
    }

    pub fn header_exists(&self, hash: &BlockHash) -> Result<bool> {
        Ok(self.headers.contains_key(hash) || self.store.header_exists(hash)?)
    }

    pub fn stage(&mut self, header: Header) {
        self.headers.insert(header.hash(), header);
    }

    pub fn best(&self) -> Position {
        self.best
    }

    pub fn best_hash(&self, height: Height) -> Result<Option<BlockHash>> {
        if height < 0 || height > self.best.height {
            return Ok(None);
        }
        match self.best_chain.get(&height) {
            Some(hash) => Ok(Some(*hash)),
            None => Ok(self.store.best_block(height)?),
        }
    }

    pub fn is_in_best_chain(&self, position: &Position) -> Result<bool> {
        Ok(self.best_hash(position.height)? == Some(position.hash))
    }

    pub fn checkpoint(&self) -> Position {
        self.checkpoint
    }

    pub fn set_checkpoint(&mut self, checkpoint: Position) {
        self.checkpoint = checkpoint;
    }

    pub fn siblings(&self) -> &HashSet<BlockHash> {
        &self.siblings
    }

    pub fn add_sibling(&mut self, hash: BlockHash) {
        self.siblings.insert(hash);
    }

    pub fn remove_sibling(&mut self, hash: &BlockHash) -> bool {
        self.siblings.remove(hash)
    }

    pub fn add_disconnected(&mut self, parent: BlockHash, child: BlockHash) {
        self.disconnected.entry(parent).or_default().insert(child);
    }

    pub fn is_parked(&self, parent: &BlockHash, child: &BlockHash) -> bool {
        self.disconnected.get(parent).is_some_and(|children| children.contains(child))
    }

    /// Remove and return the children waiting on `parent`, in hash order.
    pub fn take_disconnected(&mut self, parent: &BlockHash) -> BTreeSet<BlockHash> {
        self.disconnected.remove(parent).unwrap_or_default()
    }

    /// Make `chain` the tail of the best chain.
    ///
    /// `chain` must be consecutive and its first position's parent must be in
    /// the best chain. Positions it shares with the current best chain are
    /// skipped; the abandoned tip, if any, becomes a sibling.
    pub fn set_best_chain(&mut self, chain: &[Position]) -> Result<()> {
        let Some(first) = chain.first() else {
            return Ok(());
        };
        let Some(tip) = chain.last().copied() else {
            return Ok(());
        };

        let mut divergence = chain.len();
        for (index, position) in chain.iter().enumerate() {
            if !self.is_in_best_chain(position)? {
                divergence = index;
                break;
            }
        }

        let root = if divergence == 0 {
            self.require_header(&first.hash)?.parent_position()
        } else {
            chain[divergence - 1]
        };
        if !self.is_in_best_chain(&root)? {
            return Err(HeaderChainError::NotConnected { hash: tip.hash });
        }

        let previous = self.best;
        if root != previous {
            debug!(%previous, %root, %tip, "Reorganising best chain");
            self.siblings.insert(previous.hash);
            self.reorg_root = Some(match self.reorg_root {
                Some(earlier) if earlier.height <= root.height => earlier,
                _ => root,
            });
        }

        self.best_chain.split_off(&(root.height + 1));
        for position in &chain[divergence..] {
            self.best_chain.insert(position.height, position.hash);
            self.siblings.remove(&position.hash);
        }
        self.best = tip;
        Ok(())
    }

    /// Forget sibling tips and parked headers more than `window` blocks below the best tip.
    ///
    /// Headers stay stored; a pruned header sent again is parked or connected afresh.
    pub fn prune(&mut self, window: Height) -> Result<()> {
        let floor = self.best.height - window;
        if floor <= 0 {
            return Ok(());
        }

        let mut stale_siblings = Vec::new();
        for hash in &self.siblings {
            match self.load_header(hash)? {
                Some(header) if header.height() >= floor => {}
                _ => stale_siblings.push(*hash),
            }
        }
        for hash in &stale_siblings {
            self.siblings.remove(hash);
        }

        let mut stale_parked = Vec::new();
        for (parent, children) in &self.disconnected {
            for child in children {
                match self.load_header(child)? {
                    Some(header) if header.parked_at() >= floor => {}
                    _ => stale_parked.push((*parent, *child)),
                }
            }
        }
        for (parent, child) in &stale_parked {
            if let Some(children) = self.disconnected.get_mut(parent) {
                children.remove(child);
                if children.is_empty() {
                    self.disconnected.remove(parent);
                }
            }
        }

        if !stale_siblings.is_empty() || !stale_parked.is_empty() {
            debug!(
                floor,
                siblings = stale_siblings.len(),
                parked = stale_parked.len(),
                "Pruned stale branches"
            );
        }
        Ok(())
    }

    /// Collapse the staged changes into an update against the committed state.
    pub fn finish(self) -> Result<HeaderUpdate> {
        let previous_best = self.state.best();
        let reorg_parent = if self.is_in_best_chain(&previous_best)? {
            None
        } else {
            self.reorg_root
        };

        let committed = self.state.siblings();
        let siblings_added = self.siblings.difference(committed).copied().collect();
        let siblings_removed = committed.difference(&self.siblings).copied().collect();

        let before = flatten(self.state.disconnected());
        let after = flatten(&self.disconnected);
        let disconnected_added = after.difference(&before).copied().collect();
        let disconnected_removed = before.difference(&after).copied().collect();

        let checkpoint = (self.checkpoint != self.state.checkpoint()).then_some(self.checkpoint);

        Ok(HeaderUpdate {
            previous_best,
            best: self.best,
            reorg_parent,
            headers: self.headers.into_values().collect(),
            best_chain: self.best_chain,
            checkpoint,
            siblings_added,
            siblings_removed,
            disconnected_added,
            disconnected_removed,
        })
    }
}

fn flatten(index: &HashMap<BlockHash, BTreeSet<BlockHash>>) -> BTreeSet<(BlockHash, BlockHash)> {
    index
        .iter()
        .flat_map(|(parent, children)| children.iter().map(move |child| (*parent, *child)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    fn connect(parent: &Header, child: &mut Header) {
        child.inherit_height(parent).unwrap();
        child.inherit_work(parent).unwrap();
        child.inherit_state(parent).unwrap();
    }

    #[test]
    fn reads_fall_through_to_store() {
        let store = regtest_store();
        let state = ChainState::load(store.as_ref()).unwrap();
        let tx = StagingTransaction::new(store.as_ref(), &state);
        let genesis = regtest_genesis();

        assert!(tx.header_exists(&genesis.hash()).unwrap());
        assert_eq!(tx.best_hash(0).unwrap(), Some(genesis.hash()));
        assert_eq!(tx.best_hash(1).unwrap(), None);
        assert!(tx.finish().unwrap().is_empty());
    }

    #[test]
    fn extension_then_reorg_records_root() {
        let store = regtest_store();
        let state = ChainState::load(store.as_ref()).unwrap();
        let mut tx = StagingTransaction::new(store.as_ref(), &state);
        let genesis = regtest_genesis();

        let mut a = mine(&genesis, EASY_BITS, 1);
        connect(&genesis, &mut a);
        let mut b = mine(&genesis, EASY_BITS, 2);
        connect(&genesis, &mut b);
        tx.stage(a.clone());
        tx.stage(b.clone());

        tx.set_best_chain(&[a.position()]).unwrap();
        assert_eq!(tx.best(), a.position());
        assert!(tx.siblings().is_empty());

        tx.set_best_chain(&[b.position()]).unwrap();
        assert_eq!(tx.best(), b.position());
        assert!(tx.siblings().contains(&a.hash()));
        assert!(tx.is_in_best_chain(&b.position()).unwrap());
        assert!(!tx.is_in_best_chain(&a.position()).unwrap());

        let update = tx.finish().unwrap();
        // Genesis is still in the chain, so nothing committed was abandoned
        assert_eq!(update.reorg_parent, None);
        assert_eq!(update.best, b.position());
        assert_eq!(update.best_chain.get(&1), Some(&b.hash()));
        assert!(update.siblings_added.contains(&a.hash()));
        assert_eq!(update.headers.len(), 2);
    }

    #[test]
    fn disconnected_diff() {
        let store = regtest_store();
        let state = ChainState::load(store.as_ref()).unwrap();
        let mut tx = StagingTransaction::new(store.as_ref(), &state);
        let parent = BlockHash::new([1; 32]);
        let child = BlockHash::new([2; 32]);

        tx.add_disconnected(parent, child);
        assert_eq!(tx.take_disconnected(&parent).len(), 1);
        assert!(tx.take_disconnected(&parent).is_empty());
        tx.add_disconnected(parent, child);

        let update = tx.finish().unwrap();
        assert_eq!(update.disconnected_added, vec![(parent, child)]);
        assert!(update.disconnected_removed.is_empty());
    }

    #[test]
    fn prune_drops_entries_below_window() {
        let store = regtest_store();
        let state = ChainState::load(store.as_ref()).unwrap();
        let mut tx = StagingTransaction::new(store.as_ref(), &state);
        let genesis = regtest_genesis();

        let mut main = Vec::new();
        let mut parent = genesis.clone();
        for _ in 0..6 {
            let mut next = mine(&parent, EASY_BITS, 1);
            connect(&parent, &mut next);
            tx.stage(next.clone());
            main.push(next.clone());
            parent = next;
        }
        let mut low = mine(&genesis, EASY_BITS, 2);
        connect(&genesis, &mut low);
        let mut high = mine(&main[3], EASY_BITS, 2);
        connect(&main[3], &mut high);
        tx.stage(low.clone());
        tx.stage(high.clone());
        tx.add_sibling(low.hash());
        tx.add_sibling(high.hash());

        let stray = BlockHash::new([9; 32]);
        let mut old_orphan = mine(&genesis, EASY_BITS, 3);
        old_orphan.mark_disconnected(0);
        let mut new_orphan = mine(&genesis, EASY_BITS, 4);
        new_orphan.mark_disconnected(5);
        tx.add_disconnected(stray, old_orphan.hash());
        tx.add_disconnected(stray, new_orphan.hash());
        tx.stage(old_orphan.clone());
        tx.stage(new_orphan.clone());

        let chain: Vec<Position> = main.iter().map(Header::position).collect();
        tx.set_best_chain(&chain).unwrap();
        tx.prune(3).unwrap();

        assert!(!tx.siblings().contains(&low.hash()));
        assert!(tx.siblings().contains(&high.hash()));
        assert!(!tx.is_parked(&stray, &old_orphan.hash()));
        assert!(tx.is_parked(&stray, &new_orphan.hash()));

        let update = tx.finish().unwrap();
        assert!(!update.siblings_added.contains(&low.hash()));
        assert_eq!(update.disconnected_added, vec![(stray, new_orphan.hash())]);
    }

    #[test]
    fn prune_reports_committed_removals() {
        let store = regtest_store();
        let genesis = regtest_genesis();
        let orphan = {
            let mut header = mine(&genesis, EASY_BITS, 3);
            header.mark_disconnected(0);
            header
        };
        let stray = BlockHash::new([9; 32]);
        let update = HeaderUpdate {
            previous_best: genesis.position(),
            best: genesis.position(),
            headers: vec![orphan.clone()],
            disconnected_added: vec![(stray, orphan.hash())],
            ..Default::default()
        };
        store.apply_update(&update).unwrap();

        let state = ChainState::load(store.as_ref()).unwrap();
        let mut tx = StagingTransaction::new(store.as_ref(), &state);
        let mut parent = genesis;
        let mut chain = Vec::new();
        for _ in 0..4 {
            let mut next = mine(&parent, EASY_BITS, 1);
            connect(&parent, &mut next);
            tx.stage(next.clone());
            chain.push(next.position());
            parent = next;
        }
        tx.set_best_chain(&chain).unwrap();
        tx.prune(2).unwrap();

        let update = tx.finish().unwrap();
        assert_eq!(update.disconnected_removed, vec![(stray, orphan.hash())]);
        assert!(update.disconnected_added.is_empty());
    }

    #[test]
    fn unconnected_chain_is_refused() {
        let store = regtest_store();
        let state = ChainState::load(store.as_ref()).unwrap();
        let mut tx = StagingTransaction::new(store.as_ref(), &state);
        let genesis = regtest_genesis();

        let mut a = mine(&genesis, EASY_BITS, 1);
        connect(&genesis, &mut a);
        let mut b = mine(&a, EASY_BITS, 1);
        connect(&a, &mut b);
        tx.stage(a);
        tx.stage(b.clone());

        let err = tx.set_best_chain(&[b.position()]).unwrap_err();
        assert!(matches!(err, HeaderChainError::NotConnected { .. }));
    }
}
