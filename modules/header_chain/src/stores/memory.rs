//! In-memory header store.

use crate::header::Header;
use crate::stores::{HeaderStore, HeaderUpdate};
use anyhow::Result;
use cairn_common::{BlockHash, Height, Network, Position};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};

struct Inner {
    headers: HashMap<BlockHash, Header>,
    best_chain: Vec<BlockHash>,
    checkpoint: Position,
    siblings: HashSet<BlockHash>,
    disconnected: BTreeSet<(BlockHash, BlockHash)>,
}

/// Volatile store, seeded with genesis. Suitable for tests and short-lived nodes.
pub struct InMemoryHeaderStore {
    network: Network,
    inner: RwLock<Inner>,
}

impl InMemoryHeaderStore {
    pub fn new(network: Network) -> Self {
        let genesis = Header::genesis(network);
        let best_chain = vec![genesis.hash()];
        let headers = HashMap::from([(genesis.hash(), genesis)]);
        Self {
            network,
            inner: RwLock::new(Inner {
                headers,
                best_chain,
                checkpoint: Position::blank(),
                siblings: HashSet::new(),
                disconnected: BTreeSet::new(),
            }),
        }
    }
}

impl HeaderStore for InMemoryHeaderStore {
    fn network(&self) -> Network {
        self.network
    }

    fn try_load_header(&self, hash: &BlockHash) -> Result<Option<Header>> {
        Ok(self.inner.read().headers.get(hash).cloned())
    }

    fn header_exists(&self, hash: &BlockHash) -> Result<bool> {
        Ok(self.inner.read().headers.contains_key(hash))
    }

    fn best_block(&self, height: Height) -> Result<Option<BlockHash>> {
        if height < 0 {
            return Ok(None);
        }
        Ok(self.inner.read().best_chain.get(height as usize).copied())
    }

    fn current_best(&self) -> Result<Position> {
        let inner = self.inner.read();
        let height = inner.best_chain.len() as Height - 1;
        Ok(Position::new(height, inner.best_chain[height as usize]))
    }

    fn current_checkpoint(&self) -> Result<Position> {
        Ok(self.inner.read().checkpoint)
    }

    fn sibling_hashes(&self) -> Result<HashSet<BlockHash>> {
        Ok(self.inner.read().siblings.clone())
    }

    fn disconnected_hashes(&self) -> Result<Vec<(BlockHash, BlockHash)>> {
        Ok(self.inner.read().disconnected.iter().copied().collect())
    }

    fn recent_hashes(&self, count: usize) -> Result<Vec<BlockHash>> {
        Ok(self.inner.read().best_chain.iter().rev().take(count).copied().collect())
    }

    fn apply_update(&self, update: &HeaderUpdate) -> Result<()> {
        update.validate(self)?;

        let mut inner = self.inner.write();
        for header in &update.headers {
            inner.headers.insert(header.hash(), header.clone());
        }

        inner.best_chain.truncate(update.best.height as usize + 1);
        for (height, hash) in &update.best_chain {
            let height = *height as usize;
            if height < inner.best_chain.len() {
                inner.best_chain[height] = *hash;
            } else {
                inner.best_chain.push(*hash);
            }
        }

        if let Some(checkpoint) = update.checkpoint {
            inner.checkpoint = checkpoint;
        }
        for hash in &update.siblings_removed {
            inner.siblings.remove(hash);
        }
        inner.siblings.extend(update.siblings_added.iter().copied());
        for pair in &update.disconnected_removed {
            inner.disconnected.remove(pair);
        }
        inner.disconnected.extend(update.disconnected_added.iter().copied());
        Ok(())
    }
}
