//! Thread-safe entry point to the header chain.
//!
//! Writers hold the state lock exclusively from staging through commit, so
//! readers never observe a half-applied reorganisation. Every successful
//! write that moves the best tip returns a [`ChainUpdate`] for the caller to
//! forward.

use crate::header::Header;
use crate::header_error::{HeaderChainError, Result};
use crate::selector::ChainSelector;
use crate::staging::StagingTransaction;
use crate::state::ChainState;
use crate::stores::HeaderStore;
use crate::sync::SyncJob;
use cairn_common::{messages::BestChainChangedMessage, BlockHash, Height, Network, Position};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Hashes snapshotted into each sync job
pub const DEFAULT_RECENT_HASHES: usize = 32;

/// Sibling tips and parked headers this far below the best tip are forgotten
pub const DEFAULT_PRUNE_WINDOW: Height = 2016;

/// Best tip movement caused by one committed write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainUpdate {
    pub previous: Position,
    pub best: Position,

    /// Set when the previous tip left the best chain
    pub reorg_parent: Option<Position>,
}

impl From<ChainUpdate> for BestChainChangedMessage {
    fn from(update: ChainUpdate) -> Self {
        Self {
            previous: update.previous,
            best: update.best,
            reorg_parent: update.reorg_parent,
        }
    }
}

pub struct HeaderOracle {
    store: Arc<dyn HeaderStore>,
    state: RwLock<ChainState>,
    network: Network,
    default_checkpoint: Position,
    recent_hashes: usize,
    prune_window: Height,
}

impl HeaderOracle {
    /// Open the chain on `store`, installing `default_checkpoint` if the store has none.
    ///
    /// Panics if the store's genesis does not belong to its network.
    pub fn new(store: Arc<dyn HeaderStore>, default_checkpoint: Position) -> Result<Self> {
        let network = store.network();
        let genesis = Header::genesis(network);
        let stored = store.best_block(0)?;
        if stored != Some(genesis.hash()) {
            panic!(
                "Header store genesis {stored:?} does not match {network} genesis {}",
                genesis.hash()
            );
        }

        let state = ChainState::load(store.as_ref())?;
        info!(
            %network,
            best = %state.best(),
            checkpoint = %state.checkpoint(),
            siblings = state.siblings().len(),
            disconnected = state.disconnected_count(),
            "Header chain loaded"
        );

        let oracle = Self {
            store,
            state: RwLock::new(state),
            network,
            default_checkpoint,
            recent_hashes: DEFAULT_RECENT_HASHES,
            prune_window: DEFAULT_PRUNE_WINDOW,
        };

        if !default_checkpoint.is_blank() && oracle.get_checkpoint().is_blank() {
            oracle.add_checkpoint(default_checkpoint)?;
        }
        Ok(oracle)
    }

    pub fn with_recent_hashes(mut self, count: usize) -> Self {
        self.recent_hashes = count;
        self
    }

    pub fn with_prune_window(mut self, window: Height) -> Self {
        self.prune_window = window;
        self
    }

    pub fn network(&self) -> Network {
        self.network
    }

    // -- Writes

    pub fn add_header(&self, header: Header) -> Result<Option<ChainUpdate>> {
        self.add_headers(vec![header])
    }

    /// Validate then apply headers in order, committing once.
    pub fn add_headers(&self, headers: Vec<Header>) -> Result<Option<ChainUpdate>> {
        for header in &headers {
            if header.network() != self.network {
                return Err(HeaderChainError::WrongNetwork {
                    hash: header.hash(),
                    expected: self.network,
                    got: header.network(),
                });
            }
        }

        self.write(|selector| {
            for header in headers {
                selector.add_header(header)?;
            }
            Ok(())
        })
    }

    /// Decode serialised headers and add them. Nothing is applied if any fails to decode.
    pub fn add_raw_headers(&self, raw: &[Vec<u8>]) -> Result<Option<ChainUpdate>> {
        let headers = raw
            .iter()
            .map(|bytes| Header::decode(self.network, bytes))
            .collect::<Result<Vec<_>>>()?;
        self.add_headers(headers)
    }

    pub fn add_checkpoint(&self, checkpoint: Position) -> Result<Option<ChainUpdate>> {
        self.write(|selector| selector.add_checkpoint(checkpoint))
    }

    pub fn delete_checkpoint(&self) -> Result<Option<ChainUpdate>> {
        self.write(|selector| selector.delete_checkpoint())
    }

    fn write<F>(&self, op: F) -> Result<Option<ChainUpdate>>
    where
        F: FnOnce(&mut ChainSelector<'_>) -> Result<()>,
    {
        let mut state = self.state.write();
        let update = {
            let mut selector =
                ChainSelector::new(StagingTransaction::new(self.store.as_ref(), &state));
            op(&mut selector)?;
            if selector.transaction().best() != state.best() {
                selector.prune(self.prune_window)?;
            }
            selector.finish()?
        };

        if update.is_empty() {
            return Ok(None);
        }

        if let Err(e) = self.store.apply_update(&update) {
            error!("Failed to commit header update: {e:#}");
            return Err(HeaderChainError::CommitFailed {
                reason: format!("{e:#}"),
            });
        }
        state.apply(&update);

        if let Err(e) = self.prune_sync(&mut state) {
            error!("Failed to prune unknown hashes: {e}");
        }

        if !update.best_changed() {
            return Ok(None);
        }
        debug!(previous = %update.previous_best, best = %update.best, "Best chain committed");
        Ok(Some(ChainUpdate {
            previous: update.previous_best,
            best: update.best,
            reorg_parent: update.reorg_parent,
        }))
    }

    // -- Sync scheduling

    /// Hand out a sync job if the chain is behind and none is outstanding.
    pub fn get_job(&self) -> Result<Option<SyncJob>> {
        let state = self.state.write();
        if !state.job_is_available() {
            return Ok(None);
        }
        let recent = self.store.recent_hashes(self.recent_hashes)?;
        Ok(state.sync().issue_job(state.best().height, recent))
    }

    /// Record a hash a peer referenced. Returns false if it is already stored.
    pub fn add_unknown_hash(&self, hash: BlockHash) -> Result<bool> {
        let mut state = self.state.write();
        if self.store.header_exists(&hash)? {
            return Ok(false);
        }
        let best_height = state.best().height;
        state.sync_mut().add_unknown_hash(hash, best_height);
        debug!(%hash, "Unknown hash reported");
        Ok(true)
    }

    /// Returns whether the highest known peer height rose.
    pub fn update_remote_height(&self, height: Height) -> bool {
        self.state.write().sync_mut().update_remote_height(height)
    }

    /// Forget unknown hashes that have since been stored or gone stale.
    pub fn prune_known_hashes(&self) -> Result<()> {
        let mut state = self.state.write();
        self.prune_sync(&mut state)
    }

    fn prune_sync(&self, state: &mut ChainState) -> Result<()> {
        let mut known = HashSet::new();
        for hash in state.sync().unknown_hashes() {
            if self.store.header_exists(hash)? {
                known.insert(*hash);
            }
        }
        let best_height = state.best().height;
        state.sync_mut().prune_known_hashes(best_height, |hash| known.contains(hash));
        Ok(())
    }

    pub fn is_synchronized(&self) -> bool {
        self.state.read().is_synchronized()
    }

    pub fn target(&self) -> Height {
        self.state.read().target()
    }

    pub fn job_is_available(&self) -> bool {
        self.state.read().job_is_available()
    }

    // -- Queries

    pub fn best_chain(&self) -> Position {
        self.state.read().best()
    }

    pub fn best_hash(&self, height: Height) -> Result<Option<BlockHash>> {
        let state = self.state.read();
        self.view(&state).best_hash(height)
    }

    pub fn get_position(&self, height: Height) -> Result<Option<Position>> {
        Ok(self.best_hash(height)?.map(|hash| Position::new(height, hash)))
    }

    /// Best chain hashes ascending from `start`, ending at `stop` (inclusive)
    /// if it is found. A `limit` of zero means no limit.
    pub fn best_hashes(
        &self,
        start: Height,
        stop: Option<BlockHash>,
        limit: usize,
    ) -> Result<Vec<BlockHash>> {
        let state = self.state.read();
        let view = self.view(&state);
        let best = state.best().height;
        let mut hashes = Vec::new();
        for height in start.max(0)..=best {
            if limit != 0 && hashes.len() >= limit {
                break;
            }
            let Some(hash) = view.best_hash(height)? else {
                break;
            };
            hashes.push(hash);
            if Some(hash) == stop {
                break;
            }
        }
        Ok(hashes)
    }

    pub fn is_in_best_chain(&self, position: &Position) -> Result<bool> {
        let state = self.state.read();
        self.view(&state).is_in_best_chain(position)
    }

    pub fn is_hash_in_best_chain(&self, hash: &BlockHash) -> Result<bool> {
        let state = self.state.read();
        let Some(header) = self.store.try_load_header(hash)? else {
            return Ok(false);
        };
        if !header.is_connected() {
            return Ok(false);
        }
        self.view(&state).is_in_best_chain(&header.position())
    }

    /// Path from the common ancestor of `start` and `target` up to `target`.
    pub fn ancestors(&self, start: Position, target: Position, limit: usize) -> Result<Vec<Position>> {
        let state = self.state.read();
        self.view(&state).ancestors(start, target, limit)
    }

    /// Positions above the best chain a consumer must unwind to reach `tip`'s
    /// branch, ascending. Empty when `tip` is already on the best chain.
    pub fn calculate_reorg(&self, tip: &BlockHash) -> Result<Vec<Position>> {
        let state = self.state.read();
        self.view(&state).calculate_reorg(tip)
    }

    /// Where `tip`'s branch meets the best chain, and the current best tip.
    pub fn common_parent(&self, tip: &BlockHash) -> Result<(Position, Position)> {
        let state = self.state.read();
        let view = self.view(&state);
        let ancestor = match view.calculate_reorg(tip)?.first() {
            Some(lowest) => self.store.load_header(&lowest.hash)?.parent_position(),
            None => self.store.load_header(tip)?.position(),
        };
        Ok((ancestor, state.best()))
    }

    pub fn siblings(&self) -> HashSet<BlockHash> {
        self.state.read().siblings().clone()
    }

    pub fn get_checkpoint(&self) -> Position {
        self.state.read().checkpoint()
    }

    pub fn get_default_checkpoint(&self) -> Position {
        self.default_checkpoint
    }

    pub fn load_header(&self, hash: &BlockHash) -> Result<Option<Header>> {
        Ok(self.store.try_load_header(hash)?)
    }

    pub fn header_exists(&self, hash: &BlockHash) -> Result<bool> {
        Ok(self.store.header_exists(hash)?)
    }

    /// Up to `count` best chain hashes, tip first.
    pub fn recent_hashes(&self, count: usize) -> Result<Vec<BlockHash>> {
        let _state = self.state.read();
        Ok(self.store.recent_hashes(count)?)
    }

    fn view<'s>(&'s self, state: &'s ChainState) -> ChainView<'s> {
        ChainView {
            store: self.store.as_ref(),
            state,
        }
    }
}

/// Read-only walks over committed state, run under a held lock.
struct ChainView<'a> {
    store: &'a dyn HeaderStore,
    state: &'a ChainState,
}

impl ChainView<'_> {
    fn best_hash(&self, height: Height) -> Result<Option<BlockHash>> {
        if height < 0 || height > self.state.best().height {
            return Ok(None);
        }
        Ok(self.store.best_block(height)?)
    }

    fn is_in_best_chain(&self, position: &Position) -> Result<bool> {
        Ok(self.best_hash(position.height)? == Some(position.hash))
    }

    fn connected_header(&self, hash: &BlockHash) -> Result<Header> {
        let header = self
            .store
            .try_load_header(hash)?
            .ok_or(HeaderChainError::HeaderNotFound { hash: *hash })?;
        if !header.is_connected() {
            return Err(HeaderChainError::NotConnected { hash: *hash });
        }
        Ok(header)
    }

    fn parent_of(&self, position: &Position) -> Result<Position> {
        let header = self.connected_header(&position.hash)?;
        if header.is_genesis() {
            return Err(HeaderChainError::NotConnected { hash: position.hash });
        }
        Ok(header.parent_position())
    }

    fn ancestors(&self, start: Position, target: Position, limit: usize) -> Result<Vec<Position>> {
        if self.is_in_best_chain(&start)? && self.is_in_best_chain(&target)? {
            let mut path = Vec::new();
            for height in start.height.min(target.height)..=target.height {
                if limit != 0 && path.len() >= limit {
                    break;
                }
                let hash = self
                    .best_hash(height)?
                    .ok_or(HeaderChainError::HeightNotFound { height })?;
                path.push(Position::new(height, hash));
            }
            return Ok(path);
        }

        // Walk both cursors down until they meet
        let mut upper = self.connected_header(&target.hash)?.position();
        let mut lower = self.connected_header(&start.hash)?.position();
        let mut path = Vec::new();
        while upper != lower {
            if upper.height >= lower.height {
                path.push(upper);
                if upper.height == lower.height {
                    lower = self.parent_of(&lower)?;
                }
                upper = self.parent_of(&upper)?;
            } else {
                lower = self.parent_of(&lower)?;
            }
        }
        path.push(upper);
        path.reverse();
        if limit != 0 {
            path.truncate(limit);
        }
        Ok(path)
    }

    fn calculate_reorg(&self, tip: &BlockHash) -> Result<Vec<Position>> {
        let mut cursor = self.connected_header(tip)?.position();
        let mut path = Vec::new();
        while !self.is_in_best_chain(&cursor)? {
            path.push(cursor);
            cursor = self.parent_of(&cursor)?;
        }
        path.reverse();
        Ok(path)
    }
}
