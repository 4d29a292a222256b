//! Header ingestion, fork choice and checkpoint enforcement.
//!
//! A [`ChainSelector`] owns one [`StagingTransaction`] and applies write
//! operations to it. The most-work selectable tip wins; ties keep the
//! incumbent. Checkpoints are enforced on every known branch, not just the
//! best one.

use crate::candidate::Candidate;
use crate::header::{Header, HeaderStatus};
use crate::header_error::{HeaderChainError, Result};
use crate::staging::StagingTransaction;
use crate::stores::HeaderUpdate;
use cairn_common::{BlockHash, Height, Position};
use tracing::{debug, info, warn};

/// Lowest height a checkpoint may be installed at
pub const MIN_CHECKPOINT_HEIGHT: Height = 2;

pub struct ChainSelector<'a> {
    tx: StagingTransaction<'a>,
}

impl<'a> ChainSelector<'a> {
    pub fn new(tx: StagingTransaction<'a>) -> Self {
        Self { tx }
    }

    pub fn transaction(&self) -> &StagingTransaction<'a> {
        &self.tx
    }

    pub fn finish(self) -> Result<HeaderUpdate> {
        self.tx.finish()
    }

    /// Stage a validated header and re-run fork choice.
    pub fn add_header(&mut self, mut header: Header) -> Result<()> {
        let hash = header.hash();
        if let Some(existing) = self.tx.load_header(&hash)? {
            if existing.is_connected() || self.tx.is_parked(&existing.parent_hash(), &hash) {
                debug!(%hash, "Header already known");
                return Ok(());
            }
            debug!(%hash, "Readmitting pruned header");
        }

        let parent = match self.tx.load_header(&header.parent_hash())? {
            Some(parent) if parent.effective_state() != HeaderStatus::Disconnected => parent,
            _ => {
                debug!(%hash, parent = %header.parent_hash(), "Parent unknown, parking header");
                header.mark_disconnected(self.tx.best().height);
                self.tx.add_disconnected(header.parent_hash(), hash);
                self.tx.stage(header);
                return Ok(());
            }
        };

        self.connect_to_parent(&parent, &mut header)?;
        self.tx.remove_sibling(&parent.hash());
        let position = header.position();
        self.tx.stage(header);

        let mut candidates = vec![Candidate::new(self.branch_to(position, Height::MAX)?)];
        self.connect_children(&mut candidates, 0)?;
        self.choose_candidate(&candidates, None)
    }

    /// Drop stale siblings and parked headers below `window` of the best tip.
    pub fn prune(&mut self, window: Height) -> Result<()> {
        self.tx.prune(window)
    }

    /// Install a checkpoint and revalidate every branch that reaches it.
    pub fn add_checkpoint(&mut self, checkpoint: Position) -> Result<()> {
        let existing = self.tx.checkpoint();
        if !existing.is_blank() {
            return Err(HeaderChainError::CheckpointExists { existing });
        }
        if checkpoint.height < MIN_CHECKPOINT_HEIGHT {
            return Err(HeaderChainError::CheckpointTooLow {
                height: checkpoint.height,
                min: MIN_CHECKPOINT_HEIGHT,
            });
        }

        info!(%checkpoint, "Adding checkpoint");
        self.tx.set_checkpoint(checkpoint);
        self.apply_checkpoint(checkpoint.height)
    }

    /// Remove the checkpoint and lift any bans it caused.
    pub fn delete_checkpoint(&mut self) -> Result<()> {
        let existing = self.tx.checkpoint();
        if existing.is_blank() {
            return Err(HeaderChainError::NoCheckpoint);
        }

        info!(checkpoint = %existing, "Deleting checkpoint");
        self.tx.set_checkpoint(Position::blank());
        self.apply_checkpoint(existing.height)
    }

    fn connect_to_parent(&self, parent: &Header, child: &mut Header) -> Result<()> {
        child.inherit_height(parent)?;
        child.inherit_work(parent)?;
        child.inherit_state(parent)?;
        child.compare_to_checkpoint(&self.tx.checkpoint());
        Ok(())
    }

    /// Positions from `tip` down to, but excluding, the first best chain block
    /// at or below `floor`. Ascending order.
    fn branch_to(&self, tip: Position, floor: Height) -> Result<Vec<Position>> {
        let mut chain = Vec::new();
        let mut cursor = tip;
        loop {
            if cursor.height <= floor && self.tx.is_in_best_chain(&cursor)? {
                break;
            }
            let header = self.tx.require_header(&cursor.hash)?;
            if header.is_genesis() {
                panic!("Branch {tip} reached genesis {cursor} without meeting the best chain");
            }
            chain.push(cursor);
            cursor = header.parent_position();
        }
        chain.reverse();
        Ok(chain)
    }

    /// Reattach headers that were waiting on the tip of `candidates[index]`.
    ///
    /// The first child of each header extends its candidate in place; every
    /// further child forks a new candidate from the shared prefix.
    fn connect_children(&mut self, candidates: &mut Vec<Candidate>, index: usize) -> Result<()> {
        let Some(root) = candidates[index].tip() else {
            return Ok(());
        };

        let mut pending: Vec<(BlockHash, usize, usize)> =
            vec![(root.hash, index, candidates[index].len())];
        while let Some((parent_hash, index, prefix_len)) = pending.pop() {
            let children = self.tx.take_disconnected(&parent_hash);
            if children.is_empty() {
                continue;
            }

            let parent = self.tx.require_header(&parent_hash)?;
            let prefix = candidates[index].prefix(prefix_len);
            for (n, child_hash) in children.into_iter().enumerate() {
                let Some(mut child) = self.tx.load_header(&child_hash)? else {
                    warn!(%child_hash, parent = %parent_hash, "Disconnected child missing from storage");
                    continue;
                };
                self.connect_to_parent(&parent, &mut child)?;
                let position = child.position();
                self.tx.stage(child);

                let target = if n == 0 {
                    index
                } else {
                    candidates.push(prefix.clone());
                    candidates.len() - 1
                };
                candidates[target].push(position);
                pending.push((child_hash, target, candidates[target].len()));
            }
            debug!(parent = %parent_hash, "Reconnected disconnected children");
        }
        Ok(())
    }

    /// Re-derive every header on a candidate from its parent.
    fn replay(&mut self, candidate: &Candidate) -> Result<()> {
        for position in candidate.chain() {
            let mut header = self.tx.require_header(&position.hash)?;
            let parent = self.tx.require_header(&header.parent_hash())?;
            self.connect_to_parent(&parent, &mut header)?;
            self.tx.stage(header);
        }
        Ok(())
    }

    /// Switch to the most-work selectable candidate, if it beats the incumbent.
    ///
    /// A banned incumbent is measured as `fallback` instead, so the chain
    /// falls back to that ancestor when nothing else survives.
    fn choose_candidate(&mut self, candidates: &[Candidate], fallback: Option<Position>) -> Result<()> {
        let current = self.tx.best();
        let incumbent = self.tx.require_header(&current.hash)?;
        let (mut winner, mut winner_work) = match fallback {
            Some(fallback) if !incumbent.effective_state().is_selectable() => {
                let header = self.tx.require_header(&fallback.hash)?;
                (fallback, header.work())
            }
            _ => (current, incumbent.work()),
        };
        let mut winning_chain: Option<Candidate> = None;

        for candidate in candidates.iter().filter(|c| !c.is_blacklisted()) {
            let usable = self.selectable_prefix(candidate)?;
            let Some(tip) = usable.tip() else {
                continue;
            };
            let work = self.tx.require_header(&tip.hash)?.work();
            if work > winner_work {
                winner = tip;
                winner_work = work;
                winning_chain = Some(usable);
            }
        }

        if winner != current {
            match &winning_chain {
                Some(candidate) => self.tx.set_best_chain(candidate.chain())?,
                None => self.tx.set_best_chain(&[winner])?,
            }
            info!(previous = %current, best = %winner, work = %winner_work, "New best chain");
        }

        for tip in candidates.iter().filter_map(Candidate::tip) {
            if !self.tx.is_in_best_chain(&tip)? {
                self.tx.add_sibling(tip.hash);
            }
        }
        Ok(())
    }

    /// The part of `candidate` below its first unselectable header.
    fn selectable_prefix(&self, candidate: &Candidate) -> Result<Candidate> {
        if let Some(tip) = candidate.tip() {
            if self.tx.require_header(&tip.hash)?.effective_state().is_selectable() {
                return Ok(candidate.clone());
            }
        }
        for (index, position) in candidate.chain().iter().enumerate() {
            if !self.tx.require_header(&position.hash)?.effective_state().is_selectable() {
                return Ok(candidate.prefix(index));
            }
        }
        Ok(candidate.clone())
    }

    /// Replay every branch reaching `replay_height` against the staged checkpoint.
    fn apply_checkpoint(&mut self, replay_height: Height) -> Result<()> {
        let checkpoint = self.tx.checkpoint();
        let best = self.tx.best();

        let mut tips = Vec::new();
        for hash in self.tx.siblings().clone() {
            match self.tx.load_header(&hash)? {
                Some(header) if header.is_connected() => tips.push(header.position()),
                _ => warn!(%hash, "Sibling tip missing or disconnected"),
            }
        }

        let highest = tips.iter().map(|p| p.height).max().unwrap_or(-1).max(best.height);
        if replay_height > highest {
            debug!(replay_height, highest, "Checkpoint above every branch, deferring");
            return Ok(());
        }

        let ancestor_height = (replay_height - 1).min(best.height);
        let ancestor_hash = self
            .tx
            .best_hash(ancestor_height)?
            .ok_or(HeaderChainError::HeightNotFound {
                height: ancestor_height,
            })?;
        let ancestor = Position::new(ancestor_height, ancestor_hash);

        tips.push(best);
        let mut candidates = Vec::with_capacity(tips.len());
        for tip in tips {
            let mut candidate = Candidate::new(self.branch_to(tip, ancestor.height)?);
            self.replay(&candidate)?;
            if candidate.conflicts_with(&checkpoint) {
                debug!(%tip, %checkpoint, "Branch conflicts with checkpoint");
                candidate.blacklist();
            }
            candidates.push(candidate);
        }

        self.choose_candidate(&candidates, Some(ancestor))
    }
}
