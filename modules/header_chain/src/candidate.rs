//! A branch competing for the best chain.

use cairn_common::Position;

/// Consecutive positions extending from the block just above the best chain
/// up to the branch tip, in ascending height order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Candidate {
    chain: Vec<Position>,
    blacklisted: bool,
}

impl Candidate {
    pub fn new(chain: Vec<Position>) -> Self {
        Self {
            chain,
            blacklisted: false,
        }
    }

    pub fn chain(&self) -> &[Position] {
        &self.chain
    }

    pub fn tip(&self) -> Option<Position> {
        self.chain.last().copied()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn push(&mut self, position: Position) {
        self.chain.push(position);
    }

    /// The first `len` positions, for branching off a shared prefix.
    pub fn prefix(&self, len: usize) -> Candidate {
        Candidate::new(self.chain[..len.min(self.chain.len())].to_vec())
    }

    pub fn blacklist(&mut self) {
        self.blacklisted = true;
    }

    pub fn is_blacklisted(&self) -> bool {
        self.blacklisted
    }

    /// True if the branch holds a different block at the checkpoint height.
    pub fn conflicts_with(&self, checkpoint: &Position) -> bool {
        !checkpoint.is_blank()
            && self
                .chain
                .iter()
                .any(|p| p.height == checkpoint.height && p.hash != checkpoint.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_common::BlockHash;

    fn pos(height: i64, byte: u8) -> Position {
        Position::new(height, BlockHash::new([byte; 32]))
    }

    #[test]
    fn tip_is_last_position() {
        let mut candidate = Candidate::default();
        assert_eq!(candidate.tip(), None);
        candidate.push(pos(1, 1));
        candidate.push(pos(2, 2));
        assert_eq!(candidate.tip(), Some(pos(2, 2)));
        assert_eq!(candidate.prefix(1).chain(), &[pos(1, 1)]);
    }

    #[test]
    fn conflict_only_at_checkpoint_height() {
        let candidate = Candidate::new(vec![pos(1, 1), pos(2, 2), pos(3, 3)]);
        assert!(candidate.conflicts_with(&pos(2, 9)));
        assert!(!candidate.conflicts_with(&pos(2, 2)));
        assert!(!candidate.conflicts_with(&pos(7, 9)));
        assert!(!candidate.conflicts_with(&Position::blank()));
    }
}
