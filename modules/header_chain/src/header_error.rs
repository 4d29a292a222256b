//! Error types for header chain operations.

use cairn_common::{BlockHash, Height, Network, Position};

/// Errors returned by [`HeaderOracle`](crate::oracle::HeaderOracle) operations.
///
/// Validation and checkpoint errors leave the chain untouched. Structural
/// errors abort the transaction they occurred in, so nothing is committed.
#[derive(Debug, thiserror::Error)]
pub enum HeaderChainError {
    /// The serialised header failed parsing, difficulty or proof-of-work checks.
    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    /// The header was decoded for a different network.
    #[error("header {hash} belongs to {got}, expected {expected}")]
    WrongNetwork {
        hash: BlockHash,
        expected: Network,
        got: Network,
    },

    /// A child tried to inherit from a header that is not its parent.
    #[error("parent mismatch for {child}: expected {expected}, got {got}")]
    ParentMismatch {
        child: BlockHash,
        expected: BlockHash,
        got: BlockHash,
    },

    /// A header referenced by an operation is not stored.
    #[error("header not found: {hash}")]
    HeaderNotFound { hash: BlockHash },

    /// No best-chain block exists at the requested height.
    #[error("no best chain block at height {height}")]
    HeightNotFound { height: Height },

    /// A header has no connected ancestry, so it has no height.
    #[error("header {hash} is not connected to the chain")]
    NotConnected { hash: BlockHash },

    /// A checkpoint is already installed.
    #[error("checkpoint already set at {existing}")]
    CheckpointExists { existing: Position },

    /// Deletion requested with no checkpoint installed.
    #[error("no checkpoint is set")]
    NoCheckpoint,

    /// Checkpoints below this height would pin genesis or its child.
    #[error("checkpoint height {height} is below the minimum of {min}")]
    CheckpointTooLow { height: Height, min: Height },

    /// The store refused the staged update.
    #[error("failed to commit header update: {reason}")]
    CommitFailed { reason: String },

    /// Storage backend failure while reading.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type Result<T, E = HeaderChainError> = std::result::Result<T, E>;
