//! Definition of Cairn bus messages

use crate::types::*;
use crate::BlockHash;

/// Raw headers received from a peer, in the order the peer sent them
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct HeadersMessage {
    /// Serialised 80-byte headers
    pub headers: Vec<Vec<u8>>,
}

/// Reports from the peer/sync layer about what peers claim to have
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum SyncReportMessage {
    /// A peer announced its chain height
    PeerHeight(Height),

    /// A peer referenced a block we have never seen
    UnknownHash(BlockHash),
}

/// Operator checkpoint commands
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum CheckpointCommandMessage {
    /// Install a checkpoint; fails if one is already set
    Add(Position),

    /// Remove the current checkpoint
    Delete,
}

/// Published after every commit that moved the best tip
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BestChainChangedMessage {
    /// Tip before the commit
    pub previous: Position,

    /// Tip after the commit
    pub best: Position,

    /// Last common block of the old and new chains, if the old tip was abandoned
    pub reorg_parent: Option<Position>,
}

// === Global message enum ===
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()), // Just so we have a simple default

    // Generic messages, get of jail free cards
    String(String),          // Simple string
    JSON(serde_json::Value), // JSON object

    // Header chain messages
    Headers(HeadersMessage),                   // Raw headers from peers
    SyncReport(SyncReportMessage),             // Peer height / unknown hash reports
    Checkpoint(CheckpointCommandMessage),      // Operator checkpoint commands
    BestChainChanged(BestChainChangedMessage), // Best tip moved
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

// Casts from specific messages
impl From<HeadersMessage> for Message {
    fn from(msg: HeadersMessage) -> Self {
        Message::Headers(msg)
    }
}

impl From<SyncReportMessage> for Message {
    fn from(msg: SyncReportMessage) -> Self {
        Message::SyncReport(msg)
    }
}

impl From<CheckpointCommandMessage> for Message {
    fn from(msg: CheckpointCommandMessage) -> Self {
        Message::Checkpoint(msg)
    }
}

impl From<BestChainChangedMessage> for Message {
    fn from(msg: BestChainChangedMessage) -> Self {
        Message::BestChainChanged(msg)
    }
}
