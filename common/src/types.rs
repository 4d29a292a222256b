//! Core type definitions for Cairn

use crate::hash::BlockHash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Block height. `-1` is reserved for the sentinel position.
pub type Height = i64;

/// Chain locator: a height and the hash of the block at that height
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    /// Block height
    pub height: Height,

    /// Block hash
    pub hash: BlockHash,
}

impl Position {
    pub const fn new(height: Height, hash: BlockHash) -> Self {
        Self { height, hash }
    }

    /// The sentinel position: height -1 with a null hash
    pub const fn blank() -> Self {
        Self {
            height: -1,
            hash: BlockHash::null(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.height < 0 && self.hash.is_null()
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::blank()
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// Height first so sorted positions read like a chain
impl Ord for Position {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.height.cmp(&other.height).then_with(|| self.hash.cmp(&other.hash))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.height, self.hash)
    }
}

/// Proof-of-work network a header belongs to
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            _ => Err(anyhow::anyhow!("Unknown network '{s}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_position_is_sentinel() {
        let blank = Position::blank();
        assert_eq!(blank.height, -1);
        assert!(blank.hash.is_null());
        assert!(blank.is_blank());
        assert_eq!(Position::default(), blank);
        assert!(!Position::new(0, BlockHash::null()).is_blank());
    }

    #[test]
    fn positions_order_by_height_first() {
        let low = Position::new(1, BlockHash::new([9u8; 32]));
        let high = Position::new(2, BlockHash::new([1u8; 32]));
        assert!(low < high);
        assert!(Position::blank() < low);
    }

    #[test]
    fn network_parses_config_names() {
        assert_eq!("regtest".parse::<Network>().unwrap(), Network::Regtest);
        assert_eq!("main".parse::<Network>().unwrap(), Network::Mainnet);
        assert!("signet".parse::<Network>().is_err());
    }
}
