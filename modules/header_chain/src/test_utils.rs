//! Regtest header mining for unit tests

use crate::header::{Header, RawHeader};
use crate::oracle::HeaderOracle;
use crate::stores::memory::InMemoryHeaderStore;
use cairn_common::{BlockHash, Network, Position};
use std::sync::Arc;

/// Work 2 per header
pub const EASY_BITS: u32 = 0x207fffff;

/// Work 256 per header
pub const HARD_BITS: u32 = 0x2000ffff;

/// Mine an unconnected regtest child of `parent`. `salt` separates forks.
pub fn mine(parent: &Header, bits: u32, salt: u32) -> Header {
    let mut merkle_root = [0u8; 32];
    merkle_root[..4].copy_from_slice(&salt.to_le_bytes());
    let mut raw = RawHeader {
        version: 4,
        parent: parent.hash(),
        merkle_root: BlockHash::new(merkle_root),
        time: parent.raw().time + 600,
        bits,
        nonce: 0,
    };
    while !raw.meets_target() {
        raw.nonce += 1;
    }
    Header::from_raw(Network::Regtest, raw).unwrap()
}

/// Mine `count` headers on top of `parent`, each extending the last.
pub fn mine_chain(parent: &Header, count: usize, bits: u32, salt: u32) -> Vec<Header> {
    let mut chain: Vec<Header> = Vec::with_capacity(count);
    for _ in 0..count {
        let next = mine(chain.last().unwrap_or(parent), bits, salt);
        chain.push(next);
    }
    chain
}

pub fn regtest_genesis() -> Header {
    Header::genesis(Network::Regtest)
}

pub fn regtest_store() -> Arc<InMemoryHeaderStore> {
    Arc::new(InMemoryHeaderStore::new(Network::Regtest))
}

pub fn regtest_oracle() -> HeaderOracle {
    HeaderOracle::new(regtest_store(), Position::blank()).unwrap()
}

/// Positions a mined chain will occupy once connected above `base_height`.
pub fn positions(chain: &[Header], base_height: i64) -> Vec<Position> {
    chain
        .iter()
        .enumerate()
        .map(|(i, h)| Position::new(base_height + 1 + i as i64, h.hash()))
        .collect()
}
