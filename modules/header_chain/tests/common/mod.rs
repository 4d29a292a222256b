//! Shared helpers for header chain integration tests
#![allow(dead_code)]

use cairn_common::{BlockHash, Network, Position};
use cairn_module_header_chain::{Header, HeaderOracle, InMemoryHeaderStore, RawHeader};
use std::sync::Arc;

/// Work 2 per header
pub const EASY_BITS: u32 = 0x207fffff;

/// Work 256 per header
pub const HARD_BITS: u32 = 0x2000ffff;

pub fn genesis() -> Header {
    Header::genesis(Network::Regtest)
}

pub fn oracle() -> HeaderOracle {
    let store = Arc::new(InMemoryHeaderStore::new(Network::Regtest));
    HeaderOracle::new(store, Position::blank()).unwrap()
}

/// Grind a regtest header on `parent`. Different salts give different forks.
pub fn mine(parent: &Header, bits: u32, salt: u32) -> Header {
    let mut merkle_root = [0u8; 32];
    merkle_root[28..].copy_from_slice(&salt.to_be_bytes());
    let mut raw = RawHeader {
        version: 0x20000000,
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

pub fn mine_chain(parent: &Header, count: usize, bits: u32, salt: u32) -> Vec<Header> {
    let mut chain: Vec<Header> = Vec::with_capacity(count);
    for _ in 0..count {
        let next = mine(chain.last().unwrap_or(parent), bits, salt);
        chain.push(next);
    }
    chain
}

/// Position of `chain[index]` when `chain` sits on a parent at `base_height`.
pub fn position(chain: &[Header], base_height: i64, index: usize) -> Position {
    Position::new(base_height + 1 + index as i64, chain[index].hash())
}
