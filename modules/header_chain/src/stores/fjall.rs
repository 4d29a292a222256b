use std::{collections::HashSet, fs, path::Path};

use anyhow::{bail, Result};
use cairn_common::{BlockHash, Height, Network, Position};
use config::Config;
use fjall::{Database, Keyspace};
use tracing::info;

use crate::header::Header;
use crate::stores::{HeaderStore, HeaderUpdate};

const DEFAULT_DATABASE_PATH: &str = "fjall-headers";
const DEFAULT_CLEAR_ON_START: bool = false;
const HEADERS_KEYSPACE: &str = "headers";
const BEST_CHAIN_KEYSPACE: &str = "best-chain";
const SIBLINGS_KEYSPACE: &str = "siblings";
const DISCONNECTED_KEYSPACE: &str = "disconnected";
const META_KEYSPACE: &str = "meta";
const BEST_KEY: &str = "best";
const CHECKPOINT_KEY: &str = "checkpoint";

/// Header store on a fjall database
pub struct FjallHeaderStore {
    network: Network,
    database: Database,
    headers: Keyspace,
    best_chain: Keyspace,
    siblings: Keyspace,
    disconnected: Keyspace,
    meta: Keyspace,
}

impl FjallHeaderStore {
    pub fn new(config: &Config, network: Network) -> Result<Self> {
        let path = config
            .get_string("database-path")
            .unwrap_or_else(|_| format!("{DEFAULT_DATABASE_PATH}-{network}"));
        let clear = config.get_bool("clear-on-start").unwrap_or(DEFAULT_CLEAR_ON_START);
        Self::open(path, network, clear)
    }

    pub fn open(path: impl AsRef<Path>, network: Network, clear: bool) -> Result<Self> {
        let path = path.as_ref();
        if clear && path.exists() {
            fs::remove_dir_all(path)?;
        }
        let database = Database::builder(path).open()?;
        let headers = database.keyspace(HEADERS_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let best_chain =
            database.keyspace(BEST_CHAIN_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let siblings = database.keyspace(SIBLINGS_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let disconnected =
            database.keyspace(DISCONNECTED_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let meta = database.keyspace(META_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;

        let store = Self {
            network,
            database,
            headers,
            best_chain,
            siblings,
            disconnected,
            meta,
        };
        store.seed_genesis()?;
        info!(path = %path.display(), best = %store.current_best()?, "Opened header store");
        Ok(store)
    }

    fn seed_genesis(&self) -> Result<()> {
        let genesis = Header::genesis(self.network);
        if self.meta.get(BEST_KEY.as_bytes())?.is_some() {
            let stored = self.best_block(0)?;
            if stored != Some(genesis.hash()) {
                bail!(
                    "Stored genesis {stored:?} does not match {} genesis {}",
                    self.network,
                    genesis.hash()
                );
            }
            return Ok(());
        }

        let mut batch = self.database.batch();
        batch.insert(&self.headers, genesis.hash().into_inner(), serde_cbor::to_vec(&genesis)?);
        batch.insert(&self.best_chain, height_key(0), genesis.hash().into_inner());
        batch.insert(&self.meta, BEST_KEY.as_bytes(), serde_cbor::to_vec(&genesis.position())?);
        batch.insert(
            &self.meta,
            CHECKPOINT_KEY.as_bytes(),
            serde_cbor::to_vec(&Position::blank())?,
        );
        batch.commit()?;
        Ok(())
    }

    fn get_position(&self, key: &str) -> Result<Position> {
        let Some(bytes) = self.meta.get(key.as_bytes())? else {
            bail!("Missing {key} entry in header store");
        };
        Ok(serde_cbor::from_slice(&bytes)?)
    }
}

impl HeaderStore for FjallHeaderStore {
    fn network(&self) -> Network {
        self.network
    }

    fn try_load_header(&self, hash: &BlockHash) -> Result<Option<Header>> {
        let Some(bytes) = self.headers.get(hash.as_ref())? else {
            return Ok(None);
        };
        Ok(Some(serde_cbor::from_slice(&bytes)?))
    }

    fn header_exists(&self, hash: &BlockHash) -> Result<bool> {
        Ok(self.headers.get(hash.as_ref())?.is_some())
    }

    fn best_block(&self, height: Height) -> Result<Option<BlockHash>> {
        if height < 0 {
            return Ok(None);
        }
        let Some(bytes) = self.best_chain.get(height_key(height))? else {
            return Ok(None);
        };
        Ok(Some(BlockHash::try_from(bytes.as_ref())?))
    }

    fn current_best(&self) -> Result<Position> {
        self.get_position(BEST_KEY)
    }

    fn current_checkpoint(&self) -> Result<Position> {
        self.get_position(CHECKPOINT_KEY)
    }

    fn sibling_hashes(&self) -> Result<HashSet<BlockHash>> {
        let mut siblings = HashSet::new();
        for entry in self.siblings.iter() {
            let (key, _) = entry.into_inner()?;
            siblings.insert(BlockHash::try_from(key.as_ref())?);
        }
        Ok(siblings)
    }

    fn disconnected_hashes(&self) -> Result<Vec<(BlockHash, BlockHash)>> {
        let mut pairs = Vec::new();
        for entry in self.disconnected.iter() {
            let (key, _) = entry.into_inner()?;
            let key: &[u8] = key.as_ref();
            if key.len() != 64 {
                bail!("Corrupt disconnected entry of {} bytes", key.len());
            }
            pairs.push((
                BlockHash::try_from(&key[..32])?,
                BlockHash::try_from(&key[32..])?,
            ));
        }
        Ok(pairs)
    }

    fn recent_hashes(&self, count: usize) -> Result<Vec<BlockHash>> {
        let mut hashes = Vec::with_capacity(count);
        for entry in self.best_chain.iter().rev().take(count) {
            let (_, value) = entry.into_inner()?;
            hashes.push(BlockHash::try_from(value.as_ref())?);
        }
        Ok(hashes)
    }

    fn apply_update(&self, update: &HeaderUpdate) -> Result<()> {
        update.validate(self)?;

        let mut batch = self.database.batch();
        for header in &update.headers {
            batch.insert(&self.headers, header.hash().into_inner(), serde_cbor::to_vec(header)?);
        }

        for entry in self.best_chain.range(height_key(update.best.height + 1)..) {
            let (key, _) = entry.into_inner()?;
            batch.remove(&self.best_chain, key);
        }
        for (height, hash) in &update.best_chain {
            batch.insert(&self.best_chain, height_key(*height), hash.into_inner());
        }
        batch.insert(&self.meta, BEST_KEY.as_bytes(), serde_cbor::to_vec(&update.best)?);

        if let Some(checkpoint) = &update.checkpoint {
            batch.insert(&self.meta, CHECKPOINT_KEY.as_bytes(), serde_cbor::to_vec(checkpoint)?);
        }

        for hash in &update.siblings_removed {
            batch.remove(&self.siblings, hash.into_inner());
        }
        for hash in &update.siblings_added {
            batch.insert(&self.siblings, hash.into_inner(), Vec::<u8>::new());
        }
        for (parent, child) in &update.disconnected_removed {
            batch.remove(&self.disconnected, pair_key(parent, child));
        }
        for (parent, child) in &update.disconnected_added {
            batch.insert(&self.disconnected, pair_key(parent, child), Vec::<u8>::new());
        }

        batch.commit()?;
        Ok(())
    }
}

fn height_key(height: Height) -> [u8; 8] {
    (height as u64).to_be_bytes()
}

fn pair_key(parent: &BlockHash, child: &BlockHash) -> [u8; 64] {
    let mut key = [0; 64];
    key[..32].copy_from_slice(parent.as_ref());
    key[32..].copy_from_slice(child.as_ref());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::tests::{exercise_store, rejects_inconsistent_update};
    use crate::test_utils::*;
    use tempfile::tempdir;

    #[test]
    fn shared_store_behaviour() {
        let dir = tempdir().unwrap();
        let store = FjallHeaderStore::open(dir.path(), Network::Regtest, false).unwrap();
        exercise_store(&store);
    }

    #[test]
    fn inconsistent_update_leaves_store_untouched() {
        let dir = tempdir().unwrap();
        let store = FjallHeaderStore::open(dir.path(), Network::Regtest, false).unwrap();
        rejects_inconsistent_update(&store);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let genesis = regtest_genesis();
        let child = mine(&genesis, EASY_BITS, 1);
        {
            let store = FjallHeaderStore::open(dir.path(), Network::Regtest, false).unwrap();
            let mut update = HeaderUpdate {
                previous_best: genesis.position(),
                best: Position::new(1, child.hash()),
                headers: vec![child.clone()],
                ..Default::default()
            };
            update.best_chain.insert(1, child.hash());
            store.apply_update(&update).unwrap();
        }

        let store = FjallHeaderStore::open(dir.path(), Network::Regtest, false).unwrap();
        assert_eq!(store.current_best().unwrap(), Position::new(1, child.hash()));
        assert!(store.header_exists(&child.hash()).unwrap());
    }

    #[test]
    fn config_selects_path_and_clear() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("headers");
        let config = Config::builder()
            .set_default("database-path", path.to_string_lossy().to_string())
            .unwrap()
            .set_default("clear-on-start", true)
            .unwrap()
            .build()
            .unwrap();

        let genesis = regtest_genesis();
        let child = mine(&genesis, EASY_BITS, 1);
        {
            let store = FjallHeaderStore::new(&config, Network::Regtest).unwrap();
            let mut update = HeaderUpdate {
                previous_best: genesis.position(),
                best: Position::new(1, child.hash()),
                headers: vec![child.clone()],
                ..Default::default()
            };
            update.best_chain.insert(1, child.hash());
            store.apply_update(&update).unwrap();
        }

        let store = FjallHeaderStore::new(&config, Network::Regtest).unwrap();
        assert_eq!(store.current_best().unwrap(), genesis.position());
        assert!(!store.header_exists(&child.hash()).unwrap());
    }

    #[test]
    fn wrong_network_is_refused() {
        let dir = tempdir().unwrap();
        drop(FjallHeaderStore::open(dir.path(), Network::Regtest, false).unwrap());
        assert!(FjallHeaderStore::open(dir.path(), Network::Mainnet, false).is_err());
    }
}
