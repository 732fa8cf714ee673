//! RocksDB-backed store for production.
//!
//! All operations are synchronous blocking I/O. Callers in async contexts
//! should use `spawn_blocking` if needed to avoid blocking the runtime.
//!
//! Layout: column families `headers` (height → header), `bodies`
//! (height → body), `meta` (tip, genesis hash, executed frontier, tip
//! commit) and `votes` (our own signed votes).

use crate::{validate_put, BlockStore, OwnVote, StoreError};
use concord_types::codec::{read_option, read_u32, read_u64, read_u8, write_option, write_u32,
    write_u64, write_u8};
use concord_types::{Block, BlockBody, BlockHeader, Commit, Decode, Encode, Hash, VoteType};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;

const CF_HEADERS: &str = "headers";
const CF_BODIES: &str = "bodies";
const CF_META: &str = "meta";
const CF_VOTES: &str = "votes";

const META_TIP: &[u8] = b"tip";
const META_GENESIS: &[u8] = b"genesis_hash";
const META_EXECUTED_HEIGHT: &[u8] = b"executed_height";
const META_APP_STATE_HASH: &[u8] = b"app_state_hash";
const META_LAST_COMMIT: &[u8] = b"last_commit";

/// RocksDB tuning knobs.
#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    pub max_background_jobs: i32,
    pub write_buffer_size: usize,
    /// LRU block cache size in bytes; `None` disables the cache.
    pub block_cache_size: Option<usize>,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            max_background_jobs: 4,
            write_buffer_size: 64 * 1024 * 1024,
            block_cache_size: Some(128 * 1024 * 1024),
        }
    }
}

/// RocksDB-based block store.
pub struct RocksDbStore {
    db: Arc<DB>,
}

impl RocksDbStore {
    /// Open or create a database at `path` with default tuning.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open_with_config(path, RocksDbConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: RocksDbConfig,
    ) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_background_jobs(config.max_background_jobs);
        opts.set_write_buffer_size(config.write_buffer_size);

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        if let Some(cache_size) = config.block_cache_size {
            let cache = rocksdb::Cache::new_lru_cache(cache_size);
            block_opts.set_block_cache(&cache);
        }
        opts.set_block_based_table_factory(&block_opts);

        let cf_descriptors: Vec<_> = [CF_HEADERS, CF_BODIES, CF_META, CF_VOTES]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("missing column family {name}")))
    }

    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get_cf(self.cf(cf)?, key)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn meta_u64(&self, key: &[u8]) -> Result<Option<u64>, StoreError> {
        match self.get(CF_META, key)? {
            None => Ok(None),
            Some(bytes) => {
                let mut input = bytes.as_slice();
                read_u64(&mut input)
                    .map(Some)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))
            }
        }
    }

    fn meta_hash(&self, key: &[u8]) -> Result<Option<Hash>, StoreError> {
        match self.get(CF_META, key)? {
            None => Ok(None),
            Some(bytes) => Hash::decode(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(e.to_string())),
        }
    }

    fn height_key(height: u64) -> [u8; 8] {
        height.to_be_bytes()
    }
}

impl BlockStore for RocksDbStore {
    fn ready(&self, genesis: &Block) -> Result<(), StoreError> {
        match self.meta_hash(META_GENESIS)? {
            Some(stored) if stored != genesis.hash() => Err(StoreError::GenesisMismatch {
                stored,
                configured: genesis.hash(),
            }),
            Some(_) => Ok(()),
            None => {
                let mut batch = WriteBatch::default();
                batch.put_cf(
                    self.cf(CF_HEADERS)?,
                    Self::height_key(0),
                    genesis.header.encode(),
                );
                batch.put_cf(
                    self.cf(CF_BODIES)?,
                    Self::height_key(0),
                    genesis.body.encode(),
                );
                batch.put_cf(self.cf(CF_META)?, META_GENESIS, genesis.hash().encode());
                batch.put_cf(self.cf(CF_META)?, META_TIP, 0u64.to_be_bytes());
                batch.put_cf(
                    self.cf(CF_META)?,
                    META_EXECUTED_HEIGHT,
                    0u64.to_be_bytes(),
                );
                batch.put_cf(
                    self.cf(CF_META)?,
                    META_APP_STATE_HASH,
                    genesis.header.app_state_hash.encode(),
                );
                batch.put_cf(self.cf(CF_META)?, META_LAST_COMMIT, Commit::empty().encode());
                self.db
                    .write(batch)
                    .map_err(|e| StoreError::Database(e.to_string()))?;
                tracing::info!(genesis = %genesis.hash(), "Installed genesis block");
                Ok(())
            }
        }
    }

    fn height(&self) -> u64 {
        self.meta_u64(META_TIP).ok().flatten().unwrap_or(0)
    }

    fn genesis_hash(&self) -> Result<Hash, StoreError> {
        self.meta_hash(META_GENESIS)?.ok_or(StoreError::NotReady)
    }

    fn block_of(&self, height: u64) -> Result<Block, StoreError> {
        Ok(Block {
            header: self.header_of(height)?,
            body: self.body_of(height)?,
        })
    }

    fn header_of(&self, height: u64) -> Result<BlockHeader, StoreError> {
        let bytes = self
            .get(CF_HEADERS, &Self::height_key(height))?
            .ok_or(StoreError::NotFound(height))?;
        BlockHeader::decode(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn body_of(&self, height: u64) -> Result<BlockBody, StoreError> {
        let bytes = self
            .get(CF_BODIES, &Self::height_key(height))?
            .ok_or(StoreError::NotFound(height))?;
        BlockBody::decode(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn put(&self, block: &Block, commit: &Commit) -> Result<(), StoreError> {
        if self.meta_hash(META_GENESIS)?.is_none() {
            return Err(StoreError::NotReady);
        }
        let tip = self.height();
        let parent = self.block_of(tip)?;
        validate_put(tip, &parent, block, commit)?;

        let mut batch = WriteBatch::default();
        let key = Self::height_key(block.header.height);
        batch.put_cf(self.cf(CF_HEADERS)?, key, block.header.encode());
        batch.put_cf(self.cf(CF_BODIES)?, key, block.body.encode());
        batch.put_cf(
            self.cf(CF_META)?,
            META_TIP,
            block.header.height.to_be_bytes(),
        );
        batch.put_cf(self.cf(CF_META)?, META_LAST_COMMIT, commit.encode());
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn last_commit(&self) -> Result<Commit, StoreError> {
        let bytes = self
            .get(CF_META, META_LAST_COMMIT)?
            .ok_or(StoreError::NotReady)?;
        Commit::decode(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn executed(&self) -> Result<(u64, Hash), StoreError> {
        let height = self
            .meta_u64(META_EXECUTED_HEIGHT)?
            .ok_or(StoreError::NotReady)?;
        let hash = self
            .meta_hash(META_APP_STATE_HASH)?
            .ok_or(StoreError::NotReady)?;
        Ok((height, hash))
    }

    fn set_executed(&self, height: u64, app_state_hash: Hash) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_META)?,
            META_EXECUTED_HEIGHT,
            height.to_be_bytes(),
        );
        batch.put_cf(
            self.cf(CF_META)?,
            META_APP_STATE_HASH,
            app_state_hash.encode(),
        );
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn record_own_vote(&self, vote: OwnVote) -> Result<(), StoreError> {
        let mut key = Vec::with_capacity(13);
        write_u64(&mut key, vote.height);
        write_u32(&mut key, vote.round);
        write_u8(&mut key, vote.step as u8);
        let mut value = Vec::with_capacity(33);
        write_option(&mut value, &vote.block_hash, |out, h: &Hash| {
            h.encode_into(out)
        });
        self.db
            .put_cf(self.cf(CF_VOTES)?, key, value)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn own_votes_above(&self, height: u64) -> Result<Vec<OwnVote>, StoreError> {
        let from = Self::height_key(height + 1);
        let iter = self.db.iterator_cf(
            self.cf(CF_VOTES)?,
            rocksdb::IteratorMode::From(&from, rocksdb::Direction::Forward),
        );
        let mut votes = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let mut input = key.as_ref();
            let vote_height = read_u64(&mut input).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let round = read_u32(&mut input).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let step = match read_u8(&mut input).map_err(|e| StoreError::Corrupt(e.to_string()))? {
                0 => VoteType::Prevote,
                1 => VoteType::Precommit,
                other => return Err(StoreError::Corrupt(format!("vote step tag {other}"))),
            };
            let mut value_input = value.as_ref();
            let block_hash = read_option(&mut value_input, Hash::decode_from)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            votes.push(OwnVote {
                height: vote_height,
                round,
                step,
                block_hash,
            });
        }
        Ok(votes)
    }
}
