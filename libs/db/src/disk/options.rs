//! RocksDB options for the disk-resident backend.
//!
//! Maps the backend tunables of [`DiskConfig`] onto RocksDB:
//! - `cache_size` (entries) sizes a shared LRU block cache; `0` disables it
//! - `transacted` selects synced WAL writes vs. WAL-less writes
//! - `compressed` is applied at the value level by the codec, so RocksDB's own
//!   block compression is turned off to avoid compressing twice

use rocksdb::{BlockBasedOptions, Cache, DBCompressionType, Options, WriteOptions};

use crate::config::DiskConfig;

/// Rough decoded size of one big map entry, used to turn an entry budget into
/// a block cache size.
pub const ESTIMATED_ENTRY_BYTES: usize = 256;

/// Smallest block cache worth creating when caching is enabled.
pub const MIN_BLOCK_CACHE_BYTES: usize = 1024 * 1024;

/// Block size for big map column families.
/// Default: 4KB. Optimal for small point-lookup records.
pub const BLOCK_SIZE: usize = 4 * 1024;

/// Default RocksDB options factory for the disk backend.
pub struct StoreOptions;

impl StoreOptions {
    /// Database-wide options.
    ///
    /// Settings:
    /// - `create_if_missing` / `create_missing_column_families`: as requested
    /// - Parallelism: uses available CPUs, capped at 4 background jobs since
    ///   one instance is opened per logical database
    /// - Write buffer: 32MB
    pub fn database(create: bool) -> Options {
        let mut options = Options::default();
        options.set_error_if_exists(false);
        options.create_if_missing(create);
        options.create_missing_column_families(create);

        let num_cpus = std::thread::available_parallelism()
            .map(|p| p.get() as i32)
            .unwrap_or(2);
        options.increase_parallelism(num_cpus);
        options.set_max_background_jobs(num_cpus.min(4));

        options.set_write_buffer_size(32 * 1024 * 1024);
        options.set_compression_type(DBCompressionType::None);

        // Optimize for point lookups (most big map operations)
        options.set_advise_random_on_open(true);

        options
    }

    /// Column family options sharing the store's block cache.
    pub fn column_family(cache: Option<&Cache>) -> Options {
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_size(BLOCK_SIZE);
        match cache {
            Some(cache) => {
                block_opts.set_block_cache(cache);
                block_opts.set_cache_index_and_filter_blocks(true);
            }
            None => block_opts.disable_cache(),
        }

        let mut options = Options::default();
        options.set_block_based_table_factory(&block_opts);
        options.set_compression_type(DBCompressionType::None);
        options
    }

    /// Write options for big map mutations.
    pub fn write(transacted: bool) -> WriteOptions {
        let mut options = WriteOptions::default();
        if transacted {
            options.set_sync(true);
        } else {
            options.disable_wal(true);
        }
        options
    }

    /// Write options for snapshots: always synced through the WAL.
    pub fn snapshot_write() -> WriteOptions {
        let mut options = WriteOptions::default();
        options.set_sync(true);
        options
    }

    /// Block cache for a store, or `None` when caching is disabled.
    pub fn block_cache(config: &DiskConfig) -> Option<Cache> {
        if config.cache_size == 0 {
            return None;
        }
        let bytes = config
            .cache_size
            .saturating_mul(ESTIMATED_ENTRY_BYTES)
            .max(MIN_BLOCK_CACHE_BYTES);
        Some(Cache::new_lru_cache(bytes))
    }
}
