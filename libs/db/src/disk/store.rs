//! Shared RocksDB handle for one logical database.
//!
//! A [`DiskStore`] owns at most one open RocksDB instance. The connector and
//! every big map it hands out hold an `Arc<DiskStore>`, so closing the
//! connector or dropping the database invalidates the maps too: the instance
//! is taken out of the store and later map operations fail instead of
//! touching a deleted directory.
//!
//! Record access is tagged with the generation a map was opened under.
//! `destroy()` bumps the generation, so maps from a dropped database stay
//! closed even after a later write recreates it.
//!
//! ```text
//!            open_or_create / open_existing
//!   Pending ────────────────────────────────► Open(DB)
//!      ▲                                          │
//!      └────────────── destroy() ◄────────────────┤
//!                                                 │ close()
//!   Closed ◄──────────────────────────────────────┘
//! ```
//!
//! Column families:
//! - `snapshot`: the single whole-object snapshot of the database
//! - `map/<name>`: one per big map

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use rocksdb::{Cache, ColumnFamilyDescriptor, Direction, FlushOptions, IteratorMode, DB};

use super::options::StoreOptions;
use crate::config::DiskConfig;
use crate::error;

pub const SNAPSHOT_CF: &str = "snapshot";
pub const SNAPSHOT_KEY: &[u8] = b"snapshot";
pub const MAP_CF_PREFIX: &str = "map/";

/// Records handed to a visitor per iterator pass.
const SCAN_BATCH: usize = 1024;

/// Column family name of a big map.
pub fn map_cf_name(map_name: &str) -> String {
    format!("{}{}", MAP_CF_PREFIX, map_name)
}

enum StoreState {
    Pending,
    Open(DB),
    Closed,
}

pub struct DiskStore {
    label: String,
    path: PathBuf,
    transacted: bool,
    block_cache: Option<Cache>,
    state: RwLock<StoreState>,
    /// Bumped under the write lock each time the database is dropped.
    generation: AtomicU64,
}

impl DiskStore {
    /// Describe a store; nothing is opened or created until first use.
    pub fn new(label: impl Into<String>, path: PathBuf, config: &DiskConfig) -> Self {
        Self {
            label: label.into(),
            path,
            transacted: config.transacted,
            block_cache: StoreOptions::block_cache(config),
            state: RwLock::new(StoreState::Pending),
            generation: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the database directory exists on disk.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.read_state(), StoreState::Closed)
    }

    // =========================================================================
    // Access
    // =========================================================================

    /// Run `f` against the database, creating it on disk if needed.
    pub fn with_db_mut<R>(&self, f: impl FnOnce(&mut DB) -> Result<R>) -> Result<R> {
        let mut state = self.write_state();
        if matches!(*state, StoreState::Pending) {
            let db = self.open(true)?;
            *state = StoreState::Open(db);
        }
        match &mut *state {
            StoreState::Open(db) => f(db),
            StoreState::Closed | StoreState::Pending => Err(error::closed(&self.label)),
        }
    }

    /// Run `f` against the database if it exists, without creating anything.
    pub fn with_existing_db<R>(&self, f: impl FnOnce(&DB) -> Result<R>) -> Result<Option<R>> {
        {
            let state = self.read_state();
            match &*state {
                StoreState::Open(db) => return f(db).map(Some),
                StoreState::Closed => return Err(error::closed(&self.label)),
                StoreState::Pending => {}
            }
        }

        if !self.exists() {
            return Ok(None);
        }
        let mut state = self.write_state();
        if matches!(*state, StoreState::Pending) {
            let db = self.open(false)?;
            *state = StoreState::Open(db);
        }
        match &*state {
            StoreState::Open(db) => f(db).map(Some),
            StoreState::Closed | StoreState::Pending => Err(error::closed(&self.label)),
        }
    }

    /// Run `f` against the database only if it is open under `generation`.
    ///
    /// Big map operations go through here: a map never reopens or recreates
    /// a store that was closed or dropped under it.
    pub fn with_open_db<R>(&self, generation: u64, f: impl FnOnce(&DB) -> Result<R>) -> Result<R> {
        let state = self.read_state();
        match &*state {
            StoreState::Open(db) if self.is_current(generation) => f(db),
            // A dropped database invalidates its maps like a close does.
            _ => Err(error::closed(&self.label)),
        }
    }

    /// Fail unless the store is open under `generation`.
    pub fn ensure_open(&self, generation: u64) -> Result<()> {
        self.with_open_db(generation, |_| Ok(()))
    }

    /// Current generation; maps opened now must present it on every access.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    // =========================================================================
    // Records
    // =========================================================================

    pub fn get(&self, generation: u64, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_open_db(generation, |db| {
            let cf = cf_handle(db, cf_name)?;
            db.get_cf(cf, key)
                .map_err(|e| error::io_failure("get", cf_name, e))
        })
    }

    pub fn put(&self, generation: u64, cf_name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let write_opts = StoreOptions::write(self.transacted);
        self.with_open_db(generation, |db| {
            let cf = cf_handle(db, cf_name)?;
            db.put_cf_opt(cf, key, value, &write_opts)
                .map_err(|e| error::io_failure("put", cf_name, e))
        })
    }

    pub fn delete(&self, generation: u64, cf_name: &str, key: &[u8]) -> Result<()> {
        let write_opts = StoreOptions::write(self.transacted);
        self.with_open_db(generation, |db| {
            let cf = cf_handle(db, cf_name)?;
            db.delete_cf_opt(cf, key, &write_opts)
                .map_err(|e| error::io_failure("delete", cf_name, e))
        })
    }

    /// Visit every record of a column family in key order.
    ///
    /// Records are read in batches and the visitor runs with no lock held, so
    /// it may open, clear or drop other maps of the same database. Records
    /// written during the scan are seen only if they sort after the current
    /// batch.
    pub fn for_each(
        &self,
        generation: u64,
        cf_name: &str,
        mut visitor: impl FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        let mut resume: Option<Vec<u8>> = None;
        loop {
            let batch = self.read_batch(generation, cf_name, resume.as_deref())?;
            let done = batch.len() < SCAN_BATCH;
            for (key, value) in &batch {
                visitor(key, value)?;
            }
            match batch.into_iter().last() {
                Some((key, _)) if !done => resume = Some(key),
                _ => return Ok(()),
            }
        }
    }

    /// Up to `SCAN_BATCH` records strictly after `after`.
    fn read_batch(
        &self,
        generation: u64,
        cf_name: &str,
        after: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.with_open_db(generation, |db| {
            let cf = cf_handle(db, cf_name)?;
            let mode = match after {
                Some(key) => IteratorMode::From(key, Direction::Forward),
                None => IteratorMode::Start,
            };
            let mut batch = Vec::with_capacity(SCAN_BATCH);
            for item in db.iterator_cf(cf, mode) {
                let (key, value) = item.map_err(|e| error::io_failure("iterate", cf_name, e))?;
                if after == Some(&key[..]) {
                    continue;
                }
                batch.push((key.into_vec(), value.into_vec()));
                if batch.len() == SCAN_BATCH {
                    break;
                }
            }
            Ok(batch)
        })
    }

    pub fn count(&self, generation: u64, cf_name: &str) -> Result<usize> {
        let mut count = 0;
        self.for_each(generation, cf_name, |_, _| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    // =========================================================================
    // Column families
    // =========================================================================

    /// Create a column family unless it already exists. Returns the
    /// generation a map over it must present.
    pub fn ensure_cf(&self, cf_name: &str) -> Result<u64> {
        let cf_options = StoreOptions::column_family(self.block_cache.as_ref());
        self.with_db_mut(|db| {
            if db.cf_handle(cf_name).is_none() {
                db.create_cf(cf_name, &cf_options)
                    .map_err(|e| error::io_failure("create column family", cf_name, e))?;
                tracing::debug!(
                    database = %self.label,
                    cf = cf_name,
                    "[DiskStore] Created column family"
                );
            }
            Ok(self.generation())
        })
    }

    /// Drop a column family and its files. Missing families are ignored.
    pub fn drop_cf(&self, generation: u64, cf_name: &str) -> Result<()> {
        let mut state = self.write_state();
        let current = self.is_current(generation);
        match &mut *state {
            StoreState::Closed => Err(error::closed(&self.label)),
            // Database already dropped: nothing left to reclaim.
            _ if !current => Ok(()),
            StoreState::Open(db) => {
                if db.cf_handle(cf_name).is_some() {
                    db.drop_cf(cf_name)
                        .map_err(|e| error::io_failure("drop column family", cf_name, e))?;
                }
                Ok(())
            }
            StoreState::Pending => Ok(()),
        }
    }

    /// Empty a column family by dropping and recreating it, which releases
    /// its files instead of writing a tombstone per record.
    pub fn reset_cf(&self, generation: u64, cf_name: &str) -> Result<()> {
        let cf_options = StoreOptions::column_family(self.block_cache.as_ref());
        let mut state = self.write_state();
        let current = self.is_current(generation);
        match &mut *state {
            StoreState::Open(db) if current => {
                if db.cf_handle(cf_name).is_some() {
                    db.drop_cf(cf_name)
                        .map_err(|e| error::io_failure("drop column family", cf_name, e))?;
                }
                db.create_cf(cf_name, &cf_options)
                    .map_err(|e| error::io_failure("create column family", cf_name, e))
            }
            _ => Err(error::closed(&self.label)),
        }
    }

    // =========================================================================
    // Snapshot
    // =========================================================================

    /// Publish the snapshot: flush map data, then one synced put.
    pub fn put_snapshot(&self, bytes: &[u8]) -> Result<()> {
        let transacted = self.transacted;
        self.with_db_mut(|db| {
            if !transacted {
                // Map writes skipped the WAL; make them durable before the
                // snapshot that describes them.
                self.flush_all(db)?;
            }
            let cf = cf_handle(db, SNAPSHOT_CF)?;
            db.put_cf_opt(cf, SNAPSHOT_KEY, bytes, &StoreOptions::snapshot_write())
                .map_err(|e| error::io_failure("save snapshot", self.path.display(), e))
        })
    }

    /// Read the snapshot; `None` if the database or the snapshot does not exist.
    pub fn get_snapshot(&self) -> Result<Option<Vec<u8>>> {
        let found = self.with_existing_db(|db| match db.cf_handle(SNAPSHOT_CF) {
            Some(cf) => db
                .get_cf(cf, SNAPSHOT_KEY)
                .map_err(|e| error::io_failure("load snapshot", self.path.display(), e)),
            None => Ok(None),
        })?;
        Ok(found.flatten())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Close the instance, flushing unlogged writes. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut state = self.write_state();
        let previous = std::mem::replace(&mut *state, StoreState::Closed);
        if let StoreState::Open(db) = previous {
            if !self.transacted {
                self.flush_all(&db)?;
            }
            drop(db);
            tracing::info!(
                database = %self.label,
                path = ?self.path,
                "[DiskStore] Closed"
            );
        }
        Ok(())
    }

    /// Close the instance if open and delete the database from disk.
    /// The store returns to `Pending` and can be recreated by a later write.
    pub fn destroy(&self) -> Result<()> {
        let mut state = self.write_state();
        if matches!(*state, StoreState::Closed) {
            return Err(error::closed(&self.label));
        }
        // Dropping the DB releases its lock file before the directory goes.
        *state = StoreState::Pending;
        self.generation.fetch_add(1, Ordering::SeqCst);

        if self.exists() {
            DB::destroy(&StoreOptions::database(false), &self.path)
                .map_err(|e| error::io_failure("drop database", self.path.display(), e))?;
            if self.path.exists() {
                std::fs::remove_dir_all(&self.path)
                    .map_err(|e| error::io_failure("drop database", self.path.display(), e))?;
            }
            tracing::info!(
                database = %self.label,
                path = ?self.path,
                "[DiskStore] Dropped database"
            );
        }
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn open(&self, create: bool) -> Result<DB> {
        // Validate path
        if self.path.is_file() {
            return Err(error::io_failure(
                "open",
                self.path.display(),
                "path is a file",
            ));
        }

        if create {
            std::fs::create_dir_all(&self.path)
                .map_err(|e| error::io_failure("create", self.path.display(), e))?;
        }

        let db_options = StoreOptions::database(create);
        let mut cf_names = if self.path.join("CURRENT").exists() {
            DB::list_cf(&db_options, &self.path)
                .map_err(|e| error::io_failure("list column families", self.path.display(), e))?
        } else {
            Vec::new()
        };
        for required in [rocksdb::DEFAULT_COLUMN_FAMILY_NAME, SNAPSHOT_CF] {
            if !cf_names.iter().any(|name| name == required) {
                cf_names.push(required.to_string());
            }
        }

        let descriptors: Vec<ColumnFamilyDescriptor> = cf_names
            .iter()
            .map(|name| {
                ColumnFamilyDescriptor::new(
                    name,
                    StoreOptions::column_family(self.block_cache.as_ref()),
                )
            })
            .collect();

        tracing::info!(
            database = %self.label,
            path = ?self.path,
            cf_count = descriptors.len(),
            create,
            "[DiskStore] Opening database"
        );

        DB::open_cf_descriptors(&db_options, &self.path, descriptors)
            .map_err(|e| error::io_failure("open", self.path.display(), e))
    }

    /// Flush the memtables of every column family to SST files.
    fn flush_all(&self, db: &DB) -> Result<()> {
        let cf_names = DB::list_cf(&StoreOptions::database(false), &self.path)
            .map_err(|e| error::io_failure("list column families", self.path.display(), e))?;
        let cfs: Vec<&rocksdb::ColumnFamily> = cf_names
            .iter()
            .filter_map(|name| db.cf_handle(name))
            .collect();
        db.flush_cfs_opt(&cfs, &FlushOptions::default())
            .map_err(|e| error::io_failure("flush", self.path.display(), e))
    }

    fn read_state(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for DiskStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(database = %self.label, error = %e, "[DiskStore] Close on drop failed");
        }
    }
}

fn cf_handle<'a>(db: &'a DB, cf_name: &str) -> Result<&'a rocksdb::ColumnFamily> {
    db.cf_handle(cf_name)
        .ok_or_else(|| error::io_failure("lookup", cf_name, "column family not found"))
}
