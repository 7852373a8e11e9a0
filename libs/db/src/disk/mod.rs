//! Disk-resident backend: one RocksDB instance per logical database.
//!
//! Layout under the output folder:
//! ```text
//! <output>/<database>/            RocksDB directory (created lazily)
//!     snapshot                    column family with the single snapshot
//!     map/<name>                  one column family per permanent big map
//! <output>/<database>_tmpXXXXXX/  temporary maps, deleted on close
//! ```

pub mod map;
pub mod options;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::TempDir;

use crate::big_map::{BigMap, MapKey, MapValue};
use crate::config::{database_path, DiskConfig};
use crate::connector::{decode_snapshot, encode_snapshot, DatabaseConnector};
use crate::error;
use crate::lifecycle::LifecycleGuard;

pub use map::DiskMap;
pub use options::StoreOptions;
pub use store::DiskStore;

/// Store for temporary maps, living in a scratch directory.
struct TempStore {
    dir: TempDir,
    store: Arc<DiskStore>,
}

type SharedTempStore = Arc<Mutex<Option<TempStore>>>;

pub struct DiskConnector {
    database: String,
    config: DiskConfig,
    store: Arc<DiskStore>,
    temp: SharedTempStore,
    guard: LifecycleGuard,
}

impl DiskConnector {
    pub fn new(database: &str, config: DiskConfig) -> Self {
        let path = database_path(&config.output_folder, database);
        let store = Arc::new(DiskStore::new(database, path, &config));
        let temp: SharedTempStore = Arc::new(Mutex::new(None));

        let guard = {
            let store = Arc::clone(&store);
            let temp = Arc::clone(&temp);
            LifecycleGuard::new(database, move || close_stores(&store, &temp))
        };

        tracing::info!(
            database,
            path = ?store.path(),
            cache_size = config.cache_size,
            compressed = config.compressed,
            transacted = config.transacted,
            "[DiskConnector] Opened"
        );

        Self {
            database: database.to_string(),
            config,
            store,
            temp,
            guard,
        }
    }

    pub fn config(&self) -> &DiskConfig {
        &self.config
    }

    /// Location of the RocksDB directory for this database.
    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Scratch store for temporary maps, created on first use.
    fn temp_store(&self) -> Result<Arc<DiskStore>> {
        let mut temp = self.temp.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = temp.as_ref() {
            return Ok(Arc::clone(&existing.store));
        }

        let folder = scratch_folder(&self.config.output_folder);
        std::fs::create_dir_all(&folder)
            .map_err(|e| error::io_failure("create", folder.display(), e))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}_tmp", self.database))
            .tempdir_in(&folder)
            .map_err(|e| error::io_failure("create temporary store", folder.display(), e))?;

        // Temporary data never needs to survive a crash.
        let temp_config = self.config.clone().with_transactions(false);
        let store = Arc::new(DiskStore::new(
            format!("{} (temporary)", self.database),
            dir.path().join("maps"),
            &temp_config,
        ));
        tracing::debug!(
            database = %self.database,
            dir = ?dir.path(),
            "[DiskConnector] Created temporary store"
        );

        *temp = Some(TempStore {
            dir,
            store: Arc::clone(&store),
        });
        Ok(store)
    }
}

impl DatabaseConnector for DiskConnector {
    fn database_name(&self) -> &str {
        &self.database
    }

    #[tracing::instrument(skip(self, value), fields(database = %self.database))]
    fn save<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        self.guard.ensure_not_closed()?;
        let bytes = encode_snapshot(name, value, self.config.compressed)?;
        self.store.put_snapshot(&bytes)?;
        tracing::info!(
            database = %self.database,
            name,
            bytes = bytes.len(),
            "[DiskConnector] Saved snapshot"
        );
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(database = %self.database))]
    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.guard.ensure_not_closed()?;
        match self.store.get_snapshot()? {
            Some(bytes) => decode_snapshot(name, &bytes),
            None => Ok(None),
        }
    }

    fn exists_database(&self) -> Result<bool> {
        self.guard.ensure_not_closed()?;
        Ok(self.store.exists())
    }

    #[tracing::instrument(skip(self), fields(database = %self.database))]
    fn drop_database(&self) -> Result<()> {
        self.guard.ensure_not_closed()?;
        self.store.destroy()
    }

    fn get_big_map<K: MapKey, V: MapValue>(&self, name: &str, temporary: bool) -> Result<BigMap<K, V>> {
        self.guard.ensure_not_closed()?;
        if name.is_empty() {
            return Err(error::binding(name, "map name must not be empty"));
        }

        let store = if temporary {
            self.temp_store()?
        } else {
            Arc::clone(&self.store)
        };
        let cf_name = store::map_cf_name(name);
        let generation = store.ensure_cf(&cf_name)?;

        tracing::debug!(
            database = %self.database,
            map = name,
            temporary,
            cache_size = self.config.cache_size,
            "[DiskConnector] Opened big map"
        );
        let disk_map = DiskMap::new(
            store,
            generation,
            cf_name,
            self.config.compressed,
            self.config.cache_size,
        );
        Ok(BigMap::on_disk(name, temporary, disk_map))
    }

    fn drop_big_map<K: MapKey, V: MapValue>(&self, name: &str, map: &mut BigMap<K, V>) -> Result<()> {
        self.guard.ensure_not_closed()?;
        if map.name() != name {
            return Err(error::binding(
                name,
                format!("map is registered as '{}'", map.name()),
            ));
        }
        map.release()?;
        tracing::debug!(database = %self.database, map = name, "[DiskConnector] Dropped big map");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    fn close(&self) -> Result<()> {
        self.guard.close()
    }
}

impl std::fmt::Debug for DiskConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskConnector")
            .field("database", &self.database)
            .field("path", &self.store.path())
            .field("closed", &self.guard.is_closed())
            .finish()
    }
}

/// Close the database store, then close and delete the temporary store.
/// Both are attempted even if the first fails.
fn close_stores(store: &DiskStore, temp: &Mutex<Option<TempStore>>) -> Result<()> {
    let closed = store.close();

    let scratch = temp.lock().unwrap_or_else(|e| e.into_inner()).take();
    let scratch_closed = match scratch {
        Some(TempStore { dir, store }) => {
            let path = dir.path().to_path_buf();
            store
                .close()
                .and_then(|_| {
                    dir.close()
                        .map_err(|e| error::io_failure("delete temporary store", path.display(), e))
                })
        }
        None => Ok(()),
    };

    closed?;
    scratch_closed
}

fn scratch_folder(output_folder: &Path) -> PathBuf {
    if output_folder.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        output_folder.to_path_buf()
    }
}
