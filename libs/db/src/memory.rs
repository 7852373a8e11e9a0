//! In-memory backend.
//!
//! Big maps are plain hash maps in process memory. `save` writes the whole
//! snapshot to one file named after the database in the output folder; the
//! file is replaced atomically (write to a temp file in the same folder, fsync,
//! rename).

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::big_map::{BigMap, MapKey, MapValue};
use crate::config::{database_path, InMemoryConfig};
use crate::connector::{decode_snapshot, encode_snapshot, DatabaseConnector};
use crate::error;
use crate::lifecycle::LifecycleGuard;

pub struct InMemoryConnector {
    database: String,
    config: InMemoryConfig,
    path: PathBuf,
    guard: LifecycleGuard,
}

impl InMemoryConnector {
    pub fn new(database: &str, config: InMemoryConfig) -> Self {
        let path = database_path(&config.output_folder, database);
        // Nothing is held open between saves.
        let guard = LifecycleGuard::new(database, || Ok(()));
        tracing::info!(database, path = ?path, "[InMemoryConnector] Opened");
        Self {
            database: database.to_string(),
            config,
            path,
            guard,
        }
    }

    pub fn config(&self) -> &InMemoryConfig {
        &self.config
    }

    /// Location of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DatabaseConnector for InMemoryConnector {
    fn database_name(&self) -> &str {
        &self.database
    }

    #[tracing::instrument(skip(self, value), fields(database = %self.database))]
    fn save<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        self.guard.ensure_not_closed()?;
        let bytes = encode_snapshot(name, value, false)?;
        write_atomically(&self.path, &bytes)?;
        tracing::info!(
            database = %self.database,
            name,
            bytes = bytes.len(),
            "[InMemoryConnector] Saved snapshot"
        );
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(database = %self.database))]
    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.guard.ensure_not_closed()?;
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(error::io_failure("load", self.path.display(), e)),
        };
        decode_snapshot(name, &bytes)
    }

    fn exists_database(&self) -> Result<bool> {
        self.guard.ensure_not_closed()?;
        Ok(self.path.is_file())
    }

    #[tracing::instrument(skip(self), fields(database = %self.database))]
    fn drop_database(&self) -> Result<()> {
        self.guard.ensure_not_closed()?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(database = %self.database, "[InMemoryConnector] Dropped database");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(error::io_failure("drop database", self.path.display(), e)),
        }
    }

    fn get_big_map<K: MapKey, V: MapValue>(&self, name: &str, temporary: bool) -> Result<BigMap<K, V>> {
        self.guard.ensure_not_closed()?;
        if name.is_empty() {
            return Err(error::binding(name, "map name must not be empty"));
        }
        Ok(BigMap::in_memory(name, temporary))
    }

    fn drop_big_map<K: MapKey, V: MapValue>(&self, name: &str, map: &mut BigMap<K, V>) -> Result<()> {
        self.guard.ensure_not_closed()?;
        if map.name() != name {
            return Err(error::binding(
                name,
                format!("map is registered as '{}'", map.name()),
            ));
        }
        map.release()
    }

    fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    fn close(&self) -> Result<()> {
        self.guard.close()
    }
}

impl std::fmt::Debug for InMemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryConnector")
            .field("database", &self.database)
            .field("path", &self.path)
            .field("closed", &self.guard.is_closed())
            .finish()
    }
}

/// Replace `path` with `bytes` so readers see either the old or the new file.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let folder = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&folder).map_err(|e| error::io_failure("save", folder.display(), e))?;

    let mut file =
        NamedTempFile::new_in(&folder).map_err(|e| error::io_failure("save", folder.display(), e))?;
    file.write_all(bytes)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|e| error::io_failure("save", path.display(), e))?;
    file.persist(path)
        .map_err(|e| error::io_failure("save", path.display(), e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use tempfile::TempDir;

    #[test]
    fn test_save_replaces_file_atomically() {
        let temp_dir = TempDir::new().unwrap();
        let connector = InMemoryConnector::new("model", InMemoryConfig::new(temp_dir.path()));

        connector.save("KnowledgeBase", &1u32).unwrap();
        connector.save("KnowledgeBase", &2u32).unwrap();
        assert_eq!(connector.load::<u32>("KnowledgeBase").unwrap(), Some(2));

        // Only the snapshot file remains, no temp files.
        let files: Vec<_> = std::fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        assert_eq!(connector.path(), temp_dir.path().join("model"));
    }

    #[test]
    fn test_save_creates_output_folder() {
        let temp_dir = TempDir::new().unwrap();
        let folder = temp_dir.path().join("nested").join("models");
        let connector = InMemoryConnector::new("m", InMemoryConfig::new(&folder));
        connector.save("KnowledgeBase", &"x").unwrap();
        assert!(folder.join("m").is_file());
    }

    #[test]
    fn test_big_maps_are_independent() {
        let temp_dir = TempDir::new().unwrap();
        let connector = InMemoryConnector::new("maps", InMemoryConfig::new(temp_dir.path()));
        let mut a: BigMap<u32, u32> = connector.get_big_map("a", false).unwrap();
        let b: BigMap<u32, u32> = connector.get_big_map("b", true).unwrap();
        a.insert(1, 1).unwrap();
        assert!(b.is_empty().unwrap());
        assert!(b.is_temporary());

        let err = connector.get_big_map::<u32, u32>("", false).unwrap_err();
        assert!(matches!(StorageError::of(&err), Some(StorageError::Binding { .. })));
    }

    #[test]
    fn test_closed_connector_rejects_operations() {
        let temp_dir = TempDir::new().unwrap();
        let connector = InMemoryConnector::new("closed", InMemoryConfig::new(temp_dir.path()));
        connector.close().unwrap();
        connector.close().unwrap();

        assert!(connector.is_closed());
        assert!(StorageError::is_closed(&connector.save("k", &1u8).unwrap_err()));
        assert!(StorageError::is_closed(&connector.load::<u8>("k").unwrap_err()));
        assert!(StorageError::is_closed(&connector.drop_database().unwrap_err()));
        assert!(StorageError::is_closed(&connector.exists_database().unwrap_err()));
    }
}
