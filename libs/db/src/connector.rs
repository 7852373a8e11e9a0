//! Backend-independent connector API.
//!
//! A connector owns the persisted state of one logical database: at most one
//! whole-object snapshot plus any number of big maps. [`Connector`] is the
//! closed set of backends handed out by [`StorageConfig::connector`].
//!
//! [`StorageConfig::connector`]: crate::config::StorageConfig::connector

use anyhow::Result;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;

use crate::big_map::{BigMap, MapKey, MapValue};
use crate::codec;
use crate::config::BackendKind;
use crate::disk::DiskConnector;
use crate::memory::InMemoryConnector;

/// Operations every backend provides.
///
/// Every method except [`is_closed`](Self::is_closed) fails with
/// `StorageError::Closed` once the connector is closed.
pub trait DatabaseConnector {
    fn database_name(&self) -> &str;

    /// Publish `value` as this database's snapshot under `name`, replacing
    /// any previous snapshot.
    fn save<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()>;

    /// Read the snapshot stored under `name`. `Ok(None)` when there is none.
    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>>;

    fn exists_database(&self) -> Result<bool>;

    /// Remove all persisted state of this database. Idempotent.
    fn drop_database(&self) -> Result<()>;

    fn get_big_map<K: MapKey, V: MapValue>(&self, name: &str, temporary: bool) -> Result<BigMap<K, V>>;

    /// Clear `map` and release its storage. `name` must be the map's own name.
    fn drop_big_map<K: MapKey, V: MapValue>(&self, name: &str, map: &mut BigMap<K, V>) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Close the connector. A second call is a no-op.
    fn close(&self) -> Result<()>;
}

/// Connector of one of the supported backends.
#[derive(Debug)]
pub enum Connector {
    InMemory(InMemoryConnector),
    DiskResident(DiskConnector),
}

impl Connector {
    pub fn kind(&self) -> BackendKind {
        match self {
            Connector::InMemory(_) => BackendKind::InMemory,
            Connector::DiskResident(_) => BackendKind::DiskResident,
        }
    }
}

impl DatabaseConnector for Connector {
    fn database_name(&self) -> &str {
        match self {
            Connector::InMemory(c) => c.database_name(),
            Connector::DiskResident(c) => c.database_name(),
        }
    }

    fn save<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        match self {
            Connector::InMemory(c) => c.save(name, value),
            Connector::DiskResident(c) => c.save(name, value),
        }
    }

    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self {
            Connector::InMemory(c) => c.load(name),
            Connector::DiskResident(c) => c.load(name),
        }
    }

    fn exists_database(&self) -> Result<bool> {
        match self {
            Connector::InMemory(c) => c.exists_database(),
            Connector::DiskResident(c) => c.exists_database(),
        }
    }

    fn drop_database(&self) -> Result<()> {
        match self {
            Connector::InMemory(c) => c.drop_database(),
            Connector::DiskResident(c) => c.drop_database(),
        }
    }

    fn get_big_map<K: MapKey, V: MapValue>(&self, name: &str, temporary: bool) -> Result<BigMap<K, V>> {
        match self {
            Connector::InMemory(c) => c.get_big_map(name, temporary),
            Connector::DiskResident(c) => c.get_big_map(name, temporary),
        }
    }

    fn drop_big_map<K: MapKey, V: MapValue>(&self, name: &str, map: &mut BigMap<K, V>) -> Result<()> {
        match self {
            Connector::InMemory(c) => c.drop_big_map(name, map),
            Connector::DiskResident(c) => c.drop_big_map(name, map),
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            Connector::InMemory(c) => c.is_closed(),
            Connector::DiskResident(c) => c.is_closed(),
        }
    }

    fn close(&self) -> Result<()> {
        match self {
            Connector::InMemory(c) => c.close(),
            Connector::DiskResident(c) => c.close(),
        }
    }
}

// ============================================================================
// Snapshot encoding
// ============================================================================

/// Encode a snapshot as the pair `(name, value)`.
pub(crate) fn encode_snapshot<T: Serialize + ?Sized>(
    name: &str,
    value: &T,
    compressed: bool,
) -> Result<Vec<u8>> {
    codec::to_bytes(&(name, value), compressed)
}

/// Decode a snapshot, or `None` if it was saved under a different name.
pub(crate) fn decode_snapshot<T: DeserializeOwned>(name: &str, bytes: &[u8]) -> Result<Option<T>> {
    let (stored_name, _): (String, IgnoredAny) = codec::from_bytes(bytes)?;
    if stored_name != name {
        tracing::debug!(
            requested = name,
            stored = %stored_name,
            "[Connector] Snapshot stored under another name"
        );
        return Ok(None);
    }
    let (_, value): (IgnoredAny, T) = codec::from_bytes(bytes)?;
    Ok(Some(value))
}
