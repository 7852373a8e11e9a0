//! Large key-value maps handed out by connectors.
//!
//! A [`BigMap`] is either held in process memory or backed by a column family
//! of the disk-resident store. Model parameters declare their maps as plain
//! fields; the field provisioner binds each one to a backend map.
//!
//! # Snapshot encoding
//!
//! - in-memory maps serialize their entries; decoding yields a *detached*
//!   in-memory map whose entries are poured into the backend map on rebind
//! - disk maps serialize only a reference (their contents are already
//!   durable in the store); decoding yields an unbound map that rebinding
//!   reattaches to the existing column family

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::deep_copy::DeepCopy;
use crate::disk::DiskMap;
use crate::error;

/// Requirements on big map keys.
pub trait MapKey: Serialize + DeserializeOwned + Eq + Hash + Clone + Send + 'static {}

impl<T> MapKey for T where T: Serialize + DeserializeOwned + Eq + Hash + Clone + Send + 'static {}

/// Requirements on big map values.
pub trait MapValue: Serialize + DeserializeOwned + Clone + Send + 'static {}

impl<T> MapValue for T where T: Serialize + DeserializeOwned + Clone + Send + 'static {}

enum MapStore<K: MapKey, V: MapValue> {
    /// Declared but not yet provisioned.
    Unbound,
    Memory(HashMap<K, V>),
    Disk(DiskMap<K, V>),
}

/// A named large map. Not `Clone`: copies go through [`DeepCopy`].
pub struct BigMap<K: MapKey, V: MapValue> {
    name: String,
    temporary: bool,
    /// Whether the map belongs to a connector. Decoded and deep-copied
    /// in-memory maps are detached.
    bound: bool,
    store: MapStore<K, V>,
}

impl<K: MapKey, V: MapValue> Default for BigMap<K, V> {
    fn default() -> Self {
        Self {
            name: String::new(),
            temporary: false,
            bound: false,
            store: MapStore::Unbound,
        }
    }
}

impl<K: MapKey, V: MapValue> BigMap<K, V> {
    pub(crate) fn in_memory(name: &str, temporary: bool) -> Self {
        Self {
            name: name.to_string(),
            temporary,
            bound: true,
            store: MapStore::Memory(HashMap::new()),
        }
    }

    pub(crate) fn on_disk(name: &str, temporary: bool, map: DiskMap<K, V>) -> Self {
        Self {
            name: name.to_string(),
            temporary,
            bound: true,
            store: MapStore::Disk(map),
        }
    }

    fn detached(name: String, entries: HashMap<K, V>) -> Self {
        Self {
            name,
            temporary: false,
            bound: false,
            store: MapStore::Memory(entries),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Whether the map has been provisioned by a connector.
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Whether the entries live in the disk-resident store.
    pub fn is_disk_resident(&self) -> bool {
        matches!(self.store, MapStore::Disk(_))
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        match &self.store {
            MapStore::Unbound => Err(self.unbound()),
            MapStore::Memory(map) => Ok(map.get(key).cloned()),
            MapStore::Disk(map) => map.get(key),
        }
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        match &self.store {
            MapStore::Unbound => Err(self.unbound()),
            MapStore::Memory(map) => Ok(map.contains_key(key)),
            MapStore::Disk(map) => map.contains_key(key),
        }
    }

    /// Insert or overwrite an entry.
    ///
    /// Disk maps take `&self` internally, but the public API keeps `&mut`
    /// so both backends have the same borrowing rules.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        match &mut self.store {
            MapStore::Unbound => Err(self.unbound()),
            MapStore::Memory(map) => {
                map.insert(key, value);
                Ok(())
            }
            MapStore::Disk(map) => map.insert(key, value),
        }
    }

    pub fn remove(&mut self, key: &K) -> Result<Option<V>> {
        match &mut self.store {
            MapStore::Unbound => Err(self.unbound()),
            MapStore::Memory(map) => Ok(map.remove(key)),
            MapStore::Disk(map) => map.remove(key),
        }
    }

    pub fn len(&self) -> Result<usize> {
        match &self.store {
            MapStore::Unbound => Err(self.unbound()),
            MapStore::Memory(map) => Ok(map.len()),
            MapStore::Disk(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&mut self) -> Result<()> {
        match &mut self.store {
            MapStore::Unbound => Err(self.unbound()),
            MapStore::Memory(map) => {
                map.clear();
                Ok(())
            }
            MapStore::Disk(map) => map.clear(),
        }
    }

    /// Visit every entry. Order is unspecified for in-memory maps.
    ///
    /// The visitor may use the connector freely, including opening, clearing
    /// or dropping other maps of the same database. Disk maps are read in
    /// batches, so entries inserted into this map during the visit may or
    /// may not be seen.
    pub fn for_each(&self, mut visitor: impl FnMut(&K, &V) -> Result<()>) -> Result<()> {
        match &self.store {
            MapStore::Unbound => Err(self.unbound()),
            MapStore::Memory(map) => {
                for (key, value) in map {
                    visitor(key, value)?;
                }
                Ok(())
            }
            MapStore::Disk(map) => map.for_each(visitor),
        }
    }

    /// Collect all entries. Loads the whole map into memory.
    pub fn entries(&self) -> Result<Vec<(K, V)>> {
        let mut entries = Vec::new();
        self.for_each(|key, value| {
            entries.push((key.clone(), value.clone()));
            Ok(())
        })?;
        Ok(entries)
    }

    /// Take the entries of a detached map, leaving it unbound.
    /// Returns `None` for bound or unbound maps.
    pub(crate) fn take_detached(&mut self) -> Option<HashMap<K, V>> {
        if self.bound {
            return None;
        }
        match std::mem::replace(&mut self.store, MapStore::Unbound) {
            MapStore::Memory(entries) => Some(entries),
            other => {
                self.store = other;
                None
            }
        }
    }

    /// Clear the map and release its storage; the map becomes unbound.
    pub(crate) fn release(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.store, MapStore::Unbound) {
            MapStore::Unbound => {}
            MapStore::Memory(mut map) => map.clear(),
            MapStore::Disk(map) => map.destroy()?,
        }
        self.bound = false;
        Ok(())
    }

    fn unbound(&self) -> anyhow::Error {
        error::binding(&self.name, "map is not bound to a connector")
    }
}

impl<K: MapKey, V: MapValue> DeepCopy for BigMap<K, V> {
    /// A detached in-memory copy holding every entry.
    fn deep_copy(&self) -> Result<Self> {
        let entries = self.entries()?.into_iter().collect();
        Ok(Self::detached(self.name.clone(), entries))
    }
}

impl<K: MapKey, V: MapValue> fmt::Debug for BigMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backend = match &self.store {
            MapStore::Unbound => "unbound",
            MapStore::Memory(_) => "memory",
            MapStore::Disk(_) => "disk",
        };
        f.debug_struct("BigMap")
            .field("name", &self.name)
            .field("temporary", &self.temporary)
            .field("bound", &self.bound)
            .field("backend", &backend)
            .finish()
    }
}

// ============================================================================
// Serde
// ============================================================================

#[derive(Serialize)]
enum EncodedMap<'a, K, V> {
    Entries { name: &'a str, entries: Vec<(&'a K, &'a V)> },
    Resident { name: &'a str },
}

#[derive(Deserialize)]
enum DecodedMap<K: Eq + Hash, V> {
    Entries { name: String, entries: Vec<(K, V)> },
    Resident { name: String },
}

impl<K: MapKey, V: MapValue> Serialize for BigMap<K, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let encoded = match &self.store {
            MapStore::Unbound => {
                return Err(serde::ser::Error::custom(format!(
                    "big map '{}' is not bound",
                    self.name
                )))
            }
            MapStore::Memory(map) => EncodedMap::Entries {
                name: &self.name,
                entries: map.iter().collect(),
            },
            MapStore::Disk(_) => EncodedMap::Resident { name: &self.name },
        };
        encoded.serialize(serializer)
    }
}

impl<'de, K: MapKey, V: MapValue> Deserialize<'de> for BigMap<K, V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match DecodedMap::<K, V>::deserialize(deserializer)? {
            DecodedMap::Entries { name, entries } => {
                Self::detached(name, entries.into_iter().collect())
            }
            DecodedMap::Resident { name } => Self {
                name,
                ..Self::default()
            },
        })
    }
}
