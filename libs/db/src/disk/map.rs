//! Big map storage over one column family, with a hot-entry LRU cache.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use lru::LruCache;

use super::store::DiskStore;
use crate::big_map::{MapKey, MapValue};
use crate::codec;

pub struct DiskMap<K: MapKey, V: MapValue> {
    store: Arc<DiskStore>,
    /// Store generation the column family was opened under.
    generation: u64,
    cf_name: String,
    compressed: bool,
    /// Decoded entries kept hot. `None` when the cache size is 0.
    cache: Option<Mutex<LruCache<K, V>>>,
}

impl<K: MapKey, V: MapValue> DiskMap<K, V> {
    pub fn new(
        store: Arc<DiskStore>,
        generation: u64,
        cf_name: String,
        compressed: bool,
        cache_size: usize,
    ) -> Self {
        let cache = NonZeroUsize::new(cache_size).map(|cap| Mutex::new(LruCache::new(cap)));
        Self {
            store,
            generation,
            cf_name,
            compressed,
            cache,
        }
    }

    pub fn cf_name(&self) -> &str {
        &self.cf_name
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        // Checked first so a cache hit never outlives a closed store.
        self.store.ensure_open(self.generation)?;
        if let Some(mut cache) = self.cache() {
            if let Some(value) = cache.get(key) {
                return Ok(Some(value.clone()));
            }
        }

        let key_bytes = codec::key_to_bytes(key)?;
        let value = match self.store.get(self.generation, &self.cf_name, &key_bytes)? {
            Some(bytes) => codec::from_bytes::<V>(&bytes)
                .with_context(|| format!("Corrupt value in {}", self.cf_name))?,
            None => return Ok(None),
        };
        if let Some(mut cache) = self.cache() {
            cache.put(key.clone(), value.clone());
        }
        Ok(Some(value))
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        self.store.ensure_open(self.generation)?;
        if let Some(mut cache) = self.cache() {
            if cache.contains(key) {
                return Ok(true);
            }
        }
        let key_bytes = codec::key_to_bytes(key)?;
        Ok(self.store.get(self.generation, &self.cf_name, &key_bytes)?.is_some())
    }

    pub fn insert(&self, key: K, value: V) -> Result<()> {
        let key_bytes = codec::key_to_bytes(&key)?;
        let value_bytes = codec::to_bytes(&value, self.compressed)?;
        self.store.put(self.generation, &self.cf_name, &key_bytes, &value_bytes)?;
        if let Some(mut cache) = self.cache() {
            cache.put(key, value);
        }
        Ok(())
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let previous = self.get(key)?;
        if previous.is_some() {
            let key_bytes = codec::key_to_bytes(key)?;
            self.store.delete(self.generation, &self.cf_name, &key_bytes)?;
        }
        if let Some(mut cache) = self.cache() {
            cache.pop(key);
        }
        Ok(previous)
    }

    pub fn len(&self) -> Result<usize> {
        self.store.count(self.generation, &self.cf_name)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.reset_cf(self.generation, &self.cf_name)?;
        if let Some(mut cache) = self.cache() {
            cache.clear();
        }
        Ok(())
    }

    /// Visit every entry in key-byte order. No store lock is held while the
    /// visitor runs.
    pub fn for_each(&self, mut visitor: impl FnMut(&K, &V) -> Result<()>) -> Result<()> {
        self.store.for_each(self.generation, &self.cf_name, |key_bytes, value_bytes| {
            let key: K = codec::key_from_bytes(key_bytes)?;
            let value: V = codec::from_bytes(value_bytes)
                .with_context(|| format!("Corrupt value in {}", self.cf_name))?;
            visitor(&key, &value)
        })
    }

    /// Drop the column family, reclaiming its storage.
    pub fn destroy(&self) -> Result<()> {
        if let Some(mut cache) = self.cache() {
            cache.clear();
        }
        self.store.drop_cf(self.generation, &self.cf_name)
    }

    fn cache(&self) -> Option<MutexGuard<'_, LruCache<K, V>>> {
        self.cache
            .as_ref()
            .map(|cache| cache.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskConfig;
    use crate::disk::store::map_cf_name;
    use tempfile::TempDir;

    fn disk_map(temp_dir: &TempDir, cache_size: usize) -> (Arc<DiskStore>, DiskMap<String, u64>) {
        let config = DiskConfig::new(temp_dir.path()).with_cache_size(cache_size);
        let store = Arc::new(DiskStore::new("map_test", temp_dir.path().join("db"), &config));
        let cf = map_cf_name("counts");
        let generation = store.ensure_cf(&cf).unwrap();
        let map = DiskMap::new(Arc::clone(&store), generation, cf, config.compressed, cache_size);
        (store, map)
    }

    #[test]
    fn test_insert_get_remove() {
        for cache_size in [0, 2] {
            let temp_dir = TempDir::new().unwrap();
            let (_store, map) = disk_map(&temp_dir, cache_size);

            map.insert("a".into(), 1).unwrap();
            map.insert("b".into(), 2).unwrap();
            map.insert("c".into(), 3).unwrap();
            map.insert("a".into(), 10).unwrap();

            assert_eq!(map.get(&"a".into()).unwrap(), Some(10));
            assert!(map.contains_key(&"b".into()).unwrap());
            assert_eq!(map.len().unwrap(), 3);

            assert_eq!(map.remove(&"b".into()).unwrap(), Some(2));
            assert_eq!(map.remove(&"b".into()).unwrap(), None);
            assert_eq!(map.get(&"b".into()).unwrap(), None);
            assert_eq!(map.len().unwrap(), 2);
        }
    }

    #[test]
    fn test_for_each_visits_all_entries() {
        let temp_dir = TempDir::new().unwrap();
        let (_store, map) = disk_map(&temp_dir, 16);
        for i in 0..50u64 {
            map.insert(format!("k{}", i), i).unwrap();
        }
        let mut total = 0;
        map.for_each(|_, v| {
            total += *v;
            Ok(())
        })
        .unwrap();
        assert_eq!(total, (0..50).sum::<u64>());
    }

    #[test]
    fn test_clear_empties_map_and_cache() {
        let temp_dir = TempDir::new().unwrap();
        let (_store, map) = disk_map(&temp_dir, 16);
        map.insert("x".into(), 1).unwrap();
        map.clear().unwrap();
        assert_eq!(map.get(&"x".into()).unwrap(), None);
        assert_eq!(map.len().unwrap(), 0);
        // Still usable after clearing.
        map.insert("y".into(), 2).unwrap();
        assert_eq!(map.get(&"y".into()).unwrap(), Some(2));
    }

    #[test]
    fn test_cached_entry_not_served_after_close() {
        let temp_dir = TempDir::new().unwrap();
        let (store, map) = disk_map(&temp_dir, 16);
        map.insert("hot".into(), 7).unwrap();
        store.close().unwrap();

        let err = map.get(&"hot".into()).unwrap_err();
        assert!(crate::error::StorageError::is_closed(&err));
    }
}
