//! The process-wide flare cache: an ordered map from binary hash to flare,
//! a parallel map from binary hash to per-flare RW lock, and a single
//! `lookup_mutex` serializing structural changes to both maps.
//!
//! Readers and writers of a flare's bytes take the per-flare lock, held
//! only for the duration of that access; the `lookup_mutex` is held only
//! long enough to find or insert the entry, never across I/O.

use super::store;
use super::types::Flare;
use crate::catalog::Catalog;
use crate::error::Result;
use crate::path;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

pub struct FlareCache {
    lookup_mutex: Mutex<BTreeMap<[u8; 20], Arc<RwLock<Flare>>>>,
}

impl Default for FlareCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FlareCache {
    pub fn new() -> FlareCache {
        FlareCache { lookup_mutex: Mutex::new(BTreeMap::new()) }
    }

    pub fn len(&self) -> usize {
        self.lookup_mutex.lock().expect("lookup_mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up an already-cached flare by its binary hash.
    pub fn get(&self, binhash: &[u8; 20]) -> Option<Arc<RwLock<Flare>>> {
        self.lookup_mutex.lock().expect("lookup_mutex poisoned").get(binhash).cloned()
    }

    pub fn remove(&self, binhash: &[u8; 20]) {
        self.lookup_mutex.lock().expect("lookup_mutex poisoned").remove(binhash);
    }

    /// `search_or_create`: simplify `path`, return the cached flare if
    /// present, otherwise construct an un-upcasted flare, load it from
    /// disk/catalog if its contents exist, insert and return it. Never
    /// fails on a simplifiable path.
    pub fn search_or_create(
        &self,
        raw_path: &str,
        hashpath: &Path,
        catalog: &Catalog,
    ) -> Result<Arc<RwLock<Flare>>> {
        let simplified = path::simplify(raw_path);
        let key = crate::hash::Key::of_path(&simplified);
        let binhash = key.to_bytes();

        {
            let map = self.lookup_mutex.lock().expect("lookup_mutex poisoned");
            if let Some(existing) = map.get(&binhash) {
                return Ok(existing.clone());
            }
        }

        let mut flare = Flare::new(&simplified);
        if flare.contents_path(hashpath).exists() {
            store::load(&mut flare, hashpath, catalog)?;
        }
        let entry = Arc::new(RwLock::new(flare));

        let mut map = self.lookup_mutex.lock().expect("lookup_mutex poisoned");
        Ok(map.entry(binhash).or_insert(entry).clone())
    }

    /// Re-upcast a cached-but-not-yet-upcasted entry (the owner may insert
    /// a not-yet-existing flare before a concurrent `mknod` lands).
    pub fn load_if_stale(&self, entry: &Arc<RwLock<Flare>>, hashpath: &Path, catalog: &Catalog) -> Result<()> {
        let needs_load = { !entry.read().expect("flare lock poisoned").is_upcasted };
        if needs_load {
            let mut flare = entry.write().expect("flare lock poisoned");
            if flare.contents_path(hashpath).exists() {
                store::load(&mut flare, hashpath, catalog)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flare::types::FlareType;

    #[test]
    fn search_or_create_never_returns_twice_for_the_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::in_memory().unwrap();
        let cache = FlareCache::new();
        let a = cache.search_or_create("/same", dir.path(), &catalog).unwrap();
        let b = cache.search_or_create("/./same", dir.path(), &catalog).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn search_or_create_loads_existing_contents() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::in_memory().unwrap();
        let mut flare = Flare::new("/f");
        flare.ty = FlareType::Regular;
        flare.stat.mode = 0o100644;
        store::save(&mut flare, dir.path(), &catalog, true).unwrap();

        let cache = FlareCache::new();
        let found = cache.search_or_create("/f", dir.path(), &catalog).unwrap();
        assert!(found.read().unwrap().is_upcasted);
        assert_eq!(found.read().unwrap().ty, FlareType::Regular);
    }
}
