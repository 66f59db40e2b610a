//! Configuration-keyed cache for expensive device-bound resources.
//!
//! Two-level locking: a structural `RwLock` over the key -> entry map, plus a
//! per-entry `RwLock` over that entry's resource list. The map lock is only
//! ever held for pointer bookkeeping, so constructing a resource for one key
//! never blocks callers working on a different key; the entry lock serializes
//! same-key constructors and gives at-most-one-winner semantics.
//!
//! The cache is the sole owner of every resource it builds. Callers receive
//! `Arc` clones as non-owning references; `clear()` drops the cache's strong
//! references, so callers must not rely on a resource outliving the cache.
//!
//! A failed construction leaves the entry present but empty: the key is not
//! poisoned, and a later `get_or_create` runs the factory again.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::{EmberError, Result};

/// A cache key with a coarse primary component (map slot) and secondary
/// fields compared inside the entry. Two keys with equal primaries may still
/// identify distinct resources.
pub trait CacheKey: Clone + Send + Sync + 'static {
    type Primary: Eq + Hash + Clone + Send + Sync;

    fn primary(&self) -> Self::Primary;

    /// Exact secondary match; must be structural and total.
    fn matches(&self, other: &Self) -> bool;
}

pub trait CachedResource: Send + Sync + 'static {
    /// Whether this resource currently owns the given opaque live handle
    /// (e.g. an execution stream). Used by the reverse lookup scan.
    fn owns_live_handle(&self, _handle: u64) -> bool {
        false
    }
}

struct Entry<K, R> {
    configurations: RwLock<Vec<(K, Arc<R>)>>,
}

impl<K, R> Entry<K, R> {
    fn new() -> Self {
        Self {
            configurations: RwLock::new(Vec::new()),
        }
    }
}

pub struct ResourceCache<K: CacheKey, R: CachedResource> {
    // Arc gives each entry a stable identity: callers hold on to an entry
    // after the map lock is released, and later map insertions must not move
    // it.
    map: RwLock<HashMap<K::Primary, Arc<Entry<K, R>>>>,
}

fn poisoned() -> EmberError {
    EmberError::Internal("resource cache lock poisoned".to_string())
}

impl<K: CacheKey, R: CachedResource> ResourceCache<K, R> {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Return the resource for `key`, building it with `factory` on a miss.
    ///
    /// At most one successful construction happens per distinct key, even
    /// under concurrent callers; racing callers for the same key block on the
    /// entry lock until the winner publishes. Factory errors propagate
    /// verbatim and leave the entry retryable.
    pub fn get_or_create<F>(&self, key: &K, factory: F) -> Result<Arc<R>>
    where
        F: FnOnce() -> Result<R>,
    {
        // Fast path: shared lock only.
        if let Ok(existing) = self.get(key) {
            return Ok(existing);
        }

        // Insert-or-fetch the entry under the exclusive map lock. Map
        // mutation only; never construct while holding this lock.
        let entry = {
            let mut map = self.map.write().map_err(|_| poisoned())?;
            map.entry(key.primary())
                .or_insert_with(|| Arc::new(Entry::new()))
                .clone()
        };

        // Re-scan under the entry lock: another thread may have finished
        // construction between the fast path and here.
        let mut configurations = entry.configurations.write().map_err(|_| poisoned())?;
        for (existing_key, resource) in configurations.iter() {
            if existing_key.matches(key) {
                debug!("hit in cache");
                return Ok(resource.clone());
            }
        }

        debug!("building resource");
        let resource = Arc::new(factory()?);
        configurations.push((key.clone(), resource.clone()));
        Ok(resource)
    }

    /// Read-only lookup; never constructs.
    pub fn get(&self, key: &K) -> Result<Arc<R>> {
        let entry = {
            let map = self.map.read().map_err(|_| poisoned())?;
            match map.get(&key.primary()) {
                Some(entry) => entry.clone(),
                None => {
                    return Err(EmberError::NotFound(
                        "no resource registered for key".to_string(),
                    ))
                }
            }
        };
        let configurations = entry.configurations.read().map_err(|_| poisoned())?;
        for (existing_key, resource) in configurations.iter() {
            if existing_key.matches(key) {
                debug!("hit in cache");
                return Ok(resource.clone());
            }
        }
        Err(EmberError::NotFound(
            "no resource found with a matching config".to_string(),
        ))
    }

    /// Scan all entries for the resource that owns `handle`. O(total
    /// resources); intended for reverse lookup when only the live handle is
    /// known.
    pub fn find_by_live_handle(&self, handle: u64) -> Result<Arc<R>> {
        let map = self.map.read().map_err(|_| poisoned())?;
        for entry in map.values() {
            let configurations = entry.configurations.read().map_err(|_| poisoned())?;
            for (_, resource) in configurations.iter() {
                if resource.owns_live_handle(handle) {
                    return Ok(resource.clone());
                }
            }
        }
        Err(EmberError::NotFound(format!(
            "no resource owns live handle {:#x}",
            handle
        )))
    }

    /// Drop every entry and the cache's ownership of every resource.
    ///
    /// Precondition (not runtime-enforced): no caller still relies on a
    /// previously returned reference.
    pub fn clear(&self) {
        if let Ok(mut map) = self.map.write() {
            map.clear();
        }
    }

    /// Number of resources currently published across all entries.
    pub fn len(&self) -> usize {
        let map = match self.map.read() {
            Ok(map) => map,
            Err(_) => return 0,
        };
        map.values()
            .map(|e| e.configurations.read().map(|c| c.len()).unwrap_or(0))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: CacheKey, R: CachedResource> Default for ResourceCache<K, R> {
    fn default() -> Self {
        Self::new()
    }
}
