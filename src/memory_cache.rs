//! The [MemoryCache] maps keys to decoded resources, or to a pending marker while a load is in flight.
//!
//! A key maps to `None` while its load runs and to `Some` once it resolves; a key which is not in the map at all is
//! unknown.  Pending markers take up capacity like anything else and can be evicted, in which case the eventual
//! result is not stored.
//!
//! Every operation that can evict returns the evicted resources instead of releasing them itself.  Callers keep the
//! cache behind a lock and must recycle what comes back only after letting go of it.
use std::sync::Arc;

use crate::*;

/// Result of [MemoryCache::get_or_mark_pending].
#[derive(Debug)]
pub enum Lookup<R> {
    /// The key is resolved.
    Hit(Arc<R>),
    /// A load is already pending for the key.
    Pending,
    /// The key was unknown and is now pending; these resources were evicted to make room.
    Marked { evicted: Vec<Arc<R>> },
}

/// Result of [MemoryCache::resolve].
#[derive(Debug)]
pub struct Resolved<R> {
    /// False if the pending marker had been evicted, so the resource was not kept.
    pub stored: bool,
    /// Resources which must be recycled.
    pub evicted: Vec<Arc<R>>,
}

fn present<R>(values: impl IntoIterator<Item = Option<Arc<R>>>) -> Vec<Arc<R>> {
    values.into_iter().flatten().collect()
}

pub struct MemoryCache<R> {
    lru: Lru<CacheKey, Option<Arc<R>>>,
}

impl<R> MemoryCache<R> {
    pub fn new(capacity: usize) -> MemoryCache<R> {
        MemoryCache {
            lru: Lru::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lru.capacity()
    }

    /// Entries, pending ones included.
    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.is_empty()
    }

    pub fn contains_key(&self, key: &CacheKey) -> bool {
        self.lru.contains_key(key)
    }

    /// `None` if unknown, `Some(None)` if pending.
    pub fn get(&mut self, key: &CacheKey) -> Option<Option<Arc<R>>> {
        self.lru.get(key).cloned()
    }

    /// Store a value, returning resources which must be recycled.
    pub fn put(&mut self, key: CacheKey, value: Option<Arc<R>>) -> Vec<Arc<R>> {
        let inserted = self.lru.insert(key, value);
        let mut out = present(inserted.replaced);
        out.extend(present(inserted.evicted.into_iter().map(|e| e.value)));
        out
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<Option<Arc<R>>> {
        self.lru.remove(key)
    }

    /// Return the resource if resolved, otherwise make sure the key is pending.
    pub fn get_or_mark_pending(&mut self, key: &CacheKey) -> Lookup<R> {
        match self.lru.get(key) {
            Some(Some(r)) => Lookup::Hit(r.clone()),
            Some(None) => Lookup::Pending,
            None => Lookup::Marked {
                evicted: self.put(key.clone(), None),
            },
        }
    }

    /// Store a loaded resource if its key is still pending.
    pub fn resolve(&mut self, key: &CacheKey, resource: Arc<R>) -> Resolved<R> {
        if !self.lru.contains_key(key) {
            return Resolved {
                stored: false,
                evicted: vec![],
            };
        }

        Resolved {
            stored: true,
            evicted: self.put(key.clone(), Some(resource)),
        }
    }

    /// Forget a key whose load failed, so the next request starts over.
    pub fn fail(&mut self, key: &CacheKey) -> Option<Arc<R>> {
        self.lru.remove(key).flatten()
    }

    /// Remove everything, returning resources which must be recycled.
    pub fn clear(&mut self) -> Vec<Arc<R>> {
        present(self.lru.clear())
    }
}
