//! Cache contract for index headers and pages.
//!
//! The cache is an opaque associative store of immutable serialized values,
//! so implementations may live out of process or in fixed-size slots.  The
//! index core supplies the serialized forms (see [`crate::l2p`] and
//! [`crate::p2l`]); they are flat byte images that can be navigated in place,
//! which keeps partial reads cheap.

use crate::Revision;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// Cache key for header values: one header per index file.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PairKey {
    /// Base revision of the index file (see [`crate::Layout::base_revision`]).
    pub revision: Revision,
    /// Whether the revision lives in a pack file.
    pub is_packed: bool,
}

/// Cache key for page values.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PageKey {
    /// Base revision of the index file.
    pub revision: Revision,
    /// Whether the revision lives in a pack file.
    pub is_packed: bool,
    /// Page index within the index file.
    pub page: u64,
}

/// Associative store of immutable serialized values.
///
/// Implementations must be safe for concurrent use; all methods take
/// `&self`.  Values are never mutated once stored.
pub trait Cache<K>: Send + Sync {
    /// Returns the full value stored under `key`, if any.
    fn get(&self, key: &K) -> Option<Arc<[u8]>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: K, value: Arc<[u8]>);

    /// Whether a value is stored under `key`.
    fn has_key(&self, key: &K) -> bool;

    /// Invokes `f` with a read-only view of the value stored under `key` and
    /// returns whether the key was present.
    ///
    /// This is the partial-getter hook: `f` copies just the fields it needs
    /// into its captured receiver instead of deserializing the whole value.
    /// The view is valid only for the duration of the callback.
    fn with_value(&self, key: &K, f: &mut dyn FnMut(&[u8])) -> bool;
}

/// In-memory, mutex-protected cache.
///
/// The default cache used by [`crate::IndexStore`]; also the reference
/// implementation of the [`Cache`] contract.
pub struct MemCache<K> {
    map: Mutex<HashMap<K, Arc<[u8]>>>,
}

impl<K> MemCache<K> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> Default for MemCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Send + Sync> Cache<K> for MemCache<K> {
    fn get(&self, key: &K) -> Option<Arc<[u8]>> {
        self.map.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: K, value: Arc<[u8]>) {
        self.map.lock().unwrap().insert(key, value);
    }

    fn has_key(&self, key: &K) -> bool {
        self.map.lock().unwrap().contains_key(key)
    }

    fn with_value(&self, key: &K, f: &mut dyn FnMut(&[u8])) -> bool {
        // Clone the Arc out of the map so the callback runs without holding
        // the lock.
        let Some(value) = self.map.lock().unwrap().get(key).cloned() else {
            return false;
        };
        f(&value);
        true
    }
}

/// The four stores consulted by index lookups.
#[derive(Clone)]
pub struct Caches {
    /// Log-to-phys headers, keyed by index file.
    pub l2p_headers: Arc<dyn Cache<PairKey>>,
    /// Log-to-phys pages.
    pub l2p_pages: Arc<dyn Cache<PageKey>>,
    /// Phys-to-log headers, keyed by index file.
    pub p2l_headers: Arc<dyn Cache<PairKey>>,
    /// Phys-to-log pages.
    pub p2l_pages: Arc<dyn Cache<PageKey>>,
}

impl Default for Caches {
    fn default() -> Self {
        Self {
            l2p_headers: Arc::new(MemCache::new()),
            l2p_pages: Arc::new(MemCache::new()),
            p2l_headers: Arc::new(MemCache::new()),
            p2l_pages: Arc::new(MemCache::new()),
        }
    }
}
