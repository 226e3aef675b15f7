//! Provides the registry which keeps the in-memory handles of all recently used entries.
//!
//! The registry is a size constrained LRU map from [HashKey] to [EntryHandle]. Once the
//! capacity is exceeded, the least recently used handle is evicted. Handles which are currently
//! being reloaded are skipped, as evicting them would permit a second concurrent reload.
//!
//! Evicting a handle never loses any data, as the durable state lives in the
//! [MetaBacking](crate::backing::MetaBacking). Also, callers which already obtained a handle can
//! safely continue to use it - eviction only affects subsequent lookups.
//!
//! # Examples
//! ```
//! # use distcache::registry::Registry;
//! # use distcache::entry::Placement;
//! # use distcache::hash::HashKey;
//! let registry = Registry::new(128, Placement::single());
//!
//! let handle = registry.resolve(HashKey::of(b"a"), None);
//! assert_eq!(std::sync::Arc::ptr_eq(&handle, &registry.resolve(HashKey::of(b"a"), None)), true);
//! assert_eq!(registry.len(), 1);
//! ```
use std::sync::Arc;

use bytes::Bytes;
use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;

use crate::entry::{EntryHandle, Placement};
use crate::hash::HashKey;

struct Inner {
    map: LinkedHashMap<HashKey, Arc<EntryHandle>>,
    capacity: usize,
    reads: usize,
    hits: usize,
}

/// Provides a bounded LRU map of entry handles.
pub struct Registry {
    inner: Mutex<Inner>,
    placement: Placement,
}

impl Registry {
    /// Creates a registry which keeps up to **capacity** handles.
    ///
    /// The placement is used to determine the owners of newly created handles.
    pub fn new(capacity: usize, placement: Placement) -> Self {
        Registry {
            inner: Mutex::new(Inner {
                map: LinkedHashMap::new(),
                capacity: capacity.max(1),
                reads: 0,
                hits: 0,
            }),
            placement,
        }
    }

    /// Returns the handle for the given key hash, creating it on first use.
    ///
    /// If the handle already exists but doesn't know its serialized key yet, the given key is
    /// recorded.
    pub fn resolve(&self, key_hash: HashKey, key: Option<Bytes>) -> Arc<EntryHandle> {
        let mut inner = self.inner.lock();
        inner.reads += 1;

        if let Some(handle) = inner.map.get_refresh(&key_hash) {
            let handle = handle.clone();
            inner.hits += 1;
            if let Some(key) = key {
                if handle.key().is_none() {
                    handle.provide_key(key);
                }
            }

            return handle;
        }

        let handle = Arc::new(EntryHandle::new(
            key_hash,
            key,
            self.placement.owners(&key_hash),
        ));
        let _ = inner.map.insert(key_hash, handle.clone());
        Registry::enforce_capacity(&mut inner, Some(&key_hash));

        handle
    }

    /// Evicts the least recently used handles until the capacity is met.
    ///
    /// Handles being reloaded and the given (just created) handle are never evicted, as the
    /// next lookup would otherwise create a second handle for the same entry.
    fn enforce_capacity(inner: &mut Inner, retained: Option<&HashKey>) {
        // Each handle is inspected at most once. If all of them are busy, we temporarily
        // exceed the capacity rather than spinning...
        let mut attempts = inner.map.len();
        while inner.map.len() > inner.capacity && attempts > 0 {
            attempts -= 1;
            match inner.map.pop_front() {
                Some((key_hash, handle))
                    if handle.is_reload_in_progress() || retained == Some(&key_hash) =>
                {
                    let _ = inner.map.insert(key_hash, handle);
                }
                Some(_) => (),
                None => return,
            }
        }
    }

    /// Returns the handle for the given key hash without creating it.
    pub fn find(&self, key_hash: &HashKey) -> Option<Arc<EntryHandle>> {
        self.inner.lock().map.get(key_hash).cloned()
    }

    /// Returns all handles which are currently registered.
    pub fn entries(&self) -> Vec<Arc<EntryHandle>> {
        self.inner.lock().map.values().cloned().collect()
    }

    /// Returns the placement used to assign owners to handles.
    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// Returns the number of registered handles.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Determines if there are no registered handles.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the max number of handles to keep.
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Changes the max number of handles to keep.
    ///
    /// If the new capacity is smaller than the current number of handles, the least recently
    /// used ones are evicted immediately.
    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        inner.capacity = capacity.max(1);
        Registry::enforce_capacity(&mut inner, None);
    }

    /// Drops all handles and resets the metrics.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.reads = 0;
        inner.hits = 0;
    }

    /// Returns the number of lookups since the last flush.
    pub fn reads(&self) -> usize {
        self.inner.lock().reads
    }

    /// Returns the percentage of lookups which found an existing handle.
    pub fn hit_rate(&self) -> f32 {
        let inner = self.inner.lock();
        match inner.reads {
            0 => 0.,
            n => inner.hits as f32 / n as f32 * 100.,
        }
    }

    /// Returns the utilization of the registry in percent.
    pub fn utilization(&self) -> f32 {
        let inner = self.inner.lock();
        inner.map.len() as f32 / inner.capacity as f32 * 100.
    }
}

#[cfg(test)]
mod tests {
    use crate::entry::Placement;
    use crate::hash::HashKey;
    use crate::registry::Registry;
    use bytes::Bytes;
    use std::sync::Arc;

    fn key(name: &str) -> HashKey {
        HashKey::of(name.as_bytes())
    }

    #[test]
    fn capacity_is_enforced() {
        let registry = Registry::new(2, Placement::single());
        let _ = registry.resolve(key("A"), None);
        let _ = registry.resolve(key("B"), None);

        // Touch A so that B becomes the least recently used one...
        let _ = registry.resolve(key("A"), None);
        let _ = registry.resolve(key("C"), None);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find(&key("A")).is_some(), true);
        assert_eq!(registry.find(&key("B")).is_none(), true);
        assert_eq!(registry.find(&key("C")).is_some(), true);

        registry.set_capacity(1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find(&key("C")).is_some(), true);
    }

    #[test]
    fn handles_being_reloaded_are_not_evicted() {
        let registry = Registry::new(1, Placement::single());
        let busy = registry.resolve(key("A"), None);
        let guard = busy.try_begin_reload();

        // Neither the busy handle nor the new one can go, so the capacity is exceeded...
        let created = registry.resolve(key("B"), None);
        assert_eq!(registry.find(&key("A")).is_some(), true);
        assert_eq!(registry.len(), 2);

        // ...and resolving the new key again yields the very same handle.
        assert_eq!(Arc::ptr_eq(&created, &registry.resolve(key("B"), None)), true);

        // Once the reload completes, A is a regular candidate again...
        std::mem::drop(guard);
        let _ = registry.resolve(key("C"), None);
        assert_eq!(registry.find(&key("A")).is_none(), true);
        assert_eq!(registry.find(&key("B")).is_none(), true);
        assert_eq!(registry.find(&key("C")).is_some(), true);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn evicted_handles_stay_usable() {
        let registry = Registry::new(1, Placement::single());
        let handle = registry.resolve(key("A"), None);
        let _ = registry.resolve(key("B"), None);

        assert_eq!(registry.find(&key("A")).is_none(), true);
        assert_eq!(handle.key_hash(), &key("A"));
        assert_eq!(handle.snapshot().unloaded, true);
    }

    #[test]
    fn keys_are_recorded_later() {
        let registry = Registry::new(4, Placement::single());
        let handle = registry.resolve(key("A"), None);
        assert_eq!(handle.key().is_none(), true);

        let _ = registry.resolve(key("A"), Some(Bytes::from_static(b"A")));
        assert_eq!(handle.key().unwrap().as_ref(), b"A");
    }

    #[test]
    fn metrics_are_computed_correctly() {
        let registry = Registry::new(4, Placement::single());
        let _ = registry.resolve(key("A"), None);
        let _ = registry.resolve(key("B"), None);
        let _ = registry.resolve(key("C"), None);
        let _ = registry.resolve(key("A"), None);

        // 4 lookups of which one found an existing handle...
        assert_eq!(registry.reads(), 4);
        assert_eq!(registry.hit_rate().round() as i32, 25);

        // 3 of 4 slots are in use...
        assert_eq!(registry.utilization().round() as i32, 75);
        assert_eq!(registry.entries().len(), 3);

        registry.flush();
        assert_eq!(registry.is_empty(), true);
        assert_eq!(registry.reads(), 0);
    }
}
