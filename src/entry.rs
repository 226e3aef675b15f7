//! Provides the in-memory handle of a cache entry along with its cluster placement.
//!
//! There is at most one [EntryHandle] per key hash which is registered in the
//! [Registry](crate::registry::Registry). The handle keeps the current
//! [MetadataSnapshot] which is replaced as a whole via compare-and-swap, so that readers always
//! observe a complete and consistent state.
//!
//! Next to the snapshot, a handle provides the single-flight flag which ensures that only one
//! task at a time reloads an expired entry (see [EntryHandle::try_begin_reload]).
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use bytes::Bytes;

use crate::hash::HashKey;
use crate::mnode::MetadataSnapshot;

/// Names the three nodes which are responsible for a key hash.
///
/// The primary owner is the authoritative source of an entry, the secondary and tertiary owners
/// are its replicas.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TriadOwner {
    /// Contains the index of the primary owner.
    pub primary: u32,

    /// Contains the index of the first replica.
    pub secondary: u32,

    /// Contains the index of the second replica.
    pub tertiary: u32,
}

impl TriadOwner {
    /// Determines if the given node is one of the three owners.
    pub fn contains(&self, node: u32) -> bool {
        self.primary == node || self.secondary == node || self.tertiary == node
    }
}

/// Maps key hashes onto the nodes of a cluster.
///
/// # Examples
/// ```
/// # use distcache::entry::Placement;
/// # use distcache::hash::HashKey;
/// let placement = Placement::new(5);
/// let owners = placement.owners(&HashKey::of(b"test"));
///
/// assert_eq!(owners.primary < 5, true);
/// assert_eq!(owners.secondary, (owners.primary + 1) % 5);
/// assert_eq!(owners.tertiary, (owners.primary + 2) % 5);
/// ```
#[derive(Copy, Clone, Debug)]
pub struct Placement {
    nodes: u32,
}

impl Placement {
    /// Creates a placement for a cluster with the given number of nodes.
    pub fn new(nodes: u32) -> Self {
        Placement {
            nodes: nodes.max(1),
        }
    }

    /// Creates the placement for a single node setup where every key is owned by node 0.
    pub fn single() -> Self {
        Placement::new(1)
    }

    /// Returns the number of nodes in the cluster.
    pub fn nodes(&self) -> u32 {
        self.nodes
    }

    /// Determines the owners of the given key hash.
    pub fn owners(&self, key_hash: &HashKey) -> TriadOwner {
        let primary = key_hash.prefix() % self.nodes;

        TriadOwner {
            primary,
            secondary: (primary + 1) % self.nodes,
            tertiary: (primary + 2) % self.nodes,
        }
    }
}

impl Default for Placement {
    fn default() -> Self {
        Placement::single()
    }
}

/// Represents the in-memory state of a single cache entry.
pub struct EntryHandle {
    key_hash: HashKey,
    key: OnceLock<Bytes>,
    snapshot: ArcSwap<MetadataSnapshot>,
    reload_in_progress: AtomicBool,
    owners: TriadOwner,
    load_count: AtomicU64,
}

/// Keeps the single-flight flag of an entry acquired.
///
/// The flag is released once the guard is dropped, no matter if the reload succeeded, failed
/// or was cancelled.
pub struct ReloadGuard<'a> {
    handle: &'a EntryHandle,
}

impl Drop for ReloadGuard<'_> {
    fn drop(&mut self) {
        self.handle.reload_in_progress.store(false, Ordering::Release);
    }
}

impl EntryHandle {
    /// Creates a new handle which starts with the "unloaded" placeholder snapshot.
    ///
    /// The serialized key is optional. Handles which are created by the replication (where only
    /// the hash is known) cannot invoke a loader.
    pub fn new(key_hash: HashKey, key: Option<Bytes>, owners: TriadOwner) -> Self {
        let key_cell = OnceLock::new();
        if let Some(key) = key {
            let _ = key_cell.set(key);
        }

        EntryHandle {
            key_hash,
            key: key_cell,
            snapshot: ArcSwap::from_pointee(MetadataSnapshot::unloaded(key_hash)),
            reload_in_progress: AtomicBool::new(false),
            owners,
            load_count: AtomicU64::new(0),
        }
    }

    /// Returns the identity of this entry.
    pub fn key_hash(&self) -> &HashKey {
        &self.key_hash
    }

    /// Returns the serialized logical key if known.
    pub fn key(&self) -> Option<&Bytes> {
        self.key.get()
    }

    /// Records the serialized key for a handle which has been created from its hash alone.
    pub fn provide_key(&self, key: Bytes) {
        let _ = self.key.set(key);
    }

    /// Returns the nodes responsible for this entry.
    pub fn owners(&self) -> TriadOwner {
        self.owners
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<MetadataSnapshot> {
        self.snapshot.load_full()
    }

    /// Replaces the snapshot with **new** if the current one is still **expected**.
    ///
    /// Note that this compares the identity of the snapshot (not its contents), therefore this
    /// fails if any other change has been applied in between.
    pub fn compare_and_set(
        &self,
        expected: &Arc<MetadataSnapshot>,
        new: Arc<MetadataSnapshot>,
    ) -> bool {
        let previous = self.snapshot.compare_and_swap(expected, new);
        Arc::ptr_eq(&*previous, expected)
    }

    /// Installs the given snapshot unless the current one is at least as new.
    ///
    /// The unloaded placeholder is always replaced. Returns **true** if the candidate has been
    /// installed.
    pub fn install_if_newer(&self, candidate: Arc<MetadataSnapshot>) -> bool {
        loop {
            let current = self.snapshot();
            if !current.unloaded && !candidate.supersedes(&current) {
                return false;
            }

            if self.compare_and_set(&current, candidate.clone()) {
                return true;
            }
        }
    }

    /// Tries to acquire the single-flight flag of this entry.
    ///
    /// Returns a guard if the flag was acquired or **None** if another task is already
    /// reloading this entry.
    pub fn try_begin_reload(&self) -> Option<ReloadGuard<'_>> {
        self.reload_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReloadGuard { handle: self })
    }

    /// Determines if a reload of this entry is currently being performed.
    pub fn is_reload_in_progress(&self) -> bool {
        self.reload_in_progress.load(Ordering::Acquire)
    }

    /// Increments the number of reloads of this entry.
    pub fn add_load_count(&self) {
        let _ = self.load_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of reloads performed for this entry.
    pub fn load_count(&self) -> u64 {
        self.load_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use crate::entry::{EntryHandle, Placement};
    use crate::hash::HashKey;
    use crate::mnode::MetadataSnapshot;
    use std::sync::Arc;

    fn handle() -> EntryHandle {
        EntryHandle::new(
            HashKey::of(b"key"),
            None,
            Placement::single().owners(&HashKey::of(b"key")),
        )
    }

    fn version(handle: &EntryHandle, version: u64) -> Arc<MetadataSnapshot> {
        Arc::new(MetadataSnapshot {
            version,
            value_hash: HashKey::of(b"value"),
            implicit_null: false,
            ..MetadataSnapshot::implicit_null(*handle.key_hash())
        })
    }

    #[test]
    fn compare_and_set_detects_concurrent_changes() {
        let handle = handle();
        let initial = handle.snapshot();
        assert_eq!(initial.unloaded, true);

        let first = version(&handle, 1);
        assert_eq!(handle.compare_and_set(&initial, first.clone()), true);

        // The expected snapshot is gone, even an equal copy doesn't match anymore...
        let copy = Arc::new(initial.as_ref().clone());
        assert_eq!(handle.compare_and_set(&copy, version(&handle, 2)), false);
        assert_eq!(handle.compare_and_set(&initial, version(&handle, 2)), false);
        assert_eq!(handle.snapshot().version, 1);
    }

    #[test]
    fn only_newer_snapshots_are_installed() {
        let handle = handle();

        // The placeholder is always replaced...
        assert_eq!(handle.install_if_newer(version(&handle, 5)), true);
        assert_eq!(handle.install_if_newer(version(&handle, 4)), false);
        assert_eq!(handle.install_if_newer(version(&handle, 5)), false);
        assert_eq!(handle.install_if_newer(version(&handle, 6)), true);
        assert_eq!(handle.snapshot().version, 6);
    }

    #[test]
    fn reload_flag_is_released_by_the_guard() {
        let handle = handle();

        let guard = handle.try_begin_reload();
        assert_eq!(guard.is_some(), true);
        assert_eq!(handle.is_reload_in_progress(), true);
        assert_eq!(handle.try_begin_reload().is_none(), true);

        std::mem::drop(guard);
        assert_eq!(handle.is_reload_in_progress(), false);
        assert_eq!(handle.try_begin_reload().is_some(), true);
    }

    #[test]
    fn placement_distributes_owners() {
        let placement = Placement::new(3);
        let owners = placement.owners(&HashKey::of(b"some key"));

        for node in 0..3 {
            assert_eq!(owners.contains(node), true);
        }
        assert_eq!(Placement::single().owners(&HashKey::of(b"x")).primary, 0);
        assert_eq!(Placement::new(0).nodes(), 1);
    }
}
