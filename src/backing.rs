//! Provides the durable storage boundaries of the cache engine.
//!
//! The engine keeps two kinds of durable state:
//! * the **blobs** of the values which are stored under their content hash by a [DataBacking].
//! * the **metadata** (one [MetadataSnapshot] per entry) which is kept by a [MetaBacking].
//!
//! Both are traits so that real persistent stores can be plugged in. This module provides
//! in-memory implementations which are used for single node setups and in tests.
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::hash::HashKey;
use crate::mnode::MetadataSnapshot;

/// Determines the grace factor applied to the idle timeout before expired rows are purged.
///
/// As access times are only rewritten now and then, a row might look idle even if it has been
/// read recently.
pub const IDLE_GRACE_FACTOR: f64 = 1.25;

/// Stores value blobs by their content hash.
#[async_trait]
pub trait DataBacking: Send + Sync {
    /// Stores the given blob.
    ///
    /// Saving is idempotent: if a blob with the given hash is already present, nothing happens.
    /// Returns **true** if the blob was actually written.
    async fn save_blob(&self, hash: &HashKey, data: Bytes) -> anyhow::Result<bool>;

    /// Loads the blob with the given hash.
    async fn load_blob(&self, hash: &HashKey) -> anyhow::Result<Option<Bytes>>;

    /// Determines if a blob with the given hash is present.
    async fn exists(&self, hash: &HashKey) -> anyhow::Result<bool>;

    /// Removes all blobs which are not contained in the given set of live hashes.
    ///
    /// Returns the number of removed blobs.
    async fn remove_orphans(&self, live: &HashSet<HashKey>) -> anyhow::Result<usize>;

    /// Returns the number of stored blobs.
    async fn count(&self) -> anyhow::Result<usize>;
}

/// Stores the metadata snapshot of each entry.
#[async_trait]
pub trait MetaBacking: Send + Sync {
    /// Loads the stored snapshot of the given entry.
    async fn load_snapshot(&self, key_hash: &HashKey) -> anyhow::Result<Option<MetadataSnapshot>>;

    /// Stores the snapshot of a new entry.
    ///
    /// Returns **false** if there is already a row for this entry.
    async fn insert(&self, key_hash: &HashKey, snapshot: &MetadataSnapshot)
        -> anyhow::Result<bool>;

    /// Replaces the stored snapshot of an existing entry.
    ///
    /// Returns **false** if there is no row or if the stored row isn't older than the given
    /// snapshot.
    async fn compare_and_update(
        &self,
        key_hash: &HashKey,
        snapshot: &MetadataSnapshot,
    ) -> anyhow::Result<bool>;

    /// Only updates the access time of the stored row, provided it still has the given version.
    async fn update_access_time_only(
        &self,
        key_hash: &HashKey,
        version: u64,
        access_time: u64,
    ) -> anyhow::Result<bool>;

    /// Removes all rows which have expired at **now**.
    ///
    /// Returns the number of removed rows.
    async fn remove_expired(&self, now: u64) -> anyhow::Result<usize>;

    /// Returns the value hashes referenced by all stored rows.
    async fn live_value_hashes(&self) -> anyhow::Result<HashSet<HashKey>>;

    /// Returns the number of stored rows.
    async fn count(&self) -> anyhow::Result<usize>;
}

/// Keeps all blobs in memory.
#[derive(Default)]
pub struct MemoryDataBacking {
    blobs: Mutex<FnvHashMap<HashKey, Bytes>>,
    size: AtomicUsize,
}

impl MemoryDataBacking {
    /// Creates a new and empty store.
    pub fn new() -> Self {
        MemoryDataBacking::default()
    }

    /// Returns the total number of bytes stored.
    pub fn allocated_memory(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Discards the blob with the given hash.
    pub fn remove_blob(&self, hash: &HashKey) -> bool {
        match self.blobs.lock().remove(hash) {
            Some(data) => {
                let _ = self.size.fetch_sub(data.len(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl DataBacking for MemoryDataBacking {
    async fn save_blob(&self, hash: &HashKey, data: Bytes) -> anyhow::Result<bool> {
        let mut blobs = self.blobs.lock();
        if blobs.contains_key(hash) {
            return Ok(false);
        }

        let _ = self.size.fetch_add(data.len(), Ordering::Relaxed);
        let _ = blobs.insert(*hash, data);

        Ok(true)
    }

    async fn load_blob(&self, hash: &HashKey) -> anyhow::Result<Option<Bytes>> {
        Ok(self.blobs.lock().get(hash).cloned())
    }

    async fn exists(&self, hash: &HashKey) -> anyhow::Result<bool> {
        Ok(self.blobs.lock().contains_key(hash))
    }

    async fn remove_orphans(&self, live: &HashSet<HashKey>) -> anyhow::Result<usize> {
        let mut blobs = self.blobs.lock();
        let before = blobs.len();
        let mut released = 0;
        blobs.retain(|hash, data| {
            let keep = live.contains(hash);
            if !keep {
                released += data.len();
            }
            keep
        });
        let _ = self.size.fetch_sub(released, Ordering::Relaxed);

        Ok(before - blobs.len())
    }

    async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.blobs.lock().len())
    }
}

/// Keeps all metadata rows in memory.
#[derive(Default)]
pub struct MemoryMetaBacking {
    rows: Mutex<FnvHashMap<HashKey, MetadataSnapshot>>,
}

impl MemoryMetaBacking {
    /// Creates a new and empty store.
    pub fn new() -> Self {
        MemoryMetaBacking::default()
    }
}

/// Normalizes a snapshot before it is stored.
///
/// Only committed state is persisted, placeholders never make it into a store.
fn as_row(snapshot: &MetadataSnapshot) -> MetadataSnapshot {
    MetadataSnapshot {
        unloaded: false,
        implicit_null: false,
        ..snapshot.clone()
    }
}

#[async_trait]
impl MetaBacking for MemoryMetaBacking {
    async fn load_snapshot(&self, key_hash: &HashKey) -> anyhow::Result<Option<MetadataSnapshot>> {
        Ok(self.rows.lock().get(key_hash).cloned())
    }

    async fn insert(
        &self,
        key_hash: &HashKey,
        snapshot: &MetadataSnapshot,
    ) -> anyhow::Result<bool> {
        let mut rows = self.rows.lock();
        if rows.contains_key(key_hash) {
            return Ok(false);
        }

        let _ = rows.insert(*key_hash, as_row(snapshot));
        Ok(true)
    }

    async fn compare_and_update(
        &self,
        key_hash: &HashKey,
        snapshot: &MetadataSnapshot,
    ) -> anyhow::Result<bool> {
        let mut rows = self.rows.lock();
        match rows.get_mut(key_hash) {
            Some(row) if snapshot.supersedes(row) => {
                *row = as_row(snapshot);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_access_time_only(
        &self,
        key_hash: &HashKey,
        version: u64,
        access_time: u64,
    ) -> anyhow::Result<bool> {
        let mut rows = self.rows.lock();
        match rows.get_mut(key_hash) {
            Some(row) if row.version == version => {
                row.last_access_time = row.last_access_time.max(access_time);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_expired(&self, now: u64) -> anyhow::Result<usize> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|_, row| {
            let idle = row
                .accessed_timeout
                .scale(IDLE_GRACE_FACTOR)
                .has_elapsed(row.last_access_time, now);
            let outdated = row.modified_timeout.has_elapsed(row.last_update_time, now);

            !idle && !outdated
        });

        Ok(before - rows.len())
    }

    async fn live_value_hashes(&self) -> anyhow::Result<HashSet<HashKey>> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|row| !row.is_null())
            .map(|row| row.value_hash)
            .collect())
    }

    async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.rows.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use crate::backing::{DataBacking, MemoryDataBacking, MemoryMetaBacking, MetaBacking};
    use crate::hash::HashKey;
    use crate::mnode::{MetadataSnapshot, Timeout};
    use bytes::Bytes;
    use std::collections::HashSet;

    fn row(version: u64, value: &[u8]) -> MetadataSnapshot {
        MetadataSnapshot {
            version,
            value_hash: HashKey::of(value),
            implicit_null: false,
            last_access_time: 1_000,
            last_update_time: 1_000,
            ..MetadataSnapshot::implicit_null(HashKey::of(b"key"))
        }
    }

    #[test]
    fn blobs_are_stored_once() {
        crate::testing::test_async(async {
            let store = MemoryDataBacking::new();
            let hash = HashKey::of(b"data");

            assert_eq!(store.save_blob(&hash, Bytes::from_static(b"data")).await.unwrap(), true);
            assert_eq!(store.save_blob(&hash, Bytes::from_static(b"data")).await.unwrap(), false);
            assert_eq!(store.count().await.unwrap(), 1);
            assert_eq!(store.allocated_memory(), 4);
            assert_eq!(store.exists(&hash).await.unwrap(), true);

            let other = HashKey::of(b"other");
            let _ = store.save_blob(&other, Bytes::from_static(b"other")).await.unwrap();

            let live: HashSet<HashKey> = vec![hash].into_iter().collect();
            assert_eq!(store.remove_orphans(&live).await.unwrap(), 1);
            assert_eq!(store.load_blob(&other).await.unwrap(), None);
            assert_eq!(store.allocated_memory(), 4);

            assert_eq!(store.remove_blob(&hash), true);
            assert_eq!(store.load_blob(&hash).await.unwrap(), None);
        });
    }

    #[test]
    fn rows_are_only_replaced_by_newer_ones() {
        crate::testing::test_async(async {
            let store = MemoryMetaBacking::new();
            let key = HashKey::of(b"key");

            // Updating a missing row fails...
            assert_eq!(store.compare_and_update(&key, &row(1, b"a")).await.unwrap(), false);

            assert_eq!(store.insert(&key, &row(1, b"a")).await.unwrap(), true);
            assert_eq!(store.insert(&key, &row(2, b"b")).await.unwrap(), false);

            assert_eq!(store.compare_and_update(&key, &row(2, b"b")).await.unwrap(), true);
            assert_eq!(store.compare_and_update(&key, &row(1, b"c")).await.unwrap(), false);
            assert_eq!(store.load_snapshot(&key).await.unwrap().unwrap().version, 2);

            // The access time is only updated for the expected version...
            assert_eq!(store.update_access_time_only(&key, 1, 5_000).await.unwrap(), false);
            assert_eq!(store.update_access_time_only(&key, 2, 5_000).await.unwrap(), true);
            assert_eq!(
                store.load_snapshot(&key).await.unwrap().unwrap().last_access_time,
                5_000
            );
        });
    }

    #[test]
    fn expired_rows_are_purged_with_grace() {
        crate::testing::test_async(async {
            let store = MemoryMetaBacking::new();

            let idle = MetadataSnapshot {
                key_hash: HashKey::of(b"idle"),
                accessed_timeout: Timeout::Millis(1_000),
                ..row(1, b"a")
            };
            let outdated = MetadataSnapshot {
                key_hash: HashKey::of(b"outdated"),
                modified_timeout: Timeout::Millis(1_000),
                ..row(1, b"b")
            };
            let forever = MetadataSnapshot {
                key_hash: HashKey::of(b"forever"),
                ..row(1, b"c")
            };
            for snapshot in [&idle, &outdated, &forever] {
                let _ = store.insert(&snapshot.key_hash, snapshot).await.unwrap();
            }

            // The idle row is within its grace period (1.25 * 1s), the other one has expired...
            assert_eq!(store.remove_expired(2_100).await.unwrap(), 1);
            assert_eq!(store.load_snapshot(&idle.key_hash).await.unwrap().is_some(), true);

            assert_eq!(store.remove_expired(2_300).await.unwrap(), 1);
            assert_eq!(store.count().await.unwrap(), 1);
            assert_eq!(
                store.live_value_hashes().await.unwrap(),
                vec![HashKey::of(b"c")].into_iter().collect()
            );
        });
    }
}
