//! Provides the callbacks which connect a cache to its underlying data source.
//!
//! A [CacheLoader] is invoked if a requested entry is absent or expired (and read-through is
//! enabled). It is only ever called by the task which won the single-flight reload of an entry,
//! therefore a loader is never invoked concurrently for the same key.
//!
//! A [CacheWriter] is notified about explicit writes and removals (if write-through is enabled).
//!
//! Finally, a [CacheListener] observes all changes committed on the local node, including the
//! ones received from other nodes of the cluster.
use async_trait::async_trait;

use crate::hash::HashKey;
use crate::mnode::MetadataSnapshot;

/// Loads values from the underlying data source.
#[async_trait]
pub trait CacheLoader<K, V>: Send + Sync {
    /// Loads the value for the given key or returns **None** if there is no value.
    async fn load(&self, key: &K) -> anyhow::Result<Option<V>>;
}

/// Writes changes back to the underlying data source.
#[async_trait]
pub trait CacheWriter<K, V>: Send + Sync {
    /// Stores the given value for the given key.
    async fn write(&self, key: &K, value: &V) -> anyhow::Result<()>;

    /// Removes the value of the given key.
    async fn delete(&self, key: &K) -> anyhow::Result<()>;
}

/// Gets notified once a change of an entry has been committed.
pub trait CacheListener: Send + Sync {
    /// Invoked after the given snapshot has been committed for the given entry.
    ///
    /// As this is called within the write path, implementations must not block.
    fn on_put(&self, key_hash: &HashKey, snapshot: &MetadataSnapshot);
}
