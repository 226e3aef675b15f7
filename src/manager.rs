//! Provides the cache coordination engine.
//!
//! The [CacheManager] orchestrates all reads and writes of all caches of a node. It keeps the
//! [Registry] of in-memory entry handles and talks to the blob store, the metadata store and the
//! cluster on behalf of the entries.
//!
//! # Reads
//! A read first obtains the current [MetadataSnapshot] of the entry (fetching it from the
//! metadata store if the handle was just created). If the snapshot is valid, its value is
//! resolved via the blob store. Otherwise exactly one task wins the single-flight flag of the
//! entry and reloads it: it asks the cluster for the authoritative snapshot, then invokes the
//! loader and finally records a confirmed absence. All other tasks continue with the last known
//! snapshot instead of waiting.
//!
//! # Writes
//! A write stores the value blob, computes a new version and swaps a new snapshot into the
//! handle via compare-and-swap. The committed snapshot is then persisted and forwarded to the
//! cluster without waiting for it. Writes which lost against a newer concurrent write are
//! reported as [PutOutcome::Superseded], failed preconditions as [CompareOutcome::NoMatch].
//!
//! Snapshots are ordered by version and value hash, therefore a late write which arrives via the
//! cluster can never overwrite a newer value (or resurrect a removed one).
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fnv::FnvHashMap;
use parking_lot::RwLock;

use crate::backing::{DataBacking, MetaBacking};
use crate::blob::{decode, decode_key, encode, encode_key, CacheSerializer};
use crate::clock::Clock;
use crate::cluster::ClusterBacking;
use crate::config::{CacheConfig, Config, EngineSettings};
use crate::entry::{EntryHandle, Placement};
use crate::error::{CacheError, CacheResult};
use crate::fmt::format_duration;
use crate::hash::{hash_key, HashKey};
use crate::loader::CacheListener;
use crate::mnode::MetadataSnapshot;
use crate::registry::Registry;
use crate::update::UpdateRecord;

/// Reports the result of a write.
#[derive(Clone, Debug)]
pub enum PutOutcome {
    /// The write was committed, this is the resulting snapshot.
    Committed(Arc<MetadataSnapshot>),

    /// A newer write was already present, the write was dropped.
    ///
    /// Contains the current snapshot of the entry.
    Superseded(Arc<MetadataSnapshot>),
}

impl PutOutcome {
    /// Returns the snapshot of the entry after the write.
    pub fn snapshot(&self) -> &Arc<MetadataSnapshot> {
        match self {
            PutOutcome::Committed(snapshot) | PutOutcome::Superseded(snapshot) => snapshot,
        }
    }

    /// Determines if the write was committed.
    pub fn is_committed(&self) -> bool {
        matches!(self, PutOutcome::Committed(_))
    }
}

/// Describes the precondition of a [CacheManager::compare_and_put].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Expect {
    /// The entry must currently have a value.
    Any,

    /// The entry must currently have no value.
    Null,

    /// The current value must have the given hash.
    Hash(HashKey),

    /// The entry must currently have the given version.
    Version(u64),
}

impl Expect {
    /// Determines if the given snapshot satisfies this precondition at **now**.
    ///
    /// An expired value counts as no value.
    pub fn matches(&self, snapshot: &MetadataSnapshot, now: u64) -> bool {
        let current = if snapshot.is_valid(now) {
            snapshot.value_hash
        } else {
            HashKey::NULL
        };

        match self {
            Expect::Any => !current.is_null(),
            Expect::Null => current.is_null(),
            Expect::Hash(expected) => &current == expected,
            Expect::Version(version) => snapshot.version == *version,
        }
    }
}

/// Reports the result of a conditional write.
#[derive(Clone, Debug)]
pub enum CompareOutcome {
    /// The precondition was met and the write was committed.
    Updated {
        /// Contains the snapshot the precondition was checked against.
        previous: Arc<MetadataSnapshot>,
        /// Contains the committed snapshot.
        snapshot: Arc<MetadataSnapshot>,
    },

    /// The precondition wasn't met, nothing was written.
    NoMatch(Arc<MetadataSnapshot>),

    /// A newer write was already present, the write was dropped.
    Superseded(Arc<MetadataSnapshot>),
}

impl CompareOutcome {
    /// Determines if the write was committed.
    pub fn is_updated(&self) -> bool {
        matches!(self, CompareOutcome::Updated { .. })
    }

    /// Returns the snapshot of the entry after the operation.
    pub fn snapshot(&self) -> &Arc<MetadataSnapshot> {
        match self {
            CompareOutcome::Updated { snapshot, .. }
            | CompareOutcome::NoMatch(snapshot)
            | CompareOutcome::Superseded(snapshot) => snapshot,
        }
    }
}

enum LocalCommit {
    Committed(Arc<MetadataSnapshot>),
    Stale(Arc<MetadataSnapshot>),
    Lost,
}

/// Collects the counters of a [CacheManager].
#[derive(Default)]
pub struct Stats {
    reads: AtomicU64,
    hits: AtomicU64,
    writes: AtomicU64,
    reloads: AtomicU64,
    loader_calls: AtomicU64,
    superseded: AtomicU64,
    corrupted: AtomicU64,
}

macro_rules! counter {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        pub fn $name(&self) -> u64 {
            self.$name.load(Ordering::Relaxed)
        }
    };
}

impl Stats {
    counter!(reads, "Returns the number of reads.");
    counter!(hits, "Returns the number of reads which yielded a value.");
    counter!(writes, "Returns the number of committed local writes.");
    counter!(reloads, "Returns the number of reloads of absent or expired entries.");
    counter!(loader_calls, "Returns the number of loader invocations.");
    counter!(superseded, "Returns the number of writes dropped in favor of newer ones.");
    counter!(corrupted, "Returns the number of entries removed due to missing or invalid data.");

    /// Returns the percentage of reads which yielded a value.
    pub fn hit_rate(&self) -> f32 {
        match self.reads() {
            0 => 0.,
            n => self.hits() as f32 / n as f32 * 100.,
        }
    }

    fn inc(counter: &AtomicU64) {
        let _ = counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Coordinates all reads and writes of the caches of a node.
pub struct CacheManager {
    owner: u32,
    registry: Registry,
    data: Arc<dyn DataBacking>,
    meta: Arc<dyn MetaBacking>,
    cluster: Arc<dyn ClusterBacking>,
    clock: Arc<dyn Clock>,
    cluster_timeout: Duration,
    key_cache_size: usize,
    listeners: RwLock<FnvHashMap<HashKey, Vec<Arc<dyn CacheListener>>>>,
    stats: Stats,
    running: AtomicBool,
    closed: tokio::sync::broadcast::Sender<()>,
    config: Option<Arc<Config>>,

    // Held (shared) from saving a blob until it is referenced by a snapshot and (exclusively)
    // while orphaned blobs are removed.
    blob_gate: tokio::sync::RwLock<()>,
}

impl CacheManager {
    /// Creates a new manager.
    ///
    /// Most probably a [Builder](crate::builder::Builder) should be used, which provides
    /// sensible defaults for all parts.
    pub fn new(
        settings: &EngineSettings,
        placement: Placement,
        data: Arc<dyn DataBacking>,
        meta: Arc<dyn MetaBacking>,
        cluster: Arc<dyn ClusterBacking>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (closed, _) = tokio::sync::broadcast::channel(1);
        CacheManager {
            owner: settings.owner,
            registry: Registry::new(settings.registry_size, placement),
            data,
            meta,
            cluster,
            clock,
            cluster_timeout: settings.cluster_timeout,
            key_cache_size: settings.key_cache_size,
            listeners: RwLock::new(FnvHashMap::default()),
            stats: Stats::default(),
            running: AtomicBool::new(true),
            closed,
            config: None,
            blob_gate: tokio::sync::RwLock::new(()),
        }
    }

    /// Attaches the system configuration, so that caches can follow it.
    pub fn with_config(mut self, config: Arc<Config>) -> Self {
        self.config = Some(config);
        self
    }

    /// Returns the system configuration if one was attached.
    pub fn config(&self) -> Option<&Arc<Config>> {
        self.config.as_ref()
    }

    /// Returns the id of this node, which is recorded as lease owner of local writes.
    pub fn owner(&self) -> u32 {
        self.owner
    }

    /// Returns the current time in epoch milliseconds.
    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Returns the number of key hashes each [Cache](crate::cache::Cache) keeps in memory.
    pub fn key_cache_size(&self) -> usize {
        self.key_cache_size
    }

    /// Provides access to the registry of entry handles.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Provides access to the counters of this manager.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Returns the handle for the given key hash.
    pub fn resolve(&self, key_hash: HashKey, key: Option<Bytes>) -> Arc<EntryHandle> {
        self.registry.resolve(key_hash, key)
    }

    /// Serializes and hashes the given key and returns its handle.
    pub fn handle_for<K, V>(
        &self,
        config: &CacheConfig<K, V>,
        key: &K,
    ) -> CacheResult<Arc<EntryHandle>> {
        let key = encode_key(config.key_serializer(), key).map_err(CacheError::Serialization)?;
        let key_hash = hash_key(config.namespace_hash(), &key);

        Ok(self.resolve(key_hash, Some(key)))
    }

    /// Registers a listener which is notified about all changes within the given namespace.
    pub fn add_cache_listener(&self, namespace_hash: HashKey, listener: Arc<dyn CacheListener>) {
        self.listeners
            .write()
            .entry(namespace_hash)
            .or_default()
            .push(listener);
    }

    /// Determines if this manager is still active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Shuts down all background tasks of this manager (actors, maintenance).
    pub fn close(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            log::info!("Closing the cache manager of node {}...", self.owner);
            let _ = self.closed.send(());
        }
    }

    /// Returns a receiver which is notified once the manager is closed.
    pub fn closed_notifier(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.closed.subscribe()
    }

    /// Returns the current snapshot of the entry, fetching it from the metadata store if the
    /// handle hasn't been loaded yet.
    ///
    /// If two tasks race to load the same handle, the first one wins and the other one uses
    /// its result.
    pub async fn load_mnode(&self, handle: &EntryHandle) -> Arc<MetadataSnapshot> {
        let current = handle.snapshot();
        if !current.unloaded {
            return current;
        }

        let loaded = match self.meta.load_snapshot(handle.key_hash()).await {
            Ok(Some(row)) => MetadataSnapshot {
                unloaded: false,
                implicit_null: false,
                ..row
            },
            Ok(None) => MetadataSnapshot::implicit_null(*handle.key_hash()),
            Err(error) => {
                log::warn!(
                    "Failed to load the metadata of {}: {:#}",
                    handle.key_hash(),
                    error
                );
                return current;
            }
        };

        let loaded = Arc::new(loaded);
        if handle.compare_and_set(&current, loaded.clone()) {
            loaded
        } else {
            handle.snapshot()
        }
    }

    /// Returns the value of the given entry.
    ///
    /// Absent or expired entries are reloaded (at most once at a time per entry). Failures of
    /// the underlying stores are logged and reported as a miss.
    pub async fn get<K, V>(&self, handle: &EntryHandle, config: &CacheConfig<K, V>) -> Option<V>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        self.read(handle, config, false).await
    }

    /// Returns the value of the given entry after fetching the authoritative snapshot, even if
    /// the local one is still valid.
    pub async fn get_exact<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
    ) -> Option<V>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        self.read(handle, config, true).await
    }

    /// Returns the locally known value of the given entry without reloading it.
    pub async fn peek<K, V>(&self, handle: &EntryHandle, config: &CacheConfig<K, V>) -> Option<V>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let snapshot = self.load_mnode(handle).await;
        if snapshot.is_valid(self.now()) {
            self.read_value(handle, config, &snapshot).await
        } else {
            None
        }
    }

    async fn read<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
        force: bool,
    ) -> Option<V>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        Stats::inc(&self.stats.reads);

        let snapshot = self.get_mnode(handle, config, force).await;
        let value = self.read_value(handle, config, &snapshot).await;
        if value.is_some() {
            Stats::inc(&self.stats.hits);
            self.touch(handle, config, &snapshot).await;
        }

        value
    }

    /// Returns a snapshot to read from, reloading the entry if required.
    async fn get_mnode<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
        force: bool,
    ) -> Arc<MetadataSnapshot>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let snapshot = self.load_mnode(handle).await;
        if !force && snapshot.is_valid(self.now()) {
            return snapshot;
        }

        match handle.try_begin_reload() {
            Some(_guard) => self.reload(handle, config, force).await,
            // Someone else is already reloading, we continue with what we have...
            None => snapshot,
        }
    }

    /// Reloads an absent or expired entry, this is only invoked by the single-flight winner.
    async fn reload<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
        force: bool,
    ) -> Arc<MetadataSnapshot>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        handle.add_load_count();
        Stats::inc(&self.stats.reloads);

        // Another winner might have completed a reload while we were waiting for the flag...
        let now = self.now();
        let current = handle.snapshot();
        if !force && current.is_valid(now) {
            return current;
        }

        match tokio::time::timeout(
            self.cluster_timeout,
            self.cluster.fetch_authoritative(handle.key_hash()),
        )
        .await
        {
            Ok(Ok(Some(remote))) => {
                let _ = handle.install_if_newer(Arc::new(MetadataSnapshot {
                    unloaded: false,
                    implicit_null: false,
                    ..remote
                }));
            }
            Ok(Ok(None)) => (),
            Ok(Err(error)) => {
                log::warn!(
                    "Failed to fetch {} from the cluster: {:#}",
                    handle.key_hash(),
                    error
                );
                return Self::unconfirmed_miss(handle);
            }
            Err(_) => {
                log::warn!(
                    "Fetching {} from the cluster timed out after {}",
                    handle.key_hash(),
                    format_duration(self.cluster_timeout)
                );
                return Self::unconfirmed_miss(handle);
            }
        }

        let current = handle.snapshot();
        if current.is_valid(now) {
            return current;
        }

        // The local metadata store failed and the cluster didn't know the entry either. We
        // cannot tell if the entry is absent, so neither the loader nor a null is used...
        if current.unloaded {
            return Self::unconfirmed_miss(handle);
        }

        match self.load_through(handle, config).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => self.install_null(handle, config, now),
            Err(error) => {
                log::warn!(
                    "Failed to load {} into {}: {}",
                    handle.key_hash(),
                    config.name(),
                    error
                );
                Self::unconfirmed_miss(handle)
            }
        }
    }

    /// Reports a miss for a single read without recording the entry as absent.
    ///
    /// The returned snapshot is never installed, the next read of the entry tries again.
    fn unconfirmed_miss(handle: &EntryHandle) -> Arc<MetadataSnapshot> {
        Arc::new(MetadataSnapshot::implicit_null(*handle.key_hash()))
    }

    /// Invokes the loader (if enabled) and writes its result.
    async fn load_through<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
    ) -> CacheResult<Option<Arc<MetadataSnapshot>>>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        if !config.settings().read_through {
            return Ok(None);
        }
        let (loader, key) = match (config.loader(), handle.key()) {
            (Some(loader), Some(key)) => (loader, key),
            _ => return Ok(None),
        };
        let key: K = decode_key(config.key_serializer(), key).map_err(CacheError::Serialization)?;

        Stats::inc(&self.stats.loader_calls);
        match loader.load(&key).await.map_err(CacheError::Loader)? {
            Some(value) => {
                let outcome = self.write_value(handle, config, None, Some(&value)).await?;
                Ok(Some(outcome.snapshot().clone()))
            }
            None => Ok(None),
        }
    }

    /// Records that the entry is known to be absent, unless a concurrent write provided a
    /// valid value meanwhile.
    fn install_null<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
        now: u64,
    ) -> Arc<MetadataSnapshot> {
        let settings = config.settings();
        loop {
            let current = handle.snapshot();
            if current.is_valid(now) {
                return current;
            }

            let null = Arc::new(MetadataSnapshot {
                key_hash: *handle.key_hash(),
                namespace_hash: *config.namespace_hash(),
                value_hash: HashKey::NULL,
                value_length: 0,
                version: current.version,
                accessed_timeout: settings.idle_timeout,
                modified_timeout: settings.expire_timeout,
                lease_timeout: settings.lease_timeout,
                lease_owner: current.lease_owner,
                last_access_time: now,
                last_update_time: now,
                flags: settings.flags,
                implicit_null: false,
                unloaded: false,
            });
            if handle.compare_and_set(&current, null.clone()) {
                return null;
            }
        }
    }

    /// Resolves the value of the given snapshot.
    ///
    /// If the blob is missing (locally and within the cluster) or corrupted, the entry is
    /// removed.
    async fn read_value<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
        snapshot: &Arc<MetadataSnapshot>,
    ) -> Option<V>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        if snapshot.is_null() {
            return None;
        }

        let data = match self.data.load_blob(&snapshot.value_hash).await {
            Ok(Some(data)) => Some(data),
            Ok(None) => self.load_cluster_data(handle, &snapshot.value_hash).await,
            Err(error) => {
                log::warn!(
                    "Failed to load blob {} of {}: {:#}",
                    snapshot.value_hash,
                    handle.key_hash(),
                    error
                );
                return None;
            }
        };

        let error = match data.map(|data| decode(config.serializer(), &data, &snapshot.value_hash))
        {
            Some(Ok(value)) => return Some(value),
            Some(Err(error)) => error,
            None => anyhow::anyhow!("Blob {} is missing", snapshot.value_hash),
        };

        log::warn!(
            "Removing entry {} of {} as its data is unusable: {:#}",
            handle.key_hash(),
            config.name(),
            error
        );
        Stats::inc(&self.stats.corrupted);

        // Only remove the entry if it still points to the broken value...
        if let Err(error) = self
            .commit(
                handle,
                config,
                Some(Expect::Version(snapshot.version)),
                HashKey::NULL,
                0,
                None,
            )
            .await
        {
            log::warn!("Failed to remove {}: {:#}", handle.key_hash(), error);
        }

        None
    }

    /// Tries to fetch a blob which is missing locally from the cluster.
    async fn load_cluster_data(&self, handle: &EntryHandle, value_hash: &HashKey) -> Option<Bytes> {
        let data = match tokio::time::timeout(
            self.cluster_timeout,
            self.cluster.load_data(handle.key_hash(), value_hash),
        )
        .await
        {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => return None,
            Ok(Err(error)) => {
                log::warn!("Failed to fetch blob {} from the cluster: {:#}", value_hash, error);
                return None;
            }
            Err(_) => {
                log::warn!("Fetching blob {} from the cluster timed out.", value_hash);
                return None;
            }
        };

        if &HashKey::of(&data) != value_hash {
            log::warn!("The cluster delivered invalid data for blob {}.", value_hash);
            return None;
        }

        if let Err(error) = self.data.save_blob(value_hash, data.clone()).await {
            log::warn!("Failed to store blob {} locally: {:#}", value_hash, error);
        }

        Some(data)
    }

    /// Records the access of a valid entry.
    ///
    /// The access time is only rewritten once a fraction (the idle window) of the idle timeout
    /// has elapsed since the last recorded access.
    async fn touch<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
        snapshot: &Arc<MetadataSnapshot>,
    ) {
        let now = self.now();
        if !snapshot.is_valid(now)
            || !snapshot.needs_access_touch(config.settings().idle_window, now)
        {
            return;
        }

        let touched = Arc::new(snapshot.with_access_time(now));
        if !handle.compare_and_set(snapshot, touched.clone()) {
            return;
        }

        if let Err(error) = self
            .meta
            .update_access_time_only(handle.key_hash(), touched.version, now)
            .await
        {
            log::warn!(
                "Failed to record the access time of {}: {:#}",
                handle.key_hash(),
                error
            );
        }

        let cluster = self.cluster.clone();
        crate::spawn!(async move {
            if let Err(error) = cluster.update_time(&touched.key_hash, &touched).await {
                log::debug!(
                    "Failed to replicate the access time of {}: {:#}",
                    touched.key_hash,
                    error
                );
            }
        });
    }

    /// Stores the given value for the given entry.
    pub async fn put<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
        value: &V,
    ) -> CacheResult<PutOutcome>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        self.put_or_remove(handle, config, Some(value)).await
    }

    /// Removes the value of the given entry.
    ///
    /// A removal is a write of "no value" with a new version. Therefore a delayed write of an
    /// older value cannot resurrect the entry.
    pub async fn remove<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
    ) -> CacheResult<PutOutcome>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        self.put_or_remove(handle, config, None).await
    }

    async fn put_or_remove<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
        value: Option<&V>,
    ) -> CacheResult<PutOutcome>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        match self.write_value(handle, config, None, value).await? {
            CompareOutcome::Updated { snapshot, .. } => {
                self.write_through(handle, config, value).await?;
                Ok(PutOutcome::Committed(snapshot))
            }
            CompareOutcome::NoMatch(snapshot) | CompareOutcome::Superseded(snapshot) => {
                Ok(PutOutcome::Superseded(snapshot))
            }
        }
    }

    /// Stores the given value (or removes the current one) if the given precondition holds.
    ///
    /// The precondition is checked against the same snapshot the new one is swapped against.
    /// If a concurrent write interferes, the precondition is checked again against the new
    /// state.
    pub async fn compare_and_put<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
        expect: Expect,
        value: Option<&V>,
    ) -> CacheResult<CompareOutcome>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let outcome = self.write_value(handle, config, Some(expect), value).await?;
        if outcome.is_updated() {
            self.write_through(handle, config, value).await?;
        }

        Ok(outcome)
    }

    /// Points the entry to an already stored blob using an explicit version.
    ///
    /// The write is dropped unless it is newer than the current snapshot. Snapshots are ordered
    /// by their version first and by their value hash second.
    pub async fn compare_and_put_version<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
        version: u64,
        value_hash: HashKey,
        value_length: u64,
    ) -> CacheResult<CompareOutcome> {
        if version == 0 {
            return Err(CacheError::Misuse(
                "A versioned write requires a version greater than zero.".to_owned(),
            ));
        }

        let _gate = self.blob_gate.read().await;
        if !value_hash.is_null()
            && !self
                .data
                .exists(&value_hash)
                .await
                .map_err(CacheError::Store)?
        {
            return Err(CacheError::Misuse(format!(
                "Cannot point {} to the unknown blob {}.",
                handle.key_hash(),
                value_hash
            )));
        }

        self.commit(
            handle,
            config,
            None,
            value_hash,
            value_length,
            Some(version),
        )
        .await
    }

    /// Stores the given value and returns the previous one.
    pub async fn get_and_put<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
        value: &V,
    ) -> CacheResult<Option<V>>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        self.exchange(handle, config, Some(value), false).await
    }

    /// Removes the value of the entry and returns it.
    pub async fn get_and_remove<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
    ) -> CacheResult<Option<V>>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        self.exchange(handle, config, None, true).await
    }

    /// Replaces the value of the entry if it has one and returns the previous value.
    pub async fn get_and_replace<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
        value: &V,
    ) -> CacheResult<Option<V>>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        self.exchange(handle, config, Some(value), true).await
    }

    /// Atomically swaps the value of an entry and returns the previous one.
    ///
    /// If **only_if_present** is set, nothing is written if there is no previous value.
    async fn exchange<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
        value: Option<&V>,
        only_if_present: bool,
    ) -> CacheResult<Option<V>>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let (value_hash, value_length) = self.store_value(config.serializer(), value).await?;
        loop {
            let observed = self.load_mnode(handle).await;
            let previous = if observed.is_valid(self.now()) {
                self.read_value(handle, config, &observed).await
            } else {
                None
            };
            if only_if_present && previous.is_none() {
                return Ok(None);
            }

            match self
                .commit(
                    handle,
                    config,
                    Some(Expect::Version(observed.version)),
                    value_hash,
                    value_length,
                    None,
                )
                .await?
            {
                CompareOutcome::Updated { .. } => {
                    self.write_through(handle, config, value).await?;
                    return Ok(previous);
                }
                CompareOutcome::Superseded(_) => return Ok(previous),
                CompareOutcome::NoMatch(_) => continue,
            }
        }
    }

    /// Stores the blob of the given value and commits it.
    async fn write_value<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
        expect: Option<Expect>,
        value: Option<&V>,
    ) -> CacheResult<CompareOutcome>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let _gate = self.blob_gate.read().await;
        let (value_hash, value_length) = self.store_value(config.serializer(), value).await?;
        self.commit(handle, config, expect, value_hash, value_length, None)
            .await
    }

    /// Writes the blob of the given value and returns its hash and length.
    async fn store_value<V>(
        &self,
        serializer: &dyn CacheSerializer<V>,
        value: Option<&V>,
    ) -> CacheResult<(HashKey, u64)> {
        let value = match value {
            Some(value) => value,
            None => return Ok((HashKey::NULL, 0)),
        };

        let blob = encode(serializer, value).map_err(CacheError::Serialization)?;
        let _ = self
            .data
            .save_blob(&blob.hash, blob.data.clone())
            .await
            .map_err(CacheError::Store)?;

        Ok((blob.hash, blob.len()))
    }

    /// Invokes the writer of the cache (if enabled) for a committed write.
    async fn write_through<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
        value: Option<&V>,
    ) -> CacheResult<()>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        if !config.settings().write_through {
            return Ok(());
        }
        let (writer, key) = match (config.writer(), handle.key()) {
            (Some(writer), Some(key)) => (writer, key),
            _ => return Ok(()),
        };

        let key: K = decode_key(config.key_serializer(), key).map_err(CacheError::Serialization)?;
        let result = match value {
            Some(value) => writer.write(&key, value).await,
            None => writer.delete(&key).await,
        };

        result.map_err(CacheError::Writer)
    }

    /// Commits a new value hash for the given entry.
    ///
    /// Observes the current snapshot, checks the precondition, computes the version and
    /// swaps in the new snapshot. If the swap fails due to a concurrent change, the new state
    /// is observed again. Conditional writes re-check their precondition and compute a new
    /// version, all other writes keep their version and are dropped if the concurrent change
    /// is newer.
    async fn commit<K, V>(
        &self,
        handle: &EntryHandle,
        config: &CacheConfig<K, V>,
        expect: Option<Expect>,
        value_hash: HashKey,
        value_length: u64,
        version: Option<u64>,
    ) -> CacheResult<CompareOutcome> {
        let settings = config.settings();
        let mut pinned_version = version;
        loop {
            let now = self.now();
            let observed = self.load_mnode(handle).await;
            if let Some(expect) = &expect {
                if !expect.matches(&observed, now) {
                    return Ok(CompareOutcome::NoMatch(observed));
                }
            }

            let version = match pinned_version {
                Some(version) => version,
                None => {
                    let next = observed.next_version(now).ok_or_else(|| {
                        CacheError::Misuse(format!(
                            "The version of {} cannot be incremented any further.",
                            handle.key_hash()
                        ))
                    })?;
                    if expect.is_none() {
                        pinned_version = Some(next);
                    }
                    next
                }
            };

            let update = UpdateRecord {
                key_hash: *handle.key_hash(),
                value_hash,
                value_length,
                version,
                namespace_hash: *config.namespace_hash(),
                accessed_timeout: settings.idle_timeout,
                modified_timeout: settings.expire_timeout,
                lease_timeout: settings.lease_timeout,
                flags: settings.flags,
            };

            match self
                .put_local_value(handle, &observed, &update, Some(self.owner), now)
                .await
                .map_err(CacheError::Store)?
            {
                LocalCommit::Committed(snapshot) => {
                    self.propagate(update, snapshot.clone());
                    return Ok(CompareOutcome::Updated {
                        previous: observed,
                        snapshot,
                    });
                }
                LocalCommit::Stale(current) => return Ok(CompareOutcome::Superseded(current)),
                LocalCommit::Lost => continue,
            }
        }
    }

    /// Applies an update on top of the observed snapshot.
    ///
    /// If the update is older than the observed snapshot, only the lease is transferred to the
    /// writer. Otherwise the new snapshot is swapped in and persisted. If persisting fails, the
    /// swap is rolled back (unless another write already happened).
    async fn put_local_value(
        &self,
        handle: &EntryHandle,
        observed: &Arc<MetadataSnapshot>,
        update: &UpdateRecord,
        lease_owner: Option<u32>,
        now: u64,
    ) -> anyhow::Result<LocalCommit> {
        if !observed.unloaded && !observed.accepts(update) {
            Stats::inc(&self.stats.superseded);
            return Ok(LocalCommit::Stale(self.record_lease(
                handle,
                observed,
                lease_owner,
                now,
            )));
        }

        let committed = Arc::new(MetadataSnapshot::from_update(update, lease_owner, now));
        if !handle.compare_and_set(observed, committed.clone()) {
            return Ok(LocalCommit::Lost);
        }

        if let Err(error) = self.persist(observed, &committed).await {
            let _ = handle.compare_and_set(&committed, observed.clone());
            return Err(error);
        }

        Stats::inc(&self.stats.writes);
        self.notify_listeners(&committed);

        Ok(LocalCommit::Committed(committed))
    }

    /// Records the given node as the one which last touched the entry, without changing
    /// its value.
    fn record_lease(
        &self,
        handle: &EntryHandle,
        observed: &Arc<MetadataSnapshot>,
        lease_owner: Option<u32>,
        now: u64,
    ) -> Arc<MetadataSnapshot> {
        let leased = Arc::new(observed.with_lease(lease_owner, now));
        if handle.compare_and_set(observed, leased.clone()) {
            leased
        } else {
            handle.snapshot()
        }
    }

    async fn persist(
        &self,
        previous: &MetadataSnapshot,
        committed: &MetadataSnapshot,
    ) -> anyhow::Result<()> {
        let key_hash = &committed.key_hash;

        // A version of zero means that we never saw a row for this entry...
        let stored = if previous.version == 0 {
            self.meta.insert(key_hash, committed).await?
                || self.meta.compare_and_update(key_hash, committed).await?
        } else {
            self.meta.compare_and_update(key_hash, committed).await?
                || self.meta.insert(key_hash, committed).await?
        };

        if !stored {
            log::debug!(
                "The metadata store already contains a newer version of {}.",
                key_hash
            );
        }

        Ok(())
    }

    fn propagate(&self, update: UpdateRecord, snapshot: Arc<MetadataSnapshot>) {
        let cluster = self.cluster.clone();
        crate::spawn!(async move {
            if let Err(error) = cluster
                .propagate(&update.key_hash, &update, &snapshot)
                .await
            {
                log::warn!("Failed to replicate {}: {:#}", update.key_hash, error);
            }
        });
    }

    fn notify_listeners(&self, snapshot: &MetadataSnapshot) {
        if let Some(listeners) = self.listeners.read().get(&snapshot.namespace_hash) {
            for listener in listeners {
                listener.on_put(&snapshot.key_hash, snapshot);
            }
        }
    }

    /// Applies an update which has been committed by another node.
    ///
    /// The optional data is the blob of the new value, which is verified and stored first.
    pub async fn put_local_update(
        &self,
        update: UpdateRecord,
        lease_owner: Option<u32>,
        data: Option<Bytes>,
    ) -> anyhow::Result<PutOutcome> {
        let _gate = self.blob_gate.read().await;
        if let Some(data) = data {
            if HashKey::of(&data) != update.value_hash {
                return Err(anyhow::anyhow!(
                    "Received data which doesn't match the blob {}.",
                    update.value_hash
                ));
            }
            let _ = self.data.save_blob(&update.value_hash, data).await?;
        }

        let handle = self.registry.resolve(update.key_hash, None);
        loop {
            let now = self.now();
            let observed = self.load_mnode(&handle).await;
            match self
                .put_local_value(&handle, &observed, &update, lease_owner, now)
                .await?
            {
                LocalCommit::Committed(snapshot) => return Ok(PutOutcome::Committed(snapshot)),
                LocalCommit::Stale(snapshot) => return Ok(PutOutcome::Superseded(snapshot)),
                LocalCommit::Lost => continue,
            }
        }
    }

    /// Applies an access time recorded by another node.
    ///
    /// This is only accepted for the exact same version of the entry.
    pub async fn save_local_update_time(&self, snapshot: &MetadataSnapshot) -> bool {
        if let Some(handle) = self.registry.find(&snapshot.key_hash) {
            loop {
                let current = handle.snapshot();
                if current.unloaded
                    || current.version != snapshot.version
                    || current.last_access_time >= snapshot.last_access_time
                {
                    break;
                }

                let touched = Arc::new(current.with_access_time(snapshot.last_access_time));
                if handle.compare_and_set(&current, touched) {
                    break;
                }
            }
        }

        match self
            .meta
            .update_access_time_only(
                &snapshot.key_hash,
                snapshot.version,
                snapshot.last_access_time,
            )
            .await
        {
            Ok(updated) => updated,
            Err(error) => {
                log::warn!(
                    "Failed to record the access time of {}: {:#}",
                    snapshot.key_hash,
                    error
                );
                false
            }
        }
    }

    /// Returns the locally known snapshot of an entry to answer a request of another node.
    pub async fn load_local_entry(&self, key_hash: &HashKey) -> Option<MetadataSnapshot> {
        if let Some(handle) = self.registry.find(key_hash) {
            let snapshot = handle.snapshot();
            if !snapshot.unloaded && !snapshot.implicit_null {
                return Some(snapshot.as_ref().clone());
            }
        }

        match self.meta.load_snapshot(key_hash).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                log::warn!("Failed to load the metadata of {}: {:#}", key_hash, error);
                None
            }
        }
    }

    /// Returns a locally stored blob to answer a request of another node.
    pub async fn load_local_data(&self, value_hash: &HashKey) -> Option<Bytes> {
        match self.data.load_blob(value_hash).await {
            Ok(data) => data,
            Err(error) => {
                log::warn!("Failed to load blob {}: {:#}", value_hash, error);
                None
            }
        }
    }

    /// Drops the lease owners of all entries kept in memory.
    ///
    /// This is used once a node joins or leaves the cluster, as all leases are void then.
    pub fn clear_leases(&self) {
        for handle in self.registry.entries() {
            loop {
                let current = handle.snapshot();
                if current.lease_owner.is_none() {
                    break;
                }

                let cleared = Arc::new(MetadataSnapshot {
                    lease_owner: None,
                    ..current.as_ref().clone()
                });
                if handle.compare_and_set(&current, cleared) {
                    break;
                }
            }
        }
    }

    /// Removes expired metadata rows and blobs which are no longer referenced.
    ///
    /// Returns the number of removed rows and blobs.
    pub async fn run_maintenance(&self) -> anyhow::Result<(usize, usize)> {
        let expired = self.meta.remove_expired(self.now()).await?;

        let _gate = self.blob_gate.write().await;
        let mut live = self.meta.live_value_hashes().await?;
        live.extend(
            self.registry
                .entries()
                .iter()
                .map(|handle| handle.snapshot().value_hash)
                .filter(|hash| !hash.is_null()),
        );
        let orphans = self.data.remove_orphans(&live).await?;

        if expired > 0 || orphans > 0 {
            log::info!(
                "Maintenance removed {} expired entries and {} orphaned blobs.",
                expired,
                orphans
            );
        }

        Ok((expired, orphans))
    }

    /// Renders the counters of this manager as a table.
    pub async fn report(&self) -> String {
        let mut result = String::new();

        let _ = writeln!(result, "{:<30} {:>20}", "Node", self.owner);
        let _ = writeln!(result, "{:<30} {:>20}", "Handles", self.registry.len());
        let _ = writeln!(
            result,
            "{:<30} {:>20}",
            "Max Handles",
            self.registry.capacity()
        );
        let _ = writeln!(
            result,
            "{:<30} {:>18.2} %",
            "Utilization",
            self.registry.utilization()
        );
        let _ = writeln!(
            result,
            "{:<30} {:>18.2} %",
            "Registry Hit Rate",
            self.registry.hit_rate()
        );
        if let Ok(rows) = self.meta.count().await {
            let _ = writeln!(result, "{:<30} {:>20}", "Stored Entries", rows);
        }
        if let Ok(blobs) = self.data.count().await {
            let _ = writeln!(result, "{:<30} {:>20}", "Stored Blobs", blobs);
        }
        let _ = writeln!(result, "{:<30} {:>20}", "Reads", self.stats.reads());
        let _ = writeln!(
            result,
            "{:<30} {:>18.2} %",
            "Hit Rate",
            self.stats.hit_rate()
        );
        let _ = writeln!(result, "{:<30} {:>20}", "Writes", self.stats.writes());
        let _ = writeln!(result, "{:<30} {:>20}", "Reloads", self.stats.reloads());
        let _ = writeln!(
            result,
            "{:<30} {:>20}",
            "Loader Calls",
            self.stats.loader_calls()
        );
        let _ = writeln!(
            result,
            "{:<30} {:>20}",
            "Superseded Writes",
            self.stats.superseded()
        );
        let _ = writeln!(
            result,
            "{:<30} {:>20}",
            "Corrupted Entries",
            self.stats.corrupted()
        );

        result
    }
}

/// Starts a task which periodically invokes [CacheManager::run_maintenance].
///
/// The task stops once the manager is closed.
pub fn run_maintenance_loop(manager: Arc<CacheManager>, interval: Duration) {
    crate::spawn!(async move {
        let mut closed = manager.closed_notifier();
        while manager.is_running() {
            tokio::select! {
                _ = closed.recv() => return,
                _ = tokio::time::sleep(interval) => {
                    if let Err(error) = manager.run_maintenance().await {
                        log::error!("Failed to perform the cache maintenance: {:#}", error);
                    }
                }
            }
        }
    });
}
