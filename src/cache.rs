//! Provides a typed view on a single cache.
//!
//! A [Cache] combines a [CacheManager] with the [CacheConfig] of one cache. It takes care of
//! serializing and hashing keys (remembering recently used ones in a [KeyCache]) and forwards
//! all operations to the manager.
//!
//! # Example
//! ```
//! # use distcache::builder::Builder;
//! # use distcache::cache::Cache;
//! # use distcache::config::CacheConfig;
//! # #[tokio::main]
//! # async fn main() {
//! let manager = Builder::new().build().await;
//! let cache = Cache::new(manager, CacheConfig::<String, i64>::json("counters").unwrap());
//!
//! assert_eq!(cache.put_if_absent(&"visits".to_owned(), &1).await.unwrap(), true);
//! assert_eq!(cache.put_if_absent(&"visits".to_owned(), &2).await.unwrap(), false);
//! assert_eq!(cache.get(&"visits".to_owned()).await.unwrap(), Some(1));
//! # }
//! ```
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;

use crate::blob::{encode, encode_key};
use crate::config::{CacheConfig, Config};
use crate::entry::EntryHandle;
use crate::error::{CacheError, CacheResult};
use crate::hash::{hash_key, HashKey, KeyCache};
use crate::loader::CacheListener;
use crate::manager::{CacheManager, CompareOutcome, Expect, PutOutcome};
use crate::mnode::MetadataSnapshot;

/// Represents a typed cache.
pub struct Cache<K, V> {
    manager: Arc<CacheManager>,
    config: CacheConfig<K, V>,
    keys: KeyCache<K>,
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates a new cache using the given manager and config.
    pub fn new(manager: Arc<CacheManager>, config: CacheConfig<K, V>) -> Self {
        let keys = KeyCache::new(manager.key_cache_size());
        Cache {
            manager,
            config,
            keys,
        }
    }

    /// Creates a new cache which follows the system configuration of the manager (if present).
    pub fn install(manager: Arc<CacheManager>, config: CacheConfig<K, V>) -> Arc<Self> {
        let system_config = manager.config().cloned();
        let cache = Arc::new(Cache::new(manager, config));
        if let Some(system_config) = system_config {
            cache.follow_config(&system_config);
        }

        cache
    }

    /// Returns the name of this cache.
    pub fn name(&self) -> &str {
        self.config.name()
    }

    /// Provides access to the config of this cache.
    pub fn config(&self) -> &CacheConfig<K, V> {
        &self.config
    }

    /// Provides access to the underlying manager.
    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    /// Returns the handle of the given key.
    pub fn handle(&self, key: &K) -> CacheResult<Arc<EntryHandle>> {
        let namespace_hash = self.config.namespace_hash();
        let key_serializer = self.config.key_serializer();
        let (key_hash, key_bytes) = self
            .keys
            .get_or_compute(key, |key| {
                let data = encode_key(key_serializer, key)?;
                Ok((hash_key(namespace_hash, &data), data))
            })
            .map_err(CacheError::Serialization)?;

        Ok(self.manager.resolve(key_hash, Some(key_bytes)))
    }

    /// Returns the value of the given key, using the loader if it is absent or expired.
    pub async fn get(&self, key: &K) -> CacheResult<Option<V>> {
        let handle = self.handle(key)?;
        Ok(self.manager.get(&handle, &self.config).await)
    }

    /// Returns the value of the given key after consulting the cluster for the latest version.
    pub async fn get_exact(&self, key: &K) -> CacheResult<Option<V>> {
        let handle = self.handle(key)?;
        Ok(self.manager.get_exact(&handle, &self.config).await)
    }

    /// Returns the locally known value of the given key without reloading it.
    pub async fn peek(&self, key: &K) -> CacheResult<Option<V>> {
        let handle = self.handle(key)?;
        Ok(self.manager.peek(&handle, &self.config).await)
    }

    /// Determines if a value is known for the given key.
    ///
    /// This neither invokes the loader nor records an access.
    pub async fn contains_key(&self, key: &K) -> CacheResult<bool> {
        let snapshot = self.entry(key).await?;
        Ok(snapshot.is_valid(self.manager.now()) && !snapshot.is_null())
    }

    /// Stores the given value.
    pub async fn put(&self, key: &K, value: &V) -> CacheResult<PutOutcome> {
        let handle = self.handle(key)?;
        self.manager.put(&handle, &self.config, value).await
    }

    /// Stores the given value and returns the previous one.
    pub async fn get_and_put(&self, key: &K, value: &V) -> CacheResult<Option<V>> {
        let handle = self.handle(key)?;
        self.manager.get_and_put(&handle, &self.config, value).await
    }

    /// Stores the given value if there is no value yet.
    pub async fn put_if_absent(&self, key: &K, value: &V) -> CacheResult<bool> {
        self.compare_and_put(key, Expect::Null, Some(value)).await
    }

    /// Stores the given value if there is already a value.
    pub async fn replace(&self, key: &K, value: &V) -> CacheResult<bool> {
        self.compare_and_put(key, Expect::Any, Some(value)).await
    }

    /// Stores the given value if the current value equals **old_value**.
    ///
    /// Values are compared by the hash of their serialized form.
    pub async fn replace_if_equals(&self, key: &K, old_value: &V, value: &V) -> CacheResult<bool> {
        let expected = self.hash_of(old_value)?;
        self.compare_and_put(key, Expect::Hash(expected), Some(value))
            .await
    }

    /// Replaces the current value (if there is one) and returns it.
    pub async fn get_and_replace(&self, key: &K, value: &V) -> CacheResult<Option<V>> {
        let handle = self.handle(key)?;
        self.manager
            .get_and_replace(&handle, &self.config, value)
            .await
    }

    /// Removes the value of the given key.
    ///
    /// Returns **true** if there was a value to remove.
    pub async fn remove(&self, key: &K) -> CacheResult<bool> {
        self.compare_and_put(key, Expect::Any, None).await
    }

    /// Removes the value of the given key if it equals the given one.
    pub async fn remove_if_equals(&self, key: &K, value: &V) -> CacheResult<bool> {
        let expected = self.hash_of(value)?;
        self.compare_and_put(key, Expect::Hash(expected), None).await
    }

    /// Removes the value of the given key and returns it.
    pub async fn get_and_remove(&self, key: &K) -> CacheResult<Option<V>> {
        let handle = self.handle(key)?;
        self.manager.get_and_remove(&handle, &self.config).await
    }

    /// Removes the value of the given key if the entry has the given version.
    pub async fn compare_and_remove(&self, key: &K, version: u64) -> CacheResult<bool> {
        self.compare_and_put(key, Expect::Version(version), None)
            .await
    }

    /// Points the given key to an already stored blob using an explicit version.
    pub async fn compare_and_put_version(
        &self,
        key: &K,
        version: u64,
        value_hash: HashKey,
        value_length: u64,
    ) -> CacheResult<CompareOutcome> {
        let handle = self.handle(key)?;
        self.manager
            .compare_and_put_version(&handle, &self.config, version, value_hash, value_length)
            .await
    }

    async fn compare_and_put(&self, key: &K, expect: Expect, value: Option<&V>) -> CacheResult<bool> {
        let handle = self.handle(key)?;
        Ok(self
            .manager
            .compare_and_put(&handle, &self.config, expect, value)
            .await?
            .is_updated())
    }

    fn hash_of(&self, value: &V) -> CacheResult<HashKey> {
        encode(self.config.serializer(), value)
            .map(|blob| blob.hash)
            .map_err(CacheError::Serialization)
    }

    /// Returns the values of all given keys which have one.
    pub async fn get_all(&self, keys: &[K]) -> CacheResult<HashMap<K, V>> {
        let mut result = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                let _ = result.insert(key.clone(), value);
            }
        }

        Ok(result)
    }

    /// Stores all given values.
    pub async fn put_all(&self, entries: impl IntoIterator<Item = (K, V)>) -> CacheResult<()> {
        for (key, value) in entries {
            let _ = self.put(&key, &value).await?;
        }

        Ok(())
    }

    /// Removes the values of all given keys.
    pub async fn remove_all(&self, keys: &[K]) -> CacheResult<()> {
        for key in keys {
            let handle = self.handle(key)?;
            let _ = self.manager.remove(&handle, &self.config).await?;
        }

        Ok(())
    }

    /// Forces a reload of the given key and reports if a value is present afterwards.
    pub async fn load(&self, key: &K) -> CacheResult<bool> {
        Ok(self.get_exact(key).await?.is_some())
    }

    /// Returns the current version of the given key (0 if it has never been written).
    pub async fn version(&self, key: &K) -> CacheResult<u64> {
        Ok(self.entry(key).await?.version)
    }

    /// Returns the current metadata snapshot of the given key.
    pub async fn entry(&self, key: &K) -> CacheResult<Arc<MetadataSnapshot>> {
        let handle = self.handle(key)?;
        Ok(self.manager.load_mnode(&handle).await)
    }

    /// Returns the hash of the current value of the given key.
    pub async fn value_hash(&self, key: &K) -> CacheResult<HashKey> {
        Ok(self.entry(key).await?.value_hash)
    }

    /// Registers a listener which is notified about all changes of this cache.
    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) {
        self.manager
            .add_cache_listener(*self.config.namespace_hash(), listener);
    }

    /// Drops all remembered key hashes.
    pub fn clear_key_cache(&self) {
        self.keys.clear();
    }

    /// Applies the settings of this cache from the given config and re-applies them once the
    /// config changes.
    ///
    /// The background task stops once either this cache or the config is dropped.
    pub fn follow_config(self: &Arc<Self>, config: &Arc<Config>) {
        self.apply_config(config);

        let cache = Arc::downgrade(self);
        let config = Arc::downgrade(config);
        let mut notifier = match config.upgrade() {
            Some(config) => config.notifier(),
            None => return,
        };

        crate::spawn!(async move {
            loop {
                match notifier.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => (),
                    Err(RecvError::Closed) => return,
                }

                match (cache.upgrade(), config.upgrade()) {
                    (Some(cache), Some(config)) => cache.apply_config(&config),
                    _ => return,
                }
            }
        });
    }

    fn apply_config(&self, config: &Config) {
        let settings = config
            .current()
            .cache_settings(self.config.name(), &self.config.settings());

        if let Err(error) = self.config.update_settings(settings) {
            log::error!(
                "Not going to update the settings of cache {}: {}",
                self.config.name(),
                error
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::cache::Cache;
    use crate::clock::ManualClock;
    use crate::config::{CacheConfig, Config};
    use crate::loader::CacheLoader;
    use crate::mnode::Timeout;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct SquareLoader;

    #[async_trait]
    impl CacheLoader<i64, i64> for SquareLoader {
        async fn load(&self, key: &i64) -> anyhow::Result<Option<i64>> {
            if *key < 0 {
                Ok(None)
            } else {
                Ok(Some(key * key))
            }
        }
    }

    async fn cache() -> Cache<String, String> {
        let manager = Builder::new().build().await;
        Cache::new(manager, CacheConfig::json("test").unwrap())
    }

    fn text(value: &str) -> String {
        value.to_owned()
    }

    #[test]
    fn conditional_writes_work() {
        crate::testing::test_async(async {
            let cache = cache().await;
            let key = text("key");

            assert_eq!(cache.replace(&key, &text("a")).await.unwrap(), false);
            assert_eq!(cache.contains_key(&key).await.unwrap(), false);
            assert_eq!(cache.put_if_absent(&key, &text("a")).await.unwrap(), true);
            assert_eq!(cache.put_if_absent(&key, &text("b")).await.unwrap(), false);
            assert_eq!(cache.contains_key(&key).await.unwrap(), true);

            assert_eq!(
                cache
                    .replace_if_equals(&key, &text("x"), &text("b"))
                    .await
                    .unwrap(),
                false
            );
            assert_eq!(
                cache
                    .replace_if_equals(&key, &text("a"), &text("b"))
                    .await
                    .unwrap(),
                true
            );
            assert_eq!(cache.replace(&key, &text("c")).await.unwrap(), true);
            assert_eq!(cache.get(&key).await.unwrap(), Some(text("c")));

            assert_eq!(cache.remove_if_equals(&key, &text("b")).await.unwrap(), false);
            assert_eq!(cache.remove_if_equals(&key, &text("c")).await.unwrap(), true);
            assert_eq!(cache.remove(&key).await.unwrap(), false);
            assert_eq!(cache.get(&key).await.unwrap(), None);
        });
    }

    #[test]
    fn versions_and_hashes_are_exposed() {
        crate::testing::test_async(async {
            let cache = cache().await;
            let key = text("key");

            assert_eq!(cache.version(&key).await.unwrap(), 0);
            assert_eq!(cache.value_hash(&key).await.unwrap().is_null(), true);

            let _ = cache.put(&key, &text("value")).await.unwrap();
            let version = cache.version(&key).await.unwrap();
            assert_eq!(version > 0, true);
            assert_eq!(cache.value_hash(&key).await.unwrap().is_null(), false);

            // Removing an outdated version is rejected...
            assert_eq!(
                cache.compare_and_remove(&key, version - 1).await.unwrap(),
                false
            );
            assert_eq!(cache.compare_and_remove(&key, version).await.unwrap(), true);
            assert_eq!(cache.get(&key).await.unwrap(), None);
            assert_eq!(cache.version(&key).await.unwrap() > version, true);

            // Pointing the key to a known blob with an explicit version...
            let current = cache.version(&key).await.unwrap();
            let other = text("other");
            let written = cache.put(&other, &text("shared")).await.unwrap();
            let outcome = cache
                .compare_and_put_version(
                    &key,
                    current + 100,
                    written.snapshot().value_hash,
                    written.snapshot().value_length,
                )
                .await
                .unwrap();
            assert_eq!(outcome.is_updated(), true);
            assert_eq!(cache.get(&key).await.unwrap(), Some(text("shared")));
        });
    }

    #[test]
    fn bulk_operations_work() {
        crate::testing::test_async(async {
            let cache = cache().await;

            cache
                .put_all(vec![(text("a"), text("1")), (text("b"), text("2"))])
                .await
                .unwrap();
            let values = cache
                .get_all(&[text("a"), text("b"), text("c")])
                .await
                .unwrap();
            assert_eq!(values.len(), 2);
            assert_eq!(values.get("b"), Some(&text("2")));

            cache.remove_all(&[text("a"), text("c")]).await.unwrap();
            let values = cache
                .get_all(&[text("a"), text("b"), text("c")])
                .await
                .unwrap();
            assert_eq!(values.len(), 1);

            assert_eq!(
                cache.get_and_put(&text("b"), &text("3")).await.unwrap(),
                Some(text("2"))
            );
            assert_eq!(
                cache.get_and_replace(&text("b"), &text("4")).await.unwrap(),
                Some(text("3"))
            );
            assert_eq!(
                cache.get_and_remove(&text("b")).await.unwrap(),
                Some(text("4"))
            );
            assert_eq!(cache.peek(&text("b")).await.unwrap(), None);
        });
    }

    #[test]
    fn loaders_fill_the_cache() {
        crate::testing::test_async(async {
            let manager = Builder::new().build().await;
            let cache = Cache::new(
                manager,
                CacheConfig::<i64, i64>::json("squares")
                    .unwrap()
                    .with_loader(Arc::new(SquareLoader)),
            );

            assert_eq!(cache.peek(&4).await.unwrap(), None);
            assert_eq!(cache.load(&4).await.unwrap(), true);
            assert_eq!(cache.peek(&4).await.unwrap(), Some(16));
            assert_eq!(cache.get(&5).await.unwrap(), Some(25));
            assert_eq!(cache.load(&-1).await.unwrap(), false);
            assert_eq!(cache.contains_key(&-1).await.unwrap(), false);
        });
    }

    #[test]
    fn settings_follow_the_config() {
        crate::testing::test_async(async {
            let clock = Arc::new(ManualClock::new(1_000_000));
            let manager = Builder::new().with_clock(clock.clone()).build().await;
            let cache = Arc::new(Cache::new(
                manager,
                CacheConfig::<String, String>::json("sessions").unwrap(),
            ));
            let config = Arc::new(Config::new("test.yml"));
            config
                .load_from_string(
                    "
caches:
    sessions:
        expire_timeout: 10s
",
                    None,
                )
                .unwrap();

            cache.follow_config(&config);
            assert_eq!(
                cache.config().settings().expire_timeout,
                Timeout::Millis(10_000)
            );

            let _ = cache.put(&text("key"), &text("value")).await.unwrap();
            clock.advance(Duration::from_secs(11));
            assert_eq!(cache.get(&text("key")).await.unwrap(), None);

            config
                .load_from_string(
                    "
caches:
    sessions:
        expire_timeout: 1m
",
                    None,
                )
                .unwrap();

            // Give the background task a chance to pick up the change...
            for _ in 0..100 {
                if cache.config().settings().expire_timeout == Timeout::Millis(60_000) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(
                cache.config().settings().expire_timeout,
                Timeout::Millis(60_000)
            );
        });
    }
}
