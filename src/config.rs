//! Contains the system configuration and the per-cache settings.
//!
//! The system configuration is loaded from a YAML file (**config/settings.yml** by default).
//! We observe this file for changes and reload it once a change is detected. Each user of the
//! config should therefore attach itself to the [Config::notifier] and re-process the config once
//! a change message is received. A [Cache](crate::cache::Cache) does this automatically once
//! [follow_config](crate::cache::Cache::follow_config) has been called.
//!
//! The file has two sections. **engine** contains the settings of the
//! [CacheManager](crate::manager::CacheManager), **caches** contains one section per cache:
//! ```yaml
//! engine:
//!     owner: 0
//!     registry_size: 65536
//!     key_cache_size: 8192
//!     cluster_timeout: 5s
//!     maintenance_interval: 1m
//! caches:
//!     sessions:
//!         idle_timeout: 30m
//!         expire_timeout: infinite
//!         lease_timeout: 5m
//!         idle_window: 25
//!         read_through: true
//!         write_through: false
//!         flags: 0
//! ```
//!
//! # Examples
//! ```
//! # use distcache::config::Config;
//! let config = Config::new("somefile.yml");
//! config.load_from_string("
//! engine:
//!     registry_size: 1024
//! caches:
//!     test:
//!         idle_timeout: 10s
//! ", None).unwrap();
//!
//! assert_eq!(config.current().query("engine.registry_size").as_i64().unwrap(), 1024);
//! assert_eq!(config.current().engine_settings().registry_size, 1024);
//! ```
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use arc_swap::ArcSwap;
use yaml_rust::{Yaml, YamlLoader};

use crate::blob::{CacheSerializer, JsonSerializer};
use crate::error::{CacheError, CacheResult};
use crate::fmt::{parse_duration, parse_timeout};
use crate::hash::{hash_namespace, HashKey};
use crate::loader::{CacheLoader, CacheWriter};
use crate::mnode::Timeout;

/// Contains the default location of the config file.
pub const DEFAULT_CONFIG_FILE: &str = "config/settings.yml";

/// Provides access to the system configuration.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<(Yaml, Option<SystemTime>)>,
}

/// Represents the change listener.
///
/// Internally this is simply the receiver of a broadcast. The actual message being broadcast
/// can and should be ignored. All that matters is, once a message has been received, the config
/// was changed and needs to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a handle to the currently loaded configuration.
///
/// Note that this handle should not be stored or kept around for long, as it will not be updated
/// if the underlying config changed.
pub struct Handle {
    config: Arc<(Yaml, Option<SystemTime>)>,
}

impl Config {
    /// Creates a new config reading the given file.
    ///
    /// Note that this will neither load the file nor install a change monitor. This is done
    /// by [install].
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new((Yaml::Hash(Default::default()), None))),
            tx,
        }
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a handle to the currently loaded configuration.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Determines the last modified date of the config file on disk.
    #[cfg(not(test))]
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Forces the config to read the underlying file.
    ///
    /// A missing file is not an error, the config simply remains empty.
    pub async fn load(&self) -> anyhow::Result<()> {
        log::info!("Loading config file {}...", &self.filename);

        match tokio::fs::metadata(&self.filename).await {
            Ok(metadata) if metadata.is_file() => (),
            _ => {
                log::info!("Config file doesn't exist - skipping config load.");
                return Ok(());
            }
        }

        let config_data = tokio::fs::read_to_string(&self.filename)
            .await
            .with_context(|| format!("Cannot load config file {}", &self.filename))?;

        let last_modified = tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .and_then(|metadata| metadata.modified().ok());

        self.load_from_string(config_data.as_str(), last_modified)
    }

    /// Writes the given config data into the config file.
    ///
    /// The data is verified before anything is written. Note that the new config isn't loaded
    /// here, this is left to the change monitor (or an explicit call to [Config::load]).
    ///
    /// # Example
    ///
    /// ```
    /// # use distcache::config::Config;
    /// # #[tokio::main]
    /// # async fn main() {
    /// let config = Config::new("distcache_test_config.yml");
    ///
    /// assert_eq!(config.store("
    /// engine:
    ///     owner: 3
    /// ").await.is_ok(), true);
    ///
    /// assert_eq!(config.load().await.is_ok(), true);
    /// assert_eq!(config.current().engine_settings().owner, 3);
    ///
    /// // Writing an invalid config file is prevented...
    /// assert_eq!(config.store("engine: \"test").await.is_err(), true);
    ///
    /// // Therefore the original config is still present...
    /// assert_eq!(config.load().await.is_ok(), true);
    /// assert_eq!(config.current().engine_settings().owner, 3);
    ///
    /// let _ = std::fs::remove_file("distcache_test_config.yml");
    /// # }
    /// ```
    pub async fn store(&self, config: &str) -> anyhow::Result<()> {
        log::info!(
            "Programmatically updating the config file {}...",
            &self.filename
        );

        let _ = YamlLoader::load_from_str(config)
            .map_err(|error| anyhow::anyhow!("Cannot parse config data: {}", error))?;

        tokio::fs::write(&self.filename, config)
            .await
            .context("Failed to write to config file!")?;
        log::info!("Config has been updated successfully!");

        Ok(())
    }

    /// Loads a configuration from the given string instead of a file.
    ///
    /// If the data cannot be parsed, the previous config is kept and an error is returned.
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let mut docs = YamlLoader::load_from_str(data).map_err(|error| {
            anyhow::anyhow!("Cannot parse config file {}: {}", &self.filename, error)
        })?;

        let doc = match docs.drain(..).next() {
            Some(doc @ Yaml::Hash(_)) => doc,
            _ => Yaml::Hash(Default::default()),
        };

        self.config.store(Arc::new((doc, last_modified)));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.send(());

        Ok(())
    }
}

impl Handle {
    /// Provides access to the currently loaded configuration.
    pub fn config(&self) -> &Yaml {
        &self.config.0
    }

    /// Resolves a dot separated path like **engine.owner** within the configuration.
    ///
    /// Returns [Yaml::BadValue] if the path doesn't exist.
    pub fn query(&self, path: impl AsRef<str>) -> &Yaml {
        path.as_ref()
            .split('.')
            .fold(&self.config.0, |current, part| &current[part])
    }

    /// Reads the settings of the cache engine, using defaults for missing or invalid values.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings::from_yaml(self.query("engine"))
    }

    /// Reads the settings of the given cache.
    ///
    /// If the cache has no section or if the section is invalid, the given current settings are
    /// kept.
    pub fn cache_settings(&self, name: &str, current: &CacheSettings) -> CacheSettings {
        let section = &self.query("caches")[name];
        if section.is_badvalue() {
            return current.clone();
        }

        match CacheSettings::from_yaml(section) {
            Ok(settings) => settings,
            Err(error) => {
                log::error!(
                    "Not going to update the settings of cache {}: {:#}",
                    name,
                    error
                );
                current.clone()
            }
        }
    }
}

/// Creates a **Config** for the given file and loads it.
///
/// This also installs a change monitor which reloads the file once its modification date
/// changes. The monitor stops once the returned config is dropped.
pub async fn install(file: &str) -> Arc<Config> {
    if let Some(parent) = Path::new(file).parent() {
        if let Err(error) = tokio::fs::create_dir_all(parent).await {
            log::warn!(
                "Failed to create config base directory {}: {}",
                parent.to_string_lossy(),
                error
            )
        }
    }

    let config = Arc::new(Config::new(file));
    if let Err(error) = config.load().await {
        log::error!("{:#}", error);
    }

    run_config_change_monitor(Arc::downgrade(&config));

    config
}

#[cfg(test)]
fn run_config_change_monitor(_config: Weak<Config>) {
    // No automatic updates during testing...
}

#[cfg(not(test))]
fn run_config_change_monitor(config: Weak<Config>) {
    crate::spawn!(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let config = match config.upgrade() {
                Some(config) => config,
                None => return,
            };

            let last_modified = config.last_modified().await;
            let last_loaded = config.config.load().1;

            // Reload if a file is present and either newer than the one we loaded or if nothing
            // has been loaded so far...
            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => log::info!("System configuration was re-loaded."),
                    Err(error) => log::error!("Failed to re-load system config: {:#}", error),
                }
            }
        }
    });
}

/// Reads an optional timeout from a config section.
///
/// Integers are treated as milliseconds, strings are parsed via [parse_timeout].
fn read_timeout(section: &Yaml, name: &str, default: Timeout) -> anyhow::Result<Timeout> {
    match &section[name] {
        Yaml::BadValue | Yaml::Null => Ok(default),
        Yaml::Integer(millis) if *millis >= 0 => Ok(Timeout::Millis(*millis as u64)),
        Yaml::String(value) => {
            parse_timeout(value).with_context(|| format!("Failed to parse '{}'", name))
        }
        other => Err(anyhow::anyhow!("Invalid value for '{}': {:?}", name, other)),
    }
}

fn read_duration(section: &Yaml, name: &str, default: Duration) -> anyhow::Result<Duration> {
    match &section[name] {
        Yaml::BadValue | Yaml::Null => Ok(default),
        Yaml::Integer(millis) if *millis >= 0 => Ok(Duration::from_millis(*millis as u64)),
        Yaml::String(value) => {
            parse_duration(value).with_context(|| format!("Failed to parse '{}'", name))
        }
        other => Err(anyhow::anyhow!("Invalid value for '{}': {:?}", name, other)),
    }
}

fn read_int(section: &Yaml, name: &str, default: i64) -> anyhow::Result<i64> {
    match &section[name] {
        Yaml::BadValue | Yaml::Null => Ok(default),
        Yaml::Integer(value) if *value >= 0 => Ok(*value),
        other => Err(anyhow::anyhow!(
            "Invalid value for '{}': {:?} (expected a positive integer)",
            name,
            other
        )),
    }
}

fn read_bool(section: &Yaml, name: &str, default: bool) -> anyhow::Result<bool> {
    match &section[name] {
        Yaml::BadValue | Yaml::Null => Ok(default),
        Yaml::Boolean(value) => Ok(*value),
        other => Err(anyhow::anyhow!(
            "Invalid value for '{}': {:?} (expected true or false)",
            name,
            other
        )),
    }
}

/// Contains the settings of the [CacheManager](crate::manager::CacheManager).
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    /// Contains the id of this node which is recorded as lease owner.
    pub owner: u32,

    /// Contains the max number of entry handles kept in memory.
    pub registry_size: usize,

    /// Contains the max number of key hashes cached per cache.
    pub key_cache_size: usize,

    /// Contains the deadline of a request sent to another node of the cluster.
    pub cluster_timeout: Duration,

    /// Contains the interval in which expired metadata and orphaned blobs are purged.
    pub maintenance_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            owner: 0,
            registry_size: 64 * 1024,
            key_cache_size: 8 * 1024,
            cluster_timeout: Duration::from_secs(5),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

impl EngineSettings {
    /// Reads the settings from the given section.
    ///
    /// Each invalid value is logged and replaced by its default.
    pub fn from_yaml(section: &Yaml) -> EngineSettings {
        let defaults = EngineSettings::default();

        fn or_default<T>(result: anyhow::Result<T>, default: T) -> T {
            result.unwrap_or_else(|error| {
                log::error!("Invalid engine setting: {:#}", error);
                default
            })
        }

        EngineSettings {
            owner: or_default(
                read_int(section, "owner", defaults.owner as i64).map(|value| value as u32),
                defaults.owner,
            ),
            registry_size: or_default(
                read_int(section, "registry_size", defaults.registry_size as i64)
                    .map(|value| value as usize),
                defaults.registry_size,
            ),
            key_cache_size: or_default(
                read_int(section, "key_cache_size", defaults.key_cache_size as i64)
                    .map(|value| value as usize),
                defaults.key_cache_size,
            ),
            cluster_timeout: or_default(
                read_duration(section, "cluster_timeout", defaults.cluster_timeout),
                defaults.cluster_timeout,
            ),
            maintenance_interval: or_default(
                read_duration(section, "maintenance_interval", defaults.maintenance_interval),
                defaults.maintenance_interval,
            ),
        }
    }
}

/// Contains the expiry and write policy of a single cache.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheSettings {
    /// An entry expires if it hasn't been read for this long.
    pub idle_timeout: Timeout,

    /// An entry expires if it hasn't been written for this long.
    pub expire_timeout: Timeout,

    /// Determines how long the last writer keeps its lease on an entry.
    pub lease_timeout: Timeout,

    /// Determines the fraction of the idle timeout which has to elapse before the access time
    /// of an entry is rewritten.
    pub idle_window: f64,

    /// Determines if the loader is invoked for absent or expired entries.
    pub read_through: bool,

    /// Determines if the writer is invoked for explicit writes.
    pub write_through: bool,

    /// Contains opaque flags which are stored along with each entry.
    pub flags: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            idle_timeout: Timeout::Infinite,
            expire_timeout: Timeout::Infinite,
            lease_timeout: Timeout::Millis(5 * 60 * 1000),
            idle_window: 0.25,
            read_through: true,
            write_through: false,
            flags: 0,
        }
    }
}

impl CacheSettings {
    /// Reads the settings from the given section.
    ///
    /// Missing values are replaced by their defaults, invalid values result in an error.
    pub fn from_yaml(section: &Yaml) -> anyhow::Result<CacheSettings> {
        let defaults = CacheSettings::default();
        let settings = CacheSettings {
            idle_timeout: read_timeout(section, "idle_timeout", defaults.idle_timeout)?,
            expire_timeout: read_timeout(section, "expire_timeout", defaults.expire_timeout)?,
            lease_timeout: read_timeout(section, "lease_timeout", defaults.lease_timeout)?,
            idle_window: read_int(section, "idle_window", 25)? as f64 / 100.,
            read_through: read_bool(section, "read_through", defaults.read_through)?,
            write_through: read_bool(section, "write_through", defaults.write_through)?,
            flags: read_int(section, "flags", 0)? as u64,
        };
        settings.verify()?;

        Ok(settings)
    }

    /// Ensures that the settings are consistent.
    pub fn verify(&self) -> CacheResult<()> {
        if !(0.0..=1.0).contains(&self.idle_window) {
            return Err(CacheError::Misuse(format!(
                "The idle window must be within 0% and 100% of the idle timeout but was {}",
                self.idle_window
            )));
        }

        Ok(())
    }
}

/// Contains everything the engine needs to know about a cache.
///
/// This combines the namespace of the cache, its (reloadable) [CacheSettings], the serializers
/// used for keys and values and the optional loader and writer.
pub struct CacheConfig<K, V> {
    name: String,
    namespace_hash: HashKey,
    settings: ArcSwap<CacheSettings>,
    serializer: Arc<dyn CacheSerializer<V>>,
    key_serializer: Arc<dyn CacheSerializer<K>>,
    loader: Option<Arc<dyn CacheLoader<K, V>>>,
    writer: Option<Arc<dyn CacheWriter<K, V>>>,
}

impl<K, V> CacheConfig<K, V>
where
    K: serde::Serialize + serde::de::DeserializeOwned + 'static,
    V: serde::Serialize + serde::de::DeserializeOwned + 'static,
{
    /// Creates a config for the given cache which stores keys and values as JSON.
    pub fn json(name: &str) -> CacheResult<Self> {
        CacheConfig::with_serializers(
            name,
            Arc::new(JsonSerializer::<K>::default()),
            Arc::new(JsonSerializer::<V>::default()),
        )
    }
}

impl<K, V> CacheConfig<K, V> {
    /// Creates a config for the given cache using the given serializers.
    ///
    /// Fails if no name is given, as the name determines the namespace of all keys.
    pub fn with_serializers(
        name: &str,
        key_serializer: Arc<dyn CacheSerializer<K>>,
        serializer: Arc<dyn CacheSerializer<V>>,
    ) -> CacheResult<Self> {
        if name.trim().is_empty() {
            return Err(CacheError::Misuse(
                "A cache requires a non-empty name.".to_owned(),
            ));
        }

        Ok(CacheConfig {
            name: name.to_owned(),
            namespace_hash: hash_namespace(name),
            settings: ArcSwap::from_pointee(CacheSettings::default()),
            serializer,
            key_serializer,
            loader: None,
            writer: None,
        })
    }

    /// Installs the given settings.
    pub fn with_settings(self, settings: CacheSettings) -> CacheResult<Self> {
        self.update_settings(settings)?;
        Ok(self)
    }

    /// Installs the loader used for read-through.
    pub fn with_loader(mut self, loader: Arc<dyn CacheLoader<K, V>>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Installs the writer used for write-through.
    pub fn with_writer(mut self, writer: Arc<dyn CacheWriter<K, V>>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Returns the name of the cache.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the namespace hash of the cache.
    pub fn namespace_hash(&self) -> &HashKey {
        &self.namespace_hash
    }

    /// Returns the current settings.
    pub fn settings(&self) -> Arc<CacheSettings> {
        self.settings.load_full()
    }

    /// Replaces the settings, which only affects subsequent writes and reads.
    pub fn update_settings(&self, settings: CacheSettings) -> CacheResult<()> {
        settings.verify()?;
        self.settings.store(Arc::new(settings));

        Ok(())
    }

    /// Returns the serializer for values.
    pub fn serializer(&self) -> &dyn CacheSerializer<V> {
        self.serializer.as_ref()
    }

    /// Returns the serializer for keys.
    pub fn key_serializer(&self) -> &dyn CacheSerializer<K> {
        self.key_serializer.as_ref()
    }

    /// Returns the loader if one is present.
    pub fn loader(&self) -> Option<&Arc<dyn CacheLoader<K, V>>> {
        self.loader.as_ref()
    }

    /// Returns the writer if one is present.
    pub fn writer(&self) -> Option<&Arc<dyn CacheWriter<K, V>>> {
        self.writer.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{CacheConfig, CacheSettings, Config, EngineSettings};
    use crate::error::CacheError;
    use crate::mnode::Timeout;
    use std::time::{Duration, SystemTime};

    #[test]
    fn ensure_config_update_works() {
        crate::testing::test_async(async {
            let config = Config::new("test.yml");
            config
                .load_from_string("test: 42", Some(SystemTime::now()))
                .unwrap();

            // Setup a task which notifies our oneshot channel once the config changes...
            let mut change_notifier = config.notifier();
            let (tx, rx) = tokio::sync::oneshot::channel();
            crate::spawn!(async move {
                if change_notifier.recv().await.is_ok() {
                    let _ = tx.send(());
                }
            });

            // Ensure that a malformed config is simply ignored...
            assert_eq!(
                config
                    .load_from_string("test: 'invalid", Some(SystemTime::now()))
                    .is_err(),
                true
            );
            assert_eq!(config.current().query("test").as_i64().unwrap(), 42);

            config
                .load_from_string("test: 4242", Some(SystemTime::now()))
                .unwrap();
            rx.await.unwrap();

            assert_eq!(config.current().query("test").as_i64().unwrap(), 4242);
            assert_eq!(config.current().query("unknown.path").is_badvalue(), true);
        });
    }

    #[test]
    fn engine_settings_fall_back_to_defaults() {
        let config = Config::new("test.yml");
        config
            .load_from_string(
                "
engine:
    owner: 2
    registry_size: -5
    cluster_timeout: 250ms
    maintenance_interval: soon
",
                None,
            )
            .unwrap();

        let settings = config.current().engine_settings();
        assert_eq!(settings.owner, 2);
        assert_eq!(settings.registry_size, EngineSettings::default().registry_size);
        assert_eq!(settings.cluster_timeout, Duration::from_millis(250));
        assert_eq!(
            settings.maintenance_interval,
            EngineSettings::default().maintenance_interval
        );
    }

    #[test]
    fn invalid_cache_sections_keep_the_previous_settings() {
        let config = Config::new("test.yml");
        config
            .load_from_string(
                "
caches:
    sessions:
        idle_timeout: 30m
        expire_timeout: infinite
        lease_timeout: 1000
        idle_window: 50
        write_through: true
        flags: 7
    broken:
        idle_timeout: 10 years
    too_wide:
        idle_window: 150
",
                None,
            )
            .unwrap();

        let defaults = CacheSettings::default();
        let sessions = config.current().cache_settings("sessions", &defaults);
        assert_eq!(sessions.idle_timeout, Timeout::Millis(30 * 60 * 1000));
        assert_eq!(sessions.expire_timeout, Timeout::Infinite);
        assert_eq!(sessions.lease_timeout, Timeout::Millis(1000));
        assert_eq!(sessions.idle_window, 0.5);
        assert_eq!(sessions.read_through, true);
        assert_eq!(sessions.write_through, true);
        assert_eq!(sessions.flags, 7);

        assert_eq!(config.current().cache_settings("broken", &sessions), sessions);
        assert_eq!(config.current().cache_settings("too_wide", &sessions), sessions);
        assert_eq!(config.current().cache_settings("unknown", &defaults), defaults);
    }

    #[test]
    fn cache_configs_are_verified() {
        assert_eq!(
            matches!(
                CacheConfig::<String, String>::json(" "),
                Err(CacheError::Misuse(_))
            ),
            true
        );

        let config = CacheConfig::<String, String>::json("test").unwrap();
        let invalid = CacheSettings {
            idle_window: -0.5,
            ..CacheSettings::default()
        };
        assert_eq!(config.update_settings(invalid).is_err(), true);
        assert_eq!(config.settings().idle_window, 0.25);
        assert_eq!(
            config.namespace_hash(),
            CacheConfig::<u64, u64>::json("test").unwrap().namespace_hash()
        );
    }
}
