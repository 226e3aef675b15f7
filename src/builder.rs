//! Provides a builder which can be used to setup and initialize a cache engine.
//!
//! The engine itself only talks to its boundaries (blob store, metadata store, cluster and
//! clock). The builder assembles these parts, using in-memory stores, a single node cluster and
//! the system clock unless told otherwise.
//!
//! # Example
//! Setting up a node which reads its settings from **config/settings.yml** and periodically
//! cleans up its stores:
//! ```no_run
//! # use distcache::builder::Builder;
//! # use distcache::cache::Cache;
//! # use distcache::config::CacheConfig;
//! #[tokio::main]
//! async fn main() {
//!     let manager = Builder::new()
//!         .enable_logging()
//!         .enable_config()
//!         .enable_maintenance()
//!         .build()
//!         .await;
//!
//!     let sessions = Cache::install(manager, CacheConfig::<String, String>::json("sessions").unwrap());
//!     // Use the cache here...
//! }
//! ```
use std::sync::Arc;

use crate::backing::{DataBacking, MemoryDataBacking, MemoryMetaBacking, MetaBacking};
use crate::clock::{Clock, SystemClock};
use crate::cluster::{ClusterBacking, LocalCluster, PeerNetwork};
use crate::config::{EngineSettings, DEFAULT_CONFIG_FILE};
use crate::entry::Placement;
use crate::manager::{run_maintenance_loop, CacheManager};
use crate::{init_logging, DISTCACHE_REVISION, DISTCACHE_VERSION};

/// Assembles a [CacheManager].
///
/// # Example
/// Wiring a node with custom stores:
/// ```
/// # use distcache::builder::Builder;
/// # use distcache::backing::{MemoryDataBacking, MemoryMetaBacking};
/// # use std::sync::Arc;
/// # #[tokio::main]
/// # async fn main() {
/// let manager = Builder::new()
///     .with_owner(4)
///     .with_data(Arc::new(MemoryDataBacking::new()))
///     .with_meta(Arc::new(MemoryMetaBacking::new()))
///     .build()
///     .await;
///
/// assert_eq!(manager.owner(), 4);
/// # }
/// ```
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    config_file: Option<String>,
    maintenance: bool,
    settings: Option<EngineSettings>,
    owner: Option<u32>,
    placement: Option<Placement>,
    data: Option<Arc<dyn DataBacking>>,
    meta: Option<Arc<dyn MetaBacking>>,
    cluster: Option<Arc<dyn ClusterBacking>>,
    clock: Option<Arc<dyn Clock>>,
    peers: Option<(Arc<PeerNetwork>, u32)>,
}

impl Builder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Builder::default()
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// Using this, we properly initialize **simplelog** to log to stdout.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Disables the automatic setup of the logging system.
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Installs a [Config](crate::config::Config) for **config/settings.yml**.
    ///
    /// The **engine** section of the file provides the [EngineSettings] and caches which are
    /// created via [Cache::install](crate::cache::Cache::install) follow their section within
    /// **caches**.
    pub fn enable_config(self) -> Self {
        self.with_config_file(DEFAULT_CONFIG_FILE)
    }

    /// Installs a [Config](crate::config::Config) for the given file.
    pub fn with_config_file(mut self, file: &str) -> Self {
        self.config_file = Some(file.to_owned());
        self
    }

    /// Disables loading a config file.
    pub fn disable_config(mut self) -> Self {
        self.config_file = None;
        self
    }

    /// Starts a background task which periodically removes expired entries and orphaned blobs.
    ///
    /// For more details see: [run_maintenance](CacheManager::run_maintenance)
    pub fn enable_maintenance(mut self) -> Self {
        self.maintenance = true;
        self
    }

    /// Disables the maintenance task.
    pub fn disable_maintenance(mut self) -> Self {
        self.maintenance = false;
        self
    }

    /// Specifies the engine settings to use.
    ///
    /// This takes precedence over the settings within the config file.
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Specifies the id of this node.
    pub fn with_owner(mut self, owner: u32) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Specifies how entries are distributed among the nodes of the cluster.
    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = Some(placement);
        self
    }

    /// Specifies the blob store to use.
    pub fn with_data(mut self, data: Arc<dyn DataBacking>) -> Self {
        self.data = Some(data);
        self
    }

    /// Specifies the metadata store to use.
    pub fn with_meta(mut self, meta: Arc<dyn MetaBacking>) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Specifies the cluster to use.
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterBacking>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Specifies the clock to use.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Makes the manager the given node of the given network.
    ///
    /// This determines the owner id, the placement and the cluster. Note that the node still
    /// has to be attached via [PeerNetwork::attach] once the manager has been built.
    pub fn with_peers(mut self, network: &Arc<PeerNetwork>, node: u32) -> Self {
        self.peers = Some((network.clone(), node));
        self
    }

    /// Builds the [CacheManager] with all the enabled components being set up.
    pub async fn build(self) -> Arc<CacheManager> {
        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "||. DISTCACHE (v {} - rev {}) running on {} core(s) in {} CPU(s)",
            DISTCACHE_VERSION,
            DISTCACHE_REVISION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        let config = match &self.config_file {
            Some(file) => Some(crate::config::install(file).await),
            None => None,
        };

        let mut settings = match (self.settings, &config) {
            (Some(settings), _) => settings,
            (None, Some(config)) => config.current().engine_settings(),
            (None, None) => EngineSettings::default(),
        };

        let data: Arc<dyn DataBacking> = match self.data {
            Some(data) => data,
            None => Arc::new(MemoryDataBacking::new()),
        };
        let meta: Arc<dyn MetaBacking> = match self.meta {
            Some(meta) => meta,
            None => Arc::new(MemoryMetaBacking::new()),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };

        let mut placement = self.placement.unwrap_or_default();
        let cluster: Arc<dyn ClusterBacking> = match (self.peers, self.cluster) {
            (Some((network, node)), _) => {
                settings.owner = node;
                placement = network.placement();
                Arc::new(network.cluster(
                    node,
                    meta.clone(),
                    data.clone(),
                    settings.cluster_timeout,
                ))
            }
            (None, Some(cluster)) => cluster,
            (None, None) => Arc::new(LocalCluster::new(meta.clone())),
        };

        if let Some(owner) = self.owner {
            settings.owner = owner;
        }

        log::info!(
            "Starting cache node {} of {} (registry: {} handles, cluster timeout: {})...",
            settings.owner,
            placement.nodes(),
            settings.registry_size,
            crate::fmt::format_duration(settings.cluster_timeout)
        );

        let mut manager = CacheManager::new(&settings, placement, data, meta, cluster, clock);
        if let Some(config) = config {
            manager = manager.with_config(config);
        }
        let manager = Arc::new(manager);

        if self.maintenance {
            run_maintenance_loop(manager.clone(), settings.maintenance_interval);
        }

        manager
    }
}

#[cfg(test)]
mod tests {
    use crate::backing::{DataBacking, MemoryDataBacking, MemoryMetaBacking, MetaBacking};
    use crate::builder::Builder;
    use crate::clock::ManualClock;
    use crate::config::{CacheConfig, CacheSettings, EngineSettings};
    use crate::mnode::Timeout;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn defaults_form_a_single_node() {
        crate::testing::test_async(async {
            let manager = Builder::new().build().await;

            assert_eq!(manager.owner(), 0);
            assert_eq!(manager.registry().placement().nodes(), 1);
            assert_eq!(manager.registry().capacity(), 65536);
            assert_eq!(manager.config().is_none(), true);
            assert_eq!(manager.is_running(), true);
        });
    }

    #[test]
    fn settings_can_be_overwritten() {
        crate::testing::test_async(async {
            let manager = Builder::new()
                .with_settings(EngineSettings {
                    registry_size: 16,
                    ..EngineSettings::default()
                })
                .with_owner(3)
                .build()
                .await;

            assert_eq!(manager.owner(), 3);
            assert_eq!(manager.registry().capacity(), 16);
        });
    }

    #[test]
    fn maintenance_runs_in_the_background() {
        crate::testing::test_async(async {
            let clock = Arc::new(ManualClock::new(1_000_000));
            let data = Arc::new(MemoryDataBacking::new());
            let meta = Arc::new(MemoryMetaBacking::new());
            let manager = Builder::new()
                .with_clock(clock.clone())
                .with_data(data.clone())
                .with_meta(meta.clone())
                .with_settings(EngineSettings {
                    maintenance_interval: Duration::from_millis(10),
                    ..EngineSettings::default()
                })
                .enable_maintenance()
                .build()
                .await;

            let config = CacheConfig::<String, String>::json("test")
                .unwrap()
                .with_settings(CacheSettings {
                    expire_timeout: Timeout::Millis(100),
                    ..CacheSettings::default()
                })
                .unwrap();
            let handle = manager.handle_for(&config, &"key".to_owned()).unwrap();
            let _ = manager
                .put(&handle, &config, &"value".to_owned())
                .await
                .unwrap();
            let _ = manager.remove(&handle, &config).await.unwrap();
            clock.advance(Duration::from_secs(1));

            // Wait until the maintenance task cleaned up both stores...
            for _ in 0..100 {
                if data.count().await.unwrap() == 0 && meta.count().await.unwrap() == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(data.count().await.unwrap(), 0);
            assert_eq!(meta.count().await.unwrap(), 0);

            manager.close();
        });
    }
}
