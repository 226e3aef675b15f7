//! Distcache is a versioned, content-addressed cache engine for clustered applications.
//!
//! # Introduction
//! Each cached entry is described by an immutable [MetadataSnapshot](mnode::MetadataSnapshot)
//! which points to the serialized value (a **blob**) by its hash. Entries are identified by the
//! hash of their namespace (the cache name) and their serialized key. A node keeps one
//! [EntryHandle](entry::EntryHandle) per entry in memory, which holds the current snapshot.
//! All changes are performed by swapping in a new snapshot via compare-and-swap. No lock is
//! ever held while talking to a store or to another node.
//!
//! Writes carry a monotonic version. Snapshots are totally ordered by their version and value
//! hash, so that concurrent or delayed writes (e.g. replicated by another node) converge on all
//! nodes and a removed entry is never resurrected by an outdated write.
//!
//! Reads of absent or expired entries are coalesced: only one task per entry reloads it (by
//! asking the cluster or a [CacheLoader](loader::CacheLoader)) while all others continue with
//! the last known value.
//!
//! # Modules
//! * [manager] contains the engine which implements reads and writes.
//! * [cache] provides a typed view on a single cache.
//! * [backing] defines the blob and metadata stores (and provides in-memory versions).
//! * [cluster] defines the replication boundary and an in-process cluster.
//! * [config] handles the settings file and the per-cache settings.
//! * [builder] wires everything together.
//!
//! # Example
//! ```
//! # use distcache::builder::Builder;
//! # use distcache::cache::Cache;
//! # use distcache::config::CacheConfig;
//! # #[tokio::main]
//! # async fn main() {
//! let manager = Builder::new().build().await;
//! let cache = Cache::new(manager, CacheConfig::<String, String>::json("greetings").unwrap());
//!
//! let _ = cache.put(&"en".to_owned(), &"Hello".to_owned()).await.unwrap();
//! assert_eq!(cache.get(&"en".to_owned()).await.unwrap(), Some("Hello".to_owned()));
//! assert_eq!(cache.get(&"de".to_owned()).await.unwrap(), None);
//! # }
//! ```
#![deny(unused_extern_crates, unused_import_braces)]
#![warn(missing_docs, trivial_casts, trivial_numeric_casts, unused_results)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod backing;
pub mod blob;
pub mod builder;
pub mod cache;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod entry;
pub mod error;
pub mod fmt;
pub mod hash;
pub mod loader;
pub mod manager;
pub mod mnode;
pub mod registry;
pub mod update;

/// Contains the version of the Distcache library.
pub const DISTCACHE_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the Distcache build being used.
pub const DISTCACHE_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up the
/// engine, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // Tests might build several engines, each of them trying to setup logging...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            eprintln!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// The join handle is dropped, the task runs detached.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate distcache;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }
}
