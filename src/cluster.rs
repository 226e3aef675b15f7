//! Provides the replication boundary which connects the engine to the other nodes of a cluster.
//!
//! After each local commit, the engine hands the [UpdateRecord] to its [ClusterBacking] which
//! forwards it to the owners of the entry. The engine doesn't wait for this, replication is
//! fire-and-forget from the caller's perspective. If an entry is absent or expired, the engine
//! asks the cluster for the authoritative snapshot before invoking a loader.
//!
//! Two implementations are provided:
//! * [LocalCluster] for single node setups. It answers all requests from the local metadata
//!   store and drops all updates.
//! * [PeerCluster] which connects several engines within the same process. Each node runs an
//!   actor which receives [PeerMessage]s via a queue. Requests which expect an answer carry a
//!   **oneshot** sender and are subject to a timeout. Updates are retried with an exponential
//!   backoff if the queue of a peer is full.
//!
//! # Example
//! Wiring up three nodes:
//! ```
//! # use distcache::builder::Builder;
//! # use distcache::cluster::PeerNetwork;
//! # #[tokio::main]
//! # async fn main() {
//! let network = PeerNetwork::new(3, 1024);
//! for node in 0..3 {
//!     let manager = Builder::new().with_peers(&network, node).build().await;
//!     network.attach(node, manager).unwrap();
//! }
//! # }
//! ```
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};

use crate::backing::{DataBacking, MetaBacking};
use crate::entry::Placement;
use crate::hash::HashKey;
use crate::manager::CacheManager;
use crate::mnode::MetadataSnapshot;
use crate::update::UpdateRecord;

/// Determines how often sending an update to a peer is attempted.
const MAX_SEND_ATTEMPTS: u32 = 4;

/// Determines the initial delay between two attempts, this doubles with each attempt.
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// Connects the engine to the other nodes of the cluster.
///
/// All operations are best-effort: the engine logs failures and continues with its local state.
#[async_trait]
pub trait ClusterBacking: Send + Sync {
    /// Fetches the authoritative snapshot of the given entry.
    async fn fetch_authoritative(
        &self,
        key_hash: &HashKey,
    ) -> anyhow::Result<Option<MetadataSnapshot>>;

    /// Forwards a locally committed update to the owners of the entry.
    async fn propagate(
        &self,
        key_hash: &HashKey,
        update: &UpdateRecord,
        snapshot: &MetadataSnapshot,
    ) -> anyhow::Result<()>;

    /// Forwards an updated access time to the owners of the entry.
    async fn update_time(&self, key_hash: &HashKey, snapshot: &MetadataSnapshot)
        -> anyhow::Result<()>;

    /// Fetches a blob which is missing locally from one of the owners of the entry.
    async fn load_data(
        &self,
        key_hash: &HashKey,
        value_hash: &HashKey,
    ) -> anyhow::Result<Option<Bytes>>;
}

/// Represents a cluster which only consists of the local node.
pub struct LocalCluster {
    meta: Arc<dyn MetaBacking>,
}

impl LocalCluster {
    /// Creates a cluster which answers from the given metadata store.
    pub fn new(meta: Arc<dyn MetaBacking>) -> Self {
        LocalCluster { meta }
    }
}

#[async_trait]
impl ClusterBacking for LocalCluster {
    async fn fetch_authoritative(
        &self,
        key_hash: &HashKey,
    ) -> anyhow::Result<Option<MetadataSnapshot>> {
        self.meta.load_snapshot(key_hash).await
    }

    async fn propagate(
        &self,
        _key_hash: &HashKey,
        _update: &UpdateRecord,
        _snapshot: &MetadataSnapshot,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn update_time(
        &self,
        _key_hash: &HashKey,
        _snapshot: &MetadataSnapshot,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn load_data(
        &self,
        _key_hash: &HashKey,
        _value_hash: &HashKey,
    ) -> anyhow::Result<Option<Bytes>> {
        Ok(None)
    }
}

/// Enumerates the messages exchanged between the nodes of a [PeerNetwork].
pub enum PeerMessage {
    /// Applies an update committed by another node.
    Update {
        /// Contains the update to apply.
        update: UpdateRecord,
        /// Contains the node which performed the update.
        lease_owner: Option<u32>,
        /// Contains the blob of the new value (if known).
        data: Option<Bytes>,
    },

    /// Applies an access time recorded by another node.
    UpdateTime(MetadataSnapshot),

    /// Requests the local snapshot of an entry.
    FetchEntry {
        /// Contains the entry to fetch.
        key_hash: HashKey,
        /// Receives the snapshot.
        reply: oneshot::Sender<Option<MetadataSnapshot>>,
    },

    /// Requests a blob.
    FetchData {
        /// Contains the hash of the blob to fetch.
        value_hash: HashKey,
        /// Receives the data.
        reply: oneshot::Sender<Option<Bytes>>,
    },
}

/// Connects a fixed number of nodes which run within the same process.
pub struct PeerNetwork {
    placement: Placement,
    senders: Vec<mpsc::Sender<PeerMessage>>,
    receivers: Mutex<Vec<Option<mpsc::Receiver<PeerMessage>>>>,
}

impl PeerNetwork {
    /// Creates a network of the given size where each node has a queue of the given size.
    pub fn new(nodes: u32, queue_size: usize) -> Arc<Self> {
        let placement = Placement::new(nodes);
        let (senders, receivers) = (0..placement.nodes())
            .map(|_| {
                let (sender, receiver) = mpsc::channel(queue_size.max(1));
                (sender, Some(receiver))
            })
            .unzip();

        Arc::new(PeerNetwork {
            placement,
            senders,
            receivers: Mutex::new(receivers),
        })
    }

    /// Returns the placement used to determine the owners of an entry.
    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Creates the cluster backing for the given node.
    ///
    /// The node uses its own metadata and blob stores to answer requests for entries it owns.
    pub fn cluster(
        &self,
        node: u32,
        meta: Arc<dyn MetaBacking>,
        data: Arc<dyn DataBacking>,
        timeout: Duration,
    ) -> PeerCluster {
        PeerCluster {
            node,
            placement: self.placement,
            peers: self.senders.clone(),
            meta,
            data,
            timeout,
        }
    }

    /// Starts the actor which processes the messages sent to the given node.
    ///
    /// The actor runs until the given manager is closed. Fails if the node doesn't exist or if
    /// it has already been attached.
    pub fn attach(&self, node: u32, manager: Arc<CacheManager>) -> anyhow::Result<()> {
        let mut receiver = self
            .receivers
            .lock()
            .get_mut(node as usize)
            .and_then(Option::take)
            .ok_or_else(|| anyhow::anyhow!("Node {} is unknown or already attached.", node))?;

        crate::spawn!(async move {
            let mut closed = manager.closed_notifier();
            while manager.is_running() {
                tokio::select! {
                    _ = closed.recv() => return,
                    message = receiver.recv() => match message {
                        Some(message) => handle_message(&manager, message).await,
                        None => return,
                    }
                }
            }
        });

        Ok(())
    }
}

async fn handle_message(manager: &CacheManager, message: PeerMessage) {
    match message {
        PeerMessage::Update {
            update,
            lease_owner,
            data,
        } => {
            if let Err(error) = manager.put_local_update(update, lease_owner, data).await {
                log::warn!("Failed to apply a replicated update: {:#}", error);
            }
        }
        PeerMessage::UpdateTime(snapshot) => {
            let _ = manager.save_local_update_time(&snapshot).await;
        }
        PeerMessage::FetchEntry { key_hash, reply } => {
            let _ = reply.send(manager.load_local_entry(&key_hash).await);
        }
        PeerMessage::FetchData { value_hash, reply } => {
            let _ = reply.send(manager.load_local_data(&value_hash).await);
        }
    }
}

/// Provides the cluster backing of a node within a [PeerNetwork].
pub struct PeerCluster {
    node: u32,
    placement: Placement,
    peers: Vec<mpsc::Sender<PeerMessage>>,
    meta: Arc<dyn MetaBacking>,
    data: Arc<dyn DataBacking>,
    timeout: Duration,
}

impl PeerCluster {
    /// Returns the owners of the given entry, without the local node.
    fn remote_owners(&self, key_hash: &HashKey) -> Vec<u32> {
        let owners = self.placement.owners(key_hash);
        let mut result = Vec::with_capacity(3);
        for node in [owners.primary, owners.secondary, owners.tertiary] {
            if node != self.node && !result.contains(&node) {
                result.push(node);
            }
        }

        result
    }

    fn peer(&self, node: u32) -> anyhow::Result<&mpsc::Sender<PeerMessage>> {
        self.peers
            .get(node as usize)
            .ok_or_else(|| anyhow::anyhow!("Unknown node: {}", node))
    }

    /// Sends a message, retrying with an exponential backoff while the queue is full.
    async fn send_with_retry(&self, node: u32, mut message: PeerMessage) -> anyhow::Result<()> {
        let peer = self.peer(node)?;
        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..=MAX_SEND_ATTEMPTS {
            match peer.send_timeout(message, self.timeout).await {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Closed(_)) => {
                    return Err(anyhow::anyhow!("Node {} has been shut down.", node))
                }
                Err(SendTimeoutError::Timeout(returned)) => {
                    log::debug!(
                        "Queue of node {} is full (attempt {} of {})...",
                        node,
                        attempt,
                        MAX_SEND_ATTEMPTS
                    );
                    message = returned;
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }

        Err(anyhow::anyhow!(
            "Failed to reach node {} after {} attempts.",
            node,
            MAX_SEND_ATTEMPTS
        ))
    }

    /// Sends a request to the given node and awaits its answer.
    async fn request<T>(
        &self,
        node: u32,
        message: impl FnOnce(oneshot::Sender<T>) -> PeerMessage,
    ) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        let peer = self.peer(node)?;
        peer.send_timeout(message(tx), self.timeout)
            .await
            .map_err(|_| anyhow::anyhow!("Failed to send a request to node {}.", node))?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(anyhow::anyhow!("Node {} dropped the request.", node)),
            Err(_) => Err(anyhow::anyhow!("Node {} didn't answer in time.", node)),
        }
    }
}

#[async_trait]
impl ClusterBacking for PeerCluster {
    async fn fetch_authoritative(
        &self,
        key_hash: &HashKey,
    ) -> anyhow::Result<Option<MetadataSnapshot>> {
        let primary = self.placement.owners(key_hash).primary;
        if primary != self.node {
            let key_hash = *key_hash;
            match self
                .request(primary, |reply| PeerMessage::FetchEntry { key_hash, reply })
                .await
            {
                Ok(Some(snapshot)) => return Ok(Some(snapshot)),
                Ok(None) => (),
                Err(error) => log::warn!(
                    "Cannot fetch {} from its primary owner: {:#}",
                    key_hash,
                    error
                ),
            }
        }

        self.meta.load_snapshot(key_hash).await
    }

    async fn propagate(
        &self,
        key_hash: &HashKey,
        update: &UpdateRecord,
        snapshot: &MetadataSnapshot,
    ) -> anyhow::Result<()> {
        let data = if update.is_remove() {
            None
        } else {
            self.data.load_blob(&update.value_hash).await?
        };

        let mut failures = Vec::new();
        for node in self.remote_owners(key_hash) {
            let message = PeerMessage::Update {
                update: update.clone(),
                lease_owner: snapshot.lease_owner,
                data: data.clone(),
            };
            if let Err(error) = self.send_with_retry(node, message).await {
                failures.push(format!("{:#}", error));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "Failed to replicate {}: {}",
                key_hash,
                failures.join(", ")
            ))
        }
    }

    async fn update_time(
        &self,
        key_hash: &HashKey,
        snapshot: &MetadataSnapshot,
    ) -> anyhow::Result<()> {
        // Access times are approximate anyway, therefore we don't retry...
        for node in self.remote_owners(key_hash) {
            let _ = self
                .peer(node)?
                .try_send(PeerMessage::UpdateTime(snapshot.clone()));
        }

        Ok(())
    }

    async fn load_data(
        &self,
        key_hash: &HashKey,
        value_hash: &HashKey,
    ) -> anyhow::Result<Option<Bytes>> {
        for node in self.remote_owners(key_hash) {
            let value_hash = *value_hash;
            match self
                .request(node, |reply| PeerMessage::FetchData { value_hash, reply })
                .await
            {
                Ok(Some(data)) => return Ok(Some(data)),
                Ok(None) => (),
                Err(error) => log::debug!("Cannot fetch {} from node {}: {:#}", value_hash, node, error),
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use crate::backing::{MemoryDataBacking, MemoryMetaBacking};
    use crate::builder::Builder;
    use crate::cluster::PeerNetwork;
    use crate::config::CacheConfig;
    use crate::hash::HashKey;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn remote_owners_never_contain_the_local_node() {
        let network = PeerNetwork::new(5, 16);
        let cluster = network.cluster(
            2,
            Arc::new(MemoryMetaBacking::new()),
            Arc::new(MemoryDataBacking::new()),
            Duration::from_secs(1),
        );

        for key in 0..64_u32 {
            let key_hash = HashKey::of(&key.to_be_bytes());
            let owners = cluster.remote_owners(&key_hash);
            assert_eq!(owners.contains(&2), false);
            assert_eq!(owners.len() >= 2, true);
        }
    }

    #[test]
    fn nodes_can_only_be_attached_once() {
        crate::testing::test_async(async {
            let network = PeerNetwork::new(2, 16);
            let manager = Builder::new().with_peers(&network, 0).build().await;

            assert_eq!(network.attach(0, manager.clone()).is_ok(), true);
            assert_eq!(network.attach(0, manager.clone()).is_err(), true);
            assert_eq!(network.attach(7, manager.clone()).is_err(), true);

            manager.close();
        });
    }

    #[test]
    fn updates_are_replicated_to_all_owners() {
        crate::testing::test_async(async {
            let network = PeerNetwork::new(3, 16);
            let mut managers = Vec::new();
            for node in 0..3 {
                let manager = Builder::new().with_peers(&network, node).build().await;
                network.attach(node, manager.clone()).unwrap();
                managers.push(manager);
            }

            let config = CacheConfig::<String, String>::json("test").unwrap();
            let key = "key".to_owned();
            let handle = managers[0].handle_for(&config, &key).unwrap();
            let written = managers[0]
                .put(&handle, &config, &"value".to_owned())
                .await
                .unwrap();

            for manager in &managers[1..] {
                let handle = manager.handle_for(&config, &key).unwrap();
                let mut value = None;
                for _ in 0..100 {
                    value = manager.peek(&handle, &config).await;
                    if value.is_some() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }

                assert_eq!(value, Some("value".to_owned()));
                assert_eq!(handle.snapshot().version, written.snapshot().version);
                assert_eq!(handle.snapshot().lease_owner, Some(0));
            }

            for manager in &managers {
                manager.close();
            }
        });
    }

    #[test]
    fn absent_entries_are_fetched_from_the_primary_owner() {
        crate::testing::test_async(async {
            let network = PeerNetwork::new(3, 16);
            let mut managers = Vec::new();
            for node in 0..3 {
                let manager = Builder::new().with_peers(&network, node).build().await;
                network.attach(node, manager.clone()).unwrap();
                managers.push(manager);
            }

            let config = CacheConfig::<String, String>::json("test").unwrap();
            let key = "key".to_owned();
            let handle = managers[0].handle_for(&config, &key).unwrap();
            let _ = managers[0]
                .put(&handle, &config, &"value".to_owned())
                .await
                .unwrap();

            // Reading via "get" consults the cluster if nothing is known locally...
            let primary = handle.owners().primary as usize;
            let reader = &managers[(primary + 1) % 3];
            let reader_handle = reader.handle_for(&config, &key).unwrap();
            let mut value = None;
            for _ in 0..100 {
                value = reader.get_exact(&reader_handle, &config).await;
                if value.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(value, Some("value".to_owned()));

            for manager in &managers {
                manager.close();
            }
        });
    }
}
