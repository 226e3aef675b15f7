//! Provides the update record which describes a proposed state transition of an entry.
//!
//! An [UpdateRecord] is plain data. It is used to commit a change locally and is also what gets
//! forwarded to the other nodes of the cluster, where it is applied via
//! [CacheManager::put_local_update](crate::manager::CacheManager::put_local_update).
use crate::hash::HashKey;
use crate::mnode::{MetadataSnapshot, Timeout};

/// Describes a new value (or the removal of a value) for an entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateRecord {
    /// Contains the identity of the entry being updated.
    pub key_hash: HashKey,

    /// Contains the hash of the new value or [HashKey::NULL] for a removal.
    pub value_hash: HashKey,

    /// Contains the length of the new value blob.
    pub value_length: u64,

    /// Contains the version assigned to this update.
    pub version: u64,

    /// Contains the hash of the namespace of the entry.
    pub namespace_hash: HashKey,

    /// Contains the accessed (idle) timeout to apply.
    pub accessed_timeout: Timeout,

    /// Contains the modified timeout to apply.
    pub modified_timeout: Timeout,

    /// Contains the lease timeout to apply.
    pub lease_timeout: Timeout,

    /// Contains the user flags to apply.
    pub flags: u64,
}

impl UpdateRecord {
    /// Re-creates the update record which yielded the given snapshot.
    pub fn from_snapshot(snapshot: &MetadataSnapshot) -> Self {
        UpdateRecord {
            key_hash: snapshot.key_hash,
            value_hash: snapshot.value_hash,
            value_length: snapshot.value_length,
            version: snapshot.version,
            namespace_hash: snapshot.namespace_hash,
            accessed_timeout: snapshot.accessed_timeout,
            modified_timeout: snapshot.modified_timeout,
            lease_timeout: snapshot.lease_timeout,
            flags: snapshot.flags,
        }
    }

    /// Determines if this update removes the value of the entry.
    pub fn is_remove(&self) -> bool {
        self.value_hash.is_null()
    }
}
