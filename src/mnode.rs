//! Provides the immutable metadata snapshot ("mnode") of a cache entry.
//!
//! A [MetadataSnapshot] describes which value an entry currently points to (by its
//! [HashKey]), which version this is and when it was last accessed or modified. Snapshots are
//! never mutated. Each change produces a new snapshot which is then atomically swapped into the
//! [EntryHandle](crate::entry::EntryHandle).
//!
//! Snapshots are totally ordered by their version. If two snapshots share the same version, the
//! one with the greater value hash wins (see [MetadataSnapshot::supersedes]). This order is used
//! everywhere to reject stale concurrent writes in a deterministic way.
//!
//! # Expiry
//! Entries expire lazily. There are two independent axes:
//! * **accessed timeout**: the entry is expired if it wasn't read for this long.
//! * **modified timeout**: the entry is expired if it wasn't written for this long.
//!
//! Additionally a **lease timeout** governs for how long the last writer retains its claim on
//! the entry. An expired lease simply reads as "no owner".
//!
//! # Examples
//! ```
//! # use distcache::hash::HashKey;
//! # use distcache::mnode::{MetadataSnapshot, Timeout};
//! let snapshot = MetadataSnapshot {
//!     last_update_time: 1_000,
//!     last_access_time: 1_000,
//!     modified_timeout: Timeout::Millis(500),
//!     ..MetadataSnapshot::unloaded(HashKey::of(b"key"))
//! };
//!
//! assert_eq!(snapshot.is_entry_expired(1_500), false);
//! assert_eq!(snapshot.is_entry_expired(1_501), true);
//! ```
use std::time::Duration;

use crate::hash::HashKey;
use crate::update::UpdateRecord;

/// Represents a timeout which is either a number of milliseconds or infinite.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Timeout {
    /// The timeout never elapses.
    Infinite,

    /// The timeout elapses after the given number of milliseconds.
    Millis(u64),
}

impl Timeout {
    /// Determines if the timeout has elapsed for something which happened at **since**.
    ///
    /// Note that a timeout has only elapsed if strictly more time than the timeout itself
    /// has passed.
    ///
    /// # Examples
    /// ```
    /// # use distcache::mnode::Timeout;
    /// assert_eq!(Timeout::Millis(100).has_elapsed(1_000, 1_100), false);
    /// assert_eq!(Timeout::Millis(100).has_elapsed(1_000, 1_101), true);
    /// assert_eq!(Timeout::Infinite.has_elapsed(0, u64::MAX), false);
    /// ```
    pub fn has_elapsed(&self, since: u64, now: u64) -> bool {
        match self {
            Timeout::Infinite => false,
            Timeout::Millis(timeout) => now.saturating_sub(since) > *timeout,
        }
    }

    /// Returns the timeout in milliseconds or **None** if it is infinite.
    pub fn as_millis(&self) -> Option<u64> {
        match self {
            Timeout::Infinite => None,
            Timeout::Millis(millis) => Some(*millis),
        }
    }

    /// Determines if this timeout never elapses.
    pub fn is_infinite(&self) -> bool {
        matches!(self, Timeout::Infinite)
    }

    /// Scales the timeout by the given fraction (an infinite timeout stays infinite).
    pub fn scale(&self, fraction: f64) -> Timeout {
        match self {
            Timeout::Infinite => Timeout::Infinite,
            Timeout::Millis(millis) => Timeout::Millis((*millis as f64 * fraction) as u64),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Timeout::Millis(duration.as_millis().min(u64::MAX as u128) as u64)
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::Infinite
    }
}

/// Represents an immutable, versioned view of the state of a cache entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataSnapshot {
    /// Contains the identity of the entry.
    pub key_hash: HashKey,

    /// Contains the hash of the namespace (cache) the entry belongs to.
    pub namespace_hash: HashKey,

    /// Contains the hash of the value blob or [HashKey::NULL] if there is no value.
    pub value_hash: HashKey,

    /// Contains the length of the (compressed) value blob.
    pub value_length: u64,

    /// Contains the version of this snapshot.
    pub version: u64,

    /// Determines after which time without access the entry expires.
    pub accessed_timeout: Timeout,

    /// Determines after which time without modification the entry expires.
    pub modified_timeout: Timeout,

    /// Determines how long the lease owner keeps its claim on the entry.
    pub lease_timeout: Timeout,

    /// Contains the id of the node which last touched the entry.
    pub lease_owner: Option<u32>,

    /// Contains the timestamp (epoch millis) of the last recorded access.
    pub last_access_time: u64,

    /// Contains the timestamp (epoch millis) of the last modification.
    pub last_update_time: u64,

    /// Contains opaque user flags which are passed through.
    pub flags: u64,

    /// Determines if this is a placeholder for an entry which has never been loaded.
    ///
    /// In contrast, an explicit null (this flag being false and the value hash being null)
    /// marks an entry which is known to be absent.
    pub implicit_null: bool,

    /// Determines if this is the placeholder installed in a freshly created handle for which
    /// the durable metadata hasn't been fetched yet.
    pub unloaded: bool,
}

impl MetadataSnapshot {
    /// Creates the placeholder for an entry whose metadata hasn't been fetched yet.
    pub fn unloaded(key_hash: HashKey) -> Self {
        MetadataSnapshot {
            unloaded: true,
            ..MetadataSnapshot::implicit_null(key_hash)
        }
    }

    /// Creates the placeholder for an entry which is known to have never been loaded.
    pub fn implicit_null(key_hash: HashKey) -> Self {
        MetadataSnapshot {
            key_hash,
            namespace_hash: HashKey::NULL,
            value_hash: HashKey::NULL,
            value_length: 0,
            version: 0,
            accessed_timeout: Timeout::Infinite,
            modified_timeout: Timeout::Infinite,
            lease_timeout: Timeout::Infinite,
            lease_owner: None,
            last_access_time: 0,
            last_update_time: 0,
            flags: 0,
            implicit_null: true,
            unloaded: false,
        }
    }

    /// Creates the snapshot which results from committing the given update.
    pub fn from_update(update: &UpdateRecord, lease_owner: Option<u32>, now: u64) -> Self {
        MetadataSnapshot {
            key_hash: update.key_hash,
            namespace_hash: update.namespace_hash,
            value_hash: update.value_hash,
            value_length: update.value_length,
            version: update.version,
            accessed_timeout: update.accessed_timeout,
            modified_timeout: update.modified_timeout,
            lease_timeout: update.lease_timeout,
            lease_owner,
            last_access_time: now,
            last_update_time: now,
            flags: update.flags,
            implicit_null: false,
            unloaded: false,
        }
    }

    /// Creates a copy of this snapshot with the given access time.
    pub fn with_access_time(&self, now: u64) -> Self {
        MetadataSnapshot {
            last_access_time: now,
            ..self.clone()
        }
    }

    /// Creates a copy of this snapshot which records the given node as lease owner.
    ///
    /// Everything which describes the value (version, hash, update time) is retained.
    pub fn with_lease(&self, owner: Option<u32>, now: u64) -> Self {
        MetadataSnapshot {
            lease_owner: owner,
            last_access_time: now.max(self.last_access_time),
            ..self.clone()
        }
    }

    /// Determines if this snapshot points to no value at all.
    pub fn is_null(&self) -> bool {
        self.value_hash.is_null()
    }

    /// Determines if either the accessed or the modified axis of this entry has expired.
    pub fn is_entry_expired(&self, now: u64) -> bool {
        self.accessed_timeout.has_elapsed(self.last_access_time, now)
            || self.modified_timeout.has_elapsed(self.last_update_time, now)
    }

    /// Determines if this snapshot can be used to serve reads without reloading it.
    pub fn is_valid(&self, now: u64) -> bool {
        !self.unloaded && !self.implicit_null && !self.is_entry_expired(now)
    }

    /// Determines if the lease of the current owner has expired.
    pub fn is_lease_expired(&self, now: u64) -> bool {
        self.lease_timeout.has_elapsed(self.last_update_time, now)
    }

    /// Returns the lease owner or **None** if there is no owner or if the lease has expired.
    pub fn lease_owner_at(&self, now: u64) -> Option<u32> {
        if self.is_lease_expired(now) {
            None
        } else {
            self.lease_owner
        }
    }

    /// Determines if this snapshot is strictly newer than the given one.
    ///
    /// Snapshots are ordered by their version, equal versions are ordered by their value hash.
    pub fn supersedes(&self, other: &MetadataSnapshot) -> bool {
        (self.version, self.value_hash) > (other.version, other.value_hash)
    }

    /// Determines if the given update would be accepted on top of this snapshot.
    pub fn accepts(&self, update: &UpdateRecord) -> bool {
        (update.version, update.value_hash) > (self.version, self.value_hash)
    }

    /// Computes the version to use for the next write on top of this snapshot.
    ///
    /// The new version is at least one greater than the current one, but follows the wall clock
    /// so that versions stay roughly time ordered even after a restart. Returns **None** once
    /// the version space is exhausted.
    pub fn next_version(&self, now: u64) -> Option<u64> {
        self.version.checked_add(1).map(|next| next.max(now))
    }

    /// Determines if the access time should be rewritten (durably) when reading at **now**.
    ///
    /// To avoid a write per read, this is only the case once more than the given fraction of
    /// the idle timeout has elapsed since the last recorded access.
    pub fn needs_access_touch(&self, idle_window: f64, now: u64) -> bool {
        match self.accessed_timeout.scale(idle_window) {
            Timeout::Infinite => false,
            window => window.has_elapsed(self.last_access_time, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::hash::HashKey;
    use crate::mnode::{MetadataSnapshot, Timeout};
    use crate::update::UpdateRecord;

    fn snapshot(version: u64, value: &[u8]) -> MetadataSnapshot {
        MetadataSnapshot {
            version,
            value_hash: HashKey::of(value),
            implicit_null: false,
            ..MetadataSnapshot::implicit_null(HashKey::of(b"key"))
        }
    }

    #[test]
    fn placeholders_are_never_valid() {
        let unloaded = MetadataSnapshot::unloaded(HashKey::of(b"key"));
        assert_eq!(unloaded.unloaded, true);
        assert_eq!(unloaded.implicit_null, true);
        assert_eq!(unloaded.is_valid(0), false);

        let implicit = MetadataSnapshot::implicit_null(HashKey::of(b"key"));
        assert_eq!(implicit.unloaded, false);
        assert_eq!(implicit.is_valid(0), false);

        // An explicit null is valid, it is a confirmed absence...
        let explicit = MetadataSnapshot {
            implicit_null: false,
            ..implicit
        };
        assert_eq!(explicit.is_null(), true);
        assert_eq!(explicit.is_valid(0), true);
    }

    #[test]
    fn expiry_is_lazy_and_exact() {
        let now = 1_700_000_000_000;
        let modified = MetadataSnapshot {
            last_update_time: now,
            last_access_time: now,
            modified_timeout: Timeout::Millis(60_000),
            ..snapshot(1, b"a")
        };
        assert_eq!(modified.is_entry_expired(now), false);
        assert_eq!(modified.is_entry_expired(now + 60_000), false);
        assert_eq!(modified.is_entry_expired(now + 60_001), true);

        // Reading doesn't help against the modified axis...
        assert_eq!(
            modified
                .with_access_time(now + 59_000)
                .is_entry_expired(now + 60_001),
            true
        );

        let idle = MetadataSnapshot {
            last_update_time: now,
            last_access_time: now,
            accessed_timeout: Timeout::Millis(1_000),
            ..snapshot(1, b"a")
        };
        assert_eq!(idle.is_entry_expired(now + 1_001), true);
        assert_eq!(
            idle.with_access_time(now + 900).is_entry_expired(now + 1_001),
            false
        );
    }

    #[test]
    fn expired_leases_read_as_no_owner() {
        let lease = MetadataSnapshot {
            last_update_time: 10_000,
            lease_timeout: Timeout::Millis(5_000),
            lease_owner: Some(3),
            ..snapshot(1, b"a")
        };

        assert_eq!(lease.lease_owner_at(15_000), Some(3));
        assert_eq!(lease.lease_owner_at(15_001), None);

        // The lease doesn't affect the value...
        assert_eq!(lease.is_entry_expired(15_001), false);
    }

    #[test]
    fn snapshots_are_totally_ordered() {
        let a = snapshot(5, b"a");
        let b = snapshot(5, b"b");
        let newer = snapshot(6, b"a");

        assert_eq!(newer.supersedes(&a), true);
        assert_eq!(a.supersedes(&newer), false);

        // Equal versions are decided by the value hash - exactly one of them wins...
        assert_ne!(a.supersedes(&b), b.supersedes(&a));

        // Nothing supersedes itself...
        assert_eq!(a.supersedes(&a.clone()), false);

        let update = UpdateRecord {
            version: 5,
            value_hash: a.value_hash,
            ..UpdateRecord::from_snapshot(&a)
        };
        assert_eq!(a.accepts(&update), false);
        assert_eq!(MetadataSnapshot::implicit_null(a.key_hash).accepts(&update), true);
    }

    #[test]
    fn versions_follow_the_clock_but_always_increase() {
        let old = snapshot(100, b"a");
        assert_eq!(old.next_version(50), Some(101));
        assert_eq!(old.next_version(5_000), Some(5_000));

        let exhausted = snapshot(u64::MAX, b"a");
        assert_eq!(exhausted.next_version(5_000), None);
    }

    #[test]
    fn access_touch_respects_the_idle_window() {
        let idle = MetadataSnapshot {
            last_access_time: 10_000,
            accessed_timeout: Timeout::Millis(4_000),
            ..snapshot(1, b"a")
        };

        // 25% of 4s is 1s...
        assert_eq!(idle.needs_access_touch(0.25, 11_000), false);
        assert_eq!(idle.needs_access_touch(0.25, 11_001), true);

        // Without an idle timeout there is nothing to maintain...
        assert_eq!(snapshot(1, b"a").needs_access_touch(0.25, u64::MAX), false);
    }
}
