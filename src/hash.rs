//! Provides the content hashes used to identify entries and values.
//!
//! Every entry of a cache is identified by a [HashKey] which is derived from the namespace of
//! the cache and the serialized logical key. Values are identified the same way, using the
//! digest of their compressed, serialized bytes. Therefore equal values share a single blob
//! no matter how many entries or versions point to them.
//!
//! Hashing a key requires serializing it, which isn't free. A [KeyCache] remembers the hashes
//! of recently used keys, so that hot keys are only serialized once. Note that this is purely
//! an optimization - a hash can always be recomputed from its key.
//!
//! # Examples
//! ```
//! # use distcache::hash::{hash_key, hash_namespace, HashKey};
//! let namespace = hash_namespace("sessions");
//!
//! // Equal keys in the same namespace yield the same hash...
//! assert_eq!(hash_key(&namespace, b"user-42"), hash_key(&namespace, b"user-42"));
//!
//! // ..whereas the same key in another namespace doesn't.
//! assert_ne!(hash_key(&namespace, b"user-42"), hash_key(&hash_namespace("other"), b"user-42"));
//!
//! // A real digest is never mistaken for the "no value" sentinel.
//! assert_eq!(HashKey::NULL.is_null(), true);
//! assert_eq!(namespace.is_null(), false);
//! ```
use std::fmt;
use std::fmt::{Debug, Display};
use std::hash::Hash;

use bytes::Bytes;
use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Contains the number of bytes of a hash.
pub const HASH_LENGTH: usize = 32;

/// Represents a fixed size SHA-256 digest.
///
/// The all-zero hash is reserved as [HashKey::NULL] to represent "no value". Hashes are ordered
/// by their bytes, which is used as tie-break when two snapshots carry the same version.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HashKey([u8; HASH_LENGTH]);

impl HashKey {
    /// Represents the sentinel used for "no value".
    pub const NULL: HashKey = HashKey([0; HASH_LENGTH]);

    /// Wraps the given digest.
    pub fn new(bytes: [u8; HASH_LENGTH]) -> Self {
        HashKey(bytes)
    }

    /// Computes the SHA-256 digest of the given data.
    pub fn of(data: &[u8]) -> Self {
        HashKey(Sha256::digest(data).into())
    }

    /// Determines if this is the "no value" sentinel.
    pub fn is_null(&self) -> bool {
        self.0 == [0; HASH_LENGTH]
    }

    /// Provides access to the raw digest.
    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    /// Parses a hash from its hex representation.
    pub fn from_hex(hex_string: &str) -> anyhow::Result<Self> {
        let mut bytes = [0; HASH_LENGTH];
        hex::decode_to_slice(hex_string, &mut bytes)
            .map_err(|error| anyhow::anyhow!("Cannot parse '{}' as hash: {}", hex_string, error))?;

        Ok(HashKey(bytes))
    }

    /// Returns the leading 32 bits of the digest.
    ///
    /// This is used to map a hash onto a node of the cluster.
    pub fn prefix(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl Display for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{}", hex::encode(&self.0[..8]))
        }
    }
}

impl Debug for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashKey({})", hex::encode(self.0))
    }
}

/// Computes the hash of a namespace (usually the name of a cache).
pub fn hash_namespace(namespace: &str) -> HashKey {
    HashKey::of(namespace.as_bytes())
}

/// Computes the identity of an entry based on its namespace and its serialized key.
///
/// The key is length-prefixed so that no two (namespace, key) pairs can produce the same
/// input to the digest.
pub fn hash_key(namespace: &HashKey, key: &[u8]) -> HashKey {
    let mut digest = Sha256::new();
    digest.update(namespace.as_bytes());
    digest.update((key.len() as u64).to_be_bytes());
    digest.update(key);

    HashKey(digest.finalize().into())
}

/// Remembers the hashes (and serialized forms) of recently used keys.
///
/// The cache is keyed by the natural equality of the key and drops the least recently used
/// entry once **capacity** is reached.
pub struct KeyCache<K> {
    capacity: usize,
    map: Mutex<LinkedHashMap<K, (HashKey, Bytes)>>,
}

impl<K: Hash + Eq + Clone> KeyCache<K> {
    /// Creates a cache which keeps up to **capacity** keys.
    pub fn new(capacity: usize) -> Self {
        KeyCache {
            capacity,
            map: Mutex::new(LinkedHashMap::new()),
        }
    }

    /// Returns the cached hash and serialized key or computes them using the given function.
    pub fn get_or_compute<F>(&self, key: &K, compute: F) -> anyhow::Result<(HashKey, Bytes)>
    where
        F: FnOnce(&K) -> anyhow::Result<(HashKey, Bytes)>,
    {
        if let Some(result) = self.map.lock().get_refresh(key) {
            return Ok(result.clone());
        }

        // Computed outside of the lock, concurrent callers might compute the same key twice...
        let result = compute(key)?;

        let mut map = self.map.lock();
        let _ = map.insert(key.clone(), result.clone());
        while map.len() > self.capacity {
            let _ = map.pop_front();
        }

        Ok(result)
    }

    /// Returns the number of cached keys.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Determines if no key is cached.
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Drops all cached keys.
    pub fn clear(&self) {
        self.map.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use crate::hash::{hash_key, hash_namespace, HashKey, KeyCache};
    use bytes::Bytes;

    #[test]
    fn hashes_are_stable_and_ordered() {
        let namespace = hash_namespace("test");
        let first = hash_key(&namespace, b"a");

        assert_eq!(first, hash_key(&namespace, b"a"));
        assert_ne!(first, hash_key(&namespace, b"b"));

        // The null sentinel sorts before every real digest...
        assert_eq!(HashKey::NULL < first, true);

        // Hex round trips are lossless...
        let hex = hex::encode(first.as_bytes());
        assert_eq!(HashKey::from_hex(&hex).unwrap(), first);
        assert_eq!(HashKey::from_hex("xyz").is_err(), true);
    }

    #[test]
    fn key_prefixes_do_not_collide() {
        // "ab" + "c" must not hash like "a" + "bc" - the length prefix takes care of that.
        let ab = hash_key(&hash_namespace("ab"), b"c");
        let a = hash_key(&hash_namespace("a"), b"bc");
        assert_ne!(ab, a);
    }

    #[test]
    fn key_cache_computes_once_and_evicts() {
        let cache = KeyCache::new(2);
        let mut computations = 0;

        for _ in 0..3 {
            let _ = cache
                .get_or_compute(&"a".to_owned(), |key| {
                    computations += 1;
                    Ok((HashKey::of(key.as_bytes()), Bytes::from(key.clone())))
                })
                .unwrap();
        }
        assert_eq!(computations, 1);

        let compute = |key: &String| Ok((HashKey::of(key.as_bytes()), Bytes::new()));
        let _ = cache.get_or_compute(&"b".to_owned(), compute).unwrap();
        let _ = cache.get_or_compute(&"c".to_owned(), compute).unwrap();
        assert_eq!(cache.len(), 2);

        // "a" was the least recently used key and is therefore recomputed...
        let _ = cache
            .get_or_compute(&"a".to_owned(), |key| {
                computations += 1;
                Ok((HashKey::of(key.as_bytes()), Bytes::new()))
            })
            .unwrap();
        assert_eq!(computations, 2);

        cache.clear();
        assert_eq!(cache.is_empty(), true);
    }
}
