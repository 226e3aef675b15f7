//! Provides the content addressed blob pipeline.
//!
//! Values are serialized using a [CacheSerializer], compressed with gzip and hashed while being
//! written. The resulting [Blob] is stored under its hash, therefore equal values are only
//! stored once and writing the same value twice is a no-op.
//!
//! When reading, the digest of the stored bytes is verified before anything is decompressed or
//! deserialized, so that corrupted data is never returned as a value.
//!
//! # Examples
//! ```
//! # use distcache::blob::{decode, encode, JsonSerializer};
//! let serializer = JsonSerializer::<String>::default();
//!
//! let blob = encode(&serializer, &"Hello".to_owned()).unwrap();
//! assert_eq!(blob, encode(&serializer, &"Hello".to_owned()).unwrap());
//!
//! let value: String = decode(&serializer, &blob.data, &blob.hash).unwrap();
//! assert_eq!(value, "Hello");
//! ```
use std::io::{Read, Write};
use std::marker::PhantomData;

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::hash::HashKey;

/// Converts values into bytes and back.
///
/// Serializers operate on streams so that the blob pipeline can compress and hash the output
/// on the fly.
pub trait CacheSerializer<T>: Send + Sync {
    /// Writes the given value into the given output.
    fn serialize(&self, value: &T, output: &mut dyn Write) -> anyhow::Result<()>;

    /// Reads a value from the given input.
    fn deserialize(&self, input: &mut dyn Read) -> anyhow::Result<T>;
}

/// Serializes values as JSON using **serde**.
pub struct JsonSerializer<T> {
    _type: PhantomData<fn() -> T>,
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        JsonSerializer {
            _type: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> CacheSerializer<T> for JsonSerializer<T> {
    fn serialize(&self, value: &T, output: &mut dyn Write) -> anyhow::Result<()> {
        serde_json::to_writer(output, value)?;
        Ok(())
    }

    fn deserialize(&self, input: &mut dyn Read) -> anyhow::Result<T> {
        Ok(serde_json::from_reader(input)?)
    }
}

/// Represents a compressed, serialized value along with its digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    /// Contains the SHA-256 digest of the data.
    pub hash: HashKey,

    /// Contains the compressed data.
    pub data: Bytes,
}

impl Blob {
    /// Returns the number of bytes of this blob.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Determines if this blob has no data at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Computes the digest of everything written into the underlying writer.
struct HashingWriter<W> {
    inner: W,
    digest: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        HashingWriter {
            inner,
            digest: Sha256::new(),
        }
    }

    fn finish(self) -> (W, HashKey) {
        (self.inner, HashKey::new(self.digest.finalize().into()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.digest.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Serializes, compresses and hashes the given value.
pub fn encode<T, S>(serializer: &S, value: &T) -> anyhow::Result<Blob>
where
    S: CacheSerializer<T> + ?Sized,
{
    let mut encoder = GzEncoder::new(HashingWriter::new(Vec::new()), Compression::default());
    serializer.serialize(value, &mut encoder)?;
    let (data, hash) = encoder.finish()?.finish();

    Ok(Blob {
        hash,
        data: Bytes::from(data),
    })
}

/// Verifies the digest of the given data and decodes the value stored within.
///
/// Fails if the data doesn't match the expected hash or if it cannot be decompressed or
/// deserialized.
pub fn decode<T, S>(serializer: &S, data: &[u8], expected: &HashKey) -> anyhow::Result<T>
where
    S: CacheSerializer<T> + ?Sized,
{
    let actual = HashKey::of(data);
    if &actual != expected {
        return Err(anyhow::anyhow!(
            "Blob digest mismatch: expected {} but found {}",
            expected,
            actual
        ));
    }

    serializer.deserialize(&mut GzDecoder::new(data))
}

/// Serializes a key without compression.
///
/// Keys are hashed rather than stored, therefore compressing them would only waste time.
pub fn encode_key<K, S>(serializer: &S, key: &K) -> anyhow::Result<Bytes>
where
    S: CacheSerializer<K> + ?Sized,
{
    let mut data = Vec::new();
    serializer.serialize(key, &mut data)?;

    Ok(Bytes::from(data))
}

/// Reads a key which has been serialized using [encode_key].
pub fn decode_key<K, S>(serializer: &S, data: &[u8]) -> anyhow::Result<K>
where
    S: CacheSerializer<K> + ?Sized,
{
    let mut input = data;
    serializer.deserialize(&mut input)
}

#[cfg(test)]
mod tests {
    use crate::blob::{decode, decode_key, encode, encode_key, JsonSerializer};
    use crate::hash::HashKey;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Session {
        user: String,
        roles: Vec<String>,
    }

    fn session() -> Session {
        Session {
            user: "tester".to_owned(),
            roles: vec!["admin".to_owned(); 64],
        }
    }

    #[test]
    fn equal_values_yield_equal_blobs() {
        let serializer = JsonSerializer::<Session>::default();
        let blob = encode(&serializer, &session()).unwrap();

        assert_eq!(blob, encode(&serializer, &session()).unwrap());
        assert_eq!(blob.hash, HashKey::of(&blob.data));

        // The repetitive roles compress well...
        assert_eq!(blob.len() < serde_json::to_vec(&session()).unwrap().len() as u64, true);

        let other = Session {
            user: "other".to_owned(),
            ..session()
        };
        assert_ne!(blob.hash, encode(&serializer, &other).unwrap().hash);
    }

    #[test]
    fn corrupted_blobs_are_detected() {
        let serializer = JsonSerializer::<Session>::default();
        let blob = encode(&serializer, &session()).unwrap();

        let mut data = blob.data.to_vec();
        let last = data.len() - 1;
        data[last] ^= 0xFF;

        assert_eq!(decode(&serializer, &data, &blob.hash).is_err(), true);

        // Correct data under the wrong hash is rejected as well...
        assert_eq!(
            decode(&serializer, &blob.data, &HashKey::of(b"other")).is_err(),
            true
        );

        // Data which matches its digest but isn't gzip isn't decodable...
        let garbage = b"not compressed";
        assert_eq!(
            decode(&serializer, garbage, &HashKey::of(garbage)).is_err(),
            true
        );

        assert_eq!(
            decode(&serializer, &blob.data, &blob.hash).unwrap(),
            session()
        );
    }

    #[test]
    fn keys_are_stored_plain() {
        let serializer = JsonSerializer::<String>::default();
        let key = encode_key(&serializer, &"user-42".to_owned()).unwrap();

        assert_eq!(key.as_ref(), b"\"user-42\"");
        assert_eq!(decode_key(&serializer, &key).unwrap(), "user-42");
    }
}
