//! Provides the errors reported by the write path of the cache.
//!
//! Note that outcomes like a write which lost against a newer concurrent write or a failed
//! precondition of a compare-and-put are not errors. These are reported as
//! [PutOutcome](crate::manager::PutOutcome) or [CompareOutcome](crate::manager::CompareOutcome).
//! Reads never fail due to an unavailable backend, they degrade to a cache miss.
use thiserror::Error;

/// Enumerates the failures of cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The cache was used in an invalid way (e.g. an invalid configuration or argument).
    ///
    /// This is reported before any I/O has been performed.
    #[error("Invalid use of the cache: {0}")]
    Misuse(String),

    /// A key or value couldn't be serialized or deserialized.
    #[error("Failed to serialize or deserialize a value: {0:#}")]
    Serialization(anyhow::Error),

    /// A backend (blob store, metadata store) failed while writing.
    ///
    /// As the caller has to know if its data has been persisted, such failures are always
    /// reported.
    #[error("The backing store failed: {0:#}")]
    Store(anyhow::Error),

    /// The external loader failed.
    #[error("The cache loader failed: {0:#}")]
    Loader(anyhow::Error),

    /// The write-through writer failed.
    #[error("The cache writer failed: {0:#}")]
    Writer(anyhow::Error),
}

/// Represents the result of a cache operation.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use crate::error::CacheError;
    use anyhow::Context;

    #[test]
    fn errors_render_their_cause_chain() {
        let error: anyhow::Result<()> = Err(anyhow::anyhow!("disk full")).context("Saving blob");
        let error = CacheError::Store(error.unwrap_err());

        assert_eq!(
            error.to_string(),
            "The backing store failed: Saving blob: disk full"
        );
        assert_eq!(
            CacheError::Misuse("empty namespace".to_owned()).to_string(),
            "Invalid use of the cache: empty namespace"
        );
    }
}
