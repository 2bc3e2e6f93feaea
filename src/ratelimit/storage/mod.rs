//! Storage backends for bucket state.
//!
//! A backend maps string keys to [`RateLimitData`] with a time-to-live on every
//! write. Backends are interchangeable behind [`RateLimitStorage`]; the shared
//! wire encoding lives in [`encode`] and [`decode`].
//!
//! Writes are plain read-modify-write from the strategy's point of view: two
//! concurrent callers may read the same stale balance and both persist. A
//! backend with compare-and-swap may tighten this without changing the trait.

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use super::bucket::RateLimitData;

pub mod memory;

pub use memory::MemoryStorage;

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Bucket state could not be encoded for the backend.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend itself failed (I/O, connection, protocol).
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Key/value persistence for bucket state with per-entry expiry.
#[async_trait]
pub trait RateLimitStorage: Send + Sync {
    /// Fetch the state for `key`.
    ///
    /// Entries whose TTL has elapsed and entries that fail to decode are
    /// reported as absent.
    async fn get(&self, key: &str) -> Result<Option<RateLimitData>, StorageError>;

    /// Overwrite the state for `key`, expiring `ttl_secs` from now.
    async fn set(&self, key: &str, data: &RateLimitData, ttl_secs: u64) -> Result<(), StorageError>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Cheap liveness probe.
    async fn is_healthy(&self) -> bool;
}

/// Encode bucket state as JSON text.
pub fn encode(data: &RateLimitData) -> Result<String, StorageError> {
    Ok(serde_json::to_string(data)?)
}

/// Decode bucket state, treating anything malformed as absent.
pub fn decode(raw: &str) -> Option<RateLimitData> {
    let data: RateLimitData = match serde_json::from_str(raw) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "Discarding malformed rate limit entry");
            return None;
        }
    };

    if !data.tokens.is_finite() || data.tokens < 0.0 {
        warn!(tokens = data.tokens, "Discarding rate limit entry with invalid balance");
        return None;
    }

    Some(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let data = RateLimitData {
            tokens: 3.25,
            last_refill: 1_000,
            consumed: 7,
            block_until: Some(5_000),
        };
        let raw = encode(&data).unwrap();
        assert_eq!(decode(&raw), Some(data));
    }

    #[test]
    fn test_decode_malformed_is_absent() {
        assert_eq!(decode(""), None);
        assert_eq!(decode("not json"), None);
        assert_eq!(decode(r#"{"tokens":"many"}"#), None);
        assert_eq!(decode(r#"{"tokens":1.0,"lastRefill":5}"#), None);
    }

    #[test]
    fn test_decode_negative_balance_is_absent() {
        assert_eq!(
            decode(r#"{"tokens":-1.0,"lastRefill":5,"consumed":0}"#),
            None
        );
    }

    #[test]
    fn test_decode_accepts_missing_block_until() {
        let data = decode(r#"{"tokens":4.0,"lastRefill":5,"consumed":6}"#).unwrap();
        assert_eq!(data.block_until, None);
        assert_eq!(data.consumed, 6);
    }
}
