//! Rate limiting strategy trait.

use async_trait::async_trait;

use super::bucket::RateLimitResult;
use super::rules::RateLimitConfig;
use super::storage::StorageError;

/// An algorithm deciding whether work may proceed for a storage key.
///
/// Implementations own all bucket arithmetic and keep their state in a
/// storage backend. Keys arrive fully built (prefix included) and configs
/// arrive validated.
#[async_trait]
pub trait RateLimitStrategy: Send + Sync {
    /// Prefix used for storage keys when the policy does not name one.
    fn key_prefix(&self) -> &str;

    /// Charge `cost` tokens against `key` if the balance allows it.
    async fn consume(
        &self,
        key: &str,
        cost: u32,
        config: &RateLimitConfig,
    ) -> Result<RateLimitResult, StorageError>;

    /// Preview the verdict for `key` without charging or persisting anything.
    async fn get_status(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitResult, StorageError>;

    /// Forget all state for `key`.
    async fn reset(&self, key: &str) -> Result<(), StorageError>;

    /// Hard-block `key` for `duration_secs`, discarding its balance.
    async fn block(&self, key: &str, duration_secs: u64) -> Result<(), StorageError>;

    /// Whether a hard block is in force for `key`.
    async fn is_blocked(&self, key: &str) -> Result<bool, StorageError>;
}
