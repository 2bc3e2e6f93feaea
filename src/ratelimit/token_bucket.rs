//! Token bucket strategy.
//!
//! Each identifier owns a bucket holding up to `points` tokens that refills
//! continuously at `points / duration` tokens per second. Bursts up to the
//! full capacity are allowed while the long-run rate stays bounded, and the
//! persisted state is four scalars per active identifier.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

use super::bucket::{RateLimitData, RateLimitResult};
use super::clock::Clock;
use super::rules::RateLimitConfig;
use super::storage::{RateLimitStorage, StorageError};
use super::strategy::RateLimitStrategy;

/// Storage key prefix used when a policy does not set one.
pub const DEFAULT_KEY_PREFIX: &str = "tb";

/// Extra lifetime, in seconds, given to rejected and blocked records so they
/// outlive the state they describe.
const RECORD_GRACE_SECS: u64 = 60;

/// Token bucket rate limiting over a pluggable storage backend.
pub struct TokenBucketStrategy {
    storage: Arc<dyn RateLimitStorage>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
}

impl TokenBucketStrategy {
    /// Create a strategy persisting to `storage` and reading time from `clock`.
    pub fn new(storage: Arc<dyn RateLimitStorage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// Use `prefix` instead of [`DEFAULT_KEY_PREFIX`].
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    async fn load(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> Result<RateLimitData, StorageError> {
        Ok(self
            .storage
            .get(key)
            .await?
            .unwrap_or_else(|| RateLimitData::full(config.points, now)))
    }
}

impl std::fmt::Debug for TokenBucketStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketStrategy")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

#[async_trait]
impl RateLimitStrategy for TokenBucketStrategy {
    fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    async fn consume(
        &self,
        key: &str,
        cost: u32,
        config: &RateLimitConfig,
    ) -> Result<RateLimitResult, StorageError> {
        let now = self.clock.now_millis();
        let mut data = self.load(key, config, now).await?;

        // An active block wins over any refill.
        if data.is_blocked_at(now) {
            trace!(key = %key, block_until = ?data.block_until, "Rejecting blocked key");
            return Ok(blocked_result(&data, config, now));
        }
        data.block_until = None;

        data.refill(config, now);

        let cost = cost as f64;
        if data.tokens < cost {
            let retry_after = ((cost - data.tokens) / config.refill_rate()).ceil() as u64;

            if let Some(block_secs) = config.block_duration {
                data.block_until = Some(now.saturating_add(block_secs.saturating_mul(1000)));
                debug!(key = %key, block_secs = block_secs, "Bucket exhausted, blocking key");
            }

            let ttl = config
                .duration
                .saturating_add(config.block_duration.unwrap_or(RECORD_GRACE_SECS));
            self.storage.set(key, &data, ttl).await?;

            trace!(
                key = %key,
                tokens = data.tokens,
                cost = cost,
                retry_after = retry_after,
                "Insufficient tokens"
            );

            return Ok(RateLimitResult {
                allowed: false,
                remaining: data.tokens.floor() as u32,
                limit: config.points,
                reset_at: now.saturating_add(retry_after.saturating_mul(1000)),
                retry_after,
                consumed: data.consumed,
                is_blocked: false,
            });
        }

        data.tokens -= cost;
        data.consumed += cost as u64;
        self.storage.set(key, &data, config.duration).await?;

        trace!(key = %key, remaining = data.tokens, "Tokens consumed");

        Ok(RateLimitResult {
            allowed: true,
            remaining: data.tokens.floor() as u32,
            limit: config.points,
            reset_at: data.full_at(config, now),
            retry_after: 0,
            consumed: data.consumed,
            is_blocked: false,
        })
    }

    async fn get_status(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitResult, StorageError> {
        let now = self.clock.now_millis();
        let mut data = self.load(key, config, now).await?;

        if data.is_blocked_at(now) {
            return Ok(blocked_result(&data, config, now));
        }

        data.refill(config, now);

        let allowed = data.tokens >= 1.0;
        let retry_after = if allowed {
            0
        } else {
            ((1.0 - data.tokens) / config.refill_rate()).ceil() as u64
        };

        Ok(RateLimitResult {
            allowed,
            remaining: data.tokens.floor() as u32,
            limit: config.points,
            reset_at: data.full_at(config, now),
            retry_after,
            consumed: data.consumed,
            is_blocked: false,
        })
    }

    async fn reset(&self, key: &str) -> Result<(), StorageError> {
        debug!(key = %key, "Resetting bucket");
        self.storage.delete(key).await
    }

    async fn block(&self, key: &str, duration_secs: u64) -> Result<(), StorageError> {
        let now = self.clock.now_millis();
        let until = now.saturating_add(duration_secs.saturating_mul(1000));
        let data = RateLimitData::blocked(now, until);

        debug!(key = %key, duration_secs = duration_secs, "Blocking key");
        self.storage
            .set(key, &data, duration_secs.saturating_add(RECORD_GRACE_SECS))
            .await
    }

    async fn is_blocked(&self, key: &str) -> Result<bool, StorageError> {
        let now = self.clock.now_millis();
        Ok(self
            .storage
            .get(key)
            .await?
            .is_some_and(|data| data.is_blocked_at(now)))
    }
}

fn blocked_result(data: &RateLimitData, config: &RateLimitConfig, now: u64) -> RateLimitResult {
    let until = data.block_until.unwrap_or(now);
    RateLimitResult {
        allowed: false,
        remaining: 0,
        limit: config.points,
        reset_at: until,
        retry_after: until.saturating_sub(now).div_ceil(1000),
        consumed: data.consumed,
        is_blocked: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::storage::MemoryStorage;
    use parking_lot::Mutex;
    use std::time::Duration;

    const START: u64 = 1_700_000_000_000;

    /// Memory storage that remembers the TTL of every write.
    struct RecordingStorage {
        inner: MemoryStorage,
        ttls: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl RateLimitStorage for RecordingStorage {
        async fn get(&self, key: &str) -> Result<Option<RateLimitData>, StorageError> {
            self.inner.get(key).await
        }

        async fn set(
            &self,
            key: &str,
            data: &RateLimitData,
            ttl_secs: u64,
        ) -> Result<(), StorageError> {
            self.ttls.lock().push(ttl_secs);
            self.inner.set(key, data, ttl_secs).await
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete(key).await
        }

        async fn is_healthy(&self) -> bool {
            true
        }
    }

    fn setup() -> (TokenBucketStrategy, Arc<RecordingStorage>, ManualClock) {
        let clock = ManualClock::new(START);
        let storage = Arc::new(RecordingStorage {
            inner: MemoryStorage::with_clock(Arc::new(clock.clone())),
            ttls: Mutex::new(Vec::new()),
        });
        let strategy = TokenBucketStrategy::new(storage.clone(), Arc::new(clock.clone()));
        (strategy, storage, clock)
    }

    fn config(points: u32, duration: u64) -> RateLimitConfig {
        RateLimitConfig::new(points, duration).unwrap()
    }

    #[tokio::test]
    async fn test_first_consume_on_fresh_key() {
        let (strategy, _, _) = setup();
        let config = config(5, 60);

        let result = strategy.consume("tb:alice", 1, &config).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);
        assert_eq!(result.limit, 5);
        assert_eq!(result.retry_after, 0);
        assert_eq!(result.consumed, 1);
        assert!(!result.is_blocked);
    }

    #[tokio::test]
    async fn test_drain_then_reject() {
        let (strategy, _, _) = setup();
        let config = config(3, 60);

        for expected in [2, 1, 0] {
            let result = strategy.consume("k", 1, &config).await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.remaining, expected);
        }

        let result = strategy.consume("k", 1, &config).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.consumed, 3);
        // One token takes 20 seconds at 3 tokens per minute.
        assert_eq!(result.retry_after, 20);
        assert_eq!(result.reset_at, START + 20_000);
        assert!(!result.is_blocked);
    }

    #[tokio::test]
    async fn test_refill_after_wait() {
        let (strategy, _, clock) = setup();
        let config = config(10, 10);

        for _ in 0..10 {
            assert!(strategy.consume("k", 1, &config).await.unwrap().allowed);
        }

        clock.advance(Duration::from_secs(5));

        let result = strategy.consume("k", 1, &config).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);
    }

    #[tokio::test]
    async fn test_refill_never_exceeds_capacity() {
        let (strategy, _, clock) = setup();
        let config = config(10, 10);

        strategy.consume("k", 1, &config).await.unwrap();
        clock.advance(Duration::from_secs(3_600));

        let status = strategy.get_status("k", &config).await.unwrap();
        assert_eq!(status.remaining, 10);
    }

    #[tokio::test]
    async fn test_multi_token_cost() {
        let (strategy, _, _) = setup();
        let config = config(10, 10);

        let result = strategy.consume("k", 7, &config).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 3);
        assert_eq!(result.reset_at, START + 7_000);

        let result = strategy.consume("k", 4, &config).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 3);
        assert_eq!(result.retry_after, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_escalates_to_block() {
        let (strategy, _, clock) = setup();
        let config = config(2, 2).with_block_duration(30);

        strategy.consume("k", 1, &config).await.unwrap();
        strategy.consume("k", 1, &config).await.unwrap();

        let rejected = strategy.consume("k", 1, &config).await.unwrap();
        assert!(!rejected.allowed);
        assert!(strategy.is_blocked("k").await.unwrap());

        // Refill would have restored the bucket long before the block ends.
        clock.advance(Duration::from_secs(29));
        let result = strategy.consume("k", 1, &config).await.unwrap();
        assert!(!result.allowed);
        assert!(result.is_blocked);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.retry_after, 1);
        assert_eq!(result.reset_at, START + 30_000);

        clock.advance(Duration::from_secs(1));
        assert!(!strategy.is_blocked("k").await.unwrap());
        let result = strategy.consume("k", 1, &config).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 1);
    }

    #[tokio::test]
    async fn test_ttls() {
        let (strategy, storage, _) = setup();
        let plain = config(1, 10);
        let blocking = config(1, 10).with_block_duration(45);

        strategy.consume("a", 1, &plain).await.unwrap();
        strategy.consume("a", 1, &plain).await.unwrap();
        strategy.consume("b", 1, &blocking).await.unwrap();
        strategy.consume("b", 1, &blocking).await.unwrap();
        strategy.block("c", 120).await.unwrap();

        assert_eq!(*storage.ttls.lock(), vec![10, 70, 10, 55, 180]);
    }

    #[tokio::test]
    async fn test_get_status_does_not_persist() {
        let (strategy, storage, _) = setup();
        let config = config(5, 60);

        let status = strategy.get_status("k", &config).await.unwrap();
        assert!(status.allowed);
        assert_eq!(status.remaining, 5);
        assert_eq!(status.reset_at, START);
        assert!(storage.inner.is_empty());

        strategy.consume("k", 2, &config).await.unwrap();
        let writes = storage.ttls.lock().len();

        let status = strategy.get_status("k", &config).await.unwrap();
        assert_eq!(status.remaining, 3);
        assert_eq!(status.consumed, 2);
        assert_eq!(storage.ttls.lock().len(), writes);

        let result = strategy.consume("k", 1, &config).await.unwrap();
        assert_eq!(result.remaining, 2);
    }

    #[tokio::test]
    async fn test_get_status_on_empty_bucket() {
        let (strategy, _, _) = setup();
        let config = config(1, 4);

        strategy.consume("k", 1, &config).await.unwrap();

        let status = strategy.get_status("k", &config).await.unwrap();
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
        assert_eq!(status.retry_after, 4);
    }

    #[tokio::test]
    async fn test_get_status_reports_block() {
        let (strategy, _, _) = setup();
        let config = config(5, 60);

        strategy.block("k", 10).await.unwrap();

        let status = strategy.get_status("k", &config).await.unwrap();
        assert!(!status.allowed);
        assert!(status.is_blocked);
        assert_eq!(status.retry_after, 10);
    }

    #[tokio::test]
    async fn test_manual_block_overrides_balance() {
        let (strategy, _, clock) = setup();
        let config = config(100, 60);

        strategy.consume("k", 1, &config).await.unwrap();
        strategy.block("k", 5).await.unwrap();

        let result = strategy.consume("k", 1, &config).await.unwrap();
        assert!(result.is_blocked);
        assert_eq!(result.consumed, 0);

        clock.advance(Duration::from_secs(5));
        let result = strategy.consume("k", 1, &config).await.unwrap();
        assert!(result.allowed);
        // The block emptied the bucket; five seconds refilled a little over eight tokens.
        assert_eq!(result.remaining, 7);
    }

    #[tokio::test]
    async fn test_reset_restores_full_bucket() {
        let (strategy, _, _) = setup();
        let config = config(3, 60).with_block_duration(60);

        for _ in 0..4 {
            strategy.consume("k", 1, &config).await.unwrap();
        }
        assert!(strategy.is_blocked("k").await.unwrap());

        strategy.reset("k").await.unwrap();
        assert!(!strategy.is_blocked("k").await.unwrap());

        let result = strategy.consume("k", 1, &config).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 2);
        assert_eq!(result.consumed, 1);
    }

    #[tokio::test]
    async fn test_entry_expiry_yields_fresh_bucket() {
        let (strategy, _, clock) = setup();
        let config = config(4, 8);

        strategy.consume("k", 4, &config).await.unwrap();
        clock.advance(Duration::from_secs(8));

        let result = strategy.consume("k", 1, &config).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 3);
        assert_eq!(result.consumed, 1);
    }

    #[tokio::test]
    async fn test_huge_block_durations_saturate() {
        let (strategy, storage, clock) = setup();
        let huge = u64::MAX / 100;
        let config = config(1, 60).with_block_duration(huge);

        strategy.consume("k", 1, &config).await.unwrap();
        let rejected = strategy.consume("k", 1, &config).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(*storage.ttls.lock().last().unwrap(), huge + 60);

        clock.advance(Duration::from_secs(3600));
        let blocked = strategy.consume("k", 1, &config).await.unwrap();
        assert!(blocked.is_blocked);
        assert_eq!(blocked.reset_at, u64::MAX);

        strategy.block("m", huge).await.unwrap();
        assert!(strategy.is_blocked("m").await.unwrap());
        assert_eq!(*storage.ttls.lock().last().unwrap(), huge + 60);

        strategy.block("n", u64::MAX).await.unwrap();
        assert!(strategy.is_blocked("n").await.unwrap());
        assert_eq!(*storage.ttls.lock().last().unwrap(), u64::MAX);
    }

    #[tokio::test]
    async fn test_huge_duration_saturates_reset_at() {
        let (strategy, _, _) = setup();
        let config = config(1, u64::MAX);

        let accepted = strategy.consume("k", 1, &config).await.unwrap();
        assert!(accepted.allowed);
        assert_eq!(accepted.reset_at, u64::MAX);

        let rejected = strategy.consume("k", 1, &config).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.reset_at, u64::MAX);
    }

    #[test]
    fn test_key_prefix() {
        let (strategy, _, _) = setup();
        assert_eq!(strategy.key_prefix(), "tb");
        assert_eq!(strategy.with_key_prefix("api").key_prefix(), "api");
    }
}
