//! In-process storage backend.
//!
//! Entries are kept JSON-encoded, exactly as a remote cache would hold them,
//! alongside an absolute expiry. Reads re-check expiry, so the periodic sweep
//! only bounds memory and never affects verdicts.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{decode, encode, RateLimitStorage, StorageError};
use crate::ratelimit::bucket::RateLimitData;
use crate::ratelimit::clock::{Clock, SystemClock};

/// Default interval between sweeps of expired entries.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shortest interval the sweeper runs at; shorter requests are raised to it.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: u64,
}

/// Storage backed by a concurrent hash map with per-entry expiry.
pub struct MemoryStorage {
    entries: Arc<DashMap<String, MemoryEntry>>,
    clock: Arc<dyn Clock>,
    sweeper: Option<JoinHandle<()>>,
}

impl MemoryStorage {
    /// Create storage on the system clock without a background sweep.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create storage on `clock` without a background sweep.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
            sweeper: None,
        }
    }

    /// Create storage on `clock` that sweeps expired entries every `interval`.
    ///
    /// Intervals below [`MIN_SWEEP_INTERVAL`] are raised to it. The sweep task
    /// is only spawned when called inside a tokio runtime.
    /// It stops once the storage is dropped.
    pub fn with_sweep_interval(clock: Arc<dyn Clock>, interval: Duration) -> Self {
        let mut storage = Self::with_clock(clock);
        let interval = interval.max(MIN_SWEEP_INTERVAL);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let entries = Arc::downgrade(&storage.entries);
                let clock = Arc::clone(&storage.clock);
                storage.sweeper = Some(handle.spawn(sweep_loop(entries, clock, interval)));
                debug!(interval = ?interval, "Started rate limit storage sweeper");
            }
            Err(_) => {
                debug!("No tokio runtime available, expired entries are only dropped on read");
            }
        }

        storage
    }

    /// Drop every expired entry now, returning how many were removed.
    pub fn sweep(&self) -> usize {
        sweep_expired(&self.entries, self.clock.now_millis())
    }

    /// Number of physically stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are physically stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    fn insert_raw(&self, key: &str, value: &str, ttl_secs: u64) {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: self.clock.now_millis() + ttl_secs * 1000,
            },
        );
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("entries", &self.entries.len())
            .field("sweeping", &self.sweeper.is_some())
            .finish()
    }
}

#[async_trait]
impl RateLimitStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<RateLimitData>, StorageError> {
        let now = self.clock.now_millis();

        // The map guard must be released before any removal below.
        let lookup = self
            .entries
            .get(key)
            .map(|entry| (entry.expires_at > now).then(|| entry.value.clone()));

        match lookup {
            None => Ok(None),
            Some(Some(raw)) => Ok(decode(&raw)),
            Some(None) => {
                self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
                Ok(None)
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        data: &RateLimitData,
        ttl_secs: u64,
    ) -> Result<(), StorageError> {
        let value = encode(data)?;
        let expires_at = self
            .clock
            .now_millis()
            .saturating_add(ttl_secs.saturating_mul(1000));

        self.entries
            .insert(key.to_string(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

fn sweep_expired(entries: &DashMap<String, MemoryEntry>, now: u64) -> usize {
    let mut removed = 0;
    entries.retain(|_, entry| {
        let keep = entry.expires_at > now;
        if !keep {
            removed += 1;
        }
        keep
    });
    removed
}

async fn sweep_loop(
    entries: Weak<DashMap<String, MemoryEntry>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(entries) = entries.upgrade() else {
            break;
        };

        let removed = sweep_expired(&entries, clock.now_millis());
        if removed > 0 {
            debug!(
                removed = removed,
                remaining = entries.len(),
                "Swept expired rate limit entries"
            );
        }
    }
}
