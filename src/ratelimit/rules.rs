//! Rate limit policy configuration.
//!
//! A [`RateLimitConfig`] describes one token bucket: its capacity, how long it
//! takes to refill completely, and whether exhausting it escalates into a hard
//! block. Per-call adjustments are expressed as a [`ConfigOverride`] merged over
//! the limiter's default policy.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Result, TollgateError};

/// An immutable token bucket policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity
    pub points: u32,
    /// Seconds over which `points` fully replenish
    pub duration: u64,
    /// Seconds to hard-block an identifier once its bucket is exhausted
    #[serde(default)]
    pub block_duration: Option<u64>,
    /// Storage key prefix; falls back to the strategy's own prefix when unset
    #[serde(default)]
    pub key_prefix: Option<String>,
    /// Advisory flag for callers: whether failed downstream work should
    /// still be charged. Never consulted by the limiter itself.
    #[serde(default)]
    pub consume_on_failure: bool,
}

impl RateLimitConfig {
    /// Create a validated policy of `points` per `duration` seconds.
    pub fn new(points: u32, duration: u64) -> Result<Self> {
        let config = Self {
            points,
            duration,
            block_duration: None,
            key_prefix: None,
            consume_on_failure: false,
        };
        config.validate()?;
        Ok(config)
    }

    /// Hard-block identifiers for `seconds` after their bucket runs dry.
    pub fn with_block_duration(mut self, seconds: u64) -> Self {
        self.block_duration = Some(seconds);
        self
    }

    /// Namespace storage keys under `prefix`.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Set the advisory consume-on-failure flag.
    pub fn with_consume_on_failure(mut self, consume: bool) -> Self {
        self.consume_on_failure = consume;
        self
    }

    /// Reject policies that would make the bucket arithmetic meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.points == 0 {
            return Err(TollgateError::Config(
                "points must be at least 1".to_string(),
            ));
        }
        if self.duration == 0 {
            return Err(TollgateError::Config(
                "duration must be at least 1 second".to_string(),
            ));
        }
        if self.block_duration == Some(0) {
            return Err(TollgateError::Config(
                "block_duration must be at least 1 second when set".to_string(),
            ));
        }
        if matches!(self.key_prefix.as_deref(), Some("")) {
            return Err(TollgateError::Config(
                "key_prefix must not be empty when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Tokens restored per second.
    pub fn refill_rate(&self) -> f64 {
        self.points as f64 / self.duration as f64
    }

    /// Load a policy from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policy");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a policy from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateLimitConfig = serde_yaml::from_str(yaml).map_err(|e| {
            TollgateError::Config(format!("Failed to parse rate limit policy: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Per-call adjustments laid over a limiter's default policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigOverride {
    #[serde(default)]
    pub points: Option<u32>,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub block_duration: Option<u64>,
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub consume_on_failure: Option<bool>,
}

impl ConfigOverride {
    /// Create an empty override.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the bucket capacity.
    pub fn points(mut self, points: u32) -> Self {
        self.points = Some(points);
        self
    }

    /// Replace the refill window, in seconds.
    pub fn duration(mut self, seconds: u64) -> Self {
        self.duration = Some(seconds);
        self
    }

    /// Escalate exhaustion into a hard block of `seconds`.
    pub fn block_duration(mut self, seconds: u64) -> Self {
        self.block_duration = Some(seconds);
        self
    }

    /// Store this request's bucket under `prefix`.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Replace the advisory consume-on-failure flag.
    pub fn consume_on_failure(mut self, consume: bool) -> Self {
        self.consume_on_failure = Some(consume);
        self
    }

    /// Lay the fields set here over `base`.
    ///
    /// The result is not validated; callers run [`RateLimitConfig::validate`]
    /// before handing it to a strategy.
    pub fn merge(&self, base: &RateLimitConfig) -> RateLimitConfig {
        RateLimitConfig {
            points: self.points.unwrap_or(base.points),
            duration: self.duration.unwrap_or(base.duration),
            block_duration: self.block_duration.or(base.block_duration),
            key_prefix: self.key_prefix.clone().or_else(|| base.key_prefix.clone()),
            consume_on_failure: self.consume_on_failure.unwrap_or(base.consume_on_failure),
        }
    }
}
