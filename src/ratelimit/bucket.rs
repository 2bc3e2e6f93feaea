//! Persisted bucket state and the verdicts handed back to callers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::rules::RateLimitConfig;

/// Per-identifier bucket state as persisted by a storage backend.
///
/// `tokens` stays within `0..=points` of the policy that last recomputed it.
/// An entry that is absent from storage is a fresh, full bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitData {
    /// Current fractional token balance
    pub tokens: f64,
    /// Epoch milliseconds of the last refill recomputation
    pub last_refill: u64,
    /// Tokens consumed since the bucket was created or reset
    pub consumed: u64,
    /// Epoch milliseconds until which the identifier is hard-blocked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_until: Option<u64>,
}

impl RateLimitData {
    /// A full bucket as of `now`.
    pub fn full(points: u32, now: u64) -> Self {
        Self {
            tokens: points as f64,
            last_refill: now,
            consumed: 0,
            block_until: None,
        }
    }

    /// An empty bucket that stays blocked until `until`.
    pub fn blocked(now: u64, until: u64) -> Self {
        Self {
            tokens: 0.0,
            last_refill: now,
            consumed: 0,
            block_until: Some(until),
        }
    }

    /// Whether a hard block is still in force at `now`.
    pub fn is_blocked_at(&self, now: u64) -> bool {
        matches!(self.block_until, Some(until) if until > now)
    }

    /// Accrue tokens for the time elapsed since the last refill, capped at
    /// `points`, and move `last_refill` to `now`.
    pub fn refill(&mut self, config: &RateLimitConfig, now: u64) {
        let elapsed_secs = now.saturating_sub(self.last_refill) as f64 / 1000.0;
        let refilled = self.tokens + elapsed_secs * config.refill_rate();
        self.tokens = refilled.min(config.points as f64);
        self.last_refill = now;
    }

    /// Epoch milliseconds at which the bucket is projected to be full again.
    pub fn full_at(&self, config: &RateLimitConfig, now: u64) -> u64 {
        let missing = (config.points as f64 - self.tokens).max(0.0);
        // Float-to-int casts saturate, so huge durations land on u64::MAX.
        now.saturating_add((missing / config.refill_rate() * 1000.0).ceil() as u64)
    }
}

/// The verdict for a single rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    /// Whether the unit of work may proceed
    pub allowed: bool,
    /// Whole tokens left after this call
    pub remaining: u32,
    /// Bucket capacity
    pub limit: u32,
    /// Epoch milliseconds of the projected reset (full bucket, affordable
    /// retry, or block expiry depending on the outcome)
    pub reset_at: u64,
    /// Seconds to wait before retrying; zero when allowed
    pub retry_after: u64,
    /// Tokens consumed since the bucket was created or reset
    pub consumed: u64,
    /// Set only while a hard block is in force
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_blocked: bool,
}

impl RateLimitResult {
    /// Verdict for an identifier on the bypass list.
    pub fn bypass(now: u64) -> Self {
        Self {
            allowed: true,
            remaining: u32::MAX,
            limit: u32::MAX,
            reset_at: now,
            retry_after: 0,
            consumed: 0,
            is_blocked: false,
        }
    }

    /// Verdict used when the limiting machinery itself failed: allow, and
    /// report the default policy's full budget.
    pub fn fail_open(config: &RateLimitConfig, now: u64) -> Self {
        Self {
            allowed: true,
            remaining: config.points,
            limit: config.points,
            reset_at: now,
            retry_after: 0,
            consumed: 0,
            is_blocked: false,
        }
    }

    /// `retry_after` as a [`Duration`], for building a `Retry-After` header.
    pub fn retry_after_duration(&self) -> Duration {
        Duration::from_secs(self.retry_after)
    }
}
