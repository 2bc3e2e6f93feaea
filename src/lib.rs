//! Tollgate - Token Bucket Rate Limiting
//!
//! This crate implements a pluggable rate limiter. A [`ratelimit::RateLimiter`]
//! runs a token bucket strategy over a swappable storage backend, and adds
//! identifier sanitization, namespacing, a bypass list, per-request policy
//! overrides and fail-open handling of backend errors.

pub mod config;
pub mod error;
pub mod ratelimit;
