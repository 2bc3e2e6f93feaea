//! Rate limiting logic and state management.

mod bucket;
mod clock;
mod key;
mod limiter;
mod rules;
pub mod storage;
mod strategy;
mod token_bucket;

pub use bucket::{RateLimitData, RateLimitResult};
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{default_key, sanitize_identifier, KeyGenerator};
pub use limiter::{ErrorHook, RateLimitRequest, RateLimiter, RateLimiterBuilder};
pub use rules::{ConfigOverride, RateLimitConfig};
pub use storage::{MemoryStorage, RateLimitStorage, StorageError};
pub use strategy::RateLimitStrategy;
pub use token_bucket::TokenBucketStrategy;
