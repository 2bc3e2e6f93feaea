//! Public-facing rate limiter.
//!
//! [`RateLimiter`] wraps a [`RateLimitStrategy`] with the policy layer callers
//! actually need: identifier sanitization, per-namespace keys, a runtime
//! bypass list, per-call policy overrides and fail-open error handling.
//! Backend outages never surface as rejections; they are logged, reported to
//! the optional error hook, and the work is allowed.

use parking_lot::RwLock;
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::bucket::RateLimitResult;
use super::clock::{Clock, SystemClock};
use super::key::{default_key_generator, sanitize_identifier, storage_key, KeyGenerator};
use super::rules::{ConfigOverride, RateLimitConfig};
use super::storage::memory::DEFAULT_SWEEP_INTERVAL;
use super::storage::{MemoryStorage, RateLimitStorage};
use super::strategy::RateLimitStrategy;
use super::token_bucket::TokenBucketStrategy;
use crate::error::{Result, TollgateError};

/// Callback receiving every error the limiter swallowed.
pub type ErrorHook = Arc<dyn Fn(&TollgateError) + Send + Sync>;

/// A single unit of work to be checked against the limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRequest {
    /// Subject being limited (IP, user id, API key)
    pub identifier: String,
    /// Tokens to charge
    pub cost: u32,
    /// Optional key segment isolating buckets per route or resource
    pub namespace: Option<String>,
    /// Optional adjustments to the limiter's default policy
    pub config: Option<ConfigOverride>,
}

impl RateLimitRequest {
    /// A request costing one token.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            cost: 1,
            namespace: None,
            config: None,
        }
    }

    /// Set the token cost.
    pub fn cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    /// Set the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Override parts of the default policy for this request.
    pub fn config(mut self, config: ConfigOverride) -> Self {
        self.config = Some(config);
        self
    }
}

/// Rate limiter orchestrating a strategy over a storage backend.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    /// Default policy; per-request overrides are merged over it
    config: RateLimitConfig,
    strategy: Arc<dyn RateLimitStrategy>,
    storage: Arc<dyn RateLimitStorage>,
    clock: Arc<dyn Clock>,
    key_generator: KeyGenerator,
    /// Sanitized identifiers exempt from limiting
    bypass: RwLock<HashSet<String>>,
    on_error: RwLock<Option<ErrorHook>>,
}

impl RateLimiter {
    /// Create a limiter with in-memory storage, the token bucket strategy and
    /// the system clock.
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start building a limiter around the default policy `config`.
    pub fn builder(config: RateLimitConfig) -> RateLimiterBuilder {
        RateLimiterBuilder::new(config)
    }

    /// The default policy.
    pub fn default_config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Charge `request.cost` tokens to the request's identifier.
    ///
    /// Bypassed identifiers are allowed without touching storage. Any failure
    /// in the strategy or storage is reported and the request is allowed with
    /// the default policy's full budget.
    pub async fn consume(&self, request: &RateLimitRequest) -> RateLimitResult {
        let identifier = sanitize_identifier(&request.identifier);

        if self.bypass.read().contains(&identifier) {
            trace!(identifier = %identifier, "Identifier bypassed");
            return RateLimitResult::bypass(self.clock.now_millis());
        }

        match self.try_consume(&identifier, request).await {
            Ok(result) => {
                if !result.allowed {
                    debug!(
                        identifier = %identifier,
                        namespace = ?request.namespace,
                        retry_after = result.retry_after,
                        blocked = result.is_blocked,
                        "Rate limit exceeded"
                    );
                }
                result
            }
            Err(e) => {
                self.report(&e, "consume", &identifier);
                RateLimitResult::fail_open(&self.config, self.clock.now_millis())
            }
        }
    }

    /// Preview the verdict for the request's identifier without charging it.
    ///
    /// Fails open like [`RateLimiter::consume`].
    pub async fn get_status(&self, request: &RateLimitRequest) -> RateLimitResult {
        let identifier = sanitize_identifier(&request.identifier);

        match self.try_get_status(&identifier, request).await {
            Ok(result) => result,
            Err(e) => {
                self.report(&e, "get_status", &identifier);
                RateLimitResult::fail_open(&self.config, self.clock.now_millis())
            }
        }
    }

    /// Forget all state for an identifier so its next request starts from a
    /// full bucket.
    pub async fn reset(&self, identifier: &str, namespace: Option<&str>) {
        let identifier = sanitize_identifier(identifier);
        let key = self.build_key(&identifier, namespace, &self.config);

        if let Err(e) = self.strategy.reset(&key).await {
            self.report(&e.into(), "reset", &identifier);
        }
    }

    /// Hard-block an identifier for `duration_secs`.
    pub async fn block(&self, identifier: &str, namespace: Option<&str>, duration_secs: u64) {
        let identifier = sanitize_identifier(identifier);
        let key = self.build_key(&identifier, namespace, &self.config);

        if let Err(e) = self.strategy.block(&key, duration_secs).await {
            self.report(&e.into(), "block", &identifier);
        }
    }

    /// Whether a hard block is in force for an identifier.
    ///
    /// Answers `false` when the backend cannot be reached.
    pub async fn is_blocked(&self, identifier: &str, namespace: Option<&str>) -> bool {
        let identifier = sanitize_identifier(identifier);
        let key = self.build_key(&identifier, namespace, &self.config);

        match self.strategy.is_blocked(&key).await {
            Ok(blocked) => blocked,
            Err(e) => {
                self.report(&e.into(), "is_blocked", &identifier);
                false
            }
        }
    }

    /// Exempt an identifier from limiting, starting with the next call.
    pub fn add_bypass(&self, identifier: &str) {
        let identifier = sanitize_identifier(identifier);
        debug!(identifier = %identifier, "Adding bypass");
        self.bypass.write().insert(identifier);
    }

    /// Remove an identifier from the bypass list. Returns whether it was present.
    pub fn remove_bypass(&self, identifier: &str) -> bool {
        let identifier = sanitize_identifier(identifier);
        debug!(identifier = %identifier, "Removing bypass");
        self.bypass.write().remove(&identifier)
    }

    /// Whether an identifier is currently bypassed.
    pub fn is_bypassed(&self, identifier: &str) -> bool {
        self.bypass.read().contains(&sanitize_identifier(identifier))
    }

    /// Replace the error hook.
    pub fn set_error_hook(&self, hook: Option<ErrorHook>) {
        *self.on_error.write() = hook;
    }

    /// Liveness of the storage backend.
    pub async fn is_healthy(&self) -> bool {
        self.storage.is_healthy().await
    }

    async fn try_consume(
        &self,
        identifier: &str,
        request: &RateLimitRequest,
    ) -> Result<RateLimitResult> {
        let config = self.resolve_config(request.config.as_ref())?;
        let key = self.build_key(identifier, request.namespace.as_deref(), &config);
        Ok(self.strategy.consume(&key, request.cost, &config).await?)
    }

    async fn try_get_status(
        &self,
        identifier: &str,
        request: &RateLimitRequest,
    ) -> Result<RateLimitResult> {
        let config = self.resolve_config(request.config.as_ref())?;
        let key = self.build_key(identifier, request.namespace.as_deref(), &config);
        Ok(self.strategy.get_status(&key, &config).await?)
    }

    fn resolve_config<'a>(
        &'a self,
        config_override: Option<&ConfigOverride>,
    ) -> Result<Cow<'a, RateLimitConfig>> {
        match config_override {
            None => Ok(Cow::Borrowed(&self.config)),
            Some(config_override) => {
                let merged = config_override.merge(&self.config);
                merged.validate()?;
                Ok(Cow::Owned(merged))
            }
        }
    }

    fn build_key(
        &self,
        identifier: &str,
        namespace: Option<&str>,
        config: &RateLimitConfig,
    ) -> String {
        let prefix = config
            .key_prefix
            .as_deref()
            .unwrap_or_else(|| self.strategy.key_prefix());
        storage_key(prefix, &(self.key_generator)(identifier, namespace))
    }

    fn report(&self, error: &TollgateError, operation: &'static str, identifier: &str) {
        warn!(
            operation = operation,
            identifier = %identifier,
            error = %error,
            "Rate limiter operation failed, failing open"
        );

        // Release the lock before running caller code.
        let hook = self.on_error.read().clone();
        if let Some(hook) = hook {
            hook(error);
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("key_prefix", &self.strategy.key_prefix())
            .field("bypass", &self.bypass.read().len())
            .field("on_error", &self.on_error.read().is_some())
            .finish()
    }
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    config: RateLimitConfig,
    storage: Option<Arc<dyn RateLimitStorage>>,
    strategy: Option<Arc<dyn RateLimitStrategy>>,
    clock: Option<Arc<dyn Clock>>,
    key_generator: Option<KeyGenerator>,
    on_error: Option<ErrorHook>,
    bypass: Vec<String>,
}

impl RateLimiterBuilder {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            storage: None,
            strategy: None,
            clock: None,
            key_generator: None,
            on_error: None,
            bypass: Vec::new(),
        }
    }

    /// Storage backend. Defaults to [`MemoryStorage`] with a periodic sweep.
    pub fn storage(mut self, storage: Arc<dyn RateLimitStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Strategy. Defaults to [`TokenBucketStrategy`] over the configured
    /// storage; a custom strategy should persist to the same storage so the
    /// health probe reflects it.
    pub fn strategy(mut self, strategy: Arc<dyn RateLimitStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Time source. Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Key generator. Defaults to `namespace:identifier`.
    pub fn key_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&str, Option<&str>) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }

    /// Hook invoked with every error the limiter swallows.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TollgateError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Initial bypass list.
    pub fn bypass<I, S>(mut self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.bypass
            .extend(identifiers.into_iter().map(|id| id.as_ref().to_string()));
        self
    }

    /// Validate the default policy and assemble the limiter.
    pub fn build(self) -> Result<RateLimiter> {
        self.config.validate()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));
        let storage = self.storage.unwrap_or_else(|| {
            Arc::new(MemoryStorage::with_sweep_interval(
                Arc::clone(&clock),
                DEFAULT_SWEEP_INTERVAL,
            ))
        });
        let strategy = self.strategy.unwrap_or_else(|| {
            Arc::new(TokenBucketStrategy::new(
                Arc::clone(&storage),
                Arc::clone(&clock),
            ))
        });

        let bypass = self
            .bypass
            .iter()
            .map(|id| sanitize_identifier(id))
            .collect();

        debug!(
            points = self.config.points,
            duration = self.config.duration,
            block_duration = ?self.config.block_duration,
            key_prefix = strategy.key_prefix(),
            "Rate limiter initialized"
        );

        Ok(RateLimiter {
            config: self.config,
            strategy,
            storage,
            clock,
            key_generator: self.key_generator.unwrap_or_else(default_key_generator),
            bypass: RwLock::new(bypass),
            on_error: RwLock::new(self.on_error),
        })
    }
}
