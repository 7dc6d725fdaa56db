//! Caching decorator for expensive upstream calls
//!
//! Wraps an async operation with key derivation, layered cache lookup,
//! in-flight de-duplication and circuit breaking.
//!
//! # Flow
//!
//! ```text
//! call → derive key → stream? ──yes──→ breaker → op (never cached)
//!                       │ no
//!                       ▼
//!                  cache hit? ──yes──→ return
//!                       │ no
//!                       ▼
//!              per-key in-flight lock → re-check cache
//!                       ▼
//!              breaker.allow_request()? ──no──→ CircuitOpen
//!                       ▼
//!              op (optional timeout) → record outcome → write to all tiers
//! ```

use crate::circuit_breaker::CircuitBreaker;
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::key_codec::{CallArgs, KeyCodec};
use crate::layered_cache::LayeredCache;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// RAII cleanup guard for in-flight request tracking
/// Ensures that entries are removed from `DashMap` even on early return or panic
struct CleanupGuard<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Held while computing a key; later callers for the same key wait on it
struct InFlight<'a> {
    _cleanup: CleanupGuard<'a>,
    _permit: OwnedMutexGuard<()>,
}

/// Records a breaker failure unless the call is marked successful
///
/// Covers the caller dropping the future while the upstream call is pending.
struct FailureGuard<'a> {
    breaker: Option<&'a CircuitBreaker>,
    armed: bool,
}

impl<'a> FailureGuard<'a> {
    fn arm(breaker: Option<&'a CircuitBreaker>) -> Self {
        Self { breaker, armed: true }
    }

    fn succeed(mut self) {
        self.armed = false;
        if let Some(breaker) = self.breaker {
            breaker.record_success();
        }
    }
}

impl Drop for FailureGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(breaker) = self.breaker {
                breaker.record_failure();
            }
        }
    }
}

/// Decorator settings
#[derive(Debug, Clone)]
pub struct DecoratorConfig {
    /// TTL of stored results
    pub ttl: Duration,
    /// Upper bound on one upstream call, none by default
    pub upstream_timeout: Option<Duration>,
    /// Coalesce concurrent misses for the same key into one upstream call
    pub dedupe_in_flight: bool,
}

impl Default for DecoratorConfig {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for DecoratorConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            ttl: config.disk_ttl_default,
            upstream_timeout: config.upstream_timeout,
            dedupe_in_flight: config.dedupe_in_flight,
        }
    }
}

/// Caches the results of an async operation keyed by its arguments
///
/// # Example
///
/// ```rust,no_run
/// use recommender_cache::{CacheSystem, CacheConfig, CallArgs};
///
/// # async fn example() -> anyhow::Result<()> {
/// let system = CacheSystem::new(CacheConfig::default()).await?;
/// let args = CallArgs::new().arg("need a CRM").kwarg("industry", "retail");
///
/// let value = system
///     .decorator()
///     .execute("recommend", &args, || async { Ok(serde_json::json!({"modules": ["CRM"]})) })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct CachingDecorator {
    key_codec: KeyCodec,
    cache: Arc<LayeredCache>,
    breaker: Option<Arc<CircuitBreaker>>,
    config: DecoratorConfig,
    /// In-flight requests to prevent cache stampede on the upstream
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    upstream_calls: AtomicU64,
}

impl CachingDecorator {
    #[must_use]
    pub fn new(
        cache: Arc<LayeredCache>,
        breaker: Option<Arc<CircuitBreaker>>,
        config: DecoratorConfig,
    ) -> Self {
        Self {
            key_codec: KeyCodec::new(),
            cache,
            breaker,
            config,
            in_flight: DashMap::new(),
            upstream_calls: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DecoratorConfig {
        &self.config
    }

    #[must_use]
    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Times the wrapped operation actually ran
    #[must_use]
    pub fn upstream_calls(&self) -> u64 {
        self.upstream_calls.load(Ordering::Relaxed)
    }

    /// Keys currently being computed
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Run `op` through the cache, with JSON results
    ///
    /// # Errors
    ///
    /// See [`execute_typed`](Self::execute_typed).
    pub async fn execute<F, Fut>(
        &self,
        namespace: &str,
        args: &CallArgs,
        op: F,
    ) -> CacheResult<serde_json::Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<serde_json::Value>>,
    {
        self.execute_typed(namespace, args, op).await
    }

    /// Run `op` through the cache
    ///
    /// Calls with a `stream = true` keyword bypass the cache entirely. A
    /// cached value that does not deserialize into `T` counts as a miss.
    ///
    /// # Errors
    ///
    /// - [`CacheError::CircuitOpen`] if the breaker refuses the call
    /// - [`CacheError::Upstream`] if `op` fails
    /// - [`CacheError::UpstreamTimeout`] if `op` exceeds the upstream timeout
    /// - [`CacheError::Serialization`] if the result cannot be stored as JSON
    pub async fn execute_typed<T, F, Fut>(
        &self,
        namespace: &str,
        args: &CallArgs,
        op: F,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let key = self.key_codec.derive_namespaced_key(namespace, args);

        if args.is_stream() {
            debug!(key = %key, namespace, "Streaming call, bypassing cache");
            return self.call_upstream(&key, op).await;
        }

        if let Some(value) = self.cached::<T>(&key).await {
            return Ok(value);
        }

        let _in_flight = if self.config.dedupe_in_flight {
            let in_flight = self.acquire(&key).await;
            // Another caller may have filled the cache while we waited
            if let Some(value) = self.cached::<T>(&key).await {
                return Ok(value);
            }
            Some(in_flight)
        } else {
            None
        };

        let value = self.call_upstream(&key, op).await?;

        let json = serde_json::to_value(&value).map_err(|e| {
            CacheError::Serialization(format!(
                "failed to serialize {} for caching: {e}",
                std::any::type_name::<T>()
            ))
        })?;
        let report = self.cache.set(&key, json, self.config.ttl).await;
        if !report.is_complete() {
            debug!(key = %key, failed = report.failures.len(), "Result cached in some tiers only");
        }

        Ok(value)
    }

    async fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.cache.get(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(
                    key = %key,
                    target_type = std::any::type_name::<T>(),
                    error = %e,
                    "Cached value has unexpected shape, recomputing"
                );
                None
            }
        }
    }

    async fn acquire(&self, key: &str) -> InFlight<'_> {
        let lock = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let permit = lock.lock_owned().await;

        InFlight {
            _cleanup: CleanupGuard {
                map: &self.in_flight,
                key: key.to_string(),
            },
            _permit: permit,
        }
    }

    async fn call_upstream<T, F, Fut>(&self, key: &str, op: F) -> CacheResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let breaker = self.breaker.as_deref();
        if let Some(breaker) = breaker {
            if !breaker.allow_request() {
                debug!(key = %key, state = %breaker.state(), "Circuit open, failing fast");
                return Err(CacheError::CircuitOpen);
            }
        }

        let guard = FailureGuard::arm(breaker);
        self.upstream_calls.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Calling upstream");

        let outcome = match self.config.upstream_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(result) => result.map_err(CacheError::Upstream),
                Err(_) => Err(CacheError::UpstreamTimeout(limit)),
            },
            None => op().await.map_err(CacheError::Upstream),
        };

        match &outcome {
            Ok(_) => guard.succeed(),
            Err(e) => {
                drop(guard);
                warn!(key = %key, error = %e, "Upstream call failed");
            }
        }
        outcome
    }
}

impl std::fmt::Debug for CachingDecorator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingDecorator")
            .field("config", &self.config)
            .field("breaker", &self.breaker.as_ref().map(|b| b.state()))
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}
