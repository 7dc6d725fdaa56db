//! Recommender Cache
//!
//! A layered cache with resilience controls for expensive, rate-limited,
//! occasionally failing upstream calls such as LLM-backed module recommendations:
//! - **Memory Tier**: bounded LRU table with access tracking
//! - **Disk Tier**: one file per key, survives restarts
//! - **Remote Tier**: optional Redis shared between processes
//! - **Circuit Breaker**: fail fast while the upstream is unhealthy
//! - **Stampede Protection**: concurrent misses on one key share one upstream call
//! - **Background Maintenance**: expiry sweeps and warming of frequently accessed keys
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use recommender_cache::{CacheConfig, CacheSystem, CallArgs};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheSystem::new(CacheConfig::from_env()?).await?;
//!     cache.start()?;
//!
//!     let args = CallArgs::new().arg("Inventory for three warehouses");
//!     let value = cache
//!         .decorator()
//!         .execute("recommend", &args, || async {
//!             Ok(serde_json::json!({"modules": [{"name": "stock"}]}))
//!         })
//!         .await?;
//!     tracing::info!("Recommendations: {}", value);
//!
//!     let stats = cache.cache().stats();
//!     tracing::info!("Hit rate: {:.2}%", stats.hit_rate() * 100.0);
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Request → Memory → Disk → Redis → Circuit Breaker → Upstream
//!           ↓ Hit    ↓ Hit   ↓ Hit                     ↓ Success
//!           Return   Promote Promote                   Store in all tiers
//! ```

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

pub mod backends;
pub mod builder;
pub mod circuit_breaker;
pub mod clock;
pub mod codecs;
pub mod config;
pub mod decorator;
pub mod entry;
pub mod error;
pub mod key_codec;
pub mod layered_cache;
pub mod maintenance;
pub mod recommendation;
pub mod stats;
pub mod traits;

pub use backends::{DiskTier, DiskTierConfig, MemoryTier, MemoryTierConfig};
#[cfg(feature = "redis")]
pub use backends::{RedisTier, RedisTierConfig};
pub use builder::CacheSystemBuilder;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use decorator::{CachingDecorator, DecoratorConfig};
pub use entry::{CacheEntry, ENTRY_FORMAT_VERSION, MAX_ENTRY_TTL};
pub use error::{CacheError, CacheResult, TierError};
pub use key_codec::{CallArgs, KeyCodec};
pub use layered_cache::{LayeredCache, TierFailure, TierHealth, WriteReport};
pub use maintenance::{MaintenanceConfig, MaintenanceReport, MaintenanceScheduler, WarmSource};
pub use recommendation::{
    CachedRecommender, ModuleRecommendation, RecommendationProvider, RecommendationRequest,
    Recommendations,
};
pub use stats::{CacheStats, CacheStatsSnapshot, TierStats};
pub use traits::{CacheCodec, TierStore};

// Re-export async_trait for user convenience
pub use async_trait::async_trait;

/// Main entry point for the Recommender Cache system
///
/// Owns the layered cache, the circuit breaker, the decorator and the
/// maintenance scheduler. Cloning is cheap and shares every component.
///
/// # Example
///
/// ```rust,no_run
/// use recommender_cache::{CacheConfig, CacheSystem};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let cache = CacheSystem::new(CacheConfig::default()).await?;
///
///     // Use the decorator for upstream calls, the layered cache for direct access
///     let decorator = cache.decorator();
///     let layered = cache.cache();
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct CacheSystem {
    pub(crate) config: Arc<CacheConfig>,
    pub(crate) cache: Arc<LayeredCache>,
    pub(crate) memory: Arc<MemoryTier>,
    pub(crate) breaker: Option<Arc<CircuitBreaker>>,
    pub(crate) decorator: Arc<CachingDecorator>,
    pub(crate) scheduler: Arc<MaintenanceScheduler>,
}

impl CacheSystem {
    /// Create a cache system from `config`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub async fn new(config: CacheConfig) -> Result<Self> {
        info!("Initializing Recommender Cache System");
        CacheSystemBuilder::new().with_config(config).build().await
    }

    /// Create a cache system from environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or the resulting
    /// configuration is invalid.
    pub async fn from_env() -> Result<Self> {
        Self::new(CacheConfig::from_env()?).await
    }

    #[must_use]
    pub fn builder() -> CacheSystemBuilder {
        CacheSystemBuilder::new()
    }

    /// Start background maintenance
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::MaintenanceAlreadyRunning`] if already started.
    pub fn start(&self) -> CacheResult<()> {
        self.scheduler.start()
    }

    /// Stop background maintenance and wait for it to finish
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        info!("Recommender Cache System shut down");
    }

    /// Perform health check on all cache tiers
    ///
    /// Returns `true` if the memory tier is operational.
    /// Disk and remote failures are tolerated (graceful degradation).
    pub async fn health_check(&self) -> bool {
        let health = self.cache.health_check().await;
        let memory_ok = health.iter().find(|h| h.tier == "memory").is_some_and(|h| h.healthy);
        let degraded: Vec<&str> = health.iter().filter(|h| !h.healthy).map(|h| h.tier).collect();

        if degraded.is_empty() {
            info!("Recommender Cache health check passed");
        } else {
            warn!(degraded = ?degraded, "Recommender Cache health check - partial failure");
        }
        memory_ok
    }

    /// Wrap `provider` so its answers go through the cache
    #[must_use]
    pub fn recommender<P: RecommendationProvider>(&self, provider: Arc<P>) -> CachedRecommender<P> {
        CachedRecommender::new(provider, Arc::clone(&self.decorator))
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<LayeredCache> {
        &self.cache
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<MemoryTier> {
        &self.memory
    }

    /// `None` when the circuit breaker is disabled
    #[must_use]
    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    #[must_use]
    pub fn decorator(&self) -> &Arc<CachingDecorator> {
        &self.decorator
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<MaintenanceScheduler> {
        &self.scheduler
    }
}

impl std::fmt::Debug for CacheSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSystem")
            .field("cache", &self.cache)
            .field("breaker", &self.breaker.as_ref().map(|b| b.state()))
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
