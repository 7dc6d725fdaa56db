//! Cache System Builder
//!
//! Assembles a [`CacheSystem`] from a [`CacheConfig`]: memory tier first, then
//! disk, then the remote tier, then any custom tiers.
//!
//! Optional tiers degrade instead of failing the build. A disk directory that
//! cannot be created or a Redis server that does not answer is logged and left
//! out of the hierarchy.
//!
//! # Example: Default Tiers
//!
//! ```rust,no_run
//! use recommender_cache::CacheSystemBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheSystemBuilder::new()
//!         .build()
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: Custom Remote Tier
//!
//! ```rust,ignore
//! use recommender_cache::{CacheSystemBuilder, TierStore};
//! use std::sync::Arc;
//!
//! let shared = Arc::new(MySharedStore::new());
//!
//! let cache = CacheSystemBuilder::new()
//!     .with_remote(shared)
//!     .build()
//!     .await?;
//! ```

use crate::backends::{DiskTier, DiskTierConfig, MemoryTier, MemoryTierConfig};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::clock::{Clock, SystemClock};
use crate::codecs::JsonCodec;
use crate::config::CacheConfig;
use crate::decorator::{CachingDecorator, DecoratorConfig};
use crate::layered_cache::LayeredCache;
use crate::maintenance::{MaintenanceConfig, MaintenanceScheduler, WarmSource};
use crate::traits::TierStore;
use crate::CacheSystem;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Builder for constructing [`CacheSystem`]
///
/// # Default Behavior
///
/// With no overrides the builder uses [`CacheConfig::default`], the system
/// clock, a memory tier, a disk tier under the temp directory, and no remote
/// tier (set `remote_url` to enable Redis).
#[derive(Default)]
pub struct CacheSystemBuilder {
    config: CacheConfig,
    clock: Option<Arc<dyn Clock>>,
    remote: Option<Arc<dyn TierStore>>,
    extra_tiers: Vec<Arc<dyn TierStore>>,
    warm_source: Option<Arc<dyn WarmSource>>,
}

impl CacheSystemBuilder {
    /// Create a new builder with the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used for entry timestamps in every built-in tier
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `tier` as the remote tier instead of connecting to `remote_url`
    #[must_use]
    pub fn with_remote(mut self, tier: Arc<dyn TierStore>) -> Self {
        self.remote = Some(tier);
        self
    }

    /// Append a tier below the built-in ones
    #[must_use]
    pub fn with_tier(mut self, tier: Arc<dyn TierStore>) -> Self {
        self.extra_tiers.push(tier);
        self
    }

    /// Source of fresh values for the warming pass
    #[must_use]
    pub fn with_warm_source(mut self, source: Arc<dyn WarmSource>) -> Self {
        self.warm_source = Some(source);
        self
    }

    /// Build the `CacheSystem`
    ///
    /// Background maintenance is not started; call [`CacheSystem::start`].
    ///
    /// # Errors
    ///
    /// Returns an error only for an invalid configuration. Unreachable
    /// optional tiers are skipped with a warning.
    pub async fn build(self) -> Result<CacheSystem> {
        info!("Building Recommender Cache System...");
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let memory = Arc::new(MemoryTier::with_clock(
            MemoryTierConfig {
                capacity: config.memory_capacity,
                access_threshold: config.access_threshold_for_warming,
            },
            Arc::clone(&clock),
        ));
        let mut tiers: Vec<Arc<dyn TierStore>> = vec![memory.clone()];

        if config.disk_enabled {
            let disk_config = DiskTierConfig::new(&config.disk_dir).io_timeout(config.io_timeout);
            match DiskTier::with_codec(disk_config, JsonCodec, Arc::clone(&clock)).await {
                Ok(disk) => tiers.push(Arc::new(disk)),
                Err(e) => warn!(
                    dir = %config.disk_dir.display(),
                    error = %e,
                    "Disk tier unavailable, continuing without it"
                ),
            }
        }

        if let Some(remote) = self.remote {
            info!(tier = remote.name(), "Using custom remote tier");
            tiers.push(remote);
        } else if let Some(url) = &config.remote_url {
            if let Some(redis) = connect_redis(url, &config, &clock).await {
                tiers.push(redis);
            }
        }

        tiers.extend(self.extra_tiers);

        let cache = Arc::new(LayeredCache::with_clock(tiers, Arc::clone(&clock)));

        let breaker = config.circuit_breaker_enabled.then(|| {
            Arc::new(CircuitBreaker::new(
                CircuitBreakerConfig::new(config.failure_threshold, config.circuit_reset_timeout)
                    .half_open_probe_rate(config.half_open_probe_rate),
            ))
        });

        let decorator = Arc::new(CachingDecorator::new(
            Arc::clone(&cache),
            breaker.clone(),
            DecoratorConfig::from(&config),
        ));

        let mut scheduler = MaintenanceScheduler::new(
            Arc::clone(&cache),
            Arc::clone(&memory),
            MaintenanceConfig::from(&config),
        )
        .with_clock(clock);
        if let Some(source) = self.warm_source {
            scheduler = scheduler.with_warm_source(source);
        }

        let tier_names: Vec<&str> = cache.tiers().iter().map(|t| t.name()).collect();
        info!(
            tiers = ?tier_names,
            breaker = breaker.is_some(),
            "Recommender Cache System built successfully"
        );

        Ok(CacheSystem {
            config: Arc::new(config),
            cache,
            memory,
            breaker,
            decorator,
            scheduler: Arc::new(scheduler),
        })
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(
    url: &str,
    config: &CacheConfig,
    clock: &Arc<dyn Clock>,
) -> Option<Arc<dyn TierStore>> {
    use crate::backends::{RedisTier, RedisTierConfig};

    let redis_config = RedisTierConfig::new(url)
        .key_prefix(config.remote_key_prefix.clone())
        .io_timeout(config.io_timeout);
    match RedisTier::with_codec(redis_config, JsonCodec, Arc::clone(clock)).await {
        Ok(redis) => Some(Arc::new(redis)),
        Err(e) => {
            warn!(error = %e, "Redis unavailable, continuing without remote tier");
            None
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(
    _url: &str,
    _config: &CacheConfig,
    _clock: &Arc<dyn Clock>,
) -> Option<Arc<dyn TierStore>> {
    warn!("remote_url is set but the `redis` feature is disabled; remote tier skipped");
    None
}
