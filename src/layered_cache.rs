//! Layered Cache - Ordered Lookup Across Tiers
//!
//! Queries tiers fastest first and returns on the first hit, copying the entry
//! into every tier above the one that served it. Writes go to every tier
//! independently: one tier failing never prevents the others from storing.
//!
//! Tier errors are swallowed here. They are logged, counted in the tier's
//! [`TierStats`], and reported through [`WriteReport`] for writes.

use crate::clock::{Clock, SystemClock};
use crate::entry::CacheEntry;
use crate::error::TierError;
use crate::stats::{CacheStats, CacheStatsSnapshot, TierStats};
use crate::traits::TierStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One tier that could not complete a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierFailure {
    pub tier: &'static str,
    pub error: TierError,
}

/// Per-tier outcome of a write, remove or clear
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Tiers that applied the operation, in tier order
    pub stored: Vec<&'static str>,
    /// Tiers that failed, in tier order
    pub failures: Vec<TierFailure>,
}

impl WriteReport {
    /// Every tier applied the operation
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether the named tier applied the operation
    #[must_use]
    pub fn stored_in(&self, tier: &str) -> bool {
        self.stored.contains(&tier)
    }

    /// Error reported by the named tier, if it failed
    #[must_use]
    pub fn failure_for(&self, tier: &str) -> Option<&TierError> {
        self.failures.iter().find(|f| f.tier == tier).map(|f| &f.error)
    }
}

/// Health of one tier as reported by [`LayeredCache::health_check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierHealth {
    pub tier: &'static str,
    pub healthy: bool,
}

struct TierSlot {
    store: Arc<dyn TierStore>,
    stats: TierStats,
}

/// Ordered set of cache tiers
///
/// # Example
///
/// ```rust,no_run
/// use recommender_cache::{LayeredCache, TierStore};
/// use recommender_cache::backends::{MemoryTier, MemoryTierConfig};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() {
/// let memory: Arc<dyn TierStore> = Arc::new(MemoryTier::new(MemoryTierConfig::default()));
/// let cache = LayeredCache::new(vec![memory]);
///
/// cache.set("req1", serde_json::json!({"modules": ["CRM"]}), Duration::from_secs(60)).await;
/// assert!(cache.get("req1").await.is_some());
/// # }
/// ```
pub struct LayeredCache {
    tiers: Vec<TierSlot>,
    stats: CacheStats,
    promotions: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl LayeredCache {
    /// Create a cache over `tiers`, fastest first
    #[must_use]
    pub fn new(tiers: Vec<Arc<dyn TierStore>>) -> Self {
        Self::with_clock(tiers, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(tiers: Vec<Arc<dyn TierStore>>, clock: Arc<dyn Clock>) -> Self {
        let tiers: Vec<TierSlot> = tiers
            .into_iter()
            .enumerate()
            .map(|(idx, store)| {
                let stats = TierStats::new(idx + 1, store.name());
                TierSlot { store, stats }
            })
            .collect();

        let names: Vec<&str> = tiers.iter().map(|t| t.stats.backend_name).collect();
        info!(tiers = ?names, "Initializing Layered Cache");

        Self {
            tiers,
            stats: CacheStats::new(),
            promotions: AtomicU64::new(0),
            clock,
        }
    }

    /// Get a value, promoting it into faster tiers on a lower-tier hit
    ///
    /// # Returns
    /// * `Some(value)` - Hit in some tier
    /// * `None` - Miss in every tier (tier errors count as misses)
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.get_entry(key).await.map(|entry| entry.value)
    }

    /// Like [`get`](Self::get) but returns the whole envelope
    pub async fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        for (idx, tier) in self.tiers.iter().enumerate() {
            match tier.store.get(key).await {
                Ok(Some(entry)) if !entry.is_expired(self.clock.now()) => {
                    tier.stats.record_hit();
                    self.stats.record_hit();
                    debug!(key = %key, tier = tier.stats.backend_name, "Cache hit");

                    if idx > 0 {
                        self.backfill(idx, key, &entry).await;
                    }
                    return Some(entry);
                }
                Ok(_) => tier.stats.record_miss(),
                Err(e) => {
                    tier.stats.record_error();
                    warn!(
                        key = %key,
                        tier = tier.stats.backend_name,
                        error = %e,
                        "Tier read failed, skipping"
                    );
                }
            }
        }

        self.stats.record_miss();
        debug!(key = %key, "Cache miss in all tiers");
        None
    }

    /// Copy `entry` into every tier above `hit_idx`, keeping its expiry
    async fn backfill(&self, hit_idx: usize, key: &str, entry: &CacheEntry) {
        for tier in self.tiers.iter().take(hit_idx) {
            match tier.store.set(key, entry).await {
                Ok(()) => {
                    tier.stats.record_write();
                    self.promotions.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, tier = tier.stats.backend_name, "Promoted entry");
                }
                Err(e) => {
                    tier.stats.record_error();
                    warn!(
                        key = %key,
                        tier = tier.stats.backend_name,
                        error = %e,
                        "Promotion failed"
                    );
                }
            }
        }
    }

    /// Write a value to every tier
    ///
    /// Never fails as a whole; per-tier outcomes are in the returned report.
    pub async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) -> WriteReport {
        let entry = CacheEntry::new(value, self.clock.now(), ttl);
        let mut report = WriteReport::default();

        for tier in &self.tiers {
            match tier.store.set(key, &entry).await {
                Ok(()) => {
                    tier.stats.record_write();
                    report.stored.push(tier.stats.backend_name);
                }
                Err(error) => {
                    tier.stats.record_error();
                    warn!(
                        key = %key,
                        tier = tier.stats.backend_name,
                        error = %error,
                        "Tier write failed"
                    );
                    report.failures.push(TierFailure {
                        tier: tier.stats.backend_name,
                        error,
                    });
                }
            }
        }

        if report.is_complete() {
            self.stats.record_set();
        } else {
            self.stats.record_error();
        }
        debug!(key = %key, ttl_secs = ttl.as_secs_f64(), stored = ?report.stored, "Cached value");
        report
    }

    /// Remove a key from every tier
    pub async fn remove(&self, key: &str) -> WriteReport {
        let mut report = WriteReport::default();
        for tier in &self.tiers {
            match tier.store.remove(key).await {
                Ok(()) => report.stored.push(tier.stats.backend_name),
                Err(error) => {
                    tier.stats.record_error();
                    warn!(
                        key = %key,
                        tier = tier.stats.backend_name,
                        error = %error,
                        "Tier remove failed"
                    );
                    report.failures.push(TierFailure {
                        tier: tier.stats.backend_name,
                        error,
                    });
                }
            }
        }
        report
    }

    /// Drop every entry in every tier
    pub async fn clear(&self) -> WriteReport {
        let mut report = WriteReport::default();
        for tier in &self.tiers {
            match tier.store.clear().await {
                Ok(()) => report.stored.push(tier.stats.backend_name),
                Err(error) => {
                    tier.stats.record_error();
                    warn!(tier = tier.stats.backend_name, error = %error, "Tier clear failed");
                    report.failures.push(TierFailure {
                        tier: tier.stats.backend_name,
                        error,
                    });
                }
            }
        }
        info!(cleared = ?report.stored, "Cache cleared");
        report
    }

    /// Snapshot of the global counters
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Per-tier counters, in tier order
    pub fn tier_stats(&self) -> impl Iterator<Item = &TierStats> {
        self.tiers.iter().map(|t| &t.stats)
    }

    /// Number of entries copied into faster tiers
    #[must_use]
    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    /// The tiers, fastest first
    #[must_use]
    pub fn tiers(&self) -> Vec<Arc<dyn TierStore>> {
        self.tiers.iter().map(|t| Arc::clone(&t.store)).collect()
    }

    /// Run every tier's health check
    pub async fn health_check(&self) -> Vec<TierHealth> {
        let mut health = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            let healthy = tier.store.health_check().await;
            if !healthy {
                warn!(tier = tier.stats.backend_name, "Tier health check failed");
            }
            health.push(TierHealth {
                tier: tier.stats.backend_name,
                healthy,
            });
        }
        health
    }
}

impl std::fmt::Debug for LayeredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.tiers.iter().map(|t| t.stats.backend_name).collect();
        f.debug_struct("LayeredCache")
            .field("tiers", &names)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}
