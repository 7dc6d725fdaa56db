//! Background maintenance: expiry sweeps, access-record pruning and warming
//!
//! The scheduler runs independently of request traffic. Its lifecycle is
//! explicit: nothing runs until [`MaintenanceScheduler::start`] and
//! [`MaintenanceScheduler::stop`] waits for the task to finish.

use crate::backends::MemoryTier;
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};
use crate::layered_cache::LayeredCache;
use crate::traits::TierStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Supplies fresh values for frequently accessed keys about to expire
///
/// Without a source the scheduler re-stores the current value with a fresh TTL.
#[async_trait]
pub trait WarmSource: Send + Sync {
    /// Fresh value for `key`
    ///
    /// `Ok(None)` keeps the current value.
    ///
    /// # Errors
    ///
    /// Any error skips warming this key for the current pass.
    async fn refresh(
        &self,
        key: &str,
        current: &CacheEntry,
    ) -> anyhow::Result<Option<serde_json::Value>>;
}

/// Maintenance timing knobs
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Time between passes
    pub interval: Duration,
    /// Access records idle longer than this are dropped
    pub access_retention: Duration,
    /// Frequent keys expiring within this window are warmed
    pub warm_ahead: Duration,
    /// TTL given to warmed entries
    pub warm_ttl: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for MaintenanceConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            interval: config.maintenance_interval,
            access_retention: config.access_retention,
            warm_ahead: config.effective_warm_ahead(),
            warm_ttl: config.disk_ttl_default,
        }
    }
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Expired entries dropped across all tiers
    pub expired_removed: usize,
    pub access_records_pruned: usize,
    /// Keys currently above the access threshold
    pub frequent_keys: usize,
    pub warmed: usize,
    /// Tier or warm-source failures seen during the pass
    pub errors: usize,
}

/// Periodic sweeper for a [`LayeredCache`]
pub struct MaintenanceScheduler {
    cache: Arc<LayeredCache>,
    memory: Arc<MemoryTier>,
    config: MaintenanceConfig,
    warm_source: Option<Arc<dyn WarmSource>>,
    clock: Arc<dyn Clock>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
    runs: AtomicU64,
    last_report: Mutex<Option<MaintenanceReport>>,
}

impl MaintenanceScheduler {
    /// `memory` must be the memory tier registered in `cache`
    #[must_use]
    pub fn new(
        cache: Arc<LayeredCache>,
        memory: Arc<MemoryTier>,
        config: MaintenanceConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            cache,
            memory,
            config,
            warm_source: None,
            clock: Arc::new(SystemClock),
            shutdown_tx,
            task: Mutex::new(None),
            runs: AtomicU64::new(0),
            last_report: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_warm_source(mut self, source: Arc<dyn WarmSource>) -> Self {
        self.warm_source = Some(source);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// Completed passes, scheduled or manual
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_report(&self) -> Option<MaintenanceReport> {
        *self.last_report.lock()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Spawn the periodic task; the first pass runs one interval from now
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::MaintenanceAlreadyRunning`] if a task is active.
    pub fn start(self: &Arc<Self>) -> CacheResult<()> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(CacheError::MaintenanceAlreadyRunning);
        }

        let interval = self.config.interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let this = Arc::clone(self);

        *task = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // A pass runs in its own task so a panic ends that pass only
                        let pass = tokio::spawn({
                            let this = Arc::clone(&this);
                            async move { this.run_once().await }
                        });
                        match pass.await {
                            Ok(report) if report.errors > 0 => {
                                warn!(
                                    errors = report.errors,
                                    "Maintenance pass finished with errors"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(error = %e, "Maintenance pass aborted, retrying next tick");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Maintenance scheduler shutting down...");
                        break;
                    }
                }
            }
        }));

        info!(interval_secs = interval.as_secs_f64(), "Maintenance scheduler started");
        Ok(())
    }

    /// Signal the task to stop and wait for it
    ///
    /// A pass in progress finishes first. Calling `stop` when nothing runs is
    /// a no-op.
    pub async fn stop(&self) {
        let handle = self.task.lock().take();
        let Some(handle) = handle else {
            return;
        };

        // No receiver means the task already exited
        let _ = self.shutdown_tx.send(());
        if let Err(e) = handle.await {
            error!(error = %e, "Maintenance task ended abnormally");
        }
        info!("Maintenance scheduler stopped");
    }

    /// Run one full pass now
    pub async fn run_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        for tier in self.cache.tiers() {
            match tier.evict_expired().await {
                Ok(removed) => report.expired_removed += removed,
                Err(e) => {
                    report.errors += 1;
                    error!(tier = tier.name(), error = %e, "Expiry sweep failed");
                }
            }
        }

        report.access_records_pruned =
            self.memory.prune_access_records(self.config.access_retention);

        let frequent = self.memory.frequent_keys();
        report.frequent_keys = frequent.len();
        for key in &frequent {
            self.warm_key(key, &mut report).await;
        }

        self.runs.fetch_add(1, Ordering::Relaxed);
        *self.last_report.lock() = Some(report);
        info!(
            expired_removed = report.expired_removed,
            access_records_pruned = report.access_records_pruned,
            frequent_keys = report.frequent_keys,
            warmed = report.warmed,
            errors = report.errors,
            "Maintenance pass complete"
        );
        report
    }

    async fn warm_key(&self, key: &str, report: &mut MaintenanceReport) {
        let Some(entry) = self.current_entry(key).await else {
            return;
        };
        let Some(remaining) = entry.remaining_ttl(self.clock.now()) else {
            return;
        };
        if remaining >= self.config.warm_ahead {
            return;
        }

        let value = match &self.warm_source {
            None => entry.value.clone(),
            Some(source) => match source.refresh(key, &entry).await {
                Ok(Some(fresh)) => fresh,
                Ok(None) => entry.value.clone(),
                Err(e) => {
                    report.errors += 1;
                    warn!(key = %key, error = %e, "Warm source failed, keeping entry as is");
                    return;
                }
            },
        };

        let written = self.cache.set(key, value, self.config.warm_ttl).await;
        report.errors += written.failures.len();
        if !written.stored.is_empty() {
            report.warmed += 1;
            debug!(
                key = %key,
                remaining_secs = remaining.as_secs(),
                "Warmed frequently accessed key"
            );
        }
    }

    /// Current entry without counting an access or touching cache stats
    async fn current_entry(&self, key: &str) -> Option<CacheEntry> {
        if let Some(entry) = self.memory.peek(key) {
            return Some(entry);
        }

        let memory: Arc<dyn TierStore> = self.memory.clone();
        for tier in self.cache.tiers() {
            if Arc::ptr_eq(&tier, &memory) {
                continue;
            }
            match tier.get(key).await {
                Ok(Some(entry)) => return Some(entry),
                Ok(None) => {}
                Err(e) => {
                    debug!(
                        key = %key,
                        tier = tier.name(),
                        error = %e,
                        "Skipping tier while warming"
                    );
                }
            }
        }
        None
    }
}

impl std::fmt::Debug for MaintenanceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceScheduler")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("runs", &self.runs())
            .finish_non_exhaustive()
    }
}
