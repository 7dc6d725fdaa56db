//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - Cache system setup over a temporary disk directory
//! - An in-process stand-in for the remote tier that can be switched off
//! - Test data generators

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use recommender_cache::{
    CacheConfig, CacheEntry, CacheSystem, CacheSystemBuilder, Clock, ManualClock, TierError,
    TierStore,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tempfile::TempDir;

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a test key with unique suffix
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

/// Temporary cache directory, removed when dropped
pub fn temp_dir() -> TempDir {
    tempfile::tempdir().unwrap_or_else(|e| panic!("Failed to create temp dir: {e}"))
}

/// Default configuration with the disk tier under `dir`
pub fn test_config(dir: &TempDir) -> CacheConfig {
    CacheConfig::default().disk_dir(dir.path().join("cache"))
}

/// Initialize a memory + disk cache system for testing
pub async fn setup_cache_system(dir: &TempDir) -> Result<CacheSystem> {
    init_tracing();
    CacheSystem::new(test_config(dir)).await
}

/// Cache system driven by a manual clock, with an optional remote stand-in
pub async fn setup_with_clock(
    config: CacheConfig,
    clock: Arc<ManualClock>,
    remote: Option<Arc<SharedTier>>,
) -> Result<CacheSystem> {
    init_tracing();
    let mut builder = CacheSystemBuilder::new().with_config(config).with_clock(clock);
    if let Some(remote) = remote {
        builder = builder.with_remote(remote);
    }
    builder.build().await
}

/// In-process remote tier
///
/// Behaves like a shared key-value store. `set_down(true)` makes every call
/// fail the way an unreachable server would.
#[derive(Debug)]
pub struct SharedTier {
    entries: Mutex<HashMap<String, CacheEntry>>,
    down: AtomicBool,
    clock: Arc<dyn Clock>,
    pub gets: AtomicU64,
    pub sets: AtomicU64,
}

impl SharedTier {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            down: AtomicBool::new(false),
            clock,
            gets: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn seed(&self, key: &str, entry: CacheEntry) {
        self.entries.lock().insert(key.to_string(), entry);
    }

    fn check(&self) -> Result<(), TierError> {
        if self.down.load(Ordering::SeqCst) {
            Err(TierError::Unavailable {
                tier: "remote",
                reason: "connection refused".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TierStore for SharedTier {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
        self.check()?;
        self.gets.fetch_add(1, Ordering::SeqCst);
        let now = self.clock.now();
        Ok(self.entries.lock().get(key).filter(|e| !e.is_expired(now)).cloned())
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<(), TierError> {
        self.check()?;
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), TierError> {
        self.check()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn evict_expired(&self) -> Result<usize, TierError> {
        self.check()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok(before - entries.len())
    }

    async fn clear(&self) -> Result<(), TierError> {
        self.check()?;
        self.entries.lock().clear();
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.check().is_ok()
    }
}

/// Generate test data
pub mod test_data {
    use serde_json::json;

    /// Provider-shaped answer listing the given module names
    pub fn json_recommendation(modules: &[&str]) -> serde_json::Value {
        json!({
            "modules": modules
                .iter()
                .map(|name| {
                    json!({
                        "name": name,
                        "description": format!("{name} module"),
                        "key_features": [],
                        "category": "General"
                    })
                })
                .collect::<Vec<_>>(),
            "summary": format!("{} modules", modules.len()),
        })
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    use tokio::time::{Duration, sleep};

    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }

    false
}

/// Assert on a field of the layered cache stats
#[macro_export]
macro_rules! assert_cache_stats {
    ($cache:expr, $field:ident == $value:expr) => {
        let stats = $cache.cache().stats();
        assert_eq!(
            stats.$field,
            $value,
            "Expected {} == {}, got {}",
            stringify!($field),
            $value,
            stats.$field
        );
    };
}
