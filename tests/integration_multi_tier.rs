//! Integration tests for the tier hierarchy
//!
//! Promotion from lower tiers, degraded writes and graceful fallback when the
//! disk or remote tier stops working.

mod common;

use common::*;
use recommender_cache::backends::{DiskTier, DiskTierConfig};
use recommender_cache::{CacheEntry, Clock, ManualClock, TierError, TierStore};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Seed only the disk tier; a layered get backfills memory
#[tokio::test]
async fn test_disk_hit_promotes_to_memory() {
    let dir = temp_dir();
    let clock = Arc::new(ManualClock::new());
    let cache = setup_with_clock(test_config(&dir), clock.clone(), None)
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    let disk = DiskTier::with_codec(
        DiskTierConfig::new(dir.path().join("cache")),
        recommender_cache::codecs::JsonCodec,
        clock.clone(),
    )
    .await
    .unwrap_or_else(|e| panic!("{e}"));
    let entry = CacheEntry::new(json!({"modules": ["CRM"]}), clock.now(), Duration::from_secs(600));
    disk.set("k", &entry).await.unwrap_or_else(|e| panic!("{e}"));

    assert!(cache.memory().peek("k").is_none());
    assert_eq!(cache.cache().get("k").await, Some(json!({"modules": ["CRM"]})));

    let promoted = cache.memory().peek("k").unwrap_or_else(|| panic!("not promoted"));
    assert_eq!(promoted.expires_at, entry.expires_at);
    assert_eq!(cache.cache().promotions(), 1);

    let memory_stats = cache.cache().tier_stats().next().map(|s| (s.miss_count(), s.write_count()));
    assert_eq!(memory_stats, Some((1, 1)));
}

/// A remote hit fills both memory and disk
#[tokio::test]
async fn test_remote_hit_backfills_all_upper_tiers() {
    let dir = temp_dir();
    let clock = Arc::new(ManualClock::new());
    let remote = Arc::new(SharedTier::new(clock.clone()));
    let cache = setup_with_clock(test_config(&dir), clock.clone(), Some(remote.clone()))
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    remote.seed(
        "shared",
        CacheEntry::new(json!("from another process"), clock.now(), Duration::from_secs(600)),
    );

    assert_eq!(cache.cache().get("shared").await, Some(json!("from another process")));
    assert!(cache.memory().peek("shared").is_some());
    assert_eq!(cache.cache().promotions(), 2);

    // Next read is served by memory without touching the remote
    let remote_gets = remote.gets.load(Ordering::SeqCst);
    assert!(cache.cache().get("shared").await.is_some());
    assert_eq!(remote.gets.load(Ordering::SeqCst), remote_gets);
}

/// Disk values survive a restart of the cache system
#[tokio::test]
async fn test_disk_persists_across_instances() {
    let dir = temp_dir();
    let key = test_key("persist");

    {
        let first = setup_cache_system(&dir).await.unwrap_or_else(|e| panic!("{e}"));
        first.cache().set(&key, json!("kept"), Duration::from_secs(600)).await;
    }

    let second = setup_cache_system(&dir).await.unwrap_or_else(|e| panic!("{e}"));
    assert!(second.memory().is_empty());
    assert_eq!(second.cache().get(&key).await, Some(json!("kept")));
}

/// A broken disk never blocks the memory write
#[tokio::test]
async fn test_disk_failure_does_not_block_memory() {
    let dir = temp_dir();
    let cache = setup_cache_system(&dir).await.unwrap_or_else(|e| panic!("{e}"));

    // Replace the cache directory with a plain file
    let cache_dir = dir.path().join("cache");
    std::fs::remove_dir_all(&cache_dir).unwrap_or_else(|e| panic!("{e}"));
    std::fs::write(&cache_dir, b"not a directory").unwrap_or_else(|e| panic!("{e}"));

    let report = cache.cache().set("k", json!("v"), Duration::from_secs(60)).await;
    assert!(report.stored_in("memory"));
    assert!(matches!(
        report.failure_for("disk"),
        Some(TierError::Unavailable { tier: "disk", .. })
    ));
    assert_eq!(cache.cache().stats().errors, 1);

    assert_eq!(cache.cache().get("k").await, Some(json!("v")));
}

/// Remote outage: reads fall back, writes still land locally
#[tokio::test]
async fn test_remote_unavailable_degrades_gracefully() {
    let dir = temp_dir();
    let clock = Arc::new(ManualClock::new());
    let remote = Arc::new(SharedTier::new(clock.clone()));
    let cache = setup_with_clock(test_config(&dir), clock.clone(), Some(remote.clone()))
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    remote.set_down(true);

    let report = cache.cache().set("k", json!(1), Duration::from_secs(60)).await;
    assert_eq!(report.stored, vec!["memory", "disk"]);
    assert_eq!(report.failures.len(), 1);
    assert!(!remote.contains("k"));

    assert_eq!(cache.cache().get("k").await, Some(json!(1)));
    assert_eq!(cache.cache().get("missing").await, None);

    let remote_errors = cache.cache().tier_stats().nth(2).map(|s| s.error_count());
    assert_eq!(remote_errors, Some(2));
    // Memory is up, so the system still reports healthy
    assert!(cache.health_check().await);

    remote.set_down(false);
    cache.cache().set("k2", json!(2), Duration::from_secs(60)).await;
    assert!(remote.contains("k2"));
}

/// Corrupt disk files read as misses and are removed
#[tokio::test]
async fn test_corrupt_disk_entry_is_discarded() {
    let dir = temp_dir();
    let cache = setup_cache_system(&dir).await.unwrap_or_else(|e| panic!("{e}"));

    let disk = DiskTier::new(DiskTierConfig::new(dir.path().join("cache")))
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    let path = disk.path_for("broken");
    tokio::fs::write(&path, b"{not json").await.unwrap_or_else(|e| panic!("{e}"));

    assert_eq!(cache.cache().get("broken").await, None);
    assert!(!path.exists());
}
