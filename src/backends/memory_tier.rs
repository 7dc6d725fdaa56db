//! Memory Tier - Bounded In-Process Table
//!
//! Fastest tier. Holds at most `capacity` entries and evicts the least
//! recently used one when a new key arrives at capacity. Also keeps per-key
//! access records that the maintenance pass uses to pick keys worth warming.

use crate::clock::{Clock, SystemClock};
use crate::entry::CacheEntry;
use crate::error::TierError;
use crate::traits::TierStore;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Configuration for [`MemoryTier`]
#[derive(Debug, Clone, Copy)]
pub struct MemoryTierConfig {
    /// Maximum number of entries
    pub capacity: usize,
    /// Accesses after which a key is considered frequently accessed
    pub access_threshold: u64,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            access_threshold: 5,
        }
    }
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    /// Logical access sequence; the smallest value is the LRU victim
    last_used: u64,
}

#[derive(Debug, Default)]
struct TableState {
    slots: HashMap<String, Slot>,
    tick: u64,
}

impl TableState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn evict_lru(&mut self) -> Option<String> {
        let victim = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(key, _)| key.clone())?;
        self.slots.remove(&victim);
        Some(victim)
    }
}

/// Access bookkeeping for one key
///
/// Kept apart from the entries so a key evicted under memory pressure keeps
/// its popularity and can still be warmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRecord {
    pub count: u64,
    pub last_access: SystemTime,
}

/// Bounded LRU memory tier
///
/// **Features**:
/// - Single coarse lock around the table (contention is negligible next to
///   disk and upstream latency)
/// - O(n) LRU victim scan on insert at capacity
/// - Access counting for frequently accessed keys
///
/// **Example**:
/// ```rust
/// use recommender_cache::backends::{MemoryTier, MemoryTierConfig};
/// use recommender_cache::{CacheEntry, TierStore};
/// use std::time::{Duration, SystemTime};
///
/// # async fn example() -> anyhow::Result<()> {
/// let tier = MemoryTier::new(MemoryTierConfig::default());
/// let value = serde_json::json!({"modules": ["CRM"]});
/// let entry = CacheEntry::new(value, SystemTime::now(), Duration::from_secs(60));
///
/// tier.set("req1", &entry).await?;
/// assert_eq!(tier.get("req1").await?, Some(entry));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryTier {
    state: Mutex<TableState>,
    access: DashMap<String, AccessRecord>,
    frequent: DashSet<String>,
    config: MemoryTierConfig,
    clock: Arc<dyn Clock>,
    evictions: AtomicU64,
}

impl MemoryTier {
    #[must_use]
    pub fn new(config: MemoryTierConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(config: MemoryTierConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            capacity = config.capacity,
            access_threshold = config.access_threshold,
            "Initializing Memory Tier"
        );

        Self {
            state: Mutex::new(TableState::default()),
            access: DashMap::new(),
            frequent: DashSet::new(),
            config,
            clock,
            evictions: AtomicU64::new(0),
        }
    }

    /// Number of entries currently held (expired ones included until swept)
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Entries evicted for capacity since creation
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Look at an entry without touching recency or access counts
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.state.lock().slots.get(key).map(|slot| slot.entry.clone())
    }

    #[must_use]
    pub fn access_record(&self, key: &str) -> Option<AccessRecord> {
        self.access.get(key).map(|record| *record)
    }

    /// Keys that crossed the access threshold
    #[must_use]
    pub fn frequent_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.frequent.iter().map(|key| key.clone()).collect();
        keys.sort();
        keys
    }

    /// Drop access records older than `retention` and rebuild the frequent set
    ///
    /// Returns the number of records dropped.
    pub fn prune_access_records(&self, retention: Duration) -> usize {
        let now = self.clock.now();
        let before = self.access.len();
        self.access.retain(|_, record| {
            now.duration_since(record.last_access)
                .map_or(true, |age| age < retention)
        });
        let pruned = before.saturating_sub(self.access.len());

        self.frequent.clear();
        for record in &self.access {
            if record.count >= self.config.access_threshold {
                self.frequent.insert(record.key().clone());
            }
        }

        if pruned > 0 {
            debug!(pruned, frequent = self.frequent.len(), "[Memory] Pruned access records");
        }
        pruned
    }

    /// Evict LRU entries until the table fits its capacity
    ///
    /// Returns the number of entries evicted. Inserts already keep the table
    /// bounded, so this is normally zero.
    pub fn evict_to_capacity(&self) -> usize {
        let mut state = self.state.lock();
        let mut evicted = 0;
        while state.slots.len() > self.config.capacity {
            if state.evict_lru().is_none() {
                break;
            }
            evicted += 1;
        }
        drop(state);
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    fn record_access(&self, key: &str, now: SystemTime) {
        let mut record = self.access.entry(key.to_string()).or_insert(AccessRecord {
            count: 0,
            last_access: now,
        });
        record.count += 1;
        record.last_access = now;
        let crossed = record.count >= self.config.access_threshold;
        drop(record);

        if crossed && self.frequent.insert(key.to_string()) {
            debug!(key = %key, "[Memory] Key marked as frequently accessed");
        }
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new(MemoryTierConfig::default())
    }
}

#[async_trait]
impl TierStore for MemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
        let now = self.clock.now();
        let found = {
            let mut state = self.state.lock();
            let tick = state.next_tick();
            match state.slots.get(key).map(|slot| slot.entry.is_expired(now)) {
                Some(true) => {
                    state.slots.remove(key);
                    None
                }
                Some(false) => state.slots.get_mut(key).map(|slot| {
                    slot.last_used = tick;
                    slot.entry.clone()
                }),
                None => None,
            }
        };

        if found.is_some() {
            self.record_access(key, now);
        }
        Ok(found)
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<(), TierError> {
        let mut state = self.state.lock();
        let tick = state.next_tick();

        if !state.slots.contains_key(key) && state.slots.len() >= self.config.capacity {
            if let Some(victim) = state.evict_lru() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(victim = %victim, "[Memory] Evicted least recently used entry");
            }
        }

        state.slots.insert(
            key.to_string(),
            Slot {
                entry: entry.clone(),
                last_used: tick,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), TierError> {
        self.state.lock().slots.remove(key);
        Ok(())
    }

    async fn evict_expired(&self) -> Result<usize, TierError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let before = state.slots.len();
        state.slots.retain(|_, slot| !slot.entry.is_expired(now));
        let removed = before - state.slots.len();
        if removed > 0 {
            debug!(count = removed, "[Memory] Cleaned up expired entries");
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), TierError> {
        self.state.lock().slots.clear();
        self.access.clear();
        self.frequent.clear();
        Ok(())
    }

    async fn health_check(&self) -> bool {
        // Purely in-process: usable as long as the table lock can be taken
        self.state.try_lock_for(Duration::from_millis(100)).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn entry(value: serde_json::Value, clock: &dyn Clock, ttl_secs: u64) -> CacheEntry {
        CacheEntry::new(value, clock.now(), Duration::from_secs(ttl_secs))
    }

    fn tier(capacity: usize, clock: Arc<ManualClock>) -> MemoryTier {
        MemoryTier::with_clock(
            MemoryTierConfig {
                capacity,
                access_threshold: 3,
            },
            clock,
        )
    }

    #[tokio::test]
    async fn test_round_trip() {
        let clock = Arc::new(ManualClock::new());
        let tier = tier(10, Arc::clone(&clock));
        let e = entry(json!({"modules": ["CRM"]}), clock.as_ref(), 3600);

        tier.set("req1", &e).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(tier.get("req1").await.unwrap_or_default(), Some(e));
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss_and_removed() {
        let clock = Arc::new(ManualClock::new());
        let tier = tier(10, Arc::clone(&clock));
        tier.set("k", &entry(json!(1), clock.as_ref(), 1))
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        clock.advance(Duration::from_secs(2));
        assert_eq!(tier.get("k").await.unwrap_or_default(), None);
        assert!(tier.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_evicts_exactly_the_lru_key() {
        let clock = Arc::new(ManualClock::new());
        let tier = tier(3, Arc::clone(&clock));
        for key in ["a", "b", "c"] {
            tier.set(key, &entry(json!(key), clock.as_ref(), 60))
                .await
                .unwrap_or_else(|e| panic!("{e}"));
        }
        // Touch "a" so "b" becomes least recently used
        assert!(tier.get("a").await.unwrap_or_default().is_some());

        tier.set("d", &entry(json!("d"), clock.as_ref(), 60))
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        assert_eq!(tier.len(), 3);
        assert_eq!(tier.evictions(), 1);
        assert!(tier.peek("b").is_none());
        for key in ["a", "c", "d"] {
            assert!(tier.peek(key).is_some(), "{key} should survive");
        }
    }

    #[tokio::test]
    async fn test_overwrite_at_capacity_does_not_evict() {
        let clock = Arc::new(ManualClock::new());
        let tier = tier(2, Arc::clone(&clock));
        for key in ["a", "b", "a"] {
            tier.set(key, &entry(json!(key), clock.as_ref(), 60))
                .await
                .unwrap_or_else(|e| panic!("{e}"));
        }
        assert_eq!(tier.evictions(), 0);
        assert_eq!(tier.len(), 2);
    }

    #[tokio::test]
    async fn test_frequent_keys_and_pruning() {
        let clock = Arc::new(ManualClock::new());
        let tier = tier(10, Arc::clone(&clock));
        tier.set("hot", &entry(json!("hot"), clock.as_ref(), 600))
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        tier.set("cold", &entry(json!("cold"), clock.as_ref(), 600))
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        for _ in 0..3 {
            let _ = tier.get("hot").await;
        }
        let _ = tier.get("cold").await;
        // Misses are not accesses
        let _ = tier.get("absent").await;

        assert_eq!(tier.frequent_keys(), vec!["hot".to_string()]);
        assert_eq!(tier.access_record("hot").map(|r| r.count), Some(3));
        assert!(tier.access_record("absent").is_none());

        clock.advance(Duration::from_secs(120));
        let _ = tier.get("cold").await;
        let pruned = tier.prune_access_records(Duration::from_secs(60));
        assert_eq!(pruned, 1);
        assert!(tier.frequent_keys().is_empty());
        assert!(tier.access_record("cold").is_some());
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let clock = Arc::new(ManualClock::new());
        let tier = tier(10, Arc::clone(&clock));
        tier.set("short", &entry(json!(1), clock.as_ref(), 1))
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        tier.set("long", &entry(json!(2), clock.as_ref(), 3600))
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        clock.advance(Duration::from_secs(5));
        assert_eq!(tier.evict_expired().await.unwrap_or_default(), 1);
        assert_eq!(tier.len(), 1);
        assert!(tier.health_check().await);
    }

    #[tokio::test]
    async fn test_evict_to_capacity_within_bounds_is_noop() {
        let clock = Arc::new(ManualClock::new());
        let tier = tier(2, Arc::clone(&clock));
        for key in ["a", "b", "c"] {
            tier.set(key, &entry(json!(key), clock.as_ref(), 60))
                .await
                .unwrap_or_else(|e| panic!("{e}"));
        }
        assert_eq!(tier.evict_to_capacity(), 0);
        assert_eq!(tier.len(), 2);
        assert_eq!(tier.evictions(), 1);
    }
}
