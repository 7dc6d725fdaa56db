//! Cache entry envelope shared by all tiers

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Format tag written with every persisted entry
///
/// Entries read back with a different tag are discarded as stale.
pub const ENTRY_FORMAT_VERSION: &str = "1.0";

/// Shortest TTL an entry can carry, keeps `expires_at > created_at`
const MIN_TTL: Duration = Duration::from_millis(1);

/// Longest TTL an entry can carry (100 years); longer requests are capped
pub const MAX_ENTRY_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Cached value with its lifetime metadata
///
/// Entries are immutable: refreshing a key replaces the whole entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
    pub version: String,
}

impl CacheEntry {
    /// Build an entry created at `now` that lives for `ttl`
    ///
    /// `ttl` is clamped to `[1ms, MAX_ENTRY_TTL]`.
    #[must_use]
    pub fn new(value: serde_json::Value, now: SystemTime, ttl: Duration) -> Self {
        let expires_at = now
            .checked_add(ttl.clamp(MIN_TTL, MAX_ENTRY_TTL))
            .or_else(|| now.checked_add(MIN_TTL))
            .unwrap_or(now);
        Self {
            value,
            created_at: now,
            expires_at,
            version: ENTRY_FORMAT_VERSION.to_string(),
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, `None` once expired
    #[must_use]
    pub fn remaining_ttl(&self, now: SystemTime) -> Option<Duration> {
        match self.expires_at.duration_since(now) {
            Ok(left) if !left.is_zero() => Some(left),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_current_version(&self) -> bool {
        self.version == ENTRY_FORMAT_VERSION
    }
}
