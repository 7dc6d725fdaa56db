//! Redis Tier - Shared Remote Backing Layer
//!
//! Optional tier backed by Redis, shared by every process pointing at the same
//! server. Expiry is delegated to Redis (`SET EX`); entries still carry their
//! own `expires_at`, which is checked on read because Redis TTLs only have
//! second granularity.
//!
//! The tier never raises to callers of the layered cache: connection problems
//! and timeouts surface as [`TierError`] and the layer is skipped.

use crate::clock::{Clock, SystemClock};
use crate::codecs::JsonCodec;
use crate::entry::CacheEntry;
use crate::error::TierError;
use crate::traits::{CacheCodec, TierStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const TIER_NAME: &str = "redis";

/// Configuration for [`RedisTier`]
#[derive(Debug, Clone)]
pub struct RedisTierConfig {
    /// Redis connection string (e.g. `redis://127.0.0.1:6379`)
    pub url: String,
    /// Namespace prepended to every key
    pub key_prefix: String,
    /// Upper bound on connecting and on each command
    pub io_timeout: Duration,
}

impl RedisTierConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: crate::config::DEFAULT_REMOTE_KEY_PREFIX.to_string(),
            io_timeout: Duration::from_secs(3),
        }
    }

    #[must_use]
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }
}

fn namespaced_key(prefix: &str, key: &str) -> String {
    format!("{prefix}{key}")
}

/// Seconds to pass to `SET EX`, never zero
fn expire_secs(remaining: Duration) -> u64 {
    remaining.as_secs().max(1)
}

/// Redis-backed tier with `ConnectionManager` for automatic reconnection
pub struct RedisTier<C: CacheCodec = JsonCodec> {
    /// Redis connection manager - handles reconnection automatically
    conn_manager: ConnectionManager,
    config: RedisTierConfig,
    codec: C,
    clock: Arc<dyn Clock>,
}

impl RedisTier<JsonCodec> {
    /// Connect with the default JSON codec
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be created, the connection cannot
    /// be established within `io_timeout`, or PING fails.
    pub async fn connect(config: RedisTierConfig) -> Result<Self> {
        Self::with_codec(config, JsonCodec, Arc::new(SystemClock)).await
    }
}

impl<C: CacheCodec> RedisTier<C> {
    /// Connect with a custom codec and clock
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be created, the connection cannot
    /// be established within `io_timeout`, or PING fails.
    pub async fn with_codec(
        config: RedisTierConfig,
        codec: C,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        info!(redis_url = %config.url, "Initializing Redis Tier with ConnectionManager");

        let client = Client::open(config.url.as_str())
            .with_context(|| format!("Failed to create Redis client with URL: {}", config.url))?;

        let conn_manager = tokio::time::timeout(config.io_timeout, ConnectionManager::new(client))
            .await
            .context("Timed out connecting to Redis")?
            .context("Failed to establish Redis connection manager")?;

        // Test connection
        let mut conn = conn_manager.clone();
        let ping_cmd = redis::cmd("PING");
        let ping = ping_cmd.query_async(&mut conn);
        let _: String = tokio::time::timeout(config.io_timeout, ping)
            .await
            .context("Redis PING timed out")?
            .context("Redis PING health check failed")?;

        info!(
            redis_url = %config.url,
            prefix = %config.key_prefix,
            "Redis Tier connected successfully"
        );

        Ok(Self {
            conn_manager,
            config,
            codec,
            clock,
        })
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T, TierError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.io_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TierError::unavailable(TIER_NAME, format!("{op}: {e}"))),
            Err(_) => Err(TierError::Timeout {
                tier: TIER_NAME,
                after: self.config.io_timeout,
            }),
        }
    }

    /// Scan keys matching a pattern (glob-style: *, ?, [])
    ///
    /// Uses Redis SCAN command (non-blocking, cursor-based iteration).
    /// The pattern is matched against full (prefixed) key names.
    ///
    /// # Errors
    ///
    /// Returns an error if a Redis command fails or times out.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, TierError> {
        let mut conn = self.conn_manager.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            // SCAN cursor MATCH pattern COUNT 100
            let (next, batch): (u64, Vec<String>) = self
                .bounded(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn),
                )
                .await?;

            cursor = next;
            keys.extend(batch);

            // Cursor 0 means iteration is complete
            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %pattern, count = keys.len(), "[Redis] Scanned keys matching pattern");
        Ok(keys)
    }

    /// Remove multiple (already prefixed) keys at once
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis command fails or times out.
    pub async fn remove_bulk(&self, keys: &[String]) -> Result<usize, TierError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn_manager.clone();
        let count: usize = self.bounded("DEL", conn.del(keys)).await?;
        debug!(count = count, "[Redis] Removed keys in bulk");
        Ok(count)
    }
}

#[async_trait]
impl<C: CacheCodec + 'static> TierStore for RedisTier<C> {
    fn name(&self) -> &'static str {
        TIER_NAME
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
        let redis_key = namespaced_key(&self.config.key_prefix, key);
        let mut conn = self.conn_manager.clone();

        let raw: Option<Vec<u8>> = self.bounded("GET", conn.get(&redis_key)).await?;
        let Some(bytes) = raw.filter(|bytes| !bytes.is_empty()) else {
            return Ok(None);
        };

        match self.codec.deserialize::<CacheEntry>(&bytes) {
            Ok(entry) if entry.is_current_version() && !entry.is_expired(self.clock.now()) => {
                Ok(Some(entry))
            }
            decoded => {
                debug!(
                    key = %key,
                    undecodable = decoded.is_err(),
                    "[Redis] Discarding stale entry"
                );
                if let Err(e) = self.bounded::<(), _>("DEL", conn.del(&redis_key)).await {
                    warn!(key = %key, error = %e, "[Redis] Failed to delete stale entry");
                }
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<(), TierError> {
        let Some(remaining) = entry.remaining_ttl(self.clock.now()) else {
            // Already expired, nothing worth sharing
            return Ok(());
        };
        let bytes = self
            .codec
            .serialize(entry)
            .map_err(|e| TierError::unavailable(TIER_NAME, format!("encode: {e}")))?;

        let redis_key = namespaced_key(&self.config.key_prefix, key);
        let mut conn = self.conn_manager.clone();
        let ttl_secs = expire_secs(remaining);
        let _: () = self.bounded("SET EX", conn.set_ex(&redis_key, bytes, ttl_secs)).await?;
        debug!(key = %key, ttl_secs = ttl_secs, "[Redis] Cached key with TTL");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), TierError> {
        let redis_key = namespaced_key(&self.config.key_prefix, key);
        let mut conn = self.conn_manager.clone();
        let _: () = self.bounded("DEL", conn.del(&redis_key)).await?;
        Ok(())
    }

    async fn evict_expired(&self) -> Result<usize, TierError> {
        // Redis expires keys itself
        Ok(0)
    }

    async fn clear(&self) -> Result<(), TierError> {
        let keys = self.scan_keys(&format!("{}*", self.config.key_prefix)).await?;
        let removed = self.remove_bulk(&keys).await?;
        info!(removed, prefix = %self.config.key_prefix, "[Redis] Cleared namespace");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.conn_manager.clone();
        self.bounded::<String, _>("PING", redis::cmd("PING").query_async(&mut conn))
            .await
            .is_ok()
    }
}
