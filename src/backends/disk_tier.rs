//! Disk Tier - One File Per Key
//!
//! Persistent tier surviving process restarts. Every key maps to
//! `<dir>/<key>.cache` holding a codec-encoded [`CacheEntry`] envelope.
//!
//! Reads that hit a file which cannot be decoded, carries another format
//! version, or has expired delete the file and report a miss. Writes go to a
//! temporary file first and are renamed into place, so readers never see a
//! half-written entry. Every filesystem call is bounded by `io_timeout`.

use crate::clock::{Clock, SystemClock};
use crate::codecs::JsonCodec;
use crate::entry::CacheEntry;
use crate::error::TierError;
use crate::traits::{CacheCodec, TierStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

const TIER_NAME: &str = "disk";

/// Suffix of every entry file
pub const CACHE_FILE_SUFFIX: &str = ".cache";

const TEMP_MARKER: &str = ".tmp.";

/// Longest key used verbatim as a file name
const MAX_PLAIN_KEY_LEN: usize = 128;

/// Configuration for [`DiskTier`]
#[derive(Debug, Clone)]
pub struct DiskTierConfig {
    /// Directory holding the entry files (created if missing)
    pub dir: PathBuf,
    /// Upper bound on a single filesystem operation
    pub io_timeout: Duration,
}

impl DiskTierConfig {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            io_timeout: Duration::from_secs(3),
        }
    }

    #[must_use]
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }
}

/// Why a stored file was thrown away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stale {
    Undecodable,
    VersionMismatch,
    Expired,
}

/// File-per-key disk tier
///
/// Generic over the [`CacheCodec`] used for the envelope; JSON by default.
#[derive(Debug)]
pub struct DiskTier<C: CacheCodec = JsonCodec> {
    dir: PathBuf,
    io_timeout: Duration,
    codec: C,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
    discarded: AtomicU64,
}

impl DiskTier<JsonCodec> {
    /// Create a JSON-encoded disk tier, creating the directory if needed
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created.
    pub async fn new(config: DiskTierConfig) -> Result<Self> {
        Self::with_codec(config, JsonCodec, Arc::new(SystemClock)).await
    }
}

impl<C: CacheCodec> DiskTier<C> {
    /// Create a disk tier with a custom codec and clock
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created.
    pub async fn with_codec(
        config: DiskTierConfig,
        codec: C,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.dir).await.with_context(|| {
            format!("Failed to create disk cache directory {}", config.dir.display())
        })?;

        info!(
            dir = %config.dir.display(),
            codec = codec.name(),
            io_timeout_ms = config.io_timeout.as_millis(),
            "Disk Tier initialized"
        );

        Ok(Self {
            dir: config.dir,
            io_timeout: config.io_timeout,
            codec,
            clock,
            writes: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `key`
    ///
    /// Keys made only of ASCII letters, digits, `_` and `-` are used verbatim;
    /// anything else (separators, dots, very long keys) is replaced by its
    /// SHA-256 so a key can never escape the cache directory.
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        let plain = !key.is_empty()
            && key.len() <= MAX_PLAIN_KEY_LEN
            && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');

        let stem = if plain {
            key.to_string()
        } else {
            let mut hasher = Sha256::new();
            hasher.update(key.as_bytes());
            format!("{:x}", hasher.finalize())
        };
        self.dir.join(format!("{stem}{CACHE_FILE_SUFFIX}"))
    }

    /// Successful writes since creation
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Files discarded as undecodable, stale or expired since creation
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Number of entry files currently on disk
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub async fn entry_count(&self) -> Result<usize, TierError> {
        Ok(self.list_entry_files().await?.len())
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T, TierError>
    where
        F: Future<Output = io::Result<T>>,
    {
        match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TierError::unavailable(TIER_NAME, format!("{op}: {e}"))),
            Err(_) => Err(TierError::Timeout {
                tier: TIER_NAME,
                after: self.io_timeout,
            }),
        }
    }

    fn check(&self, bytes: &[u8]) -> Result<CacheEntry, Stale> {
        let entry: CacheEntry = self.codec.deserialize(bytes).map_err(|_| Stale::Undecodable)?;
        if !entry.is_current_version() {
            return Err(Stale::VersionMismatch);
        }
        if entry.is_expired(self.clock.now()) {
            return Err(Stale::Expired);
        }
        Ok(entry)
    }

    async fn discard(&self, path: &Path, reason: Stale) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        match fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), ?reason, "[Disk] Discarded cache file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %path.display(),
                error = %e,
                "[Disk] Failed to remove stale cache file"
            ),
        }
    }

    async fn list_entry_files(&self) -> Result<Vec<PathBuf>, TierError> {
        self.bounded("list cache directory", async {
            let mut read_dir = fs::read_dir(&self.dir).await?;
            let mut files = Vec::new();
            while let Some(dir_entry) = read_dir.next_entry().await? {
                let path = dir_entry.path();
                let is_entry = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| {
                        name.ends_with(CACHE_FILE_SUFFIX) && !name.contains(TEMP_MARKER)
                    });
                if is_entry {
                    files.push(path);
                }
            }
            Ok(files)
        })
        .await
    }

    /// Remove temp files left behind by writes abandoned at `io_timeout`
    ///
    /// Only files older than twice the timeout are removed, so a write still
    /// in flight keeps its temp file. Returns the number of files removed.
    async fn sweep_abandoned_temp_files(&self) -> usize {
        let max_age = self.io_timeout.saturating_mul(2);
        let listed = self
            .bounded("list temp files", async {
                let mut read_dir = fs::read_dir(&self.dir).await?;
                let mut abandoned = Vec::new();
                while let Some(dir_entry) = read_dir.next_entry().await? {
                    let is_temp = dir_entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| name.contains(TEMP_MARKER));
                    if !is_temp {
                        continue;
                    }
                    // Renamed or removed since listing
                    let Ok(modified) = dir_entry.metadata().await.and_then(|m| m.modified()) else {
                        continue;
                    };
                    if modified.elapsed().unwrap_or_default() > max_age {
                        abandoned.push(dir_entry.path());
                    }
                }
                Ok(abandoned)
            })
            .await;

        let abandoned = match listed {
            Ok(paths) => paths,
            Err(e) => {
                debug!(error = %e, "[Disk] Skipping temp file sweep");
                return 0;
            }
        };

        let mut removed = 0;
        for path in abandoned {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "[Disk] Failed to remove temp file");
                }
            }
        }
        if removed > 0 {
            debug!(count = removed, "[Disk] Removed abandoned temp files");
        }
        removed
    }

    async fn write_atomically(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("entry");
        let temp_path = self
            .dir
            .join(format!(".{file_name}{TEMP_MARKER}{}", uuid::Uuid::new_v4()));

        if let Err(e) = fs::write(&temp_path, bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl<C: CacheCodec + 'static> TierStore for DiskTier<C> {
    fn name(&self) -> &'static str {
        TIER_NAME
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
        let path = self.path_for(key);
        let bytes = match tokio::time::timeout(self.io_timeout, fs::read(&path)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Ok(Err(e)) => return Err(TierError::unavailable(TIER_NAME, format!("read: {e}"))),
            Err(_) => {
                return Err(TierError::Timeout {
                    tier: TIER_NAME,
                    after: self.io_timeout,
                });
            }
        };

        match self.check(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(reason) => {
                self.discard(&path, reason).await;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<(), TierError> {
        let bytes = self
            .codec
            .serialize(entry)
            .map_err(|e| TierError::unavailable(TIER_NAME, format!("encode: {e}")))?;
        let path = self.path_for(key);

        let result = self
            .bounded("write", async {
                match self.write_atomically(&path, &bytes).await {
                    // Directory removed under us (tmp cleaners): recreate once
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        fs::create_dir_all(&self.dir).await?;
                        self.write_atomically(&path, &bytes).await
                    }
                    other => other,
                }
            })
            .await;

        match &result {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, path = %path.display(), "[Disk] Cached entry");
            }
            Err(e) => warn!(key = %key, error = %e, "[Disk] Cache write failed"),
        }
        result
    }

    async fn remove(&self, key: &str) -> Result<(), TierError> {
        let path = self.path_for(key);
        self.bounded("remove", async {
            match fs::remove_file(&path).await {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        })
        .await
    }

    async fn evict_expired(&self) -> Result<usize, TierError> {
        let mut removed = 0;
        for path in self.list_entry_files().await? {
            let bytes = match self.bounded("read", fs::read(&path)).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Vanished or unreadable file: skip, the next sweep retries
                    debug!(path = %path.display(), error = %e, "[Disk] Skipping file during sweep");
                    continue;
                }
            };
            if let Err(reason) = self.check(&bytes) {
                self.discard(&path, reason).await;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(count = removed, "[Disk] Cleaned up expired entries");
        }
        self.sweep_abandoned_temp_files().await;
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), TierError> {
        for path in self.list_entry_files().await? {
            self.bounded("remove", async {
                match fs::remove_file(&path).await {
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    other => other,
                }
            })
            .await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let test_key = "health_check_disk";
        let test_entry = CacheEntry::new(
            serde_json::json!({"test": true}),
            self.clock.now(),
            Duration::from_secs(60),
        );

        match self.set(test_key, &test_entry).await {
            Ok(()) => match self.get(test_key).await {
                Ok(Some(retrieved)) => {
                    let _ = self.remove(test_key).await;
                    retrieved.value == test_entry.value
                }
                _ => false,
            },
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use tempfile::TempDir;

    async fn tier(dir: &Path, clock: Arc<ManualClock>) -> DiskTier {
        DiskTier::with_codec(DiskTierConfig::new(dir), JsonCodec, clock)
            .await
            .unwrap_or_else(|e| panic!("disk tier: {e}"))
    }

    fn entry(clock: &ManualClock, ttl_secs: u64) -> CacheEntry {
        CacheEntry::new(json!({"modules": ["CRM"]}), clock.now(), Duration::from_secs(ttl_secs))
    }

    #[tokio::test]
    async fn test_round_trip_writes_one_file() {
        let dir = TempDir::new().unwrap_or_else(|e| panic!("{e}"));
        let clock = Arc::new(ManualClock::new());
        let tier = tier(dir.path(), Arc::clone(&clock)).await;
        let e = entry(&clock, 3600);

        tier.set("req1", &e).await.unwrap_or_else(|e| panic!("{e}"));
        assert!(dir.path().join("req1.cache").exists());
        assert_eq!(tier.get("req1").await.unwrap_or_default(), Some(e));
        assert_eq!(tier.entry_count().await.unwrap_or_default(), 1);
        assert_eq!(tier.writes(), 1);
    }

    #[tokio::test]
    async fn test_survives_new_instance() {
        let dir = TempDir::new().unwrap_or_else(|e| panic!("{e}"));
        let clock = Arc::new(ManualClock::new());
        let e = entry(&clock, 3600);
        tier(dir.path(), Arc::clone(&clock))
            .await
            .set("persisted", &e)
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        let reopened = tier(dir.path(), Arc::clone(&clock)).await;
        assert_eq!(reopened.get("persisted").await.unwrap_or_default(), Some(e));
    }

    #[tokio::test]
    async fn test_expired_file_is_deleted_on_read() {
        let dir = TempDir::new().unwrap_or_else(|e| panic!("{e}"));
        let clock = Arc::new(ManualClock::new());
        let tier = tier(dir.path(), Arc::clone(&clock)).await;
        tier.set("k", &entry(&clock, 1)).await.unwrap_or_else(|e| panic!("{e}"));

        clock.advance(Duration::from_secs(2));
        assert_eq!(tier.get("k").await.unwrap_or_default(), None);
        assert!(!tier.path_for("k").exists());
        assert_eq!(tier.discarded(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_miss() {
        let dir = TempDir::new().unwrap_or_else(|e| panic!("{e}"));
        let clock = Arc::new(ManualClock::new());
        let tier = tier(dir.path(), clock).await;
        std::fs::write(tier.path_for("broken"), b"\x00\x01 definitely not json")
            .unwrap_or_else(|e| panic!("{e}"));

        assert_eq!(tier.get("broken").await.unwrap_or_default(), None);
        assert!(!tier.path_for("broken").exists());
    }

    #[tokio::test]
    async fn test_version_mismatch_is_a_miss() {
        let dir = TempDir::new().unwrap_or_else(|e| panic!("{e}"));
        let clock = Arc::new(ManualClock::new());
        let tier = tier(dir.path(), Arc::clone(&clock)).await;
        let mut old = entry(&clock, 3600);
        old.version = "0.9".to_string();
        std::fs::write(
            tier.path_for("old"),
            serde_json::to_vec(&old).unwrap_or_default(),
        )
        .unwrap_or_else(|e| panic!("{e}"));

        assert_eq!(tier.get("old").await.unwrap_or_default(), None);
        assert!(!tier.path_for("old").exists());
    }

    #[tokio::test]
    async fn test_unsafe_keys_stay_inside_directory() {
        let dir = TempDir::new().unwrap_or_else(|e| panic!("{e}"));
        let clock = Arc::new(ManualClock::new());
        let tier = tier(dir.path(), Arc::clone(&clock)).await;

        for key in ["../escape", "a/b", "user:1", ""] {
            let path = tier.path_for(key);
            assert_eq!(path.parent(), Some(dir.path()), "{key:?} escaped");
            tier.set(key, &entry(&clock, 60)).await.unwrap_or_else(|e| panic!("{e}"));
            assert!(tier.get(key).await.unwrap_or_default().is_some());
        }
        let escaped = dir.path().parent().map(|p| p.join("escape.cache"));
        assert!(!escaped.is_some_and(|p| p.exists()));
    }

    #[tokio::test]
    async fn test_evict_expired_sweeps_directory() {
        let dir = TempDir::new().unwrap_or_else(|e| panic!("{e}"));
        let clock = Arc::new(ManualClock::new());
        let tier = tier(dir.path(), Arc::clone(&clock)).await;
        tier.set("short", &entry(&clock, 1)).await.unwrap_or_else(|e| panic!("{e}"));
        tier.set("long", &entry(&clock, 3600)).await.unwrap_or_else(|e| panic!("{e}"));
        std::fs::write(dir.path().join("junk.cache"), b"junk").unwrap_or_else(|e| panic!("{e}"));

        clock.advance(Duration::from_secs(10));
        assert_eq!(tier.evict_expired().await.unwrap_or_default(), 2);
        assert_eq!(tier.entry_count().await.unwrap_or_default(), 1);
    }

    #[tokio::test]
    async fn test_evict_expired_removes_abandoned_temp_files() {
        let dir = TempDir::new().unwrap_or_else(|e| panic!("{e}"));
        let clock = Arc::new(ManualClock::new());
        let config = DiskTierConfig::new(dir.path()).io_timeout(Duration::from_millis(10));
        let tier = DiskTier::with_codec(config, JsonCodec, clock.clone())
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        tier.set("kept", &entry(&clock, 3600)).await.unwrap_or_else(|e| panic!("{e}"));
        let orphan = dir.path().join(".kept.cache.tmp.5f0c1e2a");
        std::fs::write(&orphan, b"partial").unwrap_or_else(|e| panic!("{e}"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tier.evict_expired().await.unwrap_or_default(), 0);

        assert!(!orphan.exists());
        assert!(tier.path_for("kept").exists());
    }

    #[tokio::test]
    async fn test_recent_temp_file_survives_sweep() {
        let dir = TempDir::new().unwrap_or_else(|e| panic!("{e}"));
        let clock = Arc::new(ManualClock::new());
        let tier = tier(dir.path(), Arc::clone(&clock)).await;
        let in_flight = dir.path().join(".k.cache.tmp.9b1d");
        std::fs::write(&in_flight, b"partial").unwrap_or_else(|e| panic!("{e}"));

        tier.evict_expired().await.unwrap_or_else(|e| panic!("{e}"));
        assert!(in_flight.exists());
    }

    #[tokio::test]
    async fn test_recreates_deleted_directory() {
        let dir = TempDir::new().unwrap_or_else(|e| panic!("{e}"));
        let cache_dir = dir.path().join("cache");
        let clock = Arc::new(ManualClock::new());
        let tier = tier(&cache_dir, Arc::clone(&clock)).await;

        std::fs::remove_dir_all(&cache_dir).unwrap_or_else(|e| panic!("{e}"));
        tier.set("k", &entry(&clock, 60)).await.unwrap_or_else(|e| panic!("{e}"));
        assert!(tier.get("k").await.unwrap_or_default().is_some());
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let dir = TempDir::new().unwrap_or_else(|e| panic!("{e}"));
        let cache_dir = dir.path().join("cache");
        let clock = Arc::new(ManualClock::new());
        let tier = tier(&cache_dir, Arc::clone(&clock)).await;

        // Replace the directory with a plain file: every write must fail
        std::fs::remove_dir_all(&cache_dir).unwrap_or_else(|e| panic!("{e}"));
        std::fs::write(&cache_dir, b"not a directory").unwrap_or_else(|e| panic!("{e}"));

        let result = tier.set("k", &entry(&clock, 60)).await;
        assert!(matches!(result, Err(TierError::Unavailable { tier: "disk", .. })));
        assert!(!tier.health_check().await);
    }

    #[tokio::test]
    async fn test_clear_and_health_check() {
        let dir = TempDir::new().unwrap_or_else(|e| panic!("{e}"));
        let clock = Arc::new(ManualClock::new());
        let tier = tier(dir.path(), Arc::clone(&clock)).await;
        tier.set("a", &entry(&clock, 60)).await.unwrap_or_else(|e| panic!("{e}"));
        tier.set("b", &entry(&clock, 60)).await.unwrap_or_else(|e| panic!("{e}"));

        assert!(tier.health_check().await);
        tier.clear().await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(tier.entry_count().await.unwrap_or_default(), 0);
    }
}
