//! Tier and codec traits
//!
//! This module defines the abstractions that let the layered cache treat its
//! storage tiers uniformly and lets persistent tiers choose a serialization
//! format.
//!
//! # Architecture
//!
//! - `CacheCodec`: pluggable serialization for tiers that store bytes
//! - `TierStore`: contract implemented by every tier (memory, disk, Redis, ...)
//!
//! # Example: Custom Tier
//!
//! ```rust,ignore
//! use recommender_cache::{async_trait, CacheEntry, TierError, TierStore};
//!
//! struct MyTier {
//!     // Your implementation
//! }
//!
//! #[async_trait]
//! impl TierStore for MyTier {
//!     fn name(&self) -> &'static str {
//!         "my-tier"
//!     }
//!
//!     async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
//!         // Your implementation
//!     }
//!
//!     async fn set(&self, key: &str, entry: &CacheEntry) -> Result<(), TierError> {
//!         // Your implementation
//!     }
//!
//!     // ... remove, evict_expired, clear, health_check
//! }
//! ```

use crate::entry::CacheEntry;
use crate::error::TierError;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// Trait for cache value serialization/deserialization
///
/// Persistent tiers (disk, Redis) encode [`CacheEntry`] envelopes through a
/// codec. The codec must round-trip `serde_json::Value`, so only
/// self-describing formats qualify.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync + Debug` to support concurrent access across async tasks
/// and provide debugging capabilities.
pub trait CacheCodec: Send + Sync + Debug {
    /// Serialize a value to bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented in this format.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize bytes to a value
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoding of `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Get the name of the codec
    ///
    /// This is used for logging and debugging purposes.
    fn name(&self) -> &'static str;
}

/// Storage tier of the layered cache
///
/// Each tier owns its storage exclusively and applies its own eviction policy.
/// Errors are reported as [`TierError`]; the layered cache decides how to
/// degrade, so implementations should not retry internally.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to support concurrent access across async tasks.
///
/// # Performance Considerations
///
/// Operations that may block on I/O (disk, network) should be bounded by a
/// timeout and report [`TierError::Timeout`] rather than stall the caller.
#[async_trait]
pub trait TierStore: Send + Sync {
    /// Name used in logs, stats and error reports
    fn name(&self) -> &'static str;

    /// Get an unexpired entry
    ///
    /// # Returns
    ///
    /// * `Ok(Some(entry))` - Entry present and not expired
    /// * `Ok(None)` - Key absent, expired, or stale (stale data is discarded)
    /// * `Err(e)` - Tier could not be queried
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TierError>;

    /// Store an entry, replacing any previous one for the key
    ///
    /// The entry carries its own `expires_at`, so promotion keeps the original
    /// deadline instead of extending it.
    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<(), TierError>;

    /// Delete a key (absent keys are not an error)
    async fn remove(&self, key: &str) -> Result<(), TierError>;

    /// Drop every expired entry, returning how many were removed
    ///
    /// Tiers with native expiry (Redis) return `Ok(0)`.
    async fn evict_expired(&self) -> Result<usize, TierError>;

    /// Drop every entry owned by this tier
    async fn clear(&self) -> Result<(), TierError>;

    /// Check if the tier is operational
    ///
    /// This method should verify that the tier is usable, e.g. with a
    /// write/read/remove round-trip or a ping.
    async fn health_check(&self) -> bool;
}
