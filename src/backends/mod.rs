//! Tier Implementations
//!
//! Storage tiers for the layered cache, ordered fastest first.
//!
//! # Available Tiers
//!
//! - **Memory** - bounded in-process LRU table with access tracking (always present)
//! - **Disk** - one file per key under a cache directory, survives restarts
//! - **Redis** - optional shared remote tier (feature: `redis`, on by default)
//!
//! # Usage
//!
//! ```rust,no_run
//! use recommender_cache::backends::{DiskTier, DiskTierConfig, MemoryTier, MemoryTierConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let memory = MemoryTier::new(MemoryTierConfig::default());
//! let disk = DiskTier::new(DiskTierConfig::new("/tmp/recommender_cache")).await?;
//! # Ok(())
//! # }
//! ```

pub mod disk_tier;
pub mod memory_tier;

#[cfg(feature = "redis")]
pub mod redis_tier;

pub use disk_tier::{CACHE_FILE_SUFFIX, DiskTier, DiskTierConfig};
pub use memory_tier::{AccessRecord, MemoryTier, MemoryTierConfig};

#[cfg(feature = "redis")]
pub use redis_tier::{RedisTier, RedisTierConfig};
