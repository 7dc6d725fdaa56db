//! Cache configuration
//!
//! [`CacheConfig`] gathers every tunable of the cache system. Defaults match
//! production behaviour; [`CacheConfig::from_env`] applies `RECCACHE_*`
//! overrides (and `REDIS_URL` for the remote tier), and the struct can also be
//! deserialized from JSON with durations given in seconds.
//!
//! # Example
//!
//! ```rust
//! use recommender_cache::CacheConfig;
//! use std::time::Duration;
//!
//! let config = CacheConfig::default()
//!     .memory_capacity(500)
//!     .failure_threshold(3)
//!     .circuit_reset_timeout(Duration::from_secs(30));
//! assert!(config.validate().is_ok());
//! ```

use crate::entry::MAX_ENTRY_TTL;
use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Name of the cache folder created under the system temp directory
pub const DEFAULT_DISK_DIR_NAME: &str = "recommender_cache";

/// Default key namespace for the remote tier
pub const DEFAULT_REMOTE_KEY_PREFIX: &str = "reccache:";

/// Configuration for the whole cache system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries held by the memory tier
    pub memory_capacity: usize,
    /// Whether the disk tier is part of the hierarchy
    pub disk_enabled: bool,
    /// Directory holding one file per cached key
    pub disk_dir: PathBuf,
    /// TTL applied to computed values and warmed entries
    #[serde(with = "secs")]
    pub disk_ttl_default: Duration,
    /// Redis URL of the optional remote tier
    pub remote_url: Option<String>,
    /// Namespace prepended to every remote key
    pub remote_key_prefix: String,
    /// Upper bound on a single disk or remote operation
    #[serde(with = "secs")]
    pub io_timeout: Duration,
    /// Period of the background maintenance task
    #[serde(with = "secs")]
    pub maintenance_interval: Duration,
    /// Accesses after which a key counts as frequently accessed
    pub access_threshold_for_warming: u64,
    /// Access records untouched for longer than this are dropped
    #[serde(with = "secs")]
    pub access_retention: Duration,
    /// Warm hot entries whose remaining TTL falls below this window.
    /// `None` uses the maintenance interval.
    #[serde(with = "secs::option")]
    pub warm_ahead: Option<Duration>,
    /// Whether upstream calls are gated by the circuit breaker
    pub circuit_breaker_enabled: bool,
    /// Failures within the reset window that open the breaker
    pub failure_threshold: u32,
    /// Cool-down before an open breaker admits a probe
    #[serde(with = "secs")]
    pub circuit_reset_timeout: Duration,
    /// Share of requests admitted while half-open
    pub half_open_probe_rate: f64,
    /// Timeout applied to the wrapped upstream call
    #[serde(with = "secs::option")]
    pub upstream_timeout: Option<Duration>,
    /// Coalesce concurrent misses on the same key into one upstream call
    pub dedupe_in_flight: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 1000,
            disk_enabled: true,
            disk_dir: std::env::temp_dir().join(DEFAULT_DISK_DIR_NAME),
            disk_ttl_default: Duration::from_secs(3600),
            remote_url: None,
            remote_key_prefix: DEFAULT_REMOTE_KEY_PREFIX.to_string(),
            io_timeout: Duration::from_secs(3),
            maintenance_interval: Duration::from_secs(3600),
            access_threshold_for_warming: 5,
            access_retention: Duration::from_secs(24 * 3600),
            warm_ahead: None,
            circuit_breaker_enabled: true,
            failure_threshold: 5,
            circuit_reset_timeout: Duration::from_secs(60),
            half_open_probe_rate: 0.1,
            upstream_timeout: None,
            dedupe_in_flight: true,
        }
    }
}

impl CacheConfig {
    /// Defaults overridden by environment variables
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `REDIS_URL` | `remote_url` |
    /// | `RECCACHE_MEMORY_CAPACITY` | `memory_capacity` |
    /// | `RECCACHE_DISK_ENABLED` | `disk_enabled` |
    /// | `RECCACHE_DISK_DIR` | `disk_dir` |
    /// | `RECCACHE_DISK_TTL_SECS` | `disk_ttl_default` |
    /// | `RECCACHE_MAINTENANCE_INTERVAL_SECS` | `maintenance_interval` |
    /// | `RECCACHE_ACCESS_THRESHOLD` | `access_threshold_for_warming` |
    /// | `RECCACHE_FAILURE_THRESHOLD` | `failure_threshold` |
    /// | `RECCACHE_CIRCUIT_RESET_SECS` | `circuit_reset_timeout` |
    /// | `RECCACHE_HALF_OPEN_PROBE_RATE` | `half_open_probe_rate` |
    /// | `RECCACHE_UPSTREAM_TIMEOUT_SECS` | `upstream_timeout` |
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] when a variable cannot be parsed or the
    /// resulting configuration is invalid.
    pub fn from_env() -> CacheResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] when a value cannot be parsed or the
    /// resulting configuration is invalid.
    pub fn from_lookup<F>(lookup: F) -> CacheResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("REDIS_URL").filter(|url| !url.trim().is_empty()) {
            config.remote_url = Some(url);
        }
        if let Some(v) = parse_var::<usize>(&lookup, "RECCACHE_MEMORY_CAPACITY")? {
            config.memory_capacity = v;
        }
        if let Some(v) = parse_var::<bool>(&lookup, "RECCACHE_DISK_ENABLED")? {
            config.disk_enabled = v;
        }
        if let Some(dir) = lookup("RECCACHE_DISK_DIR") {
            config.disk_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_var::<f64>(&lookup, "RECCACHE_DISK_TTL_SECS")? {
            config.disk_ttl_default = secs_to_duration("RECCACHE_DISK_TTL_SECS", v)?;
        }
        if let Some(v) = parse_var::<f64>(&lookup, "RECCACHE_MAINTENANCE_INTERVAL_SECS")? {
            config.maintenance_interval =
                secs_to_duration("RECCACHE_MAINTENANCE_INTERVAL_SECS", v)?;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "RECCACHE_ACCESS_THRESHOLD")? {
            config.access_threshold_for_warming = v;
        }
        if let Some(v) = parse_var::<u32>(&lookup, "RECCACHE_FAILURE_THRESHOLD")? {
            config.failure_threshold = v;
        }
        if let Some(v) = parse_var::<f64>(&lookup, "RECCACHE_CIRCUIT_RESET_SECS")? {
            config.circuit_reset_timeout = secs_to_duration("RECCACHE_CIRCUIT_RESET_SECS", v)?;
        }
        if let Some(v) = parse_var::<f64>(&lookup, "RECCACHE_HALF_OPEN_PROBE_RATE")? {
            config.half_open_probe_rate = v;
        }
        if let Some(v) = parse_var::<f64>(&lookup, "RECCACHE_UPSTREAM_TIMEOUT_SECS")? {
            config.upstream_timeout = Some(secs_to_duration("RECCACHE_UPSTREAM_TIMEOUT_SECS", v)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] describing the first invalid field.
    pub fn validate(&self) -> CacheResult<()> {
        if self.memory_capacity == 0 {
            return Err(CacheError::Config("memory_capacity must be at least 1".into()));
        }
        if self.disk_ttl_default.is_zero() {
            return Err(CacheError::Config("disk_ttl_default must be positive".into()));
        }
        if self.maintenance_interval.is_zero() {
            return Err(CacheError::Config("maintenance_interval must be positive".into()));
        }
        for (name, value) in [
            ("disk_ttl_default", self.disk_ttl_default),
            ("maintenance_interval", self.maintenance_interval),
            ("access_retention", self.access_retention),
        ] {
            if value > MAX_ENTRY_TTL {
                return Err(CacheError::Config(format!(
                    "{name} must not exceed {} seconds",
                    MAX_ENTRY_TTL.as_secs()
                )));
            }
        }
        if self.io_timeout.is_zero() {
            return Err(CacheError::Config("io_timeout must be positive".into()));
        }
        if self.access_threshold_for_warming == 0 {
            return Err(CacheError::Config(
                "access_threshold_for_warming must be at least 1".into(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(CacheError::Config("failure_threshold must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.half_open_probe_rate) {
            return Err(CacheError::Config(format!(
                "half_open_probe_rate must be within [0, 1], got {}",
                self.half_open_probe_rate
            )));
        }
        Ok(())
    }

    /// Window used by the warming pass
    #[must_use]
    pub fn effective_warm_ahead(&self) -> Duration {
        self.warm_ahead.unwrap_or(self.maintenance_interval)
    }

    // ===== Builder-style setters =====

    #[must_use]
    pub fn memory_capacity(mut self, capacity: usize) -> Self {
        self.memory_capacity = capacity;
        self
    }

    #[must_use]
    pub fn disk_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.disk_dir = dir.into();
        self.disk_enabled = true;
        self
    }

    #[must_use]
    pub fn without_disk(mut self) -> Self {
        self.disk_enabled = false;
        self
    }

    #[must_use]
    pub fn disk_ttl_default(mut self, ttl: Duration) -> Self {
        self.disk_ttl_default = ttl;
        self
    }

    #[must_use]
    pub fn remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    #[must_use]
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    #[must_use]
    pub fn access_threshold_for_warming(mut self, threshold: u64) -> Self {
        self.access_threshold_for_warming = threshold;
        self
    }

    #[must_use]
    pub fn warm_ahead(mut self, window: Duration) -> Self {
        self.warm_ahead = Some(window);
        self
    }

    #[must_use]
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    #[must_use]
    pub fn circuit_reset_timeout(mut self, timeout: Duration) -> Self {
        self.circuit_reset_timeout = timeout;
        self
    }

    #[must_use]
    pub fn half_open_probe_rate(mut self, rate: f64) -> Self {
        self.half_open_probe_rate = rate;
        self
    }

    #[must_use]
    pub fn without_circuit_breaker(mut self) -> Self {
        self.circuit_breaker_enabled = false;
        self
    }

    #[must_use]
    pub fn upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn dedupe_in_flight(mut self, enabled: bool) -> Self {
        self.dedupe_in_flight = enabled;
        self
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> CacheResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CacheError::Config(format!("{name}={raw:?}: {e}"))),
    }
}

fn secs_to_duration(name: &str, secs: f64) -> CacheResult<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|e| CacheError::Config(format!("{name}: {e}")))
}

/// Serde helpers encoding `Duration` as (fractional) seconds
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&d.as_secs_f64()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<f64>::deserialize(deserializer)?
                .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
