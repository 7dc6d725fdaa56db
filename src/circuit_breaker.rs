//! Circuit breaker shielding the upstream recommendation call
//!
//! Three states:
//!
//! - **Closed**: every request goes through.
//! - **Open**: the upstream is presumed unhealthy; requests are refused until
//!   `reset_timeout` has passed since the last failure.
//! - **HalfOpen**: a fixed share of requests (`half_open_probe_rate`) is let
//!   through to probe for recovery. One success closes the breaker.
//!
//! Transitions out of `Open` are lazy: they happen when a request is
//! attempted, not on a timer. All state lives behind one mutex so a caller
//! never observes a failure count that disagrees with the state.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default number of failures that opens the breaker
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default cool-down (1 minute)
pub const DEFAULT_RESET_TIMEOUT_SECS: u64 = 60;

/// Default share of requests admitted while half-open
pub const DEFAULT_HALF_OPEN_PROBE_RATE: f64 = 0.1;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        f.write_str(name)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures (within `reset_timeout` of each other) that open the breaker
    pub failure_threshold: u32,
    /// Time after the last failure before a probe is admitted
    pub reset_timeout: Duration,
    /// Probability in `[0, 1]` that a half-open request is admitted
    pub half_open_probe_rate: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: Duration::from_secs(DEFAULT_RESET_TIMEOUT_SECS),
            half_open_probe_rate: DEFAULT_HALF_OPEN_PROBE_RATE,
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn half_open_probe_rate(mut self, rate: f64) -> Self {
        self.half_open_probe_rate = rate.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    total_failures: u64,
    rejected: u64,
}

/// Snapshot of breaker counters
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub rejected: u64,
}

/// Thread-safe circuit breaker
///
/// # Example
///
/// ```rust
/// use recommender_cache::{CircuitBreaker, CircuitBreakerConfig};
/// use std::time::Duration;
///
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::new(2, Duration::from_secs(60)));
/// breaker.record_failure();
/// assert!(breaker.allow_request());
/// breaker.record_failure();
/// assert!(!breaker.allow_request());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        info!(
            failure_threshold = config.failure_threshold,
            reset_timeout_secs = config.reset_timeout.as_secs_f64(),
            probe_rate = config.half_open_probe_rate,
            "Initializing circuit breaker"
        );

        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                total_failures: 0,
                rejected: 0,
            }),
            config,
        }
    }

    fn window_elapsed(&self, inner: &BreakerInner, now: Instant) -> bool {
        inner
            .last_failure_at
            .is_none_or(|at| now.duration_since(at) > self.config.reset_timeout)
    }

    /// Record a failed upstream call
    ///
    /// Failures older than `reset_timeout` do not accumulate: the counter is
    /// reset before counting this one.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if self.window_elapsed(&inner, now) {
            inner.consecutive_failures = 0;
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.total_failures += 1;
        inner.last_failure_at = Some(now);

        if inner.consecutive_failures >= self.config.failure_threshold {
            if inner.state != CircuitState::Open {
                warn!(
                    from = %inner.state,
                    failures = inner.consecutive_failures,
                    "Circuit breaker opened due to repeated upstream failures"
                );
            }
            inner.state = CircuitState::Open;
        } else {
            debug!(
                failures = inner.consecutive_failures,
                threshold = self.config.failure_threshold,
                "Upstream failure recorded"
            );
        }
    }

    /// Record a successful upstream call, closing the breaker
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(from = %inner.state, "Circuit breaker closed after successful call");
        }
        inner.consecutive_failures = 0;
        inner.state = CircuitState::Closed;
    }

    /// Whether a new upstream attempt may be made now
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        let allowed = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.window_elapsed(&inner, Instant::now()) {
                    inner.state = CircuitState::HalfOpen;
                    info!("Circuit breaker half-open, admitting probe request");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => rand::random::<f64>() < self.config.half_open_probe_rate,
        };

        if !allowed {
            inner.rejected += 1;
        }
        allowed
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            rejected: inner.rejected,
        }
    }

    /// Force the breaker back to closed and forget past failures
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure_at = None;
        info!("Circuit breaker reset");
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread::sleep;

    fn breaker(threshold: u32, reset: Duration, probe_rate: f64) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::new(threshold, reset).half_open_probe_rate(probe_rate),
        )
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = breaker(5, Duration::from_secs(60), 0.1);
        for _ in 0..4 {
            cb.record_failure();
            assert!(cb.allow_request());
        }
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
        assert_eq!(cb.stats().rejected, 1);
    }

    #[test]
    fn test_full_state_machine() {
        let cb = breaker(3, Duration::from_millis(50), 0.0);
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(!cb.allow_request());

        sleep(Duration::from_millis(80));
        // Lazy transition: the first attempt after the window is the probe
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Probe rate 0: nothing else gets through while half-open
        assert!(!cb.allow_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        for _ in 0..100 {
            assert!(cb.allow_request());
        }
    }

    #[test]
    fn test_failed_probe_after_window_restarts_count() {
        let cb = breaker(2, Duration::from_millis(30), 1.0);
        cb.record_failure();
        cb.record_failure();
        sleep(Duration::from_millis(50));
        assert!(cb.allow_request());

        cb.record_failure();
        // The probe failed after the reset window, so the count restarts at 1
        // and the breaker keeps throttling in half-open until failures pile up.
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_stale_failures_do_not_accumulate() {
        let cb = breaker(2, Duration::from_millis(30), 0.1);
        cb.record_failure();
        sleep(Duration::from_millis(50));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 1);
        assert_eq!(cb.stats().total_failures, 2);
    }

    #[test]
    fn test_success_resets_counter() {
        let cb = breaker(3, Duration::from_secs(60), 0.1);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_rate_one_admits_all() {
        let cb = breaker(1, Duration::from_millis(10), 1.0);
        cb.record_failure();
        sleep(Duration::from_millis(30));
        for _ in 0..20 {
            assert!(cb.allow_request());
        }
    }

    #[test]
    fn test_reset() {
        let cb = breaker(1, Duration::from_secs(60), 0.1);
        cb.record_failure();
        assert!(!cb.allow_request());
        cb.reset();
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_concurrent_failures_open_exactly_once() {
        let cb = Arc::new(breaker(50, Duration::from_secs(60), 0.1));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cb = Arc::clone(&cb);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        cb.record_failure();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap_or_else(|_| panic!("thread panicked"));
        }
        let stats = cb.stats();
        assert_eq!(stats.consecutive_failures, 100);
        assert_eq!(stats.state, CircuitState::Open);
    }
}
