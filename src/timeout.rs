//! Adaptive per-operation timeout estimator
//!
//! Tracks recent successful-call durations and sizes the next deadline at
//! p95 * 1.5, clamped to configured bounds. Failures shrink the deadline
//! so an ongoing outage fails faster; a 5s hysteresis band keeps the
//! estimate from thrashing.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Minimum samples before the estimate is trusted.
const MIN_SAMPLES: usize = 10;
/// Adjustments smaller than this are ignored.
const HYSTERESIS: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveTimeoutConfig {
    pub min_secs: u64,
    pub max_secs: u64,
    pub default_secs: u64,
    pub max_samples: usize,
}

impl Default for AdaptiveTimeoutConfig {
    fn default() -> Self {
        Self { min_secs: 30, max_secs: 300, default_secs: 60, max_samples: 100 }
    }
}

impl AdaptiveTimeoutConfig {
    pub fn min(&self) -> Duration {
        Duration::from_secs(self.min_secs)
    }

    pub fn max(&self) -> Duration {
        Duration::from_secs(self.max_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_secs)
    }
}

struct Inner {
    samples: VecDeque<Duration>,
    current: Duration,
}

pub struct AdaptiveTimeout {
    config: AdaptiveTimeoutConfig,
    inner: Mutex<Inner>,
}

impl AdaptiveTimeout {
    pub fn new(config: AdaptiveTimeoutConfig) -> Self {
        let current = config.default_timeout();
        Self {
            config,
            inner: Mutex::new(Inner { samples: VecDeque::new(), current }),
        }
    }

    /// Deadline for the next provider call. Thread-safe.
    pub fn current(&self) -> Duration {
        self.inner.lock().current
    }

    pub fn record_success(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.samples.push_back(duration);
        while inner.samples.len() > self.config.max_samples {
            inner.samples.pop_front();
        }
        if inner.samples.len() < MIN_SAMPLES {
            return;
        }

        let p95 = percentile_95(&inner.samples);
        let candidate = (p95 * 3 / 2).clamp(self.config.min(), self.config.max());
        let delta = abs_diff(candidate, inner.current);
        if delta > HYSTERESIS {
            tracing::debug!(
                from_secs = inner.current.as_secs(),
                to_secs = candidate.as_secs(),
                "adaptive timeout adjusted"
            );
            inner.current = candidate;
        }
    }

    /// Shrink the deadline by 20%, floored at the configured minimum.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let shrunk = inner.current.mul_f64(0.8);
        inner.current = shrunk.max(self.config.min());
    }

    /// Forget history and restore the default deadline.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.samples.clear();
        inner.current = self.config.default_timeout();
    }
}

fn percentile_95(samples: &VecDeque<Duration>) -> Duration {
    let mut sorted: Vec<Duration> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let rank = (sorted.len() * 95).div_ceil(100);
    sorted[rank.saturating_sub(1)]
}

fn abs_diff(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> AdaptiveTimeout {
        AdaptiveTimeout::new(AdaptiveTimeoutConfig {
            min_secs: 5,
            max_secs: 120,
            default_secs: 60,
            max_samples: 50,
        })
    }

    #[test]
    fn test_no_adjustment_below_min_samples() {
        let at = estimator();
        for _ in 0..9 {
            at.record_success(Duration::from_secs(1));
        }
        assert_eq!(at.current(), Duration::from_secs(60));
    }

    #[test]
    fn test_converges_on_p95() {
        let at = estimator();
        // 20 samples around 10s with a 12s tail: p95 = 12, candidate = 18
        for _ in 0..19 {
            at.record_success(Duration::from_secs(10));
        }
        at.record_success(Duration::from_secs(12));

        let current = at.current();
        assert!(current >= Duration::from_secs(13) && current <= Duration::from_secs(23));

        // feeding the same distribution again must not oscillate
        let settled = at.current();
        for _ in 0..20 {
            at.record_success(Duration::from_secs(10));
        }
        assert_eq!(at.current(), settled);
    }

    #[test]
    fn test_candidate_is_clamped() {
        let at = estimator();
        for _ in 0..20 {
            at.record_success(Duration::from_secs(600));
        }
        assert_eq!(at.current(), Duration::from_secs(120));
    }

    #[test]
    fn test_failures_shrink_to_floor() {
        let at = estimator();
        for _ in 0..30 {
            at.record_failure();
        }
        assert_eq!(at.current(), Duration::from_secs(5));
    }

    #[test]
    fn test_reset_restores_default() {
        let at = estimator();
        at.record_failure();
        at.record_failure();
        at.reset();
        assert_eq!(at.current(), Duration::from_secs(60));
    }
}
