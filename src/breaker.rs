//! Circuit breaker for provider calls
//!
//! closed -> open -> half_open -> closed, with self-loops back to open on
//! failure. Shared by every reconciler talking to the same provider, so
//! all interior state sits behind one mutex; the protected call itself
//! runs outside the lock.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::metrics::Metrics;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Cooldown before an open circuit admits a trial call.
    pub timeout_secs: u64,
    /// Successful trial calls needed to close again.
    pub half_open_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            timeout_secs: 60,
            half_open_attempts: 2,
        }
    }
}

impl BreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Snapshot of breaker state for observability and tests.
#[derive(Debug, Clone)]
pub struct BreakerStatus {
    pub state: BreakerState,
    pub failures: u32,
    pub half_open_successes: u32,
    /// Remaining cooldown while open.
    pub next_retry: Option<Duration>,
}

struct Inner {
    state: BreakerState,
    failures: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    metrics: Arc<dyn Metrics>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            config,
            metrics,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                half_open_successes: 0,
                last_failure: None,
            }),
        }
    }

    /// Admit or reject a call. An open circuit whose cooldown has elapsed
    /// moves to half-open and admits the call as a trial.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let timeout = self.config.timeout();
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(timeout);
                if elapsed >= timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    tracing::info!("circuit half-open, admitting trial call");
                    self.metrics.increment("breaker.half_open");
                    Ok(())
                } else {
                    Err(Error::CircuitOpen { retry_in: timeout - elapsed })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                inner.failures = 0;
                if inner.half_open_successes >= self.config.half_open_attempts {
                    inner.state = BreakerState::Closed;
                    inner.half_open_successes = 0;
                    tracing::info!("circuit closed");
                    self.metrics.increment("breaker.closed");
                }
            }
            // Success while open can only come from a call admitted before
            // the trip; ignore it.
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.half_open_successes = 0;
                    tracing::warn!(failures = inner.failures, "circuit opened");
                    self.metrics.increment("breaker.open");
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                tracing::warn!("trial call failed, circuit re-opened");
                self.metrics.increment("breaker.open");
            }
            BreakerState::Open => {}
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock();
        let next_retry = match inner.state {
            BreakerState::Open => {
                let elapsed = inner.last_failure.map(|t| t.elapsed()).unwrap_or_default();
                Some(self.config.timeout().saturating_sub(elapsed))
            }
            _ => None,
        };
        BreakerStatus {
            state: inner.state,
            failures: inner.failures,
            half_open_successes: inner.half_open_successes,
            next_retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;

    fn breaker(timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 3,
                timeout_secs: timeout.as_secs(),
                half_open_attempts: 2,
            },
            metrics::null(),
        )
    }

    #[test]
    fn test_trips_after_threshold() {
        let b = breaker(Duration::from_secs(60));
        b.record_failure();
        b.record_failure();
        assert!(b.try_acquire().is_ok());
        b.record_failure();

        assert_eq!(b.status().state, BreakerState::Open);
        let err = b.try_acquire().unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert!(b.status().next_retry.is_some());
    }

    #[test]
    fn test_full_cycle() {
        let b = breaker(Duration::ZERO);
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(b.status().state, BreakerState::Open);

        // cooldown elapsed: admitted as trial, now half-open
        assert!(b.try_acquire().is_ok());
        assert_eq!(b.status().state, BreakerState::HalfOpen);

        b.record_success();
        assert_eq!(b.status().state, BreakerState::HalfOpen);
        b.record_success();
        assert_eq!(b.status().state, BreakerState::Closed);
        assert_eq!(b.status().failures, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let b = breaker(Duration::ZERO);
        for _ in 0..3 {
            b.record_failure();
        }
        assert!(b.try_acquire().is_ok());
        assert_eq!(b.status().state, BreakerState::HalfOpen);

        b.record_failure();
        assert_eq!(b.status().state, BreakerState::Open);
    }

    #[test]
    fn test_success_resets_closed_failures() {
        let b = breaker(Duration::from_secs(60));
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        // never reached three consecutive failures
        assert_eq!(b.status().state, BreakerState::Closed);
    }
}
