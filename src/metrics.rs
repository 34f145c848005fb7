//! Metrics sink interface
//!
//! Fire-and-forget counters, gauges and timings. Implementations must
//! never surface failures to the caller.

use std::sync::Arc;

pub trait Metrics: Send + Sync {
    fn increment(&self, name: &str);
    fn gauge(&self, name: &str, value: f64);
    fn timing(&self, name: &str, seconds: f64);
}

/// Emits every metric as a `tracing` debug event.
pub struct LogMetrics;

impl Metrics for LogMetrics {
    fn increment(&self, name: &str) {
        tracing::debug!(metric = %name, "increment");
    }

    fn gauge(&self, name: &str, value: f64) {
        tracing::debug!(metric = %name, value, "gauge");
    }

    fn timing(&self, name: &str, seconds: f64) {
        tracing::debug!(metric = %name, seconds, "timing");
    }
}

/// Discards everything.
pub struct NullMetrics;

impl Metrics for NullMetrics {
    fn increment(&self, _name: &str) {}
    fn gauge(&self, _name: &str, _value: f64) {}
    fn timing(&self, _name: &str, _seconds: f64) {}
}

pub fn null() -> Arc<dyn Metrics> {
    Arc::new(NullMetrics)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Records counter increments for assertions.
    #[derive(Default)]
    pub struct CaptureMetrics {
        pub counters: Mutex<HashMap<String, u64>>,
    }

    impl Metrics for CaptureMetrics {
        fn increment(&self, name: &str) {
            *self.counters.lock().entry(name.to_string()).or_insert(0) += 1;
        }

        fn gauge(&self, _name: &str, _value: f64) {}
        fn timing(&self, _name: &str, _seconds: f64) {}
    }

    impl CaptureMetrics {
        pub fn count(&self, name: &str) -> u64 {
            self.counters.lock().get(name).copied().unwrap_or(0)
        }
    }
}
