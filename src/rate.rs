//! Demand-based clone concurrency
//!
//! Picks how many clones a pool may run at once. High demand means the
//! checkout queue is deep, or the pool is empty while someone is waiting.
//! The mode is sticky per pool so repeated passes in the same mode do not
//! re-log the transition.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::autoscaler::QueueCounts;
use crate::config::PoolConfig;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemandMode {
    Normal,
    High,
}

impl std::fmt::Display for DemandMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DemandMode::Normal => write!(f, "normal"),
            DemandMode::High => write!(f, "high"),
        }
    }
}

pub struct RateProvisioner {
    metrics: Arc<dyn Metrics>,
    modes: Mutex<HashMap<String, DemandMode>>,
}

impl RateProvisioner {
    pub fn new(metrics: Arc<dyn Metrics>) -> Self {
        Self { metrics, modes: Mutex::new(HashMap::new()) }
    }

    /// Clone concurrency for this pass. Disabled pools use their static
    /// target.
    pub fn clone_concurrency(
        &self,
        pool: &PoolConfig,
        counts: &QueueCounts,
        pending_requests: u64,
    ) -> usize {
        let config = &pool.rate_provisioning;
        if !config.enabled {
            return pool.clone_target_concurrency;
        }

        let high_demand = pending_requests >= config.queue_depth_threshold
            || (counts.ready == 0 && pending_requests > 0);
        let mode = if high_demand { DemandMode::High } else { DemandMode::Normal };

        let previous = self.modes.lock().insert(pool.name.clone(), mode);
        if previous != Some(mode) {
            tracing::info!(
                pool = %pool.name,
                mode = %mode,
                pending_requests,
                ready = counts.ready,
                "clone rate mode changed"
            );
            match mode {
                DemandMode::High => self.metrics.increment("rate.high_demand"),
                DemandMode::Normal => self.metrics.increment("rate.normal"),
            }
        }

        match mode {
            DemandMode::High => config.high_demand_concurrency,
            DemandMode::Normal => config.normal_concurrency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateProvisioningConfig;
    use crate::metrics::testing::CaptureMetrics;

    fn pool(enabled: bool) -> PoolConfig {
        PoolConfig::new("ci", "ubuntu-2404").size(10).rate_provisioning(RateProvisioningConfig {
            enabled,
            normal_concurrency: 2,
            high_demand_concurrency: 6,
            queue_depth_threshold: 5,
        })
    }

    fn counts(ready: usize) -> QueueCounts {
        QueueCounts { pending: 0, ready, running: 0 }
    }

    #[test]
    fn test_disabled_returns_static_target() {
        let rate = RateProvisioner::new(crate::metrics::null());
        assert_eq!(rate.clone_concurrency(&pool(false), &counts(0), 100), 2);
    }

    #[test]
    fn test_queue_depth_triggers_high_demand() {
        let rate = RateProvisioner::new(crate::metrics::null());
        let pool = pool(true);
        assert_eq!(rate.clone_concurrency(&pool, &counts(3), 4), 2);
        assert_eq!(rate.clone_concurrency(&pool, &counts(3), 5), 6);
    }

    #[test]
    fn test_empty_pool_with_waiters_is_high_demand() {
        let rate = RateProvisioner::new(crate::metrics::null());
        let pool = pool(true);
        assert_eq!(rate.clone_concurrency(&pool, &counts(0), 1), 6);
        // empty but nobody waiting: normal
        assert_eq!(rate.clone_concurrency(&pool, &counts(0), 0), 2);
    }

    #[test]
    fn test_mode_transitions_counted_once() {
        let captured = Arc::new(CaptureMetrics::default());
        let rate = RateProvisioner::new(captured.clone());
        let pool = pool(true);

        rate.clone_concurrency(&pool, &counts(3), 0);
        rate.clone_concurrency(&pool, &counts(3), 0);
        rate.clone_concurrency(&pool, &counts(3), 9);
        rate.clone_concurrency(&pool, &counts(3), 9);
        rate.clone_concurrency(&pool, &counts(3), 0);

        assert_eq!(captured.count("rate.normal"), 2);
        assert_eq!(captured.count("rate.high_demand"), 1);
    }
}
