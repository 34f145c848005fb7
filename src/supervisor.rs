//! Worker supervision
//!
//! Owns the long-running tasks: one reconciler per pool plus the disk and
//! snapshot queue workers. A health-check loop watches the join handles
//! and respawns anything that exited, panics included, so a wedged pool
//! never takes the daemon down with it. Reconciler state that must
//! survive a respawn (the empty-pool edge tracker) lives in the shared
//! `Arc`, not the task.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreaker;
use crate::config::Settings;
use crate::gate::TaskGate;
use crate::metrics::Metrics;
use crate::migration::MigrationCoordinator;
use crate::provider::Provider;
use crate::reconciler::{PoolDefaults, PoolReconciler, ReconcilerDeps};
use crate::store::Store;
use crate::tasks::TaskWorker;
use crate::timeout::AdaptiveTimeout;
use crate::{autoscaler::AutoScaler, rate::RateProvisioner};

type SpawnFn = Box<dyn Fn(CancellationToken) -> JoinHandle<()> + Send + Sync>;

pub struct Supervisor {
    settings: Settings,
    metrics: Arc<dyn Metrics>,
    workers: Vec<(String, SpawnFn)>,
}

impl Supervisor {
    pub fn new(
        settings: Settings,
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        let deps = ReconcilerDeps {
            store: store.clone(),
            provider: provider.clone(),
            metrics: metrics.clone(),
            breaker: Arc::new(CircuitBreaker::new(settings.circuit_breaker.clone(), metrics.clone())),
            adaptive: Arc::new(AdaptiveTimeout::new(settings.adaptive_timeout.clone())),
            autoscaler: Arc::new(AutoScaler::new(store.clone(), metrics.clone())),
            rate: Arc::new(RateProvisioner::new(metrics.clone())),
            migration: Arc::new(MigrationCoordinator::new(
                store.clone(),
                provider.clone(),
                metrics.clone(),
                settings.migration_limit,
                settings.fixed_call_timeout(),
            )),
            clone_gate: Arc::new(TaskGate::new()),
        };
        let defaults = PoolDefaults::from_settings(&settings);

        let mut workers: Vec<(String, SpawnFn)> = Vec::new();
        for pool in &settings.pools {
            let reconciler = Arc::new(PoolReconciler::new(pool.clone(), deps.clone(), defaults.clone()));
            let name = format!("pool:{}", pool.name);
            workers.push((
                name,
                Box::new(move |token| {
                    let reconciler = Arc::clone(&reconciler);
                    tokio::spawn(reconciler.run(token))
                }),
            ));
        }

        let task_worker = Arc::new(TaskWorker::new(
            store,
            provider,
            metrics.clone(),
            settings.fixed_call_timeout(),
            settings.check_interval(),
        ));
        let disks = Arc::clone(&task_worker);
        workers.push((
            "disks".to_string(),
            Box::new(move |token| {
                let worker = Arc::clone(&disks);
                tokio::spawn(worker.run_disks(token))
            }),
        ));
        workers.push((
            "snapshots".to_string(),
            Box::new(move |token| {
                let worker = Arc::clone(&task_worker);
                tokio::spawn(worker.run_snapshots(token))
            }),
        ));

        Self { settings, metrics, workers }
    }

    /// Spawn every worker and babysit them until cancelled, then wait for
    /// all of them to wind down.
    pub async fn run(&self, token: CancellationToken) {
        let mut handles: HashMap<&str, JoinHandle<()>> = self
            .workers
            .iter()
            .map(|(name, spawn)| (name.as_str(), spawn(token.clone())))
            .collect();
        tracing::info!(workers = handles.len(), "supervisor started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.settings.check_interval()) => {}
            }

            for (name, spawn) in &self.workers {
                let finished = handles
                    .get(name.as_str())
                    .map(|h| h.is_finished())
                    .unwrap_or(true);
                if !finished {
                    continue;
                }
                if let Some(handle) = handles.remove(name.as_str()) {
                    match handle.await {
                        Ok(()) => tracing::warn!(worker = %name, "worker exited early"),
                        Err(e) if e.is_panic() => {
                            tracing::error!(worker = %name, "worker panicked")
                        }
                        Err(_) => {}
                    }
                }
                tracing::info!(worker = %name, "respawning worker");
                self.metrics.increment("supervisor.respawned");
                handles.insert(name.as_str(), spawn(token.clone()));
            }
        }

        tracing::info!("supervisor shutting down");
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(worker = %name, "worker panicked during shutdown");
                }
            }
        }
        tracing::info!("supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::metrics;
    use crate::provider::StubProvider;
    use crate::store::{MemoryStore, QueueSet};
    use std::time::Duration;

    fn quick_settings(pools: Vec<PoolConfig>) -> Settings {
        Settings {
            pools,
            reconcile_interval_secs: 0,
            check_interval_secs: 0,
            ..Settings::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_clones_up_to_pool_size() {
        let store = Arc::new(MemoryStore::new());
        let settings = quick_settings(vec![PoolConfig::new("ci", "ubuntu-2404").size(2)]);
        let supervisor = Supervisor::new(
            settings,
            store.clone(),
            Arc::new(StubProvider::new()),
            metrics::null(),
        );

        let token = CancellationToken::new();
        let run = tokio::spawn({
            let token = token.clone();
            async move { supervisor.run(token).await }
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let tracked =
                store.len("ci", QueueSet::Pending) + store.len("ci", QueueSet::Ready);
            if tracked >= 2 || tokio::time::Instant::now() > deadline {
                assert!(tracked >= 2, "pool never reached target, tracked {tracked}");
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        token.cancel();
        run.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_with_no_pools() {
        let supervisor = Supervisor::new(
            quick_settings(Vec::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(StubProvider::new()),
            metrics::null(),
        );

        let token = CancellationToken::new();
        token.cancel();
        // already cancelled: run() must still join the queue workers and return
        tokio::time::timeout(Duration::from_secs(5), supervisor.run(token))
            .await
            .unwrap();
    }
}
