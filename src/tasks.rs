//! Auxiliary task workers
//!
//! Two background loops drain the disk and snapshot queues. Requests are
//! best-effort: a failed task is logged and dropped rather than retried,
//! and the worker keeps running. Provider calls here use the fixed call
//! timeout, not the adaptive one, since disk and snapshot operations have
//! no bearing on clone latency.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;
use crate::provider::Provider;
use crate::store::{SnapshotTask, Store};
use crate::{Error, Result};

pub struct TaskWorker {
    store: Arc<dyn Store>,
    provider: Arc<dyn Provider>,
    metrics: Arc<dyn Metrics>,
    call_timeout: Duration,
    poll_interval: Duration,
}

impl TaskWorker {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        metrics: Arc<dyn Metrics>,
        call_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self { store, provider, metrics, call_timeout, poll_interval }
    }

    /// Drain the disk queue until cancelled.
    pub async fn run_disks(self: Arc<Self>, token: CancellationToken) {
        tracing::info!("disk worker started");
        loop {
            match self.store.pop_disk_task() {
                Some(task) => {
                    if let Err(e) = self.attach_disk(&task.pool, &task.vm, task.size_gb).await {
                        tracing::error!(pool = %task.pool, vm = %task.vm, size_gb = task.size_gb, error = %e, "disk task failed");
                        self.metrics.increment("task.disk_failed");
                    }
                }
                None => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
            if token.is_cancelled() {
                break;
            }
        }
        tracing::info!("disk worker stopped");
    }

    /// Drain the snapshot queue until cancelled.
    pub async fn run_snapshots(self: Arc<Self>, token: CancellationToken) {
        tracing::info!("snapshot worker started");
        loop {
            match self.store.pop_snapshot_task() {
                Some(task) => {
                    if let Err(e) = self.snapshot(&task).await {
                        let (pool, vm) = task.target();
                        tracing::error!(pool = %pool, vm = %vm, error = %e, "snapshot task failed");
                        self.metrics.increment("task.snapshot_failed");
                    }
                }
                None => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
            if token.is_cancelled() {
                break;
            }
        }
        tracing::info!("snapshot worker stopped");
    }

    async fn attach_disk(&self, pool: &str, vm: &str, size_gb: u32) -> Result<()> {
        let disk = self.call(self.provider.create_disk(pool, vm, size_gb)).await?;
        if let Some(mut record) = self.store.get_record(pool, vm) {
            record.disks.push(disk.clone());
            self.store.put_record(&record);
        }
        tracing::info!(pool = %pool, vm = %vm, disk = %disk, size_gb, "disk attached");
        self.metrics.increment("task.disk_attached");
        Ok(())
    }

    async fn snapshot(&self, task: &SnapshotTask) -> Result<()> {
        match task {
            SnapshotTask::Create { pool, vm, name } => {
                self.call(self.provider.create_snapshot(pool, vm, name)).await?;
                if let Some(mut record) = self.store.get_record(pool, vm) {
                    record.snapshots.insert(name.clone());
                    self.store.put_record(&record);
                }
                tracing::info!(pool = %pool, vm = %vm, snapshot = %name, "snapshot created");
                self.metrics.increment("task.snapshot_created");
            }
            SnapshotTask::Revert { pool, vm, name } => {
                self.call(self.provider.revert_snapshot(pool, vm, name)).await?;
                tracing::info!(pool = %pool, vm = %vm, snapshot = %name, "snapshot reverted");
                self.metrics.increment("task.snapshot_reverted");
            }
        }
        Ok(())
    }

    async fn call<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::ProviderTimeout(self.call_timeout)),
        }
    }
}
