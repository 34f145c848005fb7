//! Per-pool reconciliation loop
//!
//! One reconciler owns one pool and runs forever on a fixed interval.
//! Each pass walks the queue sets in a fixed order (inventory, running,
//! ready, pending, completed, discovered, migrating, repopulate) so the
//! state machine stays easy to reason about: every transition is an
//! atomic set move and no two passes for the same pool ever overlap.
//!
//! Provider calls go through the shared circuit breaker and carry the
//! adaptive timeout as their deadline. A rejected or timed-out call
//! leaves the affected VM untouched for the pass; only the time-based
//! checks (pending provisioning timeout, ready TTL) fire on ambiguous
//! provider state.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::autoscaler::{AutoScaler, QueueCounts};
use crate::breaker::CircuitBreaker;
use crate::config::{PoolConfig, Settings};
use crate::gate::{TaskGate, TaskPermit};
use crate::metrics::Metrics;
use crate::migration::MigrationCoordinator;
use crate::models::VmRecord;
use crate::provider::{PowerState, Provider};
use crate::rate::RateProvisioner;
use crate::store::{QueueSet, Store};
use crate::timeout::AdaptiveTimeout;
use crate::{Error, Result};

/// Shared collaborators injected into every reconciler.
#[derive(Clone)]
pub struct ReconcilerDeps {
    pub store: Arc<dyn Store>,
    pub provider: Arc<dyn Provider>,
    pub metrics: Arc<dyn Metrics>,
    pub breaker: Arc<CircuitBreaker>,
    pub adaptive: Arc<AdaptiveTimeout>,
    pub autoscaler: Arc<AutoScaler>,
    pub rate: Arc<RateProvisioner>,
    pub migration: Arc<MigrationCoordinator>,
    /// Process-wide clone admission counter.
    pub clone_gate: Arc<TaskGate>,
}

/// Global defaults a pool falls back to.
#[derive(Debug, Clone)]
pub struct PoolDefaults {
    pub task_limit: usize,
    pub vm_lifetime: Duration,
    pub ready_ttl: Option<Duration>,
    pub provisioning_timeout: Duration,
    pub retention_ttl: Duration,
    pub probe_timeout: Duration,
    pub interval: Duration,
}

impl PoolDefaults {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            task_limit: settings.task_limit,
            vm_lifetime: settings.vm_lifetime(),
            ready_ttl: settings.ready_ttl(),
            provisioning_timeout: settings.provisioning_timeout(),
            retention_ttl: settings.vm_retention_ttl(),
            probe_timeout: settings.probe_timeout(),
            interval: settings.reconcile_interval(),
        }
    }
}

pub struct PoolReconciler {
    pool: PoolConfig,
    deps: ReconcilerDeps,
    defaults: PoolDefaults,
    /// Pool-local in-flight clone counter.
    local_gate: TaskGate,
    /// Ready count seen by the previous pass, for empty-pool transitions.
    last_ready: Mutex<Option<usize>>,
}

impl PoolReconciler {
    pub fn new(pool: PoolConfig, deps: ReconcilerDeps, defaults: PoolDefaults) -> Self {
        Self {
            pool,
            deps,
            defaults,
            local_gate: TaskGate::new(),
            last_ready: Mutex::new(None),
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    /// Reconcile forever, one pass per interval, until cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        tracing::info!(pool = %self.pool.name, "reconciler started");
        loop {
            self.pass().await;
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.defaults.interval) => {}
            }
        }
        tracing::info!(pool = %self.pool.name, "reconciler stopped");
    }

    /// One full reconciliation pass, stages in fixed order.
    pub async fn pass(&self) {
        let now = Utc::now();
        let inventory = self.sync_inventory(now).await;
        self.sweep_running(now).await;
        self.sweep_ready(now).await;
        self.sweep_pending(now).await;
        self.sweep_completed(inventory.as_ref()).await;
        self.sweep_discovered();
        self.sweep_migrating().await;
        self.repopulate();
    }

    /// Wrap one provider call in breaker admission and the adaptive
    /// deadline, feeding the outcome back into both.
    async fn guarded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        guarded_call(&self.deps, &self.pool.name, op, fut).await
    }

    /// Stage 1: anything the provider holds that no queue set tracks goes
    /// to `discovered`. Returns the inventory for the later stages, or
    /// `None` when the provider could not be asked this pass.
    async fn sync_inventory(&self, now: DateTime<Utc>) -> Option<HashSet<String>> {
        let pool = &self.pool.name;
        let listed = self
            .guarded("list_inventory", self.deps.provider.list_inventory(pool))
            .await
            .ok()?;
        let inventory: HashSet<String> = listed.into_iter().collect();

        let mut tracked = HashSet::new();
        for set in QueueSet::ALL {
            tracked.extend(self.deps.store.members(pool, set));
        }

        for name in &inventory {
            if tracked.contains(name) {
                continue;
            }
            if self.deps.store.add_vm(pool, QueueSet::Discovered, name) {
                tracing::info!(pool = %pool, vm = %name, "untracked VM discovered");
                if self.deps.store.get_record(pool, name).is_none() {
                    let mut record = VmRecord::new(pool, &self.pool.template, name);
                    record.clone_started_at = now;
                    self.deps.store.put_record(&record);
                }
            }
        }
        Some(inventory)
    }

    /// Stage 2: expire checked-out VMs past their lifetime.
    async fn sweep_running(&self, now: DateTime<Utc>) {
        let pool = &self.pool.name;
        for name in self.deps.store.members(pool, QueueSet::Running) {
            let Some(mut record) = self.deps.store.get_record(pool, &name) else {
                tracing::warn!(pool = %pool, vm = %name, "running VM has no record, retiring");
                self.deps.store.move_vm(pool, QueueSet::Running, QueueSet::Completed, &name);
                continue;
            };

            let lifetime = record.lifetime(&self.pool, self.defaults.vm_lifetime);
            if record.checkout_elapsed(now) > lifetime {
                if self.deps.store.move_vm(pool, QueueSet::Running, QueueSet::Completed, &name) {
                    tracing::info!(pool = %pool, vm = %name, lifetime_secs = lifetime.as_secs(), "lifetime expired");
                    self.deps.metrics.increment("vm.expired");
                }
                continue;
            }

            record.last_checked_at = Some(now);
            self.deps.store.put_record(&record);
        }
    }

    /// Stage 3: health-check ready VMs. Checks run in order and the first
    /// failure retires the VM: TTL, power state, hostname match, liveness
    /// probe. The TTL check is time-based and fires even when the
    /// provider is unreachable.
    async fn sweep_ready(&self, now: DateTime<Utc>) {
        let pool = &self.pool.name;
        let ready_ttl = self.pool.ready_ttl_secs.map(Duration::from_secs).or(self.defaults.ready_ttl);

        for name in self.deps.store.members(pool, QueueSet::Ready) {
            let Some(mut record) = self.deps.store.get_record(pool, &name) else {
                tracing::warn!(pool = %pool, vm = %name, "ready VM has no record, retiring");
                self.deps.store.move_vm(pool, QueueSet::Ready, QueueSet::Completed, &name);
                continue;
            };

            if let Some(ttl) = ready_ttl {
                if record.ready_elapsed(now) > ttl {
                    if self.deps.store.move_vm(pool, QueueSet::Ready, QueueSet::Completed, &name) {
                        tracing::info!(pool = %pool, vm = %name, "ready TTL expired");
                        self.deps.metrics.increment("vm.ready_expired");
                    }
                    continue;
                }
            }

            let info = match self.guarded("get_vm", self.deps.provider.get_vm(pool, &name)).await {
                Ok(Some(info)) => info,
                Ok(None) => {
                    tracing::warn!(pool = %pool, vm = %name, "ready VM missing from provider, retiring");
                    self.deps.store.move_vm(pool, QueueSet::Ready, QueueSet::Completed, &name);
                    continue;
                }
                // unknown state: leave the VM alone until the next pass
                Err(_) => continue,
            };

            if info.power_state != PowerState::On {
                tracing::warn!(pool = %pool, vm = %name, power = %info.power_state, "ready VM not powered on, retiring");
                self.deps.store.move_vm(pool, QueueSet::Ready, QueueSet::Completed, &name);
                continue;
            }

            if info.hostname != name {
                tracing::warn!(
                    pool = %pool,
                    vm = %name,
                    reported = %info.hostname,
                    "hostname mismatch, retiring"
                );
                self.deps.metrics.increment("vm.hostname_mismatch");
                self.deps.store.move_vm(pool, QueueSet::Ready, QueueSet::Completed, &name);
                continue;
            }

            if !self.probe(&name).await {
                tracing::warn!(pool = %pool, vm = %name, port = self.pool.probe_port, "liveness probe failed, retiring");
                self.deps.store.move_vm(pool, QueueSet::Ready, QueueSet::Completed, &name);
                continue;
            }

            record.last_checked_at = Some(now);
            record.host = Some(info.host);
            self.deps.store.put_record(&record);
        }
    }

    /// Bounded TCP connect to the VM's probe port.
    async fn probe(&self, name: &str) -> bool {
        let addr = (name.to_string(), self.pool.probe_port);
        matches!(
            tokio::time::timeout(self.defaults.probe_timeout, tokio::net::TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    /// Stage 4: promote pending VMs that finished provisioning; retire
    /// the ones that ran out of time. The timeout applies even when the
    /// provider never answers.
    async fn sweep_pending(&self, now: DateTime<Utc>) {
        let pool = &self.pool.name;
        let provisioning_timeout = self
            .pool
            .provisioning_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.defaults.provisioning_timeout);

        for name in self.deps.store.members(pool, QueueSet::Pending) {
            let record = match self.deps.store.get_record(pool, &name) {
                Some(record) => record,
                None => {
                    // clone started before a crash; restart its clock
                    let mut record = VmRecord::new(pool, &self.pool.template, &name);
                    record.clone_started_at = now;
                    self.deps.store.put_record(&record);
                    record
                }
            };

            let ready = self
                .guarded("is_ready", self.deps.provider.is_ready(pool, &name))
                .await
                .ok();

            if ready == Some(true) {
                if self.deps.store.move_vm(pool, QueueSet::Pending, QueueSet::Ready, &name) {
                    let boot = record.provisioning_elapsed(now);
                    let mut record = record;
                    record.booted_at = Some(now);
                    self.deps.store.put_record(&record);
                    tracing::info!(pool = %pool, vm = %name, boot_secs = boot.as_secs(), "VM ready");
                    self.deps.metrics.timing("vm.boot_seconds", boot.as_secs_f64());
                }
                continue;
            }

            if record.provisioning_elapsed(now) > provisioning_timeout {
                if self.deps.store.move_vm(pool, QueueSet::Pending, QueueSet::Completed, &name) {
                    tracing::warn!(pool = %pool, vm = %name, timeout_secs = provisioning_timeout.as_secs(), "provisioning timed out");
                    self.deps.metrics.increment("vm.provision_timeout");
                }
            }
        }
    }

    /// Stage 5: destroy retired VMs. Destroy failures purge the metadata
    /// anyway rather than retrying forever; a VM the provider no longer
    /// has is logged as an anomaly and purged immediately. Skipped
    /// entirely when this pass has no inventory to compare against.
    async fn sweep_completed(&self, inventory: Option<&HashSet<String>>) {
        let pool = &self.pool.name;
        let Some(inventory) = inventory else {
            tracing::debug!(pool = %pool, "no inventory this pass, deferring destroys");
            return;
        };

        for name in self.deps.store.members(pool, QueueSet::Completed) {
            if !inventory.contains(&name) {
                tracing::warn!(pool = %pool, vm = %name, "completed VM already absent from provider, purging");
                self.deps.store.remove_vm(pool, QueueSet::Completed, &name);
                self.deps.store.delete_record(pool, &name);
                continue;
            }

            match self.guarded("destroy_vm", self.deps.provider.destroy_vm(pool, &name)).await {
                Ok(()) => {
                    self.deps.store.remove_vm(pool, QueueSet::Completed, &name);
                    self.deps.store.expire_record(pool, &name, self.defaults.retention_ttl);
                    tracing::info!(pool = %pool, vm = %name, "VM destroyed");
                    self.deps.metrics.increment("vm.destroyed");
                }
                Err(e) if e.is_transient() => {
                    // state unknown, try again next pass
                }
                Err(e) => {
                    tracing::error!(pool = %pool, vm = %name, error = %e, "destroy failed, purging metadata");
                    self.deps.store.remove_vm(pool, QueueSet::Completed, &name);
                    self.deps.store.delete_record(pool, &name);
                    self.deps.metrics.increment("vm.destroy_failed");
                }
            }
        }
    }

    /// Stage 6: drop duplicate bookkeeping, then retire whatever is still
    /// only in `discovered` as unmanaged.
    fn sweep_discovered(&self) {
        let pool = &self.pool.name;
        let elsewhere: HashSet<String> =
            [QueueSet::Pending, QueueSet::Ready, QueueSet::Running, QueueSet::Completed]
                .iter()
                .flat_map(|set| self.deps.store.members(pool, *set))
                .collect();

        for name in self.deps.store.members(pool, QueueSet::Discovered) {
            if elsewhere.contains(&name) {
                tracing::info!(pool = %pool, vm = %name, "VM tracked elsewhere, dropping from discovered");
                self.deps.store.remove_vm(pool, QueueSet::Discovered, &name);
            } else if self.deps.store.move_vm(pool, QueueSet::Discovered, QueueSet::Completed, &name) {
                tracing::warn!(pool = %pool, vm = %name, "unmanaged VM, scheduling destroy");
                self.deps.metrics.increment("vm.orphaned");
            }
        }
    }

    /// Stage 7: run migration evaluation for every flagged VM; the flag
    /// is consumed whatever the outcome.
    async fn sweep_migrating(&self) {
        let pool = &self.pool.name;
        for name in self.deps.store.migrating(pool) {
            if let Err(e) = self.deps.migration.evaluate(pool, &name).await {
                tracing::warn!(pool = %pool, vm = %name, error = %e, "migration evaluation failed");
            }
            self.deps.store.remove_migrating(pool, &name);
        }
    }

    /// Stage 8: top the pool back up to its target size, within the
    /// global task limit and the pool's clone concurrency.
    fn repopulate(&self) {
        let pool = &self.pool.name;
        let counts = QueueCounts {
            pending: self.deps.store.len(pool, QueueSet::Pending),
            ready: self.deps.store.len(pool, QueueSet::Ready),
            running: self.deps.store.len(pool, QueueSet::Running),
        };

        self.record_ready_transition(counts.ready);
        self.deps.metrics.gauge(&format!("pool.{pool}.pending"), counts.pending as f64);
        self.deps.metrics.gauge(&format!("pool.{pool}.ready"), counts.ready as f64);
        self.deps.metrics.gauge(&format!("pool.{pool}.running"), counts.running as f64);

        let target = self.deps.autoscaler.target_size(&self.pool, &counts) as usize;
        let total = counts.pending + counts.ready;
        if total >= target {
            return;
        }

        let pending_requests = self.deps.store.pending_requests(pool);
        let concurrency = self.deps.rate.clone_concurrency(&self.pool, &counts, pending_requests);

        for _ in 0..(target - total) {
            let Some(local) = self.local_gate.try_acquire(concurrency) else {
                tracing::debug!(pool = %pool, concurrency, "pool clone concurrency reached");
                break;
            };
            let Some(global) = self.deps.clone_gate.try_acquire(self.defaults.task_limit) else {
                tracing::debug!(pool = %pool, limit = self.defaults.task_limit, "global task limit reached");
                break;
            };
            self.spawn_clone(local, global);
        }
    }

    /// Ready count crossing zero in either direction is a state change
    /// worth surfacing.
    fn record_ready_transition(&self, ready: usize) {
        let mut last = self.last_ready.lock();
        match *last {
            Some(previous) if previous > 0 && ready == 0 => {
                tracing::warn!(pool = %self.pool.name, "pool has no ready VMs");
                self.deps.metrics.increment("pool.empty");
            }
            Some(0) if ready > 0 => {
                tracing::info!(pool = %self.pool.name, ready, "pool replenished");
                self.deps.metrics.increment("pool.replenished");
            }
            _ => {}
        }
        *last = Some(ready);
    }

    /// Fire off one clone. The permits ride inside the task so both
    /// counters are released exactly once however the clone ends.
    fn spawn_clone(&self, local: TaskPermit, global: TaskPermit) {
        let name = format!("{}-{}", self.pool.name, &uuid::Uuid::new_v4().to_string()[..8]);
        let record = VmRecord::new(&self.pool.name, &self.pool.template, &name);
        self.deps.store.put_record(&record);
        self.deps.store.add_vm(&self.pool.name, QueueSet::Pending, &name);

        let deps = self.deps.clone();
        let pool = self.pool.name.clone();
        tokio::spawn(async move {
            let _local = local;
            let _global = global;
            let started = Instant::now();

            let attempt =
                guarded_call(&deps, &pool, "create_vm", deps.provider.create_vm(&pool, &name)).await;
            match attempt {
                Ok(info) => {
                    if let Some(mut record) = deps.store.get_record(&pool, &name) {
                        record.host = Some(info.host);
                        deps.store.put_record(&record);
                    }
                    tracing::info!(
                        pool = %pool,
                        vm = %name,
                        clone_secs = started.elapsed().as_secs(),
                        "clone started"
                    );
                    deps.metrics.timing("vm.clone_seconds", started.elapsed().as_secs_f64());
                }
                Err(e) => {
                    tracing::error!(pool = %pool, vm = %name, error = %e, "clone failed");
                    deps.store.remove_vm(&pool, QueueSet::Pending, &name);
                    deps.store.delete_record(&pool, &name);
                    deps.metrics.increment("clone.failed");
                }
            }
        });
    }
}

/// Breaker admission plus the adaptive deadline around one provider call,
/// with the outcome fed back into both.
async fn guarded_call<T, F>(deps: &ReconcilerDeps, pool: &str, op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    deps.breaker.try_acquire().inspect_err(|_| {
        tracing::debug!(pool = %pool, op, "provider call short-circuited");
    })?;

    let deadline = deps.adaptive.current();
    let started = Instant::now();
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(value)) => {
            deps.breaker.record_success();
            deps.adaptive.record_success(started.elapsed());
            Ok(value)
        }
        Ok(Err(e)) => {
            deps.breaker.record_failure();
            deps.adaptive.record_failure();
            tracing::warn!(pool = %pool, op, error = %e, "provider call failed");
            Err(e)
        }
        Err(_) => {
            deps.breaker.record_failure();
            deps.adaptive.record_failure();
            tracing::warn!(pool = %pool, op, timeout_secs = deadline.as_secs(), "provider call timed out");
            Err(Error::ProviderTimeout(deadline))
        }
    }
}
