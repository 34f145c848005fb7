//! Migration admission control
//!
//! Decides whether a VM flagged for migration evaluation may actually be
//! moved. Admission is serialized through a global set in the store,
//! independent of per-pool locking, so the cluster never runs more than
//! `migration_limit` evaluations at once. Without a limit the evaluation
//! is purely informational.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::metrics::Metrics;
use crate::provider::Provider;
use crate::store::Store;
use crate::{Error, Result};

pub struct MigrationCoordinator {
    store: Arc<dyn Store>,
    provider: Arc<dyn Provider>,
    metrics: Arc<dyn Metrics>,
    limit: Option<u32>,
    /// Fixed deadline; migration is not covered by adaptive tuning.
    call_timeout: Duration,
}

impl MigrationCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        metrics: Arc<dyn Metrics>,
        limit: Option<u32>,
        call_timeout: Duration,
    ) -> Self {
        Self { store, provider, metrics, limit, call_timeout }
    }

    /// Evaluate one VM for migration. The VM is guaranteed to be out of
    /// the global migration set when this returns, whatever happened.
    pub async fn evaluate(&self, pool: &str, name: &str) -> Result<()> {
        let Some(limit) = self.limit.filter(|l| *l > 0) else {
            match self.call(self.provider.get_host(pool, name)).await {
                Ok(host) => {
                    tracing::info!(pool = %pool, vm = %name, host = %host, "migration disabled, current host");
                }
                Err(e) => {
                    tracing::warn!(pool = %pool, vm = %name, error = %e, "host lookup failed");
                }
            }
            return Ok(());
        };

        if self.store.migration_len() as u32 >= limit {
            tracing::info!(pool = %pool, vm = %name, limit, "migration limit reached, declining");
            self.metrics.increment("migrate.declined");
            return Ok(());
        }

        self.store.migration_add(name);
        let outcome = self.migrate(pool, name).await;
        self.store.migration_remove(name);
        outcome
    }

    async fn migrate(&self, pool: &str, name: &str) -> Result<()> {
        let current = self.call(self.provider.get_host(pool, name)).await?;
        let dest = self.call(self.provider.least_used_compatible_host(pool, name)).await?;
        if dest == current {
            tracing::debug!(pool = %pool, vm = %name, host = %current, "already on best host");
            return Ok(());
        }

        tracing::info!(pool = %pool, vm = %name, from = %current, to = %dest, "migrating");
        let started = Instant::now();
        self.call(self.provider.migrate(name, &dest)).await?;
        let elapsed = started.elapsed();

        self.metrics.timing("migrate.duration", elapsed.as_secs_f64());
        self.metrics.increment("migrate.completed");

        if let Some(mut record) = self.store.get_record(pool, name) {
            if let Some(checked_out) = record.checked_out_at {
                let latency = (Utc::now() - checked_out).to_std().unwrap_or_default();
                self.metrics.timing("migrate.from_checkout", latency.as_secs_f64());
            }
            record.host = Some(dest);
            record.last_migration_secs = Some(elapsed.as_secs_f64());
            record.migration_started_at = None;
            self.store.put_record(&record);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testing::CaptureMetrics;
    use crate::models::VmRecord;
    use crate::provider::MockProvider;
    use crate::store::MemoryStore;

    fn coordinator(
        store: Arc<MemoryStore>,
        provider: MockProvider,
        metrics: Arc<CaptureMetrics>,
        limit: Option<u32>,
    ) -> MigrationCoordinator {
        MigrationCoordinator::new(store, Arc::new(provider), metrics, limit, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_no_limit_is_informational() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(CaptureMetrics::default());
        let mut provider = MockProvider::new();
        provider.expect_get_host().returning(|_, _| Ok("host-a".to_string()));
        provider.expect_migrate().never();

        let coord = coordinator(store.clone(), provider, metrics, None);
        coord.evaluate("ci", "ci-abc123").await.unwrap();
        assert_eq!(store.migration_len(), 0);
    }

    #[tokio::test]
    async fn test_declined_at_limit_without_provider_calls() {
        let store = Arc::new(MemoryStore::new());
        store.migration_add("other-1");
        store.migration_add("other-2");
        let metrics = Arc::new(CaptureMetrics::default());
        let mut provider = MockProvider::new();
        provider.expect_get_host().never();
        provider.expect_migrate().never();

        let coord = coordinator(store.clone(), provider, metrics.clone(), Some(2));
        coord.evaluate("ci", "ci-abc123").await.unwrap();

        assert_eq!(metrics.count("migrate.declined"), 1);
        assert_eq!(store.migration_len(), 2);
    }

    #[tokio::test]
    async fn test_same_host_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(CaptureMetrics::default());
        let mut provider = MockProvider::new();
        provider.expect_get_host().returning(|_, _| Ok("host-a".to_string()));
        provider
            .expect_least_used_compatible_host()
            .returning(|_, _| Ok("host-a".to_string()));
        provider.expect_migrate().never();

        let coord = coordinator(store.clone(), provider, metrics, Some(4));
        coord.evaluate("ci", "ci-abc123").await.unwrap();
        assert_eq!(store.migration_len(), 0);
    }

    #[tokio::test]
    async fn test_migrates_and_updates_record() {
        let store = Arc::new(MemoryStore::new());
        let mut record = VmRecord::new("ci", "ubuntu-2404", "ci-abc123");
        record.checked_out_at = Some(Utc::now());
        store.put_record(&record);

        let metrics = Arc::new(CaptureMetrics::default());
        let mut provider = MockProvider::new();
        provider.expect_get_host().returning(|_, _| Ok("host-a".to_string()));
        provider
            .expect_least_used_compatible_host()
            .returning(|_, _| Ok("host-b".to_string()));
        provider.expect_migrate().times(1).returning(|_, _| Ok(()));

        let coord = coordinator(store.clone(), provider, metrics.clone(), Some(4));
        coord.evaluate("ci", "ci-abc123").await.unwrap();

        let updated = store.get_record("ci", "ci-abc123").unwrap();
        assert_eq!(updated.host.as_deref(), Some("host-b"));
        assert!(updated.last_migration_secs.is_some());
        assert_eq!(metrics.count("migrate.completed"), 1);
        assert_eq!(store.migration_len(), 0);
    }

    #[tokio::test]
    async fn test_failure_still_clears_global_set() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(CaptureMetrics::default());
        let mut provider = MockProvider::new();
        provider.expect_get_host().returning(|_, _| Ok("host-a".to_string()));
        provider
            .expect_least_used_compatible_host()
            .returning(|_, _| Ok("host-b".to_string()));
        provider
            .expect_migrate()
            .returning(|_, _| Err(Error::Provider("migration refused".into())));

        let coord = coordinator(store.clone(), provider, metrics, Some(4));
        assert!(coord.evaluate("ci", "ci-abc123").await.is_err());
        assert_eq!(store.migration_len(), 0);
    }
}
