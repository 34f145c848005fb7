//! Pool and daemon configuration with builder helpers
//!
//! Settings are loaded from a JSON file and validated before any
//! reconciler is started; malformed pool configuration never reaches
//! the core loop.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::breaker::BreakerConfig;
use crate::timeout::AdaptiveTimeoutConfig;
use crate::{Error, Result};

/// Top-level daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Process-wide cap on concurrent clone operations.
    #[serde(default = "defaults::task_limit")]
    pub task_limit: usize,
    /// Cluster-wide cap on concurrent migration evaluations. `None` or 0
    /// makes migration evaluation purely informational.
    #[serde(default)]
    pub migration_limit: Option<u32>,
    /// Default lifetime of a checked-out VM.
    #[serde(default = "defaults::vm_lifetime_secs")]
    pub vm_lifetime_secs: u64,
    /// Default TTL for VMs sitting in the ready queue. `None` disables
    /// ready-queue expiry.
    #[serde(default)]
    pub ready_ttl_secs: Option<u64>,
    /// Default bound on clone-start to ready.
    #[serde(default = "defaults::provisioning_timeout_secs")]
    pub provisioning_timeout_secs: u64,
    /// How long destroyed-VM metadata stays around for historical lookups.
    #[serde(default = "defaults::vm_retention_ttl_secs")]
    pub vm_retention_ttl_secs: u64,
    /// Sleep between reconciliation passes.
    #[serde(default = "defaults::reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Sleep between supervisor worker health checks.
    #[serde(default = "defaults::check_interval_secs")]
    pub check_interval_secs: u64,
    /// Bound on the ready-VM liveness probe.
    #[serde(default = "defaults::probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Fixed bound for provider calls not covered by adaptive tuning
    /// (migration, disk and snapshot tasks).
    #[serde(default = "defaults::fixed_call_timeout_secs")]
    pub fixed_call_timeout_secs: u64,
    #[serde(default)]
    pub adaptive_timeout: AdaptiveTimeoutConfig,
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

mod defaults {
    pub fn task_limit() -> usize {
        10
    }
    pub fn vm_lifetime_secs() -> u64 {
        12 * 3600
    }
    pub fn provisioning_timeout_secs() -> u64 {
        15 * 60
    }
    pub fn vm_retention_ttl_secs() -> u64 {
        15 * 60
    }
    pub fn reconcile_interval_secs() -> u64 {
        5
    }
    pub fn check_interval_secs() -> u64 {
        1
    }
    pub fn probe_timeout_secs() -> u64 {
        5
    }
    pub fn fixed_call_timeout_secs() -> u64 {
        120
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            task_limit: defaults::task_limit(),
            migration_limit: None,
            vm_lifetime_secs: defaults::vm_lifetime_secs(),
            ready_ttl_secs: None,
            provisioning_timeout_secs: defaults::provisioning_timeout_secs(),
            vm_retention_ttl_secs: defaults::vm_retention_ttl_secs(),
            reconcile_interval_secs: defaults::reconcile_interval_secs(),
            check_interval_secs: defaults::check_interval_secs(),
            probe_timeout_secs: defaults::probe_timeout_secs(),
            fixed_call_timeout_secs: defaults::fixed_call_timeout_secs(),
            adaptive_timeout: AdaptiveTimeoutConfig::default(),
            circuit_breaker: BreakerConfig::default(),
            pools: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&raw)?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.task_limit == 0 {
            return Err(Error::Config("task_limit must be at least 1".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for pool in &self.pools {
            pool.validate()?;
            if !seen.insert(pool.name.as_str()) {
                return Err(Error::Config(format!("duplicate pool name: {}", pool.name)));
            }
        }
        Ok(())
    }

    pub fn vm_lifetime(&self) -> Duration {
        Duration::from_secs(self.vm_lifetime_secs)
    }

    pub fn ready_ttl(&self) -> Option<Duration> {
        self.ready_ttl_secs.map(Duration::from_secs)
    }

    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioning_timeout_secs)
    }

    pub fn vm_retention_ttl(&self) -> Duration {
        Duration::from_secs(self.vm_retention_ttl_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn fixed_call_timeout(&self) -> Duration {
        Duration::from_secs(self.fixed_call_timeout_secs)
    }
}

/// Configuration for one VM pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    /// Template the pool clones from.
    pub template: String,
    /// Initial target size; the auto-scaler may adjust it at runtime.
    pub size: u32,
    /// Placement target, reserved for backends that support it.
    #[serde(default)]
    pub host_group: Option<String>,
    /// Overrides the global checked-out lifetime.
    #[serde(default)]
    pub lifetime_secs: Option<u64>,
    /// Overrides the global ready-queue TTL.
    #[serde(default)]
    pub ready_ttl_secs: Option<u64>,
    /// Overrides the global provisioning timeout.
    #[serde(default)]
    pub provisioning_timeout_secs: Option<u64>,
    /// Port probed to confirm a ready VM is actually reachable.
    #[serde(default = "pool_defaults::probe_port")]
    pub probe_port: u16,
    /// Static clone concurrency used when rate provisioning is disabled.
    #[serde(default = "pool_defaults::clone_target_concurrency")]
    pub clone_target_concurrency: usize,
    #[serde(default)]
    pub auto_scale: AutoScaleConfig,
    #[serde(default)]
    pub rate_provisioning: RateProvisioningConfig,
}

mod pool_defaults {
    pub fn probe_port() -> u16 {
        22
    }
    pub fn clone_target_concurrency() -> usize {
        2
    }
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            size: 0,
            host_group: None,
            lifetime_secs: None,
            ready_ttl_secs: None,
            provisioning_timeout_secs: None,
            probe_port: pool_defaults::probe_port(),
            clone_target_concurrency: pool_defaults::clone_target_concurrency(),
            auto_scale: AutoScaleConfig::default(),
            rate_provisioning: RateProvisioningConfig::default(),
        }
    }

    pub fn size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    pub fn lifetime(mut self, d: Duration) -> Self {
        self.lifetime_secs = Some(d.as_secs());
        self
    }

    pub fn ready_ttl(mut self, d: Duration) -> Self {
        self.ready_ttl_secs = Some(d.as_secs());
        self
    }

    pub fn provisioning_timeout(mut self, d: Duration) -> Self {
        self.provisioning_timeout_secs = Some(d.as_secs());
        self
    }

    pub fn auto_scale(mut self, auto_scale: AutoScaleConfig) -> Self {
        self.auto_scale = auto_scale;
        self
    }

    pub fn rate_provisioning(mut self, rate: RateProvisioningConfig) -> Self {
        self.rate_provisioning = rate;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("pool name cannot be empty".into()));
        }
        if self.template.is_empty() {
            return Err(Error::Config(format!("pool {}: template cannot be empty", self.name)));
        }
        self.auto_scale.validate(&self.name)?;
        self.rate_provisioning.validate(&self.name)?;
        Ok(())
    }
}

/// Demand-driven pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoScaleConfig {
    pub enabled: bool,
    pub min_size: u32,
    pub max_size: u32,
    /// Percent of ready VMs below which the pool grows.
    pub scale_up_threshold: u8,
    /// Percent of ready VMs above which the pool shrinks.
    pub scale_down_threshold: u8,
    pub cooldown_period_secs: u64,
}

impl Default for AutoScaleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_size: 1,
            max_size: 50,
            scale_up_threshold: 20,
            scale_down_threshold: 80,
            cooldown_period_secs: 300,
        }
    }
}

impl AutoScaleConfig {
    pub fn cooldown_period(&self) -> Duration {
        Duration::from_secs(self.cooldown_period_secs)
    }

    fn validate(&self, pool: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.min_size > self.max_size {
            return Err(Error::Config(format!("pool {pool}: min_size exceeds max_size")));
        }
        if self.scale_up_threshold == 0 || self.scale_up_threshold > 100 {
            return Err(Error::Config(format!(
                "pool {pool}: scale_up_threshold must be within 1..=100"
            )));
        }
        if self.scale_down_threshold == 0 || self.scale_down_threshold > 100 {
            return Err(Error::Config(format!(
                "pool {pool}: scale_down_threshold must be within 1..=100"
            )));
        }
        if self.scale_up_threshold >= self.scale_down_threshold {
            return Err(Error::Config(format!(
                "pool {pool}: scale_up_threshold must be below scale_down_threshold"
            )));
        }
        Ok(())
    }
}

/// Demand-driven clone concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateProvisioningConfig {
    pub enabled: bool,
    pub normal_concurrency: usize,
    pub high_demand_concurrency: usize,
    /// Pending external requests at which the pool enters high-demand mode.
    pub queue_depth_threshold: u64,
}

impl Default for RateProvisioningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            normal_concurrency: 2,
            high_demand_concurrency: 6,
            queue_depth_threshold: 5,
        }
    }
}

impl RateProvisioningConfig {
    fn validate(&self, pool: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.normal_concurrency == 0 {
            return Err(Error::Config(format!("pool {pool}: normal_concurrency must be at least 1")));
        }
        if self.high_demand_concurrency < self.normal_concurrency {
            return Err(Error::Config(format!(
                "pool {pool}: high_demand_concurrency below normal_concurrency"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scaled_pool() -> PoolConfig {
        PoolConfig::new("acceptance", "debian-12").size(5).auto_scale(AutoScaleConfig {
            enabled: true,
            ..AutoScaleConfig::default()
        })
    }

    #[test]
    fn test_pool_builder() {
        let pool = PoolConfig::new("ci", "ubuntu-2404")
            .size(10)
            .lifetime(Duration::from_secs(3600))
            .provisioning_timeout(Duration::from_secs(900));

        assert_eq!(pool.name, "ci");
        assert_eq!(pool.size, 10);
        assert_eq!(pool.lifetime_secs, Some(3600));
        assert_eq!(pool.probe_port, 22);
        assert_eq!(pool.clone_target_concurrency, 2);
        assert!(pool.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_thresholds() {
        let mut pool = scaled_pool();
        pool.auto_scale.scale_up_threshold = 90;
        pool.auto_scale.scale_down_threshold = 80;
        assert!(pool.validate().is_err());

        let mut pool = scaled_pool();
        pool.auto_scale.min_size = 60;
        assert!(pool.validate().is_err());

        let mut pool = scaled_pool();
        pool.rate_provisioning.enabled = true;
        pool.rate_provisioning.high_demand_concurrency = 1;
        assert!(pool.validate().is_err());
    }

    #[test]
    fn test_duplicate_pool_names_rejected() {
        let settings = Settings {
            pools: vec![
                PoolConfig::new("ci", "ubuntu-2404").size(2),
                PoolConfig::new("ci", "debian-12").size(3),
            ],
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "task_limit": 4,
                "pools": [
                    {{"name": "ci", "template": "ubuntu-2404", "size": 3}}
                ]
            }}"#
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.task_limit, 4);
        assert_eq!(settings.pools.len(), 1);
        assert_eq!(settings.pools[0].size, 3);
        // defaults fill in everything else
        assert_eq!(settings.reconcile_interval(), Duration::from_secs(5));
        assert!(settings.validate().is_ok());
    }
}
