//! VM record model
//!
//! One record per VM, keyed by hostname. The reconciler that cloned a VM
//! owns the record exclusively until checkout; afterwards the external
//! API writes the tag and lifetime-override fields while the reconciler
//! keeps writing the lifecycle timestamps. The two sides touch disjoint
//! fields, so no coordination is needed beyond the store itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::config::PoolConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    /// Hostname, which is also the record key.
    pub name: String,
    /// Pool this VM was cloned for.
    pub pool: String,
    /// Template the clone was taken from.
    pub template: String,
    pub clone_started_at: DateTime<Utc>,
    /// Set when the VM first reports ready.
    pub booted_at: Option<DateTime<Utc>>,
    /// Refreshed on every ready/running evaluation.
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Set by the external API at checkout.
    pub checked_out_at: Option<DateTime<Utc>>,
    /// Hypervisor host currently running this VM.
    pub host: Option<String>,
    /// Attached disks, in attach order.
    #[serde(default)]
    pub disks: Vec<String>,
    #[serde(default)]
    pub snapshots: BTreeSet<String>,
    pub migration_started_at: Option<DateTime<Utc>>,
    /// Duration of the most recent completed migration.
    pub last_migration_secs: Option<f64>,
    /// Per-VM lifetime override, written by the external API.
    pub lifetime_secs: Option<u64>,
    /// Free-form tags, written by the external API.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl VmRecord {
    pub fn new(pool: impl Into<String>, template: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool: pool.into(),
            template: template.into(),
            clone_started_at: Utc::now(),
            booted_at: None,
            last_checked_at: None,
            checked_out_at: None,
            host: None,
            disks: Vec::new(),
            snapshots: BTreeSet::new(),
            migration_started_at: None,
            last_migration_secs: None,
            lifetime_secs: None,
            tags: BTreeMap::new(),
        }
    }

    /// Effective lifetime: per-VM override, then pool, then global default.
    pub fn lifetime(&self, pool: &PoolConfig, global_default: Duration) -> Duration {
        self.lifetime_secs
            .or(pool.lifetime_secs)
            .map(Duration::from_secs)
            .unwrap_or(global_default)
    }

    /// Time since clone start.
    pub fn provisioning_elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.clone_started_at).to_std().unwrap_or_default()
    }

    /// Time since the VM entered the ready queue. Falls back to clone
    /// start when the boot timestamp was never recorded.
    pub fn ready_elapsed(&self, now: DateTime<Utc>) -> Duration {
        let basis = self.booted_at.unwrap_or(self.clone_started_at);
        (now - basis).to_std().unwrap_or_default()
    }

    /// Time since checkout. Falls back to boot, then clone start, for
    /// records that ended up in `running` without a checkout timestamp.
    pub fn checkout_elapsed(&self, now: DateTime<Utc>) -> Duration {
        let basis = self
            .checked_out_at
            .or(self.booted_at)
            .unwrap_or(self.clone_started_at);
        (now - basis).to_std().unwrap_or_default()
    }
}
