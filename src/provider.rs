//! Compute provider capability interface
//!
//! One explicit trait covering everything the core asks a backend to do.
//! Backends are selected by name at startup and fail loudly at
//! construction when unknown; there is no duck typing across provider
//! flavors. Every method is expected to finish within the deadline the
//! caller wraps it in.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    On,
    Off,
    Suspended,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::On => write!(f, "on"),
            PowerState::Off => write!(f, "off"),
            PowerState::Suspended => write!(f, "suspended"),
        }
    }
}

/// What a backend reports about one VM.
#[derive(Debug, Clone)]
pub struct VmInfo {
    pub name: String,
    /// Hostname the guest reports; must match `name` for a healthy VM.
    pub hostname: String,
    pub power_state: PowerState,
    /// Hypervisor host currently running the VM.
    pub host: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// All VMs physically belonging to the pool, managed or not.
    async fn list_inventory(&self, pool: &str) -> Result<Vec<String>>;

    async fn get_vm(&self, pool: &str, name: &str) -> Result<Option<VmInfo>>;

    async fn create_vm(&self, pool: &str, name: &str) -> Result<VmInfo>;

    async fn destroy_vm(&self, pool: &str, name: &str) -> Result<()>;

    /// Whether a pending VM has finished provisioning.
    async fn is_ready(&self, pool: &str, name: &str) -> Result<bool>;

    async fn get_host(&self, pool: &str, name: &str) -> Result<String>;

    /// Least-used host whose CPU architecture is compatible with the
    /// VM's current host.
    async fn least_used_compatible_host(&self, pool: &str, name: &str) -> Result<String>;

    async fn migrate(&self, name: &str, dest_host: &str) -> Result<()>;

    /// Attach a new disk; returns the backend's identifier for it.
    async fn create_disk(&self, pool: &str, name: &str, size_gb: u32) -> Result<String>;

    async fn create_snapshot(&self, pool: &str, name: &str, snapshot: &str) -> Result<()>;

    async fn revert_snapshot(&self, pool: &str, name: &str, snapshot: &str) -> Result<()>;
}

/// Build a provider by backend name. Unknown names are a construction
/// error, not a call-time surprise.
pub fn from_name(name: &str) -> Result<Arc<dyn Provider>> {
    match name {
        "stub" => Ok(Arc::new(StubProvider::new())),
        other => Err(Error::UnknownBackend(other.to_string())),
    }
}

#[derive(Default)]
struct StubInner {
    vms: HashMap<String, VmInfo>,
    ready: HashSet<String>,
    disk_seq: u32,
}

/// In-process fake backend for local runs and demos. All state lives
/// behind one lock; VMs become ready on the first readiness poll.
#[derive(Default)]
pub struct StubProvider {
    inner: Mutex<StubInner>,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Provider for StubProvider {
    async fn list_inventory(&self, pool: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let prefix = format!("{pool}-");
        Ok(inner
            .vms
            .keys()
            .filter(|n| n.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn get_vm(&self, _pool: &str, name: &str) -> Result<Option<VmInfo>> {
        Ok(self.inner.lock().vms.get(name).cloned())
    }

    async fn create_vm(&self, _pool: &str, name: &str) -> Result<VmInfo> {
        let info = VmInfo {
            name: name.to_string(),
            hostname: name.to_string(),
            power_state: PowerState::On,
            host: "stub-host-1".to_string(),
        };
        self.inner.lock().vms.insert(name.to_string(), info.clone());
        Ok(info)
    }

    async fn destroy_vm(&self, _pool: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ready.remove(name);
        match inner.vms.remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::VmNotFound(name.to_string())),
        }
    }

    async fn is_ready(&self, _pool: &str, name: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.vms.contains_key(name) {
            return Err(Error::VmNotFound(name.to_string()));
        }
        Ok(!inner.ready.insert(name.to_string()))
    }

    async fn get_host(&self, _pool: &str, name: &str) -> Result<String> {
        self.inner
            .lock()
            .vms
            .get(name)
            .map(|vm| vm.host.clone())
            .ok_or_else(|| Error::VmNotFound(name.to_string()))
    }

    async fn least_used_compatible_host(&self, _pool: &str, _name: &str) -> Result<String> {
        Ok("stub-host-1".to_string())
    }

    async fn migrate(&self, name: &str, dest_host: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.vms.get_mut(name) {
            Some(vm) => {
                vm.host = dest_host.to_string();
                Ok(())
            }
            None => Err(Error::VmNotFound(name.to_string())),
        }
    }

    async fn create_disk(&self, _pool: &str, name: &str, size_gb: u32) -> Result<String> {
        let mut inner = self.inner.lock();
        if !inner.vms.contains_key(name) {
            return Err(Error::VmNotFound(name.to_string()));
        }
        inner.disk_seq += 1;
        Ok(format!("disk-{}-{}gb", inner.disk_seq, size_gb))
    }

    async fn create_snapshot(&self, _pool: &str, name: &str, _snapshot: &str) -> Result<()> {
        if self.inner.lock().vms.contains_key(name) {
            Ok(())
        } else {
            Err(Error::VmNotFound(name.to_string()))
        }
    }

    async fn revert_snapshot(&self, _pool: &str, name: &str, _snapshot: &str) -> Result<()> {
        if self.inner.lock().vms.contains_key(name) {
            Ok(())
        } else {
            Err(Error::VmNotFound(name.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_backend_fails_at_construction() {
        assert!(matches!(from_name("vsphere"), Err(Error::UnknownBackend(_))));
        assert!(from_name("stub").is_ok());
    }

    #[tokio::test]
    async fn test_stub_lifecycle() {
        let provider = StubProvider::new();
        provider.create_vm("ci", "ci-abc123").await.unwrap();

        assert_eq!(provider.list_inventory("ci").await.unwrap(), vec!["ci-abc123".to_string()]);
        // first poll warms it, second reports ready
        assert!(!provider.is_ready("ci", "ci-abc123").await.unwrap());
        assert!(provider.is_ready("ci", "ci-abc123").await.unwrap());

        provider.destroy_vm("ci", "ci-abc123").await.unwrap();
        assert!(provider.get_vm("ci", "ci-abc123").await.unwrap().is_none());
        assert!(provider.destroy_vm("ci", "ci-abc123").await.is_err());
    }
}
