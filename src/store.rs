//! Shared state store
//!
//! Queue-set membership, VM records, counters and task queues. The trait
//! exposes exactly the primitives the reconciliation core needs; any
//! set-capable KV backend can implement it. `MemoryStore` keeps the whole
//! state behind a single lock so queue moves are atomic: a VM name is in
//! at most one of the five primary sets at any observable instant.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::models::VmRecord;

/// The five primary lifecycle sets, one instance of each per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueSet {
    Discovered,
    Pending,
    Ready,
    Running,
    Completed,
}

impl QueueSet {
    pub const ALL: [QueueSet; 5] = [
        QueueSet::Discovered,
        QueueSet::Pending,
        QueueSet::Ready,
        QueueSet::Running,
        QueueSet::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueSet::Discovered => "discovered",
            QueueSet::Pending => "pending",
            QueueSet::Ready => "ready",
            QueueSet::Running => "running",
            QueueSet::Completed => "completed",
        }
    }
}

impl std::fmt::Display for QueueSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Disk-attach work item consumed by the disk queue worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskTask {
    pub pool: String,
    pub vm: String,
    pub size_gb: u32,
}

/// Snapshot work item consumed by the snapshot queue worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotTask {
    Create { pool: String, vm: String, name: String },
    Revert { pool: String, vm: String, name: String },
}

impl SnapshotTask {
    pub fn target(&self) -> (&str, &str) {
        match self {
            SnapshotTask::Create { pool, vm, .. } | SnapshotTask::Revert { pool, vm, .. } => {
                (pool, vm)
            }
        }
    }
}

pub trait Store: Send + Sync {
    /// Atomically move a VM between primary sets. Returns false when the
    /// VM was not in `from` (someone else already moved it).
    fn move_vm(&self, pool: &str, from: QueueSet, to: QueueSet, name: &str) -> bool;

    /// Add a VM to a primary set. Returns false when the name is already
    /// in any primary set for this pool.
    fn add_vm(&self, pool: &str, set: QueueSet, name: &str) -> bool;

    fn remove_vm(&self, pool: &str, set: QueueSet, name: &str) -> bool;

    fn members(&self, pool: &str, set: QueueSet) -> Vec<String>;

    fn len(&self, pool: &str, set: QueueSet) -> usize;

    // Per-pool migration overlay, independent of the primary sets.
    fn add_migrating(&self, pool: &str, name: &str);
    fn remove_migrating(&self, pool: &str, name: &str) -> bool;
    fn migrating(&self, pool: &str) -> Vec<String>;

    // Global set of VMs currently under migration evaluation.
    fn migration_add(&self, name: &str) -> bool;
    fn migration_remove(&self, name: &str) -> bool;
    fn migration_len(&self) -> usize;

    fn get_record(&self, pool: &str, name: &str) -> Option<VmRecord>;
    fn put_record(&self, record: &VmRecord);
    fn delete_record(&self, pool: &str, name: &str);
    /// Keep the record readable for `ttl`, then drop it.
    fn expire_record(&self, pool: &str, name: &str, ttl: Duration);

    /// Checkout requests waiting at the API, maintained externally.
    fn pending_requests(&self, pool: &str) -> u64;
    fn set_pending_requests(&self, pool: &str, count: u64);
    fn incr_pending_requests(&self, pool: &str) -> u64;
    /// Decrement with a floor of zero.
    fn decr_pending_requests(&self, pool: &str) -> u64;

    /// Auto-scaler target size persistence.
    fn target_size(&self, pool: &str) -> Option<u32>;
    fn set_target_size(&self, pool: &str, size: u32);

    fn push_disk_task(&self, task: DiskTask);
    fn pop_disk_task(&self) -> Option<DiskTask>;
    fn push_snapshot_task(&self, task: SnapshotTask);
    fn pop_snapshot_task(&self) -> Option<SnapshotTask>;
}

#[derive(Default)]
struct PoolSets {
    discovered: HashSet<String>,
    pending: HashSet<String>,
    ready: HashSet<String>,
    running: HashSet<String>,
    completed: HashSet<String>,
    migrating: HashSet<String>,
}

impl PoolSets {
    fn set(&self, set: QueueSet) -> &HashSet<String> {
        match set {
            QueueSet::Discovered => &self.discovered,
            QueueSet::Pending => &self.pending,
            QueueSet::Ready => &self.ready,
            QueueSet::Running => &self.running,
            QueueSet::Completed => &self.completed,
        }
    }

    fn set_mut(&mut self, set: QueueSet) -> &mut HashSet<String> {
        match set {
            QueueSet::Discovered => &mut self.discovered,
            QueueSet::Pending => &mut self.pending,
            QueueSet::Ready => &mut self.ready,
            QueueSet::Running => &mut self.running,
            QueueSet::Completed => &mut self.completed,
        }
    }

    fn tracked(&self, name: &str) -> bool {
        QueueSet::ALL.iter().any(|s| self.set(*s).contains(name))
    }
}

struct StoredRecord {
    record: VmRecord,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    pools: HashMap<String, PoolSets>,
    migration: HashSet<String>,
    records: HashMap<(String, String), StoredRecord>,
    pending_requests: HashMap<String, u64>,
    target_sizes: HashMap<String, u32>,
    disk_tasks: VecDeque<DiskTask>,
    snapshot_tasks: VecDeque<SnapshotTask>,
}

/// In-memory store, also the reference implementation for tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn move_vm(&self, pool: &str, from: QueueSet, to: QueueSet, name: &str) -> bool {
        let mut inner = self.inner.write();
        let sets = inner.pools.entry(pool.to_string()).or_default();
        if !sets.set_mut(from).remove(name) {
            return false;
        }
        sets.set_mut(to).insert(name.to_string());
        true
    }

    fn add_vm(&self, pool: &str, set: QueueSet, name: &str) -> bool {
        let mut inner = self.inner.write();
        let sets = inner.pools.entry(pool.to_string()).or_default();
        if sets.tracked(name) {
            return false;
        }
        sets.set_mut(set).insert(name.to_string())
    }

    fn remove_vm(&self, pool: &str, set: QueueSet, name: &str) -> bool {
        let mut inner = self.inner.write();
        inner
            .pools
            .get_mut(pool)
            .map(|sets| sets.set_mut(set).remove(name))
            .unwrap_or(false)
    }

    fn members(&self, pool: &str, set: QueueSet) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .pools
            .get(pool)
            .map(|sets| sets.set(set).iter().cloned().collect())
            .unwrap_or_default()
    }

    fn len(&self, pool: &str, set: QueueSet) -> usize {
        let inner = self.inner.read();
        inner.pools.get(pool).map(|sets| sets.set(set).len()).unwrap_or(0)
    }

    fn add_migrating(&self, pool: &str, name: &str) {
        let mut inner = self.inner.write();
        inner
            .pools
            .entry(pool.to_string())
            .or_default()
            .migrating
            .insert(name.to_string());
    }

    fn remove_migrating(&self, pool: &str, name: &str) -> bool {
        let mut inner = self.inner.write();
        inner
            .pools
            .get_mut(pool)
            .map(|sets| sets.migrating.remove(name))
            .unwrap_or(false)
    }

    fn migrating(&self, pool: &str) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .pools
            .get(pool)
            .map(|sets| sets.migrating.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn migration_add(&self, name: &str) -> bool {
        self.inner.write().migration.insert(name.to_string())
    }

    fn migration_remove(&self, name: &str) -> bool {
        self.inner.write().migration.remove(name)
    }

    fn migration_len(&self) -> usize {
        self.inner.read().migration.len()
    }

    fn get_record(&self, pool: &str, name: &str) -> Option<VmRecord> {
        let key = (pool.to_string(), name.to_string());
        {
            let inner = self.inner.read();
            match inner.records.get(&key) {
                Some(stored) if stored.expires_at.map_or(true, |t| t > Instant::now()) => {
                    return Some(stored.record.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // expired, drop lazily
        self.inner.write().records.remove(&key);
        None
    }

    fn put_record(&self, record: &VmRecord) {
        let key = (record.pool.clone(), record.name.clone());
        self.inner.write().records.insert(
            key,
            StoredRecord { record: record.clone(), expires_at: None },
        );
    }

    fn delete_record(&self, pool: &str, name: &str) {
        self.inner
            .write()
            .records
            .remove(&(pool.to_string(), name.to_string()));
    }

    fn expire_record(&self, pool: &str, name: &str, ttl: Duration) {
        let mut inner = self.inner.write();
        if let Some(stored) = inner.records.get_mut(&(pool.to_string(), name.to_string())) {
            stored.expires_at = Some(Instant::now() + ttl);
        }
    }

    fn pending_requests(&self, pool: &str) -> u64 {
        self.inner.read().pending_requests.get(pool).copied().unwrap_or(0)
    }

    fn set_pending_requests(&self, pool: &str, count: u64) {
        self.inner.write().pending_requests.insert(pool.to_string(), count);
    }

    fn incr_pending_requests(&self, pool: &str) -> u64 {
        let mut inner = self.inner.write();
        let count = inner.pending_requests.entry(pool.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn decr_pending_requests(&self, pool: &str) -> u64 {
        let mut inner = self.inner.write();
        let count = inner.pending_requests.entry(pool.to_string()).or_insert(0);
        *count = count.saturating_sub(1);
        *count
    }

    fn target_size(&self, pool: &str) -> Option<u32> {
        self.inner.read().target_sizes.get(pool).copied()
    }

    fn set_target_size(&self, pool: &str, size: u32) {
        self.inner.write().target_sizes.insert(pool.to_string(), size);
    }

    fn push_disk_task(&self, task: DiskTask) {
        self.inner.write().disk_tasks.push_back(task);
    }

    fn pop_disk_task(&self) -> Option<DiskTask> {
        self.inner.write().disk_tasks.pop_front()
    }

    fn push_snapshot_task(&self, task: SnapshotTask) {
        self.inner.write().snapshot_tasks.push_back(task);
    }

    fn pop_snapshot_task(&self) -> Option<SnapshotTask> {
        self.inner.write().snapshot_tasks.pop_front()
    }
}
