//! Keyed read/write locks. Each key gets its own lock on first use and the
//! entry is dropped again once nobody holds or waits for it.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type Partitions = Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>;

#[derive(Clone, Default)]
pub struct PartitionLocker {
    partitions: Partitions,
}

impl fmt::Debug for PartitionLocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionLocker")
            .field("active", &self.active())
            .finish()
    }
}

/// A claim on one partition, held while waiting for its lock and while
/// holding it. The last claim to go retires the partition.
struct Lease {
    partitions: Partitions,
    key: String,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut partitions = self.partitions.lock();
        if let Some(lock) = partitions.get(&self.key) {
            // only the map itself still references the lock
            if Arc::strong_count(lock) == 1 {
                partitions.remove(&self.key);
            }
        }
    }
}

/// Holds one partition's lock; releasing it may retire the partition.
pub struct PartitionGuard<G> {
    // dropped before the lease
    _guard: G,
    _lease: Lease,
}

pub type PartitionReadGuard = PartitionGuard<OwnedRwLockReadGuard<()>>;
pub type PartitionWriteGuard = PartitionGuard<OwnedRwLockWriteGuard<()>>;

impl PartitionLocker {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, key: &str) -> (Lease, Arc<RwLock<()>>) {
        let mut partitions = self.partitions.lock();
        let lock = Arc::clone(partitions.entry(key.to_string()).or_default());
        let lease = Lease {
            partitions: Arc::clone(&self.partitions),
            key: key.to_string(),
        };
        (lease, lock)
    }

    pub async fn read(&self, key: &str) -> PartitionReadGuard {
        let (lease, lock) = self.partition(key);
        let guard = lock.read_owned().await;
        PartitionGuard {
            _guard: guard,
            _lease: lease,
        }
    }

    pub async fn write(&self, key: &str) -> PartitionWriteGuard {
        let (lease, lock) = self.partition(key);
        let guard = lock.write_owned().await;
        PartitionGuard {
            _guard: guard,
            _lease: lease,
        }
    }

    /// Number of partitions currently held or awaited.
    pub fn active(&self) -> usize {
        self.partitions.lock().len()
    }
}
