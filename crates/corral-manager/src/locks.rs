//! Per-resource lock table.
//!
//! Coarse mutual exclusion keyed by resource id: every mutating
//! state-machine operation holds the entry for its full duration,
//! including operator I/O. Entries are created lazily on first
//! acquisition and reaped once they outlive `max_age`; a reaped entry
//! that is still locked stays alive through its `Arc` until the holder
//! drops it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Holding a resource lock longer than this draws a warning at unlock.
const HOLD_WARN: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct LockEntry {
    created_at: Instant,
    mutex: Arc<Mutex<()>>,
}

/// Guard for one resource id. Dropping it releases the lock and logs a
/// diagnostic if the hold time was excessive.
pub struct ResourceGuard {
    resource_id: String,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        let held = self.acquired_at.elapsed();
        if held > HOLD_WARN {
            warn!(resource_id = %self.resource_id, held = ?held, "resource lock held for too long");
        }
        debug!(resource_id = %self.resource_id, "unlock resource");
    }
}

/// Two-level lock table: an outer `RwLock` protects the map, each entry
/// carries its own async mutex.
pub struct LockTable {
    entries: RwLock<HashMap<String, LockEntry>>,
    max_age: Duration,
}

impl LockTable {
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_age,
        }
    }

    /// Acquire the lock for `resource_id`, creating the entry lazily.
    pub async fn acquire(&self, resource_id: &str) -> ResourceGuard {
        let mutex = {
            let entries = self.entries.read().unwrap();
            entries.get(resource_id).map(|e| Arc::clone(&e.mutex))
        };

        let mutex = match mutex {
            Some(m) => m,
            None => {
                let mut entries = self.entries.write().unwrap();
                let entry = entries.entry(resource_id.to_string()).or_insert_with(|| {
                    debug!(%resource_id, "create resource lock");
                    LockEntry {
                        created_at: Instant::now(),
                        mutex: Arc::new(Mutex::new(())),
                    }
                });
                Arc::clone(&entry.mutex)
            }
        };

        let guard = mutex.lock_owned().await;
        debug!(%resource_id, "lock resource");
        ResourceGuard {
            resource_id: resource_id.to_string(),
            acquired_at: Instant::now(),
            _guard: guard,
        }
    }

    /// Reap entries older than `max_age`. Returns how many were removed.
    pub fn clean(&self) -> usize {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        let max_age = self.max_age;
        entries.retain(|_, e| e.created_at.elapsed() < max_age);
        before - entries.len()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
