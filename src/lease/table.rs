// src/lease/table.rs

//! In-process lease table

use super::{LeaseArbiter, LeaseHolder, ResourceKey};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Lease arbiter backed by a mutex-guarded map
///
/// Waiters park on a condition variable and are woken on every release.
#[derive(Debug, Default)]
pub struct ProcessLeaseTable {
    leases: Mutex<HashMap<ResourceKey, LeaseHolder>>,
    released: Condvar,
}

static GLOBAL_TABLE: OnceLock<Arc<ProcessLeaseTable>> = OnceLock::new();

impl ProcessLeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-lifetime table shared by every default manager
    pub fn global() -> Arc<ProcessLeaseTable> {
        Arc::clone(GLOBAL_TABLE.get_or_init(|| Arc::new(ProcessLeaseTable::new())))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceKey, LeaseHolder>> {
        // Critical sections are single insert/remove calls; a poisoned map
        // is still consistent.
        self.leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LeaseArbiter for ProcessLeaseTable {
    fn try_claim(&self, key: &ResourceKey, holder: &LeaseHolder) -> bool {
        let mut leases = self.lock();
        if leases.contains_key(key) {
            return false;
        }
        leases.insert(key.clone(), holder.clone());
        true
    }

    fn claim_wait(&self, key: &ResourceKey, holder: &LeaseHolder, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut leases = self.lock();

        while leases.contains_key(key) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            leases = match self.released.wait_timeout(leases, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        leases.insert(key.clone(), holder.clone());
        true
    }

    fn release(&self, key: &ResourceKey, lease_id: Uuid) -> bool {
        let mut leases = self.lock();
        let held = leases.get(key).is_some_and(|h| h.lease_id == lease_id);
        if held {
            leases.remove(key);
            self.released.notify_all();
        }
        held
    }

    fn holder(&self, key: &ResourceKey) -> Option<LeaseHolder> {
        self.lock().get(key).cloned()
    }

    fn held(&self) -> Vec<(ResourceKey, LeaseHolder)> {
        let mut held: Vec<_> = self
            .lock()
            .iter()
            .map(|(k, h)| (k.clone(), h.clone()))
            .collect();
        held.sort_by(|a, b| a.0.cmp(&b.0));
        held
    }
}
