// src/lease/scope.rs

//! Stack of nested leases released in reverse acquisition order

use super::{Lease, ReleaseStatus, ResourceKey};

/// Nested scoped acquisitions
///
/// `mount → load SOFTWARE → load SYSTEM` is pushed in that order and torn
/// down as `SYSTEM → SOFTWARE → mount`, on every exit path (dropping the
/// stack releases whatever is still held).
#[derive(Debug, Default)]
pub struct ScopeStack {
    entries: Vec<Lease>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, lease: Lease) {
        self.entries.push(lease);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.entries.iter().any(|l| l.key() == key)
    }

    /// Keys currently held, outermost first
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.entries.iter().map(|l| l.key().clone()).collect()
    }

    /// Release the innermost lease
    pub fn pop(&mut self) -> Option<(ResourceKey, ReleaseStatus)> {
        let mut lease = self.entries.pop()?;
        let status = lease.release();
        Some((lease.key().clone(), status))
    }

    /// Release one lease out of order (a module dropping its outer hive first)
    pub fn release_key(&mut self, key: &ResourceKey) -> Option<ReleaseStatus> {
        let position = self.entries.iter().rposition(|l| l.key() == key)?;
        let mut lease = self.entries.remove(position);
        Some(lease.release())
    }

    /// Release everything, innermost first
    pub fn release_all(&mut self) -> Vec<(ResourceKey, ReleaseStatus)> {
        let mut released = Vec::with_capacity(self.entries.len());
        while let Some(entry) = self.pop() {
            released.push(entry);
        }
        released
    }
}

impl Drop for ScopeStack {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{AcquirePolicy, ResourceScopeManager};
    use std::sync::{Arc, Mutex};

    fn push_recorded(
        stack: &mut ScopeStack,
        manager: &ResourceScopeManager,
        name: &str,
        order: &Arc<Mutex<Vec<String>>>,
    ) {
        let mut lease = manager
            .acquire(ResourceKey::hive(name), "test", AcquirePolicy::FailFast)
            .unwrap();
        let order = Arc::clone(order);
        let name = name.to_string();
        lease.on_release(Box::new(move || {
            order.lock().unwrap().push(name);
            Ok(())
        }));
        stack.push(lease);
    }

    #[test]
    fn test_release_all_is_reverse_order() {
        let manager = ResourceScopeManager::isolated();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = ScopeStack::new();

        for name in ["mount", "software", "system"] {
            push_recorded(&mut stack, &manager, name, &order);
        }
        stack.release_all();

        assert_eq!(*order.lock().unwrap(), vec!["system", "software", "mount"]);
        assert!(manager.held().is_empty());
    }

    #[test]
    fn test_drop_releases_remaining() {
        let manager = ResourceScopeManager::isolated();
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let mut stack = ScopeStack::new();
            push_recorded(&mut stack, &manager, "a", &order);
            push_recorded(&mut stack, &manager, "b", &order);
        }
        assert_eq!(*order.lock().unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn test_release_key_out_of_order() {
        let manager = ResourceScopeManager::isolated();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = ScopeStack::new();
        push_recorded(&mut stack, &manager, "a", &order);
        push_recorded(&mut stack, &manager, "b", &order);

        assert_eq!(stack.release_key(&ResourceKey::hive("a")), Some(ReleaseStatus::Released));
        assert_eq!(stack.release_key(&ResourceKey::hive("a")), None);
        assert_eq!(stack.keys(), vec![ResourceKey::hive("b")]);
    }
}
