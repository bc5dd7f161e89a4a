//! In-memory store shared between threads of one process.
//!
//! Clones share state. Lock contention is reported as `Busy` rather than
//! blocking, the same signal a database gives when another writer holds it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use super::{Database, LeaseKey, Store, StoreError, StoreResult};

#[derive(Debug, Default)]
struct MemoryInner {
    db: Database,
    leases: HashSet<String>,
    busy_commits: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> StoreResult<MutexGuard<'_, MemoryInner>> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(StoreError::Busy),
            Err(TryLockError::Poisoned(_)) => {
                Err(StoreError::Unavailable("memory store poisoned".to_string()))
            }
        }
    }

    /// Makes the next `n` commits fail with `Busy`.
    #[cfg(test)]
    pub(crate) fn fail_next_commits(&self, n: usize) {
        self.inner.lock().expect("memory store poisoned").busy_commits = n;
    }

    /// Number of leases currently held.
    pub fn lease_count(&self) -> StoreResult<usize> {
        Ok(self.guard()?.leases.len())
    }
}

impl Store for MemoryStore {
    fn load(&self) -> StoreResult<Database> {
        Ok(self.guard()?.db.clone())
    }

    fn commit(&self, db: &Database) -> StoreResult<u64> {
        let mut inner = self.guard()?;
        if inner.busy_commits > 0 {
            inner.busy_commits -= 1;
            return Err(StoreError::Busy);
        }
        if inner.db.revision != db.revision {
            return Err(StoreError::Conflict);
        }
        let mut next = db.clone();
        next.revision += 1;
        let revision = next.revision;
        inner.db = next;
        Ok(revision)
    }

    fn try_acquire_lease(&self, key: &LeaseKey) -> StoreResult<bool> {
        Ok(self.guard()?.leases.insert(key.to_string()))
    }

    fn release_lease(&self, key: &LeaseKey) -> StoreResult<()> {
        self.guard()?.leases.remove(&key.to_string());
        Ok(())
    }

    fn is_leased(&self, key: &LeaseKey) -> StoreResult<bool> {
        Ok(self.guard()?.leases.contains(&key.to_string()))
    }
}
