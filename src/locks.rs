//! Keyed async mutexes for per-board and per-user serialization
//!
//! Lock order: board locks (ascending id) first, then at most one user lock.
//! Every path that needs both follows this order, so no cycle can form.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per key, created on demand and pruned once unused
#[derive(Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // A slot only referenced by the map has no holder and no waiter
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        slots.entry(key.to_string()).or_default().clone()
    }

    /// Acquire the lock for `key`
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        self.slot(key).lock_owned().await
    }

    /// Acquire several keys in ascending order (duplicates collapse)
    pub async fn acquire_many<I, S>(&self, keys: I) -> Vec<OwnedMutexGuard<()>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ordered: BTreeSet<String> = keys.into_iter().map(Into::into).collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for key in &ordered {
            guards.push(self.acquire(key).await);
        }
        guards
    }

    /// Number of live slots (held or awaited)
    pub fn active(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .values()
            .filter(|slot| Arc::strong_count(slot) > 1)
            .count()
    }
}

/// The two lock families shared by registry, allocator and appliance manager
#[derive(Default)]
pub struct HubLocks {
    pub boards: KeyedLocks,
    pub users: KeyedLocks,
}

pub type SharedLocks = Arc<HubLocks>;
