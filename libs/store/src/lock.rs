//! Per-key async locks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Held while a key is locked; dropping it unlocks.
pub type KeyGuard = OwnedMutexGuard<()>;

/// One async mutex per key, created on first use.
///
/// The table itself sits behind a single mutex so two callers locking a new
/// key for the first time always end up sharing the same entry.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock on `key`.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let entry = {
            let mut table = self.locks.lock().await;
            Arc::clone(table.entry(key.to_string()).or_default())
        };
        entry.lock_owned().await
    }

    /// Number of keys that have ever been locked.
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
