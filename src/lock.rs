//! Keyed mutual exclusion.
//!
//! A [`LockRegistry`] hands out one async mutex per key. Mutexes are created on
//! first use and dropped from the registry once nobody holds or awaits them.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

use anyhow::{Result, anyhow};
use log::trace;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Keys for the operations the manager serialises.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// Any mutation of a profile's installed packages or add-on folders.
    ProfileModify(String),
    /// Writes to the global configuration.
    GlobalConfig,
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::ProfileModify(profile) => write!(f, "({}, modify)", profile),
            LockKey::GlobalConfig => f.write_str("update-global-config"),
        }
    }
}

pub struct LockRegistry<K = LockKey> {
    locks: Mutex<HashMap<K, Weak<AsyncMutex<()>>>>,
}

impl<K> Default for LockRegistry<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone + fmt::Debug> LockRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`. Access ends when the guard drops.
    pub async fn lock(&self, key: K) -> Result<OwnedMutexGuard<()>> {
        let mutex = self.entry(&key)?;
        trace!("Acquiring lock {:?}", key);
        Ok(mutex.lock_owned().await)
    }

    /// Number of keys with a live mutex.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .map(|locks| locks.values().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, key: &K) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| anyhow!("lock registry poisoned"))?;

        // Mutexes nobody holds or awaits are collected on the way in
        locks.retain(|_, weak| weak.strong_count() > 0);

        if let Some(mutex) = locks.get(key).and_then(Weak::upgrade) {
            return Ok(mutex);
        }
        let mutex = Arc::new(AsyncMutex::new(()));
        locks.insert(key.clone(), Arc::downgrade(&mutex));
        Ok(mutex)
    }
}
