//! Per-name mutual exclusion
//!
//! Concurrent opens of the same object must not race on evaluating and
//! populating its cache entry. The registry hands out one async mutex per
//! name, shared by every caller in the process. Entries are held weakly and
//! pruned once no handle references them.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::OwnedMutexGuard;

/// Guard proving the holder owns a name's mutex
pub type NameGuard = OwnedMutexGuard<()>;

/// Mutex scoped to one object name
#[derive(Debug, Clone)]
pub struct NameMutex {
    name: Arc<str>,
    inner: Arc<tokio::sync::Mutex<()>>,
}

impl NameMutex {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for exclusive access to the name
    pub async fn lock(&self) -> NameGuard {
        Arc::clone(&self.inner).lock_owned().await
    }

    /// Whether both handles guard the same name
    pub fn same_as(&self, other: &NameMutex) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Map from object name to its mutex
#[derive(Debug, Default)]
pub struct NameMutexRegistry {
    entries: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl NameMutexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process
    pub fn global() -> &'static NameMutexRegistry {
        static GLOBAL: OnceLock<NameMutexRegistry> = OnceLock::new();
        GLOBAL.get_or_init(NameMutexRegistry::new)
    }

    /// Get the mutex for `name`, creating it on first use
    pub fn grab(&self, name: &str) -> NameMutex {
        let mut entries = self.entries.lock();

        if let Some(inner) = entries.get(name).and_then(Weak::upgrade) {
            return NameMutex {
                name: Arc::from(name),
                inner,
            };
        }

        entries.retain(|_, weak| weak.strong_count() > 0);
        let inner = Arc::new(tokio::sync::Mutex::new(()));
        entries.insert(name.to_string(), Arc::downgrade(&inner));
        NameMutex {
            name: Arc::from(name),
            inner,
        }
    }

    /// Number of names with a live mutex
    pub fn live_entries(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
