//! Process-wide named mutexes.
//!
//! Schema-altering SQL statements targeting the same table must not run
//! concurrently. Each such statement is executed while holding a mutex from
//! this registry, keyed by the canonical identifier of the affected object.
//! Entries are created on first use and never removed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct NamedMutexRegistry {
    mutexes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NamedMutexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (creating if needed) the mutex registered under `name`.
    /// The caller locks the returned handle for the duration of one
    /// statement execution only.
    pub fn get(&self, name: &str) -> Arc<Mutex<()>> {
        let mut map = match self.mutexes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(map.entry(name.to_string()).or_default())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        match self.mutexes.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
