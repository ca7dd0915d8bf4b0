//! Reference counts on generations that a restore is reading.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Shared registry of in-use generations.
#[derive(Debug, Clone, Default)]
pub struct GenerationLeases {
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl GenerationLeases {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `name` in use until the returned guard drops.
    pub fn lease(&self, name: &str) -> GenerationLease {
        *self.counts.lock().entry(name.to_string()).or_insert(0) += 1;
        GenerationLease {
            leases: self.clone(),
            name: name.to_string(),
        }
    }

    /// Whether `name` is in use.
    pub fn is_leased(&self, name: &str) -> bool {
        self.counts.lock().get(name).is_some_and(|c| *c > 0)
    }

    /// Run `retire` for `name` unless it is leased.
    ///
    /// The registry stays locked while `retire` runs, so a lease on `name`
    /// taken concurrently waits until the retirement is done. Returns `None`
    /// when `name` is leased.
    pub fn try_retire<T>(&self, name: &str, retire: impl FnOnce() -> T) -> Option<T> {
        let counts = self.counts.lock();
        if counts.get(name).is_some_and(|c| *c > 0) {
            return None;
        }
        let out = retire();
        drop(counts);
        Some(out)
    }

    /// Names currently in use.
    pub fn active(&self) -> Vec<String> {
        let mut names: Vec<String> = self.counts.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn release(&self, name: &str) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(name) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(name);
            }
        }
    }
}

/// RAII lease on one generation.
#[derive(Debug)]
pub struct GenerationLease {
    leases: GenerationLeases,
    name: String,
}

impl GenerationLease {
    /// Leased generation name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for GenerationLease {
    fn drop(&mut self) {
        self.leases.release(&self.name);
    }
}
