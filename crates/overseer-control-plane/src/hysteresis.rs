//! Consecutive-mismatch counting.
//!
//! A record observed out of line in one reconcile pass may simply be caught
//! mid-update. The counter lets the reconciler act only after the same key
//! has been misaligned for several consecutive passes.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct HysteresisCounter<K> {
    counts: HashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> HysteresisCounter<K> {
    pub fn new() -> Self {
        Self {
            counts: HashMap::new(),
        }
    }

    /// Record one more consecutive mismatch for `key` and return the count.
    pub fn record_mismatch(&mut self, key: &K) -> u32 {
        let count = self.counts.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Forget `key` (it was seen aligned, or has been acted on).
    pub fn clear(&mut self, key: &K) {
        self.counts.remove(key);
    }

    /// Drop every key not in `present`.
    pub fn prune_absent(&mut self, present: &HashSet<K>) {
        self.counts.retain(|key, _| present.contains(key));
    }

    pub fn count(&self, key: &K) -> u32 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for HysteresisCounter<K> {
    fn default() -> Self {
        Self::new()
    }
}
