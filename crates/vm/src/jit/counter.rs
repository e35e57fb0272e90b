//! Call-count profiling.
//!
//! The interpreter owns exactly one profiler and ticks it from a single
//! execution context, so plain map storage is enough; no atomics, no locks.

use rustc_hash::FxHashMap;

use crate::jit::unit::UnitKey;

/// Per-unit call counter driving promotion.
#[derive(Debug, Clone)]
pub struct CallCounter {
    counts: FxHashMap<UnitKey, u64>,
    threshold: u64,
}

impl CallCounter {
    pub fn new(threshold: u64) -> Self {
        CallCounter {
            counts: FxHashMap::default(),
            threshold: threshold.max(1),
        }
    }

    /// Count one call and return the new total.
    pub fn observe(&mut self, key: UnitKey) -> u64 {
        let count = self.counts.entry(key).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Whether the unit has crossed the promotion threshold.
    ///
    /// `>=` rather than `==`: a unit can outlive its first promotion (stale
    /// after a dependency broke, unloaded by eviction) and must stay eligible
    /// on every later call. Deduplication against in-flight compiles is the
    /// unit registry's job, not the profiler's.
    pub fn promotable(&self, key: UnitKey) -> bool {
        self.counts.get(&key).copied().unwrap_or(0) >= self.threshold
    }

    pub fn count(&self, key: UnitKey) -> u64 {
        self.counts.get(&key).copied().unwrap_or(0)
    }
}
