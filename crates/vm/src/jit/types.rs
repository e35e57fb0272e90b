//! JIT tier types.
//!
//! Configuration, per-unit lifecycle states, and the atomic metrics bundle.
//! All types are lightweight — no dependencies beyond std.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default call-count threshold for promoting a unit.
pub const DEFAULT_CALL_THRESHOLD: u64 = 10;
/// Default artifact capacity of the unit cache.
pub const DEFAULT_MAX_CACHE: usize = 100;
/// Default number of events retained for inspection.
pub const DEFAULT_RETAINED_EVENTS: usize = 256;

/// Configuration for the JIT tier.
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Master switch; when false every call interprets.
    pub enabled: bool,
    /// Calls of one unit before it becomes a compilation candidate. Minimum 1.
    pub call_threshold: u64,
    /// Maximum number of active artifacts. Minimum 1. Grows (never shrinks)
    /// when eviction cannot make room.
    pub max_cache: usize,
    /// Diagnostic verbosity: 0 failures and growth only, 1 lifecycle events,
    /// 2 inlining detail and toolchain stderr.
    pub verbose: u8,
    /// Compile synchronously at promotion instead of using the worker thread.
    pub wait: bool,
    /// Keep translation sources and artifacts on disk instead of removing
    /// them after compilation and at shutdown.
    pub save_temps: bool,
    /// Directory for sources and artifacts; defaults to the system temp dir.
    pub temp_dir: Option<PathBuf>,
    /// Capacity of the retained event ring.
    pub max_retained_events: usize,
}

impl JitConfig {
    /// Clamp out-of-range knobs to their minimums.
    pub fn validated(mut self) -> Self {
        self.call_threshold = self.call_threshold.max(1);
        self.max_cache = self.max_cache.max(1);
        self.verbose = self.verbose.min(2);
        self.max_retained_events = self.max_retained_events.max(1);
        self
    }

    /// Directory translation files are written to.
    pub fn resolved_temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            call_threshold: DEFAULT_CALL_THRESHOLD,
            max_cache: DEFAULT_MAX_CACHE,
            verbose: 0,
            wait: false,
            save_temps: false,
            temp_dir: None,
            max_retained_events: DEFAULT_RETAINED_EVENTS,
        }
    }
}

/// Lifecycle of one unit.
///
/// `Failed` is terminal: a unit that could not be compiled is never retried.
/// `Stale` and `Unloaded` units may be replaced by a fresh unit for the same
/// key once the method is called again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum UnitState {
    /// Created, not yet queued.
    Fresh,
    /// Waiting in the pending queue.
    Queued,
    /// Owned by a compilation pass.
    Compiling,
    /// Native entry installed and dispatchable.
    Active,
    /// Invalidated; never dispatched again, storage reclaimed later.
    Stale,
    /// Containing artifact evicted.
    Unloaded,
    /// Compilation failed; permanently interpreted.
    Failed,
}

impl UnitState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            UnitState::Fresh => 0,
            UnitState::Queued => 1,
            UnitState::Compiling => 2,
            UnitState::Active => 3,
            UnitState::Stale => 4,
            UnitState::Unloaded => 5,
            UnitState::Failed => 6,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => UnitState::Fresh,
            1 => UnitState::Queued,
            2 => UnitState::Compiling,
            3 => UnitState::Active,
            4 => UnitState::Stale,
            5 => UnitState::Unloaded,
            _ => UnitState::Failed,
        }
    }
}

/// Atomic counters for JIT lifecycle events.
#[derive(Debug, Default)]
pub struct JitMetrics {
    /// Units successfully activated.
    pub compiled_units: AtomicU64,
    /// Units that failed in the toolchain or pipeline.
    pub failed_units: AtomicU64,
    /// Units rejected for an unsupported instruction.
    pub unsupported_units: AtomicU64,
    /// Calls dispatched to native entries.
    pub native_calls: AtomicU64,
    /// Calls executed by the interpreter.
    pub interpreted_calls: AtomicU64,
    /// Native executions that bailed out mid-unit.
    pub bailouts: AtomicU64,
    /// Artifacts evicted from the cache.
    pub evicted_artifacts: AtomicU64,
    /// Compaction batches performed.
    pub compactions: AtomicU64,
    /// Times the cache grew past its configured capacity.
    pub cache_growths: AtomicU64,
    /// Units invalidated by redefinition, rebinding, or cancellation.
    pub invalidated_units: AtomicU64,
    /// Recompilations scheduled after a broken inline dependency.
    pub recompile_requests: AtomicU64,
}

/// Plain-value copy of [`JitMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub compiled_units: u64,
    pub failed_units: u64,
    pub unsupported_units: u64,
    pub native_calls: u64,
    pub interpreted_calls: u64,
    pub bailouts: u64,
    pub evicted_artifacts: u64,
    pub compactions: u64,
    pub cache_growths: u64,
    pub invalidated_units: u64,
    pub recompile_requests: u64,
}

impl JitMetrics {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            compiled_units: self.compiled_units.load(Ordering::Relaxed),
            failed_units: self.failed_units.load(Ordering::Relaxed),
            unsupported_units: self.unsupported_units.load(Ordering::Relaxed),
            native_calls: self.native_calls.load(Ordering::Relaxed),
            interpreted_calls: self.interpreted_calls.load(Ordering::Relaxed),
            bailouts: self.bailouts.load(Ordering::Relaxed),
            evicted_artifacts: self.evicted_artifacts.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            cache_growths: self.cache_growths.load(Ordering::Relaxed),
            invalidated_units: self.invalidated_units.load(Ordering::Relaxed),
            recompile_requests: self.recompile_requests.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation_clamps_minimums() {
        let config = JitConfig {
            call_threshold: 0,
            max_cache: 0,
            verbose: 9,
            max_retained_events: 0,
            ..JitConfig::default()
        }
        .validated();
        assert_eq!(config.call_threshold, 1);
        assert_eq!(config.max_cache, 1);
        assert_eq!(config.verbose, 2);
        assert_eq!(config.max_retained_events, 1);
    }

    #[test]
    fn unit_state_round_trips() {
        for state in [
            UnitState::Fresh,
            UnitState::Queued,
            UnitState::Compiling,
            UnitState::Active,
            UnitState::Stale,
            UnitState::Unloaded,
            UnitState::Failed,
        ] {
            assert_eq!(UnitState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn metrics_snapshot_reflects_bumps() {
        let metrics = JitMetrics::new();
        JitMetrics::bump(&metrics.compiled_units);
        JitMetrics::add(&metrics.invalidated_units, 3);
        let snap = metrics.snapshot();
        assert_eq!(snap.compiled_units, 1);
        assert_eq!(snap.invalidated_units, 3);
        assert_eq!(snap.native_calls, 0);
    }
}
