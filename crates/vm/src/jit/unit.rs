//! Compilation units and their state machine.
//!
//! A unit is one compiled rendition of one method version. State moves
//! strictly forward (`Fresh -> Queued -> Compiling -> Active`) with two exits:
//! `Stale` when an assumption breaks mid-flight or after activation, and
//! `Unloaded` when eviction drops the artifact. `Failed` is terminal; the
//! runtime never re-queues a failed key.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::jit::cache::{ArtifactId, ExecutionPin, PinCount};
use crate::jit::translation::Translation;
use crate::jit::types::UnitState;
use crate::method::MethodId;

/// Identity of a unit: a method at a specific definition version.
///
/// Redefinition bumps the version, so the old unit and its replacement never
/// collide in the registry or the profiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitKey {
    pub method: MethodId,
    pub version: u64,
}

/// An assumption baked into generated code.
///
/// Breaking the assumption must invalidate the unit before the next native
/// entry; the generated code carries a matching guard for calls already on
/// the native stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InlineDep {
    /// A callee body was expanded inline at this exact version.
    CalleeVersion { callee: MethodId, version: u64 },
    /// A constant read was folded at this exact binding generation.
    ConstBinding { slot: u16, generation: u64 },
}

/// Entry point plus everything needed to run and retire it.
#[derive(Debug)]
pub struct LoadedUnit {
    pub key: UnitKey,
    pub translation: Translation,
    pub artifact: ArtifactId,
    pub pins: Arc<PinCount>,
    /// Cancellation epoch at activation; a global cancel bumps the live
    /// epoch and strands this entry.
    pub epoch: u64,
}

impl LoadedUnit {
    /// Pin the backing artifact for the duration of one native call.
    pub fn pin(&self) -> ExecutionPin {
        ExecutionPin::acquire(&self.pins)
    }
}

/// One compilation unit.
#[derive(Debug)]
pub struct Unit {
    pub key: UnitKey,
    /// Method name, used in every event mentioning this unit.
    pub label: String,
    state: AtomicU8,
    entry: RwLock<Option<Arc<LoadedUnit>>>,
    deps: RwLock<Vec<InlineDep>>,
    /// Methods the generator must not inline into this unit. Populated when
    /// a prior rendition was invalidated by a callee redefinition.
    pub blocklist: FxHashSet<MethodId>,
}

impl Unit {
    pub fn new(key: UnitKey, label: String, blocklist: FxHashSet<MethodId>) -> Self {
        Unit {
            key,
            label,
            state: AtomicU8::new(UnitState::Fresh.as_u8()),
            entry: RwLock::new(None),
            deps: RwLock::new(Vec::new()),
            blocklist,
        }
    }

    pub fn state(&self) -> UnitState {
        UnitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: UnitState, to: UnitState) -> bool {
        self.state
            .compare_exchange(
                from.as_u8(),
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `Fresh -> Queued`. Fails if the unit already left `Fresh`.
    pub fn try_begin_queue(&self) -> bool {
        self.transition(UnitState::Fresh, UnitState::Queued)
    }

    /// `Queued -> Compiling`. Fails if a cancel got there first.
    pub fn try_begin_compile(&self) -> bool {
        self.transition(UnitState::Queued, UnitState::Compiling)
    }

    /// `Compiling -> Active`, installing the entry and its dependencies.
    ///
    /// Returns false when the unit went stale during compilation; the caller
    /// must discard the artifact instead of publishing it.
    pub fn activate(&self, entry: Arc<LoadedUnit>, deps: Vec<InlineDep>) -> bool {
        if !self.transition(UnitState::Compiling, UnitState::Active) {
            return false;
        }
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut recorded = self.deps.write().unwrap();
        *recorded = deps;
        drop(recorded);
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut slot = self.entry.write().unwrap();
        *slot = Some(entry);
        true
    }

    /// `Compiling -> Failed`. Terminal: the registry keeps failed keys so the
    /// same method version is never queued again.
    pub fn fail(&self) -> bool {
        self.transition(UnitState::Compiling, UnitState::Failed)
    }

    /// Invalidate from any in-flight or active state; returns the state the
    /// unit was in, or `None` if it had nothing to cancel.
    pub fn mark_stale(&self) -> Option<UnitState> {
        for from in [UnitState::Queued, UnitState::Compiling, UnitState::Active] {
            if self.transition(from, UnitState::Stale) {
                return Some(from);
            }
        }
        None
    }

    /// Drop the entry after its artifact was evicted.
    pub fn mark_unloaded(&self) {
        let moved = self.transition(UnitState::Active, UnitState::Unloaded)
            || self.transition(UnitState::Stale, UnitState::Unloaded);
        if moved {
            #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
            let mut slot = self.entry.write().unwrap();
            *slot = None;
        }
    }

    /// Current entry, if one is installed.
    pub fn entry(&self) -> Option<Arc<LoadedUnit>> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let slot = self.entry.read().unwrap();
        slot.clone()
    }

    /// Copy of the recorded dependencies.
    pub fn deps(&self) -> Vec<InlineDep> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let deps = self.deps.read().unwrap();
        deps.clone()
    }

    /// True if the unit inlined `method` at any version.
    pub fn depends_on_method(&self, method: MethodId) -> bool {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let deps = self.deps.read().unwrap();
        deps.iter()
            .any(|dep| matches!(dep, InlineDep::CalleeVersion { callee, .. } if *callee == method))
    }

    /// True if the unit folded the constant in `slot`.
    pub fn depends_on_const(&self, slot: u16) -> bool {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let deps = self.deps.read().unwrap();
        deps.iter()
            .any(|dep| matches!(dep, InlineDep::ConstBinding { slot: s, .. } if *s == slot))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::jit::translation::{StackMode, Translation};

    fn unit() -> Unit {
        let key = UnitKey {
            method: MethodId::from_raw(1),
            version: 1,
        };
        Unit::new(key, "m".to_owned(), FxHashSet::default())
    }

    fn loaded(key: UnitKey) -> Arc<LoadedUnit> {
        Arc::new(LoadedUnit {
            key,
            translation: Translation {
                unit: key,
                label: "m".to_owned(),
                stack_mode: StackMode::Local,
                ops: Vec::new(),
                n_locals: 0,
                n_temps: 0,
                deps: Vec::new(),
            },
            artifact: ArtifactId(0),
            pins: Arc::new(PinCount::new()),
            epoch: 0,
        })
    }

    #[test]
    fn forward_path() {
        let unit = unit();
        assert_eq!(unit.state(), UnitState::Fresh);
        assert!(unit.try_begin_queue());
        assert!(!unit.try_begin_queue());
        assert!(unit.try_begin_compile());
        assert_eq!(unit.state(), UnitState::Compiling);
        assert!(unit.activate(loaded(unit.key), Vec::new()));
        assert_eq!(unit.state(), UnitState::Active);
        assert!(unit.entry().is_some());
    }

    #[test]
    fn stale_during_compile_blocks_activation() {
        let unit = unit();
        unit.try_begin_queue();
        unit.try_begin_compile();
        assert_eq!(unit.mark_stale(), Some(UnitState::Compiling));
        assert!(!unit.activate(loaded(unit.key), Vec::new()));
        assert!(unit.entry().is_none());
    }

    #[test]
    fn failed_is_terminal() {
        let unit = unit();
        unit.try_begin_queue();
        unit.try_begin_compile();
        assert!(unit.fail());
        assert_eq!(unit.state(), UnitState::Failed);
        assert_eq!(unit.mark_stale(), None);
        assert!(!unit.try_begin_queue());
    }

    #[test]
    fn unload_clears_entry() {
        let unit = unit();
        unit.try_begin_queue();
        unit.try_begin_compile();
        unit.activate(loaded(unit.key), Vec::new());
        unit.mark_unloaded();
        assert_eq!(unit.state(), UnitState::Unloaded);
        assert!(unit.entry().is_none());
    }

    #[test]
    fn dependency_queries() {
        let unit = unit();
        unit.try_begin_queue();
        unit.try_begin_compile();
        let deps = vec![
            InlineDep::CalleeVersion {
                callee: MethodId::from_raw(9),
                version: 2,
            },
            InlineDep::ConstBinding {
                slot: 4,
                generation: 0,
            },
        ];
        unit.activate(loaded(unit.key), deps);
        assert!(unit.depends_on_method(MethodId::from_raw(9)));
        assert!(!unit.depends_on_method(MethodId::from_raw(8)));
        assert!(unit.depends_on_const(4));
        assert!(!unit.depends_on_const(5));
    }
}
