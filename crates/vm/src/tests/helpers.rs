//! Shared helpers for the JIT scenario tests.

#![allow(clippy::expect_used)]

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use crate::jit::events::JitEvent;
use crate::jit::runtime::JitRuntime;
use crate::jit::toolchain::PortableToolchain;
use crate::jit::types::JitConfig;
use crate::jit::unit::UnitKey;
use crate::method::{MethodIseq, SymbolId};
use crate::vm::Vm;

/// Machine with a synchronous JIT over a throwaway directory.
///
/// Threshold 1 and wait mode: the first call of a method compiles it on the
/// spot (and still interprets), the second call dispatches generated code.
/// Keep the returned directory alive until the machine is dropped.
pub fn jit_vm(tweak: impl FnOnce(&mut JitConfig)) -> (Vm, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let mut config = JitConfig {
        call_threshold: 1,
        wait: true,
        temp_dir: Some(dir.path().to_path_buf()),
        ..JitConfig::default()
    };
    tweak(&mut config);
    let vm = Vm::with_jit(JitRuntime::new(config, Arc::new(PortableToolchain)));
    (vm, dir)
}

/// Machine whose JIT tier is switched off; every call interprets.
pub fn interp_vm() -> Vm {
    let config = JitConfig {
        enabled: false,
        ..JitConfig::default()
    };
    Vm::with_jit(JitRuntime::new(config, Arc::new(PortableToolchain)))
}

pub fn define(vm: &mut Vm, name: &str, iseq: MethodIseq) -> SymbolId {
    let sym = vm.intern(name);
    vm.define_method(sym, iseq);
    sym
}

/// Key of the current rendition of `name`.
pub fn unit_key(vm: &Vm, name: SymbolId) -> UnitKey {
    let def = vm.methods.lookup(name).expect("method defined");
    UnitKey {
        method: def.id,
        version: def.version,
    }
}

/// Artifact paths from recorded `Success` events for the given unit label.
pub fn success_artifacts(vm: &Vm, label: &str) -> Vec<PathBuf> {
    vm.jit()
        .events()
        .into_iter()
        .filter_map(|event| match event {
            JitEvent::Success { unit, artifact, .. } if unit == label => Some(artifact),
            _ => None,
        })
        .collect()
}

pub fn count_events(vm: &Vm, pred: impl Fn(&JitEvent) -> bool) -> usize {
    vm.jit()
        .events()
        .into_iter()
        .filter(|event| pred(event))
        .count()
}
