//! End-to-end scenarios for the JIT tier: promotion, dispatch, bailouts,
//! invalidation, compaction, cache growth, fork, and shutdown.
//!
//! Everything runs in wait mode with threshold 1 so each scenario is
//! deterministic: the first call of a method compiles it, the second call
//! runs the generated code.

#![allow(
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::unwrap_used
)]

use super::helpers::{count_events, define, interp_vm, jit_vm, success_artifacts, unit_key};
use crate::hooks::TraceKind;
use crate::jit::events::JitEvent;
use crate::jit::types::UnitState;
use crate::method::{CatchEntry, MethodIseq};
use crate::opcodes::Insn;
use crate::value::Value;

/// First call interprets and compiles; second call dispatches the artifact.
#[test]
fn hot_method_compiles_then_dispatches_native() {
    let (mut vm, _dir) = jit_vm(|_| {});
    let double = define(
        &mut vm,
        "double",
        MethodIseq::new(
            vec![
                Insn::LoadLocal(0),
                Insn::LoadLocal(0),
                Insn::Add,
                Insn::Return,
            ],
            1,
            1,
        ),
    );

    assert_eq!(vm.call(double, vec![Value::Int(21)]).unwrap(), Value::Int(42));
    let after_first = vm.jit().metrics();
    assert_eq!(after_first.interpreted_calls, 1);
    assert_eq!(after_first.compiled_units, 1);
    assert_eq!(after_first.native_calls, 0);
    assert_eq!(
        vm.jit().unit_state(unit_key(&vm, double)),
        Some(UnitState::Active)
    );

    assert_eq!(vm.call(double, vec![Value::Int(21)]).unwrap(), Value::Int(42));
    let after_second = vm.jit().metrics();
    assert_eq!(after_second.native_calls, 1);
    assert_eq!(after_second.interpreted_calls, 1);

    let artifacts = success_artifacts(&vm, "double");
    assert_eq!(artifacts.len(), 1);
    assert!(artifacts[0].exists(), "artifact should be on disk while live");
    assert_eq!(vm.jit().cache_len(), 1);
}

/// A disabled tier never counts, compiles, or dispatches.
#[test]
fn disabled_tier_always_interprets() {
    let mut vm = interp_vm();
    let answer = define(
        &mut vm,
        "answer",
        MethodIseq::new(vec![Insn::PushInt(3), Insn::Return], 0, 0),
    );
    for _ in 0..20 {
        assert_eq!(vm.call(answer, vec![]).unwrap(), Value::Int(3));
    }
    let snapshot = vm.jit().metrics();
    assert_eq!(snapshot.compiled_units, 0);
    assert_eq!(snapshot.native_calls, 0);
    assert!(vm.jit().events().is_empty());
    assert_eq!(vm.jit().unit_state(unit_key(&vm, answer)), None);
}

/// Class definition cannot be lowered; the unit fails once and is never
/// retried, while the method keeps interpreting correctly.
#[test]
fn unsupported_instruction_fails_terminally() {
    let (mut vm, _dir) = jit_vm(|_| {});
    let widget = vm.intern("Widget");
    let setup = define(
        &mut vm,
        "setup",
        MethodIseq::new(
            vec![Insn::DefineClass(widget), Insn::PushNil, Insn::Return],
            0,
            0,
        ),
    );

    for _ in 0..3 {
        assert_eq!(vm.call(setup, vec![]).unwrap(), Value::Nil);
    }
    assert!(vm.class_defined(widget));
    assert_eq!(
        vm.jit().unit_state(unit_key(&vm, setup)),
        Some(UnitState::Failed)
    );

    let snapshot = vm.jit().metrics();
    assert_eq!(snapshot.unsupported_units, 1);
    assert_eq!(snapshot.compiled_units, 0);
    assert_eq!(snapshot.native_calls, 0);
    assert_eq!(snapshot.interpreted_calls, 3);
    assert_eq!(vm.jit().cache_len(), 0);

    let unsupported: Vec<JitEvent> = vm
        .jit()
        .events()
        .into_iter()
        .filter(|event| matches!(event, JitEvent::Unsupported { .. }))
        .collect();
    assert_eq!(unsupported.len(), 1, "failed units are never retried");
    match &unsupported[0] {
        JitEvent::Unsupported { unit, insn } => {
            assert_eq!(unit, "setup");
            assert_eq!(*insn, "define_class");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

/// Rebinding a constant retires every unit that folded it, forces a bailout
/// at the next synchronization point, and recompiles against the new binding.
#[test]
fn const_rebind_invalidates_folds_and_bails_out() {
    let (mut vm, _dir) = jit_vm(|_| {});
    let slot = vm.define_const(Value::Int(5));
    let rebind = define(
        &mut vm,
        "rebind",
        MethodIseq::new(
            vec![
                Insn::PushInt(99),
                Insn::StoreConst(slot),
                Insn::PushNil,
                Insn::Return,
            ],
            0,
            0,
        ),
    );
    let reader = define(
        &mut vm,
        "reader",
        MethodIseq::new(
            vec![
                Insn::PushInt(7),
                Insn::Print,
                Insn::Send {
                    name: rebind,
                    argc: 0,
                },
                Insn::Pop,
                Insn::LoadConst(slot),
                Insn::Print,
                Insn::PushNil,
                Insn::Return,
            ],
            0,
            0,
        ),
    );

    // Interpreted round: compiles reader (folding generation 0), then the
    // send rebinds the slot and triggers the first recompile.
    vm.call(reader, vec![]).unwrap();
    assert_eq!(vm.take_output(), vec![Value::Int(7), Value::Int(99)]);

    // Native round: the folded unit goes stale mid-call, the return from the
    // send bails out, and the tail reads the live binding.
    vm.call(reader, vec![]).unwrap();
    assert_eq!(vm.take_output(), vec![Value::Int(7), Value::Int(99)]);

    let snapshot = vm.jit().metrics();
    assert_eq!(snapshot.bailouts, 1);
    assert_eq!(snapshot.invalidated_units, 2);
    assert_eq!(snapshot.recompile_requests, 2);
    assert_eq!(
        count_events(&vm, |event| matches!(
            event,
            JitEvent::Recompile { reason, .. } if reason == "bound constant changed"
        )),
        2
    );
    assert_eq!(success_artifacts(&vm, "reader").len(), 3);
    assert_eq!(
        vm.jit().unit_state(unit_key(&vm, reader)),
        Some(UnitState::Active),
        "the rendition compiled against the newest binding stays live"
    );
}

/// Operands buffered in the scratch stack must reach the frame before a
/// bailout so the interpreter resumes mid-expression.
#[test]
fn bailout_flushes_scratch_operands() {
    let (mut vm, _dir) = jit_vm(|_| {});
    let slot = vm.define_const(Value::Int(100));
    let rebind = define(
        &mut vm,
        "rebind",
        MethodIseq::new(
            vec![
                Insn::PushInt(0),
                Insn::StoreConst(slot),
                Insn::PushNil,
                Insn::Return,
            ],
            0,
            0,
        ),
    );
    let mixer = define(
        &mut vm,
        "mixer",
        MethodIseq::new(
            vec![
                Insn::PushInt(5),
                Insn::PushInt(2),
                Insn::LoadConst(slot),
                Insn::Pop,
                Insn::Send {
                    name: rebind,
                    argc: 0,
                },
                Insn::Pop,
                Insn::Add,
                Insn::Print,
                Insn::PushNil,
                Insn::Return,
            ],
            0,
            0,
        ),
    );

    vm.call(mixer, vec![]).unwrap();
    assert_eq!(vm.take_output(), vec![Value::Int(7)]);

    // Native round: 5 and 2 live in the scratch stack when the send's return
    // discovers the unit went stale. They must be flushed for the
    // interpreter to finish the addition.
    vm.call(mixer, vec![]).unwrap();
    assert_eq!(vm.take_output(), vec![Value::Int(7)]);
    assert_eq!(vm.jit().metrics().bailouts, 1);
}

/// A method with handlers runs its operands on the frame stack directly, so
/// a mid-expression bailout resumes with nothing to flush.
#[test]
fn frame_mode_bailout_resumes_mid_expression() {
    let (mut vm, _dir) = jit_vm(|_| {});
    let slot = vm.define_const(Value::Int(12));
    let rebind = define(
        &mut vm,
        "rebind",
        MethodIseq::new(
            vec![
                Insn::PushInt(12),
                Insn::StoreConst(slot),
                Insn::PushNil,
                Insn::Return,
            ],
            0,
            0,
        ),
    );
    let shielded = define(
        &mut vm,
        "shielded",
        MethodIseq::new(
            vec![
                Insn::PushInt(30),
                Insn::LoadConst(slot),
                Insn::Send {
                    name: rebind,
                    argc: 0,
                },
                Insn::Pop,
                Insn::Add,
                Insn::Print,
                Insn::PushNil,
                Insn::Return,
                // 8: handler, never reached
                Insn::PushInt(-1),
                Insn::Print,
                Insn::PushNil,
                Insn::Return,
            ],
            0,
            0,
        )
        .with_catch(vec![CatchEntry {
            start: 0,
            end: 8,
            handler: 8,
        }]),
    );

    vm.call(shielded, vec![]).unwrap();
    assert_eq!(vm.take_output(), vec![Value::Int(42)]);

    // Native round: 30 and the folded 12 already sit on the frame stack when
    // the send's return discovers the unit went stale, and interpretation
    // picks up from the pop.
    vm.call(shielded, vec![]).unwrap();
    assert_eq!(vm.take_output(), vec![Value::Int(42)]);
    assert_eq!(vm.jit().metrics().bailouts, 1);
    assert_eq!(
        vm.jit().unit_state(unit_key(&vm, shielded)),
        Some(UnitState::Active),
        "the replacement compiled against the new binding stays live"
    );
}

/// A raise inside generated code unwinds to the interpreter, which runs the
/// handler with a cleared operand stack.
#[test]
fn native_raise_unwinds_to_handler() {
    let (mut vm, _dir) = jit_vm(|_| {});
    let guarded = define(
        &mut vm,
        "guarded",
        MethodIseq::new(
            vec![
                Insn::PushInt(1),
                Insn::Raise,
                Insn::Return,
                // 3: handler
                Insn::PushInt(42),
                Insn::Print,
                Insn::PushNil,
                Insn::Return,
            ],
            0,
            0,
        )
        .with_catch(vec![CatchEntry {
            start: 0,
            end: 3,
            handler: 3,
        }]),
    );

    assert_eq!(vm.call(guarded, vec![]).unwrap(), Value::Nil);
    assert_eq!(vm.take_output(), vec![Value::Int(42)]);

    assert_eq!(vm.call(guarded, vec![]).unwrap(), Value::Nil);
    assert_eq!(vm.take_output(), vec![Value::Int(42)]);
    let snapshot = vm.jit().metrics();
    assert_eq!(snapshot.native_calls, 1);
    assert_eq!(snapshot.bailouts, 0, "a raise is not a bailout");
    assert_eq!(
        vm.jit().unit_state(unit_key(&vm, guarded)),
        Some(UnitState::Active)
    );
}

/// Without a handler a native raise surfaces as an unhandled exception,
/// exactly like the interpreter.
#[test]
fn native_raise_without_handler_errors() {
    let (mut vm, _dir) = jit_vm(|_| {});
    let boom = define(
        &mut vm,
        "boom",
        MethodIseq::new(vec![Insn::Raise, Insn::Return], 0, 0),
    );
    assert!(vm.call(boom, vec![]).is_err());
    assert!(vm.call(boom, vec![]).is_err());
    assert_eq!(vm.jit().metrics().native_calls, 1);
}

/// Redefining an inlined callee retires the caller's unit and recompiles it
/// with the callee blocklisted, so the new rendition calls out again.
#[test]
fn redefined_callee_blocklists_inlining() {
    let (mut vm, _dir) = jit_vm(|_| {});
    let answer = define(
        &mut vm,
        "answer",
        MethodIseq::new(vec![Insn::PushInt(1), Insn::Return], 0, 0),
    );
    let greet = define(
        &mut vm,
        "greet",
        MethodIseq::new(
            vec![
                Insn::Send {
                    name: answer,
                    argc: 0,
                },
                Insn::Return,
            ],
            0,
            0,
        ),
    );
    let old_answer_key = unit_key(&vm, answer);

    assert_eq!(vm.call(greet, vec![]).unwrap(), Value::Int(1));
    assert_eq!(
        count_events(&vm, |event| matches!(
            event,
            JitEvent::Inline { caller, callee } if caller == "greet" && callee == "answer"
        )),
        1
    );

    // Inlined: the second call never invokes the callee.
    assert_eq!(vm.call(greet, vec![]).unwrap(), Value::Int(1));
    assert_eq!(vm.jit().metrics().native_calls, 1);

    vm.define_method(
        answer,
        MethodIseq::new(vec![Insn::PushInt(2), Insn::Return], 0, 0),
    );
    assert_eq!(vm.jit().unit_state(old_answer_key), Some(UnitState::Stale));
    assert_eq!(
        count_events(&vm, |event| matches!(
            event,
            JitEvent::Invalidate { unit, trigger }
                if unit == "answer" && trigger == "method redefined"
        )),
        1
    );
    assert_eq!(
        count_events(&vm, |event| matches!(
            event,
            JitEvent::Recompile { unit, reason }
                if unit == "greet" && reason == "inlined method redefined: answer"
        )),
        1
    );

    // The recompiled caller sends for real and sees the new body.
    assert_eq!(vm.call(greet, vec![]).unwrap(), Value::Int(2));
    assert_eq!(vm.call(greet, vec![]).unwrap(), Value::Int(2));
    assert_eq!(
        count_events(&vm, |event| matches!(event, JitEvent::Inline { .. })),
        1,
        "the blocklisted callee is never inlined again"
    );
}

/// Enabling line tracing cancels all generated code at once; disabling it
/// lets the method promote and compile again.
#[test]
fn line_tracing_cancels_all_generated_code() {
    let (mut vm, _dir) = jit_vm(|_| {});
    let sum3 = define(
        &mut vm,
        "sum3",
        MethodIseq::new(
            vec![Insn::PushInt(1), Insn::PushInt(2), Insn::Add, Insn::Return],
            0,
            0,
        ),
    );
    let key = unit_key(&vm, sum3);
    vm.call(sum3, vec![]).unwrap();
    vm.call(sum3, vec![]).unwrap();
    assert_eq!(vm.jit().metrics().native_calls, 1);

    // Class-definition tracing never touches generated code.
    vm.set_trace(TraceKind::ClassDefine, true);
    assert_eq!(vm.jit().unit_state(key), Some(UnitState::Active));
    vm.call(sum3, vec![]).unwrap();
    assert_eq!(vm.jit().metrics().native_calls, 2);
    assert_eq!(
        count_events(&vm, |event| matches!(event, JitEvent::Cancel { .. })),
        0
    );

    vm.set_trace(TraceKind::Line, true);
    assert_eq!(vm.jit().unit_state(key), Some(UnitState::Stale));
    assert_eq!(
        count_events(&vm, |event| matches!(
            event,
            JitEvent::Cancel { trigger } if trigger == "line trace hook enabled"
        )),
        1
    );

    // Traced calls interpret and fire the hook per instruction.
    vm.call(sum3, vec![]).unwrap();
    vm.call(sum3, vec![]).unwrap();
    assert_eq!(vm.jit().metrics().native_calls, 2);
    assert_eq!(vm.hooks().line_events, 8);
    assert_eq!(success_artifacts(&vm, "sum3").len(), 1);

    // Once tracing is off the method becomes a candidate again.
    vm.set_trace(TraceKind::Line, false);
    assert_eq!(vm.call(sum3, vec![]).unwrap(), Value::Int(3));
    assert_eq!(success_artifacts(&vm, "sum3").len(), 2);
    assert_eq!(vm.jit().unit_state(key), Some(UnitState::Active));
    assert_eq!(vm.call(sum3, vec![]).unwrap(), Value::Int(3));
    assert_eq!(vm.jit().metrics().native_calls, 3);
    assert_eq!(vm.hooks().line_events, 8);
}

/// Requests queued while paused are compacted into one artifact on resume
/// when the cache could not hold them individually.
#[test]
fn paused_promotions_compact_on_resume() {
    let (mut vm, _dir) = jit_vm(|config| config.max_cache = 1);
    let alpha = define(
        &mut vm,
        "alpha",
        MethodIseq::new(vec![Insn::PushInt(10), Insn::Return], 0, 0),
    );
    let beta = define(
        &mut vm,
        "beta",
        MethodIseq::new(vec![Insn::PushInt(20), Insn::Return], 0, 0),
    );

    vm.jit_mut().pause();
    vm.call(alpha, vec![]).unwrap();
    vm.call(beta, vec![]).unwrap();
    assert_eq!(vm.jit().queue_len(), 2);
    assert_eq!(vm.jit().unit_state(unit_key(&vm, alpha)), Some(UnitState::Queued));
    assert_eq!(vm.jit().cache_len(), 0);

    vm.jit_mut().resume();
    assert_eq!(vm.jit().queue_len(), 0);
    assert_eq!(vm.jit().unit_state(unit_key(&vm, alpha)), Some(UnitState::Active));
    assert_eq!(vm.jit().unit_state(unit_key(&vm, beta)), Some(UnitState::Active));
    assert_eq!(vm.jit().cache_len(), 1, "one shared artifact for the batch");
    assert_eq!(vm.jit().cache_capacity(), 1);
    assert_eq!(vm.jit().metrics().compactions, 1);
    assert_eq!(
        count_events(&vm, |event| matches!(
            event,
            JitEvent::Compaction { count: 2, .. }
        )),
        1
    );

    // Both units share one file, named with the compaction marker.
    let alpha_artifacts = success_artifacts(&vm, "alpha");
    let beta_artifacts = success_artifacts(&vm, "beta");
    assert_eq!(alpha_artifacts, beta_artifacts);
    let name = alpha_artifacts[0]
        .file_name()
        .expect("artifact file name")
        .to_string_lossy()
        .into_owned();
    assert!(
        name.starts_with(&format!("_kestrel_p{}c", std::process::id())),
        "unexpected artifact name {name}"
    );

    assert_eq!(vm.call(alpha, vec![]).unwrap(), Value::Int(10));
    assert_eq!(vm.call(beta, vec![]).unwrap(), Value::Int(20));
    assert_eq!(vm.jit().metrics().native_calls, 2);
}

/// When every cached artifact is pinned by a live native frame, a new
/// registration grows the cache instead of evicting.
#[test]
fn cache_grows_when_every_artifact_is_pinned() {
    let (mut vm, _dir) = jit_vm(|config| config.max_cache = 3);
    // extra's store keeps it out of inline candidacy, so the chain really
    // calls it.
    let extra = define(
        &mut vm,
        "extra",
        MethodIseq::new(
            vec![
                Insn::PushInt(7),
                Insn::StoreLocal(0),
                Insn::LoadLocal(0),
                Insn::Return,
            ],
            0,
            1,
        ),
    );
    let tail = define(
        &mut vm,
        "tail",
        MethodIseq::new(
            vec![
                Insn::LoadLocal(0),
                Insn::BranchUnless(4),
                Insn::Send {
                    name: extra,
                    argc: 0,
                },
                Insn::Return,
                // 4: cold path
                Insn::PushInt(1),
                Insn::Return,
            ],
            1,
            1,
        ),
    );
    let middle = define(
        &mut vm,
        "middle",
        MethodIseq::new(
            vec![
                Insn::LoadLocal(0),
                Insn::Send {
                    name: tail,
                    argc: 1,
                },
                Insn::Return,
            ],
            1,
            1,
        ),
    );
    let outer = define(
        &mut vm,
        "outer",
        MethodIseq::new(
            vec![
                Insn::LoadLocal(0),
                Insn::Send {
                    name: middle,
                    argc: 1,
                },
                Insn::Return,
            ],
            1,
            1,
        ),
    );

    // Warm the chain without touching extra: the cache fills exactly.
    assert_eq!(vm.call(outer, vec![Value::Bool(false)]).unwrap(), Value::Int(1));
    assert_eq!(vm.jit().cache_len(), 3);
    assert_eq!(vm.jit().cache_capacity(), 3);
    assert_eq!(vm.jit().unit_state(unit_key(&vm, extra)), None);

    // Hot path: outer, middle, and tail all run natively, pinning all three
    // artifacts, while extra's promotion compiles underneath them.
    assert_eq!(vm.call(outer, vec![Value::Bool(true)]).unwrap(), Value::Int(7));
    assert_eq!(
        count_events(&vm, |event| matches!(
            event,
            JitEvent::CacheGrowth { new_capacity: 4 }
        )),
        1
    );
    let snapshot = vm.jit().metrics();
    assert_eq!(snapshot.cache_growths, 1);
    assert_eq!(snapshot.evicted_artifacts, 0);
    assert_eq!(vm.jit().cache_len(), 4);
    assert_eq!(vm.jit().cache_capacity(), 4);
    assert_eq!(vm.jit().unit_state(unit_key(&vm, extra)), Some(UnitState::Active));

    // Everything dispatches natively now, extra included.
    assert_eq!(vm.call(outer, vec![Value::Bool(true)]).unwrap(), Value::Int(7));
}

/// A forked machine keeps dispatching inherited code but never unlinks the
/// parent's files; its own later artifacts stay its own.
#[test]
fn fork_child_never_unlinks_parent_artifacts() {
    let (mut vm, _dir) = jit_vm(|_| {});
    let stable = define(
        &mut vm,
        "stable",
        MethodIseq::new(vec![Insn::PushInt(11), Insn::Return], 0, 0),
    );
    vm.call(stable, vec![]).unwrap();
    vm.call(stable, vec![]).unwrap();
    let parent_artifact = success_artifacts(&vm, "stable")[0].clone();
    assert!(parent_artifact.exists());

    let mut child = vm.fork();
    assert_eq!(child.call(stable, vec![]).unwrap(), Value::Int(11));
    assert_eq!(
        child.jit().metrics().native_calls,
        1,
        "inherited entries dispatch without recompiling"
    );
    assert!(child.jit().events().is_empty(), "event log starts fresh");

    let fresh = define(
        &mut child,
        "fresh",
        MethodIseq::new(vec![Insn::PushInt(22), Insn::Return], 0, 0),
    );
    child.call(fresh, vec![]).unwrap();
    let child_artifact = success_artifacts(&child, "fresh")[0].clone();
    assert!(child_artifact.exists());
    assert_ne!(child_artifact, parent_artifact);

    drop(child);
    assert!(
        !child_artifact.exists(),
        "the child removes what it compiled itself"
    );
    assert!(
        parent_artifact.exists(),
        "inherited files belong to the parent"
    );

    assert_eq!(vm.call(stable, vec![]).unwrap(), Value::Int(11));
    drop(vm);
    assert!(!parent_artifact.exists());
}

/// With save-temps both the translation source and the artifact outlive the
/// machine.
#[test]
fn saved_temps_survive_shutdown() {
    let (mut vm, dir) = jit_vm(|config| config.save_temps = true);
    let keeper = define(
        &mut vm,
        "keeper",
        MethodIseq::new(vec![Insn::PushInt(9), Insn::Return], 0, 0),
    );
    vm.call(keeper, vec![]).unwrap();

    let artifact = success_artifacts(&vm, "keeper")[0].clone();
    let source = artifact.with_extension("tu");
    assert!(artifact.exists());
    assert!(source.exists(), "the source is kept instead of removed");

    drop(vm);
    assert!(artifact.exists());
    assert!(source.exists());
    drop(dir);
}
