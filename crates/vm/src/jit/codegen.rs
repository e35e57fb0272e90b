//! Bytecode lowering.
//!
//! `generate` turns one method body into a [`Translation`]: a flat lowered
//! sequence with rewritten branch targets, constant reads folded against the
//! snapshot the interpreter took at promotion time, and small pure callees
//! expanded inline behind version guards. Everything speculative records an
//! [`InlineDep`] so the runtime can invalidate the unit when the assumption
//! breaks, and the generated form keeps enough guards to bail out of calls
//! that are already running.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::errors::CompileError;
use crate::jit::translation::{Lowered, LoweredOp, StackMode, Translation};
use crate::jit::unit::{InlineDep, UnitKey};
use crate::method::{MethodId, MethodIseq, SymbolId};
use crate::opcodes::Insn;
use crate::value::Value;

/// Callees longer than this are never inlined.
pub const INLINE_MAX_INSNS: usize = 16;

/// A callee as it existed when the caller was promoted.
#[derive(Debug, Clone)]
pub struct CalleeSnapshot {
    pub method: MethodId,
    pub version: u64,
    pub label: String,
    pub iseq: Arc<MethodIseq>,
}

/// A constant binding as it existed when the caller was promoted.
#[derive(Debug, Clone, Copy)]
pub struct ConstSnapshot {
    pub value: Value,
    pub generation: u64,
}

/// Everything the compiler thread needs; snapshots are taken on the
/// interpreter side so lowering never touches live tables.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub unit: UnitKey,
    pub label: String,
    pub iseq: Arc<MethodIseq>,
    pub callees: FxHashMap<SymbolId, CalleeSnapshot>,
    pub consts: FxHashMap<u16, ConstSnapshot>,
    pub blocklist: FxHashSet<MethodId>,
}

/// Inline eligibility: straight-line, handler-free, short, and statically
/// known to leave exactly one value for its `Return`.
fn inlinable_body(iseq: &MethodIseq) -> bool {
    let Some((last, body)) = iseq.insns.split_last() else {
        return false;
    };
    if !matches!(last, Insn::Return) {
        return false;
    }
    let mut depth: usize = 0;
    for insn in body {
        match insn {
            Insn::Nop => {}
            Insn::PushInt(_)
            | Insn::PushBool(_)
            | Insn::PushNil
            | Insn::LoadLocal(_)
            | Insn::LoadConst(_) => depth = depth.saturating_add(1),
            Insn::Dup => {
                if depth == 0 {
                    return false;
                }
                depth = depth.saturating_add(1);
            }
            Insn::Pop => {
                if depth == 0 {
                    return false;
                }
                depth = depth.saturating_sub(1);
            }
            Insn::Add | Insn::Sub | Insn::Mul | Insn::Lt | Insn::Eq => {
                if depth < 2 {
                    return false;
                }
                depth = depth.saturating_sub(1);
            }
            _ => return false,
        }
    }
    depth == 1
}

fn inline_candidate<'a>(
    request: &'a CompileRequest,
    name: SymbolId,
    argc: u8,
) -> Option<&'a CalleeSnapshot> {
    let snapshot = request.callees.get(&name)?;
    if request.blocklist.contains(&snapshot.method) {
        return None;
    }
    if snapshot.iseq.n_params != argc {
        return None;
    }
    if !snapshot.iseq.catch_table.is_empty() {
        return None;
    }
    if snapshot.iseq.insns.len() > INLINE_MAX_INSNS {
        return None;
    }
    if !inlinable_body(&snapshot.iseq) {
        return None;
    }
    Some(snapshot)
}

struct LoweringCtx {
    ops: Vec<Lowered>,
    /// Source pc -> first lowered index for it.
    src_map: FxHashMap<u32, u32>,
    /// Lowered branch positions still carrying source targets.
    patches: Vec<(usize, u32)>,
    deps: Vec<InlineDep>,
    n_temps: u16,
}

impl LoweringCtx {
    fn emit(&mut self, op: LoweredOp, src_pc: u32) {
        self.ops.push(Lowered { op, src_pc });
    }

    fn mark(&mut self, src_pc: u32) -> Result<(), CompileError> {
        let index =
            u32::try_from(self.ops.len()).map_err(|_| CompileError::Lowering { pc: src_pc })?;
        self.src_map.insert(src_pc, index);
        Ok(())
    }

    fn add_dep(&mut self, dep: InlineDep) {
        if !self.deps.contains(&dep) {
            self.deps.push(dep);
        }
    }
}

/// Expand a callee body in place of its send.
///
/// The guard goes in front of the argument spill: a version mismatch then
/// bails out with the arguments still on the operand stack, exactly what the
/// interpreter needs to re-execute the send. No op inside the expanded body
/// can bail out (plain constant reads, no sends, no guards), so control never
/// resumes mid-callee.
fn inline_body(ctx: &mut LoweringCtx, snapshot: &CalleeSnapshot, argc: u8, src_pc: u32) {
    ctx.emit(
        LoweredOp::InlineGuard {
            callee: snapshot.method,
            version: snapshot.version,
        },
        src_pc,
    );
    for slot in (0..argc).rev() {
        ctx.emit(LoweredOp::StoreTemp(u16::from(slot)), src_pc);
    }
    ctx.n_temps = ctx.n_temps.max(u16::from(argc));

    let params = u16::from(snapshot.iseq.n_params);
    for insn in &snapshot.iseq.insns {
        let op = match *insn {
            Insn::Nop | Insn::Return => continue,
            Insn::PushInt(value) => LoweredOp::PushInt(value),
            Insn::PushBool(value) => LoweredOp::PushBool(value),
            Insn::PushNil => LoweredOp::PushNil,
            // Params live in the spilled temps; other callee locals are
            // always nil since nothing in an inlinable body writes them.
            Insn::LoadLocal(slot) if slot < params => LoweredOp::LoadTemp(slot),
            Insn::LoadLocal(_) => LoweredOp::PushNil,
            Insn::Pop => LoweredOp::Pop,
            Insn::Dup => LoweredOp::Dup,
            Insn::Add => LoweredOp::Add,
            Insn::Sub => LoweredOp::Sub,
            Insn::Mul => LoweredOp::Mul,
            Insn::Lt => LoweredOp::Lt,
            Insn::Eq => LoweredOp::Eq,
            // Live read on purpose: folding here would plant a bailout in
            // the middle of the expanded body.
            Insn::LoadConst(slot) => LoweredOp::LoadConst(slot),
            // Filtered out by eligibility.
            _ => continue,
        };
        ctx.emit(op, src_pc);
    }
    ctx.add_dep(InlineDep::CalleeVersion {
        callee: snapshot.method,
        version: snapshot.version,
    });
}

/// Lower one method into a translation.
pub fn generate(request: &CompileRequest) -> Result<Translation, CompileError> {
    let iseq = &request.iseq;
    let stack_mode = if iseq.catch_table.is_empty() {
        StackMode::Local
    } else {
        StackMode::Frame
    };

    let mut jump_targets: FxHashSet<u32> = FxHashSet::default();
    let mut stored_slots: FxHashSet<u16> = FxHashSet::default();
    for insn in &iseq.insns {
        if let Some(target) = insn.branch_target() {
            jump_targets.insert(target);
        }
        if let Insn::StoreConst(slot) = insn {
            stored_slots.insert(*slot);
        }
    }

    let mut ctx = LoweringCtx {
        ops: Vec::with_capacity(iseq.insns.len()),
        src_map: FxHashMap::default(),
        patches: Vec::new(),
        deps: Vec::new(),
        n_temps: 0,
    };

    let mut pc: usize = 0;
    while let Some(insn) = iseq.insns.get(pc) {
        let src_pc = u32::try_from(pc).map_err(|_| CompileError::Lowering { pc: u32::MAX })?;
        ctx.mark(src_pc)?;
        let mut step: usize = 1;

        match *insn {
            Insn::Nop => ctx.emit(LoweredOp::Nop, src_pc),
            Insn::PushInt(a) => {
                // Fold `push a; push b; <arith>` when nothing branches into
                // the middle of the triple.
                let folded = match (
                    iseq.insns.get(pc.saturating_add(1)),
                    iseq.insns.get(pc.saturating_add(2)),
                ) {
                    (Some(Insn::PushInt(b)), Some(third))
                        if !jump_targets.contains(&src_pc.saturating_add(1))
                            && !jump_targets.contains(&src_pc.saturating_add(2)) =>
                    {
                        match third {
                            Insn::Add => a.checked_add(*b),
                            Insn::Sub => a.checked_sub(*b),
                            Insn::Mul => a.checked_mul(*b),
                            _ => None,
                        }
                    }
                    _ => None,
                };
                match folded {
                    Some(value) => {
                        ctx.emit(LoweredOp::PushInt(value), src_pc);
                        step = 3;
                    }
                    None => ctx.emit(LoweredOp::PushInt(a), src_pc),
                }
            }
            Insn::PushBool(value) => ctx.emit(LoweredOp::PushBool(value), src_pc),
            Insn::PushNil => ctx.emit(LoweredOp::PushNil, src_pc),
            Insn::LoadLocal(slot) => ctx.emit(LoweredOp::LoadLocal(slot), src_pc),
            Insn::StoreLocal(slot) => ctx.emit(LoweredOp::StoreLocal(slot), src_pc),
            Insn::Pop => ctx.emit(LoweredOp::Pop, src_pc),
            Insn::Dup => ctx.emit(LoweredOp::Dup, src_pc),
            Insn::Add => ctx.emit(LoweredOp::Add, src_pc),
            Insn::Sub => ctx.emit(LoweredOp::Sub, src_pc),
            Insn::Mul => ctx.emit(LoweredOp::Mul, src_pc),
            Insn::Lt => ctx.emit(LoweredOp::Lt, src_pc),
            Insn::Eq => ctx.emit(LoweredOp::Eq, src_pc),
            Insn::Jump(target) => {
                ctx.patches.push((ctx.ops.len(), target));
                ctx.emit(LoweredOp::Jump(target), src_pc);
            }
            Insn::BranchIf(target) => {
                ctx.patches.push((ctx.ops.len(), target));
                ctx.emit(LoweredOp::BranchIf(target), src_pc);
            }
            Insn::BranchUnless(target) => {
                ctx.patches.push((ctx.ops.len(), target));
                ctx.emit(LoweredOp::BranchUnless(target), src_pc);
            }
            Insn::LoadConst(slot) => {
                // Fold only when the binding was snapshotted and this unit
                // never rebinds the slot itself.
                match request.consts.get(&slot) {
                    Some(snapshot) if !stored_slots.contains(&slot) => {
                        ctx.emit(
                            LoweredOp::FoldedConst {
                                slot,
                                generation: snapshot.generation,
                                value: snapshot.value,
                            },
                            src_pc,
                        );
                        ctx.add_dep(InlineDep::ConstBinding {
                            slot,
                            generation: snapshot.generation,
                        });
                    }
                    _ => ctx.emit(LoweredOp::LoadConst(slot), src_pc),
                }
            }
            Insn::StoreConst(slot) => ctx.emit(LoweredOp::StoreConst(slot), src_pc),
            Insn::Print => ctx.emit(LoweredOp::Print, src_pc),
            Insn::Send { name, argc } => match inline_candidate(request, name, argc) {
                Some(snapshot) => inline_body(&mut ctx, snapshot, argc, src_pc),
                None => ctx.emit(LoweredOp::SendInterp { name, argc }, src_pc),
            },
            Insn::Raise => ctx.emit(LoweredOp::Raise, src_pc),
            Insn::Return => ctx.emit(LoweredOp::Return, src_pc),
            Insn::DefineClass(_) => {
                return Err(CompileError::Unsupported { insn: insn.name() });
            }
        }
        pc = pc.saturating_add(step);
    }

    for (index, src_target) in &ctx.patches {
        let mapped = ctx
            .src_map
            .get(src_target)
            .copied()
            .ok_or(CompileError::Lowering { pc: *src_target })?;
        if let Some(lowered) = ctx.ops.get_mut(*index) {
            lowered.op = match lowered.op {
                LoweredOp::Jump(_) => LoweredOp::Jump(mapped),
                LoweredOp::BranchIf(_) => LoweredOp::BranchIf(mapped),
                LoweredOp::BranchUnless(_) => LoweredOp::BranchUnless(mapped),
                other => other,
            };
        }
    }

    Ok(Translation {
        unit: request.unit,
        label: request.label.clone(),
        stack_mode,
        ops: ctx.ops,
        n_locals: iseq.n_locals,
        n_temps: ctx.n_temps,
        deps: ctx.deps,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::method::CatchEntry;

    fn request(iseq: MethodIseq) -> CompileRequest {
        CompileRequest {
            unit: UnitKey {
                method: MethodId::from_raw(0),
                version: 1,
            },
            label: "m".to_owned(),
            iseq: Arc::new(iseq),
            callees: FxHashMap::default(),
            consts: FxHashMap::default(),
            blocklist: FxHashSet::default(),
        }
    }

    fn callee_snapshot(id: u32, iseq: MethodIseq) -> CalleeSnapshot {
        CalleeSnapshot {
            method: MethodId::from_raw(id),
            version: 1,
            label: format!("callee{id}"),
            iseq: Arc::new(iseq),
        }
    }

    #[test]
    fn class_definition_is_unsupported() {
        let iseq = MethodIseq::new(
            vec![Insn::DefineClass(SymbolId::from_raw(0)), Insn::Return],
            0,
            0,
        );
        let err = generate(&request(iseq)).unwrap_err();
        assert!(matches!(
            err,
            CompileError::Unsupported {
                insn: "define_class"
            }
        ));
    }

    #[test]
    fn handlers_force_frame_mode() {
        let plain = MethodIseq::new(vec![Insn::PushNil, Insn::Return], 0, 0);
        assert_eq!(
            generate(&request(plain)).unwrap().stack_mode,
            StackMode::Local
        );

        let guarded = MethodIseq::new(vec![Insn::PushNil, Insn::Return], 0, 0).with_catch(vec![
            CatchEntry {
                start: 0,
                end: 1,
                handler: 1,
            },
        ]);
        assert_eq!(
            generate(&request(guarded)).unwrap().stack_mode,
            StackMode::Frame
        );
    }

    #[test]
    fn folds_constant_int_triples() {
        let iseq = MethodIseq::new(
            vec![Insn::PushInt(2), Insn::PushInt(3), Insn::Add, Insn::Return],
            0,
            0,
        );
        let translation = generate(&request(iseq)).unwrap();
        assert_eq!(translation.ops.len(), 2);
        assert_eq!(translation.ops[0].op, LoweredOp::PushInt(5));
        assert_eq!(translation.ops[1].op, LoweredOp::Return);
    }

    #[test]
    fn fold_declines_when_branched_into() {
        // pc 3 jumps back to pc 1, the middle of the would-be triple.
        let iseq = MethodIseq::new(
            vec![
                Insn::PushInt(2),
                Insn::PushInt(3),
                Insn::Add,
                Insn::Jump(1),
                Insn::Return,
            ],
            0,
            0,
        );
        let translation = generate(&request(iseq)).unwrap();
        assert_eq!(translation.ops[0].op, LoweredOp::PushInt(2));
        assert_eq!(translation.ops[1].op, LoweredOp::PushInt(3));
        assert_eq!(translation.ops[3].op, LoweredOp::Jump(1));
    }

    #[test]
    fn fold_declines_on_overflow() {
        let iseq = MethodIseq::new(
            vec![
                Insn::PushInt(i64::MAX),
                Insn::PushInt(1),
                Insn::Add,
                Insn::Return,
            ],
            0,
            0,
        );
        let translation = generate(&request(iseq)).unwrap();
        assert_eq!(translation.ops.len(), 4);
    }

    #[test]
    fn branch_targets_are_remapped_past_folds() {
        // Source: 0 jump 4, 1..3 foldable triple, 4 return.
        let iseq = MethodIseq::new(
            vec![
                Insn::Jump(4),
                Insn::PushInt(1),
                Insn::PushInt(2),
                Insn::Add,
                Insn::Return,
            ],
            0,
            0,
        );
        let translation = generate(&request(iseq)).unwrap();
        // Lowered: [Jump, PushInt(3), Return]; the jump lands on index 2.
        assert_eq!(translation.ops.len(), 3);
        assert_eq!(translation.ops[0].op, LoweredOp::Jump(2));
        translation.validate().unwrap();
    }

    #[test]
    fn branch_to_nowhere_is_a_lowering_error() {
        let iseq = MethodIseq::new(vec![Insn::Jump(9), Insn::Return], 0, 0);
        assert!(matches!(
            generate(&request(iseq)).unwrap_err(),
            CompileError::Lowering { pc: 9 }
        ));
    }

    #[test]
    fn inlines_small_pure_callee() {
        let callee = MethodIseq::new(
            vec![
                Insn::LoadLocal(0),
                Insn::LoadLocal(1),
                Insn::Add,
                Insn::Return,
            ],
            2,
            2,
        );
        let name = SymbolId::from_raw(7);
        let caller = MethodIseq::new(
            vec![
                Insn::PushInt(1),
                Insn::PushInt(2),
                Insn::Send { name, argc: 2 },
                Insn::Return,
            ],
            0,
            0,
        );
        let mut req = request(caller);
        req.callees.insert(name, callee_snapshot(5, callee));
        let translation = generate(&req).unwrap();

        assert!(translation
            .ops
            .iter()
            .any(|l| matches!(l.op, LoweredOp::InlineGuard { callee, version: 1 } if callee == MethodId::from_raw(5))));
        assert!(!translation
            .ops
            .iter()
            .any(|l| matches!(l.op, LoweredOp::SendInterp { .. })));
        // Spill order: top of stack is the last argument.
        let spills: Vec<LoweredOp> = translation
            .ops
            .iter()
            .filter(|l| matches!(l.op, LoweredOp::StoreTemp(_)))
            .map(|l| l.op)
            .collect();
        assert_eq!(spills, vec![LoweredOp::StoreTemp(1), LoweredOp::StoreTemp(0)]);
        assert_eq!(translation.n_temps, 2);
        assert_eq!(
            translation.deps,
            vec![InlineDep::CalleeVersion {
                callee: MethodId::from_raw(5),
                version: 1
            }]
        );
        translation.validate().unwrap();
    }

    #[test]
    fn blocklist_suppresses_inlining() {
        let callee = MethodIseq::new(vec![Insn::PushInt(1), Insn::Return], 0, 0);
        let name = SymbolId::from_raw(3);
        let caller = MethodIseq::new(
            vec![Insn::Send { name, argc: 0 }, Insn::Return],
            0,
            0,
        );
        let mut req = request(caller);
        req.callees.insert(name, callee_snapshot(9, callee));
        req.blocklist.insert(MethodId::from_raw(9));
        let translation = generate(&req).unwrap();
        assert!(translation
            .ops
            .iter()
            .any(|l| matches!(l.op, LoweredOp::SendInterp { .. })));
        assert!(translation.deps.is_empty());
    }

    #[test]
    fn rejects_unbalanced_or_branching_callees() {
        let branching = MethodIseq::new(
            vec![Insn::PushBool(true), Insn::BranchIf(2), Insn::Return],
            0,
            0,
        );
        assert!(!inlinable_body(&branching));

        let leaves_two = MethodIseq::new(
            vec![Insn::PushInt(1), Insn::PushInt(2), Insn::Return],
            0,
            0,
        );
        assert!(!inlinable_body(&leaves_two));

        let underflows = MethodIseq::new(vec![Insn::Pop, Insn::Return], 0, 0);
        assert!(!inlinable_body(&underflows));

        let long_body: Vec<Insn> = std::iter::repeat(Insn::Nop)
            .take(INLINE_MAX_INSNS)
            .chain([Insn::PushNil, Insn::Return])
            .collect();
        let too_long = MethodIseq::new(long_body, 0, 0);
        let name = SymbolId::from_raw(1);
        let caller = MethodIseq::new(vec![Insn::Send { name, argc: 0 }, Insn::Return], 0, 0);
        let mut req = request(caller);
        req.callees.insert(name, callee_snapshot(2, too_long));
        let translation = generate(&req).unwrap();
        assert!(translation
            .ops
            .iter()
            .any(|l| matches!(l.op, LoweredOp::SendInterp { .. })));
    }

    #[test]
    fn folds_snapshotted_constants_unless_rebound_locally() {
        let folded = MethodIseq::new(vec![Insn::LoadConst(0), Insn::Return], 0, 0);
        let mut req = request(folded);
        req.consts.insert(
            0,
            ConstSnapshot {
                value: Value::Int(40),
                generation: 2,
            },
        );
        let translation = generate(&req).unwrap();
        assert_eq!(
            translation.ops[0].op,
            LoweredOp::FoldedConst {
                slot: 0,
                generation: 2,
                value: Value::Int(40),
            }
        );
        assert_eq!(
            translation.deps,
            vec![InlineDep::ConstBinding {
                slot: 0,
                generation: 2
            }]
        );

        let rebinds = MethodIseq::new(
            vec![
                Insn::LoadConst(0),
                Insn::PushInt(1),
                Insn::StoreConst(0),
                Insn::Return,
            ],
            0,
            0,
        );
        let mut req = request(rebinds);
        req.consts.insert(
            0,
            ConstSnapshot {
                value: Value::Int(40),
                generation: 2,
            },
        );
        let translation = generate(&req).unwrap();
        assert_eq!(translation.ops[0].op, LoweredOp::LoadConst(0));
        assert!(translation.deps.is_empty());
    }

    #[test]
    fn inlined_callee_reads_unset_locals_as_nil() {
        // Callee has one param and one extra local it never writes.
        let callee = MethodIseq::new(
            vec![
                Insn::LoadLocal(0),
                Insn::LoadLocal(1),
                Insn::Eq,
                Insn::Return,
            ],
            1,
            2,
        );
        let name = SymbolId::from_raw(4);
        let caller = MethodIseq::new(
            vec![Insn::PushNil, Insn::Send { name, argc: 1 }, Insn::Return],
            0,
            0,
        );
        let mut req = request(caller);
        req.callees.insert(name, callee_snapshot(6, callee));
        let translation = generate(&req).unwrap();
        let body: Vec<LoweredOp> = translation.ops.iter().map(|l| l.op).collect();
        assert!(body.contains(&LoweredOp::LoadTemp(0)));
        assert!(body.contains(&LoweredOp::PushNil));
        assert_eq!(translation.n_temps, 1);
    }
}
