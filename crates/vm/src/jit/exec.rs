//! Execution of loaded translations.
//!
//! Generated code runs against the caller's frame. In `Local` stack mode the
//! operand stack lives in a private scratch vector and is written back to the
//! frame only when control returns to the interpreter; in `Frame` mode every
//! op works on the frame stack directly so exception handlers observe real
//! depths. Each exit that resumes interpretation reports the source pc the
//! interpreter must continue from, with the frame stack already synchronized.

use crate::errors::VmError;
use crate::frame::Frame;
use crate::jit::translation::{LoweredOp, StackMode};
use crate::jit::types::UnitState;
use crate::jit::unit::{LoadedUnit, Unit};
use crate::value::Value;
use crate::vm::{Invoked, Vm};

/// How a native execution ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeSignal {
    /// Ran to completion with this return value.
    Return(Value),
    /// An exception was raised at this source pc; the caller searches the
    /// catch table from here.
    Raise { pc: u32 },
    /// A guard failed or the unit was cancelled; interpretation resumes at
    /// this source pc.
    Bailout { pc: u32 },
}

/// The unit is still the one that was dispatched: active and activated in
/// the current cancellation epoch.
fn in_sync(vm: &Vm, unit: &Unit, loaded: &LoadedUnit) -> bool {
    unit.state() == UnitState::Active && vm.jit.cancel_epoch() == loaded.epoch
}

fn push(frame: &mut Frame, scratch: &mut Vec<Value>, frame_mode: bool, value: Value) {
    if frame_mode {
        frame.push(value);
    } else {
        scratch.push(value);
    }
}

fn pop(
    frame: &mut Frame,
    scratch: &mut Vec<Value>,
    frame_mode: bool,
    pc: u32,
) -> Result<Value, VmError> {
    if frame_mode {
        frame.pop(pc)
    } else {
        scratch.pop().ok_or(VmError::StackUnderflow { pc })
    }
}

/// Write the scratch stack back to the frame. A no-op in frame mode, where
/// the frame already holds every operand.
fn flush(frame: &mut Frame, scratch: &mut Vec<Value>, frame_mode: bool) {
    if !frame_mode {
        frame.stack.append(scratch);
    }
}

/// Run one loaded unit to a signal.
///
/// `frame` is the freshly built frame for this call; `depth` is the call
/// depth the frame runs at.
pub(crate) fn run_native(
    vm: &mut Vm,
    unit: &Unit,
    loaded: &LoadedUnit,
    frame: &mut Frame,
    depth: usize,
) -> Result<NativeSignal, VmError> {
    let translation = &loaded.translation;
    let frame_mode = translation.stack_mode == StackMode::Frame;
    let mut scratch: Vec<Value> = Vec::new();
    let mut temps = vec![Value::Nil; usize::from(translation.n_temps)];

    if !in_sync(vm, unit, loaded) {
        flush(frame, &mut scratch, frame_mode);
        return Ok(NativeSignal::Bailout { pc: 0 });
    }

    let mut ip: usize = 0;
    loop {
        let Some(lowered) = translation.ops.get(ip) else {
            return Err(VmError::BadBranchTarget {
                target: u32::try_from(ip).unwrap_or(u32::MAX),
            });
        };
        let src = lowered.src_pc;
        let mut next = ip.saturating_add(1);

        match lowered.op {
            LoweredOp::Nop => {}
            LoweredOp::PushInt(value) => {
                push(frame, &mut scratch, frame_mode, Value::Int(value));
            }
            LoweredOp::PushBool(value) => {
                push(frame, &mut scratch, frame_mode, Value::Bool(value));
            }
            LoweredOp::PushNil => push(frame, &mut scratch, frame_mode, Value::Nil),
            LoweredOp::LoadLocal(slot) => {
                let value = frame.local(slot)?;
                push(frame, &mut scratch, frame_mode, value);
            }
            LoweredOp::StoreLocal(slot) => {
                let value = pop(frame, &mut scratch, frame_mode, src)?;
                frame.set_local(slot, value)?;
            }
            LoweredOp::Pop => {
                pop(frame, &mut scratch, frame_mode, src)?;
            }
            LoweredOp::Dup => {
                let top = if frame_mode {
                    frame.stack.last().copied()
                } else {
                    scratch.last().copied()
                };
                let top = top.ok_or(VmError::StackUnderflow { pc: src })?;
                push(frame, &mut scratch, frame_mode, top);
            }
            LoweredOp::Add | LoweredOp::Sub | LoweredOp::Mul => {
                let rhs = pop(frame, &mut scratch, frame_mode, src)?;
                let lhs = pop(frame, &mut scratch, frame_mode, src)?;
                match (lhs, rhs) {
                    (Value::Int(a), Value::Int(b)) => {
                        let result = match lowered.op {
                            LoweredOp::Add => a.wrapping_add(b),
                            LoweredOp::Sub => a.wrapping_sub(b),
                            _ => a.wrapping_mul(b),
                        };
                        push(frame, &mut scratch, frame_mode, Value::Int(result));
                    }
                    _ => {
                        flush(frame, &mut scratch, frame_mode);
                        return Ok(NativeSignal::Raise { pc: src });
                    }
                }
            }
            LoweredOp::Lt => {
                let rhs = pop(frame, &mut scratch, frame_mode, src)?;
                let lhs = pop(frame, &mut scratch, frame_mode, src)?;
                match (lhs, rhs) {
                    (Value::Int(a), Value::Int(b)) => {
                        push(frame, &mut scratch, frame_mode, Value::Bool(a < b));
                    }
                    _ => {
                        flush(frame, &mut scratch, frame_mode);
                        return Ok(NativeSignal::Raise { pc: src });
                    }
                }
            }
            LoweredOp::Eq => {
                let rhs = pop(frame, &mut scratch, frame_mode, src)?;
                let lhs = pop(frame, &mut scratch, frame_mode, src)?;
                push(frame, &mut scratch, frame_mode, Value::Bool(lhs == rhs));
            }
            LoweredOp::Jump(target) => {
                next = usize::try_from(target).unwrap_or(usize::MAX);
            }
            LoweredOp::BranchIf(target) => {
                let value = pop(frame, &mut scratch, frame_mode, src)?;
                if value.is_truthy() {
                    next = usize::try_from(target).unwrap_or(usize::MAX);
                }
            }
            LoweredOp::BranchUnless(target) => {
                let value = pop(frame, &mut scratch, frame_mode, src)?;
                if !value.is_truthy() {
                    next = usize::try_from(target).unwrap_or(usize::MAX);
                }
            }
            LoweredOp::LoadConst(slot) => {
                let entry = vm.consts.get(slot).ok_or(VmError::UnknownConst { slot })?;
                push(frame, &mut scratch, frame_mode, entry.value);
            }
            LoweredOp::StoreConst(slot) => {
                let value = pop(frame, &mut scratch, frame_mode, src)?;
                vm.const_store(slot, value)?;
            }
            LoweredOp::FoldedConst {
                slot,
                generation,
                value,
            } => match vm.consts.get(slot) {
                Some(entry) if entry.generation == generation => {
                    push(frame, &mut scratch, frame_mode, value);
                }
                _ => {
                    flush(frame, &mut scratch, frame_mode);
                    return Ok(NativeSignal::Bailout { pc: src });
                }
            },
            LoweredOp::Print => {
                let value = pop(frame, &mut scratch, frame_mode, src)?;
                vm.output.push(value);
            }
            LoweredOp::SendInterp { name, argc } => {
                if !in_sync(vm, unit, loaded) {
                    flush(frame, &mut scratch, frame_mode);
                    return Ok(NativeSignal::Bailout { pc: src });
                }
                let mut args = vec![Value::Nil; usize::from(argc)];
                for slot in args.iter_mut().rev() {
                    *slot = pop(frame, &mut scratch, frame_mode, src)?;
                }
                match vm.invoke_symbol(name, args, depth.saturating_add(1))? {
                    Invoked::Return(value) => {
                        push(frame, &mut scratch, frame_mode, value);
                        // The callee may have redefined a method or rebound a
                        // constant this unit depends on.
                        if !in_sync(vm, unit, loaded) {
                            flush(frame, &mut scratch, frame_mode);
                            return Ok(NativeSignal::Bailout {
                                pc: src.saturating_add(1),
                            });
                        }
                    }
                    Invoked::Raised => {
                        flush(frame, &mut scratch, frame_mode);
                        return Ok(NativeSignal::Raise { pc: src });
                    }
                }
            }
            LoweredOp::InlineGuard { callee, version } => {
                let live = vm.methods.version_of(callee);
                if !in_sync(vm, unit, loaded) || live != Some(version) {
                    flush(frame, &mut scratch, frame_mode);
                    return Ok(NativeSignal::Bailout { pc: src });
                }
            }
            LoweredOp::StoreTemp(slot) => {
                let value = pop(frame, &mut scratch, frame_mode, src)?;
                let cell = temps
                    .get_mut(usize::from(slot))
                    .ok_or(VmError::LocalOutOfRange { index: slot })?;
                *cell = value;
            }
            LoweredOp::LoadTemp(slot) => {
                let value = temps
                    .get(usize::from(slot))
                    .copied()
                    .ok_or(VmError::LocalOutOfRange { index: slot })?;
                push(frame, &mut scratch, frame_mode, value);
            }
            LoweredOp::Raise => {
                flush(frame, &mut scratch, frame_mode);
                return Ok(NativeSignal::Raise { pc: src });
            }
            LoweredOp::Return => {
                let value = pop(frame, &mut scratch, frame_mode, src)?;
                if !in_sync(vm, unit, loaded) {
                    push(frame, &mut scratch, frame_mode, value);
                    flush(frame, &mut scratch, frame_mode);
                    return Ok(NativeSignal::Bailout { pc: src });
                }
                return Ok(NativeSignal::Return(value));
            }
        }
        ip = next;
    }
}
