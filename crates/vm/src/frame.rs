//! Call frames.

use crate::errors::VmError;
use crate::method::MethodIseq;
use crate::value::Value;

/// One activation: locals, operand stack, and the resume pc.
///
/// Frames own their operand stacks. Native execution in local-stack mode
/// keeps temporaries in a private buffer and writes them back here only when
/// bailing out; frame-stack mode operates on `stack` directly, so the frame
/// is always interpreter-current.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Local slots; arguments occupy the leading slots, the rest start nil.
    pub locals: Vec<Value>,
    /// Operand stack.
    pub stack: Vec<Value>,
    /// Next instruction to execute when interpreting.
    pub pc: u32,
}

impl Frame {
    /// Build the frame for calling `iseq` with `args` already arity-checked.
    pub fn for_call(iseq: &MethodIseq, args: Vec<Value>) -> Self {
        let mut locals = args;
        locals.resize(usize::from(iseq.n_locals), Value::Nil);
        Frame {
            locals,
            stack: Vec::new(),
            pc: 0,
        }
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self, pc: u32) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow { pc })
    }

    pub fn local(&self, index: u16) -> Result<Value, VmError> {
        self.locals
            .get(usize::from(index))
            .copied()
            .ok_or(VmError::LocalOutOfRange { index })
    }

    pub fn set_local(&mut self, index: u16, value: Value) -> Result<(), VmError> {
        let slot = self
            .locals
            .get_mut(usize::from(index))
            .ok_or(VmError::LocalOutOfRange { index })?;
        *slot = value;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::opcodes::Insn;

    #[test]
    fn call_frame_pads_locals_with_nil() {
        let iseq = MethodIseq::new(vec![Insn::Return], 2, 4);
        let frame = Frame::for_call(&iseq, vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(
            frame.locals,
            vec![Value::Int(1), Value::Int(2), Value::Nil, Value::Nil]
        );
        assert!(frame.stack.is_empty());
        assert_eq!(frame.pc, 0);
    }

    #[test]
    fn pop_on_empty_reports_pc() {
        let iseq = MethodIseq::new(vec![Insn::Return], 0, 0);
        let mut frame = Frame::for_call(&iseq, vec![]);
        match frame.pop(7) {
            Err(VmError::StackUnderflow { pc }) => assert_eq!(pc, 7),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
