//! The instruction set.
//!
//! Instructions form a closed enum: the generator matches on every variant,
//! so adding an instruction without teaching the JIT tier about it is a
//! compile error, not a silent interpretation-only fallback.

use crate::method::SymbolId;
use strum::IntoStaticStr;

/// One bytecode instruction.
///
/// Branch targets are absolute pcs into the owning instruction sequence.
/// `Send` resolves its callee by name at call time through the method table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Insn {
    /// No effect.
    Nop,
    /// Push an integer literal.
    PushInt(i64),
    /// Push a boolean literal.
    PushBool(bool),
    /// Push nil.
    PushNil,
    /// Push the value of a local slot.
    LoadLocal(u16),
    /// Pop into a local slot.
    StoreLocal(u16),
    /// Discard the top of the stack.
    Pop,
    /// Duplicate the top of the stack.
    Dup,
    /// Pop two ints, push their wrapping sum. Raises on non-int operands.
    Add,
    /// Pop two ints, push their wrapping difference. Raises on non-int operands.
    Sub,
    /// Pop two ints, push their wrapping product. Raises on non-int operands.
    Mul,
    /// Pop two ints, push `a < b`. Raises on non-int operands.
    Lt,
    /// Pop two values, push structural equality.
    Eq,
    /// Unconditional branch.
    Jump(u32),
    /// Pop; branch when truthy.
    BranchIf(u32),
    /// Pop; branch when falsy.
    BranchUnless(u32),
    /// Push the current value of a constant slot.
    LoadConst(u16),
    /// Pop into a constant slot, bumping its generation.
    StoreConst(u16),
    /// Pop and append to the VM output buffer.
    Print,
    /// Pop `argc` arguments and call `name`; push the result.
    Send {
        /// Callee name, resolved through the method table.
        name: SymbolId,
        /// Argument count popped from the operand stack.
        argc: u8,
    },
    /// Raise an exception, unwinding to the innermost covering handler.
    Raise,
    /// Pop and return the top of the stack.
    Return,
    /// Register a class name. Interpreted only: the generator rejects units
    /// containing it and they permanently stay on the interpreter.
    DefineClass(SymbolId),
}

impl Insn {
    /// Target pc for branching instructions.
    pub fn branch_target(&self) -> Option<u32> {
        match self {
            Insn::Jump(t) | Insn::BranchIf(t) | Insn::BranchUnless(t) => Some(*t),
            _ => None,
        }
    }

    /// Static name used in diagnostics, e.g. `define_class`.
    pub fn name(&self) -> &'static str {
        self.into()
    }
}
