//! Error types for the VM and the JIT tier.
//!
//! `VmError` is the only error type interpreter callers ever see. The JIT
//! internals use `CompileError`/`ToolchainError`, which are absorbed at the
//! pipeline boundary: a failed compilation demotes the unit to interpreted
//! execution and is never surfaced to running programs.

/// Errors surfaced by the interpreter to embedding code.
///
/// In-language exceptions (`Raise`, arithmetic on incompatible operands) are
/// not errors: they unwind through catch tables and only become
/// [`VmError::UnhandledException`] when no handler exists.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Call to a method name with no definition.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Call with the wrong number of arguments.
    #[error("wrong number of arguments for {method}: expected {expected}, got {given}")]
    ArityMismatch {
        /// Method name.
        method: String,
        /// Declared parameter count.
        expected: u8,
        /// Arguments supplied by the caller.
        given: u8,
    },

    /// Operand stack popped while empty.
    #[error("operand stack underflow at pc {pc}")]
    StackUnderflow {
        /// Program counter of the faulting instruction.
        pc: u32,
    },

    /// Local slot index outside the frame's local table.
    #[error("local index {index} out of range")]
    LocalOutOfRange {
        /// Offending slot index.
        index: u16,
    },

    /// Constant slot index outside the constant table.
    #[error("constant slot {slot} out of range")]
    UnknownConst {
        /// Offending slot index.
        slot: u16,
    },

    /// Branch or fall-through past the end of the instruction stream.
    #[error("branch target {target} out of range")]
    BadBranchTarget {
        /// Offending target pc.
        target: u32,
    },

    /// An exception unwound out of the entry frame.
    #[error("unhandled exception")]
    UnhandledException,

    /// Call stack exceeded the recursion limit.
    #[error("call depth limit exceeded")]
    DepthLimit,
}

/// Errors produced while turning a unit into a translation. Absorbed by the
/// pipeline; never visible outside the JIT tier.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The unit contains an instruction the generator does not lower.
    /// Permanent for the unit: it stays interpreted and is never retried.
    #[error("unsupported instruction: {insn}")]
    Unsupported {
        /// Name of the rejected instruction.
        insn: &'static str,
    },

    /// Lowering produced an inconsistent branch map. Treated as a unit
    /// failure rather than a panic.
    #[error("lowering inconsistency at pc {pc}")]
    Lowering {
        /// Source pc whose target could not be mapped.
        pc: u32,
    },
}

/// Errors from the external translation toolchain.
#[derive(Debug, thiserror::Error)]
pub enum ToolchainError {
    /// The compiler process could not be started.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        /// Program that failed to start.
        command: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The compiler process exited with a non-zero status.
    #[error("compiler exited with status {status}")]
    Exit {
        /// Exit code, or -1 when killed by a signal.
        status: i32,
        /// Captured stderr of the compiler process.
        stderr: String,
    },

    /// The compiler process exceeded its deadline and was killed.
    #[error("compiler timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured deadline in milliseconds.
        timeout_ms: u64,
    },

    /// Source or artifact did not parse as a valid translation bundle.
    #[error("malformed bundle: {0}")]
    Malformed(String),

    /// File I/O around the toolchain invocation failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
