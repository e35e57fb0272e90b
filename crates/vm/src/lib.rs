//! # Kestrel VM
//!
//! A stack-based bytecode virtual machine with an embedded method JIT.
//!
//! ## Overview
//!
//! Kestrel executes methods through a frame-per-call interpreter and promotes
//! hot methods to native artifacts produced by an external toolchain:
//! - **Correctness first**: generated code must match the interpreter, or bail
//!   out to it mid-method
//! - **Asynchronous compilation**: a background worker turns hot methods into
//!   loadable artifacts without blocking execution
//! - **Honest invalidation**: method redefinition, constant rebinding and
//!   tracing retire generated code in the same call that mutates state
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                            Vm                                │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────────┐ │
//! │  │ MethodTable │  │ ConstTable  │  │  Frame (per call)    │ │
//! │  └─────────────┘  └─────────────┘  └──────────────────────┘ │
//! │                                                              │
//! │  ┌─────────────┐  ┌─────────────────────────────────────── ┐│
//! │  │ TraceHooks  │  │ JitRuntime (units, queue, cache, log)  ││
//! │  └─────────────┘  └─────────────────────────────────────── ┘│
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │              Toolchain (external compiler process)           │
//! │            translation bundle (.tu) -> artifact (.kso)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Components
//!
//! - [`vm::Vm`]: tables, interpreter, and tiered dispatch
//! - [`frame::Frame`]: locals, operand stack, and resume point for one call
//! - [`jit::runtime::JitRuntime`]: unit registry, compile queue, and cache
//! - [`jit::codegen`]: lowering, constant folding, and call inlining
//! - [`jit::toolchain`]: the external-compiler boundary
//!
//! ## Usage
//!
//! ```ignore
//! use kestrel_vm::vm::Vm;
//! use kestrel_vm::method::MethodIseq;
//! use kestrel_vm::opcodes::Insn;
//! use kestrel_vm::value::Value;
//!
//! let mut vm = Vm::new();
//! let name = vm.intern("answer");
//! vm.define_method(name, MethodIseq::new(vec![Insn::PushInt(42), Insn::Return], 0, 0));
//! assert_eq!(vm.call(name, vec![])?, Value::Int(42));
//! ```

pub mod errors;
pub mod frame;
pub mod hooks;
pub mod method;
pub mod opcodes;
pub mod value;
pub mod vm;

#[cfg(feature = "jit")]
pub mod jit;

#[cfg(all(test, feature = "jit"))]
mod tests;
