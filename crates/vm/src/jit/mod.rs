//! Method-level JIT tier for the Kestrel VM.
//!
//! This module provides everything the tiered execution model needs: call
//! counting, bytecode lowering with inlining and constant folding, the
//! asynchronous compilation pipeline, the bounded artifact cache, and the
//! runtime coordination for invalidation, fork, and shutdown.
//!
//! The actual machine-code generation is delegated to a [`toolchain::Toolchain`]
//! so the tier itself stays independent of any one compiler backend.

pub mod cache;
pub mod codegen;
pub mod counter;
pub mod events;
pub mod exec;
pub mod pipeline;
pub mod runtime;
pub mod toolchain;
pub mod translation;
pub mod types;
pub mod unit;
