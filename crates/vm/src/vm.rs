//! The virtual machine: tables, interpreter loop, and tiered dispatch.
//!
//! Execution is per-method: every send builds a fresh frame and either runs
//! it through a loaded native entry or the interpreter. Mutations that break
//! JIT assumptions (redefinition, constant rebinding, trace hooks) are routed
//! through the runtime here, in the same call that performs them, so no stale
//! entry can be dispatched afterwards.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::errors::VmError;
use crate::frame::Frame;
use crate::hooks::{TraceHooks, TraceKind};
use crate::method::{ConstTable, MethodId, MethodIseq, MethodTable, SymbolId};
use crate::opcodes::Insn;
use crate::value::Value;

#[cfg(feature = "jit")]
use crate::jit::codegen::{CalleeSnapshot, CompileRequest, ConstSnapshot};
#[cfg(feature = "jit")]
use crate::jit::exec::{self, NativeSignal};
#[cfg(feature = "jit")]
use crate::jit::runtime::{JitRuntime, RecompilePlan};
#[cfg(feature = "jit")]
use crate::jit::toolchain::PortableToolchain;
#[cfg(feature = "jit")]
use crate::jit::types::{JitConfig, JitMetrics};
#[cfg(feature = "jit")]
use crate::jit::unit::UnitKey;
#[cfg(feature = "jit")]
use rustc_hash::FxHashMap;

/// Frames above this depth refuse to run.
pub const MAX_CALL_DEPTH: usize = 256;

/// What a finished invocation left behind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Invoked {
    Return(Value),
    /// An exception escaped the method.
    Raised,
}

/// A complete virtual machine instance.
pub struct Vm {
    pub(crate) methods: MethodTable,
    pub(crate) consts: ConstTable,
    pub(crate) hooks: TraceHooks,
    classes: FxHashSet<SymbolId>,
    pub(crate) output: Vec<Value>,
    #[cfg(feature = "jit")]
    pub(crate) jit: JitRuntime,
}

impl Vm {
    pub fn new() -> Self {
        #[cfg(feature = "jit")]
        {
            Self::with_jit(JitRuntime::new(
                JitConfig::default(),
                Arc::new(PortableToolchain),
            ))
        }
        #[cfg(not(feature = "jit"))]
        {
            Vm {
                methods: MethodTable::new(),
                consts: ConstTable::new(),
                hooks: TraceHooks::new(),
                classes: FxHashSet::default(),
                output: Vec::new(),
            }
        }
    }

    /// Machine with a specific JIT runtime, usually one with a non-default
    /// configuration or toolchain.
    #[cfg(feature = "jit")]
    pub fn with_jit(jit: JitRuntime) -> Self {
        Vm {
            methods: MethodTable::new(),
            consts: ConstTable::new(),
            hooks: TraceHooks::new(),
            classes: FxHashSet::default(),
            output: Vec::new(),
            jit,
        }
    }

    pub fn intern(&mut self, name: &str) -> SymbolId {
        self.methods.intern(name)
    }

    /// Define or redefine a method. Redefinition retires the old version's
    /// unit and every unit that inlined it.
    pub fn define_method(&mut self, name: SymbolId, iseq: MethodIseq) -> MethodId {
        let (id, old_version) = self.methods.define(name, iseq);
        #[cfg(feature = "jit")]
        if let Some(old_version) = old_version {
            let label = self.methods.symbol_name(name).to_owned();
            let plans = self.jit.on_method_redefined(id, old_version, &label);
            self.apply_plans(plans);
        }
        #[cfg(not(feature = "jit"))]
        let _ = old_version;
        id
    }

    pub fn define_const(&mut self, value: Value) -> u16 {
        self.consts.define(value)
    }

    /// Rebind a constant slot. Units that folded the old binding are retired
    /// and recompiled; callable from inside a running native frame.
    pub fn const_store(&mut self, slot: u16, value: Value) -> Result<(), VmError> {
        self.consts.store(slot, value)?;
        #[cfg(feature = "jit")]
        {
            let plans = self.jit.on_const_rebound(slot);
            self.apply_plans(plans);
        }
        Ok(())
    }

    pub fn const_value(&self, slot: u16) -> Option<Value> {
        self.consts.get(slot).map(|entry| entry.value)
    }

    /// Flip a trace hook. Enabling line tracing cancels all generated code.
    pub fn set_trace(&mut self, kind: TraceKind, enabled: bool) {
        let _changed = self.hooks.set(kind, enabled);
        #[cfg(feature = "jit")]
        if _changed {
            self.jit.on_trace_changed(kind, enabled);
        }
    }

    /// Call a method from the outside. An exception nothing handled becomes
    /// an error here.
    pub fn call(&mut self, name: SymbolId, args: Vec<Value>) -> Result<Value, VmError> {
        match self.invoke_symbol(name, args, 0)? {
            Invoked::Return(value) => Ok(value),
            Invoked::Raised => Err(VmError::UnhandledException),
        }
    }

    pub fn output(&self) -> &[Value] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.output)
    }

    pub fn hooks(&self) -> &TraceHooks {
        &self.hooks
    }

    pub fn class_defined(&self, name: SymbolId) -> bool {
        self.classes.contains(&name)
    }

    #[cfg(feature = "jit")]
    pub fn jit(&self) -> &JitRuntime {
        &self.jit
    }

    #[cfg(feature = "jit")]
    pub fn jit_mut(&mut self) -> &mut JitRuntime {
        &mut self.jit
    }

    /// The machine a forked child process starts with: same tables and
    /// loaded code, but no ownership of compiled files and no in-flight
    /// compilation.
    pub fn fork(&self) -> Vm {
        Vm {
            methods: self.methods.clone(),
            consts: self.consts.clone(),
            hooks: self.hooks.clone(),
            classes: self.classes.clone(),
            output: self.output.clone(),
            #[cfg(feature = "jit")]
            jit: self.jit.fork_inherited(),
        }
    }

    #[cfg(feature = "jit")]
    fn apply_plans(&mut self, plans: Vec<RecompilePlan>) {
        for plan in plans {
            let Some(request) = self.build_compile_request(plan.key, plan.blocklist.clone())
            else {
                continue;
            };
            self.jit.resubmit(plan, request);
        }
    }

    /// Snapshot everything the compiler needs for one unit: the body, every
    /// resolvable callee, and every constant binding the body reads.
    #[cfg(feature = "jit")]
    fn build_compile_request(
        &self,
        key: UnitKey,
        blocklist: FxHashSet<MethodId>,
    ) -> Option<CompileRequest> {
        let def = self.methods.get(key.method)?;
        if def.version != key.version {
            return None;
        }
        let label = self.methods.symbol_name(def.name).to_owned();
        let iseq = Arc::clone(&def.iseq);

        let mut callees: FxHashMap<SymbolId, CalleeSnapshot> = FxHashMap::default();
        let mut consts: FxHashMap<u16, ConstSnapshot> = FxHashMap::default();
        for insn in &iseq.insns {
            match insn {
                Insn::Send { name, .. } => {
                    if let Some(callee) = self.methods.lookup(*name) {
                        callees.insert(
                            *name,
                            CalleeSnapshot {
                                method: callee.id,
                                version: callee.version,
                                label: self.methods.symbol_name(callee.name).to_owned(),
                                iseq: Arc::clone(&callee.iseq),
                            },
                        );
                    }
                }
                Insn::LoadConst(slot) => {
                    if let Some(entry) = self.consts.get(*slot) {
                        consts.insert(
                            *slot,
                            ConstSnapshot {
                                value: entry.value,
                                generation: entry.generation,
                            },
                        );
                    }
                }
                _ => {}
            }
        }

        Some(CompileRequest {
            unit: key,
            label,
            iseq,
            callees,
            consts,
            blocklist,
        })
    }

    /// Run one send: resolve, check arity, then dispatch native or interpret.
    pub(crate) fn invoke_symbol(
        &mut self,
        name: SymbolId,
        args: Vec<Value>,
        depth: usize,
    ) -> Result<Invoked, VmError> {
        if depth >= MAX_CALL_DEPTH {
            return Err(VmError::DepthLimit);
        }
        let def = self
            .methods
            .lookup(name)
            .ok_or_else(|| VmError::UnknownMethod(self.methods.symbol_name(name).to_owned()))?;
        if usize::from(def.iseq.n_params) != args.len() {
            return Err(VmError::ArityMismatch {
                method: self.methods.symbol_name(name).to_owned(),
                expected: def.iseq.n_params,
                given: u8::try_from(args.len()).unwrap_or(u8::MAX),
            });
        }
        let iseq = Arc::clone(&def.iseq);
        #[cfg(feature = "jit")]
        let key = UnitKey {
            method: def.id,
            version: def.version,
        };
        let mut frame = Frame::for_call(&iseq, args);

        #[cfg(feature = "jit")]
        {
            if let Some((unit, loaded)) = self.jit.dispatch(key) {
                JitMetrics::bump(&self.jit.shared().metrics.native_calls);
                let signal = {
                    let _pin = loaded.pin();
                    exec::run_native(self, &unit, &loaded, &mut frame, depth)?
                };
                match signal {
                    NativeSignal::Return(value) => return Ok(Invoked::Return(value)),
                    NativeSignal::Raise { pc } => {
                        return match iseq.find_handler(pc) {
                            Some(handler) => {
                                frame.stack.clear();
                                frame.pc = handler;
                                self.run_frame(&iseq, &mut frame, depth)
                            }
                            None => Ok(Invoked::Raised),
                        };
                    }
                    NativeSignal::Bailout { pc } => {
                        JitMetrics::bump(&self.jit.shared().metrics.bailouts);
                        frame.pc = pc;
                        return self.run_frame(&iseq, &mut frame, depth);
                    }
                }
            }

            // The call that crosses the threshold still interprets; the
            // compiled entry serves the calls after it.
            if let Some(blocklist) = self
                .jit
                .begin_promotion(key, self.methods.symbol_name(name))
            {
                if let Some(request) = self.build_compile_request(key, blocklist) {
                    self.jit.submit(request);
                }
            }
            JitMetrics::bump(&self.jit.shared().metrics.interpreted_calls);
        }

        self.run_frame(&iseq, &mut frame, depth)
    }

    /// The interpreter proper, resumable at any pc.
    fn run_frame(
        &mut self,
        iseq: &MethodIseq,
        frame: &mut Frame,
        depth: usize,
    ) -> Result<Invoked, VmError> {
        loop {
            let pc = frame.pc;
            let Some(insn) = iseq.insns.get(usize::try_from(pc).unwrap_or(usize::MAX)) else {
                return Err(VmError::BadBranchTarget { target: pc });
            };
            self.hooks.observe_line();
            let mut next = pc.saturating_add(1);

            match *insn {
                Insn::Nop => {}
                Insn::PushInt(value) => frame.push(Value::Int(value)),
                Insn::PushBool(value) => frame.push(Value::Bool(value)),
                Insn::PushNil => frame.push(Value::Nil),
                Insn::LoadLocal(slot) => {
                    let value = frame.local(slot)?;
                    frame.push(value);
                }
                Insn::StoreLocal(slot) => {
                    let value = frame.pop(pc)?;
                    frame.set_local(slot, value)?;
                }
                Insn::Pop => {
                    frame.pop(pc)?;
                }
                Insn::Dup => {
                    let top = frame
                        .stack
                        .last()
                        .copied()
                        .ok_or(VmError::StackUnderflow { pc })?;
                    frame.push(top);
                }
                Insn::Add | Insn::Sub | Insn::Mul => {
                    let rhs = frame.pop(pc)?;
                    let lhs = frame.pop(pc)?;
                    match (lhs, rhs) {
                        (Value::Int(a), Value::Int(b)) => {
                            let result = match insn {
                                Insn::Add => a.wrapping_add(b),
                                Insn::Sub => a.wrapping_sub(b),
                                _ => a.wrapping_mul(b),
                            };
                            frame.push(Value::Int(result));
                        }
                        _ => match iseq.find_handler(pc) {
                            Some(handler) => {
                                frame.stack.clear();
                                next = handler;
                            }
                            None => return Ok(Invoked::Raised),
                        },
                    }
                }
                Insn::Lt => {
                    let rhs = frame.pop(pc)?;
                    let lhs = frame.pop(pc)?;
                    match (lhs, rhs) {
                        (Value::Int(a), Value::Int(b)) => frame.push(Value::Bool(a < b)),
                        _ => match iseq.find_handler(pc) {
                            Some(handler) => {
                                frame.stack.clear();
                                next = handler;
                            }
                            None => return Ok(Invoked::Raised),
                        },
                    }
                }
                Insn::Eq => {
                    let rhs = frame.pop(pc)?;
                    let lhs = frame.pop(pc)?;
                    frame.push(Value::Bool(lhs == rhs));
                }
                Insn::Jump(target) => next = target,
                Insn::BranchIf(target) => {
                    if frame.pop(pc)?.is_truthy() {
                        next = target;
                    }
                }
                Insn::BranchUnless(target) => {
                    if !frame.pop(pc)?.is_truthy() {
                        next = target;
                    }
                }
                Insn::LoadConst(slot) => {
                    let entry = self.consts.get(slot).ok_or(VmError::UnknownConst { slot })?;
                    frame.push(entry.value);
                }
                Insn::StoreConst(slot) => {
                    let value = frame.pop(pc)?;
                    self.const_store(slot, value)?;
                }
                Insn::Print => {
                    let value = frame.pop(pc)?;
                    self.output.push(value);
                }
                Insn::Send { name, argc } => {
                    let mut args = vec![Value::Nil; usize::from(argc)];
                    for slot in args.iter_mut().rev() {
                        *slot = frame.pop(pc)?;
                    }
                    match self.invoke_symbol(name, args, depth.saturating_add(1))? {
                        Invoked::Return(value) => frame.push(value),
                        Invoked::Raised => match iseq.find_handler(pc) {
                            Some(handler) => {
                                frame.stack.clear();
                                next = handler;
                            }
                            None => return Ok(Invoked::Raised),
                        },
                    }
                }
                Insn::Raise => match iseq.find_handler(pc) {
                    Some(handler) => {
                        frame.stack.clear();
                        next = handler;
                    }
                    None => return Ok(Invoked::Raised),
                },
                Insn::Return => {
                    let value = frame.pop(pc)?;
                    return Ok(Invoked::Return(value));
                }
                Insn::DefineClass(name) => {
                    self.classes.insert(name);
                    self.hooks.observe_class();
                }
            }
            frame.pc = next;
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
