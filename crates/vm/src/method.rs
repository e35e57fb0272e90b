//! Method and constant tables.
//!
//! Methods are looked up by interned name. Each definition carries a
//! monotonically increasing version: redefining a name replaces the body and
//! bumps the version, which is how every stale-code check in the JIT tier
//! recognizes outdated assumptions. Constant slots carry a generation counter
//! with the same role for constant-binding assumptions.

use crate::errors::VmError;
use crate::opcodes::Insn;
use crate::value::Value;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Interned method or class name.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SymbolId(u32);

impl SymbolId {
    /// Build a symbol from its raw interning index.
    pub fn from_raw(raw: u32) -> Self {
        SymbolId(raw)
    }
}

/// Stable method identity, independent of redefinitions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MethodId(u32);

impl MethodId {
    /// Build a method id from its raw registry index.
    pub fn from_raw(raw: u32) -> Self {
        MethodId(raw)
    }
}

/// One exception-handler range: pcs in `[start, end)` unwind to `handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchEntry {
    /// First covered pc.
    pub start: u32,
    /// One past the last covered pc.
    pub end: u32,
    /// Handler entry pc.
    pub handler: u32,
}

/// An instruction sequence plus its frame layout and handler table.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodIseq {
    /// The instruction stream.
    pub insns: Vec<Insn>,
    /// Declared parameter count; arguments fill the first local slots.
    pub n_params: u8,
    /// Total local slot count, at least `n_params`.
    pub n_locals: u16,
    /// Exception handler ranges.
    pub catch_table: Vec<CatchEntry>,
}

impl MethodIseq {
    /// Build a sequence without handlers. `n_locals` is raised to cover the
    /// parameter slots.
    pub fn new(insns: Vec<Insn>, n_params: u8, n_locals: u16) -> Self {
        MethodIseq {
            insns,
            n_params,
            n_locals: n_locals.max(u16::from(n_params)),
            catch_table: Vec::new(),
        }
    }

    /// Attach an exception handler table.
    pub fn with_catch(mut self, catch_table: Vec<CatchEntry>) -> Self {
        self.catch_table = catch_table;
        self
    }

    /// Innermost handler covering `pc`, if any. Entries are searched in
    /// order, so inner ranges must precede outer ones.
    pub fn find_handler(&self, pc: u32) -> Option<u32> {
        self.catch_table
            .iter()
            .find(|e| e.start <= pc && pc < e.end)
            .map(|e| e.handler)
    }
}

/// One live method definition.
#[derive(Debug, Clone)]
pub struct MethodDef {
    /// Stable identity.
    pub id: MethodId,
    /// Interned name.
    pub name: SymbolId,
    /// Bumped on every redefinition; starts at 1.
    pub version: u64,
    /// Current body.
    pub iseq: Arc<MethodIseq>,
}

/// Name interning plus the method registry.
#[derive(Debug, Default, Clone)]
pub struct MethodTable {
    names: Vec<String>,
    ids_by_name: FxHashMap<String, SymbolId>,
    methods: Vec<MethodDef>,
    by_symbol: FxHashMap<SymbolId, MethodId>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a name, returning the existing symbol on repeat calls.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(sym) = self.ids_by_name.get(name) {
            return *sym;
        }
        let raw = u32::try_from(self.names.len()).unwrap_or(u32::MAX);
        let sym = SymbolId(raw);
        self.names.push(name.to_owned());
        self.ids_by_name.insert(name.to_owned(), sym);
        sym
    }

    /// Resolve a symbol back to its name. Unknown symbols print as `?`.
    pub fn symbol_name(&self, sym: SymbolId) -> &str {
        self.names
            .get(usize::try_from(sym.0).unwrap_or(usize::MAX))
            .map(String::as_str)
            .unwrap_or("?")
    }

    /// Define or redefine `name`. Returns the method id and, when this
    /// replaced an existing body, the superseded version.
    pub fn define(&mut self, name: SymbolId, iseq: MethodIseq) -> (MethodId, Option<u64>) {
        let iseq = Arc::new(iseq);
        if let Some(id) = self.by_symbol.get(&name).copied() {
            if let Some(def) = self.methods.get_mut(usize::try_from(id.0).unwrap_or(usize::MAX)) {
                let old = def.version;
                def.version = def.version.saturating_add(1);
                def.iseq = iseq;
                return (id, Some(old));
            }
        }
        let raw = u32::try_from(self.methods.len()).unwrap_or(u32::MAX);
        let id = MethodId(raw);
        self.methods.push(MethodDef {
            id,
            name,
            version: 1,
            iseq,
        });
        self.by_symbol.insert(name, id);
        (id, None)
    }

    /// Definition currently bound to `name`.
    pub fn lookup(&self, name: SymbolId) -> Option<&MethodDef> {
        self.by_symbol.get(&name).and_then(|id| self.get(*id))
    }

    /// Definition by stable id.
    pub fn get(&self, id: MethodId) -> Option<&MethodDef> {
        self.methods.get(usize::try_from(id.0).unwrap_or(usize::MAX))
    }

    /// Live version of a method, if defined.
    pub fn version_of(&self, id: MethodId) -> Option<u64> {
        self.get(id).map(|def| def.version)
    }
}

/// One constant slot: current value plus its rebind generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstSlot {
    /// Current value.
    pub value: Value,
    /// Bumped on every store, including stores of an identical value.
    pub generation: u64,
}

/// Global constant slots.
#[derive(Debug, Default, Clone)]
pub struct ConstTable {
    slots: Vec<ConstSlot>,
}

impl ConstTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot with an initial value at generation 0.
    pub fn define(&mut self, value: Value) -> u16 {
        let slot = u16::try_from(self.slots.len()).unwrap_or(u16::MAX);
        self.slots.push(ConstSlot {
            value,
            generation: 0,
        });
        slot
    }

    pub fn get(&self, slot: u16) -> Option<ConstSlot> {
        self.slots.get(usize::from(slot)).copied()
    }

    /// Rebind a slot, returning its new generation.
    pub fn store(&mut self, slot: u16, value: Value) -> Result<u64, VmError> {
        let entry = self
            .slots
            .get_mut(usize::from(slot))
            .ok_or(VmError::UnknownConst { slot })?;
        entry.value = value;
        entry.generation = entry.generation.saturating_add(1);
        Ok(entry.generation)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        let mut table = MethodTable::new();
        let a = table.intern("work");
        let b = table.intern("work");
        let c = table.intern("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.symbol_name(a), "work");
    }

    #[test]
    fn redefinition_bumps_version() {
        let mut table = MethodTable::new();
        let name = table.intern("m");
        let (id, old) = table.define(name, MethodIseq::new(vec![Insn::Return], 0, 0));
        assert_eq!(old, None);
        assert_eq!(table.version_of(id), Some(1));

        let (id2, old) = table.define(name, MethodIseq::new(vec![Insn::Return], 0, 0));
        assert_eq!(id2, id);
        assert_eq!(old, Some(1));
        assert_eq!(table.version_of(id), Some(2));
    }

    #[test]
    fn locals_cover_params() {
        let iseq = MethodIseq::new(vec![Insn::Return], 3, 1);
        assert_eq!(iseq.n_locals, 3);
    }

    #[test]
    fn handler_lookup_respects_ranges() {
        let iseq = MethodIseq::new(vec![Insn::Nop; 8], 0, 0).with_catch(vec![CatchEntry {
            start: 2,
            end: 5,
            handler: 6,
        }]);
        assert_eq!(iseq.find_handler(1), None);
        assert_eq!(iseq.find_handler(2), Some(6));
        assert_eq!(iseq.find_handler(4), Some(6));
        assert_eq!(iseq.find_handler(5), None);
    }

    #[test]
    fn const_store_bumps_generation() {
        let mut consts = ConstTable::new();
        let slot = consts.define(Value::Int(5));
        assert_eq!(consts.get(slot).unwrap().generation, 0);
        let generation = consts.store(slot, Value::Int(5)).unwrap();
        assert_eq!(generation, 1);
        assert!(consts.store(99, Value::Nil).is_err());
    }
}
