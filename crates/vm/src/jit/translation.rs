//! The lowered program form exchanged with the toolchain.
//!
//! The generator lowers a method into [`Translation`] values; one or more of
//! them are wrapped in a [`TranslationBundle`], serialized to JSON, and handed
//! to the configured toolchain as the source file. Whatever the toolchain
//! produces, loading an artifact must yield the same translations back.

use serde::{Deserialize, Serialize};

use crate::errors::ToolchainError;
use crate::jit::unit::{InlineDep, UnitKey};
use crate::method::{MethodId, SymbolId};
use crate::value::Value;

/// Bundle layout version, checked on load.
pub const BUNDLE_FORMAT_VERSION: u32 = 1;

/// Where generated code keeps its operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackMode {
    /// Private scratch stack, spilled to the frame only when control leaves
    /// generated code. The fast path.
    Local,
    /// Operate directly on the frame stack. Required when the method has
    /// exception handlers, which resume at arbitrary depths.
    Frame,
}

/// One lowered operation.
///
/// Branch targets index into the lowered sequence, not the source bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LoweredOp {
    Nop,
    PushInt(i64),
    PushBool(bool),
    PushNil,
    LoadLocal(u16),
    StoreLocal(u16),
    Pop,
    Dup,
    Add,
    Sub,
    Mul,
    Lt,
    Eq,
    Jump(u32),
    BranchIf(u32),
    BranchUnless(u32),
    /// Live constant read through the runtime table.
    LoadConst(u16),
    StoreConst(u16),
    /// Folded constant: push `value` if the slot is still at `generation`,
    /// otherwise bail out and let the interpreter re-read it.
    FoldedConst {
        slot: u16,
        generation: u64,
        value: Value,
    },
    Print,
    /// Call back into the interpreter for the receiver-less send.
    SendInterp {
        name: SymbolId,
        argc: u8,
    },
    /// Entry check for an inlined callee body: bail out unless the callee is
    /// still defined at `version`.
    InlineGuard {
        callee: MethodId,
        version: u64,
    },
    /// Spill into the temp bank backing inlined callee locals.
    StoreTemp(u16),
    LoadTemp(u16),
    Raise,
    Return,
}

/// A lowered op paired with the source pc it came from, so bailouts know
/// where interpretation resumes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lowered {
    pub op: LoweredOp,
    pub src_pc: u32,
}

/// A fully lowered unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    pub unit: UnitKey,
    pub label: String,
    pub stack_mode: StackMode,
    pub ops: Vec<Lowered>,
    pub n_locals: u16,
    pub n_temps: u16,
    pub deps: Vec<InlineDep>,
}

impl Translation {
    /// Structural checks a loaded translation must pass before execution.
    pub fn validate(&self) -> Result<(), ToolchainError> {
        for (index, lowered) in self.ops.iter().enumerate() {
            match lowered.op {
                LoweredOp::Jump(target)
                | LoweredOp::BranchIf(target)
                | LoweredOp::BranchUnless(target) => {
                    let in_range = usize::try_from(target)
                        .map(|t| t < self.ops.len())
                        .unwrap_or(false);
                    if !in_range {
                        return Err(ToolchainError::Malformed(format!(
                            "{}: branch at {index} targets {target}, out of {} ops",
                            self.label,
                            self.ops.len()
                        )));
                    }
                }
                LoweredOp::LoadLocal(slot) | LoweredOp::StoreLocal(slot) => {
                    if slot >= self.n_locals {
                        return Err(ToolchainError::Malformed(format!(
                            "{}: local {slot} out of {} at {index}",
                            self.label, self.n_locals
                        )));
                    }
                }
                LoweredOp::LoadTemp(slot) | LoweredOp::StoreTemp(slot) => {
                    if slot >= self.n_temps {
                        return Err(ToolchainError::Malformed(format!(
                            "{}: temp {slot} out of {} at {index}",
                            self.label, self.n_temps
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// The unit-of-exchange with the toolchain: one source file, N translations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationBundle {
    pub format_version: u32,
    pub units: Vec<Translation>,
}

impl TranslationBundle {
    pub fn new(units: Vec<Translation>) -> Self {
        TranslationBundle {
            format_version: BUNDLE_FORMAT_VERSION,
            units,
        }
    }

    pub fn to_json(&self) -> Result<String, ToolchainError> {
        serde_json::to_string_pretty(self).map_err(|e| ToolchainError::Malformed(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ToolchainError> {
        let bundle: TranslationBundle =
            serde_json::from_str(text).map_err(|e| ToolchainError::Malformed(e.to_string()))?;
        if bundle.format_version != BUNDLE_FORMAT_VERSION {
            return Err(ToolchainError::Malformed(format!(
                "bundle format {} unsupported, expected {BUNDLE_FORMAT_VERSION}",
                bundle.format_version
            )));
        }
        Ok(bundle)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn translation(ops: Vec<Lowered>) -> Translation {
        Translation {
            unit: UnitKey {
                method: MethodId::from_raw(0),
                version: 1,
            },
            label: "t".to_owned(),
            stack_mode: StackMode::Local,
            ops,
            n_locals: 1,
            n_temps: 0,
            deps: Vec::new(),
        }
    }

    #[test]
    fn validate_rejects_wild_branch() {
        let t = translation(vec![
            Lowered {
                op: LoweredOp::Jump(7),
                src_pc: 0,
            },
            Lowered {
                op: LoweredOp::Return,
                src_pc: 1,
            },
        ]);
        assert!(matches!(t.validate(), Err(ToolchainError::Malformed(_))));
    }

    #[test]
    fn validate_rejects_bad_slots() {
        let bad_local = translation(vec![Lowered {
            op: LoweredOp::LoadLocal(3),
            src_pc: 0,
        }]);
        assert!(bad_local.validate().is_err());

        let bad_temp = translation(vec![Lowered {
            op: LoweredOp::LoadTemp(0),
            src_pc: 0,
        }]);
        assert!(bad_temp.validate().is_err());
    }

    #[test]
    fn bundle_survives_json() {
        let t = translation(vec![Lowered {
            op: LoweredOp::FoldedConst {
                slot: 2,
                generation: 5,
                value: Value::Int(40),
            },
            src_pc: 3,
        }]);
        let json = TranslationBundle::new(vec![t.clone()]).to_json().unwrap();
        let back = TranslationBundle::from_json(&json).unwrap();
        assert_eq!(back.units, vec![t]);
    }

    #[test]
    fn bundle_rejects_other_versions() {
        let json = r#"{"format_version": 99, "units": []}"#;
        assert!(matches!(
            TranslationBundle::from_json(json),
            Err(ToolchainError::Malformed(_))
        ));
    }
}
