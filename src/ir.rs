//! Abstract IR view consumed by the DFG builder
//!
//! The host pass framework is expected to hand the mapper a typed SSA view
//! of one function plus its loop tree. This module defines that view as
//! plain data: operations with dense ids, value ids resolved by the
//! frontend, and loops listing their body operations in program order.

use serde::{Deserialize, Serialize};

/// Dense id of an operation within a function.
pub type OpId = usize;

/// Dense id of an SSA value within a function.
pub type ValueId = usize;

/// Coarse type class of an operation's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeClass {
    Int,
    Float,
    Memory,
    Control,
}

/// Opcodes the DFG builder accepts, in their canonical numbering order.
///
/// The position of an opcode in this table is its numeric id in the DFG
/// JSON artifact (plus the configured testing offset). Fused opcodes and
/// the division-split opcode live at the tail so the base numbering stays
/// aligned with the plain instruction set.
pub const SUPPORTED_OPCODES: &[&str] = &[
    "phi",
    "add",
    "sub",
    "mul",
    "sdiv",
    "udiv",
    "srem",
    "fadd",
    "fsub",
    "fmul",
    "fdiv",
    "and",
    "or",
    "xor",
    "shl",
    "lshr",
    "ashr",
    "icmp",
    "fcmp",
    "select",
    "load",
    "store",
    "getelementptr",
    "zext",
    "sext",
    "trunc",
    "fptosi",
    "sitofp",
    "br",
    "ret",
    "vadd",
    "vmul",
    "vload",
    "vstore",
    "divstep",
    "fma",
    "mac",
    "mux",
    "ldadd",
];

/// Opcodes every tile supports out of the box.
///
/// Division is deliberately absent: divider FUs are scarce on real fabrics
/// and are granted per tile via `additionalFunc`, or worked around by the
/// distributed multi-cycle strategy which lowers divisions to `divstep`
/// chains.
pub const DEFAULT_FU_OPCODES: &[&str] = &[
    "phi",
    "add",
    "sub",
    "mul",
    "fadd",
    "fsub",
    "fmul",
    "and",
    "or",
    "xor",
    "shl",
    "lshr",
    "ashr",
    "icmp",
    "fcmp",
    "select",
    "load",
    "store",
    "getelementptr",
    "zext",
    "sext",
    "trunc",
    "fptosi",
    "sitofp",
    "br",
    "ret",
    "divstep",
];

/// Vector opcodes, granted per tile according to `vectorizationMode`.
pub const VECTOR_OPCODES: &[&str] = &["vadd", "vmul", "vload", "vstore"];

/// Returns the canonical numeric id of an opcode, if it is supported.
pub fn opcode_index(opcode: &str) -> Option<usize> {
    SUPPORTED_OPCODES.iter().position(|op| *op == opcode)
}

/// Type class an opcode's result falls into.
pub fn type_class_of(opcode: &str) -> TypeClass {
    match opcode {
        "fadd" | "fsub" | "fmul" | "fdiv" | "fcmp" | "sitofp" | "fma" => TypeClass::Float,
        "load" | "store" | "getelementptr" | "vload" | "vstore" | "ldadd" => TypeClass::Memory,
        "br" | "ret" => TypeClass::Control,
        _ => TypeClass::Int,
    }
}

/// Built-in execution latency of an opcode, before `optLatency` overrides.
///
/// Fused opcodes run in one cycle: the combined FU computes the whole
/// pattern per pass, which is what makes fusion shrink the recurrence
/// bound.
pub fn default_latency(opcode: &str) -> u32 {
    match opcode {
        "sdiv" | "udiv" | "srem" | "fdiv" => 4,
        "fadd" | "fsub" | "fmul" => 2,
        _ => 1,
    }
}

/// Whether an opcode is an integer division subject to `vectorFactorForIdiv`.
pub fn is_integer_div(opcode: &str) -> bool {
    matches!(opcode, "sdiv" | "udiv")
}

/// A single operation in the host function's SSA view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub opcode: String,
    /// SSA values this operation reads, in operand order.
    pub operands: Vec<ValueId>,
    /// SSA value this operation defines, if any.
    pub result: Option<ValueId>,
    pub type_class: TypeClass,
}

/// A function as presented by the host: an ordered operation sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub operations: Vec<Operation>,
    /// Printable name per value id (frontend-supplied, for artifacts).
    pub value_names: Vec<String>,
    /// Defining operation per value id; `None` for live-ins.
    defs: Vec<Option<OpId>>,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operations: Vec::new(),
            value_names: Vec::new(),
            defs: Vec::new(),
        }
    }

    /// Interns a value name, returning its dense id.
    pub fn intern_value(&mut self, name: &str) -> ValueId {
        if let Some(id) = self.value_names.iter().position(|n| n == name) {
            return id;
        }
        self.value_names.push(name.to_string());
        self.defs.push(None);
        self.value_names.len() - 1
    }

    /// Appends an operation, assigning it the next dense id.
    pub fn push_operation(
        &mut self,
        opcode: impl Into<String>,
        operands: Vec<ValueId>,
        result: Option<ValueId>,
    ) -> OpId {
        let opcode = opcode.into();
        let id = self.operations.len();
        if let Some(v) = result {
            self.defs[v] = Some(id);
        }
        let type_class = type_class_of(&opcode);
        self.operations.push(Operation {
            id,
            opcode,
            operands,
            result,
            type_class,
        });
        id
    }

    /// The operation defining a value, or `None` for live-ins.
    pub fn defining_op(&self, value: ValueId) -> Option<OpId> {
        self.defs.get(value).copied().flatten()
    }

    pub fn value_name(&self, value: ValueId) -> &str {
        &self.value_names[value]
    }
}

/// A natural loop: header operation, body in program order, nested loops.
///
/// `body` contains every operation lexically inside the loop, including
/// those of subloops.
#[derive(Debug, Clone, PartialEq)]
pub struct Loop {
    pub id: usize,
    pub header: OpId,
    pub body: Vec<OpId>,
    pub subloops: Vec<Loop>,
}

impl Loop {
    /// Innermost loop reached by always descending into the first subloop.
    pub fn innermost(&self) -> &Loop {
        let mut current = self;
        while let Some(first) = current.subloops.first() {
            current = first;
        }
        current
    }
}

/// Preorder of a function's top-level loops.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopTree {
    pub loops: Vec<Loop>,
}

impl LoopTree {
    /// Selects the loops named by `target_ids` among the top-level loops.
    ///
    /// Unless `nested` is set, each selected loop is narrowed to its
    /// innermost subloop. Requested ids with no matching loop are logged
    /// and skipped.
    pub fn select_targets(&self, target_ids: &[usize], nested: bool) -> Vec<&Loop> {
        let mut targets = Vec::new();
        for &id in target_ids {
            match self.loops.iter().find(|l| l.id == id) {
                Some(found) => {
                    let selected = if nested { found } else { found.innermost() };
                    log::debug!("reached target loop id {}", id);
                    targets.push(selected);
                }
                None => {
                    log::warn!("no loop with id {} detected in the target kernel", id);
                }
            }
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_numbering_is_stable() {
        assert_eq!(opcode_index("phi"), Some(0));
        assert_eq!(opcode_index("add"), Some(1));
        assert_eq!(opcode_index("madeup"), None);
    }

    #[test]
    fn test_default_fu_set_has_no_divider() {
        assert!(!DEFAULT_FU_OPCODES.contains(&"sdiv"));
        assert!(!DEFAULT_FU_OPCODES.contains(&"fdiv"));
        assert!(DEFAULT_FU_OPCODES.contains(&"divstep"));
    }

    #[test]
    fn test_function_interning_and_defs() {
        let mut f = Function::new("kernel");
        let a = f.intern_value("a");
        let b = f.intern_value("b");
        let c = f.intern_value("c");
        assert_eq!(f.intern_value("a"), a);

        let op = f.push_operation("add", vec![a, b], Some(c));
        assert_eq!(f.defining_op(c), Some(op));
        assert_eq!(f.defining_op(a), None);
        assert_eq!(f.operations[op].type_class, TypeClass::Int);
    }

    #[test]
    fn test_innermost_descent() {
        let inner = Loop {
            id: 7,
            header: 3,
            body: vec![3, 4],
            subloops: vec![],
        };
        let outer = Loop {
            id: 0,
            header: 0,
            body: vec![0, 1, 2, 3, 4],
            subloops: vec![inner.clone()],
        };
        let tree = LoopTree { loops: vec![outer] };

        let picked = tree.select_targets(&[0], false);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0], &inner);

        let picked = tree.select_targets(&[0], true);
        assert_eq!(picked[0].id, 0);

        assert!(tree.select_targets(&[9], false).is_empty());
    }
}
