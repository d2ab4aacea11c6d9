//! The data flow graph: values, instructions, and use edges.
//!
//! Values and instructions live in arenas; every value keeps an eager list of
//! the instructions using it, one entry per operand slot. The two maintenance
//! rules every mutation path follows:
//!
//! 1. operand edits go through the `DataFlowGraph` wrappers so use lists and
//!    instruction data never disagree, and
//! 2. instruction deletion is two-step — [`DataFlowGraph::detach_inst`]
//!    releases the operand edges, then the layout removal splices the
//!    instruction out of its block. Cycles through phis or loop back-edges
//!    can therefore never keep an instruction alive.

use crate::fx::FxHashMap;
use crate::ir::instructions::{InstructionData, Opcode};
use crate::ir::types::{self, TypeData};
use crate::ir::{Block, GlobalVar, Inst, Type, Value};
use sysyc_entity::{PackedOption, PrimaryMap, SecondaryMap};

/// Where a value comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueData {
    /// Result of an instruction.
    Inst {
        /// The value's type.
        ty: Type,
        /// The defining instruction.
        inst: Inst,
    },
    /// A function parameter.
    Param {
        /// The value's type.
        ty: Type,
        /// Zero-based parameter index.
        index: u32,
    },
    /// An interned constant; `bits` is the canonical bit pattern (64-bit IEEE
    /// for floats, sign-extended two's complement for integers).
    Const {
        /// The value's type.
        ty: Type,
        /// Canonical bit pattern.
        bits: u64,
    },
    /// An undefined value of a given type.
    Undef {
        /// The value's type.
        ty: Type,
    },
    /// The address of a module global; the type is a pointer.
    GlobalAddr {
        /// The pointer type.
        ty: Type,
        /// The referenced global.
        gv: GlobalVar,
    },
}

/// The value and instruction tables of one function.
#[derive(Clone, Default)]
pub struct DataFlowGraph {
    insts: PrimaryMap<Inst, InstructionData>,
    results: SecondaryMap<Inst, PackedOption<Value>>,
    values: PrimaryMap<Value, ValueData>,
    users: SecondaryMap<Value, Vec<Inst>>,
    constants: FxHashMap<(Type, u64), Value>,
    global_addrs: FxHashMap<GlobalVar, Value>,
    num_blocks: u32,
}

impl DataFlowGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instructions created so far.
    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    /// Number of values created so far.
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Number of blocks created so far.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks as usize
    }

    /// Create a new basic block. The block exists outside the layout until
    /// appended there.
    pub fn make_block(&mut self) -> Block {
        let block = Block::from_u32(self.num_blocks);
        self.num_blocks += 1;
        block
    }

    // ------------------------------------------------------------------
    // Instructions.

    /// Create an instruction from `data`, registering its operand uses.
    pub fn make_inst(&mut self, data: InstructionData) -> Inst {
        let inst = self.insts.next_key();
        for arg in data.arguments() {
            self.users[arg].push(inst);
        }
        self.insts.push(data)
    }

    /// The contents of `inst`.
    pub fn inst_data(&self, inst: Inst) -> &InstructionData {
        &self.insts[inst]
    }

    /// The opcode of `inst`.
    pub fn opcode(&self, inst: Inst) -> Opcode {
        self.insts[inst].opcode()
    }

    /// Attach a result value of type `ty` to `inst`.
    pub fn make_inst_result(&mut self, inst: Inst, ty: Type) -> Value {
        debug_assert!(
            self.results[inst].is_none(),
            "{inst} already has a result"
        );
        let value = self.values.push(ValueData::Inst { ty, inst });
        self.results[inst] = value.into();
        value
    }

    /// The result value of `inst`, if it produces one.
    pub fn inst_result(&self, inst: Inst) -> Option<Value> {
        self.results[inst].expand()
    }

    /// The operand values of `inst`, in operand order.
    pub fn inst_args(&self, inst: Inst) -> smallvec::SmallVec<[Value; 4]> {
        self.insts[inst].arguments()
    }

    /// Release all operand edges of `inst`. First half of the deletion
    /// protocol; the layout removal is the second.
    pub fn detach_inst(&mut self, inst: Inst) {
        let args = self.insts[inst].arguments();
        for arg in args {
            Self::remove_one_user(&mut self.users[arg], inst);
        }
    }

    /// Replace the whole contents of `inst` with `data`, releasing the old
    /// operand edges and registering the new ones. The result value, if any,
    /// is untouched.
    pub fn replace_inst_data(&mut self, inst: Inst, data: InstructionData) {
        self.detach_inst(inst);
        for arg in data.arguments() {
            self.users[arg].push(inst);
        }
        self.insts[inst] = data;
    }

    /// Rewrite operands of `inst` equal to `old` into `new`, fixing use lists.
    pub fn replace_inst_arg(&mut self, inst: Inst, old: Value, new: Value) -> usize {
        let n = self.insts[inst].replace_arg(old, new);
        for _ in 0..n {
            Self::remove_one_user(&mut self.users[old], inst);
            self.users[new].push(inst);
        }
        n
    }

    fn remove_one_user(users: &mut Vec<Inst>, inst: Inst) {
        if let Some(pos) = users.iter().position(|&u| u == inst) {
            users.swap_remove(pos);
        }
    }

    // ------------------------------------------------------------------
    // Values.

    /// The type of `value`.
    pub fn value_type(&self, value: Value) -> Type {
        match self.values[value] {
            ValueData::Inst { ty, .. }
            | ValueData::Param { ty, .. }
            | ValueData::Const { ty, .. }
            | ValueData::Undef { ty }
            | ValueData::GlobalAddr { ty, .. } => ty,
        }
    }

    /// Where `value` is defined.
    pub fn value_data(&self, value: Value) -> ValueData {
        self.values[value]
    }

    /// The defining instruction of `value`, if it is an instruction result.
    pub fn value_def(&self, value: Value) -> Option<Inst> {
        match self.values[value] {
            ValueData::Inst { inst, .. } => Some(inst),
            _ => None,
        }
    }

    /// The instructions using `value`, one entry per operand slot.
    pub fn users(&self, value: Value) -> &[Inst] {
        &self.users[value]
    }

    /// Create a function parameter value.
    pub(crate) fn make_param(&mut self, ty: Type, index: u32) -> Value {
        self.values.push(ValueData::Param { ty, index })
    }

    /// Rewrite every use of `old` to `new` in one step, transferring the user
    /// set. The types must agree.
    pub fn replace_uses(&mut self, old: Value, new: Value) {
        assert_eq!(
            self.value_type(old),
            self.value_type(new),
            "type mismatch replacing {old} with {new}"
        );
        if old == new {
            return;
        }
        let users = std::mem::take(&mut self.users[old]);
        for &inst in &users {
            self.insts[inst].replace_arg(old, new);
        }
        self.users[new].extend(users);
    }

    // ------------------------------------------------------------------
    // Constants. Interned by (type, canonical bit pattern); float interning
    // uses the 64-bit IEEE representation.

    fn make_const(&mut self, ty: Type, bits: u64) -> Value {
        if let Some(&v) = self.constants.get(&(ty, bits)) {
            return v;
        }
        let v = self.values.push(ValueData::Const { ty, bits });
        self.constants.insert((ty, bits), v);
        v
    }

    /// An interned `i32` constant.
    pub fn iconst(&mut self, imm: i32) -> Value {
        self.make_const(types::I32, imm as i64 as u64)
    }

    /// An interned `f32` constant.
    pub fn fconst(&mut self, imm: f32) -> Value {
        self.make_const(types::F32, (imm as f64).to_bits())
    }

    /// An interned `i1` constant.
    pub fn bconst(&mut self, imm: bool) -> Value {
        self.make_const(types::I1, imm as u64)
    }

    /// An undefined value of `ty`.
    pub fn undef(&mut self, ty: Type) -> Value {
        self.values.push(ValueData::Undef { ty })
    }

    /// The zero constant of a scalar type.
    pub fn zero_value(&mut self, ty: TypeData) -> Value {
        match ty {
            TypeData::I1 => self.bconst(false),
            TypeData::I32 => self.iconst(0),
            TypeData::F32 => self.fconst(0.0),
            other => panic!("no zero constant for type {other:?}"),
        }
    }

    /// The address of global `gv`, as a value of pointer type `ty`.
    pub fn global_addr(&mut self, gv: GlobalVar, ty: Type) -> Value {
        if let Some(&v) = self.global_addrs.get(&gv) {
            return v;
        }
        let v = self.values.push(ValueData::GlobalAddr { ty, gv });
        self.global_addrs.insert(gv, v);
        v
    }

    /// Is `value` a constant (including `undef`)?
    pub fn is_const(&self, value: Value) -> bool {
        matches!(
            self.values[value],
            ValueData::Const { .. } | ValueData::Undef { .. }
        )
    }

    /// The `i32` payload of a constant value, if it is one.
    pub fn as_iconst(&self, value: Value) -> Option<i32> {
        match self.values[value] {
            ValueData::Const { ty, bits } if ty == types::I32 => Some(bits as u32 as i32),
            _ => None,
        }
    }

    /// The `f32` payload of a constant value, if it is one.
    pub fn as_fconst(&self, value: Value) -> Option<f32> {
        match self.values[value] {
            ValueData::Const { ty, bits } if ty == types::F32 => {
                Some(f64::from_bits(bits) as f32)
            }
            _ => None,
        }
    }

    /// The `i1` payload of a constant value, if it is one.
    pub fn as_bconst(&self, value: Value) -> Option<bool> {
        match self.values[value] {
            ValueData::Const { ty, bits } if ty == types::I1 => Some(bits != 0),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Phi editing.

    /// The `(predecessor, value)` pairs of a phi.
    pub fn phi_incoming(&self, inst: Inst) -> &[(Block, Value)] {
        match &self.insts[inst] {
            InstructionData::Phi { args } => args,
            other => panic!("phi_incoming on {:?}", other.opcode()),
        }
    }

    /// The incoming value for predecessor `block`, if present.
    pub fn phi_value_for(&self, inst: Inst, block: Block) -> Option<Value> {
        self.phi_incoming(inst)
            .iter()
            .find(|&&(b, _)| b == block)
            .map(|&(_, v)| v)
    }

    /// Set (or add) the incoming value for predecessor `block`.
    pub fn phi_set_incoming(&mut self, inst: Inst, block: Block, value: Value) {
        let existing = match &mut self.insts[inst] {
            InstructionData::Phi { args } => {
                if let Some(slot) = args.iter_mut().find(|(b, _)| *b == block) {
                    let old = slot.1;
                    slot.1 = value;
                    Some(old)
                } else {
                    args.push((block, value));
                    None
                }
            }
            other => panic!("phi_set_incoming on {:?}", other.opcode()),
        };
        if let Some(old) = existing {
            Self::remove_one_user(&mut self.users[old], inst);
        }
        self.users[value].push(inst);
    }

    /// Remove the incoming entry for predecessor `block`.
    pub fn phi_remove_incoming(&mut self, inst: Inst, block: Block) {
        let removed = match &mut self.insts[inst] {
            InstructionData::Phi { args } => {
                let pos = args.iter().position(|&(b, _)| b == block);
                pos.map(|p| args.remove(p).1)
            }
            other => panic!("phi_remove_incoming on {:?}", other.opcode()),
        };
        if let Some(old) = removed {
            Self::remove_one_user(&mut self.users[old], inst);
        }
    }

    /// Relabel the incoming edge `old` of a phi as coming from `new`.
    pub fn phi_rename_pred(&mut self, inst: Inst, old: Block, new: Block) {
        self.insts[inst].rename_phi_pred(old, new);
    }

    // ------------------------------------------------------------------
    // Branch editing. Block references carry no use edges, so these touch
    // instruction data only.

    /// Rewrite branch targets of `inst` equal to `old` into `new`.
    pub fn retarget_branch(&mut self, inst: Inst, old: Block, new: Block) {
        self.insts[inst].retarget_branch(old, new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instructions::InstructionData;

    #[test]
    fn constants_are_interned() {
        let mut dfg = DataFlowGraph::new();
        assert_eq!(dfg.iconst(7), dfg.iconst(7));
        assert_ne!(dfg.iconst(7), dfg.iconst(8));
        assert_eq!(dfg.fconst(1.5), dfg.fconst(1.5));
        assert_ne!(dfg.fconst(0.0), dfg.iconst(0));
        let v = dfg.iconst(-3);
        assert_eq!(dfg.as_iconst(v), Some(-3));
        let v = dfg.fconst(2.5);
        assert_eq!(dfg.as_fconst(v), Some(2.5));
    }

    #[test]
    fn use_lists_track_operands() {
        let mut dfg = DataFlowGraph::new();
        let a = dfg.iconst(1);
        let b = dfg.iconst(2);
        let add = dfg.make_inst(InstructionData::Binary {
            opcode: Opcode::Iadd,
            args: [a, b],
        });
        let v = dfg.make_inst_result(add, types::I32);
        assert_eq!(dfg.users(a), &[add]);
        assert_eq!(dfg.value_def(v), Some(add));

        // A second use of `a` in the same instruction counts twice.
        let dbl = dfg.make_inst(InstructionData::Binary {
            opcode: Opcode::Iadd,
            args: [a, a],
        });
        dfg.make_inst_result(dbl, types::I32);
        assert_eq!(dfg.users(a).len(), 3);

        dfg.detach_inst(dbl);
        assert_eq!(dfg.users(a), &[add]);
    }

    #[test]
    fn replace_uses_is_atomic() {
        let mut dfg = DataFlowGraph::new();
        let a = dfg.iconst(1);
        let b = dfg.iconst(2);
        let c = dfg.iconst(3);
        let i1 = dfg.make_inst(InstructionData::Binary {
            opcode: Opcode::Imul,
            args: [a, a],
        });
        let i2 = dfg.make_inst(InstructionData::Binary {
            opcode: Opcode::Iadd,
            args: [a, b],
        });
        dfg.replace_uses(a, c);
        assert!(dfg.users(a).is_empty());
        assert_eq!(dfg.users(c).len(), 3);
        assert_eq!(dfg.inst_args(i1).as_slice(), &[c, c]);
        assert_eq!(dfg.inst_args(i2).as_slice(), &[c, b]);
    }

    #[test]
    #[should_panic(expected = "type mismatch")]
    fn replace_uses_checks_types() {
        let mut dfg = DataFlowGraph::new();
        let a = dfg.iconst(1);
        let f = dfg.fconst(1.0);
        dfg.replace_uses(a, f);
    }
}
