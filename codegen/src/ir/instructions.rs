//! Instruction formats and opcodes.
//!
//! Every instruction is one [`InstructionData`] variant; the operand shape is
//! fixed per variant, and the common accessors (`opcode`, `arguments`,
//! `branch_targets`, …) are a single match. Direct mutation of operands must
//! go through the [`crate::ir::dfg::DataFlowGraph`] wrappers so use lists
//! stay consistent.

use crate::ir::condcodes::{FloatCC, IntCC};
use crate::ir::{Block, FuncRef, Type, Value};
use core::fmt;
use smallvec::SmallVec;
use sysyc_entity::PackedOption;

/// Operand list for calls and phis.
pub type ValueList = SmallVec<[Value; 4]>;

/// An instruction opcode.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[allow(missing_docs)]
pub enum Opcode {
    // Memory.
    Alloc,
    Load,
    Store,
    GetElementPtr,
    // Casts.
    Bitcast,
    Fptosi,
    Sitofp,
    Zext,
    // Integer arithmetic.
    Iadd,
    Isub,
    Imul,
    Idiv,
    Irem,
    Band,
    Bor,
    Bxor,
    Smin,
    Smax,
    // Float arithmetic.
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Frem,
    Fmin,
    Fmax,
    Fneg,
    // Fused multiply-add family: ±(a*b) ± c.
    Fmadd,
    Fmsub,
    Fnmadd,
    Fnmsub,
    // Comparisons and selection.
    Icmp,
    Fcmp,
    Select,
    // Joins and calls.
    Phi,
    Call,
    // Terminators.
    Jump,
    Branch,
    Return,
    Switch,
}

impl Opcode {
    /// May this opcode appear (only) at the end of a block?
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Self::Jump | Self::Branch | Self::Return | Self::Switch
        )
    }

    /// Is this a commutative binary opcode?
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::Iadd
                | Self::Imul
                | Self::Band
                | Self::Bor
                | Self::Bxor
                | Self::Smin
                | Self::Smax
                | Self::Fadd
                | Self::Fmul
                | Self::Fmin
                | Self::Fmax
        )
    }

    /// Is this an integer two-operand arithmetic opcode?
    pub fn is_int_binary(self) -> bool {
        matches!(
            self,
            Self::Iadd
                | Self::Isub
                | Self::Imul
                | Self::Idiv
                | Self::Irem
                | Self::Band
                | Self::Bor
                | Self::Bxor
                | Self::Smin
                | Self::Smax
        )
    }

    /// Is this a float two-operand arithmetic opcode?
    pub fn is_float_binary(self) -> bool {
        matches!(
            self,
            Self::Fadd | Self::Fsub | Self::Fmul | Self::Fdiv | Self::Frem | Self::Fmin | Self::Fmax
        )
    }

    /// Does the instruction write memory, perform I/O, or transfer control?
    /// Calls are conservatively impure here; the dead-code pass consults the
    /// callee's effect summary to refine this.
    pub fn has_side_effects(self) -> bool {
        matches!(self, Self::Store | Self::Call) || self.is_terminator()
    }

    /// The lower-case mnemonic.
    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Alloc => "alloc",
            Load => "load",
            Store => "store",
            GetElementPtr => "getelementptr",
            Bitcast => "bitcast",
            Fptosi => "fptosi",
            Sitofp => "sitofp",
            Zext => "zext",
            Iadd => "iadd",
            Isub => "isub",
            Imul => "imul",
            Idiv => "idiv",
            Irem => "irem",
            Band => "band",
            Bor => "bor",
            Bxor => "bxor",
            Smin => "smin",
            Smax => "smax",
            Fadd => "fadd",
            Fsub => "fsub",
            Fmul => "fmul",
            Fdiv => "fdiv",
            Frem => "frem",
            Fmin => "fmin",
            Fmax => "fmax",
            Fneg => "fneg",
            Fmadd => "fmadd",
            Fmsub => "fmsub",
            Fnmadd => "fnmadd",
            Fnmsub => "fnmsub",
            Icmp => "icmp",
            Fcmp => "fcmp",
            Select => "select",
            Phi => "phi",
            Call => "call",
            Jump => "jump",
            Branch => "br",
            Return => "ret",
            Switch => "switch",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A case table for `switch`.
pub type SwitchCases = Vec<(i32, Block)>;

/// The contents of an instruction.
#[derive(Clone, Debug)]
pub enum InstructionData {
    /// Stack allocation of one `allocated_ty`; the result is a pointer.
    Alloc {
        /// The type being allocated (the result type is a pointer to it).
        allocated_ty: Type,
    },
    /// A single-operand instruction: casts and `fneg`.
    Unary {
        /// The concrete cast/negate opcode.
        opcode: Opcode,
        /// Operand.
        arg: Value,
    },
    /// A two-operand arithmetic instruction.
    Binary {
        /// The concrete arithmetic opcode.
        opcode: Opcode,
        /// `[lhs, rhs]`.
        args: [Value; 2],
    },
    /// Fused multiply-add family.
    Fma {
        /// One of `Fmadd`/`Fmsub`/`Fnmadd`/`Fnmsub`.
        opcode: Opcode,
        /// `[a, b, c]` computing `±(a*b) ± c`.
        args: [Value; 3],
    },
    /// Integer comparison producing an `i1`.
    IntCompare {
        /// Predicate.
        cond: IntCC,
        /// `[lhs, rhs]`.
        args: [Value; 2],
    },
    /// Float comparison producing an `i1`.
    FloatCompare {
        /// Predicate.
        cond: FloatCC,
        /// `[lhs, rhs]`.
        args: [Value; 2],
    },
    /// Load the scalar pointed to by `ptr`.
    Load {
        /// Address operand.
        ptr: Value,
    },
    /// Store a scalar through a pointer.
    Store {
        /// `[ptr, value]`.
        args: [Value; 2],
    },
    /// Address arithmetic: `&base[index]`, no memory access.
    GetElementPtr {
        /// `[base, index]`.
        args: [Value; 2],
    },
    /// `cond ? if_true : if_false`.
    Select {
        /// `[cond, if_true, if_false]`.
        args: [Value; 3],
    },
    /// Call of a module function.
    Call {
        /// The callee.
        func: FuncRef,
        /// Actual arguments.
        args: ValueList,
    },
    /// Unconditional jump.
    Jump {
        /// Target block.
        dest: Block,
    },
    /// Two-way conditional branch on an `i1`.
    Branch {
        /// Condition operand.
        cond: Value,
        /// Target when the condition is true.
        then_dest: Block,
        /// Target when the condition is false.
        else_dest: Block,
    },
    /// Function return with an optional value.
    Return {
        /// Returned value, absent for `void`.
        arg: PackedOption<Value>,
    },
    /// Multi-way branch on an integer.
    Switch {
        /// Scrutinee.
        arg: Value,
        /// Target when no case matches.
        default: Block,
        /// `(constant, target)` cases.
        cases: SwitchCases,
    },
    /// SSA join: one incoming value per predecessor edge.
    Phi {
        /// `(predecessor, value)` pairs.
        args: SmallVec<[(Block, Value); 4]>,
    },
}

impl InstructionData {
    /// The opcode of this instruction.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Alloc { .. } => Opcode::Alloc,
            Self::Unary { opcode, .. } => *opcode,
            Self::Binary { opcode, .. } => *opcode,
            Self::Fma { opcode, .. } => *opcode,
            Self::IntCompare { .. } => Opcode::Icmp,
            Self::FloatCompare { .. } => Opcode::Fcmp,
            Self::Load { .. } => Opcode::Load,
            Self::Store { .. } => Opcode::Store,
            Self::GetElementPtr { .. } => Opcode::GetElementPtr,
            Self::Select { .. } => Opcode::Select,
            Self::Call { .. } => Opcode::Call,
            Self::Jump { .. } => Opcode::Jump,
            Self::Branch { .. } => Opcode::Branch,
            Self::Return { .. } => Opcode::Return,
            Self::Switch { .. } => Opcode::Switch,
            Self::Phi { .. } => Opcode::Phi,
        }
    }

    /// Collect the value operands, in operand order. Phi operands are the
    /// incoming values.
    pub fn arguments(&self) -> ValueList {
        let mut out = ValueList::new();
        match self {
            Self::Alloc { .. } => {}
            Self::Unary { arg, .. } => out.push(*arg),
            Self::Binary { args, .. }
            | Self::IntCompare { args, .. }
            | Self::FloatCompare { args, .. }
            | Self::Store { args }
            | Self::GetElementPtr { args } => out.extend_from_slice(args),
            Self::Fma { args, .. } | Self::Select { args } => out.extend_from_slice(args),
            Self::Load { ptr } => out.push(*ptr),
            Self::Call { args, .. } => out.extend_from_slice(args),
            Self::Jump { .. } => {}
            Self::Branch { cond, .. } => out.push(*cond),
            Self::Return { arg } => out.extend(arg.expand()),
            Self::Switch { arg, .. } => out.push(*arg),
            Self::Phi { args } => out.extend(args.iter().map(|&(_, v)| v)),
        }
        out
    }

    /// Replace every operand equal to `old` by `new`; returns the number of
    /// operand slots rewritten. Use-list maintenance is the caller's job.
    pub(crate) fn replace_arg(&mut self, old: Value, new: Value) -> usize {
        let mut n = 0;
        let mut repl = |v: &mut Value| {
            if *v == old {
                *v = new;
                n += 1;
            }
        };
        match self {
            Self::Alloc { .. } | Self::Jump { .. } => {}
            Self::Unary { arg, .. } => repl(arg),
            Self::Binary { args, .. }
            | Self::IntCompare { args, .. }
            | Self::FloatCompare { args, .. }
            | Self::Store { args }
            | Self::GetElementPtr { args } => args.iter_mut().for_each(&mut repl),
            Self::Fma { args, .. } | Self::Select { args } => args.iter_mut().for_each(&mut repl),
            Self::Load { ptr } => repl(ptr),
            Self::Call { args, .. } => args.iter_mut().for_each(&mut repl),
            Self::Branch { cond, .. } => repl(cond),
            Self::Return { arg } => {
                if let Some(mut v) = arg.expand() {
                    repl(&mut v);
                    *arg = v.into();
                }
            }
            Self::Switch { arg, .. } => repl(arg),
            Self::Phi { args } => args.iter_mut().for_each(|(_, v)| repl(v)),
        }
        n
    }

    /// Rewrite every value operand through `f`. Use-list maintenance is the
    /// caller's job (the cloning helpers go through
    /// `DataFlowGraph::replace_inst_data`).
    pub fn map_values(&mut self, mut f: impl FnMut(Value) -> Value) {
        match self {
            Self::Alloc { .. } | Self::Jump { .. } => {}
            Self::Unary { arg, .. } => *arg = f(*arg),
            Self::Binary { args, .. }
            | Self::IntCompare { args, .. }
            | Self::FloatCompare { args, .. }
            | Self::Store { args }
            | Self::GetElementPtr { args } => args.iter_mut().for_each(|a| *a = f(*a)),
            Self::Fma { args, .. } | Self::Select { args } => {
                args.iter_mut().for_each(|a| *a = f(*a))
            }
            Self::Load { ptr } => *ptr = f(*ptr),
            Self::Call { args, .. } => args.iter_mut().for_each(|a| *a = f(*a)),
            Self::Branch { cond, .. } => *cond = f(*cond),
            Self::Return { arg } => {
                if let Some(v) = arg.expand() {
                    *arg = f(v).into();
                }
            }
            Self::Switch { arg, .. } => *arg = f(*arg),
            Self::Phi { args } => args.iter_mut().for_each(|(_, v)| *v = f(*v)),
        }
    }

    /// Rewrite every block reference (branch targets and phi predecessor
    /// labels) through `f`.
    pub fn map_blocks(&mut self, mut f: impl FnMut(Block) -> Block) {
        match self {
            Self::Jump { dest } => *dest = f(*dest),
            Self::Branch {
                then_dest,
                else_dest,
                ..
            } => {
                *then_dest = f(*then_dest);
                *else_dest = f(*else_dest);
            }
            Self::Switch { default, cases, .. } => {
                *default = f(*default);
                cases.iter_mut().for_each(|(_, b)| *b = f(*b));
            }
            Self::Phi { args } => args.iter_mut().for_each(|(b, _)| *b = f(*b)),
            _ => {}
        }
    }

    /// Collect the block targets of a terminator. Empty for non-terminators.
    pub fn branch_targets(&self) -> SmallVec<[Block; 2]> {
        let mut out = SmallVec::new();
        match self {
            Self::Jump { dest } => out.push(*dest),
            Self::Branch {
                then_dest,
                else_dest,
                ..
            } => {
                out.push(*then_dest);
                out.push(*else_dest);
            }
            Self::Switch { default, cases, .. } => {
                out.push(*default);
                out.extend(cases.iter().map(|&(_, b)| b));
            }
            _ => {}
        }
        out
    }

    /// Rewrite every branch target equal to `old` to `new`.
    pub fn retarget_branch(&mut self, old: Block, new: Block) {
        let mut repl = |b: &mut Block| {
            if *b == old {
                *b = new;
            }
        };
        match self {
            Self::Jump { dest } => repl(dest),
            Self::Branch {
                then_dest,
                else_dest,
                ..
            } => {
                repl(then_dest);
                repl(else_dest);
            }
            Self::Switch { default, cases, .. } => {
                repl(default);
                cases.iter_mut().for_each(|(_, b)| repl(b));
            }
            _ => {}
        }
    }

    /// Rewrite the predecessor labels of a phi.
    pub fn rename_phi_pred(&mut self, old: Block, new: Block) {
        if let Self::Phi { args } = self {
            for (b, _) in args.iter_mut() {
                if *b == old {
                    *b = new;
                }
            }
        }
    }
}
