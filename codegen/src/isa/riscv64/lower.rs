//! Lowering from SSA to the LIR.
//!
//! One pass over each function in layout order. Scalars become virtual
//! registers; allocs become frame slots; GEPs become pointer descriptors
//! resolved into addressing modes at their loads and stores; integer
//! comparisons stay symbolic until a branch consumes them; phis are
//! destructed into parallel copies on the incoming edges (critical edges are
//! split first so every copy has an unambiguous home).

use crate::flowgraph::ControlFlowGraph;
use crate::fx::FxHashMap;
use crate::ir::condcodes::IntCC;
use crate::ir::{self, InstructionData, Opcode, RuntimeFunc, TypeData};
use crate::lir::{
    self, AMode, FloatOp, FmaOp, IntOp, MInst, MemKind, Reg, RegClass, RegImm, StackSlot,
};
use crate::loop_analysis::LoopAnalysis;
use crate::timing;
use smallvec::SmallVec;
use sysyc_entity::{PackedOption, SecondaryMap};

use super::regs;

/// Split critical edges into blocks with phis, so phi copies can always be
/// placed on exactly one edge. Returns `true` on change.
pub fn split_critical_edges(func: &mut ir::Function, cfg: &ControlFlowGraph) -> bool {
    let mut changed = false;
    for &block in func.layout.blocks().to_vec().iter() {
        if func.num_phis(block) == 0 || cfg.preds(block).len() < 2 {
            continue;
        }
        for &pred in cfg.preds(block).to_vec().iter() {
            let term = func.terminator(pred);
            if func.dfg.inst_data(term).branch_targets().len() < 2 {
                continue;
            }
            // pred -> block is critical: split it.
            let mid = func.dfg.make_block();
            let jump = func.dfg.make_inst(InstructionData::Jump { dest: block });
            func.layout.append_block(mid);
            func.layout.append_inst(jump, mid);
            func.dfg.retarget_branch(term, block, mid);
            for &phi in func.phis(block).to_vec().iter() {
                func.dfg.phi_rename_pred(phi, pred, mid);
            }
            changed = true;
        }
    }
    changed
}

/// Lower `func` into a LIR function.
pub fn lower_function(
    module: &ir::Module,
    func: &ir::Function,
    la: &LoopAnalysis,
) -> lir::Function {
    let _tt = timing::lower();
    let mut lowerer = Lowerer {
        module,
        func,
        la,
        out: lir::Function::new(func.name.clone()),
        block_map: SecondaryMap::new(),
        term_block: SecondaryMap::new(),
        value_regs: FxHashMap::default(),
        ptrs: FxHashMap::default(),
        comparisons: FxHashMap::default(),
        cur: lir::Block::from_u32(0),
    };
    lowerer.run();
    lowerer.out
}

#[derive(Copy, Clone)]
enum PtrBase {
    Slot(StackSlot),
    Global(ir::GlobalVar),
    Reg(Reg),
}

/// A pointer as (base, constant byte offset). Dynamic offsets are folded
/// into the base register when the GEP is lowered.
#[derive(Copy, Clone)]
struct PtrDesc {
    base: PtrBase,
    offset: i32,
}

struct Lowerer<'a> {
    module: &'a ir::Module,
    func: &'a ir::Function,
    la: &'a LoopAnalysis,
    out: lir::Function,
    block_map: SecondaryMap<ir::Block, PackedOption<lir::Block>>,
    /// The LIR block holding each SSA block's terminator (select/min/max
    /// diamonds move the tail of a block).
    term_block: SecondaryMap<ir::Block, PackedOption<lir::Block>>,
    value_regs: FxHashMap<ir::Value, Reg>,
    ptrs: FxHashMap<ir::Value, PtrDesc>,
    /// Comparison descriptors: icmp results consumed by branches without
    /// materializing a boolean.
    comparisons: FxHashMap<ir::Value, (IntCC, ir::Value, ir::Value)>,
    cur: lir::Block,
}

impl<'a> Lowerer<'a> {
    fn run(&mut self) {
        let func = self.func;
        self.out.ret_class = class_of_type(self.module, func.signature.ret);

        for &block in func.layout.blocks() {
            let lb = self.out.add_block();
            self.out.blocks[lb].loop_depth = self.la.loop_depth(block);
            self.block_map[block] = lb.into();
        }
        for &param in &func.params {
            let class = self.class_of(param);
            let reg = self.out.new_vreg(class);
            self.value_regs.insert(param, reg);
            self.out.params.push(reg);
        }

        for &block in func.layout.blocks() {
            self.cur = self.block_map[block].unwrap();
            for &inst in func.layout.block_insts(block) {
                self.lower_inst(inst);
            }
            self.term_block[block] = self.cur.into();
        }

        self.insert_phi_copies();
    }

    // --------------------------------------------------------------
    // Helpers.

    fn emit(&mut self, inst: MInst) {
        self.out.blocks[self.cur].insts.push(inst);
    }

    fn class_of(&self, value: ir::Value) -> RegClass {
        class_of_type(self.module, self.func.dfg.value_type(value))
            .expect("void value has no register class")
    }

    /// The destination register of an instruction result.
    fn def_reg(&mut self, value: ir::Value) -> Reg {
        if let Some(&reg) = self.value_regs.get(&value) {
            return reg;
        }
        let class = self.class_of(value);
        let reg = self.out.new_vreg(class);
        self.value_regs.insert(value, reg);
        reg
    }

    /// A register holding `value`, materializing constants, addresses and
    /// deferred comparisons on demand at the current position.
    fn use_reg(&mut self, value: ir::Value) -> Reg {
        if let Some(&reg) = self.value_regs.get(&value) {
            return reg;
        }
        let mut seq = Vec::new();
        let reg = self.value_to_reg(value, &mut seq);
        for inst in seq {
            self.emit(inst);
        }
        reg
    }

    /// Like [`Self::use_reg`], but pushes the materialization sequence into
    /// `seq` instead of the current block.
    ///
    /// Materializations are deliberately not cached: the sequence lands at
    /// the use site, and a register defined at one use site does not
    /// dominate the others. The pre-allocation peephole merges the
    /// duplicate constant and address loads afterwards.
    fn value_to_reg(&mut self, value: ir::Value, seq: &mut Vec<MInst>) -> Reg {
        if let Some(&reg) = self.value_regs.get(&value) {
            return reg;
        }
        if let Some(&desc) = self.ptrs.get(&value) {
            return Self::ptr_to_reg(&mut self.out, desc, seq);
        }
        match self.func.dfg.value_data(value) {
            ir::ValueData::Const { .. } => match self.func.dfg.value_type(value) {
                t if t == ir::types::F32 => {
                    let bits = self.func.dfg.as_fconst(value).unwrap().to_bits();
                    let dst = self.out.new_vreg(RegClass::Float);
                    seq.push(MInst::LoadFloatImm { dst, bits });
                    dst
                }
                t if t == ir::types::I1 => {
                    let imm = self.func.dfg.as_bconst(value).unwrap() as i64;
                    let dst = self.out.new_vreg(RegClass::Int);
                    seq.push(MInst::LoadImm { dst, imm });
                    dst
                }
                _ => {
                    let imm = self.func.dfg.as_iconst(value).unwrap() as i64;
                    let dst = self.out.new_vreg(RegClass::Int);
                    seq.push(MInst::LoadImm { dst, imm });
                    dst
                }
            },
            ir::ValueData::Undef { .. } => {
                // Undefined values read as zero.
                let class = self.class_of(value);
                let dst = self.out.new_vreg(class);
                match class {
                    RegClass::Int => seq.push(MInst::LoadImm { dst, imm: 0 }),
                    RegClass::Float => seq.push(MInst::LoadFloatImm { dst, bits: 0 }),
                }
                dst
            }
            ir::ValueData::GlobalAddr { gv, .. } => {
                let dst = self.out.new_vreg(RegClass::Int);
                seq.push(MInst::LoadAddr {
                    dst,
                    addr: AMode::Global(gv, 0),
                });
                dst
            }
            other => panic!("value {value} ({other:?}) has no register"),
        }
    }

    fn ptr_to_reg(out: &mut lir::Function, desc: PtrDesc, seq: &mut Vec<MInst>) -> Reg {
        match desc.base {
            PtrBase::Slot(slot) => {
                let dst = out.new_vreg(RegClass::Int);
                seq.push(MInst::LoadAddr {
                    dst,
                    addr: AMode::Slot(slot, desc.offset),
                });
                dst
            }
            PtrBase::Global(gv) => {
                let dst = out.new_vreg(RegClass::Int);
                seq.push(MInst::LoadAddr {
                    dst,
                    addr: AMode::Global(gv, desc.offset),
                });
                dst
            }
            PtrBase::Reg(base) => {
                if desc.offset == 0 {
                    base
                } else {
                    let dst = out.new_vreg(RegClass::Int);
                    seq.push(MInst::IntArith {
                        op: IntOp::Add,
                        dst,
                        lhs: base,
                        rhs: RegImm::Imm(desc.offset),
                    });
                    dst
                }
            }
        }
    }

    /// The pointer descriptor of a pointer-typed value, defaulting to a
    /// plain register base.
    fn desc_of(&mut self, ptr: ir::Value) -> PtrDesc {
        if let Some(&desc) = self.ptrs.get(&ptr) {
            return desc;
        }
        if let ir::ValueData::GlobalAddr { gv, .. } = self.func.dfg.value_data(ptr) {
            let desc = PtrDesc {
                base: PtrBase::Global(gv),
                offset: 0,
            };
            self.ptrs.insert(ptr, desc);
            return desc;
        }
        let reg = self.use_reg(ptr);
        PtrDesc {
            base: PtrBase::Reg(reg),
            offset: 0,
        }
    }

    fn desc_to_amode(&mut self, desc: PtrDesc) -> AMode {
        match desc.base {
            PtrBase::Slot(slot) => AMode::Slot(slot, desc.offset),
            PtrBase::Global(gv) => AMode::Global(gv, desc.offset),
            PtrBase::Reg(reg) => AMode::RegOffset(reg, desc.offset),
        }
    }

    fn mem_kind(&self, ty: ir::Type) -> MemKind {
        match self.module.types.data(ty) {
            TypeData::F32 => MemKind::Float,
            TypeData::I1 | TypeData::I32 => MemKind::Word,
            TypeData::Ptr(_) => MemKind::Double,
            other => panic!("unsupported memory access type {other:?}"),
        }
    }

    /// Emit a two-target conditional branch on `cond`, consuming a deferred
    /// comparison when one exists.
    fn cond_branch(&mut self, cond: ir::Value, taken: lir::Block, not_taken: lir::Block) {
        if let Some(&(cc, lhs, rhs)) = self.comparisons.get(&cond) {
            let lhs = self.use_reg(lhs);
            let rhs = if self.func.dfg.as_iconst(rhs) == Some(0) {
                Reg::Phys(regs::ZERO)
            } else {
                self.use_reg(rhs)
            };
            self.emit(MInst::Branch {
                cc,
                lhs,
                rhs,
                taken,
                not_taken,
            });
            return;
        }
        if let Some(b) = self.func.dfg.as_bconst(cond) {
            let dest = if b { taken } else { not_taken };
            self.emit(MInst::Jump { dest });
            return;
        }
        let creg = self.use_reg(cond);
        self.emit(MInst::Branch {
            cc: IntCC::NotEqual,
            lhs: creg,
            rhs: Reg::Phys(regs::ZERO),
            taken,
            not_taken,
        });
    }

    /// Open a diamond: branch to a fresh assignment block (then fall through
    /// to a continuation), returning `(assign, cont)`. The caller fills the
    /// assignment block; the cursor ends in the continuation.
    fn open_diamond(&mut self, depth: u32) -> (lir::Block, lir::Block) {
        let assign = self.out.add_block();
        let cont = self.out.add_block();
        self.out.blocks[assign].loop_depth = depth;
        self.out.blocks[cont].loop_depth = depth;
        (assign, cont)
    }

    // --------------------------------------------------------------
    // Per-instruction lowering.

    fn lower_inst(&mut self, inst: ir::Inst) {
        let data = self.func.dfg.inst_data(inst).clone();
        match data {
            InstructionData::Alloc { allocated_ty } => {
                let size = self.module.types.size_of(allocated_ty);
                let slot = self.out.frame.alloc_slot(size);
                let result = self.func.dfg.inst_result(inst).unwrap();
                self.ptrs.insert(
                    result,
                    PtrDesc {
                        base: PtrBase::Slot(slot),
                        offset: 0,
                    },
                );
            }
            InstructionData::Load { ptr } => {
                let result = self.func.dfg.inst_result(inst).unwrap();
                let kind = self.mem_kind(self.func.dfg.value_type(result));
                let desc = self.desc_of(ptr);
                let addr = self.desc_to_amode(desc);
                let dst = self.def_reg(result);
                self.emit(MInst::Load { kind, dst, addr });
            }
            InstructionData::Store { args } => {
                let [ptr, value] = args;
                let kind = self.mem_kind(self.func.dfg.value_type(value));
                let desc = self.desc_of(ptr);
                let addr = self.desc_to_amode(desc);
                let src = self.use_reg(value);
                self.emit(MInst::Store { kind, src, addr });
            }
            InstructionData::GetElementPtr { args } => {
                let [base, index] = args;
                let result = self.func.dfg.inst_result(inst).unwrap();
                let elem_ty = self
                    .module
                    .types
                    .pointee(self.func.dfg.value_type(result));
                let size = self.module.types.size_of(elem_ty) as i32;
                let base_desc = self.desc_of(base);
                let desc = if let Some(c) = self.func.dfg.as_iconst(index) {
                    PtrDesc {
                        base: base_desc.base,
                        offset: base_desc.offset + c * size,
                    }
                } else {
                    // Scale the index, then fold it into the base register.
                    let idx = self.use_reg(index);
                    let scaled = self.out.new_vreg(RegClass::Int);
                    self.emit(MInst::IntArith {
                        op: IntOp::Mulw,
                        dst: scaled,
                        lhs: idx,
                        rhs: RegImm::Imm(size),
                    });
                    let mut seq = Vec::new();
                    let base_reg = Self::ptr_to_reg(
                        &mut self.out,
                        PtrDesc {
                            base: base_desc.base,
                            offset: 0,
                        },
                        &mut seq,
                    );
                    for i in seq {
                        self.emit(i);
                    }
                    let addr = self.out.new_vreg(RegClass::Int);
                    self.emit(MInst::IntArith {
                        op: IntOp::Add,
                        dst: addr,
                        lhs: base_reg,
                        rhs: RegImm::Reg(scaled),
                    });
                    PtrDesc {
                        base: PtrBase::Reg(addr),
                        offset: base_desc.offset,
                    }
                };
                self.ptrs.insert(result, desc);
            }
            InstructionData::Binary { opcode, args } => self.lower_binary(inst, opcode, args),
            InstructionData::Fma { opcode, args } => {
                let result = self.func.dfg.inst_result(inst).unwrap();
                let op = match opcode {
                    Opcode::Fmadd => FmaOp::Fmadd,
                    Opcode::Fmsub => FmaOp::Fmsub,
                    Opcode::Fnmadd => FmaOp::Fnmadd,
                    Opcode::Fnmsub => FmaOp::Fnmsub,
                    _ => unreachable!(),
                };
                let a = self.use_reg(args[0]);
                let b = self.use_reg(args[1]);
                let c = self.use_reg(args[2]);
                let dst = self.def_reg(result);
                self.emit(MInst::FloatFma { op, dst, a, b, c });
            }
            InstructionData::Unary { opcode, arg } => self.lower_unary(inst, opcode, arg),
            InstructionData::IntCompare { cond, args } => {
                let result = self.func.dfg.inst_result(inst).unwrap();
                self.comparisons.insert(result, (cond, args[0], args[1]));
                // Branches consume the descriptor without a boolean; any
                // other user needs the 0/1 value in a register, defined here
                // at the comparison so it dominates all of them.
                let needs_bool = self.func.dfg.users(result).iter().any(|&user| {
                    !matches!(
                        self.func.dfg.inst_data(user),
                        InstructionData::Branch { .. }
                    )
                });
                if needs_bool {
                    let lhs = self.use_reg(args[0]);
                    let rhs = self.use_reg(args[1]);
                    let dst = self.def_reg(result);
                    self.emit(MInst::Icmp {
                        cc: cond,
                        dst,
                        lhs,
                        rhs: RegImm::Reg(rhs),
                    });
                }
            }
            InstructionData::FloatCompare { cond, args } => {
                let result = self.func.dfg.inst_result(inst).unwrap();
                let lhs = self.use_reg(args[0]);
                let rhs = self.use_reg(args[1]);
                let dst = self.def_reg(result);
                self.emit(MInst::Fcmp {
                    cc: cond,
                    dst,
                    lhs,
                    rhs,
                });
            }
            InstructionData::Select { args } => {
                let [cond, if_true, if_false] = args;
                let result = self.func.dfg.inst_result(inst).unwrap();
                let t = self.use_reg(if_true);
                let f = self.use_reg(if_false);
                let dst = self.def_reg(result);
                let depth = self.out.blocks[self.cur].loop_depth;
                self.emit(MInst::Move { dst, src: f });
                let (assign, cont) = self.open_diamond(depth);
                self.cond_branch(cond, assign, cont);
                self.cur = assign;
                self.emit(MInst::Move { dst, src: t });
                self.emit(MInst::Jump { dest: cont });
                self.cur = cont;
            }
            InstructionData::Call { func: callee, args } => {
                let callee_name = self.module.functions[callee].name.clone();
                let is_putf = self.module.runtime_kind(callee) == Some(RuntimeFunc::Putf);
                let mut arg_regs = Vec::with_capacity(args.len());
                for (i, &arg) in args.iter().enumerate() {
                    if is_putf && i == 0 {
                        // putf carries its format string by index.
                        let idx = self
                            .func
                            .dfg
                            .as_iconst(arg)
                            .expect("putf format string index must be constant");
                        let dst = self.out.new_vreg(RegClass::Int);
                        self.emit(MInst::LoadAddr {
                            dst,
                            addr: AMode::Str(ir::StringId::from_u32(idx as u32)),
                        });
                        arg_regs.push(dst);
                        continue;
                    }
                    arg_regs.push(self.use_reg(arg));
                }
                let ret = self
                    .func
                    .dfg
                    .inst_result(inst)
                    .map(|result| self.def_reg(result));
                self.emit(MInst::Call {
                    name: callee_name,
                    args: arg_regs,
                    ret,
                });
            }
            InstructionData::Jump { dest } => {
                let dest = self.block_map[dest].unwrap();
                self.emit(MInst::Jump { dest });
            }
            InstructionData::Branch {
                cond,
                then_dest,
                else_dest,
            } => {
                let taken = self.block_map[then_dest].unwrap();
                let not_taken = self.block_map[else_dest].unwrap();
                self.cond_branch(cond, taken, not_taken);
            }
            InstructionData::Return { arg } => {
                let value = arg.expand().map(|v| self.use_reg(v));
                self.emit(MInst::Ret { value });
            }
            InstructionData::Switch {
                arg,
                default,
                cases,
            } => {
                // A compare chain: one equality branch per case.
                let scrutinee = self.use_reg(arg);
                let depth = self.out.blocks[self.cur].loop_depth;
                for (value, dest) in cases {
                    let case_reg = if value == 0 {
                        Reg::Phys(regs::ZERO)
                    } else {
                        let dst = self.out.new_vreg(RegClass::Int);
                        self.emit(MInst::LoadImm {
                            dst,
                            imm: value as i64,
                        });
                        dst
                    };
                    let next = self.out.add_block();
                    self.out.blocks[next].loop_depth = depth;
                    let taken = self.block_map[dest].unwrap();
                    self.emit(MInst::Branch {
                        cc: IntCC::Equal,
                        lhs: scrutinee,
                        rhs: case_reg,
                        taken,
                        not_taken: next,
                    });
                    self.cur = next;
                }
                let dest = self.block_map[default].unwrap();
                self.emit(MInst::Jump { dest });
            }
            InstructionData::Phi { .. } => {
                // Destructed into edge copies afterwards; just reserve the
                // destination register.
                let result = self.func.dfg.inst_result(inst).unwrap();
                self.def_reg(result);
            }
        }
    }

    fn lower_binary(&mut self, inst: ir::Inst, opcode: Opcode, args: [ir::Value; 2]) {
        let result = self.func.dfg.inst_result(inst).unwrap();
        let [a, b] = args;

        if opcode.is_int_binary() {
            // Constant-constant operands fold at lowering.
            if let (Some(x), Some(y)) = (self.func.dfg.as_iconst(a), self.func.dfg.as_iconst(b)) {
                let folded = eval_int_binary(opcode, x, y);
                let dst = self.def_reg(result);
                self.emit(MInst::LoadImm {
                    dst,
                    imm: folded as i64,
                });
                return;
            }
            match opcode {
                Opcode::Smin | Opcode::Smax => {
                    let lhs = self.use_reg(a);
                    let rhs = self.use_reg(b);
                    let dst = self.def_reg(result);
                    let depth = self.out.blocks[self.cur].loop_depth;
                    self.emit(MInst::Move { dst, src: lhs });
                    let (assign, cont) = self.open_diamond(depth);
                    let cc = if opcode == Opcode::Smin {
                        IntCC::SignedLessThan
                    } else {
                        IntCC::SignedGreaterThan
                    };
                    self.emit(MInst::Branch {
                        cc,
                        lhs: rhs,
                        rhs: lhs,
                        taken: assign,
                        not_taken: cont,
                    });
                    self.cur = assign;
                    self.emit(MInst::Move { dst, src: rhs });
                    self.emit(MInst::Jump { dest: cont });
                    self.cur = cont;
                    return;
                }
                _ => {}
            }
            let op = match opcode {
                Opcode::Iadd => IntOp::Addw,
                Opcode::Isub => IntOp::Subw,
                Opcode::Imul => IntOp::Mulw,
                Opcode::Idiv => IntOp::Divw,
                Opcode::Irem => IntOp::Remw,
                Opcode::Band => IntOp::And,
                Opcode::Bor => IntOp::Or,
                Opcode::Bxor => IntOp::Xor,
                other => panic!("unlowered integer opcode {other}"),
            };
            let lhs = self.use_reg(a);
            let rhs = match self.func.dfg.as_iconst(b) {
                // Multiplication and division keep their constant for the
                // strength-reduction rewrite; additive and bitwise immediates
                // must fit the I-type encoding.
                Some(c) if matches!(op, IntOp::Mulw | IntOp::Divw | IntOp::Remw) => RegImm::Imm(c),
                Some(c) if op == IntOp::Subw && crate::lir::frame::is_imm12(-c) => {
                    // x - c  is  addiw x, -c.
                    let dst = self.def_reg(result);
                    self.emit(MInst::IntArith {
                        op: IntOp::Addw,
                        dst,
                        lhs,
                        rhs: RegImm::Imm(-c),
                    });
                    return;
                }
                Some(c)
                    if matches!(op, IntOp::Addw | IntOp::And | IntOp::Or | IntOp::Xor)
                        && crate::lir::frame::is_imm12(c) =>
                {
                    RegImm::Imm(c)
                }
                _ => {
                    let mut seq = Vec::new();
                    let r = self.value_to_reg(b, &mut seq);
                    for i in seq {
                        self.emit(i);
                    }
                    RegImm::Reg(r)
                }
            };
            let dst = self.def_reg(result);
            self.emit(MInst::IntArith { op, dst, lhs, rhs });
            return;
        }

        debug_assert!(opcode.is_float_binary());
        if opcode == Opcode::Frem {
            // r = a - trunc(a/b)·b, with the multiply-subtract fused.
            let lhs = self.use_reg(a);
            let rhs = self.use_reg(b);
            let q = self.out.new_vreg(RegClass::Float);
            self.emit(MInst::FloatArith {
                op: FloatOp::Fdiv,
                dst: q,
                lhs,
                rhs,
            });
            let w = self.out.new_vreg(RegClass::Int);
            self.emit(MInst::FcvtWS { dst: w, src: q });
            let t = self.out.new_vreg(RegClass::Float);
            self.emit(MInst::FcvtSW { dst: t, src: w });
            let dst = self.def_reg(result);
            self.emit(MInst::FloatFma {
                op: FmaOp::Fnmsub,
                dst,
                a: t,
                b: rhs,
                c: lhs,
            });
            return;
        }
        let op = match opcode {
            Opcode::Fadd => FloatOp::Fadd,
            Opcode::Fsub => FloatOp::Fsub,
            Opcode::Fmul => FloatOp::Fmul,
            Opcode::Fdiv => FloatOp::Fdiv,
            Opcode::Fmin => FloatOp::Fmin,
            Opcode::Fmax => FloatOp::Fmax,
            other => panic!("unlowered float opcode {other}"),
        };
        let lhs = self.use_reg(a);
        let rhs = self.use_reg(b);
        let dst = self.def_reg(result);
        self.emit(MInst::FloatArith { op, dst, lhs, rhs });
    }

    fn lower_unary(&mut self, inst: ir::Inst, opcode: Opcode, arg: ir::Value) {
        let result = self.func.dfg.inst_result(inst).unwrap();
        match opcode {
            Opcode::Fneg => {
                let src = self.use_reg(arg);
                let dst = self.def_reg(result);
                self.emit(MInst::Fneg { dst, src });
            }
            Opcode::Fptosi => {
                let src = self.use_reg(arg);
                let dst = self.def_reg(result);
                self.emit(MInst::FcvtWS { dst, src });
            }
            Opcode::Sitofp => {
                let src = self.use_reg(arg);
                let dst = self.def_reg(result);
                self.emit(MInst::FcvtSW { dst, src });
            }
            Opcode::Zext => {
                // The materialized boolean is already 0/1.
                let src = self.use_reg(arg);
                let dst = self.def_reg(result);
                self.emit(MInst::Move { dst, src });
            }
            Opcode::Bitcast => {
                // Pointer reinterpretation: share the descriptor or register.
                if let Some(&desc) = self.ptrs.get(&arg) {
                    self.ptrs.insert(result, desc);
                } else {
                    let reg = self.use_reg(arg);
                    self.value_regs.insert(result, reg);
                }
            }
            other => panic!("unlowered unary opcode {other}"),
        }
    }

    // --------------------------------------------------------------
    // Phi destruction.

    fn insert_phi_copies(&mut self) {
        for &pred in self.func.layout.blocks() {
            let term = self.func.terminator(pred);
            let targets = self.func.dfg.inst_data(term).branch_targets();
            let mut seen: SmallVec<[ir::Block; 2]> = SmallVec::new();
            for &succ in targets.iter() {
                if seen.contains(&succ) {
                    continue;
                }
                seen.push(succ);
                if self.func.num_phis(succ) == 0 {
                    continue;
                }
                let mut seq: Vec<MInst> = Vec::new();
                // Parallel copy through temporaries: all reads happen before
                // any phi destination is written, so cyclic and overlapping
                // copies on loop back edges stay correct.
                let mut staged: Vec<(Reg, Reg)> = Vec::new();
                for &phi in self.func.phis(succ) {
                    let result = self.func.dfg.inst_result(phi).unwrap();
                    let dst = self.def_reg(result);
                    let src_value = self
                        .func
                        .dfg
                        .phi_value_for(phi, pred)
                        .expect("phi lacks an entry for a predecessor");
                    let src = self.value_to_reg(src_value, &mut seq);
                    let tmp = self.out.new_vreg(self.out.reg_class(dst));
                    seq.push(MInst::Move { dst: tmp, src });
                    staged.push((dst, tmp));
                }
                for (dst, tmp) in staged {
                    seq.push(MInst::Move { dst, src: tmp });
                }

                if targets.len() == 1 {
                    // Insert at the end of the predecessor, before its jump.
                    let lb = self.term_block[pred].unwrap();
                    let insts = &mut self.out.blocks[lb].insts;
                    let at = insts.len() - 1;
                    debug_assert!(insts[at].is_terminator());
                    insts.splice(at..at, seq);
                } else {
                    // Critical edges were split, so a multi-target
                    // predecessor implies a single-predecessor successor.
                    let lb = self.block_map[succ].unwrap();
                    let insts = &mut self.out.blocks[lb].insts;
                    insts.splice(0..0, seq);
                }
            }
        }
    }
}

/// The register class of a type; `None` for void.
fn class_of_type(module: &ir::Module, ty: ir::Type) -> Option<RegClass> {
    match module.types.data(ty) {
        TypeData::Void => None,
        TypeData::F32 => Some(RegClass::Float),
        _ => Some(RegClass::Int),
    }
}

/// Constant folding for the integer binaries, with 32-bit wrapping
/// semantics. Division by a zero constant is a hard error.
fn eval_int_binary(opcode: Opcode, x: i32, y: i32) -> i32 {
    match opcode {
        Opcode::Iadd => x.wrapping_add(y),
        Opcode::Isub => x.wrapping_sub(y),
        Opcode::Imul => x.wrapping_mul(y),
        Opcode::Idiv => {
            assert!(y != 0, "constant division by zero");
            x.wrapping_div(y)
        }
        Opcode::Irem => {
            assert!(y != 0, "constant remainder by zero");
            x.wrapping_rem(y)
        }
        Opcode::Band => x & y,
        Opcode::Bor => x | y,
        Opcode::Bxor => x ^ y,
        Opcode::Smin => x.min(y),
        Opcode::Smax => x.max(y),
        other => panic!("not an integer binary: {other}"),
    }
}
