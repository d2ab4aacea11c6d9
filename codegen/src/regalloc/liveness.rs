//! Block-level liveness over the LIR, per register class.
//!
//! A backward worklist dataflow: `live_out(b) = ∪ live_in(succ)`, and within
//! a block `live_in = (live_out − defs) + uses`, instruction by instruction
//! from the bottom. Calls implicitly define every caller-saved register of
//! the class, which is how values live across a call come to interfere with
//! the whole caller-saved file.

use crate::fx::FxHashSet;
use crate::isa::riscv64::regs;
use crate::lir::{Block, Function, MInst, Reg, RegClass};
use smallvec::SmallVec;
use sysyc_entity::SecondaryMap;

/// Per-block live sets for one register class.
pub struct Liveness {
    /// Registers live on entry to each block.
    pub live_in: SecondaryMap<Block, FxHashSet<Reg>>,
    /// Registers live on exit from each block.
    pub live_out: SecondaryMap<Block, FxHashSet<Reg>>,
}

/// The registers `inst` defines, including call clobbers, filtered to
/// `class`.
pub fn inst_defs(func: &Function, inst: &MInst, class: RegClass, out: &mut SmallVec<[Reg; 4]>) {
    if let Some(def) = inst.def() {
        if func.reg_class(def) == class {
            out.push(def);
        }
    }
    if matches!(inst, MInst::Call { .. }) {
        match class {
            RegClass::Int => out.extend(regs::INT_CALLER_SAVED.iter().map(|&p| Reg::Phys(p))),
            RegClass::Float => {
                out.extend(regs::FLOAT_CALLER_SAVED.iter().map(|&p| Reg::Phys(p)))
            }
        }
    }
}

/// The registers `inst` reads, filtered to `class`.
pub fn inst_uses(func: &Function, inst: &MInst, class: RegClass, out: &mut SmallVec<[Reg; 4]>) {
    let mut all: SmallVec<[Reg; 4]> = SmallVec::new();
    inst.uses(&mut all);
    out.extend(all.into_iter().filter(|&r| func.reg_class(r) == class));
}

/// Compute liveness for `class` over `func`.
pub fn compute(func: &Function, class: RegClass) -> Liveness {
    let mut live_in: SecondaryMap<Block, FxHashSet<Reg>> = SecondaryMap::new();
    let mut live_out: SecondaryMap<Block, FxHashSet<Reg>> = SecondaryMap::new();

    let mut changed = true;
    while changed {
        changed = false;
        for &block in func.block_order.iter().rev() {
            let mut out_set: FxHashSet<Reg> = FxHashSet::default();
            for succ in func.succs(block) {
                for &r in &live_in[succ] {
                    out_set.insert(r);
                }
            }

            let mut live = out_set.clone();
            let mut defs: SmallVec<[Reg; 4]> = SmallVec::new();
            let mut uses: SmallVec<[Reg; 4]> = SmallVec::new();
            for inst in func.blocks[block].insts.iter().rev() {
                defs.clear();
                uses.clear();
                inst_defs(func, inst, class, &mut defs);
                inst_uses(func, inst, class, &mut uses);
                for &d in &defs {
                    live.remove(&d);
                }
                for &u in &uses {
                    live.insert(u);
                }
            }

            if live != live_in[block] || out_set != live_out[block] {
                live_in[block] = live;
                live_out[block] = out_set;
                changed = true;
            }
        }
    }

    Liveness { live_in, live_out }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::condcodes::IntCC;
    use crate::lir::{IntOp, RegImm};

    #[test]
    fn straight_line() {
        let mut func = Function::new("t");
        let b = func.add_block();
        let x = func.new_vreg(RegClass::Int);
        let y = func.new_vreg(RegClass::Int);
        func.blocks[b].insts = vec![
            MInst::LoadImm { dst: x, imm: 1 },
            MInst::IntArith {
                op: IntOp::Addw,
                dst: y,
                lhs: x,
                rhs: RegImm::Imm(2),
            },
            MInst::Ret { value: Some(y) },
        ];
        let live = compute(&func, RegClass::Int);
        assert!(live.live_in[b].is_empty());
        assert!(live.live_out[b].is_empty());
    }

    #[test]
    fn loop_carried_value_is_live_around_the_back_edge() {
        let mut func = Function::new("t");
        let header = func.add_block();
        let body = func.add_block();
        let exit = func.add_block();
        let i = func.new_vreg(RegClass::Int);
        let n = func.new_vreg(RegClass::Int);
        func.blocks[header].insts = vec![MInst::Branch {
            cc: IntCC::SignedLessThan,
            lhs: i,
            rhs: n,
            taken: body,
            not_taken: exit,
        }];
        func.blocks[body].insts = vec![
            MInst::IntArith {
                op: IntOp::Addw,
                dst: i,
                lhs: i,
                rhs: RegImm::Imm(1),
            },
            MInst::Jump { dest: header },
        ];
        func.blocks[exit].insts = vec![MInst::Ret { value: Some(i) }];

        let live = compute(&func, RegClass::Int);
        assert!(live.live_in[header].contains(&i));
        assert!(live.live_in[header].contains(&n));
        assert!(live.live_out[body].contains(&i));
        assert!(live.live_out[body].contains(&n));
        assert!(live.live_in[exit].contains(&i));
        assert!(!live.live_in[exit].contains(&n));
    }

    #[test]
    fn calls_clobber_caller_saved() {
        let mut func = Function::new("t");
        let b = func.add_block();
        let x = func.new_vreg(RegClass::Int);
        func.blocks[b].insts = vec![
            MInst::LoadImm { dst: x, imm: 1 },
            MInst::Call {
                name: "g".to_string(),
                args: vec![],
                ret: None,
            },
            MInst::Ret { value: Some(x) },
        ];
        let mut defs: SmallVec<[Reg; 4]> = SmallVec::new();
        inst_defs(&func, &func.blocks[b].insts[1], RegClass::Int, &mut defs);
        assert!(defs.contains(&Reg::Phys(regs::A0)));
        assert!(defs.contains(&Reg::Phys(regs::T6)));
        assert!(!defs.contains(&Reg::Phys(regs::S0)));
    }
}
