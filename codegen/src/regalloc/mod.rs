//! Register allocation: ABI setup plus one graph-coloring run per register
//! class.
//!
//! Setup rewrites the function into allocator-ready form: entry moves copy
//! the argument registers into the parameter virtuals (overflow arguments
//! reload from the caller's frame), call sites marshal their arguments into
//! the ABI registers (overflow arguments store to the outgoing area) and
//! read the result back, every return routes its value through `a0`/`fa0`,
//! and the callee-saved registers are shadow-copied at entry and restored
//! before each return. The copies are ordinary moves, so the coalescer
//! erases every one that turns out unnecessary.

pub mod coloring;
pub mod liveness;

use crate::isa::riscv64::regs;
use crate::lir::{AMode, Function, MInst, MemKind, Reg, RegClass};
use crate::timing;

/// Allocate all virtual registers of `func`. After this, no instruction
/// references a virtual register.
pub fn run(func: &mut Function) {
    let _tt = timing::regalloc();
    setup_abi(func);
    coloring::allocate_class(func, RegClass::Int, &regs::INT_ALLOCATABLE);
    coloring::allocate_class(func, RegClass::Float, &regs::FLOAT_ALLOCATABLE);

    if cfg!(debug_assertions) {
        let mut used: smallvec::SmallVec<[Reg; 4]> = smallvec::SmallVec::new();
        for &block in &func.block_order {
            for inst in &func.blocks[block].insts {
                used.clear();
                inst.uses(&mut used);
                used.extend(inst.def());
                for r in &used {
                    debug_assert!(!r.is_virtual(), "{r:?} survived allocation");
                }
            }
        }
    }
}

fn setup_abi(func: &mut Function) {
    rewrite_calls(func);
    let shadows = insert_entry_moves(func);
    rewrite_returns(func, &shadows);
}

/// Argument marshaling for one call: moves into the ABI registers and
/// overflow stores into the outgoing area. Returns the marshaling sequence
/// and the ABI registers the call reads.
fn marshal_args(func: &mut Function, args: &[Reg]) -> (Vec<MInst>, Vec<Reg>) {
    let mut seq = Vec::with_capacity(args.len());
    let mut int_idx = 0;
    let mut float_idx = 0;
    let mut overflow = 0i32;
    let mut reg_args = Vec::with_capacity(args.len());
    for &arg in args {
        match func.reg_class(arg) {
            RegClass::Int if int_idx < 8 => {
                let phys = Reg::Phys(regs::INT_ARGS[int_idx]);
                int_idx += 1;
                seq.push(MInst::Move { dst: phys, src: arg });
                reg_args.push(phys);
            }
            RegClass::Float if float_idx < 8 => {
                let phys = Reg::Phys(regs::FLOAT_ARGS[float_idx]);
                float_idx += 1;
                seq.push(MInst::Move { dst: phys, src: arg });
                reg_args.push(phys);
            }
            class => {
                let kind = match class {
                    RegClass::Int => MemKind::Double,
                    RegClass::Float => MemKind::Float,
                };
                seq.push(MInst::Store {
                    kind,
                    src: arg,
                    addr: AMode::RegOffset(Reg::Phys(regs::SP), overflow * 8),
                });
                overflow += 1;
            }
        }
    }
    func.frame.reserve_outgoing(overflow as u32 * 8);
    (seq, reg_args)
}

fn rewrite_calls(func: &mut Function) {
    for idx in 0..func.block_order.len() {
        let block = func.block_order[idx];
        let old = std::mem::take(&mut func.blocks[block].insts);
        let mut new = Vec::with_capacity(old.len());
        for inst in old {
            match inst {
                MInst::Call { name, args, ret } => {
                    let (seq, reg_args) = marshal_args(func, &args);
                    new.extend(seq);
                    let phys_ret = ret.map(|r| match func.reg_class(r) {
                        RegClass::Int => Reg::Phys(regs::A0),
                        RegClass::Float => Reg::Phys(regs::FA0),
                    });
                    new.push(MInst::Call {
                        name,
                        args: reg_args,
                        ret: phys_ret,
                    });
                    if let (Some(virt), Some(phys)) = (ret, phys_ret) {
                        new.push(MInst::Move {
                            dst: virt,
                            src: phys,
                        });
                    }
                }
                other => new.push(other),
            }
        }
        func.blocks[block].insts = new;
    }
}

fn insert_entry_moves(func: &mut Function) -> Vec<(crate::lir::PReg, Reg)> {
    let entry = func.entry();
    let mut prologue: Vec<MInst> = Vec::new();
    let mut shadows: Vec<(crate::lir::PReg, Reg)> = Vec::new();

    // Shadow-copy every callee-saved register; unused copies coalesce away.
    for p in regs::INT_CALLEE_SAVED {
        let shadow = func.new_vreg(RegClass::Int);
        prologue.push(MInst::Move {
            dst: shadow,
            src: Reg::Phys(p),
        });
        shadows.push((p, shadow));
    }
    for p in regs::FLOAT_CALLEE_SAVED {
        let shadow = func.new_vreg(RegClass::Float);
        prologue.push(MInst::Move {
            dst: shadow,
            src: Reg::Phys(p),
        });
        shadows.push((p, shadow));
    }

    // Parameters: the first eight of each class arrive in registers, the
    // rest in the caller's overflow area just above our frame.
    let params = func.params.clone();
    let mut int_idx = 0;
    let mut float_idx = 0;
    let mut overflow = 0i32;
    for &param in &params {
        match func.reg_class(param) {
            RegClass::Int if int_idx < 8 => {
                prologue.push(MInst::Move {
                    dst: param,
                    src: Reg::Phys(regs::INT_ARGS[int_idx]),
                });
                int_idx += 1;
            }
            RegClass::Float if float_idx < 8 => {
                prologue.push(MInst::Move {
                    dst: param,
                    src: Reg::Phys(regs::FLOAT_ARGS[float_idx]),
                });
                float_idx += 1;
            }
            class => {
                let kind = match class {
                    RegClass::Int => MemKind::Double,
                    RegClass::Float => MemKind::Float,
                };
                prologue.push(MInst::Load {
                    kind,
                    dst: param,
                    addr: AMode::IncomingArg(overflow),
                });
                overflow += 1;
            }
        }
    }

    func.blocks[entry].insts.splice(0..0, prologue);
    shadows
}

fn rewrite_returns(func: &mut Function, shadows: &[(crate::lir::PReg, Reg)]) {
    for idx in 0..func.block_order.len() {
        let block = func.block_order[idx];
        let old = std::mem::take(&mut func.blocks[block].insts);
        let mut new = Vec::with_capacity(old.len());
        for inst in old {
            match inst {
                MInst::Ret { value } => {
                    let phys_value = value.map(|v| {
                        let phys = match func.reg_class(v) {
                            RegClass::Int => Reg::Phys(regs::A0),
                            RegClass::Float => Reg::Phys(regs::FA0),
                        };
                        new.push(MInst::Move { dst: phys, src: v });
                        phys
                    });
                    for &(p, shadow) in shadows {
                        new.push(MInst::Move {
                            dst: Reg::Phys(p),
                            src: shadow,
                        });
                    }
                    new.push(MInst::Ret { value: phys_value });
                }
                other => new.push(other),
            }
        }
        func.blocks[block].insts = new;
    }
}
