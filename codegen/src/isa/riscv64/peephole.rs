//! Window peepholes over the LIR, before and after register allocation.
//!
//! Pre-allocation: add-of-zero becomes a move; consecutive identical loads
//! or stores collapse; within a 16-instruction window, reloading a constant
//! or an address that some register already holds becomes a move from that
//! register (the coalescer then usually erases it).
//!
//! Post-allocation: zero-adds and self-moves disappear, and blocks holding
//! nothing but an unconditional jump are short-circuited.

use crate::fx::FxHashMap;
use crate::lir::{AMode, Block, Function, IntOp, MInst, Reg, RegImm};
use crate::timing;

use super::regs;

/// How long a remembered constant or address stays reusable.
const REUSE_WINDOW: u32 = 16;

/// Run the pre-allocation peephole.
pub fn run_pre_regalloc(func: &mut Function) {
    let _tt = timing::peephole();
    for idx in 0..func.block_order.len() {
        let block = func.block_order[idx];
        add_zero_to_move(func, block);
        drop_duplicate_memory_ops(func, block);
        reuse_constants_and_addresses(func, block);
    }
}

/// `add dst, rs, 0` and `add dst, 0, rs` are moves.
fn add_zero_to_move(func: &mut Function, block: Block) {
    for inst in func.blocks[block].insts.iter_mut() {
        if let MInst::IntArith {
            op: IntOp::Add | IntOp::Addw,
            dst,
            lhs,
            rhs,
        } = inst
        {
            if matches!(rhs, RegImm::Imm(0)) || matches!(rhs, RegImm::Reg(Reg::Phys(z)) if *z == regs::ZERO)
            {
                *inst = MInst::Move {
                    dst: *dst,
                    src: *lhs,
                };
            } else if *lhs == Reg::Phys(regs::ZERO) {
                if let RegImm::Reg(src) = rhs {
                    *inst = MInst::Move {
                        dst: *dst,
                        src: *src,
                    };
                }
            }
        }
    }
}

/// Delete the second of two consecutive identical loads or stores.
fn drop_duplicate_memory_ops(func: &mut Function, block: Block) {
    let insts = &mut func.blocks[block].insts;
    let mut i = 1;
    while i < insts.len() {
        let dup = match (&insts[i - 1], &insts[i]) {
            (
                MInst::Load {
                    kind: k1,
                    dst: d1,
                    addr: a1,
                },
                MInst::Load {
                    kind: k2,
                    dst: d2,
                    addr: a2,
                },
            ) => k1 == k2 && d1 == d2 && a1 == a2,
            (
                MInst::Store {
                    kind: k1,
                    src: s1,
                    addr: a1,
                },
                MInst::Store {
                    kind: k2,
                    src: s2,
                    addr: a2,
                },
            ) => k1 == k2 && s1 == s2 && a1 == a2,
            _ => false,
        };
        if dup {
            insts.remove(i);
        } else {
            i += 1;
        }
    }
}

/// Track recently loaded constants and addresses; a reload while the holder
/// is intact becomes a register move.
fn reuse_constants_and_addresses(func: &mut Function, block: Block) {
    let mut const_holders: FxHashMap<i64, (Reg, u32)> = FxHashMap::default();
    let mut addr_holders: FxHashMap<AMode, (Reg, u32)> = FxHashMap::default();

    for inst in func.blocks[block].insts.iter_mut() {
        let def = inst.def();

        let replacement = match inst {
            MInst::LoadImm { dst, imm } => const_holders
                .get(&*imm)
                .filter(|(holder, _)| *holder != *dst)
                .map(|&(holder, _)| (*dst, holder)),
            MInst::LoadAddr { dst, addr } if !matches!(addr, AMode::RegOffset(..)) => {
                addr_holders
                    .get(addr)
                    .filter(|(holder, _)| *holder != *dst)
                    .map(|&(holder, _)| (*dst, holder))
            }
            _ => None,
        };
        if let Some((dst, holder)) = replacement {
            *inst = MInst::Move { dst, src: holder };
            // The destination now aliases the holder; whatever it used to
            // hold is gone.
            const_holders.retain(|_, (r, _)| *r != dst);
            addr_holders.retain(|_, (r, _)| *r != dst);
            continue;
        }

        // Any definition invalidates entries held in the defined register.
        if let Some(def) = def {
            const_holders.retain(|_, (r, _)| *r != def);
            addr_holders.retain(|_, (r, _)| *r != def);
        }
        // Calls clobber the caller-saved registers.
        if matches!(inst, MInst::Call { .. }) {
            let clobbered = |r: &Reg| match r {
                Reg::Phys(p) => {
                    regs::INT_CALLER_SAVED.contains(p) || regs::FLOAT_CALLER_SAVED.contains(p)
                }
                Reg::Virtual(_) => false,
            };
            const_holders.retain(|_, (r, _)| !clobbered(r));
            addr_holders.retain(|_, (r, _)| !clobbered(r));
        }

        match inst {
            MInst::LoadImm { dst, imm } => {
                const_holders.insert(*imm, (*dst, REUSE_WINDOW));
            }
            MInst::LoadAddr { dst, addr } if !matches!(addr, AMode::RegOffset(..)) => {
                addr_holders.insert(*addr, (*dst, REUSE_WINDOW));
            }
            _ => {}
        }

        const_holders.retain(|_, (_, ttl)| {
            *ttl -= 1;
            *ttl > 0
        });
        addr_holders.retain(|_, (_, ttl)| {
            *ttl -= 1;
            *ttl > 0
        });
    }
}

/// Run the post-allocation peephole.
pub fn run_post_regalloc(func: &mut Function) {
    let _tt = timing::peephole();
    remove_trivial_arith(func);
    remove_jump_only_blocks(func);
}

fn remove_trivial_arith(func: &mut Function) {
    for idx in 0..func.block_order.len() {
        let block = func.block_order[idx];
        func.blocks[block].insts.retain(|inst| match inst {
            // add x, x, zero / addi x, x, 0 / sub x, x, zero
            MInst::IntArith {
                op: IntOp::Add | IntOp::Addw | IntOp::Sub | IntOp::Subw,
                dst,
                lhs,
                rhs,
            } if dst == lhs => {
                !(matches!(rhs, RegImm::Imm(0))
                    || matches!(rhs, RegImm::Reg(Reg::Phys(z)) if *z == regs::ZERO))
            }
            MInst::Move { dst, src } => dst != src,
            _ => true,
        });
    }
}

/// Short-circuit blocks containing only an unconditional jump.
fn remove_jump_only_blocks(func: &mut Function) {
    loop {
        let mut forward: FxHashMap<Block, Block> = FxHashMap::default();
        for (i, &block) in func.block_order.iter().enumerate() {
            if i == 0 {
                continue;
            }
            if let [MInst::Jump { dest }] = func.blocks[block].insts.as_slice() {
                if *dest != block {
                    forward.insert(block, *dest);
                }
            }
        }
        if forward.is_empty() {
            return;
        }
        // Resolve chains so a->b->c maps a straight to c.
        let resolve = |mut b: Block| {
            let mut hops = 0;
            while let Some(&next) = forward.get(&b) {
                b = next;
                hops += 1;
                if hops > forward.len() {
                    break;
                }
            }
            b
        };
        for idx in 0..func.block_order.len() {
            let block = func.block_order[idx];
            if let Some(term) = func.blocks[block].insts.last_mut() {
                match term {
                    MInst::Jump { dest } => *dest = resolve(*dest),
                    MInst::Branch {
                        taken, not_taken, ..
                    } => {
                        *taken = resolve(*taken);
                        *not_taken = resolve(*not_taken);
                    }
                    _ => {}
                }
            }
        }
        func.block_order.retain(|b| !forward.contains_key(b));
    }
}
