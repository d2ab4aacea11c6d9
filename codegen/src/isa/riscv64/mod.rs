//! The RV64 backend: lowering, constant strength reduction, peepholes,
//! register allocation driving, stack-offset rewriting, and emission.

pub mod emit;
pub mod lower;
pub mod peephole;
pub mod regs;
pub mod strength_reduction;

use crate::lir::{frame::is_imm12, AMode, Function, MInst, Reg};
use crate::timing;

/// Run the post-lowering backend pipeline on one function: strength
/// reduction, the pre-allocation peephole, register allocation, frame
/// layout, large-offset rewriting, and the post-allocation peephole.
pub fn compile_function(func: &mut Function) {
    strength_reduction::run(func);
    peephole::run_pre_regalloc(func);
    crate::regalloc::run(func);
    func.frame.finalize();
    rewrite_large_offsets(func);
    peephole::run_post_regalloc(func);
}

/// The `sp`-relative byte offset an addressing mode resolves to, when it is
/// frame-based.
fn resolved_frame_offset(func: &Function, addr: &AMode) -> Option<i32> {
    match addr {
        AMode::Slot(slot, extra) => Some(func.frame.offset_of(*slot) + extra),
        AMode::IncomingArg(index) => Some(func.frame.total_size() as i32 + index * 8),
        _ => None,
    }
}

/// Rewrite frame accesses whose resolved offset no longer fits the 12-bit
/// signed immediate: materialize the address into the reserved scratch `t6`
/// just before the access and use a zero offset against it.
pub fn rewrite_large_offsets(func: &mut Function) {
    let _tt = timing::stack_rewrite();
    let scratch = Reg::Phys(regs::T6);
    for idx in 0..func.block_order.len() {
        let block = func.block_order[idx];
        let old = std::mem::take(&mut func.blocks[block].insts);
        let mut new = Vec::with_capacity(old.len());
        for mut inst in old {
            let needs_rewrite = match &inst {
                MInst::Load { addr, .. } | MInst::Store { addr, .. } => {
                    resolved_frame_offset(func, addr).is_some_and(|off| !is_imm12(off))
                }
                _ => false,
            };
            if needs_rewrite {
                let addr = match &mut inst {
                    MInst::Load { addr, .. } | MInst::Store { addr, .. } => addr,
                    _ => unreachable!(),
                };
                new.push(MInst::LoadAddr {
                    dst: scratch,
                    addr: *addr,
                });
                *addr = AMode::RegOffset(scratch, 0);
            }
            new.push(inst);
        }
        func.blocks[block].insts = new;
    }
}
