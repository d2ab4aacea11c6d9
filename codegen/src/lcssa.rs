//! Loop-closed SSA form.
//!
//! After this pass, every use of a loop-defined value from outside its loop
//! flows through a phi in one of the loop's exit blocks. Loop transforms can
//! then rewrite the loop body without chasing uses scattered across the rest
//! of the function; only the exit phis need fixing.

use crate::dominator_tree::DominatorTree;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Function, Inst, InstructionData, Value};
use crate::loop_analysis::{Loop, LoopAnalysis};
use crate::timing;
use smallvec::SmallVec;

/// Rewrite out-of-loop uses through exit phis. Returns `true` on change.
/// Expects loops in simplified form (dedicated exits).
pub fn do_lcssa(
    func: &mut Function,
    cfg: &ControlFlowGraph,
    domtree: &DominatorTree,
    la: &LoopAnalysis,
) -> bool {
    let _tt = timing::lcssa();
    let mut changed = false;
    for lp in la.loops_postorder() {
        for block_idx in 0..la.data(lp).blocks.len() {
            let block = la.data(lp).blocks[block_idx];
            if !func.layout.is_block_inserted(block) {
                continue;
            }
            for &inst in func.layout.block_insts(block).to_vec().iter() {
                changed |= close_value(func, cfg, domtree, la, lp, inst);
            }
        }
    }
    changed
}

fn close_value(
    func: &mut Function,
    cfg: &ControlFlowGraph,
    domtree: &DominatorTree,
    la: &LoopAnalysis,
    lp: Loop,
    inst: Inst,
) -> bool {
    let result = match func.dfg.inst_result(inst) {
        Some(v) => v,
        None => return false,
    };

    // A phi use occurs on its incoming edge, so a phi in a dedicated exit
    // block does not count as an escape; without this, re-running the pass
    // would keep stacking phis on top of its own work.
    let escapes = func.dfg.users(result).iter().any(|&user| {
        match func.dfg.inst_data(user) {
            InstructionData::Phi { args } => args
                .iter()
                .any(|&(pred, v)| v == result && !la.contains_block(lp, pred)),
            _ => match func.layout.inst_block(user) {
                Some(b) => !la.contains_block(lp, b),
                None => false,
            },
        }
    });
    if !escapes {
        return false;
    }

    let ty = func.dfg.value_type(result);
    let exits = la.data(lp).exits.clone();
    for exit in exits {
        // One incoming entry per predecessor; dedicated exits guarantee they
        // are all inside the loop.
        let incoming: SmallVec<[(crate::ir::Block, Value); 4]> = cfg
            .preds(exit)
            .iter()
            .map(|&pred| (pred, result))
            .collect();
        let phi = func.dfg.make_inst(InstructionData::Phi { args: incoming });
        let phi_value = func.dfg.make_inst_result(phi, ty);
        func.prepend_phi(exit, phi);

        for &user in func.dfg.users(result).to_vec().iter() {
            if user == phi {
                continue;
            }
            let user_block = match func.layout.inst_block(user) {
                Some(b) => b,
                None => continue,
            };
            if la.contains_block(lp, user_block) {
                continue;
            }
            match func.dfg.inst_data(user).clone() {
                InstructionData::Phi { args } => {
                    // Phis already sitting in an exit block of this loop are
                    // other closures of the same value; leave them be. For
                    // the rest, a use is attributed to its incoming edge.
                    if la.data(lp).exits.contains(&user_block) {
                        continue;
                    }
                    for (pred, value) in args {
                        if value == result && domtree.dominates(exit, pred) {
                            func.dfg.phi_set_incoming(user, pred, phi_value);
                        }
                    }
                }
                _ => {
                    if domtree.dominates(exit, user_block) {
                        func.dfg.replace_inst_arg(user, result, phi_value);
                    }
                }
            }
        }
    }
    true
}
