//! Loop unswitching.
//!
//! A branch inside a loop whose condition is loop-invariant decides the same
//! way on every iteration. For the `k` invariant branches collected from a
//! loop, the pass clones the loop into `2^k` cones — one per combination of
//! branch outcomes — replaces the invariant branches inside each cone with
//! unconditional jumps to the chosen side, and dispatches into the right
//! cone through a binary tree of guard blocks inserted between the
//! preheader and the cone headers.
//!
//! The guard tree is heap-indexed: node `i` (1-based) branches on the
//! `⌊log2 i⌋`-th condition to children `2i` and `2i+1`, with the true side
//! on the left; leaves are the cone headers. One loop is expanded per
//! invocation, and the original loop is left unreachable for the cleanup
//! pass.

use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function, Inst, InstructionData, Value};
use crate::loop_analysis::{Loop, LoopAnalysis};
use crate::loop_unroll::{clone_blocks, MAX_FUNC_INSTS};
use crate::timing;

/// Upper bound on `2^k × loop size` for one expansion.
pub const MAX_UNSWITCHED_INSTS: usize = 2048;

/// Unswitch one loop containing invariant branches, if any qualifies.
/// Returns `true` when a loop was expanded. Expects simplified loops.
pub fn do_loop_unswitch(func: &mut Function, cfg: &ControlFlowGraph, la: &LoopAnalysis) -> bool {
    let _tt = timing::loop_unswitch();
    for lp in la.loops_postorder() {
        let preheader = match la.preheader(lp, cfg) {
            Some(b) => b,
            None => continue,
        };
        let mut branches = collect_invariant_branches(func, la, lp);
        if branches.is_empty() {
            continue;
        }
        let size: usize = la
            .data(lp)
            .blocks
            .iter()
            .map(|&b| func.layout.block_insts(b).len())
            .sum();
        let total: usize = func
            .layout
            .blocks()
            .iter()
            .map(|&b| func.layout.block_insts(b).len())
            .sum();
        while !branches.is_empty() {
            let cones = 1usize << branches.len();
            if cones.saturating_mul(size) <= MAX_UNSWITCHED_INSTS
                && total + cones.saturating_mul(size) <= MAX_FUNC_INSTS
            {
                break;
            }
            branches.pop();
        }
        if branches.is_empty() {
            continue;
        }
        expand(func, la, lp, preheader, &branches);
        log::debug!(
            "unswitched loop at {} over {} branches",
            la.data(lp).header,
            branches.len()
        );
        return true;
    }
    false
}

/// Branches in the loop whose condition is neither a constant nor defined
/// inside the loop.
fn collect_invariant_branches(func: &Function, la: &LoopAnalysis, lp: Loop) -> Vec<Inst> {
    let mut out = Vec::new();
    for &block in &la.data(lp).blocks {
        if !func.layout.is_block_inserted(block) {
            continue;
        }
        let term = func.terminator(block);
        let cond = match func.dfg.inst_data(term) {
            InstructionData::Branch { cond, .. } => *cond,
            _ => continue,
        };
        if func.dfg.is_const(cond) {
            continue;
        }
        let defined_inside = match func.dfg.value_def(cond) {
            Some(def) => match func.layout.inst_block(def) {
                Some(b) => la.contains_block(lp, b),
                None => false,
            },
            None => false,
        };
        if !defined_inside {
            out.push(term);
        }
    }
    out
}

fn expand(
    func: &mut Function,
    la: &LoopAnalysis,
    lp: Loop,
    preheader: Block,
    branches: &[Inst],
) {
    let k = branches.len();
    let header = la.data(lp).header;
    let loop_blocks = la.data(lp).blocks.clone();

    let conditions: Vec<Value> = branches
        .iter()
        .map(|&b| match func.dfg.inst_data(b) {
            InstructionData::Branch { cond, .. } => *cond,
            _ => unreachable!(),
        })
        .collect();
    let sides: Vec<(Block, Block)> = branches
        .iter()
        .map(|&b| match func.dfg.inst_data(b) {
            InstructionData::Branch {
                then_dest,
                else_dest,
                ..
            } => (*then_dest, *else_dest),
            _ => unreachable!(),
        })
        .collect();

    // Guard blocks for heap nodes 1 .. 2^k-1, created empty; their branches
    // are filled in once the leaves exist.
    let mut cond_blocks: Vec<Block> = Vec::with_capacity((1 << (k + 1)) - 1);
    for _ in 1..(1 << k) {
        let guard = func.dfg.make_block();
        func.layout.append_block(guard);
        cond_blocks.push(guard);
    }

    // One cone per outcome combination; leaf `i` takes branch `j`'s true
    // side when bit `k-1-j` of `i` is clear.
    for i in (1 << k)..(1 << (k + 1)) {
        let info = clone_blocks(func, &loop_blocks);
        for j in 0..k {
            let cloned_branch = info.inst(branches[j]);
            let (t, f) = sides[j];
            let taken = if (i >> (k - 1 - j)) & 1 == 0 { t } else { f };
            func.dfg.replace_inst_data(
                cloned_branch,
                InstructionData::Jump {
                    dest: info.block(taken),
                },
            );
        }
        // The cone is entered from its parent guard, not the preheader.
        let parent = cond_blocks[(i >> 1) - 1];
        for &phi in func.phis(info.block(header)).to_vec().iter() {
            func.dfg.phi_rename_pred(phi, preheader, parent);
        }
        cond_blocks.push(info.block(header));

        // Exit phis gain this cone's edges.
        for exit_idx in 0..la.data(lp).exits.len() {
            let exit = la.data(lp).exits[exit_idx];
            for &phi in func.phis(exit).to_vec().iter() {
                for &(pred, value) in func.dfg.phi_incoming(phi).to_vec().iter() {
                    if la.contains_block(lp, pred) {
                        func.dfg
                            .phi_set_incoming(phi, info.block(pred), info.value(value));
                    }
                }
            }
        }
    }

    // Fill in the guard branches, top-down.
    for i in 1..(1usize << k) {
        let depth = (usize::BITS - 1 - i.leading_zeros()) as usize;
        let branch = func.dfg.make_inst(InstructionData::Branch {
            cond: conditions[depth],
            then_dest: cond_blocks[2 * i - 1],
            else_dest: cond_blocks[2 * i],
        });
        func.layout.append_inst(branch, cond_blocks[i - 1]);
    }

    // Enter the dispatch tree instead of the old loop, and drop the stale
    // exit-phi entries from the original body.
    let pre_term = func.terminator(preheader);
    func.dfg.retarget_branch(pre_term, header, cond_blocks[0]);
    for exit_idx in 0..la.data(lp).exits.len() {
        let exit = la.data(lp).exits[exit_idx];
        for &phi in func.phis(exit).to_vec().iter() {
            for &(pred, _) in func.dfg.phi_incoming(phi).to_vec().iter() {
                if la.contains_block(lp, pred) {
                    func.dfg.phi_remove_incoming(phi, pred);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::FuncCursor;
    use crate::dominator_tree::DominatorTree;
    use crate::ir::condcodes::IntCC;
    use crate::ir::{types, Opcode, Signature};
    use crate::unreachable_code::eliminate_unreachable_code;

    /// A loop with one invariant branch on a parameter-derived condition:
    /// for (i = 0; i < n; i++) { if (flag > 0) a += 1; else a += 2; }
    fn build(n_blocks_out: &mut Vec<Block>) -> Function {
        let mut func =
            Function::with_signature("f", Signature::new(vec![types::I32, types::I32], types::I32));
        let n = func.params[0];
        let flag = func.params[1];
        let mut cur = FuncCursor::new(&mut func);
        let entry = cur.insert_block();
        let header = cur.func.dfg.make_block();
        let check = cur.func.dfg.make_block();
        let then_b = cur.func.dfg.make_block();
        let else_b = cur.func.dfg.make_block();
        let latch = cur.func.dfg.make_block();
        let exit = cur.func.dfg.make_block();
        let zero = cur.func.dfg.iconst(0);
        let one = cur.func.dfg.iconst(1);
        let two = cur.func.dfg.iconst(2);

        let invariant_cond = cur.ins().icmp(IntCC::SignedGreaterThan, flag, zero);
        cur.ins().jump(header);

        cur.append_existing_block(header);
        let iv = cur.ins().phi(types::I32, &[(entry, zero)]);
        let acc = cur.ins().phi(types::I32, &[(entry, zero)]);
        let c = cur.ins().icmp(IntCC::SignedLessThan, iv, n);
        cur.ins().branch(c, check, exit);

        cur.append_existing_block(check);
        cur.ins().branch(invariant_cond, then_b, else_b);

        cur.append_existing_block(then_b);
        let a1 = cur.ins().iadd(acc, one);
        cur.ins().jump(latch);

        cur.append_existing_block(else_b);
        let a2 = cur.ins().iadd(acc, two);
        cur.ins().jump(latch);

        cur.append_existing_block(latch);
        let merged = cur.ins().phi(types::I32, &[(then_b, a1), (else_b, a2)]);
        let iv2 = cur.ins().iadd(iv, one);
        cur.ins().jump(header);

        cur.append_existing_block(exit);
        let closed = cur.ins().phi(types::I32, &[(header, acc)]);
        cur.ins().ret(Some(closed));

        let iv_phi = func.dfg.value_def(iv).unwrap();
        let acc_phi = func.dfg.value_def(acc).unwrap();
        func.dfg.phi_set_incoming(iv_phi, latch, iv2);
        func.dfg.phi_set_incoming(acc_phi, latch, merged);

        n_blocks_out.extend([entry, header, exit]);
        func
    }

    fn analyses(func: &Function) -> (ControlFlowGraph, DominatorTree, LoopAnalysis) {
        let cfg = ControlFlowGraph::with_function(func);
        let dt = DominatorTree::with_function(func, &cfg);
        let la = LoopAnalysis::with_function(func, &cfg, &dt);
        (cfg, dt, la)
    }

    #[test]
    fn splits_into_two_cones() {
        let mut marker = Vec::new();
        let mut func = build(&mut marker);
        let (cfg, _, la) = analyses(&func);
        assert_eq!(la.num_loops(), 1);

        assert!(do_loop_unswitch(&mut func, &cfg, &la));
        eliminate_unreachable_code(&mut func);

        // Two cones, each still a loop, but free of the invariant branch:
        // every remaining conditional branch is the loop condition.
        let (cfg2, _, la2) = analyses(&func);
        assert_eq!(la2.num_loops(), 2);
        for lp in la2.loops() {
            for &block in &la2.data(lp).blocks {
                let term = func.terminator(block);
                if let InstructionData::Branch { cond, .. } = func.dfg.inst_data(term) {
                    let def = func.dfg.value_def(*cond).unwrap();
                    let def_block = func.layout.inst_block(def).unwrap();
                    assert!(
                        la2.contains_block(lp, def_block),
                        "invariant branch survived in a cone"
                    );
                }
            }
        }
        let _ = cfg2;

        // The guard block dispatches on the invariant condition.
        let entry = marker[0];
        let guard = match func.dfg.inst_data(func.terminator(entry)) {
            InstructionData::Jump { dest } => *dest,
            _ => unreachable!(),
        };
        match func.dfg.inst_data(func.terminator(guard)) {
            InstructionData::Branch { cond, .. } => {
                let def = func.dfg.value_def(*cond).unwrap();
                assert_eq!(func.dfg.opcode(def), Opcode::Icmp);
                assert_eq!(func.layout.inst_block(def), Some(entry));
            }
            _ => unreachable!("guard must branch"),
        }

        // The exit phi now merges one value per cone.
        let exit = marker[2];
        let phi = func.phis(exit)[0];
        assert_eq!(func.dfg.phi_incoming(phi).len(), 2);
    }

    #[test]
    fn no_invariant_branch_no_change() {
        let mut func = Function::with_signature("f", Signature::new(vec![types::I32], types::I32));
        let n = func.params[0];
        let mut cur = FuncCursor::new(&mut func);
        let entry = cur.insert_block();
        let header = cur.func.dfg.make_block();
        let body = cur.func.dfg.make_block();
        let exit = cur.func.dfg.make_block();
        let zero = cur.func.dfg.iconst(0);
        let one = cur.func.dfg.iconst(1);
        cur.ins().jump(header);
        cur.append_existing_block(header);
        let iv = cur.ins().phi(types::I32, &[(entry, zero)]);
        let c = cur.ins().icmp(IntCC::SignedLessThan, iv, n);
        cur.ins().branch(c, body, exit);
        cur.append_existing_block(body);
        let iv2 = cur.ins().iadd(iv, one);
        cur.ins().jump(header);
        cur.append_existing_block(exit);
        cur.ins().ret(Some(iv));
        let iv_phi = func.dfg.value_def(iv).unwrap();
        func.dfg.phi_set_incoming(iv_phi, body, iv2);

        let (cfg, _, la) = analyses(&func);
        assert!(!do_loop_unswitch(&mut func, &cfg, &la));
    }
}
