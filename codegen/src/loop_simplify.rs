//! Loop canonicalization: unique preheader, unique latch, dedicated exits.
//!
//! After this pass every loop has (i) a preheader whose only successor is
//! the header, (ii) a single in-loop predecessor of the header, and (iii)
//! exit blocks reached only from inside the loop. The loop transforms
//! (LICM, unrolling, unswitching) all assume this shape. Creating the merge
//! blocks migrates the affected phi entries into them.

use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function, InstructionData, Value};
use crate::loop_analysis::{Loop, LoopAnalysis};
use crate::timing;
use smallvec::SmallVec;

/// Put every loop of `func` into simplified form. Returns `true` if the
/// function changed. The analyses are stale afterwards whenever this
/// returns `true`.
pub fn do_loop_simplify(func: &mut Function, cfg: &ControlFlowGraph, la: &LoopAnalysis) -> bool {
    let _tt = timing::loop_simplify();
    let mut changed = false;
    for lp in la.loops() {
        changed |= ensure_preheader(func, cfg, la, lp);
        changed |= ensure_latch(func, la, lp);
        changed |= ensure_dedicated_exits(func, cfg, la, lp);
    }
    changed
}

/// Create a merge block jumping to `dest` and reroute the `dest` edges of
/// every block in `preds` through it, migrating `dest`'s phi entries.
fn split_edges(func: &mut Function, dest: Block, preds: &[Block]) -> Block {
    let merge = func.dfg.make_block();
    let jump = func.dfg.make_inst(InstructionData::Jump { dest });
    func.layout.append_block(merge);
    func.layout.append_inst(jump, merge);

    for &pred in preds {
        let term = func.terminator(pred);
        func.dfg.retarget_branch(term, dest, merge);
    }

    for &phi in func.phis(dest).to_vec().iter() {
        let entries: SmallVec<[(Block, Value); 4]> = preds
            .iter()
            .filter_map(|&p| func.dfg.phi_value_for(phi, p).map(|v| (p, v)))
            .collect();
        match entries.as_slice() {
            [] => {}
            &[(pred, value)] => {
                // Single rerouted edge: relabel the entry.
                func.dfg.phi_remove_incoming(phi, pred);
                func.dfg.phi_set_incoming(phi, merge, value);
            }
            _ => {
                let ty = func.dfg.value_type(entries[0].1);
                let new_phi = func.dfg.make_inst(InstructionData::Phi {
                    args: entries.clone(),
                });
                let new_value = func.dfg.make_inst_result(new_phi, ty);
                func.prepend_phi(merge, new_phi);
                for &(p, _) in &entries {
                    func.dfg.phi_remove_incoming(phi, p);
                }
                func.dfg.phi_set_incoming(phi, merge, new_value);
            }
        }
    }
    merge
}

fn ensure_preheader(
    func: &mut Function,
    cfg: &ControlFlowGraph,
    la: &LoopAnalysis,
    lp: Loop,
) -> bool {
    let header = la.data(lp).header;
    let entering: Vec<Block> = cfg
        .preds(header)
        .iter()
        .copied()
        .filter(|&p| !la.contains_block(lp, p))
        .collect();

    match entering.as_slice() {
        // Already a preheader: one entering edge from a block that goes
        // nowhere else.
        &[single] if cfg.succs(single) == [header] => false,
        // Loop hanging off the entry or unreachable: give it an empty
        // preheader so downstream passes can rely on one.
        [] => {
            split_edges(func, header, &[]);
            true
        }
        _ => {
            split_edges(func, header, &entering);
            true
        }
    }
}

fn ensure_latch(func: &mut Function, la: &LoopAnalysis, lp: Loop) -> bool {
    let data = la.data(lp);
    if data.latch_blocks.len() <= 1 {
        return false;
    }
    let header = data.header;
    let latches = data.latch_blocks.clone();
    split_edges(func, header, &latches);
    true
}

fn ensure_dedicated_exits(
    func: &mut Function,
    cfg: &ControlFlowGraph,
    la: &LoopAnalysis,
    lp: Loop,
) -> bool {
    let exits = la.data(lp).exits.clone();
    let mut changed = false;
    for exit in exits {
        let has_outside_pred = cfg
            .preds(exit)
            .iter()
            .any(|&p| !la.contains_block(lp, p));
        if !has_outside_pred {
            continue;
        }
        let inside_preds: Vec<Block> = cfg
            .preds(exit)
            .iter()
            .copied()
            .filter(|&p| la.contains_block(lp, p))
            .collect();
        if inside_preds.is_empty() {
            continue;
        }
        split_edges(func, exit, &inside_preds);
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::FuncCursor;
    use crate::dominator_tree::DominatorTree;
    use crate::ir::condcodes::IntCC;
    use crate::ir::{types, Signature};

    fn recompute(func: &Function) -> (ControlFlowGraph, LoopAnalysis) {
        let cfg = ControlFlowGraph::with_function(func);
        let dt = DominatorTree::with_function(func, &cfg);
        let la = LoopAnalysis::with_function(func, &cfg, &dt);
        (cfg, la)
    }

    /// A loop whose header is entered straight from a conditional branch, so
    /// it has no dedicated preheader, and whose exit is shared with an
    /// outside path.
    fn build_messy_loop() -> Function {
        let mut func = Function::with_signature("f", Signature::new(vec![types::I32], types::I32));
        let x = func.params[0];
        let mut cur = FuncCursor::new(&mut func);
        let _entry = cur.insert_block();
        let header = cur.func.dfg.make_block();
        let body = cur.func.dfg.make_block();
        let exit = cur.func.dfg.make_block();
        let zero = cur.func.dfg.iconst(0);
        // The entry branches either into the loop or straight to the shared
        // exit block.
        let c = cur.ins().icmp(IntCC::SignedGreaterThan, x, zero);
        cur.ins().branch(c, header, exit);

        cur.append_existing_block(header);
        let c2 = cur.ins().icmp(IntCC::SignedGreaterThan, x, zero);
        cur.ins().branch(c2, body, exit);

        cur.append_existing_block(body);
        cur.ins().jump(header);

        cur.append_existing_block(exit);
        cur.ins().ret(Some(x));
        func
    }

    #[test]
    fn creates_preheader_and_dedicated_exit() {
        let mut func = build_messy_loop();
        let (cfg, la) = recompute(&func);
        assert_eq!(la.num_loops(), 1);
        let lp = la.loops().next().unwrap();
        assert_eq!(la.preheader(lp, &cfg), None);

        assert!(do_loop_simplify(&mut func, &cfg, &la));

        let (cfg, la) = recompute(&func);
        let lp = la.loops().next().unwrap();
        let pre = la.preheader(lp, &cfg).expect("preheader exists now");
        assert_eq!(cfg.succs(pre), &[la.data(lp).header]);
        assert!(la.latch(lp).is_some());
        // Every exit block is only reached from inside the loop.
        for &exit in &la.data(lp).exits {
            for &p in cfg.preds(exit) {
                assert!(la.contains_block(lp, p));
            }
        }
    }

    #[test]
    fn idempotent() {
        let mut func = build_messy_loop();
        let (cfg, la) = recompute(&func);
        do_loop_simplify(&mut func, &cfg, &la);

        let blocks_after_first = func.layout.num_blocks();
        let (cfg, la) = recompute(&func);
        assert!(!do_loop_simplify(&mut func, &cfg, &la));
        assert_eq!(func.layout.num_blocks(), blocks_after_first);
    }

    #[test]
    fn merges_multiple_latches() {
        let mut func = Function::with_signature("f", Signature::new(vec![types::I32], types::I32));
        let x = func.params[0];
        let mut cur = FuncCursor::new(&mut func);
        let entry = cur.insert_block();
        let header = cur.func.dfg.make_block();
        let left = cur.func.dfg.make_block();
        let right = cur.func.dfg.make_block();
        let exit = cur.func.dfg.make_block();
        let zero = cur.func.dfg.iconst(0);
        let one = cur.func.dfg.iconst(1);
        cur.ins().jump(header);

        cur.append_existing_block(header);
        let iv = cur.ins().phi(types::I32, &[(entry, zero)]);
        let c = cur.ins().icmp(IntCC::SignedLessThan, iv, x);
        cur.ins().branch(c, left, exit);

        cur.append_existing_block(left);
        let inc = cur.ins().iadd(iv, one);
        let c2 = cur.ins().icmp(IntCC::SignedGreaterThan, inc, zero);
        cur.ins().branch(c2, header, right);

        cur.append_existing_block(right);
        cur.ins().jump(header);

        cur.append_existing_block(exit);
        cur.ins().ret(Some(iv));

        let phi = func.dfg.value_def(iv).unwrap();
        func.dfg.phi_set_incoming(phi, left, inc);
        func.dfg.phi_set_incoming(phi, right, inc);

        let (cfg, la) = recompute(&func);
        let lp = la.loops().next().unwrap();
        assert_eq!(la.data(lp).latch_blocks.len(), 2);
        assert!(do_loop_simplify(&mut func, &cfg, &la));

        let (cfg2, la2) = recompute(&func);
        let lp2 = la2.loops().next().unwrap();
        let latch = la2.latch(lp2).expect("unique latch");
        assert_eq!(cfg2.succs(latch), &[la2.data(lp2).header]);
        // The header phi now has exactly two incoming edges: preheader and
        // the merged latch, whose own phi merges the two old latch values.
        let phi = func.phis(la2.data(lp2).header)[0];
        assert_eq!(func.dfg.phi_incoming(phi).len(), 2);
        assert!(func
            .dfg
            .phi_incoming(phi)
            .iter()
            .any(|&(b, _)| b == latch));
    }
}
