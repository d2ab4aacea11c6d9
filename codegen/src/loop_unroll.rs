//! Loop unrolling.
//!
//! Two flavors over innermost, simplified, single-exit loops whose only
//! exiting block is the header:
//!
//! - **Constant-trip unroll** replaces the whole loop by `trip` straight-line
//!   copies of the body plus one final copy of the header computation, whose
//!   values feed the exit phis.
//! - **Runtime-trip unroll** clones the body into a kernel of `UNROLL_FACTOR`
//!   copies executed while a chunk bound (computed in the preheader) holds,
//!   plus a remainder loop — a full clone of the original — for the tail.
//!
//! Both rewire edges and leave the original loop (and, for the constant
//! case, the dead body of the final copy) unreachable; the caller follows up
//! with unreachable-code elimination. One loop is transformed per
//! invocation; the pass pipeline reruns until nothing changes.

use crate::flowgraph::ControlFlowGraph;
use crate::fx::FxHashMap;
use crate::ir::{Block, Function, Inst, InstructionData, Value};
use crate::loop_analysis::{Loop, LoopAnalysis};
use crate::scev::ScevAnalysis;
use crate::timing;

/// Upper bound on `body size × copies` for either unroll flavor.
pub const MAX_UNROLLED_INSTS: usize = 1024;

/// Number of body copies in the runtime-trip kernel.
pub const UNROLL_FACTOR: usize = 4;

/// Ceiling on whole-function size for the runtime unroller. The remainder
/// loop it leaves behind is itself unrollable, so without this the pass
/// pipeline's fixed point would keep expanding it.
pub const MAX_FUNC_INSTS: usize = 4096;

fn func_size(func: &Function) -> usize {
    func.layout
        .blocks()
        .iter()
        .map(|&b| func.layout.block_insts(b).len())
        .sum()
}

/// Value/block renaming produced by cloning a set of blocks.
#[derive(Default)]
pub(crate) struct CloneMap {
    blocks: FxHashMap<Block, Block>,
    values: FxHashMap<Value, Value>,
    insts: FxHashMap<Inst, Inst>,
}

impl CloneMap {
    /// The clone of `block`, or `block` itself when outside the cloned set.
    pub fn block(&self, block: Block) -> Block {
        *self.blocks.get(&block).unwrap_or(&block)
    }

    /// The clone of `value`, or `value` itself when defined outside.
    pub fn value(&self, value: Value) -> Value {
        *self.values.get(&value).unwrap_or(&value)
    }

    /// The clone of `inst`.
    pub fn inst(&self, inst: Inst) -> Inst {
        self.insts[&inst]
    }

    /// Point the clone of `original` at `replacement`. Used when a cloned
    /// phi is deleted, so later copies chasing this map cannot reach the
    /// orphaned value.
    fn rebind_value(&mut self, original: Value, replacement: Value) {
        self.values.insert(original, replacement);
    }
}

/// Clone `blocks` (and their instructions) into fresh blocks appended to the
/// layout. Operands and branch targets pointing into the cloned set are
/// remapped; everything else is shared with the original.
pub(crate) fn clone_blocks(func: &mut Function, blocks: &[Block]) -> CloneMap {
    let mut map = CloneMap::default();
    for &b in blocks {
        map.blocks.insert(b, func.dfg.make_block());
    }
    // First pass: create the clones with unmapped operands so every result
    // value exists before any reference to it is rewritten.
    for &b in blocks {
        let nb = map.blocks[&b];
        func.layout.append_block(nb);
        for &inst in func.layout.block_insts(b).to_vec().iter() {
            let data = func.dfg.inst_data(inst).clone();
            let ni = func.dfg.make_inst(data);
            if let Some(result) = func.dfg.inst_result(inst) {
                let ty = func.dfg.value_type(result);
                let nresult = func.dfg.make_inst_result(ni, ty);
                map.values.insert(result, nresult);
            }
            map.insts.insert(inst, ni);
            func.layout.append_inst(ni, nb);
        }
    }
    // Second pass: remap operands and block references.
    for &b in blocks {
        for &inst in func.layout.block_insts(b).to_vec().iter() {
            let ni = map.insts[&inst];
            let mut data = func.dfg.inst_data(ni).clone();
            data.map_values(|v| map.value(v));
            data.map_blocks(|b| map.block(b));
            func.dfg.replace_inst_data(ni, data);
        }
    }
    map
}

/// The shape every unrollable loop must have.
struct UnrollShape {
    preheader: Block,
    header: Block,
    latch: Block,
    exit: Block,
    /// The header branch's in-loop successor.
    body_entry: Block,
    /// Instruction count over the loop blocks.
    size: usize,
}

fn match_shape(
    func: &Function,
    cfg: &ControlFlowGraph,
    la: &LoopAnalysis,
    lp: Loop,
) -> Option<UnrollShape> {
    if !la.is_innermost(lp) {
        return None;
    }
    let data = la.data(lp);
    let preheader = la.preheader(lp, cfg)?;
    let latch = la.latch(lp)?;
    let exit = match data.exits.as_slice() {
        &[exit] => exit,
        _ => return None,
    };
    // The header must be the only exiting block, and the exit dedicated.
    if cfg.preds(exit) != [data.header] {
        return None;
    }
    let term = func.terminator(data.header);
    let (then_dest, else_dest) = match func.dfg.inst_data(term) {
        InstructionData::Branch {
            then_dest,
            else_dest,
            ..
        } => (*then_dest, *else_dest),
        _ => return None,
    };
    let body_entry = if then_dest == exit {
        else_dest
    } else if else_dest == exit {
        then_dest
    } else {
        return None;
    };
    let size = data
        .blocks
        .iter()
        .map(|&b| func.layout.block_insts(b).len())
        .sum();
    Some(UnrollShape {
        preheader,
        header: data.header,
        latch,
        exit,
        body_entry,
        size,
    })
}

/// Replace phis whose latch value is the phi itself by their initial value.
fn resolve_self_phis(func: &mut Function, shape: &UnrollShape) {
    for &phi in func.phis(shape.header).to_vec().iter() {
        let result = func.dfg.inst_result(phi).unwrap();
        if func.dfg.phi_value_for(phi, shape.latch) == Some(result) {
            let initial = func
                .dfg
                .phi_value_for(phi, shape.preheader)
                .expect("simplified loop phi has a preheader entry");
            func.dfg.replace_uses(result, initial);
            func.delete_inst(phi);
        }
    }
}

// ----------------------------------------------------------------------
// Constant-trip unroll.

/// Fully unroll one loop with a known trip count, if any qualifies.
/// Returns `true` when a loop was expanded.
pub fn do_const_unroll(func: &mut Function, cfg: &ControlFlowGraph, la: &LoopAnalysis) -> bool {
    let _tt = timing::loop_unroll();
    for lp in la.loops_postorder() {
        let trip = match la.data(lp).trip_count {
            Some(t) if t >= 1 => t as usize,
            _ => continue,
        };
        let shape = match match_shape(func, cfg, la, lp) {
            Some(s) => s,
            None => continue,
        };
        if shape.size.saturating_mul(trip) > MAX_UNROLLED_INSTS {
            continue;
        }
        expand_const(func, la, lp, &shape, trip);
        log::debug!(
            "fully unrolled loop at {} ({} iterations)",
            shape.header,
            trip
        );
        return true;
    }
    false
}

fn expand_const(
    func: &mut Function,
    la: &LoopAnalysis,
    lp: Loop,
    shape: &UnrollShape,
    trip: usize,
) {
    resolve_self_phis(func, shape);
    let loop_blocks = la.data(lp).blocks.clone();
    let header_phis: Vec<Inst> = func.phis(shape.header).to_vec();

    // trip copies execute the body; one extra copy re-evaluates the header
    // so the exit phis see the values of the final iteration.
    let mut copies: Vec<CloneMap> = (0..=trip)
        .map(|_| clone_blocks(func, &loop_blocks))
        .collect();

    // The preheader now enters the first copy.
    let pre_term = func.terminator(shape.preheader);
    func.dfg
        .retarget_branch(pre_term, shape.header, copies[0].block(shape.header));

    for i in 0..=trip {
        let h = copies[i].block(shape.header);

        // Replace each cloned header phi by the value flowing in on its one
        // remaining edge, and rebind the clone map so the next copy resolves
        // the phi to the replacement rather than the orphaned clone.
        for &phi in &header_phis {
            let original_result = func.dfg.inst_result(phi).unwrap();
            let cloned = copies[i].inst(phi);
            let cloned_result = func.dfg.inst_result(cloned).unwrap();
            let replacement = if i == 0 {
                func.dfg.phi_value_for(phi, shape.preheader).unwrap()
            } else {
                let latch_value = func.dfg.phi_value_for(phi, shape.latch).unwrap();
                copies[i - 1].value(latch_value)
            };
            func.dfg.replace_uses(cloned_result, replacement);
            func.delete_inst(cloned);
            copies[i].rebind_value(original_result, replacement);
        }

        let term = func.terminator(h);
        if i < trip {
            // Straighten the header branch into the body, and chain this
            // copy's latch to the next copy's header.
            func.dfg.replace_inst_data(
                term,
                InstructionData::Jump {
                    dest: copies[i].block(shape.body_entry),
                },
            );
            let latch_term = func.terminator(copies[i].block(shape.latch));
            func.dfg
                .retarget_branch(latch_term, h, copies[i + 1].block(shape.header));
        } else {
            // The final copy only computes the exit state.
            func.dfg
                .replace_inst_data(term, InstructionData::Jump { dest: shape.exit });
        }
    }

    // Exit phis now receive the final copy's values.
    let last = &copies[trip];
    for &phi in func.phis(shape.exit).to_vec().iter() {
        if let Some(v) = func.dfg.phi_value_for(phi, shape.header) {
            func.dfg.phi_remove_incoming(phi, shape.header);
            func.dfg
                .phi_set_incoming(phi, last.block(shape.header), last.value(v));
        }
    }
}

// ----------------------------------------------------------------------
// Runtime-trip unroll.

/// Unroll one loop with a symbolic trip count into a kernel plus remainder,
/// if any qualifies. Returns `true` when a loop was expanded.
pub fn do_runtime_unroll(
    func: &mut Function,
    cfg: &ControlFlowGraph,
    la: &LoopAnalysis,
    scev: &ScevAnalysis,
) -> bool {
    let _tt = timing::loop_unroll();
    for lp in la.loops_postorder() {
        // Constant trips belong to the constant unroller.
        if la.data(lp).trip_count.is_some() {
            continue;
        }
        let shape = match match_shape(func, cfg, la, lp) {
            Some(s) => s,
            None => continue,
        };
        if shape.size.saturating_mul(UNROLL_FACTOR + 2) > MAX_UNROLLED_INSTS {
            continue;
        }

        // The header comparison must be an ordered predicate between an
        // affine induction variable and a constant bound.
        let term = func.terminator(shape.header);
        let cond = match func.dfg.inst_data(term) {
            // The kernel reuses the branch structure, so the true edge must
            // be the one staying in the loop.
            InstructionData::Branch {
                cond, then_dest, ..
            } if *then_dest == shape.body_entry => *cond,
            _ => continue,
        };
        let icmp = match func.dfg.value_def(cond) {
            Some(i) => i,
            None => continue,
        };
        let (cc, lhs, rhs) = match func.dfg.inst_data(icmp) {
            InstructionData::IntCompare { cond, args } => (*cond, args[0], args[1]),
            _ => continue,
        };
        use crate::ir::condcodes::IntCC::*;
        if matches!(cc, Equal | NotEqual) {
            continue;
        }
        // The bound must be loop-invariant: a constant, or defined outside
        // the loop (parameters and global addresses qualify).
        let bound_invariant = func.dfg.is_const(rhs)
            || match func.dfg.value_def(rhs) {
                Some(def) => match func.layout.inst_block(def) {
                    Some(b) => !la.contains_block(lp, b),
                    None => false,
                },
                None => true,
            };
        if !bound_invariant {
            continue;
        }
        if func_size(func) + shape.size * (UNROLL_FACTOR + 1) > MAX_FUNC_INSTS {
            continue;
        }
        let iv_scev = match scev.value_scev(lhs) {
            Some(s) if scev.evolution_loop(s) == Some(lp) => s,
            _ => continue,
        };
        let (init, step) = match (scev.init(iv_scev), scev.step(iv_scev)) {
            (Some(i), Some(s)) => (i, s),
            _ => continue,
        };
        if step == 0 {
            continue;
        }
        // The step must run toward the bound.
        let upward = matches!(cc, SignedLessThan | SignedLessThanOrEqual);
        if upward != (step > 0) {
            continue;
        }

        expand_runtime(func, la, lp, &shape, icmp, lhs, rhs, init, step);
        log::debug!(
            "runtime-unrolled loop at {} by {}",
            shape.header,
            UNROLL_FACTOR
        );
        return true;
    }
    false
}

#[allow(clippy::too_many_arguments)]
fn expand_runtime(
    func: &mut Function,
    la: &LoopAnalysis,
    lp: Loop,
    shape: &UnrollShape,
    icmp: Inst,
    iv: Value,
    bound: Value,
    init: i32,
    step: i32,
) {
    use crate::cursor::FuncCursor;

    resolve_self_phis(func, shape);
    let loop_blocks = la.data(lp).blocks.clone();
    let header_phis: Vec<Inst> = func.phis(shape.header).to_vec();
    let cc = match func.dfg.inst_data(icmp) {
        InstructionData::IntCompare { cond, .. } => *cond,
        _ => unreachable!(),
    };

    let mut copies: Vec<CloneMap> = (0..UNROLL_FACTOR)
        .map(|_| clone_blocks(func, &loop_blocks))
        .collect();
    let remainder = clone_blocks(func, &loop_blocks);

    // Chunk bound, computed once in the preheader:
    //   bound2 = ((bound − init) / (U·step)) · (U·step) + init − step
    // The kernel runs while the induction variable is on the bound2 side of
    // the predicate; every kernel pass advances it by U·step, so no kernel
    // iteration can overshoot. The remainder loop re-checks the original
    // condition and picks up the tail.
    let chunk = UNROLL_FACTOR as i32 * step;
    let bound2 = {
        let mut cur = FuncCursor::new(func);
        cur.goto_before_terminator(shape.preheader);
        let init_c = cur.func.dfg.iconst(init);
        let chunk_c = cur.func.dfg.iconst(chunk);
        let diff = cur.ins().isub(bound, init_c);
        let q = cur.ins().idiv(diff, chunk_c);
        let m = cur.ins().imul(q, chunk_c);
        let base = cur.ins().iadd(m, init_c);
        let back = cur.func.dfg.iconst(step);
        cur.ins().isub(base, back)
    };

    // Enter the kernel.
    let pre_term = func.terminator(shape.preheader);
    func.dfg
        .retarget_branch(pre_term, shape.header, copies[0].block(shape.header));

    // Kernel head: compare against the chunk bound, exit into the remainder.
    {
        let k_header = copies[0].block(shape.header);
        let k_iv = copies[0].value(iv);
        let new_cmp = func.dfg.make_inst(InstructionData::IntCompare {
            cond: cc,
            args: [k_iv, bound2],
        });
        let new_cond = func
            .dfg
            .make_inst_result(new_cmp, crate::ir::types::I1);
        func.layout.insert_inst_before(new_cmp, copies[0].inst(icmp));
        let k_term = func.terminator(k_header);
        let mut data = func.dfg.inst_data(k_term).clone();
        if let InstructionData::Branch { cond, .. } = &mut data {
            *cond = new_cond;
        }
        data.retarget_branch(shape.exit, remainder.block(shape.header));
        func.dfg.replace_inst_data(k_term, data);
    }

    // Chain the kernel copies into a straight line with a back edge.
    for i in 0..UNROLL_FACTOR {
        let h = copies[i].block(shape.header);
        if i > 0 {
            for &phi in &header_phis {
                let original_result = func.dfg.inst_result(phi).unwrap();
                let cloned = copies[i].inst(phi);
                let cloned_result = func.dfg.inst_result(cloned).unwrap();
                let latch_value = func.dfg.phi_value_for(phi, shape.latch).unwrap();
                let replacement = copies[i - 1].value(latch_value);
                func.dfg.replace_uses(cloned_result, replacement);
                func.delete_inst(cloned);
                copies[i].rebind_value(original_result, replacement);
            }
            let term = func.terminator(h);
            func.dfg.replace_inst_data(
                term,
                InstructionData::Jump {
                    dest: copies[i].block(shape.body_entry),
                },
            );
        }
        let latch_term = func.terminator(copies[i].block(shape.latch));
        let next = copies[(i + 1) % UNROLL_FACTOR].block(shape.header);
        func.dfg.retarget_branch(latch_term, h, next);
    }

    // Kernel phis: the initial entry stays on the preheader edge; the back
    // edge now comes from the last copy's latch with its values.
    for &phi in &header_phis {
        let k_phi = copies[0].inst(phi);
        let latch_value = func.dfg.phi_value_for(phi, shape.latch).unwrap();
        let last = &copies[UNROLL_FACTOR - 1];
        func.dfg
            .phi_remove_incoming(k_phi, copies[0].block(shape.latch));
        func.dfg.phi_set_incoming(
            k_phi,
            last.block(shape.latch),
            last.value(latch_value),
        );
    }

    // Remainder phis: entered from the kernel header with the kernel's
    // current values.
    for &phi in &header_phis {
        let r_phi = remainder.inst(phi);
        let k_value = copies[0].value(func.dfg.inst_result(phi).unwrap());
        func.dfg.phi_remove_incoming(r_phi, shape.preheader);
        func.dfg
            .phi_set_incoming(r_phi, copies[0].block(shape.header), k_value);
    }

    // Exit phis now come from the remainder.
    for &phi in func.phis(shape.exit).to_vec().iter() {
        if let Some(v) = func.dfg.phi_value_for(phi, shape.header) {
            func.dfg.phi_remove_incoming(phi, shape.header);
            func.dfg.phi_set_incoming(
                phi,
                remainder.block(shape.header),
                remainder.value(v),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::FuncCursor;
    use crate::dominator_tree::DominatorTree;
    use crate::induction::do_induction_analysis;
    use crate::ir::condcodes::IntCC;
    use crate::ir::{types, Opcode, Signature};
    use crate::unreachable_code::eliminate_unreachable_code;

    /// `s = 0; for (i = 0; i < trip; i++) s += i; return s;`
    fn sum_loop(bound: i32) -> Function {
        let mut func = Function::with_signature("f", Signature::new(vec![], types::I32));
        let mut cur = FuncCursor::new(&mut func);
        let entry = cur.insert_block();
        let header = cur.func.dfg.make_block();
        let body = cur.func.dfg.make_block();
        let exit = cur.func.dfg.make_block();
        let zero = cur.func.dfg.iconst(0);
        let one = cur.func.dfg.iconst(1);
        let bound_v = cur.func.dfg.iconst(bound);
        cur.ins().jump(header);

        cur.append_existing_block(header);
        let iv = cur.ins().phi(types::I32, &[(entry, zero)]);
        let sum = cur.ins().phi(types::I32, &[(entry, zero)]);
        let c = cur.ins().icmp(IntCC::SignedLessThan, iv, bound_v);
        cur.ins().branch(c, body, exit);

        cur.append_existing_block(body);
        let sum2 = cur.ins().iadd(sum, iv);
        let iv2 = cur.ins().iadd(iv, one);
        cur.ins().jump(header);

        cur.append_existing_block(exit);
        let closed = cur.ins().phi(types::I32, &[(header, sum)]);
        cur.ins().ret(Some(closed));

        let iv_phi = func.dfg.value_def(iv).unwrap();
        let sum_phi = func.dfg.value_def(sum).unwrap();
        func.dfg.phi_set_incoming(iv_phi, body, iv2);
        func.dfg.phi_set_incoming(sum_phi, body, sum2);
        func
    }

    fn analyses(func: &Function) -> (ControlFlowGraph, DominatorTree, LoopAnalysis) {
        let cfg = ControlFlowGraph::with_function(func);
        let dt = DominatorTree::with_function(func, &cfg);
        let la = LoopAnalysis::with_function(func, &cfg, &dt);
        (cfg, dt, la)
    }

    /// Interpret a loop-free function over i32 constants.
    fn eval_straight_line(func: &Function) -> i32 {
        use std::collections::HashMap;
        let mut env: HashMap<Value, i32> = HashMap::new();
        let mut block = func.entry_block().unwrap();
        let mut from = block;
        let mut steps = 0;
        loop {
            steps += 1;
            assert!(steps < 100_000, "evaluation did not terminate");
            let mut next = None;
            for &inst in func.layout.block_insts(block) {
                let value_of = |env: &HashMap<Value, i32>, v: Value| -> i32 {
                    func.dfg.as_iconst(v).unwrap_or_else(|| env[&v])
                };
                match func.dfg.inst_data(inst).clone() {
                    InstructionData::Phi { args } => {
                        let (_, v) = args.iter().find(|&&(b, _)| b == from).unwrap();
                        let x = value_of(&env, *v);
                        env.insert(func.dfg.inst_result(inst).unwrap(), x);
                    }
                    InstructionData::Binary { opcode, args } => {
                        let l = value_of(&env, args[0]);
                        let r = value_of(&env, args[1]);
                        let x = match opcode {
                            Opcode::Iadd => l.wrapping_add(r),
                            Opcode::Isub => l.wrapping_sub(r),
                            Opcode::Imul => l.wrapping_mul(r),
                            Opcode::Idiv => l / r,
                            Opcode::Irem => l % r,
                            _ => unreachable!(),
                        };
                        env.insert(func.dfg.inst_result(inst).unwrap(), x);
                    }
                    InstructionData::IntCompare { cond, args } => {
                        let l = value_of(&env, args[0]);
                        let r = value_of(&env, args[1]);
                        env.insert(
                            func.dfg.inst_result(inst).unwrap(),
                            cond.eval(l, r) as i32,
                        );
                    }
                    InstructionData::Jump { dest } => next = Some(dest),
                    InstructionData::Branch {
                        cond,
                        then_dest,
                        else_dest,
                    } => {
                        let c = value_of(&env, cond);
                        next = Some(if c != 0 { then_dest } else { else_dest });
                    }
                    InstructionData::Return { arg } => {
                        return value_of(&env, arg.unwrap());
                    }
                    other => unreachable!("{:?}", other.opcode()),
                }
            }
            from = block;
            block = next.unwrap();
        }
    }

    #[test]
    fn const_unroll_flattens_the_loop() {
        let mut func = sum_loop(4);
        let (cfg, _, mut la) = analyses(&func);
        assert_eq!(do_induction_analysis(&func, &cfg, &mut la), 1);
        assert!(do_const_unroll(&mut func, &cfg, &la));
        eliminate_unreachable_code(&mut func);

        // No loop remains.
        let (_, _, la2) = analyses(&func);
        assert_eq!(la2.num_loops(), 0);
        // And the straight-line code still computes 0+1+2+3.
        assert_eq!(eval_straight_line(&func), 6);
    }

    #[test]
    fn const_unroll_respects_size_budget() {
        let mut func = sum_loop((MAX_UNROLLED_INSTS + 1) as i32);
        let (cfg, _, mut la) = analyses(&func);
        do_induction_analysis(&func, &cfg, &mut la);
        assert!(!do_const_unroll(&mut func, &cfg, &la));
    }

    #[test]
    fn runtime_unroll_keeps_semantics() {
        // The bound is a constant here but we withhold the trip count, which
        // is what the runtime unroller keys on.
        for bound in [0, 1, 3, 4, 7, 8, 9, 17] {
            let mut func = sum_loop(bound);
            let (cfg, _, la) = analyses(&func);
            let scev = ScevAnalysis::compute(&func, &cfg, &la);
            assert!(
                do_runtime_unroll(&mut func, &cfg, &la, &scev),
                "bound={bound}"
            );
            eliminate_unreachable_code(&mut func);

            let expected: i32 = (0..bound.max(0)).sum();
            assert_eq!(eval_straight_line(&func), expected, "bound={bound}");
        }
    }

    #[test]
    fn runtime_unroll_creates_kernel_and_remainder() {
        let mut func = sum_loop(100);
        let blocks_before = func.layout.num_blocks();
        let (cfg, _, la) = analyses(&func);
        let scev = ScevAnalysis::compute(&func, &cfg, &la);
        assert!(do_runtime_unroll(&mut func, &cfg, &la, &scev));
        eliminate_unreachable_code(&mut func);

        // Kernel copies plus the remainder replaced the original loop body.
        assert!(func.layout.num_blocks() > blocks_before);
        let (_, _, la2) = analyses(&func);
        // Two loops remain: the kernel and the remainder.
        assert_eq!(la2.num_loops(), 2);
        assert_eq!(eval_straight_line(&func), (0..100).sum::<i32>());
    }
}
