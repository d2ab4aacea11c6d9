//! Loop-invariant code motion.
//!
//! An instruction is invariant in its loop when it has no side effects
//! (calls are checked against the callee's effect summary), it is neither a
//! phi nor a terminator, and every operand is a constant, defined outside
//! the loop, or itself already identified as invariant. Loads additionally
//! require that nothing in the loop can clobber the loaded location.
//! Invariant instructions move to the loop's preheader, keeping their
//! original relative order. Loops are processed children before parents, so
//! hoisted code can keep climbing outward.

use crate::alias_analysis::AliasAnalysis;
use crate::effects::FunctionEffects;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Function, Inst, InstructionData, Opcode, Value};
use crate::loop_analysis::{Loop, LoopAnalysis};
use crate::timing;
use sysyc_entity::EntitySet;

/// Hoist invariant instructions out of every loop. Returns `true` on change.
/// Expects loops in simplified form (a preheader per loop).
pub fn do_licm(
    func: &mut Function,
    cfg: &ControlFlowGraph,
    la: &LoopAnalysis,
    effects: &FunctionEffects,
    alias: &AliasAnalysis,
) -> bool {
    let _tt = timing::licm();
    let mut changed = false;
    for lp in la.loops_postorder() {
        let preheader = match la.preheader(lp, cfg) {
            Some(b) => b,
            None => continue,
        };
        let invariants = collect_invariants(func, la, effects, alias, lp);
        if invariants.is_empty() {
            continue;
        }
        let term = func.terminator(preheader);
        for inst in invariants {
            func.layout.remove_inst(inst);
            func.layout.insert_inst_before(inst, term);
            changed = true;
        }
    }
    changed
}

/// Invariant instructions of `lp`, in their original relative order.
fn collect_invariants(
    func: &Function,
    la: &LoopAnalysis,
    effects: &FunctionEffects,
    alias: &AliasAnalysis,
    lp: Loop,
) -> Vec<Inst> {
    let data = la.data(lp);

    // What can clobber memory inside this loop: stored-to pointers and
    // calls that write anywhere.
    let mut stored_ptrs: Vec<Value> = Vec::new();
    let mut has_clobbering_call = false;
    for &block in &data.blocks {
        if !func.layout.is_block_inserted(block) {
            continue;
        }
        for &inst in func.layout.block_insts(block) {
            match func.dfg.inst_data(inst) {
                InstructionData::Store { args } => stored_ptrs.push(args[0]),
                InstructionData::Call { func: callee, .. } => {
                    let info = effects.info(*callee);
                    if info.memory_write || info.has_side_effect {
                        has_clobbering_call = true;
                    }
                }
                _ => {}
            }
        }
    }

    let mut invariant: EntitySet<Inst> = EntitySet::new();
    let mut order: Vec<Inst> = Vec::new();
    let mut grew = true;
    while grew {
        grew = false;
        for &block in &data.blocks {
            if !func.layout.is_block_inserted(block) {
                continue;
            }
            for &inst in func.layout.block_insts(block) {
                if invariant.contains(inst) {
                    continue;
                }
                if !is_hoistable(func, effects, inst) {
                    continue;
                }
                if let InstructionData::Load { ptr } = func.dfg.inst_data(inst) {
                    if has_clobbering_call
                        || stored_ptrs.iter().any(|&s| alias.may_alias(*ptr, s))
                    {
                        continue;
                    }
                }
                let operands_invariant = func.dfg.inst_args(inst).iter().all(|&arg| {
                    if func.dfg.is_const(arg) {
                        return true;
                    }
                    match func.dfg.value_def(arg) {
                        Some(def) => {
                            invariant.contains(def)
                                || match func.layout.inst_block(def) {
                                    Some(b) => !la.contains_block(lp, b),
                                    None => true,
                                }
                        }
                        // Parameters and global addresses are defined
                        // outside every loop.
                        None => true,
                    }
                });
                if operands_invariant {
                    invariant.insert(inst);
                    order.push(inst);
                    grew = true;
                }
            }
        }
    }
    order
}

fn is_hoistable(func: &Function, effects: &FunctionEffects, inst: Inst) -> bool {
    let data = func.dfg.inst_data(inst);
    let opcode = data.opcode();
    if opcode.is_terminator() || opcode == Opcode::Phi {
        return false;
    }
    match data {
        InstructionData::Call { func: callee, .. } => effects.call_pure(*callee),
        InstructionData::Store { .. } | InstructionData::Alloc { .. } => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::FuncCursor;
    use crate::dominator_tree::DominatorTree;
    use crate::ir::condcodes::IntCC;
    use crate::ir::{types, Module, Signature};

    struct Analyzed {
        cfg: ControlFlowGraph,
        la: LoopAnalysis,
    }

    fn analyze(func: &Function) -> Analyzed {
        let cfg = ControlFlowGraph::with_function(func);
        let dt = DominatorTree::with_function(func, &cfg);
        let la = LoopAnalysis::with_function(func, &cfg, &dt);
        Analyzed { cfg, la }
    }

    #[test]
    fn hoists_invariant_arithmetic() {
        // for (i = 0; i < n; i++) { t = a * b; s += t; }
        let mut module = Module::new();
        let f = module.declare_function(
            "f",
            Signature::new(vec![types::I32, types::I32, types::I32], types::I32),
        );
        let func = &mut module.functions[f];
        let n = func.params[0];
        let a = func.params[1];
        let b = func.params[2];
        let mut cur = FuncCursor::new(func);
        let entry = cur.insert_block();
        let header = cur.func.dfg.make_block();
        let body = cur.func.dfg.make_block();
        let exit = cur.func.dfg.make_block();
        let zero = cur.func.dfg.iconst(0);
        let one = cur.func.dfg.iconst(1);
        cur.ins().jump(header);

        cur.append_existing_block(header);
        let iv = cur.ins().phi(types::I32, &[(entry, zero)]);
        let sum = cur.ins().phi(types::I32, &[(entry, zero)]);
        let c = cur.ins().icmp(IntCC::SignedLessThan, iv, n);
        cur.ins().branch(c, body, exit);

        cur.append_existing_block(body);
        let t = cur.ins().imul(a, b);
        let sum2 = cur.ins().iadd(sum, t);
        let iv2 = cur.ins().iadd(iv, one);
        cur.ins().jump(header);

        cur.append_existing_block(exit);
        cur.ins().ret(Some(sum));

        let iv_phi = func.dfg.value_def(iv).unwrap();
        let sum_phi = func.dfg.value_def(sum).unwrap();
        func.dfg.phi_set_incoming(iv_phi, body, iv2);
        func.dfg.phi_set_incoming(sum_phi, body, sum2);

        let analyzed = analyze(func);
        let effects = FunctionEffects::compute(&module);
        let func = &mut module.functions[f];
        let aliasing = AliasAnalysis::compute(&module.globals, &module.types, func);
        assert!(do_licm(
            func,
            &analyzed.cfg,
            &analyzed.la,
            &effects,
            &aliasing
        ));

        // The multiply moved into the loop's preheader (the entry block),
        // ahead of its terminator.
        let mul = func.dfg.value_def(t).unwrap();
        assert_eq!(func.layout.inst_block(mul), Some(entry));
        let entry_insts = func.layout.block_insts(entry);
        assert_eq!(entry_insts[entry_insts.len() - 1], func.terminator(entry));
        // The dependent add stays: one operand is the loop-carried sum.
        let add = func.dfg.value_def(sum2).unwrap();
        assert_eq!(func.layout.inst_block(add), Some(body));
    }

    #[test]
    fn load_stays_when_loop_stores_alias() {
        // for (...) { g = i; t = g; }  -- the load of g cannot move.
        let mut module = Module::new();
        let g = module.declare_global("g", types::I32, crate::ir::Initializer::Zero);
        let f = module.declare_function("f", Signature::new(vec![types::I32], types::I32));
        let func = &mut module.functions[f];
        let n = func.params[0];
        let ts = &mut module.types;
        let gptr_ty = ts.ptr_to(types::I32);
        let mut cur = FuncCursor::new(func);
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
        let gaddr = cur.func.dfg.global_addr(g, gptr_ty);
        cur.ins().store(gaddr, iv);
        let loaded = cur.ins().load(ts, gaddr);
        let iv2 = cur.ins().iadd(iv, one);
        let _use = cur.ins().iadd(loaded, iv2);
        cur.ins().jump(header);

        cur.append_existing_block(exit);
        cur.ins().ret(Some(iv));

        let iv_phi = func.dfg.value_def(iv).unwrap();
        func.dfg.phi_set_incoming(iv_phi, body, iv2);

        let analyzed = analyze(func);
        let effects = FunctionEffects::compute(&module);
        let func = &mut module.functions[f];
        let aliasing = AliasAnalysis::compute(&module.globals, &module.types, func);
        do_licm(func, &analyzed.cfg, &analyzed.la, &effects, &aliasing);

        let load = func.dfg.value_def(loaded).unwrap();
        assert_eq!(func.layout.inst_block(load), Some(body));
    }
}
