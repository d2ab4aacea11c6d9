//! Promotion of scalar stack slots to SSA values.
//!
//! The classic construction of Cytron et al.: for every `alloc` of a scalar
//! whose users are all plain loads and stores, phis are placed at the
//! iterated dominance frontier of the defining blocks, then a dominator-tree
//! walk renames loads to the reaching definition. Loads with no reaching
//! definition read the type's zero. The alloc and all its memory traffic
//! disappear.

use crate::dominator_tree::DominatorTree;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function, Inst, InstructionData, TypeStore, Value};
use crate::timing;
use smallvec::SmallVec;
use sysyc_entity::EntitySet;

/// Run mem2reg on `func`. Returns `true` if any alloc was promoted.
pub fn do_mem2reg(
    func: &mut Function,
    types: &TypeStore,
    cfg: &ControlFlowGraph,
    domtree: &DominatorTree,
) -> bool {
    let _tt = timing::mem2reg();
    debug_assert!(domtree.is_valid());

    let candidates = collect_promotable(func, types);
    for &alloc in &candidates {
        promote(func, types, cfg, domtree, alloc);
    }
    !candidates.is_empty()
}

/// Scalar allocs whose only users are loads and stores of the full slot.
fn collect_promotable(func: &Function, types: &TypeStore) -> Vec<Inst> {
    let mut out = Vec::new();
    for &block in func.layout.blocks() {
        for &inst in func.layout.block_insts(block) {
            let allocated_ty = match func.dfg.inst_data(inst) {
                InstructionData::Alloc { allocated_ty } => *allocated_ty,
                _ => continue,
            };
            if !types.is_scalar(allocated_ty) {
                continue;
            }
            let slot = func.dfg.inst_result(inst).unwrap();
            let only_memory_users = func.dfg.users(slot).iter().all(|&user| {
                match func.dfg.inst_data(user) {
                    InstructionData::Load { .. } => true,
                    // The slot must be the address, not the stored value.
                    InstructionData::Store { args } => args[0] == slot && args[1] != slot,
                    _ => false,
                }
            });
            if only_memory_users {
                out.push(inst);
            }
        }
    }
    out
}

fn promote(
    func: &mut Function,
    types: &TypeStore,
    cfg: &ControlFlowGraph,
    domtree: &DominatorTree,
    alloc: Inst,
) {
    let slot = func.dfg.inst_result(alloc).unwrap();
    let ty = match func.dfg.inst_data(alloc) {
        InstructionData::Alloc { allocated_ty } => *allocated_ty,
        _ => unreachable!(),
    };
    let ty_data = types.data(ty);

    // The blocks containing a store to the slot.
    let mut def_blocks: Vec<Block> = Vec::new();
    let mut loads: EntitySet<Inst> = EntitySet::new();
    let mut stores: EntitySet<Inst> = EntitySet::new();
    for &user in func.dfg.users(slot) {
        let block = match func.layout.inst_block(user) {
            Some(b) => b,
            None => continue,
        };
        match func.dfg.inst_data(user) {
            InstructionData::Load { .. } => {
                loads.insert(user);
            }
            InstructionData::Store { .. } => {
                stores.insert(user);
                if !def_blocks.contains(&block) {
                    def_blocks.push(block);
                }
            }
            _ => unreachable!("non-memory user survived the promotability check"),
        }
    }

    // Insert phis at the iterated dominance frontier of the defining blocks.
    let mut phis: EntitySet<Inst> = EntitySet::new();
    let mut placed: EntitySet<Block> = EntitySet::new();
    let mut worklist = def_blocks.clone();
    while let Some(block) = worklist.pop() {
        for &join in domtree.frontier(block) {
            if !placed.insert(join) {
                continue;
            }
            let zero = func.dfg.zero_value(ty_data);
            let incoming: SmallVec<[(Block, Value); 4]> = cfg
                .preds(join)
                .iter()
                .map(|&pred| (pred, zero))
                .collect();
            let phi = func.dfg.make_inst(InstructionData::Phi { args: incoming });
            func.dfg.make_inst_result(phi, ty);
            func.prepend_phi(join, phi);
            phis.insert(phi);
            if !def_blocks.contains(&join) {
                worklist.push(join);
            }
        }
    }

    // Rename along the dominator tree, maintaining the reaching-definition
    // stack explicitly.
    let entry = match func.entry_block() {
        Some(b) => b,
        None => return,
    };
    let mut def_stack: Vec<Value> = Vec::new();
    // (block, pushed definitions when entered, next child index); a child
    // index of usize::MAX marks an unentered frame.
    let mut walk: Vec<(Block, usize, usize)> = vec![(entry, 0, usize::MAX)];
    while let Some(frame) = walk.last_mut() {
        let (block, _, cursor) = *frame;
        if cursor == usize::MAX {
            // First visit: rewrite the block, then fix up successor phis.
            frame.2 = 0;
            let mut pushed = 0usize;
            for &inst in func.layout.block_insts(block).to_vec().iter() {
                if phis.contains(inst) {
                    def_stack.push(func.dfg.inst_result(inst).unwrap());
                    pushed += 1;
                } else if loads.contains(inst) {
                    let replacement = match def_stack.last() {
                        Some(&v) => v,
                        None => func.dfg.zero_value(ty_data),
                    };
                    let result = func.dfg.inst_result(inst).unwrap();
                    func.dfg.replace_uses(result, replacement);
                    func.delete_inst(inst);
                } else if stores.contains(inst) {
                    let value = match func.dfg.inst_data(inst) {
                        InstructionData::Store { args } => args[1],
                        _ => unreachable!(),
                    };
                    def_stack.push(value);
                    pushed += 1;
                    func.delete_inst(inst);
                }
            }
            walk.last_mut().unwrap().1 = pushed;

            for &succ in cfg.succs(block) {
                for &phi in func.phis(succ).to_vec().iter() {
                    if !phis.contains(phi) {
                        continue;
                    }
                    let reaching = match def_stack.last() {
                        Some(&v) => v,
                        None => func.dfg.zero_value(ty_data),
                    };
                    func.dfg.phi_set_incoming(phi, block, reaching);
                }
            }
        } else {
            let children = domtree.children(block);
            if let Some(&child) = children.get(cursor) {
                frame.2 += 1;
                walk.push((child, 0, usize::MAX));
            } else {
                let pushed = frame.1;
                def_stack.truncate(def_stack.len() - pushed);
                walk.pop();
            }
        }
    }

    // The slot itself goes away.
    func.delete_inst(alloc);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::FuncCursor;
    use crate::ir::condcodes::IntCC;
    use crate::ir::{types, Module, Opcode, Signature};

    fn run(func: &mut Function, types: &TypeStore) -> bool {
        let cfg = ControlFlowGraph::with_function(func);
        let domtree = DominatorTree::with_function(func, &cfg);
        do_mem2reg(func, types, &cfg, &domtree)
    }

    fn count_opcodes(func: &Function, opcode: Opcode) -> usize {
        func.layout
            .blocks()
            .iter()
            .flat_map(|&b| func.layout.block_insts(b))
            .filter(|&&i| func.dfg.opcode(i) == opcode)
            .count()
    }

    #[test]
    fn straight_line_promotion() {
        // int t = 0; t = 1; return t;  -- afterwards the function has no
        // alloc/load/store and returns the constant 1.
        let mut module = Module::new();
        let f = module.declare_function("f", Signature::new(vec![], types::I32));
        let func = &mut module.functions[f];
        let ts = &mut module.types;
        let mut cur = FuncCursor::new(func);
        let block = cur.insert_block();
        let t = cur.ins().alloc(ts, types::I32);
        let zero = cur.func.dfg.iconst(0);
        let one = cur.func.dfg.iconst(1);
        cur.ins().store(t, zero);
        cur.ins().store(t, one);
        let v = cur.ins().load(ts, t);
        cur.ins().ret(Some(v));

        assert!(run(func, ts));
        assert_eq!(count_opcodes(func, Opcode::Alloc), 0);
        assert_eq!(count_opcodes(func, Opcode::Load), 0);
        assert_eq!(count_opcodes(func, Opcode::Store), 0);
        let term = func.terminator(block);
        match func.dfg.inst_data(term) {
            InstructionData::Return { arg } => {
                assert_eq!(func.dfg.as_iconst(arg.unwrap()), Some(1));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn diamond_inserts_phi() {
        // t = 1 on one arm, t = 2 on the other; the join reads a phi.
        let mut module = Module::new();
        let f = module.declare_function("f", Signature::new(vec![types::I32], types::I32));
        let func = &mut module.functions[f];
        let x = func.params[0];
        let ts = &mut module.types;
        let mut cur = FuncCursor::new(func);
        let _entry = cur.insert_block();
        let then_b = cur.func.dfg.make_block();
        let else_b = cur.func.dfg.make_block();
        let join = cur.func.dfg.make_block();

        let t = cur.ins().alloc(ts, types::I32);
        let zero = cur.func.dfg.iconst(0);
        let cond = cur.ins().icmp(IntCC::SignedLessThan, x, zero);
        cur.ins().branch(cond, then_b, else_b);

        cur.append_existing_block(then_b);
        let one = cur.func.dfg.iconst(1);
        cur.ins().store(t, one);
        cur.ins().jump(join);

        cur.append_existing_block(else_b);
        let two = cur.func.dfg.iconst(2);
        cur.ins().store(t, two);
        cur.ins().jump(join);

        cur.append_existing_block(join);
        let v = cur.ins().load(ts, t);
        cur.ins().ret(Some(v));

        assert!(run(func, ts));
        assert_eq!(count_opcodes(func, Opcode::Alloc), 0);
        assert_eq!(count_opcodes(func, Opcode::Phi), 1);
        let phi = func.phis(join)[0];
        let mut incoming: Vec<i32> = func
            .dfg
            .phi_incoming(phi)
            .iter()
            .map(|&(_, v)| func.dfg.as_iconst(v).unwrap())
            .collect();
        incoming.sort();
        assert_eq!(incoming, [1, 2]);
        // SSA invariant: the phi's incoming edges match the predecessors.
        let cfg = ControlFlowGraph::with_function(func);
        let mut preds: Vec<Block> = cfg.preds(join).to_vec();
        let mut phi_preds: Vec<Block> =
            func.dfg.phi_incoming(phi).iter().map(|&(b, _)| b).collect();
        preds.sort();
        phi_preds.sort();
        assert_eq!(preds, phi_preds);
    }

    #[test]
    fn uninitialized_load_reads_zero() {
        let mut module = Module::new();
        let f = module.declare_function("f", Signature::new(vec![], types::I32));
        let func = &mut module.functions[f];
        let ts = &mut module.types;
        let mut cur = FuncCursor::new(func);
        cur.insert_block();
        let t = cur.ins().alloc(ts, types::I32);
        let v = cur.ins().load(ts, t);
        cur.ins().ret(Some(v));

        assert!(run(func, ts));
        let block = func.entry_block().unwrap();
        let term = func.terminator(block);
        match func.dfg.inst_data(term) {
            InstructionData::Return { arg } => {
                assert_eq!(func.dfg.as_iconst(arg.unwrap()), Some(0));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn array_allocs_are_left_alone() {
        let mut module = Module::new();
        let f = module.declare_function("f", Signature::new(vec![], types::I32));
        let func = &mut module.functions[f];
        let ts = &mut module.types;
        let arr = ts.array_of(types::I32, 4);
        let mut cur = FuncCursor::new(func);
        cur.insert_block();
        let slot = cur.ins().alloc(ts, arr);
        let zero = cur.func.dfg.iconst(0);
        let p = cur.ins().gep(ts, slot, zero);
        let v = cur.ins().load(ts, p);
        cur.ins().ret(Some(v));

        assert!(!run(func, ts));
        assert_eq!(count_opcodes(func, Opcode::Alloc), 1);
        assert_eq!(count_opcodes(func, Opcode::Load), 1);
    }
}
