//! Removal of unreachable blocks.
//!
//! The loop restructurings (unrolling, unswitching) rewire edges and leave
//! the replaced blocks dangling. This pass deletes every block that is no
//! longer reachable from the entry, and prunes phi entries that referenced
//! the deleted blocks.

use crate::ir::{Block, Function};
use crate::timing;
use sysyc_entity::EntitySet;

/// Delete blocks unreachable from the entry. Returns `true` on change.
pub fn eliminate_unreachable_code(func: &mut Function) -> bool {
    let _tt = timing::unreachable_code();

    let entry = match func.entry_block() {
        Some(b) => b,
        None => return false,
    };

    let mut reachable: EntitySet<Block> = EntitySet::new();
    let mut stack = vec![entry];
    reachable.insert(entry);
    while let Some(block) = stack.pop() {
        if let Some(term) = func.layout.last_inst(block) {
            for succ in func.dfg.inst_data(term).branch_targets() {
                if reachable.insert(succ) {
                    stack.push(succ);
                }
            }
        }
    }

    let dead: Vec<Block> = func
        .layout
        .blocks()
        .iter()
        .copied()
        .filter(|&b| !reachable.contains(b))
        .collect();
    if dead.is_empty() {
        return false;
    }

    // Instructions of dead blocks release their operands first, so values
    // defined in live code lose those phantom uses.
    for &block in &dead {
        for &inst in func.layout.block_insts(block).to_vec().iter() {
            func.dfg.detach_inst(inst);
        }
        func.layout.remove_block(block);
        log::trace!("removed unreachable {block}");
    }

    // Phi entries for edges from deleted blocks are gone with the edge.
    for &block in func.layout.blocks().to_vec().iter() {
        for &phi in func.phis(block).to_vec().iter() {
            for &(pred, _) in func.dfg.phi_incoming(phi).to_vec().iter() {
                if !reachable.contains(pred) {
                    func.dfg.phi_remove_incoming(phi, pred);
                }
            }
            // A phi left with a single incoming entry is a copy.
            if func.dfg.phi_incoming(phi).len() == 1 {
                let (_, value) = func.dfg.phi_incoming(phi)[0];
                let result = func.dfg.inst_result(phi).unwrap();
                if value != result {
                    func.dfg.replace_uses(result, value);
                    func.delete_inst(phi);
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::FuncCursor;
    use crate::ir::{types, Signature};

    #[test]
    fn removes_dangling_blocks_and_prunes_phis() {
        let mut func = Function::with_signature("f", Signature::new(vec![types::I32], types::I32));
        let x = func.params[0];
        let mut cur = FuncCursor::new(&mut func);
        let entry = cur.insert_block();
        let dead = cur.func.dfg.make_block();
        let join = cur.func.dfg.make_block();
        cur.ins().jump(join);

        cur.append_existing_block(dead);
        let one = cur.func.dfg.iconst(1);
        let dead_add = cur.ins().iadd(x, one);
        cur.ins().jump(join);

        cur.append_existing_block(join);
        let merged = cur.ins().phi(types::I32, &[(entry, x), (dead, dead_add)]);
        cur.ins().ret(Some(merged));

        assert!(eliminate_unreachable_code(&mut func));
        assert!(!func.layout.is_block_inserted(dead));
        // The phi collapsed to its surviving entry; the return now uses x.
        let ret = func.terminator(join);
        match func.dfg.inst_data(ret) {
            crate::ir::InstructionData::Return { arg } => assert_eq!(arg.unwrap(), x),
            _ => unreachable!(),
        }
        assert!(!eliminate_unreachable_code(&mut func));
    }
}
