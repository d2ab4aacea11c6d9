//! Dead-instruction elimination.
//!
//! An instruction is dead when nothing uses its result and executing it has
//! no observable effect: all pure arithmetic, comparisons, casts, GEPs, phis,
//! selects and loads qualify, as do calls whose callee's effect summary shows
//! no I/O, no memory writes, and no writes through pointer arguments.
//! Removal runs bottom-up and iterates to a fixed point, since deleting a
//! user can make its operands dead.

use crate::effects::FunctionEffects;
use crate::ir::{Function, InstructionData};
use crate::timing;

/// Remove dead instructions from `func`. Returns `true` on any removal.
pub fn do_dce(func: &mut Function, effects: &FunctionEffects) -> bool {
    let _tt = timing::dce();
    let mut changed = false;
    let mut progress = true;
    while progress {
        progress = false;
        for block_idx in (0..func.layout.blocks().len()).rev() {
            let block = func.layout.blocks()[block_idx];
            for &inst in func.layout.block_insts(block).to_vec().iter().rev() {
                if is_dead(func, effects, inst) {
                    func.delete_inst(inst);
                    progress = true;
                    changed = true;
                }
            }
        }
    }
    changed
}

fn is_dead(func: &Function, effects: &FunctionEffects, inst: crate::ir::Inst) -> bool {
    let result = match func.dfg.inst_result(inst) {
        Some(v) => v,
        // Stores and terminators produce no value and always stay (dead
        // stores are a different pass's business).
        None => return false,
    };
    if !func.dfg.users(result).is_empty() {
        return false;
    }
    match func.dfg.inst_data(inst) {
        InstructionData::Call { func: callee, .. } => effects.call_removable(*callee),
        // Everything else that produces a value is pure (loads are from
        // non-volatile memory), so an unused result means the instruction
        // is dead.
        data => {
            debug_assert!(!data.opcode().is_terminator());
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::FuncCursor;
    use crate::ir::{types, Module, RuntimeFunc, Signature};

    fn num_insts(func: &Function) -> usize {
        func.layout
            .blocks()
            .iter()
            .map(|&b| func.layout.block_insts(b).len())
            .sum()
    }

    #[test]
    fn removes_chains() {
        let mut module = Module::new();
        let f = module.declare_function("f", Signature::new(vec![types::I32], types::I32));
        let func = &mut module.functions[f];
        let x = func.params[0];
        let mut cur = FuncCursor::new(func);
        cur.insert_block();
        let a = cur.ins().iadd(x, x);
        let b = cur.ins().imul(a, a);
        let _c = cur.ins().isub(b, x);
        cur.ins().ret(Some(x));

        let effects = FunctionEffects::compute(&module);
        let func = &mut module.functions[f];
        assert!(do_dce(func, &effects));
        // The whole chain is dead; only the return remains.
        assert_eq!(num_insts(func), 1);
    }

    #[test]
    fn keeps_effectful_calls() {
        let mut module = Module::new();
        let putint = module.runtime_func(RuntimeFunc::Putint);
        let getint = module.runtime_func(RuntimeFunc::Getint);
        let f = module.declare_function("f", Signature::new(vec![], types::VOID));
        let func = &mut module.functions[f];
        let mut cur = FuncCursor::new(func);
        cur.insert_block();
        let v = cur.ins().call(getint, types::I32, &[]).unwrap();
        cur.ins().call(putint, types::VOID, &[v]);
        cur.ins().ret(None);

        let effects = FunctionEffects::compute(&module);
        let func = &mut module.functions[f];
        // getint's result is used; putint writes IO. Nothing is removable.
        assert!(!do_dce(func, &effects));
        assert_eq!(num_insts(func), 3);
    }

    #[test]
    fn removes_pure_call_with_unused_result() {
        let mut module = Module::new();
        let pure = module.declare_function("pure", Signature::new(vec![types::I32], types::I32));
        {
            let func = &mut module.functions[pure];
            let x = func.params[0];
            let mut cur = FuncCursor::new(func);
            cur.insert_block();
            let v = cur.ins().imul(x, x);
            cur.ins().ret(Some(v));
        }
        let f = module.declare_function("f", Signature::new(vec![], types::I32));
        {
            let func = &mut module.functions[f];
            let mut cur = FuncCursor::new(func);
            cur.insert_block();
            let seven = cur.func.dfg.iconst(7);
            let _unused = cur.ins().call(pure, types::I32, &[seven]);
            cur.ins().ret(Some(seven));
        }

        let effects = FunctionEffects::compute(&module);
        let func = &mut module.functions[f];
        assert!(do_dce(func, &effects));
        assert_eq!(num_insts(func), 1);
    }
}
