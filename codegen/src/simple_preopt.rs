//! Canonicalization of binary operators.
//!
//! Three rewrites, applied everywhere they match:
//! - commutative integer/float binaries put a constant operand on the right;
//! - comparisons with the constant on the left swap operands and predicate;
//! - `x + (−c)` becomes `x − c`, and `x − (−c)` becomes `x + c`.
//!
//! Later passes rely on these shapes: constant matching in strength
//! reduction and trip-count recognition only look at the right operand.

use crate::ir::{Function, InstructionData, Opcode};
use crate::timing;

/// Run the canonicalization over `func`. Returns `true` on any change.
pub fn do_preopt(func: &mut Function) -> bool {
    let _tt = timing::simple_preopt();
    let mut changed = false;

    for block_idx in 0..func.layout.blocks().len() {
        let block = func.layout.blocks()[block_idx];
        for &inst in func.layout.block_insts(block).to_vec().iter() {
            changed |= canonicalize_inst(func, inst);
        }
    }
    changed
}

fn canonicalize_inst(func: &mut Function, inst: crate::ir::Inst) -> bool {
    match func.dfg.inst_data(inst).clone() {
        InstructionData::Binary { opcode, args } => {
            let mut changed = false;
            let mut args = args;
            if opcode.is_commutative()
                && func.dfg.is_const(args[0])
                && !func.dfg.is_const(args[1])
            {
                args.swap(0, 1);
                replace_data(func, inst, InstructionData::Binary { opcode, args });
                changed = true;
            }
            // x + (−c)  →  x − c;  x − (−c)  →  x + c.
            if matches!(opcode, Opcode::Iadd | Opcode::Isub) {
                if let Some(c) = func.dfg.as_iconst(args[1]) {
                    if c < 0 && c != i32::MIN {
                        let flipped = if opcode == Opcode::Iadd {
                            Opcode::Isub
                        } else {
                            Opcode::Iadd
                        };
                        let pos = func.dfg.iconst(-c);
                        replace_data(
                            func,
                            inst,
                            InstructionData::Binary {
                                opcode: flipped,
                                args: [args[0], pos],
                            },
                        );
                        changed = true;
                    }
                }
            }
            changed
        }
        InstructionData::IntCompare { cond, args } => {
            if func.dfg.is_const(args[0]) && !func.dfg.is_const(args[1]) {
                replace_data(
                    func,
                    inst,
                    InstructionData::IntCompare {
                        cond: cond.swap_args(),
                        args: [args[1], args[0]],
                    },
                );
                true
            } else {
                false
            }
        }
        InstructionData::FloatCompare { cond, args } => {
            if func.dfg.is_const(args[0]) && !func.dfg.is_const(args[1]) {
                replace_data(
                    func,
                    inst,
                    InstructionData::FloatCompare {
                        cond: cond.swap_args(),
                        args: [args[1], args[0]],
                    },
                );
                true
            } else {
                false
            }
        }
        _ => false,
    }
}

/// Swap in new instruction data, keeping use lists consistent. The operand
/// multiset may change (sign flips intern a fresh constant).
fn replace_data(func: &mut Function, inst: crate::ir::Inst, data: InstructionData) {
    func.dfg.replace_inst_data(inst, data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::FuncCursor;
    use crate::ir::condcodes::IntCC;
    use crate::ir::{types, Signature};

    #[test]
    fn constant_moves_right() {
        let mut func = Function::with_signature("f", Signature::new(vec![types::I32], types::I32));
        let x = func.params[0];
        let mut cur = FuncCursor::new(&mut func);
        let block = cur.insert_block();
        let five = cur.func.dfg.iconst(5);
        let v = cur.ins().iadd(five, x);
        cur.ins().ret(Some(v));

        assert!(do_preopt(&mut func));
        let add = func.layout.block_insts(block)[0];
        match func.dfg.inst_data(add) {
            InstructionData::Binary { opcode, args } => {
                assert_eq!(*opcode, Opcode::Iadd);
                assert_eq!(args[0], x);
                assert_eq!(func.dfg.as_iconst(args[1]), Some(5));
            }
            _ => unreachable!(),
        }
        // Idempotent.
        assert!(!do_preopt(&mut func));
    }

    #[test]
    fn compare_reverses_predicate() {
        let mut func = Function::with_signature("f", Signature::new(vec![types::I32], types::I1));
        let x = func.params[0];
        let mut cur = FuncCursor::new(&mut func);
        let block = cur.insert_block();
        let five = cur.func.dfg.iconst(5);
        // 5 < x  becomes  x > 5.
        let v = cur.ins().icmp(IntCC::SignedLessThan, five, x);
        cur.ins().ret(Some(v));

        assert!(do_preopt(&mut func));
        let cmp = func.layout.block_insts(block)[0];
        match func.dfg.inst_data(cmp) {
            InstructionData::IntCompare { cond, args } => {
                assert_eq!(*cond, IntCC::SignedGreaterThan);
                assert_eq!(args[0], x);
                assert_eq!(func.dfg.as_iconst(args[1]), Some(5));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn negative_constant_flips_add_sub() {
        let mut func = Function::with_signature("f", Signature::new(vec![types::I32], types::I32));
        let x = func.params[0];
        let mut cur = FuncCursor::new(&mut func);
        let block = cur.insert_block();
        let neg3 = cur.func.dfg.iconst(-3);
        let a = cur.ins().iadd(x, neg3);
        let b = cur.ins().isub(a, neg3);
        cur.ins().ret(Some(b));

        assert!(do_preopt(&mut func));
        let insts = func.layout.block_insts(block).to_vec();
        match func.dfg.inst_data(insts[0]) {
            InstructionData::Binary { opcode, args } => {
                assert_eq!(*opcode, Opcode::Isub);
                assert_eq!(func.dfg.as_iconst(args[1]), Some(3));
            }
            _ => unreachable!(),
        }
        match func.dfg.inst_data(insts[1]) {
            InstructionData::Binary { opcode, args } => {
                assert_eq!(*opcode, Opcode::Iadd);
                assert_eq!(func.dfg.as_iconst(args[1]), Some(3));
            }
            _ => unreachable!(),
        }
    }
}
