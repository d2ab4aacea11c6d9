//! Cursors for inserting instructions into functions.
//!
//! A [`FuncCursor`] tracks an insertion point; [`FuncCursor::ins`] returns a
//! builder whose methods create one instruction each, insert it at the
//! cursor, and hand back the result value. This is the construction API the
//! frontend and the tests drive, and the one passes use when synthesizing
//! instruction sequences.

use crate::ir::condcodes::{FloatCC, IntCC};
use crate::ir::instructions::{InstructionData, Opcode, SwitchCases, ValueList};
use crate::ir::types::{self, TypeStore};
use crate::ir::{Block, FuncRef, Function, Inst, Type, Value};
use smallvec::SmallVec;

/// Insertion position of a cursor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Position {
    /// Not pointing anywhere yet.
    Nowhere,
    /// Appending at the bottom of a block.
    End(Block),
    /// Inserting immediately before an anchor instruction.
    Before(Inst),
}

/// A function cursor: a mutable borrow of a function plus a position.
pub struct FuncCursor<'f> {
    /// The function being edited.
    pub func: &'f mut Function,
    pos: Position,
}

impl<'f> FuncCursor<'f> {
    /// Create a cursor pointing nowhere.
    pub fn new(func: &'f mut Function) -> Self {
        Self {
            func,
            pos: Position::Nowhere,
        }
    }

    /// Create a block, append it to the layout, and move the cursor to its
    /// bottom.
    pub fn insert_block(&mut self) -> Block {
        let block = self.func.dfg.make_block();
        self.func.layout.append_block(block);
        self.pos = Position::End(block);
        block
    }

    /// Append an existing (detached) block and move the cursor to its bottom.
    pub fn append_existing_block(&mut self, block: Block) {
        self.func.layout.append_block(block);
        self.pos = Position::End(block);
    }

    /// Move the cursor to the bottom of `block`.
    pub fn goto_bottom(&mut self, block: Block) {
        self.pos = Position::End(block);
    }

    /// Move the cursor to just before `inst`.
    pub fn goto_inst(&mut self, inst: Inst) {
        self.pos = Position::Before(inst);
    }

    /// Move the cursor to just before the terminator of `block`.
    pub fn goto_before_terminator(&mut self, block: Block) {
        let term = self.func.terminator(block);
        self.pos = Position::Before(term);
    }

    /// The block the cursor currently points into.
    pub fn current_block(&self) -> Option<Block> {
        match self.pos {
            Position::Nowhere => None,
            Position::End(block) => Some(block),
            Position::Before(inst) => self.func.layout.inst_block(inst),
        }
    }

    /// Get the instruction builder at the current position.
    pub fn ins(&mut self) -> InsBuilder<'_, 'f> {
        InsBuilder { cursor: self }
    }

    fn insert_inst(&mut self, inst: Inst) {
        match self.pos {
            Position::Nowhere => panic!("inserting with an unpositioned cursor"),
            Position::End(block) => self.func.layout.append_inst(inst, block),
            Position::Before(anchor) => self.func.layout.insert_inst_before(inst, anchor),
        }
    }
}

/// Instruction builder returned by [`FuncCursor::ins`].
pub struct InsBuilder<'c, 'f> {
    cursor: &'c mut FuncCursor<'f>,
}

impl InsBuilder<'_, '_> {
    fn build(&mut self, data: InstructionData, result_ty: Option<Type>) -> (Inst, Option<Value>) {
        let inst = self.cursor.func.dfg.make_inst(data);
        let result = result_ty.map(|ty| self.cursor.func.dfg.make_inst_result(inst, ty));
        self.cursor.insert_inst(inst);
        (inst, result)
    }

    fn binary(&mut self, opcode: Opcode, ty: Type, lhs: Value, rhs: Value) -> Value {
        self.build(
            InstructionData::Binary {
                opcode,
                args: [lhs, rhs],
            },
            Some(ty),
        )
        .1
        .unwrap()
    }

    // --------------------------------------------------------------
    // Integer arithmetic.

    /// `lhs + rhs`.
    pub fn iadd(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Iadd, types::I32, lhs, rhs)
    }

    /// `lhs - rhs`.
    pub fn isub(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Isub, types::I32, lhs, rhs)
    }

    /// `lhs * rhs`.
    pub fn imul(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Imul, types::I32, lhs, rhs)
    }

    /// `lhs / rhs`, signed, truncating.
    pub fn idiv(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Idiv, types::I32, lhs, rhs)
    }

    /// `lhs % rhs`, sign of the dividend.
    pub fn irem(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Irem, types::I32, lhs, rhs)
    }

    /// Bitwise and.
    pub fn band(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Band, types::I32, lhs, rhs)
    }

    /// Bitwise or.
    pub fn bor(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Bor, types::I32, lhs, rhs)
    }

    /// Bitwise xor.
    pub fn bxor(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Bxor, types::I32, lhs, rhs)
    }

    /// Signed minimum.
    pub fn smin(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Smin, types::I32, lhs, rhs)
    }

    /// Signed maximum.
    pub fn smax(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Smax, types::I32, lhs, rhs)
    }

    // --------------------------------------------------------------
    // Float arithmetic.

    /// `lhs + rhs`.
    pub fn fadd(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Fadd, types::F32, lhs, rhs)
    }

    /// `lhs - rhs`.
    pub fn fsub(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Fsub, types::F32, lhs, rhs)
    }

    /// `lhs * rhs`.
    pub fn fmul(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Fmul, types::F32, lhs, rhs)
    }

    /// `lhs / rhs`.
    pub fn fdiv(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Fdiv, types::F32, lhs, rhs)
    }

    /// Float remainder.
    pub fn frem(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Frem, types::F32, lhs, rhs)
    }

    /// Float minimum.
    pub fn fmin(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Fmin, types::F32, lhs, rhs)
    }

    /// Float maximum.
    pub fn fmax(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Fmax, types::F32, lhs, rhs)
    }

    /// Float negation.
    pub fn fneg(&mut self, arg: Value) -> Value {
        self.build(
            InstructionData::Unary {
                opcode: Opcode::Fneg,
                arg,
            },
            Some(types::F32),
        )
        .1
        .unwrap()
    }

    /// Fused `a*b + c` family.
    pub fn fma(&mut self, opcode: Opcode, a: Value, b: Value, c: Value) -> Value {
        debug_assert!(matches!(
            opcode,
            Opcode::Fmadd | Opcode::Fmsub | Opcode::Fnmadd | Opcode::Fnmsub
        ));
        self.build(
            InstructionData::Fma {
                opcode,
                args: [a, b, c],
            },
            Some(types::F32),
        )
        .1
        .unwrap()
    }

    // --------------------------------------------------------------
    // Casts and comparisons.

    /// Float to signed integer, truncating.
    pub fn fptosi(&mut self, arg: Value) -> Value {
        self.build(
            InstructionData::Unary {
                opcode: Opcode::Fptosi,
                arg,
            },
            Some(types::I32),
        )
        .1
        .unwrap()
    }

    /// Signed integer to float.
    pub fn sitofp(&mut self, arg: Value) -> Value {
        self.build(
            InstructionData::Unary {
                opcode: Opcode::Sitofp,
                arg,
            },
            Some(types::F32),
        )
        .1
        .unwrap()
    }

    /// Zero-extend an `i1` to `i32`.
    pub fn zext(&mut self, arg: Value) -> Value {
        self.build(
            InstructionData::Unary {
                opcode: Opcode::Zext,
                arg,
            },
            Some(types::I32),
        )
        .1
        .unwrap()
    }

    /// Reinterpret a pointer as a pointer of type `ty`.
    pub fn bitcast(&mut self, ty: Type, arg: Value) -> Value {
        self.build(
            InstructionData::Unary {
                opcode: Opcode::Bitcast,
                arg,
            },
            Some(ty),
        )
        .1
        .unwrap()
    }

    /// Integer comparison.
    pub fn icmp(&mut self, cond: IntCC, lhs: Value, rhs: Value) -> Value {
        self.build(
            InstructionData::IntCompare {
                cond,
                args: [lhs, rhs],
            },
            Some(types::I1),
        )
        .1
        .unwrap()
    }

    /// Float comparison.
    pub fn fcmp(&mut self, cond: FloatCC, lhs: Value, rhs: Value) -> Value {
        self.build(
            InstructionData::FloatCompare {
                cond,
                args: [lhs, rhs],
            },
            Some(types::I1),
        )
        .1
        .unwrap()
    }

    /// `cond ? if_true : if_false`.
    pub fn select(&mut self, cond: Value, if_true: Value, if_false: Value) -> Value {
        let ty = self.cursor.func.dfg.value_type(if_true);
        self.build(
            InstructionData::Select {
                args: [cond, if_true, if_false],
            },
            Some(ty),
        )
        .1
        .unwrap()
    }

    // --------------------------------------------------------------
    // Memory.

    /// Stack-allocate one `pointee`; the result is the address.
    pub fn alloc(&mut self, ts: &mut TypeStore, pointee: Type) -> Value {
        let ptr = ts.ptr_to(pointee);
        self.build(
            InstructionData::Alloc {
                allocated_ty: pointee,
            },
            Some(ptr),
        )
        .1
        .unwrap()
    }

    /// Load the scalar at `ptr`.
    pub fn load(&mut self, ts: &TypeStore, ptr: Value) -> Value {
        let ty = ts.pointee(self.cursor.func.dfg.value_type(ptr));
        self.build(InstructionData::Load { ptr }, Some(ty)).1.unwrap()
    }

    /// Store `value` at `ptr`.
    pub fn store(&mut self, ptr: Value, value: Value) -> Inst {
        self.build(InstructionData::Store { args: [ptr, value] }, None)
            .0
    }

    /// `&base[index]`. Indexing a pointer-to-array yields a pointer to the
    /// element type; indexing a pointer-to-scalar keeps the pointer type.
    pub fn gep(&mut self, ts: &mut TypeStore, base: Value, index: Value) -> Value {
        let base_ty = self.cursor.func.dfg.value_type(base);
        let pointee = ts.pointee(base_ty);
        let result_ty = if ts.is_array(pointee) {
            let elem = ts.elem(pointee);
            ts.ptr_to(elem)
        } else {
            base_ty
        };
        self.build(
            InstructionData::GetElementPtr {
                args: [base, index],
            },
            Some(result_ty),
        )
        .1
        .unwrap()
    }

    // --------------------------------------------------------------
    // Calls, phis, terminators.

    /// Call `func` returning a value of `ret_ty` (`None` result for void).
    pub fn call(&mut self, func: FuncRef, ret_ty: Type, args: &[Value]) -> Option<Value> {
        let data = InstructionData::Call {
            func,
            args: ValueList::from_slice(args),
        };
        let result_ty = if ret_ty == types::VOID {
            None
        } else {
            Some(ret_ty)
        };
        self.build(data, result_ty).1
    }

    /// Insert a phi of type `ty` at the phi position of the current block.
    pub fn phi(&mut self, ty: Type, incoming: &[(Block, Value)]) -> Value {
        let block = self
            .cursor
            .current_block()
            .expect("phi insertion requires a block");
        let data = InstructionData::Phi {
            args: SmallVec::from_slice(incoming),
        };
        let inst = self.cursor.func.dfg.make_inst(data);
        let result = self.cursor.func.dfg.make_inst_result(inst, ty);
        self.cursor.func.prepend_phi(block, inst);
        result
    }

    /// Unconditional jump.
    pub fn jump(&mut self, dest: Block) -> Inst {
        self.build(InstructionData::Jump { dest }, None).0
    }

    /// Conditional branch.
    pub fn branch(&mut self, cond: Value, then_dest: Block, else_dest: Block) -> Inst {
        self.build(
            InstructionData::Branch {
                cond,
                then_dest,
                else_dest,
            },
            None,
        )
        .0
    }

    /// Return, with an optional value.
    pub fn ret(&mut self, arg: Option<Value>) -> Inst {
        self.build(InstructionData::Return { arg: arg.into() }, None).0
    }

    /// Multi-way branch.
    pub fn switch(&mut self, arg: Value, default: Block, cases: SwitchCases) -> Inst {
        self.build(
            InstructionData::Switch {
                arg,
                default,
                cases,
            },
            None,
        )
        .0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Signature;

    #[test]
    fn build_straight_line() {
        let mut func = Function::with_signature("f", Signature::new(vec![types::I32], types::I32));
        let x = func.params[0];
        let mut cur = FuncCursor::new(&mut func);
        let block = cur.insert_block();
        let two = cur.func.dfg.iconst(2);
        let doubled = cur.ins().imul(x, two);
        cur.ins().ret(Some(doubled));

        assert_eq!(func.entry_block(), Some(block));
        assert_eq!(func.layout.block_insts(block).len(), 2);
        let term = func.terminator(block);
        assert_eq!(func.dfg.opcode(term), Opcode::Return);
    }

    #[test]
    fn insert_before_terminator() {
        let mut func = Function::with_signature("f", Signature::new(vec![], types::VOID));
        let mut cur = FuncCursor::new(&mut func);
        let block = cur.insert_block();
        cur.ins().ret(None);

        cur.goto_before_terminator(block);
        let one = cur.func.dfg.iconst(1);
        let two = cur.func.dfg.iconst(2);
        let a = cur.ins().iadd(one, two);
        let b = cur.ins().imul(a, one);
        let insts = func.layout.block_insts(block);
        assert_eq!(insts.len(), 3);
        assert_eq!(func.dfg.inst_result(insts[0]), Some(a));
        assert_eq!(func.dfg.inst_result(insts[1]), Some(b));
        assert_eq!(func.dfg.opcode(insts[2]), Opcode::Return);
    }
}
