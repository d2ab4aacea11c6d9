//! Strength reduction of multiplication, division and remainder by integer
//! constants.
//!
//! Multiplications by a constant reachable from `{shl, add, sub}` trees of
//! cost at most [`MUL_COST`] are replaced by the cheapest such tree, found
//! in a table built once per process. Divisions use the shift/bias sequence
//! for powers of two and Granlund–Montgomery magic multipliers otherwise;
//! remainders compute `x − (x/C)·C`, with an and-mask fast path for
//! positive powers of two. All sequences preserve 32-bit two's-complement
//! semantics on sign-extended 64-bit registers.

use crate::divconst_magic_numbers::{log2_floor, magic_s32};
use crate::fx::FxHashMap;
use crate::lir::{frame::is_imm12, Function, IntOp, MInst, Reg, RegClass, RegImm};
use crate::timing;
use std::sync::{Arc, OnceLock};

use super::regs;

/// Maximum number of shift/add/sub steps a multiplication plan may take
/// before falling back to the hardware multiplier.
pub const MUL_COST: u32 = 3;

/// A multiplication plan: a tree computing `x * C` from `x`.
#[derive(Debug)]
pub enum MulPlan {
    /// The multiplicand itself (`C == 1`).
    Src,
    /// The constant zero (`C == 0`).
    Zero,
    /// A left shift of a subplan.
    Shl(Arc<MulPlan>, u32),
    /// Sum of two subplans.
    Add(Arc<MulPlan>, Arc<MulPlan>),
    /// Difference of two subplans.
    Sub(Arc<MulPlan>, Arc<MulPlan>),
}

type PlanTable = FxHashMap<i32, Arc<MulPlan>>;

static PLANS: OnceLock<PlanTable> = OnceLock::new();

/// The cheapest plan for multiplying by `c`, if one exists within the cost
/// budget. Ties resolve to the first plan found at the lower cost.
pub fn mul_plan(c: i32) -> Option<Arc<MulPlan>> {
    PLANS.get_or_init(build_plan_table).get(&c).cloned()
}

fn build_plan_table() -> PlanTable {
    let mut plans: PlanTable = FxHashMap::default();
    // Constants grouped by the cost at which they were first reached, in
    // deterministic insertion order.
    let mut levels: Vec<Vec<i32>> = vec![vec![0, 1]];
    plans.insert(0, Arc::new(MulPlan::Zero));
    plans.insert(1, Arc::new(MulPlan::Src));

    for cost in 1..=MUL_COST as usize {
        let mut level: Vec<i32> = Vec::new();
        // Shifts: one step on top of a plan one level cheaper.
        for &v in &levels[cost - 1] {
            if v == 0 {
                continue;
            }
            let p = plans[&v].clone();
            for sh in 1..=31u32 {
                let nv = v.wrapping_shl(sh);
                if nv == 0 {
                    break;
                }
                if !plans.contains_key(&nv) {
                    plans.insert(nv, Arc::new(MulPlan::Shl(p.clone(), sh)));
                    level.push(nv);
                }
            }
        }
        // Additions and subtractions over any split of the remaining cost.
        for c1 in 0..cost {
            let c2 = cost - 1 - c1;
            if c2 >= levels.len() {
                continue;
            }
            for i in 0..levels[c1].len() {
                let v1 = levels[c1][i];
                for j in 0..levels[c2].len() {
                    let v2 = levels[c2][j];
                    let p1 = plans[&v1].clone();
                    let p2 = plans[&v2].clone();
                    let sum = v1.wrapping_add(v2);
                    if !plans.contains_key(&sum) {
                        plans.insert(sum, Arc::new(MulPlan::Add(p1.clone(), p2.clone())));
                        level.push(sum);
                    }
                    let diff = v1.wrapping_sub(v2);
                    if !plans.contains_key(&diff) {
                        plans.insert(diff, Arc::new(MulPlan::Sub(p1, p2)));
                        level.push(diff);
                    }
                }
            }
        }
        levels.push(level);
    }
    plans
}

/// Rewrite `mul`/`div`/`rem` by immediate constants across `func`.
pub fn run(func: &mut Function) {
    let _tt = timing::strength_reduction();
    for idx in 0..func.block_order.len() {
        let block = func.block_order[idx];
        let old = std::mem::take(&mut func.blocks[block].insts);
        let mut new = Vec::with_capacity(old.len());
        for inst in old {
            match inst {
                MInst::IntArith {
                    op: IntOp::Mulw,
                    dst,
                    lhs,
                    rhs: RegImm::Imm(c),
                } => emit_mul_const(func, &mut new, dst, lhs, c),
                MInst::IntArith {
                    op: IntOp::Divw,
                    dst,
                    lhs,
                    rhs: RegImm::Imm(c),
                } => emit_div_const(func, &mut new, dst, lhs, c),
                MInst::IntArith {
                    op: IntOp::Remw,
                    dst,
                    lhs,
                    rhs: RegImm::Imm(c),
                } => emit_rem_const(func, &mut new, dst, lhs, c),
                other => new.push(other),
            }
        }
        func.blocks[block].insts = new;
    }
}

fn emit_plan(func: &mut Function, out: &mut Vec<MInst>, plan: &MulPlan, src: Reg) -> Reg {
    match plan {
        MulPlan::Src => src,
        MulPlan::Zero => Reg::Phys(regs::ZERO),
        MulPlan::Shl(sub, sh) => {
            let inner = emit_plan(func, out, sub, src);
            let dst = func.new_vreg(RegClass::Int);
            out.push(MInst::IntArith {
                op: IntOp::Sllw,
                dst,
                lhs: inner,
                rhs: RegImm::Imm(*sh as i32),
            });
            dst
        }
        MulPlan::Add(l, r) => {
            let lv = emit_plan(func, out, l, src);
            let rv = emit_plan(func, out, r, src);
            let dst = func.new_vreg(RegClass::Int);
            out.push(MInst::IntArith {
                op: IntOp::Addw,
                dst,
                lhs: lv,
                rhs: RegImm::Reg(rv),
            });
            dst
        }
        MulPlan::Sub(l, r) => {
            let lv = emit_plan(func, out, l, src);
            let rv = emit_plan(func, out, r, src);
            let dst = func.new_vreg(RegClass::Int);
            out.push(MInst::IntArith {
                op: IntOp::Subw,
                dst,
                lhs: lv,
                rhs: RegImm::Reg(rv),
            });
            dst
        }
    }
}

/// `dst = src * c` as a shift/add/sub tree, or the hardware multiplier when
/// no cheap tree exists.
pub fn emit_mul_const(func: &mut Function, out: &mut Vec<MInst>, dst: Reg, src: Reg, c: i32) {
    match mul_plan(c) {
        Some(plan) => {
            let result = emit_plan(func, out, &plan, src);
            out.push(MInst::Move { dst, src: result });
        }
        None => {
            let tmp = func.new_vreg(RegClass::Int);
            out.push(MInst::LoadImm {
                dst: tmp,
                imm: c as i64,
            });
            out.push(MInst::IntArith {
                op: IntOp::Mulw,
                dst,
                lhs: src,
                rhs: RegImm::Reg(tmp),
            });
        }
    }
}

/// `dst = src / c`, truncating signed division.
pub fn emit_div_const(func: &mut Function, out: &mut Vec<MInst>, dst: Reg, src: Reg, c: i32) {
    assert!(c != 0, "constant division by zero");
    if c == 1 {
        out.push(MInst::Move { dst, src });
        return;
    }
    if c == -1 {
        out.push(MInst::IntArith {
            op: IntOp::Subw,
            dst,
            lhs: Reg::Phys(regs::ZERO),
            rhs: RegImm::Reg(src),
        });
        return;
    }
    if c == i32::MIN {
        // Only INT_MIN / INT_MIN == 1; reuse the hardware divider.
        let tmp = func.new_vreg(RegClass::Int);
        out.push(MInst::LoadImm {
            dst: tmp,
            imm: c as i64,
        });
        out.push(MInst::IntArith {
            op: IntOp::Divw,
            dst,
            lhs: src,
            rhs: RegImm::Reg(tmp),
        });
        return;
    }

    let negative = c < 0;
    let d = c.abs();
    let target = if negative {
        func.new_vreg(RegClass::Int)
    } else {
        dst
    };

    if d & (d - 1) == 0 {
        // d = 2^k: bias negative dividends by d-1, then shift. The logical
        // 64-bit right shift of the sign-extended value produces exactly the
        // k-bit bias for negative inputs and zero otherwise.
        let k = log2_floor(d);
        let bias = func.new_vreg(RegClass::Int);
        out.push(MInst::IntArith {
            op: IntOp::Srl,
            dst: bias,
            lhs: src,
            rhs: RegImm::Imm(64 - k),
        });
        let biased = func.new_vreg(RegClass::Int);
        out.push(MInst::IntArith {
            op: IntOp::Addw,
            dst: biased,
            lhs: src,
            rhs: RegImm::Reg(bias),
        });
        out.push(MInst::IntArith {
            op: IntOp::Sraw,
            dst: target,
            lhs: biased,
            rhs: RegImm::Imm(k),
        });
    } else {
        let magic = magic_s32(d);
        let sign = func.new_vreg(RegClass::Int);
        if magic.mul_by < 1i64 << 31 {
            // q = (x·M) >> (32+sh)  −  (x >> 31)
            let m = func.new_vreg(RegClass::Int);
            out.push(MInst::LoadImm {
                dst: m,
                imm: magic.mul_by,
            });
            let prod = func.new_vreg(RegClass::Int);
            out.push(MInst::IntArith {
                op: IntOp::Mul,
                dst: prod,
                lhs: src,
                rhs: RegImm::Reg(m),
            });
            let shifted = func.new_vreg(RegClass::Int);
            out.push(MInst::IntArith {
                op: IntOp::Sra,
                dst: shifted,
                lhs: prod,
                rhs: RegImm::Imm(32 + magic.shift_by),
            });
            out.push(MInst::IntArith {
                op: IntOp::Sraw,
                dst: sign,
                lhs: src,
                rhs: RegImm::Imm(31),
            });
            out.push(MInst::IntArith {
                op: IntOp::Subw,
                dst: target,
                lhs: shifted,
                rhs: RegImm::Reg(sign),
            });
        } else {
            // M ≥ 2^31: multiply by M − 2^32 and add the dividend back.
            let m = func.new_vreg(RegClass::Int);
            out.push(MInst::LoadImm {
                dst: m,
                imm: magic.mul_by - (1i64 << 32),
            });
            let prod = func.new_vreg(RegClass::Int);
            out.push(MInst::IntArith {
                op: IntOp::Mul,
                dst: prod,
                lhs: src,
                rhs: RegImm::Reg(m),
            });
            let hi = func.new_vreg(RegClass::Int);
            out.push(MInst::IntArith {
                op: IntOp::Sra,
                dst: hi,
                lhs: prod,
                rhs: RegImm::Imm(32),
            });
            let adjusted = func.new_vreg(RegClass::Int);
            out.push(MInst::IntArith {
                op: IntOp::Addw,
                dst: adjusted,
                lhs: hi,
                rhs: RegImm::Reg(src),
            });
            let shifted = func.new_vreg(RegClass::Int);
            out.push(MInst::IntArith {
                op: IntOp::Sraw,
                dst: shifted,
                lhs: adjusted,
                rhs: RegImm::Imm(magic.shift_by),
            });
            out.push(MInst::IntArith {
                op: IntOp::Sraw,
                dst: sign,
                lhs: src,
                rhs: RegImm::Imm(31),
            });
            out.push(MInst::IntArith {
                op: IntOp::Subw,
                dst: target,
                lhs: shifted,
                rhs: RegImm::Reg(sign),
            });
        }
    }

    if negative {
        out.push(MInst::IntArith {
            op: IntOp::Subw,
            dst,
            lhs: Reg::Phys(regs::ZERO),
            rhs: RegImm::Reg(target),
        });
    }
}

/// `dst = src % c`, sign of the dividend.
pub fn emit_rem_const(func: &mut Function, out: &mut Vec<MInst>, dst: Reg, src: Reg, c: i32) {
    assert!(c != 0, "constant remainder by zero");
    if c == 1 || c == -1 {
        out.push(MInst::LoadImm { dst, imm: 0 });
        return;
    }
    if c > 0 && c & (c - 1) == 0 {
        // x % 2^k = x − ((x + bias) & −2^k).
        let k = log2_floor(c);
        let bias = func.new_vreg(RegClass::Int);
        out.push(MInst::IntArith {
            op: IntOp::Srl,
            dst: bias,
            lhs: src,
            rhs: RegImm::Imm(64 - k),
        });
        let biased = func.new_vreg(RegClass::Int);
        out.push(MInst::IntArith {
            op: IntOp::Addw,
            dst: biased,
            lhs: src,
            rhs: RegImm::Reg(bias),
        });
        let mask = -c;
        let masked = func.new_vreg(RegClass::Int);
        if is_imm12(mask) {
            out.push(MInst::IntArith {
                op: IntOp::And,
                dst: masked,
                lhs: biased,
                rhs: RegImm::Imm(mask),
            });
        } else {
            let m = func.new_vreg(RegClass::Int);
            out.push(MInst::LoadImm {
                dst: m,
                imm: mask as i64,
            });
            out.push(MInst::IntArith {
                op: IntOp::And,
                dst: masked,
                lhs: biased,
                rhs: RegImm::Reg(m),
            });
        }
        out.push(MInst::IntArith {
            op: IntOp::Subw,
            dst,
            lhs: src,
            rhs: RegImm::Reg(masked),
        });
        return;
    }

    // r = x − (x/C)·C.
    let q = func.new_vreg(RegClass::Int);
    emit_div_const(func, out, q, src, c);
    let back = func.new_vreg(RegClass::Int);
    emit_mul_const(func, out, back, q, c);
    out.push(MInst::IntArith {
        op: IntOp::Subw,
        dst,
        lhs: src,
        rhs: RegImm::Reg(back),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Simulate the emitted sequence over 64-bit registers, with every
    /// 32-bit value kept sign-extended, matching RV64 semantics.
    fn simulate(insts: &[MInst], inputs: &[(Reg, i64)]) -> std::collections::HashMap<Reg, i64> {
        let mut regs_state: std::collections::HashMap<Reg, i64> = inputs.iter().copied().collect();
        regs_state.insert(Reg::Phys(regs::ZERO), 0);
        let read = |state: &std::collections::HashMap<Reg, i64>, r: Reg| -> i64 {
            if r == Reg::Phys(regs::ZERO) {
                0
            } else {
                state[&r]
            }
        };
        for inst in insts {
            match inst {
                MInst::LoadImm { dst, imm } => {
                    regs_state.insert(*dst, *imm);
                }
                MInst::Move { dst, src } => {
                    let v = read(&regs_state, *src);
                    regs_state.insert(*dst, v);
                }
                MInst::IntArith { op, dst, lhs, rhs } => {
                    let l = read(&regs_state, *lhs);
                    let r = match rhs {
                        RegImm::Reg(r) => read(&regs_state, *r),
                        RegImm::Imm(i) => *i as i64,
                    };
                    let v = match op {
                        IntOp::Add => l.wrapping_add(r),
                        IntOp::Addw => (l.wrapping_add(r) as i32) as i64,
                        IntOp::Sub => l.wrapping_sub(r),
                        IntOp::Subw => (l.wrapping_sub(r) as i32) as i64,
                        IntOp::Mul => l.wrapping_mul(r),
                        IntOp::Mulw => (l.wrapping_mul(r) as i32) as i64,
                        IntOp::Divw => ((l as i32).wrapping_div(r as i32)) as i64,
                        IntOp::Remw => ((l as i32).wrapping_rem(r as i32)) as i64,
                        IntOp::And => l & r,
                        IntOp::Or => l | r,
                        IntOp::Xor => l ^ r,
                        IntOp::Sll => l.wrapping_shl(r as u32 & 63),
                        IntOp::Sllw => ((l as i32).wrapping_shl(r as u32 & 31)) as i64,
                        IntOp::Srl => ((l as u64) >> (r as u32 & 63)) as i64,
                        IntOp::Sra => l >> (r as u32 & 63),
                        IntOp::Sraw => ((l as i32) >> (r as u32 & 31)) as i64,
                    };
                    regs_state.insert(*dst, v);
                }
                other => unreachable!("unexpected instruction {other:?}"),
            }
        }
        regs_state
    }

    const SAMPLES: [i32; 11] = [
        0,
        1,
        -1,
        7,
        -7,
        i32::MIN,
        i32::MAX,
        1 << 30,
        -(1 << 30),
        123456,
        -99999,
    ];

    const CONSTANTS: [i32; 20] = [
        2, 3, 4, 5, 7, 8, 9, 10, 15, 16, 17, 31, 100, 1000003, -1, -3, -8, -10, 127,
        i32::MIN,
    ];

    #[test]
    fn mul_plans_exist_for_cheap_constants() {
        for c in [0, 1, 2, 3, 4, 5, 8, 9, 10, 16, 100, -2, 6, 12, 24] {
            assert!(mul_plan(c).is_some(), "no plan for {c}");
        }
    }

    #[test]
    fn mul_sequences_compute_the_product() {
        for &c in CONSTANTS.iter().chain(&[0, 1, 6, 12, 36, -100]) {
            let mut func = Function::new("t");
            let src = func.new_vreg(RegClass::Int);
            let dst = func.new_vreg(RegClass::Int);
            let mut insts = Vec::new();
            emit_mul_const(&mut func, &mut insts, dst, src, c);
            for &x in &SAMPLES {
                let state = simulate(&insts, &[(src, x as i64)]);
                let got = state[&dst] as i32;
                assert_eq!(got, x.wrapping_mul(c), "x={x} c={c}");
            }
        }
    }

    #[test]
    fn div_sequences_compute_the_quotient() {
        for &c in &CONSTANTS {
            let mut func = Function::new("t");
            let src = func.new_vreg(RegClass::Int);
            let dst = func.new_vreg(RegClass::Int);
            let mut insts = Vec::new();
            emit_div_const(&mut func, &mut insts, dst, src, c);
            for &x in &SAMPLES {
                let state = simulate(&insts, &[(src, x as i64)]);
                let got = state[&dst] as i32;
                assert_eq!(got, x.wrapping_div(c), "x={x} c={c}");
            }
        }
    }

    #[test]
    fn rem_sequences_compute_the_remainder() {
        for &c in &CONSTANTS {
            let mut func = Function::new("t");
            let src = func.new_vreg(RegClass::Int);
            let dst = func.new_vreg(RegClass::Int);
            let mut insts = Vec::new();
            emit_rem_const(&mut func, &mut insts, dst, src, c);
            for &x in &SAMPLES {
                let state = simulate(&insts, &[(src, x as i64)]);
                let got = state[&dst] as i32;
                assert_eq!(got, x.wrapping_rem(c), "x={x} c={c}");
            }
        }
    }

    #[test]
    fn division_scenario_by_ten() {
        let mut func = Function::new("t");
        let src = func.new_vreg(RegClass::Int);
        let dst = func.new_vreg(RegClass::Int);
        let mut insts = Vec::new();
        emit_div_const(&mut func, &mut insts, dst, src, 10);
        let state = simulate(&insts, &[(src, 100)]);
        assert_eq!(state[&dst], 10);
        let state = simulate(&insts, &[(src, -100)]);
        assert_eq!(state[&dst], -10);
    }
}
