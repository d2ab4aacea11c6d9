//! Scalar-evolution analysis.
//!
//! A SCEV expression describes how a value changes across the iterations of
//! one loop. The representation is a binomial chain `{c0, c1, c2, …}` whose
//! value at iteration `n` is `Σ ci · C(n, i)`; a basic induction variable
//! `i = init; i += step` is the two-element chain `{init, step}`. Chains of
//! `add`/`mul` over SCEV-typed operands fold into longer chains using
//! binomial-coefficient expansion when both sides evolve in the same loop.
//!
//! The analysis also derives loop trip counts from the header comparison;
//! the closed forms count exactly the iterations for which the predicate
//! holds, matching an interpreter-level simulation of the loop.

use crate::flowgraph::ControlFlowGraph;
use crate::fx::FxHashMap;
use crate::ir::condcodes::IntCC;
use crate::ir::{Function, InstructionData, Opcode, Value};
use crate::loop_analysis::{Loop, LoopAnalysis};
use crate::timing;
use sysyc_entity::{entity_impl, PrimaryMap};

/// An opaque reference to a SCEV expression.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ScevId(u32);
entity_impl!(ScevId, "scev");

/// A scalar-evolution expression.
#[derive(Clone, Debug)]
pub enum ScevExpr {
    /// A loop-independent constant.
    Constant(i32),
    /// A binomial chain evolving in `lp`; `operands[0]` is the initial
    /// value, `operands[1]` the first-order step.
    AddRec {
        /// The loop this chain evolves in.
        lp: Loop,
        /// Chain elements, lowest order first.
        operands: Vec<ScevId>,
    },
}

/// Scalar-evolution facts for one function.
pub struct ScevAnalysis {
    exprs: PrimaryMap<ScevId, ScevExpr>,
    map: FxHashMap<Value, ScevId>,
}

impl ScevAnalysis {
    /// Compute SCEV expressions for the induction variables of `func`.
    /// Expects loops in simplified form (unique preheader and latch).
    pub fn compute(func: &Function, cfg: &ControlFlowGraph, la: &LoopAnalysis) -> Self {
        let _tt = timing::scev();
        let mut this = Self {
            exprs: PrimaryMap::new(),
            map: FxHashMap::default(),
        };
        this.find_basic_ivs(func, cfg, la);
        this.find_derived_ivs(func);
        this
    }

    /// The expression attached to `value`, if any.
    pub fn value_scev(&self, value: Value) -> Option<ScevId> {
        self.map.get(&value).copied()
    }

    /// The contents of `id`.
    pub fn expr(&self, id: ScevId) -> &ScevExpr {
        &self.exprs[id]
    }

    /// The constant initial value of a chain, when it is constant.
    pub fn init(&self, id: ScevId) -> Option<i32> {
        match &self.exprs[id] {
            ScevExpr::Constant(c) => Some(*c),
            ScevExpr::AddRec { operands, .. } => match self.exprs[*operands.first()?] {
                ScevExpr::Constant(c) => Some(c),
                _ => None,
            },
        }
    }

    /// The constant first-order step of a chain, when it is constant.
    pub fn step(&self, id: ScevId) -> Option<i32> {
        match &self.exprs[id] {
            ScevExpr::Constant(_) => Some(0),
            ScevExpr::AddRec { operands, .. } => match self.exprs[*operands.get(1)?] {
                ScevExpr::Constant(c) => Some(c),
                _ => None,
            },
        }
    }

    /// The loop a chain evolves in.
    pub fn evolution_loop(&self, id: ScevId) -> Option<Loop> {
        match &self.exprs[id] {
            ScevExpr::Constant(_) => None,
            ScevExpr::AddRec { lp, .. } => Some(*lp),
        }
    }

    /// Are all chain elements known non-negative constants?
    pub fn not_negative(&self, id: ScevId) -> bool {
        match &self.exprs[id] {
            ScevExpr::Constant(c) => *c >= 0,
            ScevExpr::AddRec { operands, .. } => {
                operands.iter().all(|&op| self.not_negative(op))
            }
        }
    }

    // ------------------------------------------------------------------
    // Trip counts.

    /// Derive the trip count of `lp` from its header comparison: the number
    /// of times the loop body executes. Returns `None` when the loop shape
    /// is not recognized (no affine induction variable, `==`/`!=` predicate,
    /// zero step, or a step running away from the bound).
    pub fn loop_trip_count(
        &self,
        func: &Function,
        la: &LoopAnalysis,
        lp: Loop,
    ) -> Option<u32> {
        let data = la.data(lp);
        if data.exits.len() != 1 {
            return None;
        }
        let term = func.terminator(data.header);
        let (cond, then_dest) = match func.dfg.inst_data(term) {
            InstructionData::Branch {
                cond, then_dest, ..
            } => (*cond, *then_dest),
            _ => return None,
        };
        let cmp = func.dfg.value_def(cond)?;
        let (mut cc, lhs, rhs) = match func.dfg.inst_data(cmp) {
            InstructionData::IntCompare { cond, args } => (*cond, args[0], args[1]),
            _ => return None,
        };
        // The closed forms count the iterations for which the predicate
        // keeps the loop running; complement it when the true edge exits.
        if then_dest == data.exits[0] {
            cc = cc.complement();
        }

        let (cc, iv, bound) = if let Some(n) = func.dfg.as_iconst(rhs) {
            (cc, lhs, n)
        } else if let Some(n) = func.dfg.as_iconst(lhs) {
            (cc.swap_args(), rhs, n)
        } else {
            return None;
        };

        let scev = self.value_scev(iv)?;
        if self.evolution_loop(scev) != Some(lp) {
            return None;
        }
        let init = self.init(scev)?;
        let step = self.step(scev)?;
        trip_count_closed_form(cc, init as i64, step as i64, bound as i64)
    }

    // ------------------------------------------------------------------
    // Construction.

    fn intern_const(&mut self, c: i32) -> ScevId {
        // Constants are few; a linear scan keeps the arena simple.
        for (id, expr) in self.exprs.iter() {
            if let ScevExpr::Constant(existing) = expr {
                if *existing == c {
                    return id;
                }
            }
        }
        self.exprs.push(ScevExpr::Constant(c))
    }

    fn query(&mut self, func: &Function, value: Value) -> Option<ScevId> {
        if let Some(&id) = self.map.get(&value) {
            return Some(id);
        }
        let c = func.dfg.as_iconst(value)?;
        let id = self.intern_const(c);
        self.map.insert(value, id);
        Some(id)
    }

    /// Find the basic induction variables: two-entry header phis whose latch
    /// value is `phi + constant`.
    fn find_basic_ivs(&mut self, func: &Function, cfg: &ControlFlowGraph, la: &LoopAnalysis) {
        for lp in la.loops() {
            let data = la.data(lp);
            let preheader = match la.preheader(lp, cfg) {
                Some(b) => b,
                None => continue,
            };
            let latch = match la.latch(lp) {
                Some(b) => b,
                None => continue,
            };
            for &phi in func.phis(data.header) {
                if func.dfg.phi_incoming(phi).len() != 2 {
                    continue;
                }
                let initial = match func.dfg.phi_value_for(phi, preheader) {
                    Some(v) => v,
                    None => continue,
                };
                let next = match func.dfg.phi_value_for(phi, latch) {
                    Some(v) => v,
                    None => continue,
                };
                let next_inst = match func.dfg.value_def(next) {
                    Some(inst) => inst,
                    None => continue,
                };
                let (op1, op2) = match func.dfg.inst_data(next_inst) {
                    InstructionData::Binary {
                        opcode: Opcode::Iadd,
                        args,
                    } => (args[0], args[1]),
                    _ => continue,
                };
                let phi_result = func.dfg.inst_result(phi).unwrap();
                let step = if op1 == phi_result {
                    op2
                } else if op2 == phi_result {
                    op1
                } else {
                    continue;
                };
                if func.dfg.as_iconst(step).is_none() {
                    continue;
                }
                let (init_scev, step_scev) =
                    match (self.query(func, initial), self.query(func, step)) {
                        (Some(a), Some(b)) => (a, b),
                        _ => continue,
                    };
                let id = self.exprs.push(ScevExpr::AddRec {
                    lp,
                    operands: vec![init_scev, step_scev],
                });
                self.map.insert(phi_result, id);
                // The incremented value is the same chain advanced one
                // iteration: {init+step, step}.
                if !self.map.contains_key(&next) {
                    if let Some(folded) = self.fold_add(id, step_scev) {
                        self.map.insert(next, folded);
                    }
                }
            }
        }
    }

    /// Fold `add`/`mul` over SCEV-typed operands into derived chains.
    fn find_derived_ivs(&mut self, func: &Function) {
        for &block in func.layout.blocks() {
            for &inst in func.layout.block_insts(block) {
                let (opcode, lhs, rhs) = match func.dfg.inst_data(inst) {
                    InstructionData::Binary { opcode, args }
                        if matches!(opcode, Opcode::Iadd | Opcode::Imul) =>
                    {
                        (*opcode, args[0], args[1])
                    }
                    _ => continue,
                };
                let result = match func.dfg.inst_result(inst) {
                    Some(v) => v,
                    None => continue,
                };
                if self.map.contains_key(&result) {
                    continue;
                }
                let (l, r) = match (self.query(func, lhs), self.query(func, rhs)) {
                    (Some(l), Some(r)) => (l, r),
                    _ => continue,
                };
                let folded = match opcode {
                    Opcode::Iadd => self.fold_add(l, r),
                    Opcode::Imul => self.fold_mul(l, r),
                    _ => unreachable!(),
                };
                if let Some(id) = folded {
                    self.map.insert(result, id);
                }
            }
        }
    }

    fn same_loop(&self, l: ScevId, r: ScevId) -> bool {
        match (self.evolution_loop(l), self.evolution_loop(r)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn fold_add(&mut self, l: ScevId, r: ScevId) -> Option<ScevId> {
        match (self.exprs[l].clone(), self.exprs[r].clone()) {
            (ScevExpr::Constant(a), ScevExpr::Constant(b)) => {
                Some(self.intern_const(a.wrapping_add(b)))
            }
            (ScevExpr::Constant(_), ScevExpr::AddRec { .. }) => self.fold_add(r, l),
            (ScevExpr::AddRec { lp, operands }, ScevExpr::Constant(_)) => {
                let base = self.fold_add(operands[0], r)?;
                let mut new_ops = operands;
                new_ops[0] = base;
                Some(self.exprs.push(ScevExpr::AddRec {
                    lp,
                    operands: new_ops,
                }))
            }
            (
                ScevExpr::AddRec { lp, operands: lops },
                ScevExpr::AddRec { operands: rops, .. },
            ) => {
                if !self.same_loop(l, r) {
                    return None;
                }
                let size = lops.len().max(rops.len());
                let mut operands = Vec::with_capacity(size);
                for i in 0..size {
                    let id = match (lops.get(i), rops.get(i)) {
                        (Some(&a), Some(&b)) => self.fold_add(a, b)?,
                        (Some(&a), None) => a,
                        (None, Some(&b)) => b,
                        (None, None) => unreachable!(),
                    };
                    operands.push(id);
                }
                Some(self.exprs.push(ScevExpr::AddRec { lp, operands }))
            }
        }
    }

    fn fold_mul(&mut self, l: ScevId, r: ScevId) -> Option<ScevId> {
        match (self.exprs[l].clone(), self.exprs[r].clone()) {
            (ScevExpr::Constant(a), ScevExpr::Constant(b)) => {
                Some(self.intern_const(a.wrapping_mul(b)))
            }
            (ScevExpr::Constant(_), ScevExpr::AddRec { .. }) => self.fold_mul(r, l),
            (ScevExpr::AddRec { lp, operands }, ScevExpr::Constant(_)) => {
                let mut new_ops = Vec::with_capacity(operands.len());
                for op in operands {
                    new_ops.push(self.fold_mul(op, r)?);
                }
                Some(self.exprs.push(ScevExpr::AddRec {
                    lp,
                    operands: new_ops,
                }))
            }
            (
                ScevExpr::AddRec { lp, operands: lops },
                ScevExpr::AddRec { operands: rops, .. },
            ) => {
                if !self.same_loop(l, r) {
                    return None;
                }
                // Product of binomial chains; closed only when every
                // contributing element is constant.
                let n = lops.len() + rops.len() - 1;
                let mut operands = Vec::with_capacity(n);
                for i in 0..n as i64 {
                    let mut sum: i64 = 0;
                    for j in i..=2 * i {
                        let coe_1 = binomial(i, 2 * i - j);
                        let lmax = lops.len() as i64 - 1;
                        let rmax = rops.len() as i64 - 1;
                        let lo = (j - i).max(j - lmax).max(0);
                        let hi = (i + 1).min(rmax + 1);
                        for k in lo..hi {
                            let li = j - k;
                            if li < 0 || li > lmax {
                                continue;
                            }
                            let coe_2 = binomial(2 * i - j, i - k);
                            let (a, b) = (lops[li as usize], rops[k as usize]);
                            match (&self.exprs[a], &self.exprs[b]) {
                                (ScevExpr::Constant(x), ScevExpr::Constant(y)) => {
                                    sum += coe_1 * coe_2 * (*x as i64) * (*y as i64);
                                }
                                _ => return None,
                            }
                        }
                    }
                    let id = self.intern_const(sum as i32);
                    operands.push(id);
                }
                Some(self.exprs.push(ScevExpr::AddRec { lp, operands }))
            }
        }
    }
}

/// `C(n, k)` with out-of-range arguments yielding 0.
fn binomial(n: i64, k: i64) -> i64 {
    if k < 0 || n < 0 || k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut result: i64 = 1;
    for i in 0..k {
        result = result * (n - i) / (i + 1);
    }
    result
}

/// Closed-form trip count: the number of iterations for which
/// `iv (cc) bound` holds, starting at `init` and stepping by `step`.
/// `None` means not computable.
fn trip_count_closed_form(cc: IntCC, init: i64, step: i64, bound: i64) -> Option<u32> {
    let diff = bound - init;
    let count = match cc {
        IntCC::Equal | IntCC::NotEqual => return None,
        IntCC::SignedLessThan => {
            if init >= bound {
                0
            } else if step > 0 {
                div_ceil(diff, step)
            } else {
                return None;
            }
        }
        IntCC::SignedLessThanOrEqual => {
            if init > bound {
                0
            } else if step > 0 {
                diff / step + 1
            } else {
                return None;
            }
        }
        IntCC::SignedGreaterThan => {
            if init <= bound {
                0
            } else if step < 0 {
                div_ceil(diff, step)
            } else {
                return None;
            }
        }
        IntCC::SignedGreaterThanOrEqual => {
            if init < bound {
                0
            } else if step < 0 {
                diff / step + 1
            } else {
                return None;
            }
        }
    };
    u32::try_from(count).ok()
}

/// Ceiling division for a quotient known to be non-negative.
fn div_ceil(num: i64, den: i64) -> i64 {
    debug_assert!(den != 0);
    let q = num / den;
    if num % den != 0 && (num >= 0) == (den >= 0) {
        q + 1
    } else {
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::FuncCursor;
    use crate::dominator_tree::DominatorTree;
    use crate::ir::{types, Signature};

    /// `i = init; while (i < n or similar) i += step;` with a constant bound.
    fn counted_loop(cc: IntCC, init: i32, step: i32, bound: i32) -> (Function, Loop, u32) {
        let mut func = Function::with_signature("f", Signature::new(vec![], types::I32));
        let mut cur = FuncCursor::new(&mut func);
        let entry = cur.insert_block();
        let header = cur.func.dfg.make_block();
        let body = cur.func.dfg.make_block();
        let exit = cur.func.dfg.make_block();
        let init_v = cur.func.dfg.iconst(init);
        let step_v = cur.func.dfg.iconst(step);
        let bound_v = cur.func.dfg.iconst(bound);
        cur.ins().jump(header);

        cur.append_existing_block(header);
        let iv = cur.ins().phi(types::I32, &[(entry, init_v)]);
        let cond = cur.ins().icmp(cc, iv, bound_v);
        cur.ins().branch(cond, body, exit);

        cur.append_existing_block(body);
        let next = cur.ins().iadd(iv, step_v);
        cur.ins().jump(header);

        cur.append_existing_block(exit);
        cur.ins().ret(Some(iv));

        let phi = func.dfg.value_def(iv).unwrap();
        func.dfg.phi_set_incoming(phi, body, next);

        // Reference semantics by direct simulation.
        let mut i = init as i64;
        let mut trips = 0u32;
        while cc.eval(i as i32, bound) {
            trips += 1;
            i += step as i64;
            assert!(trips < 1_000_000);
        }

        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);
        let la = LoopAnalysis::with_function(&func, &cfg, &dt);
        let lp = la.loops().next().unwrap();
        (func, lp, trips)
    }

    fn check_trip(cc: IntCC, init: i32, step: i32, bound: i32) {
        let (func, lp, expected) = counted_loop(cc, init, step, bound);
        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);
        let la = LoopAnalysis::with_function(&func, &cfg, &dt);
        let scev = ScevAnalysis::compute(&func, &cfg, &la);
        assert_eq!(
            scev.loop_trip_count(&func, &la, lp),
            Some(expected),
            "cc={cc:?} init={init} step={step} bound={bound}"
        );
    }

    #[test]
    fn trip_counts_match_simulation() {
        for n in [1, 3, 4, 7, 10, 100] {
            for s in [1, 2, 3, 5] {
                check_trip(IntCC::SignedLessThan, 0, s, n);
                check_trip(IntCC::SignedLessThanOrEqual, 0, s, n);
            }
        }
        // Bound already violated: zero trips.
        check_trip(IntCC::SignedLessThan, 5, 1, 5);
        check_trip(IntCC::SignedLessThan, 9, 2, 0);
        check_trip(IntCC::SignedLessThanOrEqual, 6, 1, 5);
        // Downward loops.
        check_trip(IntCC::SignedGreaterThan, 10, -1, 0);
        check_trip(IntCC::SignedGreaterThanOrEqual, 10, -2, 0);
        check_trip(IntCC::SignedGreaterThan, 0, -1, 5);
    }

    #[test]
    fn eq_ne_are_not_computable() {
        let (func, lp, _) = counted_loop(IntCC::NotEqual, 0, 1, 4);
        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);
        let la = LoopAnalysis::with_function(&func, &cfg, &dt);
        let scev = ScevAnalysis::compute(&func, &cfg, &la);
        assert_eq!(scev.loop_trip_count(&func, &la, lp), None);
    }

    #[test]
    fn basic_iv_chain() {
        let (func, lp, _) = counted_loop(IntCC::SignedLessThan, 2, 3, 20);
        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);
        let la = LoopAnalysis::with_function(&func, &cfg, &dt);
        let scev = ScevAnalysis::compute(&func, &cfg, &la);

        let header = la.data(lp).header;
        let phi = func.phis(header)[0];
        let iv = func.dfg.inst_result(phi).unwrap();
        let id = scev.value_scev(iv).expect("phi is a basic IV");
        assert_eq!(scev.init(id), Some(2));
        assert_eq!(scev.step(id), Some(3));
        assert_eq!(scev.evolution_loop(id), Some(lp));
        assert!(scev.not_negative(id));
    }
}
