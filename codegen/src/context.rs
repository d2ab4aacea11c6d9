//! The compilation context and pass pipeline.
//!
//! A [`Context`] bundles the per-function analyses with a validity flag;
//! transforms that change the function mark it dirty and the next consumer
//! recomputes. [`compile`] drives the whole pipeline: the SSA optimization
//! rounds run to a fixed point, then each function is lowered and taken
//! through the backend.

use crate::dce::do_dce;
use crate::dominator_tree::DominatorTree;
use crate::effects::FunctionEffects;
use crate::flowgraph::ControlFlowGraph;
use crate::induction::do_induction_analysis;
use crate::ir::module::GlobalVarData;
use crate::ir::{Function, FuncRef, GlobalVar, Module, TypeStore};
use crate::isa::riscv64;
use crate::lcssa::do_lcssa;
use crate::licm::do_licm;
use crate::lir;
use crate::loop_analysis::LoopAnalysis;
use crate::loop_simplify::do_loop_simplify;
use crate::loop_unroll::{do_const_unroll, do_runtime_unroll};
use crate::loop_unswitch::do_loop_unswitch;
use crate::mem2reg::do_mem2reg;
use crate::scev::ScevAnalysis;
use crate::simple_preopt::do_preopt;
use crate::unreachable_code::eliminate_unreachable_code;
use sysyc_entity::PrimaryMap;

/// Optimization level selecting the pass pipeline.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OptLevel {
    /// Lower the input as-is.
    None,
    /// The full SSA pipeline, run to a fixed point.
    Speed,
}

/// Cap on fixed-point rounds of the SSA pipeline; each round is monotone
/// (unrolling budgets shrink), so this is a backstop, not a tuning knob.
const MAX_OPT_ROUNDS: usize = 8;

/// Per-function analysis cache.
pub struct Context {
    /// Predecessors and successors.
    pub cfg: ControlFlowGraph,
    /// Dominators, frontiers, layers.
    pub domtree: DominatorTree,
    /// The loop forest.
    pub loops: LoopAnalysis,
    valid: bool,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            cfg: ControlFlowGraph::new(),
            domtree: DominatorTree::new(),
            loops: LoopAnalysis::new(),
            valid: false,
        }
    }

    /// Recompute all analyses for `func`.
    pub fn compute(&mut self, func: &Function) {
        self.cfg.compute(func);
        self.domtree.compute(func, &self.cfg);
        self.loops.compute(func, &self.cfg, &self.domtree);
        self.valid = true;
    }

    /// Mark the cached analyses stale after a transform.
    pub fn set_dirty(&mut self) {
        self.valid = false;
    }

    /// Recompute only if a transform invalidated the cache.
    pub fn ensure(&mut self, func: &Function) {
        if !self.valid {
            self.compute(func);
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the SSA optimization pipeline over every defined function.
pub fn optimize(module: &mut Module, level: OptLevel) {
    if level == OptLevel::None {
        return;
    }
    for round in 0..MAX_OPT_ROUNDS {
        let effects = FunctionEffects::compute(module);
        let mut changed = false;
        let frs: Vec<FuncRef> = module.functions.keys().collect();
        let Module {
            ref mut functions,
            ref types,
            ref globals,
            ..
        } = *module;
        for fr in frs {
            let func = &mut functions[fr];
            if func.is_declaration() || func.entry_block().is_none() {
                continue;
            }
            changed |= optimize_function(func, types, globals, &effects);
        }
        if !changed {
            log::debug!("optimization pipeline stable after {} rounds", round + 1);
            break;
        }
    }
}

/// One round of the O1 pipeline on one function.
fn optimize_function(
    func: &mut Function,
    types: &TypeStore,
    globals: &PrimaryMap<GlobalVar, GlobalVarData>,
    effects: &FunctionEffects,
) -> bool {
    let mut ctx = Context::new();
    let mut changed = false;

    changed |= do_preopt(func);

    ctx.compute(func);
    if do_mem2reg(func, types, &ctx.cfg, &ctx.domtree) {
        changed = true;
        ctx.set_dirty();
    }

    ctx.ensure(func);
    if do_loop_simplify(func, &ctx.cfg, &ctx.loops) {
        changed = true;
        ctx.set_dirty();
    }

    ctx.ensure(func);
    if do_lcssa(func, &ctx.cfg, &ctx.domtree, &ctx.loops) {
        // Only phis were inserted; the control flow is untouched.
        changed = true;
    }

    let alias = crate::alias_analysis::AliasAnalysis::compute(globals, types, func);
    ctx.ensure(func);
    if do_licm(func, &ctx.cfg, &ctx.loops, effects, &alias) {
        // Instructions moved between existing blocks; block structure holds.
        changed = true;
    }

    ctx.ensure(func);
    do_induction_analysis(func, &ctx.cfg, &mut ctx.loops);

    if do_const_unroll(func, &ctx.cfg, &ctx.loops) {
        changed = true;
        eliminate_unreachable_code(func);
        ctx.set_dirty();
    }

    ctx.ensure(func);
    // Re-annotate so loops with computable trips stay with the constant
    // unroller on the next round instead of being kernel-unrolled here.
    do_induction_analysis(func, &ctx.cfg, &mut ctx.loops);
    let scev = ScevAnalysis::compute(func, &ctx.cfg, &ctx.loops);
    if do_runtime_unroll(func, &ctx.cfg, &ctx.loops, &scev) {
        changed = true;
        eliminate_unreachable_code(func);
        ctx.set_dirty();
    }

    ctx.ensure(func);
    if do_loop_unswitch(func, &ctx.cfg, &ctx.loops) {
        changed = true;
        eliminate_unreachable_code(func);
        ctx.set_dirty();
    }

    changed |= do_dce(func, effects);
    changed
}

/// Optimize, lower, and run the backend; returns the allocated LIR module.
pub fn compile(module: &mut Module, level: OptLevel) -> lir::Module {
    optimize(module, level);

    let frs: Vec<FuncRef> = module.functions.keys().collect();

    // Phi copies need unambiguous edges; split the critical ones first.
    for &fr in &frs {
        let func = &mut module.functions[fr];
        if func.is_declaration() || func.entry_block().is_none() {
            continue;
        }
        let cfg = ControlFlowGraph::with_function(func);
        riscv64::lower::split_critical_edges(func, &cfg);
    }

    let mut functions = Vec::new();
    for &fr in &frs {
        let func = &module.functions[fr];
        if func.is_declaration() || func.entry_block().is_none() {
            continue;
        }
        let cfg = ControlFlowGraph::with_function(func);
        let domtree = DominatorTree::with_function(func, &cfg);
        let loops = LoopAnalysis::with_function(func, &cfg, &domtree);
        let mut lowered = riscv64::lower::lower_function(module, func, &loops);
        riscv64::compile_function(&mut lowered);
        functions.push(lowered);
    }
    lir::Module { functions }
}

/// Compile and print the textual assembly.
pub fn compile_to_assembly(module: &mut Module, level: OptLevel) -> String {
    let lowered = compile(module, level);
    riscv64::emit::emit_module(module, &lowered)
}
