//! Loop forest analysis.
//!
//! A natural loop with header `H` is the set of blocks that can reach the
//! source of a back edge `T -> H` without passing through `H`, where `H`
//! dominates `T`. Back edges with the same header merge into one loop.
//! Sibling loops share no blocks; a parent strictly contains its children.

use crate::dominator_tree::DominatorTree;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function};
use crate::timing;
use sysyc_entity::{entity_impl, EntitySet, PackedOption, PrimaryMap, SecondaryMap};

/// An opaque reference to a loop.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Loop(u32);
entity_impl!(Loop, "loop");

/// The facts recorded per loop.
#[derive(Clone)]
pub struct LoopData {
    /// The loop header: target of the back edges.
    pub header: Block,
    /// All blocks of the loop, header first.
    pub blocks: Vec<Block>,
    /// In-loop predecessors of the header.
    pub latch_blocks: Vec<Block>,
    /// Blocks inside the loop with a successor outside it.
    pub exiting: Vec<Block>,
    /// Blocks outside the loop that are successors of an exiting block.
    pub exits: Vec<Block>,
    /// The enclosing loop, if any.
    pub parent: PackedOption<Loop>,
    /// Loops directly contained in this one.
    pub children: Vec<Loop>,
    /// Nesting depth; top-level loops have depth 1.
    pub depth: u32,
    /// Trip count cached by the induction-variable pass; `None` when not
    /// computed or not computable.
    pub trip_count: Option<u32>,
}

/// The loop forest of one function.
pub struct LoopAnalysis {
    loops: PrimaryMap<Loop, LoopData>,
    innermost: SecondaryMap<Block, PackedOption<Loop>>,
    valid: bool,
}

impl LoopAnalysis {
    /// Allocate a new blank analysis.
    pub fn new() -> Self {
        Self {
            loops: PrimaryMap::new(),
            innermost: SecondaryMap::new(),
            valid: false,
        }
    }

    /// Allocate and compute the loop forest of `func`.
    pub fn with_function(func: &Function, cfg: &ControlFlowGraph, domtree: &DominatorTree) -> Self {
        let mut la = Self::new();
        la.compute(func, cfg, domtree);
        la
    }

    /// Clear the analysis, leaving it invalid.
    pub fn clear(&mut self) {
        self.loops.clear();
        self.innermost.clear();
        self.valid = false;
    }

    /// Has `compute` run since the last `clear`?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Recompute the loop forest from scratch.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph, domtree: &DominatorTree) {
        let _tt = timing::loop_analysis();
        debug_assert!(domtree.is_valid());
        self.clear();
        self.innermost.resize(func.dfg.num_blocks());
        self.find_loops(cfg, domtree);
        self.build_forest();
        self.valid = true;
    }

    // ------------------------------------------------------------------
    // Queries.

    /// All loops of the function.
    pub fn loops(&self) -> impl Iterator<Item = Loop> {
        self.loops.keys()
    }

    /// Number of loops found.
    pub fn num_loops(&self) -> usize {
        self.loops.len()
    }

    /// The data of `lp`.
    pub fn data(&self, lp: Loop) -> &LoopData {
        &self.loops[lp]
    }

    /// The innermost loop containing `block`, if any.
    pub fn innermost_loop(&self, block: Block) -> Option<Loop> {
        self.innermost[block].expand()
    }

    /// Nesting depth of `block`: 0 outside any loop.
    pub fn loop_depth(&self, block: Block) -> u32 {
        match self.innermost_loop(block) {
            Some(lp) => self.loops[lp].depth,
            None => 0,
        }
    }

    /// Does `lp` contain `block`?
    pub fn contains_block(&self, lp: Loop, block: Block) -> bool {
        let mut cur = self.innermost[block].expand();
        while let Some(inner) = cur {
            if inner == lp {
                return true;
            }
            cur = self.loops[inner].parent.expand();
        }
        false
    }

    /// Is `lp` innermost, i.e. without child loops?
    pub fn is_innermost(&self, lp: Loop) -> bool {
        self.loops[lp].children.is_empty()
    }

    /// Loops ordered children-before-parents.
    pub fn loops_postorder(&self) -> Vec<Loop> {
        let mut order: Vec<Loop> = self.loops.keys().collect();
        order.sort_by_key(|&lp| std::cmp::Reverse(self.loops[lp].depth));
        order
    }

    /// The unique preheader of `lp`, when in simplified form: the single
    /// out-of-loop predecessor of the header, which must have the header as
    /// its only successor.
    pub fn preheader(&self, lp: Loop, cfg: &ControlFlowGraph) -> Option<Block> {
        let data = &self.loops[lp];
        let mut entering = cfg
            .preds(data.header)
            .iter()
            .copied()
            .filter(|&p| !self.contains_block(lp, p));
        let candidate = entering.next()?;
        if entering.next().is_some() {
            return None;
        }
        if cfg.succs(candidate) == [data.header] {
            Some(candidate)
        } else {
            None
        }
    }

    /// The unique latch of `lp`, when in simplified form.
    pub fn latch(&self, lp: Loop) -> Option<Block> {
        match self.loops[lp].latch_blocks.as_slice() {
            &[latch] => Some(latch),
            _ => None,
        }
    }

    /// Cache a computed trip count on `lp`.
    pub fn set_trip_count(&mut self, lp: Loop, trip: u32) {
        self.loops[lp].trip_count = Some(trip);
    }

    // ------------------------------------------------------------------
    // Computation.

    fn find_loops(&mut self, cfg: &ControlFlowGraph, domtree: &DominatorTree) {
        // Back edges grouped by header, in RPO of the header for determinism.
        let mut headers: Vec<(Block, Vec<Block>)> = Vec::new();
        for &block in domtree.cfg_postorder().iter().rev() {
            for &succ in cfg.succs(block) {
                if domtree.dominates(succ, block) {
                    match headers.iter_mut().find(|(h, _)| *h == succ) {
                        Some((_, latches)) => latches.push(block),
                        None => headers.push((succ, vec![block])),
                    }
                }
            }
        }

        for (header, latch_blocks) in headers {
            let mut in_loop = EntitySet::new();
            in_loop.insert(header);
            let mut blocks = vec![header];
            let mut worklist = latch_blocks.clone();
            while let Some(block) = worklist.pop() {
                if !in_loop.insert(block) {
                    continue;
                }
                blocks.push(block);
                for &pred in cfg.preds(block) {
                    if domtree.is_reachable(pred) {
                        worklist.push(pred);
                    }
                }
            }

            let mut exiting = Vec::new();
            let mut exits: Vec<Block> = Vec::new();
            for &block in &blocks {
                let mut is_exiting = false;
                for &succ in cfg.succs(block) {
                    if !in_loop.contains(succ) {
                        is_exiting = true;
                        if !exits.contains(&succ) {
                            exits.push(succ);
                        }
                    }
                }
                if is_exiting {
                    exiting.push(block);
                }
            }

            self.loops.push(LoopData {
                header,
                blocks,
                latch_blocks,
                exiting,
                exits,
                parent: None.into(),
                children: Vec::new(),
                depth: 1,
                trip_count: None,
            });
        }
    }

    /// Attach each loop to the smallest strict superset containing it, and
    /// record the innermost loop per block.
    fn build_forest(&mut self) {
        let mut order: Vec<Loop> = self.loops.keys().collect();
        order.sort_by_key(|&lp| std::cmp::Reverse(self.loops[lp].blocks.len()));

        for &lp in &order {
            let header = self.loops[lp].header;
            let parent = self.innermost[header].expand();
            self.loops[lp].parent = parent.into();
            if let Some(parent) = parent {
                self.loops[parent].children.push(lp);
                self.loops[lp].depth = self.loops[parent].depth + 1;
            }
            for i in 0..self.loops[lp].blocks.len() {
                let block = self.loops[lp].blocks[i];
                self.innermost[block] = lp.into();
            }
        }
    }
}

impl Default for LoopAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::FuncCursor;
    use crate::ir::condcodes::IntCC;
    use crate::ir::{types, Function, Signature};

    fn analyze(func: &Function) -> (ControlFlowGraph, DominatorTree, LoopAnalysis) {
        let cfg = ControlFlowGraph::with_function(func);
        let dt = DominatorTree::with_function(func, &cfg);
        let la = LoopAnalysis::with_function(func, &cfg, &dt);
        (cfg, dt, la)
    }

    #[test]
    fn no_loops() {
        let mut func = Function::with_signature("f", Signature::new(vec![], types::VOID));
        let mut cur = FuncCursor::new(&mut func);
        cur.insert_block();
        cur.ins().ret(None);
        let (_, _, la) = analyze(&func);
        assert_eq!(la.num_loops(), 0);
    }

    #[test]
    fn single_loop_structure() {
        let mut func = Function::with_signature("f", Signature::new(vec![types::I32], types::I32));
        let n = func.params[0];
        let mut cur = FuncCursor::new(&mut func);
        let entry = cur.insert_block();
        let header = cur.func.dfg.make_block();
        let body = cur.func.dfg.make_block();
        let exit = cur.func.dfg.make_block();
        cur.ins().jump(header);
        cur.append_existing_block(header);
        let zero = cur.func.dfg.iconst(0);
        let cond = cur.ins().icmp(IntCC::SignedGreaterThan, n, zero);
        cur.ins().branch(cond, body, exit);
        cur.append_existing_block(body);
        cur.ins().jump(header);
        cur.append_existing_block(exit);
        cur.ins().ret(Some(n));

        let (cfg, _, la) = analyze(&func);
        assert_eq!(la.num_loops(), 1);
        let lp = la.loops().next().unwrap();
        let data = la.data(lp);
        assert_eq!(data.header, header);
        assert_eq!(data.latch_blocks, vec![body]);
        assert_eq!(data.exiting, vec![header]);
        assert_eq!(data.exits, vec![exit]);
        assert_eq!(data.depth, 1);
        assert!(la.contains_block(lp, body));
        assert!(!la.contains_block(lp, entry));
        assert_eq!(la.preheader(lp, &cfg), Some(entry));
        assert_eq!(la.latch(lp), Some(body));
        assert_eq!(la.loop_depth(body), 1);
        assert_eq!(la.loop_depth(exit), 0);
    }

    #[test]
    fn nested_loops() {
        let mut func = Function::with_signature("f", Signature::new(vec![types::I32], types::I32));
        let n = func.params[0];
        let mut cur = FuncCursor::new(&mut func);
        let _entry = cur.insert_block();
        let outer = cur.func.dfg.make_block();
        let inner = cur.func.dfg.make_block();
        let inner_latch = cur.func.dfg.make_block();
        let outer_latch = cur.func.dfg.make_block();
        let exit = cur.func.dfg.make_block();
        cur.ins().jump(outer);

        cur.append_existing_block(outer);
        let zero = cur.func.dfg.iconst(0);
        let c0 = cur.ins().icmp(IntCC::SignedGreaterThan, n, zero);
        cur.ins().branch(c0, inner, exit);

        cur.append_existing_block(inner);
        let c1 = cur.ins().icmp(IntCC::SignedLessThan, n, zero);
        cur.ins().branch(c1, inner_latch, outer_latch);

        cur.append_existing_block(inner_latch);
        cur.ins().jump(inner);

        cur.append_existing_block(outer_latch);
        cur.ins().jump(outer);

        cur.append_existing_block(exit);
        cur.ins().ret(Some(n));

        let (_, _, la) = analyze(&func);
        assert_eq!(la.num_loops(), 2);
        let inner_lp = la.innermost_loop(inner_latch).unwrap();
        let outer_lp = la.innermost_loop(outer_latch).unwrap();
        assert_ne!(inner_lp, outer_lp);
        assert_eq!(la.data(inner_lp).parent.expand(), Some(outer_lp));
        assert_eq!(la.data(inner_lp).depth, 2);
        assert_eq!(la.data(outer_lp).depth, 1);
        assert!(la.data(outer_lp).children.contains(&inner_lp));
        assert!(la.contains_block(outer_lp, inner_latch));
        assert!(!la.contains_block(inner_lp, outer_latch));
        assert_eq!(la.loops_postorder(), vec![inner_lp, outer_lp]);
        assert!(la.is_innermost(inner_lp));
        assert!(!la.is_innermost(outer_lp));
    }
}
