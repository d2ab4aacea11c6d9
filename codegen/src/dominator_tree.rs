//! A dominator tree represented as mappings of blocks to their immediate
//! dominator, with the derived structures the SSA passes consume: dominance
//! frontiers, dominator-tree children, a pre-order for constant-time
//! dominance checks, and the dominator-tree BFS layer order.

use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function};
use crate::timing;
use sysyc_entity::{PackedOption, SecondaryMap};

/// Special `rpo_number` values used during `compute_postorder`.
const DONE: u32 = 1;
const SEEN: u32 = 2;

/// Dominator tree node. We keep one of these per block.
#[derive(Clone, Default)]
struct DomNode {
    /// Number of this node in a reverse post-order traversal of the CFG,
    /// starting from 2. Unreachable nodes get number 0.
    rpo_number: u32,

    /// The immediate dominator of this block. `None` for unreachable blocks
    /// and for the entry block, which has no immediate dominator.
    idom: PackedOption<Block>,
}

#[derive(Clone, Default)]
struct PreNode {
    /// Sequence number in a pre-order traversal of the dominator tree.
    /// Unreachable blocks have number 0, the entry block is 1.
    pre_number: u32,
    /// Maximum `pre_number` of the subtree rooted at this node.
    pre_max: u32,
}

/// The dominator tree for a single function.
pub struct DominatorTree {
    nodes: SecondaryMap<Block, DomNode>,
    pre: SecondaryMap<Block, PreNode>,
    children: SecondaryMap<Block, Vec<Block>>,
    frontier: SecondaryMap<Block, Vec<Block>>,

    /// CFG post-order of all reachable blocks.
    postorder: Vec<Block>,
    /// Dominator-tree BFS layer order, entry first.
    layers: Vec<Block>,

    /// Scratch memory used by `compute_postorder()`.
    stack: Vec<Block>,

    valid: bool,
}

impl DominatorTree {
    /// Allocate a new blank dominator tree. Use `compute` to fill it in.
    pub fn new() -> Self {
        Self {
            nodes: SecondaryMap::new(),
            pre: SecondaryMap::new(),
            children: SecondaryMap::new(),
            frontier: SecondaryMap::new(),
            postorder: Vec::new(),
            layers: Vec::new(),
            stack: Vec::new(),
            valid: false,
        }
    }

    /// Allocate and compute a dominator tree.
    pub fn with_function(func: &Function, cfg: &ControlFlowGraph) -> Self {
        let mut domtree = Self::new();
        domtree.compute(func, cfg);
        domtree
    }

    /// Reset and compute a CFG post-order and dominator tree, then the
    /// derived frontier/children/layer structures.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        let _tt = timing::domtree();
        debug_assert!(cfg.is_valid());
        self.clear();
        self.compute_postorder(func, cfg);
        self.compute_domtree(cfg);
        self.compute_children();
        self.compute_preorder();
        self.compute_frontier(cfg);
        self.compute_layers();
        self.valid = true;
    }

    /// Clear the data structures, leaving the tree invalid.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.pre.clear();
        self.children.clear();
        self.frontier.clear();
        self.postorder.clear();
        self.layers.clear();
        debug_assert!(self.stack.is_empty());
        self.valid = false;
    }

    /// Has `compute` run since the last `clear`?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    // ------------------------------------------------------------------
    // Queries.

    /// Is `block` reachable from the entry block?
    pub fn is_reachable(&self, block: Block) -> bool {
        self.nodes[block].rpo_number != 0
    }

    /// The CFG post-order of reachable blocks used to compute the tree.
    pub fn cfg_postorder(&self) -> &[Block] {
        debug_assert!(self.valid);
        &self.postorder
    }

    /// The immediate dominator of `block`, or `None` for the entry block and
    /// unreachable blocks.
    pub fn idom(&self, block: Block) -> Option<Block> {
        self.nodes[block].idom.expand()
    }

    /// The children of `block` in the dominator tree, in RPO.
    pub fn children(&self, block: Block) -> &[Block] {
        debug_assert!(self.valid);
        &self.children[block]
    }

    /// The dominance frontier of `block`: the blocks `y` such that `block`
    /// dominates a predecessor of `y` but does not strictly dominate `y`.
    pub fn frontier(&self, block: Block) -> &[Block] {
        debug_assert!(self.valid);
        &self.frontier[block]
    }

    /// Reachable blocks in dominator-tree BFS layer order, entry first.
    pub fn layers(&self) -> &[Block] {
        debug_assert!(self.valid);
        &self.layers
    }

    /// Returns `true` if `a` dominates `b`. A block dominates itself.
    /// Constant time via pre-order intervals. Returns `false` when either
    /// block is unreachable.
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        debug_assert!(self.valid);
        let na = &self.pre[a];
        let nb = &self.pre[b];
        na.pre_number != 0 && nb.pre_number != 0 && na.pre_number <= nb.pre_number
            && na.pre_max >= nb.pre_max
    }

    /// Returns `true` if `a` dominates `b` and `a != b`.
    pub fn strictly_dominates(&self, a: Block, b: Block) -> bool {
        a != b && self.dominates(a, b)
    }

    /// All dominators of `block`, innermost first, including `block` itself.
    pub fn dominators(&self, block: Block) -> Vec<Block> {
        let mut doms = Vec::new();
        if !self.is_reachable(block) {
            return doms;
        }
        let mut cur = Some(block);
        while let Some(b) = cur {
            doms.push(b);
            cur = self.idom(b);
        }
        doms
    }

    // ------------------------------------------------------------------
    // Computation.

    /// Reset and compute a post-order of the control flow graph.
    ///
    /// This is a depth first traversal visiting only blocks reachable from
    /// the entry. During this phase, `rpo_number` holds traversal state:
    /// 0 unreached, SEEN pushed but successors not yet visited, DONE
    /// successors pushed.
    fn compute_postorder(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        self.nodes.resize(func.dfg.num_blocks());

        match func.layout.entry_block() {
            Some(block) => {
                self.stack.push(block);
                self.nodes[block].rpo_number = SEEN;
            }
            None => return,
        }

        while let Some(block) = self.stack.pop() {
            match self.nodes[block].rpo_number {
                SEEN => {
                    // First pop: push back, then scan successors.
                    self.nodes[block].rpo_number = DONE;
                    self.stack.push(block);
                    for &succ in cfg.succs(block) {
                        if self.nodes[succ].rpo_number == 0 {
                            self.nodes[succ].rpo_number = SEEN;
                            self.stack.push(succ);
                        }
                    }
                }
                DONE => self.postorder.push(block),
                _ => unreachable!(),
            }
        }
    }

    /// Build the dominator tree using Keith D. Cooper's "Simple, Fast
    /// Dominator Algorithm": initial estimates in reverse post-order, then
    /// iterate to a fixed point. Reducible flow converges in one pass.
    fn compute_domtree(&mut self, cfg: &ControlFlowGraph) {
        let (entry_block, postorder) = match self.postorder.as_slice().split_last() {
            Some((&eb, rest)) => (eb, rest),
            None => return,
        };

        // First pass: assign RPO numbers and initial idom estimates. Every
        // block visited here has at least one already-numbered predecessor.
        self.nodes[entry_block].rpo_number = 2;
        for (rpo_idx, &block) in postorder.iter().rev().enumerate() {
            self.nodes[block].rpo_number = rpo_idx as u32 + 3;
            self.nodes[block].idom = self.compute_idom(block, cfg).into();
        }

        // Iterate until convergence.
        let mut changed = true;
        while changed {
            changed = false;
            for &block in postorder.iter().rev() {
                let idom = self.compute_idom(block, cfg).into();
                if self.nodes[block].idom != idom {
                    self.nodes[block].idom = idom;
                    changed = true;
                }
            }
        }
    }

    /// Compute the immediate dominator of `block` from the current estimates
    /// of its numbered, reachable predecessors.
    fn compute_idom(&self, block: Block, cfg: &ControlFlowGraph) -> Block {
        let mut reachable_preds = cfg
            .preds(block)
            .iter()
            .copied()
            .filter(|&pred| self.nodes[pred].rpo_number > 1);

        let mut idom = reachable_preds
            .next()
            .expect("block must have one reachable predecessor");

        for pred in reachable_preds {
            idom = self.common_dominator(idom, pred);
        }

        idom
    }

    /// The nearest common dominator of two reachable blocks, by walking the
    /// current idom estimates upward in RPO.
    fn common_dominator(&self, mut a: Block, mut b: Block) -> Block {
        loop {
            let ra = self.nodes[a].rpo_number;
            let rb = self.nodes[b].rpo_number;
            if ra < rb {
                b = self.nodes[b].idom.expect("unreachable block in domtree walk");
            } else if rb < ra {
                a = self.nodes[a].idom.expect("unreachable block in domtree walk");
            } else {
                break;
            }
        }
        debug_assert_eq!(a, b, "walked past the entry block");
        a
    }

    /// Populate the child lists, ordered by RPO.
    fn compute_children(&mut self) {
        for i in (0..self.postorder.len()).rev() {
            let block = self.postorder[i];
            if let Some(idom) = self.nodes[block].idom.expand() {
                self.children[idom].push(block);
            }
        }
    }

    /// Assign pre-order interval numbers by a DFS of the dominator tree.
    fn compute_preorder(&mut self) {
        let entry = match self.postorder.last() {
            Some(&eb) => eb,
            None => return,
        };
        // (block, child cursor) simulated recursion.
        let mut walk: Vec<(Block, usize)> = vec![(entry, 0)];
        let mut next = 1u32;
        self.pre[entry].pre_number = next;
        while let Some(top) = walk.len().checked_sub(1) {
            let (block, cursor) = walk[top];
            if let Some(&child) = self.children[block].get(cursor) {
                walk[top].1 += 1;
                next += 1;
                self.pre[child].pre_number = next;
                walk.push((child, 0));
            } else {
                self.pre[block].pre_max = next;
                walk.pop();
            }
        }
    }

    /// Cooper's dominance-frontier algorithm: for every join block, walk
    /// each predecessor up the dominator tree to the join's idom; everything
    /// passed on the way has the join in its frontier.
    fn compute_frontier(&mut self, cfg: &ControlFlowGraph) {
        for &block in &self.postorder {
            let preds = cfg.preds(block);
            if preds.len() < 2 {
                continue;
            }
            let idom = match self.nodes[block].idom.expand() {
                Some(idom) => idom,
                None => continue,
            };
            for &pred in preds {
                if !self.is_reachable(pred) {
                    continue;
                }
                let mut runner = pred;
                while runner != idom {
                    if !self.frontier[runner].contains(&block) {
                        self.frontier[runner].push(block);
                    }
                    runner = match self.nodes[runner].idom.expand() {
                        Some(up) => up,
                        None => break,
                    };
                }
            }
        }
    }

    /// Breadth-first layer order of the dominator tree.
    fn compute_layers(&mut self) {
        let entry = match self.postorder.last() {
            Some(&eb) => eb,
            None => return,
        };
        self.layers.push(entry);
        let mut i = 0;
        while i < self.layers.len() {
            let block = self.layers[i];
            self.layers.extend_from_slice(&self.children[block]);
            i += 1;
        }
    }
}

impl Default for DominatorTree {
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

    #[test]
    fn empty() {
        let func = Function::with_signature("f", Signature::new(vec![], types::VOID));
        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);
        assert_eq!(dt.cfg_postorder(), &[]);
    }

    // The diamond A -> {B, C} -> D.
    fn diamond() -> (Function, Block, Block, Block, Block) {
        let mut func = Function::with_signature("f", Signature::new(vec![types::I32], types::I32));
        let x = func.params[0];
        let mut cur = FuncCursor::new(&mut func);
        let a = cur.insert_block();
        let b = cur.func.dfg.make_block();
        let c = cur.func.dfg.make_block();
        let d = cur.func.dfg.make_block();
        let zero = cur.func.dfg.iconst(0);
        let cond = cur.ins().icmp(IntCC::SignedLessThan, x, zero);
        cur.ins().branch(cond, b, c);
        cur.append_existing_block(b);
        cur.ins().jump(d);
        cur.append_existing_block(c);
        cur.ins().jump(d);
        cur.append_existing_block(d);
        cur.ins().ret(Some(x));
        (func, a, b, c, d)
    }

    #[test]
    fn diamond_idoms_and_frontiers() {
        let (func, a, b, c, d) = diamond();
        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);

        assert_eq!(dt.idom(a), None);
        assert_eq!(dt.idom(b), Some(a));
        assert_eq!(dt.idom(c), Some(a));
        assert_eq!(dt.idom(d), Some(a));

        assert_eq!(dt.frontier(b), &[d]);
        assert_eq!(dt.frontier(c), &[d]);
        assert_eq!(dt.frontier(a), &[]);
        assert_eq!(dt.frontier(d), &[]);

        assert!(dt.dominates(a, d));
        assert!(!dt.strictly_dominates(b, d));
        assert!(dt.dominates(b, b));

        // idom(B) is in dominators(B) \ {B} and is its unique maximum.
        for block in [b, c, d] {
            let doms = dt.dominators(block);
            assert_eq!(doms[0], block);
            assert_eq!(doms[1], dt.idom(block).unwrap());
            for &other in &doms[1..] {
                assert!(dt.dominates(other, dt.idom(block).unwrap()) || other == dt.idom(block).unwrap());
            }
        }

        // Layer order puts the entry first, everything else after.
        assert_eq!(dt.layers()[0], a);
        assert_eq!(dt.layers().len(), 4);
    }

    #[test]
    fn unreachable_blocks_are_ignored() {
        let mut func = Function::with_signature("f", Signature::new(vec![], types::VOID));
        let mut cur = FuncCursor::new(&mut func);
        let entry = cur.insert_block();
        let dead = cur.func.dfg.make_block();
        let tail = cur.func.dfg.make_block();
        cur.ins().jump(tail);
        cur.append_existing_block(dead);
        cur.ins().jump(tail);
        cur.append_existing_block(tail);
        cur.ins().ret(None);

        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);
        assert!(dt.is_reachable(entry));
        assert!(!dt.is_reachable(dead));
        assert_eq!(dt.idom(tail), Some(entry));
        assert_eq!(dt.idom(dead), None);
        assert!(!dt.dominates(dead, tail));
        assert_eq!(dt.cfg_postorder(), &[tail, entry]);
    }

    #[test]
    fn loop_back_edge() {
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

        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);
        assert_eq!(dt.idom(header), Some(entry));
        assert_eq!(dt.idom(body), Some(header));
        assert_eq!(dt.idom(exit), Some(header));
        // The header is in its own dominance frontier through the back edge.
        assert_eq!(dt.frontier(body), &[header]);
        assert_eq!(dt.frontier(header), &[header]);
    }
}
