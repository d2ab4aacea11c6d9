//! A control flow graph represented as mappings of basic blocks to their
//! predecessors and successors.
//!
//! Edges are read off the block terminators. The graph is recomputed from
//! scratch after any transform that changes control flow; there is no partial
//! update.

use crate::ir::{Block, Function};
use crate::timing;
use sysyc_entity::SecondaryMap;

/// Per-block predecessor and successor lists.
#[derive(Clone, Default)]
struct CFGNode {
    /// Blocks whose terminator can transfer to this block. Duplicates are
    /// collapsed, so a two-way branch to the same target contributes one
    /// predecessor edge.
    predecessors: Vec<Block>,
    /// Blocks this block's terminator can transfer to.
    successors: Vec<Block>,
}

/// The control flow graph of one function.
pub struct ControlFlowGraph {
    data: SecondaryMap<Block, CFGNode>,
    valid: bool,
}

impl ControlFlowGraph {
    /// Allocate a new blank control flow graph.
    pub fn new() -> Self {
        Self {
            data: SecondaryMap::new(),
            valid: false,
        }
    }

    /// Clear all data structures in this control flow graph.
    pub fn clear(&mut self) {
        self.data.clear();
        self.valid = false;
    }

    /// Allocate and compute the control flow graph for `func`.
    pub fn with_function(func: &Function) -> Self {
        let mut cfg = Self::new();
        cfg.compute(func);
        cfg
    }

    /// Compute the control flow graph of `func`, discarding any previous
    /// contents.
    pub fn compute(&mut self, func: &Function) {
        let _tt = timing::flowgraph();
        self.clear();
        self.data.resize(func.dfg.num_blocks());

        for &block in func.layout.blocks() {
            if let Some(term) = func.layout.last_inst(block) {
                for dest in func.dfg.inst_data(term).branch_targets() {
                    self.add_edge(block, dest);
                }
            }
        }

        self.valid = true;
    }

    fn add_edge(&mut self, from: Block, to: Block) {
        if !self.data[from].successors.contains(&to) {
            self.data[from].successors.push(to);
        }
        if !self.data[to].predecessors.contains(&from) {
            self.data[to].predecessors.push(from);
        }
    }

    /// The predecessors of `block`.
    pub fn preds(&self, block: Block) -> &[Block] {
        debug_assert!(self.valid);
        &self.data[block].predecessors
    }

    /// The successors of `block`.
    pub fn succs(&self, block: Block) -> &[Block] {
        debug_assert!(self.valid);
        &self.data[block].successors
    }

    /// Check if the CFG is in a computed state. This does not validate the
    /// graph against the function; it only records whether `compute` ran
    /// since the last `clear`.
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Default for ControlFlowGraph {
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
        assert!(cfg.is_valid());
    }

    #[test]
    fn branches_and_jumps() {
        let mut func = Function::with_signature("f", Signature::new(vec![types::I32], types::I32));
        let x = func.params[0];
        let mut cur = FuncCursor::new(&mut func);

        let block0 = cur.insert_block();
        let block1 = cur.func.dfg.make_block();
        let block2 = cur.func.dfg.make_block();

        let zero = cur.func.dfg.iconst(0);
        let cond = cur.ins().icmp(IntCC::SignedLessThan, x, zero);
        cur.ins().branch(cond, block1, block2);

        cur.append_existing_block(block1);
        cur.ins().jump(block2);

        cur.append_existing_block(block2);
        cur.ins().ret(Some(x));

        let cfg = ControlFlowGraph::with_function(&func);
        assert_eq!(cfg.succs(block0), &[block1, block2]);
        assert_eq!(cfg.succs(block1), &[block2]);
        assert_eq!(cfg.succs(block2), &[]);
        assert_eq!(cfg.preds(block0), &[]);
        assert_eq!(cfg.preds(block1), &[block0]);
        assert_eq!(cfg.preds(block2), &[block0, block1]);
    }

    #[test]
    fn duplicate_edges_collapse() {
        let mut func = Function::with_signature("f", Signature::new(vec![types::I32], types::VOID));
        let x = func.params[0];
        let mut cur = FuncCursor::new(&mut func);
        let block0 = cur.insert_block();
        let block1 = cur.func.dfg.make_block();
        let zero = cur.func.dfg.iconst(0);
        let cond = cur.ins().icmp(IntCC::Equal, x, zero);
        cur.ins().branch(cond, block1, block1);
        cur.append_existing_block(block1);
        cur.ins().ret(None);

        let cfg = ControlFlowGraph::with_function(&func);
        assert_eq!(cfg.succs(block0), &[block1]);
        assert_eq!(cfg.preds(block1), &[block0]);
    }
}
