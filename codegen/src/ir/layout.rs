//! Block and instruction ordering.
//!
//! The layout determines the textual order of blocks in a function and of
//! instructions within each block; the data flow graph is order-free. Phis
//! stay contiguous at the front of their block, and the block's terminator is
//! its last instruction.

use crate::ir::{Block, Inst};
use sysyc_entity::{PackedOption, SecondaryMap};

/// The ordering of blocks and instructions in a function.
#[derive(Clone, Default)]
pub struct Layout {
    /// Blocks in layout order; the first is the entry.
    blocks: Vec<Block>,
    inserted: SecondaryMap<Block, bool>,
    insts: SecondaryMap<Block, Vec<Inst>>,
    inst_block: SecondaryMap<Inst, PackedOption<Block>>,
}

impl Layout {
    /// Create a new empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Blocks.

    /// Append `block` at the end of the layout.
    pub fn append_block(&mut self, block: Block) {
        debug_assert!(!self.inserted[block], "{block} already in layout");
        self.inserted[block] = true;
        self.blocks.push(block);
    }

    /// Insert `block` immediately after `after` in the layout order.
    pub fn insert_block_after(&mut self, block: Block, after: Block) {
        debug_assert!(!self.inserted[block], "{block} already in layout");
        let pos = self
            .blocks
            .iter()
            .position(|&b| b == after)
            .expect("insert_block_after: anchor not in layout");
        self.inserted[block] = true;
        self.blocks.insert(pos + 1, block);
    }

    /// Remove `block` and all its instructions from the layout.
    pub fn remove_block(&mut self, block: Block) {
        debug_assert!(self.inserted[block]);
        for inst in std::mem::take(&mut self.insts[block]) {
            self.inst_block[inst] = None.into();
        }
        self.blocks.retain(|&b| b != block);
        self.inserted[block] = false;
    }

    /// Is `block` currently in the layout?
    pub fn is_block_inserted(&self, block: Block) -> bool {
        self.inserted[block]
    }

    /// The entry block, i.e. the first block in layout order.
    pub fn entry_block(&self) -> Option<Block> {
        self.blocks.first().copied()
    }

    /// The blocks in layout order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Number of blocks in the layout.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    // ------------------------------------------------------------------
    // Instructions.

    /// The instructions of `block`, in order.
    pub fn block_insts(&self, block: Block) -> &[Inst] {
        &self.insts[block]
    }

    /// The first instruction of `block`.
    pub fn first_inst(&self, block: Block) -> Option<Inst> {
        self.insts[block].first().copied()
    }

    /// The last instruction of `block` — its terminator once the block is
    /// complete.
    pub fn last_inst(&self, block: Block) -> Option<Inst> {
        self.insts[block].last().copied()
    }

    /// The block containing `inst`, if it is inserted.
    pub fn inst_block(&self, inst: Inst) -> Option<Block> {
        self.inst_block[inst].expand()
    }

    /// Append `inst` at the end of `block`.
    pub fn append_inst(&mut self, inst: Inst, block: Block) {
        debug_assert!(self.inst_block[inst].is_none(), "{inst} already inserted");
        self.insts[block].push(inst);
        self.inst_block[inst] = block.into();
    }

    /// Insert `inst` at position `index` within `block`.
    pub fn insert_inst_at(&mut self, inst: Inst, block: Block, index: usize) {
        debug_assert!(self.inst_block[inst].is_none(), "{inst} already inserted");
        self.insts[block].insert(index, inst);
        self.inst_block[inst] = block.into();
    }

    /// Insert `inst` immediately before `before` in the latter's block.
    pub fn insert_inst_before(&mut self, inst: Inst, before: Inst) {
        let block = self.inst_block[before].expect("anchor not inserted");
        let pos = self.insts[block]
            .iter()
            .position(|&i| i == before)
            .unwrap();
        self.insert_inst_at(inst, block, pos);
    }

    /// Remove `inst` from its block. Second half of the deletion protocol;
    /// the data flow graph's `detach_inst` is the first.
    pub fn remove_inst(&mut self, inst: Inst) {
        let block = self.inst_block[inst].expect("removing uninserted inst");
        self.insts[block].retain(|&i| i != inst);
        self.inst_block[inst] = None.into();
    }

    /// Position of `inst` within its block.
    pub fn inst_index(&self, inst: Inst) -> usize {
        let block = self.inst_block[inst].expect("inst not inserted");
        self.insts[block].iter().position(|&i| i == inst).unwrap()
    }
}
