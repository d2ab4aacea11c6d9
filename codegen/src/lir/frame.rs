//! Per-function stack frames.
//!
//! A frame holds one slot per stack-resident object: promoted-to-memory
//! (spilled) virtual registers, array and escaped scalar locals, and
//! outgoing stack arguments beyond the eighth. Offsets are assigned at
//! finalization: the saved return address takes the highest offset, slots
//! fill downward from it, and the outgoing-argument area sits at the bottom,
//! starting at `sp`. The frame total is 16-byte aligned per the ABI.

use sysyc_entity::{entity_impl, PrimaryMap, SecondaryMap};

/// An opaque reference to a stack slot.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackSlot(u32);
entity_impl!(StackSlot, "ss");

/// The stack frame of one LIR function.
#[derive(Clone)]
pub struct Frame {
    sizes: PrimaryMap<StackSlot, u32>,
    offsets: SecondaryMap<StackSlot, i32>,
    /// Bytes reserved at `sp` for outgoing stack arguments.
    outgoing: u32,
    total: u32,
    finalized: bool,
}

impl Frame {
    /// Create an empty frame.
    pub fn new() -> Self {
        Self {
            sizes: PrimaryMap::new(),
            offsets: SecondaryMap::new(),
            outgoing: 0,
            total: 0,
            finalized: false,
        }
    }

    /// Reserve a slot of `size` bytes (word-aligned).
    pub fn alloc_slot(&mut self, size: u32) -> StackSlot {
        debug_assert!(!self.finalized, "frame already laid out");
        let size = size.max(4).next_multiple_of(4);
        self.sizes.push(size)
    }

    /// Make sure at least `bytes` of outgoing-argument space exist.
    pub fn reserve_outgoing(&mut self, bytes: u32) {
        debug_assert!(!self.finalized, "frame already laid out");
        self.outgoing = self.outgoing.max(bytes);
    }

    /// Assign all offsets. Slots get consecutive offsets from the top of the
    /// frame downward, below the saved `ra`; the outgoing area keeps the
    /// range `[0, outgoing)`.
    pub fn finalize(&mut self) {
        debug_assert!(!self.finalized, "frame already laid out");
        let slot_bytes: u32 = self.sizes.values().map(|&s| s.next_multiple_of(8)).sum();
        // ra occupies the top 8 bytes.
        self.total = (self.outgoing + slot_bytes + 8).next_multiple_of(16);
        let mut next = self.total - 8;
        for slot in self.sizes.keys() {
            let size = self.sizes[slot].next_multiple_of(8);
            next -= size;
            self.offsets[slot] = next as i32;
        }
        debug_assert!(next >= self.outgoing);
        self.finalized = true;
    }

    /// Has `finalize` run?
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Total frame size in bytes; 16-byte aligned.
    pub fn total_size(&self) -> u32 {
        debug_assert!(self.finalized);
        self.total
    }

    /// Byte offset of `slot` relative to the post-prologue `sp`.
    pub fn offset_of(&self, slot: StackSlot) -> i32 {
        debug_assert!(self.finalized);
        self.offsets[slot]
    }

    /// Byte offset of the saved return address: the frame's highest word.
    pub fn ra_offset(&self) -> i32 {
        debug_assert!(self.finalized);
        (self.total - 8) as i32
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

/// Does `offset` fit the 12-bit signed immediate of a load/store?
pub fn is_imm12(offset: i32) -> bool {
    (-2048..=2047).contains(&offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_top_down() {
        let mut frame = Frame::new();
        let a = frame.alloc_slot(4);
        let b = frame.alloc_slot(16);
        frame.reserve_outgoing(8);
        frame.finalize();

        assert_eq!(frame.total_size() % 16, 0);
        // ra at the top, then a, then b, all above the outgoing area.
        assert_eq!(frame.ra_offset() as u32, frame.total_size() - 8);
        assert!(frame.offset_of(a) > frame.offset_of(b));
        assert!(frame.offset_of(b) >= 8);
        assert!((frame.offset_of(a) as u32) < frame.total_size() - 8);
    }

    #[test]
    fn imm12_bounds() {
        assert!(is_imm12(0));
        assert!(is_imm12(2047));
        assert!(is_imm12(-2048));
        assert!(!is_imm12(2048));
        assert!(!is_imm12(-2049));
    }

    #[test]
    fn large_frames_exceed_imm12() {
        let mut frame = Frame::new();
        let slots: Vec<StackSlot> = (0..600).map(|_| frame.alloc_slot(4)).collect();
        frame.finalize();
        assert!(frame.total_size() > 2048);
        // The earliest-allocated slot sits near the top, beyond 12-bit reach.
        assert!(!is_imm12(frame.offset_of(slots[0])));
        // The last-allocated slot is near the bottom.
        assert!(is_imm12(frame.offset_of(slots[599])));
    }
}
