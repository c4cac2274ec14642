//! Choosing which cached block gives up its slot.

use crate::frame::FrameId;

/// Eviction policy over the slots of a [`crate::BlockCache`].
///
/// The cache reports hits and slot occupancy; the policy only ever names
/// an occupied slot as the next victim.
pub trait Replacer {
    /// A cached block in `slot` was read or re-cached.
    fn record_access(&mut self, slot: FrameId);

    /// `true` once a block is decoded into `slot`, `false` when the block
    /// is dropped from the cache and the slot goes back to the free list.
    fn set_evictable(&mut self, slot: FrameId, evictable: bool);

    /// Picks the slot whose block is dropped to make room for a new one and
    /// marks it vacant. `None` while no slot holds a block.
    fn evict(&mut self) -> Option<FrameId>;

    /// Occupied slots.
    fn size(&self) -> usize;
}

/// Second-chance clock over cache slots.
///
/// A cache hit sets the slot's reference bit. The hand sweeps the slots in
/// order: a referenced block loses its bit and stays cached for another
/// sweep, and the first occupied slot without the bit gives up its block.
/// Blocks read once during a tree walk are dropped before blocks that keep
/// getting hit, such as b-tree roots.
pub struct ClockReplacer {
    referenced: Vec<bool>,
    occupied: Vec<bool>,
    occupied_count: usize,
    hand: usize,
}

impl ClockReplacer {
    pub fn new(slots: usize) -> Self {
        Self {
            referenced: vec![false; slots],
            occupied: vec![false; slots],
            occupied_count: 0,
            hand: 0,
        }
    }

    /// Number of slots, occupied or not.
    pub fn capacity(&self) -> usize {
        self.occupied.len()
    }
}

impl Replacer for ClockReplacer {
    fn record_access(&mut self, slot: FrameId) {
        if let Some(bit) = self.referenced.get_mut(slot.index()) {
            *bit = true;
        }
    }

    fn set_evictable(&mut self, slot: FrameId, evictable: bool) {
        let idx = slot.index();
        let Some(occupied) = self.occupied.get_mut(idx) else {
            return;
        };
        if *occupied != evictable {
            *occupied = evictable;
            if evictable {
                self.occupied_count += 1;
            } else {
                self.occupied_count -= 1;
                self.referenced[idx] = false;
            }
        }
    }

    fn evict(&mut self) -> Option<FrameId> {
        if self.occupied_count == 0 {
            return None;
        }
        let slots = self.occupied.len();

        // The first sweep clears every bit, so the second always finds a victim.
        for _ in 0..(2 * slots) {
            let idx = self.hand;
            self.hand = (idx + 1) % slots;

            if !self.occupied[idx] {
                continue;
            }
            if self.referenced[idx] {
                self.referenced[idx] = false;
                continue;
            }
            self.occupied[idx] = false;
            self.occupied_count -= 1;
            return Some(FrameId(idx as u32));
        }
        None
    }

    fn size(&self) -> usize {
        self.occupied_count
    }
}
