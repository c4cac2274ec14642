//! Bounded cache of clean decoded blocks.

use crate::frame::{CacheFrame, FrameId};
use crate::replacer::{ClockReplacer, Replacer};
use mailstore_common::BlockId;
use std::collections::HashMap;
use tracing::trace;

/// Read-through cache keyed by block id.
///
/// Holds only values that match what is on disk. Lookups hand out owned
/// copies so callers can never mutate a cached value in place.
pub struct BlockCache<V> {
    /// Slots, `None` when vacant.
    frames: Vec<Option<CacheFrame<V>>>,
    /// Block id to slot mapping.
    index: HashMap<BlockId, FrameId>,
    /// Vacant slots.
    free_list: Vec<FrameId>,
    /// Eviction policy over occupied slots.
    replacer: ClockReplacer,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V: Clone> BlockCache<V> {
    /// Creates a cache holding at most `capacity` values.
    ///
    /// A zero capacity disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: (0..capacity).map(|_| None).collect(),
            index: HashMap::with_capacity(capacity),
            free_list: (0..capacity).rev().map(|i| FrameId(i as u32)).collect(),
            replacer: ClockReplacer::new(capacity),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, block_id: BlockId) -> bool {
        self.index.contains_key(&block_id)
    }

    /// Returns a copy of the cached value, if present.
    pub fn get(&mut self, block_id: BlockId) -> Option<V> {
        match self.index.get(&block_id) {
            Some(&frame_id) => {
                self.hits += 1;
                self.replacer.record_access(frame_id);
                self.frames[frame_id.index()]
                    .as_ref()
                    .map(|frame| frame.value().clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Caches a value, evicting another entry if the cache is full.
    ///
    /// Returns the evicted entry, if any.
    pub fn insert(&mut self, block_id: BlockId, value: V) -> Option<(BlockId, V)> {
        if let Some(&frame_id) = self.index.get(&block_id) {
            if let Some(frame) = self.frames[frame_id.index()].as_mut() {
                frame.replace(value);
            }
            self.replacer.record_access(frame_id);
            return None;
        }

        let mut evicted = None;
        let frame_id = match self.free_list.pop() {
            Some(frame_id) => frame_id,
            None => {
                let frame_id = self.replacer.evict()?;
                if let Some(frame) = self.frames[frame_id.index()].take() {
                    let (old_id, old_value) = frame.into_parts();
                    self.index.remove(&old_id);
                    self.evictions += 1;
                    trace!(block_id = %old_id, "evicted cached block");
                    evicted = Some((old_id, old_value));
                }
                frame_id
            }
        };

        self.frames[frame_id.index()] = Some(CacheFrame::new(block_id, value));
        self.index.insert(block_id, frame_id);
        self.replacer.set_evictable(frame_id, true);
        evicted
    }

    /// Drops a value from the cache.
    pub fn remove(&mut self, block_id: BlockId) -> Option<V> {
        let frame_id = self.index.remove(&block_id)?;
        self.replacer.set_evictable(frame_id, false);
        self.free_list.push(frame_id);
        self.frames[frame_id.index()]
            .take()
            .map(|frame| frame.into_parts().1)
    }

    /// Empties the cache, keeping its statistics.
    pub fn clear(&mut self) {
        let ids: Vec<BlockId> = self.index.keys().copied().collect();
        for id in ids {
            self.remove(id);
        }
    }

    /// Returns statistics about the cache.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            capacity: self.capacity(),
            cached: self.len(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

/// Statistics about a block cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Maximum number of values held.
    pub capacity: usize,
    /// Values currently held.
    pub cached: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}
