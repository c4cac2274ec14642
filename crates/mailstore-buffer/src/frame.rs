//! Cache frames.

use mailstore_common::BlockId;

/// Index of a slot in the block cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

impl FrameId {
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// A slot holding one cached value and the block it was decoded from.
#[derive(Debug, Clone)]
pub struct CacheFrame<V> {
    block_id: BlockId,
    value: V,
}

impl<V> CacheFrame<V> {
    pub fn new(block_id: BlockId, value: V) -> Self {
        Self { block_id, value }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    /// Replaces the held value, returning the previous one.
    pub fn replace(&mut self, value: V) -> V {
        std::mem::replace(&mut self.value, value)
    }

    pub fn into_parts(self) -> (BlockId, V) {
        (self.block_id, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_id_display() {
        assert_eq!(FrameId(7).to_string(), "frame:7");
        assert_eq!(FrameId(7).index(), 7);
    }

    #[test]
    fn test_cache_frame_replace() {
        let mut frame = CacheFrame::new(BlockId(0x8), vec![1u8, 2]);
        assert_eq!(frame.block_id(), BlockId(0x8));
        let old = frame.replace(vec![3]);
        assert_eq!(old, vec![1, 2]);
        assert_eq!(frame.value(), &vec![3]);
        let (id, value) = frame.into_parts();
        assert_eq!(id, BlockId(0x8));
        assert_eq!(value, vec![3]);
    }
}
