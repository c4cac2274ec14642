//! Entry types stored in the block and node b-trees.

use super::constants::ENTRIES_SIZE;
use mailstore_common::types::{read_u16, read_u32, read_u64};
use mailstore_common::{BlockId, BlockRef, NodeId, PageType};

/// A fixed-width leaf record keyed by an unsigned integer.
pub trait BTreeEntry: Clone + std::fmt::Debug {
    /// Page type written to trailers of this tree's pages.
    const PAGE_TYPE: PageType;
    /// Encoded size of one leaf record.
    const SIZE: usize;
    /// Leaf records that fit in one page.
    const MAX_ENTRIES: usize = ENTRIES_SIZE / Self::SIZE;

    fn key(&self) -> u64;

    /// Writes the record into `buf[..Self::SIZE]`.
    fn write_to(&self, buf: &mut [u8]);

    /// Reads a record from `buf[..Self::SIZE]`.
    fn read_from(buf: &[u8]) -> Self;
}

/// Block b-tree record: where a block lives and how many holders it has.
///
/// Layout (24 bytes): block reference (16), size (2), reference count (2),
/// padding (4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BbtEntry {
    pub block: BlockRef,
    /// Raw payload length of the block.
    pub size: u16,
    pub ref_count: u16,
}

impl BTreeEntry for BbtEntry {
    const PAGE_TYPE: PageType = PageType::BlockBTree;
    const SIZE: usize = 24;

    fn key(&self) -> u64 {
        self.block.block_id.masked()
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..16].copy_from_slice(&self.block.to_bytes());
        buf[16..18].copy_from_slice(&self.size.to_le_bytes());
        buf[18..20].copy_from_slice(&self.ref_count.to_le_bytes());
        buf[20..24].fill(0);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            block: BlockRef::new(BlockId(read_u64(buf, 0)), read_u64(buf, 8)),
            size: read_u16(buf, 16),
            ref_count: read_u16(buf, 18),
        }
    }
}

/// Node b-tree record.
///
/// Layout (32 bytes): node id widened to 8 bytes, data block id (8),
/// subnode block id (8), parent node id (4), padding (4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbtEntry {
    pub node_id: NodeId,
    pub data: BlockId,
    /// Subnode tree root, or `BlockId::NONE`.
    pub subnode: BlockId,
    /// Parent node, or `NodeId(0)`.
    pub parent: NodeId,
}

impl BTreeEntry for NbtEntry {
    const PAGE_TYPE: PageType = PageType::NodeBTree;
    const SIZE: usize = 32;

    fn key(&self) -> u64 {
        self.node_id.as_u32() as u64
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&(self.node_id.as_u32() as u64).to_le_bytes());
        buf[8..16].copy_from_slice(&self.data.as_u64().to_le_bytes());
        buf[16..24].copy_from_slice(&self.subnode.as_u64().to_le_bytes());
        buf[24..28].copy_from_slice(&self.parent.as_u32().to_le_bytes());
        buf[28..32].fill(0);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            node_id: NodeId(read_u64(buf, 0) as u32),
            data: BlockId(read_u64(buf, 8)),
            subnode: BlockId(read_u64(buf, 16)),
            parent: NodeId(read_u32(buf, 24)),
        }
    }
}

/// Intermediate page record: smallest key of a subtree and its page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeChild {
    pub key: u64,
    pub page: BlockRef,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailstore_common::NodeType;

    #[test]
    fn test_entry_capacity() {
        assert_eq!(BbtEntry::MAX_ENTRIES, 20);
        assert_eq!(NbtEntry::MAX_ENTRIES, 15);
    }

    #[test]
    fn test_bbt_entry_layout() {
        let entry = BbtEntry {
            block: BlockRef::new(BlockId(0x25), 0x4a00),
            size: 300,
            ref_count: 2,
        };
        let mut buf = [0xEEu8; 24];
        entry.write_to(&mut buf);
        assert_eq!(&buf[0..8], &0x25u64.to_le_bytes());
        assert_eq!(&buf[16..18], &300u16.to_le_bytes());
        assert_eq!(&buf[18..20], &2u16.to_le_bytes());
        assert_eq!(&buf[20..24], &[0u8; 4]);
        assert_eq!(BbtEntry::read_from(&buf), entry);
        // Reserved bit does not take part in the key.
        assert_eq!(entry.key(), 0x24);
    }

    #[test]
    fn test_nbt_entry_layout() {
        let entry = NbtEntry {
            node_id: NodeId::new(NodeType::NormalMessage, 0x10001),
            data: BlockId::new(3, false),
            subnode: BlockId::new(4, true),
            parent: NodeId::new(NodeType::NormalFolder, 0x401),
        };
        let mut buf = [0u8; 32];
        entry.write_to(&mut buf);
        assert_eq!(&buf[4..8], &[0u8; 4]);
        assert_eq!(&buf[24..28], &entry.parent.as_u32().to_le_bytes());
        assert_eq!(NbtEntry::read_from(&buf), entry);
        assert_eq!(entry.key(), entry.node_id.as_u32() as u64);
    }
}
