//! Identifier types shared by every layer of the mailstore engine.

use crate::error::{MailstoreError, Result};
use serde::{Deserialize, Serialize};

/// Type tag stored in the low 5 bits of a NodeId.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeType {
    /// Heap item marker (also used as the HeapId type tag).
    HeapNode = 0x00,
    Internal = 0x01,
    NormalFolder = 0x02,
    SearchFolder = 0x03,
    NormalMessage = 0x04,
    Attachment = 0x05,
    SearchUpdateQueue = 0x06,
    SearchCriteriaObject = 0x07,
    AssociatedMessage = 0x08,
    ContentsTableIndex = 0x0A,
    ReceiveFolderTable = 0x0B,
    OutgoingQueueTable = 0x0C,
    HierarchyTable = 0x0D,
    ContentsTable = 0x0E,
    AssociatedContentsTable = 0x0F,
    SearchContentsTable = 0x10,
    AttachmentTable = 0x11,
    RecipientTable = 0x12,
    SearchTableIndex = 0x13,
    /// Node holding a property or table context directly.
    Ltp = 0x1F,
}

impl NodeType {
    /// Smallest index handed out for this type by a fresh file.
    pub fn initial_index(&self) -> u32 {
        match self {
            NodeType::SearchFolder => 0x4000,
            NodeType::NormalMessage => 0x10000,
            NodeType::AssociatedMessage => 0x8000,
            _ => 0x400,
        }
    }
}

impl TryFrom<u8> for NodeType {
    type Error = MailstoreError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x00 => NodeType::HeapNode,
            0x01 => NodeType::Internal,
            0x02 => NodeType::NormalFolder,
            0x03 => NodeType::SearchFolder,
            0x04 => NodeType::NormalMessage,
            0x05 => NodeType::Attachment,
            0x06 => NodeType::SearchUpdateQueue,
            0x07 => NodeType::SearchCriteriaObject,
            0x08 => NodeType::AssociatedMessage,
            0x0A => NodeType::ContentsTableIndex,
            0x0B => NodeType::ReceiveFolderTable,
            0x0C => NodeType::OutgoingQueueTable,
            0x0D => NodeType::HierarchyTable,
            0x0E => NodeType::ContentsTable,
            0x0F => NodeType::AssociatedContentsTable,
            0x10 => NodeType::SearchContentsTable,
            0x11 => NodeType::AttachmentTable,
            0x12 => NodeType::RecipientTable,
            0x13 => NodeType::SearchTableIndex,
            0x1F => NodeType::Ltp,
            other => {
                return Err(MailstoreError::InvalidArgument(format!(
                    "unknown node type {:#04x}",
                    other
                )))
            }
        })
    }
}

/// Identifier of a logical node: 5-bit type tag plus 27-bit index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Largest index that fits in the 27 index bits.
    pub const MAX_INDEX: u32 = (1 << 27) - 1;

    /// Creates a NodeId from a type tag and an index.
    pub fn new(node_type: NodeType, index: u32) -> Self {
        Self(((index & Self::MAX_INDEX) << 5) | node_type as u32)
    }

    /// Raw 5-bit type tag.
    pub fn type_tag(&self) -> u8 {
        (self.0 & 0x1F) as u8
    }

    /// Decoded type tag, failing for reserved values.
    pub fn node_type(&self) -> Result<NodeType> {
        NodeType::try_from(self.type_tag())
    }

    pub fn index(&self) -> u32 {
        self.0 >> 5
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "nid:{:#x}", self.0)
    }
}

/// Identifier of a physical block or page.
///
/// Bit 0 is reserved and ignored on comparison, bit 1 marks internal
/// (metadata) blocks and the remaining bits hold the index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl BlockId {
    /// Null reference used for absent subnode trees.
    pub const NONE: BlockId = BlockId(0);

    /// Increment applied to the block counter per allocation.
    pub const STEP: u64 = 4;

    const RESERVED_BIT: u64 = 0x1;
    const INTERNAL_BIT: u64 = 0x2;

    /// Creates a BlockId from an index and the internal flag.
    pub fn new(index: u64, internal: bool) -> Self {
        let flag = if internal { Self::INTERNAL_BIT } else { 0 };
        Self((index << 2) | flag)
    }

    pub fn index(&self) -> u64 {
        self.0 >> 2
    }

    pub fn is_internal(&self) -> bool {
        self.0 & Self::INTERNAL_BIT != 0
    }

    pub fn is_none(&self) -> bool {
        self.masked() == 0
    }

    /// Value used for lookups, with the reserved bit cleared.
    pub fn masked(&self) -> u64 {
        self.0 & !Self::RESERVED_BIT
    }

    /// Same index with the internal flag replaced.
    pub fn with_internal(&self, internal: bool) -> Self {
        Self::new(self.index(), internal)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl PartialEq for BlockId {
    fn eq(&self, other: &Self) -> bool {
        self.masked() == other.masked()
    }
}

impl Eq for BlockId {}

impl Default for BlockId {
    fn default() -> Self {
        Self::NONE
    }
}

impl std::hash::Hash for BlockId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.masked().hash(state);
    }
}

impl PartialOrd for BlockId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BlockId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.masked().cmp(&other.masked())
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bid:{:#x}", self.0)
    }
}

/// A block id paired with the absolute file offset of its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub block_id: BlockId,
    pub offset: u64,
}

impl BlockRef {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    pub const NONE: BlockRef = BlockRef {
        block_id: BlockId::NONE,
        offset: 0,
    };

    pub fn new(block_id: BlockId, offset: u64) -> Self {
        Self { block_id, offset }
    }

    /// Serializes to 16 bytes: block id then offset.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.block_id.0.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }

    /// Reads a BlockRef from the first 16 bytes of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(MailstoreError::corrupted(format!(
                "block reference needs {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        Ok(Self {
            block_id: BlockId(read_u64(bytes, 0)),
            offset: read_u64(bytes, 8),
        })
    }
}

/// Address of one item inside a heap-on-node.
///
/// Bits 0-4 hold the heap type tag (always 0), bits 5-15 the 1-based item
/// index and bits 16-31 the 0-based block index. Zero is the empty item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HeapId(pub u32);

impl HeapId {
    pub const EMPTY: HeapId = HeapId(0);

    /// Largest 1-based item index representable.
    pub const MAX_ITEM_INDEX: u16 = 0x7FF;

    pub fn new(block_index: u16, item_index: u16) -> Self {
        let item = (item_index & Self::MAX_ITEM_INDEX) as u32;
        Self(((block_index as u32) << 16) | (item << 5))
    }

    pub fn block_index(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// 1-based index of the item in its block. Zero never addresses an item.
    pub fn item_index(&self) -> u16 {
        ((self.0 >> 5) & Self::MAX_ITEM_INDEX as u32) as u16
    }

    pub fn type_tag(&self) -> u8 {
        (self.0 & 0x1F) as u8
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for HeapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "hid:{:#010x}", self.0)
    }
}

/// Reads a little-endian u16 at `offset`. Caller checks bounds.
#[inline]
pub fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

/// Reads a little-endian u32 at `offset`. Caller checks bounds.
#[inline]
pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Reads a little-endian u64 at `offset`. Caller checks bounds.
#[inline]
pub fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}
