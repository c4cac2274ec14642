//! Decoded block payloads.
//!
//! Data blocks carry raw bytes. Internal blocks start with a type byte and a
//! level byte that select one of four layouts:
//!
//! | type | level | layout                                      |
//! |------|-------|---------------------------------------------|
//! | 0x01 | 1     | index over data blocks (8-byte ids)         |
//! | 0x01 | 2     | index over level-1 index blocks             |
//! | 0x02 | 0     | subnode leaf (nid, data id, subnode id)     |
//! | 0x02 | 1     | subnode index (nid, child block id)         |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mailstore_common::{BlockId, MailstoreError, NodeId, Result, MAX_BLOCK_DATA_SIZE};

const INDEX_BLOCK_TYPE: u8 = 0x01;
const SUBNODE_BLOCK_TYPE: u8 = 0x02;

/// Size of the fixed header of every internal block.
pub const INTERNAL_HEADER_SIZE: usize = 8;

/// Maximum child ids in one index block.
pub const MAX_INDEX_ENTRIES: usize = (MAX_BLOCK_DATA_SIZE - INTERNAL_HEADER_SIZE) / 8;

/// Maximum entries in one subnode leaf block.
pub const MAX_SUBNODE_LEAF_ENTRIES: usize =
    (MAX_BLOCK_DATA_SIZE - INTERNAL_HEADER_SIZE) / SubnodeLeafEntry::SIZE;

/// Maximum entries in one subnode index block.
pub const MAX_SUBNODE_INDEX_ENTRIES: usize =
    (MAX_BLOCK_DATA_SIZE - INTERNAL_HEADER_SIZE) / SubnodeIndexEntry::SIZE;

/// One subnode as recorded in a subnode leaf block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnodeLeafEntry {
    pub node_id: NodeId,
    pub data: BlockId,
    /// Nested subnode tree, or `BlockId::NONE`.
    pub subnode: BlockId,
}

impl SubnodeLeafEntry {
    pub const SIZE: usize = 24;
}

/// Pointer from a subnode index block to a leaf block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnodeIndexEntry {
    /// Smallest node id in the child leaf.
    pub node_id: NodeId,
    pub block: BlockId,
}

impl SubnodeIndexEntry {
    pub const SIZE: usize = 16;
}

/// A block payload, decoded once when read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Data(Bytes),
    /// Index over data blocks. `total_size` is the byte length of the stream.
    IndexL1 {
        total_size: u32,
        children: Vec<BlockId>,
    },
    /// Index over level-1 index blocks.
    IndexL2 {
        total_size: u32,
        children: Vec<BlockId>,
    },
    SubnodeLeaf(Vec<SubnodeLeafEntry>),
    SubnodeIndex(Vec<SubnodeIndexEntry>),
}

impl Block {
    /// True for every kind but raw data.
    pub fn is_internal(&self) -> bool {
        !matches!(self, Block::Data(_))
    }

    /// Encoded payload length, before framing.
    pub fn encoded_len(&self) -> usize {
        match self {
            Block::Data(data) => data.len(),
            Block::IndexL1 { children, .. } | Block::IndexL2 { children, .. } => {
                INTERNAL_HEADER_SIZE + children.len() * 8
            }
            Block::SubnodeLeaf(entries) => {
                INTERNAL_HEADER_SIZE + entries.len() * SubnodeLeafEntry::SIZE
            }
            Block::SubnodeIndex(entries) => {
                INTERNAL_HEADER_SIZE + entries.len() * SubnodeIndexEntry::SIZE
            }
        }
    }

    /// Serializes the payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        match self {
            Block::Data(data) => buf.put_slice(data),
            Block::IndexL1 {
                total_size,
                children,
            }
            | Block::IndexL2 {
                total_size,
                children,
            } => {
                let level = if matches!(self, Block::IndexL1 { .. }) { 1 } else { 2 };
                buf.put_u8(INDEX_BLOCK_TYPE);
                buf.put_u8(level);
                buf.put_u16_le(children.len() as u16);
                buf.put_u32_le(*total_size);
                for child in children {
                    buf.put_u64_le(child.as_u64());
                }
            }
            Block::SubnodeLeaf(entries) => {
                buf.put_u8(SUBNODE_BLOCK_TYPE);
                buf.put_u8(0);
                buf.put_u16_le(entries.len() as u16);
                buf.put_u32_le(0);
                for entry in entries {
                    buf.put_u64_le(entry.node_id.as_u32() as u64);
                    buf.put_u64_le(entry.data.as_u64());
                    buf.put_u64_le(entry.subnode.as_u64());
                }
            }
            Block::SubnodeIndex(entries) => {
                buf.put_u8(SUBNODE_BLOCK_TYPE);
                buf.put_u8(1);
                buf.put_u16_le(entries.len() as u16);
                buf.put_u32_le(0);
                for entry in entries {
                    buf.put_u64_le(entry.node_id.as_u32() as u64);
                    buf.put_u64_le(entry.block.as_u64());
                }
            }
        }
        buf.freeze()
    }

    /// Decodes the payload of block `block_id`.
    ///
    /// Non-internal ids are always raw data. For internal blocks the entry
    /// count implied by the payload length must match the stored count.
    pub fn decode(block_id: BlockId, payload: &[u8]) -> Result<Self> {
        if !block_id.is_internal() {
            return Ok(Block::Data(Bytes::copy_from_slice(payload)));
        }
        if payload.len() < INTERNAL_HEADER_SIZE {
            return Err(MailstoreError::corrupted(format!(
                "internal block {} has only {} bytes",
                block_id,
                payload.len()
            )));
        }
        let mut buf = payload;
        let block_type = buf.get_u8();
        let level = buf.get_u8();
        let count = buf.get_u16_le() as usize;
        let total_size = buf.get_u32_le();

        let entry_size = match (block_type, level) {
            (INDEX_BLOCK_TYPE, 1 | 2) => 8,
            (SUBNODE_BLOCK_TYPE, 0) => SubnodeLeafEntry::SIZE,
            (SUBNODE_BLOCK_TYPE, 1) => SubnodeIndexEntry::SIZE,
            _ => {
                return Err(MailstoreError::corrupted(format!(
                    "block {} has unknown type {:#04x} level {}",
                    block_id, block_type, level
                )))
            }
        };
        if buf.len() % entry_size != 0 || buf.len() / entry_size != count {
            return Err(MailstoreError::corrupted(format!(
                "block {} declares {} entries in {} bytes",
                block_id,
                count,
                payload.len()
            )));
        }

        Ok(match (block_type, level) {
            (INDEX_BLOCK_TYPE, level) => {
                let children = (0..count).map(|_| BlockId(buf.get_u64_le())).collect();
                if level == 1 {
                    Block::IndexL1 {
                        total_size,
                        children,
                    }
                } else {
                    Block::IndexL2 {
                        total_size,
                        children,
                    }
                }
            }
            (_, 0) => Block::SubnodeLeaf(
                (0..count)
                    .map(|_| SubnodeLeafEntry {
                        node_id: NodeId(buf.get_u64_le() as u32),
                        data: BlockId(buf.get_u64_le()),
                        subnode: BlockId(buf.get_u64_le()),
                    })
                    .collect(),
            ),
            _ => Block::SubnodeIndex(
                (0..count)
                    .map(|_| SubnodeIndexEntry {
                        node_id: NodeId(buf.get_u64_le() as u32),
                        block: BlockId(buf.get_u64_le()),
                    })
                    .collect(),
            ),
        })
    }
}
