//! File header at offset 0.
//!
//! Layout (564 bytes, Unicode variant):
//! - 0: magic `!BDN`, 4: partial CRC over 471 bytes from offset 8
//! - 8: client magic `SM`, 10: version, 12: client version, 14/15: platform bytes
//! - 16/20: reserved, 24: unused bid
//! - 32: next page bid, 40: unique counter, 44: 32 node id counters
//! - 172: unused, 180: root record (72 bytes)
//! - 252: align, 256/384: deprecated free maps (0xFF)
//! - 512: sentinel, 513: crypt method, 514: reserved
//! - 516: next block bid, 524: full CRC over 516 bytes from offset 8
//! - 528..564: reserved

use mailstore_common::types::{read_u16, read_u32, read_u64};
use mailstore_common::{compute_crc, BlockId, BlockRef, MailstoreError, NodeId, NodeType, Result};

/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 564;

pub const HEADER_MAGIC: u32 = 0x4E44_4221;
pub const CLIENT_MAGIC: u16 = 0x4D53;
/// Unicode file format version.
pub const FORMAT_VERSION: u16 = 23;
pub const CLIENT_VERSION: u16 = 19;
pub const SENTINEL: u8 = 0x80;

/// Lowest version that uses 64-bit block ids.
const MIN_UNICODE_VERSION: u16 = 23;

const PARTIAL_CRC_LEN: usize = 471;
const FULL_CRC_LEN: usize = 516;

/// Allocation map validity values stored in the root record.
pub const AMAP_INVALID: u8 = 0x00;
pub const AMAP_VALID_LEGACY: u8 = 0x01;
pub const AMAP_VALID: u8 = 0x02;

/// Number of per-type node id counters.
pub const NODE_COUNTER_COUNT: usize = 32;

/// Root record: where the trees live and how big the file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Root {
    pub file_eof: u64,
    pub amap_last: u64,
    pub amap_free: u64,
    pub pmap_free: u64,
    pub node_btree: BlockRef,
    pub block_btree: BlockRef,
    pub amap_valid: u8,
}

impl Root {
    pub const SIZE: usize = 72;

    pub fn is_amap_valid(&self) -> bool {
        matches!(self.amap_valid, AMAP_VALID | AMAP_VALID_LEGACY)
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].fill(0);
        buf[4..12].copy_from_slice(&self.file_eof.to_le_bytes());
        buf[12..20].copy_from_slice(&self.amap_last.to_le_bytes());
        buf[20..28].copy_from_slice(&self.amap_free.to_le_bytes());
        buf[28..36].copy_from_slice(&self.pmap_free.to_le_bytes());
        buf[36..52].copy_from_slice(&self.node_btree.to_bytes());
        buf[52..68].copy_from_slice(&self.block_btree.to_bytes());
        buf[68] = self.amap_valid;
        buf[69..72].fill(0);
    }

    fn read_from(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            file_eof: read_u64(buf, 4),
            amap_last: read_u64(buf, 12),
            amap_free: read_u64(buf, 20),
            pmap_free: read_u64(buf, 28),
            node_btree: BlockRef::from_bytes(&buf[36..52])?,
            block_btree: BlockRef::from_bytes(&buf[52..68])?,
            amap_valid: buf[68],
        })
    }
}

/// Decoded file header plus the counters it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub platform_create: u8,
    pub platform_access: u8,
    pub reserved1: u32,
    pub reserved2: u32,
    pub next_page_id: u64,
    pub unique: u32,
    pub node_counters: [u32; NODE_COUNTER_COUNT],
    pub root: Root,
    pub crypt_method: u8,
    pub next_block_id: u64,
}

impl Header {
    /// Header of a freshly created, empty file.
    pub fn new() -> Self {
        let mut node_counters = [0x400u32; NODE_COUNTER_COUNT];
        for (tag, counter) in node_counters.iter_mut().enumerate() {
            if let Ok(node_type) = NodeType::try_from(tag as u8) {
                *counter = node_type.initial_index();
            }
        }
        Self {
            platform_create: 0x01,
            platform_access: 0x01,
            reserved1: 0,
            reserved2: 0,
            next_page_id: BlockId::new(1, false).as_u64(),
            unique: 0,
            node_counters,
            root: Root {
                file_eof: 0,
                amap_last: 0,
                amap_free: 0,
                pmap_free: 0,
                node_btree: BlockRef::NONE,
                block_btree: BlockRef::NONE,
                amap_valid: AMAP_VALID,
            },
            crypt_method: 0,
            next_block_id: BlockId::new(1, false).as_u64(),
        }
    }

    /// Hands out the next node id of a type. Fails once the 27-bit index
    /// space of the type is used up.
    pub fn allocate_next_node_id(&mut self, node_type: NodeType) -> Result<NodeId> {
        let counter = &mut self.node_counters[node_type as usize];
        if *counter >= NodeId::MAX_INDEX {
            return Err(MailstoreError::NodeIdsExhausted {
                type_tag: node_type as u8,
            });
        }
        *counter += 1;
        Ok(NodeId::new(node_type, *counter))
    }

    /// Hands out the next block id, tagged internal or not.
    pub fn allocate_next_block_id(&mut self, internal: bool) -> BlockId {
        let id = BlockId(self.next_block_id).with_internal(internal);
        self.next_block_id += BlockId::STEP;
        id
    }

    /// Hands out the next id for a b-tree page.
    pub fn allocate_next_page_id(&mut self) -> BlockId {
        let id = BlockId(self.next_page_id);
        self.next_page_id += BlockId::STEP;
        id
    }

    /// Advances and returns the unique counter.
    pub fn allocate_next_unique_id(&mut self) -> u32 {
        self.unique = self.unique.wrapping_add(1);
        self.unique
    }

    /// Serializes the header with both CRCs filled in.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        buf[8..10].copy_from_slice(&CLIENT_MAGIC.to_le_bytes());
        buf[10..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[12..14].copy_from_slice(&CLIENT_VERSION.to_le_bytes());
        buf[14] = self.platform_create;
        buf[15] = self.platform_access;
        buf[16..20].copy_from_slice(&self.reserved1.to_le_bytes());
        buf[20..24].copy_from_slice(&self.reserved2.to_le_bytes());
        buf[32..40].copy_from_slice(&self.next_page_id.to_le_bytes());
        buf[40..44].copy_from_slice(&self.unique.to_le_bytes());
        for (i, counter) in self.node_counters.iter().enumerate() {
            let at = 44 + i * 4;
            buf[at..at + 4].copy_from_slice(&counter.to_le_bytes());
        }
        self.root.write_to(&mut buf[180..252]);
        buf[256..512].fill(0xFF);
        buf[512] = SENTINEL;
        buf[513] = self.crypt_method;
        buf[516..524].copy_from_slice(&self.next_block_id.to_le_bytes());

        let partial = compute_crc(&buf[8..8 + PARTIAL_CRC_LEN]);
        buf[4..8].copy_from_slice(&partial.to_le_bytes());
        let full = compute_crc(&buf[8..8 + FULL_CRC_LEN]);
        buf[524..528].copy_from_slice(&full.to_le_bytes());
        buf
    }

    /// Parses and validates a header.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(MailstoreError::UnsupportedFormat(format!(
                "header needs {} bytes, got {}",
                HEADER_SIZE,
                buf.len()
            )));
        }
        let magic = read_u32(buf, 0);
        if magic != HEADER_MAGIC {
            return Err(MailstoreError::UnsupportedFormat(format!(
                "bad magic {:#010x}",
                magic
            )));
        }
        let client_magic = read_u16(buf, 8);
        if client_magic != CLIENT_MAGIC {
            return Err(MailstoreError::UnsupportedFormat(format!(
                "bad client magic {:#06x}",
                client_magic
            )));
        }
        let version = read_u16(buf, 10);
        if version < MIN_UNICODE_VERSION {
            return Err(MailstoreError::UnsupportedFormat(format!(
                "version {} is the ANSI layout",
                version
            )));
        }

        let stored = read_u32(buf, 4);
        let computed = compute_crc(&buf[8..8 + PARTIAL_CRC_LEN]);
        if stored != computed {
            return Err(MailstoreError::ChecksumMismatch {
                offset: 0,
                expected: stored,
                actual: computed,
            });
        }
        let stored = read_u32(buf, 524);
        let computed = compute_crc(&buf[8..8 + FULL_CRC_LEN]);
        if stored != computed {
            return Err(MailstoreError::ChecksumMismatch {
                offset: 0,
                expected: stored,
                actual: computed,
            });
        }

        if buf[512] != SENTINEL {
            return Err(MailstoreError::corrupted(format!(
                "header sentinel is {:#04x}",
                buf[512]
            )));
        }
        let crypt_method = buf[513];
        if crypt_method != 0 {
            return Err(MailstoreError::UnsupportedFormat(format!(
                "encoded payloads (method {}) are not supported",
                crypt_method
            )));
        }

        let mut node_counters = [0u32; NODE_COUNTER_COUNT];
        for (i, counter) in node_counters.iter_mut().enumerate() {
            *counter = read_u32(buf, 44 + i * 4);
        }

        Ok(Self {
            platform_create: buf[14],
            platform_access: buf[15],
            reserved1: read_u32(buf, 16),
            reserved2: read_u32(buf, 20),
            next_page_id: read_u64(buf, 32),
            unique: read_u32(buf, 40),
            node_counters,
            root: Root::read_from(&buf[180..252])?,
            crypt_method,
            next_block_id: read_u64(buf, 516),
        })
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}
