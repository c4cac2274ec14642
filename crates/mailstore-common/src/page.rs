//! Page and block framing: trailers, checksums and signatures.
//!
//! Every 512-byte page ends with a 16-byte page trailer and every block ends
//! with a 16-byte block trailer placed after the 64-byte alignment padding.

use crate::error::{MailstoreError, Result};
use crate::types::{read_u16, read_u32, read_u64, BlockId};
use serde::{Deserialize, Serialize};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 512;

/// Payload bytes of a page, before its trailer.
pub const PAGE_DATA_SIZE: usize = 496;

/// Blocks are aligned to this many bytes on disk.
pub const BLOCK_ALIGNMENT: usize = 64;

/// Largest total encoded block size, trailer and padding included.
pub const MAX_BLOCK_SIZE: usize = 8192;

/// Largest raw payload that fits in one block.
pub const MAX_BLOCK_DATA_SIZE: usize = MAX_BLOCK_SIZE - BlockTrailer::SIZE;

/// Page types recorded in page trailers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageType {
    /// Block b-tree page.
    BlockBTree = 0x80,
    /// Node b-tree page.
    NodeBTree = 0x81,
    /// Free map page.
    FreeMap = 0x82,
    /// Page allocation map page.
    PageMap = 0x83,
    /// Allocation map page.
    AllocationMap = 0x84,
    /// Free page map page.
    FreePageMap = 0x85,
    /// Density list page.
    DensityList = 0x86,
}

impl PageType {
    /// True for page types whose trailer carries a real signature.
    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            PageType::BlockBTree | PageType::NodeBTree | PageType::DensityList
        )
    }
}

impl TryFrom<u8> for PageType {
    type Error = MailstoreError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x80 => PageType::BlockBTree,
            0x81 => PageType::NodeBTree,
            0x82 => PageType::FreeMap,
            0x83 => PageType::PageMap,
            0x84 => PageType::AllocationMap,
            0x85 => PageType::FreePageMap,
            0x86 => PageType::DensityList,
            other => {
                return Err(MailstoreError::corrupted(format!(
                    "unknown page type {:#04x}",
                    other
                )))
            }
        })
    }
}

/// Computes the block/page signature from its file offset and id.
pub fn compute_signature(offset: u64, block_id: BlockId) -> u16 {
    let value = offset ^ block_id.as_u64();
    (((value >> 16) ^ value) & 0xFFFF) as u16
}

/// Computes the file-format CRC-32.
///
/// This is the reflected 0xEDB88320 polynomial with a zero seed and no final
/// inversion. crc32fast inverts on entry and exit, so both are undone here.
pub fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(0xFFFF_FFFF);
    hasher.update(data);
    !hasher.finalize()
}

/// Rounds a raw payload length up to its on-disk block size.
pub fn block_total_size(data_len: usize) -> usize {
    let raw = data_len + BlockTrailer::SIZE;
    raw.div_ceil(BLOCK_ALIGNMENT) * BLOCK_ALIGNMENT
}

/// Trailer at offset 496 of every page.
///
/// Layout (16 bytes):
/// - page_type: 1 byte
/// - page_type_repeat: 1 byte
/// - signature: 2 bytes
/// - crc: 4 bytes (over the first 496 bytes)
/// - block_id: 8 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTrailer {
    pub page_type: PageType,
    pub signature: u16,
    pub crc: u32,
    pub block_id: BlockId,
}

impl PageTrailer {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.page_type as u8;
        buf[1] = self.page_type as u8;
        buf[2..4].copy_from_slice(&self.signature.to_le_bytes());
        buf[4..8].copy_from_slice(&self.crc.to_le_bytes());
        buf[8..16].copy_from_slice(&self.block_id.as_u64().to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(MailstoreError::corrupted("page trailer truncated"));
        }
        if buf[0] != buf[1] {
            return Err(MailstoreError::corrupted(format!(
                "page type {:#04x} does not match its repeat {:#04x}",
                buf[0], buf[1]
            )));
        }
        Ok(Self {
            page_type: PageType::try_from(buf[0])?,
            signature: read_u16(buf, 2),
            crc: read_u32(buf, 4),
            block_id: BlockId(read_u64(buf, 8)),
        })
    }
}

/// Fills in the trailer of a page buffer.
///
/// Map pages carry a zero signature and use their own offset as block id.
pub fn seal_page(page: &mut [u8; PAGE_SIZE], page_type: PageType, block_id: BlockId, offset: u64) {
    let signature = if page_type.is_signed() {
        compute_signature(offset, block_id)
    } else {
        0
    };
    let trailer = PageTrailer {
        page_type,
        signature,
        crc: compute_crc(&page[..PAGE_DATA_SIZE]),
        block_id,
    };
    page[PAGE_DATA_SIZE..].copy_from_slice(&trailer.to_bytes());
}

/// Checks a page read from `offset` and returns its trailer.
pub fn verify_page(page: &[u8], expected_type: PageType, offset: u64) -> Result<PageTrailer> {
    if page.len() != PAGE_SIZE {
        return Err(MailstoreError::corrupted(format!(
            "page at {:#x} has {} bytes",
            offset,
            page.len()
        )));
    }
    let trailer = PageTrailer::from_bytes(&page[PAGE_DATA_SIZE..])?;
    if trailer.page_type != expected_type {
        return Err(MailstoreError::PageTypeMismatch {
            offset,
            expected: expected_type as u8,
            actual: trailer.page_type as u8,
        });
    }
    let crc = compute_crc(&page[..PAGE_DATA_SIZE]);
    if crc != trailer.crc {
        return Err(MailstoreError::ChecksumMismatch {
            offset,
            expected: trailer.crc,
            actual: crc,
        });
    }
    if expected_type.is_signed() {
        let signature = compute_signature(offset, trailer.block_id);
        if signature != trailer.signature {
            return Err(MailstoreError::SignatureMismatch {
                offset,
                expected: trailer.signature,
                actual: signature,
            });
        }
    }
    Ok(trailer)
}

/// Trailer closing every block.
///
/// Layout (16 bytes):
/// - data_len: 2 bytes (raw payload length)
/// - signature: 2 bytes
/// - crc: 4 bytes (over the raw payload only)
/// - block_id: 8 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTrailer {
    pub data_len: u16,
    pub signature: u16,
    pub crc: u32,
    pub block_id: BlockId,
}

impl BlockTrailer {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.data_len.to_le_bytes());
        buf[2..4].copy_from_slice(&self.signature.to_le_bytes());
        buf[4..8].copy_from_slice(&self.crc.to_le_bytes());
        buf[8..16].copy_from_slice(&self.block_id.as_u64().to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(MailstoreError::corrupted("block trailer truncated"));
        }
        Ok(Self {
            data_len: read_u16(buf, 0),
            signature: read_u16(buf, 2),
            crc: read_u32(buf, 4),
            block_id: BlockId(read_u64(buf, 8)),
        })
    }
}

/// Frames a raw payload as an on-disk block destined for `offset`.
pub fn seal_block(data: &[u8], block_id: BlockId, offset: u64) -> Result<Vec<u8>> {
    if data.len() > MAX_BLOCK_DATA_SIZE {
        return Err(MailstoreError::BlockTooLarge {
            size: block_total_size(data.len()),
            max: MAX_BLOCK_SIZE,
        });
    }
    let total = block_total_size(data.len());
    let mut buf = vec![0u8; total];
    buf[..data.len()].copy_from_slice(data);
    let trailer = BlockTrailer {
        data_len: data.len() as u16,
        signature: compute_signature(offset, block_id),
        crc: compute_crc(data),
        block_id,
    };
    buf[total - BlockTrailer::SIZE..].copy_from_slice(&trailer.to_bytes());
    Ok(buf)
}

/// Validates a block read from `offset` and returns its raw payload.
///
/// Checks, in order: framing, block identity, signature and checksum.
pub fn verify_block(buf: &[u8], expected: BlockId, offset: u64) -> Result<&[u8]> {
    if buf.len() < BlockTrailer::SIZE || buf.len() % BLOCK_ALIGNMENT != 0 {
        return Err(MailstoreError::corrupted(format!(
            "block {} at {:#x} has unaligned size {}",
            expected,
            offset,
            buf.len()
        )));
    }
    let trailer = BlockTrailer::from_bytes(&buf[buf.len() - BlockTrailer::SIZE..])?;
    let data_len = trailer.data_len as usize;
    if block_total_size(data_len) != buf.len() {
        return Err(MailstoreError::corrupted(format!(
            "block {} at {:#x} declares {} bytes in a {}-byte frame",
            expected,
            offset,
            data_len,
            buf.len()
        )));
    }
    if trailer.block_id != expected {
        return Err(MailstoreError::BlockIdMismatch {
            offset,
            expected: expected.as_u64(),
            actual: trailer.block_id.as_u64(),
        });
    }
    let signature = compute_signature(offset, trailer.block_id);
    if signature != trailer.signature {
        return Err(MailstoreError::SignatureMismatch {
            offset,
            expected: trailer.signature,
            actual: signature,
        });
    }
    let data = &buf[..data_len];
    let crc = compute_crc(data);
    if crc != trailer.crc {
        return Err(MailstoreError::ChecksumMismatch {
            offset,
            expected: trailer.crc,
            actual: crc,
        });
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_constants() {
        assert_eq!(PAGE_SIZE, PAGE_DATA_SIZE + PageTrailer::SIZE);
        assert_eq!(MAX_BLOCK_DATA_SIZE, 8176);
    }

    #[test]
    fn test_crc_zero_seed() {
        assert_eq!(compute_crc(&[]), 0);
        // A zero register stays zero across zero bytes.
        assert_eq!(compute_crc(&[0u8; 64]), 0);
        assert_ne!(compute_crc(b"A"), 0);
        assert_ne!(compute_crc(b"A"), compute_crc(b"B"));
    }

    #[test]
    fn test_crc_matches_table_definition() {
        fn table_crc(data: &[u8]) -> u32 {
            let mut crc = 0u32;
            for &b in data {
                crc ^= b as u32;
                for _ in 0..8 {
                    crc = if crc & 1 != 0 {
                        (crc >> 1) ^ 0xEDB8_8320
                    } else {
                        crc >> 1
                    };
                }
            }
            crc
        }

        for input in [&b"123456789"[..], b"mailstore", &[0xFF; 300]] {
            assert_eq!(compute_crc(input), table_crc(input));
        }
    }

    #[test]
    fn test_signature() {
        let bid = BlockId(0x4);
        assert_eq!(compute_signature(0x4400, bid), 0x4404);
        let sig = compute_signature(0x1_0000, BlockId(0x2_0004));
        // 0x30004 -> 0x3 ^ 0x0004
        assert_eq!(sig, 0x0007);
    }

    #[test]
    fn test_block_total_size() {
        assert_eq!(block_total_size(0), 64);
        assert_eq!(block_total_size(48), 64);
        assert_eq!(block_total_size(49), 128);
        assert_eq!(block_total_size(MAX_BLOCK_DATA_SIZE), MAX_BLOCK_SIZE);
    }

    #[test]
    fn test_page_type_repr() {
        assert_eq!(PageType::BlockBTree as u8, 0x80);
        assert_eq!(PageType::AllocationMap as u8, 0x84);
        assert!(PageType::NodeBTree.is_signed());
        assert!(!PageType::PageMap.is_signed());
        assert!(PageType::try_from(0x7F).is_err());
    }

    #[test]
    fn test_seal_and_verify_page() {
        let mut page = [0u8; PAGE_SIZE];
        page[..4].copy_from_slice(&[1, 2, 3, 4]);
        let bid = BlockId::new(7, true);
        seal_page(&mut page, PageType::BlockBTree, bid, 0x8000);

        let trailer = verify_page(&page, PageType::BlockBTree, 0x8000).unwrap();
        assert_eq!(trailer.block_id, bid);
        assert_eq!(trailer.signature, compute_signature(0x8000, bid));
        assert_eq!(page[496], 0x80);
        assert_eq!(page[497], 0x80);
    }

    #[test]
    fn test_map_page_has_zero_signature() {
        let mut page = [0u8; PAGE_SIZE];
        seal_page(&mut page, PageType::AllocationMap, BlockId(0x4400), 0x4400);
        let trailer = verify_page(&page, PageType::AllocationMap, 0x4400).unwrap();
        assert_eq!(trailer.signature, 0);
        assert_eq!(trailer.block_id.as_u64(), 0x4400);
    }

    #[test]
    fn test_verify_page_detects_damage() {
        let mut page = [0u8; PAGE_SIZE];
        seal_page(&mut page, PageType::NodeBTree, BlockId(0x6), 0x600);

        let err = verify_page(&page, PageType::BlockBTree, 0x600).unwrap_err();
        assert!(matches!(err, MailstoreError::PageTypeMismatch { .. }));

        // Same bytes read back from another offset fail the signature.
        let err = verify_page(&page, PageType::NodeBTree, 0x800).unwrap_err();
        assert!(matches!(err, MailstoreError::SignatureMismatch { .. }));

        page[10] ^= 0x01;
        let err = verify_page(&page, PageType::NodeBTree, 0x600).unwrap_err();
        assert!(matches!(err, MailstoreError::ChecksumMismatch { .. }));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_page_trailer_repeat_mismatch() {
        let mut page = [0u8; PAGE_SIZE];
        seal_page(&mut page, PageType::NodeBTree, BlockId(0x6), 0x600);
        page[497] = 0x80;
        assert!(verify_page(&page, PageType::NodeBTree, 0x600).is_err());
    }

    #[test]
    fn test_seal_and_verify_block() {
        let data = b"hello mailstore".to_vec();
        let bid = BlockId::new(3, false);
        let buf = seal_block(&data, bid, 0x4a00).unwrap();
        assert_eq!(buf.len(), 64);

        let trailer = BlockTrailer::from_bytes(&buf[48..]).unwrap();
        assert_eq!(trailer.data_len as usize, data.len());
        assert_eq!(trailer.block_id, bid);

        let payload = verify_block(&buf, bid, 0x4a00).unwrap();
        assert_eq!(payload, &data[..]);
    }

    #[test]
    fn test_verify_block_detects_tamper() {
        let bid = BlockId::new(3, false);
        let mut buf = seal_block(&[0xAB; 100], bid, 0x4a00).unwrap();
        buf[5] ^= 0xFF;
        let err = verify_block(&buf, bid, 0x4a00).unwrap_err();
        assert!(matches!(err, MailstoreError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_verify_block_identity() {
        let bid = BlockId::new(3, false);
        let buf = seal_block(&[1, 2, 3], bid, 0x4a00).unwrap();
        let err = verify_block(&buf, BlockId::new(4, false), 0x4a00).unwrap_err();
        assert!(matches!(err, MailstoreError::BlockIdMismatch { .. }));

        let err = verify_block(&buf, bid, 0x4a40).unwrap_err();
        assert!(matches!(err, MailstoreError::SignatureMismatch { .. }));
    }

    #[test]
    fn test_verify_block_bad_frame() {
        let bid = BlockId::new(3, false);
        let buf = seal_block(&[1, 2, 3], bid, 0x4a00).unwrap();
        assert!(verify_block(&buf[..63], bid, 0x4a00).is_err());

        let mut grown = buf.clone();
        grown.extend_from_slice(&[0u8; 64]);
        assert!(verify_block(&grown, bid, 0x4a00).is_err());
    }

    #[test]
    fn test_seal_block_too_large() {
        let err = seal_block(&vec![0u8; MAX_BLOCK_DATA_SIZE + 1], BlockId(4), 0).unwrap_err();
        assert!(matches!(err, MailstoreError::BlockTooLarge { .. }));
        assert!(err.is_caller_misuse());
    }

    #[test]
    fn test_page_type_serde_roundtrip() {
        for page_type in [PageType::BlockBTree, PageType::FreePageMap] {
            let json = serde_json::to_string(&page_type).unwrap();
            let back: PageType = serde_json::from_str(&json).unwrap();
            assert_eq!(page_type, back);
        }
    }
}
