//! Heap block codec.
//!
//! Block layout:
//! ```text
//! +---------------------+
//! | Header (12/66/2)    |  first, bitmap or plain block
//! +---------------------+
//! | Items               |  packed, in item order
//! +---------------------+
//! | pad to even offset  |
//! +---------------------+
//! | Page map            |  count, freed count, count+1 start offsets
//! +---------------------+
//! ```
//!
//! The header's first two bytes give the page map offset. Item `i` spans
//! `offsets[i]..offsets[i + 1]`; a freed item is zero length.

use super::constants::{
    BITMAP_FILL_LEVELS, BITMAP_HEADER_SIZE, FILL_LEVEL_THRESHOLDS, FIRST_BITMAP_BLOCK,
    FIRST_BLOCK_FILL_LEVELS, FIRST_HEADER_SIZE, HEAP_BLOCK_CAPACITY, HEAP_SIGNATURE,
    MAX_ITEMS_PER_BLOCK, PAGE_HEADER_SIZE, PAGE_MAP_HEADER_SIZE,
};
use bytes::{BufMut, Bytes, BytesMut};
use mailstore_common::types::{read_u16, read_u32};
use mailstore_common::{HeapId, MailstoreError, Result};

/// Whether block `index` carries a bitmap header.
pub fn is_bitmap_block(index: usize) -> bool {
    index >= FIRST_BITMAP_BLOCK && (index - FIRST_BITMAP_BLOCK) % BITMAP_FILL_LEVELS == 0
}

/// Block holding the fill level of block `index`, and the slot within it.
pub fn fill_level_host(index: usize) -> (usize, usize) {
    if index < FIRST_BLOCK_FILL_LEVELS {
        (0, index)
    } else {
        let host = FIRST_BITMAP_BLOCK
            + (index - FIRST_BITMAP_BLOCK) / BITMAP_FILL_LEVELS * BITMAP_FILL_LEVELS;
        (host, index - host)
    }
}

/// Fill level for `available` free bytes. 0 is emptiest, 15 fullest.
pub fn fill_level(available: usize) -> u8 {
    FILL_LEVEL_THRESHOLDS
        .iter()
        .position(|&bound| available >= bound)
        .unwrap_or(FILL_LEVEL_THRESHOLDS.len()) as u8
}

fn pack_nibbles(levels: &[u8], buf: &mut BytesMut) {
    for pair in levels.chunks(2) {
        let low = pair[0] & 0x0F;
        let high = pair.get(1).copied().unwrap_or(0) & 0x0F;
        buf.put_u8(low | (high << 4));
    }
}

fn unpack_nibbles(bytes: &[u8], levels: &mut [u8]) {
    for (i, level) in levels.iter_mut().enumerate() {
        let byte = bytes[i / 2];
        *level = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
    }
}

/// Block-kind specific header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapBlockHeader {
    /// Block 0: heap-wide fields and fill levels of blocks 0-7.
    First {
        client_signature: u8,
        user_root: HeapId,
        fill_levels: [u8; FIRST_BLOCK_FILL_LEVELS],
    },
    /// Fill levels of this block and the 127 after it.
    Bitmap {
        fill_levels: [u8; BITMAP_FILL_LEVELS],
    },
    Page,
}

impl HeapBlockHeader {
    /// Fresh header for a new block at `index`.
    pub fn for_new_block(index: usize) -> Self {
        if is_bitmap_block(index) {
            HeapBlockHeader::Bitmap {
                fill_levels: [0; BITMAP_FILL_LEVELS],
            }
        } else {
            HeapBlockHeader::Page
        }
    }

    pub fn size(&self) -> usize {
        match self {
            HeapBlockHeader::First { .. } => FIRST_HEADER_SIZE,
            HeapBlockHeader::Bitmap { .. } => BITMAP_HEADER_SIZE,
            HeapBlockHeader::Page => PAGE_HEADER_SIZE,
        }
    }

    pub fn fill_levels_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            HeapBlockHeader::First { fill_levels, .. } => Some(fill_levels),
            HeapBlockHeader::Bitmap { fill_levels } => Some(fill_levels),
            HeapBlockHeader::Page => None,
        }
    }
}

/// One decoded heap block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapBlock {
    pub header: HeapBlockHeader,
    items: Vec<Bytes>,
}

impl HeapBlock {
    pub fn new(header: HeapBlockHeader) -> Self {
        Self {
            header,
            items: Vec::new(),
        }
    }

    /// Item slots, freed ones included.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn freed_count(&self) -> usize {
        self.items.iter().filter(|i| i.is_empty()).count()
    }

    /// Item by 1-based index.
    pub fn item(&self, item_index: u16) -> Option<&Bytes> {
        (item_index as usize)
            .checked_sub(1)
            .and_then(|i| self.items.get(i))
    }

    fn item_bytes(&self) -> usize {
        self.items.iter().map(|i| i.len()).sum()
    }

    fn layout_len(&self, item_bytes: usize, count: usize) -> usize {
        let items_end = self.header.size() + item_bytes;
        items_end.next_multiple_of(2) + PAGE_MAP_HEADER_SIZE + 2 * (count + 1)
    }

    /// Encoded size of the block as it stands.
    pub fn encoded_len(&self) -> usize {
        self.layout_len(self.item_bytes(), self.items.len())
    }

    /// Bytes a new item could use, after reserving its page map slot.
    pub fn available_space(&self) -> usize {
        HEAP_BLOCK_CAPACITY.saturating_sub(self.layout_len(self.item_bytes(), self.items.len() + 1))
    }

    /// Whether an item of `len` bytes can be appended.
    pub fn can_add(&self, len: usize) -> bool {
        self.items.len() < MAX_ITEMS_PER_BLOCK
            && self.layout_len(self.item_bytes() + len, self.items.len() + 1) <= HEAP_BLOCK_CAPACITY
    }

    /// Appends an item, returning its 1-based index.
    pub fn push_item(&mut self, block_index: u16, data: Bytes) -> Result<u16> {
        if !self.can_add(data.len()) {
            return Err(MailstoreError::HeapBlockFull {
                block_index,
                max: MAX_ITEMS_PER_BLOCK,
            });
        }
        self.items.push(data);
        Ok(self.items.len() as u16)
    }

    /// Whether item `item_index` can be resized to `len` bytes in place.
    pub fn can_replace(&self, item_index: u16, len: usize) -> bool {
        match self.item(item_index) {
            Some(old) => {
                let item_bytes = self.item_bytes() - old.len() + len;
                self.layout_len(item_bytes, self.items.len()) <= HEAP_BLOCK_CAPACITY
            }
            None => false,
        }
    }

    /// Replaces an item in place. Caller checks [`HeapBlock::can_replace`].
    pub fn replace_item(&mut self, item_index: u16, data: Bytes) {
        if let Some(slot) = (item_index as usize)
            .checked_sub(1)
            .and_then(|i| self.items.get_mut(i))
        {
            *slot = data;
        }
    }

    /// Frees an item, then trims trailing freed slots.
    pub fn free_item(&mut self, item_index: u16) {
        self.replace_item(item_index, Bytes::new());
        self.trim_freed();
    }

    /// Drops freed slots at the end of the item list. Earlier slots keep
    /// their place so later items keep their ids.
    pub fn trim_freed(&mut self) {
        while self.items.last().is_some_and(|i| i.is_empty()) {
            self.items.pop();
        }
    }

    pub fn encode(&self) -> Bytes {
        let header_size = self.header.size();
        let items_end = header_size + self.item_bytes();
        let page_map_offset = items_end.next_multiple_of(2);
        let mut buf = BytesMut::with_capacity(self.encoded_len());

        buf.put_u16_le(page_map_offset as u16);
        match &self.header {
            HeapBlockHeader::First {
                client_signature,
                user_root,
                fill_levels,
            } => {
                buf.put_u8(HEAP_SIGNATURE);
                buf.put_u8(*client_signature);
                buf.put_u32_le(user_root.0);
                pack_nibbles(fill_levels, &mut buf);
            }
            HeapBlockHeader::Bitmap { fill_levels } => pack_nibbles(fill_levels, &mut buf),
            HeapBlockHeader::Page => {}
        }

        for item in &self.items {
            buf.put_slice(item);
        }
        buf.put_bytes(0, page_map_offset - items_end);

        buf.put_u16_le(self.items.len() as u16);
        buf.put_u16_le(self.freed_count() as u16);
        let mut offset = header_size;
        buf.put_u16_le(offset as u16);
        for item in &self.items {
            offset += item.len();
            buf.put_u16_le(offset as u16);
        }
        buf.freeze()
    }

    /// Decodes the block stored at heap block `index`.
    pub fn decode(index: usize, buf: &[u8]) -> Result<Self> {
        let corrupt = |what: &str| {
            MailstoreError::corrupted(format!("heap block {}: {}", index, what))
        };
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(corrupt("too short"));
        }
        let header = if index == 0 {
            if buf.len() < FIRST_HEADER_SIZE || buf[2] != HEAP_SIGNATURE {
                return Err(corrupt("missing heap signature"));
            }
            let mut fill_levels = [0u8; FIRST_BLOCK_FILL_LEVELS];
            unpack_nibbles(&buf[8..12], &mut fill_levels);
            HeapBlockHeader::First {
                client_signature: buf[3],
                user_root: HeapId(read_u32(buf, 4)),
                fill_levels,
            }
        } else if is_bitmap_block(index) {
            if buf.len() < BITMAP_HEADER_SIZE {
                return Err(corrupt("truncated bitmap header"));
            }
            let mut fill_levels = [0u8; BITMAP_FILL_LEVELS];
            unpack_nibbles(&buf[2..BITMAP_HEADER_SIZE], &mut fill_levels);
            HeapBlockHeader::Bitmap { fill_levels }
        } else {
            HeapBlockHeader::Page
        };

        let header_size = header.size();
        let page_map = read_u16(buf, 0) as usize;
        if page_map < header_size || page_map + PAGE_MAP_HEADER_SIZE > buf.len() {
            return Err(corrupt("page map offset out of range"));
        }
        let count = read_u16(buf, page_map) as usize;
        let offsets_at = page_map + PAGE_MAP_HEADER_SIZE;
        if count > MAX_ITEMS_PER_BLOCK || offsets_at + 2 * (count + 1) > buf.len() {
            return Err(corrupt("page map overruns the block"));
        }
        let offsets: Vec<usize> = (0..=count)
            .map(|i| read_u16(buf, offsets_at + 2 * i) as usize)
            .collect();
        if offsets[0] < header_size
            || offsets[count] > page_map
            || offsets.windows(2).any(|w| w[0] > w[1])
        {
            return Err(corrupt("item offsets are not ordered inside the block"));
        }

        let items = offsets
            .windows(2)
            .map(|w| Bytes::copy_from_slice(&buf[w[0]..w[1]]))
            .collect();
        Ok(Self { header, items })
    }
}
