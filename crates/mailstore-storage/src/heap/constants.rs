//! Heap-on-node layout constants.

use mailstore_common::MAX_BLOCK_DATA_SIZE;

/// Signature byte of the first heap block header.
pub const HEAP_SIGNATURE: u8 = 0xEC;

/// Largest item a heap stores.
pub const MAX_HEAP_ITEM_SIZE: usize = 3580;

/// Most items one heap block may address.
pub const MAX_ITEMS_PER_BLOCK: usize = 2047;

/// Bytes available to one heap block.
pub const HEAP_BLOCK_CAPACITY: usize = MAX_BLOCK_DATA_SIZE;

/// First block header: page map offset, signature, client signature,
/// user root, 8 fill-level nibbles.
pub const FIRST_HEADER_SIZE: usize = 12;

/// Plain block header: page map offset.
pub const PAGE_HEADER_SIZE: usize = 2;

/// Bitmap block header: page map offset, 128 fill-level nibbles.
pub const BITMAP_HEADER_SIZE: usize = 66;

/// Blocks whose fill levels live in the first block.
pub const FIRST_BLOCK_FILL_LEVELS: usize = 8;

/// Blocks covered by one bitmap block, the bitmap block included.
pub const BITMAP_FILL_LEVELS: usize = 128;

/// Index of the first bitmap block.
pub const FIRST_BITMAP_BLOCK: usize = 8;

/// Page map fixed part: allocation count and free count.
pub const PAGE_MAP_HEADER_SIZE: usize = 4;

/// Lower bounds of available space for fill levels 0 through 14. Anything
/// below the last bound is level 15.
pub const FILL_LEVEL_THRESHOLDS: [usize; 15] = [
    3584, 2560, 2048, 1792, 1536, 1280, 1024, 768, 512, 256, 128, 64, 32, 16, 8,
];
