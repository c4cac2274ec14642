//! B-tree page constants.

/// Bytes of a page available for entries.
pub const ENTRIES_SIZE: usize = 488;

/// Offset of the entry count byte.
pub(crate) const COUNT_OFFSET: usize = 488;

/// Offset of the maximum entry count byte.
pub(crate) const MAX_COUNT_OFFSET: usize = 489;

/// Offset of the entry size byte.
pub(crate) const ENTRY_SIZE_OFFSET: usize = 490;

/// Offset of the level byte. Leaves are level 0.
pub(crate) const LEVEL_OFFSET: usize = 491;

/// Size of an intermediate entry: key + block reference.
pub const INTERMEDIATE_ENTRY_SIZE: usize = 24;

/// Maximum entries in an intermediate page.
pub const MAX_INTERMEDIATE_ENTRIES: usize = ENTRIES_SIZE / INTERMEDIATE_ENTRY_SIZE;

/// Largest level a page may declare.
pub(crate) const MAX_LEVEL: u8 = 8;
