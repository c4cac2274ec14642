//! Storage engine for the mailstore file format.
//!
//! This crate provides:
//! - Byte devices for positioned file and in-memory I/O
//! - The file header and allocation map
//! - A block store with buffered, copy-on-write commits
//! - Block and node b-trees
//! - Data trees for node payloads and subnode trees for nested nodes
//! - Heap-on-node storage for small items
//!
//! Everything hangs off a [`NodeDatabase`], which owns one open file and
//! writes buffered changes through a begin / write / end commit sequence.

mod amap;
mod block;
mod btree;
mod data_tree;
mod device;
mod header;
mod heap;
mod ndb;
mod node;
mod store;
mod subnode;

pub use amap::{AMapPage, AllocationMap, AMAP_FIRST_OFFSET, BYTES_PER_UNIT, REGION_SIZE};
pub use block::{
    Block, SubnodeIndexEntry, SubnodeLeafEntry, MAX_INDEX_ENTRIES, MAX_SUBNODE_INDEX_ENTRIES,
    MAX_SUBNODE_LEAF_ENTRIES,
};
pub use btree::{
    BTreeChild, BTreeEntry, BTreeNode, BbtEntry, BlockBTree, NbtEntry, NodeBTree, PageBTree,
    ENTRIES_SIZE, INTERMEDIATE_ENTRY_SIZE, MAX_INTERMEDIATE_ENTRIES,
};
pub use data_tree::{DataTree, MAX_DATA_TREE_SIZE};
pub use device::{ByteDevice, FileDevice, MemoryDevice};
pub use header::{Header, Root, AMAP_INVALID, AMAP_VALID, HEADER_MAGIC, HEADER_SIZE};
pub use heap::constants::{MAX_HEAP_ITEM_SIZE, MAX_ITEMS_PER_BLOCK};
pub use heap::{
    fill_level, fill_level_host, is_bitmap_block, ClientSignature, HeapBlock, HeapBlockHeader,
    HeapOnNode,
};
pub use ndb::NodeDatabase;
pub use node::Node;
pub use subnode::SubnodeTree;
