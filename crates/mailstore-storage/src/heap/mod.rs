//! Heap-on-node storage.
//!
//! This module packs small variable-length items into a node's data blocks:
//! - HeapBlock: one block's header, items and page map
//! - HeapOnNode: item addressing by HeapId, allocation across blocks, and
//!   fill-level bookkeeping

pub mod constants;
mod block;
mod on_node;

pub use block::{fill_level, fill_level_host, is_bitmap_block, HeapBlock, HeapBlockHeader};
pub use on_node::{ClientSignature, HeapOnNode};
