//! Mailstore common types, errors, and framing utilities.
//!
//! This crate provides shared definitions used across all mailstore components.

pub mod config;
pub mod error;
pub mod page;
pub mod types;

pub use config::StorageConfig;
pub use error::{MailstoreError, Result};
pub use page::{
    block_total_size, compute_crc, compute_signature, seal_block, seal_page, verify_block,
    verify_page, BlockTrailer, PageTrailer, PageType, MAX_BLOCK_DATA_SIZE, MAX_BLOCK_SIZE,
    PAGE_DATA_SIZE, PAGE_SIZE,
};
pub use types::{BlockId, BlockRef, HeapId, NodeId, NodeType};
