//! Error types for the mailstore engine.

use thiserror::Error;

/// Result type alias using MailstoreError.
pub type Result<T> = std::result::Result<T, MailstoreError>;

/// Errors that can occur in mailstore operations.
///
/// None of these are retried by the engine. Corruption variants mean the file
/// cannot serve the failed operation; caller-misuse variants leave the file
/// untouched.
#[derive(Debug, Error)]
pub enum MailstoreError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Checksum and signature corruption
    #[error("checksum mismatch at offset {offset:#x}: stored {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("signature mismatch at offset {offset:#x}: stored {expected:#06x}, computed {actual:#06x}")]
    SignatureMismatch {
        offset: u64,
        expected: u16,
        actual: u16,
    },

    #[error("page type mismatch at offset {offset:#x}: expected {expected:#04x}, found {actual:#04x}")]
    PageTypeMismatch { offset: u64, expected: u8, actual: u8 },

    // Identity corruption
    #[error("block id mismatch at offset {offset:#x}: index says {expected:#x}, trailer says {actual:#x}")]
    BlockIdMismatch {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    // Structural corruption
    #[error("corrupted structure: {context}")]
    Corrupted { context: String },

    #[error("heap item {heap_id:#010x} is invalid: {reason}")]
    HeapItemIndexInvalid { heap_id: u32, reason: String },

    #[error("subnode {node_id:#x} is missing")]
    SubnodeMissing { node_id: u32 },

    #[error("allocation map inconsistent at offset {offset:#x} (length {length})")]
    AllocationMapCorrupted { offset: u64, length: u64 },

    #[error("block {block_id:#x} not found in the block b-tree")]
    BlockNotFound { block_id: u64 },

    #[error("tree traversal exceeded depth {depth}")]
    TreeTooDeep { depth: usize },

    // Caller misuse
    #[error("heap item too large: {size} bytes (max {max})")]
    HeapItemTooLarge { size: usize, max: usize },

    #[error("block too large: {size} bytes (max {max})")]
    BlockTooLarge { size: usize, max: usize },

    #[error("heap block {block_index} already holds {max} items")]
    HeapBlockFull { block_index: u16, max: usize },

    #[error("data tree too large: {size} bytes (max {max})")]
    DataTreeTooLarge { size: u64, max: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("duplicate key {key:#x}")]
    DuplicateKey { key: u64 },

    #[error("key {key:#x} not found")]
    KeyNotFound { key: u64 },

    #[error("node {node_id:#x} not found")]
    NodeNotFound { node_id: u32 },

    #[error("node ids of type {type_tag:#04x} exhausted")]
    NodeIdsExhausted { type_tag: u8 },

    // Consistency preconditions
    #[error("allocation map is marked invalid; a previous commit did not complete")]
    AllocationMapInvalid,

    #[error("no commit in progress")]
    CommitNotStarted,

    // Format errors
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
}

impl MailstoreError {
    /// Builds a structural corruption error.
    pub fn corrupted(context: impl Into<String>) -> Self {
        Self::Corrupted {
            context: context.into(),
        }
    }

    /// Returns true if the error reports damaged on-disk state.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. }
                | Self::SignatureMismatch { .. }
                | Self::PageTypeMismatch { .. }
                | Self::BlockIdMismatch { .. }
                | Self::Corrupted { .. }
                | Self::HeapItemIndexInvalid { .. }
                | Self::SubnodeMissing { .. }
                | Self::AllocationMapCorrupted { .. }
                | Self::BlockNotFound { .. }
                | Self::TreeTooDeep { .. }
        )
    }

    /// Returns true if the engine refused a request without touching the file.
    pub fn is_caller_misuse(&self) -> bool {
        matches!(
            self,
            Self::HeapItemTooLarge { .. }
                | Self::BlockTooLarge { .. }
                | Self::HeapBlockFull { .. }
                | Self::DataTreeTooLarge { .. }
                | Self::InvalidArgument(_)
                | Self::DuplicateKey { .. }
                | Self::KeyNotFound { .. }
                | Self::NodeNotFound { .. }
                | Self::NodeIdsExhausted { .. }
        )
    }
}
