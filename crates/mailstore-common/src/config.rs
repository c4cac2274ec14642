//! Configuration for a mailstore session.

use crate::page::{MAX_BLOCK_SIZE, PAGE_SIZE};
use serde::{Deserialize, Serialize};

/// Storage configuration for one open file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Sync the device at each commit boundary.
    pub fsync_enabled: bool,
    /// Clean decoded blocks retained by the block store.
    pub block_cache_blocks: usize,
    /// Clean pages retained per b-tree.
    pub page_cache_pages: usize,
    /// Maximum b-tree or data-tree depth before a traversal is treated as corrupt.
    pub max_tree_depth: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            fsync_enabled: true,
            block_cache_blocks: 1024,
            page_cache_pages: 256,
            max_tree_depth: 8,
        }
    }
}

impl StorageConfig {
    /// Upper bound on memory held by both caches, in bytes.
    pub fn cache_size_bytes(&self) -> usize {
        self.block_cache_blocks * MAX_BLOCK_SIZE + 2 * self.page_cache_pages * PAGE_SIZE
    }
}
