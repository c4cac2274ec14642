//! B-tree page codec.

use super::constants::{
    COUNT_OFFSET, ENTRY_SIZE_OFFSET, INTERMEDIATE_ENTRY_SIZE, LEVEL_OFFSET, MAX_COUNT_OFFSET,
    MAX_INTERMEDIATE_ENTRIES, MAX_LEVEL,
};
use super::types::{BTreeChild, BTreeEntry};
use mailstore_common::types::read_u64;
use mailstore_common::{
    seal_page, verify_page, BlockId, BlockRef, MailstoreError, Result, PAGE_SIZE,
};

/// One decoded b-tree page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BTreeNode<E> {
    Leaf(Vec<E>),
    Intermediate {
        level: u8,
        children: Vec<BTreeChild>,
    },
}

impl<E: BTreeEntry> BTreeNode<E> {
    pub fn empty_leaf() -> Self {
        BTreeNode::Leaf(Vec::new())
    }

    pub fn level(&self) -> u8 {
        match self {
            BTreeNode::Leaf(_) => 0,
            BTreeNode::Intermediate { level, .. } => *level,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BTreeNode::Leaf(entries) => entries.len(),
            BTreeNode::Intermediate { children, .. } => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest key held by the page.
    pub fn first_key(&self) -> Option<u64> {
        match self {
            BTreeNode::Leaf(entries) => entries.first().map(|e| e.key()),
            BTreeNode::Intermediate { children, .. } => children.first().map(|c| c.key),
        }
    }

    pub fn max_entries(&self) -> usize {
        match self {
            BTreeNode::Leaf(_) => E::MAX_ENTRIES,
            BTreeNode::Intermediate { .. } => MAX_INTERMEDIATE_ENTRIES,
        }
    }

    pub fn is_overfull(&self) -> bool {
        self.len() > self.max_entries()
    }

    /// Moves the upper half of the records into a new sibling page.
    pub fn split(&mut self) -> Self {
        match self {
            BTreeNode::Leaf(entries) => {
                let mid = entries.len() / 2;
                BTreeNode::Leaf(entries.split_off(mid))
            }
            BTreeNode::Intermediate { level, children } => {
                let mid = children.len() / 2;
                BTreeNode::Intermediate {
                    level: *level,
                    children: children.split_off(mid),
                }
            }
        }
    }

    /// Encodes and seals the page for `offset`.
    pub fn encode(&self, page_id: BlockId, offset: u64) -> [u8; PAGE_SIZE] {
        let mut buf = [0u8; PAGE_SIZE];
        let (count, max, entry_size) = match self {
            BTreeNode::Leaf(entries) => {
                for (i, entry) in entries.iter().enumerate() {
                    entry.write_to(&mut buf[i * E::SIZE..(i + 1) * E::SIZE]);
                }
                (entries.len(), E::MAX_ENTRIES, E::SIZE)
            }
            BTreeNode::Intermediate { children, .. } => {
                for (i, child) in children.iter().enumerate() {
                    let at = i * INTERMEDIATE_ENTRY_SIZE;
                    buf[at..at + 8].copy_from_slice(&child.key.to_le_bytes());
                    buf[at + 8..at + 24].copy_from_slice(&child.page.to_bytes());
                }
                (children.len(), MAX_INTERMEDIATE_ENTRIES, INTERMEDIATE_ENTRY_SIZE)
            }
        };
        buf[COUNT_OFFSET] = count as u8;
        buf[MAX_COUNT_OFFSET] = max as u8;
        buf[ENTRY_SIZE_OFFSET] = entry_size as u8;
        buf[LEVEL_OFFSET] = self.level();
        seal_page(&mut buf, E::PAGE_TYPE, page_id, offset);
        buf
    }

    /// Verifies and decodes the page that `page` points at.
    pub fn decode(buf: &[u8], page: BlockRef) -> Result<Self> {
        let trailer = verify_page(buf, E::PAGE_TYPE, page.offset)?;
        if trailer.block_id != page.block_id {
            return Err(MailstoreError::BlockIdMismatch {
                offset: page.offset,
                expected: page.block_id.as_u64(),
                actual: trailer.block_id.as_u64(),
            });
        }

        let count = buf[COUNT_OFFSET] as usize;
        let entry_size = buf[ENTRY_SIZE_OFFSET] as usize;
        let level = buf[LEVEL_OFFSET];
        let (expected_size, max) = if level == 0 {
            (E::SIZE, E::MAX_ENTRIES)
        } else {
            (INTERMEDIATE_ENTRY_SIZE, MAX_INTERMEDIATE_ENTRIES)
        };
        if level > MAX_LEVEL || entry_size != expected_size || count > max {
            return Err(MailstoreError::corrupted(format!(
                "page {} at {:#x}: level {} with {} entries of {} bytes",
                page.block_id, page.offset, level, count, entry_size
            )));
        }

        let node = if level == 0 {
            BTreeNode::Leaf(
                (0..count)
                    .map(|i| E::read_from(&buf[i * E::SIZE..(i + 1) * E::SIZE]))
                    .collect(),
            )
        } else {
            let mut children = Vec::with_capacity(count);
            for i in 0..count {
                let at = i * INTERMEDIATE_ENTRY_SIZE;
                children.push(BTreeChild {
                    key: read_u64(buf, at),
                    page: BlockRef::from_bytes(&buf[at + 8..at + 24])?,
                });
            }
            BTreeNode::Intermediate { level, children }
        };
        node.check_sorted(page)?;
        Ok(node)
    }

    fn check_sorted(&self, page: BlockRef) -> Result<()> {
        let sorted = match self {
            BTreeNode::Leaf(entries) => entries.windows(2).all(|w| w[0].key() < w[1].key()),
            BTreeNode::Intermediate { children, .. } => {
                children.windows(2).all(|w| w[0].key < w[1].key)
            }
        };
        if sorted {
            Ok(())
        } else {
            Err(MailstoreError::corrupted(format!(
                "page {} at {:#x} has unsorted keys",
                page.block_id, page.offset
            )))
        }
    }
}
