//! A node's byte stream over one data block or an index of data blocks.
//!
//! | data blocks        | root                                   |
//! |--------------------|----------------------------------------|
//! | 0                  | none                                   |
//! | 1                  | the data block                         |
//! | 2 ..= 1021         | one level-1 index block                |
//! | 1022 ..= 1021^2    | a level-2 index over level-1 blocks    |

use crate::block::{Block, MAX_INDEX_ENTRIES};
use crate::ndb::NodeDatabase;
use bytes::{Bytes, BytesMut};
use mailstore_common::{BlockId, MailstoreError, Result, MAX_BLOCK_DATA_SIZE};
use tracing::{debug, trace};

const MAX_INDEXED_SIZE: u64 =
    (MAX_INDEX_ENTRIES * MAX_INDEX_ENTRIES) as u64 * MAX_BLOCK_DATA_SIZE as u64;

/// Largest stream a data tree stores. Index blocks record the stream length
/// in 32 bits, which is below what two index levels can address.
pub const MAX_DATA_TREE_SIZE: u64 = if MAX_INDEXED_SIZE < u32::MAX as u64 {
    MAX_INDEXED_SIZE
} else {
    u32::MAX as u64
};

const MAX_DATA_BLOCKS: usize = MAX_INDEX_ENTRIES * MAX_INDEX_ENTRIES;

/// Signature byte at offset 2 of the first block of a heap-on-node.
const HEAP_SIGNATURE: u8 = 0xEC;

#[derive(Debug, Clone, Default)]
struct DataSlot {
    /// Committed or buffered id. `None` until first saved.
    id: Option<BlockId>,
    /// Loaded content.
    data: Option<Bytes>,
    dirty: bool,
}

/// Byte stream backed by data blocks.
///
/// Content is loaded block by block on demand. Changes are buffered until
/// [`DataTree::save_changes`], which pushes changed blocks through the block
/// store and rewrites the index blocks.
#[derive(Debug, Clone, Default)]
pub struct DataTree {
    root: BlockId,
    slots: Vec<DataSlot>,
    /// Index blocks of the saved shape, level-1 first, root last.
    index_blocks: Vec<BlockId>,
    total_size: u64,
    dirty: bool,
}

impl DataTree {
    /// An empty, unsaved stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the stream rooted at `root`. `BlockId::NONE` is an empty stream.
    pub fn open(db: &mut NodeDatabase, root: BlockId) -> Result<Self> {
        let mut tree = Self {
            root,
            ..Self::default()
        };
        if root.is_none() {
            return Ok(tree);
        }
        match db.get_block(root)? {
            Block::Data(data) => {
                tree.total_size = data.len() as u64;
                tree.slots.push(DataSlot {
                    id: Some(root),
                    data: Some(data),
                    dirty: false,
                });
            }
            Block::IndexL1 {
                total_size,
                children,
            } => {
                tree.push_data_children(root, &children)?;
                tree.index_blocks.push(root);
                tree.total_size = total_size as u64;
            }
            Block::IndexL2 {
                total_size,
                children,
            } => {
                let mut sum = 0u64;
                for child in children {
                    match db.get_block(child)? {
                        Block::IndexL1 {
                            total_size,
                            children,
                        } => {
                            tree.push_data_children(child, &children)?;
                            tree.index_blocks.push(child);
                            sum += total_size as u64;
                        }
                        _ => {
                            return Err(MailstoreError::corrupted(format!(
                                "index block {} points at {} which is not a level-1 index",
                                root, child
                            )))
                        }
                    }
                }
                if sum != total_size as u64 {
                    return Err(MailstoreError::corrupted(format!(
                        "index block {} declares {} bytes but its children hold {}",
                        root, total_size, sum
                    )));
                }
                tree.index_blocks.push(root);
                tree.total_size = sum;
            }
            Block::SubnodeLeaf(_) | Block::SubnodeIndex(_) => {
                return Err(MailstoreError::corrupted(format!(
                    "block {} is a subnode block, not a data tree",
                    root
                )))
            }
        }
        trace!(root = %root, blocks = tree.slots.len(), size = tree.total_size, "opened data tree");
        Ok(tree)
    }

    fn push_data_children(&mut self, parent: BlockId, children: &[BlockId]) -> Result<()> {
        for &child in children {
            if child.is_internal() {
                return Err(MailstoreError::corrupted(format!(
                    "level-1 index {} points at internal block {}",
                    parent, child
                )));
            }
            self.slots.push(DataSlot {
                id: Some(child),
                ..DataSlot::default()
            });
        }
        Ok(())
    }

    /// Root block id as of the last save or open.
    pub fn root(&self) -> BlockId {
        self.root
    }

    /// Stream length in bytes.
    pub fn len(&self) -> u64 {
        self.total_size
    }

    pub fn is_empty(&self) -> bool {
        self.total_size == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn data_block_count(&self) -> usize {
        self.slots.len()
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.slots.len() {
            return Err(MailstoreError::InvalidArgument(format!(
                "data block {} out of range, tree has {}",
                index,
                self.slots.len()
            )));
        }
        Ok(())
    }

    fn check_block_size(data: &[u8]) -> Result<()> {
        if data.len() > MAX_BLOCK_DATA_SIZE {
            return Err(MailstoreError::BlockTooLarge {
                size: data.len(),
                max: MAX_BLOCK_DATA_SIZE,
            });
        }
        Ok(())
    }

    fn check_growth(&self, new_size: u64, new_blocks: usize) -> Result<()> {
        if new_size > MAX_DATA_TREE_SIZE || new_blocks > MAX_DATA_BLOCKS {
            return Err(MailstoreError::DataTreeTooLarge {
                size: new_size,
                max: MAX_DATA_TREE_SIZE,
            });
        }
        Ok(())
    }

    /// Stream length as recorded in an index block.
    fn recorded_size(size: u64) -> Result<u32> {
        u32::try_from(size).map_err(|_| MailstoreError::DataTreeTooLarge {
            size,
            max: MAX_DATA_TREE_SIZE,
        })
    }

    /// Content of one data block.
    pub fn get_data_block(&mut self, db: &mut NodeDatabase, index: usize) -> Result<Bytes> {
        self.check_index(index)?;
        let slot = &mut self.slots[index];
        if let Some(data) = &slot.data {
            return Ok(data.clone());
        }
        let Some(id) = slot.id else {
            return Err(MailstoreError::corrupted("unsaved data block has no content"));
        };
        match db.get_block(id)? {
            Block::Data(data) => {
                slot.data = Some(data.clone());
                Ok(data)
            }
            _ => Err(MailstoreError::corrupted(format!(
                "data tree child {} is not a data block",
                id
            ))),
        }
    }

    /// Whole stream, checked against the size the index declares.
    pub fn get_data(&mut self, db: &mut NodeDatabase) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(self.total_size as usize);
        for index in 0..self.slots.len() {
            out.extend_from_slice(&self.get_data_block(db, index)?);
        }
        if out.len() as u64 != self.total_size {
            return Err(MailstoreError::corrupted(format!(
                "data tree {} declares {} bytes but holds {}",
                self.root,
                self.total_size,
                out.len()
            )));
        }
        Ok(out.freeze())
    }

    /// Replaces one data block's content.
    pub fn update_data_block(
        &mut self,
        db: &mut NodeDatabase,
        index: usize,
        data: Bytes,
    ) -> Result<()> {
        Self::check_block_size(&data)?;
        let old_len = self.get_data_block(db, index)?.len() as u64;
        let new_size = self.total_size - old_len + data.len() as u64;
        self.check_growth(new_size, self.slots.len())?;
        let slot = &mut self.slots[index];
        slot.data = Some(data);
        slot.dirty = true;
        self.total_size = new_size;
        self.dirty = true;
        Ok(())
    }

    /// Appends a data block, returning its index.
    pub fn add_data_block(&mut self, data: Bytes) -> Result<usize> {
        Self::check_block_size(&data)?;
        let new_size = self.total_size + data.len() as u64;
        self.check_growth(new_size, self.slots.len() + 1)?;
        self.total_size = new_size;
        self.slots.push(DataSlot {
            id: None,
            data: Some(data),
            dirty: true,
        });
        self.dirty = true;
        Ok(self.slots.len() - 1)
    }

    /// Appends bytes, filling the last block before adding new ones.
    /// Returns the new stream length.
    pub fn append_data(&mut self, db: &mut NodeDatabase, data: &[u8]) -> Result<u64> {
        let new_size = self.total_size + data.len() as u64;
        self.check_growth(new_size, 0)?;
        let mut rest = data;
        if let Some(last) = self.slots.len().checked_sub(1) {
            let current = self.get_data_block(db, last)?;
            let take = (MAX_BLOCK_DATA_SIZE - current.len()).min(rest.len());
            if take > 0 {
                let mut grown = BytesMut::with_capacity(current.len() + take);
                grown.extend_from_slice(&current);
                grown.extend_from_slice(&rest[..take]);
                self.update_data_block(db, last, grown.freeze())?;
                rest = &rest[take..];
            }
        }
        for chunk in rest.chunks(MAX_BLOCK_DATA_SIZE) {
            self.add_data_block(Bytes::copy_from_slice(chunk))?;
        }
        Ok(self.total_size)
    }

    /// Replaces the whole stream.
    pub fn set_data(&mut self, db: &mut NodeDatabase, data: &[u8]) -> Result<()> {
        let chunk_count = data.len().div_ceil(MAX_BLOCK_DATA_SIZE);
        self.check_growth(data.len() as u64, chunk_count)?;
        for slot in self.slots.drain(chunk_count.min(self.slots.len())..) {
            if let Some(id) = slot.id {
                db.delete_block(id);
            }
        }
        for (index, chunk) in data.chunks(MAX_BLOCK_DATA_SIZE).enumerate() {
            let chunk = Bytes::copy_from_slice(chunk);
            match self.slots.get_mut(index) {
                Some(slot) => {
                    slot.data = Some(chunk);
                    slot.dirty = true;
                }
                None => self.slots.push(DataSlot {
                    id: None,
                    data: Some(chunk),
                    dirty: true,
                }),
            }
        }
        self.total_size = data.len() as u64;
        self.dirty = true;
        Ok(())
    }

    /// Whether the first block carries a heap-on-node header.
    pub fn is_heap_on_node(&mut self, db: &mut NodeDatabase) -> Result<bool> {
        if self.slots.is_empty() {
            return Ok(false);
        }
        let first = self.get_data_block(db, 0)?;
        Ok(first.len() > 2 && first[2] == HEAP_SIGNATURE)
    }

    /// Pushes changed blocks to the block store, rewrites the index blocks
    /// and returns the new root.
    pub fn save_changes(&mut self, db: &mut NodeDatabase) -> Result<BlockId> {
        if !self.dirty {
            return Ok(self.root);
        }
        for slot in self.slots.iter_mut().filter(|s| s.dirty) {
            let block = Block::Data(slot.data.clone().unwrap_or_default());
            slot.id = Some(match slot.id {
                Some(id) => db.update_block(id, block)?,
                None => db.add_block(block)?,
            });
            slot.dirty = false;
        }

        for id in self.index_blocks.drain(..) {
            db.delete_block(id);
        }
        self.root = match self.slots.len() {
            0 => BlockId::NONE,
            1 => self.slot_ids()?[0],
            n if n <= MAX_INDEX_ENTRIES => {
                let children = self.slot_ids()?;
                let total_size = Self::recorded_size(self.total_size)?;
                let id = db.add_block(Block::IndexL1 {
                    total_size,
                    children,
                })?;
                self.index_blocks.push(id);
                id
            }
            _ => self.save_two_levels(db)?,
        };
        self.dirty = false;
        debug!(root = %self.root, blocks = self.slots.len(), size = self.total_size, "saved data tree");
        Ok(self.root)
    }

    fn slot_ids(&self) -> Result<Vec<BlockId>> {
        self.slots
            .iter()
            .map(|s| {
                s.id
                    .ok_or_else(|| MailstoreError::corrupted("data block saved without an id"))
            })
            .collect()
    }

    fn save_two_levels(&mut self, db: &mut NodeDatabase) -> Result<BlockId> {
        let ids = self.slot_ids()?;
        let mut level1 = Vec::with_capacity(ids.len().div_ceil(MAX_INDEX_ENTRIES));
        for (group, children) in ids.chunks(MAX_INDEX_ENTRIES).enumerate() {
            let start = group * MAX_INDEX_ENTRIES;
            let mut total_size = 0u64;
            for index in start..start + children.len() {
                total_size += self.get_data_block(db, index)?.len() as u64;
            }
            let id = db.add_block(Block::IndexL1 {
                total_size: Self::recorded_size(total_size)?,
                children: children.to_vec(),
            })?;
            self.index_blocks.push(id);
            level1.push(id);
        }
        let root = db.add_block(Block::IndexL2 {
            total_size: Self::recorded_size(self.total_size)?,
            children: level1,
        })?;
        self.index_blocks.push(root);
        Ok(root)
    }

    /// Releases every block of the tree and leaves it empty.
    pub fn delete(&mut self, db: &mut NodeDatabase) {
        for slot in self.slots.drain(..) {
            if let Some(id) = slot.id {
                db.delete_block(id);
            }
        }
        for id in self.index_blocks.drain(..) {
            db.delete_block(id);
        }
        trace!(root = %self.root, "deleted data tree");
        self.root = BlockId::NONE;
        self.total_size = 0;
        self.dirty = false;
    }
}
