//! Heap-on-node: small items packed into a node's data blocks.

use super::block::{fill_level, fill_level_host, HeapBlock, HeapBlockHeader};
use super::constants::{FIRST_BLOCK_FILL_LEVELS, MAX_HEAP_ITEM_SIZE};
use crate::data_tree::DataTree;
use crate::ndb::NodeDatabase;
use bytes::Bytes;
use mailstore_common::{BlockId, HeapId, MailstoreError, Result};
use std::collections::BTreeSet;
use tracing::{debug, trace};

/// What the heap's client builds on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientSignature {
    Reserved1 = 0x6C,
    TableContext = 0x7C,
    Reserved2 = 0x8C,
    BTreeOnHeap = 0xB5,
    PropertyContext = 0xBC,
}

impl TryFrom<u8> for ClientSignature {
    type Error = MailstoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x6C => Ok(ClientSignature::Reserved1),
            0x7C => Ok(ClientSignature::TableContext),
            0x8C => Ok(ClientSignature::Reserved2),
            0xB5 => Ok(ClientSignature::BTreeOnHeap),
            0xBC => Ok(ClientSignature::PropertyContext),
            other => Err(MailstoreError::corrupted(format!(
                "unknown heap client signature {:#04x}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct BlockSlot {
    block: Option<HeapBlock>,
    dirty: bool,
}

/// Heap over a data tree. Block `i` of the heap is data block `i`.
///
/// Blocks are decoded on first use. Changes stay in memory until
/// [`HeapOnNode::flush_to_data_tree`].
#[derive(Debug, Clone)]
pub struct HeapOnNode {
    data: DataTree,
    slots: Vec<BlockSlot>,
}

impl HeapOnNode {
    /// A new heap with an empty first block.
    pub fn create(client: ClientSignature) -> Self {
        let first = HeapBlock::new(HeapBlockHeader::First {
            client_signature: client as u8,
            user_root: HeapId::EMPTY,
            fill_levels: [0; FIRST_BLOCK_FILL_LEVELS],
        });
        Self {
            data: DataTree::new(),
            slots: vec![BlockSlot {
                block: Some(first),
                dirty: true,
            }],
        }
    }

    /// Opens the heap stored in `data`.
    pub fn open(db: &mut NodeDatabase, data: DataTree) -> Result<Self> {
        if data.data_block_count() == 0 {
            return Err(MailstoreError::corrupted(format!(
                "data tree {} holds no heap blocks",
                data.root()
            )));
        }
        let mut heap = Self {
            slots: vec![BlockSlot::default(); data.data_block_count()],
            data,
        };
        heap.load(db, 0)?;
        trace!(root = %heap.data.root(), blocks = heap.slots.len(), "opened heap");
        Ok(heap)
    }

    pub fn block_count(&self) -> usize {
        self.slots.len()
    }

    pub fn data_tree(&self) -> &DataTree {
        &self.data
    }

    pub fn into_data_tree(self) -> DataTree {
        self.data
    }

    fn first_header(&self) -> Option<&HeapBlockHeader> {
        self.slots
            .first()
            .and_then(|s| s.block.as_ref())
            .map(|b| &b.header)
    }

    pub fn client_type(&self) -> Result<ClientSignature> {
        match self.first_header() {
            Some(HeapBlockHeader::First {
                client_signature, ..
            }) => ClientSignature::try_from(*client_signature),
            _ => Err(MailstoreError::corrupted("heap has no first block")),
        }
    }

    pub fn user_root(&self) -> HeapId {
        match self.first_header() {
            Some(HeapBlockHeader::First { user_root, .. }) => *user_root,
            _ => HeapId::EMPTY,
        }
    }

    pub fn set_user_root(&mut self, root: HeapId) {
        if let Some(slot) = self.slots.first_mut() {
            if let Some(HeapBlockHeader::First { user_root, .. }) =
                slot.block.as_mut().map(|b| &mut b.header)
            {
                *user_root = root;
                slot.dirty = true;
            }
        }
    }

    fn load(&mut self, db: &mut NodeDatabase, index: usize) -> Result<&mut HeapBlock> {
        let slot = &mut self.slots[index];
        if slot.block.is_none() {
            let bytes = self.data.get_data_block(db, index)?;
            slot.block = Some(HeapBlock::decode(index, &bytes)?);
        }
        slot.block
            .as_mut()
            .ok_or_else(|| MailstoreError::corrupted(format!("heap block {} not loaded", index)))
    }

    /// Checks the parts of an id that do not need the block loaded.
    fn locate(&self, id: HeapId) -> Result<(usize, u16)> {
        let invalid = |reason: &str| MailstoreError::HeapItemIndexInvalid {
            heap_id: id.0,
            reason: reason.to_string(),
        };
        if id.type_tag() != 0 {
            return Err(invalid("not a heap id"));
        }
        let block = id.block_index() as usize;
        if block >= self.slots.len() {
            return Err(invalid("block index out of range"));
        }
        let item = id.item_index();
        if item == 0 {
            return Err(invalid("item index is zero"));
        }
        Ok((block, item))
    }

    fn item_out_of_range(id: HeapId, count: usize) -> MailstoreError {
        MailstoreError::HeapItemIndexInvalid {
            heap_id: id.0,
            reason: format!("item index beyond the {} items of its block", count),
        }
    }

    /// Reads an item. The empty id reads as no bytes.
    pub fn get_heap_item(&mut self, db: &mut NodeDatabase, id: HeapId) -> Result<Bytes> {
        if id.is_empty() {
            return Ok(Bytes::new());
        }
        let (block, item) = self.locate(id)?;
        let heap_block = self.load(db, block)?;
        heap_block
            .item(item)
            .cloned()
            .ok_or_else(|| Self::item_out_of_range(id, heap_block.item_count()))
    }

    /// Stores an item in the first block with room, or in a new block.
    pub fn add_item_to_heap(&mut self, db: &mut NodeDatabase, data: &[u8]) -> Result<HeapId> {
        if data.is_empty() {
            return Ok(HeapId::EMPTY);
        }
        if data.len() > MAX_HEAP_ITEM_SIZE {
            return Err(MailstoreError::HeapItemTooLarge {
                size: data.len(),
                max: MAX_HEAP_ITEM_SIZE,
            });
        }
        let payload = Bytes::copy_from_slice(data);
        for index in 0..self.slots.len() {
            let block = self.load(db, index)?;
            if block.can_add(payload.len()) {
                let item = block.push_item(index as u16, payload)?;
                self.slots[index].dirty = true;
                return Ok(HeapId::new(index as u16, item));
            }
        }

        let index = self.slots.len();
        if index > u16::MAX as usize {
            return Err(MailstoreError::InvalidArgument(format!(
                "heap already has {} blocks",
                index
            )));
        }
        let mut block = HeapBlock::new(HeapBlockHeader::for_new_block(index));
        let item = block.push_item(index as u16, payload)?;
        self.slots.push(BlockSlot {
            block: Some(block),
            dirty: true,
        });
        debug!(block = index, "heap grew a block");
        Ok(HeapId::new(index as u16, item))
    }

    /// Replaces an item, in place when the block has room. The returned id
    /// may differ from `id`.
    pub fn replace_heap_item(
        &mut self,
        db: &mut NodeDatabase,
        id: HeapId,
        data: &[u8],
    ) -> Result<HeapId> {
        if data.len() > MAX_HEAP_ITEM_SIZE {
            return Err(MailstoreError::HeapItemTooLarge {
                size: data.len(),
                max: MAX_HEAP_ITEM_SIZE,
            });
        }
        if id.is_empty() {
            return self.add_item_to_heap(db, data);
        }
        if data.is_empty() {
            self.remove_item_from_heap(db, id)?;
            return Ok(HeapId::EMPTY);
        }
        let (block, item) = self.locate(id)?;
        let heap_block = self.load(db, block)?;
        if heap_block.item(item).is_none() {
            return Err(Self::item_out_of_range(id, heap_block.item_count()));
        }
        if heap_block.can_replace(item, data.len()) {
            heap_block.replace_item(item, Bytes::copy_from_slice(data));
            self.slots[block].dirty = true;
            return Ok(id);
        }
        self.remove_item_from_heap(db, id)?;
        let moved = self.add_item_to_heap(db, data)?;
        trace!(from = %id, to = %moved, "relocated heap item");
        Ok(moved)
    }

    /// Frees an item. Other items keep their ids.
    pub fn remove_item_from_heap(&mut self, db: &mut NodeDatabase, id: HeapId) -> Result<()> {
        if id.is_empty() {
            return Ok(());
        }
        let (block, item) = self.locate(id)?;
        let heap_block = self.load(db, block)?;
        if heap_block.item(item).is_none() {
            return Err(Self::item_out_of_range(id, heap_block.item_count()));
        }
        heap_block.free_item(item);
        self.slots[block].dirty = true;
        Ok(())
    }

    /// Refreshes fill levels of changed blocks and writes changed blocks
    /// into the data tree.
    pub fn flush_to_data_tree(&mut self, db: &mut NodeDatabase) -> Result<()> {
        let dirty: Vec<usize> = (0..self.slots.len())
            .filter(|&i| self.slots[i].dirty)
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }

        let mut hosts = BTreeSet::new();
        for &index in &dirty {
            let level = match &self.slots[index].block {
                Some(block) => fill_level(block.available_space()),
                None => continue,
            };
            let (host, position) = fill_level_host(index);
            let host_block = self.load(db, host)?;
            if let Some(levels) = host_block.header.fill_levels_mut() {
                if levels[position] != level {
                    levels[position] = level;
                    hosts.insert(host);
                }
            }
        }
        for host in hosts {
            self.slots[host].dirty = true;
        }

        let existing = self.data.data_block_count();
        let mut written = 0usize;
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if !slot.dirty {
                continue;
            }
            let Some(block) = &slot.block else {
                continue;
            };
            let bytes = block.encode();
            if index < existing {
                self.data.update_data_block(db, index, bytes)?;
            } else {
                self.data.add_data_block(bytes)?;
            }
            self.slots[index].dirty = false;
            written += 1;
        }
        debug!(blocks = written, total = self.slots.len(), "flushed heap");
        Ok(())
    }

    /// Flushes and saves the data tree, returning its root.
    pub fn save_changes(&mut self, db: &mut NodeDatabase) -> Result<BlockId> {
        self.flush_to_data_tree(db)?;
        self.data.save_changes(db)
    }
}
