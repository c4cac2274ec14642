//! Buffered block store.
//!
//! Blocks are never rewritten at their committed address. An update of a
//! committed block gets a fresh id and queues the old one for a deferred
//! free; the write and the free both happen in [`BlockStore::save_block_changes`]
//! and the old space is reclaimed only after the trees that referenced it
//! have been rewritten.

use crate::amap::AllocationMap;
use crate::block::Block;
use crate::btree::{BTreeEntry, BbtEntry, BlockBTree};
use crate::device::ByteDevice;
use crate::header::Header;
use mailstore_buffer::{BlockCache, CacheStats};
use mailstore_common::{
    block_total_size, seal_block, verify_block, BlockId, BlockRef, MailstoreError, Result,
    StorageConfig, MAX_BLOCK_DATA_SIZE, PAGE_SIZE,
};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// Reference count given to a newly written block.
const NEW_BLOCK_REF_COUNT: u16 = 2;

/// Reference count at which a block has no remaining holders.
const LAST_HOLDER_REF_COUNT: u16 = 1;

/// Owns the device, the header counters, the allocation map and the block
/// b-tree for one session.
pub struct BlockStore {
    pub(crate) device: Box<dyn ByteDevice>,
    pub(crate) header: Header,
    pub(crate) amap: AllocationMap,
    pub(crate) bbt: BlockBTree,
    cache: BlockCache<Block>,
    /// Blocks to write at the next save, by their new id.
    pending_writes: BTreeMap<BlockId, Block>,
    /// Committed blocks whose reference count drops at the next save.
    pending_frees: Vec<BlockId>,
    /// File ranges to hand back to the allocation map once every tree that
    /// could reference them has been rewritten.
    deferred_releases: Vec<(u64, u64)>,
}

impl BlockStore {
    pub(crate) fn new(
        device: Box<dyn ByteDevice>,
        header: Header,
        amap: AllocationMap,
        bbt: BlockBTree,
        config: &StorageConfig,
    ) -> Self {
        Self {
            device,
            header,
            amap,
            bbt,
            cache: BlockCache::new(config.block_cache_blocks),
            pending_writes: BTreeMap::new(),
            pending_frees: Vec::new(),
            deferred_releases: Vec::new(),
        }
    }

    /// Returns an owned copy of a block.
    ///
    /// Blocks pending a write are served from the buffer. Committed blocks
    /// are located through the block b-tree and validated on first read.
    pub fn get_block(&mut self, block_id: BlockId) -> Result<Block> {
        if let Some(block) = self.pending_writes.get(&block_id) {
            return Ok(block.clone());
        }
        if let Some(block) = self.cache.get(block_id) {
            return Ok(block);
        }
        let entry = self
            .bbt
            .find(self.device.as_ref(), block_id.masked())?
            .ok_or(MailstoreError::BlockNotFound {
                block_id: block_id.as_u64(),
            })?;
        let block = self.read_block(block_id, &entry)?;
        self.cache.insert(block_id, block.clone());
        Ok(block)
    }

    fn read_block(&self, block_id: BlockId, entry: &BbtEntry) -> Result<Block> {
        let BlockRef { block_id: stored_id, offset } = entry.block;
        let mut buf = vec![0u8; block_total_size(entry.size as usize)];
        self.device.read_exact_at(offset, &mut buf)?;
        let payload = verify_block(&buf, stored_id, offset).inspect_err(|err| {
            warn!(block_id = %block_id, offset, error = %err, "block failed validation");
        })?;
        if payload.len() != entry.size as usize {
            return Err(MailstoreError::corrupted(format!(
                "block {} at {:#x} holds {} bytes, index says {}",
                block_id,
                offset,
                payload.len(),
                entry.size
            )));
        }
        trace!(block_id = %block_id, offset, size = entry.size, "read block");
        Block::decode(stored_id, payload)
    }

    fn check_size(block: &Block) -> Result<()> {
        let size = block.encoded_len();
        if size > MAX_BLOCK_DATA_SIZE {
            return Err(MailstoreError::BlockTooLarge {
                size,
                max: MAX_BLOCK_DATA_SIZE,
            });
        }
        Ok(())
    }

    /// Buffers a new block under a fresh id.
    pub fn add_block(&mut self, block: Block) -> Result<BlockId> {
        Self::check_size(&block)?;
        let block_id = self.header.allocate_next_block_id(block.is_internal());
        trace!(block_id = %block_id, size = block.encoded_len(), "buffered new block");
        self.pending_writes.insert(block_id, block);
        Ok(block_id)
    }

    /// Replaces the content of a block, returning the id that now holds it.
    ///
    /// A block added during this session is replaced in the buffer and keeps
    /// its id. A committed block is queued for a deferred free and the
    /// content gets a fresh id with the same internal flag.
    pub fn update_block(&mut self, block_id: BlockId, block: Block) -> Result<BlockId> {
        Self::check_size(&block)?;
        if let Some(slot) = self.pending_writes.get_mut(&block_id) {
            *slot = block;
            return Ok(block_id);
        }
        self.cache.remove(block_id);
        self.pending_frees.push(block_id);
        let new_id = self.header.allocate_next_block_id(block_id.is_internal());
        trace!(old = %block_id, new = %new_id, "copy-on-write block update");
        self.pending_writes.insert(new_id, block);
        Ok(new_id)
    }

    /// Drops one holder of a block.
    pub fn delete_block(&mut self, block_id: BlockId) {
        self.cache.remove(block_id);
        if self.pending_writes.remove(&block_id).is_none() {
            self.pending_frees.push(block_id);
        }
    }

    /// Records an extra holder of a committed block.
    pub fn add_block_reference(&mut self, block_id: BlockId) -> Result<()> {
        if self.pending_writes.contains_key(&block_id) {
            return Err(MailstoreError::InvalidArgument(format!(
                "block {} has not been saved yet",
                block_id
            )));
        }
        let device = self.device.as_ref();
        let mut entry = self
            .bbt
            .find(device, block_id.masked())?
            .ok_or(MailstoreError::BlockNotFound {
                block_id: block_id.as_u64(),
            })?;
        entry.ref_count = entry.ref_count.checked_add(1).ok_or_else(|| {
            MailstoreError::InvalidArgument(format!("block {} has too many references", block_id))
        })?;
        self.bbt.update(device, &mut self.header, entry)?;
        Ok(())
    }

    /// Current reference count of a committed block.
    pub fn block_ref_count(&mut self, block_id: BlockId) -> Result<Option<u16>> {
        Ok(self
            .bbt
            .find(self.device.as_ref(), block_id.masked())?
            .map(|e| e.ref_count))
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending_writes.is_empty() || !self.pending_frees.is_empty()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Writes buffered blocks to new space and applies buffered frees to the
    /// block b-tree. Space of blocks that lost their last holder is queued
    /// for [`BlockStore::release_deferred_space`].
    pub(crate) fn save_block_changes(&mut self) -> Result<()> {
        for block in self.pending_writes.values() {
            Self::check_size(block)?;
        }

        let writes = std::mem::take(&mut self.pending_writes);
        let written = writes.len();
        for (block_id, block) in writes {
            let payload = block.encode();
            let offset = self.amap.allocate(block_total_size(payload.len()) as u64, false)?;
            let sealed = seal_block(&payload, block_id, offset)?;
            self.device.write_all_at(offset, &sealed)?;
            trace!(block_id = %block_id, offset, size = payload.len(), "wrote block");
            self.bbt.upsert(
                self.device.as_ref(),
                &mut self.header,
                BbtEntry {
                    block: BlockRef::new(block_id, offset),
                    size: payload.len() as u16,
                    ref_count: NEW_BLOCK_REF_COUNT,
                },
            )?;
            self.cache.insert(block_id, block);
        }

        let frees = std::mem::take(&mut self.pending_frees);
        let freed = frees.len();
        for block_id in frees {
            let device = self.device.as_ref();
            let mut entry = self.bbt.find(device, block_id.masked())?.ok_or(
                MailstoreError::BlockNotFound {
                    block_id: block_id.as_u64(),
                },
            )?;
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count <= LAST_HOLDER_REF_COUNT {
                self.bbt.delete(device, &mut self.header, entry.key())?;
                self.cache.remove(block_id);
                self.deferred_releases
                    .push((entry.block.offset, block_total_size(entry.size as usize) as u64));
                trace!(block_id = %block_id, offset = entry.block.offset, "block has no holders");
            } else {
                self.bbt.update(device, &mut self.header, entry)?;
            }
        }
        debug!(written, freed, "saved block changes");
        Ok(())
    }

    /// Writes the block b-tree. Its superseded pages join the deferred releases.
    pub(crate) fn flush_block_btree(&mut self) -> Result<()> {
        let released = self.bbt.flush(self.device.as_ref(), &mut self.amap)?;
        self.defer_page_release(released);
        Ok(())
    }

    pub(crate) fn defer_page_release(&mut self, pages: Vec<BlockRef>) {
        self.deferred_releases
            .extend(pages.into_iter().map(|p| (p.offset, PAGE_SIZE as u64)));
    }

    /// Returns deferred ranges to the allocation map.
    pub(crate) fn release_deferred_space(&mut self) -> Result<()> {
        let count = self.deferred_releases.len();
        for (offset, len) in std::mem::take(&mut self.deferred_releases) {
            self.amap.release(offset, len)?;
        }
        if count > 0 {
            debug!(ranges = count, "reclaimed space");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use bytes::Bytes;

    fn store(device: &MemoryDevice) -> BlockStore {
        let mut header = Header::new();
        let bbt = BlockBTree::create(&mut header, 16, 8);
        BlockStore::new(
            Box::new(device.clone()),
            header,
            AllocationMap::new(),
            bbt,
            &StorageConfig::default(),
        )
    }

    fn commit(store: &mut BlockStore) {
        store.save_block_changes().unwrap();
        store.flush_block_btree().unwrap();
        store.release_deferred_space().unwrap();
        store.amap.flush(store.device.as_ref()).unwrap();
    }

    fn data(bytes: &'static [u8]) -> Block {
        Block::Data(Bytes::from_static(bytes))
    }

    #[test]
    fn test_add_then_read_back() {
        let device = MemoryDevice::new();
        let mut store = store(&device);
        let id = store.add_block(data(b"hello")).unwrap();
        assert!(!id.is_internal());
        assert_eq!(store.get_block(id).unwrap(), data(b"hello"));
        commit(&mut store);

        let mut reopened = BlockStore::new(
            Box::new(device.clone()),
            store.header.clone(),
            AllocationMap::load(&device, 1).unwrap(),
            BlockBTree::open(store.bbt.root(), 16, 8),
            &StorageConfig::default(),
        );
        assert_eq!(reopened.get_block(id).unwrap(), data(b"hello"));
        assert_eq!(reopened.block_ref_count(id).unwrap(), Some(2));
    }

    #[test]
    fn test_internal_flag_follows_kind() {
        let device = MemoryDevice::new();
        let mut store = store(&device);
        let id = store
            .add_block(Block::IndexL1 {
                total_size: 0,
                children: Vec::new(),
            })
            .unwrap();
        assert!(id.is_internal());
    }

    #[test]
    fn test_update_pending_keeps_id() {
        let device = MemoryDevice::new();
        let mut store = store(&device);
        let id = store.add_block(data(b"one")).unwrap();
        let same = store.update_block(id, data(b"two")).unwrap();
        assert_eq!(same, id);
        assert_eq!(store.get_block(id).unwrap(), data(b"two"));
    }

    #[test]
    fn test_update_committed_is_copy_on_write() {
        let device = MemoryDevice::new();
        let mut store = store(&device);
        let id = store.add_block(data(b"one")).unwrap();
        commit(&mut store);
        let old_offset = store.bbt.find(&device, id.masked()).unwrap().unwrap().block.offset;

        let new_id = store.update_block(id, data(b"two")).unwrap();
        assert_ne!(new_id, id);
        // Old content stays readable until the save.
        assert_eq!(store.get_block(id).unwrap(), data(b"one"));
        commit(&mut store);

        assert_eq!(store.get_block(new_id).unwrap(), data(b"two"));
        assert!(matches!(
            store.get_block(id).unwrap_err(),
            MailstoreError::BlockNotFound { .. }
        ));
        assert!(!store.amap.is_allocated(old_offset, 64));
    }

    #[test]
    fn test_delete_pending_never_touches_disk() {
        let device = MemoryDevice::new();
        let mut store = store(&device);
        let id = store.add_block(data(b"gone")).unwrap();
        store.delete_block(id);
        assert!(!store.has_pending_changes());
        commit(&mut store);
        assert!(store.get_block(id).is_err());
    }

    #[test]
    fn test_shared_block_survives_one_free() {
        let device = MemoryDevice::new();
        let mut store = store(&device);
        let id = store.add_block(data(b"shared")).unwrap();
        assert!(store.add_block_reference(id).is_err());
        commit(&mut store);

        store.add_block_reference(id).unwrap();
        assert_eq!(store.block_ref_count(id).unwrap(), Some(3));
        store.delete_block(id);
        commit(&mut store);
        assert_eq!(store.block_ref_count(id).unwrap(), Some(2));
        assert_eq!(store.get_block(id).unwrap(), data(b"shared"));

        store.delete_block(id);
        commit(&mut store);
        assert_eq!(store.block_ref_count(id).unwrap(), None);
    }

    #[test]
    fn test_oversized_block_rejected() {
        let device = MemoryDevice::new();
        let mut store = store(&device);
        let big = Block::Data(Bytes::from(vec![0u8; MAX_BLOCK_DATA_SIZE + 1]));
        assert!(matches!(
            store.add_block(big).unwrap_err(),
            MailstoreError::BlockTooLarge { .. }
        ));
        let full = Block::Data(Bytes::from(vec![7u8; MAX_BLOCK_DATA_SIZE]));
        let id = store.add_block(full.clone()).unwrap();
        commit(&mut store);
        assert_eq!(store.get_block(id).unwrap(), full);
    }

    #[test]
    fn test_tampered_block_is_rejected() {
        let device = MemoryDevice::new();
        let mut store = store(&device);
        let id = store.add_block(data(b"payload")).unwrap();
        commit(&mut store);
        let offset = store.bbt.find(&device, id.masked()).unwrap().unwrap().block.offset;
        device.corrupt_byte(offset + 3, 0x01);

        let mut fresh = BlockStore::new(
            Box::new(device.clone()),
            store.header.clone(),
            AllocationMap::load(&device, 1).unwrap(),
            BlockBTree::open(store.bbt.root(), 16, 8),
            &StorageConfig::default(),
        );
        let err = fresh.get_block(id).unwrap_err();
        assert!(matches!(err, MailstoreError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_cache_serves_repeat_reads() {
        let device = MemoryDevice::new();
        let mut store = store(&device);
        let id = store.add_block(data(b"cached")).unwrap();
        commit(&mut store);
        store.get_block(id).unwrap();
        store.get_block(id).unwrap();
        assert!(store.cache_stats().hits >= 2);
    }
}
