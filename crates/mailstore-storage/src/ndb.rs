//! The node database: one open mailstore file.

use crate::amap::AllocationMap;
use crate::block::Block;
use crate::btree::{BlockBTree, NodeBTree};
use crate::device::{ByteDevice, FileDevice};
use crate::header::{Header, AMAP_INVALID, AMAP_VALID, HEADER_SIZE};
use crate::store::BlockStore;
use mailstore_buffer::CacheStats;
use mailstore_common::{BlockId, MailstoreError, NodeId, NodeType, Result, StorageConfig};
use std::path::Path;
use tracing::{debug, info, warn};

/// One session over a mailstore file.
///
/// All counters, caches and buffered changes belong to the session. Nothing
/// reaches the file until [`NodeDatabase::save_changes`], and a session that
/// is dropped without saving leaves the file as it was.
pub struct NodeDatabase {
    pub(crate) store: BlockStore,
    pub(crate) nbt: NodeBTree,
    config: StorageConfig,
    commit_in_progress: bool,
}

impl NodeDatabase {
    /// Formats `device` as an empty mailstore and commits it.
    pub fn create(device: impl ByteDevice + 'static, config: StorageConfig) -> Result<Self> {
        let mut header = Header::new();
        let bbt = BlockBTree::create(&mut header, config.page_cache_pages, config.max_tree_depth);
        let nbt = NodeBTree::create(&mut header, config.page_cache_pages, config.max_tree_depth);
        let store = BlockStore::new(Box::new(device), header, AllocationMap::new(), bbt, &config);
        let mut db = Self {
            store,
            nbt,
            config,
            commit_in_progress: false,
        };
        db.save_changes()?;
        info!(file_eof = db.store.header.root.file_eof, "created mailstore");
        Ok(db)
    }

    /// Opens an existing mailstore.
    ///
    /// A file whose allocation map is flagged invalid can be read, but
    /// [`NodeDatabase::begin_saving_changes`] refuses to write to it.
    pub fn open(device: impl ByteDevice + 'static, config: StorageConfig) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        device.read_exact_at(0, &mut buf)?;
        let header = Header::from_bytes(&buf)?;
        let root = header.root;
        if root.node_btree.offset == 0 || root.block_btree.offset == 0 {
            return Err(MailstoreError::corrupted("header has no b-tree roots"));
        }
        if !root.is_amap_valid() {
            warn!(
                amap_valid = root.amap_valid,
                "allocation map is flagged invalid; a previous commit did not finish"
            );
        }

        let regions = AllocationMap::region_count_for(root.amap_last)?;
        let amap = AllocationMap::load(&device, regions)?;
        let bbt = BlockBTree::open(root.block_btree, config.page_cache_pages, config.max_tree_depth);
        let nbt = NodeBTree::open(root.node_btree, config.page_cache_pages, config.max_tree_depth);
        let store = BlockStore::new(Box::new(device), header, amap, bbt, &config);
        info!(
            file_eof = root.file_eof,
            regions,
            unique = store.header.unique,
            "opened mailstore"
        );
        Ok(Self {
            store,
            nbt,
            config,
            commit_in_progress: false,
        })
    }

    /// Creates a file-backed mailstore at `path`, replacing any existing file.
    pub fn create_file(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self> {
        Self::create(FileDevice::create(path)?, config)
    }

    /// Opens a file-backed mailstore at `path`.
    pub fn open_file(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self> {
        Self::open(FileDevice::open(path)?, config)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn header(&self) -> &Header {
        &self.store.header
    }

    pub fn allocation_map(&self) -> &AllocationMap {
        &self.store.amap
    }

    /// Whether the header currently flags the allocation map as trustworthy.
    pub fn is_amap_valid(&self) -> bool {
        self.store.header.root.is_amap_valid()
    }

    pub fn block_cache_stats(&self) -> CacheStats {
        self.store.cache_stats()
    }

    pub fn allocate_next_node_id(&mut self, node_type: NodeType) -> Result<NodeId> {
        self.store.header.allocate_next_node_id(node_type)
    }

    pub fn allocate_next_block_id(&mut self, internal: bool) -> BlockId {
        self.store.header.allocate_next_block_id(internal)
    }

    pub fn allocate_next_unique_id(&mut self) -> u32 {
        self.store.header.allocate_next_unique_id()
    }

    pub fn get_block(&mut self, block_id: BlockId) -> Result<Block> {
        self.store.get_block(block_id)
    }

    pub fn add_block(&mut self, block: Block) -> Result<BlockId> {
        self.store.add_block(block)
    }

    pub fn update_block(&mut self, block_id: BlockId, block: Block) -> Result<BlockId> {
        self.store.update_block(block_id, block)
    }

    pub fn delete_block(&mut self, block_id: BlockId) {
        self.store.delete_block(block_id)
    }

    pub fn add_block_reference(&mut self, block_id: BlockId) -> Result<()> {
        self.store.add_block_reference(block_id)
    }

    pub fn block_ref_count(&mut self, block_id: BlockId) -> Result<Option<u16>> {
        self.store.block_ref_count(block_id)
    }

    pub fn has_pending_changes(&self) -> bool {
        self.store.has_pending_changes()
            || self.store.bbt.has_pending_changes()
            || self.nbt.has_pending_changes()
    }

    /// Writes the header, advancing the unique counter.
    fn write_header(&mut self) -> Result<()> {
        self.store.header.allocate_next_unique_id();
        let bytes = self.store.header.to_bytes();
        self.store.device.write_all_at(0, &bytes)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if self.config.fsync_enabled {
            self.store.device.sync()?;
        }
        Ok(())
    }

    /// Starts a commit by flagging the allocation map invalid on disk.
    ///
    /// Refuses when the flag is already invalid: either a previous commit
    /// never finished or one is running now.
    pub fn begin_saving_changes(&mut self) -> Result<()> {
        if !self.store.header.root.is_amap_valid() {
            warn!("refusing to commit: allocation map is flagged invalid");
            return Err(MailstoreError::AllocationMapInvalid);
        }
        self.store.header.root.amap_valid = AMAP_INVALID;
        self.write_header()?;
        self.sync()?;
        self.commit_in_progress = true;
        debug!(unique = self.store.header.unique, "commit started");
        Ok(())
    }

    /// Writes buffered blocks, both b-trees and the allocation map, then
    /// points the header at the new roots.
    pub fn write_pending_changes(&mut self) -> Result<()> {
        if !self.commit_in_progress {
            return Err(MailstoreError::CommitNotStarted);
        }

        self.store.save_block_changes()?;
        self.store.flush_block_btree()?;
        debug!(root = %self.store.bbt.root().block_id, "block b-tree written");
        let released = self.nbt.flush(self.store.device.as_ref(), &mut self.store.amap)?;
        self.store.defer_page_release(released);
        debug!(root = %self.nbt.root().block_id, "node b-tree written");

        // Both trees now reference only new space.
        self.store.release_deferred_space()?;
        self.store.amap.flush(self.store.device.as_ref())?;
        self.sync()?;

        let amap = &self.store.amap;
        let root = &mut self.store.header.root;
        root.node_btree = self.nbt.root();
        root.block_btree = self.store.bbt.root();
        root.file_eof = amap.file_eof();
        root.amap_last = amap.last_page_offset();
        root.amap_free = amap.free_space();
        root.pmap_free = 0;
        self.write_header()?;
        debug!(
            file_eof = self.store.header.root.file_eof,
            amap_free = self.store.header.root.amap_free,
            "header re-anchored"
        );
        Ok(())
    }

    /// Finishes a commit by flagging the allocation map valid again.
    pub fn end_saving_changes(&mut self) -> Result<()> {
        if !self.commit_in_progress {
            return Err(MailstoreError::CommitNotStarted);
        }
        self.store.header.root.amap_valid = AMAP_VALID;
        self.write_header()?;
        self.sync()?;
        self.commit_in_progress = false;
        info!(unique = self.store.header.unique, "commit finished");
        Ok(())
    }

    /// Runs the whole commit sequence.
    pub fn save_changes(&mut self) -> Result<()> {
        self.begin_saving_changes()?;
        self.write_pending_changes()?;
        self.end_saving_changes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::header::HEADER_MAGIC;
    use bytes::Bytes;
    use mailstore_common::types::read_u32;

    fn config() -> StorageConfig {
        StorageConfig {
            fsync_enabled: false,
            ..StorageConfig::default()
        }
    }

    #[test]
    fn test_create_writes_valid_file() {
        let device = MemoryDevice::new();
        let db = NodeDatabase::create(device.clone(), config()).unwrap();
        assert!(db.is_amap_valid());
        assert!(!db.has_pending_changes());

        let image = device.snapshot();
        assert_eq!(read_u32(&image, 0), HEADER_MAGIC);
        assert_eq!(image.len() as u64, db.header().root.file_eof);

        let reopened = NodeDatabase::open(device, config()).unwrap();
        assert_eq!(reopened.header().root, db.header().root);
        assert!(reopened.is_amap_valid());
    }

    #[test]
    fn test_every_header_write_advances_unique() {
        let device = MemoryDevice::new();
        let mut db = NodeDatabase::create(device, config()).unwrap();
        let before = db.header().unique;
        db.save_changes().unwrap();
        // Begin, re-anchor and end each rewrite the header.
        assert_eq!(db.header().unique, before + 3);
    }

    #[test]
    fn test_commit_steps_require_begin() {
        let mut db = NodeDatabase::create(MemoryDevice::new(), config()).unwrap();
        assert!(matches!(
            db.write_pending_changes().unwrap_err(),
            MailstoreError::CommitNotStarted
        ));
        assert!(matches!(
            db.end_saving_changes().unwrap_err(),
            MailstoreError::CommitNotStarted
        ));
    }

    #[test]
    fn test_begin_twice_is_refused() {
        let mut db = NodeDatabase::create(MemoryDevice::new(), config()).unwrap();
        db.begin_saving_changes().unwrap();
        assert!(matches!(
            db.begin_saving_changes().unwrap_err(),
            MailstoreError::AllocationMapInvalid
        ));
    }

    #[test]
    fn test_interrupted_commit_leaves_map_invalid() {
        let device = MemoryDevice::new();
        let mut db = NodeDatabase::create(device.clone(), config()).unwrap();
        let id = db.add_block(Block::Data(Bytes::from_static(b"half"))).unwrap();
        db.begin_saving_changes().unwrap();
        db.write_pending_changes().unwrap();
        drop(db);

        let mut reopened = NodeDatabase::open(device, config()).unwrap();
        assert!(!reopened.is_amap_valid());
        // Reads still work; writes are refused.
        assert_eq!(
            reopened.get_block(id).unwrap(),
            Block::Data(Bytes::from_static(b"half"))
        );
        assert!(matches!(
            reopened.save_changes().unwrap_err(),
            MailstoreError::AllocationMapInvalid
        ));
    }

    #[test]
    fn test_counters_survive_reopen() {
        let device = MemoryDevice::new();
        let mut db = NodeDatabase::create(device.clone(), config()).unwrap();
        let first = db.allocate_next_node_id(NodeType::NormalMessage).unwrap();
        let block = db.allocate_next_block_id(false);
        db.save_changes().unwrap();

        let mut reopened = NodeDatabase::open(device, config()).unwrap();
        let next = reopened.allocate_next_node_id(NodeType::NormalMessage).unwrap();
        assert_eq!(next.index(), first.index() + 1);
        assert!(reopened.allocate_next_block_id(false).as_u64() > block.as_u64());
    }

    #[test]
    fn test_freed_space_is_reused() {
        let device = MemoryDevice::new();
        let mut db = NodeDatabase::create(device.clone(), config()).unwrap();
        let id = db.add_block(Block::Data(Bytes::from(vec![1u8; 4000]))).unwrap();
        db.save_changes().unwrap();
        let free_with_block = db.allocation_map().free_space();

        db.delete_block(id);
        db.save_changes().unwrap();
        assert!(db.allocation_map().free_space() > free_with_block);
        assert_eq!(db.block_ref_count(id).unwrap(), None);
    }

    #[test]
    fn test_open_rejects_garbage() {
        let device = MemoryDevice::from_bytes(vec![0u8; 4096]);
        assert!(NodeDatabase::open(device, config()).is_err());
        assert!(NodeDatabase::open(MemoryDevice::new(), config()).is_err());
    }

    #[test]
    fn test_file_backed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.pst");
        let id = {
            let mut db = NodeDatabase::create_file(&path, config()).unwrap();
            let id = db.add_block(Block::Data(Bytes::from_static(b"on disk"))).unwrap();
            db.save_changes().unwrap();
            id
        };
        let mut db = NodeDatabase::open_file(&path, config()).unwrap();
        assert_eq!(
            db.get_block(id).unwrap(),
            Block::Data(Bytes::from_static(b"on disk"))
        );
    }
}
