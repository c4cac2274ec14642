//! Copy-on-write page b-tree.

use super::page::BTreeNode;
use super::types::{BTreeChild, BTreeEntry};
use crate::amap::AllocationMap;
use crate::device::ByteDevice;
use crate::header::Header;
use mailstore_buffer::BlockCache;
use mailstore_common::{BlockId, BlockRef, MailstoreError, Result, PAGE_SIZE};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace, warn};

/// One page on the way from the root to a leaf.
struct PathStep<E> {
    page: BlockRef,
    node: BTreeNode<E>,
    /// Child followed out of this page. Unused for the leaf.
    child_index: usize,
}

/// Page b-tree keyed by `E::key()`.
///
/// Pages that change during a session are given fresh ids and kept in
/// memory until [`PageBTree::flush`] writes them to newly allocated space.
/// Pages they replace are returned by `flush` so the caller can reclaim
/// their space once every tree has been written.
pub struct PageBTree<E: BTreeEntry> {
    root: BlockRef,
    /// Modified pages, not yet placed. Child references to them carry offset 0.
    pending: BTreeMap<BlockId, BTreeNode<E>>,
    /// Clean pages as read from disk.
    cache: BlockCache<BTreeNode<E>>,
    /// Committed pages superseded since the last flush.
    released: Vec<BlockRef>,
    max_depth: usize,
}

impl<E: BTreeEntry> PageBTree<E> {
    /// Creates an empty tree whose root leaf is written on the next flush.
    pub fn create(header: &mut Header, cache_pages: usize, max_depth: usize) -> Self {
        let root_id = header.allocate_next_page_id();
        let mut pending = BTreeMap::new();
        pending.insert(root_id, BTreeNode::empty_leaf());
        Self {
            root: BlockRef::new(root_id, 0),
            pending,
            cache: BlockCache::new(cache_pages),
            released: Vec::new(),
            max_depth,
        }
    }

    /// Opens a committed tree.
    pub fn open(root: BlockRef, cache_pages: usize, max_depth: usize) -> Self {
        Self {
            root,
            pending: BTreeMap::new(),
            cache: BlockCache::new(cache_pages),
            released: Vec::new(),
            max_depth,
        }
    }

    /// Root page reference. Only meaningful on disk after a flush.
    pub fn root(&self) -> BlockRef {
        self.root
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty() || !self.released.is_empty()
    }

    fn read_page(&mut self, device: &dyn ByteDevice, page: BlockRef) -> Result<BTreeNode<E>> {
        if let Some(node) = self.pending.get(&page.block_id) {
            return Ok(node.clone());
        }
        if let Some(node) = self.cache.get(page.block_id) {
            return Ok(node);
        }
        let mut buf = [0u8; PAGE_SIZE];
        device.read_exact_at(page.offset, &mut buf)?;
        let node = BTreeNode::decode(&buf, page).inspect_err(|err| {
            warn!(page_id = %page.block_id, offset = page.offset, error = %err, "b-tree page failed validation");
        })?;
        trace!(page_id = %page.block_id, offset = page.offset, level = node.level(), "read b-tree page");
        self.cache.insert(page.block_id, node.clone());
        Ok(node)
    }

    fn check_level(node: &BTreeNode<E>, expected: Option<u8>, page: BlockRef) -> Result<()> {
        match expected {
            Some(level) if node.level() != level => Err(MailstoreError::corrupted(format!(
                "page {} at {:#x} has level {}, parent expects {}",
                page.block_id,
                page.offset,
                node.level(),
                level
            ))),
            _ => Ok(()),
        }
    }

    /// Walks from the root to the leaf that holds or would hold `key`.
    fn descend(&mut self, device: &dyn ByteDevice, key: u64) -> Result<Vec<PathStep<E>>> {
        let mut path = Vec::new();
        let mut page = self.root;
        let mut expected_level = None;
        loop {
            if path.len() >= self.max_depth {
                return Err(MailstoreError::TreeTooDeep {
                    depth: self.max_depth,
                });
            }
            let node = self.read_page(device, page)?;
            Self::check_level(&node, expected_level, page)?;
            let (child_index, next) = match &node {
                BTreeNode::Leaf(_) => {
                    path.push(PathStep {
                        page,
                        node,
                        child_index: 0,
                    });
                    return Ok(path);
                }
                BTreeNode::Intermediate { level, children } => {
                    if children.is_empty() {
                        return Err(MailstoreError::corrupted(format!(
                            "intermediate page {} has no children",
                            page.block_id
                        )));
                    }
                    expected_level = Some(level - 1);
                    let index = children.partition_point(|c| c.key <= key).saturating_sub(1);
                    (index, children[index].page)
                }
            };
            path.push(PathStep {
                page,
                node,
                child_index,
            });
            page = next;
        }
    }

    /// Looks up the record with `key`.
    pub fn find(&mut self, device: &dyn ByteDevice, key: u64) -> Result<Option<E>> {
        let mut path = self.descend(device, key)?;
        match path.pop().map(|step| step.node) {
            Some(BTreeNode::Leaf(entries)) => Ok(entries
                .binary_search_by_key(&key, |e| e.key())
                .ok()
                .map(|i| entries[i].clone())),
            _ => Ok(None),
        }
    }

    /// Inserts a new record. Fails if the key is present.
    pub fn insert(&mut self, device: &dyn ByteDevice, header: &mut Header, entry: E) -> Result<()> {
        let key = entry.key();
        self.modify_leaf(device, header, key, |entries| {
            match entries.binary_search_by_key(&key, |e| e.key()) {
                Ok(_) => return Err(MailstoreError::DuplicateKey { key }),
                Err(pos) => entries.insert(pos, entry),
            }
            Ok(())
        })
        .map(|_| ())
    }

    /// Replaces an existing record. Fails if the key is absent.
    pub fn update(&mut self, device: &dyn ByteDevice, header: &mut Header, entry: E) -> Result<E> {
        let key = entry.key();
        self.modify_leaf(device, header, key, |entries| {
            match entries.binary_search_by_key(&key, |e| e.key()) {
                Ok(pos) => Ok(std::mem::replace(&mut entries[pos], entry)),
                Err(_) => Err(MailstoreError::KeyNotFound { key }),
            }
        })
    }

    /// Inserts or replaces a record, returning the replaced one.
    pub fn upsert(
        &mut self,
        device: &dyn ByteDevice,
        header: &mut Header,
        entry: E,
    ) -> Result<Option<E>> {
        let key = entry.key();
        self.modify_leaf(device, header, key, |entries| {
            Ok(match entries.binary_search_by_key(&key, |e| e.key()) {
                Ok(pos) => Some(std::mem::replace(&mut entries[pos], entry)),
                Err(pos) => {
                    entries.insert(pos, entry);
                    None
                }
            })
        })
    }

    /// Removes and returns the record with `key`.
    pub fn delete(&mut self, device: &dyn ByteDevice, header: &mut Header, key: u64) -> Result<E> {
        self.modify_leaf(device, header, key, |entries| {
            match entries.binary_search_by_key(&key, |e| e.key()) {
                Ok(pos) => Ok(entries.remove(pos)),
                Err(_) => Err(MailstoreError::KeyNotFound { key }),
            }
        })
    }

    /// Applies `f` to the leaf for `key`, then rewrites the path above it.
    fn modify_leaf<T>(
        &mut self,
        device: &dyn ByteDevice,
        header: &mut Header,
        key: u64,
        f: impl FnOnce(&mut Vec<E>) -> Result<T>,
    ) -> Result<T> {
        let mut path = self.descend(device, key)?;
        let Some(mut leaf) = path.pop() else {
            return Err(MailstoreError::corrupted("empty b-tree path"));
        };
        let result = match &mut leaf.node {
            BTreeNode::Leaf(entries) => f(entries)?,
            BTreeNode::Intermediate { .. } => {
                return Err(MailstoreError::corrupted("b-tree descent ended above a leaf"))
            }
        };
        path.push(leaf);
        self.write_path(header, path);
        Ok(result)
    }

    /// Rewrites every page on `path`, bottom-up, splitting overfull pages and
    /// dropping emptied ones.
    fn write_path(&mut self, header: &mut Header, mut path: Vec<PathStep<E>>) {
        let Some(mut current) = path.pop() else {
            return;
        };
        loop {
            let is_root = path.is_empty();
            let level = current.node.level();
            let nodes = self.replacements(current.node, is_root);
            let children = self.place(header, current.page, nodes);

            let Some(mut parent) = path.pop() else {
                self.root = match children.len() {
                    1 => children[0].page,
                    _ => {
                        let root_id = header.allocate_next_page_id();
                        debug!(page_id = %root_id, level = level + 1, "b-tree grew a level");
                        self.pending.insert(
                            root_id,
                            BTreeNode::Intermediate {
                                level: level + 1,
                                children,
                            },
                        );
                        BlockRef::new(root_id, 0)
                    }
                };
                return;
            };

            if let BTreeNode::Intermediate {
                children: parent_children,
                ..
            } = &mut parent.node
            {
                let at = parent.child_index;
                parent_children.splice(at..=at, children);
            }
            current = parent;
        }
    }

    /// Pages that take the place of `node` after a change.
    fn replacements(&self, mut node: BTreeNode<E>, is_root: bool) -> Vec<BTreeNode<E>> {
        if node.is_empty() {
            return if is_root {
                vec![BTreeNode::empty_leaf()]
            } else {
                Vec::new()
            };
        }
        if node.is_overfull() {
            let right = node.split();
            debug!(level = node.level(), left = node.len(), right = right.len(), "split b-tree page");
            return vec![node, right];
        }
        vec![node]
    }

    /// Stores replacement pages as pending and returns their parent records.
    fn place(
        &mut self,
        header: &mut Header,
        old: BlockRef,
        nodes: Vec<BTreeNode<E>>,
    ) -> Vec<BTreeChild> {
        if nodes.is_empty() {
            self.retire(old);
            return Vec::new();
        }
        let mut children = Vec::with_capacity(nodes.len());
        for (i, node) in nodes.into_iter().enumerate() {
            let page_id = if i == 0 && self.pending.contains_key(&old.block_id) {
                old.block_id
            } else {
                if i == 0 {
                    self.retire(old);
                }
                header.allocate_next_page_id()
            };
            children.push(BTreeChild {
                key: node.first_key().unwrap_or(0),
                page: BlockRef::new(page_id, 0),
            });
            self.pending.insert(page_id, node);
        }
        children
    }

    /// Forgets a page that is no longer referenced.
    fn retire(&mut self, page: BlockRef) {
        if self.pending.remove(&page.block_id).is_none() {
            self.cache.remove(page.block_id);
            self.released.push(page);
        }
    }

    /// Every record in key order.
    pub fn entries(&mut self, device: &dyn ByteDevice) -> Result<Vec<E>> {
        let mut out = Vec::new();
        let mut stack = vec![(self.root, None, 1usize)];
        while let Some((page, expected_level, depth)) = stack.pop() {
            if depth > self.max_depth {
                return Err(MailstoreError::TreeTooDeep {
                    depth: self.max_depth,
                });
            }
            let node = self.read_page(device, page)?;
            Self::check_level(&node, expected_level, page)?;
            match node {
                BTreeNode::Leaf(entries) => out.extend(entries),
                BTreeNode::Intermediate { level, children } => {
                    for child in children.iter().rev() {
                        stack.push((child.page, Some(level - 1), depth + 1));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Writes pending pages, lowest level first, and re-anchors the root.
    ///
    /// Returns the committed pages this tree no longer references. Their
    /// space must be released only after every tree has been flushed.
    pub fn flush(
        &mut self,
        device: &dyn ByteDevice,
        amap: &mut AllocationMap,
    ) -> Result<Vec<BlockRef>> {
        let mut pending: Vec<(BlockId, BTreeNode<E>)> =
            std::mem::take(&mut self.pending).into_iter().collect();
        pending.sort_by_key(|(_, node)| node.level());

        let mut placed: HashMap<BlockId, u64> = HashMap::with_capacity(pending.len());
        for (page_id, mut node) in pending {
            if let BTreeNode::Intermediate { children, .. } = &mut node {
                for child in children.iter_mut() {
                    if let Some(&offset) = placed.get(&child.page.block_id) {
                        child.page.offset = offset;
                    }
                }
            }
            let offset = amap.allocate(PAGE_SIZE as u64, true)?;
            device.write_all_at(offset, &node.encode(page_id, offset))?;
            trace!(page_id = %page_id, offset, level = node.level(), "wrote b-tree page");
            placed.insert(page_id, offset);
            self.cache.insert(page_id, node);
        }
        if let Some(&offset) = placed.get(&self.root.block_id) {
            self.root.offset = offset;
        }
        debug!(pages = placed.len(), released = self.released.len(), root = %self.root.block_id, "flushed b-tree");
        Ok(std::mem::take(&mut self.released))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::types::{BbtEntry, NbtEntry};
    use crate::device::MemoryDevice;
    use mailstore_common::{NodeId, NodeType};
    use rand::seq::SliceRandom;

    struct Fixture {
        device: MemoryDevice,
        header: Header,
        amap: AllocationMap,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                device: MemoryDevice::new(),
                header: Header::new(),
                amap: AllocationMap::new(),
            }
        }

        fn flush<E: BTreeEntry>(&mut self, tree: &mut PageBTree<E>) {
            let released = tree.flush(&self.device, &mut self.amap).unwrap();
            for page in released {
                self.amap.release(page.offset, PAGE_SIZE as u64).unwrap();
            }
        }
    }

    fn nbt(index: u32) -> NbtEntry {
        NbtEntry {
            node_id: NodeId::new(NodeType::NormalMessage, index),
            data: BlockId::new(index as u64, false),
            subnode: BlockId::NONE,
            parent: NodeId(0),
        }
    }

    fn bbt(index: u64) -> BbtEntry {
        BbtEntry {
            block: BlockRef::new(BlockId::new(index, false), 0x8000 + index * 64),
            size: 64,
            ref_count: 2,
        }
    }

    #[test]
    fn test_empty_tree() {
        let mut fx = Fixture::new();
        let mut tree: PageBTree<NbtEntry> = PageBTree::create(&mut fx.header, 16, 8);
        assert!(tree.has_pending_changes());
        assert_eq!(tree.find(&fx.device, 42).unwrap(), None);
        assert!(tree.entries(&fx.device).unwrap().is_empty());

        fx.flush(&mut tree);
        assert!(!tree.has_pending_changes());
        assert_ne!(tree.root().offset, 0);
    }

    #[test]
    fn test_insert_find_update_delete() {
        let mut fx = Fixture::new();
        let mut tree: PageBTree<NbtEntry> = PageBTree::create(&mut fx.header, 16, 8);
        tree.insert(&fx.device, &mut fx.header, nbt(5)).unwrap();
        tree.insert(&fx.device, &mut fx.header, nbt(3)).unwrap();

        let key = nbt(3).key();
        assert_eq!(tree.find(&fx.device, key).unwrap(), Some(nbt(3)));

        let err = tree.insert(&fx.device, &mut fx.header, nbt(3)).unwrap_err();
        assert!(matches!(err, MailstoreError::DuplicateKey { .. }));

        let mut changed = nbt(3);
        changed.parent = NodeId(0x122);
        let old = tree.update(&fx.device, &mut fx.header, changed).unwrap();
        assert_eq!(old, nbt(3));
        assert_eq!(tree.find(&fx.device, key).unwrap(), Some(changed));

        assert!(tree.update(&fx.device, &mut fx.header, nbt(9)).is_err());
        assert_eq!(tree.upsert(&fx.device, &mut fx.header, nbt(9)).unwrap(), None);

        assert_eq!(tree.delete(&fx.device, &mut fx.header, key).unwrap(), changed);
        assert_eq!(tree.find(&fx.device, key).unwrap(), None);
        assert!(matches!(
            tree.delete(&fx.device, &mut fx.header, key).unwrap_err(),
            MailstoreError::KeyNotFound { .. }
        ));
    }

    #[test]
    fn test_splits_keep_order() {
        let mut fx = Fixture::new();
        let mut tree: PageBTree<BbtEntry> = PageBTree::create(&mut fx.header, 64, 8);
        let mut indexes: Vec<u64> = (1..=1000).collect();
        indexes.shuffle(&mut rand::rng());
        for &i in &indexes {
            tree.insert(&fx.device, &mut fx.header, bbt(i)).unwrap();
        }

        let all = tree.entries(&fx.device).unwrap();
        assert_eq!(all.len(), 1000);
        assert!(all.windows(2).all(|w| w[0].key() < w[1].key()));
        for i in 1..=1000 {
            assert_eq!(tree.find(&fx.device, bbt(i).key()).unwrap(), Some(bbt(i)));
        }
    }

    #[test]
    fn test_smaller_key_updates_separator() {
        let mut fx = Fixture::new();
        let mut tree: PageBTree<BbtEntry> = PageBTree::create(&mut fx.header, 64, 8);
        for i in 100..200 {
            tree.insert(&fx.device, &mut fx.header, bbt(i)).unwrap();
        }
        tree.insert(&fx.device, &mut fx.header, bbt(1)).unwrap();
        assert_eq!(tree.find(&fx.device, bbt(1).key()).unwrap(), Some(bbt(1)));
    }

    #[test]
    fn test_flush_and_reopen() {
        let mut fx = Fixture::new();
        let mut tree: PageBTree<NbtEntry> = PageBTree::create(&mut fx.header, 64, 8);
        for i in 0..200 {
            tree.insert(&fx.device, &mut fx.header, nbt(0x10000 + i)).unwrap();
        }
        fx.flush(&mut tree);

        let mut reopened: PageBTree<NbtEntry> = PageBTree::open(tree.root(), 64, 8);
        let all = reopened.entries(&fx.device).unwrap();
        assert_eq!(all.len(), 200);
        assert_eq!(
            reopened.find(&fx.device, nbt(0x10050).key()).unwrap(),
            Some(nbt(0x10050))
        );
    }

    #[test]
    fn test_copy_on_write_releases_old_pages() {
        let mut fx = Fixture::new();
        let mut tree: PageBTree<NbtEntry> = PageBTree::create(&mut fx.header, 64, 8);
        tree.insert(&fx.device, &mut fx.header, nbt(1)).unwrap();
        fx.flush(&mut tree);
        let first_root = tree.root();

        tree.insert(&fx.device, &mut fx.header, nbt(2)).unwrap();
        assert_ne!(tree.root().block_id, first_root.block_id);
        // Second change in the same session reuses the pending page.
        let pending_root = tree.root().block_id;
        tree.insert(&fx.device, &mut fx.header, nbt(3)).unwrap();
        assert_eq!(tree.root().block_id, pending_root);

        let released = tree.flush(&fx.device, &mut fx.amap).unwrap();
        assert_eq!(released, vec![first_root]);

        // Old root still readable until released.
        let mut old: PageBTree<NbtEntry> = PageBTree::open(first_root, 4, 8);
        assert_eq!(old.entries(&fx.device).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_everything() {
        let mut fx = Fixture::new();
        let mut tree: PageBTree<BbtEntry> = PageBTree::create(&mut fx.header, 64, 8);
        for i in 1..=300 {
            tree.insert(&fx.device, &mut fx.header, bbt(i)).unwrap();
        }
        fx.flush(&mut tree);
        for i in (1..=300).rev() {
            tree.delete(&fx.device, &mut fx.header, bbt(i).key()).unwrap();
        }
        assert!(tree.entries(&fx.device).unwrap().is_empty());
        fx.flush(&mut tree);

        let mut reopened: PageBTree<BbtEntry> = PageBTree::open(tree.root(), 4, 8);
        assert!(reopened.entries(&fx.device).unwrap().is_empty());
        tree.insert(&fx.device, &mut fx.header, bbt(7)).unwrap();
        assert_eq!(tree.find(&fx.device, bbt(7).key()).unwrap(), Some(bbt(7)));
    }

    #[test]
    fn test_damaged_page_is_reported() {
        let mut fx = Fixture::new();
        let mut tree: PageBTree<NbtEntry> = PageBTree::create(&mut fx.header, 4, 8);
        tree.insert(&fx.device, &mut fx.header, nbt(1)).unwrap();
        fx.flush(&mut tree);

        fx.device.corrupt_byte(tree.root().offset + 2, 0x40);
        let mut reopened: PageBTree<NbtEntry> = PageBTree::open(tree.root(), 4, 8);
        let err = reopened.find(&fx.device, nbt(1).key()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_depth_ceiling() {
        let mut fx = Fixture::new();
        let mut tree: PageBTree<BbtEntry> = PageBTree::create(&mut fx.header, 64, 8);
        for i in 1..=100 {
            tree.insert(&fx.device, &mut fx.header, bbt(i)).unwrap();
        }
        fx.flush(&mut tree);

        let mut shallow: PageBTree<BbtEntry> = PageBTree::open(tree.root(), 4, 1);
        assert!(matches!(
            shallow.find(&fx.device, bbt(1).key()).unwrap_err(),
            MailstoreError::TreeTooDeep { .. }
        ));
        assert!(matches!(
            shallow.entries(&fx.device).unwrap_err(),
            MailstoreError::TreeTooDeep { .. }
        ));
    }

    #[test]
    fn test_self_referencing_page_is_corruption() {
        let fx = Fixture::new();
        let page = BlockRef::new(BlockId(0x40), 0x8000);
        let node: BTreeNode<BbtEntry> = BTreeNode::Intermediate {
            level: 1,
            children: vec![BTreeChild { key: 0, page }],
        };
        fx.device.write_all_at(page.offset, &node.encode(page.block_id, page.offset)).unwrap();

        let mut tree: PageBTree<BbtEntry> = PageBTree::open(page, 4, 8);
        let err = tree.find(&fx.device, 4).unwrap_err();
        assert!(err.is_corruption());
    }
}
