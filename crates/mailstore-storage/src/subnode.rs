//! Subnode trees: child nodes owned by one node.
//!
//! A subnode tree is a one- or two-level tree of internal blocks. Leaf blocks
//! map a local node id to the child's data tree and nested subnode tree. When
//! more than one leaf is needed an index block lists the leaves by their
//! smallest node id.

use crate::block::{
    Block, SubnodeIndexEntry, SubnodeLeafEntry, MAX_SUBNODE_INDEX_ENTRIES, MAX_SUBNODE_LEAF_ENTRIES,
};
use crate::data_tree::DataTree;
use crate::ndb::NodeDatabase;
use mailstore_common::{BlockId, MailstoreError, NodeId, Result};
use std::collections::HashSet;
use tracing::{debug, trace};

#[derive(Debug, Clone, Default)]
struct LeafSlot {
    id: Option<BlockId>,
    entries: Vec<SubnodeLeafEntry>,
    dirty: bool,
}

impl LeafSlot {
    fn first_key(&self) -> Option<NodeId> {
        self.entries.first().map(|e| e.node_id)
    }
}

/// In-memory view of a subnode tree with buffered changes.
#[derive(Debug, Clone, Default)]
pub struct SubnodeTree {
    root: BlockId,
    leaves: Vec<LeafSlot>,
    /// Index block of the saved shape.
    index_block: Option<BlockId>,
    /// Leaf blocks emptied since the last save.
    retired: Vec<BlockId>,
    dirty: bool,
}

impl SubnodeTree {
    /// An empty, unsaved tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the tree rooted at `root`. `BlockId::NONE` is an empty tree.
    pub fn open(db: &mut NodeDatabase, root: BlockId) -> Result<Self> {
        let mut tree = Self {
            root,
            ..Self::default()
        };
        if root.is_none() {
            return Ok(tree);
        }
        match db.get_block(root)? {
            Block::SubnodeLeaf(entries) => tree.leaves.push(LeafSlot {
                id: Some(root),
                entries,
                dirty: false,
            }),
            Block::SubnodeIndex(children) => {
                for child in children {
                    match db.get_block(child.block)? {
                        Block::SubnodeLeaf(entries) => tree.leaves.push(LeafSlot {
                            id: Some(child.block),
                            entries,
                            dirty: false,
                        }),
                        _ => {
                            return Err(MailstoreError::corrupted(format!(
                                "subnode index {} points at {} which is not a subnode leaf",
                                root, child.block
                            )))
                        }
                    }
                }
                tree.index_block = Some(root);
            }
            _ => {
                return Err(MailstoreError::corrupted(format!(
                    "block {} is not a subnode block",
                    root
                )))
            }
        }
        let sorted = tree
            .leaves
            .iter()
            .flat_map(|l| l.entries.iter())
            .zip(tree.leaves.iter().flat_map(|l| l.entries.iter()).skip(1))
            .all(|(a, b)| a.node_id < b.node_id);
        if !sorted {
            return Err(MailstoreError::corrupted(format!(
                "subnode tree {} has unsorted entries",
                root
            )));
        }
        trace!(root = %root, leaves = tree.leaves.len(), "opened subnode tree");
        Ok(tree)
    }

    /// Root block as of the last save or open.
    pub fn root(&self) -> BlockId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.leaves.iter().map(|l| l.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Every subnode in node id order.
    pub fn entries(&self) -> impl Iterator<Item = &SubnodeLeafEntry> {
        self.leaves.iter().flat_map(|l| l.entries.iter())
    }

    /// Index of the leaf that holds or would hold `node_id`.
    fn leaf_for(&self, node_id: NodeId) -> usize {
        self.leaves
            .partition_point(|l| l.first_key().is_some_and(|k| k <= node_id))
            .saturating_sub(1)
    }

    fn locate(&self, node_id: NodeId) -> Option<(usize, usize)> {
        let leaf = self.leaf_for(node_id);
        let entries = &self.leaves.get(leaf)?.entries;
        entries
            .binary_search_by_key(&node_id, |e| e.node_id)
            .ok()
            .map(|pos| (leaf, pos))
    }

    /// Looks up a subnode.
    pub fn get_subnode(&self, node_id: NodeId) -> Option<SubnodeLeafEntry> {
        self.locate(node_id)
            .map(|(leaf, pos)| self.leaves[leaf].entries[pos])
    }

    /// Looks up a subnode the caller knows must exist.
    pub fn subnode(&self, node_id: NodeId) -> Result<SubnodeLeafEntry> {
        self.get_subnode(node_id).ok_or(MailstoreError::SubnodeMissing {
            node_id: node_id.as_u32(),
        })
    }

    /// Opens a subnode's data tree.
    pub fn open_data_tree(&self, db: &mut NodeDatabase, node_id: NodeId) -> Result<DataTree> {
        DataTree::open(db, self.subnode(node_id)?.data)
    }

    /// Opens a subnode's own subnode tree.
    pub fn open_subnode_tree(&self, db: &mut NodeDatabase, node_id: NodeId) -> Result<SubnodeTree> {
        SubnodeTree::open(db, self.subnode(node_id)?.subnode)
    }

    /// Saves `data` (and `subnodes` when given) and records them under
    /// `node_id`, replacing any existing entry.
    ///
    /// A replaced entry's trees are released unless `data` or `subnodes` is
    /// that same tree, edited. An edited tree releases its own replaced
    /// blocks when it saves.
    pub fn insert_subnode_entry(
        &mut self,
        db: &mut NodeDatabase,
        node_id: NodeId,
        data: &mut DataTree,
        subnodes: Option<&mut SubnodeTree>,
    ) -> Result<()> {
        let data_origin = data.root();
        let (subnode, subnode_origin) = match subnodes {
            Some(tree) => {
                let origin = tree.root();
                (tree.save_changes(db)?, origin)
            }
            None => (BlockId::NONE, BlockId::NONE),
        };
        let data = data.save_changes(db)?;
        let replaced = self.insert_entry(SubnodeLeafEntry {
            node_id,
            data,
            subnode,
        })?;

        let Some(old) = replaced else {
            return Ok(());
        };
        if !old.data.is_none() && old.data != data_origin {
            DataTree::open(db, old.data)?.delete(db);
        }
        if !old.subnode.is_none() && old.subnode != subnode_origin {
            release_subnode(
                db,
                SubnodeLeafEntry {
                    node_id,
                    data: BlockId::NONE,
                    subnode: old.subnode,
                },
            )?;
        }
        trace!(node = %node_id, "replaced subnode entry");
        Ok(())
    }

    /// Records an entry whose trees are already saved, returning the entry
    /// it replaces. The replaced entry's trees are left to the caller.
    pub fn insert_entry(&mut self, entry: SubnodeLeafEntry) -> Result<Option<SubnodeLeafEntry>> {
        if self.leaves.is_empty() {
            self.leaves.push(LeafSlot::default());
        }
        let leaf = self.leaf_for(entry.node_id);
        let entries = &mut self.leaves[leaf].entries;
        let replaced = match entries.binary_search_by_key(&entry.node_id, |e| e.node_id) {
            Ok(pos) => Some(std::mem::replace(&mut entries[pos], entry)),
            Err(pos) => {
                entries.insert(pos, entry);
                None
            }
        };
        self.leaves[leaf].dirty = true;
        self.dirty = true;

        if self.leaves[leaf].entries.len() > MAX_SUBNODE_LEAF_ENTRIES {
            if self.leaves.len() >= MAX_SUBNODE_INDEX_ENTRIES {
                // Undo so the tree stays encodable.
                let entries = &mut self.leaves[leaf].entries;
                if let Ok(pos) = entries.binary_search_by_key(&entry.node_id, |e| e.node_id) {
                    entries.remove(pos);
                }
                return Err(MailstoreError::InvalidArgument(format!(
                    "subnode tree is full ({} leaves)",
                    MAX_SUBNODE_INDEX_ENTRIES
                )));
            }
            let upper = {
                let entries = &mut self.leaves[leaf].entries;
                entries.split_off(entries.len() / 2)
            };
            self.leaves.insert(
                leaf + 1,
                LeafSlot {
                    id: None,
                    entries: upper,
                    dirty: true,
                },
            );
            debug!(leaves = self.leaves.len(), "split subnode leaf");
        }
        Ok(replaced)
    }

    /// Removes a subnode and releases its data tree and nested subnodes.
    pub fn delete_subnode_entry(&mut self, db: &mut NodeDatabase, node_id: NodeId) -> Result<()> {
        let (leaf, pos) = self.locate(node_id).ok_or(MailstoreError::SubnodeMissing {
            node_id: node_id.as_u32(),
        })?;
        let entry = self.leaves[leaf].entries.remove(pos);
        self.leaves[leaf].dirty = true;
        self.dirty = true;
        if self.leaves[leaf].entries.is_empty() {
            let slot = self.leaves.remove(leaf);
            if let Some(id) = slot.id {
                self.retired.push(id);
            }
        }
        release_subnode(db, entry)
    }

    /// Writes changed leaves and the index, returning the new root.
    pub fn save_changes(&mut self, db: &mut NodeDatabase) -> Result<BlockId> {
        if !self.dirty {
            return Ok(self.root);
        }
        for id in self.retired.drain(..) {
            db.delete_block(id);
        }
        for slot in self.leaves.iter_mut().filter(|s| s.dirty) {
            let block = Block::SubnodeLeaf(slot.entries.clone());
            slot.id = Some(match slot.id {
                Some(id) => db.update_block(id, block)?,
                None => db.add_block(block)?,
            });
            slot.dirty = false;
        }
        if let Some(id) = self.index_block.take() {
            db.delete_block(id);
        }

        self.root = match self.leaves.len() {
            0 => BlockId::NONE,
            1 => self.leaves[0].id.unwrap_or(BlockId::NONE),
            _ => {
                let children = self
                    .leaves
                    .iter()
                    .map(|l| SubnodeIndexEntry {
                        node_id: l.first_key().unwrap_or(NodeId(0)),
                        block: l.id.unwrap_or(BlockId::NONE),
                    })
                    .collect();
                let id = db.add_block(Block::SubnodeIndex(children))?;
                self.index_block = Some(id);
                id
            }
        };
        self.dirty = false;
        debug!(root = %self.root, subnodes = self.len(), "saved subnode tree");
        Ok(self.root)
    }

    /// Releases every subnode and every block of the tree.
    pub fn delete(&mut self, db: &mut NodeDatabase) -> Result<()> {
        let leaves = std::mem::take(&mut self.leaves);
        for slot in &leaves {
            if let Some(id) = slot.id {
                db.delete_block(id);
            }
        }
        for id in self.retired.drain(..).chain(self.index_block.take()) {
            db.delete_block(id);
        }
        self.root = BlockId::NONE;
        self.dirty = false;
        for entry in leaves.into_iter().flat_map(|l| l.entries) {
            release_subnode(db, entry)?;
        }
        Ok(())
    }
}

/// Releases a subnode's data tree and, iteratively, every nested subnode.
fn release_subnode(db: &mut NodeDatabase, entry: SubnodeLeafEntry) -> Result<()> {
    let mut visited = HashSet::new();
    let mut stack = vec![entry];
    while let Some(entry) = stack.pop() {
        DataTree::open(db, entry.data)?.delete(db);
        if entry.subnode.is_none() {
            continue;
        }
        if !visited.insert(entry.subnode) {
            return Err(MailstoreError::corrupted(format!(
                "subnode tree {} is reachable twice",
                entry.subnode
            )));
        }
        let mut nested = SubnodeTree::open(db, entry.subnode)?;
        for slot in std::mem::take(&mut nested.leaves) {
            if let Some(id) = slot.id {
                db.delete_block(id);
            }
            stack.extend(slot.entries);
        }
        if let Some(id) = nested.index_block {
            db.delete_block(id);
        }
    }
    Ok(())
}
