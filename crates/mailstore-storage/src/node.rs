//! Nodes: a data tree plus a subnode tree, registered in the node b-tree.

use crate::btree::NbtEntry;
use crate::data_tree::DataTree;
use crate::ndb::NodeDatabase;
use crate::subnode::SubnodeTree;
use mailstore_common::{MailstoreError, NodeId, Result};
use tracing::{debug, trace};

/// An open node. Edits stay in memory until [`Node::save`].
#[derive(Debug, Clone)]
pub struct Node {
    node_id: NodeId,
    parent: NodeId,
    data: DataTree,
    subnodes: SubnodeTree,
}

impl Node {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn parent(&self) -> NodeId {
        self.parent
    }

    pub fn set_parent(&mut self, parent: NodeId) {
        self.parent = parent;
    }

    pub fn data_tree(&self) -> &DataTree {
        &self.data
    }

    pub fn data_tree_mut(&mut self) -> &mut DataTree {
        &mut self.data
    }

    /// Moves the data tree out, leaving an empty one. Heap users take the
    /// tree, wrap it, and hand it back with [`Node::set_data_tree`].
    pub fn take_data_tree(&mut self) -> DataTree {
        std::mem::take(&mut self.data)
    }

    pub fn set_data_tree(&mut self, data: DataTree) {
        self.data = data;
    }

    pub fn subnodes(&self) -> &SubnodeTree {
        &self.subnodes
    }

    pub fn subnodes_mut(&mut self) -> &mut SubnodeTree {
        &mut self.subnodes
    }

    /// Saves the subnode tree, then the data tree, then records both roots
    /// in the node b-tree.
    pub fn save(&mut self, db: &mut NodeDatabase) -> Result<NbtEntry> {
        let subnode = self.subnodes.save_changes(db)?;
        let data = self.data.save_changes(db)?;
        let entry = NbtEntry {
            node_id: self.node_id,
            data,
            subnode,
            parent: self.parent,
        };
        db.nbt
            .upsert(db.store.device.as_ref(), &mut db.store.header, entry)?;
        trace!(node = %self.node_id, data = %data, subnode = %subnode, "saved node");
        Ok(entry)
    }
}

impl NodeDatabase {
    /// A new, unsaved node. Fails when `node_id` is already registered.
    pub fn create_node(&mut self, node_id: NodeId, parent: NodeId) -> Result<Node> {
        if self.find_node(node_id)?.is_some() {
            return Err(MailstoreError::DuplicateKey {
                key: node_id.as_u32() as u64,
            });
        }
        Ok(Node {
            node_id,
            parent,
            data: DataTree::new(),
            subnodes: SubnodeTree::new(),
        })
    }

    pub fn find_node(&mut self, node_id: NodeId) -> Result<Option<NbtEntry>> {
        self.nbt
            .find(self.store.device.as_ref(), node_id.as_u32() as u64)
    }

    pub fn open_node(&mut self, node_id: NodeId) -> Result<Node> {
        let entry = self
            .find_node(node_id)?
            .ok_or(MailstoreError::NodeNotFound {
                node_id: node_id.as_u32(),
            })?;
        let data = DataTree::open(self, entry.data)?;
        let subnodes = SubnodeTree::open(self, entry.subnode)?;
        Ok(Node {
            node_id,
            parent: entry.parent,
            data,
            subnodes,
        })
    }

    /// Releases a node's blocks and subnodes and removes it from the node
    /// b-tree.
    pub fn delete_node(&mut self, node_id: NodeId) -> Result<()> {
        let mut node = self.open_node(node_id)?;
        node.data.delete(self);
        node.subnodes.delete(self)?;
        self.nbt.delete(
            self.store.device.as_ref(),
            &mut self.store.header,
            node_id.as_u32() as u64,
        )?;
        debug!(node = %node_id, "deleted node");
        Ok(())
    }

    /// Every registered node in id order.
    pub fn node_entries(&mut self) -> Result<Vec<NbtEntry>> {
        self.nbt.entries(self.store.device.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::SubnodeLeafEntry;
    use crate::device::MemoryDevice;
    use crate::heap::{ClientSignature, HeapOnNode};
    use mailstore_common::{BlockId, NodeType, StorageConfig};

    fn database() -> NodeDatabase {
        let config = StorageConfig {
            fsync_enabled: false,
            ..StorageConfig::default()
        };
        NodeDatabase::create(MemoryDevice::new(), config).unwrap()
    }

    #[test]
    fn test_create_save_open() {
        let mut db = database();
        let folder = db.allocate_next_node_id(NodeType::NormalFolder).unwrap();
        let message = db.allocate_next_node_id(NodeType::NormalMessage).unwrap();

        let mut node = db.create_node(message, folder).unwrap();
        node.data_tree_mut().set_data(&mut db, b"message body").unwrap();
        let entry = node.save(&mut db).unwrap();
        assert_eq!(entry.parent, folder);
        assert!(entry.subnode.is_none());
        db.save_changes().unwrap();

        let mut node = db.open_node(message).unwrap();
        assert_eq!(node.parent(), folder);
        assert_eq!(
            &node.data_tree_mut().get_data(&mut db).unwrap()[..],
            b"message body"
        );
        assert!(matches!(
            db.create_node(message, folder),
            Err(MailstoreError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn test_open_missing_node() {
        let mut db = database();
        let missing = NodeId::new(NodeType::NormalMessage, 0x77);
        assert!(matches!(
            db.open_node(missing),
            Err(MailstoreError::NodeNotFound { .. })
        ));
        assert!(db.find_node(missing).unwrap().is_none());
    }

    #[test]
    fn test_node_with_heap_and_subnode() {
        let mut db = database();
        let id = db.allocate_next_node_id(NodeType::NormalMessage).unwrap();
        let mut node = db.create_node(id, NodeId(0)).unwrap();

        let mut heap = HeapOnNode::create(ClientSignature::PropertyContext);
        let item = heap.add_item_to_heap(&mut db, b"subject").unwrap();
        heap.flush_to_data_tree(&mut db).unwrap();
        node.set_data_tree(heap.into_data_tree());

        let attachment = db.allocate_next_node_id(NodeType::Attachment).unwrap();
        let mut body = DataTree::new();
        body.set_data(&mut db, &[9u8; 20_000]).unwrap();
        node.subnodes_mut()
            .insert_subnode_entry(&mut db, attachment, &mut body, None)
            .unwrap();
        node.save(&mut db).unwrap();
        db.save_changes().unwrap();

        let mut node = db.open_node(id).unwrap();
        let data = node.take_data_tree();
        let mut heap = HeapOnNode::open(&mut db, data).unwrap();
        assert_eq!(&heap.get_heap_item(&mut db, item).unwrap()[..], b"subject");
        let mut body = node.subnodes().open_data_tree(&mut db, attachment).unwrap();
        assert_eq!(body.len(), 20_000);
        assert_eq!(body.get_data(&mut db).unwrap().len(), 20_000);
    }

    #[test]
    fn test_delete_node_frees_blocks() {
        let mut db = database();
        let id = db.allocate_next_node_id(NodeType::NormalMessage).unwrap();
        let mut node = db.create_node(id, NodeId(0)).unwrap();
        node.data_tree_mut().set_data(&mut db, &[1u8; 30_000]).unwrap();
        node.subnodes_mut()
            .insert_entry(SubnodeLeafEntry {
                node_id: NodeId::new(NodeType::Attachment, 1),
                data: BlockId::NONE,
                subnode: BlockId::NONE,
            })
            .unwrap();
        let entry = node.save(&mut db).unwrap();
        db.save_changes().unwrap();
        assert_eq!(db.block_ref_count(entry.data).unwrap(), Some(2));

        db.delete_node(id).unwrap();
        db.save_changes().unwrap();
        assert!(db.find_node(id).unwrap().is_none());
        assert!(db.block_ref_count(entry.data).unwrap().is_none());
        assert!(db.block_ref_count(entry.subnode).unwrap().is_none());
        assert!(db.node_entries().unwrap().is_empty());
    }

    #[test]
    fn test_node_entries_in_order() {
        let mut db = database();
        let mut ids = Vec::new();
        for _ in 0..40 {
            let id = db.allocate_next_node_id(NodeType::NormalMessage).unwrap();
            let mut node = db.create_node(id, NodeId(0)).unwrap();
            node.save(&mut db).unwrap();
            ids.push(id);
        }
        db.save_changes().unwrap();
        let listed: Vec<NodeId> = db.node_entries().unwrap().iter().map(|e| e.node_id).collect();
        assert_eq!(listed, ids);
    }
}
