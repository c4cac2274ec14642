//! End-to-end tests for the mailstore storage engine.
//!
//! Each test drives a whole session: nodes, data trees, subnode trees and
//! heaps are edited, committed, and read back through a fresh session over
//! the same bytes.

use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Instant;
use tempfile::tempdir;

use mailstore_common::{HeapId, MailstoreError, NodeId, NodeType, StorageConfig};
use mailstore_storage::{
    Block, ClientSignature, DataTree, HeapOnNode, MemoryDevice, NodeDatabase, SubnodeTree,
};

fn config() -> StorageConfig {
    StorageConfig {
        fsync_enabled: false,
        ..StorageConfig::default()
    }
}

fn one_byte(i: usize) -> u8 {
    (i % 255) as u8 + 1
}

fn reopen(device: &MemoryDevice) -> NodeDatabase {
    NodeDatabase::open(device.clone(), config()).unwrap()
}

// =============================================================================
// Heap-on-node
// =============================================================================

#[test]
fn test_heap_basic_cycle() {
    let device = MemoryDevice::new();
    let mut db = NodeDatabase::create(device.clone(), config()).unwrap();
    let node_id = db.allocate_next_node_id(NodeType::NormalMessage).unwrap();
    let mut node = db.create_node(node_id, NodeId(0)).unwrap();

    let mut heap = HeapOnNode::create(ClientSignature::PropertyContext);
    let first = heap.add_item_to_heap(&mut db, b"A").unwrap();
    assert_eq!(first, HeapId::new(0, 1));

    let start = Instant::now();
    let mut ids = Vec::with_capacity(4000);
    for i in 0..4000usize {
        ids.push(heap.add_item_to_heap(&mut db, &[one_byte(i)]).unwrap());
    }
    println!(
        "  4000 heap items over {} blocks in {:?}",
        heap.block_count(),
        start.elapsed()
    );
    // 2047 items per block at most.
    assert_eq!(heap.block_count(), 2);
    assert_eq!(ids[2045], HeapId::new(0, 2047));
    assert_eq!(ids[2046], HeapId::new(1, 1));

    heap.remove_item_from_heap(&mut db, first).unwrap();
    assert!(heap.get_heap_item(&mut db, first).unwrap().is_empty());
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(&heap.get_heap_item(&mut db, *id).unwrap()[..], &[one_byte(i)]);
    }

    heap.flush_to_data_tree(&mut db).unwrap();
    node.set_data_tree(heap.into_data_tree());
    node.save(&mut db).unwrap();
    db.save_changes().unwrap();
    drop(db);

    let mut db = reopen(&device);
    let mut node = db.open_node(node_id).unwrap();
    let mut heap = HeapOnNode::open(&mut db, node.take_data_tree()).unwrap();
    assert_eq!(heap.client_type().unwrap(), ClientSignature::PropertyContext);
    assert!(heap.get_heap_item(&mut db, first).unwrap().is_empty());
    for (i, id) in ids.iter().enumerate().step_by(97) {
        assert_eq!(&heap.get_heap_item(&mut db, *id).unwrap()[..], &[one_byte(i)]);
    }
}

#[test]
fn test_heap_refuses_oversized_item() {
    let mut db = NodeDatabase::create(MemoryDevice::new(), config()).unwrap();
    let mut heap = HeapOnNode::create(ClientSignature::TableContext);
    let kept = heap.add_item_to_heap(&mut db, b"unchanged").unwrap();
    let blocks = heap.block_count();

    let err = heap.add_item_to_heap(&mut db, &vec![0xAB; 3581]).unwrap_err();
    assert!(matches!(err, MailstoreError::HeapItemTooLarge { size: 3581, .. }));
    assert_eq!(heap.block_count(), blocks);
    assert_eq!(&heap.get_heap_item(&mut db, kept).unwrap()[..], b"unchanged");
}

#[test]
fn test_heap_random_replacements() {
    let mut db = NodeDatabase::create(MemoryDevice::new(), config()).unwrap();
    let mut heap = HeapOnNode::create(ClientSignature::BTreeOnHeap);
    let mut rng = rand::rng();
    let mut live: Vec<(HeapId, Vec<u8>)> = Vec::new();

    for round in 0..600 {
        let len = rng.random_range(1..=1200);
        let payload = vec![(round % 251) as u8; len];
        if !live.is_empty() && rng.random_bool(0.4) {
            let pick = rng.random_range(0..live.len());
            let id = heap.replace_heap_item(&mut db, live[pick].0, &payload).unwrap();
            live[pick] = (id, payload);
        } else {
            let id = heap.add_item_to_heap(&mut db, &payload).unwrap();
            live.push((id, payload));
        }
    }

    let root = heap.save_changes(&mut db).unwrap();
    db.save_changes().unwrap();
    let data = DataTree::open(&mut db, root).unwrap();
    let mut heap = HeapOnNode::open(&mut db, data).unwrap();
    for (id, payload) in &live {
        assert_eq!(&heap.get_heap_item(&mut db, *id).unwrap()[..], &payload[..]);
    }
}

// =============================================================================
// Corruption and crash behavior
// =============================================================================

#[test]
fn test_tampered_block_is_detected() {
    let device = MemoryDevice::new();
    let mut db = NodeDatabase::create(device.clone(), config()).unwrap();
    let marker: Vec<u8> = b"TAMPER-CHECK-".iter().copied().cycle().take(1300).collect();
    let id = db.add_block(Block::Data(marker.clone().into())).unwrap();
    db.save_changes().unwrap();
    drop(db);

    let image = device.snapshot();
    let offset = image
        .windows(marker.len())
        .position(|w| w == &marker[..])
        .unwrap();
    device.corrupt_byte(offset as u64 + 17, 0x40);

    let mut db = reopen(&device);
    let err = db.get_block(id).unwrap_err();
    assert!(err.is_corruption(), "{err}");
}

#[test]
fn test_interrupted_commit_keeps_previous_state() {
    let device = MemoryDevice::new();
    let mut db = NodeDatabase::create(device.clone(), config()).unwrap();
    let committed = db.allocate_next_node_id(NodeType::NormalFolder).unwrap();
    let mut node = db.create_node(committed, NodeId(0)).unwrap();
    node.data_tree_mut().set_data(&mut db, b"committed").unwrap();
    node.save(&mut db).unwrap();
    db.save_changes().unwrap();
    let unique = db.header().unique;

    let pending = db.allocate_next_node_id(NodeType::NormalFolder).unwrap();
    let mut node = db.create_node(pending, committed).unwrap();
    node.save(&mut db).unwrap();
    db.begin_saving_changes().unwrap();
    assert_eq!(db.header().unique, unique + 1);
    drop(db);

    let mut db = reopen(&device);
    assert!(!db.is_amap_valid());
    assert!(db.find_node(pending).unwrap().is_none());
    let mut node = db.open_node(committed).unwrap();
    assert_eq!(&node.data_tree_mut().get_data(&mut db).unwrap()[..], b"committed");
    assert!(matches!(
        db.begin_saving_changes(),
        Err(MailstoreError::AllocationMapInvalid)
    ));
}

// =============================================================================
// Nodes
// =============================================================================

#[test]
fn test_nodes_survive_file_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("archive.pst");
    let folder;
    let message;
    let attachment;
    {
        let mut db = NodeDatabase::create_file(&path, config()).unwrap();
        folder = db.allocate_next_node_id(NodeType::NormalFolder).unwrap();
        message = db.allocate_next_node_id(NodeType::NormalMessage).unwrap();
        attachment = db.allocate_next_node_id(NodeType::Attachment).unwrap();

        let mut node = db.create_node(folder, NodeId(0)).unwrap();
        node.data_tree_mut().set_data(&mut db, b"inbox").unwrap();
        node.save(&mut db).unwrap();

        let mut node = db.create_node(message, folder).unwrap();
        node.data_tree_mut()
            .set_data(&mut db, &vec![0x5A; 100_000])
            .unwrap();
        let mut body = DataTree::new();
        body.set_data(&mut db, b"attached file").unwrap();
        let mut nested = SubnodeTree::new();
        node.subnodes_mut()
            .insert_subnode_entry(&mut db, attachment, &mut body, Some(&mut nested))
            .unwrap();
        node.save(&mut db).unwrap();
        db.save_changes().unwrap();
    }

    let mut db = NodeDatabase::open_file(&path, config()).unwrap();
    assert!(db.is_amap_valid());
    let listed: Vec<NodeId> = db.node_entries().unwrap().iter().map(|e| e.node_id).collect();
    assert_eq!(listed, vec![folder, message]);

    let mut node = db.open_node(message).unwrap();
    assert_eq!(node.parent(), folder);
    let data = node.data_tree_mut().get_data(&mut db).unwrap();
    assert_eq!(data.len(), 100_000);
    assert!(data.iter().all(|&b| b == 0x5A));
    let mut body = node.subnodes().open_data_tree(&mut db, attachment).unwrap();
    assert_eq!(&body.get_data(&mut db).unwrap()[..], b"attached file");
}

#[test]
fn test_random_node_churn() {
    let device = MemoryDevice::new();
    let mut db = NodeDatabase::create(device.clone(), config()).unwrap();
    let mut rng = rand::rng();
    let mut nodes = Vec::new();

    let start = Instant::now();
    for _ in 0..300 {
        let id = db.allocate_next_node_id(NodeType::NormalMessage).unwrap();
        let len = rng.random_range(0..20_000);
        let fill = rng.random::<u8>();
        let mut node = db.create_node(id, NodeId(0)).unwrap();
        node.data_tree_mut().set_data(&mut db, &vec![fill; len]).unwrap();
        node.save(&mut db).unwrap();
        nodes.push((id, fill, len));
    }
    db.save_changes().unwrap();
    println!("  300 nodes committed in {:?}", start.elapsed());

    nodes.shuffle(&mut rng);
    let (gone, kept) = nodes.split_at(150);
    for (id, _, _) in gone {
        db.delete_node(*id).unwrap();
    }
    db.save_changes().unwrap();

    let mut db = reopen(&device);
    assert_eq!(db.node_entries().unwrap().len(), kept.len());
    for (id, _, _) in gone {
        assert!(db.find_node(*id).unwrap().is_none());
    }
    for (id, fill, len) in kept {
        let mut node = db.open_node(*id).unwrap();
        let data = node.data_tree_mut().get_data(&mut db).unwrap();
        assert_eq!(data.len(), *len);
        assert!(data.iter().all(|b| b == fill));
    }
}
