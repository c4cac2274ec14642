//! Block and node b-trees.
//!
//! Both trees share one page format: 488 bytes of fixed-width records
//! followed by a count byte, a capacity byte, a record size byte and a
//! level byte, then the standard 16-byte page trailer. Leaves sit at level 0
//! and hold records; intermediate pages hold `(smallest key, page ref)` pairs.
//!
//! ```text
//! level 1:   [k0 -> p0][k1 -> p1] ...
//!                |          |
//! level 0:   [r r r ...] [r r r ...]
//! ```
//!
//! Changed pages are never written in place. See [`PageBTree`].

mod constants;
mod index;
mod page;
mod types;

pub use constants::{ENTRIES_SIZE, INTERMEDIATE_ENTRY_SIZE, MAX_INTERMEDIATE_ENTRIES};
pub use index::PageBTree;
pub use page::BTreeNode;
pub use types::{BTreeChild, BTreeEntry, BbtEntry, NbtEntry};

/// Block b-tree: block id to location, size and reference count.
pub type BlockBTree = PageBTree<BbtEntry>;

/// Node b-tree: node id to data tree, subnode tree and parent.
pub type NodeBTree = PageBTree<NbtEntry>;
