//! On-disk structures and the balanced item tree.
//!
//! Keys and items describe every object; formatted nodes hold them; the
//! tree keeps nodes balanced across insert, paste, cut and delete; the
//! bitmap allocator and the superblock describe the rest of the device.

/// Free-block bitmap allocator.
pub mod bitmap;

/// Items and their unit model.
pub mod item;

/// Composite keys and their order.
pub mod key;

/// Leaf and internal node layouts.
pub mod node;

/// The fixed-location volume record.
pub mod superblock;

/// Search paths, planning and balancing.
pub mod tree;

pub use item::{DirEntry, Item, ItemBody, StatData};
pub use key::{Key, MAX_KEY, MIN_KEY};
pub use superblock::{FsState, Superblock};
pub use tree::{RootInfo, Tree, TreeTxn};
