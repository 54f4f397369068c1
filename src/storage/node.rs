#![forbid(unsafe_code)]
//! Formatted tree nodes: block header, leaf and internal layouts.

use crate::primitives::bytes::{get_u16, get_u32, put_u16, put_u32};
use crate::storage::item::{Item, ItemHead, IH_SIZE};
use crate::storage::key::{Key, KEY_SIZE, MAX_KEY};
use crate::types::{BlockNo, FsError, Result};

/// Encoded block header length.
pub const BLKH_SIZE: usize = 24;
/// Encoded disk-child length.
pub const DC_SIZE: usize = 8;
/// Level of leaf nodes.
pub const LEAF_LEVEL: u16 = 1;
/// Highest level a node may have.
pub const MAX_HEIGHT: u16 = 8;

const LEVEL_OFFSET: usize = 0;
const NR_ITEMS_OFFSET: usize = 2;
const FREE_SPACE_OFFSET: usize = 4;
const RDKEY_OFFSET: usize = 8;

/// Bytes available to items in a leaf.
pub fn leaf_capacity(block_size: usize) -> usize {
    block_size - BLKH_SIZE
}

/// Largest body a single item may have.
pub fn max_item_body(block_size: usize) -> usize {
    leaf_capacity(block_size) - IH_SIZE
}

/// Maximum number of keys in an internal node.
pub fn max_keys(block_size: usize) -> usize {
    (block_size - BLKH_SIZE - DC_SIZE) / (KEY_SIZE + DC_SIZE)
}

/// Maximum number of children of an internal node.
pub fn max_children(block_size: usize) -> usize {
    max_keys(block_size) + 1
}

/// Decoded block header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHead {
    /// 1 for leaves, greater for internal nodes.
    pub level: u16,
    /// Items (leaf) or keys (internal).
    pub nr_items: u16,
    /// Unused bytes.
    pub free_space: u16,
    /// Right-delimiting key.
    pub right_delim_key: Key,
}

impl BlockHead {
    /// Decodes the header at the start of a block.
    pub fn decode(src: &[u8]) -> BlockHead {
        BlockHead {
            level: get_u16(src, LEVEL_OFFSET),
            nr_items: get_u16(src, NR_ITEMS_OFFSET),
            free_space: get_u16(src, FREE_SPACE_OFFSET),
            right_delim_key: Key::decode(&src[RDKEY_OFFSET..]),
        }
    }

    /// Encodes the header at the start of a block.
    pub fn encode(&self, dst: &mut [u8]) {
        put_u16(dst, LEVEL_OFFSET, self.level);
        put_u16(dst, NR_ITEMS_OFFSET, self.nr_items);
        put_u16(dst, FREE_SPACE_OFFSET, self.free_space);
        put_u16(dst, FREE_SPACE_OFFSET + 2, 0);
        self.right_delim_key.encode(&mut dst[RDKEY_OFFSET..]);
    }
}

/// Pointer from an internal node to a child.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DiskChild {
    /// Child block.
    pub block: BlockNo,
    /// Bytes used in the child (block size minus header minus free space).
    pub size: u16,
}

/// Leaf node content.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeafNode {
    /// Right-delimiting key.
    pub rdkey: Key,
    /// Items in key order.
    pub items: Vec<Item>,
}

impl LeafNode {
    /// Empty leaf at the right edge of the tree.
    pub fn empty() -> LeafNode {
        LeafNode {
            rdkey: MAX_KEY,
            items: Vec::new(),
        }
    }

    /// Bytes consumed by item headers and bodies.
    pub fn used_space(&self) -> usize {
        self.items.iter().map(Item::size).sum()
    }

    /// Position of `key`, or the insertion point.
    pub fn search(&self, key: &Key) -> std::result::Result<usize, usize> {
        self.items.binary_search_by(|item| item.key.cmp(key))
    }
}

/// Internal node content: `keys.len() + 1 == children.len()`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InternalNode {
    /// Node level, at least 2.
    pub level: u16,
    /// Right-delimiting key.
    pub rdkey: Key,
    /// Separators; `keys[i]` is the first key of the subtree of `children[i + 1]`.
    pub keys: Vec<Key>,
    /// Child pointers.
    pub children: Vec<DiskChild>,
}

impl InternalNode {
    /// Bytes consumed by keys and child pointers.
    pub fn used_space(&self) -> usize {
        self.keys.len() * KEY_SIZE + self.children.len() * DC_SIZE
    }

    /// Index of the child whose subtree may contain `key`: the child right of
    /// the largest separator not greater than `key`.
    pub fn child_index(&self, key: &Key) -> usize {
        self.keys.partition_point(|sep| sep <= key)
    }
}

/// A decoded formatted node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Node {
    /// Level 1.
    Leaf(LeafNode),
    /// Level 2 and above.
    Internal(InternalNode),
}

impl Node {
    /// Level stored in the header.
    pub fn level(&self) -> u16 {
        match self {
            Node::Leaf(_) => LEAF_LEVEL,
            Node::Internal(node) => node.level,
        }
    }

    /// Right-delimiting key.
    pub fn rdkey(&self) -> Key {
        match self {
            Node::Leaf(leaf) => leaf.rdkey,
            Node::Internal(node) => node.rdkey,
        }
    }

    /// Replaces the right-delimiting key.
    pub fn set_rdkey(&mut self, key: Key) {
        match self {
            Node::Leaf(leaf) => leaf.rdkey = key,
            Node::Internal(node) => node.rdkey = key,
        }
    }

    /// Bytes used below the header.
    pub fn used_space(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.used_space(),
            Node::Internal(node) => node.used_space(),
        }
    }

    /// Leaf view.
    pub fn as_leaf(&self) -> Result<&LeafNode> {
        match self {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => Err(FsError::TreeInconsistent("expected a leaf node")),
        }
    }

    /// Internal view.
    pub fn as_internal(&self) -> Result<&InternalNode> {
        match self {
            Node::Internal(node) => Ok(node),
            Node::Leaf(_) => Err(FsError::TreeInconsistent("expected an internal node")),
        }
    }

    /// Decodes and sanity-checks a node.
    pub fn decode(data: &[u8]) -> Result<Node> {
        let head = BlockHead::decode(data);
        match head.level {
            LEAF_LEVEL => decode_leaf(data, &head).map(Node::Leaf),
            level if level > LEAF_LEVEL && level <= MAX_HEIGHT => {
                decode_internal(data, &head).map(Node::Internal)
            }
            _ => Err(FsError::TreeInconsistent("block is not a formatted node")),
        }
    }

    /// Encodes the node over the whole block.
    ///
    /// Panics in debug builds if the content does not fit; the balancer
    /// guarantees it does.
    pub fn encode(&self, dst: &mut [u8]) {
        let block_size = dst.len();
        debug_assert!(self.used_space() <= leaf_capacity(block_size));
        dst.fill(0);
        match self {
            Node::Leaf(leaf) => {
                let mut loc = block_size;
                for (i, item) in leaf.items.iter().enumerate() {
                    loc -= item.body_len();
                    let head_at = BLKH_SIZE + i * IH_SIZE;
                    item.head(loc as u16).encode(&mut dst[head_at..head_at + IH_SIZE]);
                    item.encode_body(&mut dst[loc..loc + item.body_len()]);
                }
                BlockHead {
                    level: LEAF_LEVEL,
                    nr_items: leaf.items.len() as u16,
                    free_space: (leaf_capacity(block_size) - leaf.used_space()) as u16,
                    right_delim_key: leaf.rdkey,
                }
                .encode(dst);
            }
            Node::Internal(node) => {
                for (i, key) in node.keys.iter().enumerate() {
                    key.encode(&mut dst[BLKH_SIZE + i * KEY_SIZE..]);
                }
                let dc_base = BLKH_SIZE + node.keys.len() * KEY_SIZE;
                for (i, child) in node.children.iter().enumerate() {
                    let at = dc_base + i * DC_SIZE;
                    put_u32(dst, at, child.block.0);
                    put_u16(dst, at + 4, child.size);
                }
                BlockHead {
                    level: node.level,
                    nr_items: node.keys.len() as u16,
                    free_space: (leaf_capacity(block_size) - node.used_space()) as u16,
                    right_delim_key: node.rdkey,
                }
                .encode(dst);
            }
        }
    }
}

/// Reads the level field without validating the node.
pub fn peek_level(data: &[u8]) -> u16 {
    get_u16(data, LEVEL_OFFSET)
}

fn decode_leaf(data: &[u8], head: &BlockHead) -> Result<LeafNode> {
    let block_size = data.len();
    let nr = usize::from(head.nr_items);
    if BLKH_SIZE + nr * IH_SIZE > block_size {
        return Err(FsError::TreeInconsistent("leaf item count too large"));
    }
    let mut items = Vec::with_capacity(nr);
    let mut expected_end = block_size;
    let mut used = 0usize;
    for i in 0..nr {
        let at = BLKH_SIZE + i * IH_SIZE;
        let ih = ItemHead::decode(&data[at..at + IH_SIZE]);
        let len = usize::from(ih.len);
        let loc = usize::from(ih.location);
        if loc + len != expected_end || loc < BLKH_SIZE + nr * IH_SIZE {
            return Err(FsError::TreeInconsistent("leaf item body misplaced"));
        }
        expected_end = loc;
        used += IH_SIZE + len;
        let item = Item::decode(&ih, &data[loc..loc + len])?;
        if items.last().map_or(false, |prev: &Item| prev.key >= item.key) {
            return Err(FsError::TreeInconsistent("leaf keys out of order"));
        }
        items.push(item);
    }
    if usize::from(head.free_space) != leaf_capacity(block_size) - used {
        return Err(FsError::TreeInconsistent("leaf free space mismatch"));
    }
    Ok(LeafNode {
        rdkey: head.right_delim_key,
        items,
    })
}

fn decode_internal(data: &[u8], head: &BlockHead) -> Result<InternalNode> {
    let block_size = data.len();
    let nr = usize::from(head.nr_items);
    if nr > max_keys(block_size) {
        return Err(FsError::TreeInconsistent("internal key count too large"));
    }
    let used = nr * KEY_SIZE + (nr + 1) * DC_SIZE;
    if usize::from(head.free_space) != leaf_capacity(block_size) - used {
        return Err(FsError::TreeInconsistent("internal free space mismatch"));
    }
    let keys: Vec<Key> = (0..nr)
        .map(|i| Key::decode(&data[BLKH_SIZE + i * KEY_SIZE..]))
        .collect();
    if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(FsError::TreeInconsistent("internal keys out of order"));
    }
    let dc_base = BLKH_SIZE + nr * KEY_SIZE;
    let mut children = Vec::with_capacity(nr + 1);
    for i in 0..=nr {
        let at = dc_base + i * DC_SIZE;
        let block = BlockNo(get_u32(data, at));
        if block.is_none() {
            return Err(FsError::TreeInconsistent("internal node points at block 0"));
        }
        children.push(DiskChild {
            block,
            size: get_u16(data, at + 4),
        });
    }
    Ok(InternalNode {
        level: head.level,
        rdkey: head.right_delim_key,
        keys,
        children,
    })
}
