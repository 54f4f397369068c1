#![forbid(unsafe_code)]
//! Balancing engine: `fix_nodes` plans a mutation level by level into an
//! overlay of final node contents and reserves the new blocks it needs;
//! `do_balance` writes the overlay out.
//!
//! Delimiting keys follow two rules. A node's left delimiting key lives in
//! its left common ancestor (CFL) and equals the smallest key of its subtree;
//! a node's right delimiting key equals the left delimiting key of its right
//! neighbor at the same level. When a separator changes value, every node on
//! the right spine of the subtree left of it gets the new value as its
//! right delimiting key.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::primitives::cache::BlockRef;
use crate::storage::key::{Key, MAX_KEY, MIN_KEY};
use crate::storage::node::{DiskChild, InternalNode, Node, MAX_HEIGHT};
use crate::types::{BlockNo, FsError, Result};

use super::path::Path;
use super::virtual_node::{
    distribute, InternalUnits, LeafUnits, PlanKind, Replace, Unit, VirtualNode,
};
use super::{Mutation, RootInfo, Tree, TreeTxn};

// New nodes are addressed by placeholders counting down from here until
// their blocks are reserved.
const PLACEHOLDER_BASE: u32 = u32::MAX;

fn is_placeholder(block: BlockNo) -> bool {
    block.0 > PLACEHOLDER_BASE - 64
}

/// Decision taken at one level.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LevelPlan {
    /// Level of the balanced node.
    pub level: u16,
    /// What happened to it.
    pub kind: PlanKind,
}

/// A fully planned mutation: every node that changes, every block freed,
/// and the blocks reserved for new nodes.
pub struct BalancePlan {
    levels: SmallVec<[LevelPlan; 8]>,
    nodes: FxHashMap<BlockNo, Node>,
    pinned: FxHashMap<BlockNo, BlockRef>,
    freed: Vec<BlockNo>,
    new_root: Option<RootInfo>,
    reserved: Vec<BlockNo>,
}

impl BalancePlan {
    /// Per-level decisions, leaf level first.
    pub fn levels(&self) -> &[LevelPlan] {
        &self.levels
    }

    /// Blocks reserved for new nodes.
    pub fn new_blocks(&self) -> usize {
        self.reserved.len()
    }

    /// Nodes that will be freed.
    pub fn freed(&self) -> &[BlockNo] {
        &self.freed
    }
}

struct Slot {
    node: Node,
    dirty: bool,
}

struct Neighbor {
    block: BlockNo,
    parent: BlockNo,
    parent_pos: usize,
}

enum Pending {
    Leaf(usize, Mutation),
    Internal(Replace),
}

struct Planner<'t> {
    tree: &'t Tree,
    block_size: usize,
    slots: FxHashMap<BlockNo, Slot>,
    pinned: FxHashMap<BlockNo, BlockRef>,
    placeholders: u32,
    freed: Vec<BlockNo>,
    boundaries: Vec<(Key, u16)>,
    levels: SmallVec<[LevelPlan; 8]>,
    root: RootInfo,
    new_root: Option<RootInfo>,
}

/// What one level hands to its parent.
struct LevelResult {
    group: SmallVec<[Unit; 3]>,
    unchanged_shape: bool,
}

impl<'t> Planner<'t> {
    fn new(tree: &'t Tree, path: &Path) -> Self {
        let mut pinned = FxHashMap::default();
        let mut slots = FxHashMap::default();
        for element in path.elements() {
            pinned.insert(element.block.block(), element.block.clone());
            slots.insert(
                element.block.block(),
                Slot {
                    node: element.node.clone(),
                    dirty: false,
                },
            );
        }
        Self {
            tree,
            block_size: tree.cache().block_size(),
            slots,
            pinned,
            placeholders: 0,
            freed: Vec::new(),
            boundaries: Vec::new(),
            levels: SmallVec::new(),
            root: tree.root(),
            new_root: None,
        }
    }

    fn node(&mut self, block: BlockNo) -> Result<Node> {
        if let Some(slot) = self.slots.get(&block) {
            return Ok(slot.node.clone());
        }
        if is_placeholder(block) {
            return Err(FsError::TreeInconsistent("unknown new node"));
        }
        let buf = self.tree.cache().get(block)?;
        let node = Node::decode(&buf.data())?;
        self.pinned.insert(block, buf);
        self.slots.insert(
            block,
            Slot {
                node: node.clone(),
                dirty: false,
            },
        );
        Ok(node)
    }

    fn put(&mut self, block: BlockNo, node: Node) {
        self.slots.insert(block, Slot { node, dirty: true });
    }

    fn placeholder(&mut self) -> BlockNo {
        let block = BlockNo(PLACEHOLDER_BASE - self.placeholders);
        self.placeholders += 1;
        block
    }

    fn internal(&mut self, block: BlockNo) -> Result<InternalNode> {
        match self.node(block)? {
            Node::Internal(node) => Ok(node),
            Node::Leaf(_) => Err(FsError::TreeInconsistent("expected an internal node")),
        }
    }

    fn set_key(&mut self, block: BlockNo, pos: usize, key: Key) -> Result<()> {
        let mut node = self.internal(block)?;
        let slot = node
            .keys
            .get_mut(pos)
            .ok_or(FsError::TreeInconsistent("key position out of range"))?;
        if *slot != key {
            *slot = key;
            self.put(block, Node::Internal(node));
        }
        Ok(())
    }

    fn set_child_size(&mut self, parent: BlockNo, pos: usize, size: usize) -> Result<()> {
        let mut node = self.internal(parent)?;
        let child = node
            .children
            .get_mut(pos)
            .ok_or(FsError::TreeInconsistent("child position out of range"))?;
        if usize::from(child.size) != size {
            child.size = size as u16;
            self.put(parent, Node::Internal(node));
        }
        Ok(())
    }

    /// Smallest key stored under `block`; `MAX_KEY` for an empty leaf.
    fn subtree_min_key(&mut self, mut block: BlockNo) -> Result<Key> {
        for _ in 0..MAX_HEIGHT {
            match self.node(block)? {
                Node::Leaf(leaf) => return Ok(leaf.items.first().map_or(MAX_KEY, |i| i.key)),
                Node::Internal(node) => {
                    block = node
                        .children
                        .first()
                        .map(|c| c.block)
                        .ok_or(FsError::TreeInconsistent("internal node without children"))?;
                }
            }
        }
        Err(FsError::TreeInconsistent("subtree deeper than the tree"))
    }

    /// Left (`left == true`) or right neighbor of path element `index`.
    fn neighbor(&mut self, path: &Path, index: usize, left: bool) -> Result<Option<Neighbor>> {
        let common = if left {
            path.left_common(index)
        } else {
            path.right_common(index)
        };
        let Some((ancestor, key_pos)) = common else {
            return Ok(None);
        };
        let level = path.level_at(index);
        let mut parent = path.elements()[ancestor].block.block();
        let mut parent_pos = if left { key_pos } else { key_pos + 1 };
        let mut block = self.internal(parent)?.children[parent_pos].block;
        let mut current_level = path.level_at(ancestor) - 1;
        while current_level > level {
            let node = self.internal(block)?;
            parent = block;
            parent_pos = if left { node.children.len() - 1 } else { 0 };
            block = node.children[parent_pos].block;
            current_level -= 1;
        }
        Ok(Some(Neighbor {
            block,
            parent,
            parent_pos,
        }))
    }

    fn common_key(&mut self, path: &Path, common: Option<(usize, usize)>) -> Result<Option<(BlockNo, usize, Key)>> {
        match common {
            Some((ancestor, pos)) => {
                let block = path.elements()[ancestor].block.block();
                let key = self.internal(block)?.keys[pos];
                Ok(Some((block, pos, key)))
            }
            None => Ok(None),
        }
    }

    fn run(&mut self, path: &Path, mutation: Mutation) -> Result<()> {
        let mut index = path.elements().len() - 1;
        let mut pending = Pending::Leaf(path.position(), mutation);
        loop {
            let block = path.elements()[index].block.block();
            let node = self.node(block)?;
            let result = match (&node, pending) {
                (Node::Leaf(_), Pending::Leaf(pos, mutation)) => {
                    self.level::<LeafUnits>(path, index, &node, (pos, mutation))?
                }
                (Node::Internal(_), Pending::Internal(replace)) => {
                    self.level::<InternalUnits>(path, index, &node, replace)?
                }
                _ => return Err(FsError::TreeInconsistent("path does not match node kinds")),
            };
            let level = path.level_at(index);
            if index == 0 {
                return self.finish_root(block, level, result);
            }
            let parent = path.elements()[index - 1].block.block();
            let pos = path.elements()[index - 1].position;
            if result.unchanged_shape {
                let size = result.group[0].child.size;
                self.set_child_size(parent, pos, usize::from(size))?;
                return Ok(());
            }
            pending = Pending::Internal(Replace {
                pos,
                units: result.group.into_vec(),
            });
            index -= 1;
        }
    }

    fn finish_root(&mut self, block: BlockNo, level: u16, result: LevelResult) -> Result<()> {
        match result.group.len() {
            0 => Err(FsError::TreeInconsistent("balancing emptied the root")),
            1 => {
                let mut root = RootInfo { block, height: level };
                // A root with a single child hands the role to that child.
                while let Node::Internal(node) = self.node(root.block)? {
                    if node.children.len() != 1 {
                        break;
                    }
                    self.freed.push(root.block);
                    self.slots.remove(&root.block);
                    root = RootInfo {
                        block: node.children[0].block,
                        height: root.height - 1,
                    };
                }
                if root != self.root {
                    debug!(block = root.block.0, height = root.height, "balance.collapse_root");
                    self.new_root = Some(root);
                    self.root = root;
                }
                Ok(())
            }
            _ => {
                if level >= MAX_HEIGHT {
                    return Err(FsError::Invalid("tree height limit reached"));
                }
                let new_root = self.placeholder();
                let node = InternalUnits(result.group.into_vec()).into_node(level + 1, MAX_KEY);
                self.put(new_root, node);
                let root = RootInfo {
                    block: new_root,
                    height: level + 1,
                };
                debug!(height = root.height, "balance.grow_root");
                self.new_root = Some(root);
                self.root = root;
                Ok(())
            }
        }
    }

    fn level<C: VirtualNode>(
        &mut self,
        path: &Path,
        index: usize,
        node: &Node,
        change: C::Change,
    ) -> Result<LevelResult> {
        let bs = self.block_size;
        let level = path.level_at(index);
        let s_block = path.elements()[index].block.block();
        let is_root = index == 0;
        let cfl = self.common_key(path, path.left_common(index))?;
        let cfr = self.common_key(path, path.right_common(index))?;

        let first_ldk = match (&cfl, node) {
            (Some((_, _, key)), _) => *key,
            (None, Node::Internal(internal)) => self.subtree_min_key(internal.children[0].block)?,
            (None, Node::Leaf(_)) => MIN_KEY,
        };
        let mut content = C::from_node(node, first_ldk)?;
        let shrink = content.apply(change, bs)?;

        let left = if is_root { None } else { self.neighbor(path, index, true)? };
        let right = if is_root { None } else { self.neighbor(path, index, false)? };
        let left_content = match &left {
            Some(n) => Some(C::from_node(&self.node(n.block)?, MIN_KEY)?),
            None => None,
        };
        let right_content = match (&right, &cfr) {
            (Some(n), Some((_, _, key))) => Some(C::from_node(&self.node(n.block)?, *key)?),
            _ => None,
        };

        let plan = distribute(
            left_content.as_ref(),
            content,
            right_content.as_ref(),
            shrink,
            is_root,
            bs,
        )?;
        debug!(level, kind = ?plan.kind, groups = plan.group.len(), "balance.level");
        self.levels.push(LevelPlan {
            level,
            kind: plan.kind,
        });

        let s_rdk = node.rdkey();
        let right_ldk_new = plan.right.as_ref().and_then(VirtualNode::ldk);
        let tail_rdk = right_ldk_new.unwrap_or(s_rdk);

        let mut blocks: SmallVec<[BlockNo; 3]> = SmallVec::new();
        for i in 0..plan.group.len() {
            blocks.push(if i == 0 { s_block } else { self.placeholder() });
        }
        let ldks: SmallVec<[Option<Key>; 3]> = plan.group.iter().map(VirtualNode::ldk).collect();
        let mut group = SmallVec::new();
        for (i, content) in plan.group.into_iter().enumerate() {
            let rdk = ldks.get(i + 1).copied().flatten().unwrap_or(tail_rdk);
            let ldk = ldks[i].unwrap_or(first_ldk);
            let size = content.used();
            self.put(blocks[i], content.into_node(level, rdk));
            group.push(Unit {
                ldk,
                child: DiskChild {
                    block: blocks[i],
                    size: size as u16,
                },
            });
        }
        if group.is_empty() {
            self.slots.remove(&s_block);
            self.freed.push(s_block);
        }

        if let Some(n) = &left {
            let mut l_node = match plan.left {
                Some(content) => {
                    let size = content.used();
                    self.set_child_size(n.parent, n.parent_pos, size)?;
                    content.into_node(level, MIN_KEY)
                }
                None => self.node(n.block)?,
            };
            let l_rdk = group.first().map_or(tail_rdk, |u: &Unit| u.ldk);
            let old = self.node(n.block)?;
            l_node.set_rdkey(l_rdk);
            if l_node != old {
                self.put(n.block, l_node);
            }
        }
        if let (Some(n), Some(content)) = (&right, plan.right) {
            let r_rdk = self.node(n.block)?.rdkey();
            let size = content.used();
            self.set_child_size(n.parent, n.parent_pos, size)?;
            self.put(n.block, content.into_node(level, r_rdk));
        }

        if let (Some((cfl_block, pos, old)), Some(first)) = (cfl, group.first()) {
            if first.ldk != old {
                self.set_key(cfl_block, pos, first.ldk)?;
                self.boundaries.push((first.ldk, level));
            }
        }
        if let (Some((cfr_block, pos, old)), Some(new)) = (cfr, right_ldk_new) {
            if new != old {
                self.set_key(cfr_block, pos, new)?;
                self.boundaries.push((new, level));
            }
        }

        let unchanged_shape = group.len() == 1;
        Ok(LevelResult {
            group,
            unchanged_shape,
        })
    }

    /// Gives every node on the right spine left of each changed separator
    /// that separator as its right delimiting key, down to the level where
    /// the change started.
    fn fix_boundaries(&mut self) -> Result<()> {
        let boundaries = std::mem::take(&mut self.boundaries);
        for (key, origin) in boundaries {
            let Some(mut block) = self.find_separator(&key)? else {
                continue;
            };
            loop {
                let mut node = self.node(block)?;
                if node.level() < origin {
                    break;
                }
                let next = match &node {
                    Node::Internal(internal) if internal.level > origin => {
                        internal.children.last().map(|c| c.block)
                    }
                    _ => None,
                };
                if node.rdkey() != key {
                    node.set_rdkey(key);
                    self.put(block, node);
                }
                match next {
                    Some(child) => block = child,
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// Child left of the separator equal to `key`, searching from the root.
    fn find_separator(&mut self, key: &Key) -> Result<Option<BlockNo>> {
        let mut block = self.root.block;
        loop {
            let node = match self.node(block)? {
                Node::Internal(node) => node,
                Node::Leaf(_) => return Ok(None),
            };
            if let Ok(pos) = node.keys.binary_search(key) {
                return Ok(Some(node.children[pos].block));
            }
            block = node.children[node.child_index(key)].block;
        }
    }
}

/// Plans `mutation` at the position `path` points to and reserves every new
/// block it needs. Nothing is modified when this fails; a path searched
/// before the last balance yields [`FsError::StaleTransitionPath`].
pub fn fix_nodes(tree: &Tree, txn: &mut dyn TreeTxn, path: &Path, mutation: Mutation) -> Result<BalancePlan> {
    if path.generation() != tree.generation() {
        return Err(FsError::StaleTransitionPath);
    }
    let mut planner = Planner::new(tree, path);
    planner.run(path, mutation)?;
    planner.fix_boundaries()?;
    let hint = path.leaf_element().block.block();
    let reserved = txn.allocate_blocks(planner.placeholders, hint)?;
    let nodes = planner
        .slots
        .into_iter()
        .filter(|(_, slot)| slot.dirty)
        .map(|(block, slot)| (block, slot.node))
        .collect();
    Ok(BalancePlan {
        levels: planner.levels,
        nodes,
        pinned: planner.pinned,
        freed: planner.freed,
        new_root: planner.new_root,
        reserved,
    })
}

/// Writes a plan out. Every rewritten block joins the transaction before it
/// is modified; nodes whose bytes do not change are left alone.
pub fn do_balance(tree: &Tree, txn: &mut dyn TreeTxn, plan: BalancePlan) -> Result<()> {
    let BalancePlan {
        nodes,
        pinned,
        freed,
        new_root,
        reserved,
        ..
    } = plan;
    let real = |block: BlockNo| -> BlockNo {
        if is_placeholder(block) {
            reserved[(PLACEHOLDER_BASE - block.0) as usize]
        } else {
            block
        }
    };
    let mut image = vec![0u8; tree.cache().block_size()];
    let mut written = 0usize;
    for (block, mut node) in nodes {
        if let Node::Internal(internal) = &mut node {
            for child in &mut internal.children {
                child.block = real(child.block);
            }
        }
        node.encode(&mut image);
        let buf = match pinned.get(&block) {
            Some(buf) if !is_placeholder(block) => {
                if buf.data()[..] == image[..] {
                    continue;
                }
                txn.journal_block(buf);
                buf.clone()
            }
            _ => txn.fresh_block(tree.cache(), real(block))?,
        };
        buf.data_mut().copy_from_slice(&image);
        written += 1;
    }
    for block in &freed {
        txn.free_block(*block)?;
    }
    if let Some(mut root) = new_root {
        root.block = real(root.block);
        txn.set_root(root)?;
        tree.set_root(root);
    }
    debug!(written, freed = freed.len(), new = reserved.len(), "balance.done");
    Ok(())
}
