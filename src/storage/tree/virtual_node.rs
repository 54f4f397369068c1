#![forbid(unsafe_code)]
//! Virtual nodes: the content of a node after a mutation, before it is
//! distributed over the node and its neighbors.
//!
//! Leaf content is a list of items whose splittable units (bytes, pointers,
//! entries) may be shifted across node boundaries. Internal content is a list
//! of `(left delimiting key, child)` units.

use serde::Serialize;

use crate::storage::item::{Item, ItemBody, IH_SIZE};
use crate::storage::key::{Key, KEY_SIZE};
use crate::storage::node::{
    leaf_capacity, max_children, DiskChild, InternalNode, LeafNode, Node, DC_SIZE,
};
use crate::types::{FsError, Result};

use super::Mutation;

/// Most nodes one level may be spread over after a mutation.
pub const MAX_GROUP: usize = 3;

/// What balancing did at one level.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum PlanKind {
    /// The content fits back into its node.
    InPlace,
    /// Leading units moved into the left neighbor.
    ShiftLeft,
    /// Trailing units moved into the right neighbor.
    ShiftRight,
    /// Units moved into both neighbors.
    ShiftBoth,
    /// The node was split into this many nodes.
    Split(u8),
    /// The whole node moved into its neighbors and was freed.
    Absorb,
    /// The node became empty and was freed.
    Remove,
}

/// Node content under rebalancing.
pub(crate) trait VirtualNode: Clone + Sized {
    /// Change applied to the node before distribution.
    type Change;

    /// Content with no units.
    fn empty() -> Self;

    /// Content of `node`; `first_ldk` is the left delimiting key of its
    /// first child (internal nodes only).
    fn from_node(node: &Node, first_ldk: Key) -> Result<Self>;

    /// Node holding this content.
    fn into_node(self, level: u16, rdkey: Key) -> Node;

    /// Applies `change`, returning true when it can only shrink the node.
    fn apply(&mut self, change: Self::Change, block_size: usize) -> Result<bool>;

    /// True when no units are left.
    fn is_empty(&self) -> bool;

    /// Bytes used below the block header.
    fn used(&self) -> usize;

    /// Whether the content fits one node.
    fn fits(&self, block_size: usize) -> bool;

    /// Smallest key covered by the content.
    fn ldk(&self) -> Option<Key>;

    /// Moves as many leading units as fit onto the end of `dest`.
    fn shift_front_into(&mut self, dest: &mut Self, block_size: usize);

    /// Moves as many trailing units as fit onto the front of `dest`.
    fn shift_back_into(&mut self, dest: &mut Self, block_size: usize);
}

/// Leaf content.
#[derive(Clone, Debug, Default)]
pub(crate) struct LeafUnits(pub Vec<Item>);

/// Largest `k` such that the first `k` units of `body` fit in `room` bytes.
fn units_fitting_front(body: &ItemBody, room: usize) -> usize {
    match body {
        ItemBody::StatData(_) => 0,
        ItemBody::Direct(bytes) => room.min(bytes.len()),
        ItemBody::Indirect(ptrs) => (room / 4).min(ptrs.len()),
        ItemBody::Directory(entries) => {
            let mut used = 0;
            entries
                .iter()
                .take_while(|entry| {
                    used += entry.size();
                    used <= room
                })
                .count()
        }
    }
}

/// Largest `k` such that the last `k` units of `body` fit in `room` bytes.
fn units_fitting_back(body: &ItemBody, room: usize) -> usize {
    match body {
        ItemBody::Directory(entries) => {
            let mut used = 0;
            entries
                .iter()
                .rev()
                .take_while(|entry| {
                    used += entry.size();
                    used <= room
                })
                .count()
        }
        other => units_fitting_front(other, room),
    }
}

impl VirtualNode for LeafUnits {
    type Change = (usize, Mutation);

    fn empty() -> Self {
        LeafUnits(Vec::new())
    }

    fn from_node(node: &Node, _first_ldk: Key) -> Result<Self> {
        Ok(LeafUnits(node.as_leaf()?.items.clone()))
    }

    fn into_node(self, _level: u16, rdkey: Key) -> Node {
        Node::Leaf(LeafNode {
            rdkey,
            items: self.0,
        })
    }

    fn apply(&mut self, (pos, mutation): Self::Change, block_size: usize) -> Result<bool> {
        let items = &mut self.0;
        let capacity = leaf_capacity(block_size);
        let existing = |items: &mut Vec<Item>| -> Result<()> {
            if pos < items.len() {
                Ok(())
            } else {
                Err(FsError::Invalid("item position outside the leaf"))
            }
        };
        match mutation {
            Mutation::Insert(item) => {
                if pos > items.len() {
                    return Err(FsError::Invalid("item position outside the leaf"));
                }
                // Splittable items larger than a node are sliced by `distribute`.
                if item.body_len() == 0 || (item.size() > capacity && !item.is_splittable()) {
                    return Err(FsError::Invalid("item does not fit a node"));
                }
                items.insert(pos, item);
                Ok(false)
            }
            Mutation::Paste {
                pos_in_item,
                fragment,
                tail_free,
            } => {
                existing(items)?;
                let item = &mut items[pos];
                item.insert_units(pos_in_item, fragment, block_size)?;
                if let Some(free) = tail_free {
                    item.free_space = free;
                }
                Ok(false)
            }
            Mutation::Cut {
                pos_in_item,
                count,
                tail_free,
            } => {
                existing(items)?;
                if pos_in_item == 0 && count == items[pos].unit_count() {
                    items.remove(pos);
                } else {
                    let item = &mut items[pos];
                    item.remove_units(pos_in_item, count, block_size)?;
                    if let Some(free) = tail_free {
                        item.free_space = free;
                    }
                }
                Ok(true)
            }
            Mutation::Delete => {
                existing(items)?;
                items.remove(pos);
                Ok(true)
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn used(&self) -> usize {
        self.0.iter().map(Item::size).sum()
    }

    fn fits(&self, block_size: usize) -> bool {
        self.used() <= leaf_capacity(block_size)
    }

    fn ldk(&self) -> Option<Key> {
        self.0.first().map(|item| item.key)
    }

    fn shift_front_into(&mut self, dest: &mut Self, block_size: usize) {
        let capacity = leaf_capacity(block_size);
        while let Some(first) = self.0.first() {
            let room = capacity.saturating_sub(dest.used());
            let merge = dest
                .0
                .last()
                .map_or(false, |last| last.mergeable_with(first, block_size));
            let overhead = if merge { 0 } else { IH_SIZE };
            if first.body_len() + overhead <= room {
                let item = self.0.remove(0);
                push_back(dest, item, merge);
                continue;
            }
            if first.is_splittable() && room > overhead {
                let count = first.unit_count();
                let k = units_fitting_front(&first.body, room - overhead).min(count - 1);
                if k > 0 {
                    let head = first.slice(0, k, block_size);
                    let rest = first.slice(k, count, block_size);
                    self.0[0] = rest;
                    push_back(dest, head, merge);
                }
            }
            break;
        }
    }

    fn shift_back_into(&mut self, dest: &mut Self, block_size: usize) {
        let capacity = leaf_capacity(block_size);
        while let Some(last) = self.0.last() {
            let room = capacity.saturating_sub(dest.used());
            let merge = dest
                .0
                .first()
                .map_or(false, |first| last.mergeable_with(first, block_size));
            let overhead = if merge { 0 } else { IH_SIZE };
            if last.body_len() + overhead <= room {
                if let Some(item) = self.0.pop() {
                    push_front(dest, item, merge);
                }
                continue;
            }
            if last.is_splittable() && room > overhead {
                let count = last.unit_count();
                let k = units_fitting_back(&last.body, room - overhead).min(count - 1);
                if k > 0 {
                    let tail = last.slice(count - k, count, block_size);
                    let rest = last.slice(0, count - k, block_size);
                    let at = self.0.len() - 1;
                    self.0[at] = rest;
                    push_front(dest, tail, merge);
                }
            }
            break;
        }
    }
}

fn push_back(dest: &mut LeafUnits, item: Item, merge: bool) {
    match dest.0.last_mut() {
        Some(last) if merge => last.merge(item),
        _ => dest.0.push(item),
    }
}

fn push_front(dest: &mut LeafUnits, mut item: Item, merge: bool) {
    if merge && !dest.0.is_empty() {
        let first = dest.0.remove(0);
        item.merge(first);
    }
    dest.0.insert(0, item);
}

/// One child of an internal node with the smallest key of its subtree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Unit {
    pub ldk: Key,
    pub child: DiskChild,
}

/// Replacement of one child by zero or more children.
#[derive(Clone, Debug)]
pub(crate) struct Replace {
    pub pos: usize,
    pub units: Vec<Unit>,
}

/// Internal node content.
#[derive(Clone, Debug, Default)]
pub(crate) struct InternalUnits(pub Vec<Unit>);

impl VirtualNode for InternalUnits {
    type Change = Replace;

    fn empty() -> Self {
        InternalUnits(Vec::new())
    }

    fn from_node(node: &Node, first_ldk: Key) -> Result<Self> {
        let internal = node.as_internal()?;
        let units = internal
            .children
            .iter()
            .enumerate()
            .map(|(i, child)| Unit {
                ldk: if i == 0 { first_ldk } else { internal.keys[i - 1] },
                child: *child,
            })
            .collect();
        Ok(InternalUnits(units))
    }

    fn into_node(self, level: u16, rdkey: Key) -> Node {
        let keys = self.0.iter().skip(1).map(|unit| unit.ldk).collect();
        let children = self.0.iter().map(|unit| unit.child).collect();
        Node::Internal(InternalNode {
            level,
            rdkey,
            keys,
            children,
        })
    }

    fn apply(&mut self, change: Replace, _block_size: usize) -> Result<bool> {
        if change.pos >= self.0.len() {
            return Err(FsError::TreeInconsistent("replaced child outside the node"));
        }
        let shrink = change.units.is_empty();
        self.0.splice(change.pos..=change.pos, change.units);
        Ok(shrink)
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn used(&self) -> usize {
        match self.0.len() {
            0 => 0,
            n => n * DC_SIZE + (n - 1) * KEY_SIZE,
        }
    }

    fn fits(&self, block_size: usize) -> bool {
        self.0.len() <= max_children(block_size)
    }

    fn ldk(&self) -> Option<Key> {
        self.0.first().map(|unit| unit.ldk)
    }

    fn shift_front_into(&mut self, dest: &mut Self, block_size: usize) {
        let room = max_children(block_size).saturating_sub(dest.0.len());
        let take = room.min(self.0.len());
        dest.0.extend(self.0.drain(..take));
    }

    fn shift_back_into(&mut self, dest: &mut Self, block_size: usize) {
        let room = max_children(block_size).saturating_sub(dest.0.len());
        let take = room.min(self.0.len());
        let moved: Vec<Unit> = self.0.drain(self.0.len() - take..).collect();
        dest.0.splice(0..0, moved);
    }
}

/// Final content of a neighborhood after distribution.
#[derive(Clone, Debug)]
pub(crate) struct Distribution<C> {
    /// New content of the left neighbor when it changed.
    pub left: Option<C>,
    /// Nodes replacing the balanced node, in order; the first reuses its block.
    pub group: Vec<C>,
    /// New content of the right neighbor when it changed.
    pub right: Option<C>,
    /// Decision taken.
    pub kind: PlanKind,
}

impl<C> Distribution<C> {
    fn new(kind: PlanKind, left: Option<C>, group: Vec<C>, right: Option<C>) -> Self {
        Self {
            left,
            group,
            right,
            kind,
        }
    }
}

/// Spreads `content` over its node and neighbors.
///
/// Growth: keep in place when it fits; otherwise shift the maximum into the
/// left neighbor, then the right one, then both; otherwise split into the
/// fewest nodes. Shrink: empty nodes go away, and a node whose whole content
/// fits into its neighbors is absorbed by them.
pub(crate) fn distribute<C: VirtualNode>(
    left: Option<&C>,
    content: C,
    right: Option<&C>,
    shrink: bool,
    is_root: bool,
    block_size: usize,
) -> Result<Distribution<C>> {
    if shrink && !is_root {
        if content.is_empty() {
            return Ok(Distribution::new(PlanKind::Remove, None, Vec::new(), None));
        }
        if let Some(l) = left {
            let (mut l2, mut s2) = (l.clone(), content.clone());
            s2.shift_front_into(&mut l2, block_size);
            if s2.is_empty() {
                return Ok(Distribution::new(PlanKind::Absorb, Some(l2), Vec::new(), None));
            }
        }
        if let Some(r) = right {
            let (mut r2, mut s2) = (r.clone(), content.clone());
            s2.shift_back_into(&mut r2, block_size);
            if s2.is_empty() {
                return Ok(Distribution::new(PlanKind::Absorb, None, Vec::new(), Some(r2)));
            }
        }
        if let (Some(l), Some(r)) = (left, right) {
            let (mut l2, mut r2, mut s2) = (l.clone(), r.clone(), content.clone());
            s2.shift_front_into(&mut l2, block_size);
            s2.shift_back_into(&mut r2, block_size);
            if s2.is_empty() {
                return Ok(Distribution::new(PlanKind::Absorb, Some(l2), Vec::new(), Some(r2)));
            }
        }
    }
    if content.fits(block_size) {
        return Ok(Distribution::new(PlanKind::InPlace, None, vec![content], None));
    }
    if let Some(l) = left {
        let (mut l2, mut s2) = (l.clone(), content.clone());
        s2.shift_front_into(&mut l2, block_size);
        if s2.fits(block_size) && !s2.is_empty() {
            return Ok(Distribution::new(PlanKind::ShiftLeft, Some(l2), vec![s2], None));
        }
    }
    if let Some(r) = right {
        let (mut r2, mut s2) = (r.clone(), content.clone());
        s2.shift_back_into(&mut r2, block_size);
        if s2.fits(block_size) && !s2.is_empty() {
            return Ok(Distribution::new(PlanKind::ShiftRight, None, vec![s2], Some(r2)));
        }
    }
    if let (Some(l), Some(r)) = (left, right) {
        let (mut l2, mut r2, mut s2) = (l.clone(), r.clone(), content.clone());
        s2.shift_front_into(&mut l2, block_size);
        s2.shift_back_into(&mut r2, block_size);
        if s2.fits(block_size) && !s2.is_empty() {
            return Ok(Distribution::new(PlanKind::ShiftBoth, Some(l2), vec![s2], Some(r2)));
        }
    }
    let mut rest = content;
    let mut group = Vec::new();
    while !rest.is_empty() {
        let mut node = C::empty();
        rest.shift_front_into(&mut node, block_size);
        if node.is_empty() {
            return Err(FsError::TreeInconsistent("unit larger than a node"));
        }
        group.push(node);
    }
    if group.len() > MAX_GROUP {
        return Err(FsError::Invalid("mutation needs more than three new nodes"));
    }
    Ok(Distribution::new(
        PlanKind::Split(group.len() as u8),
        None,
        group,
        None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::item::{DirEntry, StatData};
    use crate::types::BlockNo;

    const BS: usize = 512;

    fn direct(obj: u32, offset: u32, len: usize) -> Item {
        Item::direct(Key::direct(1, obj, offset), vec![obj as u8; len])
    }

    #[test]
    fn fits_in_place() {
        let s = LeafUnits(vec![direct(5, 1, 100)]);
        let d = distribute(None, s, None, false, true, BS).unwrap();
        assert_eq!(d.kind, PlanKind::InPlace);
        assert_eq!(d.group.len(), 1);
    }

    #[test]
    fn overflow_shifts_left_and_merges() {
        let left = LeafUnits(vec![direct(5, 1, 100)]);
        let s = LeafUnits(vec![direct(5, 101, 300), direct(6, 1, 200)]);
        let d = distribute(Some(&left), s, None, false, false, BS).unwrap();
        assert_eq!(d.kind, PlanKind::ShiftLeft);
        let l2 = d.left.unwrap();
        assert_eq!(l2.0[0].body_len(), 400, "shifted bytes merge into the left item");
        assert!(l2.fits(BS));
        let s2 = &d.group[0];
        assert!(s2.fits(BS));
        let total: usize = l2.0.iter().chain(s2.0.iter()).map(Item::body_len).sum();
        assert_eq!(total, 600);
        let l_last = l2.0.last().unwrap();
        assert_eq!(
            u64::from(l_last.key.offset) + l_last.logical_length(BS),
            u64::from(s2.0[0].key.offset)
        );
    }

    #[test]
    fn split_without_neighbors() {
        let s = LeafUnits(vec![
            Item::stat_data(Key::stat_data(1, 5), StatData::default()),
            direct(5, 1, 400),
            direct(6, 1, 400),
        ]);
        let d = distribute(None, s, None, false, true, BS).unwrap();
        assert!(matches!(d.kind, PlanKind::Split(n) if n >= 2));
        for node in &d.group {
            assert!(node.fits(BS));
        }
    }

    #[test]
    fn directory_splits_on_entry_boundary() {
        let entries: Vec<DirEntry> = (0..40)
            .map(|i| DirEntry::new(128 * (i + 1), 1, 10 + i, format!("name{i:02}").as_bytes()))
            .collect();
        let item = Item::directory(Key::directory(1, 2, 0), entries);
        let d = distribute(None, LeafUnits(vec![item]), None, false, true, BS).unwrap();
        assert_eq!(d.group.len(), 2);
        let second = &d.group[1].0[0];
        match &second.body {
            ItemBody::Directory(entries) => assert_eq!(entries[0].offset, second.key.offset),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn item_larger_than_a_node_is_sliced() {
        let s = LeafUnits(vec![direct(5, 1, 700)]);
        let d = distribute(None, s, None, false, true, BS).unwrap();
        assert!(matches!(d.kind, PlanKind::Split(n) if n >= 2), "{:?}", d.kind);
        for node in &d.group {
            assert!(node.fits(BS));
        }
        let pieces: Vec<&Item> = d.group.iter().flat_map(|n| n.0.iter()).collect();
        assert_eq!(pieces.iter().map(|i| i.body_len()).sum::<usize>(), 700);
        assert_eq!(pieces[0].key.offset, 1);
        assert_eq!(pieces[1].key.offset as usize, 1 + pieces[0].body_len());
    }

    #[test]
    fn shrink_absorbs_into_left() {
        let left = LeafUnits(vec![direct(5, 1, 50)]);
        let s = LeafUnits(vec![direct(6, 1, 50)]);
        let d = distribute(Some(&left), s, None, true, false, BS).unwrap();
        assert_eq!(d.kind, PlanKind::Absorb);
        assert!(d.group.is_empty());
        assert_eq!(d.left.unwrap().0.len(), 2);
    }

    #[test]
    fn internal_units_encode_keys_between_children() {
        let unit = |k: u32, b: u32| Unit {
            ldk: Key::stat_data(1, k),
            child: DiskChild {
                block: BlockNo(b),
                size: 10,
            },
        };
        let content = InternalUnits(vec![unit(1, 10), unit(5, 11), unit(9, 12)]);
        assert_eq!(content.used(), 3 * DC_SIZE + 2 * KEY_SIZE);
        let node = content.into_node(2, crate::storage::key::MAX_KEY);
        let internal = node.as_internal().unwrap();
        assert_eq!(internal.keys, vec![Key::stat_data(1, 5), Key::stat_data(1, 9)]);
        let back = InternalUnits::from_node(&node, Key::stat_data(1, 1)).unwrap();
        assert_eq!(back.0[0], unit(1, 10));
    }
}
