#![forbid(unsafe_code)]
//! The balanced tree of items.
//!
//! Mutations are serialized behind the balance lock. Readers take no lock:
//! they note the tree generation, which is odd while a balance is being
//! written, and redo their work if it moved.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{trace, warn};

use crate::primitives::cache::{BlockCache, BlockRef};
use crate::storage::item::{Item, ItemBody};
use crate::storage::key::{Key, UNIQ_DIRECT};
use crate::storage::node::{LeafNode, Node};
use crate::types::{BlockNo, FsError, Result};

mod balance;
mod path;
mod virtual_node;

pub use balance::{do_balance, fix_nodes, BalancePlan, LevelPlan};
pub use path::{Path, PathElement, SearchResult};
pub use virtual_node::PlanKind;

/// Root block and height of the tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct RootInfo {
    /// Root node.
    pub block: BlockNo,
    /// Levels; 1 when the root is a leaf.
    pub height: u16,
}

/// Transaction services the tree needs while balancing.
pub trait TreeTxn {
    /// Joins `block` to the transaction before it is modified.
    fn journal_block(&mut self, block: &BlockRef);
    /// Zeroed buffer for a block just reserved for a new node, already
    /// joined to the transaction.
    fn fresh_block(&mut self, cache: &BlockCache, block: BlockNo) -> Result<BlockRef> {
        let buf = cache.get_new(block);
        self.journal_block(&buf);
        Ok(buf)
    }
    /// Reserves `count` blocks near `hint`, all or nothing.
    fn allocate_blocks(&mut self, count: u32, hint: BlockNo) -> Result<Vec<BlockNo>>;
    /// Returns a node block to the allocator.
    fn free_block(&mut self, block: BlockNo) -> Result<()>;
    /// Records a new root.
    fn set_root(&mut self, root: RootInfo) -> Result<()>;
}

/// A change to one item.
#[derive(Clone, Debug)]
pub enum Mutation {
    /// Insert a new item at the path position.
    Insert(Item),
    /// Insert units into the existing item before unit `pos_in_item`.
    Paste {
        /// Unit index inside the item.
        pos_in_item: usize,
        /// Units to insert; same item type.
        fragment: ItemBody,
        /// New unused tail of an indirect item.
        tail_free: Option<u16>,
    },
    /// Remove `count` units starting at `pos_in_item`; removing every unit
    /// deletes the item.
    Cut {
        /// First unit removed.
        pos_in_item: usize,
        /// Units removed.
        count: usize,
        /// New unused tail of an indirect item.
        tail_free: Option<u16>,
    },
    /// Remove the item.
    Delete,
}

/// Item holding a file byte offset.
#[derive(Clone, Debug)]
pub struct PositionHit {
    /// The direct or indirect item.
    pub item: Item,
    /// Unit holding the byte: a byte index or a pointer index.
    pub unit: usize,
}

/// The shared tree handle.
pub struct Tree {
    cache: Arc<BlockCache>,
    root: RwLock<RootInfo>,
    generation: AtomicU64,
    balance_lock: Mutex<()>,
}

impl Tree {
    /// Tree rooted at `root`.
    pub fn new(cache: Arc<BlockCache>, root: RootInfo) -> Self {
        Self {
            cache,
            root: RwLock::new(root),
            generation: AtomicU64::new(0),
            balance_lock: Mutex::new(()),
        }
    }

    /// Block cache the tree reads through.
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// Current root.
    pub fn root(&self) -> RootInfo {
        *self.root.read()
    }

    pub(crate) fn set_root(&self, root: RootInfo) {
        *self.root.write() = root;
    }

    /// Mutation counter; odd while a balance is being written.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Runs `f`, which rewrites node blocks outside of balancing, with
    /// readers held off, then moves the root to whatever `f` returns.
    pub(crate) fn rewrite(&self, f: impl FnOnce() -> Result<RootInfo>) -> Result<()> {
        let _guard = self.balance_lock.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let result = f();
        if let Ok(root) = &result {
            self.set_root(*root);
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        result.map(|_| ())
    }

    /// Runs `f` until it completes without a concurrent balance.
    pub fn read<T>(&self, mut f: impl FnMut(&Tree) -> Result<T>) -> Result<T> {
        loop {
            let stamp = self.generation();
            if stamp & 1 == 1 {
                drop(self.balance_lock.lock());
                continue;
            }
            let result = f(self);
            if self.generation() == stamp {
                return result;
            }
            trace!(stamp, "tree.read raced a balance");
        }
    }

    /// Plans and writes one mutation, searching again if the tree changed
    /// shape since `key` was looked up.
    fn mutate(
        &self,
        txn: &mut dyn TreeTxn,
        key: &Key,
        mut make: impl FnMut(SearchResult, &Path) -> Result<Mutation>,
    ) -> Result<()> {
        loop {
            let (found, path) = self.search_by_key(key)?;
            let mutation = make(found, &path)?;
            let _guard = self.balance_lock.lock();
            let plan = match fix_nodes(self, txn, &path, mutation) {
                Err(FsError::StaleTransitionPath) => {
                    warn!(key = %key, "balance.stale_path; searching again");
                    continue;
                }
                other => other?,
            };
            drop(path);
            self.generation.fetch_add(1, Ordering::AcqRel);
            let result = do_balance(self, txn, plan);
            self.generation.fetch_add(1, Ordering::AcqRel);
            return result;
        }
    }

    /// Inserts `item`; its key must not exist yet.
    pub fn insert_item(&self, txn: &mut dyn TreeTxn, item: Item) -> Result<()> {
        let key = item.key;
        self.mutate(txn, &key, |found, _| match found {
            SearchResult::Found => Err(FsError::AlreadyExists),
            SearchResult::NotFound => Ok(Mutation::Insert(item.clone())),
        })
    }

    /// Inserts `fragment` into the item `key` before unit `pos_in_item`.
    pub fn paste_into_item(
        &self,
        txn: &mut dyn TreeTxn,
        key: &Key,
        pos_in_item: usize,
        fragment: ItemBody,
        tail_free: Option<u16>,
    ) -> Result<()> {
        self.mutate(txn, key, |found, _| match found {
            SearchResult::NotFound => Err(FsError::NotFound),
            SearchResult::Found => Ok(Mutation::Paste {
                pos_in_item,
                fragment: fragment.clone(),
                tail_free,
            }),
        })
    }

    /// Removes `count` units of the item `key` from `pos_in_item`.
    pub fn cut_from_item(
        &self,
        txn: &mut dyn TreeTxn,
        key: &Key,
        pos_in_item: usize,
        count: usize,
        tail_free: Option<u16>,
    ) -> Result<()> {
        self.mutate(txn, key, |found, _| match found {
            SearchResult::NotFound => Err(FsError::NotFound),
            SearchResult::Found => Ok(Mutation::Cut {
                pos_in_item,
                count,
                tail_free,
            }),
        })
    }

    /// Deletes the item `key`, returning it.
    pub fn delete_item(&self, txn: &mut dyn TreeTxn, key: &Key) -> Result<Item> {
        let mut removed = None;
        self.mutate(txn, key, |found, path| match found {
            SearchResult::NotFound => Err(FsError::NotFound),
            SearchResult::Found => {
                removed = Some(path.leaf().items[path.position()].clone());
                Ok(Mutation::Delete)
            }
        })?;
        removed.ok_or(FsError::NotFound)
    }

    /// Rewrites the item `key` in place; `f` must keep its key and size.
    pub fn update_item(&self, txn: &mut dyn TreeTxn, key: &Key, f: impl FnOnce(&mut Item)) -> Result<()> {
        let _guard = self.balance_lock.lock();
        let (found, path) = self.search_by_key(key)?;
        if found == SearchResult::NotFound {
            return Err(FsError::NotFound);
        }
        let element = path.leaf_element();
        let mut leaf = path.leaf().clone();
        let pos = path.position();
        let before = (leaf.items[pos].key, leaf.items[pos].size());
        f(&mut leaf.items[pos]);
        if (leaf.items[pos].key, leaf.items[pos].size()) != before {
            return Err(FsError::Invalid("in-place update changed key or size"));
        }
        let mut image = vec![0u8; self.cache.block_size()];
        Node::Leaf(leaf).encode(&mut image);
        if element.block.data()[..] != image[..] {
            self.generation.fetch_add(1, Ordering::AcqRel);
            txn.journal_block(&element.block);
            element.block.data_mut().copy_from_slice(&image);
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// The item with exactly `key`.
    pub fn get_item(&self, key: &Key) -> Result<Option<Item>> {
        self.read(|tree| {
            let (found, path) = tree.search_by_key(key)?;
            Ok(match found {
                SearchResult::Found => Some(path.leaf().items[path.position()].clone()),
                SearchResult::NotFound => None,
            })
        })
    }

    /// Items with keys in `[start, end)`, in key order.
    pub fn scan(&self, start: &Key, end: &Key) -> Result<Vec<Item>> {
        self.read(|tree| tree.scan_raw(start, end))
    }

    fn scan_raw(&self, start: &Key, end: &Key) -> Result<Vec<Item>> {
        let mut out = Vec::new();
        let mut from = *start;
        loop {
            let (_, path) = self.search_by_key(&from)?;
            let leaf = path.leaf();
            for item in &leaf.items[path.position()..] {
                if item.key >= *end {
                    return Ok(out);
                }
                out.push(item.clone());
            }
            let next = leaf.rdkey;
            if next >= *end || next <= from {
                return Ok(out);
            }
            from = next;
        }
    }

    /// The direct or indirect item of object `(dir_id, object_id)` holding
    /// the 1-based byte `offset`.
    pub fn search_for_position(&self, dir_id: u32, object_id: u32, offset: u32) -> Result<Option<PositionHit>> {
        let block_size = self.cache.block_size() as u64;
        self.read(|tree| {
            let probe = Key::new(dir_id, object_id, offset, UNIQ_DIRECT);
            let (found, path) = tree.search_by_key(&probe)?;
            let leaf = path.leaf();
            let candidate = match (found, path.position()) {
                (SearchResult::Found, pos) => Some(leaf.items[pos].clone()),
                (SearchResult::NotFound, 0) => tree.left_leaf(&path)?.and_then(last_item),
                (SearchResult::NotFound, pos) => Some(leaf.items[pos - 1].clone()),
            };
            let Some(item) = candidate else {
                return Ok(None);
            };
            if item.key.dir_id != dir_id || item.key.object_id != object_id {
                return Ok(None);
            }
            let start = u64::from(item.key.offset);
            let end = start + item.logical_length(block_size as usize);
            let offset = u64::from(offset);
            if offset < start || offset >= end {
                return Ok(None);
            }
            let unit = match item.body {
                ItemBody::Direct(_) => (offset - start) as usize,
                ItemBody::Indirect(_) => ((offset - start) / block_size) as usize,
                _ => return Ok(None),
            };
            Ok(Some(PositionHit { item, unit }))
        })
    }

    /// The directory item of `(dir_id, object_id)` holding the entry with
    /// `entry_offset`, or the item it would be pasted into, plus the entry
    /// index (exact or insertion point).
    pub fn search_by_entry_key(
        &self,
        dir_id: u32,
        object_id: u32,
        entry_offset: u32,
    ) -> Result<Option<(Item, std::result::Result<usize, usize>)>> {
        self.read(|tree| {
            let probe = Key::directory(dir_id, object_id, entry_offset);
            let (found, path) = tree.search_by_key(&probe)?;
            let leaf = path.leaf();
            let candidate = match (found, path.position()) {
                (SearchResult::Found, pos) => Some(leaf.items[pos].clone()),
                (SearchResult::NotFound, 0) => tree.left_leaf(&path)?.and_then(last_item),
                (SearchResult::NotFound, pos) => Some(leaf.items[pos - 1].clone()),
            };
            Ok(candidate.and_then(|item| match &item.body {
                ItemBody::Directory(entries)
                    if item.key.dir_id == dir_id && item.key.object_id == object_id =>
                {
                    let index = entries.binary_search_by_key(&entry_offset, |e| e.offset);
                    Some((item, index))
                }
                _ => None,
            }))
        })
    }
}

fn last_item(leaf: LeafNode) -> Option<Item> {
    leaf.items.into_iter().last()
}
