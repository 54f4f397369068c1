#![forbid(unsafe_code)]
//! Root-to-leaf search paths.

use smallvec::SmallVec;

use crate::primitives::cache::BlockRef;
use crate::storage::key::Key;
use crate::storage::node::{LeafNode, Node};
use crate::types::{BlockNo, FsError, Result};

use super::Tree;

/// Outcome of a key search at the leaf.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SearchResult {
    /// An item with the exact key exists at the path position.
    Found,
    /// No such item; the path position is the insertion point.
    NotFound,
}

/// One node on a search path.
#[derive(Clone, Debug)]
pub struct PathElement {
    /// Pinned buffer of the node.
    pub block: BlockRef,
    /// Node as decoded during the search.
    pub node: Node,
    /// Child index taken (internal) or item position (leaf).
    pub position: usize,
}

/// Pinned nodes from the root down to a leaf, stamped with the tree
/// generation observed when the search started. Dropping it unpins.
#[derive(Clone, Debug)]
pub struct Path {
    elements: SmallVec<[PathElement; 8]>,
    generation: u64,
}

impl Path {
    /// Elements from the root (index 0) to the leaf.
    pub fn elements(&self) -> &[PathElement] {
        &self.elements
    }

    /// Number of levels on the path.
    pub fn height(&self) -> u16 {
        self.elements.len() as u16
    }

    /// Generation stamp taken before the search.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The leaf element.
    pub fn leaf_element(&self) -> &PathElement {
        &self.elements[self.elements.len() - 1]
    }

    /// The leaf node.
    pub fn leaf(&self) -> &LeafNode {
        match &self.leaf_element().node {
            Node::Leaf(leaf) => leaf,
            Node::Internal(_) => unreachable!("search paths end at a leaf"),
        }
    }

    /// Item position in the leaf.
    pub fn position(&self) -> usize {
        self.leaf_element().position
    }

    /// Level of the element at `index`.
    pub(crate) fn level_at(&self, index: usize) -> u16 {
        self.height() - index as u16
    }

    /// Closest ancestor of element `index` holding its left delimiting key:
    /// the ancestor index and the key position inside it.
    pub(crate) fn left_common(&self, index: usize) -> Option<(usize, usize)> {
        (0..index)
            .rev()
            .find(|&j| self.elements[j].position > 0)
            .map(|j| (j, self.elements[j].position - 1))
    }

    /// Closest ancestor of element `index` holding its right delimiting key.
    pub(crate) fn right_common(&self, index: usize) -> Option<(usize, usize)> {
        (0..index).rev().find_map(|j| {
            let element = &self.elements[j];
            let children = match &element.node {
                Node::Internal(node) => node.children.len(),
                Node::Leaf(_) => 0,
            };
            (element.position + 1 < children).then_some((j, element.position))
        })
    }
}

impl Tree {
    /// Descends from the root to the leaf that holds, or would hold, `key`.
    ///
    /// Every node is sanity checked and its level must match its depth.
    pub fn search_by_key(&self, key: &Key) -> Result<(SearchResult, Path)> {
        let generation = self.generation();
        let root = self.root();
        let mut elements: SmallVec<[PathElement; 8]> = SmallVec::new();
        let mut block = root.block;
        for depth in 0..root.height {
            let expected = root.height - depth;
            let buf = self.cache().get(block)?;
            let node = Node::decode(&buf.data())?;
            if node.level() != expected {
                return Err(FsError::TreeInconsistent("node level does not match its depth"));
            }
            match &node {
                Node::Internal(internal) => {
                    let position = internal.child_index(key);
                    let next = internal.children[position].block;
                    elements.push(PathElement {
                        block: buf,
                        node,
                        position,
                    });
                    block = next;
                }
                Node::Leaf(leaf) => {
                    let (result, position) = match leaf.search(key) {
                        Ok(pos) => (SearchResult::Found, pos),
                        Err(pos) => (SearchResult::NotFound, pos),
                    };
                    elements.push(PathElement {
                        block: buf,
                        node,
                        position,
                    });
                    return Ok((
                        result,
                        Path {
                            elements,
                            generation,
                        },
                    ));
                }
            }
        }
        Err(FsError::TreeInconsistent("tree height exceeds the path"))
    }

    /// Last item of the leaf left of the path's leaf, if any.
    pub(crate) fn left_leaf(&self, path: &Path) -> Result<Option<LeafNode>> {
        let leaf_index = path.elements().len() - 1;
        let Some((common, key_pos)) = path.left_common(leaf_index) else {
            return Ok(None);
        };
        let mut block = child_block(&path.elements()[common].node, key_pos)?;
        loop {
            let node = Node::decode(&self.cache().get(block)?.data())?;
            match node {
                Node::Leaf(leaf) => return Ok(Some(leaf)),
                Node::Internal(internal) => {
                    block = internal
                        .children
                        .last()
                        .map(|c| c.block)
                        .ok_or(FsError::TreeInconsistent("internal node without children"))?;
                }
            }
        }
    }
}

fn child_block(node: &Node, index: usize) -> Result<BlockNo> {
    node.as_internal()?
        .children
        .get(index)
        .map(|c| c.block)
        .ok_or(FsError::TreeInconsistent("child index out of range"))
}
