use std::collections::VecDeque;
use std::path::Path;

use serde::Serialize;

use crate::primitives::io::BlockDevice;
use crate::primitives::journal::format::{CommitRecord, Descriptor, JournalHeader};
use crate::primitives::journal::JournalLayout;
use crate::storage::bitmap::bitmap_count_free;
use crate::storage::item::{Item, ItemBody};
use crate::storage::node::{leaf_capacity, BlockHead, Node};
use crate::storage::superblock::Superblock;
use crate::types::{block_crc32, BlockNo};

use crate::admin::error::AdminError;
use crate::admin::util::{open_raw, read_block};
use crate::admin::Result;

const RAW_PREVIEW: usize = 64;

/// Decoded view of one block.
#[derive(Debug, Clone, Serialize)]
pub struct BlockDump {
    /// Block number.
    pub block: BlockNo,
    /// What the block was recognised as.
    pub kind: &'static str,
    /// CRC32 of the block number and content, for comparing images.
    pub crc32: u32,
    /// Kind-specific content.
    pub detail: BlockDetail,
}

/// Kind-specific part of a [`BlockDump`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDetail {
    /// The volume superblock.
    Superblock(Superblock),
    /// A leaf node.
    Leaf {
        /// Right delimiting key.
        rdkey: String,
        /// Unused bytes in the node.
        free_space: u16,
        /// Items in key order.
        items: Vec<ItemDump>,
    },
    /// An internal node.
    Internal {
        /// Node level.
        level: u16,
        /// Right delimiting key.
        rdkey: String,
        /// Delimiting keys.
        keys: Vec<String>,
        /// Child block and used size pairs.
        children: Vec<(BlockNo, u16)>,
    },
    /// A free-space bitmap block.
    Bitmap {
        /// Index among the bitmap blocks.
        index: u32,
        /// Free bits among those the block covers.
        free: u32,
    },
    /// The journal header.
    JournalHeader {
        /// Last checkpointed transaction.
        last_flushed: u32,
        /// Log offset of the first unflushed transaction.
        first_unflushed: u32,
    },
    /// A journal descriptor block.
    JournalDescriptor {
        /// Transaction id.
        trans_id: u32,
        /// Home locations of the logged images.
        blocks: Vec<BlockNo>,
    },
    /// A journal commit block.
    JournalCommit {
        /// Transaction id.
        trans_id: u32,
        /// Logged image count.
        len: u32,
    },
    /// Anything else: data, log images, damaged nodes.
    Raw {
        /// Whether every byte is zero.
        zeroed: bool,
        /// Leading bytes in hex.
        head: String,
        /// Why a node-shaped block failed to decode, if it did.
        error: Option<String>,
    },
}

/// One item of a dumped leaf.
#[derive(Debug, Clone, Serialize)]
pub struct ItemDump {
    /// Key in `[dir object offset type]` form.
    pub key: String,
    /// Body length in bytes.
    pub len: usize,
    /// Unused bytes in the last block (indirect items only).
    pub free_space: u16,
    /// Short description of the body.
    pub summary: String,
}

/// Decodes block `block` of the image at `path`.
///
/// # Errors
///
/// Returns an error if the image cannot be opened or the block is past the
/// end of the device.
pub fn dump_block(path: impl AsRef<Path>, block: u32) -> Result<BlockDump> {
    let image = open_raw(path.as_ref())?;
    if block >= image.superblock.block_count {
        return Err(AdminError::OutOfRange {
            block: BlockNo(block),
            count: image.superblock.block_count,
        });
    }
    describe(image.device.as_ref(), &image.superblock, BlockNo(block))
}

/// Decodes every node reachable from the root, breadth first.
///
/// Damaged nodes appear as raw blocks and their subtrees are skipped.
///
/// # Errors
///
/// Returns an error if the image cannot be opened or read.
pub fn dump_tree(path: impl AsRef<Path>) -> Result<Vec<BlockDump>> {
    let image = open_raw(path.as_ref())?;
    let sb = &image.superblock;
    let device = image.device.as_ref();
    let mut out = Vec::new();
    let mut queue = VecDeque::from([sb.root_block]);
    while let Some(block) = queue.pop_front() {
        if block.is_none() || block.0 >= sb.block_count || out.len() as u32 >= sb.block_count {
            continue;
        }
        let dump = describe(device, sb, block)?;
        if let BlockDetail::Internal { children, .. } = &dump.detail {
            queue.extend(children.iter().map(|(child, _)| *child));
        }
        out.push(dump);
    }
    Ok(out)
}

fn describe(device: &dyn BlockDevice, sb: &Superblock, block: BlockNo) -> Result<BlockDump> {
    let data = read_block(device, block)?;
    let crc32 = block_crc32(block.0, &data);
    let (kind, detail) = classify(sb, block, &data);
    Ok(BlockDump {
        block,
        kind,
        crc32,
        detail,
    })
}

fn classify(sb: &Superblock, block: BlockNo, data: &[u8]) -> (&'static str, BlockDetail) {
    if block == sb.location() {
        return ("superblock", BlockDetail::Superblock(sb.clone()));
    }
    if let Some(index) = (0..u32::from(sb.bmap_nr)).find(|i| sb.bitmap_block(*i) == block) {
        let bits = sb.bits_per_bitmap();
        let free = bitmap_count_free(data, (sb.block_count - index * bits).min(bits));
        return ("bitmap", BlockDetail::Bitmap { index, free });
    }
    let layout = JournalLayout::new(sb.journal_start, sb.journal_blocks);
    if block == layout.header {
        if let Some(header) = JournalHeader::decode(data) {
            return (
                "journal_header",
                BlockDetail::JournalHeader {
                    last_flushed: header.last_flushed.0,
                    first_unflushed: header.first_unflushed,
                },
            );
        }
        return ("journal_header", raw(data, Some("header magic or checksum mismatch".into())));
    }
    if layout.contains(block) {
        if let Some(desc) = Descriptor::decode(data) {
            return (
                "journal_descriptor",
                BlockDetail::JournalDescriptor {
                    trans_id: desc.trans_id.0,
                    blocks: desc.blocks,
                },
            );
        }
        if let Some(commit) = CommitRecord::decode(data) {
            return (
                "journal_commit",
                BlockDetail::JournalCommit {
                    trans_id: commit.trans_id.0,
                    len: commit.len,
                },
            );
        }
        return ("journal_log", raw(data, None));
    }
    let head = BlockHead::decode(data);
    if head.level == 0 {
        return ("data", raw(data, None));
    }
    match Node::decode(data) {
        Ok(Node::Leaf(leaf)) => (
            "leaf",
            BlockDetail::Leaf {
                rdkey: leaf.rdkey.to_string(),
                free_space: (leaf_capacity(data.len()).saturating_sub(leaf.used_space())) as u16,
                items: leaf.items.iter().map(item_dump).collect(),
            },
        ),
        Ok(Node::Internal(node)) => (
            "internal",
            BlockDetail::Internal {
                level: node.level,
                rdkey: node.rdkey.to_string(),
                keys: node.keys.iter().map(ToString::to_string).collect(),
                children: node.children.iter().map(|c| (c.block, c.size)).collect(),
            },
        ),
        Err(err) => ("data", raw(data, Some(err.to_string()))),
    }
}

fn raw(data: &[u8], error: Option<String>) -> BlockDetail {
    BlockDetail::Raw {
        zeroed: data.iter().all(|b| *b == 0),
        head: hex::encode(&data[..data.len().min(RAW_PREVIEW)]),
        error,
    }
}

fn item_dump(item: &Item) -> ItemDump {
    let summary = match &item.body {
        ItemBody::StatData(sd) => format!(
            "mode {:o} nlink {} size {} blocks {} first_direct_byte {}",
            sd.mode, sd.nlink, sd.size, sd.blocks, sd.first_direct_byte
        ),
        ItemBody::Direct(bytes) => format!("{} tail bytes", bytes.len()),
        ItemBody::Indirect(pointers) => {
            let holes = pointers.iter().filter(|p| **p == 0).count();
            match (pointers.first(), pointers.last()) {
                (Some(first), Some(last)) => {
                    format!("{} pointers {first}..{last}, {holes} holes", pointers.len())
                }
                _ => "no pointers".to_string(),
            }
        }
        ItemBody::Directory(entries) => entries
            .iter()
            .map(|e| format!("{}->{}/{}", String::from_utf8_lossy(&e.name), e.dir_id, e.object_id))
            .collect::<Vec<_>>()
            .join(" "),
    };
    ItemDump {
        key: item.key.to_string(),
        len: item.body_len(),
        free_space: item.free_space,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{Filesystem, FormatOptions, FsOptions};

    #[test]
    fn tree_dump_starts_at_the_root_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let opts = FormatOptions {
            block_size: 1024,
            block_count: 2048,
            ..FormatOptions::default()
        };
        Filesystem::create_image(&path, &opts).unwrap();
        let fs = Filesystem::open_image(&path, FsOptions::default()).unwrap();
        let f = fs.create(fs.root(), b"foo").unwrap();
        fs.append(f, b"abc").unwrap();
        fs.close().unwrap();

        let nodes = dump_tree(&path).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].kind, "leaf");
        let BlockDetail::Leaf { items, .. } = &nodes[0].detail else {
            panic!("root should be a leaf");
        };
        assert!(items.iter().any(|i| i.summary.contains("foo->2/3")));
        assert!(items.iter().any(|i| i.summary == "3 tail bytes"));

        let sb = dump_block(&path, nodes[0].block.0).unwrap();
        assert_eq!(sb.crc32, nodes[0].crc32);
        let header = dump_block(&path, 65536 / 1024).unwrap();
        assert_eq!(header.kind, "superblock");
        assert!(dump_block(&path, 2048).is_err());
    }
}
