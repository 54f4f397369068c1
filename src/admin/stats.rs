use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::primitives::io::BlockDevice;
use crate::primitives::journal::format::JournalHeader;
use crate::primitives::journal::JournalLayout;
use crate::storage::node::{Node, MAX_HEIGHT};
use crate::storage::superblock::{FsState, Superblock};
use crate::types::BlockNo;

use crate::admin::util::{open_raw, read_block};
use crate::admin::Result;

/// Everything `stats` reports about an image.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    /// Identity and geometry.
    pub image: ImageSection,
    /// Block usage.
    pub space: SpaceSection,
    /// Shape of the item tree.
    pub tree: TreeSection,
    /// Journal region.
    pub journal: JournalSection,
}

/// Identity and geometry read from the superblock.
#[derive(Debug, Clone, Serialize)]
pub struct ImageSection {
    pub path: String,
    pub size_bytes: u64,
    pub label: String,
    pub uuid: String,
    pub format_version: u16,
    pub block_size: u32,
    pub block_count: u32,
    pub clean: bool,
}

/// Allocation counters.
#[derive(Debug, Clone, Serialize)]
pub struct SpaceSection {
    pub free_blocks: u32,
    pub used_blocks: u32,
    pub bitmap_blocks: u16,
    pub next_objectid: u32,
}

/// Node and item counts from a walk of the tree.
#[derive(Debug, Clone, Serialize)]
pub struct TreeSection {
    pub root_block: BlockNo,
    pub height: u16,
    pub internal_nodes: u64,
    pub leaves: u64,
    pub items: u64,
    /// Bytes used by item heads and bodies across all leaves.
    pub leaf_bytes_used: u64,
    /// Damaged nodes skipped during the count.
    pub unreadable_nodes: u64,
}

/// Journal geometry and header position.
#[derive(Debug, Clone, Serialize)]
pub struct JournalSection {
    pub start: BlockNo,
    pub blocks: u32,
    pub max_batch: u32,
    pub max_age_secs: u32,
    pub last_flushed: Option<u32>,
    pub first_unflushed: Option<u32>,
}

/// Collects a report from the image at `path` without mounting it.
///
/// # Errors
///
/// Returns an error if the image cannot be opened or read.
pub fn stats(path: impl AsRef<Path>) -> Result<StatsReport> {
    let path = path.as_ref();
    let image = open_raw(path)?;
    let size_bytes = fs::metadata(path)?.len();
    let sb = &image.superblock;
    let device = image.device.as_ref();

    let layout = JournalLayout::new(sb.journal_start, sb.journal_blocks);
    let header = JournalHeader::decode(&read_block(device, layout.header)?);

    Ok(StatsReport {
        image: ImageSection {
            path: path.display().to_string(),
            size_bytes,
            label: sb.label(),
            uuid: hex::encode(sb.uuid),
            format_version: sb.format_version,
            block_size: sb.block_size,
            block_count: sb.block_count,
            clean: sb.state == FsState::Valid,
        },
        space: SpaceSection {
            free_blocks: sb.free_blocks,
            used_blocks: sb.block_count.saturating_sub(sb.free_blocks),
            bitmap_blocks: sb.bmap_nr,
            next_objectid: sb.next_objectid,
        },
        tree: count_tree(device, sb)?,
        journal: JournalSection {
            start: sb.journal_start,
            blocks: sb.journal_blocks,
            max_batch: sb.journal_max_batch,
            max_age_secs: sb.journal_max_age,
            last_flushed: header.as_ref().map(|h| h.last_flushed.0),
            first_unflushed: header.as_ref().map(|h| h.first_unflushed),
        },
    })
}

fn count_tree(device: &dyn BlockDevice, sb: &Superblock) -> Result<TreeSection> {
    let mut section = TreeSection {
        root_block: sb.root_block,
        height: sb.tree_height,
        internal_nodes: 0,
        leaves: 0,
        items: 0,
        leaf_bytes_used: 0,
        unreadable_nodes: 0,
    };
    let mut stack = vec![(sb.root_block, 0u16)];
    while let Some((block, depth)) = stack.pop() {
        if block.is_none() || block.0 >= sb.block_count || depth >= MAX_HEIGHT {
            section.unreadable_nodes += 1;
            continue;
        }
        match Node::decode(&read_block(device, block)?) {
            Ok(Node::Leaf(leaf)) => {
                section.leaves += 1;
                section.items += leaf.items.len() as u64;
                section.leaf_bytes_used += leaf.used_space() as u64;
            }
            Ok(Node::Internal(node)) => {
                section.internal_nodes += 1;
                stack.extend(node.children.iter().map(|c| (c.block, depth + 1)));
            }
            Err(_) => section.unreadable_nodes += 1,
        }
    }
    Ok(section)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{Filesystem, FormatOptions, FsOptions};

    #[test]
    fn reports_on_a_closed_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let opts = FormatOptions {
            block_size: 512,
            block_count: 4096,
            label: "scratch".into(),
            ..FormatOptions::default()
        };
        Filesystem::create_image(&path, &opts).unwrap();
        let fs = Filesystem::open_image(&path, FsOptions::default()).unwrap();
        for i in 0..50 {
            fs.create(fs.root(), format!("entry-{i}").as_bytes()).unwrap();
        }
        fs.close().unwrap();

        let report = stats(&path).unwrap();
        assert_eq!(report.image.label, "scratch");
        assert_eq!(report.image.size_bytes, 512 * 4096);
        assert!(report.image.clean);
        assert!(report.tree.height >= 2);
        assert!(report.tree.internal_nodes >= 1);
        assert!(report.tree.items >= 52, "stat data for every object plus directory items");
        assert_eq!(report.tree.unreadable_nodes, 0);
        assert_eq!(report.space.next_objectid, 53);
        assert!(report.journal.last_flushed.is_some());
    }
}
