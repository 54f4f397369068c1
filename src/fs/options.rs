use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::superblock::superblock_block;
use crate::types::{FsError, Result};

/// Parameters for building a new filesystem.
///
/// [`Filesystem::format`](super::Filesystem::format) takes the geometry from
/// the device; `block_size` and `block_count` size the image file created by
/// [`Filesystem::create_image`](super::Filesystem::create_image).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct FormatOptions {
    /// Block size in bytes.
    pub block_size: usize,
    /// Blocks in the image.
    pub block_count: u32,
    /// Journal region size including its header block; derived from the
    /// block count when unset.
    pub journal_blocks: Option<u32>,
    /// Blocks one transaction may batch before it is committed.
    pub journal_max_batch: u32,
    /// Seconds a transaction may stay open.
    pub journal_max_age_secs: u32,
    /// Volume label (truncated to 16 bytes).
    pub label: String,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            block_count: 32768,
            journal_blocks: None,
            journal_max_batch: 256,
            journal_max_age_secs: 5,
            label: String::new(),
        }
    }
}

impl FormatOptions {
    /// Journal size for a device of `block_count` blocks.
    pub fn journal_blocks_for(&self, block_count: u32) -> u32 {
        self.journal_blocks
            .unwrap_or_else(|| (block_count / 8).clamp(64, 8193))
    }
}

/// Placement of the fixed metadata regions of a filesystem.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct Layout {
    /// Superblock block.
    pub superblock: u32,
    /// First bitmap block.
    pub first_bitmap: u32,
    /// Journal header block.
    pub journal_start: u32,
    /// Journal blocks including the header.
    pub journal_blocks: u32,
    /// Block of the initial root leaf.
    pub root: u32,
    /// Number of bitmap blocks.
    pub bmap_nr: u16,
}

impl Layout {
    /// Computes and validates the layout for the given geometry.
    pub fn compute(block_size: usize, block_count: u32, journal_blocks: u32) -> Result<Layout> {
        let superblock = superblock_block(block_size).0;
        let bits = block_size as u32 * 8;
        let bmap_nr = block_count.div_ceil(bits);
        if journal_blocks < 9 {
            return Err(FsError::Invalid("journal needs at least 9 blocks"));
        }
        let journal_start = superblock + 2;
        let root = journal_start + journal_blocks;
        if root + 16 > block_count {
            return Err(FsError::Invalid("device too small for the requested layout"));
        }
        if bmap_nr > 1 && root >= bits {
            return Err(FsError::Invalid("journal overlaps the second bitmap block"));
        }
        let bmap_nr = u16::try_from(bmap_nr).map_err(|_| FsError::Invalid("too many bitmap blocks"))?;
        Ok(Layout {
            superblock,
            first_bitmap: superblock + 1,
            journal_start,
            journal_blocks,
            root,
            bmap_nr,
        })
    }
}

/// Runtime options for an opened filesystem.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct FsOptions {
    /// Unpinned blocks kept in the cache.
    pub cache_blocks: usize,
    /// Files up to this size keep their body in direct items; defaults to
    /// the block size.
    pub tail_limit: Option<usize>,
    /// Walk every tree node at open and refuse a tree that fails the node
    /// sanity checks.
    pub verify_on_read: bool,
    /// Overrides the batch limit recorded in the superblock.
    pub journal_max_batch: Option<u32>,
    /// Overrides the age limit recorded in the superblock.
    pub journal_max_age_secs: Option<u32>,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            cache_blocks: 4096,
            tail_limit: None,
            verify_on_read: false,
            journal_max_batch: None,
            journal_max_age_secs: None,
        }
    }
}

impl FsOptions {
    pub(crate) fn max_age(&self, recorded: u32) -> Duration {
        Duration::from_secs(u64::from(self.journal_max_age_secs.unwrap_or(recorded)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_for_small_block_sizes() {
        let layout = Layout::compute(512, 8192, 1024).unwrap();
        assert_eq!(layout.superblock, 128);
        assert_eq!(layout.first_bitmap, 129);
        assert_eq!(layout.journal_start, 130);
        assert_eq!(layout.root, 1154);
        assert_eq!(layout.bmap_nr, 2);
    }

    #[test]
    fn layout_rejects_overlaps() {
        assert!(Layout::compute(512, 8192, 4000).is_err());
        assert!(Layout::compute(4096, 80, 64).is_err());
        assert!(Layout::compute(4096, 10_000, 4).is_err());
    }

    #[test]
    fn options_parse_from_toml() {
        let opts: FsOptions = toml::from_str("cache_blocks = 64\nverify_on_read = true").unwrap();
        assert_eq!(opts.cache_blocks, 64);
        assert!(opts.verify_on_read);
        assert_eq!(opts.tail_limit, None);
        let fmt: FormatOptions = toml::from_str("block_size = 1024\nlabel = \"scratch\"").unwrap();
        assert_eq!(fmt.block_size, 1024);
        assert_eq!(fmt.journal_max_batch, 256);
        assert_eq!(fmt.journal_blocks_for(10_000), 1250);
    }
}
