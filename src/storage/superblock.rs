#![forbid(unsafe_code)]
//! Superblock: the fixed-location record describing the whole layout.

use std::ops::Range;

use rand::{rngs::OsRng, RngCore};
use serde::Serialize;

use crate::primitives::bytes::{get_u16_at, get_u32_at, put_u16_at, put_u32_at};
use crate::primitives::io::ImageIo;
use crate::types::{BlockNo, Crc32, FsError, Result};

/// Byte offset of the superblock; everything before it is the boot area.
pub const SUPERBLOCK_OFFSET: u64 = 65536;
/// Encoded superblock length.
pub const SUPERBLOCK_LEN: usize = 128;
/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: usize = 512;
/// Largest supported block size (free-space fields are 16 bit).
pub const MAX_BLOCK_SIZE: usize = 32768;
/// Current on-disk format version.
pub const FORMAT_VERSION: u16 = 1;

const MAGIC: [u8; 8] = *b"BALFS\0v1";

const SB_MAGIC: Range<usize> = 0..8;
const SB_BLOCK_SIZE: Range<usize> = 8..12;
const SB_BLOCK_COUNT: Range<usize> = 12..16;
const SB_FREE_BLOCKS: Range<usize> = 16..20;
const SB_ROOT_BLOCK: Range<usize> = 20..24;
const SB_TREE_HEIGHT: Range<usize> = 24..26;
const SB_BMAP_NR: Range<usize> = 26..28;
const SB_JOURNAL_START: Range<usize> = 28..32;
const SB_JOURNAL_BLOCKS: Range<usize> = 32..36;
const SB_JOURNAL_MAX_BATCH: Range<usize> = 36..40;
const SB_JOURNAL_MAX_AGE: Range<usize> = 40..44;
const SB_NEXT_OBJECTID: Range<usize> = 44..48;
const SB_STATE: Range<usize> = 48..50;
const SB_FORMAT_VERSION: Range<usize> = 50..52;
const SB_UUID: Range<usize> = 52..68;
const SB_LABEL: Range<usize> = 68..84;
const SB_RESERVED: Range<usize> = 84..124;
const SB_CRC32: Range<usize> = 124..128;

/// Filesystem state flag.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum FsState {
    /// No known inconsistency.
    Valid,
    /// A sanity check failed; repair before trusting the tree.
    Error,
}

impl FsState {
    fn to_raw(self) -> u16 {
        match self {
            FsState::Valid => 1,
            FsState::Error => 2,
        }
    }

    fn from_raw(raw: u16) -> Result<FsState> {
        match raw {
            1 => Ok(FsState::Valid),
            2 => Ok(FsState::Error),
            _ => Err(FsError::BadSuperblock("unknown state")),
        }
    }
}

/// Decoded superblock.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Superblock {
    /// Block size in bytes.
    pub block_size: u32,
    /// Total number of blocks.
    pub block_count: u32,
    /// Blocks not allocated in the bitmap.
    pub free_blocks: u32,
    /// Root node of the tree.
    pub root_block: BlockNo,
    /// Levels in the tree (1 = the root is a leaf).
    pub tree_height: u16,
    /// Number of bitmap blocks.
    pub bmap_nr: u16,
    /// First block of the journal region (its header block).
    pub journal_start: BlockNo,
    /// Blocks in the journal region including the header block.
    pub journal_blocks: u32,
    /// Blocks a transaction may dirty before it is closed.
    pub journal_max_batch: u32,
    /// Seconds a transaction may stay open.
    pub journal_max_age: u32,
    /// Next object id to hand out; ids are never reused.
    pub next_objectid: u32,
    /// Consistency flag.
    pub state: FsState,
    /// Format version.
    pub format_version: u16,
    /// Random identifier chosen at format time.
    #[serde(serialize_with = "serialize_uuid")]
    pub uuid: [u8; 16],
    /// Volume label, NUL padded.
    #[serde(serialize_with = "serialize_label")]
    pub label: [u8; 16],
}

fn serialize_uuid<S: serde::Serializer>(uuid: &[u8; 16], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(uuid))
}

fn serialize_label<S: serde::Serializer>(label: &[u8; 16], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&label_string(label))
}

fn label_string(label: &[u8; 16]) -> String {
    let end = label.iter().position(|b| *b == 0).unwrap_or(label.len());
    String::from_utf8_lossy(&label[..end]).into_owned()
}

/// Block holding the superblock for a given block size.
pub fn superblock_block(block_size: usize) -> BlockNo {
    BlockNo((SUPERBLOCK_OFFSET / block_size as u64) as u32)
}

/// Random uuid for a new filesystem.
pub fn new_uuid() -> [u8; 16] {
    let mut uuid = [0u8; 16];
    OsRng.fill_bytes(&mut uuid);
    uuid
}

/// Validates a block size.
pub fn check_block_size(block_size: usize) -> Result<()> {
    if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(FsError::Invalid("block size must be a power of two in 512..=32768"));
    }
    Ok(())
}

/// Reads the block size recorded in an image file's superblock.
pub fn probe_block_size(io: &dyn ImageIo) -> Result<usize> {
    let mut buf = [0u8; SUPERBLOCK_LEN];
    io.read_exact_at(SUPERBLOCK_OFFSET, &mut buf)
        .map_err(|_| FsError::BadSuperblock("image too short for a superblock"))?;
    let sb = Superblock::decode(&buf)?;
    Ok(sb.block_size as usize)
}

impl Superblock {
    /// Label as text.
    pub fn label(&self) -> String {
        label_string(&self.label)
    }

    /// Block holding this superblock.
    pub fn location(&self) -> BlockNo {
        superblock_block(self.block_size as usize)
    }

    /// Bits (blocks) described by one bitmap block.
    pub fn bits_per_bitmap(&self) -> u32 {
        self.block_size * 8
    }

    /// Location of bitmap block `index`.
    pub fn bitmap_block(&self, index: u32) -> BlockNo {
        if index == 0 {
            BlockNo(self.location().0 + 1)
        } else {
            BlockNo(index * self.bits_per_bitmap())
        }
    }

    /// Encodes into the first [`SUPERBLOCK_LEN`] bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        let buf = &mut buf[..SUPERBLOCK_LEN];
        buf.fill(0);
        buf[SB_MAGIC].copy_from_slice(&MAGIC);
        put_u32_at(buf, SB_BLOCK_SIZE, self.block_size);
        put_u32_at(buf, SB_BLOCK_COUNT, self.block_count);
        put_u32_at(buf, SB_FREE_BLOCKS, self.free_blocks);
        put_u32_at(buf, SB_ROOT_BLOCK, self.root_block.0);
        put_u16_at(buf, SB_TREE_HEIGHT, self.tree_height);
        put_u16_at(buf, SB_BMAP_NR, self.bmap_nr);
        put_u32_at(buf, SB_JOURNAL_START, self.journal_start.0);
        put_u32_at(buf, SB_JOURNAL_BLOCKS, self.journal_blocks);
        put_u32_at(buf, SB_JOURNAL_MAX_BATCH, self.journal_max_batch);
        put_u32_at(buf, SB_JOURNAL_MAX_AGE, self.journal_max_age);
        put_u32_at(buf, SB_NEXT_OBJECTID, self.next_objectid);
        put_u16_at(buf, SB_STATE, self.state.to_raw());
        put_u16_at(buf, SB_FORMAT_VERSION, self.format_version);
        buf[SB_UUID].copy_from_slice(&self.uuid);
        buf[SB_LABEL].copy_from_slice(&self.label);
        let crc = Crc32::new().update(&buf[..SB_CRC32.start]).value();
        put_u32_at(buf, SB_CRC32, crc);
    }

    /// Decodes and validates a superblock.
    pub fn decode(buf: &[u8]) -> Result<Superblock> {
        if buf.len() < SUPERBLOCK_LEN {
            return Err(FsError::BadSuperblock("superblock truncated"));
        }
        if buf[SB_MAGIC] != MAGIC {
            return Err(FsError::BadSuperblock("magic mismatch"));
        }
        if Crc32::new().update(&buf[..SB_CRC32.start]).value() != get_u32_at(buf, SB_CRC32) {
            return Err(FsError::BadSuperblock("crc mismatch"));
        }
        if buf[SB_RESERVED].iter().any(|b| *b != 0) {
            return Err(FsError::BadSuperblock("reserved bytes non-zero"));
        }
        let format_version = get_u16_at(buf, SB_FORMAT_VERSION);
        if format_version != FORMAT_VERSION {
            return Err(FsError::BadSuperblock("unsupported format version"));
        }
        let block_size = get_u32_at(buf, SB_BLOCK_SIZE);
        check_block_size(block_size as usize)
            .map_err(|_| FsError::BadSuperblock("invalid block size"))?;
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[SB_UUID]);
        let mut label = [0u8; 16];
        label.copy_from_slice(&buf[SB_LABEL]);
        let sb = Superblock {
            block_size,
            block_count: get_u32_at(buf, SB_BLOCK_COUNT),
            free_blocks: get_u32_at(buf, SB_FREE_BLOCKS),
            root_block: BlockNo(get_u32_at(buf, SB_ROOT_BLOCK)),
            tree_height: get_u16_at(buf, SB_TREE_HEIGHT),
            bmap_nr: get_u16_at(buf, SB_BMAP_NR),
            journal_start: BlockNo(get_u32_at(buf, SB_JOURNAL_START)),
            journal_blocks: get_u32_at(buf, SB_JOURNAL_BLOCKS),
            journal_max_batch: get_u32_at(buf, SB_JOURNAL_MAX_BATCH),
            journal_max_age: get_u32_at(buf, SB_JOURNAL_MAX_AGE),
            next_objectid: get_u32_at(buf, SB_NEXT_OBJECTID),
            state: FsState::from_raw(get_u16_at(buf, SB_STATE))?,
            format_version,
            uuid,
            label,
        };
        if sb.free_blocks > sb.block_count || sb.root_block.0 >= sb.block_count {
            return Err(FsError::BadSuperblock("block counts out of range"));
        }
        if sb.tree_height == 0 || sb.tree_height > crate::storage::node::MAX_HEIGHT {
            return Err(FsError::BadSuperblock("tree height out of range"));
        }
        Ok(sb)
    }
}

/// Copies `label` into the fixed-size field, truncating at 16 bytes.
pub fn encode_label(label: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let bytes = label.as_bytes();
    let n = bytes.len().min(out.len());
    out[..n].copy_from_slice(&bytes[..n]);
    out
}
