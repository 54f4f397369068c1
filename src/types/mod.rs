#![forbid(unsafe_code)]
//! Shared identifiers and the crate-wide error type.

use std::fmt;

use serde::Serialize;

mod checksum;

pub use checksum::{block_crc32, Crc32};

/// Number of a block on the device (the device is a flat array of blocks).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct BlockNo(pub u32);

/// Monotonic journal transaction identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct TransId(pub u32);

impl BlockNo {
    /// Block number zero doubles as "no block" in child pointers and holes.
    pub const NONE: BlockNo = BlockNo(0);

    /// Returns true for the null block number.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl TransId {
    /// Returns the identifier following this one.
    pub fn next(self) -> TransId {
        TransId(self.0.wrapping_add(1))
    }
}

impl fmt::Display for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TransId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    /// The block device failed a read, write or flush.
    #[error("device I/O: {0}")]
    DeviceIo(#[from] std::io::Error),
    /// The allocator could not satisfy a reservation.
    #[error("no space left on device")]
    NoSpace,
    /// A node failed a structural sanity check; the filesystem needs repair.
    #[error("tree inconsistent: {0}")]
    TreeInconsistent(&'static str),
    /// The path used by a mutation no longer matches the tree shape.
    #[error("stale transition path")]
    StaleTransitionPath,
    /// The superblock is missing or malformed.
    #[error("bad superblock: {0}")]
    BadSuperblock(&'static str),
    /// Requested object or entry does not exist.
    #[error("not found")]
    NotFound,
    /// A directory entry with that name already exists.
    #[error("already exists")]
    AlreadyExists,
    /// Directory operation on a non-directory object.
    #[error("not a directory")]
    NotADirectory,
    /// Attempt to remove a directory that still has entries.
    #[error("directory not empty")]
    DirectoryNotEmpty,
    /// Entry name does not fit in a directory item.
    #[error("name too long")]
    NameTooLong,
    /// Caller supplied an argument the engine cannot honour.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FsError>;
