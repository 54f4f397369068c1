use std::path::PathBuf;

use thiserror::Error;

use crate::types::{BlockNo, FsError};

/// Failures of the offline image tools.
#[derive(Debug, Error)]
pub enum AdminError {
    /// No file at the given path.
    #[error("no image at {}", .0.display())]
    NoImage(PathBuf),
    /// A block number outside the image was requested.
    #[error("block {block} is past the end of the image ({count} blocks)")]
    OutOfRange {
        /// Requested block.
        block: BlockNo,
        /// Blocks in the image.
        count: u32,
    },
    /// The engine refused the image or an operation on it.
    #[error(transparent)]
    Fs(#[from] FsError),
    /// Host I/O outside the block device.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for the admin tools.
pub type Result<T> = std::result::Result<T, AdminError>;
