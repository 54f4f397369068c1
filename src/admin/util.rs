use std::path::Path;
use std::sync::Arc;

use crate::fs::{read_superblock, Filesystem, FsOptions};
use crate::primitives::io::{BlockDevice, FileDevice, ImageFile};
use crate::storage::superblock::{probe_block_size, Superblock};
use crate::types::BlockNo;

use crate::admin::error::{AdminError, Result};

/// An image opened for direct block access, without journal replay.
pub struct RawImage {
    /// The block device over the image file.
    pub device: Arc<dyn BlockDevice>,
    /// Superblock as found on disk.
    pub superblock: Superblock,
}

/// Opens an image for offline inspection. Nothing is written.
///
/// # Errors
///
/// Returns an error if the file is missing or carries no valid superblock.
pub fn open_raw(path: &Path) -> Result<RawImage> {
    if !path.exists() {
        return Err(AdminError::NoImage(path.to_path_buf()));
    }
    let block_size = probe_block_size(&ImageFile::open(path)?)?;
    let device: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(path, block_size)?);
    let superblock = read_superblock(device.as_ref())?;
    Ok(RawImage { device, superblock })
}

/// Mounts an image, replaying its journal.
///
/// # Errors
///
/// Returns an error if the file is missing or the filesystem cannot be
/// opened.
pub fn open_fs(path: &Path, opts: &FsOptions) -> Result<Filesystem> {
    if !path.exists() {
        return Err(AdminError::NoImage(path.to_path_buf()));
    }
    Ok(Filesystem::open_image(path, opts.clone())?)
}

pub(crate) fn read_block(device: &dyn BlockDevice, block: BlockNo) -> crate::types::Result<Vec<u8>> {
    let mut buf = vec![0u8; device.block_size()];
    device.read_block(block, &mut buf)?;
    Ok(buf)
}
