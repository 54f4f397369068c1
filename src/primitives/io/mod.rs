#![forbid(unsafe_code)]
//! Image files and the block device contract built on top of them.
//!
//! [`ImageIo`] is byte addressed and knows nothing about blocks; the
//! block devices turn it (or plain memory) into fixed-size blocks.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;

use crate::types::{FsError, Result};

mod device;

pub use device::{BlockDevice, FaultyDevice, FileDevice, MemDevice};

/// Byte-addressed access to the backing store of a file device.
pub trait ImageIo: Send + Sync + 'static {
    /// Fills `dst` from byte position `pos`; a short read is an error.
    fn read_exact_at(&self, pos: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at byte position `pos`.
    fn write_all_at(&self, pos: u64, src: &[u8]) -> Result<()>;
    /// Makes completed writes durable.
    fn sync(&self) -> Result<()>;
    /// Current length in bytes.
    fn byte_len(&self) -> Result<u64>;
    /// Grows or shrinks the store to `len` bytes.
    fn set_byte_len(&self, len: u64) -> Result<()>;
}

/// An image file on the host filesystem.
pub struct ImageFile {
    file: File,
}

impl ImageFile {
    /// Opens `path` read-write, creating it when absent. Existing content
    /// is kept.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }

    /// Opens an existing image read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], pos: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, pos)
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], pos: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, pos)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], pos: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, pos)
}

#[cfg(windows)]
fn pwrite(file: &File, buf: &[u8], pos: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, pos)
}

impl ImageIo for ImageFile {
    fn read_exact_at(&self, mut pos: u64, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            match pread(&self.file, dst, pos) {
                Ok(0) => return Err(short_transfer("image ends inside the requested range")),
                Ok(n) => {
                    dst = &mut std::mem::take(&mut dst)[n..];
                    pos += n as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn write_all_at(&self, mut pos: u64, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            match pwrite(&self.file, src, pos) {
                Ok(0) => {
                    return Err(FsError::DeviceIo(io::Error::new(
                        ErrorKind::WriteZero,
                        "image accepted no bytes",
                    )))
                }
                Ok(n) => {
                    src = &src[n..];
                    pos += n as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(self.file.sync_data()?)
    }

    fn byte_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_byte_len(&self, len: u64) -> Result<()> {
        Ok(self.file.set_len(len)?)
    }
}

pub(crate) fn short_transfer(msg: &'static str) -> FsError {
    FsError::DeviceIo(io::Error::new(ErrorKind::UnexpectedEof, msg))
}
