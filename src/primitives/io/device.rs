#![forbid(unsafe_code)]

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::{BlockNo, FsError, Result};

use super::{short_transfer, ImageFile, ImageIo};

/// Read-block / write-block contract of the storage medium.
///
/// Buffers passed to the device are exactly one block long.
pub trait BlockDevice: Send + Sync + 'static {
    /// Size of one block in bytes.
    fn block_size(&self) -> usize;
    /// Number of addressable blocks.
    fn block_count(&self) -> u32;
    /// Reads one block into `dst`.
    fn read_block(&self, block: BlockNo, dst: &mut [u8]) -> Result<()>;
    /// Writes one block from `src`.
    fn write_block(&self, block: BlockNo, src: &[u8]) -> Result<()>;
    /// Makes every completed write durable.
    fn flush(&self) -> Result<()>;
}

fn check_request(dev: &dyn BlockDevice, block: BlockNo, len: usize) -> Result<()> {
    if len != dev.block_size() {
        return Err(FsError::Invalid("buffer length differs from block size"));
    }
    if block.0 >= dev.block_count() {
        return Err(short_transfer("block beyond end of device"));
    }
    Ok(())
}

/// Block device backed by a regular file.
pub struct FileDevice {
    io: Arc<dyn ImageIo>,
    block_size: usize,
    block_count: u32,
}

impl FileDevice {
    /// Creates (or resizes) the image file to hold `block_count` blocks.
    pub fn create(path: impl AsRef<Path>, block_size: usize, block_count: u32) -> Result<Self> {
        let io = ImageFile::create(path)?;
        io.set_byte_len(block_size as u64 * u64::from(block_count))?;
        Ok(Self::from_io(Arc::new(io), block_size, block_count))
    }

    /// Opens an existing image; the block count follows from its length.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let io = ImageFile::open(path)?;
        let len = io.byte_len()?;
        let count = u32::try_from(len / block_size as u64)
            .map_err(|_| FsError::Invalid("image has more blocks than addressable"))?;
        Ok(Self::from_io(Arc::new(io), block_size, count))
    }

    /// Wraps an arbitrary positioned I/O implementation.
    pub fn from_io(io: Arc<dyn ImageIo>, block_size: usize, block_count: u32) -> Self {
        Self {
            io,
            block_size,
            block_count,
        }
    }

    fn offset(&self, block: BlockNo) -> u64 {
        u64::from(block.0) * self.block_size as u64
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn read_block(&self, block: BlockNo, dst: &mut [u8]) -> Result<()> {
        check_request(self, block, dst.len())?;
        self.io.read_exact_at(self.offset(block), dst)
    }

    fn write_block(&self, block: BlockNo, src: &[u8]) -> Result<()> {
        check_request(self, block, src.len())?;
        self.io.write_all_at(self.offset(block), src)
    }

    fn flush(&self) -> Result<()> {
        self.io.sync()
    }
}

/// Volatile device keeping every block in memory.
pub struct MemDevice {
    block_size: usize,
    blocks: Mutex<Vec<Box<[u8]>>>,
    writes: AtomicU64,
}

impl MemDevice {
    /// Creates a zero-filled device.
    pub fn new(block_size: usize, block_count: u32) -> Self {
        let blocks = (0..block_count)
            .map(|_| vec![0u8; block_size].into_boxed_slice())
            .collect();
        Self {
            block_size,
            blocks: Mutex::new(blocks),
            writes: AtomicU64::new(0),
        }
    }

    /// Copies the whole device content, e.g. to fork a crash image.
    pub fn snapshot(&self) -> MemDevice {
        let blocks = self.blocks.lock().clone();
        Self {
            block_size: self.block_size,
            blocks: Mutex::new(blocks),
            writes: AtomicU64::new(0),
        }
    }

    /// Returns a copy of one block.
    pub fn block(&self, block: BlockNo) -> Option<Vec<u8>> {
        self.blocks.lock().get(block.0 as usize).map(|b| b.to_vec())
    }

    /// Number of block writes performed so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockDevice for MemDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.blocks.lock().len() as u32
    }

    fn read_block(&self, block: BlockNo, dst: &mut [u8]) -> Result<()> {
        check_request(self, block, dst.len())?;
        dst.copy_from_slice(&self.blocks.lock()[block.0 as usize]);
        Ok(())
    }

    fn write_block(&self, block: BlockNo, src: &[u8]) -> Result<()> {
        check_request(self, block, src.len())?;
        self.blocks.lock()[block.0 as usize].copy_from_slice(src);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Device wrapper that starts failing writes after a budget is used up.
///
/// Once tripped every later write and flush fails, which models the medium
/// disappearing at an arbitrary point: the inner device keeps exactly the
/// writes that happened before the trip.
pub struct FaultyDevice {
    inner: Arc<dyn BlockDevice>,
    writes_left: AtomicU64,
    tripped: AtomicBool,
}

impl FaultyDevice {
    /// Allows `write_budget` block writes before failing.
    pub fn new(inner: Arc<dyn BlockDevice>, write_budget: u64) -> Self {
        Self {
            inner,
            writes_left: AtomicU64::new(write_budget),
            tripped: AtomicBool::new(false),
        }
    }

    /// True once a write has been refused.
    pub fn tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Resets the write budget and clears the tripped flag.
    pub fn rearm(&self, write_budget: u64) {
        self.writes_left.store(write_budget, Ordering::Release);
        self.tripped.store(false, Ordering::Release);
    }

    fn injected(&self) -> FsError {
        FsError::DeviceIo(io::Error::new(io::ErrorKind::Other, "injected write failure"))
    }
}

impl BlockDevice for FaultyDevice {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn block_count(&self) -> u32 {
        self.inner.block_count()
    }

    fn read_block(&self, block: BlockNo, dst: &mut [u8]) -> Result<()> {
        self.inner.read_block(block, dst)
    }

    fn write_block(&self, block: BlockNo, src: &[u8]) -> Result<()> {
        if self.tripped() {
            return Err(self.injected());
        }
        let granted = self
            .writes_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok();
        if !granted {
            if !self.tripped.swap(true, Ordering::AcqRel) {
                warn!(block = block.0, "faulty device tripped");
            }
            return Err(self.injected());
        }
        debug!(block = block.0, "faulty device write");
        self.inner.write_block(block, src)
    }

    fn flush(&self) -> Result<()> {
        if self.tripped() {
            return Err(self.injected());
        }
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mem_device_roundtrip_and_bounds() {
        let dev = MemDevice::new(512, 4);
        let block = vec![7u8; 512];
        dev.write_block(BlockNo(3), &block).unwrap();
        let mut out = vec![0u8; 512];
        dev.read_block(BlockNo(3), &mut out).unwrap();
        assert_eq!(out, block);
        assert!(dev.read_block(BlockNo(4), &mut out).is_err());
        assert!(dev.write_block(BlockNo(0), &block[..100]).is_err());
    }

    #[test]
    fn file_device_persists_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");
        {
            let dev = FileDevice::create(&path, 1024, 16).unwrap();
            dev.write_block(BlockNo(5), &[0xAB; 1024]).unwrap();
            dev.flush().unwrap();
        }
        let dev = FileDevice::open(&path, 1024).unwrap();
        assert_eq!(dev.block_count(), 16);
        let mut out = vec![0u8; 1024];
        dev.read_block(BlockNo(5), &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn faulty_device_stops_after_budget() {
        let mem = Arc::new(MemDevice::new(512, 8));
        let dev = FaultyDevice::new(mem.clone(), 2);
        dev.write_block(BlockNo(1), &[1; 512]).unwrap();
        dev.write_block(BlockNo(2), &[2; 512]).unwrap();
        assert!(dev.write_block(BlockNo(3), &[3; 512]).is_err());
        assert!(dev.tripped());
        assert!(dev.flush().is_err());
        assert_eq!(mem.block(BlockNo(2)).unwrap()[0], 2);
        assert_eq!(mem.block(BlockNo(3)).unwrap()[0], 0);
        dev.rearm(1);
        dev.write_block(BlockNo(3), &[3; 512]).unwrap();
    }
}
