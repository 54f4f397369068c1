#![forbid(unsafe_code)]
//! CRC32 over on-disk records.

/// Incremental CRC32 (IEEE) over several byte ranges.
#[derive(Clone, Default)]
pub struct Crc32 {
    inner: crc32fast::Hasher,
}

impl Crc32 {
    /// Starts an empty checksum.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `bytes`.
    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.inner.update(bytes);
        self
    }

    /// Feeds a block number in its on-disk (little endian) form.
    pub fn update_block(&mut self, block: u32) -> &mut Self {
        self.update(&block.to_le_bytes())
    }

    /// Checksum of everything fed so far; more input may follow.
    pub fn value(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum of a block image bound to the block number it belongs to.
pub fn block_crc32(block: u32, payload: &[u8]) -> u32 {
    Crc32::new().update_block(block).update(payload).value()
}
