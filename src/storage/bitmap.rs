#![forbid(unsafe_code)]
//! Free-block bitmap allocator.
//!
//! One bit per block, set = allocated, least significant bit first. Bitmap
//! blocks stay pinned for the lifetime of the allocator so granting and
//! freeing never touch the device.

use parking_lot::Mutex;
use tracing::debug;

use crate::primitives::cache::{BlockCache, BlockRef};
use crate::primitives::journal::BlockLog;
use crate::storage::superblock::Superblock;
use crate::types::{BlockNo, FsError, Result};

/// Get bit `idx` from a bitmap byte slice.
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> (idx % 8)) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << (idx % 8);
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << (idx % 8));
    }
}

/// Count free (zero) bits among the first `count` bits of `bitmap`.
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let mut free: u32 = bitmap
        .iter()
        .take(full_bytes)
        .map(|byte| byte.count_zeros())
        .sum();
    for idx in (full_bytes as u32 * 8)..count {
        if !bitmap_get(bitmap, idx) {
            free += 1;
        }
    }
    free
}

/// Initial bitmap images for a fresh filesystem.
///
/// Blocks `[0, used_prefix)` (boot area, superblock, first bitmap, journal,
/// initial root), every other bitmap block and the padding bits past the end
/// of the device are marked allocated.
pub fn initial_bitmaps(sb: &Superblock, used_prefix: u32) -> Vec<(BlockNo, Vec<u8>)> {
    let bits = sb.bits_per_bitmap();
    (0..u32::from(sb.bmap_nr))
        .map(|index| {
            let mut image = vec![0u8; sb.block_size as usize];
            let first = index * bits;
            for bit in 0..bits {
                let block = first + bit;
                if block < used_prefix || block >= sb.block_count {
                    bitmap_set(&mut image, bit);
                }
            }
            if index > 0 {
                bitmap_set(&mut image, 0);
            }
            (sb.bitmap_block(index), image)
        })
        .collect()
}

/// Number of blocks marked allocated by [`initial_bitmaps`].
pub fn initial_used(sb: &Superblock, used_prefix: u32) -> u32 {
    let extra_bitmaps = (1..u32::from(sb.bmap_nr))
        .filter(|index| index * sb.bits_per_bitmap() >= used_prefix)
        .count() as u32;
    used_prefix + extra_bitmaps
}

/// Allocator over the pinned bitmap blocks.
pub struct BitmapAllocator {
    block_count: u32,
    bits_per_bitmap: u32,
    bitmaps: Vec<BlockRef>,
    free_counts: Mutex<Vec<u32>>,
}

impl BitmapAllocator {
    /// Pins every bitmap block and caches per-bitmap free counts.
    pub fn load(cache: &BlockCache, sb: &Superblock) -> Result<Self> {
        let bits_per_bitmap = sb.bits_per_bitmap();
        let expected = sb.block_count.div_ceil(bits_per_bitmap);
        if u32::from(sb.bmap_nr) != expected {
            return Err(FsError::BadSuperblock("bitmap count does not match block count"));
        }
        let mut bitmaps = Vec::with_capacity(usize::from(sb.bmap_nr));
        let mut free_counts = Vec::with_capacity(usize::from(sb.bmap_nr));
        for index in 0..u32::from(sb.bmap_nr) {
            let block = cache.get(sb.bitmap_block(index))?;
            let valid = (sb.block_count - index * bits_per_bitmap).min(bits_per_bitmap);
            free_counts.push(bitmap_count_free(&block.data(), valid));
            bitmaps.push(block);
        }
        Ok(Self {
            block_count: sb.block_count,
            bits_per_bitmap,
            bitmaps,
            free_counts: Mutex::new(free_counts),
        })
    }

    /// Free blocks according to the cached counts.
    pub fn free_blocks(&self) -> u32 {
        self.free_counts.lock().iter().sum()
    }

    /// Whether `block` is marked allocated.
    pub fn is_allocated(&self, block: BlockNo) -> bool {
        if block.0 >= self.block_count {
            return false;
        }
        let (index, bit) = self.locate(block);
        bitmap_get(&self.bitmaps[index].data(), bit)
    }

    /// Recomputes the cached free counts after the bitmap blocks were
    /// rewritten behind the allocator's back.
    pub fn recount(&self) {
        let mut counts = self.free_counts.lock();
        for (index, bitmap) in self.bitmaps.iter().enumerate() {
            counts[index] = bitmap_count_free(&bitmap.data(), self.valid_bits(index));
        }
    }

    fn locate(&self, block: BlockNo) -> (usize, u32) {
        (
            (block.0 / self.bits_per_bitmap) as usize,
            block.0 % self.bits_per_bitmap,
        )
    }

    fn valid_bits(&self, index: usize) -> u32 {
        (self.block_count - index as u32 * self.bits_per_bitmap).min(self.bits_per_bitmap)
    }

    /// Grants `count` blocks, scanning forward from `hint` and wrapping.
    ///
    /// Every touched bitmap block joins `log`. Either all blocks are
    /// granted or none are and the result is [`FsError::NoSpace`].
    pub fn allocate(&self, log: &mut dyn BlockLog, count: u32, hint: BlockNo) -> Result<Vec<BlockNo>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut counts = self.free_counts.lock();
        if counts.iter().sum::<u32>() < count {
            return Err(FsError::NoSpace);
        }
        let hint = if hint.0 < self.block_count { hint } else { BlockNo(0) };
        let (first_index, first_bit) = self.locate(hint);
        let nr = self.bitmaps.len();
        let mut granted = Vec::with_capacity(count as usize);
        // The hint's bitmap is visited twice: from the hint to its end, then
        // from its start up to the hint after wrapping.
        for step in 0..=nr {
            if granted.len() as u32 == count {
                break;
            }
            let index = (first_index + step) % nr;
            if counts[index] == 0 {
                continue;
            }
            let range = match step {
                0 => first_bit..self.valid_bits(index),
                s if s == nr => 0..first_bit,
                _ => 0..self.valid_bits(index),
            };
            let bitmap = &self.bitmaps[index];
            let found: Vec<u32> = {
                let data = bitmap.data();
                range
                    .filter(|bit| !bitmap_get(&data, *bit))
                    .take(count as usize - granted.len())
                    .collect()
            };
            if found.is_empty() {
                continue;
            }
            log.log_block(bitmap);
            let mut data = bitmap.data_mut();
            for bit in &found {
                bitmap_set(&mut data, *bit);
                granted.push(BlockNo(index as u32 * self.bits_per_bitmap + bit));
            }
            counts[index] -= found.len() as u32;
        }
        if (granted.len() as u32) < count {
            for block in &granted {
                let (index, bit) = self.locate(*block);
                bitmap_clear(&mut self.bitmaps[index].data_mut(), bit);
                counts[index] += 1;
            }
            return Err(FsError::NoSpace);
        }
        debug!(count, hint = hint.0, first = granted[0].0, "bitmap.allocate");
        Ok(granted)
    }

    /// Returns `block` to the free pool.
    pub fn free(&self, log: &mut dyn BlockLog, block: BlockNo) -> Result<()> {
        if block.is_none() || block.0 >= self.block_count {
            return Err(FsError::TreeInconsistent("freeing a block outside the device"));
        }
        let (index, bit) = self.locate(block);
        let bitmap = &self.bitmaps[index];
        if !bitmap_get(&bitmap.data(), bit) {
            return Err(FsError::TreeInconsistent("double free"));
        }
        let mut counts = self.free_counts.lock();
        log.log_block(bitmap);
        bitmap_clear(&mut bitmap.data_mut(), bit);
        counts[index] += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_helpers() {
        let mut bm = [0u8; 4];
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 9);
        assert!(bitmap_get(&bm, 0));
        assert!(bitmap_get(&bm, 9));
        assert!(!bitmap_get(&bm, 8));
        assert_eq!(bm[1], 0b10);
        assert_eq!(bitmap_count_free(&bm, 32), 30);
        assert_eq!(bitmap_count_free(&bm, 10), 8);
        bitmap_clear(&mut bm, 9);
        assert_eq!(bitmap_count_free(&bm, 32), 31);
        assert!(!bitmap_get(&bm, 400));
    }
}
