#![forbid(unsafe_code)]
//! Little-endian field helpers for the on-disk structures.
//!
//! All fixed-width fields of the format are stored little endian at fixed
//! byte offsets; callers guarantee the slice is long enough.

use core::ops::Range;

#[inline]
fn array<const N: usize>(src: &[u8], off: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&src[off..off + N]);
    out
}

/// Reads a `u16` stored little endian at `off`.
#[inline]
pub fn get_u16(src: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(array(src, off))
}

/// Reads a `u32` stored little endian at `off`.
#[inline]
pub fn get_u32(src: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(array(src, off))
}

/// Reads a `u64` stored little endian at `off`.
#[inline]
pub fn get_u64(src: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(array(src, off))
}

/// Writes `v` little endian at `off`.
#[inline]
pub fn put_u16(dst: &mut [u8], off: usize, v: u16) {
    dst[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

/// Writes `v` little endian at `off`.
#[inline]
pub fn put_u32(dst: &mut [u8], off: usize, v: u32) {
    dst[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Writes `v` little endian at `off`.
#[inline]
pub fn put_u64(dst: &mut [u8], off: usize, v: u64) {
    dst[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Field accessors keyed by byte ranges, as used by the superblock layout.
pub fn get_u32_at(src: &[u8], range: Range<usize>) -> u32 {
    debug_assert_eq!(range.len(), 4);
    get_u32(src, range.start)
}

/// Range-keyed counterpart of [`get_u16`].
pub fn get_u16_at(src: &[u8], range: Range<usize>) -> u16 {
    debug_assert_eq!(range.len(), 2);
    get_u16(src, range.start)
}

/// Range-keyed counterpart of [`put_u32`].
pub fn put_u32_at(dst: &mut [u8], range: Range<usize>, v: u32) {
    debug_assert_eq!(range.len(), 4);
    put_u32(dst, range.start, v);
}

/// Range-keyed counterpart of [`put_u16`].
pub fn put_u16_at(dst: &mut [u8], range: Range<usize>, v: u16) {
    debug_assert_eq!(range.len(), 2);
    put_u16(dst, range.start, v);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fields_are_little_endian() {
        let mut buf = [0u8; 16];
        put_u32(&mut buf, 2, 0x0102_0304);
        assert_eq!(&buf[2..6], &[0x04, 0x03, 0x02, 0x01]);
        put_u16(&mut buf, 8, 0xBEEF);
        assert_eq!(&buf[8..10], &[0xEF, 0xBE]);
        assert_eq!(get_u32(&buf, 2), 0x0102_0304);
        assert_eq!(get_u16(&buf, 8), 0xBEEF);
    }

    proptest! {
        #[test]
        fn u64_field_preserves_value(v in any::<u64>(), off in 0usize..8) {
            let mut buf = [0u8; 16];
            put_u64(&mut buf, off, v);
            prop_assert_eq!(get_u64(&buf, off), v);
        }
    }
}
