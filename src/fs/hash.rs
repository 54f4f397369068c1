//! Directory entry offsets.
//!
//! An entry offset is the name hash with the low seven bits cleared, plus a
//! generation number that tells apart names sharing a hash.

use crate::types::{FsError, Result};

/// Longest entry name.
pub const NAME_MAX: usize = 255;
/// Generations available per hash value.
pub const GENERATIONS: u32 = 128;
const HASH_MASK: u32 = 0x7FFF_FF80;

/// The r5 hash over signed bytes.
pub fn r5_hash(name: &[u8]) -> u32 {
    let mut a: u32 = 0;
    for &byte in name {
        let c = i32::from(byte as i8);
        a = a.wrapping_add((c << 4) as u32);
        a = a.wrapping_add((c >> 4) as u32);
        a = a.wrapping_mul(11);
    }
    a
}

/// Offset of generation 0 for `name`. Never collides with "." or "..".
pub fn base_offset(name: &[u8]) -> u32 {
    match r5_hash(name) & HASH_MASK {
        0 => GENERATIONS,
        value => value,
    }
}

/// Rejects names a directory cannot hold.
pub fn check_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name == b"." || name == b".." || name.contains(&b'/') || name.contains(&0) {
        return Err(FsError::Invalid("invalid entry name"));
    }
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_bits_are_clear() {
        for name in [&b"foo"[..], b"a", b"some-longer-name.txt", &[0xC3, 0xA9]] {
            let offset = base_offset(name);
            assert_eq!(offset % GENERATIONS, 0);
            assert!(offset >= GENERATIONS);
        }
        assert_ne!(base_offset(b"foo"), base_offset(b"bar"));
    }

    #[test]
    fn high_bytes_hash_as_signed() {
        // 0xFF is -1: (-16) + (-1) wrapped, times 11.
        assert_eq!(r5_hash(&[0xFF]), 0u32.wrapping_sub(17).wrapping_mul(11));
        assert_eq!(r5_hash(b"a"), (97 * 16 + 6) * 11);
    }

    #[test]
    fn name_rules() {
        assert!(check_name(b"ok").is_ok());
        assert!(check_name(b"").is_err());
        assert!(check_name(b"..").is_err());
        assert!(check_name(b"a/b").is_err());
        assert!(matches!(check_name(&[b'x'; 256]), Err(FsError::NameTooLong)));
    }
}
