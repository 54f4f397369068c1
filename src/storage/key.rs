#![forbid(unsafe_code)]
//! Composite item keys and their total order.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

use crate::primitives::bytes::{get_u32, put_u32};

/// Encoded key length.
pub const KEY_SIZE: usize = 16;

/// Uniqueness of stat-data items.
pub const UNIQ_STAT_DATA: u32 = 0;
/// Uniqueness of directory items.
pub const UNIQ_DIRECTORY: u32 = 500;
/// Uniqueness of direct (inline byte) items.
pub const UNIQ_DIRECT: u32 = 0xFFFF_FFFF;
/// Uniqueness of indirect (block pointer) items.
pub const UNIQ_INDIRECT: u32 = 0xFFFF_FFFE;

/// Offset of the "." entry.
pub const DOT_OFFSET: u32 = 1;
/// Offset of the ".." entry.
pub const DOT_DOT_OFFSET: u32 = 2;

/// Item type, encoded in the key's uniqueness field.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum ItemType {
    /// Object metadata.
    StatData,
    /// Directory entries.
    Directory,
    /// File bytes stored inside the leaf.
    Direct,
    /// Pointers to unformatted data blocks.
    Indirect,
}

impl ItemType {
    /// Maps a uniqueness value to its type; other values are unknown.
    pub fn from_uniqueness(uniqueness: u32) -> Option<ItemType> {
        match uniqueness {
            UNIQ_STAT_DATA => Some(ItemType::StatData),
            UNIQ_DIRECTORY => Some(ItemType::Directory),
            UNIQ_DIRECT => Some(ItemType::Direct),
            UNIQ_INDIRECT => Some(ItemType::Indirect),
            _ => None,
        }
    }

    /// The uniqueness value stored for this type.
    pub fn uniqueness(self) -> u32 {
        match self {
            ItemType::StatData => UNIQ_STAT_DATA,
            ItemType::Directory => UNIQ_DIRECTORY,
            ItemType::Direct => UNIQ_DIRECT,
            ItemType::Indirect => UNIQ_INDIRECT,
        }
    }

    /// Short name used by dumps.
    pub fn name(self) -> &'static str {
        match self {
            ItemType::StatData => "SD",
            ItemType::Directory => "DIR",
            ItemType::Direct => "DRCT",
            ItemType::Indirect => "IND",
        }
    }
}

/// Composite key ordering every item in the tree.
///
/// Field order is the comparison order; derived `Ord` therefore yields the
/// lexicographic order over (dir_id, object_id, offset) with uniqueness as
/// the final tie-break.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Serialize)]
pub struct Key {
    /// Parent directory id (packing locality).
    pub dir_id: u32,
    /// Object id.
    pub object_id: u32,
    /// Byte offset (1-based) or directory entry offset.
    pub offset: u32,
    /// Item type tag.
    pub uniqueness: u32,
}

/// Smallest possible key.
pub const MIN_KEY: Key = Key {
    dir_id: 0,
    object_id: 0,
    offset: 0,
    uniqueness: 0,
};

/// Largest possible key; right-delimiting key of the rightmost nodes.
pub const MAX_KEY: Key = Key {
    dir_id: u32::MAX,
    object_id: u32::MAX,
    offset: u32::MAX,
    uniqueness: u32::MAX,
};

impl Key {
    /// Builds a key from its four fields.
    pub const fn new(dir_id: u32, object_id: u32, offset: u32, uniqueness: u32) -> Key {
        Key {
            dir_id,
            object_id,
            offset,
            uniqueness,
        }
    }

    /// Key of an object's stat data.
    pub const fn stat_data(dir_id: u32, object_id: u32) -> Key {
        Key::new(dir_id, object_id, 0, UNIQ_STAT_DATA)
    }

    /// Key of a directory item whose first entry has `offset`.
    pub const fn directory(dir_id: u32, object_id: u32, offset: u32) -> Key {
        Key::new(dir_id, object_id, offset, UNIQ_DIRECTORY)
    }

    /// Key of a direct item starting at byte `offset` (1-based).
    pub const fn direct(dir_id: u32, object_id: u32, offset: u32) -> Key {
        Key::new(dir_id, object_id, offset, UNIQ_DIRECT)
    }

    /// Key of an indirect item starting at byte `offset` (1-based).
    pub const fn indirect(dir_id: u32, object_id: u32, offset: u32) -> Key {
        Key::new(dir_id, object_id, offset, UNIQ_INDIRECT)
    }

    /// Item type, `None` for unknown uniqueness values.
    pub fn item_type(&self) -> Option<ItemType> {
        ItemType::from_uniqueness(self.uniqueness)
    }

    /// Same key with a different offset.
    pub fn with_offset(&self, offset: u32) -> Key {
        Key { offset, ..*self }
    }

    /// Same key with a different type.
    pub fn with_type(&self, ty: ItemType) -> Key {
        Key {
            uniqueness: ty.uniqueness(),
            ..*self
        }
    }

    /// Decodes a key from the first 16 bytes of `src`.
    pub fn decode(src: &[u8]) -> Key {
        Key {
            dir_id: get_u32(src, 0),
            object_id: get_u32(src, 4),
            offset: get_u32(src, 8),
            uniqueness: get_u32(src, 12),
        }
    }

    /// Encodes the key into the first 16 bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) {
        put_u32(dst, 0, self.dir_id);
        put_u32(dst, 4, self.object_id);
        put_u32(dst, 8, self.offset);
        put_u32(dst, 12, self.uniqueness);
    }
}

/// Compares only (dir_id, object_id): equal means "same object".
pub fn comp_short_keys(a: &Key, b: &Key) -> Ordering {
    (a.dir_id, a.object_id).cmp(&(b.dir_id, b.object_id))
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == MAX_KEY {
            return f.write_str("[MAX]");
        }
        let ty = match self.item_type() {
            Some(ty) => ty.name().to_string(),
            None => format!("?{}", self.uniqueness),
        };
        write!(
            f,
            "[{} {} {} {}]",
            self.dir_id, self.object_id, self.offset, ty
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn uniqueness_breaks_ties_last() {
        let sd = Key::stat_data(1, 2);
        let dir = Key::directory(1, 2, 0);
        assert!(sd < dir);
        let direct = Key::direct(1, 2, 1);
        let indirect = Key::indirect(1, 2, 1);
        assert!(indirect < direct);
        assert!(Key::direct(1, 2, 5) < Key::indirect(1, 2, 6));
        assert!(Key::direct(1, 9, 0) > Key::indirect(1, 2, u32::MAX));
        assert!(MIN_KEY < sd && sd < MAX_KEY);
    }

    #[test]
    fn short_keys_ignore_offset_and_type() {
        let a = Key::direct(4, 7, 100);
        let b = Key::stat_data(4, 7);
        assert_eq!(comp_short_keys(&a, &b), Ordering::Equal);
        assert_eq!(comp_short_keys(&a, &Key::stat_data(4, 8)), Ordering::Less);
    }

    #[test]
    fn unknown_uniqueness_has_no_type() {
        assert_eq!(Key::new(1, 2, 3, 77).item_type(), None);
        assert_eq!(
            Key::indirect(1, 2, 3).item_type(),
            Some(ItemType::Indirect)
        );
        assert_eq!(format!("{}", Key::new(1, 2, 3, 77)), "[1 2 3 ?77]");
    }

    fn arb_key() -> impl Strategy<Value = Key> {
        (0u32..4, 0u32..4, any::<u32>(), any::<u32>())
            .prop_map(|(d, o, off, u)| Key::new(d, o, off, u))
    }

    proptest! {
        #[test]
        fn encoding_preserves_order(a in arb_key(), b in arb_key()) {
            let mut ea = [0u8; KEY_SIZE];
            let mut eb = [0u8; KEY_SIZE];
            a.encode(&mut ea);
            b.encode(&mut eb);
            let (da, db) = (Key::decode(&ea), Key::decode(&eb));
            prop_assert_eq!(da, a);
            prop_assert_eq!(da.cmp(&db), a.cmp(&b));
            let tuple = (a.dir_id, a.object_id, a.offset, a.uniqueness)
                .cmp(&(b.dir_id, b.object_id, b.offset, b.uniqueness));
            prop_assert_eq!(a.cmp(&b), tuple);
        }
    }
}
