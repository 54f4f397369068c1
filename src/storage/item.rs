#![forbid(unsafe_code)]
//! Items: typed bodies addressed by a [`Key`], plus the unit model the
//! balancer uses to split and merge them.

use std::cmp::Ordering;

use serde::Serialize;

use crate::primitives::bytes::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};
use crate::storage::key::{comp_short_keys, ItemType, Key, KEY_SIZE};
use crate::types::{FsError, Result};

/// Encoded item header length.
pub const IH_SIZE: usize = 24;
/// Encoded stat-data body length.
pub const SD_SIZE: usize = 44;
/// Encoded directory entry header length.
pub const DEH_SIZE: usize = 16;
/// Entry state bit: entry is live.
pub const DEH_VISIBLE: u16 = 1 << 2;

/// Mode bits of a directory.
pub const S_IFDIR: u16 = 0o040000;
/// Mode bits of a regular file.
pub const S_IFREG: u16 = 0o100000;
/// File type mask.
pub const S_IFMT: u16 = 0o170000;

/// `first_direct_byte` value for objects without a direct tail.
pub const NO_DIRECT_BYTES: u32 = u32::MAX;

/// Decoded item header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ItemHead {
    /// Item key.
    pub key: Key,
    /// Entry count (directory) or unused tail bytes (indirect).
    pub free_or_count: u16,
    /// Body length in bytes.
    pub len: u16,
    /// Body offset inside the block.
    pub location: u16,
}

impl ItemHead {
    /// Decodes a header from `src[..IH_SIZE]`.
    pub fn decode(src: &[u8]) -> ItemHead {
        ItemHead {
            key: Key::decode(src),
            free_or_count: get_u16(src, KEY_SIZE),
            len: get_u16(src, KEY_SIZE + 2),
            location: get_u16(src, KEY_SIZE + 4),
        }
    }

    /// Encodes the header into `dst[..IH_SIZE]`.
    pub fn encode(&self, dst: &mut [u8]) {
        self.key.encode(dst);
        put_u16(dst, KEY_SIZE, self.free_or_count);
        put_u16(dst, KEY_SIZE + 2, self.len);
        put_u16(dst, KEY_SIZE + 4, self.location);
        put_u16(dst, KEY_SIZE + 6, 0);
    }
}

/// Number of file bytes an item covers.
pub fn item_logical_length(head: &ItemHead, block_size: usize) -> u64 {
    match head.key.item_type() {
        Some(ItemType::Direct) => u64::from(head.len),
        Some(ItemType::Indirect) => {
            let ptrs = u64::from(head.len) / 4;
            (ptrs * block_size as u64).saturating_sub(u64::from(head.free_or_count))
        }
        _ => 0,
    }
}

/// Whether `right` can be appended to `left` to form a single item.
pub fn are_mergeable(left: &ItemHead, right: &ItemHead, block_size: usize) -> bool {
    if comp_short_keys(&left.key, &right.key) != Ordering::Equal {
        return false;
    }
    match (left.key.item_type(), right.key.item_type()) {
        (Some(ItemType::Directory), Some(ItemType::Directory)) => true,
        (Some(ItemType::Direct), Some(ItemType::Direct)) => {
            u64::from(left.key.offset) + item_logical_length(left, block_size)
                == u64::from(right.key.offset)
        }
        (Some(ItemType::Indirect), Some(ItemType::Indirect)) => {
            left.free_or_count == 0
                && u64::from(left.key.offset) + item_logical_length(left, block_size)
                    == u64::from(right.key.offset)
        }
        _ => false,
    }
}

/// Object metadata.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct StatData {
    /// Type and permission bits.
    pub mode: u16,
    /// Attribute flags.
    pub attrs: u16,
    /// Link count.
    pub nlink: u32,
    /// Size in bytes.
    pub size: u64,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Access time, seconds.
    pub atime: u32,
    /// Modification time, seconds.
    pub mtime: u32,
    /// Change time, seconds.
    pub ctime: u32,
    /// Allocated 512-byte sectors.
    pub blocks: u32,
    /// 1-based offset of the first byte stored in a direct item.
    pub first_direct_byte: u32,
}

impl StatData {
    /// True for directories.
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    fn decode(src: &[u8]) -> StatData {
        StatData {
            mode: get_u16(src, 0),
            attrs: get_u16(src, 2),
            nlink: get_u32(src, 4),
            size: get_u64(src, 8),
            uid: get_u32(src, 16),
            gid: get_u32(src, 20),
            atime: get_u32(src, 24),
            mtime: get_u32(src, 28),
            ctime: get_u32(src, 32),
            blocks: get_u32(src, 36),
            first_direct_byte: get_u32(src, 40),
        }
    }

    fn encode(&self, dst: &mut [u8]) {
        put_u16(dst, 0, self.mode);
        put_u16(dst, 2, self.attrs);
        put_u32(dst, 4, self.nlink);
        put_u64(dst, 8, self.size);
        put_u32(dst, 16, self.uid);
        put_u32(dst, 20, self.gid);
        put_u32(dst, 24, self.atime);
        put_u32(dst, 28, self.mtime);
        put_u32(dst, 32, self.ctime);
        put_u32(dst, 36, self.blocks);
        put_u32(dst, 40, self.first_direct_byte);
    }
}

/// One directory entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    /// Hash of the name with the generation in the low bits.
    pub offset: u32,
    /// Referenced object's dir_id.
    pub dir_id: u32,
    /// Referenced object's object_id.
    pub object_id: u32,
    /// State bits.
    pub state: u16,
    /// Entry name.
    pub name: Vec<u8>,
}

impl DirEntry {
    /// A live entry.
    pub fn new(offset: u32, dir_id: u32, object_id: u32, name: &[u8]) -> DirEntry {
        DirEntry {
            offset,
            dir_id,
            object_id,
            state: DEH_VISIBLE,
            name: name.to_vec(),
        }
    }

    /// Whether the entry is live.
    pub fn is_visible(&self) -> bool {
        self.state & DEH_VISIBLE != 0
    }

    /// Bytes the entry occupies inside a directory item.
    pub fn size(&self) -> usize {
        DEH_SIZE + self.name.len()
    }
}

/// Typed item body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ItemBody {
    /// Object metadata.
    StatData(StatData),
    /// Inline file bytes.
    Direct(Vec<u8>),
    /// Unformatted block numbers; 0 is a hole.
    Indirect(Vec<u32>),
    /// Directory entries sorted by offset.
    Directory(Vec<DirEntry>),
}

impl ItemBody {
    /// Number of splittable units.
    pub fn unit_count(&self) -> usize {
        match self {
            ItemBody::StatData(_) => 1,
            ItemBody::Direct(bytes) => bytes.len(),
            ItemBody::Indirect(ptrs) => ptrs.len(),
            ItemBody::Directory(entries) => entries.len(),
        }
    }

    /// Encoded size of units `[from, to)`.
    pub fn units_size(&self, from: usize, to: usize) -> usize {
        match self {
            ItemBody::StatData(_) => SD_SIZE,
            ItemBody::Direct(_) => to - from,
            ItemBody::Indirect(_) => (to - from) * 4,
            ItemBody::Directory(entries) => entries[from..to].iter().map(DirEntry::size).sum(),
        }
    }

    fn len(&self) -> usize {
        self.units_size(0, self.unit_count())
    }
}

/// A decoded item.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Item {
    /// Item key; its type matches the body variant.
    pub key: Key,
    /// Unused tail bytes of the last pointed block (indirect items only).
    pub free_space: u16,
    /// Item payload.
    pub body: ItemBody,
}

impl Item {
    /// Stat-data item.
    pub fn stat_data(key: Key, sd: StatData) -> Item {
        Item {
            key,
            free_space: 0,
            body: ItemBody::StatData(sd),
        }
    }

    /// Direct item holding `bytes`.
    pub fn direct(key: Key, bytes: Vec<u8>) -> Item {
        Item {
            key,
            free_space: 0,
            body: ItemBody::Direct(bytes),
        }
    }

    /// Indirect item with `free_space` unused bytes in its last block.
    pub fn indirect(key: Key, pointers: Vec<u32>, free_space: u16) -> Item {
        Item {
            key,
            free_space,
            body: ItemBody::Indirect(pointers),
        }
    }

    /// Directory item; the key offset follows the first entry.
    pub fn directory(key: Key, entries: Vec<DirEntry>) -> Item {
        let mut item = Item {
            key,
            free_space: 0,
            body: ItemBody::Directory(entries),
        };
        item.fix_key_offset(0);
        item
    }

    /// Type derived from the body variant.
    pub fn item_type(&self) -> ItemType {
        match self.body {
            ItemBody::StatData(_) => ItemType::StatData,
            ItemBody::Direct(_) => ItemType::Direct,
            ItemBody::Indirect(_) => ItemType::Indirect,
            ItemBody::Directory(_) => ItemType::Directory,
        }
    }

    /// Body length in bytes.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Header plus body.
    pub fn size(&self) -> usize {
        IH_SIZE + self.body_len()
    }

    /// Number of units.
    pub fn unit_count(&self) -> usize {
        self.body.unit_count()
    }

    /// Whether the balancer may cut this item between units.
    pub fn is_splittable(&self) -> bool {
        !matches!(self.body, ItemBody::StatData(_)) && self.unit_count() > 1
    }

    /// Header describing this item at `location`.
    pub fn head(&self, location: u16) -> ItemHead {
        let free_or_count = match &self.body {
            ItemBody::Directory(entries) => entries.len() as u16,
            ItemBody::Indirect(_) => self.free_space,
            _ => 0,
        };
        ItemHead {
            key: self.key,
            free_or_count,
            len: self.body_len() as u16,
            location,
        }
    }

    /// File bytes covered by the item.
    pub fn logical_length(&self, block_size: usize) -> u64 {
        item_logical_length(&self.head(0), block_size)
    }

    /// Whether `next` may be merged onto the end of this item.
    pub fn mergeable_with(&self, next: &Item, block_size: usize) -> bool {
        are_mergeable(&self.head(0), &next.head(0), block_size)
    }

    /// Copy of units `[from, to)` as a standalone item with its key fixed.
    pub fn slice(&self, from: usize, to: usize, block_size: usize) -> Item {
        debug_assert!(from < to && to <= self.unit_count());
        let count = self.unit_count();
        match &self.body {
            ItemBody::StatData(_) => self.clone(),
            ItemBody::Direct(bytes) => Item::direct(
                self.key.with_offset(self.key.offset + from as u32),
                bytes[from..to].to_vec(),
            ),
            ItemBody::Indirect(ptrs) => Item::indirect(
                self.key
                    .with_offset(self.key.offset + (from * block_size) as u32),
                ptrs[from..to].to_vec(),
                if to == count { self.free_space } else { 0 },
            ),
            ItemBody::Directory(entries) => Item::directory(self.key, entries[from..to].to_vec()),
        }
    }

    /// Appends a mergeable `next` onto this item.
    pub fn merge(&mut self, next: Item) {
        match (&mut self.body, next.body) {
            (ItemBody::Direct(a), ItemBody::Direct(b)) => a.extend_from_slice(&b),
            (ItemBody::Indirect(a), ItemBody::Indirect(b)) => {
                a.extend_from_slice(&b);
                self.free_space = next.free_space;
            }
            (ItemBody::Directory(a), ItemBody::Directory(b)) => a.extend(b),
            _ => debug_assert!(false, "merging items of different types"),
        }
    }

    /// Inserts the units of `fragment` before unit `pos`.
    ///
    /// Pasting at the front of a file item moves its key offset back by the
    /// pasted length.
    pub fn insert_units(&mut self, pos: usize, fragment: ItemBody, block_size: usize) -> Result<()> {
        let added = fragment.unit_count();
        let front_offset = if pos == 0 && !matches!(self.body, ItemBody::Directory(_)) {
            let back = (added * self.unit_stride(block_size)) as u32;
            Some(
                self.key
                    .offset
                    .checked_sub(back)
                    .ok_or(FsError::Invalid("paste before offset zero"))?,
            )
        } else {
            None
        };
        match (&mut self.body, fragment) {
            (ItemBody::Direct(a), ItemBody::Direct(b)) if pos <= a.len() => {
                a.splice(pos..pos, b);
            }
            (ItemBody::Indirect(a), ItemBody::Indirect(b)) if pos <= a.len() => {
                a.splice(pos..pos, b);
            }
            (ItemBody::Directory(a), ItemBody::Directory(b)) if pos <= a.len() => {
                a.splice(pos..pos, b);
            }
            _ => return Err(FsError::Invalid("paste does not match item type")),
        }
        match front_offset {
            Some(offset) => self.key.offset = offset,
            None if pos == 0 => self.fix_key_offset(0),
            None => {}
        }
        Ok(())
    }

    /// Removes units `[pos, pos + count)`, keeping the key on the first
    /// remaining unit.
    pub fn remove_units(&mut self, pos: usize, count: usize, block_size: usize) -> Result<()> {
        let end = pos
            .checked_add(count)
            .filter(|end| *end <= self.unit_count() && count > 0)
            .ok_or(FsError::Invalid("cut range outside item"))?;
        match &mut self.body {
            ItemBody::Direct(a) => {
                a.drain(pos..end);
            }
            ItemBody::Indirect(a) => {
                a.drain(pos..end);
            }
            ItemBody::Directory(a) => {
                a.drain(pos..end);
            }
            ItemBody::StatData(_) => return Err(FsError::Invalid("stat data cannot be cut")),
        }
        if pos == 0 {
            self.fix_key_offset(count * self.unit_stride(block_size));
        }
        Ok(())
    }

    fn unit_stride(&self, block_size: usize) -> usize {
        match self.body {
            ItemBody::Direct(_) => 1,
            ItemBody::Indirect(_) => block_size,
            _ => 0,
        }
    }

    fn fix_key_offset(&mut self, advanced_by: usize) {
        match &self.body {
            ItemBody::Directory(entries) => {
                if let Some(first) = entries.first() {
                    self.key.offset = first.offset;
                }
            }
            ItemBody::Direct(_) | ItemBody::Indirect(_) => {
                self.key.offset = self.key.offset.wrapping_add(advanced_by as u32);
            }
            ItemBody::StatData(_) => {}
        }
    }

    /// Encodes the body into `dst[..body_len]`.
    pub fn encode_body(&self, dst: &mut [u8]) {
        match &self.body {
            ItemBody::StatData(sd) => sd.encode(dst),
            ItemBody::Direct(bytes) => dst[..bytes.len()].copy_from_slice(bytes),
            ItemBody::Indirect(ptrs) => {
                for (i, ptr) in ptrs.iter().enumerate() {
                    put_u32(dst, i * 4, *ptr);
                }
            }
            ItemBody::Directory(entries) => {
                let mut name_end = self.body_len();
                for (i, entry) in entries.iter().enumerate() {
                    let loc = name_end - entry.name.len();
                    let deh = &mut dst[i * DEH_SIZE..(i + 1) * DEH_SIZE];
                    put_u32(deh, 0, entry.offset);
                    put_u32(deh, 4, entry.dir_id);
                    put_u32(deh, 8, entry.object_id);
                    put_u16(deh, 12, loc as u16);
                    put_u16(deh, 14, entry.state);
                    dst[loc..name_end].copy_from_slice(&entry.name);
                    name_end = loc;
                }
            }
        }
    }

    /// Decodes an item from its header and body bytes.
    pub fn decode(head: &ItemHead, body: &[u8]) -> Result<Item> {
        let ty = head
            .key
            .item_type()
            .ok_or(FsError::TreeInconsistent("item of unknown type"))?;
        let item = match ty {
            ItemType::StatData => {
                if body.len() != SD_SIZE {
                    return Err(FsError::TreeInconsistent("stat data of wrong length"));
                }
                Item::stat_data(head.key, StatData::decode(body))
            }
            ItemType::Direct => {
                if body.is_empty() {
                    return Err(FsError::TreeInconsistent("empty direct item"));
                }
                Item::direct(head.key, body.to_vec())
            }
            ItemType::Indirect => {
                if body.is_empty() || body.len() % 4 != 0 {
                    return Err(FsError::TreeInconsistent("indirect item of wrong length"));
                }
                let ptrs = body.chunks_exact(4).map(|c| get_u32(c, 0)).collect();
                Item::indirect(head.key, ptrs, head.free_or_count)
            }
            ItemType::Directory => Item {
                key: head.key,
                free_space: 0,
                body: ItemBody::Directory(decode_entries(body, head.free_or_count)?),
            },
        };
        if let ItemBody::Directory(entries) = &item.body {
            if entries.first().map(|e| e.offset) != Some(head.key.offset) {
                return Err(FsError::TreeInconsistent(
                    "directory key differs from first entry",
                ));
            }
        }
        Ok(item)
    }
}

fn decode_entries(body: &[u8], count: u16) -> Result<Vec<DirEntry>> {
    let count = usize::from(count);
    if count == 0 || count * DEH_SIZE > body.len() {
        return Err(FsError::TreeInconsistent("bad directory entry count"));
    }
    let mut entries = Vec::with_capacity(count);
    let mut name_end = body.len();
    let mut prev_offset = None;
    for i in 0..count {
        let deh = &body[i * DEH_SIZE..(i + 1) * DEH_SIZE];
        let loc = usize::from(get_u16(deh, 12));
        if loc < count * DEH_SIZE || loc > name_end {
            return Err(FsError::TreeInconsistent("bad directory name location"));
        }
        let offset = get_u32(deh, 0);
        if prev_offset.map_or(false, |prev| prev >= offset) {
            return Err(FsError::TreeInconsistent("directory entries out of order"));
        }
        prev_offset = Some(offset);
        entries.push(DirEntry {
            offset,
            dir_id: get_u32(deh, 4),
            object_id: get_u32(deh, 8),
            state: get_u16(deh, 14),
            name: body[loc..name_end].to_vec(),
        });
        name_end = loc;
    }
    if name_end != count * DEH_SIZE {
        return Err(FsError::TreeInconsistent("directory names do not fill item"));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: usize = 4096;

    fn roundtrip(item: &Item) -> Item {
        let mut body = vec![0u8; item.body_len()];
        item.encode_body(&mut body);
        Item::decode(&item.head(0), &body).unwrap()
    }

    #[test]
    fn bodies_decode_to_the_same_item() {
        let sd = Item::stat_data(
            Key::stat_data(1, 2),
            StatData {
                mode: S_IFDIR | 0o755,
                nlink: 2,
                size: 48,
                first_direct_byte: NO_DIRECT_BYTES,
                ..StatData::default()
            },
        );
        assert_eq!(roundtrip(&sd), sd);
        let dir = Item::directory(
            Key::directory(1, 2, 0),
            vec![
                DirEntry::new(1, 1, 2, b"."),
                DirEntry::new(2, 0, 1, b".."),
                DirEntry::new(0x1000, 2, 7, b"hello"),
            ],
        );
        assert_eq!(dir.key.offset, 1);
        assert_eq!(dir.body_len(), 3 * DEH_SIZE + 8);
        assert_eq!(roundtrip(&dir), dir);
        let ind = Item::indirect(Key::indirect(2, 7, 1), vec![100, 0, 102], 96);
        assert_eq!(roundtrip(&ind), ind);
    }

    #[test]
    fn logical_length_accounts_for_partial_tail() {
        let ind = Item::indirect(Key::indirect(2, 7, 1), vec![100, 101], 1000);
        assert_eq!(ind.logical_length(BS), 2 * 4096 - 1000);
        let direct = Item::direct(Key::direct(2, 7, 1), b"abc".to_vec());
        assert_eq!(direct.logical_length(BS), 3);
        let sd = Item::stat_data(Key::stat_data(2, 7), StatData::default());
        assert_eq!(sd.logical_length(BS), 0);
    }

    #[test]
    fn mergeability_rules() {
        let a = Item::direct(Key::direct(2, 7, 1), vec![1; 10]);
        let b = Item::direct(Key::direct(2, 7, 11), vec![2; 5]);
        let gap = Item::direct(Key::direct(2, 7, 12), vec![2; 5]);
        assert!(a.mergeable_with(&b, BS));
        assert!(!a.mergeable_with(&gap, BS));
        let other = Item::direct(Key::direct(2, 8, 11), vec![2; 5]);
        assert!(!a.mergeable_with(&other, BS));

        let i1 = Item::indirect(Key::indirect(2, 7, 1), vec![10, 11], 0);
        let i2 = Item::indirect(Key::indirect(2, 7, 1 + 2 * 4096), vec![12], 0);
        assert!(i1.mergeable_with(&i2, BS));
        let partial = Item::indirect(Key::indirect(2, 7, 1), vec![10, 11], 5);
        assert!(!partial.mergeable_with(&i2, BS));

        let d1 = Item::directory(Key::directory(1, 2, 0), vec![DirEntry::new(1, 1, 2, b".")]);
        let d2 = Item::directory(Key::directory(1, 2, 0), vec![DirEntry::new(900, 2, 9, b"x")]);
        assert!(d1.mergeable_with(&d2, BS));
        let sd = Item::stat_data(Key::stat_data(1, 2), StatData::default());
        assert!(!sd.mergeable_with(&sd, BS));
    }

    #[test]
    fn slice_and_merge_restore_item() {
        let ind = Item::indirect(Key::indirect(2, 7, 1), vec![10, 11, 12, 13], 7);
        let left = ind.slice(0, 1, BS);
        let right = ind.slice(1, 4, BS);
        assert_eq!(right.key.offset, 1 + 4096);
        assert_eq!(left.free_space, 0);
        assert_eq!(right.free_space, 7);
        let mut merged = left;
        assert!(merged.mergeable_with(&right, BS));
        merged.merge(right);
        assert_eq!(merged, ind);

        let dir = Item::directory(
            Key::directory(1, 2, 0),
            vec![DirEntry::new(1, 1, 2, b"."), DirEntry::new(2, 0, 1, b"..")],
        );
        assert_eq!(dir.slice(1, 2, BS).key.offset, 2);
    }

    #[test]
    fn cut_from_front_advances_key() {
        let mut direct = Item::direct(Key::direct(2, 7, 1), b"abcdef".to_vec());
        direct.remove_units(0, 2, BS).unwrap();
        assert_eq!(direct.key.offset, 3);
        assert_eq!(direct.body, ItemBody::Direct(b"cdef".to_vec()));
        direct.remove_units(2, 2, BS).unwrap();
        assert_eq!(direct.body, ItemBody::Direct(b"cd".to_vec()));
        assert!(direct.remove_units(1, 5, BS).is_err());

        let mut dir = Item::directory(
            Key::directory(1, 2, 0),
            vec![DirEntry::new(1, 1, 2, b"."), DirEntry::new(300, 2, 5, b"a")],
        );
        dir.insert_units(0, ItemBody::Directory(vec![DirEntry::new(0, 0, 0, b"z")]), BS)
            .unwrap();
        assert_eq!(dir.key.offset, 0);
        dir.remove_units(0, 1, BS).unwrap();
        assert_eq!(dir.key.offset, 1);
    }

    #[test]
    fn unknown_types_and_bad_bodies_are_rejected() {
        let head = ItemHead {
            key: Key::new(1, 2, 0, 42),
            free_or_count: 0,
            len: 4,
            location: 0,
        };
        assert!(matches!(
            Item::decode(&head, &[0; 4]),
            Err(FsError::TreeInconsistent(_))
        ));
        let sd_head = ItemHead {
            key: Key::stat_data(1, 2),
            ..head
        };
        assert!(Item::decode(&sd_head, &[0; 4]).is_err());
    }
}
