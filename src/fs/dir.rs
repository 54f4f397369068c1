//! Directories.
//!
//! Entries live in directory items keyed by the directory's own ids and
//! sorted by entry offset (name hash plus generation). A lookup scans the
//! 128 offsets sharing the name's hash for an exact name.

use serde::{Serialize, Serializer};

use crate::storage::item::{DirEntry, Item, ItemBody, StatData, NO_DIRECT_BYTES, S_IFDIR, S_IFREG};
use crate::storage::key::{Key, DOT_DOT_OFFSET, DOT_OFFSET};
use crate::types::{FsError, Result};

use super::hash::{base_offset, check_name, GENERATIONS};
use super::{now, Filesystem, FsTxn, ObjectRef};

/// One `readdir` row.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DirListing {
    /// Entry name.
    #[serde(serialize_with = "lossy")]
    pub name: Vec<u8>,
    /// Object the entry points at.
    pub object: ObjectRef,
    /// Entry offset (hash and generation).
    pub offset: u32,
}

impl DirListing {
    /// The name as text, with invalid UTF-8 replaced.
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

fn lossy<S: Serializer>(name: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(name))
}

fn dir_items_end(dir: ObjectRef) -> Key {
    Key::new(dir.dir_id, dir.object_id, u32::MAX, u32::MAX)
}

fn dot_entries(own: ObjectRef, parent: ObjectRef) -> Vec<DirEntry> {
    vec![
        DirEntry::new(DOT_OFFSET, own.dir_id, own.object_id, b"."),
        DirEntry::new(DOT_DOT_OFFSET, parent.dir_id, parent.object_id, b".."),
    ]
}

fn new_stat_data(is_dir: bool, time: u32) -> StatData {
    let base = StatData {
        atime: time,
        mtime: time,
        ctime: time,
        ..StatData::default()
    };
    if is_dir {
        let size = dot_entries(ObjectRef::ROOT, ObjectRef::ROOT)
            .iter()
            .map(DirEntry::size)
            .sum::<usize>() as u64;
        StatData {
            mode: S_IFDIR | 0o755,
            nlink: 2,
            size,
            first_direct_byte: NO_DIRECT_BYTES,
            ..base
        }
    } else {
        StatData {
            mode: S_IFREG | 0o644,
            nlink: 1,
            first_direct_byte: 1,
            ..base
        }
    }
}

impl Filesystem {
    /// The object `name` in directory `dir`.
    pub fn lookup(&self, dir: ObjectRef, name: &[u8]) -> Result<ObjectRef> {
        self.directory(dir)?;
        let entry = self.find_entry(dir, name)?.ok_or(FsError::NotFound)?;
        Ok(ObjectRef {
            dir_id: entry.dir_id,
            object_id: entry.object_id,
        })
    }

    /// Walks a `/`-separated path from the root directory.
    pub fn resolve(&self, path: &str) -> Result<ObjectRef> {
        let mut current = ObjectRef::ROOT;
        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            current = if part == ".." {
                self.parent_of(current)?
            } else {
                self.lookup(current, part.as_bytes())?
            };
        }
        Ok(current)
    }

    /// Creates an empty regular file.
    pub fn create(&self, dir: ObjectRef, name: &[u8]) -> Result<ObjectRef> {
        self.mutating(|| self.create_locked(dir, name, false))
    }

    /// Creates an empty directory.
    pub fn mkdir(&self, dir: ObjectRef, name: &[u8]) -> Result<ObjectRef> {
        self.mutating(|| self.create_locked(dir, name, true))
    }

    /// Removes a file's entry; the file goes away with its last link.
    pub fn unlink(&self, dir: ObjectRef, name: &[u8]) -> Result<()> {
        self.mutating(|| self.unlink_locked(dir, name))
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, dir: ObjectRef, name: &[u8]) -> Result<()> {
        self.mutating(|| self.rmdir_locked(dir, name))
    }

    /// Entries of `dir` in offset order, without "." and "..".
    pub fn readdir(&self, dir: ObjectRef) -> Result<Vec<DirListing>> {
        self.directory(dir)?;
        let mut out = Vec::new();
        for item in self.tree.scan(&Key::directory(dir.dir_id, dir.object_id, 0), &dir_items_end(dir))? {
            let ItemBody::Directory(entries) = item.body else {
                continue;
            };
            out.extend(
                entries
                    .into_iter()
                    .filter(|e| e.is_visible() && e.offset != DOT_OFFSET && e.offset != DOT_DOT_OFFSET)
                    .map(|e| DirListing {
                        object: ObjectRef {
                            dir_id: e.dir_id,
                            object_id: e.object_id,
                        },
                        offset: e.offset,
                        name: e.name,
                    }),
            );
        }
        Ok(out)
    }

    fn directory(&self, dir: ObjectRef) -> Result<StatData> {
        let sd = self.stat(dir)?;
        if !sd.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(sd)
    }

    fn parent_of(&self, dir: ObjectRef) -> Result<ObjectRef> {
        if dir == ObjectRef::ROOT {
            return Ok(dir);
        }
        self.directory(dir)?;
        match self.tree.search_by_entry_key(dir.dir_id, dir.object_id, DOT_DOT_OFFSET)? {
            Some((item, Ok(index))) => match &item.body {
                ItemBody::Directory(entries) => Ok(ObjectRef {
                    dir_id: entries[index].dir_id,
                    object_id: entries[index].object_id,
                }),
                _ => Err(FsError::TreeInconsistent("directory key holds another item type")),
            },
            _ => Err(FsError::TreeInconsistent("directory without a \"..\" entry")),
        }
    }

    /// Visible entries with offsets in `[lo, hi)`.
    fn entries_between(&self, dir: ObjectRef, lo: u32, hi: u32) -> Result<Vec<DirEntry>> {
        let (first, _) = self
            .tree
            .search_by_entry_key(dir.dir_id, dir.object_id, lo)?
            .ok_or(FsError::TreeInconsistent("directory has no items"))?;
        let end = Key::directory(dir.dir_id, dir.object_id, hi);
        let mut out = Vec::new();
        for item in self.tree.scan(&first.key, &end)? {
            if let ItemBody::Directory(entries) = item.body {
                out.extend(
                    entries
                        .into_iter()
                        .filter(|e| e.is_visible() && e.offset >= lo && e.offset < hi),
                );
            }
        }
        Ok(out)
    }

    fn find_entry(&self, dir: ObjectRef, name: &[u8]) -> Result<Option<DirEntry>> {
        let base = base_offset(name);
        Ok(self
            .entries_between(dir, base, base + GENERATIONS)?
            .into_iter()
            .find(|e| e.name == name))
    }

    /// First unused generation for `name`'s hash.
    fn free_offset(&self, dir: ObjectRef, name: &[u8]) -> Result<u32> {
        let base = base_offset(name);
        let used = self.entries_between(dir, base, base + GENERATIONS)?;
        (base..base + GENERATIONS)
            .find(|offset| used.iter().all(|e| e.offset != *offset))
            .ok_or(FsError::Invalid("too many names share this hash"))
    }

    fn paste_entry(&self, txn: &mut FsTxn<'_>, dir: ObjectRef, entry: DirEntry) -> Result<()> {
        match self.tree.search_by_entry_key(dir.dir_id, dir.object_id, entry.offset)? {
            Some((item, Err(pos))) => {
                self.tree
                    .paste_into_item(txn, &item.key, pos, ItemBody::Directory(vec![entry]), None)
            }
            Some((_, Ok(_))) => Err(FsError::AlreadyExists),
            None => Err(FsError::TreeInconsistent("directory has no items")),
        }
    }

    fn remove_entry(&self, txn: &mut FsTxn<'_>, dir: ObjectRef, offset: u32) -> Result<DirEntry> {
        match self.tree.search_by_entry_key(dir.dir_id, dir.object_id, offset)? {
            Some((item, Ok(index))) => {
                let ItemBody::Directory(entries) = &item.body else {
                    return Err(FsError::TreeInconsistent("directory key holds another item type"));
                };
                let entry = entries[index].clone();
                self.tree.cut_from_item(txn, &item.key, index, 1, None)?;
                Ok(entry)
            }
            _ => Err(FsError::NotFound),
        }
    }

    fn create_locked(&self, dir: ObjectRef, name: &[u8], is_dir: bool) -> Result<ObjectRef> {
        check_name(name)?;
        self.directory(dir)?;
        if self.find_entry(dir, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let offset = self.free_offset(dir, name)?;
        let child = self.with_txn(4, 0, |txn| {
            let child = ObjectRef {
                dir_id: dir.object_id,
                object_id: txn.next_object_id()?,
            };
            let entry = DirEntry::new(offset, child.dir_id, child.object_id, name);
            self.link_new(txn, dir, child, entry, is_dir)?;
            Ok(child)
        })?;
        tracing::debug!(parent = dir.object_id, object = child.object_id, is_dir, "fs.create");
        Ok(child)
    }

    fn link_new(
        &self,
        txn: &mut FsTxn<'_>,
        dir: ObjectRef,
        child: ObjectRef,
        entry: DirEntry,
        is_dir: bool,
    ) -> Result<()> {
        let entry_size = entry.size() as u64;
        let time = now();
        self.paste_entry(txn, dir, entry)?;
        self.tree
            .insert_item(txn, Item::stat_data(child.stat_key(), new_stat_data(is_dir, time)))?;
        if is_dir {
            let key = Key::directory(child.dir_id, child.object_id, DOT_OFFSET);
            self.tree
                .insert_item(txn, Item::directory(key, dot_entries(child, dir)))?;
        }
        self.update_sd(txn, dir, |sd| {
            sd.size += entry_size;
            if is_dir {
                sd.nlink += 1;
            }
            sd.mtime = time;
            sd.ctime = time;
        })
    }

    fn unlink_locked(&self, dir: ObjectRef, name: &[u8]) -> Result<()> {
        self.directory(dir)?;
        let entry = self.find_entry(dir, name)?.ok_or(FsError::NotFound)?;
        let target = ObjectRef {
            dir_id: entry.dir_id,
            object_id: entry.object_id,
        };
        let sd = self.stat(target)?;
        if sd.is_dir() {
            return Err(FsError::Invalid("unlink of a directory; use rmdir"));
        }
        let time = now();
        self.with_txn(3, 0, |txn| {
            let removed = self.remove_entry(txn, dir, entry.offset)?;
            self.update_sd(txn, dir, |sd| {
                sd.size = sd.size.saturating_sub(removed.size() as u64);
                sd.mtime = time;
                sd.ctime = time;
            })?;
            self.update_sd(txn, target, |sd| {
                sd.nlink = sd.nlink.saturating_sub(1);
                sd.ctime = time;
            })
        })?;
        if sd.nlink <= 1 {
            self.truncate_locked(target, 0)?;
            self.with_txn(1, 0, |txn| self.tree.delete_item(txn, &target.stat_key()).map(|_| ()))?;
        }
        tracing::debug!(parent = dir.object_id, object = target.object_id, "fs.unlink");
        Ok(())
    }

    fn rmdir_locked(&self, dir: ObjectRef, name: &[u8]) -> Result<()> {
        self.directory(dir)?;
        let entry = self.find_entry(dir, name)?.ok_or(FsError::NotFound)?;
        let target = ObjectRef {
            dir_id: entry.dir_id,
            object_id: entry.object_id,
        };
        self.directory(target)?;
        let items = self
            .tree
            .scan(&Key::directory(target.dir_id, target.object_id, 0), &dir_items_end(target))?;
        let live = items
            .iter()
            .filter_map(|item| match &item.body {
                ItemBody::Directory(entries) => Some(entries),
                _ => None,
            })
            .flatten()
            .filter(|e| e.is_visible() && e.offset != DOT_OFFSET && e.offset != DOT_DOT_OFFSET)
            .count();
        if live > 0 {
            return Err(FsError::DirectoryNotEmpty);
        }
        let time = now();
        let start = Key::directory(target.dir_id, target.object_id, 0);
        self.with_txn(items.len() as u32 + 3, 0, |txn| {
            let removed = self.remove_entry(txn, dir, entry.offset)?;
            // Directory items of one directory merge freely, so their keys
            // are looked up again after every delete.
            while let Some(item) = self.tree.scan(&start, &dir_items_end(target))?.into_iter().next() {
                self.tree.delete_item(txn, &item.key)?;
            }
            self.tree.delete_item(txn, &target.stat_key())?;
            self.update_sd(txn, dir, |sd| {
                sd.size = sd.size.saturating_sub(removed.size() as u64);
                sd.nlink = sd.nlink.saturating_sub(1);
                sd.mtime = time;
                sd.ctime = time;
            })
        })?;
        tracing::debug!(parent = dir.object_id, object = target.object_id, "fs.rmdir");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_directories_count_their_dot_entries() {
        let sd = new_stat_data(true, 7);
        assert!(sd.is_dir());
        assert_eq!(sd.nlink, 2);
        assert_eq!(sd.size, (2 * crate::storage::item::DEH_SIZE + 3) as u64);
        let file = new_stat_data(false, 7);
        assert!(!file.is_dir());
        assert_eq!(file.first_direct_byte, 1);
        assert_eq!(file.size, 0);
    }

    #[test]
    fn listings_serialize_names_as_text() {
        let row = DirListing {
            name: b"notes.txt".to_vec(),
            object: ObjectRef {
                dir_id: 2,
                object_id: 9,
            },
            offset: 128,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["name"], "notes.txt");
        assert_eq!(json["object"]["object_id"], 9);
    }
}
