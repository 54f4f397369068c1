//! File bodies.
//!
//! A file starts in tail mode: its bytes live in direct items. Once it grows
//! past the tail limit the bytes move to data blocks referenced by indirect
//! items, where a zero pointer is a hole. Large writes are split into
//! several handles; a call that fails partway is undone as a whole.

use crate::storage::item::{Item, ItemBody, StatData, NO_DIRECT_BYTES};
use crate::storage::key::Key;
use crate::storage::tree::TreeTxn;
use crate::types::{BlockNo, FsError, Result};

use super::{now, Filesystem, FsTxn, ObjectRef};

enum Fill<'d> {
    Bytes(&'d [u8]),
    Zeros(u64),
}

impl Fill<'_> {
    fn len(&self) -> u64 {
        match self {
            Fill::Bytes(data) => data.len() as u64,
            Fill::Zeros(n) => *n,
        }
    }
}

fn is_tail(sd: &StatData) -> bool {
    sd.first_direct_byte != NO_DIRECT_BYTES
}

fn body_start(obj: ObjectRef) -> Key {
    Key::new(obj.dir_id, obj.object_id, 1, 0)
}

fn body_end(obj: ObjectRef) -> Key {
    Key::new(obj.dir_id, obj.object_id, u32::MAX, u32::MAX)
}

impl Filesystem {
    /// Appends `data`, returning the new size.
    pub fn append(&self, obj: ObjectRef, data: &[u8]) -> Result<u64> {
        self.mutating(|| self.append_locked(obj, data))
    }

    /// Replaces the whole body with `data`. On failure the old body is
    /// left as it was.
    pub fn write_all(&self, obj: ObjectRef, data: &[u8]) -> Result<()> {
        self.mutating(|| {
            self.truncate_locked(obj, 0)?;
            self.append_locked(obj, data).map(|_| ())
        })
    }

    /// Sets the size to `size`, freeing blocks past it or extending with
    /// zeros (holes once the file is in block mode).
    pub fn truncate(&self, obj: ObjectRef, size: u64) -> Result<()> {
        self.mutating(|| self.truncate_locked(obj, size))
    }

    /// The whole body.
    pub fn read(&self, obj: ObjectRef) -> Result<Vec<u8>> {
        self.read_at(obj, 0, usize::MAX)
    }

    /// Up to `len` bytes starting at byte `offset`; short at end of file.
    pub fn read_at(&self, obj: ObjectRef, offset: u64, len: usize) -> Result<Vec<u8>> {
        let sd = self.regular(obj)?;
        if offset >= sd.size || len == 0 {
            return Ok(Vec::new());
        }
        let end = sd.size.min(offset.saturating_add(len as u64));
        let mut out = vec![0u8; (end - offset) as usize];
        let Some(hit) = self
            .tree
            .search_for_position(obj.dir_id, obj.object_id, (offset + 1) as u32)?
        else {
            return Ok(out);
        };
        let bs = self.block_size() as u64;
        for item in self.tree.scan(&hit.item.key, &body_end(obj))? {
            let item_start = u64::from(item.key.offset) - 1;
            if item_start >= end {
                break;
            }
            match &item.body {
                ItemBody::Direct(bytes) => {
                    copy_overlap(&mut out, offset, item_start, bytes);
                }
                ItemBody::Indirect(pointers) => {
                    for (i, &ptr) in pointers.iter().enumerate() {
                        let block_start = item_start + i as u64 * bs;
                        if block_start >= end {
                            break;
                        }
                        if ptr == 0 || block_start + bs <= offset {
                            continue;
                        }
                        let buf = self.cache.get(BlockNo(ptr))?;
                        copy_overlap(&mut out, offset, block_start, &buf.data());
                    }
                }
                _ => {}
            }
        }
        Ok(out)
    }

    pub(crate) fn block_size(&self) -> usize {
        self.cache.block_size()
    }

    fn max_file_size(&self) -> u64 {
        u64::from(u32::MAX) - self.block_size() as u64
    }

    fn sectors_per_block(&self) -> u32 {
        (self.block_size() / 512) as u32
    }

    /// Stat data of a regular file.
    fn regular(&self, obj: ObjectRef) -> Result<StatData> {
        let sd = self.stat(obj)?;
        if sd.is_dir() {
            return Err(FsError::Invalid("object is a directory"));
        }
        Ok(sd)
    }

    /// Runs `f` inside one journal handle, ending the handle either way.
    pub(crate) fn with_txn<T>(
        &self,
        tree_ops: u32,
        data_blocks: u32,
        f: impl FnOnce(&mut FsTxn<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut txn = self.begin(tree_ops, data_blocks)?;
        let result = f(&mut txn);
        let ended = txn.finish();
        let value = result?;
        ended?;
        Ok(value)
    }

    pub(crate) fn update_sd(&self, txn: &mut FsTxn<'_>, obj: ObjectRef, f: impl FnOnce(&mut StatData)) -> Result<()> {
        let mut outcome = Err(FsError::TreeInconsistent("stat data key holds another item type"));
        self.tree.update_item(txn, &obj.stat_key(), |item| {
            if let ItemBody::StatData(sd) = &mut item.body {
                f(sd);
                outcome = Ok(());
            }
        })?;
        outcome
    }

    /// Leaf block holding the object's stat data; allocation hint.
    fn near(&self, obj: ObjectRef) -> Result<BlockNo> {
        let (_, path) = self.tree.search_by_key(&obj.stat_key())?;
        Ok(path.leaf_element().block.block())
    }

    /// Data blocks one handle may fill.
    fn blocks_per_handle(&self) -> u64 {
        let height = u32::from(self.tree.root().height) + 1;
        let tree = 10 * height + 6;
        let cap = (self.block_size() / 8) as u32;
        u64::from(self.journal.hard_limit().saturating_sub(tree + 4).clamp(1, cap))
    }

    fn body_items(&self, obj: ObjectRef) -> Result<Vec<Item>> {
        self.tree.scan(&body_start(obj), &body_end(obj))
    }

    /// The item holding the last byte of the body.
    fn last_body_item(&self, obj: ObjectRef) -> Result<Option<Item>> {
        let size = self.regular(obj)?.size;
        if size == 0 {
            return Ok(None);
        }
        let hit = self
            .tree
            .search_for_position(obj.dir_id, obj.object_id, size as u32)?
            .ok_or(FsError::TreeInconsistent("file body shorter than its size"))?;
        Ok(Some(hit.item))
    }

    pub(crate) fn append_locked(&self, obj: ObjectRef, data: &[u8]) -> Result<u64> {
        let sd = self.regular(obj)?;
        let new_size = sd.size + data.len() as u64;
        if new_size > self.max_file_size() {
            return Err(FsError::Invalid("file too large"));
        }
        if data.is_empty() {
            return Ok(sd.size);
        }
        if is_tail(&sd) {
            if new_size <= self.tail_limit as u64 {
                self.append_direct(obj, sd.size, data)?;
                return Ok(new_size);
            }
            self.convert_to_blocks(obj)?;
        }
        self.extend_blocks(obj, Fill::Bytes(data))?;
        Ok(new_size)
    }

    pub(crate) fn truncate_locked(&self, obj: ObjectRef, size: u64) -> Result<()> {
        let sd = self.regular(obj)?;
        if size > self.max_file_size() {
            return Err(FsError::Invalid("file too large"));
        }
        if size == sd.size {
            return Ok(());
        }
        if size > sd.size {
            let grow = size - sd.size;
            if is_tail(&sd) {
                if size <= self.tail_limit as u64 {
                    return self.append_direct(obj, sd.size, &vec![0u8; grow as usize]);
                }
                self.convert_to_blocks(obj)?;
            }
            return self.extend_blocks(obj, Fill::Zeros(grow));
        }
        if is_tail(&sd) {
            self.shrink_direct(obj, size)
        } else {
            self.shrink_blocks(obj, size)
        }
    }

    fn append_direct(&self, obj: ObjectRef, mut size: u64, data: &[u8]) -> Result<()> {
        let chunk = (self.block_size() / 2).max(1);
        for piece in data.chunks(chunk) {
            self.with_txn(1, 0, |txn| {
                if size == 0 {
                    let key = Key::direct(obj.dir_id, obj.object_id, 1);
                    self.tree.insert_item(txn, Item::direct(key, piece.to_vec()))?;
                } else {
                    let hit = self
                        .tree
                        .search_for_position(obj.dir_id, obj.object_id, size as u32)?
                        .ok_or(FsError::TreeInconsistent("file body shorter than its size"))?;
                    if !matches!(hit.item.body, ItemBody::Direct(_)) {
                        return Err(FsError::TreeInconsistent("tail file holds block pointers"));
                    }
                    let end = hit.item.body_len();
                    self.tree
                        .paste_into_item(txn, &hit.item.key, end, ItemBody::Direct(piece.to_vec()), None)?;
                }
                let time = now();
                self.update_sd(txn, obj, |sd| {
                    sd.size += piece.len() as u64;
                    sd.mtime = time;
                    sd.ctime = time;
                })
            })?;
            size += piece.len() as u64;
        }
        Ok(())
    }

    /// Moves a tail file's bytes into data blocks.
    fn convert_to_blocks(&self, obj: ObjectRef) -> Result<()> {
        let items = self.body_items(obj)?;
        let mut bytes = Vec::new();
        for item in &items {
            match &item.body {
                ItemBody::Direct(data) => bytes.extend_from_slice(data),
                _ => return Err(FsError::TreeInconsistent("tail file holds block pointers")),
            }
        }
        let bs = self.block_size();
        let count = bytes.len().div_ceil(bs) as u32;
        let hint = self.near(obj)?;
        let spb = self.sectors_per_block();
        self.with_txn(items.len() as u32 + 1, count, |txn| {
            // Deleting one item may merge or split its neighbors, so the
            // first one is looked up again every round.
            while let Some(item) = self.body_items(obj)?.into_iter().next() {
                self.tree.delete_item(txn, &item.key)?;
            }
            if count > 0 {
                let blocks = txn.allocate_blocks(count, hint)?;
                for (block, chunk) in blocks.iter().zip(bytes.chunks(bs)) {
                    txn.write_data(*block, 0, chunk, true)?;
                }
                let free = (count as usize * bs - bytes.len()) as u16;
                let pointers = blocks.iter().map(|b| b.0).collect();
                let key = Key::indirect(obj.dir_id, obj.object_id, 1);
                self.tree.insert_item(txn, Item::indirect(key, pointers, free))?;
            }
            self.update_sd(txn, obj, |sd| {
                sd.first_direct_byte = NO_DIRECT_BYTES;
                sd.blocks += count * spb;
            })
        })?;
        tracing::debug!(object = obj.object_id, bytes = bytes.len(), blocks = count, "file.convert");
        Ok(())
    }

    /// Grows a block-mode file by `fill`.
    fn extend_blocks(&self, obj: ObjectRef, fill: Fill<'_>) -> Result<()> {
        let bs = self.block_size() as u64;
        let spb = self.sectors_per_block();
        let total = fill.len();
        let mut size = self.regular(obj)?.size;
        let mut done = 0u64;
        let hint = self.near(obj)?;

        if size % bs != 0 && total > 0 {
            let used = (size % bs) as usize;
            let take = (bs - size % bs).min(total);
            let hit = self
                .tree
                .search_for_position(obj.dir_id, obj.object_id, size as u32)?
                .ok_or(FsError::TreeInconsistent("file body shorter than its size"))?;
            let ItemBody::Indirect(pointers) = &hit.item.body else {
                return Err(FsError::TreeInconsistent("block file holds direct bytes"));
            };
            let old = pointers[hit.unit];
            self.with_txn(1, 2, |txn| {
                let mut ptr = old;
                let mut fresh = false;
                if ptr == 0 && matches!(fill, Fill::Bytes(_)) {
                    ptr = txn.allocate_blocks(1, hint)?[0].0;
                    fresh = true;
                }
                if ptr != 0 {
                    match &fill {
                        Fill::Bytes(data) => txn.write_data(BlockNo(ptr), used, &data[..take as usize], fresh)?,
                        Fill::Zeros(_) => txn.write_data(BlockNo(ptr), used, &vec![0u8; take as usize], fresh)?,
                    }
                }
                let unit = hit.unit;
                self.tree.update_item(txn, &hit.item.key, |item| {
                    if let ItemBody::Indirect(pointers) = &mut item.body {
                        pointers[unit] = ptr;
                    }
                    item.free_space -= take as u16;
                })?;
                let time = now();
                self.update_sd(txn, obj, |sd| {
                    sd.size += take;
                    sd.blocks += if fresh { spb } else { 0 };
                    sd.mtime = time;
                    sd.ctime = time;
                })
            })?;
            size += take;
            done += take;
        }

        let per_handle = self.blocks_per_handle();
        while done < total {
            let remaining = total - done;
            let count = remaining.div_ceil(bs).min(per_handle);
            let bytes_now = remaining.min(count * bs);
            let free = (count * bs - bytes_now) as u16;
            let start = done as usize;
            self.with_txn(1, count as u32, |txn| {
                let blocks = match &fill {
                    Fill::Bytes(data) => {
                        let blocks = txn.allocate_blocks(count as u32, hint)?;
                        let data = &data[start..start + bytes_now as usize];
                        for (block, chunk) in blocks.iter().zip(data.chunks(bs as usize)) {
                            txn.write_data(*block, 0, chunk, true)?;
                        }
                        blocks
                    }
                    Fill::Zeros(_) => Vec::new(),
                };
                let pointers: Vec<u32> = if blocks.is_empty() {
                    vec![0; count as usize]
                } else {
                    blocks.iter().map(|b| b.0).collect()
                };
                if size == 0 {
                    let key = Key::indirect(obj.dir_id, obj.object_id, 1);
                    self.tree.insert_item(txn, Item::indirect(key, pointers, free))?;
                } else {
                    let hit = self
                        .tree
                        .search_for_position(obj.dir_id, obj.object_id, size as u32)?
                        .ok_or(FsError::TreeInconsistent("file body shorter than its size"))?;
                    let end = hit.item.unit_count();
                    self.tree.paste_into_item(
                        txn,
                        &hit.item.key,
                        end,
                        ItemBody::Indirect(pointers),
                        Some(free),
                    )?;
                }
                let allocated = blocks.len() as u32;
                let time = now();
                self.update_sd(txn, obj, |sd| {
                    sd.size += bytes_now;
                    sd.blocks += allocated * spb;
                    sd.mtime = time;
                    sd.ctime = time;
                })
            })?;
            size += bytes_now;
            done += bytes_now;
        }
        Ok(())
    }

    fn shrink_direct(&self, obj: ObjectRef, size: u64) -> Result<()> {
        while let Some(item) = self.last_body_item(obj)? {
            let start = u64::from(item.key.offset);
            let len = item.body_len() as u64;
            if start > size {
                self.with_txn(1, 0, |txn| {
                    self.tree.delete_item(txn, &item.key)?;
                    self.update_sd(txn, obj, |sd| sd.size = start - 1)
                })?;
                continue;
            }
            let keep = size - (start - 1);
            if keep < len {
                self.with_txn(1, 0, |txn| {
                    self.tree
                        .cut_from_item(txn, &item.key, keep as usize, (len - keep) as usize, None)?;
                    self.update_sd(txn, obj, |sd| sd.size = size)
                })?;
            }
            break;
        }
        self.touch(obj)
    }

    fn shrink_blocks(&self, obj: ObjectRef, size: u64) -> Result<()> {
        let bs = self.block_size() as u64;
        let spb = self.sectors_per_block();
        let needed = size.div_ceil(bs);
        let tail_free = (needed * bs - size) as u16;
        while let Some(item) = self.last_body_item(obj)? {
            let ItemBody::Indirect(pointers) = &item.body else {
                return Err(FsError::TreeInconsistent("block file holds direct bytes"));
            };
            let first = (u64::from(item.key.offset) - 1) / bs;
            let n = pointers.len() as u64;
            let keep = needed.saturating_sub(first).min(n) as usize;
            self.with_txn(1, 1, |txn| {
                if keep == 0 {
                    self.tree.delete_item(txn, &item.key)?;
                } else if (keep as u64) < n {
                    self.tree
                        .cut_from_item(txn, &item.key, keep, n as usize - keep, Some(tail_free))?;
                } else if item.free_space != tail_free {
                    self.tree
                        .update_item(txn, &item.key, |it| it.free_space = tail_free)?;
                }
                let mut freed = 0;
                for &ptr in &pointers[keep..] {
                    if ptr != 0 {
                        txn.free_block(BlockNo(ptr))?;
                        freed += 1;
                    }
                }
                if keep > 0 && size % bs != 0 && pointers[keep - 1] != 0 {
                    let used = (size % bs) as usize;
                    let zeros = vec![0u8; bs as usize - used];
                    txn.write_data(BlockNo(pointers[keep - 1]), used, &zeros, false)?;
                }
                let new_size = if keep == 0 { first * bs } else { size };
                self.update_sd(txn, obj, |sd| {
                    sd.size = new_size;
                    sd.blocks = sd.blocks.saturating_sub(freed * spb);
                    if new_size == 0 {
                        sd.first_direct_byte = 1;
                    }
                })
            })?;
            if keep > 0 {
                break;
            }
        }
        self.touch(obj)
    }

    fn touch(&self, obj: ObjectRef) -> Result<()> {
        let time = now();
        self.with_txn(0, 0, |txn| {
            self.update_sd(txn, obj, |sd| {
                sd.mtime = time;
                sd.ctime = time;
            })
        })
    }
}

/// Copies the part of `src` (which starts at file byte `src_start`) that
/// falls inside `out` (which starts at `out_start`).
fn copy_overlap(out: &mut [u8], out_start: u64, src_start: u64, src: &[u8]) {
    let out_end = out_start + out.len() as u64;
    let src_end = src_start + src.len() as u64;
    let lo = out_start.max(src_start);
    let hi = out_end.min(src_end);
    if lo >= hi {
        return;
    }
    out[(lo - out_start) as usize..(hi - out_start) as usize]
        .copy_from_slice(&src[(lo - src_start) as usize..(hi - src_start) as usize]);
}
