#![forbid(unsafe_code)]
//! The filesystem instance and its object layer.
//!
//! A [`Filesystem`] owns the device, block cache, allocator, journal and
//! tree of one volume. Every mutating call runs inside journal handles; a
//! tree operation is atomic on its own and a multi-step call undoes its
//! earlier steps when a later one fails.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashSet;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::primitives::cache::{BlockCache, BlockRef, CacheStats};
use crate::primitives::io::{BlockDevice, FileDevice, ImageFile};
use crate::primitives::journal::{
    format_journal, replay, BlockLog, Journal, JournalHandle, JournalLayout, JournalLimits,
    JournalStats,
};
use crate::storage::bitmap::{initial_bitmaps, initial_used, BitmapAllocator};
use crate::storage::item::{DirEntry, Item, ItemBody, StatData, IH_SIZE, NO_DIRECT_BYTES, S_IFDIR};
use crate::storage::key::{Key, DOT_DOT_OFFSET, DOT_OFFSET};
use crate::storage::node::{leaf_capacity, LeafNode, Node};
use crate::storage::superblock::{
    check_block_size, encode_label, new_uuid, probe_block_size, superblock_block, FsState,
    Superblock, FORMAT_VERSION, SUPERBLOCK_LEN,
};
use crate::storage::tree::{RootInfo, Tree, TreeTxn};
use crate::types::{BlockNo, FsError, Result, TransId};

mod dir;
mod file;
pub mod hash;
mod options;

pub use dir::DirListing;
pub use options::{FormatOptions, FsOptions, Layout};

/// Identity of an object: the first two key fields of all its items.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct ObjectRef {
    /// Object id of the directory the object was created in.
    pub dir_id: u32,
    /// The object's own id.
    pub object_id: u32,
}

impl ObjectRef {
    /// The root directory.
    pub const ROOT: ObjectRef = ObjectRef {
        dir_id: 1,
        object_id: 2,
    };

    /// What the root directory's ".." points at; no object has this id.
    pub const ROOT_PARENT: ObjectRef = ObjectRef {
        dir_id: 0,
        object_id: 1,
    };

    /// The `(dir_id, object_id)` pair.
    pub const fn ids(&self) -> (u32, u32) {
        (self.dir_id, self.object_id)
    }

    /// Key of the object's stat data.
    pub fn stat_key(&self) -> Key {
        Key::stat_data(self.dir_id, self.object_id)
    }
}

/// Counters and geometry of an open filesystem.
#[derive(Clone, Debug, Serialize)]
pub struct FsStats {
    /// Block size in bytes.
    pub block_size: u32,
    /// Blocks on the device.
    pub block_count: u32,
    /// Unallocated blocks.
    pub free_blocks: u32,
    /// Current root node.
    pub root: RootInfo,
    /// Next object id to hand out.
    pub next_objectid: u32,
    /// Whether a sanity check failed since open.
    pub errored: bool,
    /// Block cache counters.
    pub cache: CacheStats,
    /// Journal counters.
    pub journal: JournalStats,
}

/// One mounted volume.
pub struct Filesystem {
    device: Arc<dyn BlockDevice>,
    cache: Arc<BlockCache>,
    journal: Journal,
    allocator: BitmapAllocator,
    tree: Tree,
    superblock: Mutex<Superblock>,
    sb_block: BlockRef,
    write_lock: Mutex<()>,
    options: FsOptions,
    tail_limit: usize,
    undo: Mutex<Option<UndoLog>>,
    errored: AtomicBool,
    closed: AtomicBool,
}

/// Pre-images of the blocks changed by the object-level call in progress.
///
/// Blocks that were free before the call carry no image: whatever they
/// held is garbage again once the call is undone.
#[derive(Default)]
struct UndoLog {
    images: Vec<(BlockRef, Arc<[u8]>)>,
    seen: FxHashSet<BlockNo>,
    freed: FxHashSet<BlockNo>,
}

impl UndoLog {
    fn save(&mut self, block: &BlockRef) {
        if self.seen.insert(block.block()) {
            self.images.push((block.clone(), block.snapshot()));
        }
    }
}

/// Journal handle plus the allocator and superblock services the tree and
/// the object layer need while it is open.
pub(crate) struct FsTxn<'a> {
    fs: &'a Filesystem,
    handle: JournalHandle<'a>,
}

impl<'a> FsTxn<'a> {
    /// Ends the handle.
    pub(crate) fn finish(self) -> Result<()> {
        self.handle.end()
    }

    /// Copies `bytes` into data block `block` at `offset`. `fresh` blocks
    /// were just allocated and start out zeroed.
    pub(crate) fn write_data(&mut self, block: BlockNo, offset: usize, bytes: &[u8], fresh: bool) -> Result<()> {
        let fs = self.fs;
        let buf = if fresh {
            self.fresh_block(&fs.cache, block)?
        } else {
            let buf = fs.cache.get(block)?;
            self.log_block(&buf);
            buf
        };
        buf.data_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Hands out the next object id.
    pub(crate) fn next_object_id(&mut self) -> Result<u32> {
        let mut id = 0;
        let mut exhausted = false;
        let fs = self.fs;
        fs.update_superblock(self, |sb| {
            if sb.next_objectid == u32::MAX {
                exhausted = true;
            } else {
                id = sb.next_objectid;
                sb.next_objectid += 1;
            }
        });
        if exhausted {
            return Err(FsError::NoSpace);
        }
        Ok(id)
    }
}

impl BlockLog for FsTxn<'_> {
    fn log_block(&mut self, block: &BlockRef) {
        if let Some(undo) = self.fs.undo.lock().as_mut() {
            undo.save(block);
        }
        self.handle.log_block(block);
    }
}

impl TreeTxn for FsTxn<'_> {
    fn journal_block(&mut self, block: &BlockRef) {
        self.log_block(block);
    }

    fn fresh_block(&mut self, cache: &BlockCache, block: BlockNo) -> Result<BlockRef> {
        let buf = match self.fs.undo.lock().as_mut() {
            // Freed earlier in this call: what it held must come back on undo.
            Some(undo) if undo.freed.contains(&block) => {
                let buf = cache.get(block)?;
                undo.save(&buf);
                buf
            }
            Some(undo) => {
                undo.seen.insert(block);
                cache.get_new(block)
            }
            None => cache.get_new(block),
        };
        buf.data_mut().fill(0);
        self.handle.log_block(&buf);
        Ok(buf)
    }

    fn allocate_blocks(&mut self, count: u32, hint: BlockNo) -> Result<Vec<BlockNo>> {
        let fs = self.fs;
        let blocks = fs.allocator.allocate(&mut *self, count, hint)?;
        if count > 0 {
            fs.update_superblock(self, |sb| sb.free_blocks -= count);
        }
        Ok(blocks)
    }

    fn free_block(&mut self, block: BlockNo) -> Result<()> {
        let fs = self.fs;
        if let Some(undo) = fs.undo.lock().as_mut() {
            undo.freed.insert(block);
        }
        fs.allocator.free(&mut *self, block)?;
        fs.update_superblock(self, |sb| sb.free_blocks += 1);
        Ok(())
    }

    fn set_root(&mut self, root: RootInfo) -> Result<()> {
        let fs = self.fs;
        fs.update_superblock(self, |sb| {
            sb.root_block = root.block;
            sb.tree_height = root.height;
        });
        Ok(())
    }
}

pub(crate) fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

pub(crate) fn read_superblock(device: &dyn BlockDevice) -> Result<Superblock> {
    let mut buf = vec![0u8; device.block_size()];
    device.read_block(superblock_block(device.block_size()), &mut buf)?;
    Superblock::decode(&buf[..SUPERBLOCK_LEN])
}

impl Filesystem {
    /// Writes an empty filesystem onto `device`: superblock, bitmaps, an
    /// empty journal and a root leaf holding the root directory.
    pub fn format(device: &dyn BlockDevice, opts: &FormatOptions) -> Result<Superblock> {
        let block_size = device.block_size();
        check_block_size(block_size)?;
        let block_count = device.block_count();
        let layout = Layout::compute(block_size, block_count, opts.journal_blocks_for(block_count))?;
        let mut sb = Superblock {
            block_size: block_size as u32,
            block_count,
            free_blocks: 0,
            root_block: BlockNo(layout.root),
            tree_height: 1,
            bmap_nr: layout.bmap_nr,
            journal_start: BlockNo(layout.journal_start),
            journal_blocks: layout.journal_blocks,
            journal_max_batch: opts.journal_max_batch.max(1),
            journal_max_age: opts.journal_max_age_secs,
            next_objectid: 3,
            state: FsState::Valid,
            format_version: FORMAT_VERSION,
            uuid: new_uuid(),
            label: encode_label(&opts.label),
        };
        sb.free_blocks = block_count - initial_used(&sb, layout.root + 1);

        let journal = JournalLayout::new(sb.journal_start, sb.journal_blocks);
        format_journal(device, &journal)?;
        for (block, image) in initial_bitmaps(&sb, layout.root + 1) {
            device.write_block(block, &image)?;
        }

        let mut buf = vec![0u8; block_size];
        let mut leaf = LeafNode::empty();
        leaf.items = root_directory_items(now());
        Node::Leaf(leaf).encode(&mut buf);
        device.write_block(sb.root_block, &buf)?;

        buf.fill(0);
        sb.encode(&mut buf);
        device.write_block(sb.location(), &buf)?;
        device.flush()?;
        info!(
            block_size,
            block_count,
            journal_blocks = sb.journal_blocks,
            root = layout.root,
            free = sb.free_blocks,
            "fs.format"
        );
        Ok(sb)
    }

    /// Creates an image file sized by `opts` and formats it.
    pub fn create_image(path: impl AsRef<Path>, opts: &FormatOptions) -> Result<Superblock> {
        check_block_size(opts.block_size)?;
        let device = FileDevice::create(path, opts.block_size, opts.block_count)?;
        Self::format(&device, opts)
    }

    /// Opens an image file, reading its block size from the superblock.
    pub fn open_image(path: impl AsRef<Path>, options: FsOptions) -> Result<Filesystem> {
        let path = path.as_ref();
        let block_size = probe_block_size(&ImageFile::open(path)?)?;
        let device = FileDevice::open(path, block_size)?;
        Self::open(Arc::new(device), options)
    }

    /// Mounts the filesystem on `device`, replaying the journal first.
    pub fn open(device: Arc<dyn BlockDevice>, options: FsOptions) -> Result<Filesystem> {
        let block_size = device.block_size();
        check_block_size(block_size)?;
        let sb = read_superblock(&*device)?;
        if sb.block_size as usize != block_size {
            return Err(FsError::BadSuperblock("block size differs from the device"));
        }
        let layout = JournalLayout::new(sb.journal_start, sb.journal_blocks);
        let report = replay(&*device, &layout)?;
        if report.replayed > 0 || report.discarded {
            info!(
                replayed = report.replayed,
                blocks = report.blocks_restored,
                discarded = report.discarded,
                "fs.replay"
            );
        }
        // Replay may have restored a newer superblock.
        let mut sb = read_superblock(&*device)?;
        if sb.block_count > device.block_count() {
            return Err(FsError::BadSuperblock("superblock describes more blocks than the device"));
        }
        if sb.state == FsState::Error {
            warn!("fs.open: filesystem is marked in error; run verify");
        }

        let cache = Arc::new(BlockCache::new(Arc::clone(&device), options.cache_blocks));
        let sb_block = cache.get(sb.location())?;
        let allocator = BitmapAllocator::load(&cache, &sb)?;
        if allocator.free_blocks() != sb.free_blocks {
            warn!(
                superblock = sb.free_blocks,
                bitmap = allocator.free_blocks(),
                "fs.open: free count disagrees with the bitmap; using the bitmap"
            );
            sb.free_blocks = allocator.free_blocks();
        }
        let limits = JournalLimits {
            max_batch: options.journal_max_batch.unwrap_or(sb.journal_max_batch),
            max_age: options.max_age(sb.journal_max_age),
        };
        let journal = Journal::open(Arc::clone(&device), layout, limits, &report)?;
        let tree = Tree::new(
            Arc::clone(&cache),
            RootInfo {
                block: sb.root_block,
                height: sb.tree_height,
            },
        );
        let tail_limit = options
            .tail_limit
            .unwrap_or(block_size)
            .min(leaf_capacity(block_size) - IH_SIZE);
        let fs = Filesystem {
            device,
            cache,
            journal,
            allocator,
            tree,
            superblock: Mutex::new(sb),
            sb_block,
            write_lock: Mutex::new(()),
            options,
            tail_limit,
            undo: Mutex::new(None),
            errored: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        if fs.options.verify_on_read {
            let nodes = fs.check_nodes()?;
            debug!(nodes, "fs.open verified tree nodes");
        }
        info!(root = fs.tree.root().block.0, height = fs.tree.root().height, "fs.open");
        Ok(fs)
    }

    /// The root directory.
    pub fn root(&self) -> ObjectRef {
        ObjectRef::ROOT
    }

    /// The item tree.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// The block cache.
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// The device.
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// The journal.
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// The block allocator.
    pub fn allocator(&self) -> &BitmapAllocator {
        &self.allocator
    }

    /// Copy of the in-memory superblock.
    pub fn superblock(&self) -> Superblock {
        self.superblock.lock().clone()
    }

    /// Runtime options.
    pub fn options(&self) -> &FsOptions {
        &self.options
    }

    /// Largest file kept in direct items: the configured limit, at most
    /// the largest direct item a leaf holds.
    pub fn tail_limit(&self) -> usize {
        self.tail_limit
    }

    /// Counter snapshot.
    pub fn stats(&self) -> FsStats {
        let sb = self.superblock.lock();
        FsStats {
            block_size: sb.block_size,
            block_count: sb.block_count,
            free_blocks: sb.free_blocks,
            root: self.tree.root(),
            next_objectid: sb.next_objectid,
            errored: self.errored.load(Ordering::Acquire),
            cache: self.cache.stats(),
            journal: self.journal.stats(),
        }
    }

    /// Stat data of `obj`.
    pub fn stat(&self, obj: ObjectRef) -> Result<StatData> {
        let item = self.tree.get_item(&obj.stat_key())?.ok_or(FsError::NotFound)?;
        match item.body {
            ItemBody::StatData(sd) => Ok(sd),
            _ => Err(FsError::TreeInconsistent("stat data key holds another item type")),
        }
    }

    /// Commits the running transaction without checkpointing it.
    pub fn commit(&self) -> Result<Option<TransId>> {
        let _guard = self.write_lock.lock();
        self.journal.commit()
    }

    /// Commits and checkpoints everything; afterwards the home locations
    /// hold the whole state. Persists the error flag if one was raised.
    pub fn sync(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mark = self.errored.load(Ordering::Acquire) && self.superblock.lock().state == FsState::Valid;
        if mark {
            let mut txn = self.begin(0, 1)?;
            self.update_superblock(&mut txn, |sb| sb.state = FsState::Error);
            txn.finish()?;
        }
        self.journal.sync()
    }

    /// Syncs and closes.
    pub fn close(self) -> Result<()> {
        let result = self.sync();
        self.closed.store(true, Ordering::Release);
        result
    }

    /// Drops the instance without writing anything, as a crash would.
    pub fn abandon(self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn begin(&self, tree_ops: u32, data_blocks: u32) -> Result<FsTxn<'_>> {
        let height = u32::from(self.tree.root().height) + 1;
        let wanted = tree_ops * (10 * height + 6) + data_blocks + 2;
        let handle = self.journal.begin(wanted.min(self.journal.hard_limit()))?;
        Ok(FsTxn { fs: self, handle })
    }

    /// Serializes object-level mutations; refused once the filesystem is
    /// marked in error.
    pub(crate) fn writer(&self) -> Result<MutexGuard<'_, ()>> {
        if self.errored.load(Ordering::Acquire) {
            return Err(FsError::TreeInconsistent("filesystem marked in error"));
        }
        Ok(self.write_lock.lock())
    }

    /// Runs one object-level call under the write lock. When it fails,
    /// every block it changed gets its old content back, so a failed call
    /// leaves no trace however many handles it spanned.
    pub(crate) fn mutating<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.writer()?;
        *self.undo.lock() = Some(UndoLog::default());
        let result = f();
        let undo = self.undo.lock().take().unwrap_or_default();
        if let Err(err) = &result {
            debug!(error = %err, blocks = undo.images.len(), "fs.rollback");
            if let Err(undo_err) = self.roll_back(undo) {
                warn!(error = %undo_err, "fs.rollback failed");
                self.errored.store(true, Ordering::Release);
            }
        }
        self.track(result)
    }

    /// Writes the pre-images back through fresh handles, then reloads what
    /// is cached from those blocks: allocator counts, superblock and root.
    fn roll_back(&self, undo: UndoLog) -> Result<()> {
        if undo.images.is_empty() {
            return Ok(());
        }
        let per_handle = (self.journal.hard_limit() / 2).max(1) as usize;
        self.tree.rewrite(|| {
            for chunk in undo.images.chunks(per_handle) {
                let mut handle = self.journal.begin(chunk.len() as u32)?;
                for (buf, image) in chunk {
                    handle.log_block(buf);
                    buf.data_mut().copy_from_slice(image);
                }
                handle.end()?;
            }
            self.allocator.recount();
            let mut sb = Superblock::decode(&self.sb_block.data()[..SUPERBLOCK_LEN])?;
            sb.free_blocks = self.allocator.free_blocks();
            let root = RootInfo {
                block: sb.root_block,
                height: sb.tree_height,
            };
            *self.superblock.lock() = sb;
            Ok(root)
        })
    }

    /// Records a failed sanity check.
    pub(crate) fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(FsError::TreeInconsistent(reason)) = &result {
            if !self.errored.swap(true, Ordering::AcqRel) {
                warn!(reason, "fs.errored");
            }
        }
        result
    }

    fn update_superblock(&self, log: &mut dyn BlockLog, f: impl FnOnce(&mut Superblock)) {
        let mut sb = self.superblock.lock();
        f(&mut sb);
        log.log_block(&self.sb_block);
        sb.encode(&mut self.sb_block.data_mut());
    }

    /// Walks every node checking it decodes, sits at the right level and
    /// is marked allocated. Returns the node count.
    fn check_nodes(&self) -> Result<usize> {
        let root = self.tree.root();
        let mut stack = vec![(root.block, root.height)];
        let mut seen = 0;
        while let Some((block, level)) = stack.pop() {
            if !self.allocator.is_allocated(block) {
                return Err(FsError::TreeInconsistent("tree node is not marked allocated"));
            }
            let node = Node::decode(&self.cache.get(block)?.data())?;
            if node.level() != level {
                return Err(FsError::TreeInconsistent("node level does not match its depth"));
            }
            if let Node::Internal(internal) = &node {
                stack.extend(internal.children.iter().map(|c| (c.block, level - 1)));
            }
            seen += 1;
        }
        Ok(seen)
    }
}

impl Drop for Filesystem {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.sync() {
            warn!(error = %err, "fs.drop: final sync failed");
        }
    }
}

fn root_directory_items(time: u32) -> Vec<Item> {
    let entries = vec![
        DirEntry::new(DOT_OFFSET, 1, 2, b"."),
        DirEntry::new(
            DOT_DOT_OFFSET,
            ObjectRef::ROOT_PARENT.dir_id,
            ObjectRef::ROOT_PARENT.object_id,
            b"..",
        ),
    ];
    let size = entries.iter().map(DirEntry::size).sum::<usize>() as u64;
    let sd = StatData {
        mode: S_IFDIR | 0o755,
        nlink: 2,
        size,
        atime: time,
        mtime: time,
        ctime: time,
        first_direct_byte: NO_DIRECT_BYTES,
        ..StatData::default()
    };
    let root = ObjectRef::ROOT;
    vec![
        Item::stat_data(root.stat_key(), sd),
        Item::directory(Key::directory(root.dir_id, root.object_id, DOT_OFFSET), entries),
    ]
}
