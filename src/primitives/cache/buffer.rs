use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::BlockNo;

/// In-memory copy of one device block.
pub struct Buffer {
    block: BlockNo,
    data: RwLock<Box<[u8]>>,
    state: Mutex<BufferState>,
}

#[derive(Default, Clone, Copy, Debug)]
struct BufferState {
    dirty: bool,
    journaled: bool,
}

impl Buffer {
    pub(super) fn new(block: BlockNo, data: Box<[u8]>) -> Self {
        Self {
            block,
            data: RwLock::new(data),
            state: Mutex::new(BufferState::default()),
        }
    }

    pub(super) fn is_clean(&self) -> bool {
        let state = self.state.lock();
        !state.dirty && !state.journaled
    }
}

/// Pinned handle to a cached block.
///
/// While any handle for a block is alive the cache never evicts it; dropping
/// the last one makes the buffer eligible again.
#[derive(Clone)]
pub struct BlockRef {
    buf: Arc<Buffer>,
}

impl BlockRef {
    pub(super) fn new(buf: Arc<Buffer>) -> Self {
        Self { buf }
    }

    /// Block number this buffer caches.
    pub fn block(&self) -> BlockNo {
        self.buf.block
    }

    /// Shared view of the block bytes.
    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.buf.data.read()
    }

    /// Exclusive view of the block bytes.
    ///
    /// Callers join the block to a journal transaction before modifying it.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.buf.data.write()
    }

    /// Copies the current content.
    pub fn snapshot(&self) -> Arc<[u8]> {
        Arc::from(&self.buf.data.read()[..])
    }

    /// True while the block carries changes not yet captured by a commit.
    pub fn is_dirty(&self) -> bool {
        self.buf.state.lock().dirty
    }

    /// Marks the block as modified inside the running transaction.
    pub fn mark_dirty(&self) {
        let mut state = self.buf.state.lock();
        state.dirty = true;
        state.journaled = true;
    }

    /// Called at commit once the content has been captured.
    pub fn mark_committed(&self) {
        self.buf.state.lock().dirty = false;
    }

    /// Called once the committed image reached its home location.
    pub fn mark_checkpointed(&self) {
        let mut state = self.buf.state.lock();
        if !state.dirty {
            state.journaled = false;
        }
    }

    /// Number of live handles including the cache's own reference.
    pub fn pin_count(&self) -> usize {
        Arc::strong_count(&self.buf)
    }

    pub(super) fn same_buffer(&self, other: &Arc<Buffer>) -> bool {
        Arc::ptr_eq(&self.buf, other)
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.buf.state.lock();
        f.debug_struct("BlockRef")
            .field("block", &self.buf.block.0)
            .field("dirty", &state.dirty)
            .field("journaled", &state.journaled)
            .finish()
    }
}
