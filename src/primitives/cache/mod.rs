#![forbid(unsafe_code)]
//! Block cache: one shared buffer per cached block, handed out as pinned
//! [`BlockRef`] handles and evicted in LRU order once unpinned and clean.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::primitives::io::BlockDevice;
use crate::types::{BlockNo, Result};

mod buffer;

pub use buffer::{BlockRef, Buffer};

/// Hit/miss counters exposed through admin stats.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CacheStats {
    /// Lookups served from memory.
    pub hits: u64,
    /// Lookups that read the device.
    pub misses: u64,
    /// Buffers dropped to stay within capacity.
    pub evictions: u64,
    /// Buffers currently resident.
    pub resident: usize,
}

/// Cache of device blocks shared by the tree, allocator and journal.
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    map: LruCache<BlockNo, Arc<Buffer>>,
    stats: CacheStats,
}

impl BlockCache {
    /// Creates a cache holding roughly `capacity` unpinned blocks.
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        let block_size = device.block_size();
        Self {
            device,
            block_size,
            capacity: capacity.max(16),
            inner: Mutex::new(CacheInner {
                map: LruCache::unbounded(),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Block size of the underlying device.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The device the cache reads from.
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Returns a pinned handle, reading the block on a miss.
    pub fn get(&self, block: BlockNo) -> Result<BlockRef> {
        let mut inner = self.inner.lock();
        if let Some(buf) = inner.map.get(&block) {
            let handle = BlockRef::new(Arc::clone(buf));
            inner.stats.hits += 1;
            return Ok(handle);
        }
        let mut data = vec![0u8; self.block_size].into_boxed_slice();
        self.device.read_block(block, &mut data)?;
        inner.stats.misses += 1;
        trace!(block = block.0, "cache.miss");
        Ok(self.install(&mut inner, block, data))
    }

    /// Returns a zero-filled buffer for a freshly allocated block without
    /// reading the device.
    pub fn get_new(&self, block: BlockNo) -> BlockRef {
        let mut inner = self.inner.lock();
        if let Some(buf) = inner.map.get(&block) {
            let handle = BlockRef::new(Arc::clone(buf));
            handle.data_mut().fill(0);
            return handle;
        }
        let data = vec![0u8; self.block_size].into_boxed_slice();
        self.install(&mut inner, block, data)
    }

    /// Drops a clean, unpinned buffer so the next access rereads the device.
    pub fn invalidate(&self, block: BlockNo) {
        let mut inner = self.inner.lock();
        let evictable = inner
            .map
            .peek(&block)
            .map(|buf| Arc::strong_count(buf) == 1 && buf.is_clean())
            .unwrap_or(false);
        if evictable {
            inner.map.pop(&block);
        }
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            resident: inner.map.len(),
            ..inner.stats
        }
    }

    fn install(&self, inner: &mut CacheInner, block: BlockNo, data: Box<[u8]>) -> BlockRef {
        let buf = Arc::new(Buffer::new(block, data));
        let handle = BlockRef::new(Arc::clone(&buf));
        inner.map.put(block, buf);
        self.evict(inner);
        debug_assert!(inner.map.peek(&block).map_or(false, |b| handle.same_buffer(b)));
        handle
    }

    fn evict(&self, inner: &mut CacheInner) {
        let excess = inner.map.len().saturating_sub(self.capacity);
        if excess == 0 {
            return;
        }
        let victims: Vec<BlockNo> = inner
            .map
            .iter()
            .rev()
            .filter(|(_, buf)| Arc::strong_count(buf) == 1 && buf.is_clean())
            .map(|(block, _)| *block)
            .take(excess)
            .collect();
        for block in victims {
            inner.map.pop(&block);
            inner.stats.evictions += 1;
        }
    }
}
