#![forbid(unsafe_code)]
//! Write-ahead journal over a circular log region.
//!
//! Handles join the single running transaction. A transaction is closed
//! when it reaches the batch limit or its age limit, or on an explicit
//! [`Journal::commit`]. Commit snapshots every joined block into the log
//! (descriptor, images, commit record). Checkpoint later copies the images
//! to their home locations and advances the journal header.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashSet;
use serde::Serialize;
use tracing::{debug, warn};

use crate::primitives::cache::BlockRef;
use crate::primitives::io::BlockDevice;
use crate::types::{BlockNo, FsError, Result, TransId};

pub mod format;
mod replay;

pub use replay::{format_journal, replay, ReplayReport};

use format::{descriptor_capacity, CommitRecord, Descriptor, ImageDigest, JournalHeader};

/// Placement of the journal region.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct JournalLayout {
    /// Journal header block.
    pub header: BlockNo,
    /// First block of the circular log.
    pub log_start: BlockNo,
    /// Number of log blocks.
    pub log_len: u32,
}

impl JournalLayout {
    /// Layout of a region of `total_blocks` starting at `start`.
    pub fn new(start: BlockNo, total_blocks: u32) -> JournalLayout {
        JournalLayout {
            header: start,
            log_start: BlockNo(start.0 + 1),
            log_len: total_blocks.saturating_sub(1),
        }
    }

    /// Device block of log offset `offset` (wrapping).
    pub fn log_block(&self, offset: u32) -> BlockNo {
        BlockNo(self.log_start.0 + offset % self.log_len)
    }

    /// Whether `block` lies inside the journal region.
    pub fn contains(&self, block: BlockNo) -> bool {
        block.0 >= self.header.0 && block.0 < self.log_start.0 + self.log_len
    }
}

/// When a running transaction gets closed.
#[derive(Clone, Copy, Debug)]
pub struct JournalLimits {
    /// Blocks a transaction may hold.
    pub max_batch: u32,
    /// Age after which a transaction is closed at the next begin or end.
    pub max_age: Duration,
}

/// Lifecycle position of a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum TxnState {
    /// Accepting handles.
    Open,
    /// Being written to the log.
    Closing,
    /// Durable in the log, not yet at home locations.
    Committed,
    /// At home locations; log space reclaimed.
    Checkpointed,
}

/// Journal counters.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct JournalStats {
    /// Transactions committed.
    pub commits: u64,
    /// Transactions checkpointed.
    pub checkpoints: u64,
    /// Checkpoints forced by a full log.
    pub forced_checkpoints: u64,
    /// Distinct blocks joined to transactions.
    pub blocks_logged: u64,
    /// Log blocks held by committed transactions.
    pub log_used: u32,
    /// Blocks joined to the running transaction.
    pub running_blocks: u32,
    /// Last checkpointed transaction.
    pub last_flushed: u32,
}

struct RunningTxn {
    opened: Instant,
    handles: u32,
    reserved: u32,
    blocks: Vec<BlockRef>,
    index: FxHashSet<BlockNo>,
}

impl RunningTxn {
    fn new() -> Self {
        Self {
            opened: Instant::now(),
            handles: 0,
            reserved: 0,
            blocks: Vec::new(),
            index: FxHashSet::default(),
        }
    }
}

struct CommittedTxn {
    id: TransId,
    offset: u32,
    log_blocks: u32,
    images: Vec<(BlockNo, Arc<[u8]>)>,
    // Keeps the buffers pinned until their images are home.
    pins: Vec<BlockRef>,
}

struct JournalState {
    running: Option<RunningTxn>,
    closing: Option<TransId>,
    committed: VecDeque<CommittedTxn>,
    next_id: TransId,
    last_flushed: TransId,
    next_offset: u32,
    used: u32,
    stats: JournalStats,
}

/// The journal of one filesystem instance.
pub struct Journal {
    device: Arc<dyn BlockDevice>,
    layout: JournalLayout,
    limits: JournalLimits,
    state: Mutex<JournalState>,
    cond: Condvar,
}

impl Journal {
    /// Opens the journal after replay has brought the header up to date.
    pub fn open(
        device: Arc<dyn BlockDevice>,
        layout: JournalLayout,
        limits: JournalLimits,
        replayed: &ReplayReport,
    ) -> Result<Journal> {
        if layout.log_len < 8 {
            return Err(FsError::Invalid("journal log too small"));
        }
        let journal = Journal {
            device,
            layout,
            limits,
            state: Mutex::new(JournalState {
                running: None,
                closing: None,
                committed: VecDeque::new(),
                next_id: replayed.last_flushed.next(),
                last_flushed: replayed.last_flushed,
                next_offset: replayed.next_offset,
                used: 0,
                stats: JournalStats {
                    last_flushed: replayed.last_flushed.0,
                    ..JournalStats::default()
                },
            }),
            cond: Condvar::new(),
        };
        Ok(journal)
    }

    /// Region placement.
    pub fn layout(&self) -> JournalLayout {
        self.layout
    }

    /// Most blocks one transaction can ever hold.
    pub fn hard_limit(&self) -> u32 {
        let desc = descriptor_capacity(self.device.block_size()) as u32;
        desc.min(self.layout.log_len - 2)
    }

    // Half the hard limit, so handles that overrun their reservation still
    // leave a committable transaction.
    fn batch_limit(&self) -> u32 {
        self.limits.max_batch.clamp(1, (self.hard_limit() / 2).max(1))
    }

    /// Joins the running transaction, promising to dirty at most `reserve`
    /// blocks. Waits while a transaction is closing; closes the running one
    /// first when the reservation would push it past the batch limit.
    pub fn begin(&self, reserve: u32) -> Result<JournalHandle<'_>> {
        if reserve > self.hard_limit() {
            return Err(FsError::Invalid("journal reservation exceeds log capacity"));
        }
        let limit = self.batch_limit().max(reserve);
        let mut st = self.state.lock();
        loop {
            if st.closing.is_some() {
                self.cond.wait(&mut st);
                continue;
            }
            let (full, handles) = match &st.running {
                Some(run) => (
                    run.blocks.len() as u32 + run.reserved + reserve > limit
                        || run.opened.elapsed() >= self.limits.max_age,
                    run.handles,
                ),
                None => (false, 0),
            };
            if full {
                if handles > 0 {
                    self.cond.wait(&mut st);
                } else {
                    self.close_running(&mut st)?;
                }
                continue;
            }
            let run = st.running.get_or_insert_with(RunningTxn::new);
            run.handles += 1;
            run.reserved += reserve;
            return Ok(JournalHandle {
                journal: self,
                reserve,
                ended: false,
            });
        }
    }

    fn log_block(&self, block: &BlockRef) {
        let mut st = self.state.lock();
        let hard = self.hard_limit();
        let JournalState { running, stats, .. } = &mut *st;
        let Some(run) = running.as_mut() else {
            debug_assert!(false, "block logged without a running transaction");
            return;
        };
        if run.index.insert(block.block()) {
            run.blocks.push(block.clone());
            stats.blocks_logged += 1;
            if run.blocks.len() as u32 > hard {
                warn!(blocks = run.blocks.len(), "journal.txn exceeds log capacity");
            }
        }
        block.mark_dirty();
    }

    fn end(&self, reserve: u32) -> Result<()> {
        let mut st = self.state.lock();
        let should_close = match st.running.as_mut() {
            Some(run) => {
                run.handles -= 1;
                run.reserved -= reserve;
                run.handles == 0
                    && (run.blocks.len() as u32 >= self.batch_limit()
                        || run.opened.elapsed() >= self.limits.max_age)
            }
            None => false,
        };
        let result = if should_close {
            self.close_running(&mut st).map(|_| ())
        } else {
            Ok(())
        };
        self.cond.notify_all();
        result
    }

    fn wait_idle(&self, st: &mut MutexGuard<'_, JournalState>) {
        while st.closing.is_some() || st.running.as_ref().map_or(false, |r| r.handles > 0) {
            self.cond.wait(st);
        }
    }

    /// Closes and commits the running transaction, if it holds any block.
    pub fn commit(&self) -> Result<Option<TransId>> {
        let mut st = self.state.lock();
        self.wait_idle(&mut st);
        self.close_running(&mut st)
    }

    /// Commits, then checkpoints every committed transaction.
    pub fn sync(&self) -> Result<()> {
        let mut st = self.state.lock();
        self.wait_idle(&mut st);
        self.close_running(&mut st)?;
        while !st.committed.is_empty() {
            self.checkpoint_oldest(&mut st)?;
        }
        Ok(())
    }

    /// Checkpoints every committed transaction without closing the running one.
    pub fn checkpoint(&self) -> Result<()> {
        let mut st = self.state.lock();
        while st.closing.is_some() {
            self.cond.wait(&mut st);
        }
        while !st.committed.is_empty() {
            self.checkpoint_oldest(&mut st)?;
        }
        Ok(())
    }

    /// Where transaction `id` is in its lifecycle, if known.
    pub fn state_of(&self, id: TransId) -> Option<TxnState> {
        let st = self.state.lock();
        if st.closing == Some(id) {
            Some(TxnState::Closing)
        } else if st.committed.iter().any(|t| t.id == id) {
            Some(TxnState::Committed)
        } else if id <= st.last_flushed && id.0 > 0 {
            Some(TxnState::Checkpointed)
        } else if id == st.next_id && st.running.is_some() {
            Some(TxnState::Open)
        } else {
            None
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> JournalStats {
        let st = self.state.lock();
        JournalStats {
            log_used: st.used,
            running_blocks: st.running.as_ref().map_or(0, |r| r.blocks.len() as u32),
            last_flushed: st.last_flushed.0,
            ..st.stats
        }
    }

    fn close_running(&self, st: &mut MutexGuard<'_, JournalState>) -> Result<Option<TransId>> {
        let Some(run) = st.running.take() else {
            return Ok(None);
        };
        if run.blocks.is_empty() {
            return Ok(None);
        }
        let n = run.blocks.len() as u32;
        if n > self.hard_limit() {
            st.running = Some(run);
            return Err(FsError::Invalid("transaction exceeds journal capacity"));
        }
        let id = st.next_id;
        st.closing = Some(id);
        let images: Vec<(BlockNo, Arc<[u8]>)> = run
            .blocks
            .iter()
            .map(|b| (b.block(), b.snapshot()))
            .collect();
        for block in &run.blocks {
            block.mark_committed();
        }
        while self.layout.log_len - st.used < n + 2 {
            st.stats.forced_checkpoints += 1;
            if let Err(err) = self.checkpoint_oldest(st) {
                self.abort_close(st, run);
                return Err(err);
            }
        }
        let offset = st.next_offset;
        let written = MutexGuard::unlocked(st, || self.write_transaction(id, offset, &images));
        if let Err(err) = written {
            warn!(trans = id.0, error = %err, "journal.commit failed");
            self.abort_close(st, run);
            return Err(err);
        }
        st.closing = None;
        st.next_id = id.next();
        st.next_offset = (offset + n + 2) % self.layout.log_len;
        st.used += n + 2;
        st.stats.commits += 1;
        st.committed.push_back(CommittedTxn {
            id,
            offset,
            log_blocks: n + 2,
            images,
            pins: run.blocks,
        });
        self.cond.notify_all();
        debug!(trans = id.0, blocks = n, offset, "journal.commit");
        Ok(Some(id))
    }

    fn abort_close(&self, st: &mut MutexGuard<'_, JournalState>, run: RunningTxn) {
        for block in &run.blocks {
            block.mark_dirty();
        }
        st.running = Some(run);
        st.closing = None;
        self.cond.notify_all();
    }

    fn write_transaction(&self, id: TransId, offset: u32, images: &[(BlockNo, Arc<[u8]>)]) -> Result<()> {
        let block_size = self.device.block_size();
        let mut buf = vec![0u8; block_size];
        let mut digest = ImageDigest::default();
        Descriptor {
            trans_id: id,
            blocks: images.iter().map(|(home, _)| *home).collect(),
        }
        .encode(&mut buf);
        self.device.write_block(self.layout.log_block(offset), &buf)?;
        for (i, (home, image)) in images.iter().enumerate() {
            digest.add(*home, image);
            self.device
                .write_block(self.layout.log_block(offset + 1 + i as u32), image)?;
        }
        self.device.flush()?;
        let n = images.len() as u32;
        CommitRecord {
            trans_id: id,
            len: n,
            crc: digest.finish(),
        }
        .encode(&mut buf);
        self.device.write_block(self.layout.log_block(offset + 1 + n), &buf)?;
        self.device.flush()
    }

    fn checkpoint_oldest(&self, st: &mut MutexGuard<'_, JournalState>) -> Result<()> {
        let Some(txn) = st.committed.front() else {
            return Ok(());
        };
        let newer: FxHashSet<BlockNo> = st
            .committed
            .iter()
            .skip(1)
            .flat_map(|t| t.images.iter().map(|(home, _)| *home))
            .collect();
        for (home, image) in &txn.images {
            if !newer.contains(home) {
                self.device.write_block(*home, image)?;
            }
        }
        self.device.flush()?;
        let id = txn.id;
        let freed = txn.log_blocks;
        let first_unflushed = st
            .committed
            .get(1)
            .map_or(st.next_offset, |next| next.offset);
        let mut buf = vec![0u8; self.device.block_size()];
        JournalHeader {
            last_flushed: id,
            first_unflushed,
            log_len: self.layout.log_len,
        }
        .encode(&mut buf);
        self.device.write_block(self.layout.header, &buf)?;
        self.device.flush()?;
        if let Some(done) = st.committed.pop_front() {
            for pin in &done.pins {
                pin.mark_checkpointed();
            }
        }
        st.used -= freed;
        st.last_flushed = id;
        st.stats.checkpoints += 1;
        debug!(trans = id.0, first_unflushed, "journal.checkpoint");
        Ok(())
    }
}

/// Something a block joins before it is modified.
pub trait BlockLog {
    /// Joins `block` and marks it dirty.
    fn log_block(&mut self, block: &BlockRef);
}

impl BlockLog for JournalHandle<'_> {
    fn log_block(&mut self, block: &BlockRef) {
        self.journal.log_block(block);
    }
}

/// Membership of one operation in the running transaction.
///
/// Every block must be logged through the handle before it is modified.
pub struct JournalHandle<'j> {
    journal: &'j Journal,
    reserve: u32,
    ended: bool,
}

impl JournalHandle<'_> {
    /// Leaves the transaction, committing it if a limit has been reached.
    pub fn end(mut self) -> Result<()> {
        self.ended = true;
        self.journal.end(self.reserve)
    }
}

impl Drop for JournalHandle<'_> {
    fn drop(&mut self) {
        if !self.ended {
            let mut st = self.journal.state.lock();
            if let Some(run) = st.running.as_mut() {
                run.handles -= 1;
                run.reserved -= self.reserve;
            }
            self.journal.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::cache::BlockCache;
    use crate::primitives::io::MemDevice;

    const BS: usize = 512;

    fn setup(max_batch: u32) -> (Arc<MemDevice>, BlockCache, Journal) {
        let mem = Arc::new(MemDevice::new(BS, 256));
        let dev: Arc<dyn BlockDevice> = mem.clone();
        let layout = JournalLayout::new(BlockNo(1), 33);
        format_journal(dev.as_ref(), &layout).unwrap();
        let report = replay(dev.as_ref(), &layout).unwrap();
        let limits = JournalLimits {
            max_batch,
            max_age: Duration::from_secs(3600),
        };
        let journal = Journal::open(dev.clone(), layout, limits, &report).unwrap();
        (mem, BlockCache::new(dev, 64), journal)
    }

    fn touch(cache: &BlockCache, handle: &mut JournalHandle<'_>, block: u32, byte: u8) {
        let b = cache.get(BlockNo(block)).unwrap();
        handle.log_block(&b);
        b.data_mut().fill(byte);
    }

    #[test]
    fn commit_then_checkpoint_reaches_home() {
        let (mem, cache, journal) = setup(16);
        let mut h = journal.begin(4).unwrap();
        touch(&cache, &mut h, 100, 0xA1);
        touch(&cache, &mut h, 101, 0xA2);
        h.end().unwrap();
        assert_eq!(journal.state_of(TransId(1)), Some(TxnState::Open));
        let id = journal.commit().unwrap().unwrap();
        assert_eq!(id, TransId(1));
        assert_eq!(journal.state_of(id), Some(TxnState::Committed));
        assert_eq!(mem.block(BlockNo(100)).unwrap()[0], 0);
        journal.checkpoint().unwrap();
        assert_eq!(journal.state_of(id), Some(TxnState::Checkpointed));
        assert_eq!(mem.block(BlockNo(100)).unwrap()[0], 0xA1);
        assert_eq!(mem.block(BlockNo(101)).unwrap()[0], 0xA2);
        assert_eq!(journal.stats().log_used, 0);
    }

    #[test]
    fn handles_batch_until_limit() {
        let (_mem, cache, journal) = setup(4);
        for i in 0..3u32 {
            let mut h = journal.begin(1).unwrap();
            touch(&cache, &mut h, 100 + i, i as u8);
            h.end().unwrap();
        }
        assert_eq!(journal.stats().commits, 0);
        let mut h = journal.begin(1).unwrap();
        touch(&cache, &mut h, 110, 9);
        h.end().unwrap();
        assert_eq!(journal.stats().commits, 1);
    }

    #[test]
    fn full_log_forces_checkpoint() {
        let (mem, cache, journal) = setup(8);
        for round in 0..12u32 {
            let mut h = journal.begin(8).unwrap();
            for b in 0..6 {
                touch(&cache, &mut h, 100 + b, round as u8);
            }
            h.end().unwrap();
            journal.commit().unwrap();
        }
        let stats = journal.stats();
        assert!(stats.forced_checkpoints > 0);
        assert!(stats.log_used <= 32);
        journal.sync().unwrap();
        assert_eq!(mem.block(BlockNo(105)).unwrap()[0], 11);
    }

    #[test]
    fn replay_restores_committed_but_unflushed() {
        let (mem, cache, journal) = setup(16);
        let mut h = journal.begin(2).unwrap();
        touch(&cache, &mut h, 120, 0x5A);
        h.end().unwrap();
        journal.commit().unwrap();
        let crashed = mem.snapshot();
        assert_eq!(crashed.block(BlockNo(120)).unwrap()[0], 0);
        let layout = journal.layout();
        let report = replay(&crashed, &layout).unwrap();
        assert_eq!(report.replayed, 1);
        assert!(!report.discarded);
        assert_eq!(crashed.block(BlockNo(120)).unwrap()[0], 0x5A);
        let again = replay(&crashed, &layout).unwrap();
        assert_eq!(again.replayed, 0);
    }

    #[test]
    fn replaying_checkpointed_transactions_is_idempotent() {
        let (mem, cache, journal) = setup(16);
        let layout = journal.layout();
        let fresh_header = mem.block(layout.header).unwrap();

        let mut h = journal.begin(2).unwrap();
        touch(&cache, &mut h, 120, 0x11);
        touch(&cache, &mut h, 121, 0x12);
        h.end().unwrap();
        journal.commit().unwrap();
        journal.checkpoint().unwrap();
        let mid_header = mem.block(layout.header).unwrap();
        assert_ne!(mid_header, fresh_header);

        let mut h = journal.begin(2).unwrap();
        touch(&cache, &mut h, 120, 0x21);
        touch(&cache, &mut h, 122, 0x23);
        h.end().unwrap();
        journal.commit().unwrap();
        journal.checkpoint().unwrap();

        let homes = |dev: &MemDevice| -> Vec<Vec<u8>> {
            (120..123).map(|b| dev.block(BlockNo(b)).unwrap()).collect()
        };
        let expected = homes(&mem);
        assert_eq!(expected[0][0], 0x21);

        for (stale, transactions) in [(fresh_header, 2), (mid_header, 1)] {
            let crashed = mem.snapshot();
            crashed.write_block(layout.header, &stale).unwrap();
            assert_eq!(replay(&crashed, &layout).unwrap().replayed, transactions);
            let once = homes(&crashed);
            assert_eq!(once, expected);

            // Crash again before the header update lands.
            crashed.write_block(layout.header, &stale).unwrap();
            assert_eq!(replay(&crashed, &layout).unwrap().replayed, transactions);
            assert_eq!(homes(&crashed), once);
            assert_eq!(replay(&crashed, &layout).unwrap().replayed, 0);
        }
    }
}
