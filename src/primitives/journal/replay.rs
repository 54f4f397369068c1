#![forbid(unsafe_code)]
//! Mount-time recovery: reapply committed but unflushed transactions.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::primitives::io::BlockDevice;
use crate::types::{FsError, Result, TransId};

use super::format::{CommitRecord, Descriptor, ImageDigest, JournalHeader};
use super::JournalLayout;

/// Outcome of a replay pass.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ReplayReport {
    /// Transactions reapplied to their home locations.
    pub replayed: u32,
    /// Block images written back.
    pub blocks_restored: u32,
    /// Whether a transaction with the expected id was found incomplete and
    /// ignored.
    pub discarded: bool,
    /// Last transaction now known to be on its home locations.
    pub last_flushed: TransId,
    /// Log offset where the next transaction will be written.
    pub next_offset: u32,
}

/// Replays the log described by `layout` directly against `device`.
///
/// Replay stops at the first transaction whose descriptor, commit record or
/// checksum does not validate; that transaction and everything after it are
/// treated as never having happened. Reapplying an already checkpointed
/// transaction rewrites identical images, so the pass is idempotent.
pub fn replay(device: &dyn BlockDevice, layout: &JournalLayout) -> Result<ReplayReport> {
    let block_size = device.block_size();
    let mut buf = vec![0u8; block_size];
    device.read_block(layout.header, &mut buf)?;
    let header = JournalHeader::decode(&buf)
        .ok_or(FsError::BadSuperblock("journal header missing or corrupt"))?;
    if header.log_len != layout.log_len || header.first_unflushed >= layout.log_len {
        return Err(FsError::BadSuperblock("journal header disagrees with layout"));
    }

    let mut report = ReplayReport {
        last_flushed: header.last_flushed,
        next_offset: header.first_unflushed,
        ..ReplayReport::default()
    };
    let mut scanned = 0u32;
    while scanned < layout.log_len {
        let offset = report.next_offset;
        let expect = report.last_flushed.next();
        device.read_block(layout.log_block(offset), &mut buf)?;
        let desc = match Descriptor::decode(&buf) {
            Some(desc) if desc.trans_id == expect => desc,
            _ => break,
        };
        let n = desc.blocks.len() as u32;
        if n + 2 > layout.log_len {
            warn!(trans = expect.0, "journal.replay descriptor longer than log");
            report.discarded = true;
            break;
        }
        let mut images = Vec::with_capacity(desc.blocks.len());
        let mut digest = ImageDigest::default();
        for (i, home) in desc.blocks.iter().enumerate() {
            let mut image = vec![0u8; block_size];
            device.read_block(layout.log_block(offset + 1 + i as u32), &mut image)?;
            digest.add(*home, &image);
            images.push(image);
        }
        device.read_block(layout.log_block(offset + 1 + n), &mut buf)?;
        let valid = match CommitRecord::decode(&buf) {
            Some(commit) => {
                commit.trans_id == expect && commit.len == n && commit.crc == digest.finish()
            }
            None => false,
        };
        let homes_in_range = desc
            .blocks
            .iter()
            .all(|b| b.0 < device.block_count() && !layout.contains(*b));
        if !valid || !homes_in_range {
            warn!(trans = expect.0, offset, "journal.replay discarding incomplete transaction");
            report.discarded = true;
            break;
        }
        for (home, image) in desc.blocks.iter().zip(&images) {
            device.write_block(*home, image)?;
        }
        debug!(trans = expect.0, blocks = n, "journal.replay applied");
        report.replayed += 1;
        report.blocks_restored += n;
        report.last_flushed = expect;
        report.next_offset = (offset + n + 2) % layout.log_len;
        scanned += n + 2;
    }

    if report.replayed > 0 {
        device.flush()?;
        JournalHeader {
            last_flushed: report.last_flushed,
            first_unflushed: report.next_offset,
            log_len: layout.log_len,
        }
        .encode(&mut buf);
        device.write_block(layout.header, &buf)?;
        device.flush()?;
    }
    info!(
        replayed = report.replayed,
        blocks = report.blocks_restored,
        discarded = report.discarded,
        last = report.last_flushed.0,
        "journal.replay complete"
    );
    Ok(report)
}

/// Writes an empty journal: a fresh header and a zeroed log.
pub fn format_journal(device: &dyn BlockDevice, layout: &JournalLayout) -> Result<()> {
    let mut buf = vec![0u8; device.block_size()];
    for offset in 0..layout.log_len {
        device.write_block(layout.log_block(offset), &buf)?;
    }
    JournalHeader {
        last_flushed: TransId(0),
        first_unflushed: 0,
        log_len: layout.log_len,
    }
    .encode(&mut buf);
    device.write_block(layout.header, &buf)
}
