#![forbid(unsafe_code)]
//! On-disk records of the journal region.

use crate::primitives::bytes::{get_u32, put_u32};
use crate::types::{BlockNo, Crc32, TransId};

const HEADER_MAGIC: [u8; 8] = *b"BalJHead";
const DESC_MAGIC: [u8; 8] = *b"BalJDesc";
const COMMIT_MAGIC: [u8; 8] = *b"BalJCmit";

const HEADER_LAST_FLUSHED: usize = 8;
const HEADER_FIRST_UNFLUSHED: usize = 12;
const HEADER_LOG_LEN: usize = 16;
const HEADER_CRC: usize = 20;
const HEADER_LEN: usize = 24;

const REC_TRANS_ID: usize = 8;
const REC_LEN: usize = 12;
const DESC_BLOCKS: usize = 16;
const COMMIT_CRC: usize = 16;

/// Number of block numbers one descriptor can list.
pub fn descriptor_capacity(block_size: usize) -> usize {
    (block_size - DESC_BLOCKS) / 4
}

/// Journal header: which transactions have already reached their home
/// locations and where the first unflushed one starts in the log.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct JournalHeader {
    /// Last checkpointed transaction.
    pub last_flushed: TransId,
    /// Log offset of the first transaction not yet checkpointed.
    pub first_unflushed: u32,
    /// Log length the header was written for.
    pub log_len: u32,
}

impl JournalHeader {
    /// Encodes over a whole block.
    pub fn encode(&self, block: &mut [u8]) {
        block.fill(0);
        block[..8].copy_from_slice(&HEADER_MAGIC);
        put_u32(block, HEADER_LAST_FLUSHED, self.last_flushed.0);
        put_u32(block, HEADER_FIRST_UNFLUSHED, self.first_unflushed);
        put_u32(block, HEADER_LOG_LEN, self.log_len);
        let crc = header_crc(block);
        put_u32(block, HEADER_CRC, crc);
    }

    /// Decodes; `None` when the block is not a valid header.
    pub fn decode(block: &[u8]) -> Option<JournalHeader> {
        if block[..8] != HEADER_MAGIC || get_u32(block, HEADER_CRC) != header_crc(block) {
            return None;
        }
        Some(JournalHeader {
            last_flushed: TransId(get_u32(block, HEADER_LAST_FLUSHED)),
            first_unflushed: get_u32(block, HEADER_FIRST_UNFLUSHED),
            log_len: get_u32(block, HEADER_LOG_LEN),
        })
    }
}

fn header_crc(block: &[u8]) -> u32 {
    Crc32::new()
        .update(&block[..HEADER_CRC])
        .update(&block[HEADER_CRC + 4..HEADER_LEN])
        .value()
}

/// Descriptor block opening a transaction in the log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Descriptor {
    /// Transaction id.
    pub trans_id: TransId,
    /// Home locations of the logged images, in log order.
    pub blocks: Vec<BlockNo>,
}

impl Descriptor {
    /// Encodes over a whole block.
    pub fn encode(&self, block: &mut [u8]) {
        block.fill(0);
        block[..8].copy_from_slice(&DESC_MAGIC);
        put_u32(block, REC_TRANS_ID, self.trans_id.0);
        put_u32(block, REC_LEN, self.blocks.len() as u32);
        for (i, b) in self.blocks.iter().enumerate() {
            put_u32(block, DESC_BLOCKS + i * 4, b.0);
        }
    }

    /// Decodes; `None` unless magic and length are plausible.
    pub fn decode(block: &[u8]) -> Option<Descriptor> {
        if block[..8] != DESC_MAGIC {
            return None;
        }
        let len = get_u32(block, REC_LEN) as usize;
        if len == 0 || len > descriptor_capacity(block.len()) {
            return None;
        }
        let blocks = (0..len)
            .map(|i| BlockNo(get_u32(block, DESC_BLOCKS + i * 4)))
            .collect();
        Some(Descriptor {
            trans_id: TransId(get_u32(block, REC_TRANS_ID)),
            blocks,
        })
    }
}

/// Commit block closing a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommitRecord {
    /// Transaction id; matches the descriptor.
    pub trans_id: TransId,
    /// Number of logged images; matches the descriptor.
    pub len: u32,
    /// Checksum over the descriptor's block list and every image.
    pub crc: u32,
}

impl CommitRecord {
    /// Encodes over a whole block.
    pub fn encode(&self, block: &mut [u8]) {
        block.fill(0);
        block[..8].copy_from_slice(&COMMIT_MAGIC);
        put_u32(block, REC_TRANS_ID, self.trans_id.0);
        put_u32(block, REC_LEN, self.len);
        put_u32(block, COMMIT_CRC, self.crc);
    }

    /// Decodes; `None` without the commit magic.
    pub fn decode(block: &[u8]) -> Option<CommitRecord> {
        if block[..8] != COMMIT_MAGIC {
            return None;
        }
        Some(CommitRecord {
            trans_id: TransId(get_u32(block, REC_TRANS_ID)),
            len: get_u32(block, REC_LEN),
            crc: get_u32(block, COMMIT_CRC),
        })
    }
}

/// Running checksum of a transaction's (home block, image) pairs.
#[derive(Default)]
pub struct ImageDigest {
    crc: Crc32,
}

impl ImageDigest {
    /// Adds one logged image.
    pub fn add(&mut self, home: BlockNo, image: &[u8]) {
        self.crc.update_block(home.0).update(image);
    }

    /// Final checksum.
    pub fn finish(&self) -> u32 {
        self.crc.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_roundtrip() {
        let mut block = vec![0u8; 512];
        let header = JournalHeader {
            last_flushed: TransId(9),
            first_unflushed: 40,
            log_len: 100,
        };
        header.encode(&mut block);
        assert_eq!(JournalHeader::decode(&block), Some(header));
        block[HEADER_FIRST_UNFLUSHED] ^= 1;
        assert_eq!(JournalHeader::decode(&block), None);

        let desc = Descriptor {
            trans_id: TransId(3),
            blocks: vec![BlockNo(20), BlockNo(7)],
        };
        desc.encode(&mut block);
        assert_eq!(Descriptor::decode(&block), Some(desc));
        assert_eq!(CommitRecord::decode(&block), None);

        let commit = CommitRecord {
            trans_id: TransId(3),
            len: 2,
            crc: 0xDEAD_BEEF,
        };
        commit.encode(&mut block);
        assert_eq!(CommitRecord::decode(&block), Some(commit));
    }

    #[test]
    fn digest_depends_on_home_location() {
        let mut a = ImageDigest::default();
        a.add(BlockNo(1), b"image");
        let mut b = ImageDigest::default();
        b.add(BlockNo(2), b"image");
        assert_ne!(a.finish(), b.finish());
        assert_eq!(descriptor_capacity(4096), 1020);
    }
}
