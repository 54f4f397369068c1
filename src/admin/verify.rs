use std::path::Path;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::fs::hash::{base_offset, GENERATIONS};
use crate::fs::read_superblock;
use crate::primitives::io::BlockDevice;
use crate::primitives::journal::format::{Descriptor, JournalHeader};
use crate::primitives::journal::JournalLayout;
use crate::storage::bitmap::{bitmap_count_free, bitmap_get};
use crate::storage::item::{Item, ItemBody, StatData, NO_DIRECT_BYTES};
use crate::storage::key::{Key, DOT_DOT_OFFSET, DOT_OFFSET, MAX_KEY, MIN_KEY};
use crate::storage::node::{leaf_capacity, BlockHead, Node, MAX_HEIGHT};
use crate::storage::superblock::{FsState, Superblock};
use crate::types::BlockNo;

use crate::admin::util::{open_raw, read_block};
use crate::fs::ObjectRef;
use crate::admin::Result;

const MAX_FINDINGS: usize = 32;

/// Specifies the depth of verification checks to perform.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Superblock, journal header and bitmap counts only.
    Fast,
    /// Also walks the tree, cross-checks the bitmap and every object.
    Full,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Non-critical issue, such as a leaked block or a stale counter.
    Warning,
    /// Structural damage.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

/// Statistics collected during the verification process.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Formatted nodes visited.
    pub nodes: u64,
    /// Leaf nodes visited.
    pub leaves: u64,
    /// Items found in leaves.
    pub items: u64,
    /// Objects with stat data.
    pub objects: u64,
    /// Regular files.
    pub files: u64,
    /// Directories.
    pub directories: u64,
    /// Directory entries other than "." and "..".
    pub entries: u64,
    /// Data blocks referenced by indirect items.
    pub data_blocks: u64,
    /// Free blocks according to the bitmap.
    pub free_blocks: u64,
    /// Blocks marked allocated that nothing references.
    pub unreachable_blocks: u64,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// The verification level that was performed.
    pub level: VerifyLevel,
    /// Whether verification finished without error findings.
    pub success: bool,
    /// List of issues discovered during verification.
    pub findings: Vec<VerifyFinding>,
    /// Statistics about the structures examined.
    pub counts: VerifyCounts,
}

/// Verifies the image at `path` without mounting it.
///
/// Journal transactions that were committed but not yet replayed are
/// reported, not applied; the check sees the home locations as they are.
///
/// # Errors
///
/// Returns an error if the image cannot be opened or a block read fails.
/// Damage found in the blocks themselves is reported as findings.
pub fn verify(path: impl AsRef<Path>, level: VerifyLevel) -> Result<VerifyReport> {
    let image = open_raw(path.as_ref())?;
    verify_device(image.device.as_ref(), level)
}

/// Verifies the filesystem on `device`. Nothing is written.
///
/// # Errors
///
/// Returns an error only when a block cannot be read.
pub fn verify_device(device: &dyn BlockDevice, level: VerifyLevel) -> Result<VerifyReport> {
    let mut findings = Vec::new();
    let mut counts = VerifyCounts::default();

    let sb = match read_superblock(device) {
        Ok(sb) => sb,
        Err(err) => {
            push_error(&mut findings, format!("superblock: {err}"));
            return Ok(finish(level, findings, counts));
        }
    };
    if !check_superblock(device, &sb, &mut findings) {
        return Ok(finish(level, findings, counts));
    }
    check_journal(device, &sb, &mut findings)?;

    let bitmap = Bitmap::load(device, &sb)?;
    counts.free_blocks = u64::from(bitmap.free);
    if bitmap.free != sb.free_blocks {
        push_warning(
            &mut findings,
            format!(
                "superblock counts {} free blocks, bitmap has {}",
                sb.free_blocks, bitmap.free
            ),
        );
    }
    let fixed_end = sb.journal_start.0 + sb.journal_blocks;
    if let Some(block) = (0..fixed_end.min(sb.block_count)).find(|b| !bitmap.is_set(BlockNo(*b))) {
        push_error(&mut findings, format!("reserved block {block} is marked free"));
    }

    if matches!(level, VerifyLevel::Full) {
        let mut walk = Walk::new(device, &sb, &bitmap, &mut findings, &mut counts);
        walk.visit(sb.root_block, sb.tree_height, MIN_KEY, MAX_KEY, None, true)?;
        walk.check_objects();
        walk.check_reachability(fixed_end);
    }

    Ok(finish(level, findings, counts))
}

fn finish(level: VerifyLevel, findings: Vec<VerifyFinding>, counts: VerifyCounts) -> VerifyReport {
    VerifyReport {
        level,
        success: findings.iter().all(|f| f.severity != VerifySeverity::Error),
        findings,
        counts,
    }
}

/// Returns false when the superblock is too broken to go on.
fn check_superblock(device: &dyn BlockDevice, sb: &Superblock, findings: &mut Vec<VerifyFinding>) -> bool {
    let mut usable = true;
    if sb.block_size as usize != device.block_size() {
        push_error(findings, "superblock block size differs from the device");
        usable = false;
    }
    if sb.block_count > device.block_count() {
        push_error(
            findings,
            format!(
                "superblock describes {} blocks, device holds {}",
                sb.block_count,
                device.block_count()
            ),
        );
        usable = false;
    }
    if sb.root_block.0 >= sb.block_count || sb.root_block.is_none() {
        push_error(findings, format!("root block {} out of range", sb.root_block));
        usable = false;
    }
    if sb.tree_height == 0 || sb.tree_height > MAX_HEIGHT {
        push_error(findings, format!("tree height {} out of range", sb.tree_height));
        usable = false;
    }
    if u32::from(sb.bmap_nr) != sb.block_count.div_ceil(sb.bits_per_bitmap()) {
        push_error(findings, format!("bitmap count {} does not cover the device", sb.bmap_nr));
        usable = false;
    }
    if sb.journal_start.0 + sb.journal_blocks > sb.block_count {
        push_error(findings, "journal region runs past the end of the device");
        usable = false;
    }
    if sb.state == FsState::Error {
        push_warning(findings, "filesystem is marked in error");
    }
    usable
}

fn check_journal(device: &dyn BlockDevice, sb: &Superblock, findings: &mut Vec<VerifyFinding>) -> Result<()> {
    let layout = JournalLayout::new(sb.journal_start, sb.journal_blocks);
    let Some(header) = JournalHeader::decode(&read_block(device, layout.header)?) else {
        push_error(findings, "journal header missing or corrupt");
        return Ok(());
    };
    if header.log_len != layout.log_len || header.first_unflushed >= layout.log_len {
        push_error(findings, "journal header disagrees with the superblock");
        return Ok(());
    }
    let next = read_block(device, layout.log_block(header.first_unflushed))?;
    if let Some(desc) = Descriptor::decode(&next) {
        if desc.trans_id == header.last_flushed.next() {
            push_info(
                findings,
                format!(
                    "journal holds transaction {} ({} blocks) not yet replayed",
                    desc.trans_id,
                    desc.blocks.len()
                ),
            );
        }
    }
    Ok(())
}

struct Bitmap {
    images: Vec<Vec<u8>>,
    bits: u32,
    free: u32,
}

impl Bitmap {
    fn load(device: &dyn BlockDevice, sb: &Superblock) -> Result<Bitmap> {
        let bits = sb.bits_per_bitmap();
        let mut images = Vec::with_capacity(usize::from(sb.bmap_nr));
        let mut free = 0;
        for index in 0..u32::from(sb.bmap_nr) {
            let image = read_block(device, sb.bitmap_block(index))?;
            free += bitmap_count_free(&image, (sb.block_count - index * bits).min(bits));
            images.push(image);
        }
        Ok(Bitmap { images, bits, free })
    }

    fn is_set(&self, block: BlockNo) -> bool {
        self.images
            .get((block.0 / self.bits) as usize)
            .map_or(false, |image| bitmap_get(image, block.0 % self.bits))
    }
}

#[derive(Default)]
struct ObjectFacts {
    sd: Option<StatData>,
    body: u64,
    direct: bool,
    indirect: bool,
    data_blocks: u32,
    dir_bytes: u64,
    links: u32,
}

struct EntryRef {
    parent: (u32, u32),
    target: (u32, u32),
    offset: u32,
    name: Vec<u8>,
}

struct Walk<'a> {
    device: &'a dyn BlockDevice,
    sb: &'a Superblock,
    bitmap: &'a Bitmap,
    findings: &'a mut Vec<VerifyFinding>,
    counts: &'a mut VerifyCounts,
    nodes: FxHashSet<u32>,
    data: FxHashSet<u32>,
    objects: FxHashMap<(u32, u32), ObjectFacts>,
    entries: Vec<EntryRef>,
}

impl<'a> Walk<'a> {
    fn new(
        device: &'a dyn BlockDevice,
        sb: &'a Superblock,
        bitmap: &'a Bitmap,
        findings: &'a mut Vec<VerifyFinding>,
        counts: &'a mut VerifyCounts,
    ) -> Self {
        Self {
            device,
            sb,
            bitmap,
            findings,
            counts,
            nodes: FxHashSet::default(),
            data: FxHashSet::default(),
            objects: FxHashMap::default(),
            entries: Vec::new(),
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        push_error(self.findings, message);
    }

    fn visit(
        &mut self,
        block: BlockNo,
        level: u16,
        lo: Key,
        hi: Key,
        dc_size: Option<u16>,
        is_root: bool,
    ) -> Result<()> {
        if block.is_none() || block.0 >= self.sb.block_count {
            self.error(format!("node pointer {block} out of range"));
            return Ok(());
        }
        if !self.nodes.insert(block.0) {
            self.error(format!("node {block} is referenced twice"));
            return Ok(());
        }
        if !self.bitmap.is_set(block) {
            self.error(format!("node {block} is not marked allocated"));
        }
        let buf = read_block(self.device, block)?;
        let node = match Node::decode(&buf) {
            Ok(node) => node,
            Err(err) => {
                self.error(format!("block {block}: {err}"));
                return Ok(());
            }
        };
        self.counts.nodes += 1;
        if node.level() != level {
            self.error(format!("node {block} has level {}, expected {level}", node.level()));
        }
        if node.rdkey() != hi {
            self.error(format!(
                "node {block} right delimiting key {} differs from {hi}",
                node.rdkey()
            ));
        }
        let used = node.used_space();
        let head = BlockHead::decode(&buf);
        if usize::from(head.free_space) + used != leaf_capacity(buf.len()) {
            self.error(format!(
                "node {block} records {} free bytes, content leaves {}",
                head.free_space,
                leaf_capacity(buf.len()).saturating_sub(used)
            ));
        }
        if let Some(size) = dc_size {
            if usize::from(size) != used {
                self.error(format!("child size of {block} is {size}, node uses {used}"));
            }
        }
        match node {
            Node::Leaf(leaf) => {
                self.counts.leaves += 1;
                self.counts.items += leaf.items.len() as u64;
                if leaf.items.is_empty() && !is_root {
                    self.error(format!("leaf {block} is empty"));
                }
                if let Some(first) = leaf.items.first() {
                    if lo != MIN_KEY && first.key != lo {
                        self.error(format!(
                            "leaf {block} starts at {}, left delimiting key is {lo}",
                            first.key
                        ));
                    }
                }
                for (i, item) in leaf.items.iter().enumerate() {
                    if i > 0 && leaf.items[i - 1].key >= item.key {
                        self.error(format!("leaf {block} items out of order at {}", item.key));
                    }
                    if item.key < lo || item.key >= hi {
                        self.error(format!("item {} in leaf {block} outside [{lo}, {hi})", item.key));
                    }
                    self.record_item(item);
                }
            }
            Node::Internal(internal) => {
                if internal.keys.len() + 1 != internal.children.len() {
                    self.error(format!(
                        "node {block} has {} keys and {} children",
                        internal.keys.len(),
                        internal.children.len()
                    ));
                    return Ok(());
                }
                if is_root && internal.children.len() < 2 {
                    self.error(format!("root {block} has a single child"));
                }
                for (i, child) in internal.children.iter().enumerate() {
                    let child_lo = if i == 0 { lo } else { internal.keys[i - 1] };
                    let child_hi = internal.keys.get(i).copied().unwrap_or(hi);
                    if child_lo >= child_hi && child_lo != MIN_KEY {
                        self.error(format!("node {block} keys out of order at {child_hi}"));
                        continue;
                    }
                    self.visit(child.block, level.saturating_sub(1), child_lo, child_hi, Some(child.size), false)?;
                    if self.findings.len() >= MAX_FINDINGS {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn record_item(&mut self, item: &Item) {
        let id = (item.key.dir_id, item.key.object_id);
        let block_size = self.sb.block_size as usize;
        let mut bad_pointers = Vec::new();
        let mut dangling_names = Vec::new();
        {
            let facts = self.objects.entry(id).or_default();
            match &item.body {
                ItemBody::StatData(sd) => facts.sd = Some(*sd),
                ItemBody::Direct(bytes) => {
                    facts.direct = true;
                    facts.body += bytes.len() as u64;
                }
                ItemBody::Indirect(pointers) => {
                    facts.indirect = true;
                    facts.body += item.logical_length(block_size);
                    for &ptr in pointers.iter().filter(|p| **p != 0) {
                        facts.data_blocks += 1;
                        bad_pointers.push(ptr);
                    }
                }
                ItemBody::Directory(entries) => {
                    for entry in entries {
                        facts.dir_bytes += entry.size() as u64;
                        if entry.offset != DOT_OFFSET && entry.offset != DOT_DOT_OFFSET {
                            let base = base_offset(&entry.name);
                            if entry.offset < base || entry.offset >= base + GENERATIONS {
                                dangling_names.push(entry.name.clone());
                            }
                        }
                        self.entries.push(EntryRef {
                            parent: id,
                            target: (entry.dir_id, entry.object_id),
                            offset: entry.offset,
                            name: entry.name.clone(),
                        });
                    }
                }
            }
        }
        for name in dangling_names {
            self.error(format!(
                "entry \"{}\" in {}/{} sits outside its hash range",
                String::from_utf8_lossy(&name),
                id.0,
                id.1
            ));
        }
        for ptr in bad_pointers {
            self.counts.data_blocks += 1;
            if ptr >= self.sb.block_count {
                self.error(format!("file {}/{} points at block {ptr} past the device", id.0, id.1));
            } else if !self.data.insert(ptr) {
                self.error(format!("data block {ptr} is referenced twice"));
            } else if !self.bitmap.is_set(BlockNo(ptr)) {
                self.error(format!("data block {ptr} of {}/{} is not marked allocated", id.0, id.1));
            }
        }
    }

    fn check_objects(&mut self) {
        let spb = self.sb.block_size / 512;
        let mut ids: Vec<(u32, u32)> = self.objects.keys().copied().collect();
        ids.sort_unstable();

        let entries = std::mem::take(&mut self.entries);
        for entry in &entries {
            let known = self.objects.get(&entry.target).map_or(false, |f| f.sd.is_some());
            match entry.offset {
                DOT_OFFSET => {
                    if entry.target != entry.parent {
                        self.error(format!("\".\" of {}/{} points elsewhere", entry.parent.0, entry.parent.1));
                    }
                }
                DOT_DOT_OFFSET => {
                    let root_parent = entry.parent == ObjectRef::ROOT.ids()
                        && entry.target == ObjectRef::ROOT_PARENT.ids();
                    if !known && !root_parent {
                        self.error(format!("\"..\" of {}/{} points at a missing object", entry.parent.0, entry.parent.1));
                    }
                }
                _ => {
                    self.counts.entries += 1;
                    if !known {
                        self.error(format!(
                            "entry \"{}\" in {}/{} points at missing object {}/{}",
                            String::from_utf8_lossy(&entry.name),
                            entry.parent.0,
                            entry.parent.1,
                            entry.target.0,
                            entry.target.1
                        ));
                    } else if let Some(facts) = self.objects.get_mut(&entry.target) {
                        facts.links += 1;
                    }
                }
            }
        }

        for id in ids {
            let Some(facts) = self.objects.get(&id) else {
                continue;
            };
            let Some(sd) = facts.sd else {
                self.error(format!("object {}/{} has items but no stat data", id.0, id.1));
                continue;
            };
            let (body, direct, indirect, data_blocks, dir_bytes, links) = (
                facts.body,
                facts.direct,
                facts.indirect,
                facts.data_blocks,
                facts.dir_bytes,
                facts.links,
            );
            self.counts.objects += 1;
            if sd.is_dir() {
                self.counts.directories += 1;
                if dir_bytes != sd.size {
                    self.error(format!(
                        "directory {}/{} records size {}, entries take {dir_bytes}",
                        id.0, id.1, sd.size
                    ));
                }
                if direct || indirect {
                    self.error(format!("directory {}/{} has file body items", id.0, id.1));
                }
                continue;
            }
            self.counts.files += 1;
            if body != sd.size {
                self.error(format!("file {}/{} records size {}, body covers {body}", id.0, id.1, sd.size));
            }
            if direct && indirect {
                self.error(format!("file {}/{} mixes direct and indirect items", id.0, id.1));
            }
            if indirect && sd.first_direct_byte != NO_DIRECT_BYTES {
                push_warning(
                    self.findings,
                    format!("file {}/{} has block pointers but is flagged as a tail file", id.0, id.1),
                );
            }
            if sd.blocks != data_blocks * spb {
                push_warning(
                    self.findings,
                    format!(
                        "file {}/{} records {} sectors, pointers account for {}",
                        id.0,
                        id.1,
                        sd.blocks,
                        data_blocks * spb
                    ),
                );
            }
            if links != sd.nlink {
                push_warning(
                    self.findings,
                    format!("file {}/{} has link count {}, found {links} entries", id.0, id.1, sd.nlink),
                );
            }
        }
    }

    fn check_reachability(&mut self, fixed_end: u32) {
        let bitmap_blocks: FxHashSet<u32> = (0..u32::from(self.sb.bmap_nr))
            .map(|i| self.sb.bitmap_block(i).0)
            .collect();
        for block in self.nodes.intersection(&self.data) {
            push_error(self.findings, format!("block {block} is both a node and file data"));
        }
        let mut leaked = 0u64;
        let mut first = None;
        for block in fixed_end..self.sb.block_count {
            if self.bitmap.is_set(BlockNo(block))
                && !self.nodes.contains(&block)
                && !self.data.contains(&block)
                && !bitmap_blocks.contains(&block)
            {
                leaked += 1;
                first.get_or_insert(block);
            }
        }
        self.counts.unreachable_blocks = leaked;
        if let Some(first) = first {
            push_warning(
                self.findings,
                format!("{leaked} blocks marked allocated but unreachable (first {first})"),
            );
        }
    }
}

fn push(findings: &mut Vec<VerifyFinding>, severity: VerifySeverity, message: impl Into<String>) {
    if findings.len() < MAX_FINDINGS {
        findings.push(VerifyFinding {
            severity,
            message: message.into(),
        });
    }
}

fn push_error(findings: &mut Vec<VerifyFinding>, message: impl Into<String>) {
    push(findings, VerifySeverity::Error, message);
}

fn push_warning(findings: &mut Vec<VerifyFinding>, message: impl Into<String>) {
    push(findings, VerifySeverity::Warning, message);
}

fn push_info(findings: &mut Vec<VerifyFinding>, message: impl Into<String>) {
    push(findings, VerifySeverity::Info, message);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::fs::{Filesystem, FormatOptions, FsOptions};
    use crate::primitives::io::MemDevice;
    use crate::storage::node::LeafNode;

    fn populated() -> Arc<MemDevice> {
        let mem = Arc::new(MemDevice::new(512, 8192));
        Filesystem::format(&*mem, &FormatOptions::default()).unwrap();
        let fs = Filesystem::open(mem.clone(), FsOptions::default()).unwrap();
        let dir = fs.mkdir(fs.root(), b"docs").unwrap();
        for i in 0..30 {
            let f = fs.create(dir, format!("f{i}").as_bytes()).unwrap();
            fs.append(f, &vec![i as u8; 100 * i]).unwrap();
        }
        fs.close().unwrap();
        mem
    }

    #[test]
    fn clean_image_passes() {
        let mem = populated();
        let report = verify_device(&*mem, VerifyLevel::Full).unwrap();
        assert!(report.success, "{:?}", report.findings);
        assert!(report.findings.is_empty(), "{:?}", report.findings);
        assert_eq!(report.counts.files, 30);
        assert_eq!(report.counts.directories, 2);
        assert_eq!(report.counts.entries, 31);
        assert!(report.counts.leaves > 1);
        assert_eq!(report.counts.unreachable_blocks, 0);
    }

    #[test]
    fn freshly_formatted_image_passes() {
        let mem = MemDevice::new(4096, 2048);
        Filesystem::format(&mem, &FormatOptions::default()).unwrap();
        let report = verify_device(&mem, VerifyLevel::Full).unwrap();
        assert!(report.success, "{:?}", report.findings);
        assert!(report.findings.iter().all(|f| f.severity != VerifySeverity::Error));
        assert_eq!(report.counts.directories, 1);
        assert_eq!(report.counts.entries, 0);
    }

    #[test]
    fn corrupt_node_is_reported_not_fatal() {
        let mem = populated();
        let sb = read_superblock(&*mem).unwrap();
        let mut junk = vec![0xA5u8; 512];
        junk[0] = 0x7F;
        mem.write_block(sb.root_block, &junk).unwrap();
        let report = verify_device(&*mem, VerifyLevel::Full).unwrap();
        assert!(!report.success);
        assert!(report.findings[0].message.contains("not a formatted node"));
        let fast = verify_device(&*mem, VerifyLevel::Fast).unwrap();
        assert!(fast.success);
    }

    #[test]
    fn wrong_file_size_is_an_error() {
        let mem = populated();
        let sb = read_superblock(&*mem).unwrap();
        let fs = Filesystem::open(mem.clone(), FsOptions::default()).unwrap();
        let dir = fs.lookup(fs.root(), b"docs").unwrap();
        let f = fs.lookup(dir, b"f3").unwrap();
        let (_, path) = fs.tree().search_by_key(&f.stat_key()).unwrap();
        let leaf_block = path.leaf_element().block.block();
        let mut leaf: LeafNode = path.leaf().clone();
        drop(path);
        fs.abandon();
        for item in &mut leaf.items {
            if let ItemBody::StatData(sd) = &mut item.body {
                if item.key == f.stat_key() {
                    sd.size += 1;
                }
            }
        }
        let mut buf = vec![0u8; sb.block_size as usize];
        Node::Leaf(leaf).encode(&mut buf);
        mem.write_block(leaf_block, &buf).unwrap();
        let report = verify_device(&*mem, VerifyLevel::Full).unwrap();
        assert!(!report.success);
        assert!(report
            .findings
            .iter()
            .any(|finding| finding.message.contains("records size 301")));
    }
}
