#![allow(missing_docs)]

use std::sync::Arc;

use balfs::admin::{verify_device, VerifyLevel};
use balfs::primitives::io::{BlockDevice, FaultyDevice, MemDevice};
use balfs::primitives::journal::{replay, JournalLayout};
use balfs::storage::Superblock;
use balfs::{BlockNo, Filesystem, FormatOptions, FsError, FsOptions};

const BS: usize = 512;
const BLOCKS: u32 = 4096;

fn formatted() -> Arc<MemDevice> {
    formatted_with(BS, BLOCKS)
}

fn formatted_with(block_size: usize, blocks: u32) -> Arc<MemDevice> {
    let mem = Arc::new(MemDevice::new(block_size, blocks));
    Filesystem::format(&*mem, &FormatOptions::default()).expect("format");
    mem
}

fn pattern(len: usize, salt: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ salt).collect()
}

fn superblock(mem: &MemDevice) -> Superblock {
    let fs = Filesystem::open(Arc::new(mem.snapshot()), FsOptions::default()).expect("mount");
    let sb = fs.superblock();
    fs.abandon();
    sb
}

fn same_blocks(a: &MemDevice, b: &MemDevice) -> bool {
    (0..a.block_count()).all(|i| a.block(BlockNo(i)) == b.block(BlockNo(i)))
}

/// Runs `work` on a mount whose device dies after `budget` writes, then
/// remounts the surviving image.
fn crash_after<F>(base: &MemDevice, budget: u64, work: F) -> (Arc<MemDevice>, bool)
where
    F: FnOnce(&Filesystem) -> Result<(), FsError>,
{
    let survivor = Arc::new(base.snapshot());
    let faulty = Arc::new(FaultyDevice::new(survivor.clone(), budget));
    let tripped = match Filesystem::open(faulty.clone(), FsOptions::default()) {
        Ok(fs) => {
            let result = work(&fs).and_then(|_| fs.sync());
            fs.abandon();
            result.is_err()
        }
        Err(_) => true,
    };
    (survivor, tripped || faulty.tripped())
}

#[test]
fn interrupted_rewrite_is_all_or_nothing() {
    // Large blocks keep the whole rewrite inside one transaction.
    let base = formatted_with(4096, 2048);
    let old = pattern(3000, 0x11);
    let new = pattern(6000, 0x77);
    {
        let fs = Filesystem::open(base.clone(), FsOptions::default()).unwrap();
        let f = fs.create(fs.root(), b"data").unwrap();
        fs.write_all(f, &old).unwrap();
        fs.close().unwrap();
    }

    let mut saw_old = false;
    let mut saw_new = false;
    let mut budget = 0;
    loop {
        let (survivor, tripped) = crash_after(&base, budget, |fs| {
            let f = fs.lookup(fs.root(), b"data")?;
            fs.write_all(f, &new)?;
            fs.create(fs.root(), b"marker")?;
            fs.commit().map(|_| ())
        });

        let report = verify_device(&*survivor, VerifyLevel::Fast).unwrap();
        assert!(report.success, "budget {budget}: {:?}", report.findings);
        let fs = Filesystem::open(survivor.clone(), FsOptions::default()).unwrap();
        let f = fs.lookup(fs.root(), b"data").unwrap();
        let body = fs.read(f).unwrap();
        let marker = fs.lookup(fs.root(), b"marker").is_ok();
        if body == old {
            assert!(!marker, "budget {budget}: marker without the rewrite");
            saw_old = true;
        } else {
            assert_eq!(body, new, "budget {budget}: torn file body");
            assert!(marker, "budget {budget}: rewrite without the marker");
            saw_new = true;
        }
        fs.close().unwrap();
        let report = verify_device(&*survivor, VerifyLevel::Full).unwrap();
        assert!(report.success, "budget {budget}: {:?}", report.findings);

        if !tripped {
            break;
        }
        budget += 1;
        assert!(budget < 10_000, "work never completed");
    }
    assert!(saw_old && saw_new);
}

#[test]
fn replay_survives_being_interrupted_itself() {
    let base = formatted();
    let sb = superblock(&base);
    let layout = JournalLayout::new(sb.journal_start, sb.journal_blocks);

    // Commit to the log but never checkpoint.
    let crashed = Arc::new(base.snapshot());
    {
        let fs = Filesystem::open(crashed.clone(), FsOptions::default()).unwrap();
        for i in 0..20 {
            let f = fs.create(fs.root(), format!("f{i}").as_bytes()).unwrap();
            fs.append(f, &pattern(700, i as u8)).unwrap();
        }
        fs.commit().unwrap();
        fs.abandon();
    }

    let reference = crashed.snapshot();
    let first = replay(&reference, &layout).unwrap();
    assert!(first.replayed >= 1);
    assert!(!first.discarded);
    let again = replay(&reference, &layout).unwrap();
    assert_eq!(again.replayed, 0, "header should have advanced");

    let mut budget = 0u64;
    loop {
        let image = Arc::new(crashed.snapshot());
        let faulty = FaultyDevice::new(image.clone(), budget);
        let interrupted = replay(&faulty, &layout).is_err();
        let second = replay(&*image, &layout).unwrap();
        assert!(!second.discarded);
        assert!(
            same_blocks(&image, &reference),
            "budget {budget}: replay after an interrupted replay diverged"
        );
        if !interrupted {
            assert_eq!(second.replayed, 0);
            break;
        }
        budget += 1;
    }

    let fs = Filesystem::open(Arc::new(reference), FsOptions::default()).unwrap();
    for i in 0..20u8 {
        let f = fs.lookup(fs.root(), format!("f{i}").as_bytes()).unwrap();
        assert_eq!(fs.read(f).unwrap(), pattern(700, i));
    }
}

#[test]
fn torn_commit_block_discards_the_transaction() {
    let base = formatted();
    let sb = superblock(&base);
    let layout = JournalLayout::new(sb.journal_start, sb.journal_blocks);
    let crashed = Arc::new(base.snapshot());
    {
        let fs = Filesystem::open(crashed.clone(), FsOptions::default()).unwrap();
        fs.create(fs.root(), b"lost").unwrap();
        fs.commit().unwrap();
        fs.abandon();
    }

    // Wipe the last non-empty log block: the commit record.
    let last = (0..layout.log_len)
        .rev()
        .map(|off| layout.log_block(off))
        .find(|b| crashed.block(*b).is_some_and(|data| data.iter().any(|x| *x != 0)))
        .expect("a logged transaction");
    crashed.write_block(last, &vec![0u8; BS]).unwrap();

    let fs = Filesystem::open(crashed.clone(), FsOptions::default()).unwrap();
    assert!(matches!(fs.lookup(fs.root(), b"lost"), Err(FsError::NotFound)));
    assert!(fs.readdir(fs.root()).unwrap().is_empty());
    fs.close().unwrap();
    let report = verify_device(&*crashed, VerifyLevel::Full).unwrap();
    assert!(report.success, "{:?}", report.findings);
}
