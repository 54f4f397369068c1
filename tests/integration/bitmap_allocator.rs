#![allow(missing_docs)]

use std::sync::Arc;

use balfs::admin::{verify_device, VerifyLevel};
use balfs::primitives::io::MemDevice;
use balfs::storage::bitmap::{bitmap_clear, bitmap_count_free, bitmap_get, bitmap_set};
use balfs::{BlockNo, Filesystem, FormatOptions, FsError, FsOptions};
use proptest::prelude::*;

fn mounted(block_size: usize, blocks: u32) -> (Arc<MemDevice>, Filesystem) {
    let mem = Arc::new(MemDevice::new(block_size, blocks));
    Filesystem::format(&*mem, &FormatOptions::default()).expect("format");
    let fs = Filesystem::open(mem.clone(), FsOptions::default()).expect("mount");
    (mem, fs)
}

fn allocate(fs: &Filesystem, count: u32, hint: BlockNo) -> Result<Vec<BlockNo>, FsError> {
    let mut handle = fs.journal().begin(8)?;
    let result = fs.allocator().allocate(&mut handle, count, hint);
    handle.end()?;
    result
}

fn free(fs: &Filesystem, blocks: &[BlockNo]) {
    let mut handle = fs.journal().begin(8).unwrap();
    for block in blocks {
        fs.allocator().free(&mut handle, *block).unwrap();
    }
    handle.end().unwrap();
}

#[test]
fn allocate_free_allocate_restores_the_bitmap() {
    let (mem, fs) = mounted(512, 8192);
    let start = fs.allocator().free_blocks();
    let hint = BlockNo(3000);

    let first = allocate(&fs, 40, hint).unwrap();
    assert_eq!(first.len(), 40);
    assert_eq!(first[0], hint, "scan starts at the hint");
    assert!(first.windows(2).all(|w| w[0] < w[1]));
    assert!(first.iter().all(|b| fs.allocator().is_allocated(*b)));
    assert_eq!(fs.allocator().free_blocks(), start - 40);

    free(&fs, &first);
    assert_eq!(fs.allocator().free_blocks(), start);
    assert!(first.iter().all(|b| !fs.allocator().is_allocated(*b)));

    let second = allocate(&fs, 40, hint).unwrap();
    assert_eq!(first, second);
    free(&fs, &second);
    fs.close().unwrap();

    let report = verify_device(&*mem, VerifyLevel::Full).unwrap();
    assert!(report.success, "{:?}", report.findings);
    assert!(report.findings.is_empty(), "{:?}", report.findings);
    assert_eq!(report.counts.free_blocks, u64::from(start));
}

#[test]
fn scan_wraps_past_the_end_of_the_device() {
    let (_mem, fs) = mounted(512, 8192);
    let blocks = allocate(&fs, 6, BlockNo(8189)).unwrap();
    assert_eq!(&blocks[..3], &[BlockNo(8189), BlockNo(8190), BlockNo(8191)]);
    assert!(blocks[3..].iter().all(|b| b.0 < 8189));
    fs.abandon();
}

#[test]
fn requests_beyond_free_space_grant_nothing() {
    let (_mem, fs) = mounted(512, 4096);
    let free_before = fs.allocator().free_blocks();
    let err = allocate(&fs, free_before + 1, BlockNo(0)).unwrap_err();
    assert!(matches!(err, FsError::NoSpace));
    assert_eq!(fs.allocator().free_blocks(), free_before);

    let all = allocate(&fs, free_before, BlockNo(0)).unwrap();
    assert_eq!(all.len() as u32, free_before);
    assert_eq!(fs.allocator().free_blocks(), 0);
    assert!(matches!(allocate(&fs, 1, BlockNo(0)), Err(FsError::NoSpace)));
    let f = fs.create(fs.root(), b"grow").unwrap();
    assert!(matches!(fs.append(f, &vec![1u8; 2048]), Err(FsError::NoSpace)));
    free(&fs, &all);
    fs.append(f, &vec![1u8; 2048]).unwrap();
    fs.close().unwrap();
}

#[test]
fn allocations_survive_a_crash_once_committed() {
    let (mem, fs) = mounted(1024, 4096);
    let kept = allocate(&fs, 5, BlockNo(2000)).unwrap();
    fs.commit().unwrap();
    let lost = allocate(&fs, 5, BlockNo(3000)).unwrap();
    fs.abandon();

    let fs = Filesystem::open(mem.clone(), FsOptions::default()).unwrap();
    assert!(kept.iter().all(|b| fs.allocator().is_allocated(*b)));
    assert!(lost.iter().all(|b| !fs.allocator().is_allocated(*b)));
    fs.close().unwrap();

    let report = verify_device(&*mem, VerifyLevel::Full).unwrap();
    assert!(report.success);
    assert_eq!(report.counts.unreachable_blocks, 5, "{:?}", report.findings);
}

#[test]
fn double_free_is_refused() {
    let (_mem, fs) = mounted(512, 4096);
    let blocks = allocate(&fs, 1, BlockNo(1000)).unwrap();
    free(&fs, &blocks);
    let mut handle = fs.journal().begin(2).unwrap();
    let err = fs.allocator().free(&mut handle, blocks[0]).unwrap_err();
    handle.end().unwrap();
    assert!(matches!(err, FsError::TreeInconsistent(_)));
    fs.abandon();
}

proptest! {
    #[test]
    fn bit_helpers_track_a_model(ops in proptest::collection::vec((0u32..256, any::<bool>()), 0..200)) {
        let mut bitmap = vec![0u8; 32];
        let mut model = [false; 256];
        for (bit, set) in ops {
            if set {
                bitmap_set(&mut bitmap, bit);
            } else {
                bitmap_clear(&mut bitmap, bit);
            }
            model[bit as usize] = set;
        }
        for (bit, expected) in model.iter().enumerate() {
            prop_assert_eq!(bitmap_get(&bitmap, bit as u32), *expected);
        }
        let free = model.iter().filter(|b| !**b).count() as u32;
        prop_assert_eq!(bitmap_count_free(&bitmap, 256), free);
        let free_prefix = model[..100].iter().filter(|b| !**b).count() as u32;
        prop_assert_eq!(bitmap_count_free(&bitmap, 100), free_prefix);
    }
}
