#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use balfs::admin::{verify_device, VerifyLevel};
use balfs::primitives::io::MemDevice;
use balfs::storage::key::{MAX_KEY, MIN_KEY};
use balfs::{Filesystem, FormatOptions, FsOptions, ObjectRef};
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

const BS: usize = 512;

fn fresh() -> (Arc<MemDevice>, Filesystem) {
    let mem = Arc::new(MemDevice::new(BS, 16_384));
    Filesystem::format(&*mem, &FormatOptions::default()).expect("format");
    let fs = Filesystem::open(mem.clone(), FsOptions::default()).expect("mount");
    (mem, fs)
}

/// Pushes everything to the home locations and runs the full checker.
fn check(mem: &MemDevice, fs: &Filesystem, step: &str) {
    fs.sync().expect("sync");
    let report = verify_device(mem, VerifyLevel::Full).expect("verify");
    assert!(report.success, "after {step}: {:?}", report.findings);
    assert_eq!(report.counts.unreachable_blocks, 0, "after {step}: {:?}", report.findings);
    let items = fs.tree().scan(&MIN_KEY, &MAX_KEY).expect("scan");
    assert_eq!(items.len() as u64, report.counts.items, "after {step}");
    for pair in items.windows(2) {
        assert!(pair[0].key < pair[1].key, "after {step}: {} !< {}", pair[0].key, pair[1].key);
    }
}

#[derive(Clone, Debug)]
enum Op {
    Create(u16),
    Remove(u16),
    Append(u16, usize),
    Truncate(u16, u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u16..64).prop_map(Op::Create),
        2 => (0u16..64).prop_map(Op::Remove),
        3 => ((0u16..64), (1usize..3000)).prop_map(|(n, len)| Op::Append(n, len)),
        1 => ((0u16..64), (0u64..5000)).prop_map(|(n, size)| Op::Truncate(n, size)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn random_operations_keep_the_tree_balanced(ops in proptest::collection::vec(op(), 1..40)) {
        let (mem, fs) = fresh();
        let mut model: BTreeMap<u16, (ObjectRef, Vec<u8>)> = BTreeMap::new();
        for (i, op) in ops.iter().enumerate() {
            match *op {
                Op::Create(n) => {
                    let name = format!("obj-{n}");
                    let result = fs.create(fs.root(), name.as_bytes());
                    if model.contains_key(&n) {
                        prop_assert!(result.is_err());
                    } else {
                        model.insert(n, (result.expect("create"), Vec::new()));
                    }
                }
                Op::Remove(n) => {
                    let name = format!("obj-{n}");
                    let result = fs.unlink(fs.root(), name.as_bytes());
                    prop_assert_eq!(result.is_ok(), model.remove(&n).is_some());
                }
                Op::Append(n, len) => {
                    if let Some((obj, body)) = model.get_mut(&n) {
                        let chunk: Vec<u8> = (0..len).map(|b| (b as u8) ^ (n as u8)).collect();
                        fs.append(*obj, &chunk).expect("append");
                        body.extend_from_slice(&chunk);
                    }
                }
                Op::Truncate(n, size) => {
                    if let Some((obj, body)) = model.get_mut(&n) {
                        fs.truncate(*obj, size).expect("truncate");
                        body.resize(size as usize, 0);
                    }
                }
            }
            check(&mem, &fs, &format!("step {i} {op:?}"));
        }

        let listed: Vec<String> = fs.readdir(fs.root()).unwrap().iter().map(|l| l.name_lossy()).collect();
        prop_assert_eq!(listed.len(), model.len());
        for (obj, body) in model.values() {
            prop_assert_eq!(&fs.read(*obj).unwrap(), body);
        }
    }
}

#[test]
fn shuffled_inserts_then_deletes_drain_back_to_one_leaf() {
    let (mem, fs) = fresh();
    let mut rng = ChaCha8Rng::seed_from_u64(0xBA1A);
    let dir = fs.mkdir(fs.root(), b"bulk").unwrap();
    let mut names: Vec<String> = (0..600).map(|i| format!("n{i:04}-{}", rng.gen::<u16>())).collect();
    names.shuffle(&mut rng);
    for (i, name) in names.iter().enumerate() {
        fs.create(dir, name.as_bytes()).unwrap();
        if i % 25 == 0 {
            check(&mem, &fs, &format!("insert {i}"));
        }
    }
    assert!(fs.tree().root().height >= 3, "600 entries should need three levels");
    check(&mem, &fs, "all inserted");

    let listing = fs.readdir(dir).unwrap();
    assert_eq!(listing.len(), names.len());
    for pair in listing.windows(2) {
        assert!(pair[0].offset < pair[1].offset);
    }

    names.shuffle(&mut rng);
    for (i, name) in names.iter().enumerate() {
        fs.unlink(dir, name.as_bytes()).unwrap();
        if i % 25 == 0 {
            check(&mem, &fs, &format!("delete {i}"));
        }
    }
    fs.rmdir(fs.root(), b"bulk").unwrap();
    check(&mem, &fs, "all deleted");
    assert_eq!(fs.tree().root().height, 1);
    assert_eq!(fs.tree().scan(&MIN_KEY, &MAX_KEY).unwrap().len(), 2);
}

#[test]
fn large_files_interleaved_with_small_ones() {
    let (mem, fs) = fresh();
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut files = Vec::new();
    for i in 0..30 {
        let obj = fs.create(fs.root(), format!("file{i}").as_bytes()).unwrap();
        let len = if i % 5 == 0 { 40_000 } else { rng.gen_range(0..700) };
        let mut body = vec![0u8; len];
        rng.fill_bytes(&mut body);
        fs.write_all(obj, &body).unwrap();
        files.push((obj, body));
    }
    check(&mem, &fs, "written");
    for (i, (obj, body)) in files.iter_mut().enumerate().filter(|(i, _)| i % 3 == 0) {
        let keep = body.len() / 2;
        fs.truncate(*obj, keep as u64).unwrap();
        body.truncate(keep);
        if i % 2 == 0 {
            fs.append(*obj, b"tail").unwrap();
            body.extend_from_slice(b"tail");
        }
    }
    check(&mem, &fs, "reshaped");
    for (obj, body) in &files {
        assert_eq!(&fs.read(*obj).unwrap(), body);
    }
}
