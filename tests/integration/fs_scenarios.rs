#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use balfs::admin::{verify, VerifyLevel};
use balfs::storage::item::ItemBody;
use balfs::storage::key::Key;
use balfs::storage::node::Node;
use balfs::{Filesystem, FormatOptions, FsError, FsOptions, ObjectRef};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::{tempdir, TempDir};

fn image(block_size: usize, blocks: u32) -> (TempDir, PathBuf) {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("scenario.img");
    let opts = FormatOptions {
        block_size,
        block_count: blocks,
        ..FormatOptions::default()
    };
    Filesystem::create_image(&path, &opts).expect("format");
    (dir, path)
}

fn mount(path: &Path) -> Filesystem {
    Filesystem::open_image(path, FsOptions::default()).expect("mount")
}

fn assert_clean(path: &Path) {
    let report = verify(path, VerifyLevel::Full).expect("verify");
    assert!(report.success, "verify findings: {:?}", report.findings);
    assert_eq!(report.counts.unreachable_blocks, 0, "{:?}", report.findings);
}

fn node(fs: &Filesystem, block: balfs::BlockNo) -> Node {
    let buf = fs.cache().get(block).expect("read node");
    let data = buf.data();
    Node::decode(&data).expect("decode node")
}

#[test]
fn foo_with_abc_on_a_4k_volume() {
    let (_dir, path) = image(4096, 10_000);
    let fs = mount(&path);
    let foo = fs.create(fs.root(), b"foo").unwrap();
    fs.append(foo, b"abc").unwrap();

    let items = fs
        .tree()
        .scan(&Key::stat_data(foo.dir_id, foo.object_id), &Key::stat_data(foo.dir_id, foo.object_id + 1))
        .unwrap();
    assert_eq!(items.len(), 2, "stat data and one direct item");
    match &items[1].body {
        ItemBody::Direct(bytes) => assert_eq!(bytes, b"abc"),
        other => panic!("expected a direct item, found {other:?}"),
    }
    assert_eq!(items[1].key, Key::direct(foo.dir_id, foo.object_id, 1));
    fs.close().unwrap();

    assert_clean(&path);
    let fs = mount(&path);
    let foo = fs.resolve("/foo").unwrap();
    assert_eq!(fs.read(foo).unwrap(), b"abc");
    let listing = fs.readdir(fs.root()).unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, b"foo");
    fs.close().unwrap();
}

#[test]
fn overflowing_directory_splits_with_bracketing_keys() {
    let (_dir, path) = image(512, 4096);
    let fs = mount(&path);
    let mut created = 0;
    while fs.tree().root().height == 1 {
        fs.create(fs.root(), format!("entry-{created:03}").as_bytes()).unwrap();
        created += 1;
        assert!(created < 200, "root leaf never split");
    }

    let root = fs.tree().root();
    let Node::Internal(top) = node(&fs, root.block) else {
        panic!("root should be internal after the split");
    };
    assert_eq!(top.children.len(), 2);
    assert_eq!(top.keys.len(), 1);
    let split = top.keys[0];
    let (Node::Leaf(left), Node::Leaf(right)) = (
        node(&fs, top.children[0].block),
        node(&fs, top.children[1].block),
    ) else {
        panic!("children should be leaves");
    };
    let last_left = left.items.last().unwrap().key;
    let first_right = right.items.first().unwrap().key;
    assert!(last_left < split);
    assert_eq!(first_right, split);
    assert_eq!(left.rdkey, split);

    let names: Vec<String> = fs.readdir(fs.root()).unwrap().iter().map(|l| l.name_lossy()).collect();
    assert_eq!(names.len(), created);
    for i in 0..created {
        fs.lookup(fs.root(), format!("entry-{i:03}").as_bytes()).unwrap();
    }
    fs.close().unwrap();
    assert_clean(&path);
}

#[test]
fn nested_tree_with_mixed_file_sizes() {
    let (_dir, path) = image(1024, 8192);
    let fs = mount(&path);
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    let mut expected: Vec<(String, Vec<u8>)> = Vec::new();
    for d in 0..4 {
        let dir = fs.mkdir(fs.root(), format!("d{d}").as_bytes()).unwrap();
        let sub = fs.mkdir(dir, b"sub").unwrap();
        for f in 0..6 {
            let len = [0usize, 7, 500, 1024, 1500, 20_000][f];
            let mut body = vec![0u8; len];
            rng.fill_bytes(&mut body);
            let target = if f % 2 == 0 { dir } else { sub };
            let obj = fs.create(target, format!("f{f}").as_bytes()).unwrap();
            fs.write_all(obj, &body).unwrap();
            let prefix = if f % 2 == 0 { format!("/d{d}") } else { format!("/d{d}/sub") };
            expected.push((format!("{prefix}/f{f}"), body));
        }
    }
    fs.close().unwrap();
    assert_clean(&path);

    let fs = mount(&path);
    for (name, body) in &expected {
        let obj = fs.resolve(name).unwrap();
        assert_eq!(&fs.read(obj).unwrap(), body, "{name}");
        assert_eq!(fs.stat(obj).unwrap().size, body.len() as u64);
    }
    assert_eq!(fs.resolve("/d2/sub/..").unwrap(), fs.resolve("/d2").unwrap());

    for (name, _) in expected.iter().filter(|(n, _)| n.starts_with("/d1")) {
        let (parent, leaf) = name.rsplit_once('/').unwrap();
        let parent = fs.resolve(parent).unwrap();
        fs.unlink(parent, leaf.as_bytes()).unwrap();
    }
    let d1 = fs.resolve("/d1").unwrap();
    fs.rmdir(d1, b"sub").unwrap();
    fs.rmdir(fs.root(), b"d1").unwrap();
    assert!(matches!(fs.resolve("/d1"), Err(FsError::NotFound)));
    fs.close().unwrap();
    assert_clean(&path);
}

#[test]
fn space_runs_out_cleanly() {
    let (_dir, path) = image(512, 600);
    let fs = mount(&path);
    let big = fs.create(fs.root(), b"big").unwrap();
    let chunk = vec![0xEEu8; 8 * 512];
    let mut written = 0u64;
    let err = loop {
        match fs.append(big, &chunk) {
            Ok(size) => written = size,
            Err(err) => break err,
        }
        assert!(written < 600 * 512, "device never filled up");
    };
    assert!(matches!(err, FsError::NoSpace), "unexpected error {err}");
    let body = fs.read(big).unwrap();
    assert_eq!(fs.stat(big).unwrap().size, written);
    assert_eq!(body.len() as u64, written);
    assert!(body.iter().all(|b| *b == 0xEE));

    let free = fs.allocator().free_blocks();
    let small = fs.create(fs.root(), b"small").unwrap();
    fs.write_all(small, b"kept").unwrap();
    let free_before = fs.allocator().free_blocks();
    assert!(free_before <= free);
    let err = fs.write_all(small, &vec![0x11u8; 600 * 512]).unwrap_err();
    assert!(matches!(err, FsError::NoSpace), "unexpected error {err}");
    assert_eq!(fs.read(small).unwrap(), b"kept");
    assert_eq!(fs.allocator().free_blocks(), free_before);
    fs.unlink(fs.root(), b"small").unwrap();
    fs.unlink(fs.root(), b"big").unwrap();
    let again = fs.create(fs.root(), b"again").unwrap();
    fs.append(again, &chunk).unwrap();
    fs.close().unwrap();
    assert_clean(&path);
}

#[test]
fn root_handle_is_stable() {
    let (_dir, path) = image(4096, 2048);
    let fs = mount(&path);
    assert_eq!(fs.root(), ObjectRef::ROOT);
    assert_eq!(fs.resolve("/").unwrap(), ObjectRef::ROOT);
    assert_eq!(fs.resolve("/..").unwrap(), ObjectRef::ROOT);
    fs.close().unwrap();
}
