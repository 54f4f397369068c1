//! Micro benchmarks for directory and file operations on an in-memory volume.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::sync::Arc;

use balfs::primitives::io::MemDevice;
use balfs::storage::key::{MAX_KEY, MIN_KEY};
use balfs::{Filesystem, FormatOptions, FsOptions, ObjectRef};
use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

const BLOCK_SIZE: usize = 1024;
const BLOCKS: u32 = 16_384;
const ENTRY_COUNT: usize = 2_048;
const LOOKUP_SAMPLES: usize = 512;
const FILE_BYTES: usize = 256 * 1024;

fn micro_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/tree");
    group.sample_size(20);

    let names: Vec<String> = (0..ENTRY_COUNT).map(|i| format!("entry-{i:05}")).collect();
    let mut shuffled = names.clone();
    shuffled.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBA1F));

    group.throughput(Throughput::Elements(ENTRY_COUNT as u64));
    group.bench_function("sequential_create", |b| {
        b.iter_batched(
            Volume::new,
            |vol| {
                vol.create_all(&names);
                black_box(vol.fs.tree().root());
            },
            BatchSize::PerIteration,
        );
    });

    group.throughput(Throughput::Elements(ENTRY_COUNT as u64));
    group.bench_function("random_create", |b| {
        b.iter_batched(
            Volume::new,
            |vol| {
                vol.create_all(&shuffled);
                black_box(vol.fs.tree().root());
            },
            BatchSize::PerIteration,
        );
    });

    group.throughput(Throughput::Elements(ENTRY_COUNT as u64));
    group.bench_function("random_unlink", |b| {
        b.iter_batched(
            || {
                let vol = Volume::new();
                vol.create_all(&names);
                vol
            },
            |vol| {
                for name in &shuffled {
                    vol.fs.unlink(vol.fs.root(), name.as_bytes()).expect("unlink");
                }
                black_box(vol.fs.tree().root());
            },
            BatchSize::PerIteration,
        );
    });

    let loaded = Volume::new();
    loaded.create_all(&names);
    let samples: Vec<&String> = shuffled.iter().take(LOOKUP_SAMPLES).collect();
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("lookup", LOOKUP_SAMPLES), |b| {
        b.iter(|| {
            for name in &samples {
                black_box(loaded.fs.lookup(loaded.fs.root(), name.as_bytes()).expect("lookup"));
            }
        });
    });

    group.throughput(Throughput::Elements(ENTRY_COUNT as u64));
    group.bench_function("readdir", |b| {
        b.iter(|| black_box(loaded.fs.readdir(loaded.fs.root()).expect("readdir").len()));
    });

    group.bench_function("full_scan", |b| {
        b.iter(|| black_box(loaded.fs.tree().scan(&MIN_KEY, &MAX_KEY).expect("scan").len()));
    });

    let mut body = vec![0u8; FILE_BYTES];
    ChaCha8Rng::seed_from_u64(7).fill_bytes(&mut body);
    group.throughput(Throughput::Bytes(FILE_BYTES as u64));
    group.bench_function("write_file", |b| {
        b.iter_batched(
            Volume::new,
            |vol| {
                let obj = vol.file("blob");
                vol.fs.write_all(obj, &body).expect("write");
                black_box(vol.fs.stat(obj).expect("stat").size);
            },
            BatchSize::PerIteration,
        );
    });

    let blob = loaded.file("blob");
    loaded.fs.write_all(blob, &body).expect("write");
    group.throughput(Throughput::Bytes(FILE_BYTES as u64));
    group.bench_function("read_file", |b| {
        b.iter(|| black_box(loaded.fs.read(blob).expect("read").len()));
    });

    group.finish();
}

struct Volume {
    fs: Filesystem,
}

impl Volume {
    fn new() -> Self {
        let mem = Arc::new(MemDevice::new(BLOCK_SIZE, BLOCKS));
        Filesystem::format(&*mem, &FormatOptions::default()).expect("format");
        let fs = Filesystem::open(mem, FsOptions::default()).expect("mount");
        Self { fs }
    }

    fn create_all(&self, names: &[String]) {
        for name in names {
            self.fs.create(self.fs.root(), name.as_bytes()).expect("create");
        }
    }

    fn file(&self, name: &str) -> ObjectRef {
        self.fs.create(self.fs.root(), name.as_bytes()).expect("create")
    }
}

criterion_group!(benches, micro_tree);
criterion_main!(benches);
