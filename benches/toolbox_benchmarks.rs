//! Hot-path benchmarks using Criterion
//!
//! Run with: cargo bench
//! Run specific: cargo bench -- checksum

use btrfs_toolbox::core::checksum::{self, ChecksumType};
use btrfs_toolbox::core::ebcache::ExtentBuffer;
use btrfs_toolbox::core::superblock::Superblock;
use btrfs_toolbox::core::tree::{Key, LeafBuilder};
use btrfs_toolbox::core::SUPER_INFO_OFFSET;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

// ============================================================================
// Checksum Benchmarks
// ============================================================================

fn checksum_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");
    let block = vec![0xA5u8; 16384];
    group.throughput(Throughput::Bytes(block.len() as u64));

    for csum in [
        ChecksumType::Crc32c,
        ChecksumType::XxHash64,
        ChecksumType::Sha256,
        ChecksumType::Blake2b,
    ] {
        group.bench_with_input(
            BenchmarkId::new("tree_block", format!("{:?}", csum)),
            &csum,
            |b, &csum| b.iter(|| black_box(checksum::compute_block_csum(csum, &block))),
        );
    }

    group.bench_function("name_hash", |b| {
        b.iter(|| black_box(checksum::name_hash(b"some-directory-entry-name")))
    });

    group.finish();
}

// ============================================================================
// Superblock Benchmarks
// ============================================================================

fn superblock_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("superblock");

    let mut sb = Superblock::new_empty();
    sb.set_csum_type(ChecksumType::Crc32c);
    sb.set_generation(100);
    sb.set_sizes(4096, 16384, 65536);
    sb.set_label("benchvol");
    let bytes = sb.serialize_for(SUPER_INFO_OFFSET).unwrap();

    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("parse_and_verify", |b| {
        b.iter(|| black_box(Superblock::parse(&bytes, SUPER_INFO_OFFSET).unwrap()))
    });
    group.bench_function("serialize", |b| {
        b.iter(|| black_box(sb.serialize_for(SUPER_INFO_OFFSET).unwrap()))
    });

    group.finish();
}

// ============================================================================
// Leaf Benchmarks
// ============================================================================

fn build_sample_leaf(items: u64) -> ExtentBuffer {
    let mut builder = LeafBuilder::new(0x500000, 16384, 5, 1);
    for i in 0..items {
        builder
            .add(Key::new(256 + i, 0x54, i), vec![0u8; 64])
            .unwrap();
    }
    let bytes = builder.build(&[0u8; 16], &[0u8; 16]).unwrap();
    ExtentBuffer::from_bytes(0x500000, bytes)
}

fn leaf_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("leaf");

    for items in [16u64, 64, 150] {
        let leaf = build_sample_leaf(items);
        group.bench_with_input(BenchmarkId::new("item_key_scan", items), &leaf, |b, leaf| {
            b.iter(|| {
                let mut last = Key::min();
                for slot in 0..leaf.nritems() as usize {
                    last = black_box(leaf.item_key(slot));
                }
                last
            })
        });
    }

    let leaf = build_sample_leaf(150);
    group.bench_function("item_data_copy", |b| {
        b.iter(|| black_box(leaf.item_data(75)))
    });
    group.bench_function("free_space", |b| {
        b.iter(|| black_box(leaf.leaf_free_space()))
    });

    group.finish();
}

// ============================================================================
// Key Benchmarks
// ============================================================================

fn key_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("key");

    let key = Key::new(0x1234_5678, 0x84, 0x9ABC_DEF0);
    let bytes = key.to_bytes();

    group.bench_function("to_bytes", |b| b.iter(|| black_box(key.to_bytes())));
    group.bench_function("from_bytes", |b| b.iter(|| black_box(Key::from_bytes(&bytes))));
    group.bench_function("compare", |b| {
        let other = Key::new(0x1234_5678, 0x84, 0x9ABC_DEF1);
        b.iter(|| black_box(key < other))
    });

    group.finish();
}

criterion_group!(
    benches,
    checksum_benchmarks,
    superblock_benchmarks,
    leaf_benchmarks,
    key_benchmarks
);
criterion_main!(benches);
