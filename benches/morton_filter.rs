extern crate morton_filter;

use morton_filter::filter::morton::MortonFilter;
use morton_filter::filter::Filter;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn insert_n(n: u64, blocks: usize) -> MortonFilter {
    let mut filter = MortonFilter::with_seed(blocks, 1337).expect("valid geometry");
    (0..n).for_each(|key| {
        filter
            .insert(format!("item{}", key).as_bytes())
            .expect("benchmark filter overfull");
    });
    filter
}

// ~80% fill rate at 46 fingerprints per block
fn blocks_for(n: u64) -> usize {
    (n as usize * 10 / 8) / 46 + 1
}

fn contains(f: &dyn Filter) -> bool {
    f.contains(b"item0")
}

fn insert_bench_vary_n(c: &mut Criterion) {
    let mut group = c.benchmark_group("morton::insert_varying_size");
    for n in [10_000, 100_000, 1_000_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| insert_n(n, blocks_for(n)))
        });
    }
}

fn contains_bench_vary_n(c: &mut Criterion) {
    let mut group = c.benchmark_group("morton::contains_varying_n");
    for n in [10_000, 100_000, 1_000_000] {
        // precompute filter outside of the contains benchmark
        let filter = insert_n(n, blocks_for(n));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &_| {
            b.iter(|| contains(black_box(&filter)))
        });
    }
}

fn serialize_bench_vary_n(c: &mut Criterion) {
    let mut group = c.benchmark_group("morton::serialize_varying_n");
    for n in [10_000, 100_000] {
        let filter = insert_n(n, blocks_for(n));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &_| {
            b.iter(|| black_box(&filter).serialize())
        });
    }
}

criterion_group!(
    benches,
    insert_bench_vary_n,
    contains_bench_vary_n,
    serialize_bench_vary_n
);

criterion_main!(benches);
