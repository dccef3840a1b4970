//! Attribution hot-path benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use heapscope_bench::{engine_with_blocks, ROOT};

fn bench_cached_access(c: &mut Criterion) {
    let counts: &[usize] = &[16, 256, 4096];
    let mut group = c.benchmark_group("cached_access");

    for &count in counts {
        group.bench_with_input(BenchmarkId::new("read", count), &count, |b, &n| {
            let (mut prof, addrs) = engine_with_blocks(n, 64);
            // Warm the cache once; after that every access is a fast path.
            for &addr in &addrs {
                prof.on_read(ROOT, addr, 1);
            }
            let mut i = 0;
            b.iter(|| {
                let addr = addrs[i % addrs.len()];
                prof.on_read(ROOT, black_box(addr + 8), 4);
                i += 1;
            });
        });
    }
    group.finish();
}

fn bench_cold_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold_resolve");

    group.bench_function("first_touch_4096_blocks", |b| {
        b.iter_batched(
            || engine_with_blocks(4096, 64),
            |(mut prof, addrs)| {
                for &addr in &addrs {
                    prof.on_write(ROOT, black_box(addr), 8);
                }
            },
            criterion::BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[u64] = &[16, 256, 4096];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("engine", size), &size, |b, &sz| {
            let (mut prof, _) = engine_with_blocks(0, 0);
            b.iter(|| {
                let addr = prof.client_malloc(ROOT, black_box(sz)).unwrap();
                prof.on_write(ROOT, addr, sz);
                prof.client_free(ROOT, addr);
                prof.prune_cache(ROOT, false);
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_cached_access,
    bench_cold_resolve,
    bench_alloc_free_cycle
);
criterion_main!(benches);
