//! Allocator benchmarks: routing overhead, cache-hit frees, tensor paths.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;

use tinyinfer_memory::config::{PoolConfig, UsagePattern};
use tinyinfer_memory::hierarchy::HierarchicalPool;
use tinyinfer_memory::tensor::{SimdPolicy, TensorAllocator};
use tinyinfer_memory::thread_safe::ThreadSafePool;

fn bench_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("hierarchical_pool");

    for size in [64usize, 1024, 16 * 1024] {
        group.bench_function(format!("alloc_free_{size}"), |b| {
            let mut pool = HierarchicalPool::new(PoolConfig::production()).unwrap();
            b.iter(|| {
                let ptr = pool
                    .alloc(black_box(size), 16, UsagePattern::General)
                    .unwrap();
                pool.free(ptr).unwrap();
            });
        });
    }

    group.bench_function("free_via_scan", |b| {
        // Cache capacity zero forces the exhaustive-scan fallback.
        let mut config = PoolConfig::production();
        config.alloc_cache_capacity = 0;
        let mut pool = HierarchicalPool::new(config).unwrap();
        b.iter(|| {
            let ptr = pool.alloc(1024, 16, UsagePattern::General).unwrap();
            pool.free(ptr).unwrap();
        });
    });

    group.finish();
}

fn bench_tensor_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("tensor_allocator");

    let pool = Arc::new(ThreadSafePool::new(PoolConfig::production()).unwrap());
    let alloc = TensorAllocator::new(pool, SimdPolicy::new(true));

    group.bench_function("weights_4bit_256x256", |b| {
        b.iter(|| {
            let ptr = alloc.alloc_weights_4bit(black_box(256), 256).unwrap();
            alloc.free(ptr).unwrap();
        });
    });

    group.bench_function("activations_4096", |b| {
        b.iter(|| {
            let ptr = alloc.alloc_activations(black_box(4096)).unwrap();
            alloc.free(ptr).unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free, bench_tensor_paths);
criterion_main!(benches);
