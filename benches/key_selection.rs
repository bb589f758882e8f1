//! Benchmarks for the key selection algorithm.
//!
//! Run with: cargo bench --bench key_selection

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use llm_relay_rust::core::config::AppConfig;
use llm_relay_rust::core::families::{ModelFamily, Service};
use llm_relay_rust::services::KeyPool;

fn pool_with_keys(count: usize) -> KeyPool {
    let config = AppConfig {
        openai_keys: (0..count).map(|i| format!("sk-bench-{}", i)).collect(),
        ..AppConfig::default()
    };
    KeyPool::from_config(&config)
}

fn bench_key_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_selection");

    for key_count in [2, 5, 10, 50, 200].iter() {
        let pool = pool_with_keys(*key_count);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(key_count),
            key_count,
            |b, _| {
                b.iter(|| {
                    black_box(
                        pool.get(Service::Openai, ModelFamily::Turbo)
                            .expect("selection failed"),
                    );
                });
            },
        );
    }

    group.finish();
}

fn bench_selection_under_rate_limits(c: &mut Criterion) {
    let pool = pool_with_keys(50);
    // Half the pool is rate limited; selection must sort through it.
    for key in pool.list().iter().take(25) {
        pool.mark_rate_limited(&key.hash);
    }

    c.bench_function("key_selection_half_limited", |b| {
        b.iter(|| {
            black_box(
                pool.get(Service::Openai, ModelFamily::Turbo)
                    .expect("selection failed"),
            );
        });
    });
}

fn bench_lockout_period(c: &mut Criterion) {
    let pool = pool_with_keys(100);
    for key in pool.list() {
        pool.mark_rate_limited(&key.hash);
    }

    c.bench_function("lockout_period_all_limited", |b| {
        b.iter(|| {
            black_box(pool.lockout_period(Service::Openai, ModelFamily::Turbo));
        });
    });
}

criterion_group!(
    benches,
    bench_key_selection,
    bench_selection_under_rate_limits,
    bench_lockout_period
);
criterion_main!(benches);
