// Criterion benchmarks for muxrpc-metrics
//
// Run benchmarks with:
//   cargo bench -p muxrpc-metrics
//
// For detailed output with plots:
//   cargo bench -p muxrpc-metrics -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use muxrpc_common::StatusCode;
use muxrpc_metrics::{MetricsConfig, MetricsRegistry};
use std::sync::Arc;
use std::time::Duration;

fn bench_record_call(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_call");
    let registry = MetricsRegistry::new();

    group.bench_function("single_method", |b| {
        b.iter(|| {
            registry.record_call(
                black_box("inventory.Lookup"),
                black_box(Duration::from_micros(420)),
                black_box(StatusCode::Ok),
            );
        });
    });

    let methods = ["a", "b", "c", "d", "e"];
    group.bench_function("five_methods", |b| {
        b.iter(|| {
            for method in &methods {
                registry.record_call(black_box(method), Duration::from_micros(80), StatusCode::Unavailable);
            }
        });
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for methods in [10usize, 100, 1000] {
        let registry = MetricsRegistry::with_config(MetricsConfig { max_methods: methods });
        for i in 0..methods * 10 {
            registry.record_call(
                &format!("method_{}", i % methods),
                Duration::from_micros(i as u64),
                StatusCode::ALL[i % StatusCode::ALL.len()],
            );
        }

        group.bench_with_input(BenchmarkId::from_parameter(methods), &registry, |b, registry| {
            b.iter(|| registry.snapshot());
        });
    }

    group.finish();
}

fn bench_concurrent_recording(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_recording");

    group.bench_function("four_threads", |b| {
        let registry = Arc::new(MetricsRegistry::new());
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let registry = registry.clone();
                    std::thread::spawn(move || {
                        for i in 0..250u64 {
                            registry.record_call(&format!("m{t}"), Duration::from_micros(i), StatusCode::Ok);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_record_call, bench_snapshot, bench_concurrent_recording);
criterion_main!(benches);
