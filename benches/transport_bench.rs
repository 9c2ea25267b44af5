//! Benchmarks for the admission and question-size-estimator hot paths.
//!
//! These run on every query regardless of upstream transport, so they're
//! benchmarked independent of any real network exchange.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use dnscrypt_relay::admission::Admission;
use dnscrypt_relay::estimator::QuestionSizeEstimator;

fn bench_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission");
    group.throughput(Throughput::Elements(1));

    group.bench_function(BenchmarkId::new("try_acquire", "uncontended"), |b| {
        let admission = Admission::new(1_000_000);
        b.iter(|| {
            let guard = admission.try_acquire();
            drop(guard);
        });
    });

    group.bench_function(BenchmarkId::new("try_acquire", "at_capacity"), |b| {
        let admission = Admission::new(1);
        let _held = admission.try_acquire().unwrap();
        b.iter(|| {
            let guard = admission.try_acquire();
            debug_assert!(guard.is_none());
        });
    });

    group.finish();
}

fn bench_estimator(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimator");

    group.bench_function("adjust", |b| {
        let estimator = QuestionSizeEstimator::new();
        let mut observed = 256usize;
        b.iter(|| {
            estimator.adjust(observed);
            observed = observed.wrapping_add(7) % 4096 + 256;
        });
    });

    group.bench_function("blind_adjust", |b| {
        let estimator = QuestionSizeEstimator::new();
        b.iter(|| estimator.blind_adjust());
    });

    group.bench_function("current", |b| {
        let estimator = QuestionSizeEstimator::new();
        b.iter(|| estimator.current());
    });

    group.finish();
}

criterion_group!(benches, bench_admission, bench_estimator);
criterion_main!(benches);
