//! Reporting performance benchmarks
//!
//! Write fan-out, filter key hashing and retainer range reads.

#![allow(clippy::unwrap_used)] // Benchmarks are allowed to use unwrap for simplicity
#![allow(clippy::expect_used)] // Benchmarks are allowed to use expect for simplicity
#![allow(clippy::default_numeric_fallback)] // Benchmark data can have default numeric types

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;
use tokio::runtime::Runtime;

use tallyio_reporting::{
    filter_values, keys, DataPoint, Granularity, Reporting, ReportingConfig, StoreBackend,
};

fn create_bench_reporting(rt: &Runtime, backend: StoreBackend) -> Reporting {
    let mut config = ReportingConfig::default();
    config.store.backend = backend;
    let reporting = rt.block_on(Reporting::new(config)).unwrap();
    reporting.add_filter("custom", &["mode"]).unwrap();
    reporting.add_metric("value", &["sum", "diff", "max"]).unwrap();
    reporting
        .enable_retainer(Granularity::Second, "value", &["sum"])
        .unwrap();
    reporting
        .enable_retainer(Granularity::Minute, "value", &["sum", "max"])
        .unwrap();
    reporting
}

/// Benchmark one save call per backend
fn bench_save(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("save");
    group.measurement_time(Duration::from_secs(10));

    for backend in [StoreBackend::Memory, StoreBackend::Redb] {
        let reporting = create_bench_reporting(&rt, backend);
        group.bench_with_input(
            BenchmarkId::new("single_point", format!("{backend:?}")),
            &reporting,
            |b, reporting| {
                b.iter(|| {
                    let point = DataPoint::new().with("value", 5).with("mode", "mobile");
                    black_box(rt.block_on(reporting.save_metric(point)).unwrap());
                });
            },
        );
    }

    let reporting = create_bench_reporting(&rt, StoreBackend::Memory);
    for batch_size in [10, 100] {
        group.bench_with_input(
            BenchmarkId::new("batch", batch_size),
            &batch_size,
            |b, &batch_size| {
                b.iter(|| {
                    let points = (0..batch_size)
                        .map(|i| DataPoint::new().with("value", i).with("mode", i % 4));
                    black_box(rt.block_on(reporting.save_metrics(points)).unwrap());
                });
            },
        );
    }
    group.finish();
}

/// Benchmark filter key derivation
fn bench_filter_key(c: &mut Criterion) {
    let registry = create_bench_reporting(&Runtime::new().unwrap(), StoreBackend::Memory).registry();
    let filter = registry.filter("custom").unwrap().clone();
    let values = filter_values([("mode", "mobile")]);

    c.bench_function("filter_key", |b| {
        b.iter(|| black_box(keys::filter_key(&filter, &values).unwrap()));
    });
}

/// Benchmark zero-filled retainer reads
fn bench_range_read(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let reporting = create_bench_reporting(&rt, StoreBackend::Memory);
    let start = Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap();
    let points = (0..3_600).map(|i| DataPoint::new().with("value", i).at(start + ChronoDuration::seconds(i64::from(i))));
    rt.block_on(reporting.save_metrics(points)).unwrap();

    let mut group = c.benchmark_group("range_read");
    for (granularity, span) in [(Granularity::Second, 3_600), (Granularity::Minute, 60)] {
        let end = start + ChronoDuration::seconds(span * granularity.duration_secs() - 1);
        group.bench_function(BenchmarkId::new("values_as_object", granularity), |b| {
            b.iter(|| {
                let query = reporting
                    .filter()
                    .sum("value")
                    .during(granularity)
                    .range(start, end);
                black_box(rt.block_on(query.values_as_object(true)).unwrap());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_save, bench_filter_key, bench_range_read);
criterion_main!(benches);
