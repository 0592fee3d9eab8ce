//! Benchmarks for build history maintenance
//!
//! This benchmark suite measures performance of:
//! - Pruning history to the configured cap
//! - Folding finished builds into analytics
//!
//! Run with: cargo bench --bench history_prune

use chrono::{DateTime, TimeDelta, Utc};
use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::time::Duration;
use unreal_builder::models::{BuildAnalytics, BuildRecord, prune_history};

fn history(len: usize) -> Vec<BuildRecord> {
    let epoch = DateTime::<Utc>::default();
    (0..len)
        .map(|i| {
            let mut record = BuildRecord::queued(format!("project-{}", i % 7), None);
            let started = epoch + TimeDelta::seconds(i as i64 * 60);
            // Every tenth record is still waiting in the queue
            if i % 10 != 0 {
                record
                    .mark_building(started, vec!["Win64".to_string()])
                    .unwrap_or_default();
                record
                    .mark_finished(i % 3 != 0, started + TimeDelta::seconds(45), String::new())
                    .unwrap_or_default();
            }
            record
        })
        .collect()
}

fn bench_prune_history(c: &mut Criterion) {
    let mut group = c.benchmark_group("prune_history");
    for len in [50usize, 500, 5000] {
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            b.iter_batched(
                || history(len),
                |mut records| {
                    prune_history(&mut records, 20);
                    black_box(records)
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_record_build(c: &mut Criterion) {
    let platforms = vec!["Win64".to_string(), "Linux".to_string(), "Mac".to_string()];

    c.bench_function("analytics_record_build", |b| {
        let mut analytics = BuildAnalytics::default();
        b.iter(|| {
            analytics.record_build(black_box(Duration::from_secs(42)), true, &platforms);
        });
    });
}

criterion_group!(benches, bench_prune_history, bench_record_build);
criterion_main!(benches);
