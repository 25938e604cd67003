//! Criterion benchmarks for the timer task scheduler
//!
//! Measures:
//! - Interrupt servicing cost with a growing task table
//! - Schedule/dispatch/terminate churn

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use soundscape_core::domain::{ManualTimingSource, Scheduler, TaskContext, DEFAULT_CAPACITY};
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn bench_interrupt_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("interrupt_service");

    for task_count in [1usize, 2, 4, DEFAULT_CAPACITY] {
        let clock = ManualTimingSource::new();
        let mut scheduler = Scheduler::new(clock.clone());
        let hits = Arc::new(AtomicU64::new(0));

        for i in 0..task_count {
            let hits = Arc::clone(&hits);
            let rate = 35 * (i as u32 + 1);
            if let Err(e) = scheduler.schedule_at_rate(
                move |_: &TaskContext| {
                    hits.fetch_add(1, Ordering::Relaxed);
                },
                rate,
                i as i32,
            ) {
                panic!("schedule failed: {}", e);
            }
        }
        if let Err(e) = scheduler.dispatch() {
            panic!("dispatch failed: {}", e);
        }

        group.bench_with_input(BenchmarkId::from_parameter(task_count), &task_count, |b, _| {
            b.iter(|| black_box(clock.fire()))
        });

        scheduler.shutdown();
    }

    group.finish();
}

fn bench_schedule_churn(c: &mut Criterion) {
    let mut scheduler = Scheduler::new(ManualTimingSource::new());

    c.bench_function("schedule_dispatch_terminate", |b| {
        b.iter(|| {
            let handle = match scheduler.schedule_at_rate(|_: &TaskContext| {}, black_box(140), 0) {
                Ok(handle) => handle,
                Err(e) => panic!("schedule failed: {}", e),
            };
            if let Err(e) = scheduler.dispatch() {
                panic!("dispatch failed: {}", e);
            }
            black_box(scheduler.terminate(&handle))
        })
    });
}

criterion_group!(benches, bench_interrupt_scaling, bench_schedule_churn);
criterion_main!(benches);
