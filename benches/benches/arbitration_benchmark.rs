//! Criterion benchmarks for sound card arbitration
//!
//! Measures:
//! - Predicate table evaluation
//! - Activation plan construction over every device pair
//! - A full arbitration pass against simulated cards

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use soundscape_benchmarks::{all_device_pairs, configuration, representative_pairs, responsive_registry};
use soundscape_core::domain::{ActivationPlan, DeviceId, Overrides, PredicateTable, Resolver};
use soundscape_infra::MemoryResources;
use std::hint::black_box;

fn bench_predicate_table(c: &mut Criterion) {
    c.bench_function("predicate_table", |b| {
        b.iter(|| PredicateTable::evaluate(black_box(DeviceId::Cms), black_box(DeviceId::Gus)))
    });
}

fn bench_plan_all_pairs(c: &mut Criterion) {
    let pairs = all_device_pairs();
    let configs: Vec<_> = pairs
        .iter()
        .map(|(sfx, music)| (*sfx, *music, configuration(*sfx, *music)))
        .collect();

    c.bench_function("plan_all_pairs", |b| {
        b.iter(|| {
            for (sfx, music, config) in &configs {
                black_box(ActivationPlan::build(*sfx, *music, config));
            }
        })
    });
}

fn bench_arbitrate(c: &mut Criterion) {
    let mut group = c.benchmark_group("arbitrate");

    for (name, sfx, music) in representative_pairs() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &(sfx, music), |b, &(sfx, music)| {
            b.iter_batched(
                || {
                    (
                        responsive_registry(),
                        MemoryResources::with_default_patches(),
                        configuration(sfx, music),
                    )
                },
                |(mut registry, mut resources, mut config)| {
                    let report = Resolver::new(&mut registry, &mut resources)
                        .arbitrate(&mut config, Overrides::default());
                    black_box(report.is_ok())
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_predicate_table, bench_plan_all_pairs, bench_arbitrate);
criterion_main!(benches);
