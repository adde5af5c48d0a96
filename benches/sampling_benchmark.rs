//! Reservoir sampling throughput for typical quota sizes.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use qa_harvester_lib::sampling::Reservoir;

fn bench_reservoir(c: &mut Criterion) {
    let mut group = c.benchmark_group("reservoir_offer");
    for &(population, sample) in &[(1_000usize, 10usize), (100_000, 100), (100_000, 5_000)] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{population}/{sample}")),
            &(population, sample),
            |b, &(population, sample)| {
                b.iter(|| {
                    let mut rng = fastrand::Rng::with_seed(42);
                    let mut reservoir = Reservoir::new(sample);
                    for n in 0..population {
                        reservoir.offer(black_box(n), &mut rng);
                    }
                    black_box(reservoir.into_items())
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_reservoir);
criterion_main!(benches);
