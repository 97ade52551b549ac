// Benchmark for schedule interpolation and the warmup-skip search
// Run with: cargo bench

use criterion::{Criterion, criterion_group, criterion_main};
use kiln_rs::kiln_shared::Schedule;
use std::hint::black_box;

fn long_schedule() -> Schedule {
    // 1000 alternating ramps and holds, one minute each.
    let pairs: Vec<(f64, f64)> = (0..1000)
        .map(|i| (i as f64 * 60.0, 70.0 + (i / 2) as f64 * 2.0))
        .collect();
    Schedule::from_pairs("long", &pairs).unwrap()
}

fn bench_interpolate(c: &mut Criterion) {
    let schedule = long_schedule();
    let end = schedule.duration();
    c.bench_function("interpolate 10k points over 1000-point schedule", |b| {
        b.iter(|| {
            let mut sum = 0.0;
            for i in 0..10_000 {
                sum += schedule.interpolate(black_box(i as f64 * end / 10_000.0));
            }
            sum
        });
    });
}

fn bench_find_time(c: &mut Criterion) {
    let schedule = long_schedule();
    c.bench_function("find_time_for_temperature near end", |b| {
        b.iter(|| schedule.find_time_for_temperature(black_box(1060.0), black_box(0.0)));
    });
}

criterion_group!(benches, bench_interpolate, bench_find_time);
criterion_main!(benches);
