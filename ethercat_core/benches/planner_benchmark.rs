//! Planner step benchmark — measure the jerk-limited generator's per-tick
//! cost, the compute-intensive portion of Cyclic Worker step 6 (§4.1).

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use ethercat_core::planner::{Limits, SCurvePlanner, TrajectoryGenerator};

fn reference_limits() -> Limits {
    Limits { max_velocity: 200_000.0, max_acceleration: 400_000.0, max_jerk: 4_000_000.0 }
}

fn step_n(planner: &mut SCurvePlanner, n: usize) {
    let mut actual_position = 0.0;
    let mut actual_velocity = 0.0;
    for _ in 0..n {
        if let Some(step) = planner.step(actual_position, actual_velocity) {
            actual_position = step.position;
            actual_velocity = step.velocity;
        }
    }
}

fn bench_position_move(c: &mut Criterion) {
    let mut group = c.benchmark_group("planner_position_move");
    for steps in [1usize, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(steps), &steps, |b, &steps| {
            b.iter(|| {
                let mut planner = SCurvePlanner::new();
                planner.start_position(0.0, 0.0, 1_000_000.0, reference_limits(), 0.005).unwrap();
                step_n(&mut planner, steps);
            });
        });
    }
    group.finish();
}

fn bench_velocity_hold(c: &mut Criterion) {
    let mut group = c.benchmark_group("planner_velocity_hold");
    for steps in [1usize, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(steps), &steps, |b, &steps| {
            b.iter(|| {
                let mut planner = SCurvePlanner::new();
                planner.start_velocity(0.0, 0.0, 50_000.0, reference_limits(), 0.005, 0.1).unwrap();
                step_n(&mut planner, steps);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_position_move, bench_velocity_hold);
criterion_main!(benches);
