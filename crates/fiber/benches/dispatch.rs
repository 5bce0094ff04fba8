use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fiber::{Fiber, FiberConfig, Mode};
use std::time::Duration;

fn create_fiber() -> Fiber {
    Fiber::with_config(FiberConfig {
        worker_threads: 4,
        async_threads: 2,
        ..FiberConfig::default()
    })
    .unwrap()
}

fn bench_single_job(c: &mut Criterion) {
    let fiber = create_fiber();
    let mut group = c.benchmark_group("round_trip");

    for mode in [Mode::Exclusive, Mode::Concurrent] {
        group.bench_with_input(BenchmarkId::new("enqueue", mode), &mode, |b, &mode| {
            b.iter(|| fiber.enqueue(mode, || black_box(1)).wait().unwrap());
        });
    }

    group.bench_function("enqueue_async", |b| {
        b.iter(|| {
            fiber
                .enqueue_async(Mode::Exclusive, || async { black_box(1) })
                .wait()
                .unwrap()
        });
    });

    group.finish();
}

fn bench_batches(c: &mut Criterion) {
    let fiber = create_fiber();
    let mut group = c.benchmark_group("batch");

    for size in [16usize, 256, 1024] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("concurrent", size), &size, |b, &size| {
            b.iter(|| {
                for i in 0..size {
                    let _ = fiber.enqueue(Mode::Concurrent, move || black_box(i));
                }
                fiber.wait_idle(Duration::from_secs(10))
            });
        });

        group.bench_with_input(BenchmarkId::new("mixed", size), &size, |b, &size| {
            b.iter(|| {
                for i in 0..size {
                    let mode = if i % 8 == 0 {
                        Mode::Exclusive
                    } else {
                        Mode::Concurrent
                    };
                    let _ = fiber.enqueue(mode, move || black_box(i));
                }
                fiber.wait_idle(Duration::from_secs(10))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_single_job, bench_batches);
criterion_main!(benches);
