use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use strand::{Strategy, Task, ThreadPool};

const WORKERS: u32 = 4;

fn pool(strategy: Strategy) -> ThreadPool {
    ThreadPool::builder()
        .with_worker_threads(WORKERS)
        .with_strategy(strategy)
        .build()
        .unwrap()
}

fn independent_tasks(c: &mut Criterion) {
    let mut group = c.benchmark_group("independent tasks");
    for strategy in [Strategy::Sharing, Strategy::Stealing] {
        let pool = pool(strategy);
        group.bench_with_input(BenchmarkId::from_parameter(format!("{:?}", strategy)), &1024u64, |b, &n| {
            b.iter(|| {
                let tasks: Vec<Task<u64>> = (0..n)
                    .map(|i| pool.enqueue(move || black_box(i).wrapping_mul(i)))
                    .collect();

                for task in &tasks {
                    task.wait();
                }
            })
        });
    }
    group.finish();
}

fn continuation_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("continuation chain");
    for strategy in [Strategy::Sharing, Strategy::Stealing] {
        let pool = pool(strategy);
        group.bench_with_input(BenchmarkId::from_parameter(format!("{:?}", strategy)), &256usize, |b, &n| {
            b.iter(|| {
                let mut task = pool.enqueue(|| 0usize);
                for _ in 0..n {
                    task = task.continue_with(|v| black_box(v + 1));
                }

                task.wait();
                assert_eq!(task.result().unwrap(), n);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, independent_tasks, continuation_chain);
criterion_main!(benches);
