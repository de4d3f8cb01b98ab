#![allow(clippy::unwrap_used, clippy::expect_used, clippy::cast_possible_wrap)]
//! Work queue and future benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use distpool::queue::WorkQueue;
use distpool::task::{encode, Task};
use distpool::TaskFuture;

/// Benchmark push/pop cycles through the work queue
fn bench_queue_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_push_pop");

    for size in [100usize, 1_000, 10_000] {
        let tasks: Vec<Task> = (0..size)
            .map(|i| Task::function("noop").args(&(i as i64)).build().unwrap())
            .collect();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &tasks, |b, tasks| {
            b.iter(|| {
                let queue = WorkQueue::new();
                for task in tasks {
                    queue.push_work(TaskFuture::new(task.id()), task.copy());
                }
                while let Some(entry) = queue.pop() {
                    black_box(entry);
                }
            });
        });
    }
    group.finish();
}

/// Benchmark resolving futures and reading their value
fn bench_future_resolve(c: &mut Criterion) {
    let value = encode(&vec![1u64; 64]).unwrap();
    c.bench_function("future_resolve", |b| {
        b.iter(|| {
            let task = Task::function("noop").build().unwrap();
            let future = TaskFuture::new(task.id());
            future.set_result(black_box(value.clone())).unwrap();
            black_box(future.raw_result(None).unwrap());
        });
    });
}

criterion_group!(benches, bench_queue_push_pop, bench_future_resolve);
criterion_main!(benches);
