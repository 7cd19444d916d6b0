//! Benchmarks for the hot paths of one `explore()` call: race computation
//! over a recorded log, backtrack-set computation during `finish_execution`,
//! and scheduler token handoff across worker threads.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use schedcheck::clock::ClockSource;
use schedcheck::event::{CallSite, Event, EventKind, EventLog, ThreadId, WriteOrigin};
use schedcheck::key::{ContainerId, ObjectKey};
use schedcheck::observed::ObservedLock;
use schedcheck::race::RaceDetector;
use schedcheck::scheduler::{CooperativeScheduler, SchedulerSession};
use schedcheck::{explore, ExploreOptions};
use std::sync::Arc;

/// Build a log of `n` alternating reads and writes from two threads on the
/// same key, worst-case shape for `RaceDetector` (every pair conflicts).
fn racy_log(n: usize) -> EventLog {
    let log = EventLog::new();
    let clock = ClockSource::new();
    let container = ContainerId(1);
    let key = ObjectKey::attr(container, "value");
    for i in 0..n {
        log.push(Event {
            kind: EventKind::Write,
            key: key.clone(),
            thread: ThreadId(i % 2),
            clock: clock.tick(),
            site: CallSite::new("bench.rs", 1, "bench"),
            write_origin: Some(WriteOrigin::Instrumented),
            irregular: false,
        });
    }
    log
}

fn bench_race_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("race_detection");
    for size in [10usize, 100, 500] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let log = racy_log(size);
            b.iter(|| {
                let races = RaceDetector::new().races(&log);
                black_box(races.len());
            });
        });
    }
    group.finish();
}

fn bench_full_exploration(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_exploration");
    for workers in [2usize, 3, 4] {
        group.throughput(Throughput::Elements(workers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            b.iter(|| {
                struct Counter {
                    value: ObservedLock<i64>,
                }
                let setup = || Counter { value: ObservedLock::new(0i64) };
                let body = |state: Arc<Counter>, session: &SchedulerSession| {
                    let mut guard = state.value.lock(session);
                    *guard += 1;
                };
                let routines = (0..workers).map(|_| schedcheck::explore::worker(body)).collect();
                let invariant = |_: &Counter| true;
                let result = explore(
                    setup,
                    routines,
                    invariant,
                    ExploreOptions { max_executions: 200, reproduce_on_failure: 0, ..Default::default() },
                )
                .unwrap();
                black_box(result.num_explored);
            });
        });
    }
    group.finish();
}

fn bench_scheduler_token_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_token_handoff");
    group.throughput(Throughput::Elements(1));
    group.bench_function("two_worker_single_execution", |b| {
        b.iter(|| {
            let engine = Arc::new(schedcheck::DporEngine::new(2, None, 1));
            let scheduler = CooperativeScheduler::new_with_engine(Arc::clone(&engine));
            assert!(engine.next_execution());
            let handle = engine.begin_execution();
            let counter = Arc::new(ObservedLock::new(0i64));
            let workers: Vec<Box<dyn FnOnce(&SchedulerSession) + Send>> = (0..2)
                .map(|_| {
                    let counter = Arc::clone(&counter);
                    Box::new(move |session: &SchedulerSession| {
                        let mut guard = counter.lock(session);
                        *guard += 1;
                    }) as Box<dyn FnOnce(&SchedulerSession) + Send>
                })
                .collect();
            let (summary, _panics) = scheduler.run_execution(handle, workers);
            black_box(summary.schedule_trace.len());
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_race_detection,
    bench_full_exploration,
    bench_scheduler_token_handoff
);
criterion_main!(benches);
