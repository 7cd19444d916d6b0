//! The top-level `explore()` entry point (spec.md §6).
//!
//! Grounded on `gossip/config.rs`'s `GossipConfig` (a plain `Default`-able
//! options struct with a `validate()` method) and the crate-root
//! configuration-validation pattern that calls it before doing any work.

use crate::engine::{DporEngine, ExecutionOutcome};
use crate::io_bridge::IoEventBridge;
use crate::scheduler::{CooperativeScheduler, SchedulerSession};
use crate::trace::{render_trace, FailureKind, FailureRecord, ScheduleTrace, DEFAULT_TRACE_LINES};
use crate::ConfigError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A worker routine: given the shared world built by `setup` and a
/// [`SchedulerSession`] for reporting events, run to completion (or panic).
///
/// An `Arc<dyn Fn>` rather than a plain closure type so `explore()` can
/// clone one routine into a fresh, independently-owned `'static` closure for
/// every replay without requiring `workers` itself to be `'static`-captured
/// by reference (worker threads are spawned per execution, spec.md §4.2).
pub type Worker<S> = Arc<dyn Fn(Arc<S>, &SchedulerSession) + Send + Sync>;

/// Wrap a plain closure as a [`Worker`].
pub fn worker<S, F>(f: F) -> Worker<S>
where
    F: Fn(Arc<S>, &SchedulerSession) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Options for one [`explore`] call (spec.md §6).
#[derive(Debug, Clone)]
pub struct ExploreOptions {
    /// Hard cap on the number of executions to run. Reaching this without
    /// completing exploration surfaces as `BudgetExhausted` (spec.md §7):
    /// `property_holds` is then a non-definitive "no violation found".
    pub max_executions: u32,
    /// Upper bound on thread-switch count at positions where the outgoing
    /// thread was still runnable (spec.md §4.1). `None` means unbounded.
    pub preemption_bound: Option<u32>,
    /// Wall-clock deadline for one execution with no scheduling progress
    /// before it is aborted and reported as a timeout (spec.md §4.2/§4.5).
    pub deadlock_timeout: Duration,
    /// Whether to construct an [`IoEventBridge`] for this exploration so
    /// external-resource events can be attributed to workers (spec.md §4.4).
    /// Wiring a real transport into the bridge is the embedding program's
    /// responsibility — the native interception layer itself is an explicit
    /// Non-goal (spec.md §1).
    pub detect_io: bool,
    /// After finding a violation, replay its exact schedule this many times
    /// to assert determinism; divergent replays are surfaced as
    /// `FailureRecord`s with [`FailureKind::FlakyReplay`] (spec.md §6).
    pub reproduce_on_failure: u32,
}

impl Default for ExploreOptions {
    fn default() -> Self {
        ExploreOptions {
            max_executions: 1000,
            preemption_bound: Some(2),
            deadlock_timeout: Duration::from_secs_f32(5.0),
            detect_io: true,
            reproduce_on_failure: 5,
        }
    }
}

impl ExploreOptions {
    /// Reject option combinations that cannot explore anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_executions == 0 {
            return Err(ConfigError::InvalidOptions(
                "max_executions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// The result of one [`explore`] call (spec.md §6).
#[derive(Debug, Clone)]
pub struct ExploreResult {
    /// `true` if no execution within the explored budget falsified the
    /// invariant (and no `WorkerException`/`EngineInvariant` occurred). A
    /// `true` result when `BudgetExhausted` was hit is non-definitive —
    /// callers that care should also check [`ExploreResult::num_explored`]
    /// against the configured `max_executions`.
    pub property_holds: bool,
    /// Number of executions actually run.
    pub num_explored: u32,
    /// The schedule of the first violation found, if any.
    pub counterexample: Option<ScheduleTrace>,
    /// Non-fatal anomalies encountered along the way (deadlocks, timeouts,
    /// flaky replays) — does not include the counterexample itself.
    pub failures: Vec<FailureRecord>,
    /// The rendered trace for the counterexample (or the first
    /// `WorkerException`), if any.
    pub explanation: Option<String>,
}

/// Enumerate schedules of `workers` under DPOR, looking for the first one
/// that falsifies `invariant` (spec.md §6).
///
/// `setup` builds a fresh `S` for every execution (spec.md §4.2 "workers'
/// application state is rebuilt by calling `setup()` at the start of each
/// execution"). Workers communicate through `S` via [`crate::observed::Observed`]
/// cells and [`crate::scheduler::SchedMutex`]/[`crate::observed::ObservedLock`]
/// locks — plain unwrapped `std` state is invisible to the engine by design
/// (spec.md §9).
pub fn explore<S, Setup, Invariant>(
    setup: Setup,
    workers: Vec<Worker<S>>,
    invariant: Invariant,
    options: ExploreOptions,
) -> Result<ExploreResult, ConfigError>
where
    S: Send + Sync + 'static,
    Setup: Fn() -> S,
    Invariant: Fn(&S) -> bool,
{
    options.validate()?;

    let engine = Arc::new(DporEngine::new(
        workers.len(),
        options.preemption_bound,
        options.max_executions,
    ));
    engine.set_deadlock_timeout(options.deadlock_timeout);

    let mut failures = Vec::new();
    let mut counterexample = None;
    let mut explanation = None;
    let mut num_explored = 0;

    while engine.next_execution() {
        let scheduler = build_scheduler(Arc::clone(&engine), options.detect_io);
        let handle = engine.begin_execution();
        let state = Arc::new(setup());

        let boxed_workers = spawn_closures(&workers, &state);
        let (summary, panics) = scheduler.run_execution(handle, boxed_workers);
        num_explored += 1;
        debug!(
            execution = num_explored,
            steps = summary.schedule_trace.len(),
            "execution finished"
        );

        if let Some(panic) = panics.into_iter().next() {
            let trace = render_trace(
                &format!("worker {} raised an uncaught error: {}", panic.thread, panic.message),
                &summary.log.events(),
                DEFAULT_TRACE_LINES,
            );
            warn!(thread = panic.thread.0, "worker exception found, stopping exploration");
            failures.push(FailureRecord {
                kind: FailureKind::WorkerException { thread: panic.thread, message: panic.message },
                schedule_trace: summary.schedule_trace.clone(),
                rendered_trace: trace.clone(),
            });
            counterexample = Some(summary.schedule_trace);
            explanation = Some(trace);
            break;
        }

        match &summary.outcome {
            ExecutionOutcome::Completed => {
                if !invariant(&state) {
                    let trace = render_trace(
                        "invariant violated",
                        &summary.log.events(),
                        DEFAULT_TRACE_LINES,
                    );
                    info!(execution = num_explored, "invariant violation found");
                    counterexample = Some(summary.schedule_trace);
                    explanation = Some(trace);
                    break;
                }
            }
            ExecutionOutcome::Deadlock(cycle) => {
                let trace = render_trace(
                    &FailureKind::Deadlock { cycle: cycle.clone() }.header(),
                    &summary.log.events(),
                    DEFAULT_TRACE_LINES,
                );
                failures.push(FailureRecord {
                    kind: FailureKind::Deadlock { cycle: cycle.clone() },
                    schedule_trace: summary.schedule_trace,
                    rendered_trace: trace,
                });
            }
            ExecutionOutcome::TimedOut => {
                let trace = render_trace(
                    &FailureKind::TimeoutPerExecution.header(),
                    &summary.log.events(),
                    DEFAULT_TRACE_LINES,
                );
                failures.push(FailureRecord {
                    kind: FailureKind::TimeoutPerExecution,
                    schedule_trace: summary.schedule_trace,
                    rendered_trace: trace,
                });
            }
        }
    }

    if let Some(ref trace) = counterexample {
        if options.reproduce_on_failure > 0 {
            reproduce(&setup, &workers, &invariant, trace, options.reproduce_on_failure, &mut failures);
        }
    }

    let property_holds = counterexample.is_none();
    Ok(ExploreResult {
        property_holds,
        num_explored,
        counterexample,
        failures,
        explanation,
    })
}

fn build_scheduler(engine: Arc<DporEngine>, detect_io: bool) -> CooperativeScheduler {
    let scheduler = CooperativeScheduler::new_with_engine(engine);
    if detect_io {
        scheduler.with_io_bridge(IoEventBridge::new())
    } else {
        scheduler
    }
}

/// Build one `'static` `FnOnce` per worker for a single execution, each
/// owning a clone of the `Worker` `Arc` and the execution's shared `state`.
fn spawn_closures<S: Send + Sync + 'static>(
    workers: &[Worker<S>],
    state: &Arc<S>,
) -> Vec<Box<dyn FnOnce(&SchedulerSession) + Send>> {
    workers
        .iter()
        .map(|w| {
            let w = Arc::clone(w);
            let state = Arc::clone(state);
            Box::new(move |session: &SchedulerSession| w(state, session))
                as Box<dyn FnOnce(&SchedulerSession) + Send>
        })
        .collect()
}

/// Replay `trace` exactly `attempts` times via a guiding-prefix-only engine
/// and record a [`FailureKind::FlakyReplay`] for any replay whose outcome
/// differs from the original violation (spec.md §6/§8 "Round-trip /
/// idempotence laws": replaying a recorded counterexample must reproduce the
/// same invariant violation every time).
fn reproduce<S, Setup, Invariant>(
    setup: &Setup,
    workers: &[Worker<S>],
    invariant: &Invariant,
    trace: &ScheduleTrace,
    attempts: u32,
    failures: &mut Vec<FailureRecord>,
) where
    S: Send + Sync + 'static,
    Setup: Fn() -> S,
    Invariant: Fn(&S) -> bool,
{
    for attempt in 1..=attempts {
        let engine = Arc::new(DporEngine::for_replay(workers.len(), trace.clone()));
        let scheduler = CooperativeScheduler::new_with_engine(Arc::clone(&engine));
        let handle = engine.begin_execution();
        let state = Arc::new(setup());
        let boxed_workers = spawn_closures(workers, &state);
        let (summary, panics) = scheduler.run_execution(handle, boxed_workers);

        let reproduced = panics.is_empty()
            && matches!(summary.outcome, ExecutionOutcome::Completed)
            && !invariant(&state);

        if !reproduced {
            let reason = if !panics.is_empty() {
                "replay raised a different worker exception".to_string()
            } else {
                match summary.outcome {
                    ExecutionOutcome::Completed => "invariant held on replay".to_string(),
                    ExecutionOutcome::Deadlock(_) => "replay deadlocked instead of violating the invariant".to_string(),
                    ExecutionOutcome::TimedOut => "replay timed out instead of violating the invariant".to_string(),
                }
            };
            warn!(attempt, %reason, "counterexample replay did not reproduce");
            failures.push(FailureRecord {
                kind: FailureKind::FlakyReplay { attempt, reason: reason.clone() },
                schedule_trace: summary.schedule_trace.clone(),
                rendered_trace: render_trace(&reason, &summary.log.events(), DEFAULT_TRACE_LINES),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observed::{Observed, ObservedLock};

    struct Counter {
        value: Observed<i64>,
    }

    #[test]
    fn lost_update_on_unlocked_attribute_is_found() {
        let setup = || Counter { value: Observed::new("value", 0i64) };
        let body = |state: Arc<Counter>, session: &SchedulerSession| {
            let t = state.value.get(session);
            state.value.set(session, t + 1);
        };
        let workers = vec![worker(body), worker(body)];
        let invariant = |state: &Counter| {
            // Re-read without instrumentation for the invariant check itself
            // (spec.md §6: invariant is evaluated once, after termination,
            // outside the scheduled region).
            let sched = CooperativeScheduler::new();
            let session = sched.session_for_test();
            state.value.get(&session) == 2
        };

        let result = explore(
            setup,
            workers,
            invariant,
            ExploreOptions { max_executions: 50, reproduce_on_failure: 0, ..Default::default() },
        )
        .unwrap();

        assert!(!result.property_holds, "unsynchronized read-modify-write must lose an update");
        assert!(result.counterexample.is_some());
        assert!(result.explanation.is_some());
    }

    #[test]
    fn locked_counter_holds_the_invariant() {
        struct LockedCounter {
            value: ObservedLock<i64>,
        }
        let setup = || LockedCounter { value: ObservedLock::new(0i64) };
        let body = |state: Arc<LockedCounter>, session: &SchedulerSession| {
            let mut guard = state.value.lock(session);
            *guard += 1;
        };
        let workers = vec![worker(body), worker(body)];
        let invariant = |state: &LockedCounter| {
            let sched = CooperativeScheduler::new();
            let session = sched.session_for_test();
            let value = *state.value.lock(&session);
            value == 2
        };

        let result = explore(
            setup,
            workers,
            invariant,
            ExploreOptions { max_executions: 50, reproduce_on_failure: 0, ..Default::default() },
        )
        .unwrap();

        assert!(result.property_holds, "a shared lock must prevent the lost update");
        assert!(result.num_explored <= 3);
    }

    #[test]
    fn preemption_bound_zero_suppresses_the_violation() {
        let setup = || Counter { value: Observed::new("value", 0i64) };
        let body = |state: Arc<Counter>, session: &SchedulerSession| {
            let t = state.value.get(session);
            state.value.set(session, t + 1);
        };
        let workers = vec![worker(body), worker(body)];
        let invariant = |state: &Counter| {
            let sched = CooperativeScheduler::new();
            let session = sched.session_for_test();
            state.value.get(&session) == 2
        };

        let result = explore(
            setup,
            workers,
            invariant,
            ExploreOptions {
                max_executions: 50,
                preemption_bound: Some(0),
                reproduce_on_failure: 0,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(result.property_holds, "zero preemptions must not permit the interleaved violation");
        assert_eq!(result.num_explored, 1);
    }

    #[test]
    fn workers_sharing_no_keys_explore_exactly_one_schedule() {
        let setup = || Counter { value: Observed::new("value", 0i64) };
        let body_a = |state: Arc<Counter>, session: &SchedulerSession| {
            state.value.set(session, 1);
        };
        let body_b = |_state: Arc<Counter>, _session: &SchedulerSession| {};
        let workers = vec![worker(body_a), worker(body_b)];
        let invariant = |_: &Counter| true;

        let result = explore(
            setup,
            workers,
            invariant,
            ExploreOptions { max_executions: 50, reproduce_on_failure: 0, ..Default::default() },
        )
        .unwrap();

        assert!(result.property_holds);
        assert_eq!(result.num_explored, 1);
    }

    #[test]
    fn single_worker_explores_exactly_one_schedule() {
        let setup = || Counter { value: Observed::new("value", 0i64) };
        let body = |state: Arc<Counter>, session: &SchedulerSession| {
            state.value.set(session, 1);
        };
        let workers = vec![worker(body)];
        let invariant = |state: &Counter| {
            let sched = CooperativeScheduler::new();
            let session = sched.session_for_test();
            state.value.get(&session) == 1
        };

        let result = explore(
            setup,
            workers,
            invariant,
            ExploreOptions { max_executions: 50, reproduce_on_failure: 0, ..Default::default() },
        )
        .unwrap();

        assert!(result.property_holds);
        assert_eq!(result.num_explored, 1);
    }

    #[test]
    fn max_executions_zero_is_rejected() {
        let err = ExploreOptions { max_executions: 0, ..Default::default() }.validate();
        assert!(err.is_err());
    }

    #[test]
    fn worker_panic_is_reported_as_worker_exception() {
        let setup = || Counter { value: Observed::new("value", 0i64) };
        let body_panics = |_state: Arc<Counter>, _session: &SchedulerSession| {
            panic!("boom");
        };
        let workers = vec![worker(body_panics)];
        let invariant = |_: &Counter| true;

        let result = explore(
            setup,
            workers,
            invariant,
            ExploreOptions { max_executions: 10, reproduce_on_failure: 0, ..Default::default() },
        )
        .unwrap();

        assert!(!result.property_holds);
        assert!(result
            .failures
            .iter()
            .any(|f| matches!(f.kind, FailureKind::WorkerException { .. })));
    }
}
