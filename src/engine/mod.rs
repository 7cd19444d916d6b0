//! The DPOR exploration driver (spec.md §4.1).
//!
//! `DporEngine` owns the single piece of process-wide mutable state for one
//! `explore()` call: the persistent exploration tree, the queue of schedule
//! prefixes still to try, and the bookkeeping for whichever execution is
//! currently running. It is deliberately "infallible" in the sense spec.md
//! §4.1 describes: a caller that violates the reporting contract (e.g.
//! releasing a lock never acquired) trips `EngineInvariant`, which is always
//! a programmer error in the instrumentation, never a property of the
//! program under test.

mod exploration;

pub use exploration::ExplorationNode;
use exploration::ExplorationTree;

use crate::clock::ClockSource;
use crate::deadlock::{DeadlockDetector, StallTracker};
use crate::event::{CallSite, Event, EventKind, EventLog, ThreadId, WriteOrigin};
use crate::key::ObjectKey;
use crate::EngineError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Opaque handle identifying one replay. Stale handles (from an execution
/// the engine has since abandoned, e.g. on timeout) are accepted by every
/// method but silently ignored, per the timeout-handling design in
/// `scheduler.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionHandle(u64);

/// What happened when a thread attempted a synchronization operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The lock was free (or reentrantly held by the caller); acquired.
    Acquired,
    /// The lock is held by another thread; the caller is now `Blocked`.
    Blocked,
}

/// Lock mode requested by a `report_sync` call — exclusive for
/// `SchedMutex`/`ObservedLock`, shared for `SchedRwLock` read guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

#[derive(Debug, Clone)]
enum LockHold {
    Exclusive(ThreadId, u32),
    Shared(BTreeSet<ThreadId>),
}

/// Why an execution ended.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// All threads finished normally.
    Completed,
    /// No thread was runnable while some remained unfinished, and a
    /// wait-for cycle was found among blocked threads.
    Deadlock(Vec<ThreadId>),
    /// No scheduling progress occurred before `deadlock_timeout` elapsed.
    TimedOut,
}

/// Everything produced by one execution, handed back to `explore()`.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub handle: ExecutionHandle,
    pub schedule_trace: Vec<ThreadId>,
    pub log: Arc<EventLog>,
    pub outcome: ExecutionOutcome,
}

/// Aggregate counters for the whole `explore()` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub executions_completed: u32,
    pub executions_explored: u32,
}

struct CurrentExecution {
    handle: ExecutionHandle,
    guiding_prefix: Vec<ThreadId>,
    path: Vec<ThreadId>,
    runnable: BTreeSet<ThreadId>,
    blocked: BTreeMap<ThreadId, ObjectKey>,
    finished: BTreeSet<ThreadId>,
    lock_holders: BTreeMap<ObjectKey, LockHold>,
    clock: ClockSource,
    log: Arc<EventLog>,
    stall: StallTracker,
    /// `event_step[j]` is the `path` index of the scheduling decision that
    /// produced log event `j`. `path` also contains steps that produce no
    /// log event at all (a blocked lock-acquire attempt), so this is not the
    /// identity map — it is the only reliable way to turn a `Race`'s log
    /// positions back into the tree-node path they came from.
    event_step: Vec<usize>,
}

struct EngineInner {
    num_workers: usize,
    preemption_bound: Option<u32>,
    max_executions: u32,
    deadlock_timeout: Duration,
    tree: ExplorationTree,
    queue: VecDeque<Vec<ThreadId>>,
    executions_completed: u32,
    executions_explored: u32,
    current: Option<CurrentExecution>,
    started: bool,
}

/// The DPOR exploration driver. One instance per `explore()` call.
pub struct DporEngine {
    inner: Mutex<EngineInner>,
    next_handle: AtomicU64,
}

impl DporEngine {
    /// Create an engine for a fixed set of `num_workers` threads (IDs
    /// `0..num_workers`), with the given preemption bound and execution
    /// budget.
    pub fn new(num_workers: usize, preemption_bound: Option<u32>, max_executions: u32) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(Vec::new());
        DporEngine {
            inner: Mutex::new(EngineInner {
                num_workers,
                preemption_bound,
                max_executions,
                deadlock_timeout: Duration::from_secs_f32(5.0),
                tree: ExplorationTree::new(),
                queue,
                executions_completed: 0,
                executions_explored: 0,
                current: None,
                started: false,
            }),
            next_handle: AtomicU64::new(0),
        }
    }

    /// Override the wall-clock per-execution deadline (default 5s, spec.md
    /// §6 `deadlock_timeout`).
    pub fn set_deadlock_timeout(&self, timeout: Duration) {
        self.inner.lock().deadlock_timeout = timeout;
    }

    /// An engine whose only queued schedule is `prefix`, forced verbatim and
    /// run exactly once. Used by `explore()`'s `reproduce_on_failure` pass
    /// (spec.md §6): replaying a recorded counterexample under the scheduler
    /// must reproduce the same violation every time (spec.md §8 "Round-trip
    /// / idempotence laws"), independent of whatever `preemption_bound` the
    /// original exploration used — the guiding prefix already names an
    /// exact schedule, so no bound can forbid it.
    pub fn for_replay(num_workers: usize, prefix: Vec<ThreadId>) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(prefix);
        DporEngine {
            inner: Mutex::new(EngineInner {
                num_workers,
                preemption_bound: None,
                max_executions: 1,
                deadlock_timeout: Duration::from_secs_f32(5.0),
                tree: ExplorationTree::new(),
                queue,
                executions_completed: 0,
                executions_explored: 0,
                current: None,
                started: false,
            }),
            next_handle: AtomicU64::new(0),
        }
    }

    /// True if more schedule prefixes remain and the budget hasn't been
    /// exhausted.
    pub fn next_execution(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.started {
            inner.started = true;
            return !inner.queue.is_empty();
        }
        if inner.executions_completed >= inner.max_executions {
            return false;
        }
        !inner.queue.is_empty()
    }

    /// Begin a new replay along the next queued prefix.
    pub fn begin_execution(&self) -> ExecutionHandle {
        let mut inner = self.inner.lock();
        inner.started = true;
        let guiding_prefix = inner.queue.pop_front().unwrap_or_default();
        let handle = ExecutionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let deadlock_timeout = inner.deadlock_timeout;
        debug!(?guiding_prefix, execution = handle.0, "beginning execution");
        inner.current = Some(CurrentExecution {
            handle,
            guiding_prefix,
            path: Vec::new(),
            runnable: (0..inner.num_workers).map(ThreadId).collect(),
            blocked: BTreeMap::new(),
            finished: BTreeSet::new(),
            lock_holders: BTreeMap::new(),
            clock: ClockSource::new(),
            log: Arc::new(EventLog::new()),
            stall: StallTracker::new(deadlock_timeout),
            event_step: Vec::new(),
        });
        handle
    }

    /// The event log for the (possibly still-running) execution `h`.
    pub fn event_log(&self, h: ExecutionHandle) -> Arc<EventLog> {
        let inner = self.inner.lock();
        match &inner.current {
            Some(cur) if cur.handle == h => Arc::clone(&cur.log),
            _ => Arc::new(EventLog::new()),
        }
    }

    /// Decide which thread runs next. `None` means no thread is runnable —
    /// either every worker finished, or the execution has stalled.
    pub fn schedule(&self, h: ExecutionHandle) -> Option<ThreadId> {
        let mut guard = self.inner.lock();
        let num_workers = guard.num_workers;
        let EngineInner { current, tree, .. } = &mut *guard;
        let cur = current.as_mut()?;
        if cur.handle != h {
            return None;
        }
        if cur.finished.len() == num_workers {
            return None;
        }
        let step = cur.path.len();
        let choice = if step < cur.guiding_prefix.len() {
            let forced = cur.guiding_prefix[step];
            if !cur.runnable.contains(&forced) {
                panic!("{}", EngineError::ForcedThreadNotRunnable(forced, step));
            }
            forced
        } else {
            match cur.runnable.iter().next().copied() {
                Some(t) => t,
                None => return None,
            }
        };

        let path_before = cur.path.clone();
        let node = tree.node_mut(&path_before);
        node.enabled = cur.runnable.clone();
        node.chosen = Some(choice);
        node.done.insert(choice);

        cur.path.push(choice);
        cur.stall.record_progress();
        trace!(step, thread = choice.0, "scheduled");
        Some(choice)
    }

    /// Record a memory access (`Read`/`Write`).
    pub fn report_access(
        &self,
        h: ExecutionHandle,
        thread: ThreadId,
        key: ObjectKey,
        kind: EventKind,
        site: CallSite,
        write_origin: Option<WriteOrigin>,
    ) {
        let mut guard = self.inner.lock();
        let EngineInner { current, tree, .. } = &mut *guard;
        let Some(cur) = current.as_mut() else { return };
        if cur.handle != h {
            return;
        }
        let path_before = cur.path[..cur.path.len().saturating_sub(1)].to_vec();
        let clock = cur.clock.tick();
        debug!(thread = thread.0, ?kind, "report_access");
        let node = tree.node_mut(&path_before);
        node.first_events.entry(thread).or_insert((key.clone(), kind));
        cur.log.push(Event {
            kind,
            key,
            thread,
            clock,
            site,
            write_origin,
            irregular: false,
        });
        cur.event_step.push(path_before.len());
        seed_child_sleep_set(tree, &path_before, thread, &cur.path);
    }

    /// Attempt a synchronization operation. Returns whether it was acquired
    /// immediately or the caller is now blocked.
    pub fn report_sync(
        &self,
        h: ExecutionHandle,
        thread: ThreadId,
        kind: EventKind,
        key: ObjectKey,
        site: CallSite,
        irregular: bool,
        mode: LockMode,
    ) -> SyncOutcome {
        let mut guard = self.inner.lock();
        let EngineInner { current, tree, .. } = &mut *guard;
        let Some(cur) = current.as_mut() else {
            return SyncOutcome::Acquired;
        };
        if cur.handle != h {
            return SyncOutcome::Acquired;
        }
        let path_before = cur.path[..cur.path.len().saturating_sub(1)].to_vec();

        match kind {
            EventKind::LockAcquire => {
                let acquired = match cur.lock_holders.get(&key) {
                    None => true,
                    Some(LockHold::Exclusive(holder, _)) => *holder == thread,
                    Some(LockHold::Shared(holders)) => {
                        mode == LockMode::Shared || holders.iter().all(|t| *t == thread)
                    }
                };
                if !acquired {
                    cur.blocked.insert(thread, key.clone());
                    cur.runnable.remove(&thread);
                    return SyncOutcome::Blocked;
                }
                match mode {
                    LockMode::Exclusive => {
                        let count = match cur.lock_holders.get(&key) {
                            Some(LockHold::Exclusive(_, n)) => *n + 1,
                            _ => 1,
                        };
                        cur.lock_holders
                            .insert(key.clone(), LockHold::Exclusive(thread, count));
                    }
                    LockMode::Shared => {
                        let mut holders = match cur.lock_holders.remove(&key) {
                            Some(LockHold::Shared(holders)) => holders,
                            _ => BTreeSet::new(),
                        };
                        holders.insert(thread);
                        cur.lock_holders.insert(key.clone(), LockHold::Shared(holders));
                    }
                }
                let node = tree.node_mut(&path_before);
                node.first_events
                    .entry(thread)
                    .or_insert((key.clone(), kind));
                cur.log.push(Event {
                    kind,
                    key,
                    thread,
                    clock: cur.clock.tick(),
                    site,
                    write_origin: None,
                    irregular,
                });
                cur.event_step.push(path_before.len());
                seed_child_sleep_set(tree, &path_before, thread, &cur.path);
                SyncOutcome::Acquired
            }
            EventKind::LockRelease => {
                let is_final = match cur.lock_holders.get(&key).cloned() {
                    Some(LockHold::Exclusive(holder, count)) if holder == thread => {
                        if count > 1 {
                            cur.lock_holders
                                .insert(key.clone(), LockHold::Exclusive(holder, count - 1));
                            false
                        } else {
                            cur.lock_holders.remove(&key);
                            true
                        }
                    }
                    Some(LockHold::Shared(mut holders)) if holders.contains(&thread) => {
                        holders.remove(&thread);
                        let empty = holders.is_empty();
                        if empty {
                            cur.lock_holders.remove(&key);
                        } else {
                            cur.lock_holders.insert(key.clone(), LockHold::Shared(holders));
                        }
                        empty
                    }
                    _ => {
                        warn!(?key, thread = thread.0, "release of a lock not held by this thread");
                        true
                    }
                };
                cur.log.push(Event {
                    kind,
                    key: key.clone(),
                    thread,
                    clock: cur.clock.tick(),
                    site,
                    write_origin: None,
                    irregular,
                });
                cur.event_step.push(path_before.len());
                {
                    let node = tree.node_mut(&path_before);
                    node.first_events.entry(thread).or_insert((key.clone(), kind));
                }
                seed_child_sleep_set(tree, &path_before, thread, &cur.path);

                if is_final {
                    let waiters: Vec<ThreadId> = cur
                        .blocked
                        .iter()
                        .filter(|(_, k)| **k == key)
                        .map(|(t, _)| *t)
                        .collect();
                    for waiter in waiters {
                        cur.blocked.remove(&waiter);
                        cur.runnable.insert(waiter);
                    }
                }
                SyncOutcome::Acquired
            }
            _ => SyncOutcome::Acquired,
        }
    }

    /// Mark a thread blocked on `on` (used directly by scheduler-level
    /// primitives that aren't plain mutex acquire, e.g. `SchedCondvar`).
    pub fn block_thread(&self, h: ExecutionHandle, thread: ThreadId, on: ObjectKey) {
        let mut inner = self.inner.lock();
        let Some(cur) = inner.current.as_mut() else { return };
        if cur.handle != h {
            return;
        }
        cur.blocked.insert(thread, on);
        cur.runnable.remove(&thread);
    }

    /// Move a previously blocked thread back to runnable.
    pub fn unblock_thread(&self, h: ExecutionHandle, thread: ThreadId) {
        let mut inner = self.inner.lock();
        let Some(cur) = inner.current.as_mut() else { return };
        if cur.handle != h {
            return;
        }
        if cur.blocked.remove(&thread).is_some() {
            cur.runnable.insert(thread);
        }
    }

    /// Move every thread blocked on `on` back to runnable. Used by the
    /// non-mutex sync-primitive substitutes (`SchedSemaphore`, `SchedBarrier`,
    /// `SchedQueue`) whose release side doesn't target one specific waiter.
    pub fn unblock_all_blocked_on(&self, h: ExecutionHandle, on: ObjectKey) {
        let mut inner = self.inner.lock();
        let Some(cur) = inner.current.as_mut() else { return };
        if cur.handle != h {
            return;
        }
        let waiters: Vec<ThreadId> = cur
            .blocked
            .iter()
            .filter(|(_, k)| **k == on)
            .map(|(t, _)| *t)
            .collect();
        for waiter in waiters {
            cur.blocked.remove(&waiter);
            cur.runnable.insert(waiter);
        }
    }

    /// Mark a thread terminated.
    pub fn finish_thread(&self, h: ExecutionHandle, thread: ThreadId) {
        let mut inner = self.inner.lock();
        let Some(cur) = inner.current.as_mut() else { return };
        if cur.handle != h {
            return;
        }
        cur.runnable.remove(&thread);
        cur.finished.insert(thread);
    }

    /// True if the current execution has stalled for longer than the
    /// configured `deadlock_timeout` with no scheduling progress.
    pub fn is_stalled(&self, h: ExecutionHandle) -> bool {
        let inner = self.inner.lock();
        match &inner.current {
            Some(cur) if cur.handle == h => cur.stall.is_stalled(),
            _ => false,
        }
    }

    /// Finalize the current execution: run race detection, compute and
    /// enqueue new schedule prefixes, and return a summary.
    pub fn finish_execution(&self, h: ExecutionHandle) -> ExecutionSummary {
        let mut inner = self.inner.lock();
        let num_workers = inner.num_workers;
        let preemption_bound = inner.preemption_bound;
        let cur = match inner.current.take() {
            Some(cur) if cur.handle == h => cur,
            Some(other) => {
                inner.current = Some(other);
                return ExecutionSummary {
                    handle: h,
                    schedule_trace: Vec::new(),
                    log: Arc::new(EventLog::new()),
                    outcome: ExecutionOutcome::TimedOut,
                };
            }
            None => {
                return ExecutionSummary {
                    handle: h,
                    schedule_trace: Vec::new(),
                    log: Arc::new(EventLog::new()),
                    outcome: ExecutionOutcome::TimedOut,
                };
            }
        };

        let outcome = if cur.finished.len() == num_workers {
            ExecutionOutcome::Completed
        } else if let Some(cycle) =
            DeadlockDetector::new().find_cycle(&cur.blocked, &exclusive_holders(&cur.lock_holders))
        {
            ExecutionOutcome::Deadlock(cycle)
        } else if cur.stall.is_stalled() {
            ExecutionOutcome::TimedOut
        } else {
            ExecutionOutcome::Deadlock(cur.blocked.keys().copied().collect())
        };

        inner.executions_explored += 1;
        if matches!(outcome, ExecutionOutcome::Completed) {
            inner.executions_completed += 1;
        }

        if matches!(outcome, ExecutionOutcome::Completed) {
            let races = crate::race::RaceDetector::new().races(&cur.log);
            info!(
                races = races.len(),
                steps = cur.path.len(),
                "execution completed"
            );
            for race in races {
                if let Some(j) =
                    backtrack_insertion_step(&cur.path, &cur.event_step, &inner.tree, &race)
                {
                    let b = race.later.thread;
                    let path_prefix = cur.path[..j].to_vec();
                    let node = inner.tree.node_mut(&path_prefix);
                    if !node.done.contains(&b) && !node.sleep.contains(&b) {
                        node.backtrack.insert(b);
                        debug!(step = j, thread = b.0, "backtrack entry added from race");
                    }
                }
            }

            for i in 0..cur.path.len() {
                let path_prefix = cur.path[..i].to_vec();
                let pending: Vec<ThreadId> = inner
                    .tree
                    .node(&path_prefix)
                    .map(|n| n.pending().into_iter().collect())
                    .unwrap_or_default();
                for t in pending {
                    let mut candidate = path_prefix.clone();
                    candidate.push(t);
                    if let Some(bound) = preemption_bound {
                        if exploration::preemption_count(&candidate, &inner.tree) > bound {
                            continue;
                        }
                    }
                    inner.queue.push_back(candidate);
                    inner.tree.node_mut(&path_prefix).done.insert(t);
                }
            }
        }

        ExecutionSummary {
            handle: h,
            schedule_trace: cur.path,
            log: cur.log,
            outcome,
        }
    }

    /// Snapshot of aggregate counters.
    pub fn stats(&self) -> EngineStats {
        let inner = self.inner.lock();
        EngineStats {
            executions_completed: inner.executions_completed,
            executions_explored: inner.executions_explored,
        }
    }
}

/// Seed `child_path`'s node with its initial sleep set, the first time it is
/// visited, from `path_before`'s `sleep ∪ backtrack` per spec.md §4.1
/// "Sleep-set propagation". A no-op on later visits to the same node: the
/// sleep set is a property of the first arrival, not re-derived per
/// execution.
fn seed_child_sleep_set(
    tree: &mut ExplorationTree,
    path_before: &[ThreadId],
    thread: ThreadId,
    child_path: &[ThreadId],
) {
    if tree.node(child_path).is_some() {
        return;
    }
    let first_event = tree
        .node(path_before)
        .and_then(|n| n.first_events.get(&thread).cloned());
    let sleep = tree.child_sleep_set(path_before, thread, first_event.as_ref());
    tree.node_mut(child_path).sleep = sleep;
}

fn exclusive_holders(lock_holders: &BTreeMap<ObjectKey, LockHold>) -> BTreeMap<ObjectKey, ThreadId> {
    lock_holders
        .iter()
        .filter_map(|(k, hold)| match hold {
            LockHold::Exclusive(t, _) => Some((k.clone(), *t)),
            LockHold::Shared(_) => None,
        })
        .collect()
}

/// Find the step at which to insert the race's later thread into a
/// backtrack set, so the next exploration reverses the race (spec.md §4.1
/// "Backtrack-set computation"): the greatest step `j` at or before the
/// earlier event's own scheduling step where the later thread was enabled.
///
/// `event_step` maps a log position to the `path` index that produced it,
/// since `path` also records scheduling steps that emit no log event (a
/// worker's start/finish handshake, a blocked lock-acquire retry) and so is
/// not index-aligned with the log.
fn backtrack_insertion_step(
    path: &[ThreadId],
    event_step: &[usize],
    tree: &ExplorationTree,
    race: &crate::race::Race,
) -> Option<usize> {
    let later_thread = race.later.thread;
    let earlier_step = *event_step.get(race.earlier_index)?;
    let bound = earlier_step.min(path.len());
    for j in (0..=bound).rev() {
        let prefix = &path[..j];
        if let Some(node) = tree.node(prefix) {
            if node.enabled.contains(&later_thread) {
                return Some(j);
            }
        }
    }
    None
}
