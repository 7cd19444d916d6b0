//! Deadlock detection: wait-for-cycle walking over held locks, plus a
//! wall-clock stall tracker for the cases a cycle walk cannot see (spec.md
//! §4.5).

use crate::event::ThreadId;
use crate::key::ObjectKey;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Walks the wait-for graph induced by `blocked`/`holders` and reports a
/// cycle if one exists.
///
/// Grounded on `byzantine.rs`'s `FaultReport`/`FaultType` fault-report
/// accumulation style, reused here as a pure graph query rather than an
/// accumulating detector, since a wait-for cycle is decided fresh at each
/// call from the current blocked/holders snapshot.
#[derive(Debug, Default)]
pub struct DeadlockDetector;

impl DeadlockDetector {
    pub fn new() -> Self {
        DeadlockDetector
    }

    /// `blocked`: thread -> the lock it is waiting to acquire.
    /// `holders`: lock -> the thread currently holding it exclusively.
    ///
    /// Returns the cycle (as a sequence of threads) if the wait-for graph
    /// built from these two maps contains one, starting from the
    /// lowest-numbered blocked thread for determinism.
    pub fn find_cycle(
        &self,
        blocked: &BTreeMap<ThreadId, ObjectKey>,
        holders: &BTreeMap<ObjectKey, ThreadId>,
    ) -> Option<Vec<ThreadId>> {
        for &start in blocked.keys() {
            let mut path = vec![start];
            let mut current = start;
            loop {
                let Some(wanted_lock) = blocked.get(&current) else {
                    break;
                };
                let Some(&holder) = holders.get(wanted_lock) else {
                    break;
                };
                if holder == start {
                    return Some(path);
                }
                if path.contains(&holder) {
                    // Cycle exists but doesn't pass back through `start`;
                    // it will be found when we iterate starting from a
                    // thread on that cycle instead.
                    break;
                }
                path.push(holder);
                current = holder;
                if !blocked.contains_key(&current) {
                    break;
                }
            }
        }
        None
    }
}

/// Tracks wall-clock progress within one execution, for the
/// `deadlock_timeout` case a lock-cycle walk cannot see (e.g. a worker
/// blocked on a `SchedCondvar` nobody ever signals).
#[derive(Debug)]
pub struct StallTracker {
    last_progress: Instant,
    timeout: Duration,
}

impl StallTracker {
    pub fn new(timeout: Duration) -> Self {
        StallTracker {
            last_progress: Instant::now(),
            timeout,
        }
    }

    /// Call whenever the scheduler hands the token to a thread (the engine's
    /// only observable notion of "progress").
    pub fn record_progress(&mut self) {
        self.last_progress = Instant::now();
    }

    pub fn is_stalled(&self) -> bool {
        self.last_progress.elapsed() >= self.timeout
    }
}
