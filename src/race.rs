//! Computes races between memory/sync events recorded in an [`EventLog`].
//!
//! Two conflicting events are in a race if no chain of lock acquire/release
//! pairs establishes happens-before between them (spec.md §4.1). This module
//! only reads an already-recorded [`EventLog`]; it has no notion of "current
//! execution" and can be re-run offline against a persisted trace.

use crate::event::{Event, EventKind, EventLog, ThreadId};
use crate::key::ObjectKey;

/// One pair of conflicting events with no happens-before edge between them.
#[derive(Debug, Clone)]
pub struct Race {
    /// The earlier event in the log (by position).
    pub earlier: Event,
    /// The later, conflicting event.
    pub later: Event,
    /// Position of `earlier` in the total order.
    pub earlier_index: usize,
    /// Position of `later` in the total order.
    pub later_index: usize,
}

/// Computes race pairs for one event log.
#[derive(Debug, Default)]
pub struct RaceDetector;

impl RaceDetector {
    /// Create a detector. Stateless — all state lives in the `EventLog`
    /// passed to [`RaceDetector::races`].
    pub fn new() -> Self {
        RaceDetector
    }

    /// Find every race pair in `log`.
    ///
    /// For each ordered pair of conflicting events `(e1, e2)` with `e1`
    /// before `e2` in the log, `e1`/`e2` are in a race unless there is a
    /// lock-pair `Release(L) by t1 -> Acquire(L) by t2` between them in the
    /// log, where `t1 == e1.thread` and `t2 == e2.thread` (spec.md §4.1).
    pub fn races(&self, log: &EventLog) -> Vec<Race> {
        let events = log.events();
        let mut races = Vec::new();

        for i in 0..events.len() {
            for j in (i + 1)..events.len() {
                let e1 = &events[i];
                let e2 = &events[j];
                if !e1.conflicts_with(e2) {
                    continue;
                }
                if self.happens_before(&events, i, j) {
                    continue;
                }
                races.push(Race {
                    earlier: e1.clone(),
                    later: e2.clone(),
                    earlier_index: i,
                    later_index: j,
                });
            }
        }

        races
    }

    /// True if there is a lock-pair `Release(L) by events[i].thread ->
    /// Acquire(L) by events[j].thread` strictly between positions `i` and
    /// `j` in `events`.
    fn happens_before(&self, events: &[Event], i: usize, j: usize) -> bool {
        let from_thread = events[i].thread;
        let to_thread = events[j].thread;
        if from_thread == to_thread {
            // Same-thread program order is always a happens-before edge.
            return true;
        }

        for e in &events[i + 1..j] {
            if e.kind == EventKind::LockRelease && e.thread == from_thread {
                if self.has_matching_acquire(events, i, j, &e.key, to_thread) {
                    return true;
                }
            }
        }
        false
    }

    /// After a `Release(L)` by `from_thread` at some position within
    /// `(i, j)`, look for an `Acquire(L)` by `to_thread` at a later position
    /// still within `(i, j)` — the other half of the happens-before edge.
    fn has_matching_acquire(
        &self,
        events: &[Event],
        i: usize,
        j: usize,
        lock: &ObjectKey,
        to_thread: ThreadId,
    ) -> bool {
        events[i + 1..j].iter().any(|e| {
            e.kind == EventKind::LockAcquire && e.thread == to_thread && &e.key == lock
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockSource;
    use crate::event::{CallSite, WriteOrigin};
    use crate::key::ContainerId;

    fn push_access(
        log: &EventLog,
        clock: &ClockSource,
        thread: usize,
        kind: EventKind,
        key: ObjectKey,
    ) {
        log.push(Event {
            kind,
            key,
            thread: ThreadId(thread),
            clock: clock.tick(),
            site: CallSite::new("t.rs", 1, "t"),
            write_origin: if kind == EventKind::Write {
                Some(WriteOrigin::Instrumented)
            } else {
                None
            },
            irregular: false,
        });
    }

    #[test]
    fn unsynchronized_concurrent_writes_race() {
        let log = EventLog::new();
        let clock = ClockSource::new();
        let container = ContainerId(1);
        let key = ObjectKey::attr(container, "value");

        push_access(&log, &clock, 0, EventKind::Read, key.clone());
        push_access(&log, &clock, 1, EventKind::Read, key.clone());
        push_access(&log, &clock, 0, EventKind::Write, key.clone());
        push_access(&log, &clock, 1, EventKind::Write, key.clone());

        let races = RaceDetector::new().races(&log);
        // R0/W1, R1/W0, W0/W1 all conflict and are unsynchronized.
        assert!(!races.is_empty());
        assert!(races
            .iter()
            .any(|r| r.earlier.kind == EventKind::Write && r.later.kind == EventKind::Write));
    }

    #[test]
    fn lock_protected_accesses_do_not_race() {
        let log = EventLog::new();
        let clock = ClockSource::new();
        let container = ContainerId(1);
        let key = ObjectKey::attr(container, "value");
        let lock = ObjectKey::lock(ContainerId(2));

        push_access(&log, &clock, 0, EventKind::LockAcquire, lock.clone());
        push_access(&log, &clock, 0, EventKind::Write, key.clone());
        push_access(&log, &clock, 0, EventKind::LockRelease, lock.clone());

        push_access(&log, &clock, 1, EventKind::LockAcquire, lock.clone());
        push_access(&log, &clock, 1, EventKind::Write, key.clone());
        push_access(&log, &clock, 1, EventKind::LockRelease, lock);

        let races = RaceDetector::new().races(&log);
        let data_races: Vec<_> = races.iter().filter(|r| r.earlier.key == key).collect();
        assert!(
            data_races.is_empty(),
            "lock-protected accesses must not race: {data_races:?}"
        );
    }

    #[test]
    fn distinct_keys_never_race() {
        let log = EventLog::new();
        let clock = ClockSource::new();
        let container = ContainerId(1);

        push_access(
            &log,
            &clock,
            0,
            EventKind::Write,
            ObjectKey::attr(container, "a"),
        );
        push_access(
            &log,
            &clock,
            1,
            EventKind::Write,
            ObjectKey::attr(container, "b"),
        );

        assert!(RaceDetector::new().races(&log).is_empty());
    }

    #[test]
    fn same_thread_accesses_never_race() {
        let log = EventLog::new();
        let clock = ClockSource::new();
        let container = ContainerId(1);
        let key = ObjectKey::attr(container, "value");

        push_access(&log, &clock, 0, EventKind::Read, key.clone());
        push_access(&log, &clock, 0, EventKind::Write, key);

        assert!(RaceDetector::new().races(&log).is_empty());
    }
}
