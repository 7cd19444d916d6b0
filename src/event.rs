//! The append-only event log of one execution.

use crate::clock::Clock;
use crate::key::ObjectKey;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Identifies one worker thread within an execution.
///
/// Stable for the lifetime of one `Execution`; reused across replays the way
/// the guiding prefix expects (worker 0 is always the same routine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub usize);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// A memory or external-resource read.
    Read,
    /// A memory or external-resource write.
    Write,
    /// A lock/semaphore acquire.
    LockAcquire,
    /// A lock/semaphore release.
    LockRelease,
}

impl EventKind {
    /// True for `Read`/`Write` (the conflict-eligible access events).
    pub fn is_access(self) -> bool {
        matches!(self, EventKind::Read | EventKind::Write)
    }

    /// True for `Write` only.
    pub fn is_write(self) -> bool {
        matches!(self, EventKind::Write)
    }
}

/// Where a [`Write`](EventKind::Write) event was observed from — needed so
/// that bridge-synthesised writes on `External` keys can be distinguished in
/// traces from writes the state-trait instrumentation reported directly
/// (spec.md §3 `Event`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOrigin {
    /// Reported by the `Observed`/`ObservedLock` instrumentation.
    Instrumented,
    /// Synthesised by the I/O event bridge from a native-side syscall event.
    IoBridge,
}

/// Informational call-site metadata attached to an event, used only for
/// trace rendering (spec.md §3: "site is informational").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    /// Source file.
    pub file: String,
    /// Source line.
    pub line: u32,
    /// Enclosing function or method name.
    pub function: String,
    /// Short call chain, innermost first, e.g.
    /// `["Counter::increment", "Counter::_read"]`, rendered as
    /// "Called from Counter::_read ← Counter::increment".
    pub call_chain: Vec<String>,
}

impl CallSite {
    /// Build a call site with no call-chain context.
    pub fn new(file: impl Into<String>, line: u32, function: impl Into<String>) -> Self {
        CallSite {
            file: file.into(),
            line,
            function: function.into(),
            call_chain: Vec::new(),
        }
    }

    /// Attach a call chain (innermost frame first).
    pub fn with_call_chain(mut self, call_chain: Vec<String>) -> Self {
        self.call_chain = call_chain;
        self
    }
}

/// One observed access or synchronization event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// The kind of event.
    pub kind: EventKind,
    /// The resource touched. `None` for sync events whose key is carried
    /// separately is never the case here — sync events use
    /// `ObjectKey::Sync`, access events use `InMemory`/`External`.
    pub key: ObjectKey,
    /// The thread that produced this event.
    pub thread: ThreadId,
    /// The clock value stamped by the owning execution's `ClockSource`.
    pub clock: Clock,
    /// Informational call-site metadata.
    pub site: CallSite,
    /// For `Write` events, where the write was observed from. `None` for
    /// non-write events.
    pub write_origin: Option<WriteOrigin>,
    /// True for a `LockRelease` synthesised because the owning thread
    /// terminated (panicked) while still holding the lock, rather than
    /// releasing it through the normal guard-drop path (SPEC_FULL.md §12.3).
    /// Always `false` for every other event kind.
    pub irregular: bool,
}

impl Event {
    /// This event's position in a total order, for convenience in tests and
    /// trace rendering (equivalent to comparing `clock`).
    pub fn happened_before(&self, other: &Event) -> bool {
        self.clock < other.clock
    }

    /// True if `self` and `other` touch the same key and at least one is a
    /// write — the conflict predicate of spec.md §4.1.
    pub fn conflicts_with(&self, other: &Event) -> bool {
        self.thread != other.thread
            && self.kind.is_access()
            && other.kind.is_access()
            && self.key == other.key
            && (self.kind.is_write() || other.kind.is_write())
    }
}

/// The append-only sequence of all events in one execution, plus a per-thread
/// view for fast iteration (spec.md §3 `EventLog`).
#[derive(Debug, Default)]
pub struct EventLog {
    /// All events in the exact order they were recorded.
    order: Mutex<Vec<Event>>,
    /// Per-thread indices into `order`, for fast "this thread's events"
    /// iteration without re-scanning the whole log.
    by_thread: DashMap<ThreadId, Vec<usize>>,
}

impl EventLog {
    /// Create an empty event log for a new execution.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, recording it in both the total order and the
    /// per-thread view.
    pub fn push(&self, event: Event) {
        let thread = event.thread;
        let mut order = self.order.lock();
        let index = order.len();
        order.push(event);
        drop(order);
        self.by_thread.entry(thread).or_default().push(index);
    }

    /// The full event log in recorded order.
    pub fn events(&self) -> Vec<Event> {
        self.order.lock().clone()
    }

    /// The number of events recorded so far.
    pub fn len(&self) -> usize {
        self.order.lock().len()
    }

    /// True if no events have been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// This thread's events, in recorded order.
    pub fn events_for(&self, thread: ThreadId) -> Vec<Event> {
        let order = self.order.lock();
        self.by_thread
            .get(&thread)
            .map(|indices| indices.iter().map(|&i| order[i].clone()).collect())
            .unwrap_or_default()
    }

    /// The event at a given position in the total order, if any.
    pub fn at(&self, position: usize) -> Option<Event> {
        self.order.lock().get(position).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ContainerId;

    fn ev(thread: usize, kind: EventKind, key: ObjectKey, clock: u64) -> Event {
        Event {
            kind,
            key,
            thread: ThreadId(thread),
            clock: Clock::from_raw(clock),
            site: CallSite::new("test.rs", 1, "test"),
            write_origin: if kind == EventKind::Write {
                Some(WriteOrigin::Instrumented)
            } else {
                None
            },
            irregular: false,
        }
    }

    #[test]
    fn push_preserves_total_order() {
        let log = EventLog::new();
        let container = ContainerId(1);
        for i in 0..5 {
            log.push(ev(0, EventKind::Write, ObjectKey::attr(container, "x"), i));
        }
        let events = log.events();
        assert_eq!(events.len(), 5);
        for (i, e) in events.iter().enumerate() {
            assert_eq!(e.clock.value(), i as u64);
        }
    }

    #[test]
    fn per_thread_view_only_contains_that_threads_events() {
        let log = EventLog::new();
        let container = ContainerId(1);
        log.push(ev(0, EventKind::Write, ObjectKey::attr(container, "x"), 0));
        log.push(ev(1, EventKind::Read, ObjectKey::attr(container, "x"), 1));
        log.push(ev(0, EventKind::Read, ObjectKey::attr(container, "x"), 2));

        assert_eq!(log.events_for(ThreadId(0)).len(), 2);
        assert_eq!(log.events_for(ThreadId(1)).len(), 1);
    }

    #[test]
    fn conflicting_access_requires_distinct_threads_and_shared_key() {
        let container = ContainerId(1);
        let key = ObjectKey::attr(container, "value");
        let w0 = ev(0, EventKind::Write, key.clone(), 0);
        let w1_same_thread = ev(0, EventKind::Write, key.clone(), 1);
        let w1_other_thread = ev(1, EventKind::Write, key.clone(), 1);
        let r1_other_thread = ev(1, EventKind::Read, key.clone(), 1);
        let other_key = ev(1, EventKind::Write, ObjectKey::attr(container, "other"), 1);

        assert!(!w0.conflicts_with(&w1_same_thread));
        assert!(w0.conflicts_with(&w1_other_thread));
        assert!(w0.conflicts_with(&r1_other_thread));
        assert!(!w0.conflicts_with(&other_key));
    }

    #[test]
    fn two_reads_never_conflict() {
        let container = ContainerId(1);
        let key = ObjectKey::attr(container, "value");
        let r0 = ev(0, EventKind::Read, key.clone(), 0);
        let r1 = ev(1, EventKind::Read, key, 1);
        assert!(!r0.conflicts_with(&r1));
    }
}
