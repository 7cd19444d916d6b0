//! Failure records and bit-exact-where-it-matters trace rendering (spec.md
//! §6 "Trace explanation format", §7 error taxonomy).

use crate::event::{Event, EventKind, ThreadId};
use crate::key::ObjectKey;
use serde::{Deserialize, Serialize};

/// The ordered list of threads scheduled, step by step, during one execution
/// — spec.md §6's `ScheduleTrace`.
pub type ScheduleTrace = Vec<ThreadId>;

/// Default truncation bound for a rendered trace (spec.md §6).
pub const DEFAULT_TRACE_LINES: usize = 15;

/// The non-fatal anomaly categories of spec.md §7 that are reported as
/// [`FailureRecord`]s rather than stopping exploration outright.
/// `InvariantViolation` is not a variant here: it is the normal finding and
/// is carried directly as [`crate::explore::ExploreResult::counterexample`]
/// instead, per spec.md §7's propagation policy ("WorkerException and
/// InvariantViolation stop the current execution and count as findings").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FailureKind {
    /// All runnable workers were blocked on locks forming a wait-for cycle.
    Deadlock {
        /// The threads on the cycle, in detection order.
        cycle: Vec<ThreadId>,
    },
    /// No scheduling progress occurred before `deadlock_timeout` elapsed.
    TimeoutPerExecution,
    /// A worker raised an uncaught error (panicked).
    WorkerException {
        /// The thread that panicked.
        thread: ThreadId,
        /// The panic payload, stringified.
        message: String,
    },
    /// A `reproduce_on_failure` replay of a counterexample did not reproduce
    /// the original violation — the scheduler failed to be deterministic
    /// for this guiding prefix, which is an `EngineInvariant`-adjacent
    /// finding surfaced as data rather than a panic (spec.md §6
    /// "reproduce_on_failure").
    FlakyReplay {
        /// Which replay attempt (1-indexed) diverged.
        attempt: u32,
        /// What was observed instead of the original violation.
        reason: String,
    },
}

impl FailureKind {
    /// The header line used by [`render_trace`] for this failure.
    pub fn header(&self) -> String {
        match self {
            FailureKind::Deadlock { cycle } => {
                format!(
                    "deadlock: wait-for cycle among threads {:?}",
                    cycle.iter().map(|t| t.0).collect::<Vec<_>>()
                )
            }
            FailureKind::TimeoutPerExecution => {
                "timeout: no scheduling progress before deadlock_timeout elapsed".to_string()
            }
            FailureKind::WorkerException { thread, message } => {
                format!("worker {thread} raised an uncaught error: {message}")
            }
            FailureKind::FlakyReplay { attempt, reason } => {
                format!("replay attempt {attempt} did not reproduce the violation: {reason}")
            }
        }
    }
}

/// One non-fatal anomaly encountered during exploration, with its trace
/// (spec.md §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// What kind of anomaly this was.
    pub kind: FailureKind,
    /// The thread schedule up to the point of the anomaly.
    pub schedule_trace: ScheduleTrace,
    /// The rendered trace text (spec.md §6 format).
    pub rendered_trace: String,
}

/// Render `events` as the bit-exact trace format of spec.md §6:
///
/// ```text
/// <header>
/// Thread <id>  <kind>  <resource-or-key>  at <file>:<line>  (Called from <call-chain>)
/// ...
/// ```
///
/// Truncated at `max_lines` event lines (default [`DEFAULT_TRACE_LINES`]),
/// with a final line noting how many more events were omitted.
pub fn render_trace(header: &str, events: &[Event], max_lines: usize) -> String {
    let mut out = String::new();
    out.push_str(header);
    out.push('\n');

    let shown = events.len().min(max_lines);
    for event in &events[..shown] {
        out.push_str(&render_line(event));
        out.push('\n');
    }

    if events.len() > shown {
        out.push_str(&format!(
            "... ({} more events truncated)\n",
            events.len() - shown
        ));
    }

    out
}

fn render_line(event: &Event) -> String {
    let kind = match event.kind {
        EventKind::Read => "Read",
        EventKind::Write => "Write",
        EventKind::LockAcquire => "LockAcquire",
        EventKind::LockRelease => "LockRelease",
    };
    let resource = render_key(&event.key);
    let call_chain = if event.site.call_chain.is_empty() {
        String::new()
    } else {
        format!("  (Called from {})", event.site.call_chain.join(" ← "))
    };
    format!(
        "Thread {}  {}  {}  at {}:{}{}",
        event.thread, kind, resource, event.site.file, event.site.line, call_chain
    )
}

fn render_key(key: &ObjectKey) -> String {
    match key {
        ObjectKey::InMemory(container, slot) => format!("{:?}.{:?}", container, slot),
        ObjectKey::External(resource_id) => resource_id.clone(),
        ObjectKey::Sync(container) => format!("lock({:?})", container),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockSource;
    use crate::event::{CallSite, WriteOrigin};
    use crate::key::ContainerId;

    fn sample_events(n: usize) -> Vec<Event> {
        let clock = ClockSource::new();
        let container = ContainerId(1);
        (0..n)
            .map(|i| Event {
                kind: EventKind::Write,
                key: ObjectKey::attr(container, "value"),
                thread: ThreadId(i % 2),
                clock: clock.tick(),
                site: CallSite::new("counter.rs", 10 + i as u32, "increment"),
                write_origin: Some(WriteOrigin::Instrumented),
                irregular: false,
            })
            .collect()
    }

    #[test]
    fn header_line_is_first() {
        let events = sample_events(2);
        let trace = render_trace("invariant violated", &events, DEFAULT_TRACE_LINES);
        assert_eq!(trace.lines().next(), Some("invariant violated"));
    }

    #[test]
    fn every_event_renders_one_line_under_the_bound() {
        let events = sample_events(3);
        let trace = render_trace("invariant violated", &events, DEFAULT_TRACE_LINES);
        assert_eq!(trace.lines().count(), 1 + 3);
    }

    #[test]
    fn truncates_at_the_configured_bound() {
        let events = sample_events(20);
        let trace = render_trace("invariant violated", &events, 15);
        let lines: Vec<&str> = trace.lines().collect();
        // header + 15 events + 1 truncation notice
        assert_eq!(lines.len(), 1 + 15 + 1);
        assert!(lines.last().unwrap().contains("5 more events truncated"));
    }

    #[test]
    fn rendered_line_mentions_thread_kind_and_site() {
        let events = sample_events(1);
        let trace = render_trace("invariant violated", &events, DEFAULT_TRACE_LINES);
        assert!(trace.contains("Thread 0"));
        assert!(trace.contains("Write"));
        assert!(trace.contains("counter.rs:10"));
    }

    #[test]
    fn failure_kind_headers_are_distinct_and_informative() {
        let deadlock = FailureKind::Deadlock { cycle: vec![ThreadId(0), ThreadId(1)] };
        let timeout = FailureKind::TimeoutPerExecution;
        let exception = FailureKind::WorkerException { thread: ThreadId(0), message: "boom".into() };
        let flaky = FailureKind::FlakyReplay { attempt: 2, reason: "different outcome".into() };

        assert!(deadlock.header().contains("deadlock"));
        assert!(timeout.header().contains("timeout"));
        assert!(exception.header().contains("boom"));
        assert!(flaky.header().contains("attempt 2"));
    }

    #[test]
    fn failure_record_round_trips_through_serde() {
        let record = FailureRecord {
            kind: FailureKind::TimeoutPerExecution,
            schedule_trace: vec![ThreadId(0), ThreadId(1)],
            rendered_trace: "timeout\n".to_string(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: FailureRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.schedule_trace, record.schedule_trace);
    }
}
