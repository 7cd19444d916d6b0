//! Monotonic event-stamp counter for one execution.
//!
//! Every [`crate::Event`] recorded during a replay carries a `Clock` value.
//! Because only one thread ever holds the scheduler token at a time (spec
//! invariant: ties are impossible), a plain `fetch_add` is sufficient — no
//! lock is needed, only atomicity so a trace renderer running concurrently
//! with the control thread sees a consistent snapshot.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A single tick of the per-execution clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Clock(u64);

impl Clock {
    /// The clock value as a plain integer, for trace rendering.
    pub fn value(self) -> u64 {
        self.0
    }

    /// Construct a clock value directly. Only used internally (and by tests)
    /// to build synthetic events; real events always get their clock from a
    /// [`ClockSource`].
    pub(crate) fn from_raw(value: u64) -> Self {
        Clock(value)
    }
}

impl std::fmt::Display for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stamps events with strictly increasing [`Clock`] values for one execution.
///
/// Reset (via [`ClockSource::new`]) at the start of every replay; never
/// shared across executions.
#[derive(Debug, Default)]
pub struct ClockSource {
    next: AtomicU64,
}

impl ClockSource {
    /// Create a fresh clock source starting at tick 0.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// Produce the next clock value, strictly greater than every value this
    /// source has produced before.
    pub fn tick(&self) -> Clock {
        Clock(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// The number of ticks issued so far.
    pub fn ticks_issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_strictly_increase() {
        let clock = ClockSource::new();
        let mut last = clock.tick();
        for _ in 0..100 {
            let next = clock.tick();
            assert!(next > last, "clock must strictly increase");
            last = next;
        }
    }

    #[test]
    fn concurrent_ticks_are_unique() {
        use std::sync::Arc;
        use std::thread;

        let clock = Arc::new(ClockSource::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let clock = Arc::clone(&clock);
            handles.push(thread::spawn(move || {
                (0..500).map(|_| clock.tick()).collect::<Vec<_>>()
            }));
        }

        let mut all: Vec<Clock> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        let before = all.len();
        all.dedup();
        assert_eq!(before, all.len(), "every issued clock tick must be unique");
    }
}
