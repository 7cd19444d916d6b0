//! Deterministic concurrency testing via Dynamic Partial Order Reduction (DPOR).
//!
//! Given a `setup` that builds a fresh world, a list of `worker` routines that
//! share state through [`observed::Observed`] cells and [`scheduler::SchedMutex`]
//! locks, and an `invariant` predicate, [`explore::explore`] enumerates
//! schedules of the workers under a cooperative single-core scheduler and
//! reports the first schedule that falsifies the invariant, together with a
//! trace.
//!
//! # Architecture
//!
//! - **Clock / ObjectKey / Event / EventLog**: the data model of one replay.
//! - **RaceDetector**: computes conflicting accesses with no happens-before
//!   edge between them.
//! - **DporEngine**: the exploration driver — decides which thread runs next,
//!   maintains done/sleep/backtrack sets, and enqueues new schedule prefixes.
//! - **CooperativeScheduler**: the runtime wrapping worker routines, enforcing
//!   one-thread-at-a-time execution.
//! - **IoEventBridge**: attributes external-syscall-shaped events to the
//!   currently running worker.
//!
//! Module-by-module grounding rationale lives in `DESIGN.md` at the
//! repository root.

#![warn(missing_docs)]

pub mod clock;
pub mod deadlock;
pub mod engine;
pub mod event;
pub mod explore;
pub mod io_bridge;
pub mod key;
pub mod observed;
pub mod race;
pub mod scheduler;
pub mod trace;

pub use clock::Clock;
pub use engine::{DporEngine, ExecutionHandle};
pub use event::{CallSite, Event, EventKind, EventLog, ThreadId};
pub use explore::{explore, ExploreOptions, ExploreResult};
pub use key::{ObjectKey, SlotKey};
pub use observed::{Observed, ObservedLock};
pub use scheduler::{CooperativeScheduler, SchedulerSession, WorkerId};
pub use trace::{FailureKind, FailureRecord};

/// Crate version, as published.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors raised by the exploration engine itself.
///
/// Every variant corresponds to one of the error-taxonomy categories of
/// spec.md §7. `InvariantViolation` and `WorkerException` are folded into
/// [`ExploreResult`] rather than returned as `Err`, since they are findings
/// about the program under test, not failures of the tool.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine detected an internal inconsistency in a reported event
    /// (e.g. a release of a lock never acquired by that thread). This is a
    /// programmer error in the instrumentation, not a property of the
    /// program under test, and is always fatal.
    #[error("engine invariant violated: {0}")]
    EngineInvariant(String),

    /// A scheduling decision named a thread that was not runnable.
    #[error("guiding prefix forced non-runnable thread {0:?} at step {1}")]
    ForcedThreadNotRunnable(ThreadId, usize),

    /// `next_execution` was called after exploration already completed.
    #[error("exploration already complete")]
    ExplorationComplete,
}

/// Errors raised by configuration or I/O-bridge plumbing, as distinct from
/// exploration outcomes.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `preemption_bound` or `max_executions` were set to a combination that
    /// cannot explore anything (e.g. `max_executions == 0`).
    #[error("invalid exploration options: {0}")]
    InvalidOptions(String),

    /// A pipe record from the I/O interception layer did not parse as
    /// `kind\tresource_id\tfd\tpid\tos_tid`.
    #[error("malformed io-bridge record: {0:?}")]
    MalformedIoRecord(String),
}

/// Result type for configuration/plumbing operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
