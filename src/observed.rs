//! Typed state-trait substitute for the shadow-stack interpreter.
//!
//! Per SPEC_FULL.md §4.3 / Design Notes (a): Rust has no comparable runtime
//! reflection hook, so workloads are written against a small typed wrapper
//! whose `get`/`set`/`with_mut` methods emit `report_access` calls to the
//! active [`crate::scheduler::SchedulerSession`], and [`ObservedLock`], whose
//! `lock()` emits `report_sync`. Raw `std` types not wrapped here are
//! invisible to the engine — an explicit, documented observability gap, not
//! an omission.

use crate::event::{CallSite, EventKind, WriteOrigin};
use crate::key::{identity, ObjectKey, SlotKey};
use crate::scheduler::SchedulerSession;
use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};

/// A shared, instrumented memory cell.
///
/// Every [`Observed::get`]/[`Observed::set`]/[`Observed::with_mut`] call
/// reports a `Read`/`Write` access on `InMemory(identity(self), slot)` to the
/// session the cell was built with, where `identity(self)` is this cell's
/// address for the duration of the execution (ObjectKeys are interned per
/// execution and discarded when it ends, per spec.md §3 "Lifecycles").
pub struct Observed<T> {
    slot: SlotKey,
    value: Mutex<T>,
    site: CallSite,
}

impl<T: Clone> Observed<T> {
    /// Wrap a value as an observed named slot (the `obj.x` construct of
    /// spec.md §4.3).
    pub fn new(slot_name: impl Into<String>, value: T) -> Self {
        Observed {
            slot: SlotKey::name(slot_name),
            value: Mutex::new(value),
            site: CallSite::new("<observed>", 0, "Observed::new"),
        }
    }

    /// Wrap a value as an observed indexed subscript.
    pub fn new_indexed(index: u64, value: T) -> Self {
        Observed {
            slot: SlotKey::index(index),
            value: Mutex::new(value),
            site: CallSite::new("<observed>", 0, "Observed::new_indexed"),
        }
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::InMemory(identity(self as *const Self), self.slot.clone())
    }

    /// Read the current value, reporting a `Read` access.
    pub fn get(&self, session: &SchedulerSession) -> T {
        session.report_access(self.key(), EventKind::Read, None, self.site.clone());
        self.value.lock().clone()
    }

    /// Overwrite the value, reporting a `Write` access.
    pub fn set(&self, session: &SchedulerSession, new_value: T) {
        session.report_access(
            self.key(),
            EventKind::Write,
            Some(WriteOrigin::Instrumented),
            self.site.clone(),
        );
        *self.value.lock() = new_value;
    }

    /// Mutate the value in place via `f`, reporting a single `Write` access
    /// (used for the built-in mutator construct of spec.md §4.3: `append`,
    /// `add`, `pop`, `remove`, `update`, ... are all "one Write on the
    /// receiver's key with slot `*`" when the receiver itself is an
    /// `Observed<Vec<_>>`/`Observed<HashMap<_,_>>`).
    pub fn with_mut<R>(&self, session: &SchedulerSession, f: impl FnOnce(&mut T) -> R) -> R {
        session.report_access(
            self.key(),
            EventKind::Write,
            Some(WriteOrigin::Instrumented),
            self.site.clone(),
        );
        let mut guard = self.value.lock();
        f(&mut guard)
    }

    /// Attach call-chain metadata to subsequent accesses (spec.md §4.3 "Call
    /// chain"), e.g. `observed.with_call_chain(vec!["Counter::increment"])`.
    pub fn with_call_chain(mut self, call_chain: Vec<String>) -> Self {
        self.site = self.site.with_call_chain(call_chain);
        self
    }
}

/// An instrumented lock.
///
/// `lock()` reports `LockAcquire`; dropping the returned guard reports
/// `LockRelease`, even on panic-driven unwind (the guard's `Drop` always
/// fires), which is how this implementation resolves the Open Question
/// about locks held across a panicking worker (SPEC_FULL.md §12.3): the
/// release is always synthesised, tagged `irregular` only when the unwind
/// flag was set at drop time.
pub struct ObservedLock<T> {
    inner: Mutex<T>,
    site: CallSite,
}

impl<T> ObservedLock<T> {
    /// Wrap a value behind an instrumented lock.
    pub fn new(value: T) -> Self {
        ObservedLock {
            inner: Mutex::new(value),
            site: CallSite::new("<observed>", 0, "ObservedLock::new"),
        }
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::lock(identity(self as *const Self))
    }

    /// Acquire the lock, reporting `LockAcquire`. The returned guard reports
    /// `LockRelease` on drop.
    pub fn lock<'a>(&'a self, session: &'a SchedulerSession) -> ObservedLockGuard<'a, T> {
        session.report_sync(self.key(), EventKind::LockAcquire, self.site.clone(), false);
        let guard = self.inner.lock();
        ObservedLockGuard {
            guard: Some(guard),
            key: self.key(),
            site: self.site.clone(),
            session,
        }
    }
}

/// RAII guard returned by [`ObservedLock::lock`]. Reports `LockRelease` when
/// dropped, regardless of whether the drop happens via normal scope exit or
/// stack unwinding from a panic.
pub struct ObservedLockGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    key: ObjectKey,
    site: CallSite,
    session: &'a SchedulerSession,
}

impl<'a, T> Deref for ObservedLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard present until drop")
    }
}

impl<'a, T> DerefMut for ObservedLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard present until drop")
    }
}

impl<'a, T> Drop for ObservedLockGuard<'a, T> {
    fn drop(&mut self) {
        let irregular = std::thread::panicking();
        self.guard = None;
        self.session.report_sync(
            self.key.clone(),
            EventKind::LockRelease,
            self.site.clone(),
            irregular,
        );
    }
}
