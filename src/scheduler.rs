//! The cooperative single-core scheduler (spec.md §4.2).
//!
//! Workers run as real OS threads — so a worker blocked on genuine I/O does
//! not stall the whole replay — but a single *scheduler token* ensures only
//! one of them is ever between "granted the token" and "released it" at a
//! time. [`SchedulerSession`] is the handle a worker routine uses to report
//! events to the active [`DporEngine`] and to park until it is its turn;
//! [`CooperativeScheduler`] is the driver that grants the token according to
//! the engine's decisions.
//!
//! Grounded on `network.rs::PeerDiscovery`'s `DashMap`-backed identity map
//! shape, generalized here to attribute synthetic OS-thread-ids to workers
//! rather than peer node-ids to sockets.

use crate::engine::{DporEngine, ExecutionHandle, LockMode, SyncOutcome};
use crate::event::{CallSite, EventKind, EventLog, ThreadId, WriteOrigin};
use crate::io_bridge::IoEventBridge;
use crate::key::{identity, ObjectKey};
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Identifies a worker within a [`CooperativeScheduler`] run. Shares the
/// engine's thread identity space (worker 0 is always `ThreadId(0)`, etc.).
pub type WorkerId = ThreadId;

fn scheduler_site(function: &'static str) -> CallSite {
    CallSite::new("<scheduler>", 0, function)
}

/// The single run-slot. Exactly one of `None` (no one holds it, the driver
/// decides next) or `Some(t)` (worker `t` may proceed) at any moment.
struct Token {
    current: Mutex<Option<ThreadId>>,
    cv: Condvar,
}

impl Token {
    fn new() -> Self {
        Token {
            current: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    /// Block until `thread` holds the token.
    fn wait_for(&self, thread: ThreadId) {
        let mut current = self.current.lock();
        while *current != Some(thread) {
            self.cv.wait(&mut current);
        }
    }

    /// Grant the token to `thread`.
    fn grant(&self, thread: ThreadId) {
        *self.current.lock() = Some(thread);
        self.cv.notify_all();
    }

    /// Release the token (the holder is done with its turn).
    fn release(&self) {
        *self.current.lock() = None;
        self.cv.notify_all();
    }

    /// Block until the token is free (used by the driver between turns).
    fn wait_for_release(&self) {
        let mut current = self.current.lock();
        while current.is_some() {
            self.cv.wait(&mut current);
        }
    }
}

/// A worker panicked; carried back from [`CooperativeScheduler::run_execution`]
/// so `explore()` can surface it as a `WorkerException` finding rather than a
/// tool failure.
#[derive(Debug, Clone)]
pub struct WorkerPanic {
    pub thread: ThreadId,
    pub message: String,
}

/// Per-worker handle passed into a worker routine. Reports accesses and sync
/// events to the active execution and parks cooperatively at every
/// scheduling point (spec.md §4.2 "Suspension points").
pub struct SchedulerSession {
    engine: Arc<DporEngine>,
    handle: ExecutionHandle,
    thread: ThreadId,
    token: Arc<Token>,
    os_tid: u64,
}

impl SchedulerSession {
    /// This session's worker identity.
    pub fn worker_id(&self) -> WorkerId {
        self.thread
    }

    /// The synthetic OS-thread-id assigned to this worker, used to attribute
    /// I/O bridge events (real `libc::gettid` is not available from stable,
    /// dependency-free std, and pulling in `libc` for one id would be its
    /// own new dependency).
    pub fn os_tid(&self) -> u64 {
        self.os_tid
    }

    /// The event log for the execution this session belongs to.
    pub fn event_log(&self) -> Arc<EventLog> {
        self.engine.event_log(self.handle)
    }

    /// Report a `Read`/`Write` access, parking at a checkpoint boundary until
    /// the engine grants this thread its turn.
    pub fn report_access(
        &self,
        key: ObjectKey,
        kind: EventKind,
        write_origin: Option<WriteOrigin>,
        site: CallSite,
    ) {
        self.token.wait_for(self.thread);
        self.engine
            .report_access(self.handle, self.thread, key, kind, site, write_origin);
        self.token.release();
    }

    /// Report an exclusive lock acquire/release, retrying (cooperatively
    /// parked, not spin-waiting) while the engine reports `Blocked`.
    pub fn report_sync(&self, key: ObjectKey, kind: EventKind, site: CallSite, irregular: bool) -> SyncOutcome {
        self.report_sync_mode(key, kind, site, irregular, LockMode::Exclusive)
    }

    /// As [`SchedulerSession::report_sync`] but for a shared (`SchedRwLock`
    /// read-side) acquire/release.
    pub fn report_sync_shared(&self, key: ObjectKey, kind: EventKind, site: CallSite) -> SyncOutcome {
        self.report_sync_mode(key, kind, site, false, LockMode::Shared)
    }

    fn report_sync_mode(
        &self,
        key: ObjectKey,
        kind: EventKind,
        site: CallSite,
        irregular: bool,
        mode: LockMode,
    ) -> SyncOutcome {
        loop {
            self.token.wait_for(self.thread);
            let outcome = self.engine.report_sync(
                self.handle,
                self.thread,
                kind,
                key.clone(),
                site.clone(),
                irregular,
                mode,
            );
            self.token.release();
            match outcome {
                SyncOutcome::Acquired => return outcome,
                // `report_sync` already marked us Blocked and removed us from
                // `runnable`; the driver will not grant us the token again
                // until whoever holds the lock releases it makes us runnable.
                SyncOutcome::Blocked => continue,
            }
        }
    }

    /// Park this worker on `key` until `ready` reports true, retrying once
    /// per granted turn. Used by the non-mutex sync-primitive substitutes
    /// (`SchedCondvar`, `SchedSemaphore`, `SchedBarrier`, `SchedQueue`), whose
    /// blocking shape the engine's plain lock-holder bookkeeping does not
    /// model (spec.md §4.5: these stalls are caught by the wall-clock
    /// tracker, not the wait-for-cycle walk).
    fn park_until(&self, key: ObjectKey, mut ready: impl FnMut() -> bool) {
        loop {
            self.token.wait_for(self.thread);
            if ready() {
                self.token.release();
                return;
            }
            self.engine.block_thread(self.handle, self.thread, key.clone());
            self.token.release();
        }
    }

    /// Wake a specific parked worker.
    fn wake(&self, waiter: ThreadId) {
        self.engine.unblock_thread(self.handle, waiter);
    }
}

/// Reentrant cooperative mutex. Spec.md §4.2(iii)/(ii): acquire/release are
/// reported to the engine and block cooperatively; re-acquiring from the
/// thread already holding it succeeds without deadlocking.
///
/// # Safety
/// Physical storage is a bare [`UnsafeCell`], not a real lock. This is sound
/// only because the cooperative protocol guarantees at most one worker is
/// ever between "granted the token" and "released it", and every access to
/// `inner` happens while holding an Acquired outcome from the engine for this
/// key — i.e. exactly when this worker, and no other, may touch it.
pub struct SchedMutex<T> {
    inner: UnsafeCell<T>,
    site: CallSite,
}

unsafe impl<T: Send> Send for SchedMutex<T> {}
unsafe impl<T: Send> Sync for SchedMutex<T> {}

impl<T> SchedMutex<T> {
    pub fn new(value: T) -> Self {
        SchedMutex {
            inner: UnsafeCell::new(value),
            site: scheduler_site("SchedMutex::new"),
        }
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::lock(identity(self as *const Self))
    }

    /// Acquire the lock, blocking cooperatively if another worker holds it.
    pub fn lock<'a>(&'a self, session: &'a SchedulerSession) -> SchedMutexGuard<'a, T> {
        session.report_sync(self.key(), EventKind::LockAcquire, self.site.clone(), false);
        SchedMutexGuard { mutex: self, session }
    }
}

#[cfg(test)]
impl<T> SchedMutex<T> {
    fn inner_for_test(&self) -> &T {
        unsafe { &*self.inner.get() }
    }
}

pub struct SchedMutexGuard<'a, T> {
    mutex: &'a SchedMutex<T>,
    session: &'a SchedulerSession,
}

impl<'a, T> Deref for SchedMutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.inner.get() }
    }
}

impl<'a, T> DerefMut for SchedMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.inner.get() }
    }
}

impl<'a, T> Drop for SchedMutexGuard<'a, T> {
    fn drop(&mut self) {
        let irregular = std::thread::panicking();
        self.session.report_sync(
            self.mutex.key(),
            EventKind::LockRelease,
            self.mutex.site.clone(),
            irregular,
        );
    }
}

/// Cooperative reader/writer lock (spec.md §4.2's sync-primitive substitutes,
/// shared-mode variant).
pub struct SchedRwLock<T> {
    inner: UnsafeCell<T>,
    site: CallSite,
}

unsafe impl<T: Send> Send for SchedRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for SchedRwLock<T> {}

impl<T> SchedRwLock<T> {
    pub fn new(value: T) -> Self {
        SchedRwLock {
            inner: UnsafeCell::new(value),
            site: scheduler_site("SchedRwLock::new"),
        }
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::lock(identity(self as *const Self))
    }

    pub fn read<'a>(&'a self, session: &'a SchedulerSession) -> SchedRwLockReadGuard<'a, T> {
        session.report_sync_shared(self.key(), EventKind::LockAcquire, self.site.clone());
        SchedRwLockReadGuard { lock: self, session }
    }

    pub fn write<'a>(&'a self, session: &'a SchedulerSession) -> SchedRwLockWriteGuard<'a, T> {
        session.report_sync(self.key(), EventKind::LockAcquire, self.site.clone(), false);
        SchedRwLockWriteGuard { lock: self, session }
    }
}

pub struct SchedRwLockReadGuard<'a, T> {
    lock: &'a SchedRwLock<T>,
    session: &'a SchedulerSession,
}

impl<'a, T> Deref for SchedRwLockReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<'a, T> Drop for SchedRwLockReadGuard<'a, T> {
    fn drop(&mut self) {
        self.session
            .report_sync_shared(self.lock.key(), EventKind::LockRelease, self.lock.site.clone());
    }
}

pub struct SchedRwLockWriteGuard<'a, T> {
    lock: &'a SchedRwLock<T>,
    session: &'a SchedulerSession,
}

impl<'a, T> Deref for SchedRwLockWriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<'a, T> DerefMut for SchedRwLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<'a, T> Drop for SchedRwLockWriteGuard<'a, T> {
    fn drop(&mut self) {
        let irregular = std::thread::panicking();
        self.session
            .report_sync(self.lock.key(), EventKind::LockRelease, self.lock.site.clone(), irregular);
    }
}

/// Cooperative condition variable. `wait` releases `mutex` (reporting a
/// `LockRelease`), parks, and re-acquires it once signalled — mirroring
/// `std::sync::Condvar::wait`'s guard-in/guard-out shape.
pub struct SchedCondvar {
    waiters: Mutex<Vec<ThreadId>>,
}

impl SchedCondvar {
    pub fn new() -> Self {
        SchedCondvar { waiters: Mutex::new(Vec::new()) }
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::lock(identity(self as *const Self))
    }

    /// Release `guard`'s mutex, block until notified, then re-acquire it.
    pub fn wait<'a, T>(
        &self,
        session: &'a SchedulerSession,
        guard: SchedMutexGuard<'a, T>,
    ) -> SchedMutexGuard<'a, T> {
        let mutex = guard.mutex;
        drop(guard); // reports LockRelease on the mutex.

        self.waiters.lock().push(session.worker_id());
        session.park_until(self.key(), || !self.waiters.lock().contains(&session.worker_id()));

        mutex.lock(session)
    }

    /// Wake one waiting worker, if any.
    pub fn notify_one(&self, session: &SchedulerSession) {
        if let Some(waiter) = self.waiters.lock().pop() {
            session.wake(waiter);
        }
    }

    /// Wake every waiting worker.
    pub fn notify_all(&self, session: &SchedulerSession) {
        let waiters: Vec<ThreadId> = self.waiters.lock().drain(..).collect();
        for waiter in waiters {
            session.wake(waiter);
        }
    }
}

impl Default for SchedCondvar {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative counting semaphore.
pub struct SchedSemaphore {
    permits: Mutex<u32>,
}

impl SchedSemaphore {
    pub fn new(permits: u32) -> Self {
        SchedSemaphore { permits: Mutex::new(permits) }
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::lock(identity(self as *const Self))
    }

    pub fn acquire(&self, session: &SchedulerSession) {
        session.park_until(self.key(), || {
            let mut permits = self.permits.lock();
            if *permits > 0 {
                *permits -= 1;
                true
            } else {
                false
            }
        });
    }

    pub fn release(&self, session: &SchedulerSession) {
        *self.permits.lock() += 1;
        // Any parked worker may now be able to proceed; wake the whole
        // blocked set registered on this key and let `park_until` re-check.
        session.engine_unblock_all_on(self.key());
    }
}

/// Cooperative barrier for a fixed party size.
pub struct SchedBarrier {
    parties: u32,
    arrived: Mutex<u32>,
}

impl SchedBarrier {
    pub fn new(parties: u32) -> Self {
        SchedBarrier { parties, arrived: Mutex::new(0) }
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::lock(identity(self as *const Self))
    }

    /// Block until `parties` workers have called `wait`.
    pub fn wait(&self, session: &SchedulerSession) {
        {
            let mut arrived = self.arrived.lock();
            *arrived += 1;
            if *arrived == self.parties {
                drop(arrived);
                session.engine_unblock_all_on(self.key());
                return;
            }
        }
        session.park_until(self.key(), || *self.arrived.lock() == self.parties);
    }
}

/// Bounded cooperative queue.
pub struct SchedQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
}

impl<T> SchedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        SchedQueue {
            capacity,
            items: Mutex::new(VecDeque::new()),
        }
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::lock(identity(self as *const Self))
    }

    pub fn push(&self, session: &SchedulerSession, value: T) {
        let cell = Mutex::new(Some(value));
        session.park_until(self.key(), || {
            let mut items = self.items.lock();
            if items.len() < self.capacity {
                if let Some(v) = cell.lock().take() {
                    items.push_back(v);
                }
                true
            } else {
                false
            }
        });
        session.engine_unblock_all_on(self.key());
    }

    pub fn pop(&self, session: &SchedulerSession) -> T {
        let slot: Mutex<Option<T>> = Mutex::new(None);
        session.park_until(self.key(), || {
            let mut items = self.items.lock();
            if let Some(v) = items.pop_front() {
                *slot.lock() = Some(v);
                true
            } else {
                false
            }
        });
        session.engine_unblock_all_on(self.key());
        slot.into_inner().expect("park_until only returns once an item was taken")
    }
}

impl SchedulerSession {
    /// Wake every worker currently blocked on `key`. Semaphores, barriers,
    /// and queues don't track individual waiters the way `SchedCondvar`
    /// does, so a release simply re-offers the token to all of them and
    /// lets each retry its own `ready` check.
    fn engine_unblock_all_on(&self, key: ObjectKey) {
        self.engine.unblock_all_blocked_on(self.handle, key);
    }
}

/// Drives one execution: spawns a worker thread per routine, grants the
/// scheduler token according to the engine's decisions, and drains the I/O
/// bridge at every scheduling point.
pub struct CooperativeScheduler {
    engine: Arc<DporEngine>,
    io_bridge: Option<Arc<IoEventBridge>>,
    next_os_tid: AtomicU64,
}

impl CooperativeScheduler {
    /// A scheduler around a fresh single-execution engine, for unit tests
    /// that only need a [`SchedulerSession`] to drive `Observed`/`ObservedLock`
    /// calls directly without spawning real worker threads.
    pub fn new() -> Self {
        CooperativeScheduler {
            engine: Arc::new(DporEngine::new(1, None, 1)),
            io_bridge: None,
            next_os_tid: AtomicU64::new(1),
        }
    }

    /// A scheduler driving a caller-supplied engine (the normal `explore()`
    /// path, where the engine's lifetime spans many executions).
    pub fn new_with_engine(engine: Arc<DporEngine>) -> Self {
        CooperativeScheduler {
            engine,
            io_bridge: None,
            next_os_tid: AtomicU64::new(1),
        }
    }

    /// Attach an I/O event bridge, polled once per scheduling point.
    pub fn with_io_bridge(mut self, bridge: Arc<IoEventBridge>) -> Self {
        self.io_bridge = Some(bridge);
        self
    }

    pub fn engine(&self) -> &Arc<DporEngine> {
        &self.engine
    }

    /// A session with the token already granted, and no real concurrency —
    /// for direct unit testing of `Observed`/`ObservedLock`/`Sched*` types.
    pub fn session_for_test(&self) -> SchedulerSession {
        let handle = self.engine.begin_execution();
        let token = Arc::new(Token::new());
        token.grant(ThreadId(0));
        SchedulerSession {
            engine: Arc::clone(&self.engine),
            handle,
            thread: ThreadId(0),
            token,
            os_tid: 0,
        }
    }

    /// Run `workers` cooperatively to completion (or deadlock/timeout),
    /// returning the execution summary plus any worker panics observed.
    pub fn run_execution(
        &self,
        handle: ExecutionHandle,
        workers: Vec<Box<dyn FnOnce(&SchedulerSession) + Send>>,
    ) -> (crate::engine::ExecutionSummary, Vec<WorkerPanic>) {
        let token = Arc::new(Token::new());
        let panics: Arc<Mutex<Vec<WorkerPanic>>> = Arc::new(Mutex::new(Vec::new()));
        let mut join_handles = Vec::with_capacity(workers.len());

        for (i, body) in workers.into_iter().enumerate() {
            let thread = ThreadId(i);
            let os_tid = self.next_os_tid.fetch_add(1, Ordering::Relaxed);
            if let Some(bridge) = &self.io_bridge {
                bridge.attribute(os_tid, thread);
            }
            let session = SchedulerSession {
                engine: Arc::clone(&self.engine),
                handle,
                thread,
                token: Arc::clone(&token),
                os_tid,
            };
            let panics = Arc::clone(&panics);
            let io_bridge = self.io_bridge.clone();
            join_handles.push(std::thread::spawn(move || {
                session.token.wait_for(session.thread);
                session.token.release();
                let result = panic::catch_unwind(AssertUnwindSafe(|| body(&session)));
                if let Err(payload) = &result {
                    let message = panic_message(payload);
                    warn!(thread = session.thread.0, %message, "worker panicked");
                    panics.lock().push(WorkerPanic { thread: session.thread, message });
                }
                session.token.wait_for(session.thread);
                session.engine.finish_thread(session.handle, session.thread);
                session.token.release();
                if let Some(bridge) = io_bridge {
                    bridge.forget(os_tid);
                }
            }));
        }

        loop {
            if let Some(bridge) = &self.io_bridge {
                for event in bridge.poll() {
                    self.engine.report_access(
                        handle,
                        event.worker,
                        event.key,
                        event.kind,
                        scheduler_site("io_bridge::poll"),
                        Some(WriteOrigin::IoBridge),
                    );
                }
            }
            if self.engine.is_stalled(handle) {
                trace!("driver observed stall, stopping");
                break;
            }
            match self.engine.schedule(handle) {
                Some(t) => {
                    debug!(thread = t.0, "granting token");
                    token.grant(t);
                    token.wait_for_release();
                }
                None => break,
            }
        }

        for jh in join_handles {
            let _ = jh.join();
        }

        let summary = self.engine.finish_execution(handle);
        let panics = Arc::try_unwrap(panics).map(Mutex::into_inner).unwrap_or_default();
        (summary, panics)
    }
}

impl Default for CooperativeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked with a non-string payload".to_string()
    }
}
