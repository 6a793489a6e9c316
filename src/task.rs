//! The future state machine.
//!
//! A [`Task`] is a one-shot unit of work plus a handle to its eventual
//! outcome. Its life is a small monotonic state machine:
//!
//! ```text
//! NEW -> COMPLETING -> NORMAL
//! NEW -> COMPLETING -> EXCEPTIONAL
//! NEW -> CANCELLED
//! NEW -> INTERRUPTING -> INTERRUPTED
//! ```
//!
//! Every terminal state is one-shot; the outcome slot is safe to read only
//! after a state greater than `COMPLETING` has been observed. The pieces
//! that make this work without locks: the state is an atomic byte mutated
//! by compare-and-swap, the runner slot is an atomic pointer claimed by
//! the executing thread, and blocked `get` callers sit in a Treiber stack
//! of parked-thread records that completion detaches with a single swap.

use std::cell::UnsafeCell;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use futures::task::AtomicWaker;

use crate::error::{JoinError, Panic};
use crate::interrupt::{self, InterruptHandle};

/// Anything a worker thread can run. Implemented by [`Task`] and by the
/// closure adapters in [`crate::queue`].
pub trait Runnable: Send + Sync {
    /// Executes the unit of work. Must not unwind for task bodies; the
    /// implementations here capture panics into outcomes.
    fn run(&self);

    /// The scheduling view of this job, for jobs that carry a trigger
    /// time. The delay queue accepts only jobs that have one.
    fn delayed(&self) -> Option<&dyn crate::delay::Delayed> {
        None
    }
}

impl fmt::Debug for dyn Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Runnable")
    }
}

const NEW: u8 = 0;
const COMPLETING: u8 = 1;
const NORMAL: u8 = 2;
const EXCEPTIONAL: u8 = 3;
const CANCELLED: u8 = 4;
const INTERRUPTING: u8 = 5;
const INTERRUPTED: u8 = 6;

/// The work closure. One-shot bodies are taken on first run; periodic
/// bodies stay put so `run_and_reset` can call them again.
enum Work<T> {
    Once(Option<Box<dyn FnOnce() -> T + Send>>),
    Periodic(Box<dyn Fn() -> T + Send>),
}

/// A record in the waiter stack: one parked thread waiting for a terminal
/// state.
struct Waiter {
    thread: Thread,

    /// The waiter gave up (timeout or interrupt); skip the unpark and let
    /// completion reclaim the node.
    dead: AtomicBool,

    /// The next node down the stack. Written before the node is published,
    /// read only by the completing thread after it detaches the stack.
    next: AtomicPtr<Waiter>,
}

struct Inner<T> {
    state: AtomicU8,

    /// Guarded by the runner claim: only the thread that won the runner
    /// CAS touches it.
    work: UnsafeCell<Option<Work<T>>>,

    /// Written by the completer before the terminal state is published,
    /// moved out by whichever getter wins `taken`.
    outcome: UnsafeCell<Option<Result<T, Panic>>>,

    /// Gate so exactly one getter moves the outcome out.
    taken: AtomicBool,

    /// Interrupt handle of the executing thread, held for the duration of
    /// the run so `cancel(true)` can reach it.
    runner: AtomicPtr<InterruptHandle>,

    /// Head of the Treiber stack of waiters.
    waiters: AtomicPtr<Waiter>,

    /// Wakes an async caller awaiting the handle.
    waker: AtomicWaker,

    /// Invoked exactly once on entering a terminal state, before waiters
    /// are woken.
    done: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

// SAFETY: the UnsafeCell fields are never accessed concurrently. `work` is
// touched only by the runner-CAS winner; `outcome` is written before the terminal
// state is published (Release) and moved out after it is observed
// (Acquire) by the single `taken`-CAS winner.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Reclaim anything still parked in the atomics. No other thread
        // can hold references here anymore.
        let mut p = self.waiters.swap(ptr::null_mut(), Ordering::AcqRel);
        while !p.is_null() {
            // SAFETY: each published node carries one stack reference,
            // consumed exactly once by whoever detaches it.
            let node = unsafe { Arc::from_raw(p) };
            p = node.next.load(Ordering::Acquire);
        }
        let runner = self.runner.swap(ptr::null_mut(), Ordering::AcqRel);
        if !runner.is_null() {
            // SAFETY: the slot held one strong reference.
            unsafe { drop(Arc::from_raw(runner)) };
        }
    }
}

/// A cancellable, joinable unit of work. Cloning returns another handle to
/// the same task.
///
/// # Examples
///
/// ```
/// use spool::task::Task;
///
/// let task = Task::new(|| 6 * 7);
/// task.run();
/// assert_eq!(task.get().unwrap(), 42);
/// ```
pub struct Task<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Task<T> {
        Task {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Task<T> {
    /// Creates a task around a one-shot body.
    pub fn new(work: impl FnOnce() -> T + Send + 'static) -> Task<T> {
        Task::build(Work::Once(Some(Box::new(work))))
    }

    /// Creates a task whose body can run repeatedly via
    /// [`Task::run_and_reset`]. Used for periodic scheduling.
    pub fn periodic(work: impl Fn() -> T + Send + 'static) -> Task<T> {
        Task::build(Work::Periodic(Box::new(work)))
    }

    fn build(work: Work<T>) -> Task<T> {
        Task {
            inner: Arc::new(Inner {
                state: AtomicU8::new(NEW),
                work: UnsafeCell::new(Some(work)),
                outcome: UnsafeCell::new(None),
                taken: AtomicBool::new(false),
                runner: AtomicPtr::new(ptr::null_mut()),
                waiters: AtomicPtr::new(ptr::null_mut()),
                waker: AtomicWaker::new(),
                done: Mutex::new(None),
            }),
        }
    }

    /// Installs the done hook. Returns false (and drops the hook) if the
    /// task already reached a terminal state or a hook is already set.
    pub fn on_done(&self, hook: impl FnOnce() + Send + 'static) -> bool {
        let mut slot = self.inner.done.lock().unwrap();
        if self.state() > COMPLETING || slot.is_some() {
            return false;
        }
        *slot = Some(Box::new(hook));
        true
    }

    fn state(&self) -> u8 {
        self.inner.state.load(Ordering::Acquire)
    }

    /// Claims the runner slot for the current thread. On success the
    /// caller has exclusive access to the work slot until it releases.
    fn claim_runner(&self) -> bool {
        let me = Arc::into_raw(interrupt::handle()) as *mut InterruptHandle;
        if self
            .inner
            .runner
            .compare_exchange(ptr::null_mut(), me, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            true
        } else {
            // SAFETY: undo the into_raw above; the slot never saw it.
            unsafe { drop(Arc::from_raw(me)) };
            false
        }
    }

    /// Releases the runner slot, first waiting out an in-flight
    /// cancel-interrupt so it cannot leak past this task.
    fn release_runner(&self) {
        while self.state() == INTERRUPTING {
            thread::yield_now();
        }
        let old = self.inner.runner.swap(ptr::null_mut(), Ordering::AcqRel);
        if !old.is_null() {
            // SAFETY: the slot held one strong reference.
            unsafe { drop(Arc::from_raw(old)) };
        }
    }

    /// Executes the body and publishes the outcome.
    ///
    /// A task runs at most once: later calls, calls racing another runner,
    /// and calls after cancellation do nothing.
    pub fn run(&self) {
        if self.state() != NEW || !self.claim_runner() {
            return;
        }
        if self.state() == NEW {
            // SAFETY: the runner claim makes this thread the only one
            // touching the work slot.
            let work = unsafe { &mut *self.inner.work.get() };
            let call = match work {
                Some(Work::Once(slot)) => slot.take().map(|f| {
                    panic::catch_unwind(AssertUnwindSafe(f))
                }),
                Some(Work::Periodic(f)) => {
                    Some(panic::catch_unwind(AssertUnwindSafe(|| f())))
                }
                None => None,
            };
            match call {
                Some(Ok(value)) => {
                    *work = None;
                    self.set(value);
                }
                Some(Err(payload)) => {
                    *work = None;
                    self.set_exception(Panic::new(payload));
                }
                None => {}
            }
        }
        self.release_runner();
    }

    /// Executes a periodic body without completing the task.
    ///
    /// Returns true when the run succeeded and the task is still `NEW`,
    /// i.e. it may be scheduled again.
    pub fn run_and_reset(&self) -> bool {
        if self.state() != NEW || !self.claim_runner() {
            return false;
        }
        let mut ran = false;
        if self.state() == NEW {
            // SAFETY: as in `run`.
            let work = unsafe { &mut *self.inner.work.get() };
            match work {
                Some(Work::Periodic(f)) => match panic::catch_unwind(AssertUnwindSafe(|| f())) {
                    Ok(_value) => ran = true,
                    Err(payload) => {
                        self.set_exception(Panic::new(payload));
                    }
                },
                // A one-shot body cannot reset; complete it instead.
                Some(Work::Once(slot)) => {
                    if let Some(f) = slot.take() {
                        match panic::catch_unwind(AssertUnwindSafe(f)) {
                            Ok(value) => self.set(value),
                            Err(payload) => self.set_exception(Panic::new(payload)),
                        }
                    }
                }
                None => {}
            }
        }
        self.release_runner();
        ran && self.state() == NEW
    }

    fn set(&self, value: T) {
        if self
            .inner
            .state
            .compare_exchange(NEW, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // SAFETY: the COMPLETING claim makes this the only writer;
            // readers wait for a state beyond COMPLETING.
            unsafe { *self.inner.outcome.get() = Some(Ok(value)) };
            self.inner.state.store(NORMAL, Ordering::Release);
            self.finish();
        }
    }

    fn set_exception(&self, panic: Panic) {
        if self
            .inner
            .state
            .compare_exchange(NEW, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // SAFETY: as in `set`.
            unsafe { *self.inner.outcome.get() = Some(Err(panic)) };
            self.inner.state.store(EXCEPTIONAL, Ordering::Release);
            self.finish();
        }
    }

    /// Attempts to cancel. With `interrupt` the running thread's interrupt
    /// flag is raised so a cooperative body can stop early. Returns false
    /// once the task has left `NEW` (it completed or was already
    /// cancelled).
    pub fn cancel(&self, interrupt: bool) -> bool {
        let target = if interrupt { INTERRUPTING } else { CANCELLED };
        if self
            .inner
            .state
            .compare_exchange(NEW, target, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if interrupt {
            // The runner cannot release its slot while the state is
            // INTERRUPTING, so the pointer stays valid here.
            let runner = self.inner.runner.load(Ordering::Acquire);
            if !runner.is_null() {
                // SAFETY: see above; the slot owns the reference and will
                // release it after observing INTERRUPTED.
                unsafe { (*runner).interrupt() };
            }
            self.inner.state.store(INTERRUPTED, Ordering::Release);
        }
        self.finish();
        true
    }

    /// True once `cancel` has succeeded.
    pub fn is_cancelled(&self) -> bool {
        self.state() >= CANCELLED
    }

    /// True once the task has left `NEW` (completing, completed, or
    /// cancelled).
    pub fn is_done(&self) -> bool {
        self.state() != NEW
    }

    /// Runs the done hook, wakes the async waker, then detaches and
    /// unparks the whole waiter stack.
    fn finish(&self) {
        if let Some(hook) = self.inner.done.lock().unwrap().take() {
            hook();
        }
        self.inner.waker.wake();

        let mut p = self.inner.waiters.swap(ptr::null_mut(), Ordering::AcqRel);
        while !p.is_null() {
            // SAFETY: each published node carries one stack reference,
            // consumed exactly once here.
            let node = unsafe { Arc::from_raw(p) };
            if !node.dead.load(Ordering::Acquire) {
                node.thread.unpark();
            }
            p = node.next.load(Ordering::Acquire);
        }
    }

    /// Pushes a waiter record for the current thread, returning a handle
    /// shared with the stack.
    fn push_waiter(&self) -> Arc<Waiter> {
        let node = Arc::new(Waiter {
            thread: thread::current(),
            dead: AtomicBool::new(false),
            next: AtomicPtr::new(ptr::null_mut()),
        });
        let raw = Arc::into_raw(node.clone()) as *mut Waiter;
        loop {
            let head = self.inner.waiters.load(Ordering::Acquire);
            node.next.store(head, Ordering::Relaxed);
            if self
                .inner
                .waiters
                .compare_exchange(head, raw, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                return node;
            }
        }
    }

    /// Parks until the state passes `COMPLETING` or the wait gives up.
    fn wait_done(&self, deadline: Option<Instant>) -> Result<(), JoinError> {
        let mut node: Option<Arc<Waiter>> = None;
        loop {
            if interrupt::is_interrupted() {
                if let Some(n) = &node {
                    n.dead.store(true, Ordering::Release);
                }
                return Err(JoinError::Interrupted);
            }
            let s = self.state();
            if s > COMPLETING {
                if let Some(n) = &node {
                    n.dead.store(true, Ordering::Release);
                }
                return Ok(());
            }
            if s == COMPLETING {
                // The outcome is a store away; don't bother parking.
                thread::yield_now();
                continue;
            }
            match &node {
                None => {
                    // Publish the record first, then re-check the state,
                    // so a completion racing past cannot strand us parked.
                    node = Some(self.push_waiter());
                }
                Some(_) => match deadline {
                    None => thread::park(),
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            if let Some(n) = &node {
                                n.dead.store(true, Ordering::Release);
                            }
                            return Err(JoinError::TimedOut);
                        }
                        thread::park_timeout(d - now);
                    }
                },
            }
        }
    }

    /// Translates an observed terminal state into the outcome.
    fn report(&self) -> Result<T, JoinError> {
        let s = self.state();
        debug_assert!(s > COMPLETING);
        if s >= CANCELLED {
            return Err(JoinError::Cancelled);
        }
        if self
            .inner
            .taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(JoinError::Taken);
        }
        // SAFETY: the terminal state was observed with Acquire and the
        // `taken` gate admits exactly one thread here.
        let outcome = unsafe { (*self.inner.outcome.get()).take() };
        match outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(panic)) => Err(JoinError::Panicked(panic)),
            None => Err(JoinError::Taken),
        }
    }

    /// Blocks until the task completes and returns its outcome.
    ///
    /// The value moves to the first successful caller; concurrent and
    /// later callers observe the same terminal state as
    /// [`JoinError::Taken`]. An interrupt of the waiting thread surfaces
    /// as [`JoinError::Interrupted`] with the flag left asserted.
    pub fn get(&self) -> Result<T, JoinError> {
        self.wait_done(None)?;
        self.report()
    }

    /// Like [`Task::get`] with a deadline. A duration too large to
    /// represent waits unboundedly.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, JoinError> {
        self.wait_done(Instant::now().checked_add(timeout))?;
        self.report()
    }
}

impl<T: Send + 'static> Task<T> {
    /// Blocks until the task reaches a terminal state without touching the
    /// outcome.
    pub fn wait(&self) -> Result<(), JoinError> {
        self.wait_done(None)
    }

    /// Like [`Task::wait`] with a deadline.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), JoinError> {
        self.wait_done(Instant::now().checked_add(timeout))
    }

    /// Returns a non-owning handle to this task.
    pub fn downgrade(&self) -> WeakTask<T> {
        WeakTask {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// A non-owning task handle; upgrades while any strong handle survives.
pub struct WeakTask<T> {
    inner: std::sync::Weak<Inner<T>>,
}

impl<T> WeakTask<T> {
    /// Recovers a strong handle if the task is still alive.
    pub fn upgrade(&self) -> Option<Task<T>> {
        self.inner.upgrade().map(|inner| Task { inner })
    }
}

impl<T> Clone for WeakTask<T> {
    fn clone(&self) -> WeakTask<T> {
        WeakTask {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Runnable for Task<T> {
    fn run(&self) {
        Task::run(self)
    }
}

impl<T: Send + 'static> Future for Task<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Register before checking so a completion in between still wakes
        // this waker.
        self.inner.waker.register(cx.waker());
        if self.state() > COMPLETING {
            Poll::Ready(self.report())
        } else {
            Poll::Pending
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self.inner.state.load(Ordering::Acquire) {
            NEW => "new",
            COMPLETING => "completing",
            NORMAL => "normal",
            EXCEPTIONAL => "exceptional",
            CANCELLED => "cancelled",
            INTERRUPTING => "interrupting",
            _ => "interrupted",
        };
        f.debug_struct("Task").field("state", &s).finish()
    }
}
