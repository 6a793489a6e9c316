//! The worker pool.
//!
//! A [`ThreadPool`] keeps between `core_size` and `max_size` worker
//! threads pulling jobs from a [`JobQueue`]. Its whole lifecycle lives in
//! one atomic word, the *control word*, packing the run-state into the
//! top three bits and the live worker count into the rest, so a transition
//! that touches both is observed atomically:
//!
//! ```text
//! RUNNING -> SHUTDOWN -> STOP -> TIDYING -> TERMINATED
//! ```
//!
//! The run-state only ever moves rightward. `SHUTDOWN` stops intake but
//! drains the queue; `STOP` abandons the queue too; `TIDYING` runs the
//! terminated hook; `TERMINATED` wakes everyone in `await_termination`.
//!
//! Each worker owns a private lock held while it executes a job; shutdown
//! probes that lock with `try_lock` to interrupt only the workers that are
//! idle in the queue.
//!
//! # Examples
//!
//! ```
//! use spool::pool::ThreadPool;
//! use std::time::Duration;
//!
//! let pool = ThreadPool::fixed(2);
//! let task = pool.submit(|| 6 * 7).unwrap();
//! assert_eq!(task.get().unwrap(), 42);
//!
//! pool.shutdown();
//! assert!(pool.await_termination(Duration::from_secs(1)));
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{InvokeError, JoinError, RejectedError};
use crate::interrupt::{self, InterruptHandle};
use crate::queue::{CompletionQueue, Job, JobQueue, WorkQueue};
use crate::task::{Runnable, Task};

const COUNT_BITS: u32 = usize::BITS - 3;
const COUNT_MASK: usize = (1 << COUNT_BITS) - 1;

const RUNNING: usize = 0;
const SHUTDOWN: usize = 1 << COUNT_BITS;
const STOP: usize = 2 << COUNT_BITS;
const TIDYING: usize = 3 << COUNT_BITS;
const TERMINATED: usize = 4 << COUNT_BITS;

fn run_state(c: usize) -> usize {
    c & !COUNT_MASK
}

fn worker_count(c: usize) -> usize {
    c & COUNT_MASK
}

fn ctl_of(rs: usize, wc: usize) -> usize {
    rs | wc
}

/// What to do with a job the pool cannot accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectPolicy {
    /// Surface a typed rejection error to the submitter. The default.
    Abort,

    /// Run the job inline on the submitting thread, unless shut down.
    CallerRuns,

    /// Silently drop the job.
    Discard,

    /// Drop the oldest queued job and retry the submission once more.
    DiscardOldest,
}

type BeforeHook = Box<dyn Fn(&dyn Runnable) + Send + Sync>;
type AfterHook = Box<dyn Fn(&dyn Runnable, Option<&(dyn Any + Send)>) + Send + Sync>;
type PlainHook = Box<dyn Fn() + Send + Sync>;

/// One worker: a thread, its idleness lock, and its bookkeeping.
struct Worker {
    id: usize,

    /// Held for the duration of each job. `try_lock` succeeding means the
    /// worker is idle (blocked in the queue), which is exactly when
    /// shutdown may interrupt it.
    running: Mutex<()>,

    /// The worker thread's interrupt handle, registered at startup.
    interrupt: Mutex<Option<Arc<InterruptHandle>>>,

    /// An interrupt requested before the thread registered its handle.
    pending_interrupt: AtomicBool,

    /// Jobs completed by this worker, folded into the pool total on exit.
    completed: AtomicU64,

    /// The job a freshly started worker runs before touching the queue.
    first_task: Mutex<Option<Job>>,
}

impl Worker {
    fn interrupt_now(&self) {
        match &*self.interrupt.lock().unwrap() {
            Some(handle) => handle.interrupt(),
            None => self.pending_interrupt.store(true, Ordering::SeqCst),
        }
    }
}

struct PoolState {
    workers: HashMap<usize, Arc<Worker>>,
    next_id: usize,
    largest_pool_size: usize,
    completed: u64,
}

struct PoolInner {
    /// The control word: run-state in the top bits, worker count below.
    ctl: AtomicUsize,

    queue: Arc<dyn JobQueue>,

    /// Guards the worker set and the completed-task tally.
    main: Mutex<PoolState>,

    /// Signalled when the pool reaches `TERMINATED`.
    termination: Condvar,

    core_size: usize,
    max_size: usize,
    keep_alive: Duration,
    allow_core_timeout: bool,
    name_prefix: String,
    policy: RejectPolicy,

    before_hook: Option<BeforeHook>,
    after_hook: Option<AfterHook>,
    terminated_hook: Option<PlainHook>,

    /// Installed by the scheduled layer to enforce its shutdown policies.
    shutdown_hook: Mutex<Option<PlainHook>>,
}

/// Exit bookkeeping that must run even when the worker thread unwinds
/// (a hook panic, for instance).
struct ExitGuard {
    inner: Arc<PoolInner>,
    worker: Arc<Worker>,
    abrupt: bool,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        PoolInner::process_worker_exit(&self.inner, &self.worker, self.abrupt);
    }
}

impl PoolInner {
    fn is_running(c: usize) -> bool {
        run_state(c) == RUNNING
    }

    fn decrement_worker_count(inner: &Arc<PoolInner>) {
        loop {
            let c = inner.ctl.load(Ordering::SeqCst);
            if inner
                .ctl
                .compare_exchange(c, c - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    fn advance_run_state(inner: &Arc<PoolInner>, target: usize) {
        loop {
            let c = inner.ctl.load(Ordering::SeqCst);
            if run_state(c) >= target {
                return;
            }
            if inner
                .ctl
                .compare_exchange(
                    c,
                    ctl_of(target, worker_count(c)),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                debug!(state = target >> COUNT_BITS, "run-state advanced");
                return;
            }
        }
    }

    /// Tries to reserve a worker slot and start a thread for it.
    ///
    /// The count is bumped by CAS first; every failure after that point
    /// rolls back exactly the one increment that succeeded.
    fn add_worker(inner: &Arc<PoolInner>, first_task: Option<Job>, core: bool) -> bool {
        'retry: loop {
            let mut c = inner.ctl.load(Ordering::SeqCst);
            let rs = run_state(c);

            // New workers are allowed while running, and during SHUTDOWN
            // only to drain a non-empty queue (never with a first task).
            if rs >= SHUTDOWN
                && !(rs == SHUTDOWN && first_task.is_none() && !inner.queue.is_empty())
            {
                return false;
            }

            loop {
                let wc = worker_count(c);
                let bound = if core { inner.core_size } else { inner.max_size };
                if wc >= COUNT_MASK || wc >= bound {
                    return false;
                }
                if inner
                    .ctl
                    .compare_exchange(c, c + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    break 'retry;
                }
                c = inner.ctl.load(Ordering::SeqCst);
                if run_state(c) != rs {
                    continue 'retry;
                }
            }
        }

        // Slot reserved; materialize the worker under the main lock so
        // shutdown sees it before its thread exists.
        let worker;
        {
            let mut state = inner.main.lock().unwrap();
            let rs = run_state(inner.ctl.load(Ordering::SeqCst));
            if rs >= STOP || (rs >= SHUTDOWN && first_task.is_some()) {
                drop(state);
                Self::add_worker_rollback(inner, None);
                return false;
            }
            let id = state.next_id;
            state.next_id += 1;
            worker = Arc::new(Worker {
                id,
                running: Mutex::new(()),
                interrupt: Mutex::new(None),
                pending_interrupt: AtomicBool::new(false),
                completed: AtomicU64::new(0),
                first_task: Mutex::new(first_task),
            });
            state.workers.insert(id, worker.clone());
            let size = state.workers.len();
            if size > state.largest_pool_size {
                state.largest_pool_size = size;
            }
        }

        let name = format!("{}-{}", inner.name_prefix, worker.id);
        let spawn = {
            let inner = inner.clone();
            let worker = worker.clone();
            thread::Builder::new()
                .name(name)
                .spawn(move || Self::run_worker(inner, worker))
        };
        match spawn {
            Ok(_detached) => {
                trace!(id = worker.id, "worker started");
                true
            }
            Err(err) => {
                warn!(%err, "failed to spawn a worker thread");
                Self::add_worker_rollback(inner, Some(worker.id));
                false
            }
        }
    }

    /// Rolls back a reserved worker slot (and set entry, if any).
    fn add_worker_rollback(inner: &Arc<PoolInner>, id: Option<usize>) {
        if let Some(id) = id {
            inner.main.lock().unwrap().workers.remove(&id);
        }
        Self::decrement_worker_count(inner);
        Self::try_terminate(inner);
    }

    /// The worker thread's main loop.
    fn run_worker(inner: Arc<PoolInner>, worker: Arc<Worker>) {
        let handle = interrupt::handle();
        *worker.interrupt.lock().unwrap() = Some(handle.clone());
        if worker.pending_interrupt.swap(false, Ordering::SeqCst) {
            handle.interrupt();
        }

        let mut guard = ExitGuard {
            inner: inner.clone(),
            worker: worker.clone(),
            abrupt: true,
        };

        let mut first = worker.first_task.lock().unwrap().take();
        loop {
            let job = match first.take() {
                Some(job) => job,
                None => match Self::get_task(&inner) {
                    Some(job) => job,
                    None => break,
                },
            };

            // Busy from here: shutdown's try_lock probe will fail.
            let running = worker.running.lock().unwrap();

            // Interrupt hygiene: a stopping pool wants the flag visible to
            // the job; any staler interrupt must not leak into it.
            if run_state(inner.ctl.load(Ordering::SeqCst)) >= STOP {
                handle.interrupt();
            } else {
                interrupt::interrupted();
                if run_state(inner.ctl.load(Ordering::SeqCst)) >= STOP {
                    handle.interrupt();
                }
            }

            // A panicking hook kills the worker; the exit guard still
            // accounts for it and a replacement is started if needed.
            if let Some(hook) = &inner.before_hook {
                hook(job.as_ref());
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.run()));
            worker.completed.fetch_add(1, Ordering::SeqCst);
            match &outcome {
                Ok(()) => {
                    if let Some(hook) = &inner.after_hook {
                        hook(job.as_ref(), None);
                    }
                }
                Err(payload) => {
                    warn!(id = worker.id, "job panicked in worker");
                    if let Some(hook) = &inner.after_hook {
                        hook(job.as_ref(), Some(&**payload));
                    }
                }
            }
            drop(running);

            if outcome.is_err() {
                // Abrupt exit; the guard spawns a replacement.
                return;
            }
        }
        guard.abrupt = false;
    }

    /// Pulls the next job, or `None` when this worker should exit.
    fn get_task(inner: &Arc<PoolInner>) -> Option<Job> {
        let mut timed_out = false;
        loop {
            let c = inner.ctl.load(Ordering::SeqCst);
            let rs = run_state(c);

            // No more work will come: stopping, or shut down with an
            // empty queue.
            if rs >= SHUTDOWN && (rs >= STOP || inner.queue.is_empty()) {
                Self::decrement_worker_count(inner);
                return None;
            }

            let wc = worker_count(c);
            let timed = inner.allow_core_timeout || wc > inner.core_size;

            if (wc > inner.max_size || (timed && timed_out))
                && (wc > 1 || inner.queue.is_empty())
            {
                if inner
                    .ctl
                    .compare_exchange(c, c - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return None;
                }
                continue;
            }

            let pulled = if timed {
                inner.queue.poll_timeout(inner.keep_alive)
            } else {
                inner.queue.take().map(Some)
            };
            match pulled {
                Ok(Some(job)) => return Some(job),
                Ok(None) => timed_out = true,
                Err(_interrupted) => {
                    // Consumed; the loop re-reads the control word to see
                    // what the interrupt meant.
                    interrupt::interrupted();
                    timed_out = false;
                }
            }
        }
    }

    /// Worker exit bookkeeping: fold counters, drop the worker, check for
    /// termination, and keep the pool populated.
    fn process_worker_exit(inner: &Arc<PoolInner>, worker: &Arc<Worker>, abrupt: bool) {
        if abrupt {
            // A normal exit already adjusted the count in get_task.
            Self::decrement_worker_count(inner);
        }
        {
            let mut state = inner.main.lock().unwrap();
            state.completed += worker.completed.load(Ordering::SeqCst);
            state.workers.remove(&worker.id);
        }
        trace!(id = worker.id, abrupt, "worker exited");

        Self::try_terminate(inner);

        let c = inner.ctl.load(Ordering::SeqCst);
        if run_state(c) < STOP {
            if !abrupt {
                let mut min = if inner.allow_core_timeout {
                    0
                } else {
                    inner.core_size
                };
                if min == 0 && !inner.queue.is_empty() {
                    min = 1;
                }
                if worker_count(c) >= min {
                    return;
                }
            }
            Self::add_worker(inner, None, false);
        }
    }

    /// Moves to `TIDYING`/`TERMINATED` when the pool is drained and empty,
    /// or nudges one idle worker so the shutdown signal propagates.
    fn try_terminate(inner: &Arc<PoolInner>) {
        loop {
            let c = inner.ctl.load(Ordering::SeqCst);
            let rs = run_state(c);
            if rs == RUNNING || rs >= TIDYING || (rs == SHUTDOWN && !inner.queue.is_empty()) {
                return;
            }
            if worker_count(c) != 0 {
                Self::interrupt_idle_workers(inner, true);
                return;
            }
            if inner
                .ctl
                .compare_exchange(c, ctl_of(TIDYING, 0), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                if let Some(hook) = &inner.terminated_hook {
                    // The hook may panic; the state still reaches
                    // TERMINATED.
                    let _ = panic::catch_unwind(AssertUnwindSafe(|| hook()));
                }
                inner.ctl.store(ctl_of(TERMINATED, 0), Ordering::SeqCst);
                debug!("pool terminated");
                let _state = inner.main.lock().unwrap();
                inner.termination.notify_all();
                return;
            }
        }
    }

    /// Interrupts workers that are idle (their running lock is free).
    /// `only_one` limits the sweep to a single worker, enough to propagate
    /// a shutdown signal.
    fn interrupt_idle_workers(inner: &Arc<PoolInner>, only_one: bool) {
        {
            let state = inner.main.lock().unwrap();
            for worker in state.workers.values() {
                if let Ok(_idle) = worker.running.try_lock() {
                    worker.interrupt_now();
                }
                if only_one {
                    break;
                }
            }
        }
        // Interrupt flags alone cannot wake a condvar wait.
        inner.queue.wake_all();
    }

    /// Interrupts every worker, idle or busy.
    fn interrupt_workers(inner: &Arc<PoolInner>) {
        {
            let state = inner.main.lock().unwrap();
            for worker in state.workers.values() {
                worker.interrupt_now();
            }
        }
        inner.queue.wake_all();
    }

    fn execute_job(inner: &Arc<PoolInner>, job: Job) -> Result<(), RejectedError> {
        let c = inner.ctl.load(Ordering::SeqCst);
        if worker_count(c) < inner.core_size {
            if Self::add_worker(inner, Some(job.clone()), true) {
                return Ok(());
            }
        }

        let c = inner.ctl.load(Ordering::SeqCst);
        let job = if Self::is_running(c) {
            let probe = job.clone();
            match inner.queue.offer(job) {
                Ok(()) => {
                    // Enqueued; re-check for a shutdown racing past and
                    // make sure someone is there to drain the queue.
                    let recheck = inner.ctl.load(Ordering::SeqCst);
                    if !Self::is_running(recheck) && inner.queue.remove(&probe) {
                        return Self::reject(inner, probe);
                    }
                    if worker_count(recheck) == 0 {
                        Self::add_worker(inner, None, false);
                    }
                    return Ok(());
                }
                Err(refused) => refused,
            }
        } else {
            job
        };

        // Queue refused (full) or pool not running: try a non-core
        // worker, else hand the job to the rejection policy.
        if Self::add_worker(inner, Some(job.clone()), false) {
            return Ok(());
        }
        Self::reject(inner, job)
    }

    fn reject(inner: &Arc<PoolInner>, job: Job) -> Result<(), RejectedError> {
        let c = inner.ctl.load(Ordering::SeqCst);
        debug!(policy = ?inner.policy, "rejecting job");
        match inner.policy {
            RejectPolicy::Abort => Err(if Self::is_running(c) {
                RejectedError::saturated()
            } else {
                RejectedError::shut_down()
            }),
            RejectPolicy::CallerRuns => {
                if Self::is_running(c) {
                    job.run();
                }
                Ok(())
            }
            RejectPolicy::Discard => Ok(()),
            RejectPolicy::DiscardOldest => {
                if Self::is_running(c) {
                    inner.queue.poll();
                    return Self::execute_job(inner, job);
                }
                Ok(())
            }
        }
    }
}

/// A shareable handle to a worker pool. Clones refer to the same pool.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl Clone for ThreadPool {
    fn clone(&self) -> ThreadPool {
        ThreadPool {
            inner: self.inner.clone(),
        }
    }
}

impl ThreadPool {
    /// Starts configuring a pool.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// A pool of exactly `n` long-lived workers over an unbounded queue.
    pub fn fixed(n: usize) -> ThreadPool {
        Builder::new().core_size(n).max_size(n).build()
    }

    /// A pool that grows on demand and retires workers idle for 500 ms,
    /// handing jobs directly from submitters to waiting workers.
    pub fn cached() -> ThreadPool {
        Builder::new()
            .core_size(0)
            .max_size(500)
            .keep_alive(Duration::from_millis(500))
            .queue(Arc::new(crate::queue::HandoffQueue::new()))
            .build()
    }

    /// Hands a job to the pool.
    pub fn execute(&self, job: Job) -> Result<(), RejectedError> {
        PoolInner::execute_job(&self.inner, job)
    }

    /// Runs a closure on the pool.
    pub fn execute_fn(
        &self,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), RejectedError> {
        self.execute(crate::queue::OnceJob::new(f))
    }

    /// Submits a closure, returning a handle to its eventual outcome.
    pub fn submit<T: Send + 'static>(
        &self,
        f: impl FnOnce() -> T + Send + 'static,
    ) -> Result<Task<T>, RejectedError> {
        let task = Task::new(f);
        self.submit_task(&task)?;
        Ok(task)
    }

    /// Submits an existing task object.
    pub fn submit_task<T: Send + 'static>(&self, task: &Task<T>) -> Result<(), RejectedError> {
        self.execute(Arc::new(task.clone()))
    }

    /// Runs every closure and waits for all of them to finish (normally,
    /// exceptionally, or cancelled). Returns the handles in input order.
    ///
    /// A rejection or an interrupt cancels the whole batch.
    pub fn invoke_all<T, F>(
        &self,
        tasks: impl IntoIterator<Item = F>,
    ) -> Result<Vec<Task<T>>, InvokeError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let handles: Vec<Task<T>> = tasks.into_iter().map(Task::new).collect();
        for handle in &handles {
            if let Err(err) = self.submit_task(handle) {
                Self::cancel_all(&handles);
                return Err(InvokeError::Rejected(err));
            }
        }
        for handle in &handles {
            match handle.wait() {
                Err(JoinError::Interrupted) => {
                    Self::cancel_all(&handles);
                    return Err(InvokeError::Interrupted);
                }
                _ => {}
            }
        }
        Ok(handles)
    }

    /// Like [`ThreadPool::invoke_all`], cancelling whatever has not
    /// finished when the deadline passes. The handles are still returned;
    /// the stragglers among them report as cancelled.
    pub fn invoke_all_timeout<T, F>(
        &self,
        tasks: impl IntoIterator<Item = F>,
        timeout: Duration,
    ) -> Result<Vec<Task<T>>, InvokeError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        let handles: Vec<Task<T>> = tasks.into_iter().map(Task::new).collect();
        for handle in &handles {
            if let Err(err) = self.submit_task(handle) {
                Self::cancel_all(&handles);
                return Err(InvokeError::Rejected(err));
            }
        }
        for handle in &handles {
            let left = deadline.saturating_duration_since(Instant::now());
            match handle.wait_timeout(left) {
                Err(JoinError::TimedOut) => {
                    Self::cancel_all(&handles);
                    break;
                }
                Err(JoinError::Interrupted) => {
                    Self::cancel_all(&handles);
                    return Err(InvokeError::Interrupted);
                }
                _ => {}
            }
        }
        Ok(handles)
    }

    /// Runs the closures and returns the first normally-completed value,
    /// cancelling the rest.
    pub fn invoke_any<T, F>(
        &self,
        tasks: impl IntoIterator<Item = F>,
    ) -> Result<T, InvokeError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.invoke_any_inner(tasks, None)
    }

    /// Like [`ThreadPool::invoke_any`] with a deadline.
    pub fn invoke_any_timeout<T, F>(
        &self,
        tasks: impl IntoIterator<Item = F>,
        timeout: Duration,
    ) -> Result<T, InvokeError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.invoke_any_inner(tasks, Some(Instant::now() + timeout))
    }

    fn invoke_any_inner<T, F>(
        &self,
        tasks: impl IntoIterator<Item = F>,
        deadline: Option<Instant>,
    ) -> Result<T, InvokeError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let completion: CompletionQueue<T> = CompletionQueue::new();
        let handles: Vec<Task<T>> = tasks.into_iter().map(Task::new).collect();
        if handles.is_empty() {
            return Err(InvokeError::Empty);
        }
        for handle in &handles {
            completion.register(handle);
            if let Err(err) = self.submit_task(handle) {
                Self::cancel_all(&handles);
                return Err(InvokeError::Rejected(err));
            }
        }

        let mut last = None;
        for _ in 0..handles.len() {
            let finished = match deadline {
                None => completion.take(),
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    match completion.poll_timeout(left) {
                        Ok(Some(task)) => Ok(task),
                        Ok(None) => {
                            Self::cancel_all(&handles);
                            return Err(InvokeError::TimedOut);
                        }
                        Err(err) => Err(err),
                    }
                }
            };
            let finished = match finished {
                Ok(task) => task,
                Err(_interrupted) => {
                    Self::cancel_all(&handles);
                    return Err(InvokeError::Interrupted);
                }
            };
            match finished.get() {
                Ok(value) => {
                    Self::cancel_all(&handles);
                    return Ok(value);
                }
                Err(err) => last = Some(err),
            }
        }
        Self::cancel_all(&handles);
        Err(InvokeError::AllFailed(last.unwrap_or(JoinError::Cancelled)))
    }

    fn cancel_all<T: Send + 'static>(handles: &[Task<T>]) {
        for handle in handles {
            handle.cancel(true);
        }
    }

    /// Begins an orderly shutdown: no new jobs, queued jobs still run.
    /// Idle workers are interrupted so they notice. Idempotent.
    pub fn shutdown(&self) {
        debug!("pool shutdown requested");
        PoolInner::advance_run_state(&self.inner, SHUTDOWN);
        PoolInner::interrupt_idle_workers(&self.inner, false);
        if let Some(hook) = &*self.inner.shutdown_hook.lock().unwrap() {
            hook();
        }
        PoolInner::try_terminate(&self.inner);
    }

    /// Stops the pool: interrupts every worker and returns the jobs that
    /// never ran. Idempotent.
    pub fn shutdown_now(&self) -> Vec<Job> {
        debug!("pool hard stop requested");
        PoolInner::advance_run_state(&self.inner, STOP);
        PoolInner::interrupt_workers(&self.inner);
        let unexecuted = self.inner.queue.drain();
        PoolInner::try_terminate(&self.inner);
        unexecuted
    }

    /// Blocks until the pool terminates or the timeout passes. Returns
    /// whether it terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.main.lock().unwrap();
        loop {
            if run_state(self.inner.ctl.load(Ordering::SeqCst)) >= TERMINATED {
                return true;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            let (guard, _) = self.inner.termination.wait_timeout(state, left).unwrap();
            state = guard;
        }
    }

    /// Ensures at least one worker exists, starting a core (or, with a
    /// zero core size, a single non-core) worker if needed.
    pub(crate) fn ensure_prestart(&self) {
        let c = self.inner.ctl.load(Ordering::SeqCst);
        let wc = worker_count(c);
        if wc < self.inner.core_size {
            PoolInner::add_worker(&self.inner, None, true);
        } else if wc == 0 {
            PoolInner::add_worker(&self.inner, None, false);
        }
    }

    pub(crate) fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.inner.queue
    }

    pub(crate) fn set_shutdown_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.shutdown_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// True once shutdown (of either kind) has begun.
    pub fn is_shutdown(&self) -> bool {
        run_state(self.inner.ctl.load(Ordering::SeqCst)) >= SHUTDOWN
    }

    /// True once the pool has reached `STOP` (queued work is abandoned).
    pub(crate) fn is_stopped(&self) -> bool {
        run_state(self.inner.ctl.load(Ordering::SeqCst)) >= STOP
    }

    /// True while shutting down but not yet terminated.
    pub fn is_terminating(&self) -> bool {
        let rs = run_state(self.inner.ctl.load(Ordering::SeqCst));
        rs >= SHUTDOWN && rs < TERMINATED
    }

    /// True once the pool has fully terminated.
    pub fn is_terminated(&self) -> bool {
        run_state(self.inner.ctl.load(Ordering::SeqCst)) >= TERMINATED
    }

    /// Current number of workers.
    pub fn pool_size(&self) -> usize {
        self.inner.main.lock().unwrap().workers.len()
    }

    /// Workers currently executing a job.
    pub fn active_count(&self) -> usize {
        let state = self.inner.main.lock().unwrap();
        state
            .workers
            .values()
            .filter(|w| w.running.try_lock().is_err())
            .count()
    }

    /// Largest worker count the pool ever reached.
    pub fn largest_pool_size(&self) -> usize {
        self.inner.main.lock().unwrap().largest_pool_size
    }

    /// Total jobs completed by live and dead workers.
    pub fn completed_task_count(&self) -> u64 {
        let state = self.inner.main.lock().unwrap();
        state.completed
            + state
                .workers
                .values()
                .map(|w| w.completed.load(Ordering::SeqCst))
                .sum::<u64>()
    }

    /// Jobs waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.inner.ctl.load(Ordering::SeqCst);
        let rs = match run_state(c) {
            RUNNING => "running",
            SHUTDOWN => "shutdown",
            STOP => "stop",
            TIDYING => "tidying",
            _ => "terminated",
        };
        f.debug_struct("ThreadPool")
            .field("state", &rs)
            .field("workers", &worker_count(c))
            .field("queued", &self.inner.queue.len())
            .finish()
    }
}

/// Pool configuration. Invalid combinations panic at [`Builder::build`].
pub struct Builder {
    core_size: usize,
    max_size: usize,
    keep_alive: Duration,
    allow_core_timeout: bool,
    queue: Option<Arc<dyn JobQueue>>,
    name_prefix: String,
    policy: RejectPolicy,
    before_hook: Option<BeforeHook>,
    after_hook: Option<AfterHook>,
    terminated_hook: Option<PlainHook>,
}

impl Builder {
    fn new() -> Builder {
        Builder {
            core_size: 1,
            max_size: 1,
            keep_alive: Duration::from_secs(60),
            allow_core_timeout: false,
            queue: None,
            name_prefix: String::from("spool-worker"),
            policy: RejectPolicy::Abort,
            before_hook: None,
            after_hook: None,
            terminated_hook: None,
        }
    }

    /// Workers kept alive even when idle (unless core timeout is on).
    pub fn core_size(mut self, core_size: usize) -> Builder {
        self.core_size = core_size;
        self
    }

    /// Hard cap on the number of workers.
    pub fn max_size(mut self, max_size: usize) -> Builder {
        self.max_size = max_size;
        self
    }

    /// How long a timeout-eligible idle worker survives.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Builder {
        self.keep_alive = keep_alive;
        self
    }

    /// Lets even core workers retire after `keep_alive` idle time.
    pub fn allow_core_timeout(mut self, allow: bool) -> Builder {
        self.allow_core_timeout = allow;
        self
    }

    /// The work queue. Defaults to an unbounded FIFO queue.
    pub fn queue(mut self, queue: Arc<dyn JobQueue>) -> Builder {
        self.queue = Some(queue);
        self
    }

    /// Thread-name prefix for workers.
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Builder {
        self.name_prefix = prefix.into();
        self
    }

    /// What happens to jobs the pool cannot accept.
    pub fn reject_policy(mut self, policy: RejectPolicy) -> Builder {
        self.policy = policy;
        self
    }

    /// Called on the worker thread just before each job runs.
    pub fn before_execute(
        mut self,
        hook: impl Fn(&dyn Runnable) + Send + Sync + 'static,
    ) -> Builder {
        self.before_hook = Some(Box::new(hook));
        self
    }

    /// Called on the worker thread after each job, with the panic payload
    /// when the job unwound.
    pub fn after_execute(
        mut self,
        hook: impl Fn(&dyn Runnable, Option<&(dyn Any + Send)>) + Send + Sync + 'static,
    ) -> Builder {
        self.after_hook = Some(Box::new(hook));
        self
    }

    /// Called exactly once when the pool reaches `TIDYING`.
    pub fn on_terminated(mut self, hook: impl Fn() + Send + Sync + 'static) -> Builder {
        self.terminated_hook = Some(Box::new(hook));
        self
    }

    /// Builds the pool.
    ///
    /// Panics on an invalid configuration: `max_size` must be positive and
    /// at least `core_size`, and `keep_alive` must be positive when core
    /// workers may time out.
    pub fn build(self) -> ThreadPool {
        assert!(self.max_size > 0, "maximum size must be positive");
        assert!(
            self.max_size >= self.core_size,
            "maximum size must cover the core size"
        );
        assert!(
            !(self.allow_core_timeout && self.keep_alive.is_zero()),
            "keep-alive must be positive when core workers may time out"
        );
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(WorkQueue::unbounded()));
        ThreadPool {
            inner: Arc::new(PoolInner {
                ctl: AtomicUsize::new(ctl_of(RUNNING, 0)),
                queue,
                main: Mutex::new(PoolState {
                    workers: HashMap::new(),
                    next_id: 0,
                    largest_pool_size: 0,
                    completed: 0,
                }),
                termination: Condvar::new(),
                core_size: self.core_size,
                max_size: self.max_size,
                keep_alive: self.keep_alive,
                allow_core_timeout: self.allow_core_timeout,
                name_prefix: self.name_prefix,
                policy: self.policy,
                before_hook: self.before_hook,
                after_hook: self.after_hook,
                terminated_hook: self.terminated_hook,
                shutdown_hook: Mutex::new(None),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn drain(pool: &ThreadPool) {
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn submit_runs_on_a_worker() {
        let pool = ThreadPool::fixed(2);
        let task = pool.submit(|| thread::current().name().map(String::from)).unwrap();
        let name = task.get().unwrap().unwrap();
        assert!(name.starts_with("spool-worker-"));
        drain(&pool);
    }

    #[test]
    fn fixed_pool_runs_many_jobs_on_few_threads() {
        let pool = ThreadPool::fixed(3);
        let counter = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let c = counter.clone();
                pool.submit(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();
        for t in tasks {
            t.get().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        assert!(pool.pool_size() <= 3);
        assert!(pool.completed_task_count() >= 50);
        drain(&pool);
    }

    #[test]
    fn shutdown_drains_the_queue_first() {
        let pool = ThreadPool::fixed(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let blocker = pool
            .submit(move || {
                release_rx.recv().ok();
            })
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let queued: Vec<_> = (0..5)
            .map(|_| {
                let c = counter.clone();
                pool.submit(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();

        pool.shutdown();
        assert!(pool.is_shutdown());
        // New work is refused after shutdown.
        assert!(pool.submit(|| ()).is_err());

        release_tx.send(()).unwrap();
        blocker.get().unwrap();
        for t in queued {
            t.get().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert!(pool.is_terminated());
    }

    #[test]
    fn shutdown_now_returns_unexecuted_jobs() {
        let pool = ThreadPool::fixed(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let _blocker = pool
            .submit(move || {
                release_rx.recv().ok();
            })
            .unwrap();
        for _ in 0..4 {
            pool.submit(|| ()).unwrap();
        }
        thread::sleep(Duration::from_millis(30));
        let unexecuted = pool.shutdown_now();
        assert_eq!(unexecuted.len(), 4);
        release_tx.send(()).ok();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn shutdown_twice_is_shutdown_once() {
        let pool = ThreadPool::fixed(1);
        pool.submit(|| ()).unwrap().get().unwrap();
        pool.shutdown();
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        pool.shutdown();
        assert!(pool.is_terminated());
    }

    #[test]
    fn bounded_queue_spills_into_extra_workers_then_rejects() {
        let pool = ThreadPool::builder()
            .core_size(1)
            .max_size(2)
            .queue(Arc::new(WorkQueue::bounded(1)))
            .build();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));

        // Occupy both workers and the single queue slot.
        let mut held = Vec::new();
        for _ in 0..3 {
            let rx = release_rx.clone();
            held.push(
                pool.submit(move || {
                    rx.lock().unwrap().recv().ok();
                })
                .unwrap(),
            );
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.pool_size(), 2);

        // Saturated: core busy, queue full, at max size.
        let err = pool.submit(|| ()).unwrap_err();
        assert_eq!(err.to_string(), "rejected execution: queue full and pool saturated");

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        for t in held {
            t.get().unwrap();
        }
        drain(&pool);
    }

    #[test]
    fn caller_runs_policy_executes_inline() {
        let pool = ThreadPool::builder()
            .core_size(1)
            .max_size(1)
            .queue(Arc::new(WorkQueue::bounded(1)))
            .reject_policy(RejectPolicy::CallerRuns)
            .build();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let _busy = pool
            .submit(move || {
                release_rx.recv().ok();
            })
            .unwrap();
        thread::sleep(Duration::from_millis(30));
        pool.submit(|| ()).unwrap(); // fills the queue slot

        let caller = thread::current().id();
        let ran_on = pool.submit(move || thread::current().id() == caller).unwrap();
        release_tx.send(()).unwrap();
        assert!(ran_on.get().unwrap());
        drain(&pool);
    }

    #[test]
    fn discard_policy_drops_silently() {
        let pool = ThreadPool::builder()
            .core_size(1)
            .max_size(1)
            .queue(Arc::new(WorkQueue::bounded(1)))
            .reject_policy(RejectPolicy::Discard)
            .build();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let _busy = pool
            .submit(move || {
                release_rx.recv().ok();
            })
            .unwrap();
        thread::sleep(Duration::from_millis(30));
        pool.submit(|| ()).unwrap();

        let dropped = pool.submit(|| 1).unwrap();
        release_tx.send(()).unwrap();
        // The discarded task never runs and never completes; only its
        // cancellation observer would fire. Give the queue time to drain.
        assert!(matches!(
            dropped.get_timeout(Duration::from_millis(200)),
            Err(JoinError::TimedOut)
        ));
        drain(&pool);
    }

    #[test]
    fn idle_workers_above_core_retire() {
        let pool = ThreadPool::builder()
            .core_size(1)
            .max_size(4)
            .keep_alive(Duration::from_millis(50))
            .queue(Arc::new(WorkQueue::bounded(1)))
            .build();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let mut held = Vec::new();
        for _ in 0..4 {
            let rx = release_rx.clone();
            held.push(pool.submit(move || {
                rx.lock().unwrap().recv().ok();
            }));
        }
        thread::sleep(Duration::from_millis(30));
        let grown = pool.pool_size();
        assert!(grown >= 2, "pool grew to {}", grown);

        for _ in 0..4 {
            release_tx.send(()).ok();
        }
        for t in held.into_iter().flatten() {
            let _ = t.get();
        }
        // Extra workers retire after the keep-alive.
        thread::sleep(Duration::from_millis(400));
        assert_eq!(pool.pool_size(), 1);
        assert_eq!(pool.largest_pool_size(), grown.max(pool.largest_pool_size()));
        drain(&pool);
    }

    #[test]
    fn core_timeout_drains_the_whole_pool() {
        let pool = ThreadPool::builder()
            .core_size(2)
            .max_size(2)
            .keep_alive(Duration::from_millis(40))
            .allow_core_timeout(true)
            .build();
        pool.submit(|| ()).unwrap().get().unwrap();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(pool.pool_size(), 0);

        // And it revives for new work.
        assert_eq!(pool.submit(|| 5).unwrap().get().unwrap(), 5);
        drain(&pool);
    }

    #[test]
    fn a_panicking_job_kills_and_replaces_the_worker() {
        let pool = ThreadPool::fixed(1);
        let doomed: Task<()> = pool.submit(|| panic!("job died")).unwrap();
        assert!(matches!(doomed.get(), Err(JoinError::Panicked(_))));
        // A raw job panic (not wrapped in a Task) unwinds into the worker.
        pool.execute_fn(|| panic!("raw panic")).unwrap();
        thread::sleep(Duration::from_millis(100));
        // The pool still works: the worker was replaced.
        assert_eq!(pool.submit(|| 3).unwrap().get().unwrap(), 3);
        drain(&pool);
    }

    #[test]
    fn hooks_bracket_every_job() {
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let terminated = Arc::new(AtomicUsize::new(0));
        let (b, a, f, t) = (
            before.clone(),
            after.clone(),
            failures.clone(),
            terminated.clone(),
        );
        let pool = ThreadPool::builder()
            .core_size(1)
            .max_size(1)
            .before_execute(move |_| {
                b.fetch_add(1, Ordering::SeqCst);
            })
            .after_execute(move |_, payload| {
                a.fetch_add(1, Ordering::SeqCst);
                if payload.is_some() {
                    f.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_terminated(move || {
                t.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        pool.submit(|| ()).unwrap().get().unwrap();
        pool.execute_fn(|| panic!("hooked panic")).unwrap();
        thread::sleep(Duration::from_millis(100));
        pool.submit(|| ()).unwrap().get().unwrap();

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(before.load(Ordering::SeqCst), 3);
        assert_eq!(after.load(Ordering::SeqCst), 3);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invoke_all_waits_for_everything() {
        let pool = ThreadPool::fixed(4);
        let handles = pool
            .invoke_all((0..8).map(|i| move || i * 2))
            .unwrap();
        let mut results: Vec<i32> = handles.iter().map(|h| h.get().unwrap()).collect();
        results.sort_unstable();
        assert_eq!(results, (0..8).map(|i| i * 2).collect::<Vec<_>>());
        drain(&pool);
    }

    #[test]
    fn invoke_all_timeout_cancels_stragglers() {
        let pool = ThreadPool::fixed(2);
        let handles = pool
            .invoke_all_timeout(
                (0..2).map(|i| {
                    move || {
                        if i == 0 {
                            thread::sleep(Duration::from_millis(5));
                        } else {
                            thread::sleep(Duration::from_secs(10));
                        }
                        i
                    }
                }),
                Duration::from_millis(200),
            )
            .unwrap();
        assert_eq!(handles[0].get().unwrap(), 0);
        assert!(handles[1].is_cancelled());
        pool.shutdown_now();
    }

    #[test]
    fn invoke_any_returns_the_first_success() {
        let pool = ThreadPool::fixed(3);
        let value = pool
            .invoke_any(vec![
                (|| panic!("first fails")) as fn() -> u32,
                || {
                    thread::sleep(Duration::from_millis(20));
                    7
                },
                || {
                    thread::sleep(Duration::from_secs(5));
                    9
                },
            ])
            .unwrap();
        assert_eq!(value, 7);
        pool.shutdown_now();
    }

    #[test]
    fn invoke_any_reports_total_failure() {
        let pool = ThreadPool::fixed(2);
        let result: Result<u32, _> = pool.invoke_any(vec![
            (|| panic!("a")) as fn() -> u32,
            (|| panic!("b")) as fn() -> u32,
        ]);
        assert!(matches!(result, Err(InvokeError::AllFailed(_))));
        assert!(matches!(
            pool.invoke_any(Vec::<fn() -> u32>::new()),
            Err(InvokeError::Empty)
        ));
        drain(&pool);
    }

    #[test]
    fn cached_pool_grows_per_concurrent_job() {
        let pool = ThreadPool::cached();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let mut held = Vec::new();
        for _ in 0..3 {
            let rx = release_rx.clone();
            held.push(
                pool.submit(move || {
                    rx.lock().unwrap().recv().ok();
                })
                .unwrap(),
            );
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.pool_size(), 3);
        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        for t in held {
            t.get().unwrap();
        }
        drain(&pool);
    }

    #[test]
    fn run_state_is_monotonic() {
        let pool = ThreadPool::fixed(1);
        let c0 = pool.inner.ctl.load(Ordering::SeqCst);
        pool.shutdown();
        let c1 = pool.inner.ctl.load(Ordering::SeqCst);
        let _ = pool.shutdown_now();
        let c2 = pool.inner.ctl.load(Ordering::SeqCst);
        assert!(run_state(c0) <= run_state(c1));
        assert!(run_state(c1) <= run_state(c2));
        assert!(pool.await_termination(Duration::from_secs(5)));
        let c3 = pool.inner.ctl.load(Ordering::SeqCst);
        assert!(run_state(c2) <= run_state(c3));
        assert_eq!(run_state(c3), TERMINATED);
    }

    #[test]
    #[should_panic(expected = "maximum size must cover the core size")]
    fn builder_rejects_inverted_sizes() {
        let _ = ThreadPool::builder().core_size(4).max_size(2).build();
    }

    #[test]
    #[should_panic(expected = "keep-alive must be positive")]
    fn builder_rejects_zero_keep_alive_with_core_timeout() {
        let _ = ThreadPool::builder()
            .allow_core_timeout(true)
            .keep_alive(Duration::ZERO)
            .build();
    }
}
