//! Delayed and periodic execution.
//!
//! A [`ScheduledPool`] is a [`ThreadPool`] whose work queue is a
//! [`DelayQueue`]: workers pull with the queue's own timed `take`, so a
//! job surfaces exactly when its trigger passes. Periodic jobs re-enqueue
//! themselves: the future is run *without* being completed
//! ([`crate::task::Task::run_and_reset`]), the trigger is advanced, and
//! the same job object goes back on the heap. Two executions of one
//! periodic job therefore never overlap: the next period is only armed
//! after the previous run returns.
//!
//! # Examples
//!
//! ```
//! use spool::scheduled::ScheduledPool;
//! use std::time::{Duration, Instant};
//!
//! let pool = ScheduledPool::new(1);
//! let start = Instant::now();
//! let handle = pool
//!     .schedule(move || start.elapsed(), Duration::from_millis(20))
//!     .unwrap();
//! assert!(handle.get().unwrap() >= Duration::from_millis(20));
//! pool.shutdown();
//! ```

use std::fmt;
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::delay::{delay_of, DelayQueue, Delayed};
use crate::error::{JoinError, RejectedError};
use crate::pool::{RejectPolicy, ThreadPool};
use crate::queue::{Job, JobQueue};
use crate::task::{Runnable, Task};

/// How a scheduled job repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Period {
    /// Runs once at its trigger.
    OneShot,

    /// Re-arms at `trigger + period`, start to start.
    FixedRate(Duration),

    /// Re-arms at `completion + delay`, end to start.
    FixedDelay(Duration),
}

/// The erased surface of a [`Task`] the scheduling machinery needs.
trait FutureJob: Runnable {
    fn run_and_reset_erased(&self) -> bool;
    fn cancel_erased(&self, interrupt: bool) -> bool;
    fn is_cancelled_erased(&self) -> bool;
}

impl<T: Send + 'static> FutureJob for Task<T> {
    fn run_and_reset_erased(&self) -> bool {
        self.run_and_reset()
    }

    fn cancel_erased(&self, interrupt: bool) -> bool {
        self.cancel(interrupt)
    }

    fn is_cancelled_erased(&self) -> bool {
        self.is_cancelled()
    }
}

/// A future dressed for the delay queue: trigger, period, sequence, and
/// the heap-index back-pointer.
struct ScheduledJob {
    /// Self-reference so `run` can re-enqueue this very object.
    self_ref: Weak<ScheduledJob>,

    /// The executor this job belongs to.
    sched: Weak<SchedInner>,

    /// Next time this job is eligible. Only mutated while the job is out
    /// of the heap, so the heap order never shifts under the queue.
    trigger: Mutex<Instant>,

    period: Period,

    /// Tie-breaker preserving submission order among equal triggers.
    sequence: u64,

    /// Position in the delay heap, -1 while out of it.
    index: AtomicIsize,

    /// The underlying future.
    future: Arc<dyn FutureJob>,
}

impl ScheduledJob {
    fn is_periodic(&self) -> bool {
        self.period != Period::OneShot
    }

    /// Advances the trigger after a successful periodic run.
    fn set_next_trigger(&self) {
        let mut trigger = self.trigger.lock().unwrap();
        match self.period {
            Period::OneShot => {}
            // Fixed rate runs on the original cadence, immune to how long
            // the body took.
            Period::FixedRate(period) => *trigger += period,
            // Fixed delay spaces runs from the end of one to the start of
            // the next.
            Period::FixedDelay(delay) => *trigger = Instant::now() + delay,
        }
    }
}

impl Runnable for ScheduledJob {
    fn run(&self) {
        let periodic = self.is_periodic();
        let sched = match self.sched.upgrade() {
            Some(sched) => sched,
            None => return,
        };
        if !sched.can_run(periodic) {
            self.future.cancel_erased(false);
        } else if !periodic {
            self.future.run();
        } else if self.future.run_and_reset_erased() {
            self.set_next_trigger();
            if let Some(me) = self.self_ref.upgrade() {
                sched.re_execute_periodic(me);
            }
        }
    }

    fn delayed(&self) -> Option<&dyn Delayed> {
        Some(self)
    }
}

impl Delayed for ScheduledJob {
    fn trigger(&self) -> Instant {
        *self.trigger.lock().unwrap()
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn heap_index(&self) -> isize {
        self.index.load(Ordering::Relaxed)
    }

    fn set_heap_index(&self, index: isize) {
        self.index.store(index, Ordering::Relaxed);
    }
}

struct SchedInner {
    pool: ThreadPool,
    queue: Arc<DelayQueue>,
    sequence: AtomicU64,
    continue_periodic_after_shutdown: bool,
    execute_delayed_after_shutdown: bool,
    remove_on_cancel: bool,
}

impl SchedInner {
    /// Whether a job may (still) run under the current run-state.
    fn can_run(&self, periodic: bool) -> bool {
        if !self.pool.is_shutdown() {
            return true;
        }
        if self.pool.is_stopped() {
            return false;
        }
        if periodic {
            self.continue_periodic_after_shutdown
        } else {
            self.execute_delayed_after_shutdown
        }
    }

    /// Puts a periodic job back on the heap for its next period.
    fn re_execute_periodic(&self, job: Arc<ScheduledJob>) {
        if self.can_run(true) {
            let as_job: Job = job.clone();
            let _ = self.queue.offer(as_job.clone());
            if !self.can_run(true) && self.queue.remove(&as_job) {
                job.future.cancel_erased(false);
            } else {
                self.pool.ensure_prestart();
            }
        } else {
            job.future.cancel_erased(false);
        }
    }

    /// The pool's on-shutdown walk: cancel and remove whatever the
    /// shutdown policies exclude.
    fn on_shutdown(&self) {
        let keep_periodic = self.continue_periodic_after_shutdown;
        let keep_delayed = self.execute_delayed_after_shutdown;
        debug!(keep_periodic, keep_delayed, "scheduled pool shutting down");

        if !keep_periodic && !keep_delayed {
            for job in self.queue.drain() {
                if let Some(sched) = as_scheduled(&job) {
                    sched.future.cancel_erased(false);
                }
            }
            return;
        }
        for job in self.queue.drain() {
            let keep = match as_scheduled(&job) {
                Some(sched) if sched.future.is_cancelled_erased() => false,
                Some(sched) if sched.is_periodic() => keep_periodic,
                Some(_) => keep_delayed,
                None => false,
            };
            if keep {
                let _ = self.queue.offer(job);
            } else if let Some(sched) = as_scheduled(&job) {
                trace!(seq = sched.sequence, "cancelling at shutdown");
                sched.future.cancel_erased(false);
            }
        }
    }
}

/// Recovers the scheduled view of a queued job.
fn as_scheduled(job: &Job) -> Option<&ScheduledJob> {
    job.delayed().map(|d| {
        let p = d as *const dyn Delayed as *const ScheduledJob;
        // SAFETY: the scheduled pool's queue is private to this module
        // and only ever holds `ScheduledJob`s, so the `Delayed` view's
        // data pointer is the job itself.
        unsafe { &*p }
    })
}

/// A handle to a scheduled (possibly periodic) job.
///
/// Orders by `(trigger, sequence)`, consistently with the remaining
/// delay.
pub struct ScheduledHandle<T> {
    task: Task<T>,
    job: Arc<ScheduledJob>,
}

impl<T> fmt::Debug for ScheduledHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledHandle")
            .field("task", &self.task)
            .finish()
    }
}

impl<T: Send + 'static> ScheduledHandle<T> {
    /// Time left until the trigger; zero once it has passed.
    pub fn delay(&self) -> Duration {
        delay_of(&*self.job)
    }

    /// Whether this job re-arms after running.
    pub fn is_periodic(&self) -> bool {
        self.job.is_periodic()
    }

    /// Cancels the job. With `remove_on_cancel` set on the pool, the job
    /// also leaves the heap immediately instead of lingering as a
    /// tombstone until its trigger.
    pub fn cancel(&self, interrupt: bool) -> bool {
        let cancelled = self.task.cancel(interrupt);
        if cancelled {
            if let Some(sched) = self.job.sched.upgrade() {
                if sched.remove_on_cancel && self.job.heap_index() >= 0 {
                    let as_job: Job = self.job.clone();
                    sched.queue.remove(&as_job);
                }
            }
        }
        cancelled
    }

    /// True once `cancel` has succeeded.
    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// True once the underlying future has left its initial state. A
    /// periodic job only reports done after cancellation or failure.
    pub fn is_done(&self) -> bool {
        self.task.is_done()
    }

    /// Waits for the outcome; see [`Task::get`]. For a periodic job this
    /// blocks until the series ends (cancellation or failure).
    pub fn get(&self) -> Result<T, JoinError> {
        self.task.get()
    }

    /// Like [`ScheduledHandle::get`] with a deadline.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, JoinError> {
        self.task.get_timeout(timeout)
    }

    /// The underlying task handle.
    pub fn task(&self) -> &Task<T> {
        &self.task
    }
}

impl<T> PartialEq for ScheduledHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.job.sequence == other.job.sequence
    }
}

impl<T> Eq for ScheduledHandle<T> {}

impl<T> PartialOrd for ScheduledHandle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for ScheduledHandle<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let mine = (*self.job.trigger.lock().unwrap(), self.job.sequence);
        let theirs = (*other.job.trigger.lock().unwrap(), other.job.sequence);
        mine.cmp(&theirs)
    }
}

/// A thread pool for delayed and periodic jobs.
pub struct ScheduledPool {
    inner: Arc<SchedInner>,
}

impl Clone for ScheduledPool {
    fn clone(&self) -> ScheduledPool {
        ScheduledPool {
            inner: self.inner.clone(),
        }
    }
}

impl ScheduledPool {
    /// A scheduled pool with `core_size` workers and default policies.
    pub fn new(core_size: usize) -> ScheduledPool {
        ScheduledPool::builder().core_size(core_size).build()
    }

    /// Starts configuring a scheduled pool.
    pub fn builder() -> ScheduledBuilder {
        ScheduledBuilder::new()
    }

    fn next_sequence(&self) -> u64 {
        self.inner.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn make_job<T: Send + 'static>(
        &self,
        task: &Task<T>,
        delay: Duration,
        period: Period,
    ) -> Arc<ScheduledJob> {
        let trigger = Instant::now() + delay;
        let sequence = self.next_sequence();
        let future: Arc<dyn FutureJob> = Arc::new(task.clone());
        let sched = Arc::downgrade(&self.inner);
        Arc::new_cyclic(|self_ref| ScheduledJob {
            self_ref: self_ref.clone(),
            sched,
            trigger: Mutex::new(trigger),
            period,
            sequence,
            index: AtomicIsize::new(-1),
            future,
        })
    }

    /// Enqueues and makes sure a worker exists to serve the trigger.
    fn delayed_execute(&self, job: Arc<ScheduledJob>) -> Result<(), RejectedError> {
        if self.inner.pool.is_shutdown() {
            return Err(RejectedError::shut_down());
        }
        let as_job: Job = job.clone();
        let _ = self.inner.queue.offer(as_job.clone());
        if !self.inner.can_run(job.is_periodic()) && self.inner.queue.remove(&as_job) {
            job.future.cancel_erased(false);
        } else {
            self.inner.pool.ensure_prestart();
        }
        Ok(())
    }

    /// Runs `f` once after `delay`. A zero delay fires immediately.
    pub fn schedule<T: Send + 'static>(
        &self,
        f: impl FnOnce() -> T + Send + 'static,
        delay: Duration,
    ) -> Result<ScheduledHandle<T>, RejectedError> {
        let task = Task::new(f);
        let job = self.make_job(&task, delay, Period::OneShot);
        self.delayed_execute(job.clone())?;
        Ok(ScheduledHandle { task, job })
    }

    /// Runs `f` repeatedly on a fixed cadence: triggers at
    /// `initial_delay`, `initial_delay + period`, `initial_delay +
    /// 2 * period`, … regardless of how long each run takes. Runs never
    /// overlap; a run that overshoots its successor's trigger just starts
    /// the successor late (not concurrently).
    pub fn schedule_at_fixed_rate(
        &self,
        f: impl Fn() + Send + 'static,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<ScheduledHandle<()>, RejectedError> {
        assert!(!period.is_zero(), "period must be positive");
        let task = Task::periodic(f);
        let job = self.make_job(&task, initial_delay, Period::FixedRate(period));
        self.delayed_execute(job.clone())?;
        Ok(ScheduledHandle { task, job })
    }

    /// Runs `f` repeatedly with `delay` between the end of one run and
    /// the start of the next.
    pub fn schedule_with_fixed_delay(
        &self,
        f: impl Fn() + Send + 'static,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<ScheduledHandle<()>, RejectedError> {
        assert!(!delay.is_zero(), "delay must be positive");
        let task = Task::periodic(f);
        let job = self.make_job(&task, initial_delay, Period::FixedDelay(delay));
        self.delayed_execute(job.clone())?;
        Ok(ScheduledHandle { task, job })
    }

    /// Runs `f` as soon as a worker is free.
    pub fn submit<T: Send + 'static>(
        &self,
        f: impl FnOnce() -> T + Send + 'static,
    ) -> Result<ScheduledHandle<T>, RejectedError> {
        self.schedule(f, Duration::ZERO)
    }

    /// Begins an orderly shutdown, applying the configured policies to
    /// the pending schedule. Idempotent.
    pub fn shutdown(&self) {
        self.inner.pool.shutdown();
    }

    /// Stops the pool, returning the jobs still on the heap. Idempotent.
    pub fn shutdown_now(&self) -> Vec<Job> {
        self.inner.pool.shutdown_now()
    }

    /// See [`ThreadPool::await_termination`].
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.pool.await_termination(timeout)
    }

    /// True once shutdown has begun.
    pub fn is_shutdown(&self) -> bool {
        self.inner.pool.is_shutdown()
    }

    /// True once the pool has fully terminated.
    pub fn is_terminated(&self) -> bool {
        self.inner.pool.is_terminated()
    }

    /// Jobs currently on the heap.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Current number of workers.
    pub fn pool_size(&self) -> usize {
        self.inner.pool.pool_size()
    }
}

impl std::fmt::Debug for ScheduledPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledPool")
            .field("pool", &self.inner.pool)
            .field("scheduled", &self.inner.queue.len())
            .finish()
    }
}

/// Configuration for a [`ScheduledPool`].
pub struct ScheduledBuilder {
    core_size: usize,
    name_prefix: String,
    policy: RejectPolicy,
    continue_periodic_after_shutdown: bool,
    execute_delayed_after_shutdown: bool,
    remove_on_cancel: bool,
}

impl ScheduledBuilder {
    fn new() -> ScheduledBuilder {
        ScheduledBuilder {
            core_size: 1,
            name_prefix: String::from("spool-sched"),
            policy: RejectPolicy::Abort,
            continue_periodic_after_shutdown: false,
            execute_delayed_after_shutdown: true,
            remove_on_cancel: false,
        }
    }

    /// Workers serving the schedule.
    pub fn core_size(mut self, core_size: usize) -> ScheduledBuilder {
        self.core_size = core_size;
        self
    }

    /// Thread-name prefix for workers.
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> ScheduledBuilder {
        self.name_prefix = prefix.into();
        self
    }

    /// What happens to jobs submitted after shutdown.
    pub fn reject_policy(mut self, policy: RejectPolicy) -> ScheduledBuilder {
        self.policy = policy;
        self
    }

    /// Keep running periodic jobs after `shutdown`. Default off: shutdown
    /// cancels them.
    pub fn continue_periodic_after_shutdown(mut self, keep: bool) -> ScheduledBuilder {
        self.continue_periodic_after_shutdown = keep;
        self
    }

    /// Run not-yet-due one-shot jobs after `shutdown`. Default on; when
    /// off, shutdown cancels them.
    pub fn execute_delayed_after_shutdown(mut self, keep: bool) -> ScheduledBuilder {
        self.execute_delayed_after_shutdown = keep;
        self
    }

    /// Pull cancelled jobs out of the heap immediately instead of letting
    /// them sit until their trigger. Default off.
    pub fn remove_on_cancel(mut self, remove: bool) -> ScheduledBuilder {
        self.remove_on_cancel = remove;
        self
    }

    /// Builds the scheduled pool.
    pub fn build(self) -> ScheduledPool {
        let queue = Arc::new(DelayQueue::new());
        let pool = ThreadPool::builder()
            .core_size(self.core_size)
            .max_size(usize::MAX)
            // Non-core workers retire quickly, but not with a zero
            // timeout: polling a heap whose head is minutes away must not
            // spin.
            .keep_alive(Duration::from_millis(10))
            .queue(queue.clone() as Arc<dyn JobQueue>)
            .name_prefix(self.name_prefix)
            .reject_policy(self.policy)
            .build();
        let inner = Arc::new(SchedInner {
            pool,
            queue,
            sequence: AtomicU64::new(0),
            continue_periodic_after_shutdown: self.continue_periodic_after_shutdown,
            execute_delayed_after_shutdown: self.execute_delayed_after_shutdown,
            remove_on_cancel: self.remove_on_cancel,
        });
        let hook_target = Arc::downgrade(&inner);
        inner.pool.set_shutdown_hook(move || {
            if let Some(sched) = hook_target.upgrade() {
                sched.on_shutdown();
            }
        });
        ScheduledPool { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn drain(pool: &ScheduledPool) {
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn schedule_fires_after_the_delay() {
        let pool = ScheduledPool::new(1);
        let start = Instant::now();
        let handle = pool
            .schedule(move || start.elapsed(), Duration::from_millis(50))
            .unwrap();
        assert!(handle.delay() <= Duration::from_millis(50));
        let elapsed = handle.get().unwrap();
        assert!(elapsed >= Duration::from_millis(50));
        drain(&pool);
    }

    #[test]
    fn zero_delay_fires_immediately() {
        let pool = ScheduledPool::new(1);
        let handle = pool.submit(|| 11).unwrap();
        assert_eq!(handle.get_timeout(Duration::from_secs(1)).unwrap(), 11);
        drain(&pool);
    }

    #[test]
    fn earlier_jobs_run_first() {
        let pool = ScheduledPool::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        let late = pool
            .schedule(move || o1.lock().unwrap().push("late"), Duration::from_millis(80))
            .unwrap();
        let soon = pool
            .schedule(move || o2.lock().unwrap().push("soon"), Duration::from_millis(20))
            .unwrap();
        assert!(soon < late);
        late.get().unwrap();
        soon.get().unwrap();
        assert_eq!(*order.lock().unwrap(), ["soon", "late"]);
        drain(&pool);
    }

    #[test]
    fn fixed_rate_runs_do_not_overlap_under_a_long_body() {
        let pool = ScheduledPool::builder().core_size(2).build();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let (f, o, r) = (in_flight.clone(), overlaps.clone(), runs.clone());

        let handle = pool
            .schedule_at_fixed_rate(
                move || {
                    if f.fetch_add(1, Ordering::SeqCst) > 0 {
                        o.fetch_add(1, Ordering::SeqCst);
                    }
                    // The body overshoots the period on purpose.
                    thread::sleep(Duration::from_millis(120));
                    r.fetch_add(1, Ordering::SeqCst);
                    f.fetch_sub(1, Ordering::SeqCst);
                },
                Duration::from_millis(10),
                Duration::from_millis(50),
            )
            .unwrap();

        thread::sleep(Duration::from_millis(500));
        handle.cancel(false);
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        // Back-to-back catch-up: roughly every 120 ms, not every 50.
        assert!(runs.load(Ordering::SeqCst) >= 3);
        drain(&pool);
    }

    #[test]
    fn fixed_delay_spaces_runs_from_completion() {
        let pool = ScheduledPool::new(1);
        let stamps: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let s = stamps.clone();
        let handle = pool
            .schedule_with_fixed_delay(
                move || {
                    s.lock().unwrap().push(Instant::now());
                    thread::sleep(Duration::from_millis(40));
                },
                Duration::from_millis(10),
                Duration::from_millis(60),
            )
            .unwrap();
        thread::sleep(Duration::from_millis(400));
        handle.cancel(false);
        let stamps = stamps.lock().unwrap();
        assert!(stamps.len() >= 2);
        for pair in stamps.windows(2) {
            // Start-to-start spacing is at least body + delay.
            assert!(pair[1] - pair[0] >= Duration::from_millis(95));
        }
        drain(&pool);
    }

    #[test]
    fn cancelling_a_periodic_job_stops_the_series() {
        let pool = ScheduledPool::new(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let handle = pool
            .schedule_at_fixed_rate(
                move || {
                    r.fetch_add(1, Ordering::SeqCst);
                },
                Duration::ZERO,
                Duration::from_millis(20),
            )
            .unwrap();
        thread::sleep(Duration::from_millis(110));
        assert!(handle.cancel(false));
        assert!(handle.is_cancelled());
        let after_cancel = runs.load(Ordering::SeqCst);
        assert!(after_cancel >= 2);
        thread::sleep(Duration::from_millis(100));
        assert!(runs.load(Ordering::SeqCst) <= after_cancel + 1);
        drain(&pool);
    }

    #[test]
    fn shutdown_runs_pending_delayed_jobs_by_default() {
        let pool = ScheduledPool::new(1);
        let handle = pool.schedule(|| 21, Duration::from_millis(60)).unwrap();
        pool.shutdown();
        assert_eq!(handle.get().unwrap(), 21);
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn shutdown_can_drop_pending_delayed_jobs() {
        let pool = ScheduledPool::builder()
            .execute_delayed_after_shutdown(false)
            .build();
        let handle = pool.schedule(|| 21, Duration::from_secs(30)).unwrap();
        pool.shutdown();
        assert!(matches!(handle.get(), Err(JoinError::Cancelled)));
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn shutdown_cancels_periodic_jobs_by_default() {
        let pool = ScheduledPool::new(1);
        let handle = pool
            .schedule_at_fixed_rate(|| {}, Duration::ZERO, Duration::from_millis(20))
            .unwrap();
        thread::sleep(Duration::from_millis(70));
        pool.shutdown();
        // The series ends, so the pool can terminate.
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert!(handle.is_cancelled() || handle.is_done());
    }

    #[test]
    fn remove_on_cancel_clears_the_tombstone() {
        let pool = ScheduledPool::builder().remove_on_cancel(true).build();
        let handle = pool.schedule(|| (), Duration::from_secs(60)).unwrap();
        assert_eq!(pool.queue_len(), 1);
        assert!(handle.cancel(false));
        assert_eq!(pool.queue_len(), 0);
        drain(&pool);
    }

    #[test]
    fn cancelled_tombstone_lingers_without_the_option() {
        let pool = ScheduledPool::new(1);
        let handle = pool.schedule(|| (), Duration::from_secs(60)).unwrap();
        assert!(handle.cancel(false));
        assert_eq!(pool.queue_len(), 1);
        drain(&pool);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let pool = ScheduledPool::new(1);
        pool.shutdown();
        let err = pool.schedule(|| (), Duration::ZERO).unwrap_err();
        assert_eq!(err.to_string(), "rejected execution: pool is shut down");
        assert!(pool.await_termination(Duration::from_secs(5)));
    }
}
