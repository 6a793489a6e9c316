//! Work queues feeding the thread pool.
//!
//! The pool talks to its queue through the [`JobQueue`] trait, so the same
//! worker loop serves plain FIFO dispatch ([`WorkQueue`]), direct handoff
//! ([`HandoffQueue`]), and time-ordered scheduling
//! ([`crate::delay::DelayQueue`]). Jobs are reference-counted trait
//! objects; identity (pointer equality) is what `remove` matches on.
//!
//! Blocking removals (`take`, `poll_timeout`) observe the calling thread's
//! interrupt flag and fail with an interrupted error, leaving the flag
//! asserted; the worker loop treats that as a nudge to re-check pool
//! state.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::task::{Runnable, Task};
use crate::{error, interrupt};

/// A reference-counted unit of work, as the queues and pool carry it.
pub type Job = Arc<dyn Runnable>;

/// Returns true when the two handles are the same job.
pub(crate) fn same_job(a: &Job, b: &Job) -> bool {
    Arc::ptr_eq(a, b)
}

/// The queue seam between the pool and its work feed.
pub trait JobQueue: Send + Sync {
    /// Non-blocking insert. A refused job is handed back.
    fn offer(&self, job: Job) -> Result<(), Job>;

    /// Blocking removal; fails with an interrupted error when the calling
    /// thread's interrupt flag is observed.
    fn take(&self) -> io::Result<Job>;

    /// Blocking removal with a deadline; `None` on expiry.
    fn poll_timeout(&self, timeout: Duration) -> io::Result<Option<Job>>;

    /// Non-blocking removal.
    fn poll(&self) -> Option<Job>;

    /// Removes a specific job by identity.
    fn remove(&self, job: &Job) -> bool;

    /// Empties the queue, returning everything that was pending.
    fn drain(&self) -> Vec<Job>;

    /// Number of pending jobs.
    fn len(&self) -> usize;

    /// Whether the queue is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes every blocked consumer so it can re-check external state
    /// (used by pool shutdown).
    fn wake_all(&self);
}

/// One bounded condvar wait slice computed against a deadline.
fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// A FIFO queue over a mutex-guarded deque, optionally bounded.
pub struct WorkQueue {
    inner: Mutex<VecDeque<Job>>,
    cond: Condvar,
    capacity: Option<usize>,
}

impl WorkQueue {
    /// Creates a queue with no capacity bound.
    pub fn unbounded() -> WorkQueue {
        WorkQueue {
            inner: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            capacity: None,
        }
    }

    /// Creates a queue that refuses jobs beyond `capacity`.
    pub fn bounded(capacity: usize) -> WorkQueue {
        assert!(capacity > 0, "capacity must be positive");
        WorkQueue {
            inner: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            capacity: Some(capacity),
        }
    }
}

impl JobQueue for WorkQueue {
    fn offer(&self, job: Job) -> Result<(), Job> {
        let mut q = self.inner.lock().unwrap();
        if let Some(cap) = self.capacity {
            if q.len() >= cap {
                return Err(job);
            }
        }
        q.push_back(job);
        self.cond.notify_one();
        Ok(())
    }

    fn take(&self) -> io::Result<Job> {
        let mut q = self.inner.lock().unwrap();
        loop {
            if interrupt::is_interrupted() {
                return Err(error::interrupted());
            }
            if let Some(job) = q.pop_front() {
                return Ok(job);
            }
            q = self.cond.wait(q).unwrap();
        }
    }

    fn poll_timeout(&self, timeout: Duration) -> io::Result<Option<Job>> {
        let deadline = Instant::now() + timeout;
        let mut q = self.inner.lock().unwrap();
        loop {
            if interrupt::is_interrupted() {
                return Err(error::interrupted());
            }
            if let Some(job) = q.pop_front() {
                return Ok(Some(job));
            }
            let left = remaining(deadline);
            if left.is_zero() {
                return Ok(None);
            }
            let (guard, _) = self.cond.wait_timeout(q, left).unwrap();
            q = guard;
        }
    }

    fn poll(&self) -> Option<Job> {
        self.inner.lock().unwrap().pop_front()
    }

    fn remove(&self, job: &Job) -> bool {
        let mut q = self.inner.lock().unwrap();
        match q.iter().position(|j| same_job(j, job)) {
            Some(i) => {
                q.remove(i);
                true
            }
            None => false,
        }
    }

    fn drain(&self) -> Vec<Job> {
        self.inner.lock().unwrap().drain(..).collect()
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    fn wake_all(&self) {
        let _q = self.inner.lock().unwrap();
        self.cond.notify_all();
    }
}

/// A zero-storage handoff queue: an insert succeeds only when a consumer
/// is already waiting, so producers that find nobody home can start a new
/// worker instead. This is what gives the shared pool its grow-on-demand
/// shape.
pub struct HandoffQueue {
    inner: Mutex<Handoff>,
    cond: Condvar,
}

struct Handoff {
    /// The job mid-flight between a producer and a consumer.
    slot: Option<Job>,

    /// Consumers currently blocked in `take`/`poll_timeout`.
    waiting: usize,
}

impl HandoffQueue {
    /// Creates an empty handoff queue.
    pub fn new() -> HandoffQueue {
        HandoffQueue {
            inner: Mutex::new(Handoff {
                slot: None,
                waiting: 0,
            }),
            cond: Condvar::new(),
        }
    }
}

impl Default for HandoffQueue {
    fn default() -> HandoffQueue {
        HandoffQueue::new()
    }
}

impl JobQueue for HandoffQueue {
    fn offer(&self, job: Job) -> Result<(), Job> {
        let mut h = self.inner.lock().unwrap();
        if h.waiting == 0 || h.slot.is_some() {
            return Err(job);
        }
        h.slot = Some(job);
        self.cond.notify_one();
        Ok(())
    }

    fn take(&self) -> io::Result<Job> {
        let mut h = self.inner.lock().unwrap();
        h.waiting += 1;
        loop {
            // Grab a handed-off job even on the way out, so an accepted
            // offer is never stranded.
            if let Some(job) = h.slot.take() {
                h.waiting -= 1;
                return Ok(job);
            }
            if interrupt::is_interrupted() {
                h.waiting -= 1;
                return Err(error::interrupted());
            }
            h = self.cond.wait(h).unwrap();
        }
    }

    fn poll_timeout(&self, timeout: Duration) -> io::Result<Option<Job>> {
        let deadline = Instant::now() + timeout;
        let mut h = self.inner.lock().unwrap();
        h.waiting += 1;
        loop {
            if let Some(job) = h.slot.take() {
                h.waiting -= 1;
                return Ok(Some(job));
            }
            if interrupt::is_interrupted() {
                h.waiting -= 1;
                return Err(error::interrupted());
            }
            let left = remaining(deadline);
            if left.is_zero() {
                h.waiting -= 1;
                return Ok(None);
            }
            let (guard, _) = self.cond.wait_timeout(h, left).unwrap();
            h = guard;
        }
    }

    fn poll(&self) -> Option<Job> {
        self.inner.lock().unwrap().slot.take()
    }

    fn remove(&self, job: &Job) -> bool {
        let mut h = self.inner.lock().unwrap();
        match &h.slot {
            Some(pending) if same_job(pending, job) => {
                h.slot = None;
                true
            }
            _ => false,
        }
    }

    fn drain(&self) -> Vec<Job> {
        self.inner.lock().unwrap().slot.take().into_iter().collect()
    }

    fn len(&self) -> usize {
        usize::from(self.inner.lock().unwrap().slot.is_some())
    }

    fn wake_all(&self) {
        let _h = self.inner.lock().unwrap();
        self.cond.notify_all();
    }
}

/// A one-shot closure as a [`Runnable`] job.
///
/// The closure is taken on first run; running again is a no-op.
pub struct OnceJob {
    work: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl OnceJob {
    /// Wraps a closure into a job.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Arc<OnceJob> {
        Arc::new(OnceJob {
            work: Mutex::new(Some(Box::new(f))),
        })
    }
}

impl Runnable for OnceJob {
    fn run(&self) {
        let work = self.work.lock().unwrap().take();
        if let Some(f) = work {
            f();
        }
    }
}

/// A queue of tasks in completion order, fed by task done hooks.
///
/// Register interest with [`CompletionQueue::register`]; whoever completes
/// a task (a worker, or a canceller) pushes it here before waking its
/// waiters, so a consumer always takes finished tasks in completion order.
pub struct CompletionQueue<T> {
    inner: Arc<CompletionInner<T>>,
}

struct CompletionInner<T> {
    done: Mutex<VecDeque<Task<T>>>,
    cond: Condvar,
}

impl<T: Send + 'static> CompletionQueue<T> {
    /// Creates an empty completion queue.
    pub fn new() -> CompletionQueue<T> {
        CompletionQueue {
            inner: Arc::new(CompletionInner {
                done: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Hooks `task` so it lands here on completion. A task that is
    /// already terminal is pushed immediately.
    pub fn register(&self, task: &Task<T>) {
        let queue: Weak<CompletionInner<T>> = Arc::downgrade(&self.inner);
        let weak = task.downgrade();
        let hooked = task.on_done(move || {
            if let (Some(queue), Some(task)) = (queue.upgrade(), weak.upgrade()) {
                queue.push(task);
            }
        });
        if !hooked {
            self.inner.push(task.clone());
        }
    }

    /// Takes the next completed task, blocking until one finishes.
    pub fn take(&self) -> io::Result<Task<T>> {
        let mut q = self.inner.done.lock().unwrap();
        loop {
            if interrupt::is_interrupted() {
                return Err(error::interrupted());
            }
            if let Some(task) = q.pop_front() {
                return Ok(task);
            }
            q = self.inner.cond.wait(q).unwrap();
        }
    }

    /// Takes the next completed task, waiting at most `timeout`.
    pub fn poll_timeout(&self, timeout: Duration) -> io::Result<Option<Task<T>>> {
        let deadline = Instant::now() + timeout;
        let mut q = self.inner.done.lock().unwrap();
        loop {
            if interrupt::is_interrupted() {
                return Err(error::interrupted());
            }
            if let Some(task) = q.pop_front() {
                return Ok(Some(task));
            }
            let left = remaining(deadline);
            if left.is_zero() {
                return Ok(None);
            }
            let (guard, _) = self.inner.cond.wait_timeout(q, left).unwrap();
            q = guard;
        }
    }

    /// Takes the next completed task if one is already waiting.
    pub fn poll(&self) -> Option<Task<T>> {
        self.inner.done.lock().unwrap().pop_front()
    }
}

impl<T: Send + 'static> Default for CompletionQueue<T> {
    fn default() -> CompletionQueue<T> {
        CompletionQueue::new()
    }
}

impl<T> CompletionInner<T> {
    fn push(&self, task: Task<T>) {
        self.done.lock().unwrap().push_back(task);
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn noop() -> Job {
        OnceJob::new(|| {})
    }

    #[test]
    fn work_queue_is_fifo() {
        let q = WorkQueue::unbounded();
        let a = noop();
        let b = noop();
        q.offer(a.clone()).unwrap();
        q.offer(b.clone()).unwrap();
        assert_eq!(q.len(), 2);
        assert!(same_job(&q.take().unwrap(), &a));
        assert!(same_job(&q.take().unwrap(), &b));
    }

    #[test]
    fn bounded_queue_refuses_overflow() {
        let q = WorkQueue::bounded(1);
        q.offer(noop()).unwrap();
        assert!(q.offer(noop()).is_err());
        q.poll().unwrap();
        q.offer(noop()).unwrap();
    }

    #[test]
    fn remove_matches_identity() {
        let q = WorkQueue::unbounded();
        let a = noop();
        let b = noop();
        q.offer(a.clone()).unwrap();
        assert!(!q.remove(&b));
        assert!(q.remove(&a));
        assert!(q.is_empty());
    }

    #[test]
    fn poll_timeout_expires_without_a_job() {
        let q = WorkQueue::unbounded();
        let start = Instant::now();
        assert!(q.poll_timeout(Duration::from_millis(30)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn take_blocks_until_an_offer() {
        let q = Arc::new(WorkQueue::unbounded());
        let taker = {
            let q = q.clone();
            thread::spawn(move || q.take().unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        let job = noop();
        q.offer(job.clone()).unwrap();
        assert!(same_job(&taker.join().unwrap(), &job));
    }

    #[test]
    fn handoff_refuses_without_a_waiting_consumer() {
        let q = HandoffQueue::new();
        assert!(q.offer(noop()).is_err());
    }

    #[test]
    fn handoff_delivers_to_a_waiting_consumer() {
        let q = Arc::new(HandoffQueue::new());
        let taker = {
            let q = q.clone();
            thread::spawn(move || q.take().unwrap())
        };
        // Wait for the consumer to register, then hand off.
        let job = noop();
        let job2 = job.clone();
        let mut handed = q.offer(job);
        while let Err(back) = handed {
            thread::sleep(Duration::from_millis(5));
            handed = q.offer(back);
        }
        assert!(same_job(&taker.join().unwrap(), &job2));
    }

    #[test]
    fn completion_queue_orders_by_finish_time() {
        let cq: CompletionQueue<u32> = CompletionQueue::new();
        let slow = Task::new(|| 1);
        let fast = Task::new(|| 2);
        cq.register(&slow);
        cq.register(&fast);

        fast.run();
        slow.run();
        assert_eq!(cq.take().unwrap().get().unwrap(), 2);
        assert_eq!(cq.take().unwrap().get().unwrap(), 1);
        assert!(cq.poll().is_none());
    }

    #[test]
    fn registering_a_finished_task_delivers_it_immediately() {
        let cq: CompletionQueue<u32> = CompletionQueue::new();
        let task = Task::new(|| 9);
        task.run();
        cq.register(&task);
        assert_eq!(cq.poll().unwrap().get().unwrap(), 9);
    }

    #[test]
    fn once_job_runs_exactly_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let job = OnceJob::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        job.run();
        job.run();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
