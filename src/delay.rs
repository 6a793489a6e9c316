//! The scheduled executor's delay queue.
//!
//! A min-heap of jobs ordered by `(trigger, sequence)`: earliest trigger
//! first, with insertion order breaking ties. One mutex and one condition
//! variable guard it. Two details carry the design:
//!
//! - **Heap-index back-pointers.** Every scheduled job stores its own
//!   position in the heap, so removal by identity (cancellation) is
//!   `O(log n)` instead of a linear scan.
//! - **Leader/follower waits.** At most one thread (the leader) performs
//!   the timed wait against the root's remaining delay; everyone else
//!   waits unbounded until the leader consumes the root or resigns. This
//!   keeps a pool of workers from all timing out against the same trigger
//!   and stampeding awake.

use std::io;
use std::sync::{Condvar, Mutex};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::queue::{same_job, Job, JobQueue};
use crate::{error, interrupt};

/// The scheduling view of a job the delay queue can hold.
pub trait Delayed {
    /// Absolute time the job becomes eligible to run.
    fn trigger(&self) -> Instant;

    /// Insertion-order tie-breaker.
    fn sequence(&self) -> u64;

    /// Current position in the heap, or -1 when not enqueued.
    fn heap_index(&self) -> isize;

    /// Records the position in the heap. Called under the queue mutex.
    fn set_heap_index(&self, index: isize);
}

/// Remaining delay of a job; zero once the trigger has passed.
pub(crate) fn delay_of(d: &dyn Delayed) -> Duration {
    d.trigger().saturating_duration_since(Instant::now())
}

fn view(job: &Job) -> &dyn Delayed {
    job.delayed()
        .expect("the delay queue holds only scheduled jobs")
}

fn key(job: &Job) -> (Instant, u64) {
    let d = view(job);
    (d.trigger(), d.sequence())
}

struct Heap {
    items: Vec<Job>,

    /// The thread currently doing the timed wait against the root.
    leader: Option<Thread>,
}

impl Heap {
    fn set_index(&self, job: &Job, index: isize) {
        view(job).set_heap_index(index);
    }

    /// Moves `items[k]` up until its parent is no greater.
    fn sift_up(&mut self, mut k: usize) {
        let item = self.items[k].clone();
        while k > 0 {
            let parent = (k - 1) / 2;
            if key(&item) >= key(&self.items[parent]) {
                break;
            }
            self.items[k] = self.items[parent].clone();
            self.set_index(&self.items[k], k as isize);
            k = parent;
        }
        self.items[k] = item;
        self.set_index(&self.items[k], k as isize);
    }

    /// Moves `items[k]` down below any smaller child.
    fn sift_down(&mut self, mut k: usize) {
        let item = self.items[k].clone();
        let len = self.items.len();
        loop {
            let mut child = 2 * k + 1;
            if child >= len {
                break;
            }
            if child + 1 < len && key(&self.items[child + 1]) < key(&self.items[child]) {
                child += 1;
            }
            if key(&item) <= key(&self.items[child]) {
                break;
            }
            self.items[k] = self.items[child].clone();
            self.set_index(&self.items[k], k as isize);
            k = child;
        }
        self.items[k] = item;
        self.set_index(&self.items[k], k as isize);
    }

    /// Removes and returns the root; the last element fills the hole.
    fn finish_poll(&mut self) -> Job {
        let last = self.items.pop().expect("finish_poll on an empty heap");
        let first = if self.items.is_empty() {
            last
        } else {
            let first = std::mem::replace(&mut self.items[0], last);
            self.set_index(&self.items[0], 0);
            self.sift_down(0);
            first
        };
        self.set_index(&first, -1);
        first
    }

    /// Removes the element at `k`; the last element fills the hole and is
    /// sifted whichever way restores the heap.
    fn remove_at(&mut self, k: usize) -> Job {
        let last = self.items.pop().expect("remove_at on an empty heap");
        let removed = if k == self.items.len() {
            last
        } else {
            let filler = last.clone();
            let removed = std::mem::replace(&mut self.items[k], last);
            self.set_index(&self.items[k], k as isize);
            self.sift_down(k);
            if same_job(&self.items[k], &filler) {
                // The filler did not move down, so it may belong up.
                self.sift_up(k);
            }
            removed
        };
        self.set_index(&removed, -1);
        removed
    }
}

/// A blocking queue ordered by trigger time.
pub struct DelayQueue {
    inner: Mutex<Heap>,
    cond: Condvar,
}

impl DelayQueue {
    /// Creates an empty delay queue.
    pub fn new() -> DelayQueue {
        DelayQueue {
            inner: Mutex::new(Heap {
                items: Vec::new(),
                leader: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Root trigger, if any. The queue invariant makes it the minimum.
    pub fn head_trigger(&self) -> Option<Instant> {
        let heap = self.inner.lock().unwrap();
        heap.items.first().map(|j| view(j).trigger())
    }
}

impl Default for DelayQueue {
    fn default() -> DelayQueue {
        DelayQueue::new()
    }
}

impl JobQueue for DelayQueue {
    fn offer(&self, job: Job) -> Result<(), Job> {
        // Panics (rather than refuses) on a non-scheduled job: handing a
        // plain job to a delay queue is a programming error.
        view(&job);
        let inserted = job.clone();
        let mut heap = self.inner.lock().unwrap();
        heap.items.push(job);
        let k = heap.items.len() - 1;
        heap.set_index(&inserted, k as isize);
        heap.sift_up(k);
        if view(&inserted).heap_index() == 0 {
            // The new element became the root: whoever was timing against
            // the old root must recompute its deadline.
            heap.leader = None;
            self.cond.notify_one();
        }
        Ok(())
    }

    fn take(&self) -> io::Result<Job> {
        let me = thread::current();
        let mut heap = self.inner.lock().unwrap();
        let result = loop {
            if interrupt::is_interrupted() {
                break Err(error::interrupted());
            }
            if heap.items.is_empty() {
                heap = self.cond.wait(heap).unwrap();
                continue;
            }
            let delay = delay_of(view(&heap.items[0]));
            if delay.is_zero() {
                break Ok(heap.finish_poll());
            }
            if heap.leader.is_some() {
                // Someone is already timing against the root; follow.
                heap = self.cond.wait(heap).unwrap();
            } else {
                // Become the leader: the one thread whose wait expires
                // exactly at the root's trigger.
                heap.leader = Some(me.clone());
                let (guard, _) = self.cond.wait_timeout(heap, delay).unwrap();
                heap = guard;
                if heap
                    .leader
                    .as_ref()
                    .map_or(false, |t| t.id() == me.id())
                {
                    heap.leader = None;
                }
            }
        };
        // Hand the timed wait to a follower if there is still work and
        // nobody owns it.
        if heap.leader.is_none() && !heap.items.is_empty() {
            self.cond.notify_one();
        }
        result
    }

    fn poll_timeout(&self, timeout: Duration) -> io::Result<Option<Job>> {
        let deadline = Instant::now() + timeout;
        let me = thread::current();
        let mut heap = self.inner.lock().unwrap();
        let result = loop {
            if interrupt::is_interrupted() {
                break Err(error::interrupted());
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if heap.items.is_empty() {
                if left.is_zero() {
                    break Ok(None);
                }
                let (guard, _) = self.cond.wait_timeout(heap, left).unwrap();
                heap = guard;
                continue;
            }
            let delay = delay_of(view(&heap.items[0]));
            if delay.is_zero() {
                break Ok(Some(heap.finish_poll()));
            }
            if left.is_zero() {
                break Ok(None);
            }
            if delay > left || heap.leader.is_some() {
                // Our own deadline fires first, or the timed wait against
                // the root is already owned.
                let (guard, _) = self.cond.wait_timeout(heap, left.min(delay)).unwrap();
                heap = guard;
            } else {
                heap.leader = Some(me.clone());
                let (guard, _) = self.cond.wait_timeout(heap, delay).unwrap();
                heap = guard;
                if heap
                    .leader
                    .as_ref()
                    .map_or(false, |t| t.id() == me.id())
                {
                    heap.leader = None;
                }
            }
        };
        if heap.leader.is_none() && !heap.items.is_empty() {
            self.cond.notify_one();
        }
        result
    }

    fn poll(&self) -> Option<Job> {
        let mut heap = self.inner.lock().unwrap();
        match heap.items.first() {
            Some(root) if delay_of(view(root)).is_zero() => Some(heap.finish_poll()),
            _ => None,
        }
    }

    fn remove(&self, job: &Job) -> bool {
        let mut heap = self.inner.lock().unwrap();
        let index = match job.delayed() {
            Some(d) => d.heap_index(),
            None => return false,
        };
        if index < 0 {
            return false;
        }
        let k = index as usize;
        // The stored index is trusted but verified.
        if k >= heap.items.len() || !same_job(&heap.items[k], job) {
            return false;
        }
        heap.remove_at(k);
        trace!(index = k, "removed scheduled job from the heap");
        true
    }

    fn drain(&self) -> Vec<Job> {
        let mut heap = self.inner.lock().unwrap();
        for job in &heap.items {
            view(job).set_heap_index(-1);
        }
        heap.items.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    fn wake_all(&self) {
        let mut heap = self.inner.lock().unwrap();
        // Deposed so every waiter recomputes its own deadline.
        heap.leader = None;
        self.cond.notify_all();
    }
}
