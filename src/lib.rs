//! Thread pools, scheduled executors, and in-memory streams for blocking
//! I/O.
//!
//! Some work just blocks: it reads from a peer thread, sleeps on a
//! trigger, waits for a pipe to drain. This crate is the toolkit for that
//! world, built from two halves that share a failure philosophy but not a
//! line of runtime state:
//!
//! - **Streams**: an in-memory [`pipe`] between a producer and a consumer
//!   thread, [`buffered`] readers with mark/reset, [`pushback`] lookahead,
//!   [`transcode`]rs between bytes and chars, [`line`]-aware readers, and
//!   an error-suppressing [`print`] layer.
//! - **Executors**: a [`pool`] of worker threads with a packed atomic
//!   lifecycle, [`task`] futures you can cancel, join, or `.await`, and a
//!   [`scheduled`] executor for delayed and periodic jobs driven by a
//!   [`delay`] queue.
//!
//! # Examples
//!
//! Move bytes between two threads through a pipe:
//!
//! ```
//! use spool::pipe::pipe;
//! use std::io::{Read, Write};
//! use std::thread;
//!
//! let (mut reader, mut writer) = pipe(1024);
//! thread::spawn(move || {
//!     writer.write_all(b"hello from the other side").unwrap();
//! });
//!
//! let mut all = Vec::new();
//! reader.read_to_end(&mut all).unwrap();
//! assert_eq!(all, b"hello from the other side");
//! ```
//!
//! Run closures on the shared pool and join their outcomes:
//!
//! ```
//! let task = spool::spawn(|| 6 * 7);
//! assert_eq!(task.get().unwrap(), 42);
//! ```
//!
//! Schedule periodic work:
//!
//! ```
//! use spool::scheduled::ScheduledPool;
//! use std::time::Duration;
//!
//! let pool = ScheduledPool::new(1);
//! let tick = pool
//!     .schedule(|| "tick", Duration::from_millis(10))
//!     .unwrap();
//! assert_eq!(tick.get().unwrap(), "tick");
//! pool.shutdown();
//! ```

#![warn(missing_docs)]

pub mod buffered;
pub mod chars;
pub mod codec;
pub mod delay;
pub mod error;
pub mod interrupt;
pub mod line;
pub mod pipe;
pub mod pool;
pub mod print;
pub mod pushback;
pub mod queue;
pub mod scheduled;
pub mod task;
pub mod transcode;

use std::time::Duration;

use once_cell::sync::Lazy;

use crate::pool::ThreadPool;
use crate::task::Task;

pub use crate::error::{InvokeError, JoinError, Panic, RejectedError};

/// Runs a closure on the crate's shared pool.
///
/// The pool is created on first use, grows on demand, and retires workers
/// idle for half a second, so occasional blocking work costs no standing
/// threads.
///
/// # Examples
///
/// ```
/// let a = spool::spawn(|| 1 + 1);
/// let b = spool::spawn(|| 2 + 2);
/// assert_eq!(a.get().unwrap() + b.get().unwrap(), 6);
/// ```
pub fn spawn<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> Task<T> {
    static SHARED: Lazy<ThreadPool> = Lazy::new(|| {
        ThreadPool::builder()
            .core_size(0)
            .max_size(500)
            .keep_alive(Duration::from_millis(500))
            .queue(std::sync::Arc::new(crate::queue::HandoffQueue::new()))
            .name_prefix("spool-shared")
            .build()
    });
    SHARED
        .submit(f)
        .expect("the shared pool never shuts down")
}
