//! Error types shared across the crate.
//!
//! The streaming layer speaks [`std::io::Error`] with a fixed set of
//! messages, constructed by the helpers below so that every module reports
//! the same condition with the same text. The executor layer has its own
//! typed errors because task outcomes are values, not I/O failures.

use std::any::Any;
use std::fmt;
use std::io;

use thiserror::Error;

/// The stream was closed before or during the operation.
pub(crate) fn stream_closed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "stream closed")
}

/// The pipe endpoint has not been connected to a peer yet.
pub(crate) fn pipe_not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "pipe not connected")
}

/// The pipe was closed by the reader (or both sides).
pub(crate) fn pipe_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")
}

/// The write side vanished without closing while data was expected.
pub(crate) fn pipe_broken() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe broken")
}

/// The read side vanished without closing while the writer was blocked.
pub(crate) fn read_end_dead() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "read end dead")
}

/// `reset` was called with no valid mark.
pub(crate) fn invalid_mark() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "invalid mark")
}

/// The stream does not support `mark`/`reset` at all.
pub(crate) fn mark_unsupported() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "mark/reset not supported")
}

/// `unread` was called on a full pushback buffer.
pub(crate) fn pushback_full() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "pushback buffer full")
}

/// A blocking stream operation observed the thread's interrupt flag.
///
/// The flag is re-asserted by the caller before this error is returned, so
/// user code higher up the stack can still observe the interruption.
pub(crate) fn interrupted() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "interrupted")
}

/// A captured panic payload from a task body.
///
/// Panics raised inside a task do not unwind through the worker thread;
/// they are caught and stored as the task's outcome. `Panic` wraps the raw
/// payload and knows how to display the common `&str`/`String` cases.
pub struct Panic(Box<dyn Any + Send + 'static>);

impl Panic {
    pub(crate) fn new(payload: Box<dyn Any + Send + 'static>) -> Panic {
        Panic(payload)
    }

    /// Returns the panic message if the payload was a string.
    pub fn message(&self) -> Option<&str> {
        if let Some(s) = self.0.downcast_ref::<&'static str>() {
            Some(s)
        } else if let Some(s) = self.0.downcast_ref::<String>() {
            Some(s)
        } else {
            None
        }
    }

    /// Extracts the raw panic payload.
    pub fn into_payload(self) -> Box<dyn Any + Send + 'static> {
        self.0
    }
}

impl fmt::Debug for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "Panic({:?})", msg),
            None => f.write_str("Panic(..)"),
        }
    }
}

impl fmt::Display for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{}", msg),
            None => f.write_str("non-string panic payload"),
        }
    }
}

/// Why waiting for a task's outcome did not produce a value.
#[derive(Debug, Error)]
pub enum JoinError {
    /// The task was cancelled before it completed.
    #[error("cancelled")]
    Cancelled,

    /// The task body panicked; the payload is the task's outcome.
    #[error("execution failed: {0}")]
    Panicked(Panic),

    /// The task completed normally but an earlier `get` already moved the
    /// value out.
    #[error("outcome already taken")]
    Taken,

    /// The current thread's interrupt flag was set while waiting. The flag
    /// is re-asserted before this is returned.
    #[error("interrupted")]
    Interrupted,

    /// The deadline passed before the task reached a terminal state.
    #[error("timed out")]
    TimedOut,
}

impl JoinError {
    /// `true` for the outcomes that describe the task itself rather than
    /// the wait (`Cancelled`, `Panicked`, `Taken`).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JoinError::Interrupted | JoinError::TimedOut)
    }
}

/// A task was refused by the pool.
#[derive(Debug, Error)]
#[error("rejected execution: {reason}")]
pub struct RejectedError {
    pub(crate) reason: &'static str,
}

impl RejectedError {
    pub(crate) fn shut_down() -> RejectedError {
        RejectedError {
            reason: "pool is shut down",
        }
    }

    pub(crate) fn saturated() -> RejectedError {
        RejectedError {
            reason: "queue full and pool saturated",
        }
    }
}

/// Why `invoke_any` did not produce a value.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// No task was given to run.
    #[error("nothing to invoke")]
    Empty,

    /// Every task failed or was cancelled; the last failure is attached.
    #[error("all tasks failed: {0}")]
    AllFailed(JoinError),

    /// The pool refused the tasks.
    #[error(transparent)]
    Rejected(#[from] RejectedError),

    /// The deadline passed before any task completed normally.
    #[error("timed out")]
    TimedOut,

    /// The calling thread was interrupted while waiting.
    #[error("interrupted")]
    Interrupted,
}
