//! Cooperative thread interruption.
//!
//! OS threads cannot be interrupted from the outside, so interruption is a
//! flag-and-wakeup protocol: [`InterruptHandle::interrupt`] raises a flag
//! and unparks the target thread. Every blocking point in this crate
//! re-checks the flag when it wakes and bails out with an interrupted
//! error; task bodies observe it cooperatively through [`is_interrupted`]
//! or [`interrupted`].
//!
//! A thread's handle is created lazily on first use and lives in a
//! thread-local, so handing it to another thread (the way a future records
//! its runner) is just an `Arc` clone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

/// The interrupt status of one thread.
pub struct InterruptHandle {
    /// Set by `interrupt`, cleared by `interrupted` / `clear`.
    flag: AtomicBool,

    /// The owning thread, unparked whenever the flag is raised.
    thread: Thread,
}

impl InterruptHandle {
    fn for_current() -> InterruptHandle {
        InterruptHandle {
            flag: AtomicBool::new(false),
            thread: thread::current(),
        }
    }

    /// Raises the interrupt flag and wakes the thread if it is parked.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.thread.unpark();
    }

    /// Returns the current flag without clearing it.
    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Tests and clears the flag in one step.
    pub fn clear(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }

    /// The thread this handle belongs to.
    pub fn thread(&self) -> &Thread {
        &self.thread
    }
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("thread", &self.thread.name().unwrap_or("<unnamed>"))
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

thread_local! {
    static CURRENT: Arc<InterruptHandle> = Arc::new(InterruptHandle::for_current());
}

/// Returns the calling thread's interrupt handle.
pub fn handle() -> Arc<InterruptHandle> {
    CURRENT.with(Arc::clone)
}

/// Tests and clears the calling thread's interrupt flag.
pub fn interrupted() -> bool {
    CURRENT.with(|h| h.clear())
}

/// Tests the calling thread's interrupt flag without clearing it.
pub fn is_interrupted() -> bool {
    CURRENT.with(|h| h.is_interrupted())
}

/// Re-asserts the calling thread's interrupt flag.
///
/// Blocking operations that convert an interrupt into an error call this
/// first, so the flag survives for callers further up the stack.
pub(crate) fn reassert() {
    CURRENT.with(|h| h.flag.store(true, Ordering::SeqCst));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn flag_is_per_thread() {
        handle().interrupt();
        assert!(is_interrupted());

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || tx.send(is_interrupted()).unwrap());
        assert_eq!(rx.recv().unwrap(), false);

        // `interrupted` clears the flag.
        assert!(interrupted());
        assert!(!is_interrupted());
    }

    #[test]
    fn interrupt_unparks_a_parked_thread() {
        let (tx, rx) = mpsc::channel();
        let t = thread::spawn(move || {
            tx.send(handle()).unwrap();
            while !is_interrupted() {
                thread::park();
            }
        });
        let h = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(10));
        h.interrupt();
        t.join().unwrap();
    }

    #[test]
    fn reassert_restores_the_flag() {
        assert!(!is_interrupted());
        reassert();
        assert!(interrupted());
    }
}
