//! A print layer that never raises I/O errors.
//!
//! [`PrintWriter`] swallows every I/O failure from the underlying sink and
//! remembers that something went wrong in an internal `trouble` flag,
//! queryable with [`PrintWriter::check_error`]. This makes call sites that
//! print diagnostics unconditionally safe to sprinkle anywhere. An
//! interrupted write re-asserts the thread's interrupt flag instead of
//! surfacing.

use std::fmt::{self, Display};
use std::io::{self, Write};

use crate::interrupt;

/// A writer whose print operations cannot fail.
///
/// # Examples
///
/// ```
/// use spool::print::PrintWriter;
///
/// let mut w = PrintWriter::new(Vec::new());
/// w.print("answer: ");
/// w.println(42);
/// assert!(!w.check_error());
/// assert_eq!(w.get_ref().unwrap(), b"answer: 42\n");
/// ```
pub struct PrintWriter<W> {
    /// The sink; `None` once closed.
    inner: Option<W>,

    /// Set when any underlying operation failed.
    trouble: bool,

    /// Flush after every `println`.
    autoflush: bool,
}

impl<W: Write> PrintWriter<W> {
    /// Creates a print writer over `inner`.
    pub fn new(inner: W) -> PrintWriter<W> {
        PrintWriter {
            inner: Some(inner),
            trouble: false,
            autoflush: false,
        }
    }

    /// Creates a print writer that flushes after every `println`.
    pub fn with_autoflush(inner: W) -> PrintWriter<W> {
        PrintWriter {
            inner: Some(inner),
            trouble: false,
            autoflush: true,
        }
    }

    /// Gets a reference to the sink, unless closed.
    pub fn get_ref(&self) -> Option<&W> {
        self.inner.as_ref()
    }

    /// Records an operation's outcome in the `trouble` flag.
    fn note(&mut self, result: io::Result<()>) {
        if let Err(err) = result {
            if err.kind() == io::ErrorKind::Interrupted {
                // The wait was interrupted, not the sink broken; keep the
                // interruption observable and don't latch trouble.
                interrupt::reassert();
            } else {
                self.trouble = true;
            }
        }
    }

    fn try_write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match &mut self.inner {
            Some(inner) => inner.write_all(bytes),
            None => Err(crate::error::stream_closed()),
        }
    }

    /// Prints a value. Errors are suppressed.
    pub fn print<T: Display>(&mut self, value: T) {
        let s = value.to_string();
        let r = self.try_write(s.as_bytes());
        self.note(r);
    }

    /// Prints a value followed by `\n`. Errors are suppressed.
    pub fn println<T: Display>(&mut self, value: T) {
        self.print(value);
        let r = self.try_write(b"\n");
        self.note(r);
        if self.autoflush {
            self.flush();
        }
    }

    /// Writes a string. Errors are suppressed.
    pub fn write_str(&mut self, s: &str) {
        let r = self.try_write(s.as_bytes());
        self.note(r);
    }

    /// Writes formatted output; used by `write!`. Errors are suppressed.
    pub fn write_fmt(&mut self, args: fmt::Arguments<'_>) {
        let s = args.to_string();
        self.write_str(&s);
    }

    /// Flushes the sink. Errors are suppressed.
    pub fn flush(&mut self) {
        let r = match &mut self.inner {
            Some(inner) => inner.flush(),
            None => Err(crate::error::stream_closed()),
        };
        self.note(r);
    }

    /// Flushes and reports whether any operation has failed so far.
    pub fn check_error(&mut self) -> bool {
        if self.inner.is_some() {
            self.flush();
        }
        self.trouble
    }

    /// Clears the `trouble` flag, forgiving past failures.
    pub fn clear_error(&mut self) {
        self.trouble = false;
    }

    /// Flushes and closes the writer. Idempotent; later prints latch the
    /// `trouble` flag instead of failing.
    pub fn close(&mut self) {
        if self.inner.is_some() {
            self.flush();
            self.inner = None;
        }
    }
}

impl<W: Write> Write for PrintWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let r = self.try_write(buf);
        self.note(r);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        PrintWriter::flush(self);
        Ok(())
    }
}

impl<W: fmt::Debug> fmt::Debug for PrintWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrintWriter")
            .field("writer", &self.inner)
            .field("trouble", &self.trouble)
            .finish()
    }
}
