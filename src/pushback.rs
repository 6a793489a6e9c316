//! A reader that can take bytes back.
//!
//! [`PushbackReader`] keeps a small fixed buffer in front of the
//! underlying source. Bytes pushed back with [`PushbackReader::unread_one`]
//! are the first thing the next read returns, most recently pushed first.
//! This is the classic lookahead tool: read a byte, decide it belongs to
//! the next token, and put it back.

use std::fmt;
use std::io::{self, Read};

use crate::chars::{ByteSource, Rewind};
use crate::error;

/// A byte reader with a bounded pushback buffer.
///
/// The pushback buffer fills from the back: `pos` starts at the capacity
/// (empty) and walks toward zero (full).
///
/// # Examples
///
/// ```
/// use spool::pushback::PushbackReader;
/// use std::io::{Cursor, Read};
///
/// let mut r = PushbackReader::with_capacity(4, Cursor::new(b"abc".to_vec()));
/// let mut one = [0u8; 1];
/// r.read_exact(&mut one).unwrap();
/// assert_eq!(&one, b"a");
///
/// r.unread_one(b'a').unwrap();
/// let mut all = Vec::new();
/// r.read_to_end(&mut all).unwrap();
/// assert_eq!(all, b"abc");
/// ```
pub struct PushbackReader<R> {
    /// The underlying source; `None` once closed.
    inner: Option<R>,

    /// The pushback buffer; `None` once closed. `buf[pos..]` holds the
    /// pushed-back bytes in read order.
    buf: Option<Box<[u8]>>,
    pos: usize,
}

impl<R: ByteSource> PushbackReader<R> {
    /// Creates a reader with a one-byte pushback buffer.
    pub fn new(inner: R) -> PushbackReader<R> {
        PushbackReader::with_capacity(1, inner)
    }

    /// Creates a reader with the given pushback capacity.
    pub fn with_capacity(cap: usize, inner: R) -> PushbackReader<R> {
        assert!(cap > 0, "buffer size must be positive");
        PushbackReader {
            inner: Some(inner),
            buf: Some(vec![0; cap].into_boxed_slice()),
            pos: cap,
        }
    }

    fn inner(&mut self) -> io::Result<&mut R> {
        self.inner.as_mut().ok_or_else(error::stream_closed)
    }

    fn check_open(&self) -> io::Result<()> {
        if self.buf.is_some() {
            Ok(())
        } else {
            Err(error::stream_closed())
        }
    }

    /// Pushes one byte back; the next read returns it first.
    pub fn unread_one(&mut self, b: u8) -> io::Result<()> {
        let buf = self.buf.as_mut().ok_or_else(error::stream_closed)?;
        if self.pos == 0 {
            return Err(error::pushback_full());
        }
        self.pos -= 1;
        buf[self.pos] = b;
        Ok(())
    }

    /// Pushes a slice back; the next reads return it front to back.
    pub fn unread(&mut self, bytes: &[u8]) -> io::Result<()> {
        let buf = self.buf.as_mut().ok_or_else(error::stream_closed)?;
        if bytes.len() > self.pos {
            return Err(error::pushback_full());
        }
        self.pos -= bytes.len();
        buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Reads a single byte, or `None` at end of stream.
    pub fn read_one(&mut self) -> io::Result<Option<u8>> {
        let mut one = [0u8];
        match self.read(&mut one)? {
            0 => Ok(None),
            _ => Ok(Some(one[0])),
        }
    }

    /// Skips up to `n` bytes, consuming pushed-back bytes first.
    pub fn skip(&mut self, n: u64) -> io::Result<u64> {
        self.check_open()?;
        if n == 0 {
            return Ok(0);
        }
        let cap = self.buf.as_ref().map_or(0, |b| b.len());
        let mut skipped = ((cap - self.pos) as u64).min(n);
        self.pos += skipped as usize;

        let mut scratch = [0u8; 512];
        while skipped < n {
            let want = ((n - skipped) as usize).min(scratch.len());
            let got = self.inner()?.read(&mut scratch[..want])?;
            if got == 0 {
                break;
            }
            skipped += got as u64;
        }
        Ok(skipped)
    }

    /// Closes the reader and the underlying source. Idempotent.
    pub fn close(&mut self) -> io::Result<()> {
        self.buf = None;
        drop(self.inner.take());
        Ok(())
    }
}

impl<R: ByteSource> Read for PushbackReader<R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let buf = self.buf.as_ref().ok_or_else(error::stream_closed)?;
        if dst.is_empty() {
            return Ok(0);
        }

        // Pushed-back bytes first.
        let pushed = buf.len() - self.pos;
        if pushed > 0 {
            let n = pushed.min(dst.len());
            dst[..n].copy_from_slice(&buf[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }

        self.inner()?.read(dst)
    }
}

impl<R: ByteSource> ByteSource for PushbackReader<R> {
    fn available(&self) -> io::Result<usize> {
        self.check_open()?;
        let pushed = self.buf.as_ref().map_or(0, |b| b.len() - self.pos);
        let inner = self.inner.as_ref().ok_or_else(error::stream_closed)?;
        Ok(pushed.saturating_add(inner.available()?))
    }
}

impl<R: ByteSource> Rewind for PushbackReader<R> {
    fn mark(&mut self, _readlimit: usize) {
        // Deliberately a no-op; `reset` reports the missing capability.
    }

    fn reset(&mut self) -> io::Result<()> {
        Err(error::mark_unsupported())
    }

    fn mark_supported(&self) -> bool {
        false
    }
}

impl<R: fmt::Debug> fmt::Debug for PushbackReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushbackReader")
            .field("reader", &self.inner)
            .field(
                "pushed_back",
                &self.buf.as_ref().map_or(0, |b| b.len() - self.pos),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn unread_is_lifo() {
        let mut r = PushbackReader::with_capacity(4, Cursor::new(b"xyz".to_vec()));
        r.unread_one(b'2').unwrap();
        r.unread_one(b'1').unwrap();
        assert_eq!(r.read_one().unwrap(), Some(b'1'));
        assert_eq!(r.read_one().unwrap(), Some(b'2'));
        assert_eq!(r.read_one().unwrap(), Some(b'x'));
    }

    #[test]
    fn unread_slice_reads_front_to_back() {
        let mut r = PushbackReader::with_capacity(4, Cursor::new(Vec::new()));
        r.unread(b"abc").unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abc");
    }

    #[test]
    fn overflow_is_reported() {
        let mut r = PushbackReader::with_capacity(2, Cursor::new(Vec::new()));
        r.unread(b"ab").unwrap();
        let err = r.unread_one(b'c').unwrap_err();
        assert_eq!(err.to_string(), "pushback buffer full");
        let err = r.unread(b"d").unwrap_err();
        assert_eq!(err.to_string(), "pushback buffer full");
    }

    #[test]
    fn skip_prefers_the_pushback_buffer() {
        let mut r = PushbackReader::with_capacity(4, Cursor::new(b"cd".to_vec()));
        r.unread(b"ab").unwrap();
        assert_eq!(r.skip(3).unwrap(), 3);
        assert_eq!(r.read_one().unwrap(), Some(b'd'));
    }

    #[test]
    fn mark_reset_is_not_supported() {
        let mut r = PushbackReader::with_capacity(1, Cursor::new(Vec::new()));
        assert!(!r.mark_supported());
        r.mark(10);
        let err = r.reset().unwrap_err();
        assert_eq!(err.to_string(), "mark/reset not supported");
    }

    #[test]
    fn close_is_idempotent_and_sticky() {
        let mut r = PushbackReader::with_capacity(1, Cursor::new(Vec::new()));
        r.close().unwrap();
        r.close().unwrap();
        assert_eq!(
            r.unread_one(b'a').unwrap_err().to_string(),
            "stream closed"
        );
        let mut buf = [0u8; 1];
        assert_eq!(r.read(&mut buf).unwrap_err().to_string(), "stream closed");
    }

    #[test]
    fn available_counts_pushback_and_source() {
        let mut r = PushbackReader::with_capacity(4, Cursor::new(b"cd".to_vec()));
        r.unread(b"ab").unwrap();
        assert_eq!(r.available().unwrap(), 4);
    }
}
