//! Buffering wrappers with mark/reset support.
//!
//! [`BufReader`] performs large, infrequent reads on the underlying source
//! and serves callers from an in-memory buffer. On top of plain buffering
//! it supports saving a position with [`Rewind::mark`] and returning to it
//! with [`Rewind::reset`], replaying everything consumed in between, as
//! long as consumption stayed within the declared read limit. [`BufWriter`]
//! is the matching output-side wrapper.

use std::fmt;
use std::io::{self, Read, Write};

use crate::chars::{ByteSource, Rewind};
use crate::error;

/// Default buffer capacity for both wrappers.
pub const DEFAULT_BUF_SIZE: usize = 8 * 1024;

/// A buffered reader with mark/reset.
///
/// The wrapped source must be a [`ByteSource`] so bulk reads can keep
/// draining while bytes are immediately available without risking a second
/// block.
///
/// # Examples
///
/// ```
/// use spool::buffered::BufReader;
/// use spool::chars::Rewind;
/// use std::io::{Cursor, Read};
///
/// let mut reader = BufReader::with_capacity(8, Cursor::new(b"ABCDEFGHIJ".to_vec()));
/// let mut buf = [0u8; 3];
/// reader.read_exact(&mut buf).unwrap();
///
/// reader.mark(4);
/// reader.read_exact(&mut buf).unwrap();
/// reader.reset().unwrap();
/// reader.read_exact(&mut buf).unwrap();
/// assert_eq!(&buf, b"DEF");
/// ```
pub struct BufReader<R> {
    /// The underlying source; `None` once closed.
    inner: Option<R>,

    /// The buffer; `None` once closed. `buf[pos..count]` is valid data.
    buf: Option<Box<[u8]>>,
    pos: usize,
    count: usize,

    /// Saved position, or `None` when no mark is set.
    mark: Option<usize>,

    /// How many bytes may be consumed past the mark before it is dropped.
    marklimit: usize,
}

impl<R: ByteSource> BufReader<R> {
    /// Creates a reader with the default buffer capacity.
    pub fn new(inner: R) -> BufReader<R> {
        BufReader::with_capacity(DEFAULT_BUF_SIZE, inner)
    }

    /// Creates a reader with the given buffer capacity.
    pub fn with_capacity(cap: usize, inner: R) -> BufReader<R> {
        assert!(cap > 0, "buffer size must be positive");
        BufReader {
            inner: Some(inner),
            buf: Some(vec![0; cap].into_boxed_slice()),
            pos: 0,
            count: 0,
            mark: None,
            marklimit: 0,
        }
    }

    /// Gets a reference to the underlying source, unless closed.
    pub fn get_ref(&self) -> Option<&R> {
        self.inner.as_ref()
    }

    /// Gets a mutable reference to the underlying source, unless closed.
    pub fn get_mut(&mut self) -> Option<&mut R> {
        self.inner.as_mut()
    }

    /// Unwraps the underlying source. Buffered data is lost; `None` if the
    /// reader was closed.
    pub fn into_inner(mut self) -> Option<R> {
        self.inner.take()
    }

    /// Bytes currently buffered and unread.
    pub fn buffered(&self) -> usize {
        self.count - self.pos
    }

    fn buf(&self) -> io::Result<&[u8]> {
        self.buf.as_deref().ok_or_else(error::stream_closed)
    }

    fn inner(&mut self) -> io::Result<&mut R> {
        self.inner.as_mut().ok_or_else(error::stream_closed)
    }

    /// Refills the buffer after it has been drained (`pos == count`).
    ///
    /// Returns the number of bytes added; 0 means end of stream. With no
    /// mark the whole buffer is reused. With a mark, marked bytes are
    /// preserved: first by shifting them to the front; once the mark sits
    /// at the front of an already-full buffer, by either dropping a mark
    /// whose read limit the capacity covers, or growing the buffer
    /// (doubling, capped at the limit).
    fn fill(&mut self) -> io::Result<usize> {
        let buf = self.buf.as_mut().ok_or_else(error::stream_closed)?;

        match self.mark {
            None => {
                self.pos = 0;
            }
            Some(mark) => {
                if self.pos >= buf.len() {
                    if mark > 0 {
                        // Shift the marked tail down to offset zero.
                        let len = self.pos - mark;
                        buf.copy_within(mark..self.pos, 0);
                        self.pos = len;
                        self.mark = Some(0);
                    } else if buf.len() >= self.marklimit {
                        // The whole buffer lies past the mark, so the
                        // permitted read-ahead has been exceeded and the
                        // mark may be forgotten.
                        self.mark = None;
                        self.pos = 0;
                    } else {
                        // Grow to keep the marked prefix: double, capped
                        // at the read limit.
                        let new_cap = (buf.len() * 2).min(self.marklimit);
                        let mut grown = vec![0; new_cap].into_boxed_slice();
                        grown[..buf.len()].copy_from_slice(buf);
                        *buf = grown;
                    }
                }
            }
        }

        self.count = self.pos;
        let pos = self.pos;
        // Reborrow through the Option so the buffer and the source can be
        // borrowed together.
        let (inner, buf) = match (self.inner.as_mut(), self.buf.as_mut()) {
            (Some(inner), Some(buf)) => (inner, buf),
            _ => return Err(error::stream_closed()),
        };
        let n = inner.read(&mut buf[pos..])?;
        self.count = pos + n;
        Ok(n)
    }

    /// Reads a single byte, or `None` at end of stream.
    pub fn read_one(&mut self) -> io::Result<Option<u8>> {
        if self.pos >= self.count && self.fill()? == 0 {
            return Ok(None);
        }
        let b = self.buf()?[self.pos];
        self.pos += 1;
        Ok(Some(b))
    }

    /// One buffered read step: serve from the buffer, refilling it first
    /// if needed. Oversized requests with no mark bypass the buffer.
    fn read1(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.count {
            // A request at least as large as the buffer can skip it
            // entirely, as long as no mark needs the bytes kept around.
            if dst.len() >= self.buf()?.len() && self.mark.is_none() {
                return self.inner()?.read(dst);
            }
            if self.fill()? == 0 {
                return Ok(0);
            }
        }
        let n = (self.count - self.pos).min(dst.len());
        dst[..n].copy_from_slice(&self.buf()?[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    /// Skips up to `n` bytes, returning how many were skipped.
    ///
    /// Makes at most one underlying read, so the answer may be short.
    pub fn skip(&mut self, n: u64) -> io::Result<u64> {
        self.buf()?;
        if n == 0 {
            return Ok(0);
        }
        if self.count == self.pos && self.fill()? == 0 {
            return Ok(0);
        }
        let skipped = ((self.count - self.pos) as u64).min(n);
        self.pos += skipped as usize;
        Ok(skipped)
    }

    /// Bytes readable without blocking: the buffered tail plus whatever
    /// the underlying source reports.
    pub fn available(&self) -> io::Result<usize> {
        self.buf()?;
        let inner = self.inner.as_ref().ok_or_else(error::stream_closed)?;
        Ok((self.count - self.pos).saturating_add(inner.available()?))
    }

    /// Closes the reader and the underlying source. Idempotent; every
    /// later operation fails with "stream closed".
    pub fn close(&mut self) -> io::Result<()> {
        self.buf = None;
        self.mark = None;
        drop(self.inner.take());
        Ok(())
    }
}

impl<R: ByteSource> Read for BufReader<R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        self.buf()?;
        if dst.is_empty() {
            return Ok(0);
        }
        let mut n = 0;
        loop {
            let nread = self.read1(&mut dst[n..])?;
            if nread == 0 {
                return Ok(n);
            }
            n += nread;
            if n >= dst.len() {
                return Ok(n);
            }
            // Keep draining only while the source promises not to block.
            match &self.inner {
                Some(inner) if inner.available()? > 0 => {}
                _ => return Ok(n),
            }
        }
    }
}

impl<R: ByteSource> ByteSource for BufReader<R> {
    fn available(&self) -> io::Result<usize> {
        BufReader::available(self)
    }
}

impl<R: ByteSource> Rewind for BufReader<R> {
    fn mark(&mut self, readlimit: usize) {
        self.marklimit = readlimit;
        self.mark = Some(self.pos);
    }

    fn reset(&mut self) -> io::Result<()> {
        self.buf()?;
        match self.mark {
            // A mark is only valid while consumption stayed within its
            // read limit; past that the replay guarantee is gone even if
            // the bytes happen to still be buffered.
            Some(mark) if self.pos - mark <= self.marklimit => {
                self.pos = mark;
                Ok(())
            }
            _ => Err(error::invalid_mark()),
        }
    }
}

impl<R: fmt::Debug> fmt::Debug for BufReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufReader")
            .field("reader", &self.inner)
            .field(
                "buffer",
                &format_args!(
                    "{}/{}",
                    self.count - self.pos,
                    self.buf.as_ref().map_or(0, |b| b.len())
                ),
            )
            .finish()
    }
}

/// A buffered writer.
///
/// Small writes accumulate in memory and reach the underlying sink in
/// large batches; writes at least as large as the buffer bypass it. Drop
/// flushes best-effort; call [`BufWriter::flush`] to observe errors.
pub struct BufWriter<W: Write> {
    /// The sink; `None` once closed.
    inner: Option<W>,
    buf: Vec<u8>,
    cap: usize,

    /// Set across calls into the sink so a panicking sink is not handed
    /// the same bytes again from `drop`.
    panicked: bool,
}

impl<W: Write> BufWriter<W> {
    /// Creates a writer with the default buffer capacity.
    pub fn new(inner: W) -> BufWriter<W> {
        BufWriter::with_capacity(DEFAULT_BUF_SIZE, inner)
    }

    /// Creates a writer with the given buffer capacity.
    pub fn with_capacity(cap: usize, inner: W) -> BufWriter<W> {
        assert!(cap > 0, "buffer size must be positive");
        BufWriter {
            inner: Some(inner),
            buf: Vec::with_capacity(cap),
            cap,
            panicked: false,
        }
    }

    fn inner(&mut self) -> io::Result<&mut W> {
        self.inner.as_mut().ok_or_else(error::stream_closed)
    }

    /// Writes the whole buffer to the sink.
    fn flush_buf(&mut self) -> io::Result<()> {
        let mut written = 0;
        let len = self.buf.len();
        let mut ret = Ok(());
        while written < len {
            self.panicked = true;
            let inner = self.inner.as_mut().ok_or_else(error::stream_closed)?;
            let r = inner.write(&self.buf[written..]);
            self.panicked = false;
            match r {
                Ok(0) => {
                    ret = Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write the buffered data",
                    ));
                    break;
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    ret = Err(e);
                    break;
                }
            }
        }
        if written > 0 {
            self.buf.drain(..written);
        }
        ret
    }

    /// Unwraps the sink after flushing the buffer.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.flush_buf()?;
        self.inner.take().ok_or_else(error::stream_closed)
    }

    /// Flushes and closes the writer. Idempotent; later writes fail with
    /// "stream closed".
    pub fn close(&mut self) -> io::Result<()> {
        if self.inner.is_some() {
            self.flush_buf()?;
            self.inner()?.flush()?;
            self.inner = None;
        }
        Ok(())
    }
}

impl<W: Write> Write for BufWriter<W> {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        self.inner()?;
        if self.buf.len() + src.len() > self.cap {
            self.flush_buf()?;
        }
        if src.len() >= self.cap {
            self.panicked = true;
            let r = self.inner()?.write(src);
            self.panicked = false;
            r
        } else {
            self.buf.extend_from_slice(src);
            Ok(src.len())
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buf()?;
        self.inner()?.flush()
    }
}

impl<W: Write> Drop for BufWriter<W> {
    fn drop(&mut self) {
        if self.inner.is_some() && !self.panicked {
            // Destructors must not fail; errors here are dropped.
            let _ = self.flush_buf();
        }
    }
}

impl<W: Write + fmt::Debug> fmt::Debug for BufWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufWriter")
            .field("writer", &self.inner)
            .field(
                "buffer",
                &format_args!("{}/{}", self.buf.len(), self.cap),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn mark_and_reset_replay_across_a_fill() {
        let mut r = BufReader::with_capacity(8, Cursor::new(b"ABCDEFGHIJ".to_vec()));
        let mut buf = [0u8; 4];

        r.read_exact(&mut buf[..3]).unwrap();
        assert_eq!(&buf[..3], b"ABC");

        r.mark(4);
        r.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"DEFG");

        r.reset().unwrap();
        r.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"DEFG");
    }

    #[test]
    fn reset_past_the_read_limit_fails() {
        let mut r = BufReader::with_capacity(8, Cursor::new(b"ABCDEFGHIJ".to_vec()));
        r.mark(3);
        let mut buf = [0u8; 5];
        r.read_exact(&mut buf).unwrap();
        let err = r.reset().unwrap_err();
        assert_eq!(err.to_string(), "invalid mark");
    }

    #[test]
    fn reset_without_mark_fails() {
        let mut r = BufReader::with_capacity(4, Cursor::new(b"AB".to_vec()));
        assert_eq!(r.reset().unwrap_err().to_string(), "invalid mark");
    }

    #[test]
    fn buffer_grows_to_honor_a_large_read_limit() {
        let mut r = BufReader::with_capacity(4, Cursor::new(b"ABCDEFGHIJKL".to_vec()));
        r.mark(10);
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ABCDEFGH");
        r.reset().unwrap();
        let mut again = [0u8; 8];
        r.read_exact(&mut again).unwrap();
        assert_eq!(again, buf);
    }

    #[test]
    fn marked_tail_is_shifted_not_lost() {
        let mut r = BufReader::with_capacity(8, Cursor::new(b"ABCDEFGHIJKLMNOP".to_vec()));
        let mut buf = [0u8; 6];
        r.read_exact(&mut buf).unwrap();
        r.mark(6);
        let mut tail = [0u8; 4];
        r.read_exact(&mut tail).unwrap();
        assert_eq!(&tail, b"GHIJ");
        r.reset().unwrap();
        r.read_exact(&mut tail).unwrap();
        assert_eq!(&tail, b"GHIJ");
    }

    #[test]
    fn oversized_reads_bypass_the_buffer() {
        let mut r = BufReader::with_capacity(4, Cursor::new(b"ABCDEFGHIJ".to_vec()));
        let mut buf = [0u8; 10];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &b"ABCDEFGHIJ"[..n]);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn bulk_read_drains_available_bytes() {
        // A cursor always reports its remainder available, so one bulk
        // read sees everything even through a tiny buffer.
        let mut r = BufReader::with_capacity(2, Cursor::new(b"ABCDEF".to_vec()));
        let mut buf = [0u8; 5];
        assert_eq!(r.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"ABCDE");
    }

    #[test]
    fn close_is_idempotent_and_sticky() {
        let mut r = BufReader::with_capacity(4, Cursor::new(b"AB".to_vec()));
        r.close().unwrap();
        r.close().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(r.read(&mut buf).unwrap_err().to_string(), "stream closed");
        assert_eq!(r.skip(1).unwrap_err().to_string(), "stream closed");
        assert_eq!(r.available().unwrap_err().to_string(), "stream closed");
    }

    #[test]
    fn zero_length_read_is_free() {
        let mut r = BufReader::with_capacity(4, Cursor::new(b"AB".to_vec()));
        assert_eq!(r.read(&mut []).unwrap(), 0);
    }

    #[test]
    fn skip_consumes_buffered_bytes() {
        let mut r = BufReader::with_capacity(8, Cursor::new(b"ABCDEF".to_vec()));
        assert_eq!(r.skip(4).unwrap(), 4);
        assert_eq!(r.read_one().unwrap(), Some(b'E'));
    }

    #[test]
    fn available_counts_buffer_and_source() {
        let mut r = BufReader::with_capacity(4, Cursor::new(b"ABCDEF".to_vec()));
        assert_eq!(r.read_one().unwrap(), Some(b'A'));
        // 3 buffered + 2 still in the cursor.
        assert_eq!(r.available().unwrap(), 5);
    }

    #[test]
    fn buf_writer_batches_and_flushes() {
        let mut w = BufWriter::with_capacity(4, Vec::new());
        w.write_all(b"ab").unwrap();
        assert!(w.inner.as_ref().unwrap().is_empty());
        w.write_all(b"cde").unwrap();
        w.flush().unwrap();
        let sink = w.into_inner().unwrap();
        assert_eq!(sink, b"abcde");
    }

    #[test]
    fn buf_writer_bypasses_large_writes() {
        let mut w = BufWriter::with_capacity(4, Vec::new());
        w.write_all(b"0123456789").unwrap();
        assert_eq!(w.inner.as_ref().unwrap().as_slice(), b"0123456789");
    }

    #[test]
    fn buf_writer_close_is_idempotent() {
        let mut w = BufWriter::with_capacity(4, Vec::new());
        w.write_all(b"xy").unwrap();
        w.close().unwrap();
        w.close().unwrap();
        assert_eq!(
            w.write(b"z").unwrap_err().to_string(),
            "stream closed"
        );
    }
}
