//! In-memory pipes between a producer and a consumer thread.
//!
//! A pipe is a fixed-capacity ring buffer shared by exactly two endpoints:
//! a writer owned by the producing thread and a reader owned by the
//! consuming thread. Bytes (or chars; the ring is generic over its unit)
//! are delivered in strict FIFO order. Both endpoints block when the ring
//! is full/empty, coordinating through one mutex and one condition
//! variable.
//!
//! Waits are bounded (one-second slices) as a liveness probe rather than a
//! correctness timeout: every wakeup re-checks whether the peer endpoint
//! has vanished. An endpoint dropped by a panicking thread marks the pipe
//! *broken* (write side) or *dead* (read side); an endpoint dropped or
//! closed normally is a clean close, after which the reader may drain
//! what's left and then sees end-of-stream.
//!
//! # Examples
//!
//! ```
//! use spool::pipe::pipe;
//! use std::io::{Read, Write};
//! use std::thread;
//!
//! let (mut reader, mut writer) = pipe(4);
//!
//! let producer = thread::spawn(move || {
//!     writer.write_all(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
//! });
//!
//! let mut buf = Vec::new();
//! reader.read_to_end(&mut buf).unwrap();
//! assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
//! producer.join().unwrap();
//! ```

use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, Thread};
use std::time::Duration;

use tracing::debug;

use crate::chars::{ByteSource, CharRead, CharWrite};
use crate::{error, interrupt};

/// Ring capacity used when endpoints are connected without an explicit one.
pub const DEFAULT_CAPACITY: usize = 1024;

/// How long one bounded wait lasts. Wakeups re-check peer liveness, so
/// this is a probe interval, not a deadline.
const PROBE: Duration = Duration::from_secs(1);

/// How many probe timeouts a blocked reader tolerates after the write side
/// is known to have died, in case a racing final notification lands.
const BROKEN_TRIALS: u32 = 2;

/// The ring and its bookkeeping, all guarded by one mutex.
struct Ring<T> {
    /// The circular storage.
    buffer: Box<[T]>,

    /// Index of the next write, or -1 when the ring is empty.
    in_: isize,

    /// Index of the next read. Meaningful only while `in_ >= 0`.
    out: usize,

    /// The writer closed cleanly; the reader drains and then sees EOF.
    write_closed: bool,

    /// The reader closed; writes fail from here on.
    read_closed: bool,

    /// The write side vanished without closing (its thread panicked).
    broken: bool,

    /// The read side vanished without closing (its thread panicked).
    reader_dead: bool,

    /// Last thread seen writing. Kept for diagnostics.
    write_side: Option<Thread>,

    /// Last thread seen reading. Kept for diagnostics.
    read_side: Option<Thread>,
}

impl<T: Copy + Default> Ring<T> {
    fn new(cap: usize) -> Ring<T> {
        assert!(cap > 0, "capacity must be positive");
        Ring {
            buffer: vec![T::default(); cap].into_boxed_slice(),
            in_: -1,
            out: 0,
            write_closed: false,
            read_closed: false,
            broken: false,
            reader_dead: false,
            write_side: None,
            read_side: None,
        }
    }

    fn cap(&self) -> usize {
        self.buffer.len()
    }

    /// Number of items currently stored.
    fn used(&self) -> usize {
        if self.in_ < 0 {
            return 0;
        }
        let in_ = self.in_ as usize;
        if in_ > self.out {
            in_ - self.out
        } else {
            // `in_ == out` means full, and a wrapped writer is behind the
            // reader; both cases count through the wrap point.
            self.cap() - (self.out - in_)
        }
    }

}

struct Shared<T> {
    ring: Mutex<Ring<T>>,
    cond: Condvar,
}

impl<T: Copy + Default> Shared<T> {
    fn new(cap: usize) -> Arc<Shared<T>> {
        Arc::new(Shared {
            ring: Mutex::new(Ring::new(cap)),
            cond: Condvar::new(),
        })
    }

    /// One bounded wait slice. Fails fast when the calling thread's
    /// interrupt flag is up, leaving the flag asserted for the caller.
    fn wait<'a>(&self, guard: MutexGuard<'a, Ring<T>>) -> io::Result<MutexGuard<'a, Ring<T>>> {
        if interrupt::is_interrupted() {
            return Err(error::interrupted());
        }
        let (guard, _timeout) = self
            .cond
            .wait_timeout(guard, PROBE)
            .unwrap_or_else(|poisoned| panic!("pipe lock poisoned: {}", poisoned));
        if interrupt::is_interrupted() {
            return Err(error::interrupted());
        }
        Ok(guard)
    }
}

/// The reading end of a pipe. `T` is the stream unit (`u8` or `char`).
pub struct PipeReader<T: Copy + Default = u8> {
    shared: Option<Arc<Shared<T>>>,
}

/// The writing end of a pipe.
pub struct PipeWriter<T: Copy + Default = u8> {
    shared: Option<Arc<Shared<T>>>,
}

/// The reading end of a char pipe.
pub type CharPipeReader = PipeReader<char>;

/// The writing end of a char pipe.
pub type CharPipeWriter = PipeWriter<char>;

/// Creates a connected byte pipe with the given ring capacity.
pub fn pipe(cap: usize) -> (PipeReader, PipeWriter) {
    let shared = Shared::new(cap);
    (
        PipeReader {
            shared: Some(shared.clone()),
        },
        PipeWriter {
            shared: Some(shared),
        },
    )
}

/// Creates a connected char pipe with the given ring capacity.
pub fn char_pipe(cap: usize) -> (CharPipeReader, CharPipeWriter) {
    let shared = Shared::new(cap);
    (
        PipeReader {
            shared: Some(shared.clone()),
        },
        PipeWriter {
            shared: Some(shared),
        },
    )
}

/// Connects two unconnected endpoints with the given ring capacity.
///
/// Fails with "already connected" if either endpoint is already part of a
/// pipe, and with "capacity must be positive" (a panic, as for [`pipe`])
/// on a zero capacity.
pub fn connect_with_capacity<T: Copy + Default>(
    reader: &mut PipeReader<T>,
    writer: &mut PipeWriter<T>,
    cap: usize,
) -> io::Result<()> {
    if reader.shared.is_some() || writer.shared.is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "already connected",
        ));
    }
    let shared = Shared::new(cap);
    reader.shared = Some(shared.clone());
    writer.shared = Some(shared);
    Ok(())
}

/// Connects two unconnected endpoints with [`DEFAULT_CAPACITY`].
pub fn connect<T: Copy + Default>(
    reader: &mut PipeReader<T>,
    writer: &mut PipeWriter<T>,
) -> io::Result<()> {
    connect_with_capacity(reader, writer, DEFAULT_CAPACITY)
}

impl<T: Copy + Default> PipeReader<T> {
    /// Creates a reader that is not yet connected to any writer.
    ///
    /// Every operation fails with "pipe not connected" until [`connect`]
    /// joins it with a writer.
    pub fn unconnected() -> PipeReader<T> {
        PipeReader { shared: None }
    }

    fn shared(&self) -> io::Result<&Arc<Shared<T>>> {
        self.shared.as_ref().ok_or_else(error::pipe_not_connected)
    }

    /// Reads items into `dst`, blocking until at least one is available,
    /// end of stream, or a fault. Returns the number read; 0 means end of
    /// stream (or an empty `dst`, which never blocks).
    pub fn receive(&mut self, dst: &mut [T]) -> io::Result<usize> {
        let shared = self.shared()?.clone();
        if dst.is_empty() {
            return Ok(0);
        }

        let mut ring = shared.ring.lock().unwrap();
        if ring.read_closed {
            return Err(error::pipe_closed());
        }
        ring.read_side = Some(thread::current());

        // Block until there is something to read. Clean writer close means
        // EOF once the ring is empty; a vanished writer is a fault, but a
        // couple of probe slices are allowed in case its final
        // notification is still in flight.
        let mut trials = BROKEN_TRIALS;
        while ring.in_ < 0 {
            if ring.write_closed && !ring.broken {
                return Ok(0);
            }
            if ring.broken {
                if trials == 0 {
                    let writer = ring.write_side.as_ref().and_then(|t| t.name().map(String::from));
                    debug!(?writer, "pipe reader giving up: write side dead");
                    return Err(error::pipe_broken());
                }
                trials -= 1;
            }
            shared.cond.notify_all();
            ring = shared.wait(ring)?;
            if ring.read_closed {
                return Err(error::pipe_closed());
            }
        }

        // Copy out maximal contiguous runs until `dst` fills or the ring
        // empties. Only the first item may block; the rest is a top-up.
        let cap = ring.cap();
        let mut n = 0;
        while n < dst.len() && ring.in_ >= 0 {
            let in_ = ring.in_ as usize;
            let contiguous = if in_ > ring.out {
                in_ - ring.out
            } else {
                cap - ring.out
            };
            let run = contiguous.min(dst.len() - n);
            let out = ring.out;
            dst[n..n + run].copy_from_slice(&ring.buffer[out..out + run]);
            n += run;
            ring.out += run;
            if ring.out == cap {
                ring.out = 0;
            }
            if ring.in_ as usize == ring.out {
                // Drained to equality: the ring is empty again.
                ring.in_ = -1;
            }
        }

        // There is space now; wake a blocked writer.
        shared.cond.notify_all();
        Ok(n)
    }

    /// Reads a single item, or `None` at end of stream.
    pub fn receive_one(&mut self) -> io::Result<Option<T>> {
        let mut one = [T::default()];
        match self.receive(&mut one)? {
            0 => Ok(None),
            _ => Ok(Some(one[0])),
        }
    }

    /// Number of items that can be read without blocking.
    pub fn available(&self) -> io::Result<usize> {
        let shared = self.shared()?;
        let ring = shared.ring.lock().unwrap();
        if ring.read_closed {
            return Err(error::pipe_closed());
        }
        Ok(ring.used())
    }

    /// Closes the reading end. Subsequent writes into the pipe fail with
    /// "pipe closed". Idempotent.
    pub fn close(&mut self) {
        if let Some(shared) = &self.shared {
            let mut ring = shared.ring.lock().unwrap();
            ring.read_closed = true;
            ring.in_ = -1;
            shared.cond.notify_all();
        }
    }
}

impl<T: Copy + Default> PipeWriter<T> {
    /// Creates a writer that is not yet connected to any reader.
    pub fn unconnected() -> PipeWriter<T> {
        PipeWriter { shared: None }
    }

    fn shared(&self) -> io::Result<&Arc<Shared<T>>> {
        self.shared.as_ref().ok_or_else(error::pipe_not_connected)
    }

    /// Writes every item of `src`, blocking while the ring is full.
    pub fn send(&mut self, src: &[T]) -> io::Result<()> {
        let shared = self.shared()?.clone();
        let mut ring = shared.ring.lock().unwrap();
        ring.write_side = Some(thread::current());

        let cap = ring.cap();
        let mut i = 0;
        while i < src.len() {
            if ring.reader_dead {
                let reader = ring.read_side.as_ref().and_then(|t| t.name().map(String::from));
                debug!(?reader, "pipe writer giving up: read end dead");
                return Err(error::read_end_dead());
            }
            if ring.read_closed || ring.write_closed {
                return Err(error::pipe_closed());
            }

            // Occupancy is computed before any index reshuffling: once the
            // indices are re-seeded below, `in_ == out` would read as full.
            let used = ring.used();
            if used == cap {
                // Wake the reader and wait for space. The bounded wait is
                // a liveness probe; each wakeup re-checks the flags above.
                shared.cond.notify_all();
                ring = shared.wait(ring)?;
                continue;
            }

            // Writing into an empty ring re-seeds both indices.
            if ring.in_ < 0 {
                ring.in_ = 0;
                ring.out = 0;
            }

            // Copy one maximal contiguous run.
            let in_ = ring.in_ as usize;
            let contiguous = if in_ >= ring.out {
                cap - in_
            } else {
                ring.out - in_
            };
            let run = contiguous.min(cap - used).min(src.len() - i);
            ring.buffer[in_..in_ + run].copy_from_slice(&src[i..i + run]);
            i += run;
            let mut next = in_ + run;
            if next == cap {
                next = 0;
            }
            ring.in_ = next as isize;

            // Data is available; wake a blocked reader.
            shared.cond.notify_all();
        }
        Ok(())
    }

    /// Writes a single item.
    pub fn send_one(&mut self, item: T) -> io::Result<()> {
        self.send(&[item])
    }

    /// Wakes the reader so it notices pending data immediately.
    pub fn flush(&mut self) -> io::Result<()> {
        let shared = self.shared()?;
        let _ring = shared.ring.lock().unwrap();
        shared.cond.notify_all();
        Ok(())
    }

    /// Closes the writing end. The reader drains what's left, then sees
    /// end of stream. Idempotent.
    pub fn close(&mut self) {
        if let Some(shared) = &self.shared {
            let mut ring = shared.ring.lock().unwrap();
            ring.write_closed = true;
            shared.cond.notify_all();
        }
    }
}

impl<T: Copy + Default> Drop for PipeReader<T> {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            let mut ring = shared.ring.lock().unwrap();
            if !ring.read_closed {
                if thread::panicking() {
                    // The consuming thread died mid-stream; writers must
                    // not block forever on a reader that will never come.
                    debug!("pipe read side dropped while panicking");
                    ring.reader_dead = true;
                }
                ring.read_closed = true;
                ring.in_ = -1;
                shared.cond.notify_all();
            }
        }
    }
}

impl<T: Copy + Default> Drop for PipeWriter<T> {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            let mut ring = shared.ring.lock().unwrap();
            if !ring.write_closed {
                if thread::panicking() {
                    debug!("pipe write side dropped while panicking");
                    ring.broken = true;
                }
                ring.write_closed = true;
                shared.cond.notify_all();
            }
        }
    }
}

impl Read for PipeReader<u8> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.receive(buf)
    }
}

impl ByteSource for PipeReader<u8> {
    fn available(&self) -> io::Result<usize> {
        PipeReader::available(self)
    }
}

impl Write for PipeWriter<u8> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        PipeWriter::flush(self)
    }
}

impl CharRead for PipeReader<char> {
    fn read_chars(&mut self, dst: &mut [char]) -> io::Result<usize> {
        self.receive(dst)
    }

    fn ready(&self) -> io::Result<bool> {
        Ok(self.available()? > 0)
    }
}

impl CharWrite for PipeWriter<char> {
    fn write_chars(&mut self, src: &[char]) -> io::Result<()> {
        self.send(src)
    }

    fn write_str(&mut self, s: &str) -> io::Result<()> {
        let chars: Vec<char> = s.chars().collect();
        self.send(&chars)
    }

    fn flush(&mut self) -> io::Result<()> {
        PipeWriter::flush(self)
    }
}

impl<T: Copy + Default> std::fmt::Debug for PipeReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeReader")
            .field("connected", &self.shared.is_some())
            .finish()
    }
}

impl<T: Copy + Default> std::fmt::Debug for PipeWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter")
            .field("connected", &self.shared.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn fifo_across_wraparound() {
        let (mut reader, mut writer) = pipe(4);
        let producer = thread::spawn(move || {
            writer.send(&[1u8, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        });

        let mut first = [0u8; 3];
        assert_eq!(reader.receive(&mut first).unwrap(), 3);
        assert_eq!(first, [1, 2, 3]);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, [4, 5, 6, 7, 8]);
        producer.join().unwrap();
    }

    #[test]
    fn available_matches_ring_occupancy() {
        let (mut reader, mut writer) = pipe(8);
        assert_eq!(reader.available().unwrap(), 0);
        writer.send(&[9u8; 5]).unwrap();
        assert_eq!(reader.available().unwrap(), 5);
        let mut buf = [0u8; 2];
        reader.receive(&mut buf).unwrap();
        assert_eq!(reader.available().unwrap(), 3);
    }

    #[test]
    fn writer_close_drains_then_eof() {
        let (mut reader, mut writer) = pipe(4);
        writer.send(&[7u8, 8]).unwrap();
        writer.close();
        writer.close(); // idempotent

        let mut buf = [0u8; 4];
        assert_eq!(reader.receive(&mut buf).unwrap(), 2);
        assert_eq!(reader.receive(&mut buf).unwrap(), 0);
    }

    #[test]
    fn reader_close_fails_writes() {
        let (mut reader, mut writer) = pipe(4);
        reader.close();
        let err = writer.send(&[1u8]).unwrap_err();
        assert_eq!(err.to_string(), "pipe closed");
    }

    #[test]
    fn panicking_writer_breaks_the_pipe() {
        let (mut reader, writer) = pipe(4);
        let producer = thread::spawn(move || {
            let mut writer = writer;
            writer.send(&[1u8]).unwrap();
            panic!("producer died");
        });
        assert!(producer.join().is_err());

        // The byte written before the panic is still delivered.
        let mut buf = [0u8; 4];
        assert_eq!(reader.receive(&mut buf).unwrap(), 1);
        let err = reader.receive(&mut buf).unwrap_err();
        assert_eq!(err.to_string(), "pipe broken");
    }

    #[test]
    fn panicking_reader_kills_the_read_end() {
        let (reader, mut writer) = pipe(4);
        let consumer = thread::spawn(move || {
            let _reader = reader;
            panic!("consumer died");
        });
        assert!(consumer.join().is_err());

        let err = loop {
            match writer.send(&[0u8; 4]) {
                Ok(()) => continue,
                Err(err) => break err,
            }
        };
        assert_eq!(err.to_string(), "read end dead");
    }

    #[test]
    fn unconnected_endpoints_report_it() {
        let mut reader: PipeReader = PipeReader::unconnected();
        let mut buf = [0u8; 1];
        let err = reader.receive(&mut buf).unwrap_err();
        assert_eq!(err.to_string(), "pipe not connected");

        let mut writer: PipeWriter = PipeWriter::unconnected();
        connect(&mut reader, &mut writer).unwrap();
        writer.send(&[3u8]).unwrap();
        assert_eq!(reader.receive_one().unwrap(), Some(3));

        let mut other: PipeWriter = PipeWriter::unconnected();
        let err = connect(&mut reader, &mut other).unwrap_err();
        assert_eq!(err.to_string(), "already connected");
    }

    #[test]
    fn zero_length_read_never_blocks() {
        let (mut reader, _writer) = pipe(4);
        let start = Instant::now();
        assert_eq!(reader.receive(&mut []).unwrap(), 0);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn char_pipe_delivers_chars() {
        let (mut reader, mut writer) = char_pipe(4);
        let producer = thread::spawn(move || {
            writer.write_str("héllo").unwrap();
        });
        let mut buf = ['\0'; 5];
        let mut n = 0;
        while n < 5 {
            n += reader.read_chars(&mut buf[n..]).unwrap();
        }
        let s: String = buf.iter().collect();
        assert_eq!(s, "héllo");
        producer.join().unwrap();
    }

    #[test]
    fn blocked_writer_resumes_when_space_appears() {
        let (mut reader, mut writer) = pipe(2);
        writer.send(&[1u8, 2]).unwrap();

        let producer = thread::spawn(move || {
            // Ring is full; this blocks until the reader makes room.
            writer.send(&[3u8]).unwrap();
        });

        thread::sleep(Duration::from_millis(30));
        assert_eq!(reader.receive_one().unwrap(), Some(1));
        producer.join().unwrap();
        assert_eq!(reader.receive_one().unwrap(), Some(2));
        assert_eq!(reader.receive_one().unwrap(), Some(3));
    }
}
