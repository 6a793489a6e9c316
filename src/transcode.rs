//! Byte↔char transcoding streams.
//!
//! [`DecodeReader`] turns a byte source into a [`CharRead`] through a
//! [`Decoder`]; [`EncodeWriter`] turns a byte sink into a [`CharWrite`]
//! through an [`Encoder`]. The interesting part is what happens at the
//! seams: bytes of a partially-read unit are carried across refills, a
//! one-char read that decodes two chars keeps the second for the next
//! call, and the UTF-16 views never split a surrogate pair across calls:
//! a dangling half lives in a pending slot until its partner arrives.

use std::fmt;
use std::io::{self, Write};

use crate::chars::{ByteSource, CharRead, CharWrite};
use crate::codec::{CoderResult, Decoder, Encoder, Utf8, REPLACEMENT};
use crate::error;

/// Default size of the transcoder-side byte buffers.
pub const DEFAULT_BUF_SIZE: usize = 8 * 1024;

/// A char reader decoding from an underlying byte source.
///
/// # Examples
///
/// ```
/// use spool::chars::CharRead;
/// use spool::transcode::DecodeReader;
/// use std::io::Cursor;
///
/// let mut r = DecodeReader::utf8(Cursor::new("héllo".as_bytes().to_vec()));
/// let mut buf = ['\0'; 5];
/// assert_eq!(r.read_chars(&mut buf).unwrap(), 5);
/// assert_eq!(buf.iter().collect::<String>(), "héllo");
/// ```
pub struct DecodeReader<R, D> {
    /// The byte source; `None` once closed.
    inner: Option<R>,
    decoder: D,

    /// Pending bytes from the source. `bytes[start..end]` is undecoded.
    bytes: Box<[u8]>,
    start: usize,
    end: usize,

    /// The source reported end of stream.
    eof: bool,

    /// Second char of a pairwise single-char read, delivered first next
    /// time.
    leftover: Option<char>,

    /// Low surrogate held back by `read_utf16` when only half a pair fit.
    pending_unit: Option<u16>,
}

impl<R: ByteSource> DecodeReader<R, Utf8> {
    /// Creates a UTF-8 decoding reader with the default buffer size.
    pub fn utf8(inner: R) -> DecodeReader<R, Utf8> {
        DecodeReader::new(inner, Utf8)
    }
}

impl<R: ByteSource, D: Decoder> DecodeReader<R, D> {
    /// Creates a decoding reader with the default buffer size.
    pub fn new(inner: R, decoder: D) -> DecodeReader<R, D> {
        DecodeReader::with_capacity(DEFAULT_BUF_SIZE, inner, decoder)
    }

    /// Creates a decoding reader with the given byte-buffer size.
    pub fn with_capacity(cap: usize, inner: R, decoder: D) -> DecodeReader<R, D> {
        assert!(
            cap >= decoder.max_bytes_per_char(),
            "buffer must hold at least one unit"
        );
        DecodeReader {
            inner: Some(inner),
            decoder,
            bytes: vec![0; cap].into_boxed_slice(),
            start: 0,
            end: 0,
            eof: false,
            leftover: None,
            pending_unit: None,
        }
    }

    fn inner(&mut self) -> io::Result<&mut R> {
        self.inner.as_mut().ok_or_else(error::stream_closed)
    }

    /// Moves the undecoded tail to the front and tops the buffer up with
    /// one underlying read. Returns how many new bytes arrived.
    fn refill(&mut self) -> io::Result<usize> {
        if self.start > 0 {
            self.bytes.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        let end = self.end;
        let inner = self.inner.as_mut().ok_or_else(error::stream_closed)?;
        let n = inner.read(&mut self.bytes[end..])?;
        if n == 0 {
            self.eof = true;
        }
        self.end += n;
        Ok(n)
    }

    /// Whether the source can hand over bytes without blocking.
    fn source_ready(&self) -> io::Result<bool> {
        match &self.inner {
            Some(inner) => Ok(inner.available()? > 0),
            None => Err(error::stream_closed()),
        }
    }

    /// Closes the reader and the underlying source. Idempotent.
    pub fn close(&mut self) -> io::Result<()> {
        drop(self.inner.take());
        self.leftover = None;
        self.pending_unit = None;
        self.start = 0;
        self.end = 0;
        Ok(())
    }

    /// Reads UTF-16 code units.
    ///
    /// A supplementary char produces two units; when only the first fits
    /// in `dst`, the low surrogate waits in a pending slot and leads the
    /// next call, so a pair is never torn apart.
    pub fn read_utf16(&mut self, dst: &mut [u16]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        let mut n = 0;
        if let Some(unit) = self.pending_unit.take() {
            dst[n] = unit;
            n += 1;
        }
        while n < dst.len() {
            // Block only for the first unit.
            if n > 0 && !self.ready()? {
                break;
            }
            match self.read_char()? {
                None => break,
                Some(ch) => {
                    let mut units = [0u16; 2];
                    let encoded = ch.encode_utf16(&mut units);
                    dst[n] = encoded[0];
                    n += 1;
                    if encoded.len() == 2 {
                        if n < dst.len() {
                            dst[n] = encoded[1];
                            n += 1;
                        } else {
                            self.pending_unit = Some(encoded[1]);
                            break;
                        }
                    }
                }
            }
        }
        Ok(n)
    }
}

impl<R: ByteSource, D: Decoder> CharRead for DecodeReader<R, D> {
    fn read_chars(&mut self, dst: &mut [char]) -> io::Result<usize> {
        self.inner.as_ref().ok_or_else(error::stream_closed)?;
        if dst.is_empty() {
            return Ok(0);
        }

        let mut n = 0;
        if let Some(ch) = self.leftover.take() {
            dst[n] = ch;
            n += 1;
        }

        loop {
            if n == dst.len() {
                return Ok(n);
            }
            let (consumed, produced, result) =
                self.decoder
                    .decode(&self.bytes[self.start..self.end], &mut dst[n..], self.eof);
            self.start += consumed;
            n += produced;

            match result {
                CoderResult::Overflow => return Ok(n),
                CoderResult::Underflow => {
                    if self.eof && self.start == self.end {
                        // Fully drained; n may be 0, which is EOF.
                        return Ok(n);
                    }
                    // Block at most once: with chars already in hand, only
                    // keep going while the source promises more for free.
                    if n > 0 && !self.source_ready()? {
                        return Ok(n);
                    }
                    self.refill()?;
                }
            }
        }
    }

    /// Reads one char by asking the decoder for up to two and keeping the
    /// second as a leftover, so decode batches never strand a unit.
    fn read_char(&mut self) -> io::Result<Option<char>> {
        if let Some(ch) = self.leftover.take() {
            return Ok(Some(ch));
        }
        let mut pair = ['\0'; 2];
        match self.read_chars(&mut pair)? {
            0 => Ok(None),
            1 => Ok(Some(pair[0])),
            _ => {
                self.leftover = Some(pair[1]);
                Ok(Some(pair[0]))
            }
        }
    }

    fn ready(&self) -> io::Result<bool> {
        Ok(self.leftover.is_some()
            || self.pending_unit.is_some()
            || self.start < self.end
            || self.source_ready()?)
    }
}

impl<R: fmt::Debug, D> fmt::Debug for DecodeReader<R, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeReader")
            .field("reader", &self.inner)
            .field("pending_bytes", &(self.end - self.start))
            .field("leftover", &self.leftover)
            .finish()
    }
}

/// A char writer encoding into an underlying byte sink.
///
/// # Examples
///
/// ```
/// use spool::chars::CharWrite;
/// use spool::transcode::EncodeWriter;
///
/// let mut w = EncodeWriter::utf8(Vec::new());
/// w.write_str("héllo").unwrap();
/// w.flush().unwrap();
/// assert_eq!(w.get_ref().unwrap(), "héllo".as_bytes());
/// ```
pub struct EncodeWriter<W: Write, E> {
    /// The byte sink; `None` once closed.
    inner: Option<W>,
    encoder: E,

    /// Encoded bytes awaiting the sink. `bytes[..len]` is valid.
    bytes: Box<[u8]>,
    len: usize,

    /// High surrogate awaiting its partner across `write_utf16` calls.
    pending_high: Option<u16>,
}

impl<W: Write> EncodeWriter<W, Utf8> {
    /// Creates a UTF-8 encoding writer with the default buffer size.
    pub fn utf8(inner: W) -> EncodeWriter<W, Utf8> {
        EncodeWriter::new(inner, Utf8)
    }
}

impl<W: Write, E: Encoder> EncodeWriter<W, E> {
    /// Creates an encoding writer with the default buffer size.
    pub fn new(inner: W, encoder: E) -> EncodeWriter<W, E> {
        EncodeWriter::with_capacity(DEFAULT_BUF_SIZE, inner, encoder)
    }

    /// Creates an encoding writer with the given byte-buffer size.
    pub fn with_capacity(cap: usize, inner: W, encoder: E) -> EncodeWriter<W, E> {
        assert!(
            cap >= encoder.max_bytes_per_char(),
            "buffer must hold at least one unit"
        );
        EncodeWriter {
            inner: Some(inner),
            encoder,
            bytes: vec![0; cap].into_boxed_slice(),
            len: 0,
            pending_high: None,
        }
    }

    /// Gets a reference to the sink, unless closed.
    pub fn get_ref(&self) -> Option<&W> {
        self.inner.as_ref()
    }

    fn inner(&mut self) -> io::Result<&mut W> {
        self.inner.as_mut().ok_or_else(error::stream_closed)
    }

    /// Pushes every buffered byte into the sink.
    fn flush_buf(&mut self) -> io::Result<()> {
        let len = self.len;
        if len > 0 {
            let inner = self.inner.as_mut().ok_or_else(error::stream_closed)?;
            inner.write_all(&self.bytes[..len])?;
            self.len = 0;
        }
        Ok(())
    }

    /// Writes UTF-16 code units.
    ///
    /// A trailing high surrogate is held until the next call supplies its
    /// partner; unpaired units encode as the replacement char.
    pub fn write_utf16(&mut self, units: &[u16]) -> io::Result<()> {
        self.inner.as_ref().ok_or_else(error::stream_closed)?;
        let mut chars = Vec::with_capacity(units.len());
        let mut i = 0;

        if let Some(high) = self.pending_high.take() {
            match units.first() {
                Some(&low) if (0xDC00..=0xDFFF).contains(&low) => {
                    chars.push(combine_surrogates(high, low));
                    i = 1;
                }
                Some(_) => chars.push(REPLACEMENT),
                None => {
                    // Nothing arrived; keep waiting.
                    self.pending_high = Some(high);
                    return Ok(());
                }
            }
        }

        while i < units.len() {
            let unit = units[i];
            if (0xD800..=0xDBFF).contains(&unit) {
                if i + 1 < units.len() && (0xDC00..=0xDFFF).contains(&units[i + 1]) {
                    chars.push(combine_surrogates(unit, units[i + 1]));
                    i += 2;
                } else if i + 1 == units.len() {
                    self.pending_high = Some(unit);
                    i += 1;
                } else {
                    chars.push(REPLACEMENT);
                    i += 1;
                }
            } else if (0xDC00..=0xDFFF).contains(&unit) {
                // A low surrogate with no high before it.
                chars.push(REPLACEMENT);
                i += 1;
            } else {
                chars.push(char::from_u32(unit as u32).unwrap_or(REPLACEMENT));
                i += 1;
            }
        }

        self.write_chars(&chars)
    }

    /// Flushes, closes the sink, and releases it. A dangling pending unit
    /// is replaced per the malformed-input policy. Idempotent.
    pub fn close(&mut self) -> io::Result<()> {
        if self.inner.is_some() {
            if self.pending_high.take().is_some() {
                self.write_chars(&[REPLACEMENT])?;
            }
            self.flush_buf()?;
            self.inner()?.flush()?;
            self.inner = None;
        }
        Ok(())
    }
}

fn combine_surrogates(high: u16, low: u16) -> char {
    let value = 0x1_0000 + (((high as u32 - 0xD800) << 10) | (low as u32 - 0xDC00));
    char::from_u32(value).unwrap_or(REPLACEMENT)
}

impl<W: Write, E: Encoder> CharWrite for EncodeWriter<W, E> {
    fn write_chars(&mut self, src: &[char]) -> io::Result<()> {
        self.inner.as_ref().ok_or_else(error::stream_closed)?;
        let mut i = 0;
        while i < src.len() {
            let len = self.len;
            let (consumed, produced, result) =
                self.encoder.encode(&src[i..], &mut self.bytes[len..]);
            i += consumed;
            self.len += produced;
            if result == CoderResult::Overflow || self.len == self.bytes.len() {
                self.flush_buf()?;
            }
        }
        Ok(())
    }

    fn write_str(&mut self, s: &str) -> io::Result<()> {
        let mut batch = ['\0'; 128];
        let mut n = 0;
        for ch in s.chars() {
            batch[n] = ch;
            n += 1;
            if n == batch.len() {
                self.write_chars(&batch)?;
                n = 0;
            }
        }
        self.write_chars(&batch[..n])
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buf()?;
        self.inner()?.flush()
    }
}

impl<W: Write, E> Drop for EncodeWriter<W, E> {
    fn drop(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            // Destructors must not fail; errors here are dropped.
            if self.len > 0 {
                let _ = inner.write_all(&self.bytes[..self.len]);
            }
            let _ = inner.flush();
        }
    }
}

impl<W: Write + fmt::Debug, E> fmt::Debug for EncodeWriter<W, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodeWriter")
            .field("writer", &self.inner)
            .field("buffered_bytes", &self.len)
            .finish()
    }
}
