//! Line-aware buffered char reading.
//!
//! [`LineReader`] buffers a [`CharRead`] source and extracts lines
//! terminated by `\n`, `\r`, or `\r\n` (and by end of stream for a final
//! unterminated line). The `\r\n` case is the subtle one: the two halves
//! may land in different buffer fills, so a persistent flag remembers that
//! the last returned line ended in `\r` and exactly one leading `\n` is
//! swallowed on the next read. [`LineNumberReader`] adds line counting on
//! top.

use std::fmt;
use std::io;

use crate::chars::{CharRead, CharWrite, Rewind};
use crate::error;

/// Default char-buffer capacity.
pub const DEFAULT_BUF_SIZE: usize = 8 * 1024;

/// A buffered char reader with mark/reset and line extraction.
///
/// # Examples
///
/// ```
/// use spool::chars::StringReader;
/// use spool::line::LineReader;
///
/// let mut r = LineReader::new(StringReader::new("a\r\nb\nc\rd"));
/// assert_eq!(r.read_line().unwrap().as_deref(), Some("a"));
/// assert_eq!(r.read_line().unwrap().as_deref(), Some("b"));
/// assert_eq!(r.read_line().unwrap().as_deref(), Some("c"));
/// assert_eq!(r.read_line().unwrap().as_deref(), Some("d"));
/// assert_eq!(r.read_line().unwrap(), None);
/// ```
pub struct LineReader<R> {
    /// The underlying source; `None` once closed.
    inner: Option<R>,

    /// The char buffer; `None` once closed. `buf[pos..count]` is valid.
    buf: Option<Box<[char]>>,
    pos: usize,
    count: usize,

    /// Saved position, or `None` when no mark is set.
    mark: Option<usize>,
    marklimit: usize,

    /// The previous line ended with `\r`; swallow one leading `\n`.
    skip_lf: bool,

    /// `skip_lf` as it was when the mark was taken.
    mark_skip_lf: bool,
}

impl<R: CharRead> LineReader<R> {
    /// Creates a line reader with the default buffer capacity.
    pub fn new(inner: R) -> LineReader<R> {
        LineReader::with_capacity(DEFAULT_BUF_SIZE, inner)
    }

    /// Creates a line reader with the given buffer capacity.
    pub fn with_capacity(cap: usize, inner: R) -> LineReader<R> {
        assert!(cap > 0, "buffer size must be positive");
        LineReader {
            inner: Some(inner),
            buf: Some(vec!['\0'; cap].into_boxed_slice()),
            pos: 0,
            count: 0,
            mark: None,
            marklimit: 0,
            skip_lf: false,
            mark_skip_lf: false,
        }
    }

    fn buf(&self) -> io::Result<&[char]> {
        self.buf.as_deref().ok_or_else(error::stream_closed)
    }

    fn inner(&mut self) -> io::Result<&mut R> {
        self.inner.as_mut().ok_or_else(error::stream_closed)
    }

    /// Refills the buffer once the readable region is exhausted.
    ///
    /// With a valid mark the marked region `[mark, pos)` is kept: shifted
    /// to the front when the buffer can hold the read limit, otherwise the
    /// buffer is grown straight to the limit. A mark whose limit has been
    /// consumed is forgotten. The destination index for the underlying
    /// read is the one computed by the branch taken here.
    fn fill(&mut self) -> io::Result<()> {
        let (inner, buf) = match (self.inner.as_mut(), self.buf.as_mut()) {
            (Some(inner), Some(buf)) => (inner, buf),
            _ => return Err(error::stream_closed()),
        };

        let dst = match self.mark {
            None => 0,
            Some(mark) => {
                let delta = self.pos - mark;
                if delta >= self.marklimit {
                    // Read-ahead exceeded; the mark may be forgotten.
                    self.mark = None;
                    self.marklimit = 0;
                    0
                } else {
                    if self.marklimit <= buf.len() {
                        buf.copy_within(mark..self.pos, 0);
                    } else {
                        let mut grown = vec!['\0'; self.marklimit].into_boxed_slice();
                        grown[..delta].copy_from_slice(&buf[mark..self.pos]);
                        *buf = grown;
                    }
                    self.mark = Some(0);
                    delta
                }
            }
        };

        self.pos = dst;
        self.count = dst;
        let n = inner.read_chars(&mut buf[dst..])?;
        self.count = dst + n;
        Ok(())
    }

    /// One buffered read step; oversized unmarked requests bypass the
    /// buffer.
    fn read1(&mut self, dst: &mut [char]) -> io::Result<usize> {
        if self.pos >= self.count {
            if dst.len() >= self.buf()?.len() && self.mark.is_none() && !self.skip_lf {
                return self.inner()?.read_chars(dst);
            }
            self.fill()?;
        }
        if self.pos >= self.count {
            return Ok(0);
        }
        if self.skip_lf {
            self.skip_lf = false;
            if self.buf()?[self.pos] == '\n' {
                self.pos += 1;
                if self.pos >= self.count {
                    self.fill()?;
                }
                if self.pos >= self.count {
                    return Ok(0);
                }
            }
        }
        let n = dst.len().min(self.count - self.pos);
        dst[..n].copy_from_slice(&self.buf()?[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    /// Reads a line without its terminator; `None` at end of stream.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut term_seen = false;
        self.read_line_raw(false, &mut term_seen)
    }

    /// The line-reading primitive.
    ///
    /// `ignore_lf` swallows one leading `\n` regardless of the `skip_lf`
    /// flag (the numbering layer uses this after mapping a bare `\r`).
    /// `term_seen` reports whether the line ended at a terminator, as
    /// opposed to end of stream.
    pub fn read_line_raw(
        &mut self,
        ignore_lf: bool,
        term_seen: &mut bool,
    ) -> io::Result<Option<String>> {
        self.buf()?;
        *term_seen = false;
        let mut line: Option<String> = None;
        let mut omit_lf = ignore_lf || self.skip_lf;

        loop {
            if self.pos >= self.count {
                self.fill()?;
            }
            if self.pos >= self.count {
                // End of stream: a non-empty final fragment is a line.
                return Ok(line.filter(|l| !l.is_empty()));
            }

            let (fragment, eol, term, next_pos) = {
                let buf = self.buf()?;
                let mut pos = self.pos;
                if omit_lf && buf[pos] == '\n' {
                    pos += 1;
                }

                let mut eol = false;
                let mut term = '\0';
                let mut i = pos;
                while i < self.count {
                    let c = buf[i];
                    if c == '\n' || c == '\r' {
                        term = c;
                        eol = true;
                        break;
                    }
                    i += 1;
                }
                let fragment: String = buf[pos..i].iter().collect();
                (fragment, eol, term, i)
            };

            // The flag is cleared whether or not the `\n` was present.
            self.skip_lf = false;
            omit_lf = false;
            self.pos = next_pos;

            if eol {
                *term_seen = true;
                let full = match line {
                    None => fragment,
                    Some(mut built) => {
                        built.push_str(&fragment);
                        built
                    }
                };
                self.pos += 1;
                if term == '\r' {
                    self.skip_lf = true;
                }
                return Ok(Some(full));
            }

            // Terminator not in this buffer; stash the fragment and fill
            // again.
            match &mut line {
                None => line = Some(fragment),
                Some(built) => built.push_str(&fragment),
            }
        }
    }

    /// Copies every remaining line into `sink`, one `write_str` plus a
    /// `\n` per line. A convenience built on [`LineReader::read_line`].
    pub fn copy_lines<W: CharWrite>(&mut self, sink: &mut W) -> io::Result<u64> {
        let mut lines = 0;
        while let Some(line) = self.read_line()? {
            sink.write_str(&line)?;
            sink.write_str("\n")?;
            lines += 1;
        }
        Ok(lines)
    }

    /// Closes the reader and the underlying source. Idempotent.
    pub fn close(&mut self) -> io::Result<()> {
        self.buf = None;
        self.mark = None;
        drop(self.inner.take());
        Ok(())
    }
}

impl<R: CharRead> CharRead for LineReader<R> {
    fn read_chars(&mut self, dst: &mut [char]) -> io::Result<usize> {
        self.buf()?;
        if dst.is_empty() {
            return Ok(0);
        }
        let mut n = self.read1(dst)?;
        if n == 0 {
            return Ok(0);
        }
        // Keep draining while the source promises not to block.
        while n < dst.len() {
            match &self.inner {
                Some(inner) if self.pos < self.count || inner.ready()? => {}
                _ => break,
            }
            let n1 = self.read1(&mut dst[n..])?;
            if n1 == 0 {
                break;
            }
            n += n1;
        }
        Ok(n)
    }

    fn read_char(&mut self) -> io::Result<Option<char>> {
        self.buf()?;
        loop {
            if self.pos >= self.count {
                self.fill()?;
            }
            if self.pos >= self.count {
                return Ok(None);
            }
            if self.skip_lf {
                self.skip_lf = false;
                if self.buf()?[self.pos] == '\n' {
                    self.pos += 1;
                    continue;
                }
            }
            let ch = self.buf()?[self.pos];
            self.pos += 1;
            return Ok(Some(ch));
        }
    }

    fn ready(&self) -> io::Result<bool> {
        self.buf()?;
        if self.pos < self.count {
            return Ok(true);
        }
        match &self.inner {
            Some(inner) => inner.ready(),
            None => Err(error::stream_closed()),
        }
    }
}

impl<R: CharRead> Rewind for LineReader<R> {
    fn mark(&mut self, readlimit: usize) {
        self.marklimit = readlimit;
        self.mark = Some(self.pos);
        self.mark_skip_lf = self.skip_lf;
    }

    fn reset(&mut self) -> io::Result<()> {
        self.buf.as_ref().ok_or_else(error::stream_closed)?;
        match self.mark {
            Some(mark) if self.pos - mark <= self.marklimit => {
                self.pos = mark;
                self.skip_lf = self.mark_skip_lf;
                Ok(())
            }
            _ => Err(error::invalid_mark()),
        }
    }
}

impl<R: fmt::Debug> fmt::Debug for LineReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineReader")
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

/// A line reader that tracks line numbers.
///
/// Terminators count once each (`\r\n` is a single terminator), and a
/// bare `\r` read through [`CharRead::read_char`] is normalized to `\n`.
pub struct LineNumberReader<R> {
    inner: LineReader<R>,

    /// Lines consumed so far.
    line: u64,

    /// The line number saved by `mark`.
    marked_line: u64,

    /// The last char returned was a normalized `\r`; a following `\n`
    /// belongs to the same terminator.
    prev_cr: bool,
    marked_prev_cr: bool,
}

impl<R: CharRead> LineNumberReader<R> {
    /// Creates a numbering reader with the default buffer capacity.
    pub fn new(inner: R) -> LineNumberReader<R> {
        LineNumberReader {
            inner: LineReader::new(inner),
            line: 0,
            marked_line: 0,
            prev_cr: false,
            marked_prev_cr: false,
        }
    }

    /// The number of lines consumed so far.
    pub fn line_number(&self) -> u64 {
        self.line
    }

    /// Overrides the current line number.
    pub fn set_line_number(&mut self, line: u64) {
        self.line = line;
    }

    /// Reads a line and bumps the line number when one is returned.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        let ignore = std::mem::take(&mut self.prev_cr);
        let mut term_seen = false;
        let line = self.inner.read_line_raw(ignore, &mut term_seen)?;
        if line.is_some() {
            self.line += 1;
        }
        Ok(line)
    }

    /// Closes the reader. Idempotent.
    pub fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

impl<R: CharRead> CharRead for LineNumberReader<R> {
    fn read_chars(&mut self, dst: &mut [char]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        // Reads go char by char so terminators are counted and
        // normalized; the numbering variant trades speed for that.
        let mut n = 0;
        while n < dst.len() {
            if n > 0 && !self.ready()? {
                break;
            }
            match self.read_char()? {
                Some(ch) => {
                    dst[n] = ch;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn read_char(&mut self) -> io::Result<Option<char>> {
        loop {
            let ch = self.inner.read_char()?;
            match ch {
                Some('\n') if self.prev_cr => {
                    // Second half of a `\r\n`; already counted.
                    self.prev_cr = false;
                    continue;
                }
                Some('\r') => {
                    self.prev_cr = true;
                    self.line += 1;
                    return Ok(Some('\n'));
                }
                Some('\n') => {
                    self.prev_cr = false;
                    self.line += 1;
                    return Ok(Some('\n'));
                }
                other => {
                    self.prev_cr = false;
                    return Ok(other);
                }
            }
        }
    }

    fn ready(&self) -> io::Result<bool> {
        self.inner.ready()
    }
}

impl<R: CharRead> Rewind for LineNumberReader<R> {
    fn mark(&mut self, readlimit: usize) {
        self.inner.mark(readlimit);
        self.marked_line = self.line;
        self.marked_prev_cr = self.prev_cr;
    }

    fn reset(&mut self) -> io::Result<()> {
        self.inner.reset()?;
        self.line = self.marked_line;
        self.prev_cr = self.marked_prev_cr;
        Ok(())
    }
}

impl<R: fmt::Debug> fmt::Debug for LineNumberReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineNumberReader")
            .field("reader", &self.inner)
            .field("line", &self.line)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chars::StringReader;

    fn lines_of(input: &str, cap: usize) -> Vec<String> {
        let mut r = LineReader::with_capacity(cap, StringReader::new(input));
        let mut out = Vec::new();
        while let Some(line) = r.read_line().unwrap() {
            out.push(line);
        }
        out
    }

    #[test]
    fn all_three_terminators() {
        assert_eq!(lines_of("a\r\nb\nc\rd", 128), ["a", "b", "c", "d"]);
    }

    #[test]
    fn crlf_straddling_a_buffer_boundary() {
        // Capacity 2 puts the `\r` and `\n` in different fills.
        assert_eq!(lines_of("a\r\nb", 2), ["a", "b"]);
        assert_eq!(lines_of("ab\rcd\nef", 2), ["ab", "cd", "ef"]);
    }

    #[test]
    fn concatenation_with_terminators_recovers_the_input() {
        let input = "one\ntwo\r\nthree\rfour";
        let mut r = LineReader::with_capacity(4, StringReader::new(input));
        let mut rebuilt = String::new();
        let mut term_seen = false;
        let terms = ["\n", "\r\n", "\r", ""];
        let mut i = 0;
        while let Some(line) = r.read_line_raw(false, &mut term_seen).unwrap() {
            rebuilt.push_str(&line);
            rebuilt.push_str(terms[i]);
            assert_eq!(term_seen, !terms[i].is_empty());
            i += 1;
        }
        assert_eq!(rebuilt, input);
    }

    #[test]
    fn empty_lines_are_preserved() {
        assert_eq!(lines_of("a\n\nb\n", 128), ["a", "", "b"]);
        assert_eq!(lines_of("\r\n\r\n", 128), ["", ""]);
    }

    #[test]
    fn long_lines_assemble_across_fills() {
        let long = "x".repeat(1000);
        let input = format!("{}\nend", long);
        assert_eq!(lines_of(&input, 16), [long.as_str(), "end"]);
    }

    #[test]
    fn read_chars_skips_the_pending_lf() {
        let mut r = LineReader::with_capacity(4, StringReader::new("a\r\nbc"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("a"));
        let mut buf = ['\0'; 2];
        assert_eq!(r.read_chars(&mut buf).unwrap(), 2);
        assert_eq!(&buf, &['b', 'c']);
    }

    #[test]
    fn mark_and_reset_restore_line_state() {
        let mut r = LineReader::with_capacity(64, StringReader::new("ab\ncd\nef"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("ab"));
        r.mark(16);
        assert_eq!(r.read_line().unwrap().as_deref(), Some("cd"));
        r.reset().unwrap();
        assert_eq!(r.read_line().unwrap().as_deref(), Some("cd"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("ef"));
    }

    #[test]
    fn mark_grows_the_buffer_when_the_limit_demands_it() {
        let mut r = LineReader::with_capacity(4, StringReader::new("abcdefghij"));
        r.mark(8);
        let mut buf = ['\0'; 6];
        let mut n = 0;
        while n < 6 {
            n += r.read_chars(&mut buf[n..]).unwrap();
        }
        r.reset().unwrap();
        let mut again = ['\0'; 6];
        let mut m = 0;
        while m < 6 {
            m += r.read_chars(&mut again[m..]).unwrap();
        }
        assert_eq!(buf, again);
    }

    #[test]
    fn line_numbers_count_each_terminator_once() {
        let mut r = LineNumberReader::new(StringReader::new("a\r\nb\nc\rd"));
        assert_eq!(r.line_number(), 0);
        assert_eq!(r.read_line().unwrap().as_deref(), Some("a"));
        assert_eq!(r.line_number(), 1);
        assert_eq!(r.read_line().unwrap().as_deref(), Some("b"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("c"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("d"));
        assert_eq!(r.line_number(), 4);
        assert_eq!(r.read_line().unwrap(), None);
        assert_eq!(r.line_number(), 4);
    }

    #[test]
    fn read_char_normalizes_terminators() {
        let mut r = LineNumberReader::new(StringReader::new("a\r\nb\rc"));
        let mut out = String::new();
        while let Some(ch) = r.read_char().unwrap() {
            out.push(ch);
        }
        assert_eq!(out, "a\nb\nc");
        assert_eq!(r.line_number(), 2);
    }

    #[test]
    fn set_line_number_overrides() {
        let mut r = LineNumberReader::new(StringReader::new("x\ny"));
        r.set_line_number(10);
        r.read_line().unwrap();
        assert_eq!(r.line_number(), 11);
    }

    #[test]
    fn close_is_idempotent_and_sticky() {
        let mut r = LineReader::with_capacity(4, StringReader::new("abc"));
        r.close().unwrap();
        r.close().unwrap();
        assert_eq!(
            r.read_line().unwrap_err().to_string(),
            "stream closed"
        );
    }
}
