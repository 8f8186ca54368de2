// src/parser.rs
//! Incremental HTTP/1.1 request parser.
//!
//! The parser is driven once per read cycle against the connection's read
//! buffer. It remembers its phase and scan offsets between calls, so bytes
//! that were already examined are never scanned again, and a line or body
//! split across several reads is picked up where it stopped.

use crate::http::{Method, Version};
use crate::scanner::{LineStatus, scan_line};
use std::ops::Range;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    RequestLine,
    Headers,
    Body,
    Complete,
}

/// Why a request was rejected. Every variant is answered with 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformed {
    BadLineTerminator,
    BadRequestLine,
    UnsupportedMethod,
    UnsupportedVersion,
    BadTarget,
    BadContentLength,
    BodyTooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The buffer ends mid-request; resume after the next read.
    NeedMore,
    Malformed(Malformed),
    /// Request line, headers and body are all in the buffer.
    Complete,
}

/// The parsed request. Owned values only; nothing here borrows the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub version: Version,
    pub keep_alive: bool,
    pub content_length: usize,
    pub host: Option<String>,
    /// Body location inside the read buffer, set once the body is complete.
    pub body: Range<usize>,
}

impl Default for RequestHead {
    fn default() -> Self {
        Self {
            method: Method::Get,
            path: String::new(),
            version: Version::Http11,
            keep_alive: false,
            content_length: 0,
            host: None,
            body: 0..0,
        }
    }
}

/// Read buffer with the scan cursors the parser advances.
///
/// Invariant: `checked <= filled <= data.len()`.
pub struct ReadBuf {
    data: Box<[u8]>,
    filled: usize,
    checked: usize,
    start_line: usize,
}

impl ReadBuf {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            filled: 0,
            checked: 0,
            start_line: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes received so far.
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Bytes already examined by the line scanner.
    pub fn checked(&self) -> usize {
        self.checked
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// The unfilled tail, for the next `recv`.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Record `n` bytes written into [`ReadBuf::spare_mut`].
    pub fn advance(&mut self, n: usize) {
        self.filled = (self.filled + n).min(self.data.len());
    }

    /// Append bytes, returning how many fit.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len() - self.filled);
        self.data[self.filled..self.filled + n].copy_from_slice(&bytes[..n]);
        self.filled += n;
        n
    }

    /// Drop the first `consumed` bytes, keeping anything received after
    /// them at the front of the buffer. Cursors restart at zero.
    pub fn discard(&mut self, consumed: usize) {
        let consumed = consumed.min(self.filled);
        self.data.copy_within(consumed..self.filled, 0);
        self.filled -= consumed;
        self.checked = 0;
        self.start_line = 0;
    }

    pub fn clear(&mut self) {
        self.filled = 0;
        self.checked = 0;
        self.start_line = 0;
    }
}

pub struct RequestParser {
    phase: Phase,
    head: RequestHead,
    body_start: usize,
    saw_content_length: bool,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            phase: Phase::RequestLine,
            head: RequestHead::default(),
            body_start: 0,
            saw_content_length: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    /// Total bytes the finished request occupies at the front of the buffer.
    pub fn consumed(&self) -> usize {
        self.head.body.end.max(self.body_start)
    }

    pub fn reset(&mut self) {
        self.phase = Phase::RequestLine;
        self.head = RequestHead::default();
        self.body_start = 0;
        self.saw_content_length = false;
    }

    /// Advance as far as the buffered bytes allow.
    pub fn parse(&mut self, buf: &mut ReadBuf) -> ParseOutcome {
        loop {
            match self.phase {
                Phase::Complete => return ParseOutcome::Complete,
                Phase::Body => return self.parse_body(buf),
                Phase::RequestLine | Phase::Headers => {}
            }

            match scan_line(&buf.data, &mut buf.checked, buf.filled) {
                LineStatus::Incomplete => return ParseOutcome::NeedMore,
                LineStatus::Malformed => {
                    return ParseOutcome::Malformed(Malformed::BadLineTerminator);
                }
                LineStatus::Complete => {}
            }

            // The terminator is either "\r\n" or a "\n" completing an
            // earlier '\r'; both leave two terminator bytes behind checked.
            let line = buf.start_line..buf.checked - 2;
            buf.start_line = buf.checked;
            let text = &buf.data[line];
            trace!(line = %String::from_utf8_lossy(text), "http line");

            let step = match self.phase {
                Phase::RequestLine => self.parse_request_line(text),
                _ => self.parse_header(text, buf.checked, buf.capacity()),
            };
            if let Err(reason) = step {
                return ParseOutcome::Malformed(reason);
            }
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), Malformed> {
        let is_sep = |b: &u8| *b == b' ' || *b == b'\t';

        let method_end = line.iter().position(is_sep).ok_or(Malformed::BadRequestLine)?;
        let method = Method::from_bytes(&line[..method_end]).ok_or(Malformed::UnsupportedMethod)?;

        let rest = &line[method_end + 1..];
        let target_end = rest.iter().position(is_sep).ok_or(Malformed::BadRequestLine)?;
        let version =
            Version::from_bytes(&rest[target_end + 1..]).ok_or(Malformed::UnsupportedVersion)?;

        let mut target = &rest[..target_end];
        if target.len() >= 7 && target[..7].eq_ignore_ascii_case(b"http://") {
            let authority = &target[7..];
            let slash = authority.iter().position(|b| *b == b'/').ok_or(Malformed::BadTarget)?;
            target = &authority[slash..];
        }
        if target.first() != Some(&b'/') {
            return Err(Malformed::BadTarget);
        }
        let path = std::str::from_utf8(target).map_err(|_| Malformed::BadTarget)?;

        self.head.method = method;
        self.head.version = version;
        self.head.path = path.to_owned();
        self.phase = Phase::Headers;
        Ok(())
    }

    fn parse_header(
        &mut self,
        line: &[u8],
        line_end: usize,
        capacity: usize,
    ) -> Result<(), Malformed> {
        if line.is_empty() {
            if self.head.content_length == 0 {
                self.body_start = line_end;
                self.head.body = line_end..line_end;
                self.phase = Phase::Complete;
            } else {
                if self.head.content_length > capacity.saturating_sub(line_end) {
                    return Err(Malformed::BodyTooLarge);
                }
                self.body_start = line_end;
                self.phase = Phase::Body;
            }
            return Ok(());
        }

        if let Some(value) = header_value(line, b"Connection:") {
            if value.eq_ignore_ascii_case(b"keep-alive") {
                self.head.keep_alive = true;
            }
        } else if let Some(value) = header_value(line, b"Content-Length:") {
            let len = parse_content_length(value).ok_or(Malformed::BadContentLength)?;
            if self.saw_content_length && len != self.head.content_length {
                return Err(Malformed::BadContentLength);
            }
            self.saw_content_length = true;
            self.head.content_length = len;
        } else if let Some(value) = header_value(line, b"Host:") {
            self.head.host = Some(String::from_utf8_lossy(value).into_owned());
        } else {
            trace!(header = %String::from_utf8_lossy(line), "ignoring unknown header");
        }
        Ok(())
    }

    fn parse_body(&mut self, buf: &ReadBuf) -> ParseOutcome {
        let len = self.head.content_length;
        if buf.filled - self.body_start >= len {
            self.head.body = self.body_start..self.body_start + len;
            self.phase = Phase::Complete;
            ParseOutcome::Complete
        } else {
            ParseOutcome::NeedMore
        }
    }
}

/// ASCII digits only. `None` on anything else or on overflow.
fn parse_content_length(value: &[u8]) -> Option<usize> {
    if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
        return None;
    }
    value.iter().try_fold(0usize, |acc, d| {
        acc.checked_mul(10)?.checked_add(usize::from(d - b'0'))
    })
}

/// Case-insensitive `Name:` prefix match, returning the value with
/// surrounding spaces and tabs removed.
fn header_value<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if line.len() < name.len() || !line[..name.len()].eq_ignore_ascii_case(name) {
        return None;
    }
    let value = &line[name.len()..];
    let start = value.iter().position(|b| *b != b' ' && *b != b'\t').unwrap_or(value.len());
    let end = value.iter().rposition(|b| *b != b' ' && *b != b'\t').map_or(start, |i| i + 1);
    Some(&value[start..end.max(start)])
}
