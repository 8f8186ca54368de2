// src/scanner.rs
//! CRLF line scanning over a buffer that grows between calls.
//!
//! The scanner keeps no state of its own. The caller owns `checked`, the
//! offset of the first byte not yet examined, and passes it back on every
//! call so scanning resumes exactly where the previous read left off.

use memchr::memchr2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line ends just before `checked - 2`.
    Complete,
    /// No terminator yet; wait for more bytes.
    Incomplete,
    /// A terminator byte appeared in an invalid position.
    Malformed,
}

/// Scan `buf[*checked..filled]` for the next `\r\n`.
///
/// `checked` only ever moves forward. A `\r` sitting at the very end of the
/// received data is left unconsumed so the `\n` in the next read completes
/// it.
pub fn scan_line(buf: &[u8], checked: &mut usize, filled: usize) -> LineStatus {
    debug_assert!(*checked <= filled && filled <= buf.len());

    while *checked < filled {
        let Some(offset) = memchr2(b'\r', b'\n', &buf[*checked..filled]) else {
            *checked = filled;
            return LineStatus::Incomplete;
        };
        *checked += offset;

        match buf[*checked] {
            b'\r' => {
                if *checked + 1 == filled {
                    return LineStatus::Incomplete;
                }
                if buf[*checked + 1] == b'\n' {
                    *checked += 2;
                    return LineStatus::Complete;
                }
                return LineStatus::Malformed;
            }
            _ => {
                // Bare '\n': only valid if it closes a '\r' consumed earlier.
                if *checked > 0 && buf[*checked - 1] == b'\r' {
                    *checked += 1;
                    return LineStatus::Complete;
                }
                return LineStatus::Malformed;
            }
        }
    }
    LineStatus::Incomplete
}
