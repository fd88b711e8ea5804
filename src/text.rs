//! Time and text primitives shared by the whole parser
//!
//! Everything here works on byte slices; the log's encoding is only known to
//! the viewer, so nothing in this module assumes valid UTF-8 outside of the
//! ASCII timestamps.

use chrono::NaiveDateTime;
use memchr::{memchr, memmem, memrchr};

/// A byte range within the parser's backing buffer
///
/// Entities never hold slices of the log data; they hold ranges and resolve
/// them through the owning parser. This keeps cross-referencing entities
/// cheap to copy and free of lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: usize,
    pub end: usize,
}

impl ByteRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Resolve this range against the buffer it was produced from
    pub fn slice<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Timestamp formats tried in order; first match wins.
///
/// The syslog-style variants carry no year and are anchored to 1900 the way
/// strptime does, which keeps ordering comparisons within one file correct.
const FULL_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];
const SYSLOG_FORMATS: [&str; 2] = ["%Y %b %e %H:%M:%S%.f", "%Y %b %e %H:%M:%S"];

/// Parse a log timestamp in one of the four known formats.
///
/// Returns `None` when no format matches; callers propagate the absence as
/// "unknown" rather than failing the line.
pub fn parse_when(when: &[u8]) -> Option<NaiveDateTime> {
    let text = std::str::from_utf8(when).ok()?.trim();
    for fmt in FULL_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(ts);
        }
    }
    let anchored = format!("1900 {}", text);
    for fmt in SYSLOG_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(&anchored, fmt) {
            return Some(ts);
        }
    }
    None
}

/// Find `needle` in `haystack` at or after `start`.
pub fn find_at(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if start > haystack.len() {
        return None;
    }
    memmem::find(&haystack[start..], needle).map(|idx| idx + start)
}

/// Find `needle` entirely within `haystack[start..end]`.
pub fn find_bounded(haystack: &[u8], needle: &[u8], start: usize, end: usize) -> Option<usize> {
    let end = end.min(haystack.len());
    if start > end {
        return None;
    }
    memmem::find(&haystack[start..end], needle).map(|idx| idx + start)
}

/// Return the substring strictly between `left` and `right`, searching for
/// `left` at or after `start`, together with the position of `right`.
pub fn delimited<'a>(
    buf: &'a [u8],
    left: &[u8],
    right: &[u8],
    start: usize,
) -> Option<(&'a [u8], usize)> {
    delimited_bounded(buf, left, right, start, buf.len())
}

/// Like [`delimited`], but the search for the *left* delimiter is bounded by
/// `end`; the right delimiter is still searched to the end of the buffer.
pub fn delimited_bounded<'a>(
    buf: &'a [u8],
    left: &[u8],
    right: &[u8],
    start: usize,
    end: usize,
) -> Option<(&'a [u8], usize)> {
    let end = end.min(buf.len());
    if start > end {
        return None;
    }
    let a = memmem::find(&buf[start..end], left)? + start;
    let from = a + left.len();
    let b = find_at(buf, right, from)?;
    Some((&buf[from..b], b))
}

/// Return the next line (without its terminator) and the position after it.
///
/// A final line with no newline is returned empty on purpose: truncated
/// tails must not produce partial parses.
pub fn next_line(data: &[u8], pos: usize) -> (ByteRange, usize) {
    match memchr(b'\n', &data[pos..]) {
        None => (ByteRange::new(data.len(), data.len()), data.len()),
        Some(offset) => {
            let eol = pos + offset;
            let end = if eol > pos && data[eol - 1] == b'\r' {
                eol - 1
            } else {
                eol
            };
            (ByteRange::new(pos, end), eol + 1)
        }
    }
}

/// Phone extracted from a device name: the part after the last `/`.
pub fn device_phone(device: &[u8]) -> &[u8] {
    match memrchr(b'/', device) {
        Some(idx) if idx > 0 => &device[idx + 1..],
        _ => device,
    }
}

/// Phone extracted from a channel name: between the last `/` and the
/// following `-` (e.g. `SIP/208-0015bcb7` yields `208`).
pub fn channel_phone(chan: &[u8]) -> &[u8] {
    match memrchr(b'/', chan) {
        Some(idx) if idx > 0 => match find_at(chan, b"-", idx) {
            Some(dash) => &chan[idx + 1..dash],
            None => &chan[idx + 1..],
        },
        _ => chan,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_when_formats() {
        assert!(parse_when(b"2024-01-01 10:00:00.123456").is_some());
        assert!(parse_when(b"2024-01-01 10:00:00").is_some());
        assert!(parse_when(b"Jan  5 10:00:00.123456").is_some());
        assert!(parse_when(b"Jan 15 10:00:00").is_some());
        assert!(parse_when(b"not a timestamp").is_none());
        assert!(parse_when(b"").is_none());
    }

    #[test]
    fn test_parse_when_ordering() {
        let early = parse_when(b"2024-01-01 10:00:00").unwrap();
        let late = parse_when(b"2024-01-01 10:00:00.000001").unwrap();
        assert!(early < late);
    }

    #[test]
    fn test_delimited() {
        let line = b"<--- SIP read from UDP:10.0.0.1:5060 --->";
        let (addr, pos) = delimited(line, b":", b" ", 18).unwrap();
        assert_eq!(addr, b"10.0.0.1:5060");
        assert_eq!(line[pos], b' ');

        assert!(delimited(line, b"#", b" ", 0).is_none());
        assert!(delimited(line, b"UDP", b"#", 0).is_none());
    }

    #[test]
    fn test_delimited_bounded() {
        let line = b"From: Alice Smith <sip:100@h>";
        // Left delimiter restricted to before the URI; the span between the
        // two spaces is the last display-name token.
        let (name, _) = delimited_bounded(line, b" ", b" ", 6, 18).unwrap();
        assert_eq!(name, b"Smith");

        // No second delimiter inside the bound and none after: absent.
        assert!(delimited_bounded(b"From: Alice <sip:1@h>", b"#", b"#", 0, 10).is_none());
    }

    #[test]
    fn test_next_line() {
        let data = b"one\r\ntwo\nthree";
        let (line, pos) = next_line(data, 0);
        assert_eq!(line.slice(data), b"one");
        let (line, pos) = next_line(data, pos);
        assert_eq!(line.slice(data), b"two");
        // Trailing partial line is discarded.
        let (line, pos) = next_line(data, pos);
        assert!(line.is_empty());
        assert_eq!(pos, data.len());
    }

    #[test]
    fn test_phone_extraction() {
        assert_eq!(device_phone(b"SIP/440"), b"440");
        assert_eq!(device_phone(b"SIP/tk/123"), b"123");
        assert_eq!(device_phone(b"440"), b"440");
        assert_eq!(channel_phone(b"SIP/208-0015bcb7"), b"208");
        assert_eq!(channel_phone(b"SIP/gsm2"), b"gsm2");
        assert_eq!(channel_phone(b"plain"), b"plain");
    }
}
