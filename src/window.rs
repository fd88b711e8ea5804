//! Windowed access to the log file
//!
//! Locates a byte range by timestamp using a binary search over fixed-size
//! probe reads, and refuses to select more data than the configured share of
//! system memory. The log is never read in full unless the window says so.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use chrono::{Duration, NaiveDateTime};
use memchr::memchr;
use regex::Regex;
use tracing::{debug, info};

use crate::error::{AstflowError, AstflowResult};
use crate::text::{next_line, parse_when};

/// Bytes probed at the end of the file in tail mode.
const TAIL_PROBE: u64 = 32_000;
/// Bytes read per binary-search probe.
const PROBE_WINDOW: usize = 64_000;
/// Extra bytes past the end bound so an in-progress SIP message can finish.
const END_GRACE: u64 = 16_000;
/// Upper bound on binary-search iterations.
const MAX_PROBES: usize = 40;

/// Which end of the window a search targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// First timestamped line at or after the target instant
    After,
    /// Last timestamped line at or before the target instant
    Before,
}

/// How to extract a timestamp from a probe window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Bracketed log timestamps
    Log,
    /// CDR rows; columns 9 and 10 must both parse
    Cdr,
}

/// Select the byte window of `path` described by the given bounds.
///
/// `tail_minutes` derives `from_when` from the latest timestamp in the final
/// 32 KB and clears `to_when`. The memory ceiling is checked before any data
/// is read; exceeding it is a hard failure.
pub fn read_log_window(
    file: &mut File,
    from_when: Option<&str>,
    to_when: Option<&str>,
    tail_minutes: Option<i64>,
    use_memory_pct: u32,
) -> AstflowResult<Vec<u8>> {
    let size = file.seek(SeekFrom::End(0))?;

    let mut from_ts = None;
    let mut to_ts = None;
    if let Some(minutes) = tail_minutes {
        file.seek(SeekFrom::Start(size.saturating_sub(TAIL_PROBE)))?;
        let mut buf = vec![0u8; TAIL_PROBE as usize];
        let n = read_full(file, &mut buf)?;
        if let Some(latest) = read_last_when(&buf[..n]) {
            let start = latest - Duration::minutes(minutes);
            info!(tail_minutes = minutes, from = %start, "window start derived from tail");
            from_ts = Some(start);
        }
    } else {
        if let Some(text) = from_when {
            from_ts = Some(
                parse_when(text.as_bytes())
                    .ok_or_else(|| AstflowError::empty_window("after", text))?,
            );
        }
        if let Some(text) = to_when {
            to_ts = Some(
                parse_when(text.as_bytes())
                    .ok_or_else(|| AstflowError::empty_window("before", text))?,
            );
        }
    }

    let mut start_pos = 0u64;
    if let Some(ts) = from_ts {
        start_pos = find_file_position(file, ts, SearchMode::After, ProbeKind::Log)?
            .ok_or_else(|| AstflowError::empty_window("after", ts.to_string()))?;
        info!(offset = start_pos, from = %ts, "located window start");
    }

    let mut span = None;
    if let Some(ts) = to_ts {
        let finish_pos = find_file_position(file, ts, SearchMode::Before, ProbeKind::Log)?
            .ok_or_else(|| AstflowError::empty_window("before", ts.to_string()))?;
        let bytes = finish_pos as i64 - start_pos as i64 + END_GRACE as i64;
        if bytes < 0 {
            return Err(AstflowError::NegativeSpan);
        }
        info!(bytes, to = %ts, "bounded window end");
        span = Some(bytes as u64);
    }

    // Data is stored twice, raw plus parsed, hence the factor of two.
    let selected = span.unwrap_or(size);
    if let Some(mem) = memory_size() {
        let limit = u64::from(use_memory_pct) * mem / 100;
        if selected.saturating_mul(2) > limit {
            return Err(AstflowError::MemoryRefusal {
                required: selected.saturating_mul(2),
                limit_pct: use_memory_pct,
            });
        }
    }

    file.seek(SeekFrom::Start(start_pos))?;
    let mut data = Vec::new();
    match span {
        Some(n) => {
            file.by_ref().take(n).read_to_end(&mut data)?;
        }
        None => {
            file.read_to_end(&mut data)?;
        }
    }
    Ok(data)
}

/// Binary-search the byte offset of the first (or last) timestamped line at
/// or after (or before) `target`. Returns `None` when no probe matches.
pub fn find_file_position(
    file: &mut File,
    target: NaiveDateTime,
    mode: SearchMode,
    probe: ProbeKind,
) -> AstflowResult<Option<u64>> {
    let size = file.seek(SeekFrom::End(0))?;

    let mut file_pos = 0u64;
    let (mut a, mut b) = (0u64, size);
    let mut good_pos = None;
    let mut buf = vec![0u8; PROBE_WINDOW];

    for _ in 0..MAX_PROBES {
        let next = a + (b - a) / 2;
        if next == file_pos {
            break;
        }
        file_pos = next;
        file.seek(SeekFrom::Start(file_pos))?;
        let n = read_full(file, &mut buf)?;
        let found = match probe {
            ProbeKind::Log => read_when(&buf[..n]),
            ProbeKind::Cdr => read_cdr_when(&buf[..n]),
        };
        let Some((ts, offset)) = found else { break };
        debug!(pos = file_pos, probed = %ts, "binary search probe");
        match mode {
            SearchMode::After => {
                if ts >= target {
                    good_pos = Some(file_pos + offset as u64);
                    b = file_pos;
                } else {
                    a = file_pos;
                }
            }
            SearchMode::Before => {
                if ts <= target {
                    good_pos = Some(file_pos + offset as u64);
                    a = file_pos;
                } else {
                    b = file_pos;
                }
            }
        }
        if a == b {
            break;
        }
    }

    Ok(good_pos)
}

/// Total system memory in bytes, from `/proc/meminfo`.
///
/// `None` when the probe is unavailable; the memory ceiling is then skipped.
pub fn memory_size() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let probe = Regex::new(r"(?m)^MemTotal:\s+(\d+)").ok()?;
    let kb: u64 = probe.captures(&meminfo)?.get(1)?.as_str().parse().ok()?;
    Some(kb * 1024)
}

/// First timestamped line in a probe window: parsed instant + line offset.
fn read_when(data: &[u8]) -> Option<(NaiveDateTime, usize)> {
    let mut pos = 0;
    while pos < data.len() {
        let line_start = pos;
        let (line, next) = next_line(data, pos);
        pos = next;
        let text = line.slice(data);
        if !text.is_empty() && text[0] == b'[' {
            if let Some(close) = memchr(b']', text) {
                if close > 0 {
                    return parse_when(&text[1..close]).map(|ts| (ts, line_start));
                }
            }
        }
    }
    None
}

/// First complete CDR row in a probe window, keyed by its start timestamp.
fn read_cdr_when(data: &[u8]) -> Option<(NaiveDateTime, usize)> {
    let mut pos = 0;
    while pos < data.len() {
        let line_start = pos;
        let (line, next) = next_line(data, pos);
        pos = next;
        let text = line.slice(data);
        if text.is_empty() {
            continue;
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(text);
        let mut record = csv::ByteRecord::new();
        if !reader.read_byte_record(&mut record).unwrap_or(false) {
            continue;
        }
        if record.len() < 16 {
            continue;
        }
        let (Some(start_when), Some(end_when)) = (record.get(9), record.get(10)) else {
            continue;
        };
        if let (Some(start_ts), Some(_)) = (parse_when(start_when), parse_when(end_when)) {
            return Some((start_ts, line_start));
        }
    }
    None
}

/// Latest parseable timestamp in a probe window (tail mode).
fn read_last_when(data: &[u8]) -> Option<NaiveDateTime> {
    let mut pos = 0;
    let mut latest = None;
    while pos < data.len() {
        let (line, next) = next_line(data, pos);
        pos = next;
        let text = line.slice(data);
        if !text.is_empty() && text[0] == b'[' {
            if let Some(close) = memchr(b']', text) {
                if let Some(ts) = parse_when(&text[1..close]) {
                    latest = Some(ts);
                }
            }
        }
    }
    latest
}

fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_when_skips_unbracketed() {
        let data = b"noise line\n[2024-01-01 10:00:00] VERBOSE[1] pbx.c: x\n";
        let (ts, offset) = read_when(data).unwrap();
        assert_eq!(offset, 11);
        assert_eq!(ts, parse_when(b"2024-01-01 10:00:00").unwrap());
    }

    #[test]
    fn test_read_when_none() {
        assert!(read_when(b"nothing bracketed here\n").is_none());
        assert!(read_when(b"").is_none());
    }

    #[test]
    fn test_read_last_when_takes_latest() {
        let data = b"[2024-01-01 10:00:00] a\n[2024-01-01 10:05:00] b\npartial";
        let latest = read_last_when(data).unwrap();
        assert_eq!(latest, parse_when(b"2024-01-01 10:05:00").unwrap());
    }

    #[test]
    fn test_read_cdr_when_requires_16_columns() {
        let short = b"a,b,c,d\n";
        assert!(read_cdr_when(short).is_none());

        let row = b"\"\",\"100\",\"200\",\"ctx\",\"\"\"A\"\" <100>\",\"SIP/a-1\",\"SIP/b-1\",\"Dial\",\"x\",\"2024-01-01 10:00:00\",\"2024-01-01 10:01:00\",\"2024-01-01 10:02:00\",\"60\",\"55\",\"ANSWERED\",\"DOCUMENTATION\"\n";
        let (ts, offset) = read_cdr_when(row).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(ts, parse_when(b"2024-01-01 10:00:00").unwrap());
    }
}
