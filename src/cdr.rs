//! CDR enrichment pass
//!
//! A second, optional pass over the call-detail-record CSV. Rows within the
//! log's time window attach caller-id names and extra phone/channel
//! associations to channels the log pass already discovered; rows for
//! unknown channels are dropped.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Seek, SeekFrom};

use tracing::debug;

use crate::error::{AstflowError, AstflowResult};
use crate::parser::LogParser;
use crate::text::{delimited, parse_when};
use crate::window::{find_file_position, ProbeKind, SearchMode};

/// Slack around the binary-searched CDR window, in bytes.
const CDR_MARGIN: u64 = 1_000_000;

impl LogParser {
    /// Attach CDR data to the parsed graph. A no-op without a CDR file or
    /// without a usable log time window.
    pub(crate) fn load_cdr<F>(&mut self, progress: &mut F) -> AstflowResult<()>
    where
        F: FnMut(&str, usize, u64, u64),
    {
        let Some(cdr_path) = self.config().cdr_file.clone() else {
            return Ok(());
        };
        let (Some(from_range), Some(to_range)) = (self.first_when_range(), self.last_when())
        else {
            return Ok(());
        };
        let (Some(from_ts), Some(to_ts)) = (
            parse_when(self.line_text(from_range)),
            parse_when(self.line_text(to_range)),
        ) else {
            return Ok(());
        };

        let mut file = File::open(&cdr_path)?;
        let start_pos = find_file_position(&mut file, from_ts, SearchMode::After, ProbeKind::Cdr)?;
        let finish_pos =
            find_file_position(&mut file, to_ts, SearchMode::Before, ProbeKind::Cdr)?;
        debug!(?start_pos, ?finish_pos, "CDR window");
        let (Some(start_pos), Some(finish_pos)) = (start_pos, finish_pos) else {
            return Ok(());
        };

        let total = finish_pos.saturating_sub(start_pos) + 2 * CDR_MARGIN;
        let seek_base = start_pos.saturating_sub(CDR_MARGIN);
        file.seek(SeekFrom::Start(seek_base))?;

        // chan -> phones seen with it, insertion-ordered
        let mut phone_chan_map: HashMap<Vec<u8>, Vec<Vec<u8>>> = HashMap::new();
        let mut caller_id_chan_map: HashMap<Vec<u8>, (Option<Vec<u8>>, Vec<u8>)> = HashMap::new();

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);
        let mut record = csv::ByteRecord::new();
        let mut row_no = 0usize;
        loop {
            let more = reader
                .read_byte_record(&mut record)
                .map_err(|err| AstflowError::Io {
                    message: err.to_string(),
                })?;
            if !more {
                break;
            }
            row_no += 1;
            let byte_pos = seek_base + reader.position().byte();
            progress("cdr", row_no, byte_pos, total);

            if record.len() >= 16 {
                let src = record.get(1).unwrap_or_default();
                let dst = record.get(2).unwrap_or_default();
                let (clid_name, clid_num) = parse_clid(record.get(4).unwrap_or_default());
                let chan = record.get(5).unwrap_or_default();
                let dst_chan = record.get(6).unwrap_or_default();

                for channel in [chan, dst_chan] {
                    let entry = phone_chan_map.entry(channel.to_vec()).or_default();
                    push_unique(entry, src);
                    push_unique(entry, dst);
                    push_unique(entry, &clid_num);
                    if let Some(name) = &clid_name {
                        push_unique(entry, name);
                    }
                }
                caller_id_chan_map.insert(chan.to_vec(), (clid_name, clid_num));
            }

            if byte_pos > finish_pos + CDR_MARGIN {
                break;
            }
        }

        for (chan, phones) in phone_chan_map {
            if let Some(channel_id) = self.channel_by_name(&chan) {
                for phone in phones {
                    self.add_phone_channel(&phone, channel_id);
                }
            }
        }
        for (chan, (clid_name, clid_num)) in caller_id_chan_map {
            if let Some(channel_id) = self.channel_by_name(&chan) {
                let channel = self.channel_mut(channel_id);
                channel.clid_name = clid_name;
                channel.clid_num = Some(clid_num);
            }
        }
        Ok(())
    }
}

/// Split a CDR clid column, `"Name" <num>` or `<num>` or a bare number.
fn parse_clid(clid: &[u8]) -> (Option<Vec<u8>>, Vec<u8>) {
    match clid.iter().position(|&b| b == b'<') {
        Some(idx) => {
            let mut name = trim(&clid[..idx]);
            if name.first() == Some(&b'"') && name.len() >= 2 {
                name = &name[1..name.len() - 1];
            }
            let num = delimited(clid, b"<", b">", idx)
                .map(|(n, _)| n.to_vec())
                .unwrap_or_default();
            let name = if name.is_empty() {
                None
            } else {
                Some(name.to_vec())
            };
            (name, num)
        }
        None => (None, clid.to_vec()),
    }
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}

fn push_unique(phones: &mut Vec<Vec<u8>>, phone: &[u8]) {
    if !phone.is_empty() && !phones.iter().any(|p| p == phone) {
        phones.push(phone.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clid_quoted() {
        let (name, num) = parse_clid(b"\"John Doe\" <301>");
        assert_eq!(name.as_deref(), Some(&b"John Doe"[..]));
        assert_eq!(num, b"301");
    }

    #[test]
    fn test_parse_clid_bracketed_only() {
        let (name, num) = parse_clid(b"<301>");
        assert_eq!(name, None);
        assert_eq!(num, b"301");
    }

    #[test]
    fn test_parse_clid_bare() {
        let (name, num) = parse_clid(b"301");
        assert_eq!(name, None);
        assert_eq!(num, b"301");
    }

    #[test]
    fn test_push_unique_skips_dupes_and_empties() {
        let mut phones = Vec::new();
        push_unique(&mut phones, b"100");
        push_unique(&mut phones, b"100");
        push_unique(&mut phones, b"");
        assert_eq!(phones, vec![b"100".to_vec()]);
    }
}
