//! Single-pass log driver and entity store
//!
//! The parser makes one pass over the selected byte window, dispatching each
//! line to the SIP assembler or to the per-module sub-parsers, and owns every
//! entity the pass produces. All queries against the finished graph are
//! read-only.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::path::PathBuf;

use memchr::{memmem, memrchr};
use strum_macros::{Display, EnumString};
use tracing::{debug, warn};

use crate::error::{AstflowError, AstflowResult};
use crate::model::{AcallId, App, AppId, AstCall, Channel, ChannelId, Dial, Queue};
use crate::sip::{Direction, DialogId, SipDialog, SipId, SipMessage};
use crate::text::{
    channel_phone, delimited, device_phone, find_at, find_bounded, next_line, parse_when, ByteRange,
};
use crate::window;

/// Lines between progress callbacks during the log pass.
const PROGRESS_INTERVAL: usize = 10_000;

/// Kind of an opaque entity reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum RefKind {
    #[strum(serialize = "call_id")]
    CallId,
    #[strum(serialize = "sip_ref")]
    SipRef,
    #[strum(serialize = "chan")]
    Chan,
    #[strum(serialize = "acall_id")]
    AcallId,
}

/// A dereferenced entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoundObj {
    Dialog(DialogId),
    Sip(SipId),
    Channel(ChannelId),
    AstCall(AcallId),
}

/// A recorded `pickup ... attempt by ...` waiting for its answer
#[derive(Debug, Clone)]
pub(crate) struct PickupAttempt {
    pub(crate) line_no: usize,
    pub(crate) line: ByteRange,
    pub(crate) when: Option<ByteRange>,
    pub(crate) target_chan: Vec<u8>,
}

/// Parser configuration surface
#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub log_file: PathBuf,
    pub cdr_file: Option<PathBuf>,
    pub from_when: Option<String>,
    pub to_when: Option<String>,
    /// Mutually exclusive with `from_when`/`to_when`
    pub tail_minutes: Option<i64>,
    /// Share of system memory the selected window may occupy, clamped to [5, 75]
    pub use_memory_pct: u32,
    /// Encoding name the viewer decodes lines with; the parser stays byte-oriented
    pub encoding: String,
}

impl ParserConfig {
    pub fn new(log_file: impl Into<PathBuf>) -> Self {
        Self {
            log_file: log_file.into(),
            cdr_file: None,
            from_when: None,
            to_when: None,
            tail_minutes: None,
            use_memory_pct: 5,
            encoding: "utf-8".to_string(),
        }
    }
}

/// The log parser: owns the raw window and every reconstructed entity.
#[derive(Debug)]
pub struct LogParser {
    config: ParserConfig,
    data: Vec<u8>,
    total_lines: usize,
    first_when: Option<ByteRange>,
    last_when: Option<ByteRange>,
    warning_lines: usize,
    error_lines: usize,

    // Entity arenas
    pub(crate) sip_messages: Vec<SipMessage>,
    pub(crate) dialogs: Vec<SipDialog>,
    pub(crate) channels: Vec<Channel>,
    pub(crate) acalls: Vec<AstCall>,
    pub(crate) apps: Vec<App>,

    // Identity indices
    pub(crate) dialog_index: HashMap<Vec<u8>, DialogId>,
    pub(crate) channel_index: HashMap<Vec<u8>, ChannelId>,
    pub(crate) acall_index: HashMap<Vec<u8>, AcallId>,
    pub(crate) queues: HashMap<Vec<u8>, Vec<AppId>>,
    pickup_chans: HashMap<Vec<u8>, PickupAttempt>,
    call_timeouts: HashMap<Vec<u8>, (usize, Option<ByteRange>)>,

    // Linking maps
    pub(crate) call_lines: HashMap<Vec<u8>, Vec<(usize, ByteRange)>>,
    pub(crate) call_acall_map: HashMap<Vec<u8>, Vec<AcallId>>,
    pub(crate) call_sip_map: HashMap<Vec<u8>, Vec<SipId>>,
    pub(crate) phone_sip_map: HashMap<Vec<u8>, Vec<SipId>>,
    pub(crate) phone_channel_map: HashMap<Vec<u8>, Vec<ChannelId>>,
}

impl LogParser {
    /// Create a parser for the configured files.
    ///
    /// Fails fast on missing inputs or contradictory window options; nothing
    /// is read until [`LogParser::load`].
    pub fn new(config: ParserConfig) -> AstflowResult<Self> {
        if config.tail_minutes.is_some() && (config.from_when.is_some() || config.to_when.is_some())
        {
            return Err(AstflowError::invalid_argument(
                "tail_minutes cannot be combined with from_when/to_when",
            ));
        }
        if !config.log_file.is_file() {
            return Err(AstflowError::input_not_found(&config.log_file));
        }
        if let Some(cdr_file) = &config.cdr_file {
            if !cdr_file.is_file() {
                return Err(AstflowError::input_not_found(cdr_file));
            }
        }
        Ok(Self::with_config(config))
    }

    /// Parse an in-memory buffer with default options. Used by tests and
    /// benchmarks; file-based callers go through [`LogParser::new`] + `load`.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        let mut parser = Self::with_config(ParserConfig::new("<memory>"));
        parser.parse_log_bytes(data.into());
        parser
    }

    fn with_config(mut config: ParserConfig) -> Self {
        config.use_memory_pct = config.use_memory_pct.clamp(5, 75);
        Self {
            config,
            data: Vec::new(),
            total_lines: 0,
            first_when: None,
            last_when: None,
            warning_lines: 0,
            error_lines: 0,
            sip_messages: Vec::new(),
            dialogs: Vec::new(),
            channels: Vec::new(),
            acalls: Vec::new(),
            apps: Vec::new(),
            dialog_index: HashMap::new(),
            channel_index: HashMap::new(),
            acall_index: HashMap::new(),
            queues: HashMap::new(),
            pickup_chans: HashMap::new(),
            call_timeouts: HashMap::new(),
            call_lines: HashMap::new(),
            call_acall_map: HashMap::new(),
            call_sip_map: HashMap::new(),
            phone_sip_map: HashMap::new(),
            phone_channel_map: HashMap::new(),
        }
    }

    /// Read the configured window and build the call graph.
    pub fn load(&mut self) -> AstflowResult<()> {
        self.load_with_progress(|_, _, _, _| {})
    }

    /// Like [`LogParser::load`], with a synchronous progress callback
    /// `(module, line_no, byte_pos, total_bytes)`. The callback must be cheap
    /// and must not call back into the parser.
    pub fn load_with_progress<F>(&mut self, mut progress: F) -> AstflowResult<()>
    where
        F: FnMut(&str, usize, u64, u64),
    {
        let mut file = File::open(&self.config.log_file)?;
        let data = window::read_log_window(
            &mut file,
            self.config.from_when.as_deref(),
            self.config.to_when.as_deref(),
            self.config.tail_minutes,
            self.config.use_memory_pct,
        )?;
        let total = data.len() as u64;
        self.parse_log(data, &mut progress);
        self.load_cdr(&mut progress)?;
        progress("log", self.total_lines, total, total);
        Ok(())
    }

    /// Parse an in-memory log buffer.
    pub fn parse_log_bytes(&mut self, data: Vec<u8>) {
        self.parse_log(data, &mut |_, _, _, _| {});
    }

    fn parse_log<F>(&mut self, data: Vec<u8>, progress: &mut F)
    where
        F: FnMut(&str, usize, u64, u64),
    {
        let data_len = data.len();
        let mut pos = 0usize;
        let mut line_no = 0usize;
        let mut when: Option<ByteRange> = None;
        let mut acall: Option<AcallId> = None;
        let mut active_sip: Option<SipId> = None;

        while pos < data_len {
            let (line, next_pos) = next_line(&data, pos);
            pos = next_pos;
            let current = line_no;
            line_no += 1;

            if current % PROGRESS_INTERVAL == 0 {
                progress("log", current, pos as u64, data_len as u64);
            }

            if let Some(sip_id) = active_sip {
                if self.sip_messages[sip_id.0].add_line(&data, line) {
                    continue;
                }
                self.finish_sip(sip_id);
                active_sip = None;
                // The terminating line may itself start something new.
            }

            let text = line.slice(&data);
            if text.first() == Some(&b'[') {
                let Some(close) = find_at(text, b"]", 5) else {
                    continue;
                };
                let when_range = ByteRange::new(line.start + 1, line.start + close);
                when = Some(when_range);
                if self.first_when.is_none() {
                    self.first_when = Some(when_range);
                }
                self.last_when = Some(when_range);

                let (found, after) = self.link_acall(current, &data, line, close, when);
                acall = found;

                if let Some(idx) = find_at(text, b"chan_sip.c:", after) {
                    active_sip =
                        self.parse_chan_sip_c(current, &data, line, idx + 11, when, acall);
                } else if let Some(idx) = find_at(text, b"pbx.c:", after) {
                    self.parse_pbx_c(current, &data, line, idx + 6, when, acall);
                } else if let Some(idx) = find_at(text, b"app_dial.c:", after) {
                    self.parse_app_dial_c(current, &data, line, idx + 11, when, acall);
                } else if let Some(idx) = find_at(text, b"features.c:", after) {
                    self.parse_features_c(current, &data, line, idx + 11, when);
                } else if let Some(idx) = find_at(text, b"app_queue.c:", after) {
                    self.parse_app_queue_c(current, &data, line, idx + 12, when, acall);
                } else if let Some(idx) = find_at(text, b"manager.c:", after) {
                    self.parse_manager_c(current, &data, line, idx + 10, when);
                }
            } else if text.starts_with(b"<--- SIP read from") {
                let peer = delimited(text, b":", b" ", 18).map(|(addr, _)| addr.to_vec());
                active_sip = Some(self.new_sip(
                    current + 1,
                    Direction::In,
                    peer,
                    false,
                    when,
                    acall,
                    None,
                    &data,
                ));
            } else if text.starts_with(b"<--- Reliably Transmitting") {
                let peer = delimited(text, b" to ", b" ", 26).map(|(addr, _)| addr.to_vec());
                active_sip = Some(self.new_sip(
                    current + 1,
                    Direction::Out,
                    peer,
                    contains_nat(text),
                    when,
                    acall,
                    None,
                    &data,
                ));
            } else if text.starts_with(b"<--- Transmitting") {
                let peer = delimited(text, b" to ", b" ", 17).map(|(addr, _)| addr.to_vec());
                active_sip = Some(self.new_sip(
                    current + 1,
                    Direction::Out,
                    peer,
                    contains_nat(text),
                    when,
                    acall,
                    None,
                    &data,
                ));
            }
        }

        if let Some(sip_id) = active_sip {
            self.finish_sip(sip_id);
        }
        self.total_lines = line_no;
        self.data = data;
    }

    // ---- SIP message lifecycle -------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn new_sip(
        &mut self,
        line_no: usize,
        direction: Direction,
        peer_addr: Option<Vec<u8>>,
        is_nat: bool,
        when: Option<ByteRange>,
        acall: Option<AcallId>,
        intro_line: Option<ByteRange>,
        data: &[u8],
    ) -> SipId {
        let when_ts = when.and_then(|range| parse_when(range.slice(data)));
        let id = SipId(self.sip_messages.len());
        self.sip_messages.push(SipMessage::new(
            line_no, direction, peer_addr, is_nat, when, when_ts, acall, intro_line,
        ));
        id
    }

    /// Place a completed message into its dialog and the global indices.
    fn finish_sip(&mut self, sip_id: SipId) {
        if let Some(call_id) = self.sip_messages[sip_id.0].call_id.clone() {
            self.call_sip_map
                .entry(call_id.clone())
                .or_default()
                .push(sip_id);

            let dialog_id = match self.dialog_index.get(&call_id) {
                Some(&id) => id,
                None => {
                    let id = DialogId(self.dialogs.len());
                    let dialog = SipDialog::new(call_id.clone(), &self.sip_messages[sip_id.0]);
                    self.dialogs.push(dialog);
                    self.dialog_index.insert(call_id.clone(), id);
                    id
                }
            };
            self.sip_messages[sip_id.0].dialog = Some(dialog_id);

            // A response is matched to the latest request with the same CSeq
            // before its endpoints can be resolved.
            let matched = if self.sip_messages[sip_id.0].request.is_none() {
                let cseq = self.sip_messages[sip_id.0].cseq.clone();
                self.dialogs[dialog_id.0]
                    .sip_list
                    .iter()
                    .rev()
                    .copied()
                    .find(|&prev| {
                        let prev_msg = &self.sip_messages[prev.0];
                        prev_msg.request.is_some() && prev_msg.cseq == cseq
                    })
            } else {
                None
            };
            self.sip_messages[sip_id.0].request_sip = matched;
            let matched_recipient =
                matched.and_then(|id| self.sip_messages[id.0].recipient_addr.clone());
            self.sip_messages[sip_id.0].resolve_endpoints(matched_recipient);

            self.dialogs[dialog_id.0].add_sip(sip_id, &self.sip_messages[sip_id.0]);

            if let Some(intro) = self.sip_messages[sip_id.0].intro_line {
                // The call-id was unknown when the intro line went by.
                let intro_line_no = self.sip_messages[sip_id.0].line_no.saturating_sub(1);
                let intro_acall = self.sip_messages[sip_id.0].acall;
                self.link_call(intro_line_no, intro, &call_id, intro_acall);
            }
            self.dialogs[dialog_id.0].timeout = self.call_timeouts.get(&call_id).cloned();
        }

        if let Some(acall_id) = self.sip_messages[sip_id.0].acall {
            self.acalls[acall_id.0].add_sip(sip_id);
        }
        let msg = &self.sip_messages[sip_id.0];
        let phones: Vec<Vec<u8>> = [
            msg.from_name.clone(),
            msg.from_num.clone(),
            msg.to_name.clone(),
            msg.to_num.clone(),
        ]
        .into_iter()
        .flatten()
        .collect();
        for phone in phones {
            self.phone_sip_map.entry(phone).or_default().push(sip_id);
        }
    }

    // ---- Entity linking ---------------------------------------------------

    /// Pick up the `VERBOSE[nnn][C-...]` thread-context id on a timestamped
    /// line and collect the line under it.
    fn link_acall(
        &mut self,
        line_no: usize,
        data: &[u8],
        line: ByteRange,
        pos: usize,
        when: Option<ByteRange>,
    ) -> (Option<AcallId>, usize) {
        let text = line.slice(data);
        let (idx, tag_len) = if let Some(idx) = find_at(text, b"VERBOSE[", pos) {
            (idx, 8)
        } else if let Some(idx) = find_at(text, b"WARNING[", pos) {
            self.warning_lines += 1;
            (idx, 8)
        } else if let Some(idx) = find_at(text, b"ERROR[", pos) {
            self.error_lines += 1;
            (idx, 6)
        } else {
            return (None, pos);
        };

        let after_tag = idx + tag_len;
        let Some(open) = find_bounded(text, b"][", after_tag, after_tag + 10) else {
            return (None, pos);
        };
        let id_start = open + 2;
        let Some(close) = find_bounded(text, b"]", id_start, id_start + 15) else {
            return (None, pos);
        };
        let acall_key = &text[id_start..close];

        let id = match self.acall_index.get(acall_key) {
            Some(&id) => id,
            None => {
                let id = AcallId(self.acalls.len());
                self.acalls
                    .push(AstCall::new(acall_key.to_vec(), line_no, when));
                self.acall_index.insert(acall_key.to_vec(), id);
                id
            }
        };
        self.acalls[id.0].lines.push((line_no, line));
        (Some(id), close + 1)
    }

    fn link_chan(
        &mut self,
        line_no: usize,
        line: ByteRange,
        chan: &[u8],
        acall: Option<AcallId>,
        when: Option<ByteRange>,
    ) -> ChannelId {
        let id = match self.channel_index.get(chan) {
            Some(&id) => id,
            None => {
                let id = ChannelId(self.channels.len());
                self.channels.push(Channel::new(chan.to_vec(), line_no, when));
                self.channel_index.insert(chan.to_vec(), id);
                id
            }
        };
        self.channels[id.0].lines.push((line_no, line));
        if let Some(acall_id) = acall {
            self.acalls[acall_id.0].add_channel(id);
            self.channels[id.0].add_acall(acall_id);
        }
        id
    }

    fn link_call(
        &mut self,
        line_no: usize,
        line: ByteRange,
        call_id: &[u8],
        acall: Option<AcallId>,
    ) {
        if call_id.is_empty() {
            return;
        }
        self.call_lines
            .entry(call_id.to_vec())
            .or_default()
            .push((line_no, line));
        if let Some(acall_id) = acall {
            self.acalls[acall_id.0].add_call_id(call_id);
            let entry = self.call_acall_map.entry(call_id.to_vec()).or_default();
            if !entry.contains(&acall_id) {
                entry.push(acall_id);
            }
        }
    }

    pub(crate) fn add_phone_channel(&mut self, phone: &[u8], channel: ChannelId) {
        let entry = self.phone_channel_map.entry(phone.to_vec()).or_default();
        if !entry.contains(&channel) {
            entry.push(channel);
        }
    }

    // ---- Sub-parsers ------------------------------------------------------

    fn parse_chan_sip_c(
        &mut self,
        line_no: usize,
        data: &[u8],
        line: ByteRange,
        pos: usize,
        when: Option<ByteRange>,
        acall: Option<AcallId>,
    ) -> Option<SipId> {
        let text = line.slice(data);

        // Reliably Transmitting (no NAT) to 10.10.10.114:5062:
        if let Some(idx) = find_at(text, b"Reliably Transmitting", pos) {
            let peer = intro_peer(text, idx + 21)?;
            return Some(self.new_sip(
                line_no + 1,
                Direction::Out,
                Some(peer),
                contains_nat(text),
                when,
                acall,
                Some(line),
                data,
            ));
        }

        // Transmitting (no NAT) to 10.10.10.191:5062:
        if let Some(idx) = find_at(text, b"Transmitting", pos) {
            let peer = intro_peer(text, idx + 12)?;
            return Some(self.new_sip(
                line_no + 1,
                Direction::Out,
                Some(peer),
                contains_nat(text),
                when,
                acall,
                Some(line),
                data,
            ));
        }

        // Retransmitting #1 (no NAT) to 10.10.10.162:5062:
        if let Some(idx) = find_at(text, b"Retransmitting", pos) {
            let (attempt, after) = delimited(text, b"#", b" ", idx + 14)?;
            let attempt = std::str::from_utf8(attempt)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let peer = intro_peer(text, after)?;
            let id = self.new_sip(
                line_no + 1,
                Direction::Out,
                Some(peer),
                contains_nat(text),
                when,
                acall,
                Some(line),
                data,
            );
            self.sip_messages[id.0].attempt_no = attempt;
            return Some(id);
        }

        // Really destroying SIP dialog '...' Method: OPTIONS
        if let Some(idx) = find_at(text, b"Really destroying SIP dialog", pos) {
            if let Some((call_id, _)) = delimited(text, b"'", b"'", idx + 28) {
                let call_id = call_id.to_vec();
                self.link_call(line_no, line, &call_id, acall);
            }
            return None;
        }

        // Scheduling destruction of SIP dialog '...' in 6400 ms (Method: BYE)
        if let Some(idx) = find_at(text, b"Scheduling destruction of SIP dialog", pos) {
            if let Some((call_id, _)) = delimited(text, b"'", b"'", idx + 36) {
                let call_id = call_id.to_vec();
                self.link_call(line_no, line, &call_id, acall);
            }
            return None;
        }

        // Hanging up call X - no reply to our critical packet
        if let Some(idx) = find_at(text, b"Hanging up call", pos) {
            if let Some((call_id, _)) = delimited(text, b" ", b" ", idx + 15) {
                let call_id = call_id.to_vec();
                self.link_call(line_no, line, &call_id, acall);
            }
            return None;
        }

        // Retransmission timeout reached on transmission X for seqno 103
        if let Some(idx) = find_at(text, b"Retransmission timeout reached on transmission", pos) {
            if let Some((call_id, _)) = delimited(text, b" ", b" ", idx + 46) {
                let call_id = call_id.to_vec();
                self.link_call(line_no, line, &call_id, acall);
                if let Some(&dialog_id) = self.dialog_index.get(&call_id) {
                    self.dialogs[dialog_id.0].timeout = Some((line_no, when));
                }
                self.call_timeouts.insert(call_id, (line_no, when));
            }
            return None;
        }

        None
    }

    fn parse_pbx_c(
        &mut self,
        line_no: usize,
        data: &[u8],
        line: ByteRange,
        pos: usize,
        when: Option<ByteRange>,
        acall: Option<AcallId>,
    ) {
        let text = line.slice(data);

        // -- Auto fallthrough, chan 'SIP/322-0015bc14' status is 'CHANUNAVAIL'
        if let Some(idx) = find_at(text, b"-- Auto fallthrough, chan", pos) {
            if let Some((chan, _)) = delimited(text, b"'", b"'", idx + 25) {
                let chan = chan.to_vec();
                self.link_chan(line_no, line, &chan, acall, when);
            }
            return;
        }

        // -- Executing [016445520@ctx1:2] Dial("SIP/tk-0015b", "SIP/441&SIP/tk/123,14")
        if let Some(idx) = find_at(text, b"-- Executing", pos) {
            let Some((extension, after_ext)) = delimited(text, b"[", b"@", idx + 12) else {
                return;
            };
            let Some((app, after_app)) = delimited(text, b"] ", b"(", after_ext) else {
                return;
            };
            let Some((chan, after_chan)) = delimited(text, b"(\"", b"\"", after_app) else {
                return;
            };
            let extension = extension.to_vec();
            let app = app.to_vec();
            let chan = chan.to_vec();

            let channel_id = self.link_chan(line_no, line, &chan, acall, when);
            self.add_phone_channel(&extension, channel_id);
            self.channels[channel_id.0].add_extension(&extension, line_no, when);

            if app == b"Dial" {
                let Some((app_data, _)) = delimited(text, b"\"", b"\"", after_chan + 2) else {
                    return;
                };
                let phones = split_dial_phones(app_data);
                let app_id = AppId(self.apps.len());
                self.apps.push(App::Dial(Dial::new(
                    channel_id,
                    line_no,
                    when,
                    extension,
                    phones.clone(),
                )));
                self.channels[channel_id.0].apps.push(app_id);
                self.channels[channel_id.0].current_dial = Some(app_id);
                for phone in &phones {
                    self.add_phone_channel(phone, channel_id);
                }
                if let Some(acall_id) = acall {
                    self.acalls[acall_id.0].current_dial = Some(app_id);
                }
            } else if app == b"Queue" {
                let Some((app_data, _)) = delimited(text, b"\"", b"\"", after_chan + 2) else {
                    return;
                };
                let name = app_data.to_vec();
                let app_id = AppId(self.apps.len());
                self.apps.push(App::Queue(Queue::new(
                    channel_id,
                    line_no,
                    when,
                    extension,
                    name.clone(),
                )));
                self.channels[channel_id.0].apps.push(app_id);
                self.channels[channel_id.0].current_queue = Some(app_id);
                if let Some(acall_id) = acall {
                    self.acalls[acall_id.0].current_queue = Some(app_id);
                }
                self.queues.entry(name).or_default().push(app_id);
            }
            return;
        }

        // == Spawn extension (sub-gsm, tk1, 7) exited non-zero on 'SIP/208-0015bcb7'
        if let Some(idx) = find_at(text, b"== Spawn extension", pos) {
            let Some(acall_id) = acall else { return };
            let Some(app_id) = self.acalls[acall_id.0].current_dial else {
                return;
            };
            if let Some(exit_idx) = find_at(text, b"exited", idx) {
                if delimited(text, b"'", b"'", exit_idx).is_some() {
                    if let Some(dial) = self.apps[app_id.0].as_dial_mut() {
                        dial.extension_exited(line_no, when);
                        let owner = dial.channel;
                        self.channels[owner.0].current_dial = None;
                    }
                }
                self.acalls[acall_id.0].current_dial = None;
            }
        }
    }

    fn parse_app_dial_c(
        &mut self,
        line_no: usize,
        data: &[u8],
        line: ByteRange,
        pos: usize,
        when: Option<ByteRange>,
        acall: Option<AcallId>,
    ) {
        let Some(acall_id) = acall else { return };
        let Some(app_id) = self.acalls[acall_id.0].current_dial else {
            return;
        };
        let text = line.slice(data);

        // -- Called SIP/440
        if let Some(idx) = find_at(text, b"-- Called", pos) {
            if let Some(device) = text.get(idx + 10..) {
                let device = device.to_vec();
                if let Some(dial) = self.apps[app_id.0].as_dial_mut() {
                    dial.called(line_no, when, &device);
                }
            }
            return;
        }

        // -- SIP/441-0015bc3d is ringing
        if text.ends_with(b"is ringing") {
            if let Some((chan, _)) = delimited(text, b"-- ", b" ", pos) {
                let chan = chan.to_vec();
                if let Some(dial) = self.apps[app_id.0].as_dial_mut() {
                    dial.ringing(line_no, when, &chan);
                }
            }
            return;
        }

        // -- SIP/440-0015bc43 is busy
        if text.ends_with(b"is busy") {
            if let Some((chan, _)) = delimited(text, b"-- ", b" ", pos) {
                let chan = chan.to_vec();
                if let Some(dial) = self.apps[app_id.0].as_dial_mut() {
                    dial.busy(line_no, when, &chan);
                }
            }
            return;
        }

        // -- SIP/gsm3-001501b is making progress passing it to SIP/202-001501a
        if let Some(idx) = find_at(text, b"is making progress passing it to", pos) {
            let Some((chan2, _)) = delimited(text, b"-- ", b" ", pos) else {
                return;
            };
            let Some(it_to) = find_at(text, b"it to ", idx) else {
                return;
            };
            let chan1 = text[it_to + 6..].to_vec();
            let chan2 = chan2.to_vec();
            let owner = self.apps[app_id.0].channel();
            if chan1 == self.channels[owner.0].name {
                if let Some(dial) = self.apps[app_id.0].as_dial_mut() {
                    dial.progress(line_no, when, &chan2);
                }
            } else {
                debug!(line = line_no + 1, "dial progress on a different channel");
            }
            return;
        }

        // -- SIP/gsm2-0015bcb8 answered SIP/208-0015bcb7
        if let Some(idx) = find_at(text, b"answered", pos) {
            let chan1 = text.get(idx + 9..).unwrap_or_default().to_vec();
            let Some((ans_by, _)) = delimited(text, b"-- ", b" ", pos) else {
                return;
            };
            let ans_by = ans_by.to_vec();
            self.handle_answered(app_id, line_no, when, &chan1, &ans_by);
            return;
        }

        // -- Nobody picked up in 14000 ms
        if find_at(text, b"-- Nobody picked up", pos).is_some() {
            if let Some(dial) = self.apps[app_id.0].as_dial_mut() {
                dial.nobody_picked_up(line_no, when);
                let owner = dial.channel;
                self.channels[owner.0].current_dial = None;
            }
            self.acalls[acall_id.0].current_dial = None;
            return;
        }

        // == Everyone is busy/congested at this time
        if find_at(text, b"== Everyone is busy", pos).is_some() {
            if let Some(dial) = self.apps[app_id.0].as_dial_mut() {
                dial.finish();
                let owner = dial.channel;
                self.channels[owner.0].current_dial = None;
            }
        }
    }

    fn parse_features_c(
        &mut self,
        line_no: usize,
        data: &[u8],
        line: ByteRange,
        pos: usize,
        when: Option<ByteRange>,
    ) {
        let text = line.slice(data);

        // pickup SIP/440-0015bd5a attempt by SIP/320-0015bd5f
        if let Some(idx) = find_at(text, b"pickup", pos) {
            if let Some((target, after)) = delimited(text, b" ", b" ", idx + 6) {
                if let Some(by_idx) = find_at(text, b"attempt by ", after) {
                    let chan = text[by_idx + 11..].to_vec();
                    self.pickup_chans.insert(
                        chan,
                        PickupAttempt {
                            line_no,
                            line,
                            when,
                            target_chan: target.to_vec(),
                        },
                    );
                }
            }
        }
    }

    fn parse_app_queue_c(
        &mut self,
        line_no: usize,
        data: &[u8],
        line: ByteRange,
        pos: usize,
        when: Option<ByteRange>,
        acall: Option<AcallId>,
    ) {
        let Some(acall_id) = acall else { return };
        let Some(app_id) = self.acalls[acall_id.0].current_queue else {
            return;
        };
        let text = line.slice(data);

        // "Nobody picked up" is ignored here: the queue fires it once per
        // ringing round.

        // -- SIP/440-0015bbf6 is ringing
        if text.ends_with(b"is ringing") {
            if let Some((chan, _)) = delimited(text, b"-- ", b" ", pos) {
                let chan = chan.to_vec();
                if let Some(queue) = self.apps[app_id.0].as_queue_mut() {
                    queue.ringing(line_no, when, &chan);
                }
            }
            return;
        }

        // -- Told SIP/tk-0015b in group1 their queue position (which was 1)
        if let Some(idx) = find_at(text, b"Told", pos) {
            let Some((chan, after)) = delimited(text, b" ", b" ", idx + 4) else {
                return;
            };
            let Some((position, _)) = delimited(text, b"which was ", b")", after) else {
                return;
            };
            let chan = chan.to_vec();
            let position = position.to_vec();
            let owner = self.apps[app_id.0].channel();
            if chan == self.channels[owner.0].name {
                if let Some(queue) = self.apps[app_id.0].as_queue_mut() {
                    queue.position(line_no, when, &chan, &position);
                }
            } else {
                warn!(line = line_no + 1, "queue position for a different channel");
            }
            return;
        }

        // -- SIP/320-0015a answered SIP/tk-0015b
        if let Some(idx) = find_at(text, b"answered", pos) {
            let chan1 = text.get(idx + 9..).unwrap_or_default().to_vec();
            let Some((ans_by, _)) = delimited(text, b"-- ", b" ", pos) else {
                return;
            };
            let ans_by = ans_by.to_vec();
            self.handle_answered(app_id, line_no, when, &chan1, &ans_by);
        }
    }

    fn parse_manager_c(
        &mut self,
        line_no: usize,
        data: &[u8],
        line: ByteRange,
        pos: usize,
        when: Option<ByteRange>,
    ) {
        let text = line.slice(data);

        // -- Manager 'account' from 127.0.0.1, hanging up channel: SIP/301-0015a
        if let Some(idx) = find_at(text, b"hanging up channel: ", pos) {
            let chan = text.get(idx + 20..).unwrap_or_default().to_vec();
            if let Some(&chan_id) = self.channel_index.get(&chan) {
                self.channels[chan_id.0].lines.push((line_no, line));
                if let Some(app_id) = self.channels[chan_id.0].current_dial {
                    if let Some(dial) = self.apps[app_id.0].as_dial_mut() {
                        dial.manager_hangup(line_no, when, &chan);
                        let owner = dial.channel;
                        self.channels[owner.0].current_dial = None;
                    }
                }
            }
        }
    }

    /// Answer handling shared by Dial and Queue, including the pickup
    /// synthesis: a recorded pickup attempt by the answering channel is
    /// consumed, its line attached to the owning channel, and the bridging
    /// "200 OK" searched within the pickup..answer window.
    fn handle_answered(
        &mut self,
        app_id: AppId,
        line_no: usize,
        when: Option<ByteRange>,
        chan1: &[u8],
        ans_by: &[u8],
    ) {
        if let Some(attempt) = self.pickup_chans.remove(ans_by) {
            match &mut self.apps[app_id.0] {
                App::Dial(dial) => dial.pickup(attempt.line_no, attempt.when, &attempt.target_chan),
                App::Queue(queue) => {
                    queue.pickup(attempt.line_no, attempt.when, &attempt.target_chan)
                }
            }
            let owner = self.apps[app_id.0].channel();
            self.channels[owner.0].lines.push((attempt.line_no, attempt.line));
            // No hard link exists between the pickup and its SIP leg; try
            // the heuristic window search. Finding nothing is fine.
            let phone = channel_phone(ans_by).to_vec();
            if let Some(sip_id) = self.find_ok_sip_from(&phone, attempt.line_no, line_no) {
                self.channels[owner.0].add_sip(sip_id);
            }
        }

        let owner = self.apps[app_id.0].channel();
        if chan1 == self.channels[owner.0].name {
            match &mut self.apps[app_id.0] {
                App::Dial(dial) => dial.answered(line_no, when, ans_by),
                App::Queue(queue) => queue.answered(line_no, when, ans_by),
            }
        } else {
            debug!(line = line_no + 1, "answer reported for a different channel");
        }
    }

    /// Latest "200 OK" whose From number matches, within a line window.
    fn find_ok_sip_from(
        &self,
        from_num: &[u8],
        start_line: usize,
        end_line: usize,
    ) -> Option<SipId> {
        for (idx, sip) in self.sip_messages.iter().enumerate().rev() {
            if sip.line_no < start_line {
                return None;
            }
            if sip.line_no > end_line {
                continue;
            }
            if sip.from_num.as_deref() == Some(from_num)
                && sip.status.as_deref() == Some(&b"200 OK"[..])
            {
                return Some(SipId(idx));
            }
        }
        None
    }

    // ---- Query API --------------------------------------------------------

    /// Every phone known to the run: dialed or extension phones, SIP
    /// from/to names and numbers, and queue names.
    pub fn phone_set(&self) -> BTreeSet<Vec<u8>> {
        self.phone_channel_map
            .keys()
            .chain(self.phone_sip_map.keys())
            .chain(self.queues.keys())
            .cloned()
            .collect()
    }

    /// Resolve free-form search input: an exact channel, an exact call-id
    /// with messages, and all phones containing `number` as a substring.
    pub fn search(&self, number: &[u8], chan: &[u8], call_id: &[u8]) -> Vec<Vec<u8>> {
        let mut results = Vec::new();
        if self.channel_index.contains_key(chan) {
            results.push(chan.to_vec());
        }
        if self.call_sip_map.get(call_id).is_some_and(|sips| !sips.is_empty()) {
            results.push(call_id.to_vec());
        }
        results.extend(
            self.phone_set()
                .into_iter()
                .filter(|phone| memmem::find(phone, number).is_some()),
        );
        results
    }

    /// Dereference an opaque reference back to its entity.
    pub fn find(&self, kind: RefKind, id: &[u8]) -> Option<FoundObj> {
        match kind {
            RefKind::CallId => self.dialog_index.get(id).map(|&d| FoundObj::Dialog(d)),
            RefKind::SipRef => self.find_sip_by_ref(id).map(FoundObj::Sip),
            RefKind::Chan => self.channel_index.get(id).map(|&c| FoundObj::Channel(c)),
            RefKind::AcallId => self.acall_index.get(id).map(|&a| FoundObj::AstCall(a)),
        }
    }

    /// Resolve a `call_id/line_no` token produced by
    /// [`SipMessage::ref_token`].
    pub fn find_sip_by_ref(&self, sip_ref: &[u8]) -> Option<SipId> {
        let slash = memrchr(b'/', sip_ref)?;
        let (call_id, line_no_txt) = (&sip_ref[..slash], &sip_ref[slash + 1..]);
        self.call_sip_map.get(call_id)?.iter().copied().find(|&id| {
            (self.sip_messages[id.0].line_no + 1)
                .to_string()
                .as_bytes()
                == line_no_txt
        })
    }

    // ---- Accessors --------------------------------------------------------

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// The raw selected window; all [`ByteRange`] values resolve against it.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn line_text(&self, range: ByteRange) -> &[u8] {
        range.slice(&self.data)
    }

    /// Decode bytes for display with replacement semantics.
    pub fn decode<'a>(&self, bytes: &'a [u8]) -> std::borrow::Cow<'a, str> {
        String::from_utf8_lossy(bytes)
    }

    pub fn total_lines(&self) -> usize {
        self.total_lines
    }

    pub fn first_when(&self) -> Option<&[u8]> {
        self.first_when.map(|range| range.slice(&self.data))
    }

    pub fn warning_lines(&self) -> usize {
        self.warning_lines
    }

    pub fn error_lines(&self) -> usize {
        self.error_lines
    }

    pub(crate) fn last_when(&self) -> Option<ByteRange> {
        self.last_when
    }

    pub(crate) fn first_when_range(&self) -> Option<ByteRange> {
        self.first_when
    }

    pub fn sip(&self, id: SipId) -> &SipMessage {
        &self.sip_messages[id.0]
    }

    pub fn dialog(&self, id: DialogId) -> &SipDialog {
        &self.dialogs[id.0]
    }

    pub fn channel(&self, id: ChannelId) -> &Channel {
        &self.channels[id.0]
    }

    pub(crate) fn channel_mut(&mut self, id: ChannelId) -> &mut Channel {
        &mut self.channels[id.0]
    }

    pub fn acall(&self, id: AcallId) -> &AstCall {
        &self.acalls[id.0]
    }

    pub fn app(&self, id: AppId) -> &App {
        &self.apps[id.0]
    }

    pub fn apps(&self) -> &[App] {
        &self.apps
    }

    pub fn sip_count(&self) -> usize {
        self.sip_messages.len()
    }

    /// Ids of every message, in arrival order.
    pub fn sip_ids(&self) -> impl Iterator<Item = SipId> + '_ {
        (0..self.sip_messages.len()).map(SipId)
    }

    pub fn channel_by_name(&self, name: &[u8]) -> Option<ChannelId> {
        self.channel_index.get(name).copied()
    }

    pub fn dialog_by_call_id(&self, call_id: &[u8]) -> Option<DialogId> {
        self.dialog_index.get(call_id).copied()
    }

    pub fn acall_by_id(&self, acall_id: &[u8]) -> Option<AcallId> {
        self.acall_index.get(acall_id).copied()
    }

    pub fn call_sips(&self, call_id: &[u8]) -> &[SipId] {
        self.call_sip_map
            .get(call_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Seconds from the dialog's first message to this one.
    pub fn sip_elapsed_secs(&self, id: SipId) -> f64 {
        let msg = &self.sip_messages[id.0];
        let start = msg
            .dialog
            .and_then(|d| self.dialogs[d.0].start_sip())
            .and_then(|first| self.sip_messages[first.0].when_ts);
        msg.elapsed_secs_since(start)
    }
}

fn contains_nat(text: &[u8]) -> bool {
    memmem::find(text, b"(NAT)").is_some()
}

/// Peer address of a `... to HOST:PORT:` intro line, trailing colon dropped.
fn intro_peer(text: &[u8], from: usize) -> Option<Vec<u8>> {
    let to = find_at(text, b" to ", from)?;
    let end = text.len().checked_sub(1)?;
    if to + 4 > end {
        return None;
    }
    Some(text[to + 4..end].to_vec())
}

/// First `,`-argument of Dial app data, split on `&`, device part reduced
/// to its phone.
fn split_dial_phones(app_data: &[u8]) -> Vec<Vec<u8>> {
    let mut data = app_data;
    if let Some(idx) = find_at(data, b",", 0).filter(|&i| i > 0) {
        data = &data[..idx];
    }
    data.split(|&b| b == b'&')
        .map(|device| device_phone(device).to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_dial_phones() {
        assert_eq!(
            split_dial_phones(b"SIP/441&SIP/tk/123,14"),
            vec![b"441".to_vec(), b"123".to_vec()]
        );
        assert_eq!(split_dial_phones(b"SIP/440"), vec![b"440".to_vec()]);
    }

    #[test]
    fn test_intro_peer() {
        assert_eq!(
            intro_peer(b"Transmitting (no NAT) to 10.10.10.191:5062:", 12),
            Some(b"10.10.10.191:5062".to_vec())
        );
        assert_eq!(intro_peer(b"Transmitting (no NAT)", 12), None);
    }

    #[test]
    fn test_config_clamps_memory_pct() {
        let mut config = ParserConfig::new("/dev/null");
        config.use_memory_pct = 0;
        let parser = LogParser::with_config(config);
        assert_eq!(parser.config().use_memory_pct, 5);

        let mut config = ParserConfig::new("/dev/null");
        config.use_memory_pct = 90;
        let parser = LogParser::with_config(config);
        assert_eq!(parser.config().use_memory_pct, 75);
    }

    #[test]
    fn test_new_rejects_tail_with_window() {
        let mut config = ParserConfig::new("/proc/self/status");
        config.tail_minutes = Some(5);
        config.from_when = Some("2024-01-01 00:00:00".to_string());
        let err = LogParser::new(config).unwrap_err();
        assert!(matches!(err, AstflowError::InvalidArgument { .. }));
    }

    #[test]
    fn test_new_rejects_missing_file() {
        let config = ParserConfig::new("/definitely/not/here.log");
        let err = LogParser::new(config).unwrap_err();
        assert!(matches!(err, AstflowError::InputNotFound { .. }));
    }
}
