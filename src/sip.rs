//! SIP message assembly and dialog tracking
//!
//! A [`SipMessage`] is accumulated line by line between the log's banner
//! lines; header fields are extracted at append time and the addressing
//! endpoints are resolved once the message is complete. A [`SipDialog`]
//! collects every message sharing a Call-ID and tracks the INVITE
//! establishment lifecycle.

use chrono::NaiveDateTime;
use strum_macros::{Display, EnumString};

use crate::model::AcallId;
use crate::text::{delimited, delimited_bounded, find_at, ByteRange};

/// Index of a [`SipMessage`] in the parser's message arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SipId(pub(crate) usize);

/// Index of a [`SipDialog`] in the parser's dialog arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DialogId(pub(crate) usize);

/// Transfer direction of a SIP message relative to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum Direction {
    #[strum(serialize = "IN")]
    In,
    #[strum(serialize = "OUT")]
    Out,
}

/// Assembler position within the message being collected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssembleState {
    Header,
    PreBody,
    Body,
    AfterBlank,
}

/// One SIP message reconstructed from the log
#[derive(Debug, Clone)]
pub struct SipMessage {
    /// Line the message text starts on (the line after its banner)
    pub line_no: usize,
    pub direction: Direction,
    pub peer_addr: Option<Vec<u8>>,
    pub is_nat: bool,
    pub when: Option<ByteRange>,
    pub when_ts: Option<NaiveDateTime>,
    pub acall: Option<AcallId>,
    /// Descriptor line carrying the message when it was framed inline by
    /// `chan_sip.c` rather than by a banner
    pub intro_line: Option<ByteRange>,
    pub attempt_no: u32,
    pub header: Vec<ByteRange>,
    pub body: Vec<ByteRange>,
    state: AssembleState,
    pub request: Option<Vec<u8>>,
    pub request_addr: Option<Vec<u8>>,
    pub status: Option<Vec<u8>>,
    pub from_name: Option<Vec<u8>>,
    pub from_num: Option<Vec<u8>>,
    pub from_addr: Option<Vec<u8>>,
    pub to_name: Option<Vec<u8>>,
    pub to_num: Option<Vec<u8>>,
    pub to_addr: Option<Vec<u8>>,
    pub via_addr: Option<Vec<u8>>,
    pub call_id: Option<Vec<u8>>,
    pub cseq: Option<Vec<u8>>,
    pub dialog: Option<DialogId>,
    /// For a response, the request it answers
    pub request_sip: Option<SipId>,
    pub sender_addr: Option<Vec<u8>>,
    pub recipient_addr: Option<Vec<u8>>,
}

impl SipMessage {
    pub fn new(
        line_no: usize,
        direction: Direction,
        peer_addr: Option<Vec<u8>>,
        is_nat: bool,
        when: Option<ByteRange>,
        when_ts: Option<NaiveDateTime>,
        acall: Option<AcallId>,
        intro_line: Option<ByteRange>,
    ) -> Self {
        Self {
            line_no,
            direction,
            peer_addr,
            is_nat,
            when,
            when_ts,
            acall,
            intro_line,
            attempt_no: 0,
            header: Vec::new(),
            body: Vec::new(),
            state: AssembleState::Header,
            request: None,
            request_addr: None,
            status: None,
            from_name: None,
            from_num: None,
            from_addr: None,
            to_name: None,
            to_num: None,
            to_addr: None,
            via_addr: None,
            call_id: None,
            cseq: None,
            dialog: None,
            request_sip: None,
            sender_addr: None,
            recipient_addr: None,
        }
    }

    /// Offer the next log line to the assembler.
    ///
    /// Returns `false` when the line does not extend the message; the caller
    /// then finalizes it and re-dispatches the line.
    pub fn add_line(&mut self, data: &[u8], line: ByteRange) -> bool {
        let text = line.slice(data);
        if text.starts_with(b"<--") || text.starts_with(b"---") {
            return false;
        }
        match self.state {
            AssembleState::Header => {
                if !text.is_empty() {
                    self.add_header(data, line);
                } else {
                    self.state = AssembleState::PreBody;
                }
                true
            }
            AssembleState::PreBody => {
                if !text.is_empty() {
                    self.body.push(line);
                    self.state = AssembleState::Body;
                }
                true
            }
            AssembleState::Body => {
                if !text.is_empty() {
                    self.body.push(line);
                } else {
                    self.state = AssembleState::AfterBlank;
                }
                true
            }
            AssembleState::AfterBlank => {
                if !text.is_empty() {
                    self.body.push(ByteRange::new(line.start, line.start));
                    self.body.push(line);
                    self.state = AssembleState::Body;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn add_header(&mut self, data: &[u8], line: ByteRange) {
        let text = line.slice(data);
        if self.header.is_empty() {
            if text.starts_with(b"SIP/2.0") {
                self.status = Some(text.get(8..).unwrap_or_default().to_vec());
            } else if let Some(pos) = memchr::memchr(b' ', text) {
                self.request = Some(text[..pos].to_vec());
                if let Some((addr, _)) = delimited(text, b"sip:", b" ", pos) {
                    let mut addr = addr;
                    if let Some(at) = find_at(addr, b"@", 0).filter(|&p| p > 0) {
                        addr = &addr[at + 1..];
                    }
                    if let Some(semi) = find_at(addr, b";", 0).filter(|&p| p > 0) {
                        addr = &addr[..semi];
                    }
                    self.request_addr = Some(addr.to_vec());
                }
            } else {
                self.request = Some(text.to_vec());
            }
        } else if text.starts_with(b"From:") {
            let (name, num, addr) = parse_from_to(text, 6);
            self.from_name = name;
            self.from_num = num;
            self.from_addr = addr;
        } else if text.starts_with(b"To:") {
            let (name, num, addr) = parse_from_to(text, 4);
            self.to_name = name;
            self.to_num = num;
            self.to_addr = addr;
        } else if text.starts_with(b"Call-ID:") {
            self.call_id = text.get(9..).map(<[u8]>::to_vec);
        } else if text.starts_with(b"Via:") {
            self.via_addr = delimited(text, b" ", b";", 14).map(|(addr, _)| addr.to_vec());
        } else if text.starts_with(b"CSeq:") {
            self.cseq = text.get(6..).map(<[u8]>::to_vec);
        }
        self.header.push(line);
    }

    /// Resolve the wire-level sender and recipient once assembly is done.
    ///
    /// `matched_recipient` is the recipient of the request this response
    /// answers, when one was found in the dialog.
    ///
    /// | Kind     | Dir | sender            | recipient              |
    /// |----------|-----|-------------------|------------------------|
    /// | REQUEST  | IN  | Via               | To, else request URL   |
    /// | REQUEST  | OUT | Via               | request URL            |
    /// | RESPONSE | IN  | matched recipient | Via                    |
    /// | RESPONSE | OUT | To                | Via                    |
    pub fn resolve_endpoints(&mut self, matched_recipient: Option<Vec<u8>>) {
        if self.request.is_some() {
            self.sender_addr = self.via_addr.clone();
            self.recipient_addr = match self.direction {
                Direction::In => self.to_addr.clone().or_else(|| self.request_addr.clone()),
                Direction::Out => self.request_addr.clone(),
            };
        } else {
            match self.direction {
                Direction::In => {
                    self.sender_addr = matched_recipient;
                    self.recipient_addr = self.via_addr.clone();
                }
                Direction::Out => {
                    self.sender_addr = self.to_addr.clone();
                    self.recipient_addr = self.via_addr.clone();
                }
            }
        }
        self.sender_addr = with_default_port(self.sender_addr.take());
        self.recipient_addr = with_default_port(self.recipient_addr.take());
    }

    /// Short human-readable form used in overview rows.
    pub fn summary(&self) -> String {
        let attempt = if self.attempt_no > 0 {
            format!(" #{}", self.attempt_no)
        } else {
            String::new()
        };
        let cseq = lossy(self.cseq.as_deref());
        match &self.request {
            Some(request) => format!(
                "{} {} ({}){}",
                String::from_utf8_lossy(request),
                lossy(self.to_num.as_deref()),
                cseq,
                attempt
            ),
            None => format!("{} ({}){}", lossy(self.status.as_deref()), cseq, attempt),
        }
    }

    /// Round-trippable reference token, `call_id/line_no+1`.
    pub fn ref_token(&self) -> Vec<u8> {
        let mut token = self.call_id.clone().unwrap_or_default();
        token.push(b'/');
        token.extend_from_slice((self.line_no + 1).to_string().as_bytes());
        token
    }

    /// Seconds since `start`, zero when either timestamp is unknown.
    pub fn elapsed_secs_since(&self, start: Option<NaiveDateTime>) -> f64 {
        match (self.when_ts, start) {
            (Some(ts), Some(start)) => {
                let delta = ts - start;
                delta.num_microseconds().unwrap_or(0) as f64 / 1_000_000.0
            }
            _ => 0.0,
        }
    }
}

/// Parse a `From:`/`To:` header into (display name, number, address).
///
/// The address gains `:5060` when the URI host carries no port, so endpoint
/// comparisons stay uniform.
fn parse_from_to(line: &[u8], start: usize) -> (Option<Vec<u8>>, Option<Vec<u8>>, Option<Vec<u8>>) {
    if start >= line.len() {
        return (None, None, None);
    }
    let (name, num): (Option<&[u8]>, Option<&[u8]>) = match line[start] {
        b'<' => (None, delimited(line, b"<sip:", b">", start).map(|(s, _)| s)),
        b'"' => {
            let quoted = delimited(line, b"\"", b"\"", start);
            let after = quoted.map(|(_, pos)| pos).unwrap_or(start);
            (
                quoted.map(|(s, _)| s),
                delimited(line, b"<sip:", b">", after).map(|(s, _)| s),
            )
        }
        _ => {
            let num = delimited(line, b"<sip:", b">", start);
            let bound = num.map(|(_, pos)| pos).unwrap_or(line.len());
            (
                delimited_bounded(line, b" ", b" ", start, bound).map(|(s, _)| s),
                num.map(|(s, _)| s),
            )
        }
    };

    let mut addr = None;
    let num = num.map(|raw| {
        let mut num = raw;
        if let Some(semi) = find_at(num, b";", 0).filter(|&p| p > 0) {
            num = &num[..semi];
        }
        if let Some(at) = find_at(num, b"@", 0).filter(|&p| p > 0) {
            let mut host = num[at + 1..].to_vec();
            if !host.contains(&b':') {
                host.extend_from_slice(b":5060");
            }
            addr = Some(host);
            num = &num[..at];
        }
        num.to_vec()
    });

    (name.map(<[u8]>::to_vec), num, addr)
}

fn lossy(bytes: Option<&[u8]>) -> String {
    String::from_utf8_lossy(bytes.unwrap_or_default()).into_owned()
}

/// Endpoint comparisons assume an explicit port; bare hosts get the SIP
/// default.
fn with_default_port(addr: Option<Vec<u8>>) -> Option<Vec<u8>> {
    addr.map(|mut addr| {
        if !addr.contains(&b':') {
            addr.extend_from_slice(b":5060");
        }
        addr
    })
}

/// All SIP messages sharing one Call-ID
#[derive(Debug, Clone)]
pub struct SipDialog {
    pub call_id: Vec<u8>,
    /// Messages in insertion (source line) order
    pub sip_list: Vec<SipId>,
    /// Request method of the first message
    pub request: Option<Vec<u8>>,
    /// Latest response status seen while establishing (or at all, for
    /// dialogs not initiated by INVITE)
    pub dialog_status: Option<Vec<u8>>,
    pub dialog_ack: Option<Vec<u8>>,
    pub is_establishing: bool,
    pub was_established: bool,
    pub had_bye: bool,
    pub bye_addr: Option<Vec<u8>>,
    /// Retransmission timeout event, when one was signalled for this call
    pub timeout: Option<(usize, Option<ByteRange>)>,
}

impl SipDialog {
    pub fn new(call_id: Vec<u8>, first: &SipMessage) -> Self {
        Self {
            call_id,
            sip_list: Vec::new(),
            request: first.request.clone(),
            dialog_status: None,
            dialog_ack: None,
            is_establishing: first.request.as_deref() == Some(b"INVITE"),
            was_established: false,
            had_bye: false,
            bye_addr: None,
            timeout: None,
        }
    }

    /// Fold the next message of this dialog into the lifecycle state.
    pub fn add_sip(&mut self, id: SipId, sip: &SipMessage) {
        if sip.request.as_deref() == Some(b"INVITE") {
            // INVITE retries restart the establishment phase.
            self.is_establishing = true;
        } else if self.is_establishing {
            if let Some(status) = &sip.status {
                self.dialog_status = Some(status.clone());
            } else if sip.request.as_deref() == Some(b"ACK") {
                self.dialog_ack = sip.request.clone();
                self.is_establishing = false;
                if let Some(status) = &self.dialog_status {
                    if status.starts_with(b"1") || status.starts_with(b"2") {
                        self.was_established = true;
                    }
                }
            }
        } else if self.was_established && !self.had_bye {
            if sip.request.as_deref() == Some(b"BYE") {
                self.bye_addr = sip.sender_addr.clone();
                self.had_bye = true;
            }
        } else if self.request.as_deref() != Some(b"INVITE") {
            if let Some(status) = &sip.status {
                self.dialog_status = Some(status.clone());
            }
        }

        self.sip_list.push(id);
    }

    pub fn start_sip(&self) -> Option<SipId> {
        self.sip_list.first().copied()
    }

    pub fn finish_sip(&self) -> Option<SipId> {
        if self.sip_list.len() > 1 {
            self.sip_list.last().copied()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(direction: Direction) -> SipMessage {
        SipMessage::new(0, direction, None, false, None, None, None, None)
    }

    fn feed(msg: &mut SipMessage, lines: &[&[u8]]) -> Vec<bool> {
        let mut data = Vec::new();
        let mut ranges = Vec::new();
        for line in lines {
            let start = data.len();
            data.extend_from_slice(line);
            ranges.push(ByteRange::new(start, data.len()));
        }
        ranges.iter().map(|r| msg.add_line(&data, *r)).collect()
    }

    #[test]
    fn test_request_header_extraction() {
        let mut msg = message(Direction::Out);
        feed(
            &mut msg,
            &[
                b"INVITE sip:bob@10.0.0.1 SIP/2.0",
                b"From: \"Alice\" <sip:100@h>",
                b"To: <sip:200@10.0.0.1>",
                b"Call-ID: X@h",
                b"CSeq: 1 INVITE",
                b"Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK1",
            ],
        );
        assert_eq!(msg.request.as_deref(), Some(&b"INVITE"[..]));
        assert_eq!(msg.request_addr.as_deref(), Some(&b"10.0.0.1"[..]));
        assert_eq!(msg.from_name.as_deref(), Some(&b"Alice"[..]));
        assert_eq!(msg.from_num.as_deref(), Some(&b"100"[..]));
        assert_eq!(msg.from_addr.as_deref(), Some(&b"h:5060"[..]));
        assert_eq!(msg.to_num.as_deref(), Some(&b"200"[..]));
        assert_eq!(msg.to_addr.as_deref(), Some(&b"10.0.0.1:5060"[..]));
        assert_eq!(msg.call_id.as_deref(), Some(&b"X@h"[..]));
        assert_eq!(msg.cseq.as_deref(), Some(&b"1 INVITE"[..]));
        assert_eq!(msg.via_addr.as_deref(), Some(&b"10.0.0.2:5060"[..]));
    }

    #[test]
    fn test_response_status_line() {
        let mut msg = message(Direction::In);
        feed(&mut msg, &[b"SIP/2.0 100 Trying"]);
        assert_eq!(msg.status.as_deref(), Some(&b"100 Trying"[..]));
        assert!(msg.request.is_none());
    }

    #[test]
    fn test_assembler_rejects_banner() {
        let mut msg = message(Direction::In);
        let results = feed(&mut msg, &[b"SIP/2.0 200 OK", b"<------------->"]);
        assert_eq!(results, vec![true, false]);
    }

    #[test]
    fn test_assembler_body_states() {
        let mut msg = message(Direction::In);
        let results = feed(
            &mut msg,
            &[
                b"SIP/2.0 200 OK",
                b"",
                b"v=0",
                b"m=audio 4000 RTP/AVP 8",
                b"",
                b"extra",
                b"",
                b"",
            ],
        );
        // Blank after body leaves the assembler waiting; a following
        // non-blank re-opens the body with a separating empty line, two
        // consecutive blanks end the message.
        assert_eq!(results, vec![true, true, true, true, true, true, true, false]);
        assert_eq!(msg.body.len(), 4);
    }

    #[test]
    fn test_assembler_blank_before_body_does_not_end() {
        let mut msg = message(Direction::In);
        let results = feed(&mut msg, &[b"SIP/2.0 200 OK", b"", b"", b"v=0"]);
        assert_eq!(results, vec![true, true, true, true]);
        assert_eq!(msg.body.len(), 1);
    }

    #[test]
    fn test_from_to_variants() {
        let (name, num, addr) = parse_from_to(b"To: <sip:200@10.0.0.1;tag=1>", 4);
        assert_eq!(name, None);
        assert_eq!(num.as_deref(), Some(&b"200"[..]));
        assert_eq!(addr.as_deref(), Some(&b"10.0.0.1:5060"[..]));

        let (name, num, addr) = parse_from_to(b"From: \"Bob X\" <sip:300@h:5070>", 6);
        assert_eq!(name.as_deref(), Some(&b"Bob X"[..]));
        assert_eq!(num.as_deref(), Some(&b"300"[..]));
        assert_eq!(addr.as_deref(), Some(&b"h:5070"[..]));

        let (_, num, addr) = parse_from_to(b"From: <sip:asterisk>", 6);
        assert_eq!(num.as_deref(), Some(&b"asterisk"[..]));
        assert_eq!(addr, None);
    }

    #[test]
    fn test_endpoint_resolution_request() {
        let mut msg = message(Direction::In);
        msg.request = Some(b"INVITE".to_vec());
        msg.via_addr = Some(b"1.1.1.1:5060".to_vec());
        msg.to_addr = Some(b"2.2.2.2:5060".to_vec());
        msg.request_addr = Some(b"3.3.3.3".to_vec());
        msg.resolve_endpoints(None);
        assert_eq!(msg.sender_addr.as_deref(), Some(&b"1.1.1.1:5060"[..]));
        assert_eq!(msg.recipient_addr.as_deref(), Some(&b"2.2.2.2:5060"[..]));

        let mut msg = message(Direction::Out);
        msg.request = Some(b"INVITE".to_vec());
        msg.via_addr = Some(b"1.1.1.1:5060".to_vec());
        msg.request_addr = Some(b"3.3.3.3".to_vec());
        msg.resolve_endpoints(None);
        // A request URL without a port picks up the SIP default.
        assert_eq!(msg.recipient_addr.as_deref(), Some(&b"3.3.3.3:5060"[..]));
    }

    #[test]
    fn test_endpoint_resolution_response() {
        let mut msg = message(Direction::In);
        msg.status = Some(b"200 OK".to_vec());
        msg.via_addr = Some(b"1.1.1.1:5060".to_vec());
        msg.resolve_endpoints(Some(b"9.9.9.9:5060".to_vec()));
        assert_eq!(msg.sender_addr.as_deref(), Some(&b"9.9.9.9:5060"[..]));
        assert_eq!(msg.recipient_addr.as_deref(), Some(&b"1.1.1.1:5060"[..]));

        let mut msg = message(Direction::Out);
        msg.status = Some(b"486 Busy Here".to_vec());
        msg.via_addr = Some(b"1.1.1.1:5060".to_vec());
        msg.to_addr = Some(b"2.2.2.2:5060".to_vec());
        msg.resolve_endpoints(None);
        assert_eq!(msg.sender_addr.as_deref(), Some(&b"2.2.2.2:5060"[..]));
        assert_eq!(msg.recipient_addr.as_deref(), Some(&b"1.1.1.1:5060"[..]));
    }

    #[test]
    fn test_dialog_establishment() {
        let mut invite = message(Direction::Out);
        invite.request = Some(b"INVITE".to_vec());
        let mut dialog = SipDialog::new(b"X@h".to_vec(), &invite);
        dialog.add_sip(SipId(0), &invite);
        assert!(dialog.is_establishing);
        assert!(!dialog.was_established);

        let mut trying = message(Direction::In);
        trying.status = Some(b"100 Trying".to_vec());
        dialog.add_sip(SipId(1), &trying);
        assert_eq!(dialog.dialog_status.as_deref(), Some(&b"100 Trying"[..]));
        assert!(dialog.is_establishing);

        let mut ok = message(Direction::In);
        ok.status = Some(b"200 OK".to_vec());
        dialog.add_sip(SipId(2), &ok);

        let mut ack = message(Direction::Out);
        ack.request = Some(b"ACK".to_vec());
        dialog.add_sip(SipId(3), &ack);
        assert!(!dialog.is_establishing);
        assert!(dialog.was_established);
        assert_eq!(dialog.dialog_ack.as_deref(), Some(&b"ACK"[..]));
    }

    #[test]
    fn test_dialog_invite_retry_resets_establishing() {
        let mut invite = message(Direction::Out);
        invite.request = Some(b"INVITE".to_vec());
        let mut dialog = SipDialog::new(b"X@h".to_vec(), &invite);
        dialog.add_sip(SipId(0), &invite);

        let mut ok = message(Direction::In);
        ok.status = Some(b"200 OK".to_vec());
        dialog.add_sip(SipId(1), &ok);
        let mut ack = message(Direction::Out);
        ack.request = Some(b"ACK".to_vec());
        dialog.add_sip(SipId(2), &ack);
        assert!(!dialog.is_establishing);

        dialog.add_sip(SipId(3), &invite);
        assert!(dialog.is_establishing);
    }

    #[test]
    fn test_dialog_bye_records_sender() {
        let mut invite = message(Direction::Out);
        invite.request = Some(b"INVITE".to_vec());
        let mut dialog = SipDialog::new(b"X@h".to_vec(), &invite);
        dialog.add_sip(SipId(0), &invite);
        let mut ok = message(Direction::In);
        ok.status = Some(b"200 OK".to_vec());
        dialog.add_sip(SipId(1), &ok);
        let mut ack = message(Direction::Out);
        ack.request = Some(b"ACK".to_vec());
        dialog.add_sip(SipId(2), &ack);

        let mut bye = message(Direction::In);
        bye.request = Some(b"BYE".to_vec());
        bye.sender_addr = Some(b"10.0.0.1:5060".to_vec());
        dialog.add_sip(SipId(3), &bye);
        assert!(dialog.had_bye);
        assert_eq!(dialog.bye_addr.as_deref(), Some(&b"10.0.0.1:5060"[..]));
    }

    #[test]
    fn test_dialog_non_invite_tracks_status() {
        let mut options = message(Direction::Out);
        options.request = Some(b"OPTIONS".to_vec());
        let mut dialog = SipDialog::new(b"opt@h".to_vec(), &options);
        dialog.add_sip(SipId(0), &options);
        assert!(!dialog.is_establishing);

        let mut ok = message(Direction::In);
        ok.status = Some(b"200 OK".to_vec());
        dialog.add_sip(SipId(1), &ok);
        assert_eq!(dialog.dialog_status.as_deref(), Some(&b"200 OK"[..]));
        assert!(!dialog.was_established);
    }

    #[test]
    fn test_summary_and_ref_token() {
        let mut msg = message(Direction::Out);
        msg.request = Some(b"INVITE".to_vec());
        msg.to_num = Some(b"200".to_vec());
        msg.cseq = Some(b"1 INVITE".to_vec());
        msg.call_id = Some(b"X@h".to_vec());
        assert_eq!(msg.summary(), "INVITE 200 (1 INVITE)");
        assert_eq!(msg.ref_token(), b"X@h/1".to_vec());

        msg.attempt_no = 2;
        assert_eq!(msg.summary(), "INVITE 200 (1 INVITE) #2");
    }
}
