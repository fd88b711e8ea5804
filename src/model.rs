//! Call-flow entities reconstructed from the log
//!
//! All entities live in arenas owned by the parser and reference each other
//! through the opaque ids below; cycles between channels, thread contexts
//! and SIP messages are id-valued and harmless.

use std::collections::{BTreeSet, HashMap};

use strum_macros::{Display, EnumString};

use crate::sip::SipId;
use crate::text::{channel_phone, ByteRange};

/// Index of a [`Channel`] in the parser's channel arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub(crate) usize);

/// Index of an [`AstCall`] in the parser's thread-context arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AcallId(pub(crate) usize);

/// Index of an [`App`] in the parser's application arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AppId(pub(crate) usize);

/// Lifecycle status of a Dial or Queue application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum DialStatus {
    #[strum(serialize = "ACTIVE")]
    Active,
    #[strum(serialize = "RINGING")]
    Ringing,
    #[strum(serialize = "ANSWERED")]
    Answered,
    #[strum(serialize = "NO ANSWER")]
    NoAnswer,
    #[strum(serialize = "BUSY")]
    Busy,
    #[strum(serialize = "EXIT")]
    Exit,
    #[strum(serialize = "PICKUP")]
    Pickup,
}

/// Kind of a per-destination event within a Dial or Queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum EventKind {
    #[strum(serialize = "CALL")]
    Call,
    #[strum(serialize = "RINGING")]
    Ringing,
    #[strum(serialize = "BUSY")]
    Busy,
    #[strum(serialize = "PROGRESS")]
    Progress,
    #[strum(serialize = "PICKUP")]
    Pickup,
    #[strum(serialize = "ANSWERED")]
    Answered,
    #[strum(serialize = "HANGUP")]
    Hangup,
    #[strum(serialize = "EXIT")]
    Exit,
    #[strum(serialize = "NO ANSWER")]
    NoAnswer,
    #[strum(serialize = "POSITION")]
    Position,
}

/// One entry of an application's event log.
///
/// `phone` carries the extracted phone (or the announced position for
/// [`EventKind::Position`]); `target` the device or channel it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct AppEvent {
    pub line_no: usize,
    pub when: Option<ByteRange>,
    pub kind: EventKind,
    pub phone: Option<Vec<u8>>,
    pub target: Option<Vec<u8>>,
}

/// A Dial application execution on a channel
#[derive(Debug, Clone)]
pub struct Dial {
    pub channel: ChannelId,
    pub line_no: usize,
    pub when: Option<ByteRange>,
    pub extension: Vec<u8>,
    pub phones: Vec<Vec<u8>>,
    pub log: Vec<AppEvent>,
    pub status: DialStatus,
    pub(crate) was_busy: bool,
}

impl Dial {
    pub fn new(
        channel: ChannelId,
        line_no: usize,
        when: Option<ByteRange>,
        extension: Vec<u8>,
        phones: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            channel,
            line_no,
            when,
            extension,
            phones,
            log: Vec::new(),
            status: DialStatus::Active,
            was_busy: false,
        }
    }

    /// The dialed phones joined the way the dialplan wrote them
    pub fn data(&self) -> Vec<u8> {
        self.phones.join(&b", "[..])
    }

    pub fn called(&mut self, line_no: usize, when: Option<ByteRange>, device: &[u8]) {
        self.push(line_no, when, EventKind::Call, Some(device_owned(device)), device);
    }

    pub fn ringing(&mut self, line_no: usize, when: Option<ByteRange>, chan: &[u8]) {
        self.push(line_no, when, EventKind::Ringing, Some(channel_phone(chan).to_vec()), chan);
        if self.status == DialStatus::Active {
            self.status = DialStatus::Ringing;
        }
    }

    pub fn busy(&mut self, line_no: usize, when: Option<ByteRange>, chan: &[u8]) {
        self.push(line_no, when, EventKind::Busy, Some(channel_phone(chan).to_vec()), chan);
        self.was_busy = true;
    }

    pub fn progress(&mut self, line_no: usize, when: Option<ByteRange>, chan: &[u8]) {
        self.push(line_no, when, EventKind::Progress, Some(channel_phone(chan).to_vec()), chan);
    }

    pub fn pickup(&mut self, line_no: usize, when: Option<ByteRange>, ringing_chan: &[u8]) {
        self.push(
            line_no,
            when,
            EventKind::Pickup,
            Some(channel_phone(ringing_chan).to_vec()),
            ringing_chan,
        );
        self.status = DialStatus::Pickup;
    }

    pub fn answered(&mut self, line_no: usize, when: Option<ByteRange>, chan: &[u8]) {
        self.push(line_no, when, EventKind::Answered, Some(channel_phone(chan).to_vec()), chan);
        self.status = DialStatus::Answered;
    }

    pub fn manager_hangup(&mut self, line_no: usize, when: Option<ByteRange>, chan: &[u8]) {
        self.push(line_no, when, EventKind::Hangup, Some(b"manager".to_vec()), chan);
        self.finish();
    }

    pub fn extension_exited(&mut self, line_no: usize, when: Option<ByteRange>) {
        self.log.push(AppEvent {
            line_no,
            when,
            kind: EventKind::Exit,
            phone: None,
            target: None,
        });
        self.finish();
    }

    pub fn nobody_picked_up(&mut self, line_no: usize, when: Option<ByteRange>) {
        self.log.push(AppEvent {
            line_no,
            when,
            kind: EventKind::NoAnswer,
            phone: None,
            target: None,
        });
        self.status = DialStatus::NoAnswer;
    }

    /// Resolve the terminal status once the application leaves the dialplan.
    pub fn finish(&mut self) {
        if self.status == DialStatus::Ringing {
            self.status = DialStatus::NoAnswer;
        } else if self.was_busy {
            self.status = DialStatus::Busy;
        } else if !matches!(
            self.status,
            DialStatus::Answered | DialStatus::NoAnswer | DialStatus::Pickup
        ) {
            self.status = DialStatus::Exit;
        }
    }

    fn push(
        &mut self,
        line_no: usize,
        when: Option<ByteRange>,
        kind: EventKind,
        phone: Option<Vec<u8>>,
        target: &[u8],
    ) {
        self.log.push(AppEvent {
            line_no,
            when,
            kind,
            phone,
            target: Some(target.to_vec()),
        });
    }
}

/// A Queue application execution on a channel
#[derive(Debug, Clone)]
pub struct Queue {
    pub channel: ChannelId,
    pub line_no: usize,
    pub when: Option<ByteRange>,
    pub extension: Vec<u8>,
    pub name: Vec<u8>,
    pub log: Vec<AppEvent>,
    pub status: DialStatus,
}

impl Queue {
    pub fn new(
        channel: ChannelId,
        line_no: usize,
        when: Option<ByteRange>,
        extension: Vec<u8>,
        name: Vec<u8>,
    ) -> Self {
        Self {
            channel,
            line_no,
            when,
            extension,
            name,
            log: Vec::new(),
            status: DialStatus::Active,
        }
    }

    pub fn ringing(&mut self, line_no: usize, when: Option<ByteRange>, chan: &[u8]) {
        self.log.push(AppEvent {
            line_no,
            when,
            kind: EventKind::Ringing,
            phone: Some(channel_phone(chan).to_vec()),
            target: Some(chan.to_vec()),
        });
        if self.status == DialStatus::Active {
            self.status = DialStatus::Ringing;
        }
    }

    /// Queue-position announcement for the waiting channel.
    pub fn position(&mut self, line_no: usize, when: Option<ByteRange>, chan: &[u8], position: &[u8]) {
        self.log.push(AppEvent {
            line_no,
            when,
            kind: EventKind::Position,
            phone: Some(position.to_vec()),
            target: Some(chan.to_vec()),
        });
    }

    pub fn pickup(&mut self, line_no: usize, when: Option<ByteRange>, ringing_chan: &[u8]) {
        self.log.push(AppEvent {
            line_no,
            when,
            kind: EventKind::Pickup,
            phone: Some(channel_phone(ringing_chan).to_vec()),
            target: Some(ringing_chan.to_vec()),
        });
        self.status = DialStatus::Pickup;
    }

    pub fn answered(&mut self, line_no: usize, when: Option<ByteRange>, chan: &[u8]) {
        self.log.push(AppEvent {
            line_no,
            when,
            kind: EventKind::Answered,
            phone: Some(channel_phone(chan).to_vec()),
            target: Some(chan.to_vec()),
        });
        self.status = DialStatus::Answered;
    }
}

/// A dialplan application: Dial or Queue, with the accessors shared by both.
#[derive(Debug, Clone)]
pub enum App {
    Dial(Dial),
    Queue(Queue),
}

impl App {
    pub fn app_name(&self) -> &'static str {
        match self {
            App::Dial(_) => "Dial",
            App::Queue(_) => "Queue",
        }
    }

    pub fn data(&self) -> Vec<u8> {
        match self {
            App::Dial(dial) => dial.data(),
            App::Queue(queue) => queue.name.clone(),
        }
    }

    pub fn status(&self) -> DialStatus {
        match self {
            App::Dial(dial) => dial.status,
            App::Queue(queue) => queue.status,
        }
    }

    pub fn log(&self) -> &[AppEvent] {
        match self {
            App::Dial(dial) => &dial.log,
            App::Queue(queue) => &queue.log,
        }
    }

    pub fn channel(&self) -> ChannelId {
        match self {
            App::Dial(dial) => dial.channel,
            App::Queue(queue) => queue.channel,
        }
    }

    pub fn line_no(&self) -> usize {
        match self {
            App::Dial(dial) => dial.line_no,
            App::Queue(queue) => queue.line_no,
        }
    }

    pub fn as_dial(&self) -> Option<&Dial> {
        match self {
            App::Dial(dial) => Some(dial),
            App::Queue(_) => None,
        }
    }

    pub fn as_dial_mut(&mut self) -> Option<&mut Dial> {
        match self {
            App::Dial(dial) => Some(dial),
            App::Queue(_) => None,
        }
    }

    pub fn as_queue(&self) -> Option<&Queue> {
        match self {
            App::Dial(_) => None,
            App::Queue(queue) => Some(queue),
        }
    }

    pub fn as_queue_mut(&mut self) -> Option<&mut Queue> {
        match self {
            App::Dial(_) => None,
            App::Queue(queue) => Some(queue),
        }
    }
}

/// An endpoint-facing call leg inside the telephony engine
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: Vec<u8>,
    pub line_no: usize,
    pub when: Option<ByteRange>,
    /// Applications in execution order, append-only
    pub apps: Vec<AppId>,
    /// Extension -> first line it was seen on
    pub extensions: HashMap<Vec<u8>, (usize, Option<ByteRange>)>,
    pub lines: Vec<(usize, ByteRange)>,
    pub acall_set: Vec<AcallId>,
    pub sip_set: Vec<SipId>,
    pub current_dial: Option<AppId>,
    pub current_queue: Option<AppId>,
    pub clid_name: Option<Vec<u8>>,
    pub clid_num: Option<Vec<u8>>,
}

impl Channel {
    pub fn new(name: Vec<u8>, line_no: usize, when: Option<ByteRange>) -> Self {
        Self {
            name,
            line_no,
            when,
            apps: Vec::new(),
            extensions: HashMap::new(),
            lines: Vec::new(),
            acall_set: Vec::new(),
            sip_set: Vec::new(),
            current_dial: None,
            current_queue: None,
            clid_name: None,
            clid_num: None,
        }
    }

    pub fn add_acall(&mut self, acall: AcallId) {
        if !self.acall_set.contains(&acall) {
            self.acall_set.push(acall);
        }
    }

    pub fn add_sip(&mut self, sip: SipId) {
        if !self.sip_set.contains(&sip) {
            self.sip_set.push(sip);
        }
    }

    pub fn add_extension(&mut self, extension: &[u8], line_no: usize, when: Option<ByteRange>) {
        if !self.extensions.contains_key(extension) {
            self.extensions.insert(extension.to_vec(), (line_no, when));
        }
    }

    /// Dials executed on this channel, in order.
    pub fn dials<'a>(&self, apps: &'a [App]) -> Vec<&'a Dial> {
        self.apps.iter().filter_map(|id| apps[id.0].as_dial()).collect()
    }

    /// Queues executed on this channel, in order.
    pub fn queues<'a>(&self, apps: &'a [App]) -> Vec<&'a Queue> {
        self.apps.iter().filter_map(|id| apps[id.0].as_queue()).collect()
    }

    /// Every phone dialed by this channel's Dial applications.
    pub fn dialed_phones(&self, apps: &[App]) -> BTreeSet<Vec<u8>> {
        self.dials(apps)
            .iter()
            .flat_map(|dial| dial.phones.iter().cloned())
            .collect()
    }

    /// Extensions plus dialed phones.
    pub fn phones(&self, apps: &[App]) -> BTreeSet<Vec<u8>> {
        let mut set = self.dialed_phones(apps);
        set.extend(self.extensions.keys().cloned());
        set
    }
}

/// A thread-context call: log lines grouped by the engine's `[C-...]` id
#[derive(Debug, Clone)]
pub struct AstCall {
    pub acall_id: Vec<u8>,
    pub line_no: usize,
    pub when: Option<ByteRange>,
    pub lines: Vec<(usize, ByteRange)>,
    pub sip_set: Vec<SipId>,
    pub channel_set: Vec<ChannelId>,
    pub call_id_set: Vec<Vec<u8>>,
    pub current_dial: Option<AppId>,
    pub current_queue: Option<AppId>,
}

impl AstCall {
    pub fn new(acall_id: Vec<u8>, line_no: usize, when: Option<ByteRange>) -> Self {
        Self {
            acall_id,
            line_no,
            when,
            lines: Vec::new(),
            sip_set: Vec::new(),
            channel_set: Vec::new(),
            call_id_set: Vec::new(),
            current_dial: None,
            current_queue: None,
        }
    }

    pub fn add_sip(&mut self, sip: SipId) {
        if !self.sip_set.contains(&sip) {
            self.sip_set.push(sip);
        }
    }

    pub fn add_channel(&mut self, channel: ChannelId) {
        if !self.channel_set.contains(&channel) {
            self.channel_set.push(channel);
        }
    }

    pub fn add_call_id(&mut self, call_id: &[u8]) {
        if !self.call_id_set.iter().any(|c| c == call_id) {
            self.call_id_set.push(call_id.to_vec());
        }
    }
}

fn device_owned(device: &[u8]) -> Vec<u8> {
    crate::text::device_phone(device).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dial() -> Dial {
        Dial::new(ChannelId(0), 10, None, b"100".to_vec(), vec![b"440".to_vec()])
    }

    #[test]
    fn test_dial_ringing_then_finish_is_no_answer() {
        let mut d = dial();
        d.ringing(11, None, b"SIP/440-0001");
        assert_eq!(d.status, DialStatus::Ringing);
        d.finish();
        assert_eq!(d.status, DialStatus::NoAnswer);
    }

    #[test]
    fn test_dial_busy_then_finish() {
        let mut d = dial();
        d.busy(12, None, b"SIP/440-0001");
        d.finish();
        assert_eq!(d.status, DialStatus::Busy);
    }

    #[test]
    fn test_dial_ringing_wins_over_busy_at_finish() {
        let mut d = dial();
        d.busy(11, None, b"SIP/440-0001");
        d.ringing(12, None, b"SIP/441-0002");
        d.finish();
        assert_eq!(d.status, DialStatus::NoAnswer);
    }

    #[test]
    fn test_dial_answered_survives_finish() {
        let mut d = dial();
        d.answered(12, None, b"SIP/440-0001");
        d.finish();
        assert_eq!(d.status, DialStatus::Answered);
        assert_eq!(d.log.last().unwrap().kind, EventKind::Answered);
        assert_eq!(d.log.last().unwrap().phone.as_deref(), Some(&b"440"[..]));
    }

    #[test]
    fn test_dial_exit_without_activity() {
        let mut d = dial();
        d.extension_exited(13, None);
        assert_eq!(d.status, DialStatus::Exit);
    }

    #[test]
    fn test_queue_position_event() {
        let mut q = Queue::new(ChannelId(0), 5, None, b"600".to_vec(), b"support".to_vec());
        q.position(6, None, b"SIP/tk-0001", b"2");
        assert_eq!(q.log[0].kind, EventKind::Position);
        assert_eq!(q.log[0].phone.as_deref(), Some(&b"2"[..]));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(DialStatus::NoAnswer.to_string(), "NO ANSWER");
        assert_eq!(DialStatus::Answered.to_string(), "ANSWERED");
    }
}
