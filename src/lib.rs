//! astflow - call-flow reconstruction from Asterisk verbose logs
//!
//! This library ingests a telephony verbose log (optionally with a CDR CSV)
//! and rebuilds the call flow as linked entities: SIP dialogs, channel
//! lifecycles, Dial/Queue applications and per-thread call contexts. Any
//! reference - a phone, a channel name, a SIP Call-ID - can then be expanded
//! into the set of objects and raw lines reachable from it.

mod cdr;
mod error;
mod graph;
mod model;
mod parser;
mod sip;
mod text;
pub mod window;

pub use error::{AstflowError, AstflowResult};
pub use graph::{GraphObj, LineEntry, LogGroup, OverviewEntry, OverviewKind, MAX_DEPTH};
pub use model::{
    AcallId, App, AppEvent, AppId, AstCall, Channel, ChannelId, Dial, DialStatus, EventKind, Queue,
};
pub use parser::{FoundObj, LogParser, ParserConfig, RefKind};
pub use sip::{Direction, DialogId, SipDialog, SipId, SipMessage};
pub use text::{channel_phone, device_phone, parse_when, ByteRange};
