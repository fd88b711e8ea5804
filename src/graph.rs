//! Call-graph traversal
//!
//! Given any reference (phone, channel name, Call-ID, queue name), walks the
//! linking maps bi-directionally with a depth bound and per-entity visited
//! sets, producing one [`LogGroup`] per discovered root plus a flat
//! line-keyed object map for display.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::model::{AcallId, ChannelId};
use crate::parser::{LogParser, RefKind};
use crate::sip::SipId;
use crate::text::ByteRange;

/// Depth bound of the traversal; sized to the data, not to correctness.
pub const MAX_DEPTH: usize = 10;

/// Kind of a group overview entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverviewKind {
    Dialog,
    Channel,
    AstCall,
}

/// Entity behind an overview entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphObj {
    Sip(SipId),
    Channel(ChannelId),
    AstCall(AcallId),
}

/// One row of a group's overview, anchored to its first source line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverviewEntry {
    pub line_no: usize,
    pub kind: OverviewKind,
    pub obj: GraphObj,
}

/// A line collected into a group, tagged with its display style.
///
/// `Channel` styling wins over `Verbose` for the same line: a verbose
/// insert never replaces an existing entry, channel and SIP inserts do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEntry {
    Sip(SipId),
    Verbose(ByteRange),
    Channel(ByteRange),
}

/// One rooted traversal result
#[derive(Debug, Clone, Default)]
pub struct LogGroup {
    /// Entities discovered under this root, sorted by line number
    pub overview: Vec<OverviewEntry>,
    pub lines: HashMap<usize, LineEntry>,
}

impl LogGroup {
    fn append(&mut self, line_no: usize, kind: OverviewKind, obj: GraphObj) {
        self.overview.push(OverviewEntry { line_no, kind, obj });
    }

    fn line(&mut self, line_no: usize, entry: LineEntry) {
        if matches!(entry, LineEntry::Verbose(_)) && self.lines.contains_key(&line_no) {
            return;
        }
        self.lines.insert(line_no, entry);
    }
}

/// Mutually recursive walk state: visited sets shared across all groups.
struct Traversal<'a> {
    parser: &'a LogParser,
    max_depth: usize,
    mark_call: HashSet<Option<Vec<u8>>>,
    mark_sip: HashSet<SipId>,
    mark_acall: HashSet<AcallId>,
    mark_channel: HashSet<ChannelId>,
}

impl<'a> Traversal<'a> {
    fn new(parser: &'a LogParser, max_depth: usize) -> Self {
        Self {
            parser,
            max_depth,
            mark_call: HashSet::new(),
            mark_sip: HashSet::new(),
            mark_acall: HashSet::new(),
            mark_channel: HashSet::new(),
        }
    }

    /// Expand messages to their whole dialogs, deduplicate, order by line.
    fn include_dialog_sips(&self, seeds: Vec<SipId>) -> Vec<SipId> {
        let parser = self.parser;
        let mut all: Vec<SipId> = Vec::new();
        for &sip in &seeds {
            if !all.contains(&sip) {
                all.push(sip);
            }
            if let Some(dialog_id) = parser.sip(sip).dialog {
                for &other in &parser.dialog(dialog_id).sip_list {
                    if !all.contains(&other) {
                        all.push(other);
                    }
                }
            }
        }
        all.sort_by_key(|&id| parser.sip(id).line_no);
        all
    }

    fn add_sip(&mut self, group: &mut LogGroup, id: SipId, level: usize) {
        if level > self.max_depth || self.mark_sip.contains(&id) {
            return;
        }
        self.mark_sip.insert(id);
        let parser = self.parser;
        let sip = parser.sip(id);

        group.line(sip.line_no, LineEntry::Sip(id));

        let call_key = sip.call_id.clone();
        if !self.mark_call.contains(&call_key) {
            self.mark_call.insert(call_key.clone());
            let start = sip
                .dialog
                .and_then(|d| parser.dialog(d).start_sip())
                .unwrap_or(id);
            let start_line = parser.sip(start).line_no;
            group.append(start_line, OverviewKind::Dialog, GraphObj::Sip(start));
            if let Some(call_id) = &call_key {
                if let Some(lines) = parser.call_lines.get(call_id) {
                    for &(line_no, line) in lines {
                        group.line(line_no, LineEntry::Verbose(line));
                    }
                }
            }
        }

        self.add_acall(group, sip.acall, level + 1);
        if let Some(call_id) = &call_key {
            let acalls = parser
                .call_acall_map
                .get(call_id)
                .cloned()
                .unwrap_or_default();
            for acall in acalls {
                self.add_acall(group, Some(acall), level + 1);
            }
        }

        if let Some(dialog_id) = parser.sip(id).dialog {
            let dialog_sips = parser.dialog(dialog_id).sip_list.clone();
            for other in dialog_sips {
                self.add_sip(group, other, level + 1);
            }
        }
    }

    fn add_acall(&mut self, group: &mut LogGroup, id: Option<AcallId>, level: usize) {
        let Some(id) = id else { return };
        if level > self.max_depth || self.mark_acall.contains(&id) {
            return;
        }
        self.mark_acall.insert(id);
        let parser = self.parser;
        let acall = parser.acall(id);

        let mut min_line = None;
        for &(line_no, line) in &acall.lines {
            group.line(line_no, LineEntry::Verbose(line));
            if min_line.map_or(true, |min| line_no < min) {
                min_line = Some(line_no);
            }
        }
        if let Some(min_line) = min_line {
            group.append(min_line, OverviewKind::AstCall, GraphObj::AstCall(id));
        }

        for &channel in &acall.channel_set {
            self.add_channel(group, channel, level + 1);
        }

        let mut sip_set = acall.sip_set.clone();
        for call_id in &acall.call_id_set {
            if let Some(list) = parser.call_sip_map.get(call_id) {
                for &sip in list {
                    if !sip_set.contains(&sip) {
                        sip_set.push(sip);
                    }
                }
            }
        }
        for sip in self.include_dialog_sips(sip_set) {
            self.add_sip(group, sip, level + 1);
        }
    }

    fn add_channel(&mut self, group: &mut LogGroup, id: ChannelId, level: usize) {
        if level > self.max_depth || self.mark_channel.contains(&id) {
            return;
        }
        self.mark_channel.insert(id);
        let parser = self.parser;
        let channel = parser.channel(id);

        let mut min_line = None;
        for &(line_no, line) in &channel.lines {
            group.line(line_no, LineEntry::Channel(line));
            if min_line.map_or(true, |min| line_no < min) {
                min_line = Some(line_no);
            }
        }
        if let Some(min_line) = min_line {
            group.append(min_line, OverviewKind::Channel, GraphObj::Channel(id));
        }

        for &acall in &channel.acall_set {
            self.add_acall(group, Some(acall), level + 1);
        }

        let mut sips = channel.sip_set.clone();
        sips.sort_by_key(|&sip| parser.sip(sip).line_no);
        for sip in sips {
            self.add_sip(group, sip, level + 1);
        }
    }
}

impl LogParser {
    /// Collect every object and source line reachable from `reference` by
    /// call-flow relationships.
    ///
    /// Each seed (dialog message, associated channel, queue, exact channel
    /// name, call-id) roots its own group; groups that collect nothing are
    /// dropped. With `isolate` given, only the group containing the matching
    /// overview entry survives.
    pub fn get_linked_objects(
        &self,
        reference: &[u8],
        isolate: Option<(RefKind, &[u8])>,
    ) -> (Vec<LogGroup>, HashMap<usize, LineEntry>) {
        self.linked_objects_with_depth(reference, isolate, MAX_DEPTH)
    }

    /// [`LogParser::get_linked_objects`] with an explicit recursion bound.
    pub fn linked_objects_with_depth(
        &self,
        reference: &[u8],
        isolate: Option<(RefKind, &[u8])>,
        max_depth: usize,
    ) -> (Vec<LogGroup>, HashMap<usize, LineEntry>) {
        debug!(
            reference = %String::from_utf8_lossy(reference),
            max_depth,
            "collecting linked objects"
        );
        let mut traversal = Traversal::new(self, max_depth);
        let mut groups: Vec<LogGroup> = Vec::new();

        // SIP messages addressed from or to the reference, whole dialogs.
        if let Some(sip_list) = self.phone_sip_map.get(reference) {
            for sip in traversal.include_dialog_sips(sip_list.clone()) {
                let mut group = LogGroup::default();
                traversal.add_sip(&mut group, sip, 0);
                groups.push(group);
            }
        }

        // Channels the phone maps to, ordered by (when, name).
        if let Some(channels) = self.phone_channel_map.get(reference) {
            let mut channels = channels.clone();
            channels.sort_by_key(|&id| {
                let channel = self.channel(id);
                (
                    channel.when.map(|range| range.slice(self.data()).to_vec()),
                    channel.name.clone(),
                )
            });
            for channel in channels {
                let mut group = LogGroup::default();
                traversal.add_channel(&mut group, channel, 0);
                groups.push(group);
            }
        }

        // Queues carrying the reference as their name.
        if let Some(queue_apps) = self.queues.get(reference) {
            for &app_id in queue_apps {
                let mut group = LogGroup::default();
                let channel = self.app(app_id).channel();
                traversal.add_channel(&mut group, channel, 0);
                groups.push(group);
            }
        }

        // The channel with exactly that name.
        if let Some(channel) = self.channel_by_name(reference) {
            let mut group = LogGroup::default();
            traversal.add_channel(&mut group, channel, 0);
            groups.push(group);
        }

        // The first message of the call-id.
        if let Some(&sip) = self.call_sip_map.get(reference).and_then(|list| list.first()) {
            let mut group = LogGroup::default();
            traversal.add_sip(&mut group, sip, 0);
            groups.push(group);
        }

        let groups = self.isolate_groups(groups, isolate);
        let mut objects = HashMap::new();
        for group in &groups {
            for (&line_no, &entry) in &group.lines {
                objects.insert(line_no, entry);
            }
        }
        (groups, objects)
    }

    fn isolate_groups(
        &self,
        groups: Vec<LogGroup>,
        isolate: Option<(RefKind, &[u8])>,
    ) -> Vec<LogGroup> {
        let mut groups: Vec<LogGroup> = groups
            .into_iter()
            .filter(|group| !group.overview.is_empty())
            .collect();
        for group in &mut groups {
            group.overview.sort_by_key(|entry| entry.line_no);
        }
        groups.sort_by_key(|group| group.overview[0].line_no);

        if let Some((kind, obj_ref)) = isolate {
            let target = match kind {
                RefKind::CallId => self
                    .dialog_by_call_id(obj_ref)
                    .and_then(|d| self.dialog(d).start_sip())
                    .map(|s| (OverviewKind::Dialog, GraphObj::Sip(s))),
                RefKind::SipRef => self.find_sip_by_ref(obj_ref).map(|s| {
                    let start = self
                        .sip(s)
                        .dialog
                        .and_then(|d| self.dialog(d).start_sip())
                        .unwrap_or(s);
                    (OverviewKind::Dialog, GraphObj::Sip(start))
                }),
                RefKind::Chan => self
                    .channel_by_name(obj_ref)
                    .map(|c| (OverviewKind::Channel, GraphObj::Channel(c))),
                RefKind::AcallId => self
                    .acall_by_id(obj_ref)
                    .map(|a| (OverviewKind::AstCall, GraphObj::AstCall(a))),
            };
            if let Some((kind, obj)) = target {
                for group in &groups {
                    if group
                        .overview
                        .iter()
                        .any(|entry| entry.kind == kind && entry.obj == obj)
                    {
                        return vec![group.clone()];
                    }
                }
                return Vec::new();
            }
        }
        groups
    }
}
