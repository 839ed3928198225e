//! Replayable conversation state.
//!
//! [`Conversation`] is everything a stored log can rebuild: the transcript of
//! queries and closed blocks, the block currently streaming, the participant
//! roster and the available sites. Live frames and replayed log entries go
//! through the same `apply_*` handlers, which is what makes a reloaded
//! conversation identical to one that was watched live.
//!
//! Log units: a block's frames are written as one unit when the block closes
//! and a backlog's frames as one unit when it ends. The closing `block-end` /
//! `history-end` frames are implied by the unit boundary and not stored. Every
//! other logged frame is its own unit. Transcript entries are appended exactly
//! when their unit is handed out for persistence, so log order and transcript
//! order always agree.

use crate::{
    accumulator::{ResponseBlock, ResultItem},
    events::PresentationEvent,
    protocol::{self, OutboundFrame, ProtocolEvent},
    types::Participant,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

/// How many of the caller's own queries travel with each new query.
pub const PRIOR_QUERY_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// One frame as it is written to the conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub received_at: DateTime<Utc>,
    pub direction: Direction,
    pub frame: String,
}

impl LogEntry {
    pub fn incoming(frame: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            received_at,
            direction: Direction::Incoming,
            frame: frame.into(),
        }
    }

    pub fn outgoing(frame: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            received_at,
            direction: Direction::Outgoing,
            frame: frame.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEntry {
    Query {
        text: String,
        caller_id: String,
        own: bool,
        at: DateTime<Utc>,
    },
    Block(ResponseBlock),
}

/// Side effects collected while applying frames.
#[derive(Debug, Default)]
pub struct Outcome {
    pub emitted: Vec<PresentationEvent>,
    /// Log units ready to be appended, in order.
    pub units: Vec<Vec<LogEntry>>,
}

/// Ordered queries and closed blocks, plus the block still streaming.
#[derive(Debug, Clone, Default)]
struct Transcript {
    entries: Vec<TranscriptEntry>,
    open: Option<ResponseBlock>,
    next_seq: u64,
}

impl Transcript {
    fn push_query(
        &mut self,
        text: String,
        caller_id: String,
        own: bool,
        at: DateTime<Utc>,
        out: &mut Vec<PresentationEvent>,
    ) {
        out.push(PresentationEvent::QueryEcho {
            text: text.clone(),
            caller_id: caller_id.clone(),
            own,
        });
        self.entries.push(TranscriptEntry::Query {
            text,
            caller_id,
            own,
            at,
        });
    }

    fn last_query(&self) -> Option<String> {
        self.entries.iter().rev().find_map(|entry| match entry {
            TranscriptEntry::Query { text, .. } => Some(text.clone()),
            TranscriptEntry::Block(_) => None,
        })
    }

    /// Opens a new block, force-closing a dangling one first.
    fn begin(
        &mut self,
        query: Option<String>,
        at: DateTime<Utc>,
        out: &mut Vec<PresentationEvent>,
    ) {
        self.close_open(out);
        let seq = self.next_seq;
        self.next_seq += 1;
        out.push(PresentationEvent::BlockStarted {
            seq,
            query: query.clone(),
        });
        self.open = Some(ResponseBlock::open(seq, at, query));
    }

    fn add_item(&mut self, item: ResultItem, at: DateTime<Utc>, out: &mut Vec<PresentationEvent>) {
        if self.open.is_none() {
            debug!("result-item without block-begin; opening a block implicitly");
            let query = self.last_query();
            self.begin(query, at, out);
        }
        if let Some(block) = self.open.as_mut() {
            let (item, best) = block.add_item(item);
            out.push(PresentationEvent::ItemReceived {
                seq: block.seq,
                item,
                best,
            });
        }
    }

    fn mark_domains_complete(&mut self, out: &mut Vec<PresentationEvent>) -> bool {
        match self.open.as_mut() {
            Some(block) => {
                block.domains_complete = true;
                out.push(PresentationEvent::DomainsComplete { seq: block.seq });
                true
            }
            None => false,
        }
    }

    /// Records a peer failure, ending the open block early if there is one.
    fn fail(&mut self, reason: String, out: &mut Vec<PresentationEvent>) -> bool {
        out.push(PresentationEvent::Failure {
            reason: reason.clone(),
        });
        match self.open.as_mut() {
            Some(block) => {
                block.failure = Some(reason);
                self.close_open(out)
            }
            None => false,
        }
    }

    /// Finalizes the open block with whatever it holds and appends it.
    fn close_open(&mut self, out: &mut Vec<PresentationEvent>) -> bool {
        let Some(mut block) = self.open.take() else {
            return false;
        };
        block.finalize();
        if block.is_empty() {
            if block.failure.is_none() {
                out.push(PresentationEvent::NoResults {
                    seq: block.seq,
                    query: block.originating_query.clone(),
                });
            }
        } else {
            out.push(PresentationEvent::BlockFinalized {
                block: block.clone(),
            });
        }
        self.entries.push(TranscriptEntry::Block(block));
        true
    }
}

/// A backlog being received between `history-begin` and `history-end`.
#[derive(Debug)]
struct Backlog {
    transcript: Transcript,
    unit: Vec<LogEntry>,
}

/// Serializable view of a [`Conversation`]. Two conversations built from the
/// same log serialize to the same bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub entries: Vec<TranscriptEntry>,
    pub open_block: Option<ResponseBlock>,
    pub participants: Vec<Participant>,
    pub sites: Vec<String>,
    pub prior_queries: Vec<String>,
}

#[derive(Debug)]
pub struct Conversation {
    caller_id: String,
    transcript: Transcript,
    /// Frames of the open block, persisted together when it closes.
    block_unit: Vec<LogEntry>,
    backlog: Option<Backlog>,
    /// Backlog units that completed while a live block was open. They are
    /// logged after that block, the order their block numbers were taken in.
    held_units: Vec<Vec<LogEntry>>,
    participants: BTreeMap<String, Participant>,
    sites: Vec<String>,
    prior_queries: VecDeque<String>,
}

impl Conversation {
    pub fn new(caller_id: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            transcript: Transcript::default(),
            block_unit: Vec::new(),
            backlog: None,
            held_units: Vec::new(),
            participants: BTreeMap::new(),
            sites: Vec::new(),
            prior_queries: VecDeque::new(),
        }
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.transcript.entries
    }

    pub fn open_block(&self) -> Option<&ResponseBlock> {
        self.transcript.open.as_ref()
    }

    pub fn has_open_block(&self) -> bool {
        self.transcript.open.is_some()
    }

    pub fn prior_queries(&self) -> Vec<String> {
        self.prior_queries.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            entries: self.transcript.entries.clone(),
            open_block: self.transcript.open.clone(),
            participants: self.participants.values().cloned().collect(),
            sites: self.sites.clone(),
            prior_queries: self.prior_queries(),
        }
    }

    /// Handles a frame this client sent.
    pub fn apply_outgoing(&mut self, entry: &LogEntry, frame: &OutboundFrame, out: &mut Outcome) {
        if let OutboundFrame::Query { text, .. } = frame {
            if self.prior_queries.len() == PRIOR_QUERY_LIMIT {
                self.prior_queries.pop_front();
            }
            self.prior_queries.push_back(text.clone());
            self.transcript.push_query(
                text.clone(),
                self.caller_id.clone(),
                true,
                entry.received_at,
                &mut out.emitted,
            );
        }
        out.units.push(vec![entry.clone()]);
    }

    /// Handles one decoded inbound frame.
    pub fn apply_inbound(&mut self, entry: &LogEntry, event: ProtocolEvent, out: &mut Outcome) {
        let at = entry.received_at;
        match event {
            ProtocolEvent::UserEcho { text, caller_id } => {
                if caller_id == self.caller_id {
                    debug!("dropping echo of our own query");
                    return;
                }
                self.transcript
                    .push_query(text, caller_id, false, at, &mut out.emitted);
                out.units.push(vec![entry.clone()]);
            }
            ProtocolEvent::BlockBegin { query } => {
                if self.close_block(out) {
                    warn!("block-begin arrived while a block was open; closed the dangling block");
                }
                self.transcript.begin(query, at, &mut out.emitted);
                self.block_unit.push(entry.clone());
            }
            ProtocolEvent::ResultItem(item) => {
                self.block_unit.push(entry.clone());
                self.transcript.add_item(item, at, &mut out.emitted);
            }
            ProtocolEvent::MultiDomainComplete => {
                if self.transcript.mark_domains_complete(&mut out.emitted) {
                    self.block_unit.push(entry.clone());
                } else {
                    debug!("multi-domain-complete outside a block; ignored");
                }
            }
            ProtocolEvent::BlockEnd => {
                if !self.close_block(out) {
                    debug!("block-end without an open block; ignored");
                }
            }
            ProtocolEvent::Error { reason } => {
                if self.transcript.open.is_some() {
                    self.block_unit.push(entry.clone());
                    self.transcript.fail(reason, &mut out.emitted);
                    self.push_block_unit(out);
                } else {
                    self.transcript.fail(reason, &mut out.emitted);
                    out.units.push(vec![entry.clone()]);
                }
            }
            ProtocolEvent::HistoryBegin { expected } => {
                if self.backlog.is_some() {
                    warn!("history-begin while a backlog was in progress; restarting backlog");
                }
                debug!(?expected, "receiving conversation backlog");
                self.backlog = Some(Backlog {
                    transcript: Transcript::default(),
                    unit: vec![entry.clone()],
                });
            }
            ProtocolEvent::HistoryItem(inner) => match self.backlog.as_mut() {
                Some(backlog) => {
                    backlog.unit.push(entry.clone());
                    apply_backlog_event(&mut backlog.transcript, &self.caller_id, *inner, at);
                }
                None => warn!("history-item outside a backlog; dropped"),
            },
            ProtocolEvent::HistoryEnd => {
                if !self.finish_backlog(out) {
                    debug!("history-end without history-begin; ignored");
                }
            }
            ProtocolEvent::ParticipantJoin(participant) => {
                self.participants
                    .insert(participant.id.clone(), participant.clone());
                out.emitted
                    .push(PresentationEvent::ParticipantJoined { participant });
                out.units.push(vec![entry.clone()]);
            }
            ProtocolEvent::ParticipantLeave(participant) => {
                self.participants.remove(&participant.id);
                out.emitted
                    .push(PresentationEvent::ParticipantLeft { participant });
                out.units.push(vec![entry.clone()]);
            }
            ProtocolEvent::SitesAvailable(sites) => {
                self.sites = sites.clone();
                out.emitted.push(PresentationEvent::SitesAvailable { sites });
                out.units.push(vec![entry.clone()]);
            }
            ProtocolEvent::Unrecognized => {}
        }
    }

    /// Closes whatever a transport loss or teardown left half-done. The open
    /// block survives as a closed partial block; an unfinished backlog is dropped.
    pub fn interrupt(&mut self, out: &mut Outcome) {
        self.close_block(out);
        if self.backlog.take().is_some() {
            warn!("transport closed mid-backlog; discarding the partial backlog");
        }
    }

    /// Replays one stored unit through the live handlers, then applies the
    /// implied closing marker.
    pub fn replay_unit(&mut self, unit: &[LogEntry], out: &mut Outcome) {
        for entry in unit {
            match entry.direction {
                Direction::Outgoing => {
                    match serde_json::from_str::<OutboundFrame>(&entry.frame) {
                        Ok(frame) => self.apply_outgoing(entry, &frame, out),
                        Err(e) => warn!(error = %e, "skipping unreadable outgoing log entry"),
                    }
                }
                Direction::Incoming => match protocol::decode(&entry.frame) {
                    Ok(event) => self.apply_inbound(entry, event, out),
                    Err(e) => warn!(error = %e, "skipping unreadable incoming log entry"),
                },
            }
        }
        self.close_block(out);
        self.finish_backlog(out);
    }

    fn close_block(&mut self, out: &mut Outcome) -> bool {
        if self.transcript.close_open(&mut out.emitted) {
            self.push_block_unit(out);
            true
        } else {
            false
        }
    }

    fn push_block_unit(&mut self, out: &mut Outcome) {
        out.units.push(std::mem::take(&mut self.block_unit));
        out.units.append(&mut self.held_units);
    }

    fn finish_backlog(&mut self, out: &mut Outcome) -> bool {
        let Some(mut backlog) = self.backlog.take() else {
            return false;
        };
        backlog.transcript.close_open(&mut Vec::new());
        let mut history = backlog.transcript.entries;
        // Block seqs stay unique across history and live blocks.
        for entry in &mut history {
            if let TranscriptEntry::Block(block) = entry {
                block.seq = self.transcript.next_seq;
                self.transcript.next_seq += 1;
            }
        }
        let live = std::mem::take(&mut self.transcript.entries);
        self.transcript.entries = history.iter().cloned().chain(live).collect();
        out.emitted
            .push(PresentationEvent::HistoryLoaded { entries: history });
        if self.transcript.open.is_some() {
            self.held_units.push(backlog.unit);
        } else {
            out.units.push(backlog.unit);
        }
        true
    }
}

/// Applies one backlog frame to the backlog transcript. Backlog presentation is
/// reported once, as a whole, when the backlog ends.
fn apply_backlog_event(
    transcript: &mut Transcript,
    caller_id: &str,
    event: ProtocolEvent,
    at: DateTime<Utc>,
) {
    let mut scratch = Vec::new();
    match event {
        ProtocolEvent::UserEcho {
            text,
            caller_id: sender,
        } => {
            let own = sender == caller_id;
            transcript.push_query(text, sender, own, at, &mut scratch);
        }
        ProtocolEvent::BlockBegin { query } => {
            transcript.begin(query, at, &mut scratch);
        }
        ProtocolEvent::ResultItem(item) => transcript.add_item(item, at, &mut scratch),
        ProtocolEvent::MultiDomainComplete => {
            transcript.mark_domains_complete(&mut scratch);
        }
        ProtocolEvent::BlockEnd => {
            transcript.close_open(&mut scratch);
        }
        ProtocolEvent::Error { reason } => {
            transcript.fail(reason, &mut scratch);
        }
        other => debug!(kind = other.kind(), "ignoring non-transcript frame in backlog"),
    }
}
