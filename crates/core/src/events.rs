//! Presentation-neutral events emitted to whoever renders the conversation.

use crate::{
    accumulator::{RankedItem, ResponseBlock},
    conversation::TranscriptEntry,
    machine::SessionState,
    types::{ConversationId, Participant},
};
use serde::{Deserialize, Serialize};

/// What the session tells its observers. Observers never feed anything back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresentationEvent {
    /// A query entered the transcript. `own` is false for other participants' queries.
    QueryEcho {
        text: String,
        caller_id: String,
        own: bool,
    },
    BlockStarted {
        seq: u64,
        query: Option<String>,
    },
    /// A result arrived; `best` marks a new best-so-far.
    ItemReceived {
        seq: u64,
        item: RankedItem,
        best: bool,
    },
    DomainsComplete {
        seq: u64,
    },
    /// A block closed with at least one item, in final ranked order.
    BlockFinalized {
        block: ResponseBlock,
    },
    /// A block closed without any items.
    NoResults {
        seq: u64,
        query: Option<String>,
    },
    /// The peer reported a failure. The session stays up.
    Failure {
        reason: String,
    },
    /// A server-delivered backlog was merged in front of the transcript.
    HistoryLoaded {
        entries: Vec<TranscriptEntry>,
    },
    ParticipantJoined {
        participant: Participant,
    },
    ParticipantLeft {
        participant: Participant,
    },
    SitesAvailable {
        sites: Vec<String>,
    },
    /// The session switched to a new or joined conversation.
    ConversationStarted {
        conversation_id: ConversationId,
    },
    /// A stored conversation finished replaying.
    ConversationLoaded {
        conversation_id: ConversationId,
        entries: usize,
    },
    StateChanged {
        state: SessionState,
    },
    /// Reconnection gave up. Emitted at most once per session.
    ConnectionLost {
        attempts: u32,
    },
}
