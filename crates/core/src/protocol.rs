//! Defines the JSON frame protocol spoken with the query service, and the
//! decoder that turns raw inbound frames into typed [`ProtocolEvent`]s.

use crate::{
    accumulator::ResultItem,
    types::{ConversationId, Mode, Participant, Scope},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Failure to classify an inbound frame. The frame is dropped; processing continues.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
}

/// Frames sent from this client to the service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OutboundFrame {
    /// A user query against the conversation.
    #[serde(rename_all = "camelCase")]
    Query {
        conversation_id: ConversationId,
        caller_id: String,
        text: String,
        scope: Scope,
        mode: Mode,
        /// The caller's last few queries, oldest first.
        prior_queries: Vec<String>,
    },
    /// Asks the service to replay the backlog of an existing conversation.
    #[serde(rename_all = "camelCase")]
    Join {
        conversation_id: ConversationId,
        caller_id: String,
    },
}

impl OutboundFrame {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            OutboundFrame::Query {
                conversation_id, ..
            }
            | OutboundFrame::Join {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

/// `participant-update` actions.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantAction {
    Join,
    Leave,
}

/// Frames as they appear on the wire from the service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum InboundFrame {
    /// A query issued by some participant, echoed to everyone in the conversation.
    #[serde(rename_all = "camelCase")]
    UserEcho { text: String, caller_id: String },
    /// One partial result for the currently streaming block.
    ResultItem {
        #[serde(default)]
        score: Option<f64>,
        #[serde(default)]
        payload: Value,
    },
    /// Opens the response block for a query.
    BlockBegin {
        #[serde(default)]
        query: Option<String>,
    },
    /// Closes the current response block.
    BlockEnd {},
    /// Every domain consulted for the current block has answered.
    MultiDomainComplete {},
    /// Starts a backlog replay for a joined conversation.
    HistoryBegin {
        #[serde(default)]
        count: Option<u32>,
    },
    /// One backlog frame, wrapping the frame as it was originally streamed.
    HistoryItem { frame: Box<InboundFrame> },
    /// Ends the backlog replay.
    HistoryEnd {},
    /// Someone joined or left the conversation.
    ParticipantUpdate {
        action: ParticipantAction,
        participant: Participant,
    },
    /// The scopes the service can answer for.
    SitesAvailable {
        #[serde(rename = "list")]
        sites: Vec<String>,
    },
    /// A failure reported by the peer inside the stream.
    Error { reason: String },
    /// Any kind this client does not know about yet.
    #[serde(other)]
    Unrecognized,
}

/// A decoded inbound frame. One event per frame, never split or merged.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    UserEcho { text: String, caller_id: String },
    ResultItem(ResultItem),
    BlockBegin { query: Option<String> },
    BlockEnd,
    MultiDomainComplete,
    HistoryBegin { expected: Option<u32> },
    HistoryItem(Box<ProtocolEvent>),
    HistoryEnd,
    ParticipantJoin(Participant),
    ParticipantLeave(Participant),
    SitesAvailable(Vec<String>),
    Error { reason: String },
    Unrecognized,
}

impl ProtocolEvent {
    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolEvent::UserEcho { .. } => "user-echo",
            ProtocolEvent::ResultItem(_) => "result-item",
            ProtocolEvent::BlockBegin { .. } => "block-begin",
            ProtocolEvent::BlockEnd => "block-end",
            ProtocolEvent::MultiDomainComplete => "multi-domain-complete",
            ProtocolEvent::HistoryBegin { .. } => "history-begin",
            ProtocolEvent::HistoryItem(_) => "history-item",
            ProtocolEvent::HistoryEnd => "history-end",
            ProtocolEvent::ParticipantJoin(_) | ProtocolEvent::ParticipantLeave(_) => {
                "participant-update"
            }
            ProtocolEvent::SitesAvailable(_) => "sites-available",
            ProtocolEvent::Error { .. } => "error",
            ProtocolEvent::Unrecognized => "unrecognized",
        }
    }
}

impl From<InboundFrame> for ProtocolEvent {
    fn from(frame: InboundFrame) -> Self {
        match frame {
            InboundFrame::UserEcho { text, caller_id } => ProtocolEvent::UserEcho { text, caller_id },
            InboundFrame::ResultItem { score, payload } => {
                ProtocolEvent::ResultItem(ResultItem { score, payload })
            }
            InboundFrame::BlockBegin { query } => ProtocolEvent::BlockBegin { query },
            InboundFrame::BlockEnd {} => ProtocolEvent::BlockEnd,
            InboundFrame::MultiDomainComplete {} => ProtocolEvent::MultiDomainComplete,
            InboundFrame::HistoryBegin { count } => ProtocolEvent::HistoryBegin { expected: count },
            InboundFrame::HistoryItem { frame } => {
                ProtocolEvent::HistoryItem(Box::new(ProtocolEvent::from(*frame)))
            }
            InboundFrame::HistoryEnd {} => ProtocolEvent::HistoryEnd,
            InboundFrame::ParticipantUpdate {
                action: ParticipantAction::Join,
                participant,
            } => ProtocolEvent::ParticipantJoin(participant),
            InboundFrame::ParticipantUpdate {
                action: ParticipantAction::Leave,
                participant,
            } => ProtocolEvent::ParticipantLeave(participant),
            InboundFrame::SitesAvailable { sites } => ProtocolEvent::SitesAvailable(sites),
            InboundFrame::Error { reason } => ProtocolEvent::Error { reason },
            InboundFrame::Unrecognized => ProtocolEvent::Unrecognized,
        }
    }
}

/// Classifies one raw inbound frame.
pub fn decode(raw: &str) -> Result<ProtocolEvent, DecodeError> {
    let frame: InboundFrame = serde_json::from_str(raw)?;
    Ok(frame.into())
}

/// Encodes a peer failure the way the service would have sent it. Used when a
/// push stream dies so the failure is logged and replayed like any other frame.
pub fn encode_peer_error(reason: &str) -> serde_json::Result<String> {
    serde_json::to_string(&InboundFrame::Error {
        reason: reason.to_string(),
    })
}
