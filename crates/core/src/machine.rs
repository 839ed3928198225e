//! The session state machine.
//!
//! [`SessionMachine`] is synchronous and owns no I/O. Every input mutates
//! state in one step and returns the [`Effect`]s the runtime must carry out.
//! Nothing here awaits, so a frame is never observed half-applied.

use crate::{
    conversation::{Conversation, ConversationSnapshot, LogEntry, Outcome},
    events::PresentationEvent,
    protocol::{self, OutboundFrame, ProtocolEvent},
    types::{ConversationId, Mode, Scope},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Longest title derived from a conversation's first query.
pub const TITLE_LIMIT: usize = 80;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("session is closed")]
    Closed,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Streaming,
    Reconnecting,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Streaming => "streaming",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A caller request waiting for a channel. Consumed exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub frame: OutboundFrame,
    pub encoded: String,
    pub issued_at: DateTime<Utc>,
}

impl PendingRequest {
    fn new(frame: OutboundFrame, issued_at: DateTime<Utc>) -> Result<Self, CoreError> {
        let encoded = frame.encode()?;
        Ok(Self {
            frame,
            encoded,
            issued_at,
        })
    }

    pub fn is_query(&self) -> bool {
        matches!(self.frame, OutboundFrame::Query { .. })
    }
}

/// Metadata for a conversation record the runtime must make sure exists.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationMeta {
    pub id: ConversationId,
    pub title: String,
    pub scope: Scope,
    pub mode: Mode,
    pub created_at: DateTime<Utc>,
}

/// Work the runtime performs on the machine's behalf, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Create the conversation record unless it already exists.
    EnsureConversation(ConversationMeta),
    /// Append one log unit.
    Persist {
        conversation_id: ConversationId,
        entries: Vec<LogEntry>,
    },
    Emit(PresentationEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub conversation_id: Option<ConversationId>,
    pub conversation: ConversationSnapshot,
}

#[derive(Debug)]
pub struct SessionMachine {
    caller_id: String,
    state: SessionState,
    conversation_id: Option<ConversationId>,
    conversation: Conversation,
    loss_reported: bool,
}

impl SessionMachine {
    pub fn new(caller_id: impl Into<String>) -> Self {
        let caller_id = caller_id.into();
        Self {
            conversation: Conversation::new(caller_id.clone()),
            caller_id,
            state: SessionState::Idle,
            conversation_id: None,
            loss_reported: false,
        }
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            conversation_id: self.conversation_id.clone(),
            conversation: self.conversation.snapshot(),
        }
    }

    // --- Caller commands ---

    /// Issues a query: assigns a conversation id if there is none, logs the
    /// outgoing frame and echoes it, then hands back the request to route.
    pub fn send_query(
        &mut self,
        text: &str,
        scope: Scope,
        mode: Mode,
        at: DateTime<Utc>,
    ) -> Result<(PendingRequest, Vec<Effect>), CoreError> {
        self.ensure_live()?;
        let mut effects = Vec::new();
        let conversation_id = match &self.conversation_id {
            Some(id) => id.clone(),
            None => {
                let id = ConversationId::generate();
                info!(conversation_id = %id, "assigned conversation id");
                self.conversation_id = Some(id.clone());
                effects.push(Effect::EnsureConversation(ConversationMeta {
                    id: id.clone(),
                    title: text.trim().chars().take(TITLE_LIMIT).collect(),
                    scope: scope.clone(),
                    mode,
                    created_at: at,
                }));
                effects.push(Effect::Emit(PresentationEvent::ConversationStarted {
                    conversation_id: id.clone(),
                }));
                id
            }
        };

        let request = PendingRequest::new(
            OutboundFrame::Query {
                conversation_id,
                caller_id: self.caller_id.clone(),
                text: text.to_string(),
                scope,
                mode,
                prior_queries: self.conversation.prior_queries(),
            },
            at,
        )?;
        let entry = LogEntry::outgoing(request.encoded.clone(), at);
        let mut outcome = Outcome::default();
        self.conversation
            .apply_outgoing(&entry, &request.frame, &mut outcome);
        effects.extend(self.settle(outcome));
        Ok((request, effects))
    }

    /// Switches to an existing conversation and asks the peer for its backlog.
    pub fn join(
        &mut self,
        conversation_id: ConversationId,
        at: DateTime<Utc>,
    ) -> Result<(PendingRequest, Vec<Effect>), CoreError> {
        self.ensure_live()?;
        let mut effects = self.switch_to(ConversationMeta {
            id: conversation_id.clone(),
            title: format!("Joined {conversation_id}"),
            scope: Scope::default(),
            mode: Mode::default(),
            created_at: at,
        });
        let request = PendingRequest::new(
            OutboundFrame::Join {
                conversation_id: conversation_id.clone(),
                caller_id: self.caller_id.clone(),
            },
            at,
        )?;
        let entry = LogEntry::outgoing(request.encoded.clone(), at);
        let mut outcome = Outcome::default();
        self.conversation
            .apply_outgoing(&entry, &request.frame, &mut outcome);
        effects.extend(self.settle(outcome));
        Ok((request, effects))
    }

    /// Starts a fresh, empty conversation.
    pub fn create_conversation(&mut self, meta: ConversationMeta) -> Result<Vec<Effect>, CoreError> {
        self.ensure_live()?;
        Ok(self.switch_to(meta))
    }

    /// Rebuilds state from a stored log without touching the network.
    pub fn restore(
        &mut self,
        conversation_id: ConversationId,
        units: &[Vec<LogEntry>],
    ) -> Result<Vec<Effect>, CoreError> {
        self.ensure_live()?;
        let mut effects = self.close_current();
        self.conversation = Conversation::new(self.caller_id.clone());
        self.conversation_id = Some(conversation_id.clone());

        let mut outcome = Outcome::default();
        for unit in units {
            self.conversation.replay_unit(unit, &mut outcome);
        }
        info!(
            conversation_id = %conversation_id,
            units = units.len(),
            "replayed stored conversation"
        );
        effects.extend(outcome.emitted.into_iter().map(Effect::Emit));
        effects.push(Effect::Emit(PresentationEvent::ConversationLoaded {
            conversation_id,
            entries: self.conversation.entries().len(),
        }));
        Ok(effects)
    }

    // --- Transport transitions ---

    pub fn on_connecting(&mut self) -> Vec<Effect> {
        match self.state {
            SessionState::Idle => self.transition(SessionState::Connecting),
            _ => Vec::new(),
        }
    }

    pub fn on_channel_ready(&mut self) -> Vec<Effect> {
        match self.state {
            SessionState::Idle | SessionState::Connecting | SessionState::Reconnecting => {
                self.transition(SessionState::Open)
            }
            _ => Vec::new(),
        }
    }

    /// A query left through the channel; the answer will stream in.
    pub fn on_request_sent(&mut self, request: &PendingRequest) -> Vec<Effect> {
        if request.is_query() && self.state == SessionState::Open {
            self.transition(SessionState::Streaming)
        } else {
            Vec::new()
        }
    }

    /// The duplex channel dropped unexpectedly. A reconnect will follow.
    pub fn on_channel_lost(&mut self) -> Vec<Effect> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        let mut effects = self.close_current();
        effects.extend(self.transition(SessionState::Reconnecting));
        effects
    }

    /// The runtime dropped the channel because it belonged to another
    /// conversation. The next request opens a fresh one.
    pub fn on_channel_closed(&mut self) -> Vec<Effect> {
        match self.state {
            SessionState::Closed | SessionState::Idle => Vec::new(),
            _ => {
                let mut effects = self.close_current();
                effects.extend(self.transition(SessionState::Idle));
                effects
            }
        }
    }

    /// A push stream completed. Whatever block it left open is closed as-is.
    pub fn on_stream_finished(&mut self) -> Vec<Effect> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        let mut effects = self.close_current();
        effects.extend(self.transition(SessionState::Open));
        effects
    }

    /// A push stream failed. Surfaces exactly one peer error, then finishes the stream.
    pub fn on_stream_failed(&mut self, reason: &str, at: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = match protocol::encode_peer_error(reason) {
            Ok(raw) => self.on_frame(&raw, at),
            Err(e) => {
                warn!(error = %e, "could not encode stream failure");
                Vec::new()
            }
        };
        effects.extend(self.on_stream_finished());
        effects
    }

    /// Reconnection gave up. Terminal; reported once.
    pub fn on_connection_lost(&mut self, attempts: u32) -> Vec<Effect> {
        if self.loss_reported {
            return Vec::new();
        }
        self.loss_reported = true;
        let mut effects = self.close_current();
        effects.extend(self.transition(SessionState::Closed));
        effects.push(Effect::Emit(PresentationEvent::ConnectionLost { attempts }));
        effects
    }

    pub fn teardown(&mut self) -> Vec<Effect> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        let mut effects = self.close_current();
        effects.extend(self.transition(SessionState::Closed));
        effects
    }

    // --- Inbound frames ---

    /// Decodes and dispatches one inbound frame according to the current state.
    pub fn on_frame(&mut self, raw: &str, at: DateTime<Utc>) -> Vec<Effect> {
        let event = match protocol::decode(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return Vec::new();
            }
        };
        if event == ProtocolEvent::Unrecognized {
            debug!("dropping frame of unrecognized kind");
            return Vec::new();
        }
        let entry = LogEntry::incoming(raw, at);
        match self.state {
            SessionState::Closed => {
                debug!(kind = event.kind(), "frame after close; dropped");
                Vec::new()
            }
            SessionState::Streaming => self.while_streaming(entry, event),
            SessionState::Idle
            | SessionState::Connecting
            | SessionState::Open
            | SessionState::Reconnecting => self.while_open(entry, event),
        }
    }

    fn while_open(&mut self, entry: LogEntry, event: ProtocolEvent) -> Vec<Effect> {
        let starts_block = matches!(
            event,
            ProtocolEvent::BlockBegin { .. } | ProtocolEvent::ResultItem(_)
        );
        let mut effects = self.apply(entry, event);
        if starts_block && self.state == SessionState::Open {
            effects.extend(self.transition(SessionState::Streaming));
        }
        effects
    }

    fn while_streaming(&mut self, entry: LogEntry, event: ProtocolEvent) -> Vec<Effect> {
        // A stray block-end must not end a request whose block has not begun.
        let ends_request = match event {
            ProtocolEvent::BlockEnd => self.conversation.has_open_block(),
            ProtocolEvent::Error { .. } => true,
            _ => false,
        };
        let mut effects = self.apply(entry, event);
        if ends_request && !self.conversation.has_open_block() {
            effects.extend(self.transition(SessionState::Open));
        }
        effects
    }

    fn apply(&mut self, entry: LogEntry, event: ProtocolEvent) -> Vec<Effect> {
        debug!(kind = event.kind(), state = %self.state, "applying frame");
        let mut outcome = Outcome::default();
        self.conversation.apply_inbound(&entry, event, &mut outcome);
        self.settle(outcome)
    }

    // --- Helpers ---

    fn ensure_live(&self) -> Result<(), CoreError> {
        if self.state == SessionState::Closed {
            Err(CoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn switch_to(&mut self, meta: ConversationMeta) -> Vec<Effect> {
        let mut effects = self.close_current();
        self.conversation = Conversation::new(self.caller_id.clone());
        self.conversation_id = Some(meta.id.clone());
        info!(conversation_id = %meta.id, "switched conversation");
        effects.push(Effect::Emit(PresentationEvent::ConversationStarted {
            conversation_id: meta.id.clone(),
        }));
        effects.insert(0, Effect::EnsureConversation(meta));
        effects
    }

    /// Finalizes whatever the current conversation has in flight.
    fn close_current(&mut self) -> Vec<Effect> {
        let mut outcome = Outcome::default();
        self.conversation.interrupt(&mut outcome);
        self.settle(outcome)
    }

    fn transition(&mut self, next: SessionState) -> Vec<Effect> {
        if self.state == next {
            return Vec::new();
        }
        debug!(from = %self.state, to = %next, "session state change");
        self.state = next;
        vec![Effect::Emit(PresentationEvent::StateChanged { state: next })]
    }

    /// Turns collected outcome into effects: log units first, then presentation.
    fn settle(&self, outcome: Outcome) -> Vec<Effect> {
        let mut effects = Vec::with_capacity(outcome.units.len() + outcome.emitted.len());
        match &self.conversation_id {
            Some(id) => effects.extend(outcome.units.into_iter().map(|entries| Effect::Persist {
                conversation_id: id.clone(),
                entries,
            })),
            None if !outcome.units.is_empty() => {
                debug!("no conversation yet; frames are not logged");
            }
            None => {}
        }
        effects.extend(outcome.emitted.into_iter().map(Effect::Emit));
        effects
    }
}
