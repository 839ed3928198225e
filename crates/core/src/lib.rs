pub mod accumulator;
pub mod backoff;
pub mod conversation;
pub mod events;
pub mod machine;
pub mod protocol;
pub mod types;

pub use accumulator::{RankedItem, ResponseBlock, ResultItem};
pub use conversation::{ConversationSnapshot, Direction, LogEntry, TranscriptEntry};
pub use events::PresentationEvent;
pub use machine::{
    ConversationMeta, CoreError, Effect, PendingRequest, SessionMachine, SessionSnapshot,
    SessionState,
};
pub use protocol::{OutboundFrame, ProtocolEvent};
pub use types::{ConversationId, Mode, Participant, Scope};
