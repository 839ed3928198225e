//! Conversation Store Gateway
//!
//! Append-only conversation logs plus a small record per conversation. Logs
//! are written in units: all entries of a unit share a unit number and are
//! stored atomically, and replay hands each unit back as a whole.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chatstream_core::{ConversationId, Effect, LogEntry, Mode, Scope, SessionMachine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("conversation {0} does not exist")]
    UnknownConversation(ConversationId),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

/// The per-conversation record listed by `/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub title: String,
    pub scope: Scope,
    pub mode: Mode,
    pub created_at: DateTime<Utc>,
}

/// A log entry with its position in the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    /// Per-conversation sequence number, gapless from zero.
    pub seq: u64,
    /// Entries sharing a unit number were appended together.
    pub unit: u64,
    pub entry: LogEntry,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Creates the record. Returns `false` if it already existed, in which case
    /// nothing is changed.
    async fn create_conversation(&self, record: &ConversationRecord) -> Result<bool, StoreError>;

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationRecord>, StoreError>;

    /// All conversations, newest first.
    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>, StoreError>;

    /// Appends entries as one unit. Returns the unit number.
    async fn append_unit(
        &self,
        id: &ConversationId,
        entries: &[LogEntry],
    ) -> Result<u64, StoreError>;

    /// Appends a single entry as its own unit.
    async fn append(&self, id: &ConversationId, entry: &LogEntry) -> Result<u64, StoreError> {
        self.append_unit(id, std::slice::from_ref(entry)).await
    }

    /// The whole log in sequence order.
    async fn read_all(&self, id: &ConversationId) -> Result<Vec<StoredEntry>, StoreError>;
}

/// Regroups a log read back from storage into the units it was written as.
pub fn into_units(entries: Vec<StoredEntry>) -> Vec<Vec<LogEntry>> {
    let mut units: Vec<Vec<LogEntry>> = Vec::new();
    let mut current: Option<u64> = None;
    for stored in entries {
        if current != Some(stored.unit) {
            current = Some(stored.unit);
            units.push(Vec::new());
        }
        if let Some(unit) = units.last_mut() {
            unit.push(stored.entry);
        }
    }
    units
}

/// Rebuilds a stored conversation inside `machine`, through the same handlers
/// live frames use. Returns the effects the replay produced.
pub async fn replay(
    store: &dyn ConversationStore,
    id: &ConversationId,
    machine: &mut SessionMachine,
) -> Result<Vec<Effect>, crate::session::SessionError> {
    if store.get_conversation(id).await?.is_none() {
        return Err(StoreError::UnknownConversation(id.clone()).into());
    }
    let units = into_units(store.read_all(id).await?);
    Ok(machine.restore(id.clone(), &units)?)
}
