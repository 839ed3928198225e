//! Data Access Layer
//!
//! SQLite-backed conversation store. Uses `sqlx` with runtime-checked queries
//! and embedded migrations, so no database is needed at build time.

use super::{ConversationRecord, ConversationStore, StoreError, StoredEntry};
use async_trait::async_trait;
use chatstream_core::{ConversationId, Direction, LogEntry, Mode, Scope};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::str::FromStr;
use tracing::{debug, info};

/// A wrapper around the `SqlitePool` providing the conversation store interface.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if needed) the database at `url` and migrates it.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self::new(pool);
        store.run_migrations().await?;
        info!(%url, "conversation store ready");
        Ok(store)
    }

    /// A private in-memory database. One connection, so every query sees the same data.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self::new(pool);
        store.run_migrations().await?;
        Ok(store)
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn format_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{raw}': {e}")))
}

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Incoming => "incoming",
        Direction::Outgoing => "outgoing",
    }
}

fn parse_direction(raw: &str) -> Result<Direction, StoreError> {
    match raw {
        "incoming" => Ok(Direction::Incoming),
        "outgoing" => Ok(Direction::Outgoing),
        other => Err(StoreError::Corrupt(format!("direction '{other}'"))),
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ConversationRecord, StoreError> {
    let mode: String = row.try_get("mode")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(ConversationRecord {
        id: ConversationId::new(row.try_get::<String, _>("id")?),
        title: row.try_get("title")?,
        scope: Scope::new(row.try_get::<String, _>("scope")?),
        mode: mode.parse::<Mode>().map_err(StoreError::Corrupt)?,
        created_at: parse_time(&created_at)?,
    })
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create_conversation(&self, record: &ConversationRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO conversations (id, title, scope, mode, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id.as_str())
        .bind(&record.title)
        .bind(record.scope.as_str())
        .bind(record.mode.to_string())
        .bind(format_time(&record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, title, scope, mode, created_at FROM conversations WHERE id = ?1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, scope, mode, created_at
            FROM conversations
            ORDER BY created_at DESC, rowid DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Allocates the unit and sequence numbers and inserts every entry in a
    /// single transaction.
    async fn append_unit(
        &self,
        id: &ConversationId,
        entries: &[LogEntry],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(String,)> =
            sqlx::query_as("SELECT id FROM conversations WHERE id = ?1")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(StoreError::UnknownConversation(id.clone()));
        }

        let (next_seq, next_unit): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(MAX(seq) + 1, 0), COALESCE(MAX(unit) + 1, 0)
            FROM log_entries
            WHERE conversation_id = ?1
            "#,
        )
        .bind(id.as_str())
        .fetch_one(&mut *tx)
        .await?;

        for (offset, entry) in entries.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO log_entries (conversation_id, seq, unit, direction, received_at, frame)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(id.as_str())
            .bind(next_seq + offset as i64)
            .bind(next_unit)
            .bind(direction_str(entry.direction))
            .bind(format_time(&entry.received_at))
            .bind(&entry.frame)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(conversation_id = %id, unit = next_unit, entries = entries.len(), "appended log unit");
        Ok(next_unit as u64)
    }

    async fn read_all(&self, id: &ConversationId) -> Result<Vec<StoredEntry>, StoreError> {
        if self.get_conversation(id).await?.is_none() {
            return Err(StoreError::UnknownConversation(id.clone()));
        }
        let rows: Vec<(i64, i64, String, String, String)> = sqlx::query_as(
            r#"
            SELECT seq, unit, direction, received_at, frame
            FROM log_entries
            WHERE conversation_id = ?1
            ORDER BY seq ASC
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(seq, unit, direction, received_at, frame)| {
                Ok(StoredEntry {
                    seq: seq as u64,
                    unit: unit as u64,
                    entry: LogEntry {
                        received_at: parse_time(&received_at)?,
                        direction: parse_direction(&direction)?,
                        frame,
                    },
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatstream_core::types::receipt_time;

    fn record(id: &str) -> ConversationRecord {
        ConversationRecord {
            id: ConversationId::new(id),
            title: "find teapots".into(),
            scope: Scope::new("seriouseats"),
            mode: Mode::Summarize,
            created_at: receipt_time(),
        }
    }

    #[tokio::test]
    async fn records_round_trip_and_create_is_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.create_conversation(&record("c1")).await.unwrap());
        assert!(!store.create_conversation(&record("c1")).await.unwrap());

        let loaded = store
            .get_conversation(&ConversationId::new("c1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.scope.as_str(), "seriouseats");
        assert_eq!(loaded.mode, Mode::Summarize);
        assert!(store
            .get_conversation(&ConversationId::new("c2"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn log_preserves_order_units_and_timestamps() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = ConversationId::new("c1");
        store.create_conversation(&record("c1")).await.unwrap();

        let first = LogEntry::outgoing(r#"{"kind":"query"}"#, receipt_time());
        let block = vec![
            LogEntry::incoming(r#"{"kind":"block-begin"}"#, receipt_time()),
            LogEntry::incoming(r#"{"kind":"result-item","score":0.2}"#, receipt_time()),
        ];
        assert_eq!(store.append(&id, &first).await.unwrap(), 0);
        assert_eq!(store.append_unit(&id, &block).await.unwrap(), 1);

        let log = store.read_all(&id).await.unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].entry, first);
        assert_eq!(log[1].entry, block[0]);
        assert_eq!(log[2].entry, block[1]);
        assert_eq!((log[2].seq, log[2].unit), (2, 1));
    }

    #[tokio::test]
    async fn newest_conversation_lists_first() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_conversation(&record("first")).await.unwrap();
        let mut later = record("second");
        later.created_at += chrono::Duration::seconds(5);
        store.create_conversation(&later).await.unwrap();

        let ids: Vec<String> = store
            .list_conversations()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn unknown_conversation_is_rejected() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = ConversationId::new("ghost");
        assert!(matches!(
            store.append(&id, &LogEntry::outgoing("x", receipt_time())).await,
            Err(StoreError::UnknownConversation(_))
        ));
        assert!(matches!(
            store.read_all(&id).await,
            Err(StoreError::UnknownConversation(_))
        ));
    }
}
