//! In-process store for tests and throwaway sessions.

use super::{ConversationRecord, ConversationStore, StoreError, StoredEntry};
use async_trait::async_trait;
use chatstream_core::{ConversationId, LogEntry};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    /// Records in creation order.
    records: Vec<ConversationRecord>,
    logs: HashMap<ConversationId, Log>,
}

#[derive(Debug, Default)]
struct Log {
    entries: Vec<StoredEntry>,
    next_unit: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_conversation(&self, record: &ConversationRecord) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.logs.contains_key(&record.id) {
            return Ok(false);
        }
        inner.logs.insert(record.id.clone(), Log::default());
        inner.records.push(record.clone());
        Ok(true)
    }

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.records.iter().find(|r| &r.id == id).cloned())
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut records = inner.records.clone();
        records.reverse();
        // Stable, so equal timestamps keep newest-created first.
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn append_unit(
        &self,
        id: &ConversationId,
        entries: &[LogEntry],
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let log = inner
            .logs
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownConversation(id.clone()))?;
        let unit = log.next_unit;
        log.next_unit += 1;
        let mut seq = log.entries.len() as u64;
        for entry in entries {
            log.entries.push(StoredEntry {
                seq,
                unit,
                entry: entry.clone(),
            });
            seq += 1;
        }
        Ok(unit)
    }

    async fn read_all(&self, id: &ConversationId) -> Result<Vec<StoredEntry>, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .logs
            .get(id)
            .map(|log| log.entries.clone())
            .ok_or_else(|| StoreError::UnknownConversation(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatstream_core::{Mode, Scope, types::receipt_time};
    use chrono::{Duration, Utc};

    fn record(id: &str, age_secs: i64) -> ConversationRecord {
        ConversationRecord {
            id: ConversationId::new(id),
            title: format!("about {id}"),
            scope: Scope::default(),
            mode: Mode::List,
            created_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let store = MemoryStore::new();
        assert!(store.create_conversation(&record("a", 0)).await.unwrap());
        let mut renamed = record("a", 0);
        renamed.title = "other".into();
        assert!(!store.create_conversation(&renamed).await.unwrap());
        let stored = store
            .get_conversation(&ConversationId::new("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.title, "about a");
    }

    #[tokio::test]
    async fn lists_newest_first() {
        let store = MemoryStore::new();
        store.create_conversation(&record("old", 60)).await.unwrap();
        store.create_conversation(&record("new", 1)).await.unwrap();
        store.create_conversation(&record("mid", 30)).await.unwrap();
        let ids: Vec<String> = store
            .list_conversations()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[tokio::test]
    async fn units_and_sequence_numbers_are_assigned_in_order() {
        let store = MemoryStore::new();
        let id = ConversationId::new("c");
        store.create_conversation(&record("c", 0)).await.unwrap();
        let at = receipt_time();
        store.append(&id, &LogEntry::outgoing("q", at)).await.unwrap();
        let unit = store
            .append_unit(
                &id,
                &[LogEntry::incoming("b", at), LogEntry::incoming("i", at)],
            )
            .await
            .unwrap();
        assert_eq!(unit, 1);

        let log = store.read_all(&id).await.unwrap();
        let positions: Vec<(u64, u64)> = log.iter().map(|s| (s.seq, s.unit)).collect();
        assert_eq!(positions, vec![(0, 0), (1, 1), (2, 1)]);
    }

    #[tokio::test]
    async fn appending_to_an_unknown_conversation_fails() {
        let store = MemoryStore::new();
        let err = store
            .append(&ConversationId::new("nope"), &LogEntry::outgoing("q", receipt_time()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownConversation(_)));
    }
}
