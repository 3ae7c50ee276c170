use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

use crate::outbox::{
    InsertMessages, MediumMessage, MessageStatistics, QueryMessages, RemoveMessages, Statistics,
    StoreReceived, UpdateMessages,
};

/// An in-memory outbox for testing or local usage.
///
/// Stores records in a `HashMap` keyed by record id and supports every
/// outbox backend operation. Clones share the same storage; use separate
/// instances for published and received records.
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    messages: Arc<Mutex<HashMap<String, MediumMessage>>>,
}

impl InMemoryOutbox {
    /// Snapshot of one stored record.
    pub async fn get(&self, id: &str) -> Option<MediumMessage> {
        self.messages.lock().await.get(id).cloned()
    }

    /// Every stored record, oldest first.
    pub async fn snapshot(&self) -> Vec<MediumMessage> {
        let mut records: Vec<_> = self.messages.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.added.cmp(&b.added).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Number of stored records, whatever their state.
    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }
}

#[async_trait]
impl InsertMessages for InMemoryOutbox {
    type Error = InMemoryOutboxError;
    type Transaction<'a> = ();

    /// Insert records into the in-memory store.
    ///
    /// The batch is rejected as a whole if any id is already stored.
    async fn insert_messages(
        &self,
        msgs: Vec<MediumMessage>,
        _tx: &mut Self::Transaction<'_>,
    ) -> Result<(), InMemoryOutboxError> {
        let mut messages = self.messages.lock().await;
        if let Some(dup) = msgs.iter().find(|m| messages.contains_key(&m.id)) {
            return Err(InMemoryOutboxError::duplicate(&dup.id));
        }
        for msg in msgs {
            messages.insert(msg.id.clone(), msg);
        }
        Ok(())
    }
}

#[async_trait]
impl StoreReceived for InMemoryOutbox {
    type Error = InMemoryOutboxError;

    async fn store_received(&self, msg: MediumMessage) -> Result<(), InMemoryOutboxError> {
        let mut messages = self.messages.lock().await;
        if messages.contains_key(&msg.id) {
            return Err(InMemoryOutboxError::duplicate(&msg.id));
        }
        messages.insert(msg.id.clone(), msg);
        Ok(())
    }
}

#[async_trait]
impl UpdateMessages for InMemoryOutbox {
    type Error = InMemoryOutboxError;

    async fn update_state(&self, msg: &MediumMessage) -> Result<(), InMemoryOutboxError> {
        let mut messages = self.messages.lock().await;
        let stored = messages
            .get_mut(&msg.id)
            .ok_or_else(|| InMemoryOutboxError::not_found(&msg.id))?;
        *stored = msg.clone();
        Ok(())
    }
}

#[async_trait]
impl QueryMessages for InMemoryOutbox {
    type Error = InMemoryOutboxError;

    /// Due records, ordered by due time and then by insertion time.
    async fn query_due(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<MediumMessage>, InMemoryOutboxError> {
        let messages = self.messages.lock().await;
        let mut due: Vec<_> = messages.values().filter(|m| m.is_due(now)).cloned().collect();
        due.sort_by(|a, b| {
            let a_at = a.next_attempt_at.unwrap_or(a.added);
            let b_at = b.next_attempt_at.unwrap_or(b.added);
            a_at.cmp(&b_at)
                .then(a.added.cmp(&b.added))
                .then_with(|| a.id.cmp(&b.id))
        });
        due.truncate(batch_size);
        Ok(due)
    }
}

#[async_trait]
impl RemoveMessages for InMemoryOutbox {
    type Error = InMemoryOutboxError;

    /// Remove records from the in-memory store by id.
    async fn remove_messages(&self, ids: Vec<String>) -> Result<(), InMemoryOutboxError> {
        let mut messages = self.messages.lock().await;
        for id in ids {
            messages
                .remove(&id)
                .ok_or_else(|| InMemoryOutboxError::not_found(&id))?;
        }
        Ok(())
    }

    async fn remove_expired(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<usize, InMemoryOutboxError> {
        let mut messages = self.messages.lock().await;
        let expired: Vec<String> = messages
            .values()
            .filter(|m| m.is_expired(now))
            .map(|m| m.id.clone())
            .take(batch_size)
            .collect();
        for id in &expired {
            messages.remove(id);
        }
        Ok(expired.len())
    }
}

#[async_trait]
impl MessageStatistics for InMemoryOutbox {
    type Error = InMemoryOutboxError;

    async fn statistics(&self) -> Result<Statistics, InMemoryOutboxError> {
        let messages = self.messages.lock().await;
        let mut stats = Statistics::default();
        for msg in messages.values() {
            stats.count(msg.state);
        }
        Ok(stats)
    }
}

/// Error type for `InMemoryOutbox` operations.
#[derive(Debug)]
pub struct InMemoryOutboxError {
    id: String,
    kind: InMemoryOutboxErrorKind,
}

impl InMemoryOutboxError {
    fn not_found(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            kind: InMemoryOutboxErrorKind::NotFound,
        }
    }

    fn duplicate(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            kind: InMemoryOutboxErrorKind::Duplicate,
        }
    }
}

impl std::fmt::Display for InMemoryOutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryOutboxErrorKind::NotFound => {
                write!(f, "Message {} not found in in-memory driver", self.id)
            }
            InMemoryOutboxErrorKind::Duplicate => {
                write!(f, "Message {} already stored in in-memory driver", self.id)
            }
        }
    }
}

impl std::error::Error for InMemoryOutboxError {}

#[derive(Debug)]
enum InMemoryOutboxErrorKind {
    NotFound,
    Duplicate,
}
