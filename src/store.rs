use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::model::{
    BatchCounters, BatchId, BatchRecord, BatchStatus, MessageId, MessageRecord, MessageStatus,
    NewBatch, StatusCounts, StatusUpdate, UnixTimeMs,
};

/// Result of a version-gated batch write
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    Applied(BatchRecord),
    Conflict { current_version: u64 },
}

// ============================================================================
// Storage Traits
// ============================================================================

#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn read_batch(&self, batch_id: &BatchId) -> Result<Option<BatchRecord>, StoreError>;

    /// Writes `counters` only if the stored version still equals
    /// `expected_version`; on success the version advances by exactly one.
    async fn conditional_write(
        &self,
        batch_id: &BatchId,
        counters: BatchCounters,
        expected_version: u64,
    ) -> Result<CasOutcome, StoreError>;

    /// Last-writer-wins overwrite. Always advances the version.
    async fn unconditional_write(
        &self,
        batch_id: &BatchId,
        counters: BatchCounters,
    ) -> Result<BatchRecord, StoreError>;

    /// Batches that are not retired. A batch is retired once its status is
    /// terminal and it was last updated before `retired_before`.
    async fn list_active_batch_ids(
        &self,
        retired_before: UnixTimeMs,
    ) -> Result<Vec<BatchId>, StoreError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn read_message(&self, id: MessageId) -> Result<Option<MessageRecord>, StoreError>;

    async fn read_messages_by_batch(
        &self,
        batch_id: &BatchId,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    async fn count_statuses(&self, batch_id: &BatchId) -> Result<StatusCounts, StoreError>;

    /// Moves a message to `update.status` only if it is still in `expected`.
    /// Returns `false` when another writer got there first.
    async fn transition_status(
        &self,
        id: MessageId,
        expected: MessageStatus,
        update: StatusUpdate,
    ) -> Result<bool, StoreError>;
}

/// Both halves of the storage surface the engine needs.
pub trait StatsStore: BatchStore + MessageStore {}

impl<T: BatchStore + MessageStore + ?Sized> StatsStore for T {}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct MemoryState {
    batches: HashMap<BatchId, BatchRecord>,
    messages: HashMap<MessageId, MessageRecord>,
    by_batch: HashMap<BatchId, Vec<MessageId>>,
    next_batch_seq: i64,
    next_message_id: i64,
}

/// Process-local store; every operation is atomic under one lock.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_batch(
        &self,
        batch: NewBatch,
    ) -> Result<(BatchRecord, Vec<MessageRecord>), StoreError> {
        batch.validate().map_err(StoreError::Validation)?;
        let now = UnixTimeMs::now();
        let mut state = self.state.write().await;

        if state.batches.contains_key(&batch.batch_id) {
            return Err(StoreError::Validation(format!(
                "batch {} already exists",
                batch.batch_id
            )));
        }

        state.next_batch_seq += 1;
        let total = batch.total_count();
        let record = BatchRecord {
            batch_id: batch.batch_id,
            seq: state.next_batch_seq,
            batch_name: Some(batch.resolved_name()),
            total_count: total,
            counters: BatchCounters::initial(total),
            status: BatchStatus::Pending,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let mut messages = Vec::with_capacity(batch.recipients.len());
        for recipient in &batch.recipients {
            state.next_message_id += 1;
            messages.push(MessageRecord {
                id: MessageId(state.next_message_id),
                batch_id: batch.batch_id,
                channel: batch.channel,
                content: batch.content.clone(),
                recipient_id: recipient.id.clone(),
                recipient_type: recipient.recipient_type.clone(),
                status: MessageStatus::Pending,
                error_message: None,
                sent_at: None,
                created_at: now,
                updated_at: now,
            });
        }

        state
            .by_batch
            .insert(batch.batch_id, messages.iter().map(|m| m.id).collect());
        for message in &messages {
            state.messages.insert(message.id, message.clone());
        }
        state.batches.insert(batch.batch_id, record.clone());

        Ok((record, messages))
    }

    /// Replaces the stored counters without touching the version; used to
    /// simulate drift. The counters must still sum to the batch total.
    pub async fn overwrite_counters(
        &self,
        batch_id: &BatchId,
        counters: BatchCounters,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let record = state
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::NotFound(batch_id.to_string()))?;
        let next = BatchRecord {
            counters,
            ..record.clone()
        };
        if let Some(reason) = next.sum_violation() {
            return Err(StoreError::InvariantViolation(reason));
        }
        *record = next;
        Ok(())
    }

    pub async fn mark_batch_failed(&self, batch_id: &BatchId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let record = state
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::NotFound(batch_id.to_string()))?;
        record.status = BatchStatus::Failed;
        record.version += 1;
        record.updated_at = UnixTimeMs::now();
        Ok(())
    }

    /// Backdates `updated_at`, for retention tests.
    pub async fn set_batch_updated_at(
        &self,
        batch_id: &BatchId,
        at: UnixTimeMs,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let record = state
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::NotFound(batch_id.to_string()))?;
        record.updated_at = at;
        Ok(())
    }
}

/// Applies a counter write in place, refusing one that breaks the batch total.
fn advance(record: &mut BatchRecord, counters: BatchCounters) -> Result<BatchRecord, StoreError> {
    let next = record.advanced(counters, UnixTimeMs::now());
    if let Some(reason) = next.sum_violation() {
        return Err(StoreError::InvariantViolation(reason));
    }
    *record = next.clone();
    Ok(next)
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn read_batch(&self, batch_id: &BatchId) -> Result<Option<BatchRecord>, StoreError> {
        Ok(self.state.read().await.batches.get(batch_id).cloned())
    }

    async fn conditional_write(
        &self,
        batch_id: &BatchId,
        counters: BatchCounters,
        expected_version: u64,
    ) -> Result<CasOutcome, StoreError> {
        let mut state = self.state.write().await;
        let record = state
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::NotFound(batch_id.to_string()))?;

        if record.version != expected_version {
            return Ok(CasOutcome::Conflict {
                current_version: record.version,
            });
        }

        Ok(CasOutcome::Applied(advance(record, counters)?))
    }

    async fn unconditional_write(
        &self,
        batch_id: &BatchId,
        counters: BatchCounters,
    ) -> Result<BatchRecord, StoreError> {
        let mut state = self.state.write().await;
        let record = state
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::NotFound(batch_id.to_string()))?;

        advance(record, counters)
    }

    async fn list_active_batch_ids(
        &self,
        retired_before: UnixTimeMs,
    ) -> Result<Vec<BatchId>, StoreError> {
        let state = self.state.read().await;
        let mut active: Vec<_> = state
            .batches
            .values()
            .filter(|b| !(b.status.is_terminal() && b.updated_at < retired_before))
            .map(|b| (b.seq, b.batch_id))
            .collect();
        active.sort_unstable();
        Ok(active.into_iter().map(|(_, id)| id).collect())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn read_message(&self, id: MessageId) -> Result<Option<MessageRecord>, StoreError> {
        Ok(self.state.read().await.messages.get(&id).cloned())
    }

    async fn read_messages_by_batch(
        &self,
        batch_id: &BatchId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .by_batch
            .get(batch_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.messages.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count_statuses(&self, batch_id: &BatchId) -> Result<StatusCounts, StoreError> {
        let state = self.state.read().await;
        let mut counts = StatusCounts::default();
        if let Some(ids) = state.by_batch.get(batch_id) {
            for message in ids.iter().filter_map(|id| state.messages.get(id)) {
                counts.record(message.status);
            }
        }
        Ok(counts)
    }

    async fn transition_status(
        &self,
        id: MessageId,
        expected: MessageStatus,
        update: StatusUpdate,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let message = state
            .messages
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if message.status != expected {
            return Ok(false);
        }
        message.apply_update(&update);
        Ok(true)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Channel, Recipient};

    fn batch_of(n: usize) -> NewBatch {
        NewBatch::new(
            Channel::Line,
            "hello",
            (0..n).map(|i| Recipient::new(format!("user-{i}"))).collect(),
        )
    }

    #[tokio::test]
    async fn create_batch_seeds_pending_messages() {
        let store = MemoryStore::new();
        let (record, messages) = store.create_batch(batch_of(3)).await.unwrap();

        assert_eq!(record.total_count, 3);
        assert_eq!(record.counters, BatchCounters::initial(3));
        assert_eq!(record.version, 0);
        assert_eq!(messages.len(), 3);

        let counts = store.count_statuses(&record.batch_id).await.unwrap();
        assert_eq!(counts.pending, 3);
        assert_eq!(
            store.read_messages_by_batch(&record.batch_id).await.unwrap().len(),
            3
        );
    }

    #[tokio::test]
    async fn conditional_write_rejects_stale_version() {
        let store = MemoryStore::new();
        let (record, _) = store.create_batch(batch_of(2)).await.unwrap();
        let next = BatchCounters { success: 1, failed: 0, pending: 1 };

        let first = store
            .conditional_write(&record.batch_id, next, 0)
            .await
            .unwrap();
        assert!(matches!(first, CasOutcome::Applied(ref r) if r.version == 1));

        let second = store
            .conditional_write(&record.batch_id, next, 0)
            .await
            .unwrap();
        assert_eq!(second, CasOutcome::Conflict { current_version: 1 });
    }

    #[tokio::test]
    async fn unconditional_write_always_bumps_version() {
        let store = MemoryStore::new();
        let (record, _) = store.create_batch(batch_of(1)).await.unwrap();
        let counters = BatchCounters::initial(1);

        let a = store.unconditional_write(&record.batch_id, counters).await.unwrap();
        let b = store.unconditional_write(&record.batch_id, counters).await.unwrap();
        assert_eq!(a.version, 1);
        assert_eq!(b.version, 2);
        assert_eq!(a.counters, b.counters);
    }

    #[tokio::test]
    async fn transition_status_is_conditional() {
        let store = MemoryStore::new();
        let (_, messages) = store.create_batch(batch_of(1)).await.unwrap();
        let id = messages[0].id;
        let update = StatusUpdate::new(MessageStatus::Sending, UnixTimeMs::now());

        assert!(store
            .transition_status(id, MessageStatus::Pending, update.clone())
            .await
            .unwrap());
        assert!(!store
            .transition_status(id, MessageStatus::Pending, update)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn retired_batches_are_not_listed() {
        let store = MemoryStore::new();
        let (live, _) = store.create_batch(batch_of(1)).await.unwrap();
        let (old, _) = store.create_batch(batch_of(1)).await.unwrap();

        store
            .unconditional_write(&old.batch_id, BatchCounters { success: 1, failed: 0, pending: 0 })
            .await
            .unwrap();
        store
            .set_batch_updated_at(&old.batch_id, UnixTimeMs(1_000))
            .await
            .unwrap();

        let active = store
            .list_active_batch_ids(UnixTimeMs(5_000))
            .await
            .unwrap();
        assert_eq!(active, vec![live.batch_id]);
    }

    #[tokio::test]
    async fn writes_that_break_the_total_are_refused() {
        let store = MemoryStore::new();
        let (record, _) = store.create_batch(batch_of(3)).await.unwrap();
        let broken = BatchCounters { success: 3, failed: 1, pending: 0 };

        let cas = store.conditional_write(&record.batch_id, broken, 0).await;
        assert!(matches!(cas, Err(StoreError::InvariantViolation(_))));
        let overwrite = store.unconditional_write(&record.batch_id, broken).await;
        assert!(matches!(overwrite, Err(StoreError::InvariantViolation(_))));
        let drift = store.overwrite_counters(&record.batch_id, broken).await;
        assert!(matches!(drift, Err(StoreError::InvariantViolation(_))));

        let stored = store.read_batch(&record.batch_id).await.unwrap().unwrap();
        assert_eq!(stored, record);
        assert!(stored.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn missing_batch_is_not_found() {
        let store = MemoryStore::new();
        let result = store
            .unconditional_write(&BatchId::generate(), BatchCounters::default())
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
