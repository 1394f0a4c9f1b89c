#![allow(dead_code)]

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use batch_stats::{
    BatchCounters, BatchId, BatchRecord, BatchStore, CasOutcome, Channel, EngineConfig,
    MemoryStore, MessageId, MessageRecord, MessageStatus, MessageStore, NewBatch, Recipient,
    StatusCounts, StatusUpdate, StoreError, UnixTimeMs,
};

tokio::task_local! {
    static CONFLICT_PENDING: Cell<bool>;
}

/// Runs `fut` so that its first conditional batch write loses to a phantom
/// concurrent writer.
pub async fn with_forced_conflict<F: std::future::Future>(fut: F) -> F::Output {
    CONFLICT_PENDING.scope(Cell::new(true), fut).await
}

/// Memory store whose conditional writes conflict once per scoped task.
#[derive(Default)]
pub struct ContendedStore {
    pub inner: MemoryStore,
    pub forced_conflicts: AtomicU64,
}

#[async_trait]
impl BatchStore for ContendedStore {
    async fn read_batch(&self, batch_id: &BatchId) -> Result<Option<BatchRecord>, StoreError> {
        self.inner.read_batch(batch_id).await
    }

    async fn conditional_write(
        &self,
        batch_id: &BatchId,
        counters: BatchCounters,
        expected_version: u64,
    ) -> Result<CasOutcome, StoreError> {
        let force = CONFLICT_PENDING
            .try_with(|pending| pending.replace(false))
            .unwrap_or(false);
        if force {
            self.forced_conflicts.fetch_add(1, Ordering::SeqCst);
            return Ok(CasOutcome::Conflict {
                current_version: expected_version + 1,
            });
        }
        self.inner
            .conditional_write(batch_id, counters, expected_version)
            .await
    }

    async fn unconditional_write(
        &self,
        batch_id: &BatchId,
        counters: BatchCounters,
    ) -> Result<BatchRecord, StoreError> {
        self.inner.unconditional_write(batch_id, counters).await
    }

    async fn list_active_batch_ids(
        &self,
        retired_before: UnixTimeMs,
    ) -> Result<Vec<BatchId>, StoreError> {
        self.inner.list_active_batch_ids(retired_before).await
    }
}

#[async_trait]
impl MessageStore for ContendedStore {
    async fn read_message(&self, id: MessageId) -> Result<Option<MessageRecord>, StoreError> {
        self.inner.read_message(id).await
    }

    async fn read_messages_by_batch(
        &self,
        batch_id: &BatchId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        self.inner.read_messages_by_batch(batch_id).await
    }

    async fn count_statuses(&self, batch_id: &BatchId) -> Result<StatusCounts, StoreError> {
        self.inner.count_statuses(batch_id).await
    }

    async fn transition_status(
        &self,
        id: MessageId,
        expected: MessageStatus,
        update: StatusUpdate,
    ) -> Result<bool, StoreError> {
        self.inner.transition_status(id, expected, update).await
    }
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        cas_base_backoff_ms: 1,
        fallback_backoff_ms: 1,
        ..EngineConfig::default()
    }
}

pub fn new_batch(channel: Channel, n: usize) -> NewBatch {
    NewBatch::new(
        channel,
        "Your order has shipped",
        (0..n).map(|i| Recipient::new(format!("user-{i}"))).collect(),
    )
}

/// Counters the batch row should hold given its messages.
pub async fn ground_truth<S: MessageStore + ?Sized>(store: &S, batch_id: &BatchId) -> BatchCounters {
    BatchCounters::from_status_counts(&store.count_statuses(batch_id).await.unwrap())
}
