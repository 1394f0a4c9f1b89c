//! Durable store on SQLite.
//!
//! One connection behind a mutex; every async method hops onto the blocking
//! pool so callers never stall the runtime on disk I/O.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, instrument, warn};

use crate::error::StoreError;
use crate::model::{
    BatchCounters, BatchId, BatchRecord, BatchStatus, Channel, MessageId, MessageRecord,
    MessageStatus, NewBatch, StatusCounts, StatusUpdate, UnixTimeMs,
};
use crate::store::{BatchStore, CasOutcome, MessageStore};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS batch_send_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        batch_id TEXT NOT NULL UNIQUE,
        batch_name TEXT,
        total_count INTEGER NOT NULL DEFAULT 0,
        success_count INTEGER NOT NULL DEFAULT 0,
        failed_count INTEGER NOT NULL DEFAULT 0,
        pending_count INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending','processing','completed','failed')),
        version INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        CHECK (success_count + failed_count + pending_count = total_count)
    );

    CREATE INDEX IF NOT EXISTS idx_batch_send_records_status_updated
        ON batch_send_records(status, updated_at);

    CREATE TABLE IF NOT EXISTS message_send_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        batch_id TEXT NOT NULL REFERENCES batch_send_records(batch_id),
        channel TEXT NOT NULL CHECK (channel IN ('line','sms','email')),
        content TEXT NOT NULL,
        recipient_id TEXT NOT NULL,
        recipient_type TEXT NOT NULL DEFAULT 'default',
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending','sending','success','failed')),
        error_message TEXT,
        sent_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_message_send_records_batch_status
        ON message_send_records(batch_id, status);
";

const BATCH_COLUMNS: &str = "id, batch_id, batch_name, total_count, success_count, failed_count,
     pending_count, status, version, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, batch_id, channel, content, recipient_id, recipient_type,
     status, error_message, sent_at, created_at, updated_at";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        // journal_mode returns a row, so it cannot go through execute_batch.
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
        conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(SCHEMA)?;
        debug!(journal_mode = %mode, "sqlite store ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::Storage(format!("connection lock poisoned: {e}")))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Storage(format!("spawn_blocking join failed: {e}")))?
    }

    /// Inserts the batch row and one pending message per recipient in a
    /// single transaction.
    #[instrument(skip(self, batch), fields(batch_id = %batch.batch_id))]
    pub async fn create_batch(
        &self,
        batch: NewBatch,
    ) -> Result<(BatchRecord, Vec<MessageRecord>), StoreError> {
        batch.validate().map_err(StoreError::Validation)?;

        self.run(move |conn| {
            let now = UnixTimeMs::now();
            let total = batch.total_count();
            let name = batch.resolved_name();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            tx.execute(
                "INSERT INTO batch_send_records
                     (batch_id, batch_name, total_count, success_count, failed_count,
                      pending_count, status, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, 0, ?3, 'pending', 0, ?4, ?4)",
                params![batch.batch_id.to_string(), name, total, now.0 as i64],
            )?;
            let seq = tx.last_insert_rowid();

            let mut messages = Vec::with_capacity(batch.recipients.len());
            {
                let mut insert = tx.prepare(
                    "INSERT INTO message_send_records
                         (batch_id, channel, content, recipient_id, recipient_type,
                          status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)",
                )?;
                for recipient in &batch.recipients {
                    insert.execute(params![
                        batch.batch_id.to_string(),
                        batch.channel.as_str(),
                        batch.content,
                        recipient.id,
                        recipient.recipient_type,
                        now.0 as i64,
                    ])?;
                    messages.push(MessageRecord {
                        id: MessageId(tx.last_insert_rowid()),
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
            }
            tx.commit()?;

            let record = BatchRecord {
                batch_id: batch.batch_id,
                seq,
                batch_name: Some(name),
                total_count: total,
                counters: BatchCounters::initial(total),
                status: BatchStatus::Pending,
                version: 0,
                created_at: now,
                updated_at: now,
            };
            Ok((record, messages))
        })
        .await
    }

    /// Sets the batch status to `failed`; later counter writes keep it there.
    pub async fn mark_batch_failed(&self, batch_id: &BatchId) -> Result<(), StoreError> {
        let key = batch_id.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE batch_send_records
                 SET status = 'failed', version = version + 1, updated_at = ?2
                 WHERE batch_id = ?1",
                params![key, UnixTimeMs::now().0 as i64],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(key));
            }
            Ok(())
        })
        .await
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn read_batch_row(row: &Row<'_>) -> rusqlite::Result<Result<BatchRecord, StoreError>> {
    let seq: i64 = row.get(0)?;
    let batch_id: String = row.get(1)?;
    let batch_name: Option<String> = row.get(2)?;
    let total_count: u32 = row.get(3)?;
    let counters = BatchCounters {
        success: row.get(4)?,
        failed: row.get(5)?,
        pending: row.get(6)?,
    };
    let status: String = row.get(7)?;
    let version: i64 = row.get(8)?;
    let created_at: i64 = row.get(9)?;
    let updated_at: i64 = row.get(10)?;

    let corrupted = |reason: String| StoreError::Corrupted {
        id: batch_id.clone(),
        reason,
    };
    let Some(parsed_id) = BatchId::parse(&batch_id) else {
        return Ok(Err(corrupted("batch_id is not a uuid".into())));
    };
    let Some(status) = BatchStatus::parse(&status) else {
        return Ok(Err(corrupted(format!("unknown batch status {status:?}"))));
    };

    Ok(Ok(BatchRecord {
        batch_id: parsed_id,
        seq,
        batch_name,
        total_count,
        counters,
        status,
        version: version as u64,
        created_at: UnixTimeMs(created_at as u64),
        updated_at: UnixTimeMs(updated_at as u64),
    }))
}

fn read_message_row(row: &Row<'_>) -> rusqlite::Result<Result<MessageRecord, StoreError>> {
    let id: i64 = row.get(0)?;
    let batch_id: String = row.get(1)?;
    let channel: String = row.get(2)?;
    let status: String = row.get(6)?;
    let sent_at: Option<i64> = row.get(8)?;
    let created_at: i64 = row.get(9)?;
    let updated_at: i64 = row.get(10)?;

    let corrupted = |reason: String| StoreError::Corrupted {
        id: id.to_string(),
        reason,
    };
    let Some(batch_id) = BatchId::parse(&batch_id) else {
        return Ok(Err(corrupted("batch_id is not a uuid".into())));
    };
    let Some(channel) = Channel::parse(&channel) else {
        return Ok(Err(corrupted(format!("unknown channel {channel:?}"))));
    };
    let Some(status) = MessageStatus::parse(&status) else {
        return Ok(Err(corrupted(format!("unknown message status {status:?}"))));
    };

    Ok(Ok(MessageRecord {
        id: MessageId(id),
        batch_id,
        channel,
        content: row.get(3)?,
        recipient_id: row.get(4)?,
        recipient_type: row.get(5)?,
        status,
        error_message: row.get(7)?,
        sent_at: sent_at.map(|t| UnixTimeMs(t as u64)),
        created_at: UnixTimeMs(created_at as u64),
        updated_at: UnixTimeMs(updated_at as u64),
    }))
}

fn select_batch(conn: &Connection, key: &str) -> Result<Option<BatchRecord>, StoreError> {
    conn.query_row(
        &format!("SELECT {BATCH_COLUMNS} FROM batch_send_records WHERE batch_id = ?1"),
        params![key],
        read_batch_row,
    )
    .optional()?
    .transpose()
}

/// Writes the counters and the status they imply; the version check is
/// skipped when `expected_version` is `None`.
fn write_counters(
    conn: &mut Connection,
    batch_id: &BatchId,
    counters: BatchCounters,
    expected_version: Option<u64>,
) -> Result<CasOutcome, StoreError> {
    let key = batch_id.to_string();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let current = select_batch(&tx, &key)?.ok_or_else(|| StoreError::NotFound(key.clone()))?;

    if let Some(expected) = expected_version {
        if current.version != expected {
            return Ok(CasOutcome::Conflict {
                current_version: current.version,
            });
        }
    }

    let next = current.advanced(counters, UnixTimeMs::now());
    if let Some(reason) = next.sum_violation() {
        return Err(StoreError::InvariantViolation(reason));
    }
    let changed = tx.execute(
        "UPDATE batch_send_records
         SET success_count = ?1, failed_count = ?2, pending_count = ?3,
             status = ?4, version = ?5, updated_at = ?6
         WHERE batch_id = ?7 AND version = ?8",
        params![
            next.counters.success,
            next.counters.failed,
            next.counters.pending,
            next.status.as_str(),
            next.version as i64,
            next.updated_at.0 as i64,
            key,
            current.version as i64,
        ],
    )?;
    if changed == 0 {
        // Another process slipped in between the read and the update.
        return Ok(CasOutcome::Conflict {
            current_version: current.version + 1,
        });
    }
    tx.commit()?;
    Ok(CasOutcome::Applied(next))
}

// ============================================================================
// Store traits
// ============================================================================

#[async_trait]
impl BatchStore for SqliteStore {
    async fn read_batch(&self, batch_id: &BatchId) -> Result<Option<BatchRecord>, StoreError> {
        let key = batch_id.to_string();
        self.run(move |conn| select_batch(conn, &key)).await
    }

    async fn conditional_write(
        &self,
        batch_id: &BatchId,
        counters: BatchCounters,
        expected_version: u64,
    ) -> Result<CasOutcome, StoreError> {
        let batch_id = *batch_id;
        self.run(move |conn| write_counters(conn, &batch_id, counters, Some(expected_version)))
            .await
    }

    async fn unconditional_write(
        &self,
        batch_id: &BatchId,
        counters: BatchCounters,
    ) -> Result<BatchRecord, StoreError> {
        let batch_id = *batch_id;
        self.run(move |conn| match write_counters(conn, &batch_id, counters, None)? {
            CasOutcome::Applied(record) => Ok(record),
            CasOutcome::Conflict { .. } => Err(StoreError::Storage(format!(
                "batch {batch_id} changed during an unconditional write"
            ))),
        })
        .await
    }

    async fn list_active_batch_ids(
        &self,
        retired_before: UnixTimeMs,
    ) -> Result<Vec<BatchId>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT batch_id FROM batch_send_records
                 WHERE NOT (status IN ('completed', 'failed') AND updated_at < ?1)
                 ORDER BY id",
            )?;
            let keys = stmt
                .query_map(params![retired_before.0 as i64], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            // A row with an unreadable key is skipped so the rest still get audited.
            Ok(keys
                .into_iter()
                .filter_map(|key| {
                    let id = BatchId::parse(&key);
                    if id.is_none() {
                        warn!(batch_id = %key, "skipping batch row with a malformed id");
                    }
                    id
                })
                .collect())
        })
        .await
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn read_message(&self, id: MessageId) -> Result<Option<MessageRecord>, StoreError> {
        self.run(move |conn| {
            conn.query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM message_send_records WHERE id = ?1"),
                params![id.0],
                read_message_row,
            )
            .optional()?
            .transpose()
        })
        .await
    }

    async fn read_messages_by_batch(
        &self,
        batch_id: &BatchId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let key = batch_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM message_send_records
                 WHERE batch_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(params![key], read_message_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().collect()
        })
        .await
    }

    async fn count_statuses(&self, batch_id: &BatchId) -> Result<StatusCounts, StoreError> {
        let key = batch_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM message_send_records
                 WHERE batch_id = ?1 GROUP BY status",
            )?;
            let rows = stmt
                .query_map(params![key], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut counts = StatusCounts::default();
            for (status, n) in rows {
                match MessageStatus::parse(&status) {
                    Some(MessageStatus::Pending) => counts.pending = n,
                    Some(MessageStatus::Sending) => counts.sending = n,
                    Some(MessageStatus::Success) => counts.success = n,
                    Some(MessageStatus::Failed) => counts.failed = n,
                    None => {
                        return Err(StoreError::Corrupted {
                            id: key.clone(),
                            reason: format!("unknown message status {status:?}"),
                        })
                    }
                }
            }
            Ok(counts)
        })
        .await
    }

    async fn transition_status(
        &self,
        id: MessageId,
        expected: MessageStatus,
        update: StatusUpdate,
    ) -> Result<bool, StoreError> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE message_send_records
                 SET status = ?1,
                     updated_at = ?2,
                     sent_at = CASE WHEN ?1 = 'success' THEN ?2 ELSE sent_at END,
                     error_message = CASE ?1
                         WHEN 'success' THEN NULL
                         WHEN 'failed' THEN ?3
                         ELSE error_message END
                 WHERE id = ?4 AND status = ?5",
                params![
                    update.status.as_str(),
                    update.at.0 as i64,
                    update.error_message,
                    id.0,
                    expected.as_str(),
                ],
            )?;
            if changed > 0 {
                return Ok(true);
            }

            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM message_send_records WHERE id = ?1",
                    params![id.0],
                    |r| r.get(0),
                )
                .optional()?;
            match exists {
                Some(_) => Ok(false),
                None => Err(StoreError::NotFound(id.to_string())),
            }
        })
        .await
    }
}
