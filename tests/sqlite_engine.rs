mod common;

use std::sync::Arc;

use batch_stats::{
    BatchCounters, BatchStatus, BatchStore, Channel, ConsistencyAuditor, EngineConfig,
    EngineMetrics, MessageStatus, MessageStore, ProcessOutcome, SqliteStore, StatusChangeEvent,
    StatusEventProcessor, StatusUpdate, UnixTimeMs,
};
use common::{fast_config, ground_truth, new_batch};
use tempfile::tempdir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn events_on_a_file_backed_store() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("send_records.db");
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let metrics = Arc::new(EngineMetrics::new());
    let processor = Arc::new(StatusEventProcessor::new(
        store.clone(),
        metrics.clone(),
        fast_config(),
    ));

    // 1. Seed a batch of twelve
    let (batch, messages) = store.create_batch(new_batch(Channel::Line, 12)).await.unwrap();
    assert!(batch.batch_name.as_deref().unwrap().starts_with("line_batch_"));

    // 2. Deliver concurrently: every third message fails
    let mut handles = Vec::new();
    for (i, message) in messages.iter().enumerate() {
        let processor = processor.clone();
        let id = message.id;
        handles.push(tokio::spawn(async move {
            processor
                .handle(StatusChangeEvent::new(id, MessageStatus::Sending))
                .await
                .unwrap();
            let event = if i % 3 == 0 {
                StatusChangeEvent::failed(id, "invalid address")
            } else {
                StatusChangeEvent::new(id, MessageStatus::Success)
            };
            processor.handle(event).await.unwrap()
        }));
    }
    for handle in handles {
        assert!(matches!(handle.await.unwrap(), ProcessOutcome::Applied { .. }));
    }

    let record = store.read_batch(&batch.batch_id).await.unwrap().unwrap();
    assert_eq!(record.counters, BatchCounters { success: 8, failed: 4, pending: 0 });
    assert_eq!(record.status, BatchStatus::Completed);
    assert_eq!(record.counters, ground_truth(&*store, &batch.batch_id).await);

    let failed = store.read_message(messages[0].id).await.unwrap().unwrap();
    assert_eq!(failed.error_message.as_deref(), Some("invalid address"));
    let delivered = store.read_message(messages[1].id).await.unwrap().unwrap();
    assert!(delivered.sent_at.is_some());

    // 3. State survives a reopen
    drop(processor);
    drop(store);
    let reopened = SqliteStore::open(&path).unwrap();
    let again = reopened.read_batch(&batch.batch_id).await.unwrap().unwrap();
    assert_eq!(again.counters, record.counters);
    assert_eq!(again.version, record.version);
}

#[tokio::test]
async fn auditor_repairs_a_stale_sqlite_aggregate() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("audit.db")).unwrap());
    let (batch, messages) = store.create_batch(new_batch(Channel::Sms, 4)).await.unwrap();

    // Message rows move but nobody updates the aggregate.
    let now = UnixTimeMs::now();
    for message in &messages[..2] {
        for (from, to) in [
            (MessageStatus::Pending, MessageStatus::Sending),
            (MessageStatus::Sending, MessageStatus::Success),
        ] {
            assert!(store
                .transition_status(message.id, from, StatusUpdate::new(to, now))
                .await
                .unwrap());
        }
    }

    let metrics = Arc::new(EngineMetrics::new());
    let config = EngineConfig {
        fallback_backoff_ms: 1,
        ..EngineConfig::default()
    };
    let auditor = ConsistencyAuditor::new(store.clone(), metrics.clone(), config);
    let report = auditor.sweep().await.unwrap();

    assert_eq!(report.scanned, 1);
    assert_eq!(report.repaired, 1);
    assert_eq!(report.drifts[0].magnitude(), 2);

    let record = store.read_batch(&batch.batch_id).await.unwrap().unwrap();
    assert_eq!(record.counters, BatchCounters { success: 2, failed: 0, pending: 2 });
    assert_eq!(record.status, BatchStatus::Processing);
    assert_eq!(metrics.snapshot().audit_repair, 1);
}

#[tokio::test]
async fn malformed_row_does_not_stop_the_audit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("legacy.db");
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let (batch, messages) = store.create_batch(new_batch(Channel::Email, 2)).await.unwrap();

    // 1. Both messages delivered, aggregate never told
    let now = UnixTimeMs::now();
    for message in &messages {
        for (from, to) in [
            (MessageStatus::Pending, MessageStatus::Sending),
            (MessageStatus::Sending, MessageStatus::Success),
        ] {
            assert!(store
                .transition_status(message.id, from, StatusUpdate::new(to, now))
                .await
                .unwrap());
        }
    }

    // 2. A row left behind by an older writer, keyed by something other than a uuid
    rusqlite::Connection::open(&path)
        .unwrap()
        .execute(
            "INSERT INTO batch_send_records
                 (batch_id, total_count, pending_count, created_at, updated_at)
             VALUES ('legacy-42', 1, 1, 0, 0)",
            [],
        )
        .unwrap();

    // 3. The sweep still reaches and repairs the real batch
    let metrics = Arc::new(EngineMetrics::new());
    let auditor = ConsistencyAuditor::new(store.clone(), metrics.clone(), fast_config());
    let report = auditor.sweep().await.unwrap();

    assert_eq!(report.scanned, 1);
    assert_eq!(report.repaired, 1);
    let record = store.read_batch(&batch.batch_id).await.unwrap().unwrap();
    assert_eq!(record.counters, BatchCounters { success: 2, failed: 0, pending: 0 });
    assert_eq!(record.status, BatchStatus::Completed);
}
