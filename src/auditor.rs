//! Periodic sweep that compares stored aggregates with message ground truth
//! and repairs any drift through the recompute path.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::StatsError;
use crate::fallback::RecomputeFallback;
use crate::metrics::{Drift, FallbackTrigger, MetricEvent, MetricsSink};
use crate::model::{BatchCounters, BatchId, UnixTimeMs};
use crate::store::StatsStore;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub scanned: usize,
    pub repaired: usize,
    pub failed: usize,
    pub drifts: Vec<Drift>,
    pub failed_batches: Vec<BatchId>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.repaired == 0 && self.failed == 0
    }
}

pub struct ConsistencyAuditor<S: StatsStore + ?Sized> {
    store: Arc<S>,
    fallback: RecomputeFallback<S>,
    metrics: Arc<dyn MetricsSink>,
    config: EngineConfig,
}

impl<S: StatsStore + ?Sized> ConsistencyAuditor<S> {
    pub fn new(store: Arc<S>, metrics: Arc<dyn MetricsSink>, config: EngineConfig) -> Self {
        let fallback = RecomputeFallback::new(Arc::clone(&store), Arc::clone(&metrics), config.clone());
        Self {
            store,
            fallback,
            metrics,
            config,
        }
    }

    /// Audits every active batch once. A failure on one batch is recorded
    /// and the sweep moves on.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<AuditReport, StatsError> {
        let cutoff = UnixTimeMs::now().saturating_sub(self.config.retention_window());
        let batch_ids = self.store.list_active_batch_ids(cutoff).await?;
        let mut report = AuditReport::default();

        for batch_id in batch_ids {
            report.scanned += 1;
            match self.audit_batch(&batch_id).await {
                Ok(None) => {}
                Ok(Some(drift)) => {
                    report.repaired += 1;
                    report.drifts.push(drift);
                }
                Err(e) => {
                    self.metrics.emit(&MetricEvent::AuditItemFailure { batch_id });
                    warn!(batch_id = %batch_id, error = %e, "audit skipped batch");
                    report.failed += 1;
                    report.failed_batches.push(batch_id);
                }
            }
        }

        debug!(
            scanned = report.scanned,
            repaired = report.repaired,
            failed = report.failed,
            "audit sweep finished"
        );
        Ok(report)
    }

    /// Returns the repaired drift, or `None` when the batch was consistent.
    async fn audit_batch(&self, batch_id: &BatchId) -> Result<Option<Drift>, StatsError> {
        let item_failure = |e: StatsError| StatsError::AuditSweepItemFailure {
            batch_id: *batch_id,
            reason: e.to_string(),
        };

        let Some(record) = self.store.read_batch(batch_id).await.map_err(|e| item_failure(e.into()))? else {
            // Removed after listing.
            return Ok(None);
        };
        let counts = self
            .store
            .count_statuses(batch_id)
            .await
            .map_err(|e| item_failure(e.into()))?;

        let drift = Drift {
            batch_id: *batch_id,
            stored: record.counters,
            actual: BatchCounters::from_status_counts(&counts),
        };
        if drift.is_zero() {
            return Ok(None);
        }

        let repaired = self
            .fallback
            .recompute_with_retry(batch_id, FallbackTrigger::AuditRepair)
            .await
            .map_err(item_failure)?;

        self.metrics.emit(&MetricEvent::AuditRepair(drift));
        info!(
            batch_id = %batch_id,
            old = ?drift.stored,
            new = ?repaired.counters,
            magnitude = drift.magnitude(),
            "repaired drifted batch counters"
        );
        Ok(Some(drift))
    }

    fn next_jitter(&self) -> Option<Duration> {
        if self.config.audit_jitter_ms == 0 {
            return None;
        }
        let ms = rand::thread_rng().gen_range(0..=self.config.audit_jitter_ms);
        Some(Duration::from_millis(ms))
    }
}

impl<S: StatsStore + ?Sized + 'static> ConsistencyAuditor<S> {
    /// Runs sweeps on the configured interval until `shutdown` turns true or
    /// its sender is dropped.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.audit_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = self.config.audit_interval_ms, "consistency auditor started");

            loop {
                if *shutdown.borrow() {
                    break;
                }

                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }

                if let Some(jitter) = self.next_jitter() {
                    tokio::select! {
                        _ = tokio::time::sleep(jitter) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            continue;
                        }
                    }
                }

                match self.sweep().await {
                    Ok(report) if !report.is_clean() => info!(
                        scanned = report.scanned,
                        repaired = report.repaired,
                        failed = report.failed,
                        "audit sweep repaired drift"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "audit sweep could not list batches"),
                }
            }

            info!("consistency auditor stopped");
        })
    }
}
