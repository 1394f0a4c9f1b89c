//! Deterministic recomputation of a batch aggregate from message ground truth.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::StatsError;
use crate::metrics::{FallbackTrigger, MetricEvent, MetricsSink};
use crate::model::{BatchCounters, BatchId, BatchRecord};
use crate::store::StatsStore;

pub struct RecomputeFallback<S: StatsStore + ?Sized> {
    store: Arc<S>,
    metrics: Arc<dyn MetricsSink>,
    config: EngineConfig,
}

impl<S: StatsStore + ?Sized> Clone for RecomputeFallback<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            metrics: Arc::clone(&self.metrics),
            config: self.config.clone(),
        }
    }
}

impl<S: StatsStore + ?Sized> RecomputeFallback<S> {
    pub fn new(store: Arc<S>, metrics: Arc<dyn MetricsSink>, config: EngineConfig) -> Self {
        Self {
            store,
            metrics,
            config,
        }
    }

    /// One recompute pass: count, overwrite, and re-count until ground truth
    /// holds still across the write.
    ///
    /// The state machine only moves forward, so an unchanged count on both
    /// sides of the write means no transition landed in between and the
    /// written counters are current.
    #[instrument(skip(self), fields(batch_id = %batch_id, trigger = trigger.as_str()))]
    pub async fn recompute(
        &self,
        batch_id: &BatchId,
        trigger: FallbackTrigger,
    ) -> Result<BatchRecord, StatsError> {
        let batch = self
            .store
            .read_batch(batch_id)
            .await?
            .ok_or(StatsError::BatchNotFound(*batch_id))?;

        let mut counts = self.store.count_statuses(batch_id).await?;
        for round in 1..=self.config.fallback_settle_rounds {
            if counts.total() != batch.total_count {
                return Err(StatsError::InvariantViolation(format!(
                    "found {} messages for batch {batch_id}, batch expects {}",
                    counts.total(),
                    batch.total_count
                )));
            }

            let counters = BatchCounters::from_status_counts(&counts);
            let record = self.store.unconditional_write(batch_id, counters).await?;

            let recount = self.store.count_statuses(batch_id).await?;
            if recount == counts {
                debug!(round, version = record.version, "recompute settled");
                return Ok(record);
            }
            debug!(round, "ground truth moved during recompute");
            counts = recount;
        }

        Err(StatsError::RecomputeFailure {
            batch_id: *batch_id,
            reason: format!(
                "ground truth did not settle after {} rounds",
                self.config.fallback_settle_rounds
            ),
        })
    }

    /// Runs [`Self::recompute`] with bounded retries. Errors that another
    /// attempt cannot fix end the loop early.
    ///
    /// Giving up is an operational alert: the batch may keep drifting until
    /// the next audit sweep.
    #[instrument(skip(self), fields(batch_id = %batch_id, trigger = trigger.as_str()))]
    pub async fn recompute_with_retry(
        &self,
        batch_id: &BatchId,
        trigger: FallbackTrigger,
    ) -> Result<BatchRecord, StatsError> {
        self.metrics.emit(&MetricEvent::FallbackInvoked {
            batch_id: *batch_id,
            trigger,
        });

        let attempts = self.config.fallback_max_attempts;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.recompute(batch_id, trigger).await {
                Ok(record) => {
                    info!(attempt, version = record.version, "batch counters recomputed");
                    return Ok(record);
                }
                // Nothing to recompute.
                Err(e @ StatsError::BatchNotFound(_)) => return Err(e),
                Err(e) if !e.is_retryable() => {
                    warn!(attempt, error = %e, "recompute failed permanently");
                    return Err(self.give_up(batch_id, attempt, e.to_string()));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "recompute attempt failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.fallback_backoff(attempt)).await;
                    }
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        Err(self.give_up(batch_id, attempts, reason))
    }

    fn give_up(&self, batch_id: &BatchId, attempts: u32, reason: String) -> StatsError {
        self.metrics.emit(&MetricEvent::FallbackFailed {
            batch_id: *batch_id,
            attempts,
        });
        error!(attempts, %reason, "recompute abandoned, batch may stay inconsistent");
        StatsError::RecomputeFailure {
            batch_id: *batch_id,
            reason,
        }
    }
}
