//! Compare-and-swap application of a single message transition to its
//! batch aggregate.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::error::StatsError;
use crate::fallback::RecomputeFallback;
use crate::metrics::{FallbackTrigger, MetricEvent, MetricsSink};
use crate::model::{BatchId, BatchRecord, MessageStatus};
use crate::store::{CasOutcome, StatsStore};
use crate::transition::{self, Transition};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Nothing to write: a repeated status or `pending → sending`.
    Unchanged,
    Applied { record: BatchRecord, attempts: u32 },
    Recomputed {
        record: BatchRecord,
        trigger: FallbackTrigger,
    },
}

impl UpdateOutcome {
    pub fn record(&self) -> Option<&BatchRecord> {
        match self {
            Self::Unchanged => None,
            Self::Applied { record, .. } | Self::Recomputed { record, .. } => Some(record),
        }
    }
}

pub struct OptimisticStatsUpdater<S: StatsStore + ?Sized> {
    store: Arc<S>,
    fallback: RecomputeFallback<S>,
    metrics: Arc<dyn MetricsSink>,
    config: EngineConfig,
}

impl<S: StatsStore + ?Sized> OptimisticStatsUpdater<S> {
    pub fn new(store: Arc<S>, metrics: Arc<dyn MetricsSink>, config: EngineConfig) -> Self {
        let fallback = RecomputeFallback::new(Arc::clone(&store), Arc::clone(&metrics), config.clone());
        Self {
            store,
            fallback,
            metrics,
            config,
        }
    }

    pub fn fallback(&self) -> &RecomputeFallback<S> {
        &self.fallback
    }

    /// Applies the counter effect of one message moving `from → to`.
    ///
    /// Conflicts are retried with exponential backoff; once the attempt budget
    /// is spent the batch is recomputed from ground truth before returning.
    #[instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn apply(
        &self,
        batch_id: &BatchId,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<UpdateOutcome, StatsError> {
        let delta = match transition::validate(from, to)? {
            Transition::NoOp => return Ok(UpdateOutcome::Unchanged),
            Transition::Apply(delta) if delta.is_empty() => return Ok(UpdateOutcome::Unchanged),
            Transition::Apply(delta) => delta,
        };

        let max_attempts = self.config.max_cas_attempts;
        for attempt in 1..=max_attempts {
            let current = self
                .store
                .read_batch(batch_id)
                .await?
                .ok_or(StatsError::BatchNotFound(*batch_id))?;

            let Some(next) = current.counters.apply(delta, current.total_count) else {
                // The stored aggregate already reflects this message.
                self.metrics.emit(&MetricEvent::CasUnderflow {
                    batch_id: *batch_id,
                    attempt,
                });
                warn!(
                    attempt,
                    version = current.version,
                    counters = ?current.counters,
                    "counter delta would break the batch total, recomputing"
                );
                return self.recompute(batch_id, FallbackTrigger::CounterUnderflow).await;
            };

            match self
                .store
                .conditional_write(batch_id, next, current.version)
                .await?
            {
                CasOutcome::Applied(record) => {
                    self.metrics.emit(&MetricEvent::CasSuccess {
                        batch_id: *batch_id,
                        attempt,
                    });
                    debug!(attempt, version = record.version, "counters updated");
                    return Ok(UpdateOutcome::Applied {
                        record,
                        attempts: attempt,
                    });
                }
                CasOutcome::Conflict { current_version } => {
                    let conflict = StatsError::VersionConflict {
                        batch_id: *batch_id,
                        expected: current.version,
                        actual: current_version,
                    };
                    self.metrics.emit(&MetricEvent::CasRetry {
                        batch_id: *batch_id,
                        attempt,
                    });
                    let backoff = self.config.cas_backoff(attempt);
                    debug!(attempt, backoff_ms = backoff.as_millis() as u64, "{conflict}");
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        let exhausted = StatsError::OptimisticLockExhausted {
            batch_id: *batch_id,
            attempts: max_attempts,
        };
        self.metrics.emit(&MetricEvent::CasExhausted {
            batch_id: *batch_id,
            attempts: max_attempts,
        });
        warn!("{exhausted}, falling back to recompute");

        self.recompute(batch_id, FallbackTrigger::CasExhausted).await
    }

    async fn recompute(
        &self,
        batch_id: &BatchId,
        trigger: FallbackTrigger,
    ) -> Result<UpdateOutcome, StatsError> {
        let record = self.fallback.recompute_with_retry(batch_id, trigger).await?;
        Ok(UpdateOutcome::Recomputed { record, trigger })
    }
}
