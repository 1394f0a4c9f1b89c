//! Entry point for message status events coming off the delivery queue.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::error::StatsError;
use crate::metrics::{MetricEvent, MetricsSink};
use crate::model::{MessageId, MessageStatus, StatusUpdate, UnixTimeMs};
use crate::store::StatsStore;
use crate::transition::{self, Transition, TransitionError};
use crate::updater::{OptimisticStatsUpdater, UpdateOutcome};

/// A channel worker's report that one message changed status
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChangeEvent {
    pub message_id: MessageId,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StatusChangeEvent {
    pub fn new(message_id: MessageId, status: MessageStatus) -> Self {
        Self {
            message_id,
            status,
            error_message: None,
        }
    }

    pub fn failed(message_id: MessageId, error: impl Into<String>) -> Self {
        Self {
            message_id,
            status: MessageStatus::Failed,
            error_message: Some(error.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AggregateOutcome {
    Updated(UpdateOutcome),
    /// The aggregate write failed; the next audit sweep reconciles it.
    Deferred { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The message already had this status.
    Duplicate,
    Rejected(TransitionError),
    Applied {
        from: MessageStatus,
        to: MessageStatus,
        aggregate: AggregateOutcome,
    },
}

pub struct StatusEventProcessor<S: StatsStore + ?Sized> {
    store: Arc<S>,
    updater: OptimisticStatsUpdater<S>,
    metrics: Arc<dyn MetricsSink>,
    config: EngineConfig,
}

impl<S: StatsStore + ?Sized> StatusEventProcessor<S> {
    pub fn new(store: Arc<S>, metrics: Arc<dyn MetricsSink>, config: EngineConfig) -> Self {
        let updater = OptimisticStatsUpdater::new(Arc::clone(&store), Arc::clone(&metrics), config.clone());
        Self {
            store,
            updater,
            metrics,
            config,
        }
    }

    pub fn updater(&self) -> &OptimisticStatsUpdater<S> {
        &self.updater
    }

    #[instrument(skip(self, event), fields(message_id = %event.message_id, status = %event.status))]
    pub async fn handle(&self, event: StatusChangeEvent) -> Result<ProcessOutcome, StatsError> {
        let attempts = self.config.max_message_write_attempts;

        for attempt in 1..=attempts {
            let message = self
                .store
                .read_message(event.message_id)
                .await?
                .ok_or(StatsError::MessageNotFound(event.message_id))?;
            let from = message.status;

            match transition::validate(from, event.status) {
                Ok(Transition::NoOp) => {
                    self.metrics.emit(&MetricEvent::NoOpSkipped {
                        batch_id: message.batch_id,
                    });
                    debug!("duplicate status event ignored");
                    return Ok(ProcessOutcome::Duplicate);
                }
                Err(e) => {
                    self.metrics.emit(&MetricEvent::InvalidTransition {
                        batch_id: message.batch_id,
                    });
                    warn!(batch_id = %message.batch_id, error = %e, "status event rejected");
                    return Ok(ProcessOutcome::Rejected(e));
                }
                Ok(Transition::Apply(_)) => {}
            }

            let update = StatusUpdate {
                status: event.status,
                error_message: event.error_message.clone(),
                at: UnixTimeMs::now(),
            };
            if !self
                .store
                .transition_status(message.id, from, update)
                .await?
            {
                debug!(attempt, "message moved under us, re-reading");
                continue;
            }

            let aggregate = match self.updater.apply(&message.batch_id, from, event.status).await {
                Ok(outcome) => AggregateOutcome::Updated(outcome),
                Err(e) => {
                    warn!(
                        batch_id = %message.batch_id,
                        error = %e,
                        "aggregate update deferred to the auditor"
                    );
                    AggregateOutcome::Deferred {
                        reason: e.to_string(),
                    }
                }
            };

            return Ok(ProcessOutcome::Applied {
                from,
                to: event.status,
                aggregate,
            });
        }

        Err(StatsError::MessageContended {
            message_id: event.message_id,
            attempts,
        })
    }
}
