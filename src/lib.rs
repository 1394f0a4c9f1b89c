//! Keeps per-batch delivery counters consistent with the status of every
//! message in the batch.
//!
//! Status events flow through [`StatusEventProcessor`]: the transition guard
//! checks the move, the message row is updated conditionally, and
//! [`OptimisticStatsUpdater`] applies the counter delta with a bounded
//! compare-and-swap loop. When that loop runs out of attempts the batch is
//! recomputed from message ground truth by [`RecomputeFallback`].
//! [`ConsistencyAuditor`] sweeps active batches in the background and repairs
//! anything that drifted anyway.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod auditor;
pub mod config;
pub mod error;
pub mod fallback;
pub mod metrics;
pub mod model;
pub mod processor;
#[cfg(not(target_arch = "wasm32"))]
pub mod sqlite;
pub mod store;
pub mod transition;
pub mod updater;

pub use auditor::{AuditReport, ConsistencyAuditor};
pub use config::EngineConfig;
pub use error::{StatsError, StoreError};
pub use fallback::RecomputeFallback;
pub use self::metrics::{
    Drift, EngineMetrics, FallbackTrigger, FanoutSink, MetricEvent, MetricsSink, MetricsSnapshot,
    NoopSink, RecorderSink,
};
pub use model::{
    BatchCounters, BatchId, BatchRecord, BatchStatus, Channel, MessageId, MessageRecord,
    MessageStatus, NewBatch, Recipient, StatusCounts, StatusUpdate, UnixTimeMs,
};
pub use processor::{AggregateOutcome, ProcessOutcome, StatusChangeEvent, StatusEventProcessor};
#[cfg(not(target_arch = "wasm32"))]
pub use sqlite::SqliteStore;
pub use store::{BatchStore, CasOutcome, MemoryStore, MessageStore, StatsStore};
pub use transition::{Bucket, CounterDelta, Transition, TransitionError};
pub use updater::{OptimisticStatsUpdater, UpdateOutcome};
