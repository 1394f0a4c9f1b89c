//! Metric events and sinks.
//!
//! Emission is fire-and-forget: a sink never returns an error and never
//! blocks the caller on I/O.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use metrics::{counter, histogram};

use crate::model::{BatchCounters, BatchId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FallbackTrigger {
    CasExhausted,
    CounterUnderflow,
    AuditRepair,
    Manual,
}

impl FallbackTrigger {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CasExhausted => "cas_exhausted",
            Self::CounterUnderflow => "counter_underflow",
            Self::AuditRepair => "audit_repair",
            Self::Manual => "manual",
        }
    }
}

/// Stored counters against ground truth at the moment a repair was decided
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Drift {
    pub batch_id: BatchId,
    pub stored: BatchCounters,
    pub actual: BatchCounters,
}

impl Drift {
    /// Largest absolute difference across the three counters.
    pub fn magnitude(&self) -> u32 {
        self.stored
            .success
            .abs_diff(self.actual.success)
            .max(self.stored.failed.abs_diff(self.actual.failed))
            .max(self.stored.pending.abs_diff(self.actual.pending))
    }

    pub fn is_zero(&self) -> bool {
        self.stored == self.actual
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricEvent {
    CasSuccess { batch_id: BatchId, attempt: u32 },
    CasRetry { batch_id: BatchId, attempt: u32 },
    /// The read found counters that already absorbed the delta; no write was tried.
    CasUnderflow { batch_id: BatchId, attempt: u32 },
    CasExhausted { batch_id: BatchId, attempts: u32 },
    FallbackInvoked { batch_id: BatchId, trigger: FallbackTrigger },
    FallbackFailed { batch_id: BatchId, attempts: u32 },
    AuditRepair(Drift),
    AuditItemFailure { batch_id: BatchId },
    InvalidTransition { batch_id: BatchId },
    NoOpSkipped { batch_id: BatchId },
}

impl MetricEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CasSuccess { .. } => "cas_success",
            Self::CasRetry { .. } => "cas_retry",
            Self::CasUnderflow { .. } => "cas_underflow",
            Self::CasExhausted { .. } => "cas_exhausted",
            Self::FallbackInvoked { .. } => "fallback_invoked",
            Self::FallbackFailed { .. } => "fallback_failed",
            Self::AuditRepair(_) => "audit_repair",
            Self::AuditItemFailure { .. } => "audit_item_failure",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NoOpSkipped { .. } => "noop_skipped",
        }
    }

    pub fn batch_id(&self) -> BatchId {
        match self {
            Self::CasSuccess { batch_id, .. }
            | Self::CasRetry { batch_id, .. }
            | Self::CasUnderflow { batch_id, .. }
            | Self::CasExhausted { batch_id, .. }
            | Self::FallbackInvoked { batch_id, .. }
            | Self::FallbackFailed { batch_id, .. }
            | Self::AuditItemFailure { batch_id }
            | Self::InvalidTransition { batch_id }
            | Self::NoOpSkipped { batch_id } => *batch_id,
            Self::AuditRepair(drift) => drift.batch_id,
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn emit(&self, event: &MetricEvent);
}

impl<T: MetricsSink + ?Sized> MetricsSink for Arc<T> {
    fn emit(&self, event: &MetricEvent) {
        (**self).emit(event)
    }
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn emit(&self, _event: &MetricEvent) {}
}

// ============================================================================
// In-process counters
// ============================================================================

const RECENT_DRIFT_CAPACITY: usize = 64;

#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub cas_success: AtomicU64,
    pub cas_retry: AtomicU64,
    pub cas_underflow: AtomicU64,
    pub cas_exhausted: AtomicU64,
    pub fallback_invoked: AtomicU64,
    pub fallback_failed: AtomicU64,
    pub audit_repair: AtomicU64,
    pub audit_item_failure: AtomicU64,
    pub invalid_transition: AtomicU64,
    pub noop_skipped: AtomicU64,

    recent_drifts: Mutex<VecDeque<Drift>>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cas_success: self.cas_success.load(Ordering::Relaxed),
            cas_retry: self.cas_retry.load(Ordering::Relaxed),
            cas_underflow: self.cas_underflow.load(Ordering::Relaxed),
            cas_exhausted: self.cas_exhausted.load(Ordering::Relaxed),
            fallback_invoked: self.fallback_invoked.load(Ordering::Relaxed),
            fallback_failed: self.fallback_failed.load(Ordering::Relaxed),
            audit_repair: self.audit_repair.load(Ordering::Relaxed),
            audit_item_failure: self.audit_item_failure.load(Ordering::Relaxed),
            invalid_transition: self.invalid_transition.load(Ordering::Relaxed),
            noop_skipped: self.noop_skipped.load(Ordering::Relaxed),
        }
    }

    /// Most recent repair drifts, oldest first.
    pub fn recent_drifts(&self) -> Vec<Drift> {
        match self.recent_drifts.lock() {
            Ok(drifts) => drifts.iter().copied().collect(),
            Err(poisoned) => poisoned.into_inner().iter().copied().collect(),
        }
    }

    fn push_drift(&self, drift: Drift) {
        let mut drifts = match self.recent_drifts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if drifts.len() == RECENT_DRIFT_CAPACITY {
            drifts.pop_front();
        }
        drifts.push_back(drift);
    }
}

impl MetricsSink for EngineMetrics {
    fn emit(&self, event: &MetricEvent) {
        let slot = match event {
            MetricEvent::CasSuccess { .. } => &self.cas_success,
            MetricEvent::CasRetry { .. } => &self.cas_retry,
            MetricEvent::CasUnderflow { .. } => &self.cas_underflow,
            MetricEvent::CasExhausted { .. } => &self.cas_exhausted,
            MetricEvent::FallbackInvoked { .. } => &self.fallback_invoked,
            MetricEvent::FallbackFailed { .. } => &self.fallback_failed,
            MetricEvent::AuditRepair(drift) => {
                self.push_drift(*drift);
                &self.audit_repair
            }
            MetricEvent::AuditItemFailure { .. } => &self.audit_item_failure,
            MetricEvent::InvalidTransition { .. } => &self.invalid_transition,
            MetricEvent::NoOpSkipped { .. } => &self.noop_skipped,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cas_success: u64,
    pub cas_retry: u64,
    pub cas_underflow: u64,
    pub cas_exhausted: u64,
    pub fallback_invoked: u64,
    pub fallback_failed: u64,
    pub audit_repair: u64,
    pub audit_item_failure: u64,
    pub invalid_transition: u64,
    pub noop_skipped: u64,
}

// ============================================================================
// `metrics` facade
// ============================================================================

/// Forwards events to whatever recorder the host process installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderSink;

impl MetricsSink for RecorderSink {
    fn emit(&self, event: &MetricEvent) {
        match event {
            MetricEvent::CasSuccess { attempt, .. } => {
                counter!("batch_stats.cas_success").increment(1);
                histogram!("batch_stats.cas_attempts").record(f64::from(*attempt));
            }
            MetricEvent::CasRetry { .. } => counter!("batch_stats.cas_retry").increment(1),
            MetricEvent::CasUnderflow { .. } => counter!("batch_stats.cas_underflow").increment(1),
            MetricEvent::CasExhausted { .. } => counter!("batch_stats.cas_exhausted").increment(1),
            MetricEvent::FallbackInvoked { trigger, .. } => {
                counter!("batch_stats.fallback_invoked", "trigger" => trigger.as_str()).increment(1)
            }
            MetricEvent::FallbackFailed { .. } => {
                counter!("batch_stats.fallback_failed").increment(1)
            }
            MetricEvent::AuditRepair(drift) => {
                counter!("batch_stats.audit_repair").increment(1);
                histogram!("batch_stats.drift_magnitude").record(f64::from(drift.magnitude()));
            }
            MetricEvent::AuditItemFailure { .. } => {
                counter!("batch_stats.audit_item_failure").increment(1)
            }
            MetricEvent::InvalidTransition { .. } => {
                counter!("batch_stats.invalid_transition").increment(1)
            }
            MetricEvent::NoOpSkipped { .. } => counter!("batch_stats.noop_skipped").increment(1),
        }
    }
}

/// Sends each event to every inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl MetricsSink for FanoutSink {
    fn emit(&self, event: &MetricEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
