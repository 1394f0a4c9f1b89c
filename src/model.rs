use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::StatsError;
use crate::transition::{Bucket, CounterDelta};

/// Externally visible batch identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First eight hex characters, used for default batch names
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned message row id
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        Self(self.0.saturating_sub(d.as_millis() as u64))
    }
}

// ============================================================================
// Message state
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sending,
    Success,
    Failed,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 4] = [
        MessageStatus::Pending,
        MessageStatus::Sending,
        MessageStatus::Success,
        MessageStatus::Failed,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sending" => Some(Self::Sending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Aggregate bucket; the batch row has no `sending` column.
    #[must_use]
    pub const fn bucket(self) -> Bucket {
        match self {
            Self::Pending | Self::Sending => Bucket::Pending,
            Self::Success => Bucket::Success,
            Self::Failed => Bucket::Failed,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Line,
    Sms,
    Email,
}

impl Channel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Line => "line",
            Self::Sms => "sms",
            Self::Email => "email",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "line" => Some(Self::Line),
            "sms" => Some(Self::Sms),
            "email" => Some(Self::Email),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub batch_id: BatchId,
    pub channel: Channel,
    pub content: String,
    pub recipient_id: String,
    pub recipient_type: String,
    pub status: MessageStatus,
    pub error_message: Option<String>,
    pub sent_at: Option<UnixTimeMs>,
    pub created_at: UnixTimeMs,
    pub updated_at: UnixTimeMs,
}

impl MessageRecord {
    /// Applies a status change in place, mirroring what the stores persist.
    pub fn apply_update(&mut self, update: &StatusUpdate) {
        self.status = update.status;
        self.updated_at = update.at;
        match update.status {
            MessageStatus::Success => {
                self.sent_at = Some(update.at);
                self.error_message = None;
            }
            MessageStatus::Failed => {
                self.error_message = update.error_message.clone();
            }
            MessageStatus::Pending | MessageStatus::Sending => {}
        }
    }
}

/// Payload of a conditional message status write
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: MessageStatus,
    pub error_message: Option<String>,
    pub at: UnixTimeMs,
}

impl StatusUpdate {
    pub fn new(status: MessageStatus, at: UnixTimeMs) -> Self {
        Self {
            status,
            error_message: None,
            at,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

// ============================================================================
// Batch aggregate
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// `Failed` is set by the owning system and is never derived away.
    #[must_use]
    pub fn derive(previous: Self, counters: &BatchCounters, total: u32) -> Self {
        if previous == Self::Failed {
            return Self::Failed;
        }
        let terminal = counters.success + counters.failed;
        if terminal == total {
            Self::Completed
        } else if terminal > 0 {
            Self::Processing
        } else {
            Self::Pending
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ground-truth status distribution of one batch's messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u32,
    pub sending: u32,
    pub success: u32,
    pub failed: u32,
}

impl StatusCounts {
    pub fn total(&self) -> u32 {
        self.pending + self.sending + self.success + self.failed
    }

    pub fn record(&mut self, status: MessageStatus) {
        match status {
            MessageStatus::Pending => self.pending += 1,
            MessageStatus::Sending => self.sending += 1,
            MessageStatus::Success => self.success += 1,
            MessageStatus::Failed => self.failed += 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchCounters {
    pub success: u32,
    pub failed: u32,
    pub pending: u32,
}

impl BatchCounters {
    pub fn initial(total: u32) -> Self {
        Self {
            success: 0,
            failed: 0,
            pending: total,
        }
    }

    pub fn from_status_counts(counts: &StatusCounts) -> Self {
        Self {
            success: counts.success,
            failed: counts.failed,
            pending: counts.pending + counts.sending,
        }
    }

    pub fn sum(&self) -> u32 {
        self.success + self.failed + self.pending
    }

    fn slot(&mut self, bucket: Bucket) -> &mut u32 {
        match bucket {
            Bucket::Pending => &mut self.pending,
            Bucket::Success => &mut self.success,
            Bucket::Failed => &mut self.failed,
        }
    }

    /// Applies a delta with the decrement floored at zero.
    ///
    /// Returns `None` when the floored result no longer sums to `total`; that
    /// happens only when the aggregate has already absorbed this change, and
    /// such a record must not be persisted.
    #[must_use]
    pub fn apply(&self, delta: CounterDelta, total: u32) -> Option<Self> {
        if delta.is_empty() {
            return Some(*self);
        }
        let mut next = *self;
        let from = next.slot(delta.from);
        *from = from.saturating_sub(1);
        let to = next.slot(delta.to);
        *to = to.saturating_add(1);

        (next.sum() == total).then_some(next)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: BatchId,
    pub seq: i64,
    pub batch_name: Option<String>,
    pub total_count: u32,
    pub counters: BatchCounters,
    pub status: BatchStatus,
    pub version: u64,
    pub created_at: UnixTimeMs,
    pub updated_at: UnixTimeMs,
}

impl BatchRecord {
    pub fn success_rate(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        f64::from(self.counters.success) / f64::from(self.total_count) * 100.0
    }

    pub fn remaining_count(&self) -> u32 {
        self.total_count
            .saturating_sub(self.counters.success + self.counters.failed)
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn check_invariants(&self) -> Result<(), StatsError> {
        match self.sum_violation() {
            Some(reason) => Err(StatsError::InvariantViolation(reason)),
            None => Ok(()),
        }
    }

    /// Describes why the counters cannot be persisted, if they cannot.
    pub(crate) fn sum_violation(&self) -> Option<String> {
        (self.counters.sum() != self.total_count).then(|| {
            format!(
                "counter sum {} does not match total {} for batch {}",
                self.counters.sum(),
                self.total_count,
                self.batch_id
            )
        })
    }

    /// Produces the record a successful write of `counters` leaves behind.
    pub(crate) fn advanced(&self, counters: BatchCounters, at: UnixTimeMs) -> Self {
        Self {
            counters,
            status: BatchStatus::derive(self.status, &counters, self.total_count),
            version: self.version + 1,
            updated_at: at,
            ..self.clone()
        }
    }
}

// ============================================================================
// Batch creation
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    #[serde(default = "Recipient::default_type")]
    pub recipient_type: String,
}

impl Recipient {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            recipient_type: Self::default_type(),
        }
    }

    fn default_type() -> String {
        "default".to_string()
    }
}

/// Everything needed to create a batch and its messages atomically
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewBatch {
    pub batch_id: BatchId,
    pub batch_name: Option<String>,
    pub channel: Channel,
    pub content: String,
    pub recipients: Vec<Recipient>,
}

impl NewBatch {
    pub fn new(channel: Channel, content: impl Into<String>, recipients: Vec<Recipient>) -> Self {
        Self {
            batch_id: BatchId::generate(),
            batch_name: None,
            channel,
            content: content.into(),
            recipients,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.batch_name = Some(name.into());
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.recipients.is_empty() {
            return Err("recipient list cannot be empty".into());
        }
        if u32::try_from(self.recipients.len()).is_err() {
            return Err(format!("too many recipients: {}", self.recipients.len()));
        }
        Ok(())
    }

    pub fn resolved_name(&self) -> String {
        self.batch_name.clone().unwrap_or_else(|| {
            format!("{}_batch_{}", self.channel.as_str(), self.batch_id.short())
        })
    }

    pub fn total_count(&self) -> u32 {
        self.recipients.len() as u32
    }
}
