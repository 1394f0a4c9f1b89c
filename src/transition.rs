//! Message status state machine.
//!
//! `pending → sending → {success | failed}`; repeating the current status is
//! a no-op so that at-least-once delivery of status events stays harmless.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::MessageStatus;

/// Aggregate counter column a message status contributes to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bucket {
    Pending,
    Success,
    Failed,
}

/// Effect of one message transition on the batch counters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterDelta {
    pub from: Bucket,
    pub to: Bucket,
}

impl CounterDelta {
    pub fn between(from: MessageStatus, to: MessageStatus) -> Self {
        Self {
            from: from.bucket(),
            to: to.bucket(),
        }
    }

    /// `pending → sending` moves nothing between buckets.
    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    NoOp,
    Apply(CounterDelta),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot leave terminal status {from} for {to}")]
    FromTerminal {
        from: MessageStatus,
        to: MessageStatus,
    },
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: MessageStatus,
        to: MessageStatus,
    },
}

#[must_use]
pub fn valid_transitions(from: MessageStatus) -> &'static [MessageStatus] {
    match from {
        MessageStatus::Pending => &[MessageStatus::Sending],
        MessageStatus::Sending => &[MessageStatus::Success, MessageStatus::Failed],
        MessageStatus::Success | MessageStatus::Failed => &[],
    }
}

pub fn validate(from: MessageStatus, to: MessageStatus) -> Result<Transition, TransitionError> {
    if from == to {
        return Ok(Transition::NoOp);
    }
    if from.is_terminal() {
        return Err(TransitionError::FromTerminal { from, to });
    }
    if !valid_transitions(from).contains(&to) {
        return Err(TransitionError::InvalidTransition { from, to });
    }
    Ok(Transition::Apply(CounterDelta::between(from, to)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use crate::model::MessageStatus::*;

    #[test]
    fn forward_path_is_legal() {
        assert!(matches!(validate(Pending, Sending), Ok(Transition::Apply(d)) if d.is_empty()));
        assert_eq!(
            validate(Sending, Success),
            Ok(Transition::Apply(CounterDelta {
                from: Bucket::Pending,
                to: Bucket::Success
            }))
        );
        assert_eq!(
            validate(Sending, Failed),
            Ok(Transition::Apply(CounterDelta {
                from: Bucket::Pending,
                to: Bucket::Failed
            }))
        );
    }

    #[test]
    fn repeats_are_noops() {
        for status in MessageStatus::ALL {
            assert_eq!(validate(status, status), Ok(Transition::NoOp));
        }
    }

    #[test]
    fn terminal_states_are_final() {
        assert_eq!(
            validate(Success, Pending),
            Err(TransitionError::FromTerminal { from: Success, to: Pending })
        );
        assert!(validate(Success, Failed).is_err());
        assert!(validate(Failed, Success).is_err());
        assert!(validate(Failed, Sending).is_err());
    }

    #[test]
    fn skipping_sending_is_rejected() {
        assert_eq!(
            validate(Pending, Success),
            Err(TransitionError::InvalidTransition { from: Pending, to: Success })
        );
        assert!(validate(Sending, Pending).is_err());
    }

    fn any_status() -> impl Strategy<Value = MessageStatus> {
        prop::sample::select(MessageStatus::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn nothing_leaves_a_terminal_state(from in any_status(), to in any_status()) {
            if from.is_terminal() && from != to {
                prop_assert!(validate(from, to).is_err());
            }
        }

        #[test]
        fn applied_deltas_drain_the_pending_bucket(from in any_status(), to in any_status()) {
            if let Ok(Transition::Apply(delta)) = validate(from, to) {
                prop_assert_eq!(delta.from, Bucket::Pending);
                prop_assert!(!to.is_terminal() || delta.to != Bucket::Pending);
            }
        }
    }
}
