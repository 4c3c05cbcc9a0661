//! Operation records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::Key;

/// Kind of batch operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    /// Raise the retries of every job with an open incident in the instance
    UpdateRetries,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpdateRetries => write!(f, "UPDATE_RETRIES"),
        }
    }
}

/// Operation lifecycle
///
/// ```text
/// SCHEDULED ──▶ SENT ──▶ COMPLETED
///     │           │
///     └───────────┴────▶ FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    Scheduled,
    Sent,
    Completed,
    Failed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `next` may follow this state
    pub fn can_transition_to(&self, next: OperationState) -> bool {
        matches!(
            (self, next),
            (Self::Scheduled, Self::Sent)
                | (Self::Scheduled, Self::Failed)
                | (Self::Sent, Self::Completed)
                | (Self::Sent, Self::Failed)
        )
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "SCHEDULED"),
            Self::Sent => write!(f, "SENT"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// An operator-triggered action on one process instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub operation_type: OperationType,
    pub state: OperationState,

    /// Process instance the operation acts on
    pub target_key: Key,

    /// Shared by all operations created from one request
    pub batch_id: Uuid,

    /// Job keys the operation sent commands for
    #[serde(default)]
    pub job_keys: Vec<Key>,

    pub error_message: Option<String>,
    pub start_date: DateTime<Utc>,

    /// Set exactly when the operation is terminal
    pub end_date: Option<DateTime<Utc>>,
}

impl Operation {
    pub fn scheduled(
        operation_type: OperationType,
        target_key: Key,
        batch_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            operation_type,
            state: OperationState::Scheduled,
            target_key,
            batch_id,
            job_keys: Vec::new(),
            error_message: None,
            start_date: now,
            end_date: None,
        }
    }

    pub(crate) fn sent(mut self, job_keys: Vec<Key>) -> Self {
        self.state = OperationState::Sent;
        self.job_keys = job_keys;
        self
    }

    pub(crate) fn completed(mut self, now: DateTime<Utc>) -> Self {
        self.state = OperationState::Completed;
        self.end_date = Some(now);
        self
    }

    pub(crate) fn failed(mut self, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        self.state = OperationState::Failed;
        self.error_message = Some(message.into());
        self.end_date = Some(now);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_monotone() {
        use OperationState::*;
        assert!(Scheduled.can_transition_to(Sent));
        assert!(Scheduled.can_transition_to(Failed));
        assert!(Sent.can_transition_to(Completed));
        assert!(!Sent.can_transition_to(Scheduled));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Sent));
        assert!(!Scheduled.can_transition_to(Completed));
    }

    #[test]
    fn test_end_date_only_on_terminal() {
        let now = Utc::now();
        let op = Operation::scheduled(OperationType::UpdateRetries, 7, Uuid::now_v7(), now);
        assert!(op.end_date.is_none());

        let op = op.sent(vec![1]);
        assert!(op.end_date.is_none());
        assert_eq!(op.state, OperationState::Sent);

        let op = op.completed(now);
        assert!(op.state.is_terminal());
        assert_eq!(op.end_date, Some(now));
    }

    #[test]
    fn test_serialized_names() {
        assert_eq!(
            serde_json::to_string(&OperationType::UpdateRetries).unwrap(),
            "\"UPDATE_RETRIES\""
        );
        assert_eq!(OperationState::Sent.to_string(), "SENT");
    }
}
