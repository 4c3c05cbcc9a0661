//! Log records
//!
//! Everything a partition knows is a [`Record`] in its log: client and internal
//! commands, the events they produce, and rejections. Records are immutable once
//! appended; the log assigns their position.

mod intent;
mod value;

pub use intent::{
    DeploymentIntent, IncidentIntent, Intent, JobBatchIntent, JobIntent, ProcessInstanceIntent,
    TimerIntent, ValueType,
};
pub use value::{
    DeploymentRecord, IncidentErrorType, IncidentRecord, IncidentState, JobBatchRecord, JobRecord,
    ProcessInstanceRecord, RecordValue, TimerRecord, TimerStartEvent,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a record in its partition log; gapless and starting at 1
pub type Position = u64;

/// Entity key, unique within a partition and never reused
pub type Key = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordType {
    Command,
    Event,
    CommandRejection,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::Command => write!(f, "COMMAND"),
            RecordType::Event => write!(f, "EVENT"),
            RecordType::CommandRejection => write!(f, "COMMAND_REJECTION"),
        }
    }
}

/// Why a command was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionType {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    InvalidState,
    ProcessingError,
}

impl fmt::Display for RejectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionType::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            RejectionType::NotFound => write!(f, "NOT_FOUND"),
            RejectionType::AlreadyExists => write!(f, "ALREADY_EXISTS"),
            RejectionType::InvalidState => write!(f, "INVALID_STATE"),
            RejectionType::ProcessingError => write!(f, "PROCESSING_ERROR"),
        }
    }
}

/// Identifies the client request a command came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestCorrelation {
    pub request_stream_id: i32,
    pub request_id: u64,
}

impl RequestCorrelation {
    pub fn new(request_stream_id: i32, request_id: u64) -> Self {
        Self {
            request_stream_id,
            request_id,
        }
    }
}

/// A record as stored in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub position: Position,

    /// Position of the command this record was produced from
    pub source_position: Option<Position>,

    pub key: Option<Key>,
    pub record_type: RecordType,
    pub value_type: ValueType,
    pub intent: Intent,
    pub value: RecordValue,
    pub rejection_type: Option<RejectionType>,

    #[serde(default)]
    pub rejection_reason: String,

    /// Present only on commands submitted by a client
    pub correlation: Option<RequestCorrelation>,

    pub timestamp: DateTime<Utc>,
}

impl Record {
    /// Materialize a draft at a log position
    pub fn from_draft(position: Position, draft: RecordDraft) -> Self {
        Self {
            position,
            source_position: draft.source_position,
            key: draft.key,
            record_type: draft.record_type,
            value_type: draft.value_type,
            intent: draft.intent,
            value: draft.value,
            rejection_type: draft.rejection_type,
            rejection_reason: draft.rejection_reason,
            correlation: draft.correlation,
            timestamp: draft.timestamp,
        }
    }

    /// The record without its position
    pub fn to_draft(&self) -> RecordDraft {
        RecordDraft {
            source_position: self.source_position,
            key: self.key,
            record_type: self.record_type,
            value_type: self.value_type,
            intent: self.intent,
            value: self.value.clone(),
            rejection_type: self.rejection_type,
            rejection_reason: self.rejection_reason.clone(),
            correlation: self.correlation,
            timestamp: self.timestamp,
        }
    }

    pub fn is_command(&self) -> bool {
        self.record_type == RecordType::Command
    }

    pub fn is_event(&self) -> bool {
        self.record_type == RecordType::Event
    }

    pub fn is_rejection(&self) -> bool {
        self.record_type == RecordType::CommandRejection
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} @{}",
            self.record_type, self.value_type, self.intent, self.position
        )?;
        if let Some(key) = self.key {
            write!(f, " key={key}")?;
        }
        Ok(())
    }
}

/// A record that has not been appended yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub source_position: Option<Position>,
    pub key: Option<Key>,
    pub record_type: RecordType,
    pub value_type: ValueType,
    pub intent: Intent,
    pub value: RecordValue,
    pub rejection_type: Option<RejectionType>,
    pub rejection_reason: String,
    pub correlation: Option<RequestCorrelation>,
    pub timestamp: DateTime<Utc>,
}

impl RecordDraft {
    /// Command draft; the timestamp is set when the command is appended
    pub fn command(key: Option<Key>, intent: impl Into<Intent>, value: impl Into<RecordValue>) -> Self {
        let value = value.into();
        Self {
            source_position: None,
            key,
            record_type: RecordType::Command,
            value_type: value.value_type(),
            intent: intent.into(),
            value,
            rejection_type: None,
            rejection_reason: String::new(),
            correlation: None,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Event produced while processing `source`
    pub fn event(
        source: &Record,
        key: Option<Key>,
        intent: impl Into<Intent>,
        value: impl Into<RecordValue>,
    ) -> Self {
        let value = value.into();
        Self {
            source_position: Some(source.position),
            key,
            record_type: RecordType::Event,
            value_type: value.value_type(),
            intent: intent.into(),
            value,
            rejection_type: None,
            rejection_reason: String::new(),
            correlation: None,
            timestamp: source.timestamp,
        }
    }

    /// Rejection of `source`, echoing its key, intent and value
    pub fn rejection(source: &Record, rejection_type: RejectionType, reason: impl Into<String>) -> Self {
        Self {
            source_position: Some(source.position),
            key: source.key,
            record_type: RecordType::CommandRejection,
            value_type: source.value_type,
            intent: source.intent,
            value: source.value.clone(),
            rejection_type: Some(rejection_type),
            rejection_reason: reason.into(),
            correlation: source.correlation,
            timestamp: source.timestamp,
        }
    }

    pub fn with_correlation(mut self, correlation: RequestCorrelation) -> Self {
        self.correlation = Some(correlation);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_at(position: Position) -> Record {
        let draft = RecordDraft::command(Some(7), JobIntent::Complete, JobRecord::new("payment", 1))
            .with_correlation(RequestCorrelation::new(1, 42));
        Record::from_draft(position, draft)
    }

    #[test]
    fn test_command_draft_derives_value_type() {
        let draft = RecordDraft::command(None, JobIntent::Create, JobRecord::new("payment", 3));
        assert_eq!(draft.value_type, ValueType::Job);
        assert_eq!(draft.record_type, RecordType::Command);
    }

    #[test]
    fn test_event_links_to_source() {
        let command = command_at(5);
        let event = RecordDraft::event(&command, Some(7), JobIntent::Completed, JobRecord::new("payment", 1));

        assert_eq!(event.source_position, Some(5));
        assert_eq!(event.timestamp, command.timestamp);
        assert!(event.correlation.is_none());
    }

    #[test]
    fn test_rejection_echoes_command() {
        let command = command_at(9);
        let rejection = RecordDraft::rejection(&command, RejectionType::NotFound, "no such job");

        assert_eq!(rejection.record_type, RecordType::CommandRejection);
        assert_eq!(rejection.intent, command.intent);
        assert_eq!(rejection.key, Some(7));
        assert_eq!(rejection.rejection_type, Some(RejectionType::NotFound));
        assert_eq!(rejection.correlation, command.correlation);
    }

    #[test]
    fn test_draft_round_trip_through_position() {
        let command = command_at(3);
        assert_eq!(Record::from_draft(3, command.to_draft()), command);
        assert_eq!(command.to_string(), "COMMAND JOB COMPLETE @3 key=7");
    }
}
