//! Helpers for handler tests

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use super::{HandlerRegistry, ProcessingResult, StreamProcessor};
use crate::record::{Position, Record, RecordDraft, RequestCorrelation};
use crate::timer::{ExpressionEvaluator, UnavailableExpressionEvaluator};

pub(crate) fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Feeds commands with increasing positions into a processor
pub(crate) struct Harness {
    pub processor: StreamProcessor,
    pub now: DateTime<Utc>,
    next_position: Position,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_evaluator(Arc::new(UnavailableExpressionEvaluator))
    }

    pub fn with_evaluator(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self {
            processor: StreamProcessor::new(1, Arc::new(HandlerRegistry::with_defaults()), evaluator),
            now: epoch(),
            next_position: 1,
        }
    }

    pub fn advance_secs(&mut self, secs: i64) {
        self.now += chrono::Duration::seconds(secs);
    }

    /// Apply a client command, correlated with request id = position
    pub fn apply(&mut self, draft: RecordDraft) -> ProcessingResult {
        let position = self.next_position;
        let draft = draft.with_correlation(RequestCorrelation::new(1, position));
        self.apply_raw(draft)
    }

    /// Apply an internal command without correlation
    pub fn apply_internal(&mut self, draft: RecordDraft) -> ProcessingResult {
        self.apply_raw(draft)
    }

    fn apply_raw(&mut self, draft: RecordDraft) -> ProcessingResult {
        let position = self.next_position;
        let command = Record::from_draft(position, draft.with_timestamp(self.now));
        let result = self.processor.apply(&command);
        // Follow-ups occupy the positions after the command
        self.next_position = position + 1 + result.follow_ups.len() as Position;
        result
    }
}
