//! Per-command response writer
//!
//! Every command produces at most one response, addressed to the request
//! that submitted it. The writer is bound to the command being processed and
//! copies the request correlation from the command, never from the event
//! being reported.

use tracing::warn;

use crate::record::{
    Intent, Key, Record, RecordDraft, RecordType, RecordValue, RejectionType, RequestCorrelation,
    ValueType,
};

/// Response delivered to the client that submitted a command
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub record_type: RecordType,
    pub key: Option<Key>,
    pub intent: Intent,
    pub value_type: ValueType,
    pub value: RecordValue,
    pub rejection_type: Option<RejectionType>,
    pub rejection_reason: String,
    pub request_id: u64,
    pub request_stream_id: i32,
}

impl Response {
    pub fn correlation(&self) -> RequestCorrelation {
        RequestCorrelation::new(self.request_stream_id, self.request_id)
    }

    pub fn is_rejection(&self) -> bool {
        self.record_type == RecordType::CommandRejection
    }
}

/// Staged response for the command currently being processed
///
/// Writing twice replaces the staged response; the last write wins.
#[derive(Debug)]
pub struct ResponseWriter {
    correlation: Option<RequestCorrelation>,
    staged: Option<Response>,
    overwrites: usize,
}

impl ResponseWriter {
    /// Writer bound to `command`; commands without a correlation get no response
    pub fn for_command(command: &Record) -> Self {
        Self {
            correlation: command.correlation,
            staged: None,
            overwrites: 0,
        }
    }

    /// Stage an event as the response to the bound command
    pub fn write_event(&mut self, event: &RecordDraft) {
        let Some(correlation) = self.correlation else {
            return;
        };
        self.stage(Response {
            record_type: RecordType::Event,
            key: event.key,
            intent: event.intent,
            value_type: event.value_type,
            value: event.value.clone(),
            rejection_type: None,
            rejection_reason: String::new(),
            request_id: correlation.request_id,
            request_stream_id: correlation.request_stream_id,
        });
    }

    /// Stage a rejection of `command`, echoing its intent and value
    pub fn write_rejection_on_command(
        &mut self,
        command: &Record,
        rejection_type: RejectionType,
        reason: impl Into<String>,
    ) {
        let Some(correlation) = command.correlation else {
            return;
        };
        self.stage(Response {
            record_type: RecordType::CommandRejection,
            key: command.key,
            intent: command.intent,
            value_type: command.value_type,
            value: command.value.clone(),
            rejection_type: Some(rejection_type),
            rejection_reason: reason.into(),
            request_id: correlation.request_id,
            request_stream_id: correlation.request_stream_id,
        });
    }

    /// Stage an arbitrary response with explicit addressing
    pub fn write_response(
        &mut self,
        key: Option<Key>,
        intent: Intent,
        value: RecordValue,
        value_type: ValueType,
        request_id: u64,
        request_stream_id: i32,
    ) {
        self.stage(Response {
            record_type: RecordType::Event,
            key,
            intent,
            value_type,
            value,
            rejection_type: None,
            rejection_reason: String::new(),
            request_id,
            request_stream_id,
        });
    }

    pub fn has_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// How many staged responses were replaced by a later write
    pub fn overwrites(&self) -> usize {
        self.overwrites
    }

    /// Take the staged response, leaving the writer empty
    pub fn flush(&mut self) -> Option<Response> {
        self.staged.take()
    }

    fn stage(&mut self, response: Response) {
        if let Some(previous) = &self.staged {
            self.overwrites += 1;
            warn!(
                request_id = response.request_id,
                previous_intent = %previous.intent,
                intent = %response.intent,
                "Response written twice for one command; keeping the last one"
            );
        }
        self.staged = Some(response);
    }
}
