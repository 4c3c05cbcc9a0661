//! Context handed to command handlers

use chrono::{DateTime, Utc};

use super::response::{Response, ResponseWriter};
use super::state::EngineState;
use crate::record::{Intent, Key, Record, RecordDraft, RecordValue, RejectionType};
use crate::timer::ExpressionEvaluator;

/// Everything a handler may touch while processing one command
///
/// Handlers mutate state through [`state_mut`](Self::state_mut), append
/// follow-up records through [`append_event`](Self::append_event) and
/// [`reject`](Self::reject), and stage the response through
/// [`response`](Self::response). Nothing is written to the log until the
/// handler returns.
pub struct ProcessingContext<'a> {
    state: &'a mut EngineState,
    evaluator: &'a dyn ExpressionEvaluator,
    command: &'a Record,
    follow_ups: Vec<RecordDraft>,
    response: ResponseWriter,
}

/// Outcome of processing one command
#[derive(Debug)]
pub struct ProcessingResult {
    /// Events and rejections to append, in order
    pub follow_ups: Vec<RecordDraft>,
    pub response: Option<Response>,
    pub response_overwrites: usize,
}

impl<'a> ProcessingContext<'a> {
    pub(crate) fn new(
        state: &'a mut EngineState,
        evaluator: &'a dyn ExpressionEvaluator,
        command: &'a Record,
    ) -> Self {
        Self {
            state,
            evaluator,
            command,
            follow_ups: Vec::new(),
            response: ResponseWriter::for_command(command),
        }
    }

    pub fn command(&self) -> &'a Record {
        self.command
    }

    /// Processing time: the timestamp the command was appended with
    pub fn now(&self) -> DateTime<Utc> {
        self.command.timestamp
    }

    pub fn state(&self) -> &EngineState {
        self.state
    }

    pub fn state_mut(&mut self) -> &mut EngineState {
        self.state
    }

    pub fn evaluator(&self) -> &'a dyn ExpressionEvaluator {
        self.evaluator
    }

    pub fn next_key(&mut self) -> Key {
        self.state.next_key()
    }

    /// Append an event produced by the command
    pub fn append_event(
        &mut self,
        key: Key,
        intent: impl Into<Intent>,
        value: impl Into<RecordValue>,
    ) -> RecordDraft {
        let event = RecordDraft::event(self.command, Some(key), intent, value);
        self.follow_ups.push(event.clone());
        event
    }

    /// Append an event and stage it as the response
    pub fn append_and_respond(
        &mut self,
        key: Key,
        intent: impl Into<Intent>,
        value: impl Into<RecordValue>,
    ) {
        let event = self.append_event(key, intent, value);
        self.response.write_event(&event);
    }

    /// Reject the command; a rejected command must not have changed any state
    pub fn reject(&mut self, rejection_type: RejectionType, reason: impl Into<String>) {
        let reason = reason.into();
        self.follow_ups
            .push(RecordDraft::rejection(self.command, rejection_type, reason.clone()));
        self.response
            .write_rejection_on_command(self.command, rejection_type, reason);
    }

    /// Reject a command whose value does not fit its intent
    pub fn reject_unexpected_value(&mut self) {
        let reason = format!(
            "Expected a {} value for command {}, but got a {} value",
            self.command.intent.value_type(),
            self.command.intent,
            self.command.value.value_type()
        );
        self.reject(RejectionType::InvalidArgument, reason);
    }

    pub fn response(&mut self) -> &mut ResponseWriter {
        &mut self.response
    }

    pub(crate) fn finish(mut self) -> ProcessingResult {
        ProcessingResult {
            follow_ups: self.follow_ups,
            response_overwrites: self.response.overwrites(),
            response: self.response.flush(),
        }
    }
}
