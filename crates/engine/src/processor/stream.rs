//! Deterministic command application

use std::sync::Arc;

use tracing::{debug, warn};

use super::context::{ProcessingContext, ProcessingResult};
use super::registry::HandlerRegistry;
use super::state::EngineState;
use crate::record::{Record, RejectionType};
use crate::timer::ExpressionEvaluator;

/// Applies commands to the engine state
///
/// `apply` is a pure function of the current state and the command: given
/// the same sequence of commands it produces the same follow-up records,
/// responses and state.
pub struct StreamProcessor {
    partition_id: u16,
    state: EngineState,
    registry: Arc<HandlerRegistry>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl StreamProcessor {
    pub fn new(
        partition_id: u16,
        registry: Arc<HandlerRegistry>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        Self {
            partition_id,
            state: EngineState::new(partition_id),
            registry,
            evaluator,
        }
    }

    /// Apply one command
    ///
    /// Records that are not commands produce an empty result.
    pub fn apply(&mut self, command: &Record) -> ProcessingResult {
        let registry = Arc::clone(&self.registry);
        let mut ctx = ProcessingContext::new(&mut self.state, self.evaluator.as_ref(), command);

        if !command.is_command() {
            return ctx.finish();
        }

        if command.intent.value_type() != command.value_type
            || command.value.value_type() != command.value_type
        {
            ctx.reject_unexpected_value();
        } else {
            match registry.get(command.value_type, command.intent) {
                Some(handler) => handler.handle(command, &mut ctx),
                None => {
                    warn!(
                        position = command.position,
                        value_type = %command.value_type,
                        intent = %command.intent,
                        "No handler registered for command"
                    );
                    ctx.reject(
                        RejectionType::InvalidArgument,
                        format!(
                            "Expected to process command {} {}, but no handler is registered for it",
                            command.value_type, command.intent
                        ),
                    );
                }
            }
        }

        let result = ctx.finish();
        debug!(
            position = command.position,
            command = %command,
            follow_ups = result.follow_ups.len(),
            responded = result.response.is_some(),
            "Command applied"
        );
        result
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Drop all state, as before the first command
    pub fn reset(&mut self) {
        self.state = EngineState::new(self.partition_id);
    }
}

impl std::fmt::Debug for StreamProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("partition_id", &self.partition_id)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{
        Intent, JobIntent, JobRecord, RecordDraft, RecordType, RequestCorrelation, TimerIntent,
        ValueType,
    };
    use crate::timer::UnavailableExpressionEvaluator;

    fn processor() -> StreamProcessor {
        StreamProcessor::new(
            1,
            Arc::new(HandlerRegistry::with_defaults()),
            Arc::new(UnavailableExpressionEvaluator),
        )
    }

    fn command(position: u64, draft: RecordDraft) -> Record {
        Record::from_draft(position, draft.with_correlation(RequestCorrelation::new(1, position)))
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let mut processor = processor();
        // Completed is an event intent; no handler exists for it as a command
        let cmd = command(1, RecordDraft::command(Some(1), JobIntent::Completed, JobRecord::new("a", 1)));

        let result = processor.apply(&cmd);

        assert_eq!(result.follow_ups.len(), 1);
        assert_eq!(result.follow_ups[0].record_type, RecordType::CommandRejection);
        let response = result.response.unwrap();
        assert_eq!(response.rejection_type, Some(RejectionType::InvalidArgument));
    }

    #[test]
    fn test_mismatched_value_is_rejected() {
        let mut processor = processor();
        let mut draft = RecordDraft::command(Some(1), JobIntent::Complete, JobRecord::new("a", 1));
        draft.intent = Intent::from(TimerIntent::Cancel);
        draft.value_type = ValueType::Timer;

        let result = processor.apply(&command(1, draft));

        assert_eq!(
            result.response.unwrap().rejection_reason,
            "Expected a TIMER value for command CANCEL, but got a JOB value"
        );
    }

    #[test]
    fn test_events_are_skipped() {
        let mut processor = processor();
        let mut draft = RecordDraft::command(Some(1), JobIntent::Completed, JobRecord::new("a", 1));
        draft.record_type = RecordType::Event;

        let result = processor.apply(&Record::from_draft(1, draft));

        assert!(result.follow_ups.is_empty());
        assert!(result.response.is_none());
    }

    #[test]
    fn test_reset_clears_state() {
        let mut processor = processor();
        processor.apply(&command(1, RecordDraft::command(None, JobIntent::Create, JobRecord::new("a", 1))));
        assert_eq!(processor.state().jobs().len(), 1);

        processor.reset();
        assert_eq!(processor.state().jobs().len(), 0);
    }
}
