//! Command handler registry

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::context::ProcessingContext;
use crate::record::{
    DeploymentIntent, Intent, JobBatchIntent, JobIntent, ProcessInstanceIntent, Record,
    TimerIntent, ValueType,
};
use crate::{job, process, timer};

/// Handles one kind of command
pub trait CommandHandler: Send + Sync {
    fn handle(&self, command: &Record, ctx: &mut ProcessingContext<'_>);
}

impl<F> CommandHandler for F
where
    F: Fn(&Record, &mut ProcessingContext<'_>) + Send + Sync,
{
    fn handle(&self, command: &Record, ctx: &mut ProcessingContext<'_>) {
        self(command, ctx)
    }
}

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A handler is already registered for this command
    #[error("handler already registered for {value_type} {intent}")]
    AlreadyRegistered { value_type: ValueType, intent: Intent },

    /// The intent belongs to another value type
    #[error("intent {intent} does not belong to value type {value_type}")]
    MismatchedIntent { value_type: ValueType, intent: Intent },
}

/// Maps `(value type, intent)` to the handler for that command
///
/// Built once at startup and immutable afterwards.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<(ValueType, Intent), Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with every built-in command
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let builtins: Vec<(Intent, Arc<dyn CommandHandler>)> = vec![
            (DeploymentIntent::Create.into(), boxed(process::processors::deploy)),
            (
                ProcessInstanceIntent::Create.into(),
                boxed(process::processors::create_instance),
            ),
            (TimerIntent::Create.into(), boxed(timer::processors::create)),
            (TimerIntent::Trigger.into(), boxed(timer::processors::trigger)),
            (TimerIntent::Cancel.into(), boxed(timer::processors::cancel)),
            (JobIntent::Create.into(), boxed(job::processors::create)),
            (JobBatchIntent::Activate.into(), boxed(job::processors::activate)),
            (JobIntent::Complete.into(), boxed(job::processors::complete)),
            (JobIntent::Fail.into(), boxed(job::processors::fail)),
            (JobIntent::TimeOut.into(), boxed(job::processors::time_out)),
            (JobIntent::UpdateRetries.into(), boxed(job::processors::update_retries)),
            (JobIntent::Cancel.into(), boxed(job::processors::cancel)),
        ];
        for (intent, handler) in builtins {
            registry.handlers.insert((intent.value_type(), intent), handler);
        }
        registry
    }

    /// Register a handler for a command
    pub fn register(
        &mut self,
        value_type: ValueType,
        intent: impl Into<Intent>,
        handler: impl CommandHandler + 'static,
    ) -> Result<(), RegistryError> {
        let intent = intent.into();
        if intent.value_type() != value_type {
            return Err(RegistryError::MismatchedIntent { value_type, intent });
        }
        if self.handlers.contains_key(&(value_type, intent)) {
            return Err(RegistryError::AlreadyRegistered { value_type, intent });
        }
        self.handlers.insert((value_type, intent), Arc::new(handler));
        Ok(())
    }

    /// Look up the handler for a command
    pub fn get(&self, value_type: ValueType, intent: Intent) -> Option<&Arc<dyn CommandHandler>> {
        self.handlers.get(&(value_type, intent))
    }

    pub fn contains(&self, value_type: ValueType, intent: impl Into<Intent>) -> bool {
        self.handlers.contains_key(&(value_type, intent.into()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn boxed(handler: impl CommandHandler + 'static) -> Arc<dyn CommandHandler> {
    Arc::new(handler)
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<String> = self
            .handlers
            .keys()
            .map(|(value_type, intent)| format!("{value_type} {intent}"))
            .collect();
        commands.sort();
        f.debug_struct("HandlerRegistry")
            .field("commands", &commands)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::IncidentIntent;

    #[test]
    fn test_defaults_cover_all_commands() {
        let registry = HandlerRegistry::with_defaults();

        assert_eq!(registry.len(), 12);
        assert!(registry.contains(ValueType::Job, JobIntent::UpdateRetries));
        assert!(registry.contains(ValueType::Timer, TimerIntent::Trigger));
        assert!(!registry.contains(ValueType::Job, JobIntent::Completed));
        assert!(!registry.contains(ValueType::Incident, IncidentIntent::Resolved));
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = HandlerRegistry::new();
        let noop = |_: &Record, _: &mut ProcessingContext<'_>| {};

        registry.register(ValueType::Job, JobIntent::Complete, noop).unwrap();
        let err = registry
            .register(ValueType::Job, JobIntent::Complete, noop)
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));
    }

    #[test]
    fn test_register_rejects_mismatched_intent() {
        let mut registry = HandlerRegistry::new();
        let noop = |_: &Record, _: &mut ProcessingContext<'_>| {};

        let err = registry
            .register(ValueType::Timer, JobIntent::Complete, noop)
            .unwrap_err();
        assert_eq!(err.to_string(), "intent COMPLETE does not belong to value type TIMER");
    }

    #[test]
    fn test_debug_lists_commands() {
        let registry = HandlerRegistry::with_defaults();
        let debug = format!("{registry:?}");
        assert!(debug.contains("JOB COMPLETE"));
    }
}
