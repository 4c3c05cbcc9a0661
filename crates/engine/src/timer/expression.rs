//! Expression evaluation seam
//!
//! Timer definitions may be expressions over process variables. The engine
//! only needs the result; evaluating the expression language is delegated to
//! an [`ExpressionEvaluator`].

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::cycle::TimerCycle;

/// Error raised by an expression evaluator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to evaluate expression at offset {offset}: {message}")]
pub struct ExpressionError {
    pub offset: usize,
    pub message: String,
}

impl ExpressionError {
    pub fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

/// Result of evaluating an expression
#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionValue {
    DateTime(DateTime<Utc>),
    Duration(Duration),
    Cycle(TimerCycle),
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
}

impl ExpressionValue {
    /// Name of the value's type, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            ExpressionValue::DateTime(_) => "date-time",
            ExpressionValue::Duration(_) => "duration",
            ExpressionValue::Cycle(_) => "cycle",
            ExpressionValue::String(_) => "string",
            ExpressionValue::Number(_) => "number",
            ExpressionValue::Boolean(_) => "boolean",
            ExpressionValue::Null => "null",
        }
    }
}

/// Evaluates expressions against a variable context
///
/// Evaluation must be a pure function of its inputs: it runs during command
/// processing and again during replay.
pub trait ExpressionEvaluator: Send + Sync + 'static {
    fn evaluate(
        &self,
        expression: &str,
        context: &serde_json::Value,
    ) -> Result<ExpressionValue, ExpressionError>;
}

/// Evaluator answering from a fixed table of expressions
///
/// # Example
///
/// ```
/// use conductor_engine::timer::{ExpressionEvaluator, ExpressionValue, StaticExpressionEvaluator};
///
/// let evaluator = StaticExpressionEvaluator::new()
///     .with_value("= reminder", ExpressionValue::String("PT5M".into()));
/// assert!(evaluator.evaluate("= reminder", &serde_json::Value::Null).is_ok());
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticExpressionEvaluator {
    results: HashMap<String, Result<ExpressionValue, ExpressionError>>,
}

impl StaticExpressionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, expression: impl Into<String>, value: ExpressionValue) -> Self {
        self.results.insert(expression.into(), Ok(value));
        self
    }

    pub fn with_error(mut self, expression: impl Into<String>, error: ExpressionError) -> Self {
        self.results.insert(expression.into(), Err(error));
        self
    }
}

impl ExpressionEvaluator for StaticExpressionEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        _context: &serde_json::Value,
    ) -> Result<ExpressionValue, ExpressionError> {
        self.results.get(expression).cloned().unwrap_or_else(|| {
            Err(ExpressionError::new(
                0,
                format!("no variable found for expression '{expression}'"),
            ))
        })
    }
}

/// Evaluator for deployments without an expression language; every evaluation fails
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableExpressionEvaluator;

impl ExpressionEvaluator for UnavailableExpressionEvaluator {
    fn evaluate(
        &self,
        _expression: &str,
        _context: &serde_json::Value,
    ) -> Result<ExpressionValue, ExpressionError> {
        Err(ExpressionError::new(0, "expression evaluation is not available"))
    }
}
