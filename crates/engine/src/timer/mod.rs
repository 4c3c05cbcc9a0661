//! Timers
//!
//! A timer is created from a [`TimerDefinition`], resolved once against the
//! processing time of its CREATE command into a due date, and kept in the
//! [`TimerScheduler`] until it is triggered or canceled. Repeating timers
//! schedule their successor at `previous due date + period`, so a clock jump
//! produces every elapsed firing rather than collapsing them.

mod cycle;
mod expression;
pub(crate) mod processors;
mod scheduler;

pub use cycle::{format_duration, parse_cycle, parse_duration, CycleParseError, Repetition, TimerCycle};
pub use expression::{
    ExpressionError, ExpressionEvaluator, ExpressionValue, StaticExpressionEvaluator,
    UnavailableExpressionEvaluator,
};
pub use scheduler::{Timer, TimerScheduler};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::add_duration;

/// How a timer's due date is computed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TimerDefinition {
    /// RFC 3339 instant
    Date(String),
    /// ISO-8601 duration from the processing time
    Duration(String),
    /// ISO-8601 repeating interval
    Cycle(String),
    /// Expression producing a date
    DateExpression(String),
    /// Expression producing a duration
    DurationExpression(String),
    /// Expression producing a repeating interval
    CycleExpression(String),
}

impl TimerDefinition {
    pub fn is_expression(&self) -> bool {
        matches!(
            self,
            TimerDefinition::DateExpression(_)
                | TimerDefinition::DurationExpression(_)
                | TimerDefinition::CycleExpression(_)
        )
    }

    /// Resolve the definition against `now`
    ///
    /// Dates in the past resolve to `now`, so such timers fire on the next check.
    pub fn resolve(
        &self,
        now: DateTime<Utc>,
        evaluator: &dyn ExpressionEvaluator,
        variables: &serde_json::Value,
    ) -> Result<ResolvedTimer, TimerDefinitionError> {
        match self {
            TimerDefinition::Date(text) => Ok(ResolvedTimer::at(parse_date(text)?, now)),
            TimerDefinition::Duration(text) => {
                let duration = parse_duration(text).map_err(TimerDefinitionError::Parse)?;
                Ok(ResolvedTimer::after(duration, now))
            }
            TimerDefinition::Cycle(text) => {
                let cycle = parse_cycle(text).map_err(TimerDefinitionError::Parse)?;
                Ok(ResolvedTimer::cycle(cycle, now))
            }
            TimerDefinition::DateExpression(expr) => {
                match evaluate(evaluator, expr, variables)? {
                    ExpressionValue::DateTime(date) => Ok(ResolvedTimer::at(date, now)),
                    ExpressionValue::String(text) => Ok(ResolvedTimer::at(parse_date(&text)?, now)),
                    other => Err(TimerDefinitionError::unexpected(expr, "date-time", &other)),
                }
            }
            TimerDefinition::DurationExpression(expr) => {
                match evaluate(evaluator, expr, variables)? {
                    ExpressionValue::Duration(duration) => Ok(ResolvedTimer::after(duration, now)),
                    ExpressionValue::String(text) => {
                        let duration = parse_duration(&text).map_err(TimerDefinitionError::Parse)?;
                        Ok(ResolvedTimer::after(duration, now))
                    }
                    other => Err(TimerDefinitionError::unexpected(expr, "duration", &other)),
                }
            }
            TimerDefinition::CycleExpression(expr) => {
                match evaluate(evaluator, expr, variables)? {
                    ExpressionValue::Cycle(cycle) => Ok(ResolvedTimer::cycle(cycle, now)),
                    ExpressionValue::String(text) => {
                        let cycle = parse_cycle(&text).map_err(TimerDefinitionError::Parse)?;
                        Ok(ResolvedTimer::cycle(cycle, now))
                    }
                    other => Err(TimerDefinitionError::unexpected(expr, "cycle", &other)),
                }
            }
        }
    }
}

fn evaluate(
    evaluator: &dyn ExpressionEvaluator,
    expression: &str,
    variables: &serde_json::Value,
) -> Result<ExpressionValue, TimerDefinitionError> {
    evaluator
        .evaluate(expression, variables)
        .map_err(|source| TimerDefinitionError::Expression {
            expression: expression.to_string(),
            source,
        })
}

fn parse_date(text: &str) -> Result<DateTime<Utc>, TimerDefinitionError> {
    DateTime::parse_from_rfc3339(text)
        .map(|date| date.with_timezone(&Utc))
        .map_err(|e| TimerDefinitionError::InvalidDate {
            value: text.to_string(),
            reason: e.to_string(),
        })
}

/// Error resolving a timer definition
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TimerDefinitionError {
    #[error("{0}")]
    Parse(#[from] CycleParseError),

    #[error("invalid timer date '{value}': {reason}")]
    InvalidDate { value: String, reason: String },

    #[error("expression '{expression}' could not be evaluated: {source}")]
    Expression {
        expression: String,
        #[source]
        source: ExpressionError,
    },

    #[error("expected expression '{expression}' to produce a {expected}, but it produced a {actual}")]
    UnexpectedResult {
        expression: String,
        expected: &'static str,
        actual: &'static str,
    },
}

impl TimerDefinitionError {
    fn unexpected(expression: &str, expected: &'static str, actual: &ExpressionValue) -> Self {
        TimerDefinitionError::UnexpectedResult {
            expression: expression.to_string(),
            expected,
            actual: actual.type_name(),
        }
    }
}

/// A timer definition resolved against a processing time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTimer {
    pub due_date: DateTime<Utc>,
    pub repetition: Repetition,
    pub period: Option<Duration>,
}

impl ResolvedTimer {
    fn at(date: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            due_date: date.max(now),
            repetition: Repetition::None,
            period: None,
        }
    }

    fn after(duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            due_date: add_duration(now, duration),
            repetition: Repetition::None,
            period: None,
        }
    }

    fn cycle(cycle: TimerCycle, now: DateTime<Utc>) -> Self {
        Self {
            due_date: add_duration(now, cycle.period),
            repetition: cycle.repetition,
            period: Some(cycle.period),
        }
    }
}
