//! Value types and intents
//!
//! An intent is only meaningful together with its value type, so [`Intent`]
//! is a union of per-type intent enums. Command intents and event intents
//! share each enum, mirroring how they share a log.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of payload a record carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Deployment,
    ProcessInstance,
    Timer,
    Job,
    JobBatch,
    Incident,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Deployment => "DEPLOYMENT",
            ValueType::ProcessInstance => "PROCESS_INSTANCE",
            ValueType::Timer => "TIMER",
            ValueType::Job => "JOB",
            ValueType::JobBatch => "JOB_BATCH",
            ValueType::Incident => "INCIDENT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentIntent {
    // Commands
    Create,
    // Events
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessInstanceIntent {
    // Commands
    Create,
    // Events
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerIntent {
    // Commands
    Create,
    Trigger,
    Cancel,
    // Events
    Created,
    Triggered,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobIntent {
    // Commands
    Create,
    Complete,
    Fail,
    TimeOut,
    UpdateRetries,
    Cancel,
    // Events
    Created,
    Activatable,
    Completed,
    Failed,
    TimedOut,
    RetriesUpdated,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobBatchIntent {
    // Commands
    Activate,
    // Events
    Activated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentIntent {
    // Events
    Created,
    Resolved,
}

/// Intent of a record, scoped by its value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "value_type", content = "intent", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    Deployment(DeploymentIntent),
    ProcessInstance(ProcessInstanceIntent),
    Timer(TimerIntent),
    Job(JobIntent),
    JobBatch(JobBatchIntent),
    Incident(IncidentIntent),
}

impl Intent {
    /// Value type this intent belongs to
    pub fn value_type(&self) -> ValueType {
        match self {
            Intent::Deployment(_) => ValueType::Deployment,
            Intent::ProcessInstance(_) => ValueType::ProcessInstance,
            Intent::Timer(_) => ValueType::Timer,
            Intent::Job(_) => ValueType::Job,
            Intent::JobBatch(_) => ValueType::JobBatch,
            Intent::Incident(_) => ValueType::Incident,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Debug names are the variant names; render them the way they appear on the wire
        let name = match self {
            Intent::Deployment(i) => format!("{i:?}"),
            Intent::ProcessInstance(i) => format!("{i:?}"),
            Intent::Timer(i) => format!("{i:?}"),
            Intent::Job(i) => format!("{i:?}"),
            Intent::JobBatch(i) => format!("{i:?}"),
            Intent::Incident(i) => format!("{i:?}"),
        };
        f.write_str(&screaming_snake(&name))
    }
}

fn screaming_snake(camel: &str) -> String {
    let mut out = String::with_capacity(camel.len() + 4);
    for (i, ch) in camel.chars().enumerate() {
        if ch.is_uppercase() && i > 0 {
            out.push('_');
        }
        out.push(ch.to_ascii_uppercase());
    }
    out
}

macro_rules! impl_into_intent {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Intent {
                fn from(intent: $ty) -> Self {
                    Intent::$variant(intent)
                }
            }
        )*
    };
}

impl_into_intent! {
    DeploymentIntent => Deployment,
    ProcessInstanceIntent => ProcessInstance,
    TimerIntent => Timer,
    JobIntent => Job,
    JobBatchIntent => JobBatch,
    IncidentIntent => Incident,
}
