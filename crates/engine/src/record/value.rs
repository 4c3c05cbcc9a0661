//! Record payloads
//!
//! Each value type has exactly one payload struct. The payload travels in a
//! tagged union so a record can never carry a value of the wrong type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Key, ValueType};
use crate::serde_duration::{duration_millis, option_duration_millis};
use crate::timer::{Repetition, TimerDefinition};

/// Payload of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "value_type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordValue {
    Deployment(DeploymentRecord),
    ProcessInstance(ProcessInstanceRecord),
    Timer(TimerRecord),
    Job(JobRecord),
    JobBatch(JobBatchRecord),
    Incident(IncidentRecord),
}

impl RecordValue {
    /// Value type of the payload
    pub fn value_type(&self) -> ValueType {
        match self {
            RecordValue::Deployment(_) => ValueType::Deployment,
            RecordValue::ProcessInstance(_) => ValueType::ProcessInstance,
            RecordValue::Timer(_) => ValueType::Timer,
            RecordValue::Job(_) => ValueType::Job,
            RecordValue::JobBatch(_) => ValueType::JobBatch,
            RecordValue::Incident(_) => ValueType::Incident,
        }
    }

    pub fn as_deployment(&self) -> Option<&DeploymentRecord> {
        match self {
            RecordValue::Deployment(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_process_instance(&self) -> Option<&ProcessInstanceRecord> {
        match self {
            RecordValue::ProcessInstance(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_timer(&self) -> Option<&TimerRecord> {
        match self {
            RecordValue::Timer(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_job(&self) -> Option<&JobRecord> {
        match self {
            RecordValue::Job(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_job_batch(&self) -> Option<&JobBatchRecord> {
        match self {
            RecordValue::JobBatch(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_incident(&self) -> Option<&IncidentRecord> {
        match self {
            RecordValue::Incident(v) => Some(v),
            _ => None,
        }
    }
}

macro_rules! impl_into_value {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for RecordValue {
                fn from(value: $ty) -> Self {
                    RecordValue::$variant(value)
                }
            }
        )*
    };
}

impl_into_value! {
    DeploymentRecord => Deployment,
    ProcessInstanceRecord => ProcessInstance,
    TimerRecord => Timer,
    JobRecord => Job,
    JobBatchRecord => JobBatch,
    IncidentRecord => Incident,
}

// ============================================================================
// Deployment / process instance
// ============================================================================

/// Start event of a process that fires on a timer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerStartEvent {
    pub element_id: String,
    pub timer: TimerDefinition,
}

/// A deployed process definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub bpmn_process_id: String,

    /// Assigned by the engine; zero on the command
    #[serde(default)]
    pub version: u32,

    /// Assigned by the engine; absent on the command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_definition_key: Option<Key>,

    #[serde(default)]
    pub timer_start_events: Vec<TimerStartEvent>,
}

impl DeploymentRecord {
    pub fn new(bpmn_process_id: impl Into<String>) -> Self {
        Self {
            bpmn_process_id: bpmn_process_id.into(),
            version: 0,
            process_definition_key: None,
            timer_start_events: Vec::new(),
        }
    }

    pub fn with_timer_start(mut self, element_id: impl Into<String>, timer: TimerDefinition) -> Self {
        self.timer_start_events.push(TimerStartEvent {
            element_id: element_id.into(),
            timer,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstanceRecord {
    pub bpmn_process_id: String,

    #[serde(default)]
    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_definition_key: Option<Key>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_instance_key: Option<Key>,

    /// Start element that created the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,

    #[serde(default)]
    pub variables: serde_json::Value,
}

impl ProcessInstanceRecord {
    pub fn new(bpmn_process_id: impl Into<String>) -> Self {
        Self {
            bpmn_process_id: bpmn_process_id.into(),
            version: 0,
            process_definition_key: None,
            process_instance_key: None,
            element_id: None,
            variables: serde_json::Value::Null,
        }
    }
}

// ============================================================================
// Timer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerRecord {
    /// How to compute the due date; only present on CREATE commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<TimerDefinition>,

    /// Resolved due date; present on events and TRIGGER commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,

    #[serde(default)]
    pub repetition: Repetition,

    #[serde(
        default,
        with = "option_duration_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub period: Option<Duration>,

    pub target_element_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_definition_key: Option<Key>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_instance_key: Option<Key>,

    /// Absent for process start-event timers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_instance_key: Option<Key>,

    /// Evaluation context for expression timers
    #[serde(default)]
    pub variables: serde_json::Value,
}

impl TimerRecord {
    /// CREATE command payload for a timer bound to an element instance
    pub fn for_element(
        target_element_id: impl Into<String>,
        process_instance_key: Key,
        element_instance_key: Key,
        definition: TimerDefinition,
    ) -> Self {
        Self {
            definition: Some(definition),
            due_date: None,
            repetition: Repetition::None,
            period: None,
            target_element_id: target_element_id.into(),
            process_definition_key: None,
            process_instance_key: Some(process_instance_key),
            element_instance_key: Some(element_instance_key),
            variables: serde_json::Value::Null,
        }
    }

    pub fn with_variables(mut self, variables: serde_json::Value) -> Self {
        self.variables = variables;
        self
    }
}

// ============================================================================
// Job / job batch
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_type: String,

    #[serde(default)]
    pub retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,

    /// Lease deadline; on TIME_OUT commands this is the deadline that was observed as expired
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,

    /// Delay before a failed job becomes activatable again
    #[serde(
        default,
        with = "option_duration_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_backoff: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_instance_key: Option<Key>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,

    #[serde(default)]
    pub variables: serde_json::Value,
}

impl JobRecord {
    pub fn new(job_type: impl Into<String>, retries: u32) -> Self {
        Self {
            job_type: job_type.into(),
            retries,
            worker: None,
            deadline: None,
            retry_backoff: None,
            error_message: None,
            process_instance_key: None,
            element_id: None,
            variables: serde_json::Value::Null,
        }
    }

    pub fn with_process_instance(mut self, process_instance_key: Key) -> Self {
        self.process_instance_key = Some(process_instance_key);
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }
}

/// Request to activate jobs of one type, and the resulting activation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobBatchRecord {
    pub job_type: String,
    pub worker: String,

    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    pub max_jobs_to_activate: u32,

    #[serde(default)]
    pub job_keys: Vec<Key>,

    #[serde(default)]
    pub jobs: Vec<JobRecord>,
}

impl JobBatchRecord {
    pub fn new(
        job_type: impl Into<String>,
        worker: impl Into<String>,
        timeout: Duration,
        max_jobs_to_activate: u32,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            worker: worker.into(),
            timeout,
            max_jobs_to_activate,
            job_keys: Vec::new(),
            jobs: Vec::new(),
        }
    }
}

// ============================================================================
// Incident
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentErrorType {
    JobNoRetries,
    ExpressionEvaluation,
}

/// Lifecycle of an incident; resolving one marks it DELETED
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentState {
    #[default]
    Active,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub error_type: IncidentErrorType,
    pub error_message: String,

    #[serde(default)]
    pub state: IncidentState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_key: Option<Key>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_instance_key: Option<Key>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_instance_key: Option<Key>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
}
