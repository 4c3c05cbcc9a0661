//! Operator batch operations
//!
//! An operator selects process instances and asks for an operation on each of
//! them. The request is validated and turned into SCHEDULED [`Operation`]s by
//! the [`BatchOperationService`]; the [`OperationExecutor`] later sends the
//! engine commands that carry the operation out and records the outcome on
//! the operation itself.
//!
//! ```text
//! BatchOperationRequest ─▶ BatchOperationService ─▶ OperationStore (SCHEDULED)
//!                                                        │
//!                              OperationExecutor ◀───────┘
//!                                │  dispatch: JOB UPDATE_RETRIES per incident ─▶ SENT
//!                                └─ settle:   responses ─▶ COMPLETED / FAILED
//! ```

mod executor;
mod model;
mod service;
mod store;

pub use executor::{OperationExecutor, OperationTask, Settlement};
pub use model::{Operation, OperationState, OperationType};
pub use service::{BatchOperationError, BatchOperationRequest, BatchOperationService, ResponseStatus};
pub use store::{InMemoryOperationStore, OperationStore, OperationStoreError};

use serde::{Deserialize, Serialize};

use crate::job::Incident;
use crate::process::ProcessInstance;
use crate::record::{JobRecord, Key};

/// Operation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationsConfig {
    /// Largest number of instances one request may select
    pub batch_operation_max_size: usize,

    /// Retries given to a job by UPDATE_RETRIES
    pub update_retries_value: u32,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            batch_operation_max_size: 1000,
            update_retries_value: 1,
        }
    }
}

impl OperationsConfig {
    pub fn with_batch_operation_max_size(mut self, max: usize) -> Self {
        self.batch_operation_max_size = max;
        self
    }

    pub fn with_update_retries_value(mut self, retries: u32) -> Self {
        self.update_retries_value = retries.max(1);
        self
    }
}

/// Selection of process instances
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceQuery {
    /// Restrict to these instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<Key>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpmn_process_id: Option<String>,

    /// Only instances with at least one open incident
    #[serde(default)]
    pub incidents_only: bool,
}

impl InstanceQuery {
    /// Every running instance
    pub fn all_running() -> Self {
        Self::default()
    }

    pub fn with_ids(mut self, ids: impl IntoIterator<Item = Key>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_bpmn_process_id(mut self, bpmn_process_id: impl Into<String>) -> Self {
        self.bpmn_process_id = Some(bpmn_process_id.into());
        self
    }

    pub fn with_incidents_only(mut self) -> Self {
        self.incidents_only = true;
        self
    }

    pub fn matches(&self, instance: &ProcessInstance, has_incident: bool) -> bool {
        self.ids.as_ref().map_or(true, |ids| ids.contains(&instance.key))
            && self
                .bpmn_process_id
                .as_ref()
                .map_or(true, |id| *id == instance.bpmn_process_id)
            && (!self.incidents_only || has_incident)
    }
}

/// Read-only query over process instances
pub trait InstanceSelector: Send + Sync + 'static {
    /// Keys of matching instances, in key order
    fn select(&self, query: &InstanceQuery) -> Vec<Key>;
}

/// Read-only view of open incidents
pub trait IncidentView: Send + Sync + 'static {
    /// Open incidents of a process instance, in key order
    fn active_incidents(&self, process_instance_key: Key) -> Vec<Incident>;

    /// Current record of a job that has not completed or been canceled
    fn job(&self, job_key: Key) -> Option<JobRecord>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(key: Key, process: &str) -> ProcessInstance {
        ProcessInstance {
            key,
            bpmn_process_id: process.into(),
            process_definition_key: 1,
            version: 1,
            element_id: None,
        }
    }

    #[test]
    fn test_query_filters() {
        let order = instance(10, "order");
        let invoice = instance(11, "invoice");

        assert!(InstanceQuery::all_running().matches(&order, false));
        assert!(!InstanceQuery::all_running().with_ids([11]).matches(&order, false));
        assert!(InstanceQuery::all_running()
            .with_bpmn_process_id("invoice")
            .matches(&invoice, false));
        assert!(!InstanceQuery::all_running().with_incidents_only().matches(&order, false));
        assert!(InstanceQuery::all_running().with_incidents_only().matches(&order, true));
    }

    #[test]
    fn test_config_defaults() {
        let config = OperationsConfig::default();
        assert_eq!(config.batch_operation_max_size, 1000);
        assert_eq!(config.update_retries_value, 1);
        assert_eq!(config.with_update_retries_value(0).update_retries_value, 1);
    }
}
