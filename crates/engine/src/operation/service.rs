//! Scheduling of batch operations

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use super::model::{Operation, OperationType};
use super::store::{OperationStore, OperationStoreError};
use super::{InstanceQuery, InstanceSelector, OperationsConfig};
use crate::clock::Clock;

/// Outcome class of a rejected request, for the transport in front of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    BadRequest,
    ServiceUnavailable,
}

/// Error type for batch operation requests
#[derive(Debug, thiserror::Error)]
pub enum BatchOperationError {
    #[error("Too many workflow instances are selected for batch operation. Maximum possible amount: {max}")]
    TooManyInstances { max: usize, selected: usize },

    #[error(transparent)]
    Store(#[from] OperationStoreError),
}

impl BatchOperationError {
    pub fn status(&self) -> ResponseStatus {
        match self {
            Self::TooManyInstances { .. } => ResponseStatus::BadRequest,
            Self::Store(_) => ResponseStatus::ServiceUnavailable,
        }
    }
}

/// Operator request: one operation for every instance any query selects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOperationRequest {
    pub queries: Vec<InstanceQuery>,
    pub operation_type: OperationType,
}

impl BatchOperationRequest {
    pub fn new(operation_type: OperationType, query: InstanceQuery) -> Self {
        Self {
            queries: vec![query],
            operation_type,
        }
    }

    pub fn with_query(mut self, query: InstanceQuery) -> Self {
        self.queries.push(query);
        self
    }
}

/// Validates operator requests and records their operations
pub struct BatchOperationService {
    store: Arc<dyn OperationStore>,
    selector: Arc<dyn InstanceSelector>,
    clock: Arc<dyn Clock>,
    config: OperationsConfig,
}

impl BatchOperationService {
    pub fn new(
        store: Arc<dyn OperationStore>,
        selector: Arc<dyn InstanceSelector>,
        clock: Arc<dyn Clock>,
        config: OperationsConfig,
    ) -> Self {
        Self {
            store,
            selector,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &OperationsConfig {
        &self.config
    }

    /// Create one SCHEDULED operation per selected instance
    ///
    /// Nothing is created when the selection exceeds the configured maximum.
    #[instrument(skip(self, request), fields(operation_type = %request.operation_type))]
    pub async fn schedule(
        &self,
        request: BatchOperationRequest,
    ) -> Result<Vec<Operation>, BatchOperationError> {
        let selected: BTreeSet<_> = request
            .queries
            .iter()
            .flat_map(|query| self.selector.select(query))
            .collect();

        let max = self.config.batch_operation_max_size;
        if selected.len() > max {
            return Err(BatchOperationError::TooManyInstances {
                max,
                selected: selected.len(),
            });
        }

        let batch_id = Uuid::now_v7();
        let now = self.clock.now();
        let operations: Vec<_> = selected
            .into_iter()
            .map(|key| Operation::scheduled(request.operation_type, key, batch_id, now))
            .collect();
        self.store.insert(operations.clone()).await?;

        info!(
            batch_id = %batch_id,
            count = operations.len(),
            "Batch operation scheduled"
        );
        Ok(operations)
    }
}

impl std::fmt::Debug for BatchOperationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOperationService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
