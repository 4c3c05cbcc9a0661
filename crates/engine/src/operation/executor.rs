//! Execution of scheduled operations

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::model::{Operation, OperationState, OperationType};
use super::store::{OperationStore, OperationStoreError};
use super::{IncidentView, OperationsConfig};
use crate::clock::Clock;
use crate::partition::{CommandGateway, CommandRequest, PendingResponse};
use crate::processor::Response;
use crate::record::{JobIntent, Key};
use crate::scheduler::{BatchProcessor, BatchScheduler, BatchSchedulerConfig, SchedulerError, WorkSource};

const NO_INCIDENTS_MESSAGE: &str = "No appropriate incidents found.";

impl From<OperationStoreError> for SchedulerError {
    fn from(e: OperationStoreError) -> Self {
        SchedulerError::Processing(e.to_string())
    }
}

/// How a SENT operation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    Failed(String),
}

/// One unit of executor work
#[derive(Debug, Clone, PartialEq)]
pub enum OperationTask {
    /// Send the commands of a SCHEDULED operation
    Dispatch(Operation),
    /// Record the outcome of a SENT operation whose responses are all in
    Settle(Operation, Settlement),
}

/// Commands sent for one operation and the responses received so far
struct InFlight {
    job_keys: Vec<Key>,
    pending: Vec<PendingResponse>,
    responses: Vec<Response>,
    dropped: bool,
}

impl InFlight {
    fn new(job_keys: Vec<Key>, pending: Vec<PendingResponse>) -> Self {
        Self {
            job_keys,
            pending,
            responses: Vec::new(),
            dropped: false,
        }
    }

    /// Collect arrived responses; the settlement once nothing is outstanding
    fn poll(&mut self) -> Option<Settlement> {
        let mut waiting = Vec::new();
        for mut pending in std::mem::take(&mut self.pending) {
            match pending.try_take() {
                None => waiting.push(pending),
                Some(Ok(response)) => self.responses.push(response),
                Some(Err(_)) => self.dropped = true,
            }
        }
        self.pending = waiting;

        if self.dropped {
            return Some(Settlement::Failed(
                "Response for a sent command was lost.".to_string(),
            ));
        }
        if !self.pending.is_empty() {
            return None;
        }
        match self.responses.iter().find(|r| r.is_rejection()) {
            Some(rejection) => Some(Settlement::Failed(rejection.rejection_reason.clone())),
            None => Some(Settlement::Completed),
        }
    }
}

/// Sends the engine commands of scheduled operations and records their outcome
///
/// Implements [`WorkSource`] so a [`BatchScheduler`] can drive it; tests call
/// [`execute_one_batch`](Self::execute_one_batch) instead.
pub struct OperationExecutor {
    store: Arc<dyn OperationStore>,
    incidents: Arc<dyn IncidentView>,
    gateway: Arc<CommandGateway>,
    clock: Arc<dyn Clock>,
    config: OperationsConfig,
    batch_size: usize,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
}

impl OperationExecutor {
    pub fn new(
        store: Arc<dyn OperationStore>,
        incidents: Arc<dyn IncidentView>,
        gateway: Arc<CommandGateway>,
        clock: Arc<dyn Clock>,
        config: OperationsConfig,
    ) -> Self {
        Self {
            store,
            incidents,
            gateway,
            clock,
            config,
            batch_size: BatchSchedulerConfig::default().max_batch_size,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Units handled by one `execute_one_batch` call
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Number of SENT operations still waiting for responses
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Run one round by hand: collect tasks, then execute them
    pub async fn execute_one_batch(&self) -> Result<usize, SchedulerError> {
        let tasks = self.collect_tasks(self.batch_size).await?;
        self.execute(tasks).await
    }

    /// Settlements of SENT operations first, then SCHEDULED operations
    async fn collect_tasks(&self, max: usize) -> Result<Vec<OperationTask>, SchedulerError> {
        let sent = self
            .store
            .fetch_in_state(OperationState::Sent, usize::MAX)
            .await
            .map_err(|e| SchedulerError::Source(e.to_string()))?;

        let mut tasks = Vec::new();
        {
            let mut in_flight = self.in_flight.lock();
            for operation in sent {
                if tasks.len() >= max {
                    break;
                }
                let Some(flight) = in_flight.get_mut(&operation.id) else {
                    continue;
                };
                if let Some(settlement) = flight.poll() {
                    tasks.push(OperationTask::Settle(operation, settlement));
                }
            }
        }

        if tasks.len() < max {
            let scheduled = self
                .store
                .fetch_in_state(OperationState::Scheduled, max - tasks.len())
                .await
                .map_err(|e| SchedulerError::Source(e.to_string()))?;
            tasks.extend(scheduled.into_iter().map(OperationTask::Dispatch));
        }
        Ok(tasks)
    }

    /// Execute tasks in order; returns how many were executed
    pub async fn execute(&self, tasks: Vec<OperationTask>) -> Result<usize, SchedulerError> {
        let mut executed = 0;
        for task in tasks {
            match task {
                OperationTask::Dispatch(operation) => self.dispatch(operation).await?,
                OperationTask::Settle(operation, settlement) => {
                    self.settle(operation, settlement).await?
                }
            }
            executed += 1;
        }
        Ok(executed)
    }

    #[instrument(skip(self, operation), fields(operation_id = %operation.id, target = operation.target_key))]
    async fn dispatch(&self, operation: Operation) -> Result<(), SchedulerError> {
        match operation.operation_type {
            OperationType::UpdateRetries => self.dispatch_update_retries(operation).await,
        }
    }

    async fn dispatch_update_retries(&self, operation: Operation) -> Result<(), SchedulerError> {
        // Commands went out but the operation was not recorded as SENT
        let already_sent = self
            .in_flight
            .lock()
            .get(&operation.id)
            .map(|flight| flight.job_keys.clone());
        if let Some(job_keys) = already_sent {
            self.store.update(operation.sent(job_keys)).await?;
            return Ok(());
        }

        let jobs: Vec<(Key, _)> = self
            .incidents
            .active_incidents(operation.target_key)
            .into_iter()
            .filter_map(|incident| incident.record.job_key)
            .filter_map(|job_key| self.incidents.job(job_key).map(|job| (job_key, job)))
            .collect();

        if jobs.is_empty() {
            warn!(
                operation_id = %operation.id,
                target = operation.target_key,
                "Operation failed: no appropriate incidents"
            );
            let failed = operation.failed(NO_INCIDENTS_MESSAGE, self.clock.now());
            self.store.update(failed).await?;
            return Ok(());
        }

        let mut job_keys = Vec::new();
        let mut pending = Vec::new();
        for (job_key, mut job) in jobs {
            job.retries = self.config.update_retries_value;
            let request = CommandRequest::new(JobIntent::UpdateRetries, job).with_key(job_key);
            match self.gateway.send(request).await {
                Ok(response) => {
                    job_keys.push(job_key);
                    pending.push(response);
                }
                Err(e) if pending.is_empty() => {
                    return Err(SchedulerError::Processing(e.to_string()));
                }
                Err(e) => {
                    warn!(
                        operation_id = %operation.id,
                        job_key,
                        error = %e,
                        "Failed to send command, operation continues with the commands already sent"
                    );
                    break;
                }
            }
        }

        debug!(
            operation_id = %operation.id,
            jobs = job_keys.len(),
            "Operation sent"
        );
        self.in_flight
            .lock()
            .insert(operation.id, InFlight::new(job_keys.clone(), pending));
        self.store.update(operation.sent(job_keys)).await?;
        Ok(())
    }

    async fn settle(&self, operation: Operation, settlement: Settlement) -> Result<(), SchedulerError> {
        let id = operation.id;
        let now = self.clock.now();
        let settled = match settlement {
            Settlement::Completed => {
                debug!(operation_id = %id, "Operation completed");
                operation.completed(now)
            }
            Settlement::Failed(message) => {
                warn!(operation_id = %id, error = %message, "Operation failed");
                operation.failed(message, now)
            }
        };
        self.store.update(settled).await?;
        self.in_flight.lock().remove(&id);
        Ok(())
    }

    /// A batch scheduler that drives this executor
    pub fn scheduler(self: &Arc<Self>, config: BatchSchedulerConfig) -> BatchScheduler<OperationExecutor> {
        let executor = Arc::clone(self);
        let processor: BatchProcessor<OperationTask> = Arc::new(move |tasks| {
            let executor = Arc::clone(&executor);
            async move { executor.execute(tasks).await }.boxed()
        });
        BatchScheduler::new("operation-executor", Arc::clone(self), processor, config)
    }
}

#[async_trait]
impl WorkSource for OperationExecutor {
    type Unit = OperationTask;

    async fn pull(&self, max: usize) -> Result<Vec<OperationTask>, SchedulerError> {
        self.collect_tasks(max).await
    }
}

impl std::fmt::Debug for OperationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationExecutor")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight_count())
            .finish_non_exhaustive()
    }
}
