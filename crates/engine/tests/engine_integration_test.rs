//! End-to-end tests of a partition with its timers, jobs and batch operations
//!
//! Run with: cargo test -p conductor-engine --test engine_integration_test

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use conductor_engine::job::JobState;
use conductor_engine::operation::{
    BatchOperationRequest, BatchOperationService, InMemoryOperationStore, InstanceQuery,
    OperationExecutor, OperationState, OperationStore, OperationType, OperationsConfig,
    ResponseStatus,
};
use conductor_engine::prelude::*;
use conductor_engine::record::{
    DeploymentRecord, IncidentIntent, IncidentState, JobBatchRecord, JobRecord, Key,
    ProcessInstanceRecord, TimerRecord,
};

// ============================================
// Harness
// ============================================

struct Engine {
    log: Arc<InMemoryRecordLog>,
    clock: Arc<ControlledClock>,
    partition: Arc<Partition>,
    gateway: Arc<CommandGateway>,
}

impl Engine {
    async fn start() -> Self {
        let log = Arc::new(InMemoryRecordLog::new());
        let clock = Arc::new(ControlledClock::default());
        Self::open(log, clock).await
    }

    async fn open(log: Arc<InMemoryRecordLog>, clock: Arc<ControlledClock>) -> Self {
        let partition = Arc::new(
            Partition::open(
                log.clone(),
                clock.clone(),
                Arc::new(UnavailableExpressionEvaluator),
                PartitionConfig::default(),
            )
            .await
            .unwrap(),
        );
        let gateway = Arc::new(CommandGateway::new(Arc::clone(&partition), 1));
        Self {
            log,
            clock,
            partition,
            gateway,
        }
    }

    /// Submit a command, process until idle and return its response
    async fn command(&self, request: CommandRequest) -> Response {
        let pending = self.gateway.send(request).await.unwrap();
        self.partition.process_until_idle().await.unwrap();
        pending.wait().await.unwrap()
    }

    async fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
        self.partition.process_until_idle().await.unwrap();
    }

    async fn deploy_and_start(&self, instances: usize) -> Vec<Key> {
        self.command(CommandRequest::new(
            DeploymentIntent::Create,
            DeploymentRecord::new("order"),
        ))
        .await;
        let mut keys = Vec::new();
        for _ in 0..instances {
            let response = self
                .command(CommandRequest::new(
                    ProcessInstanceIntent::Create,
                    ProcessInstanceRecord::new("order"),
                ))
                .await;
            keys.push(response.key.unwrap());
        }
        keys
    }

    /// Create a job for `instance`, activate it and fail it with no retries left
    async fn raise_incident(&self, instance: Key) -> Key {
        let created = self
            .command(CommandRequest::new(
                JobIntent::Create,
                JobRecord::new("payment", 1).with_process_instance(instance),
            ))
            .await;
        let job_key = created.key.unwrap();
        self.command(CommandRequest::new(
            JobBatchIntent::Activate,
            JobBatchRecord::new("payment", "worker-1", Duration::from_secs(60), 10),
        ))
        .await;
        let failed = self
            .command(
                CommandRequest::new(
                    JobIntent::Fail,
                    JobRecord::new("payment", 0).with_error_message("card declined"),
                )
                .with_key(job_key),
            )
            .await;
        assert_eq!(failed.intent, JobIntent::Failed.into());
        job_key
    }

    fn events(&self, intent: impl Into<Intent>) -> Vec<Record> {
        let intent = intent.into();
        self.log
            .records()
            .into_iter()
            .filter(|r| r.is_event() && r.intent == intent)
            .collect()
    }

    fn job_state(&self, key: Key) -> Option<JobState> {
        self.partition
            .read_state(|s| s.jobs().get(key).map(|job| job.state))
    }
}

fn timer_for(instance: Key, element_instance: Key, definition: TimerDefinition) -> CommandRequest {
    CommandRequest::new(
        TimerIntent::Create,
        TimerRecord::for_element("wait", instance, element_instance, definition),
    )
}

fn due_dates(records: &[Record]) -> Vec<DateTime<Utc>> {
    records
        .iter()
        .filter_map(|r| r.value.as_timer().and_then(|t| t.due_date))
        .collect()
}

// ============================================
// Determinism
// ============================================

async fn scripted_run() -> Engine {
    let engine = Engine::start().await;
    let instances = engine.deploy_and_start(2).await;
    engine
        .command(timer_for(instances[0], 100, TimerDefinition::Cycle("R3/PT5S".into())))
        .await;
    engine.raise_incident(instances[1]).await;
    engine.advance(12).await;
    engine
}

#[tokio::test]
async fn test_replay_produces_identical_records_and_state() {
    let first = scripted_run().await;
    let second = scripted_run().await;

    assert_eq!(first.log.records(), second.log.records());
    assert_eq!(first.partition.state_snapshot(), second.partition.state_snapshot());

    // Reopening reprocesses the log and checks every follow-up against it
    let reopened = Engine::open(first.log.clone(), first.clock.clone()).await;
    assert_eq!(reopened.partition.state_snapshot(), first.partition.state_snapshot());
}

#[tokio::test]
async fn test_keys_continue_after_reopen() {
    let engine = Engine::start().await;
    let before = engine.deploy_and_start(1).await;

    let reopened = Engine::open(engine.log.clone(), engine.clock.clone()).await;
    let response = reopened
        .command(CommandRequest::new(
            ProcessInstanceIntent::Create,
            ProcessInstanceRecord::new("order"),
        ))
        .await;

    assert!(response.key.unwrap() > before[0]);
}

// ============================================
// Timers
// ============================================

#[tokio::test]
async fn test_due_timers_fire_in_due_order_then_creation_order() {
    let engine = Engine::start().await;
    let instance = engine.deploy_and_start(1).await[0];

    let late_first = engine
        .command(timer_for(instance, 1, TimerDefinition::Duration("PT5S".into())))
        .await
        .key
        .unwrap();
    let early = engine
        .command(timer_for(instance, 2, TimerDefinition::Duration("PT2S".into())))
        .await
        .key
        .unwrap();
    let late_second = engine
        .command(timer_for(instance, 3, TimerDefinition::Duration("PT5S".into())))
        .await
        .key
        .unwrap();

    engine.advance(10).await;

    let fired: Vec<_> = engine
        .events(TimerIntent::Triggered)
        .iter()
        .filter_map(|r| r.key)
        .collect();
    assert_eq!(fired, vec![early, late_first, late_second]);

    let dues = due_dates(&engine.events(TimerIntent::Triggered));
    assert!(dues.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test]
async fn test_repeating_timer_fires_exactly_its_repetitions() {
    let engine = Engine::start().await;
    let instance = engine.deploy_and_start(1).await[0];
    let t0 = engine.clock.now();

    engine
        .command(timer_for(instance, 1, TimerDefinition::Cycle("R2/PT3S".into())))
        .await;

    engine.advance(3).await;
    assert_eq!(engine.events(TimerIntent::Triggered).len(), 1);

    engine.advance(3).await;
    engine.advance(30).await;

    let triggered = engine.events(TimerIntent::Triggered);
    assert_eq!(
        due_dates(&triggered),
        vec![
            t0 + chrono::Duration::seconds(3),
            t0 + chrono::Duration::seconds(6)
        ]
    );
    assert!(engine.partition.read_state(|s| s.timers().is_empty()));
}

#[tokio::test]
async fn test_clock_jump_emits_every_elapsed_firing() {
    let engine = Engine::start().await;
    let instance = engine.deploy_and_start(1).await[0];

    engine
        .command(timer_for(instance, 1, TimerDefinition::Cycle("R/PT1S".into())))
        .await;
    engine.advance(5).await;

    assert_eq!(engine.events(TimerIntent::Triggered).len(), 5);
    // The infinite cycle keeps exactly one pending timer
    assert_eq!(engine.partition.read_state(|s| s.timers().len()), 1);
}

#[tokio::test]
async fn test_clock_jump_interleaves_successors_with_one_shot_timers() {
    let engine = Engine::start().await;
    let instance = engine.deploy_and_start(1).await[0];
    let t0 = engine.clock.now();

    engine
        .command(timer_for(instance, 1, TimerDefinition::Cycle("R/PT0.5S".into())))
        .await;
    engine
        .command(timer_for(instance, 2, TimerDefinition::Duration("PT1.2S".into())))
        .await;

    engine.clock.advance(Duration::from_secs(2));
    engine.partition.process_until_idle().await.unwrap();

    let offsets: Vec<_> = due_dates(&engine.events(TimerIntent::Triggered))
        .into_iter()
        .map(|due| (due - t0).num_milliseconds())
        .collect();
    assert_eq!(offsets, vec![500, 1000, 1200, 1500, 2000]);
}

#[tokio::test]
async fn test_redeploy_cancels_previous_start_timers() {
    let engine = Engine::start().await;
    engine
        .command(CommandRequest::new(
            DeploymentIntent::Create,
            DeploymentRecord::new("billing")
                .with_timer_start("nightly", TimerDefinition::Cycle("R/PT1H".into())),
        ))
        .await;
    engine
        .command(CommandRequest::new(
            DeploymentIntent::Create,
            DeploymentRecord::new("billing"),
        ))
        .await;

    assert_eq!(engine.events(TimerIntent::Canceled).len(), 1);
    assert!(engine.partition.read_state(|s| s.timers().is_empty()));

    engine.advance(7200).await;
    assert!(engine.events(TimerIntent::Triggered).is_empty());
}

// ============================================
// Jobs
// ============================================

#[tokio::test]
async fn test_exhausted_retries_resolved_by_update_retries() {
    let engine = Engine::start().await;
    let instance = engine.deploy_and_start(1).await[0];
    let job_key = engine.raise_incident(instance).await;

    assert_eq!(engine.job_state(job_key), Some(JobState::Failed));
    assert_eq!(engine.events(IncidentIntent::Created).len(), 1);

    let response = engine
        .command(
            CommandRequest::new(JobIntent::UpdateRetries, JobRecord::new("payment", 3))
                .with_key(job_key),
        )
        .await;

    assert_eq!(response.intent, JobIntent::RetriesUpdated.into());
    let resolved = engine.events(IncidentIntent::Resolved);
    assert_eq!(resolved.len(), 1);
    assert_eq!(
        resolved[0].value.as_incident().map(|i| i.state),
        Some(IncidentState::Deleted)
    );
    let incident_key = resolved[0].key.unwrap();
    assert_eq!(
        engine
            .partition
            .read_state(|s| s.incidents().get(incident_key).map(|i| i.record.state)),
        Some(IncidentState::Deleted)
    );
    assert_eq!(engine.job_state(job_key), Some(JobState::Activatable));
    assert_eq!(
        engine
            .partition
            .read_state(|s| s.jobs().get(job_key).map(|j| j.retries)),
        Some(3)
    );
}

async fn activated_job(engine: &Engine) -> Key {
    let job_key = engine
        .command(CommandRequest::new(JobIntent::Create, JobRecord::new("payment", 2)))
        .await
        .key
        .unwrap();
    let batch = engine
        .command(CommandRequest::new(
            JobBatchIntent::Activate,
            JobBatchRecord::new("payment", "worker-1", Duration::from_secs(30), 1),
        ))
        .await;
    assert_eq!(batch.value.as_job_batch().unwrap().job_keys, vec![job_key]);
    job_key
}

#[tokio::test]
async fn test_expired_lease_reclaimed_exactly_once() {
    let engine = Engine::start().await;
    let job_key = activated_job(&engine).await;

    engine.advance(31).await;
    engine.advance(31).await;

    assert_eq!(engine.events(JobIntent::TimedOut).len(), 1);
    assert_eq!(engine.job_state(job_key), Some(JobState::Activatable));
    assert_eq!(
        engine
            .partition
            .read_state(|s| s.jobs().get(job_key).map(|j| j.retries)),
        Some(2)
    );
}

#[tokio::test]
async fn test_late_completion_wins_when_applied_first() {
    let engine = Engine::start().await;
    let job_key = activated_job(&engine).await;

    engine.clock.advance(Duration::from_secs(31));
    // Appended before the round's lease sweep, so it is applied first
    let completion = engine
        .gateway
        .send(CommandRequest::new(JobIntent::Complete, JobRecord::new("payment", 2)).with_key(job_key))
        .await
        .unwrap();
    engine.partition.process_until_idle().await.unwrap();

    assert_eq!(completion.wait().await.unwrap().intent, JobIntent::Completed.into());
    assert_eq!(engine.events(JobIntent::Completed).len(), 1);
    assert!(engine.events(JobIntent::TimedOut).is_empty());
}

#[tokio::test]
async fn test_completion_rejected_after_reclaim() {
    let engine = Engine::start().await;
    let job_key = activated_job(&engine).await;

    engine.advance(31).await;
    let response = engine
        .command(CommandRequest::new(JobIntent::Complete, JobRecord::new("payment", 2)).with_key(job_key))
        .await;

    assert!(response.is_rejection());
    assert_eq!(response.rejection_type, Some(RejectionType::InvalidState));
    assert_eq!(engine.events(JobIntent::TimedOut).len(), 1);
    assert!(engine.events(JobIntent::Completed).is_empty());
}

// ============================================
// Recovery
// ============================================

#[test_log::test(tokio::test)]
async fn test_storage_failure_is_retried_without_losing_commands() {
    let engine = Engine::start().await;
    let pending = engine
        .gateway
        .send(CommandRequest::new(JobIntent::Create, JobRecord::new("payment", 1)))
        .await
        .unwrap();

    engine.log.fail_next_appends(2);
    assert!(engine.partition.process_round().await.is_err());
    assert!(engine.partition.process_round().await.is_err());
    engine.partition.process_until_idle().await.unwrap();

    let response = pending.wait().await.unwrap();
    assert_eq!(response.intent, JobIntent::Created.into());
    assert_eq!(engine.events(JobIntent::Created).len(), 1);
    assert_eq!(engine.partition.read_state(|s| s.jobs().len()), 1);
}

// ============================================
// Batch operations
// ============================================

struct Operations {
    store: Arc<InMemoryOperationStore>,
    service: BatchOperationService,
    executor: Arc<OperationExecutor>,
}

fn operations(engine: &Engine, config: OperationsConfig) -> Operations {
    let store = Arc::new(InMemoryOperationStore::new());
    let service = BatchOperationService::new(
        store.clone(),
        engine.partition.clone(),
        engine.clock.clone(),
        config.clone(),
    );
    let executor = Arc::new(OperationExecutor::new(
        store.clone(),
        engine.partition.clone(),
        engine.gateway.clone(),
        engine.clock.clone(),
        config,
    ));
    Operations {
        store,
        service,
        executor,
    }
}

fn update_retries(query: InstanceQuery) -> BatchOperationRequest {
    BatchOperationRequest::new(OperationType::UpdateRetries, query)
}

#[tokio::test]
async fn test_batch_size_guard_creates_no_operations() {
    let engine = Engine::start().await;
    engine.deploy_and_start(10).await;
    let ops = operations(
        &engine,
        OperationsConfig::default().with_batch_operation_max_size(5),
    );

    let err = ops
        .service
        .schedule(update_retries(InstanceQuery::all_running()))
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "Too many workflow instances are selected for batch operation. Maximum possible amount: 5"
    );
    assert_eq!(err.status(), ResponseStatus::BadRequest);
    assert!(ops.store.is_empty());
}

#[tokio::test]
async fn test_scheduled_operations_are_persisted() {
    let engine = Engine::start().await;
    engine.deploy_and_start(10).await;
    let ops = operations(&engine, OperationsConfig::default());

    ops.service
        .schedule(update_retries(InstanceQuery::all_running()))
        .await
        .unwrap();

    let stored = ops.store.all();
    assert_eq!(stored.len(), 10);
    assert!(stored.iter().all(|op| op.operation_type == OperationType::UpdateRetries));
    assert!(stored.iter().all(|op| op.state == OperationState::Scheduled));
    assert!(stored.iter().all(|op| op.end_date.is_none()));
}

#[tokio::test]
async fn test_update_retries_operation_lifecycle() {
    let engine = Engine::start().await;
    let instance = engine.deploy_and_start(1).await[0];
    let job_key = engine.raise_incident(instance).await;
    let ops = operations(&engine, OperationsConfig::default());

    let scheduled = ops
        .service
        .schedule(update_retries(InstanceQuery::all_running().with_ids([instance])))
        .await
        .unwrap();
    let id = scheduled[0].id;

    ops.executor.execute_one_batch().await.unwrap();
    let sent = ops.store.get(id).await.unwrap().unwrap();
    assert_eq!(sent.state, OperationState::Sent);
    assert!(sent.end_date.is_none());

    engine.partition.process_until_idle().await.unwrap();
    ops.executor.execute_one_batch().await.unwrap();

    let completed = ops.store.get(id).await.unwrap().unwrap();
    assert_eq!(completed.state, OperationState::Completed);
    assert!(completed.end_date.is_some());
    assert_eq!(engine.events(IncidentIntent::Resolved).len(), 1);
    assert_eq!(engine.job_state(job_key), Some(JobState::Activatable));
}

#[tokio::test]
async fn test_operation_without_incidents_fails() {
    let engine = Engine::start().await;
    let instance = engine.deploy_and_start(1).await[0];
    let ops = operations(&engine, OperationsConfig::default());

    let scheduled = ops
        .service
        .schedule(update_retries(InstanceQuery::all_running().with_ids([instance])))
        .await
        .unwrap();
    ops.executor.execute_one_batch().await.unwrap();

    let failed = ops.store.get(scheduled[0].id).await.unwrap().unwrap();
    assert_eq!(failed.state, OperationState::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("No appropriate incidents found."));
    assert!(failed.end_date.is_some());
}

#[test_log::test(tokio::test)]
async fn test_schedulers_drive_operations_to_completion() {
    let engine = Engine::start().await;
    let instance = engine.deploy_and_start(1).await[0];
    engine.raise_incident(instance).await;
    let ops = operations(&engine, OperationsConfig::default());

    let config = BatchSchedulerConfig::default().with_idle_backoff(Duration::from_millis(5));
    let partition_scheduler = engine.partition.scheduler(config.clone());
    let executor_scheduler = ops.executor.scheduler(config);
    partition_scheduler.start().unwrap();
    executor_scheduler.start().unwrap();

    let scheduled = ops
        .service
        .schedule(update_retries(InstanceQuery::all_running().with_incidents_only()))
        .await
        .unwrap();

    let mut state = OperationState::Scheduled;
    for _ in 0..50 {
        executor_scheduler.wait_for_idle_round().await.unwrap();
        state = ops.store.get(scheduled[0].id).await.unwrap().unwrap().state;
        if state.is_terminal() {
            break;
        }
    }

    executor_scheduler.stop().await;
    partition_scheduler.stop().await;
    assert_eq!(state, OperationState::Completed);
}
