//! Partition: the single writer of one record log
//!
//! ```text
//!   CommandGateway ──submit──▶ RecordLog ◀──append follow-ups──┐
//!                                 │                            │
//!   due-date checker ──TRIGGER──▶ │                            │
//!   lease sweep ─────TIME_OUT───▶ │                            │
//!                                 ▼                            │
//!                   unprocessed commands ──▶ StreamProcessor ──┘
//!                                                  │
//!                                                  ▼
//!                                 ResponseRouter ──▶ PendingResponse
//! ```
//!
//! Commands are applied strictly one at a time. The processor lock is never
//! held across a log call: state is mutated in memory, then the follow-ups
//! are appended. If that append fails, the in-memory state is ahead of the
//! log, so the partition rebuilds it from the log before the next round.

mod router;
mod views;

pub use router::{CommandGateway, CommandRequest, GatewayError, PendingResponse, ResponseRouter};
pub use views::PartitionSource;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::log::{LogError, RecordLog};
use crate::processor::{EngineState, HandlerRegistry, StreamProcessor, MAX_PARTITION_ID};
use crate::record::{
    JobIntent, Key, Position, Record, RecordDraft, RequestCorrelation, TimerIntent,
};
use crate::scheduler::{BatchProcessor, BatchScheduler, BatchSchedulerConfig, SchedulerError};
use crate::timer::ExpressionEvaluator;

/// Records read from the log per call while scanning
const READ_CHUNK_SIZE: usize = 256;

// ============================================
// Configuration
// ============================================

/// Partition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Partition id; embedded in every key the partition allocates, at most
    /// `MAX_PARTITION_ID`
    pub partition_id: u16,

    /// Upper bound of commands applied by one `process_round`
    pub max_commands_per_round: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            partition_id: 1,
            max_commands_per_round: 100,
        }
    }
}

impl PartitionConfig {
    pub fn with_partition_id(mut self, partition_id: u16) -> Self {
        self.partition_id = partition_id;
        self
    }

    pub fn with_max_commands_per_round(mut self, max: usize) -> Self {
        self.max_commands_per_round = max.max(1);
        self
    }
}

// ============================================
// Errors
// ============================================

/// Error type for partition operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Log(#[from] LogError),

    /// Reprocessing a command produced different follow-ups than the log holds
    #[error("non-deterministic processing of command at position {position}: {details}")]
    Replay { position: Position, details: String },

    #[error("partition {0} is already processing")]
    RoundInProgress(u16),

    #[error("partition id {partition_id} does not fit in a key, the maximum is {max}")]
    InvalidPartitionId { partition_id: u16, max: u16 },

    #[error("request {} on stream {} is already pending", .0.request_id, .0.request_stream_id)]
    DuplicateRequest(RequestCorrelation),
}

impl From<EngineError> for SchedulerError {
    fn from(e: EngineError) -> Self {
        SchedulerError::Processing(e.to_string())
    }
}

// ============================================
// Partition
// ============================================

#[derive(Debug, Default)]
struct Cursor {
    /// Position of the last command whose follow-ups are in the log
    last_processed: Option<Position>,
    /// In-memory state may be ahead of the log
    needs_recovery: bool,
}

/// Releases the processing flag on drop
struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a AtomicBool, partition_id: u16) -> Result<Self, EngineError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| EngineError::RoundInProgress(partition_id))?;
        Ok(Self(flag))
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One partition of the engine
pub struct Partition {
    config: PartitionConfig,
    log: Arc<dyn RecordLog>,
    clock: Arc<dyn Clock>,
    processor: Mutex<StreamProcessor>,
    router: ResponseRouter,
    cursor: Mutex<Cursor>,
    processing: AtomicBool,
    /// Timers with a TRIGGER command appended but not yet applied
    pending_triggers: Mutex<HashSet<Key>>,
    /// Leases with a TIME_OUT command appended but not yet applied
    pending_timeouts: Mutex<HashSet<(Key, DateTime<Utc>)>>,
}

impl Partition {
    /// Open a partition over `log` and rebuild its state
    pub async fn open(
        log: Arc<dyn RecordLog>,
        clock: Arc<dyn Clock>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        config: PartitionConfig,
    ) -> Result<Self, EngineError> {
        Self::open_with_registry(log, clock, evaluator, HandlerRegistry::with_defaults(), config)
            .await
    }

    /// Open a partition with a custom handler registry
    pub async fn open_with_registry(
        log: Arc<dyn RecordLog>,
        clock: Arc<dyn Clock>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        registry: HandlerRegistry,
        config: PartitionConfig,
    ) -> Result<Self, EngineError> {
        if config.partition_id > MAX_PARTITION_ID {
            return Err(EngineError::InvalidPartitionId {
                partition_id: config.partition_id,
                max: MAX_PARTITION_ID,
            });
        }
        let processor = StreamProcessor::new(config.partition_id, Arc::new(registry), evaluator);
        let partition = Self {
            config,
            log,
            clock,
            processor: Mutex::new(processor),
            router: ResponseRouter::new(),
            cursor: Mutex::new(Cursor::default()),
            processing: AtomicBool::new(false),
            pending_triggers: Mutex::new(HashSet::new()),
            pending_timeouts: Mutex::new(HashSet::new()),
        };
        partition.recover().await?;
        Ok(partition)
    }

    pub fn partition_id(&self) -> u16 {
        self.config.partition_id
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn router(&self) -> &ResponseRouter {
        &self.router
    }

    /// Position of the last command applied and persisted
    pub fn last_processed_position(&self) -> Option<Position> {
        self.cursor.lock().last_processed
    }

    /// Whether the in-memory state must be rebuilt before the next round
    pub fn needs_recovery(&self) -> bool {
        self.cursor.lock().needs_recovery
    }

    /// Read the current state
    pub fn read_state<R>(&self, f: impl FnOnce(&EngineState) -> R) -> R {
        f(self.processor.lock().state())
    }

    /// A copy of the current state
    pub fn state_snapshot(&self) -> EngineState {
        self.read_state(EngineState::clone)
    }

    // ============================================
    // Submission
    // ============================================

    /// Append a client command and register for its response
    pub async fn submit(
        &self,
        request: CommandRequest,
        correlation: RequestCorrelation,
    ) -> Result<PendingResponse, EngineError> {
        let receiver = self.router.register(correlation)?;
        let draft = request
            .into_draft()
            .with_correlation(correlation)
            .with_timestamp(self.clock.now());

        match self.log.append(draft).await {
            Ok(position) => {
                debug!(
                    partition_id = self.config.partition_id,
                    position,
                    request_id = correlation.request_id,
                    "Command submitted"
                );
                Ok(PendingResponse::new(position, correlation, receiver))
            }
            Err(e) => {
                self.router.unregister(correlation);
                Err(e.into())
            }
        }
    }

    /// Append a command that expects no response
    pub async fn submit_internal(&self, request: CommandRequest) -> Result<Position, EngineError> {
        let draft = request.into_draft().with_timestamp(self.clock.now());
        Ok(self.log.append(draft).await?)
    }

    // ============================================
    // Rounds
    // ============================================

    /// Run one full round: checkers, then up to `max_commands_per_round` commands
    ///
    /// Returns the number of commands applied.
    pub async fn process_round(&self) -> Result<usize, EngineError> {
        let commands = self.prepare_round(self.config.max_commands_per_round).await?;
        self.process_commands(commands).await
    }

    /// Run rounds until one applies nothing
    pub async fn process_until_idle(&self) -> Result<usize, EngineError> {
        let mut total = 0;
        loop {
            let processed = self.process_round().await?;
            if processed == 0 {
                return Ok(total);
            }
            total += processed;
        }
    }

    /// Append due timer triggers and lease timeouts, then read up to `max`
    /// unprocessed commands
    pub async fn prepare_round(&self, max: usize) -> Result<Vec<Record>, EngineError> {
        if self.needs_recovery() {
            self.recover().await?;
        }
        self.check_due_timers().await?;
        self.sweep_expired_leases().await?;
        self.read_unprocessed_commands(max).await
    }

    /// Apply commands in order, persisting each one's follow-ups before
    /// routing its response
    ///
    /// Commands at or before the last processed position are skipped.
    #[instrument(skip(self, commands), fields(partition_id = self.config.partition_id, count = commands.len()))]
    pub async fn process_commands(&self, commands: Vec<Record>) -> Result<usize, EngineError> {
        let _guard = ProcessingGuard::acquire(&self.processing, self.config.partition_id)?;
        if self.needs_recovery() {
            self.recover_locked().await?;
        }

        let mut processed = 0;
        for command in commands {
            if !command.is_command() || self.is_processed(command.position) {
                continue;
            }

            let result = self.processor.lock().apply(&command);
            if !result.follow_ups.is_empty() {
                if let Err(e) = self.log.append_batch(result.follow_ups).await {
                    self.cursor.lock().needs_recovery = true;
                    error!(
                        partition_id = self.config.partition_id,
                        position = command.position,
                        error = %e,
                        "Failed to append follow-up records, state will be rebuilt from the log"
                    );
                    return Err(e.into());
                }
            }
            self.cursor.lock().last_processed = Some(command.position);

            if let Some(response) = result.response {
                self.router.deliver(response);
            }
            processed += 1;
        }
        Ok(processed)
    }

    fn is_processed(&self, position: Position) -> bool {
        self.cursor
            .lock()
            .last_processed
            .is_some_and(|last| position <= last)
    }

    /// Append a TRIGGER command for every due timer not already triggered
    ///
    /// Timers due after a pending repeating timer's next firing wait for a
    /// later round, once that successor exists.
    async fn check_due_timers(&self) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let triggers: Vec<(Key, RecordDraft)> = {
            let processor = self.processor.lock();
            let timers = processor.state().timers();
            let mut pending = self.pending_triggers.lock();
            pending.retain(|key| timers.contains(*key));
            timers
                .firing_batch(now)
                .into_iter()
                .filter(|timer| pending.insert(timer.key))
                .map(|timer| {
                    let draft =
                        RecordDraft::command(Some(timer.key), TimerIntent::Trigger, timer.to_record())
                            .with_timestamp(now);
                    (timer.key, draft)
                })
                .collect()
        };
        if triggers.is_empty() {
            return Ok(0);
        }

        let (keys, drafts): (Vec<Key>, Vec<RecordDraft>) = triggers.into_iter().unzip();
        if let Err(e) = self.log.append_batch(drafts).await {
            let mut pending = self.pending_triggers.lock();
            for key in &keys {
                pending.remove(key);
            }
            return Err(e.into());
        }
        debug!(
            partition_id = self.config.partition_id,
            count = keys.len(),
            "Due timers triggered"
        );
        Ok(keys.len())
    }

    /// Append a TIME_OUT command for every expired lease not already timed out
    ///
    /// Each command carries the deadline observed here; it only takes effect
    /// if the job still holds that exact lease when the command is applied.
    async fn sweep_expired_leases(&self) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let timeouts: Vec<((Key, DateTime<Utc>), RecordDraft)> = {
            let processor = self.processor.lock();
            let jobs = processor.state().jobs();
            let mut pending = self.pending_timeouts.lock();
            pending.retain(|(key, deadline)| jobs.holds_lease(*key, *deadline));
            jobs.expired_leases(now)
                .into_iter()
                .filter(|lease| pending.insert(*lease))
                .filter_map(|(key, deadline)| {
                    let mut record = jobs.get(key)?.to_record();
                    record.deadline = Some(deadline);
                    let draft = RecordDraft::command(Some(key), JobIntent::TimeOut, record)
                        .with_timestamp(now);
                    Some(((key, deadline), draft))
                })
                .collect()
        };
        if timeouts.is_empty() {
            return Ok(0);
        }

        let (leases, drafts): (Vec<_>, Vec<_>) = timeouts.into_iter().unzip();
        if let Err(e) = self.log.append_batch(drafts).await {
            let mut pending = self.pending_timeouts.lock();
            for lease in &leases {
                pending.remove(lease);
            }
            return Err(e.into());
        }
        debug!(
            partition_id = self.config.partition_id,
            count = leases.len(),
            "Expired job leases reclaimed"
        );
        Ok(leases.len())
    }

    async fn read_unprocessed_commands(&self, max: usize) -> Result<Vec<Record>, EngineError> {
        let mut after = self.last_processed_position();
        let mut commands = Vec::new();
        while commands.len() < max {
            let chunk = self.log.read_after(after, READ_CHUNK_SIZE).await?;
            let Some(last) = chunk.last() else {
                break;
            };
            after = Some(last.position);
            commands.extend(
                chunk
                    .into_iter()
                    .filter(Record::is_command)
                    .take(max - commands.len()),
            );
        }
        Ok(commands)
    }

    // ============================================
    // Recovery
    // ============================================

    /// Rebuild state from the log
    ///
    /// Every command whose follow-ups are in the log is reprocessed and the
    /// regenerated follow-ups are compared with the logged ones. Returns the
    /// number of commands replayed.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let _guard = ProcessingGuard::acquire(&self.processing, self.config.partition_id)?;
        self.recover_locked().await
    }

    #[instrument(skip(self), fields(partition_id = self.config.partition_id))]
    async fn recover_locked(&self) -> Result<usize, EngineError> {
        let records = self.read_all().await?;

        let mut logged: BTreeMap<Position, Vec<RecordDraft>> = BTreeMap::new();
        for record in &records {
            if let Some(source) = record.source_position {
                logged.entry(source).or_default().push(record.to_draft());
            }
        }
        let processed_upto = logged.keys().next_back().copied();

        let replayed = {
            let mut processor = self.processor.lock();
            processor.reset();
            let mut replayed = 0;
            for command in records
                .iter()
                .filter(|r| r.is_command() && processed_upto.is_some_and(|upto| r.position <= upto))
            {
                let produced = processor.apply(command).follow_ups;
                let expected = logged.remove(&command.position).unwrap_or_default();
                if produced != expected {
                    warn!(
                        partition_id = self.config.partition_id,
                        position = command.position,
                        "Replayed follow-ups differ from the log"
                    );
                    return Err(EngineError::Replay {
                        position: command.position,
                        details: describe_mismatch(&expected, &produced),
                    });
                }
                replayed += 1;
            }
            replayed
        };

        {
            let mut cursor = self.cursor.lock();
            cursor.last_processed = processed_upto;
            cursor.needs_recovery = false;
        }
        self.pending_triggers.lock().clear();
        self.pending_timeouts.lock().clear();

        info!(
            partition_id = self.config.partition_id,
            records = records.len(),
            replayed,
            last_processed = ?processed_upto,
            "Partition state rebuilt from log"
        );
        Ok(replayed)
    }

    async fn read_all(&self) -> Result<Vec<Record>, EngineError> {
        let mut records = Vec::new();
        let mut after = None;
        loop {
            let chunk = self.log.read_after(after, READ_CHUNK_SIZE).await?;
            let Some(last) = chunk.last() else {
                return Ok(records);
            };
            after = Some(last.position);
            records.extend(chunk);
        }
    }

    // ============================================
    // Scheduling
    // ============================================

    /// A batch scheduler that drives this partition
    pub fn scheduler(self: &Arc<Self>, config: BatchSchedulerConfig) -> BatchScheduler<PartitionSource> {
        let source = Arc::new(PartitionSource::new(Arc::clone(self)));
        let partition = Arc::clone(self);
        let processor: BatchProcessor<Record> = Arc::new(move |commands| {
            let partition = Arc::clone(&partition);
            async move {
                partition
                    .process_commands(commands)
                    .await
                    .map_err(SchedulerError::from)
            }
            .boxed()
        });
        BatchScheduler::new(
            format!("partition-{}", self.config.partition_id),
            source,
            processor,
            config,
        )
    }
}

fn describe_mismatch(expected: &[RecordDraft], produced: &[RecordDraft]) -> String {
    let summary = |drafts: &[RecordDraft]| {
        drafts
            .iter()
            .map(|d| format!("{} {} {}", d.record_type, d.value_type, d.intent))
            .collect::<Vec<_>>()
            .join(", ")
    };
    if expected.len() != produced.len() {
        return format!(
            "logged {} follow-ups [{}], reprocessing produced {} [{}]",
            expected.len(),
            summary(expected),
            produced.len(),
            summary(produced)
        );
    }
    let index = expected
        .iter()
        .zip(produced)
        .position(|(a, b)| a != b)
        .unwrap_or_default();
    format!(
        "follow-up {} differs: logged [{}], reprocessing produced [{}]",
        index,
        summary(&expected[index..=index]),
        summary(&produced[index..=index])
    )
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("config", &self.config)
            .field("cursor", &*self.cursor.lock())
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}
