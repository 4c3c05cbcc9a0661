//! Pull/process/backoff loop
//!
//! A [`BatchScheduler`] repeatedly pulls a bounded batch from a
//! [`WorkSource`], hands it to a processor, publishes the round outcome and,
//! when a round found nothing to do or failed, sleeps for the idle backoff
//! before trying again. Errors never end the loop; only [`stop`] does.
//!
//! [`stop`]: BatchScheduler::stop

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace};

use crate::serde_duration::duration_millis;

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSchedulerConfig {
    /// Maximum units pulled per round
    pub max_batch_size: usize,

    /// Sleep after an idle or failed round
    #[serde(with = "duration_millis")]
    pub idle_backoff: Duration,
}

impl Default for BatchSchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            idle_backoff: Duration::from_secs(2),
        }
    }
}

impl BatchSchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum batch size
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    /// Set the idle backoff
    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }
}

/// Scheduler errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// Pulling work failed
    #[error("failed to pull work: {0}")]
    Source(String),

    /// Processing a batch failed
    #[error("failed to process batch: {0}")]
    Processing(String),

    /// The background loop is already running
    #[error("scheduler '{0}' is already running")]
    AlreadyRunning(String),

    /// The scheduler was stopped
    #[error("scheduler '{0}' is stopped")]
    Stopped(String),
}

/// Supplies batches of work
#[async_trait]
pub trait WorkSource: Send + Sync + 'static {
    type Unit: Send + 'static;

    /// Pull up to `max` units; an empty batch means there is nothing to do
    async fn pull(&self, max: usize) -> Result<Vec<Self::Unit>, SchedulerError>;
}

/// Processes one pulled batch and returns how many units it handled
pub type BatchProcessor<U> =
    Arc<dyn Fn(Vec<U>) -> BoxFuture<'static, Result<usize, SchedulerError>> + Send + Sync>;

/// Outcome of one round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Units were processed; the next round starts immediately
    Processed(usize),
    /// Nothing to do
    Idle,
    /// Pulling or processing failed; the loop backs off and retries
    Failed(String),
}

impl RoundOutcome {
    /// Whether the scheduler backs off after this outcome
    pub fn backs_off(&self) -> bool {
        !matches!(self, RoundOutcome::Processed(_))
    }
}

/// Published at the end of every round, before any backoff
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSignal {
    /// Completed rounds
    pub rounds: u64,
    /// Completed rounds that were idle or failed
    pub settled_rounds: u64,
    pub last_outcome: Option<RoundOutcome>,
    pub last_settled: Option<RoundOutcome>,
    pub stopped: bool,
}

struct Inner<S: WorkSource> {
    name: String,
    source: Arc<S>,
    processor: BatchProcessor<S::Unit>,
    config: BatchSchedulerConfig,
    signals: watch::Sender<RoundSignal>,
}

impl<S: WorkSource> Inner<S> {
    async fn execute_round(&self) -> RoundOutcome {
        let outcome = match self.source.pull(self.config.max_batch_size).await {
            Ok(batch) if batch.is_empty() => RoundOutcome::Idle,
            Ok(batch) => match (self.processor)(batch).await {
                Ok(0) => RoundOutcome::Idle,
                Ok(count) => RoundOutcome::Processed(count),
                Err(e) => RoundOutcome::Failed(e.to_string()),
            },
            Err(e) => RoundOutcome::Failed(e.to_string()),
        };

        match &outcome {
            RoundOutcome::Processed(count) => {
                debug!(scheduler = %self.name, count, "Processed batch");
            }
            RoundOutcome::Idle => {
                trace!(scheduler = %self.name, "No work found, backing off");
            }
            RoundOutcome::Failed(reason) => {
                error!(
                    scheduler = %self.name,
                    error = %reason,
                    "Error occurred while processing batch. Will be retried."
                );
            }
        }

        self.publish(&outcome);
        outcome
    }

    fn publish(&self, outcome: &RoundOutcome) {
        self.signals.send_modify(|signal| {
            signal.rounds += 1;
            signal.last_outcome = Some(outcome.clone());
            if outcome.backs_off() {
                signal.settled_rounds += 1;
                signal.last_settled = Some(outcome.clone());
            }
        });
    }

    fn mark_stopped(&self) {
        self.signals.send_modify(|signal| signal.stopped = true);
    }
}

/// Background loop over a work source
///
/// # Example
///
/// ```ignore
/// let scheduler = BatchScheduler::new("importer", source, processor, BatchSchedulerConfig::default());
/// scheduler.start()?;
/// scheduler.wait_for_idle_round().await?;
/// scheduler.stop().await;
/// ```
pub struct BatchScheduler<S: WorkSource> {
    inner: Arc<Inner<S>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: WorkSource> BatchScheduler<S> {
    pub fn new(
        name: impl Into<String>,
        source: Arc<S>,
        processor: BatchProcessor<S::Unit>,
        config: BatchSchedulerConfig,
    ) -> Self {
        let (signals, _) = watch::channel(RoundSignal::default());
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                source,
                processor,
                config,
                signals,
            }),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &BatchSchedulerConfig {
        &self.inner.config
    }

    /// Spawn the background loop
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.cancel.is_cancelled() {
            return Err(SchedulerError::Stopped(self.inner.name.clone()));
        }
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(SchedulerError::AlreadyRunning(self.inner.name.clone()));
        }

        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        *handle = Some(tokio::spawn(run_loop(inner, cancel)));
        Ok(())
    }

    /// Whether the background loop has been started and not stopped
    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some() && !self.cancel.is_cancelled()
    }

    /// Stop the loop and wait for the round in progress to finish
    #[instrument(skip(self), fields(scheduler = %self.inner.name))]
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler task ended abnormally");
            }
        }
        self.inner.mark_stopped();
    }

    /// Run one round inline; only allowed while the background loop is not running
    pub async fn run_round(&self) -> Result<RoundOutcome, SchedulerError> {
        if self.cancel.is_cancelled() {
            return Err(SchedulerError::Stopped(self.inner.name.clone()));
        }
        if self.handle.lock().is_some() {
            return Err(SchedulerError::AlreadyRunning(self.inner.name.clone()));
        }
        Ok(self.inner.execute_round().await)
    }

    /// Wait until a round that starts after this call finds no work or fails
    ///
    /// Returns that round's outcome, or `Stopped` if the scheduler stops first.
    pub async fn wait_for_idle_round(&self) -> Result<RoundOutcome, SchedulerError> {
        let mut rx = self.inner.signals.subscribe();
        let baseline = rx.borrow_and_update().settled_rounds;
        loop {
            {
                let signal = rx.borrow_and_update();
                if signal.settled_rounds > baseline {
                    return Ok(signal.last_settled.clone().unwrap_or(RoundOutcome::Idle));
                }
                if signal.stopped {
                    return Err(SchedulerError::Stopped(self.inner.name.clone()));
                }
            }
            if rx.changed().await.is_err() {
                return Err(SchedulerError::Stopped(self.inner.name.clone()));
            }
        }
    }

    /// Receiver of round signals
    pub fn subscribe(&self) -> watch::Receiver<RoundSignal> {
        self.inner.signals.subscribe()
    }
}

impl<S: WorkSource> Drop for BatchScheduler<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_loop<S: WorkSource>(inner: Arc<Inner<S>>, cancel: CancellationToken) {
    info!(
        scheduler = %inner.name,
        max_batch_size = inner.config.max_batch_size,
        idle_backoff_ms = inner.config.idle_backoff.as_millis() as u64,
        "Batch scheduler started"
    );

    while !cancel.is_cancelled() {
        // A round always runs to completion; cancellation is observed between rounds
        let outcome = inner.execute_round().await;

        if outcome.backs_off() {
            tokio::select! {
                _ = tokio::time::sleep(inner.config.idle_backoff) => {}
                _ = cancel.cancelled() => break,
            }
        } else {
            tokio::task::yield_now().await;
        }
    }

    inner.mark_stopped();
    info!(scheduler = %inner.name, "Batch scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct QueueSource {
        queue: Mutex<VecDeque<u32>>,
        failures: AtomicUsize,
        pulls: AtomicUsize,
    }

    impl QueueSource {
        fn new(items: impl IntoIterator<Item = u32>) -> Arc<Self> {
            Arc::new(Self {
                queue: Mutex::new(items.into_iter().collect()),
                failures: AtomicUsize::new(0),
                pulls: AtomicUsize::new(0),
            })
        }

        fn push(&self, item: u32) {
            self.queue.lock().push_back(item);
        }
    }

    #[async_trait]
    impl WorkSource for QueueSource {
        type Unit = u32;

        async fn pull(&self, max: usize) -> Result<Vec<u32>, SchedulerError> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SchedulerError::Source("connection refused".into()));
            }
            let mut queue = self.queue.lock();
            let take = max.min(queue.len());
            Ok(queue.drain(..take).collect())
        }
    }

    fn summing_processor(total: Arc<AtomicUsize>) -> BatchProcessor<u32> {
        Arc::new(move |batch: Vec<u32>| {
            let total = Arc::clone(&total);
            async move {
                let count = batch.len();
                total.fetch_add(batch.iter().sum::<u32>() as usize, Ordering::SeqCst);
                Ok(count)
            }
            .boxed()
        })
    }

    fn config() -> BatchSchedulerConfig {
        BatchSchedulerConfig::new()
            .with_max_batch_size(2)
            .with_idle_backoff(Duration::from_secs(2))
    }

    #[test]
    fn test_config_defaults() {
        let config = BatchSchedulerConfig::default();
        assert_eq!(config.max_batch_size, 100);
        assert_eq!(config.idle_backoff, Duration::from_secs(2));
        assert_eq!(BatchSchedulerConfig::new().with_max_batch_size(0).max_batch_size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drains_source_in_bounded_batches() {
        let source = QueueSource::new([1, 2, 3, 4, 5]);
        let total = Arc::new(AtomicUsize::new(0));
        let scheduler = BatchScheduler::new("test", Arc::clone(&source), summing_processor(Arc::clone(&total)), config());

        scheduler.start().unwrap();
        let outcome = scheduler.wait_for_idle_round().await.unwrap();

        assert_eq!(outcome, RoundOutcome::Idle);
        assert_eq!(total.load(Ordering::SeqCst), 15);
        // Three batches of at most two, then one empty pull
        assert_eq!(source.pulls.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.subscribe().borrow().rounds, 4);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_notification_precedes_backoff() {
        let source = QueueSource::new([]);
        let scheduler = BatchScheduler::new(
            "test",
            source,
            summing_processor(Arc::new(AtomicUsize::new(0))),
            config().with_idle_backoff(Duration::from_secs(3600)),
        );
        let started = tokio::time::Instant::now();

        scheduler.start().unwrap();
        scheduler.wait_for_idle_round().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(3600));
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backs_off_then_picks_up_new_work() {
        let source = QueueSource::new([]);
        let total = Arc::new(AtomicUsize::new(0));
        let scheduler = BatchScheduler::new("test", Arc::clone(&source), summing_processor(Arc::clone(&total)), config());

        scheduler.start().unwrap();
        scheduler.wait_for_idle_round().await.unwrap();

        source.push(7);
        let started = tokio::time::Instant::now();
        scheduler.wait_for_idle_round().await.unwrap();

        assert_eq!(total.load(Ordering::SeqCst), 7);
        // The new work was only seen after the backoff elapsed
        assert!(started.elapsed() >= Duration::from_secs(2));
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_do_not_stop_the_loop() {
        let source = QueueSource::new([4]);
        source.failures.store(2, Ordering::SeqCst);
        let total = Arc::new(AtomicUsize::new(0));
        let scheduler = BatchScheduler::new("test", Arc::clone(&source), summing_processor(Arc::clone(&total)), config());

        scheduler.start().unwrap();
        let first = scheduler.wait_for_idle_round().await.unwrap();
        assert!(matches!(first, RoundOutcome::Failed(reason) if reason.contains("connection refused")));

        // Keep waiting until a round completes cleanly
        loop {
            if scheduler.wait_for_idle_round().await.unwrap() == RoundOutcome::Idle {
                break;
            }
        }
        assert_eq!(total.load(Ordering::SeqCst), 4);
        assert!(scheduler.is_running());
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_processing_error_is_reported() {
        let source = QueueSource::new([1]);
        let failing: BatchProcessor<u32> =
            Arc::new(|_| async { Err(SchedulerError::Processing("disk full".into())) }.boxed());
        let scheduler = BatchScheduler::new("test", source, failing, config());

        let outcome = scheduler.run_round().await.unwrap();
        assert_eq!(
            outcome,
            RoundOutcome::Failed("failed to process batch: disk full".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_wakes_waiters_and_prevents_restart() {
        let source = QueueSource::new([]);
        let scheduler = Arc::new(BatchScheduler::new(
            "test",
            source,
            summing_processor(Arc::new(AtomicUsize::new(0))),
            config(),
        ));
        scheduler.start().unwrap();
        assert!(matches!(scheduler.start(), Err(SchedulerError::AlreadyRunning(_))));
        scheduler.wait_for_idle_round().await.unwrap();

        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.wait_for_idle_round().await })
        };
        tokio::task::yield_now().await;
        scheduler.stop().await;

        let result = waiter.await.unwrap();
        // Either the waiter saw one more idle round before the stop, or the stop itself
        assert!(matches!(result, Ok(RoundOutcome::Idle) | Err(SchedulerError::Stopped(_))));
        assert!(!scheduler.is_running());
        assert!(matches!(scheduler.start(), Err(SchedulerError::Stopped(_))));
        assert!(scheduler.subscribe().borrow().stopped);
    }

    #[tokio::test]
    async fn test_manual_round_refused_while_running() {
        let source = QueueSource::new([]);
        let scheduler = BatchScheduler::new("test", source, summing_processor(Arc::new(AtomicUsize::new(0))), config());

        assert_eq!(scheduler.run_round().await.unwrap(), RoundOutcome::Idle);
        scheduler.start().unwrap();
        assert!(matches!(scheduler.run_round().await, Err(SchedulerError::AlreadyRunning(_))));
        scheduler.stop().await;
    }
}
