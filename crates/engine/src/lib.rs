//! # Conductor Engine
//!
//! The event-sourced processing core of a workflow orchestration platform.
//!
//! ## Features
//!
//! - **Event-sourced partitions**: commands are appended to an append-only log and
//!   deterministically applied, producing events, rejections and a correlated response
//! - **Timers**: due-date ordered firing of date, duration and repeating-cycle timers
//! - **Job leases**: activation with a lease deadline, completion, retries, incidents
//!   and lease-expiry reclaim
//! - **Batch scheduling**: one reusable pull/process/backoff loop that drives both
//!   partitions and operator batch operations
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  BatchScheduler (per driver)                 │
//! │      (pull bounded batch → process → notify → backoff)      │
//! └─────────────────────────────────────────────────────────────┘
//!                │                                 │
//!                ▼                                 ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────┐
//! │          Partition           │  │    OperationExecutor     │
//! │ due-date checker, lease sweep│◀─│ (UPDATE_RETRIES batches) │
//! │ StreamProcessor, router      │  └──────────────────────────┘
//! └──────────────────────────────┘
//!                │
//!                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         RecordLog                            │
//! │        (commands, events, rejections; gapless positions)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use conductor_engine::prelude::*;
//!
//! let log = Arc::new(InMemoryRecordLog::new());
//! let clock = Arc::new(ControlledClock::default());
//! let partition = Arc::new(
//!     Partition::open(log, clock, Arc::new(UnavailableExpressionEvaluator), PartitionConfig::default()).await?,
//! );
//! let gateway = CommandGateway::new(Arc::clone(&partition), 1);
//!
//! let pending = gateway.send(CommandRequest::new(JobIntent::Create, job_record)).await?;
//! partition.process_round().await?;
//! let response = pending.wait().await?;
//! ```

pub mod clock;
pub mod job;
pub mod log;
pub mod operation;
pub mod partition;
pub mod process;
pub mod processor;
pub mod record;
pub mod scheduler;
pub mod timer;

mod serde_duration;

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::{Clock, ControlledClock, SystemClock};
    pub use crate::log::{InMemoryRecordLog, LogError, RecordLog};
    pub use crate::operation::{
        BatchOperationError, BatchOperationRequest, BatchOperationService, InMemoryOperationStore,
        InstanceQuery, Operation, OperationExecutor, OperationState, OperationStore,
        OperationType, OperationsConfig,
    };
    pub use crate::partition::{
        CommandGateway, CommandRequest, EngineError, Partition, PartitionConfig, PendingResponse,
    };
    pub use crate::processor::{Response, ResponseWriter, StreamProcessor};
    pub use crate::record::{
        DeploymentIntent, Intent, JobBatchIntent, JobIntent, ProcessInstanceIntent, Record,
        RecordType, RecordValue, RejectionType, TimerIntent, ValueType,
    };
    pub use crate::scheduler::{BatchScheduler, BatchSchedulerConfig, RoundOutcome, WorkSource};
    pub use crate::timer::{
        ExpressionError, ExpressionEvaluator, StaticExpressionEvaluator, TimerDefinition,
        UnavailableExpressionEvaluator,
    };
}

// Re-export key types at crate root
pub use clock::{Clock, ControlledClock, SystemClock};
pub use log::{InMemoryRecordLog, LogError, RecordLog};
pub use partition::{CommandGateway, CommandRequest, EngineError, Partition, PartitionConfig};
pub use processor::{Response, StreamProcessor};
pub use record::{Intent, Key, Position, Record, RecordType, RecordValue, ValueType};
pub use scheduler::{BatchScheduler, BatchSchedulerConfig, RoundOutcome};
