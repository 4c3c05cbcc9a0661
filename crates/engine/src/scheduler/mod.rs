//! Batch scheduling
//!
//! One loop drives every background activity of the engine: partitions pull
//! commands, the operation executor pulls scheduled operations.

mod batch;

pub use batch::{
    BatchProcessor, BatchScheduler, BatchSchedulerConfig, RoundOutcome, RoundSignal,
    SchedulerError, WorkSource,
};
