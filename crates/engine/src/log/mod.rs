//! Record log abstraction
//!
//! The log is the single source of truth for a partition. It assigns gapless,
//! strictly increasing positions starting at 1 and never rewrites a record.

mod memory;

pub use memory::InMemoryRecordLog;

use async_trait::async_trait;

use crate::record::{Position, Record, RecordDraft};

/// Error type for log operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum LogError {
    /// The storage backend refused the operation; nothing was written
    #[error("record log unavailable: {0}")]
    StorageUnavailable(String),
}

/// Append-only, totally ordered record log of one partition
#[async_trait]
pub trait RecordLog: Send + Sync + 'static {
    // ============================================
    // Writes
    // ============================================

    /// Append one record and return its position
    async fn append(&self, draft: RecordDraft) -> Result<Position, LogError>;

    /// Append records atomically and contiguously
    ///
    /// Either every record is written, in order and without interleaving, or
    /// none is. Returns the position of each record.
    async fn append_batch(&self, drafts: Vec<RecordDraft>) -> Result<Vec<Position>, LogError>;

    // ============================================
    // Reads
    // ============================================

    /// Read up to `limit` records with a position greater than `after`
    ///
    /// `None` reads from the beginning of the log.
    async fn read_after(&self, after: Option<Position>, limit: usize)
        -> Result<Vec<Record>, LogError>;

    /// Position of the last record, if any
    async fn last_position(&self) -> Result<Option<Position>, LogError>;
}
