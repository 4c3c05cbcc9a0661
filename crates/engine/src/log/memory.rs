//! In-memory implementation of RecordLog for testing

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{LogError, RecordLog};
use crate::record::{Position, Record, RecordDraft};

/// In-memory implementation of RecordLog
///
/// Keeps every record in a vector indexed by `position - 1`. Appends can be
/// made to fail on demand to exercise recovery paths.
///
/// # Example
///
/// ```
/// use conductor_engine::InMemoryRecordLog;
///
/// let log = InMemoryRecordLog::new();
/// assert!(log.is_empty());
/// ```
pub struct InMemoryRecordLog {
    records: RwLock<Vec<Record>>,
    failing_appends: AtomicUsize,
}

impl InMemoryRecordLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            failing_appends: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` append calls fail with `StorageUnavailable`
    pub fn fail_next_appends(&self, count: usize) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Number of records in the log
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Snapshot of all records (for testing)
    pub fn records(&self) -> Vec<Record> {
        self.records.read().clone()
    }

    fn take_failure(&self) -> bool {
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryRecordLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordLog for InMemoryRecordLog {
    async fn append(&self, draft: RecordDraft) -> Result<Position, LogError> {
        let mut positions = self.append_batch(vec![draft]).await?;
        positions
            .pop()
            .ok_or_else(|| LogError::StorageUnavailable("append produced no position".into()))
    }

    async fn append_batch(&self, drafts: Vec<RecordDraft>) -> Result<Vec<Position>, LogError> {
        if self.take_failure() {
            return Err(LogError::StorageUnavailable("injected append failure".into()));
        }

        let mut records = self.records.write();
        let mut positions = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let position = records.len() as Position + 1;
            records.push(Record::from_draft(position, draft));
            positions.push(position);
        }
        Ok(positions)
    }

    async fn read_after(
        &self,
        after: Option<Position>,
        limit: usize,
    ) -> Result<Vec<Record>, LogError> {
        let records = self.records.read();
        let start = after.unwrap_or(0) as usize;
        Ok(records.iter().skip(start).take(limit).cloned().collect())
    }

    async fn last_position(&self) -> Result<Option<Position>, LogError> {
        Ok(self.records.read().last().map(|r| r.position))
    }
}
