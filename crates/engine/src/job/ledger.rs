//! Job lifecycle state machine
//!
//! ```text
//!            CREATE            ACTIVATE               COMPLETE
//! (none) ──────────▶ CREATED ─▶ ACTIVATABLE ────────▶ ACTIVATED ──────────▶ (completed)
//!                                  ▲   ▲                 │ │
//!                        TIME_OUT  │   │ FAIL, retries>0 │ │ FAIL, retries=0
//!                                  │   └─────────────────┘ ▼
//!                                  │                     FAILED ──┐
//!                                  └──────── UPDATE_RETRIES(n>0) ◀┘
//! ```
//!
//! Completed and canceled jobs are removed from the ledger.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::add_duration;
use crate::record::{JobRecord, Key, RejectionType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    Activatable,
    Activated,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Canceled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Created => write!(f, "CREATED"),
            JobState::Activatable => write!(f, "ACTIVATABLE"),
            JobState::Activated => write!(f, "ACTIVATED"),
            JobState::Completed => write!(f, "COMPLETED"),
            JobState::Failed => write!(f, "FAILED"),
            JobState::Canceled => write!(f, "CANCELED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub key: Key,
    pub job_type: String,
    pub retries: u32,
    pub state: JobState,
    pub worker: Option<String>,
    /// Lease deadline while ACTIVATED
    pub deadline: Option<DateTime<Utc>>,
    /// Earliest activation time after a failure with backoff
    pub eligible_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub process_instance_key: Option<Key>,
    pub element_id: Option<String>,
    pub variables: serde_json::Value,
}

impl Job {
    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            job_type: self.job_type.clone(),
            retries: self.retries,
            worker: self.worker.clone(),
            deadline: self.deadline,
            retry_backoff: None,
            error_message: self.error_message.clone(),
            process_instance_key: self.process_instance_key,
            element_id: self.element_id.clone(),
            variables: self.variables.clone(),
        }
    }

    fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.eligible_at.map_or(true, |at| at <= now)
    }
}

/// Why a job transition was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobTransitionError {
    #[error("Expected to {operation} job with key '{key}', but no such job was found")]
    NotFound { key: Key, operation: &'static str },

    #[error("Expected to {operation} job with key '{key}', but it is in state '{state}'")]
    InvalidState {
        key: Key,
        state: JobState,
        operation: &'static str,
    },

    #[error("Expected to time out job with key '{key}' whose lease expired at {observed}, but {reason}")]
    StaleTimeout {
        key: Key,
        observed: DateTime<Utc>,
        reason: String,
    },
}

impl JobTransitionError {
    pub fn rejection_type(&self) -> RejectionType {
        match self {
            JobTransitionError::NotFound { .. } => RejectionType::NotFound,
            JobTransitionError::InvalidState { .. } | JobTransitionError::StaleTimeout { .. } => {
                RejectionType::InvalidState
            }
        }
    }
}

/// All live jobs of a partition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobLedger {
    jobs: BTreeMap<Key, Job>,
    /// Activated jobs by `(deadline, key)`
    leases: BTreeSet<(DateTime<Utc>, Key)>,
}

impl JobLedger {
    pub fn get(&self, key: Key) -> Option<&Job> {
        self.jobs.get(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn create(&mut self, key: Key, record: &JobRecord) -> &Job {
        self.jobs.entry(key).or_insert_with(|| Job {
            key,
            job_type: record.job_type.clone(),
            retries: record.retries,
            state: JobState::Created,
            worker: None,
            deadline: None,
            eligible_at: None,
            error_message: None,
            process_instance_key: record.process_instance_key,
            element_id: record.element_id.clone(),
            variables: record.variables.clone(),
        })
    }

    pub fn mark_activatable(&mut self, key: Key) -> Option<&Job> {
        let job = self.jobs.get_mut(&key)?;
        if job.state == JobState::Created {
            job.state = JobState::Activatable;
        }
        Some(job)
    }

    /// Activate up to `max` eligible jobs of `job_type`, in key order
    pub fn activate(
        &mut self,
        job_type: &str,
        worker: &str,
        timeout: Duration,
        max: usize,
        now: DateTime<Utc>,
    ) -> Vec<Key> {
        let deadline = add_duration(now, timeout);
        let mut activated = Vec::new();
        for job in self.jobs.values_mut() {
            if activated.len() >= max {
                break;
            }
            if job.state != JobState::Activatable || job.job_type != job_type || !job.is_eligible(now)
            {
                continue;
            }
            job.state = JobState::Activated;
            job.worker = Some(worker.to_string());
            job.deadline = Some(deadline);
            job.eligible_at = None;
            self.leases.insert((deadline, job.key));
            activated.push(job.key);
        }
        activated
    }

    /// ACTIVATED -> removed; returns the completed job
    pub fn complete(&mut self, key: Key) -> Result<Job, JobTransitionError> {
        self.expect_state(key, JobState::Activated, "complete")?;
        let mut job = self.remove(key, "complete")?;
        job.state = JobState::Completed;
        Ok(job)
    }

    /// ACTIVATED -> ACTIVATABLE with one retry less, or FAILED when none remain
    pub fn fail(
        &mut self,
        key: Key,
        backoff: Option<Duration>,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<&Job, JobTransitionError> {
        self.expect_state(key, JobState::Activated, "fail")?;
        self.release_lease(key);
        let job = self.get_mut(key, "fail")?;
        job.retries = job.retries.saturating_sub(1);
        job.worker = None;
        job.deadline = None;
        job.error_message = error_message;
        if job.retries > 0 {
            job.state = JobState::Activatable;
            job.eligible_at = backoff.filter(|b| !b.is_zero()).map(|b| add_duration(now, b));
        } else {
            job.state = JobState::Failed;
        }
        Ok(job)
    }

    /// Reclaim an expired lease
    ///
    /// Only succeeds if the job is still ACTIVATED under the deadline the
    /// caller observed, and that deadline has passed at `now`.
    pub fn time_out(
        &mut self,
        key: Key,
        observed_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<&Job, JobTransitionError> {
        let job = self.get_mut(key, "time out")?;
        let stale = |reason: String| JobTransitionError::StaleTimeout {
            key,
            observed: observed_deadline,
            reason,
        };
        if job.state != JobState::Activated {
            return Err(stale(format!("it is in state '{}'", job.state)));
        }
        if job.deadline != Some(observed_deadline) {
            return Err(stale("it was activated again since".to_string()));
        }
        if now <= observed_deadline {
            return Err(stale("the lease has not expired yet".to_string()));
        }

        job.state = JobState::Activatable;
        job.worker = None;
        job.deadline = None;
        self.leases.remove(&(observed_deadline, key));
        self.get_mut(key, "time out").map(|job| &*job)
    }

    /// Set the retries; a FAILED job with positive retries becomes ACTIVATABLE
    ///
    /// Returns whether the job was revived.
    pub fn update_retries(&mut self, key: Key, retries: u32) -> Result<bool, JobTransitionError> {
        let job = self.get_mut(key, "update retries for")?;
        job.retries = retries;
        if job.state == JobState::Failed && retries > 0 {
            job.state = JobState::Activatable;
            job.eligible_at = None;
            return Ok(true);
        }
        Ok(false)
    }

    /// Any non-terminal state -> removed; returns the canceled job
    pub fn cancel(&mut self, key: Key) -> Result<Job, JobTransitionError> {
        self.release_lease(key);
        let mut job = self.remove(key, "cancel")?;
        job.state = JobState::Canceled;
        job.deadline = None;
        Ok(job)
    }

    /// ACTIVATED jobs whose lease expired before `now`, with the deadline observed
    pub fn expired_leases(&self, now: DateTime<Utc>) -> Vec<(Key, DateTime<Utc>)> {
        self.leases
            .iter()
            .take_while(|(deadline, _)| *deadline < now)
            .map(|(deadline, key)| (*key, *deadline))
            .collect()
    }

    /// Whether `key` is still leased under `deadline`
    pub fn holds_lease(&self, key: Key, deadline: DateTime<Utc>) -> bool {
        self.leases.contains(&(deadline, key))
    }

    fn expect_state(
        &self,
        key: Key,
        expected: JobState,
        operation: &'static str,
    ) -> Result<(), JobTransitionError> {
        let job = self
            .jobs
            .get(&key)
            .ok_or(JobTransitionError::NotFound { key, operation })?;
        if job.state != expected {
            return Err(JobTransitionError::InvalidState {
                key,
                state: job.state,
                operation,
            });
        }
        Ok(())
    }

    fn get_mut(&mut self, key: Key, operation: &'static str) -> Result<&mut Job, JobTransitionError> {
        self.jobs
            .get_mut(&key)
            .ok_or(JobTransitionError::NotFound { key, operation })
    }

    fn remove(&mut self, key: Key, operation: &'static str) -> Result<Job, JobTransitionError> {
        self.release_lease(key);
        self.jobs
            .remove(&key)
            .ok_or(JobTransitionError::NotFound { key, operation })
    }

    fn release_lease(&mut self, key: Key) {
        if let Some(deadline) = self.jobs.get(&key).and_then(|job| job.deadline) {
            self.leases.remove(&(deadline, key));
        }
    }
}
