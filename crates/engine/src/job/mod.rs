//! Jobs and incidents
//!
//! Jobs are units of work handed to external workers under a time-bounded
//! lease. A job that runs out of retries raises an incident, which stays open
//! until the job's retries are raised again or the job is canceled.

mod incident;
mod ledger;
pub(crate) mod processors;

pub use incident::{Incident, IncidentLedger};
pub use ledger::{Job, JobLedger, JobState, JobTransitionError};
