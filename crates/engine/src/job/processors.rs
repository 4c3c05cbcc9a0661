//! Job and job batch commands

use tracing::debug;

use super::{Job, JobState, JobTransitionError};
use crate::processor::ProcessingContext;
use crate::record::{
    IncidentErrorType, IncidentIntent, IncidentRecord, IncidentState, JobBatchIntent, JobIntent,
    JobRecord, Key, Record, RejectionType,
};

const NO_RETRIES_LEFT: &str = "No more retries left.";

/// Key of the job a command addresses, or a rejection
fn job_key(command: &Record, ctx: &mut ProcessingContext<'_>, operation: &str) -> Option<Key> {
    if command.key.is_none() {
        ctx.reject(
            RejectionType::InvalidArgument,
            format!("Expected to {operation} a job, but no job key was given"),
        );
    }
    command.key
}

fn reject_transition(ctx: &mut ProcessingContext<'_>, error: JobTransitionError) {
    ctx.reject(error.rejection_type(), error.to_string());
}

/// Resolve the open incident of a job, if any
fn resolve_incident(ctx: &mut ProcessingContext<'_>, job_key: Key) {
    let Some(incident_key) = ctx.state().incidents.for_job(job_key).map(|i| i.key) else {
        return;
    };
    if let Some(incident) = ctx.state_mut().incidents.resolve(incident_key) {
        ctx.append_event(incident.key, IncidentIntent::Resolved, incident.record);
    }
}

/// JOB CREATE
pub(crate) fn create(command: &Record, ctx: &mut ProcessingContext<'_>) {
    let Some(request) = command.value.as_job() else {
        return ctx.reject_unexpected_value();
    };

    if request.job_type.trim().is_empty() {
        return ctx.reject(
            RejectionType::InvalidArgument,
            "Expected to create job with a non-empty type, but it was empty",
        );
    }
    if request.retries == 0 {
        return ctx.reject(
            RejectionType::InvalidArgument,
            "Expected to create job with a positive amount of retries, but got 0",
        );
    }

    let key = ctx.next_key();
    let created = ctx.state_mut().jobs.create(key, request).to_record();
    ctx.append_and_respond(key, JobIntent::Created, created);

    if let Some(job) = ctx.state_mut().jobs.mark_activatable(key) {
        let record = job.to_record();
        ctx.append_event(key, JobIntent::Activatable, record);
    }
}

/// JOB_BATCH ACTIVATE
pub(crate) fn activate(command: &Record, ctx: &mut ProcessingContext<'_>) {
    let Some(request) = command.value.as_job_batch() else {
        return ctx.reject_unexpected_value();
    };

    if request.job_type.trim().is_empty() {
        return ctx.reject(
            RejectionType::InvalidArgument,
            "Expected to activate jobs with a non-empty type, but it was empty",
        );
    }
    if request.timeout.is_zero() {
        return ctx.reject(
            RejectionType::InvalidArgument,
            "Expected to activate jobs with a timeout greater than zero, but it was zero",
        );
    }
    if request.max_jobs_to_activate == 0 {
        return ctx.reject(
            RejectionType::InvalidArgument,
            "Expected to activate at least one job, but max jobs to activate was 0",
        );
    }

    let now = ctx.now();
    let keys = ctx.state_mut().jobs.activate(
        &request.job_type,
        &request.worker,
        request.timeout,
        request.max_jobs_to_activate as usize,
        now,
    );
    let jobs: Vec<JobRecord> = keys
        .iter()
        .filter_map(|key| ctx.state().jobs.get(*key).map(Job::to_record))
        .collect();

    debug!(
        job_type = %request.job_type,
        worker = %request.worker,
        activated = keys.len(),
        "Jobs activated"
    );

    let mut activated = request.clone();
    activated.job_keys = keys;
    activated.jobs = jobs;
    let batch_key = ctx.next_key();
    ctx.append_and_respond(batch_key, JobBatchIntent::Activated, activated);
}

/// JOB COMPLETE
pub(crate) fn complete(command: &Record, ctx: &mut ProcessingContext<'_>) {
    let Some(key) = job_key(command, ctx, "complete") else {
        return;
    };
    match ctx.state_mut().jobs.complete(key) {
        Ok(job) => ctx.append_and_respond(key, JobIntent::Completed, job.to_record()),
        Err(e) => reject_transition(ctx, e),
    }
}

/// JOB FAIL
///
/// Uses up one retry. With retries left the job becomes activatable again,
/// after the requested backoff; otherwise it fails and raises an incident.
pub(crate) fn fail(command: &Record, ctx: &mut ProcessingContext<'_>) {
    let Some(key) = job_key(command, ctx, "fail") else {
        return;
    };
    let Some(request) = command.value.as_job() else {
        return ctx.reject_unexpected_value();
    };

    let now = ctx.now();
    let job = match ctx
        .state_mut()
        .jobs
        .fail(key, request.retry_backoff, request.error_message.clone(), now)
    {
        Ok(job) => job.clone(),
        Err(e) => return reject_transition(ctx, e),
    };
    ctx.append_and_respond(key, JobIntent::Failed, job.to_record());

    if job.state == JobState::Failed {
        let incident_key = ctx.next_key();
        let incident = IncidentRecord {
            error_type: IncidentErrorType::JobNoRetries,
            error_message: job
                .error_message
                .clone()
                .unwrap_or_else(|| NO_RETRIES_LEFT.to_string()),
            state: IncidentState::Active,
            job_key: Some(key),
            process_instance_key: job.process_instance_key,
            element_instance_key: None,
            element_id: job.element_id.clone(),
        };
        ctx.state_mut().incidents.create(incident_key, incident.clone());
        ctx.append_event(incident_key, IncidentIntent::Created, incident);
        debug!(job_key = key, incident_key, "Job out of retries, incident raised");
    }
}

/// JOB TIME_OUT
///
/// Issued by the lease sweep with the deadline it saw expire. Rejected if the
/// job completed, failed or was re-leased in the meantime.
pub(crate) fn time_out(command: &Record, ctx: &mut ProcessingContext<'_>) {
    let Some(key) = job_key(command, ctx, "time out") else {
        return;
    };
    let Some(observed) = command.value.as_job().and_then(|job| job.deadline) else {
        return ctx.reject(
            RejectionType::InvalidArgument,
            format!("Expected to time out job with key '{key}', but no observed deadline was given"),
        );
    };

    let now = ctx.now();
    match ctx.state_mut().jobs.time_out(key, observed, now) {
        Ok(job) => {
            let record = job.to_record();
            ctx.append_and_respond(key, JobIntent::TimedOut, record);
        }
        Err(e) => reject_transition(ctx, e),
    }
}

/// JOB UPDATE_RETRIES
pub(crate) fn update_retries(command: &Record, ctx: &mut ProcessingContext<'_>) {
    let Some(key) = job_key(command, ctx, "update retries for") else {
        return;
    };
    let Some(request) = command.value.as_job() else {
        return ctx.reject_unexpected_value();
    };
    if request.retries == 0 {
        return ctx.reject(
            RejectionType::InvalidArgument,
            format!(
                "Expected to update retries for job with key '{key}' with a positive amount of retries, but got 0"
            ),
        );
    }

    let revived = match ctx.state_mut().jobs.update_retries(key, request.retries) {
        Ok(revived) => revived,
        Err(e) => return reject_transition(ctx, e),
    };

    if let Some(job) = ctx.state().jobs.get(key) {
        let record = job.to_record();
        ctx.append_and_respond(key, JobIntent::RetriesUpdated, record);
    }

    resolve_incident(ctx, key);

    if revived {
        if let Some(job) = ctx.state().jobs.get(key) {
            let record = job.to_record();
            ctx.append_event(key, JobIntent::Activatable, record);
        }
    }
}

/// JOB CANCEL
pub(crate) fn cancel(command: &Record, ctx: &mut ProcessingContext<'_>) {
    let Some(key) = job_key(command, ctx, "cancel") else {
        return;
    };
    match ctx.state_mut().jobs.cancel(key) {
        Ok(job) => {
            ctx.append_and_respond(key, JobIntent::Canceled, job.to_record());
            resolve_incident(ctx, key);
        }
        Err(e) => reject_transition(ctx, e),
    }
}
