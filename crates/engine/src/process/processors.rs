//! Deployment and process instance commands

use std::collections::BTreeSet;

use tracing::debug;

use super::{ProcessDefinition, ProcessInstance};
use crate::processor::ProcessingContext;
use crate::record::{
    DeploymentIntent, Key, ProcessInstanceIntent, Record, RejectionType, TimerIntent,
};
use crate::timer::Timer;

/// DEPLOYMENT CREATE
///
/// Registers a new version of the process, cancels the start-event timers of
/// every previous version and schedules the new version's start-event timers.
pub(crate) fn deploy(command: &Record, ctx: &mut ProcessingContext<'_>) {
    let Some(deployment) = command.value.as_deployment() else {
        return ctx.reject_unexpected_value();
    };

    if deployment.bpmn_process_id.trim().is_empty() {
        return ctx.reject(
            RejectionType::InvalidArgument,
            "Expected to deploy a process with a non-empty process id, but it was empty",
        );
    }

    let mut element_ids = BTreeSet::new();
    for start in &deployment.timer_start_events {
        if !element_ids.insert(start.element_id.as_str()) {
            return ctx.reject(
                RejectionType::InvalidArgument,
                format!(
                    "Expected timer start event ids to be unique, but '{}' appears more than once",
                    start.element_id
                ),
            );
        }
    }

    // Resolve every timer before touching state so a bad definition rejects cleanly
    let now = ctx.now();
    let mut resolved = Vec::with_capacity(deployment.timer_start_events.len());
    for start in &deployment.timer_start_events {
        match start
            .timer
            .resolve(now, ctx.evaluator(), &serde_json::Value::Null)
        {
            Ok(timer) => resolved.push((start, timer)),
            Err(e) => {
                return ctx.reject(
                    RejectionType::InvalidArgument,
                    format!(
                        "Expected a valid timer definition for start event '{}', but {}",
                        start.element_id, e
                    ),
                );
            }
        }
    }

    let previous_versions = ctx.state().processes.versions_of(&deployment.bpmn_process_id);
    let version = ctx
        .state()
        .processes
        .latest(&deployment.bpmn_process_id)
        .map_or(1, |latest| latest.version + 1);

    let definition_key = ctx.next_key();
    ctx.state_mut().processes.deploy(ProcessDefinition {
        key: definition_key,
        bpmn_process_id: deployment.bpmn_process_id.clone(),
        version,
        timer_start_events: deployment.timer_start_events.clone(),
    });

    let mut created = deployment.clone();
    created.version = version;
    created.process_definition_key = Some(definition_key);
    ctx.append_and_respond(definition_key, DeploymentIntent::Created, created);

    let stale: Vec<Key> = ctx
        .state()
        .timers
        .start_timers_of(&previous_versions)
        .map(|timer| timer.key)
        .collect();
    for key in stale {
        if let Some(timer) = ctx.state_mut().timers.remove(key) {
            ctx.append_event(timer.key, TimerIntent::Canceled, timer.to_record());
        }
    }

    for (start, resolved) in resolved {
        let timer_key = ctx.next_key();
        let timer = Timer {
            key: timer_key,
            due_date: resolved.due_date,
            repetition: resolved.repetition,
            period: resolved.period,
            target_element_id: start.element_id.clone(),
            process_definition_key: Some(definition_key),
            process_instance_key: None,
            element_instance_key: None,
            creation_position: command.position,
        };
        let record = timer.to_record();
        ctx.state_mut().timers.schedule(timer);
        ctx.append_event(timer_key, TimerIntent::Created, record);
    }

    debug!(
        bpmn_process_id = %deployment.bpmn_process_id,
        version,
        definition_key,
        timers = deployment.timer_start_events.len(),
        "Process deployed"
    );
}

/// PROCESS_INSTANCE CREATE
pub(crate) fn create_instance(command: &Record, ctx: &mut ProcessingContext<'_>) {
    let Some(request) = command.value.as_process_instance() else {
        return ctx.reject_unexpected_value();
    };

    let Some(definition) = ctx.state().processes.latest(&request.bpmn_process_id).cloned() else {
        return ctx.reject(
            RejectionType::NotFound,
            format!(
                "Expected to find process definition with process ID '{}', but none found",
                request.bpmn_process_id
            ),
        );
    };

    let key = start_instance(ctx, &definition, None);
    if let Some(instance) = ctx.state().processes.instance(key) {
        let record = instance.to_record(request.variables.clone());
        ctx.append_and_respond(key, ProcessInstanceIntent::Created, record);
    }
}

/// Create an instance of `definition` and return its key; the caller writes the event
pub(crate) fn start_instance(
    ctx: &mut ProcessingContext<'_>,
    definition: &ProcessDefinition,
    element_id: Option<String>,
) -> Key {
    let key = ctx.next_key();
    ctx.state_mut().processes.add_instance(ProcessInstance {
        key,
        bpmn_process_id: definition.bpmn_process_id.clone(),
        process_definition_key: definition.key,
        version: definition.version,
        element_id,
    });
    key
}
