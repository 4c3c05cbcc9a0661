//! Timer commands

use tracing::debug;

use super::Timer;
use crate::process::processors::start_instance;
use crate::processor::ProcessingContext;
use crate::record::{
    IncidentErrorType, IncidentIntent, IncidentRecord, IncidentState, ProcessInstanceIntent, Record,
    RejectionType, TimerIntent, ValueType,
};

/// TIMER CREATE for a timer bound to an element instance
///
/// A definition that cannot be resolved raises an incident on the element
/// instead of rejecting the command.
pub(crate) fn create(command: &Record, ctx: &mut ProcessingContext<'_>) {
    let Some(request) = command.value.as_timer() else {
        return ctx.reject_unexpected_value();
    };
    let Some(definition) = &request.definition else {
        return ctx.reject(
            RejectionType::InvalidArgument,
            "Expected to create a timer with a definition, but none was given",
        );
    };
    let (Some(process_instance_key), Some(element_instance_key)) =
        (request.process_instance_key, request.element_instance_key)
    else {
        return ctx.reject(
            RejectionType::InvalidArgument,
            "Expected to create a timer for an element instance, but no element instance was given",
        );
    };
    let Some(process_definition_key) = ctx
        .state()
        .processes
        .instance(process_instance_key)
        .map(|instance| instance.process_definition_key)
    else {
        return ctx.reject(
            RejectionType::NotFound,
            format!(
                "Expected to create a timer for process instance with key '{process_instance_key}', but no such process instance was found"
            ),
        );
    };

    match definition.resolve(ctx.now(), ctx.evaluator(), &request.variables) {
        Ok(resolved) => {
            let key = ctx.next_key();
            let timer = Timer {
                key,
                due_date: resolved.due_date,
                repetition: resolved.repetition,
                period: resolved.period,
                target_element_id: request.target_element_id.clone(),
                process_definition_key: Some(process_definition_key),
                process_instance_key: Some(process_instance_key),
                element_instance_key: Some(element_instance_key),
                creation_position: command.position,
            };
            let record = timer.to_record();
            ctx.state_mut().timers.schedule(timer);
            ctx.append_and_respond(key, TimerIntent::Created, record);
        }
        Err(e) => {
            let incident_key = ctx.next_key();
            let incident = IncidentRecord {
                error_type: IncidentErrorType::ExpressionEvaluation,
                error_message: e.to_string(),
                state: IncidentState::Active,
                job_key: None,
                process_instance_key: Some(process_instance_key),
                element_instance_key: Some(element_instance_key),
                element_id: Some(request.target_element_id.clone()),
            };
            ctx.state_mut().incidents.create(incident_key, incident.clone());
            ctx.append_and_respond(incident_key, IncidentIntent::Created, incident);
            debug!(
                process_instance_key,
                element_instance_key,
                error = %e,
                "Timer definition could not be resolved, incident raised"
            );
        }
    }
}

/// TIMER TRIGGER
///
/// Fires a due timer. A start-event timer creates a process instance; a
/// repeating timer schedules its successor one period after its due date.
pub(crate) fn trigger(command: &Record, ctx: &mut ProcessingContext<'_>) {
    let Some(key) = command.key else {
        return ctx.reject(
            RejectionType::InvalidArgument,
            "Expected to trigger a timer, but no timer key was given",
        );
    };
    let Some(timer) = ctx.state().timers.get(key).cloned() else {
        return ctx.reject(
            RejectionType::NotFound,
            format!("Expected to trigger timer with key '{key}', but no such timer was found"),
        );
    };
    if timer.due_date > ctx.now() {
        return ctx.reject(
            RejectionType::InvalidState,
            format!(
                "Expected to trigger timer with key '{key}', but it is not due until {}",
                timer.due_date.to_rfc3339()
            ),
        );
    }

    ctx.state_mut().timers.remove(key);
    ctx.append_and_respond(key, TimerIntent::Triggered, timer.to_record());

    if timer.is_start_event() {
        let definition = timer
            .process_definition_key
            .and_then(|k| ctx.state().processes.definition(k).cloned());
        if let Some(definition) = definition {
            let instance_key = start_instance(ctx, &definition, Some(timer.target_element_id.clone()));
            if let Some(instance) = ctx.state().processes.instance(instance_key) {
                let record = instance.to_record(serde_json::Value::Null);
                ctx.append_event(instance_key, ProcessInstanceIntent::Created, record);
            }
        }
    }

    if timer.repeats() {
        let next_key = ctx.next_key();
        if let Some(next) = timer.successor(next_key, command.position) {
            let record = next.to_record();
            ctx.state_mut().timers.schedule(next);
            ctx.append_event(next_key, TimerIntent::Created, record);
        }
    }
}

/// TIMER CANCEL; canceling a timer that is already gone succeeds without events
pub(crate) fn cancel(command: &Record, ctx: &mut ProcessingContext<'_>) {
    let Some(key) = command.key else {
        return ctx.reject(
            RejectionType::InvalidArgument,
            "Expected to cancel a timer, but no timer key was given",
        );
    };

    match ctx.state_mut().timers.remove(key) {
        Some(timer) => ctx.append_and_respond(key, TimerIntent::Canceled, timer.to_record()),
        None => {
            if let Some(correlation) = command.correlation {
                ctx.response().write_response(
                    Some(key),
                    TimerIntent::Canceled.into(),
                    command.value.clone(),
                    ValueType::Timer,
                    correlation.request_id,
                    correlation.request_stream_id,
                );
            }
        }
    }
}
