//! Process definitions and instances
//!
//! Only as much of a process as timers and operations need: deployed versions
//! per process id, their timer start events, and the instances created from them.

pub(crate) mod processors;

use std::collections::BTreeMap;

use crate::record::{Key, ProcessInstanceRecord, TimerStartEvent};

/// A deployed version of a process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessDefinition {
    pub key: Key,
    pub bpmn_process_id: String,
    pub version: u32,
    pub timer_start_events: Vec<TimerStartEvent>,
}

/// A running process instance
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInstance {
    pub key: Key,
    pub bpmn_process_id: String,
    pub process_definition_key: Key,
    pub version: u32,
    /// Start element that created the instance
    pub element_id: Option<String>,
}

impl ProcessInstance {
    pub fn to_record(&self, variables: serde_json::Value) -> ProcessInstanceRecord {
        ProcessInstanceRecord {
            bpmn_process_id: self.bpmn_process_id.clone(),
            version: self.version,
            process_definition_key: Some(self.process_definition_key),
            process_instance_key: Some(self.key),
            element_id: self.element_id.clone(),
            variables,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessState {
    definitions: BTreeMap<Key, ProcessDefinition>,
    latest_by_id: BTreeMap<String, Key>,
    instances: BTreeMap<Key, ProcessInstance>,
}

impl ProcessState {
    pub fn deploy(&mut self, definition: ProcessDefinition) {
        self.latest_by_id
            .insert(definition.bpmn_process_id.clone(), definition.key);
        self.definitions.insert(definition.key, definition);
    }

    /// Latest deployed version of a process
    pub fn latest(&self, bpmn_process_id: &str) -> Option<&ProcessDefinition> {
        self.latest_by_id
            .get(bpmn_process_id)
            .and_then(|key| self.definitions.get(key))
    }

    pub fn definition(&self, key: Key) -> Option<&ProcessDefinition> {
        self.definitions.get(&key)
    }

    /// Keys of every deployed version of a process
    pub fn versions_of(&self, bpmn_process_id: &str) -> Vec<Key> {
        self.definitions
            .values()
            .filter(|d| d.bpmn_process_id == bpmn_process_id)
            .map(|d| d.key)
            .collect()
    }

    pub fn add_instance(&mut self, instance: ProcessInstance) {
        self.instances.insert(instance.key, instance);
    }

    pub fn instance(&self, key: Key) -> Option<&ProcessInstance> {
        self.instances.get(&key)
    }

    pub fn instances(&self) -> impl Iterator<Item = &ProcessInstance> {
        self.instances.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(key: Key, id: &str, version: u32) -> ProcessDefinition {
        ProcessDefinition {
            key,
            bpmn_process_id: id.into(),
            version,
            timer_start_events: Vec::new(),
        }
    }

    #[test]
    fn test_latest_tracks_newest_deployment() {
        let mut state = ProcessState::default();
        state.deploy(definition(1, "order", 1));
        state.deploy(definition(2, "invoice", 1));
        state.deploy(definition(3, "order", 2));

        assert_eq!(state.latest("order").unwrap().version, 2);
        assert_eq!(state.versions_of("order"), vec![1, 3]);
        assert!(state.latest("unknown").is_none());
    }
}
