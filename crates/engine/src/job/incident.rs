//! Incidents, open and resolved

use std::collections::BTreeMap;

use crate::record::{IncidentRecord, IncidentState, Key};

#[derive(Debug, Clone, PartialEq)]
pub struct Incident {
    pub key: Key,
    pub record: IncidentRecord,
}

impl Incident {
    pub fn is_active(&self) -> bool {
        self.record.state == IncidentState::Active
    }
}

/// Every incident raised on the partition
///
/// Resolved incidents stay in the ledger as DELETED; `by_job` only links
/// jobs to their open incident.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncidentLedger {
    incidents: BTreeMap<Key, Incident>,
    by_job: BTreeMap<Key, Key>,
}

impl IncidentLedger {
    pub fn create(&mut self, key: Key, mut record: IncidentRecord) {
        record.state = IncidentState::Active;
        if let Some(job_key) = record.job_key {
            self.by_job.insert(job_key, key);
        }
        self.incidents.insert(key, Incident { key, record });
    }

    /// Mark an incident DELETED; returns `None` if it is not open
    pub fn resolve(&mut self, key: Key) -> Option<Incident> {
        let incident = self.incidents.get_mut(&key).filter(|i| i.is_active())?;
        incident.record.state = IncidentState::Deleted;
        if let Some(job_key) = incident.record.job_key {
            if self.by_job.get(&job_key) == Some(&key) {
                self.by_job.remove(&job_key);
            }
        }
        Some(incident.clone())
    }

    pub fn get(&self, key: Key) -> Option<&Incident> {
        self.incidents.get(&key)
    }

    /// Open incident raised for a job
    pub fn for_job(&self, job_key: Key) -> Option<&Incident> {
        self.by_job.get(&job_key).and_then(|key| self.incidents.get(key))
    }

    /// Open incidents of a process instance, in key order
    pub fn for_process_instance(&self, process_instance_key: Key) -> impl Iterator<Item = &Incident> {
        self.active()
            .filter(move |i| i.record.process_instance_key == Some(process_instance_key))
    }

    /// Open incidents, in key order
    pub fn active(&self) -> impl Iterator<Item = &Incident> {
        self.incidents.values().filter(|i| i.is_active())
    }

    /// All incidents including resolved ones, in key order
    pub fn iter(&self) -> impl Iterator<Item = &Incident> {
        self.incidents.values()
    }

    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }
}
