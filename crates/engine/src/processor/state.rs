//! Engine state rebuilt from the log

use crate::job::{IncidentLedger, JobLedger};
use crate::process::ProcessState;
use crate::record::Key;
use crate::timer::TimerScheduler;

/// Bits of a key below the partition id
const PARTITION_KEY_SHIFT: u32 = 51;

/// Largest partition id that fits above the key counter
pub const MAX_PARTITION_ID: u16 = ((1u64 << (Key::BITS - PARTITION_KEY_SHIFT)) - 1) as u16;

/// All entity state of one partition
///
/// Collections are ordered maps so that iteration, and therefore every
/// decision derived from it, is identical on replay.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineState {
    partition_id: u16,
    key_counter: u64,
    pub(crate) processes: ProcessState,
    pub(crate) timers: TimerScheduler,
    pub(crate) jobs: JobLedger,
    pub(crate) incidents: IncidentLedger,
}

impl EngineState {
    pub fn new(partition_id: u16) -> Self {
        Self {
            partition_id,
            key_counter: 0,
            processes: ProcessState::default(),
            timers: TimerScheduler::default(),
            jobs: JobLedger::default(),
            incidents: IncidentLedger::default(),
        }
    }

    pub fn partition_id(&self) -> u16 {
        self.partition_id
    }

    /// Allocate a fresh key; keys embed the partition id and are never reused
    pub(crate) fn next_key(&mut self) -> Key {
        self.key_counter += 1;
        ((self.partition_id as u64) << PARTITION_KEY_SHIFT) | self.key_counter
    }

    pub fn processes(&self) -> &ProcessState {
        &self.processes
    }

    pub fn timers(&self) -> &TimerScheduler {
        &self.timers
    }

    pub fn jobs(&self) -> &JobLedger {
        &self.jobs
    }

    pub fn incidents(&self) -> &IncidentLedger {
        &self.incidents
    }
}

/// Partition id encoded in a key
pub fn partition_of(key: Key) -> u16 {
    (key >> PARTITION_KEY_SHIFT) as u16
}
