//! Pending timers ordered by due date

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::Repetition;
use crate::clock::add_duration;
use crate::record::{Key, Position, TimerRecord};

/// A scheduled timer
#[derive(Debug, Clone, PartialEq)]
pub struct Timer {
    pub key: Key,
    pub due_date: DateTime<Utc>,
    pub repetition: Repetition,
    pub period: Option<Duration>,
    pub target_element_id: String,
    pub process_definition_key: Option<Key>,
    pub process_instance_key: Option<Key>,
    /// `None` for process start-event timers
    pub element_instance_key: Option<Key>,
    /// Position of the command that created the timer; breaks due-date ties
    pub creation_position: Position,
}

impl Timer {
    pub fn is_start_event(&self) -> bool {
        self.element_instance_key.is_none()
    }

    /// Whether another firing follows this one
    pub fn repeats(&self) -> bool {
        self.period.is_some() && self.repetition.next().is_some()
    }

    /// The timer that follows this one after it fires, if it repeats
    ///
    /// The successor is due one period after this timer's due date, not after
    /// the time it actually fired.
    pub fn successor(&self, key: Key, creation_position: Position) -> Option<Timer> {
        let period = self.period?;
        let repetition = self.repetition.next()?;
        Some(Timer {
            key,
            due_date: self.successor_due_date()?,
            repetition,
            period: Some(period),
            target_element_id: self.target_element_id.clone(),
            process_definition_key: self.process_definition_key,
            process_instance_key: self.process_instance_key,
            element_instance_key: self.element_instance_key,
            creation_position,
        })
    }

    /// Due date of the successor this timer creates when it fires
    pub fn successor_due_date(&self) -> Option<DateTime<Utc>> {
        if !self.repeats() {
            return None;
        }
        self.period.map(|period| add_duration(self.due_date, period))
    }

    pub fn to_record(&self) -> TimerRecord {
        TimerRecord {
            definition: None,
            due_date: Some(self.due_date),
            repetition: self.repetition,
            period: self.period,
            target_element_id: self.target_element_id.clone(),
            process_definition_key: self.process_definition_key,
            process_instance_key: self.process_instance_key,
            element_instance_key: self.element_instance_key,
            variables: serde_json::Value::Null,
        }
    }
}

/// Timers in state CREATED, indexed by `(due date, creation position, key)`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimerScheduler {
    timers: BTreeMap<Key, Timer>,
    due_index: BTreeSet<(DateTime<Utc>, Position, Key)>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, timer: Timer) {
        if let Some(previous) = self.timers.remove(&timer.key) {
            self.due_index
                .remove(&(previous.due_date, previous.creation_position, previous.key));
        }
        self.due_index
            .insert((timer.due_date, timer.creation_position, timer.key));
        self.timers.insert(timer.key, timer);
    }

    /// Remove a timer; returns `None` if it was already gone
    pub fn remove(&mut self, key: Key) -> Option<Timer> {
        let timer = self.timers.remove(&key)?;
        self.due_index
            .remove(&(timer.due_date, timer.creation_position, timer.key));
        Some(timer)
    }

    pub fn get(&self, key: Key) -> Option<&Timer> {
        self.timers.get(&key)
    }

    pub fn contains(&self, key: Key) -> bool {
        self.timers.contains_key(&key)
    }

    /// Timers due at `now`, earliest first
    pub fn due_timers(&self, now: DateTime<Utc>) -> impl Iterator<Item = &Timer> + '_ {
        self.due_index
            .iter()
            .take_while(move |(due, _, _)| *due <= now)
            .filter_map(|(_, _, key)| self.timers.get(key))
    }

    /// Due timers that may fire before any successor they create
    ///
    /// A repeating timer's successor only exists once its TRIGGER has been
    /// applied. Timers due after the earliest such successor are held back so
    /// firings stay in `(due date, creation position)` order.
    pub fn firing_batch(&self, now: DateTime<Utc>) -> Vec<&Timer> {
        let mut horizon = now;
        let mut batch = Vec::new();
        for timer in self.due_timers(now) {
            if timer.due_date > horizon {
                break;
            }
            if let Some(next_due) = timer.successor_due_date() {
                horizon = horizon.min(next_due);
            }
            batch.push(timer);
        }
        batch
    }

    pub fn next_due_date(&self) -> Option<DateTime<Utc>> {
        self.due_index.iter().next().map(|(due, _, _)| *due)
    }

    /// Start-event timers of the given process definitions
    pub fn start_timers_of<'a>(
        &'a self,
        process_definition_keys: &'a [Key],
    ) -> impl Iterator<Item = &'a Timer> + 'a {
        self.timers.values().filter(move |timer| {
            timer.is_start_event()
                && timer
                    .process_definition_key
                    .is_some_and(|key| process_definition_keys.contains(&key))
        })
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
