//! ISO-8601 durations and repeating intervals
//!
//! Supported forms:
//!
//! - durations `PnW`, `PnDTnHnMnS` with fractional seconds (`PT1.5S`)
//! - repeating intervals `R/<duration>` (unbounded) and `Rn/<duration>` with `n >= 1`
//!
//! Year and month components are rejected; their length depends on the calendar.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error parsing a duration or repeating interval
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CycleParseError {
    #[error("invalid ISO-8601 duration '{0}'")]
    InvalidDuration(String),

    #[error("calendar durations with years or months are not supported: '{0}'")]
    CalendarDuration(String),

    #[error("invalid ISO-8601 repeating interval '{0}'")]
    InvalidCycle(String),

    #[error("repetition count must be at least 1: '{0}'")]
    ZeroRepetitions(String),

    #[error("cycle period must be greater than zero: '{0}'")]
    ZeroPeriod(String),
}

/// How many more times a timer fires after the current firing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "remaining", rename_all = "snake_case")]
pub enum Repetition {
    /// Fires once
    #[default]
    None,
    /// Fires the given number of times in total, counting the pending firing
    Finite(u32),
    /// Fires until canceled
    Infinite,
}

impl Repetition {
    /// Repetition of the timer that follows the current firing, if any
    pub fn next(self) -> Option<Repetition> {
        match self {
            Repetition::None | Repetition::Finite(0) | Repetition::Finite(1) => None,
            Repetition::Finite(n) => Some(Repetition::Finite(n - 1)),
            Repetition::Infinite => Some(Repetition::Infinite),
        }
    }
}

/// A parsed repeating interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerCycle {
    pub repetition: Repetition,
    #[serde(with = "crate::serde_duration::duration_millis")]
    pub period: Duration,
}

impl fmt::Display for TimerCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repetition {
            Repetition::Finite(n) => write!(f, "R{}/{}", n, format_duration(self.period)),
            Repetition::None => write!(f, "R1/{}", format_duration(self.period)),
            Repetition::Infinite => write!(f, "R/{}", format_duration(self.period)),
        }
    }
}

/// Parse an ISO-8601 duration such as `PT1S` or `P1DT2H30M`
pub fn parse_duration(input: &str) -> Result<Duration, CycleParseError> {
    let invalid = || CycleParseError::InvalidDuration(input.to_string());

    let body = input.strip_prefix('P').ok_or_else(invalid)?;
    let mut millis: u64 = 0;
    let mut number = String::new();
    let mut in_time = false;
    let mut components = 0;
    let mut time_components = 0;
    let mut last_rank = 0;

    for ch in body.chars() {
        match ch {
            '0'..='9' | '.' => number.push(ch),
            'T' if !in_time && number.is_empty() => in_time = true,
            designator => {
                if number.is_empty() {
                    return Err(invalid());
                }
                let (rank, unit_millis) = match (in_time, designator) {
                    (false, 'Y') | (false, 'M') => {
                        return Err(CycleParseError::CalendarDuration(input.to_string()))
                    }
                    (false, 'W') => (1, 604_800_000),
                    (false, 'D') => (2, 86_400_000),
                    (true, 'H') => (3, 3_600_000),
                    (true, 'M') => (4, 60_000),
                    (true, 'S') => (5, 1_000),
                    _ => return Err(invalid()),
                };
                // Designators must appear at most once and in order
                if rank <= last_rank {
                    return Err(invalid());
                }
                last_rank = rank;

                let value = if rank == 5 {
                    seconds_to_millis(&number)
                } else {
                    number
                        .parse::<u64>()
                        .ok()
                        .and_then(|n| n.checked_mul(unit_millis))
                }
                .ok_or_else(invalid)?;

                millis = millis.checked_add(value).ok_or_else(invalid)?;
                number.clear();
                components += 1;
                if in_time {
                    time_components += 1;
                }
            }
        }
    }

    if !number.is_empty() || components == 0 || (in_time && time_components == 0) {
        return Err(invalid());
    }

    Ok(Duration::from_millis(millis))
}

/// `"1.25"` -> 1250
fn seconds_to_millis(number: &str) -> Option<u64> {
    let (whole, fraction) = match number.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (number, ""),
    };
    if whole.is_empty() || fraction.contains('.') {
        return None;
    }

    let whole_millis = whole.parse::<u64>().ok()?.checked_mul(1_000)?;
    let fraction_millis = if fraction.is_empty() {
        0
    } else {
        let digits: String = fraction.chars().chain("000".chars()).take(3).collect();
        digits.parse::<u64>().ok()?
    };
    whole_millis.checked_add(fraction_millis)
}

/// Parse a repeating interval such as `R/PT1S` or `R3/PT10M`
pub fn parse_cycle(input: &str) -> Result<TimerCycle, CycleParseError> {
    let invalid = || CycleParseError::InvalidCycle(input.to_string());

    let (repeat, duration) = input.split_once('/').ok_or_else(invalid)?;
    let count = repeat.strip_prefix('R').ok_or_else(invalid)?;

    let repetition = if count.is_empty() {
        Repetition::Infinite
    } else {
        let n: u32 = count.parse().map_err(|_| invalid())?;
        if n == 0 {
            return Err(CycleParseError::ZeroRepetitions(input.to_string()));
        }
        Repetition::Finite(n)
    };

    let period = parse_duration(duration)?;
    if period.is_zero() {
        return Err(CycleParseError::ZeroPeriod(input.to_string()));
    }

    Ok(TimerCycle { repetition, period })
}

/// Render a duration as ISO-8601, e.g. 90_500 ms -> `PT1M30.5S`
pub fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis() as u64;
    if ms == 0 {
        return "PT0S".to_string();
    }

    let total_seconds = ms / 1000;
    let millis = ms % 1000;
    let days = total_seconds / 86400;
    let remaining = total_seconds % 86400;
    let hours = remaining / 3600;
    let remaining = remaining % 3600;
    let minutes = remaining / 60;
    let seconds = remaining % 60;

    let mut result = String::from("P");
    if days > 0 {
        result.push_str(&format!("{days}D"));
    }
    if hours > 0 || minutes > 0 || seconds > 0 || millis > 0 {
        result.push('T');
        if hours > 0 {
            result.push_str(&format!("{hours}H"));
        }
        if minutes > 0 {
            result.push_str(&format!("{minutes}M"));
        }
        if millis > 0 {
            let fraction = format!("{millis:03}");
            result.push_str(&format!("{seconds}.{}S", fraction.trim_end_matches('0')));
        } else if seconds > 0 {
            result.push_str(&format!("{seconds}S"));
        }
    }
    result
}
