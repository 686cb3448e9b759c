//! Medication snapshot as fetched per sync.

use serde::{Deserialize, Serialize};

/// A patient's medication entry. Immutable within the core: each schedule
/// sync and each reconciliation fetches a fresh snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Medication {
    pub id: String,
    pub name: String,
    pub dosage: String,
    /// Scheduled times of day, "HH:MM", ordered.
    pub times: Vec<String>,
    /// Weekday abbreviations ("Mon" .. "Sun") on which the doses apply.
    pub frequency: Vec<String>,
}

impl Medication {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        dosage: impl Into<String>,
        times: &[&str],
        frequency: &[&str],
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            dosage: dosage.into(),
            times: times.iter().map(|s| s.to_string()).collect(),
            frequency: frequency.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Parse an "HH:MM" time string into (hour, minute).
/// Returns `None` for anything malformed or out of range.
pub fn parse_time_of_day(time: &str) -> Option<(u32, u32)> {
    let (h, m) = time.split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour < 24 && minute < 60 {
        Some((hour, minute))
    } else {
        None
    }
}
