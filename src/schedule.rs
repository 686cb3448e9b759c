//! Schedule compiler.
//!
//! Maps a medication list onto the fixed 28-key day×timeband activation
//! grid the dispenser firmware consumes. Dose-level identity within a slot
//! is collapsed by logical OR, a documented simplification of the grid
//! format, not something to fix here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::channel::CommandChannel;
use crate::error::CoreError;
use crate::models::{parse_time_of_day, Medication};

// ═══════════════════════════════════════════════════════════
// Timebands and grid keys
// ═══════════════════════════════════════════════════════════

/// The four fixed daily windows ("turnos") the device schedules in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeband {
    Manana,
    Mediodia,
    Tarde,
    Noche,
}

impl Timeband {
    pub const ALL: [Timeband; 4] = [
        Timeband::Manana,
        Timeband::Mediodia,
        Timeband::Tarde,
        Timeband::Noche,
    ];

    /// Classify by the hour component: [06,11) mañana, [11,15) mediodía,
    /// [15,20) tarde, everything else noche.
    pub fn classify(hour: u32) -> Timeband {
        match hour {
            6..=10 => Timeband::Manana,
            11..=14 => Timeband::Mediodia,
            15..=19 => Timeband::Tarde,
            _ => Timeband::Noche,
        }
    }

    /// Key suffix as the firmware spells it.
    pub fn key_suffix(&self) -> &'static str {
        match self {
            Timeband::Manana => "mañana",
            Timeband::Mediodia => "mediodia",
            Timeband::Tarde => "tarde",
            Timeband::Noche => "noche",
        }
    }
}

/// Day keys as the firmware spells them, Sunday first.
pub const DAY_KEYS: [&str; 7] = [
    "domingo",
    "lunes",
    "martes",
    "miercoles",
    "jueves",
    "viernes",
    "sabado",
];

/// Map a weekday abbreviation from the medication list to its day key.
pub fn day_key_for(abbrev: &str) -> Option<&'static str> {
    match abbrev {
        "Sun" => Some("domingo"),
        "Mon" => Some("lunes"),
        "Tue" => Some("martes"),
        "Wed" => Some("miercoles"),
        "Thu" => Some("jueves"),
        "Fri" => Some("viernes"),
        "Sat" => Some("sabado"),
        _ => None,
    }
}

/// All 28 grid keys, `<day><timeband>`.
pub fn grid_keys() -> Vec<String> {
    let mut keys = Vec::with_capacity(28);
    for day in DAY_KEYS {
        for band in Timeband::ALL {
            keys.push(format!("{day}{}", band.key_suffix()));
        }
    }
    keys
}

// ═══════════════════════════════════════════════════════════
// Compilation
// ═══════════════════════════════════════════════════════════

/// Compile a medication list into the activation grid. Pure and
/// deterministic: all 28 keys are always present, order of medications
/// does not matter, and identical input yields an identical grid.
/// Unparseable times and unknown day abbreviations are skipped.
pub fn compile(medications: &[Medication]) -> BTreeMap<String, bool> {
    let mut grid: BTreeMap<String, bool> =
        grid_keys().into_iter().map(|key| (key, false)).collect();

    for med in medications {
        for time in &med.times {
            let Some((hour, _)) = parse_time_of_day(time) else {
                tracing::debug!(medication = %med.id, %time, "skipping unparseable time");
                continue;
            };
            let band = Timeband::classify(hour);
            for abbrev in &med.frequency {
                let Some(day) = day_key_for(abbrev) else {
                    tracing::debug!(medication = %med.id, %abbrev, "skipping unknown weekday");
                    continue;
                };
                grid.insert(format!("{day}{}", band.key_suffix()), true);
            }
        }
    }

    grid
}

/// Compile and push the whole grid to the device. Every sync overwrites
/// every key, including the false ones; there is no guard against a
/// second sync racing the same device; last write wins.
pub async fn sync(
    channel: &CommandChannel,
    device_id: &str,
    medications: &[Medication],
) -> Result<(), CoreError> {
    let grid = compile(medications);
    let active = grid.values().filter(|v| **v).count();
    channel.write_grid(device_id, grid).await?;
    tracing::info!(device_id, active, "schedule grid synced");
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// Summary (preview, no side effects)
// ═══════════════════════════════════════════════════════════

/// Derived preview of a medication list, shown before syncing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleSummary {
    pub medication_count: usize,
    /// Timebands with at least one dose, in daily order.
    pub active_timebands: Vec<Timeband>,
    /// (medication, time) pairs per timeband.
    pub doses_per_timeband: BTreeMap<Timeband, usize>,
    /// Distinct weekdays with at least one scheduled dose.
    pub active_day_count: usize,
}

/// Pure derived view over the medication list.
pub fn summarize(medications: &[Medication]) -> ScheduleSummary {
    let mut doses: BTreeMap<Timeband, usize> = BTreeMap::new();
    let mut days: std::collections::BTreeSet<&'static str> = Default::default();

    for med in medications {
        for time in &med.times {
            if let Some((hour, _)) = parse_time_of_day(time) {
                *doses.entry(Timeband::classify(hour)).or_insert(0) += 1;
            }
        }
        for abbrev in &med.frequency {
            if let Some(day) = day_key_for(abbrev) {
                days.insert(day);
            }
        }
    }

    ScheduleSummary {
        medication_count: medications.len(),
        active_timebands: Timeband::ALL
            .into_iter()
            .filter(|band| doses.contains_key(band))
            .collect(),
        doses_per_timeband: doses,
        active_day_count: days.len(),
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
