//! Intake records: the persisted outcome of a confirmed or missed dose.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal intake outcomes. A slot with a terminal record within the
/// resolve tolerance is never selected again by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntakeStatus {
    Taken,
    Missed,
}

/// A dose-intake record, one per confirmed/resolved slot under correct
/// operation. Field names follow the stored document shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeRecord {
    pub medication_id: String,
    pub medication_name: String,
    pub dosage: String,
    pub scheduled_time: DateTime<Utc>,
    pub status: IntakeStatus,
    pub taken_at: DateTime<Utc>,
    pub patient_id: String,
    pub device_id: String,
    /// Which path produced the record (e.g. "pastillero").
    pub source: String,
    pub timestamp: DateTime<Utc>,
}
