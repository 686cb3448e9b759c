//! Intake reconciler.
//!
//! On confirmation, matches the event against the day's not-yet-resolved
//! scheduled doses and writes the intake record. Matching is fuzzy: a slot
//! counts as resolved when a terminal record sits within five minutes of
//! its nominal time. There is no read-then-write isolation, so two
//! concurrent reconciliations can each record the same slot; the write
//! path is at-least-once by design.

use std::sync::Arc;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde_json::Value;

use crate::config::RESOLVE_TOLERANCE_MINUTES;
use crate::error::{retry_with_backoff, CoreError, RetryPolicy};
use crate::models::{parse_time_of_day, IntakeRecord, IntakeStatus, Medication};
use crate::store::{DocumentStore, MedicationSource};

/// Source tag written on records produced by this path.
pub const INTAKE_SOURCE: &str = "pastillero";

/// Collection holding a patient's intake records.
pub fn intakes_collection(patient_id: &str) -> String {
    format!("patients/{patient_id}/intakes")
}

/// A (medication, scheduled time) pair projected onto a calendar day.
#[derive(Debug, Clone, PartialEq)]
pub struct DoseSlot {
    pub medication: Medication,
    pub scheduled_at: DateTime<Utc>,
}

/// What a reconciliation produced.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub record_id: String,
    pub record: IntakeRecord,
    /// False when no slot existed and a synthetic unknown-medication
    /// record was written instead.
    pub matched_slot: bool,
}

pub struct IntakeReconciler {
    medications: Arc<dyn MedicationSource>,
    store: Arc<dyn DocumentStore>,
    retry: RetryPolicy,
}

impl IntakeReconciler {
    pub fn new(medications: Arc<dyn MedicationSource>, store: Arc<dyn DocumentStore>) -> Self {
        Self::with_retry(medications, store, RetryPolicy::default())
    }

    pub fn with_retry(
        medications: Arc<dyn MedicationSource>,
        store: Arc<dyn DocumentStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self { medications, store, retry }
    }

    /// Reconcile a confirmed alarm against today's unresolved slots.
    pub async fn reconcile(
        &self,
        patient_id: &str,
        device_id: &str,
    ) -> Result<ReconcileOutcome, CoreError> {
        self.reconcile_at(patient_id, device_id, Utc::now()).await
    }

    /// Matching uses `now`, the wall clock at confirmation time, not the
    /// alarm's activation timestamp. A long confirmation delay can select
    /// a different slot than the one that rang; this is the agreed
    /// behavior until product ownership says otherwise.
    pub async fn reconcile_at(
        &self,
        patient_id: &str,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, CoreError> {
        let meds = self.medications.medications(patient_id).await?;
        let collection = intakes_collection(patient_id);
        let existing = self.store.list(&collection).await?;
        let todays_records = parse_todays_records(&existing, now);

        let slots = flatten_slots(&meds, now);
        let selected = slots
            .into_iter()
            .filter(|slot| !is_resolved(slot, &todays_records))
            .min_by_key(|slot| (slot.scheduled_at - now).num_seconds().abs());

        let (record, matched_slot) = match selected {
            Some(slot) => {
                let record = IntakeRecord {
                    medication_id: slot.medication.id.clone(),
                    medication_name: slot.medication.name.clone(),
                    dosage: slot.medication.dosage.clone(),
                    scheduled_time: slot.scheduled_at,
                    status: IntakeStatus::Taken,
                    taken_at: now,
                    patient_id: patient_id.to_string(),
                    device_id: device_id.to_string(),
                    source: INTAKE_SOURCE.to_string(),
                    timestamp: now,
                };
                (record, true)
            }
            None => {
                tracing::warn!(
                    patient_id,
                    device_id,
                    "no unresolved slot for confirmation, writing unknown-medication record"
                );
                let record = IntakeRecord {
                    medication_id: "desconocido".to_string(),
                    medication_name: "Medicación desconocida".to_string(),
                    dosage: String::new(),
                    scheduled_time: now,
                    status: IntakeStatus::Taken,
                    taken_at: now,
                    patient_id: patient_id.to_string(),
                    device_id: device_id.to_string(),
                    source: INTAKE_SOURCE.to_string(),
                    timestamp: now,
                };
                (record, false)
            }
        };

        let fields = match serde_json::to_value(&record) {
            Ok(Value::Object(map)) => map,
            _ => return Err(CoreError::Unknown("record did not serialize to an object".into())),
        };
        let record_id = retry_with_backoff(&self.retry, || {
            let collection = collection.clone();
            let fields = fields.clone();
            async move { self.store.add(&collection, fields).await }
        })
        .await?;

        tracing::info!(
            patient_id,
            device_id,
            medication = %record.medication_id,
            matched_slot,
            "intake recorded"
        );
        Ok(ReconcileOutcome { record_id, record, matched_slot })
    }
}

/// Project every (medication, time) pair onto `now`'s calendar date.
pub fn flatten_slots(medications: &[Medication], now: DateTime<Utc>) -> Vec<DoseSlot> {
    let date = now.date_naive();
    let mut slots = Vec::new();
    for med in medications {
        for time in &med.times {
            let Some((hour, minute)) = parse_time_of_day(time) else {
                tracing::debug!(medication = %med.id, %time, "skipping unparseable time");
                continue;
            };
            let Some(time_of_day) = NaiveTime::from_hms_opt(hour, minute, 0) else {
                continue;
            };
            let scheduled_at = Utc.from_utc_datetime(&date.and_time(time_of_day));
            slots.push(DoseSlot { medication: med.clone(), scheduled_at });
        }
    }
    slots
}

/// Terminal records of `now`'s calendar date, parsed from raw documents.
/// Malformed documents are skipped rather than failing the run.
fn parse_todays_records(
    raw: &[(String, serde_json::Map<String, Value>)],
    now: DateTime<Utc>,
) -> Vec<IntakeRecord> {
    raw.iter()
        .filter_map(|(id, fields)| {
            match serde_json::from_value::<IntakeRecord>(Value::Object(fields.clone())) {
                Ok(record) => Some(record),
                Err(err) => {
                    tracing::debug!(record_id = %id, "skipping malformed intake record: {err}");
                    None
                }
            }
        })
        .filter(|record| record.scheduled_time.date_naive() == now.date_naive())
        .collect()
}

/// A slot is resolved when any terminal record's scheduled time lies
/// within the tolerance of the slot's nominal time.
fn is_resolved(slot: &DoseSlot, records: &[IntakeRecord]) -> bool {
    records.iter().any(|record| {
        (record.scheduled_time - slot.scheduled_at)
            .num_minutes()
            .abs()
            <= RESOLVE_TOLERANCE_MINUTES
    })
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
