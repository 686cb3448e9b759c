//! Session overlay controller.
//!
//! Sits on top of the alarm session monitor and drives everything the
//! confirmation overlay needs: the visual phase (alarming, then a short
//! confirming window once the flag clears), per-patient effect toggles,
//! the best-effort buzzer on activation, and the ordered effect sequence
//! behind the confirm button. Effects are individually caught so one
//! failure never blocks the rest.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::CommandChannel;
use crate::config::CONFIRMING_WINDOW;
use crate::error::CoreError;
use crate::monitor::{AlarmSessionMonitor, AlarmSessionState};
use crate::reconcile::IntakeReconciler;
use crate::store::KeyValueStore;

// ═══════════════════════════════════════════════════════════
// Phases and effect toggles
// ═══════════════════════════════════════════════════════════

/// What the overlay should show right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayPhase {
    Quiescent,
    Alarming,
    /// Brief post-clear window acknowledging the confirmation.
    Confirming,
}

/// Key of a patient's sound-effect toggle.
pub fn sound_effects_key(patient_id: &str) -> String {
    format!("efectos_sonido:{patient_id}")
}

/// Key of a patient's visual-effect toggle.
pub fn visual_effects_key(patient_id: &str) -> String {
    format!("efectos_visual:{patient_id}")
}

/// Read a toggle; absent or unreadable both mean enabled.
async fn effect_enabled(kv: &dyn KeyValueStore, key: &str) -> bool {
    match kv.get_flag(key).await {
        Ok(flag) => flag.unwrap_or(true),
        Err(err) => {
            tracing::warn!(%key, "effect toggle read failed, defaulting to enabled: {err}");
            true
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Confirmation effects
// ═══════════════════════════════════════════════════════════

/// The named steps behind the confirm button, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmEffect {
    SilenceBuzzer,
    ClearCommands,
    RecordIntake,
}

#[derive(Debug, Clone)]
pub struct EffectOutcome {
    pub effect: ConfirmEffect,
    pub result: Result<(), CoreError>,
}

/// Per-effect results of one confirmation. Order matches execution order.
#[derive(Debug, Clone)]
pub struct ConfirmReport {
    pub outcomes: Vec<EffectOutcome>,
}

impl ConfirmReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn succeeded(&self, effect: ConfirmEffect) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.effect == effect && o.result.is_ok())
    }

    /// True when the intake record made it to storage, regardless of how
    /// the device-side effects fared.
    pub fn intake_recorded(&self) -> bool {
        self.succeeded(ConfirmEffect::RecordIntake)
    }
}

// ═══════════════════════════════════════════════════════════
// Controller
// ═══════════════════════════════════════════════════════════

/// One controller per (patient, device) session. Watches the monitor's
/// published state; never subscribes to the trigger flag itself.
pub struct SessionOverlayController {
    patient_id: String,
    device_id: String,
    channel: Arc<CommandChannel>,
    reconciler: Arc<IntakeReconciler>,
    kv: Arc<dyn KeyValueStore>,
    monitor_rx: watch::Receiver<AlarmSessionState>,
    confirming_until: Arc<Mutex<Option<DateTime<Utc>>>>,
    watcher: JoinHandle<()>,
}

impl SessionOverlayController {
    pub fn start(
        monitor: &AlarmSessionMonitor,
        channel: Arc<CommandChannel>,
        reconciler: Arc<IntakeReconciler>,
        kv: Arc<dyn KeyValueStore>,
        patient_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        let patient_id = patient_id.into();
        let device_id = device_id.into();
        let monitor_rx = monitor.watch();
        let confirming_until = Arc::new(Mutex::new(None));

        let watcher = tokio::spawn(watch_session(
            monitor.watch(),
            Arc::clone(&channel),
            Arc::clone(&kv),
            patient_id.clone(),
            device_id.clone(),
            Arc::clone(&confirming_until),
        ));

        Self {
            patient_id,
            device_id,
            channel,
            reconciler,
            kv,
            monitor_rx,
            confirming_until,
            watcher,
        }
    }

    /// Phase at an explicit instant. Alarming wins over a leftover
    /// confirming deadline.
    pub fn phase_at(&self, now: DateTime<Utc>) -> OverlayPhase {
        if self.monitor_rx.borrow().is_active {
            return OverlayPhase::Alarming;
        }
        let deadline = *self.confirming_until.lock().unwrap();
        match deadline {
            Some(until) if now < until => OverlayPhase::Confirming,
            _ => OverlayPhase::Quiescent,
        }
    }

    pub fn phase(&self) -> OverlayPhase {
        self.phase_at(Utc::now())
    }

    pub async fn sound_enabled(&self) -> bool {
        effect_enabled(self.kv.as_ref(), &sound_effects_key(&self.patient_id)).await
    }

    pub async fn visual_enabled(&self) -> bool {
        effect_enabled(self.kv.as_ref(), &visual_effects_key(&self.patient_id)).await
    }

    /// Persist the sound toggle. Best-effort: a storage failure keeps the
    /// session going and only loses the preference.
    pub async fn set_sound_enabled(&self, enabled: bool) {
        let key = sound_effects_key(&self.patient_id);
        if let Err(err) = self.kv.set_flag(&key, enabled).await {
            tracing::warn!(%key, "effect toggle write failed: {err}");
        }
    }

    pub async fn set_visual_enabled(&self, enabled: bool) {
        let key = visual_effects_key(&self.patient_id);
        if let Err(err) = self.kv.set_flag(&key, enabled).await {
            tracing::warn!(%key, "effect toggle write failed: {err}");
        }
    }

    /// The confirm button. Runs the effects in a fixed order, each one
    /// individually caught, and reports what happened per effect. Intake
    /// recording runs even when the device-side writes fail: a silencing
    /// problem must not lose the adherence record.
    pub async fn confirm(&self) -> ConfirmReport {
        let mut outcomes = Vec::with_capacity(3);

        let silence = self.channel.trigger_buzzer(&self.device_id, false).await;
        if let Err(err) = &silence {
            tracing::warn!(device_id = %self.device_id, "buzzer silence failed: {err}");
        }
        outcomes.push(EffectOutcome { effect: ConfirmEffect::SilenceBuzzer, result: silence });

        let clear = self.channel.clear_all(&self.device_id).await;
        if let Err(err) = &clear {
            tracing::warn!(device_id = %self.device_id, "command clear failed: {err}");
        }
        outcomes.push(EffectOutcome { effect: ConfirmEffect::ClearCommands, result: clear });

        let record = self
            .reconciler
            .reconcile(&self.patient_id, &self.device_id)
            .await
            .map(|_| ());
        if let Err(err) = &record {
            tracing::error!(device_id = %self.device_id, "intake recording failed: {err}");
        }
        outcomes.push(EffectOutcome { effect: ConfirmEffect::RecordIntake, result: record });

        ConfirmReport { outcomes }
    }

    pub fn stop(&self) {
        self.watcher.abort();
    }
}

impl Drop for SessionOverlayController {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// Follow the monitor's activity edges: buzz (if enabled) on activation,
/// arm the confirming window when the session clears.
async fn watch_session(
    mut rx: watch::Receiver<AlarmSessionState>,
    channel: Arc<CommandChannel>,
    kv: Arc<dyn KeyValueStore>,
    patient_id: String,
    device_id: String,
    confirming_until: Arc<Mutex<Option<DateTime<Utc>>>>,
) {
    let mut was_active = rx.borrow().is_active;
    while rx.changed().await.is_ok() {
        let is_active = rx.borrow().is_active;
        if is_active && !was_active {
            if effect_enabled(kv.as_ref(), &sound_effects_key(&patient_id)).await {
                if let Err(err) = channel.trigger_buzzer(&device_id, true).await {
                    tracing::warn!(%device_id, "activation buzzer failed: {err}");
                }
            }
        } else if !is_active && was_active {
            let until = Utc::now()
                + ChronoDuration::milliseconds(CONFIRMING_WINDOW.as_millis() as i64);
            *confirming_until.lock().unwrap() = Some(until);
        }
        was_active = is_active;
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetryPolicy;
    use crate::models::Medication;
    use crate::reconcile::intakes_collection;
    use crate::store::{
        DocumentStore, MedicationSource, MemoryKv, MemoryStore, MemoryTransport, StaticAuth,
        StaticMedications,
    };
    use serde_json::json;
    use std::time::Duration;

    struct Rig {
        store: Arc<MemoryStore>,
        transport: MemoryTransport,
        kv: Arc<MemoryKv>,
        monitor: AlarmSessionMonitor,
        controller: SessionOverlayController,
    }

    async fn rig() -> Rig {
        let store = Arc::new(MemoryStore::new());
        let transport = MemoryTransport::new();
        let kv = Arc::new(MemoryKv::new());
        let meds = vec![Medication::new("m1", "Enalapril", "10mg", &["08:00"], &["Tue"])];
        let source = Arc::new(StaticMedications::new(meds));

        let channel = Arc::new(CommandChannel::with_retry(
            Arc::new(StaticAuth::signed_in("u1")),
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            RetryPolicy::immediate(1),
        ));
        let reconciler = Arc::new(IntakeReconciler::with_retry(
            Arc::clone(&source) as Arc<dyn MedicationSource>,
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            RetryPolicy::immediate(1),
        ));

        let monitor = AlarmSessionMonitor::start(
            "d1",
            "p1",
            Arc::clone(&channel),
            &transport,
            source,
            Duration::from_secs(300),
        )
        .await;

        let controller = SessionOverlayController::start(
            &monitor,
            channel,
            reconciler,
            Arc::clone(&kv) as Arc<dyn KeyValueStore>,
            "p1",
            "d1",
        );

        Rig { store, transport, kv, monitor, controller }
    }

    async fn wait_until<F: Fn() -> bool>(predicate: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !predicate() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never became true")
    }

    fn buzzer_is(store: &MemoryStore, value: bool) -> bool {
        store
            .document("devices/d1/commands")
            .and_then(|doc| doc.get("buzzer").cloned())
            == Some(json!(value))
    }

    // ── Effect toggles ───────────────────────────────────────

    #[tokio::test]
    async fn toggles_default_to_enabled() {
        let rig = rig().await;
        assert!(rig.controller.sound_enabled().await);
        assert!(rig.controller.visual_enabled().await);
    }

    #[tokio::test]
    async fn toggles_persist_per_patient() {
        let rig = rig().await;
        rig.controller.set_sound_enabled(false).await;

        assert!(!rig.controller.sound_enabled().await);
        assert!(rig.controller.visual_enabled().await); // independent
        assert_eq!(rig.kv.get_flag("efectos_sonido:p1").await.unwrap(), Some(false));
    }

    #[tokio::test]
    async fn kv_failure_defaults_to_enabled_and_never_propagates() {
        let rig = rig().await;
        rig.kv.set_failing(true);

        assert!(rig.controller.sound_enabled().await);
        rig.controller.set_visual_enabled(false).await; // swallowed

        rig.kv.set_failing(false);
        assert!(rig.controller.visual_enabled().await); // write was lost
    }

    // ── Phase transitions ────────────────────────────────────

    #[tokio::test]
    async fn phase_follows_the_session() {
        let rig = rig().await;
        assert_eq!(rig.controller.phase(), OverlayPhase::Quiescent);

        rig.transport.publish("devices/d1/commands/topo", Some(json!(true)));
        wait_until(|| rig.controller.phase() == OverlayPhase::Alarming).await;

        rig.transport.publish("devices/d1/commands/topo", Some(json!(false)));
        wait_until(|| rig.controller.phase() == OverlayPhase::Confirming).await;

        // The window closes on its own.
        let later = Utc::now() + ChronoDuration::seconds(4);
        assert_eq!(rig.controller.phase_at(later), OverlayPhase::Quiescent);
    }

    #[tokio::test]
    async fn reactivation_during_confirming_shows_alarming() {
        let rig = rig().await;
        rig.transport.publish("devices/d1/commands/topo", Some(json!(true)));
        wait_until(|| rig.controller.phase() == OverlayPhase::Alarming).await;
        rig.transport.publish("devices/d1/commands/topo", Some(json!(false)));
        wait_until(|| rig.controller.phase() == OverlayPhase::Confirming).await;

        rig.transport.publish("devices/d1/commands/topo", Some(json!(true)));
        wait_until(|| rig.controller.phase() == OverlayPhase::Alarming).await;
    }

    // ── Activation buzzer ────────────────────────────────────

    #[tokio::test]
    async fn activation_buzzes_when_sound_is_enabled() {
        let rig = rig().await;
        rig.transport.publish("devices/d1/commands/topo", Some(json!(true)));
        wait_until(|| buzzer_is(&rig.store, true)).await;
    }

    #[tokio::test]
    async fn activation_stays_silent_when_sound_is_disabled() {
        let rig = rig().await;
        rig.controller.set_sound_enabled(false).await;

        rig.transport.publish("devices/d1/commands/topo", Some(json!(true)));
        wait_until(|| rig.controller.phase() == OverlayPhase::Alarming).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(rig.store.document("devices/d1/commands").is_none());
    }

    // ── Confirmation ─────────────────────────────────────────

    #[tokio::test]
    async fn confirm_runs_all_effects_in_order() {
        let rig = rig().await;
        rig.transport.publish("devices/d1/commands/topo", Some(json!(true)));
        wait_until(|| rig.controller.phase() == OverlayPhase::Alarming).await;
        // Let the activation buzzer land before confirming, so the silence
        // write below is the last buzzer write.
        wait_until(|| buzzer_is(&rig.store, true)).await;

        let report = rig.controller.confirm().await;

        assert!(report.all_succeeded());
        assert_eq!(
            report.outcomes.iter().map(|o| o.effect).collect::<Vec<_>>(),
            vec![
                ConfirmEffect::SilenceBuzzer,
                ConfirmEffect::ClearCommands,
                ConfirmEffect::RecordIntake,
            ]
        );

        let doc = rig.store.document("devices/d1/commands").unwrap();
        assert_eq!(doc["buzzer"], json!(false));
        assert_eq!(doc["topo"], json!(false));

        let records = rig.store.list(&intakes_collection("p1")).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1["source"], json!("pastillero"));
    }

    #[tokio::test]
    async fn device_write_failures_do_not_block_intake_recording() {
        let rig = rig().await;
        // Business failure on merges: hits both command writes, but not
        // the collection append behind the intake record.
        rig.store.fail_merges_with(CoreError::Permission("rules".into()));

        let report = rig.controller.confirm().await;

        assert!(!report.succeeded(ConfirmEffect::SilenceBuzzer));
        assert!(!report.succeeded(ConfirmEffect::ClearCommands));
        assert!(report.intake_recorded());

        let records = rig.store.list(&intakes_collection("p1")).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn stopping_the_controller_stops_edge_reactions() {
        let rig = rig().await;
        rig.controller.stop();

        rig.transport.publish("devices/d1/commands/topo", Some(json!(true)));
        // Monitor still tracks the session; the overlay no longer buzzes.
        let mut rx = rig.monitor.watch();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if rx.borrow().is_active {
                    break;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(rig.store.document("devices/d1/commands").is_none());
    }
}
