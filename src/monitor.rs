//! Alarm session monitor.
//!
//! Detects the hardware trigger flag ("topo") through a push subscription
//! and tracks the session from activation to confirmation or timeout. The
//! state machine is a pure reducer over an explicit event enum; the
//! monitor itself is a thin imperative adapter that feeds it subscription
//! edges and timer expirations and executes the directives it returns.
//!
//! Exactly one subscription per device: consumers read the published
//! state instead of subscribing to the trigger flag themselves.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::channel::{validate_device_id, trigger_flag_path, CommandChannel};
use crate::config::MATCH_WINDOW_MINUTES;
use crate::error::CoreError;
use crate::models::{parse_time_of_day, CommandPatch, Medication};
use crate::store::{MedicationSource, PushTransport, Subscription};

// ═══════════════════════════════════════════════════════════
// Events, state, directives
// ═══════════════════════════════════════════════════════════

/// Everything that can move the session state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum AlarmEvent {
    /// Trigger flag edge {false, null} → true.
    FlagRaised,
    /// Trigger flag edge true → false.
    FlagCleared,
    /// The activation timer elapsed with the flag still raised.
    TimeoutElapsed,
    /// A caller asked to silence the device.
    DismissRequested,
    /// The push subscription reported an error.
    SubscriptionFailed(String),
}

/// Published session snapshot. One logical session per device at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmSessionState {
    pub device_id: String,
    pub is_active: bool,
    pub active_medication: Option<Medication>,
    pub activated_at: Option<DateTime<Utc>>,
    /// Advisory escalation flag; never clears the hardware flag or forces
    /// the session idle on its own.
    pub has_timed_out: bool,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl AlarmSessionState {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            is_active: false,
            active_medication: None,
            activated_at: None,
            has_timed_out: false,
            is_loading: true,
            error: None,
        }
    }
}

/// Externally-visible work the adapter must perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    StartTimeout,
    ClearTimeout,
    /// Write topo=false through the command channel. The transition to
    /// idle happens only when the subscription later observes false.
    SendDismiss,
}

/// Pure fold of one event into the session state. `medications` is the
/// snapshot used to pick the dose that most plausibly rang the alarm.
pub fn reduce(
    state: &AlarmSessionState,
    event: &AlarmEvent,
    now: DateTime<Utc>,
    medications: &[Medication],
) -> (AlarmSessionState, Vec<Directive>) {
    let mut next = state.clone();
    match event {
        AlarmEvent::FlagRaised => {
            if state.is_active {
                // Flag is level-triggered on the wire; only edges count.
                return (next, Vec::new());
            }
            next.is_active = true;
            next.activated_at = Some(now);
            next.has_timed_out = false;
            next.active_medication = find_current_medication(medications, now);
            if next.active_medication.is_none() {
                tracing::debug!(
                    device_id = %state.device_id,
                    "no scheduled dose within the match window at activation"
                );
            }
            (next, vec![Directive::StartTimeout])
        }
        AlarmEvent::FlagCleared => {
            if !state.is_active {
                return (next, Vec::new());
            }
            next.is_active = false;
            next.has_timed_out = false;
            next.activated_at = None;
            next.active_medication = None;
            (next, vec![Directive::ClearTimeout])
        }
        AlarmEvent::TimeoutElapsed => {
            if state.is_active {
                next.has_timed_out = true;
            }
            (next, Vec::new())
        }
        AlarmEvent::DismissRequested => (next, vec![Directive::SendDismiss]),
        AlarmEvent::SubscriptionFailed(message) => {
            // Keep is_active at its last known value: a transient read
            // error must not look like a dismissal.
            next.error = Some(message.clone());
            (next, Vec::new())
        }
    }
}

/// Among all (medication, time) pairs, pick the one whose time-of-day is
/// closest to `now` (circular distance) and within the 2-hour window.
pub fn find_current_medication(
    medications: &[Medication],
    now: DateTime<Utc>,
) -> Option<Medication> {
    let now_minutes = (now.time().hour() * 60 + now.time().minute()) as i64;

    let mut best: Option<(i64, &Medication)> = None;
    for med in medications {
        for time in &med.times {
            let Some((hour, minute)) = parse_time_of_day(time) else {
                continue;
            };
            let dose_minutes = (hour * 60 + minute) as i64;
            let raw = (dose_minutes - now_minutes).abs();
            let distance = raw.min(1440 - raw);
            if distance > MATCH_WINDOW_MINUTES {
                continue;
            }
            match best {
                Some((best_distance, _)) if best_distance <= distance => {}
                _ => best = Some((distance, med)),
            }
        }
    }
    best.map(|(_, med)| med.clone())
}

// ═══════════════════════════════════════════════════════════
// Monitor adapter
// ═══════════════════════════════════════════════════════════

enum Input {
    Flag(Result<Option<Value>, CoreError>),
    Timeout { generation: u64 },
}

/// One monitor per device. Owns the only trigger-flag subscription and
/// the timeout timer; publishes state on a watch channel.
pub struct AlarmSessionMonitor {
    device_id: String,
    channel: Arc<CommandChannel>,
    state_rx: watch::Receiver<AlarmSessionState>,
    subscription: Mutex<Option<Subscription>>,
    loop_task: Option<JoinHandle<()>>,
}

impl AlarmSessionMonitor {
    /// Attach to a device. An id with path-reserved characters attaches no
    /// listener and resolves quietly to a non-loading, inactive state.
    pub async fn start(
        device_id: impl Into<String>,
        patient_id: &str,
        channel: Arc<CommandChannel>,
        transport: &dyn PushTransport,
        medications: Arc<dyn MedicationSource>,
        timeout: Duration,
    ) -> Self {
        let device_id = device_id.into();
        let mut state = AlarmSessionState::new(&device_id);

        if let Err(err) = validate_device_id(&device_id) {
            tracing::warn!(%device_id, "not subscribing to trigger flag: {err}");
            state.is_loading = false;
            let (_state_tx, state_rx) = watch::channel(state);
            return Self {
                device_id,
                channel,
                state_rx,
                subscription: Mutex::new(None),
                loop_task: None,
            };
        }

        // Snapshot the medication list once per session setup; a lookup
        // failure degrades to the permissive no-candidate policy.
        let meds = match medications.medications(patient_id).await {
            Ok(meds) => meds,
            Err(err) => {
                tracing::warn!(%device_id, "medication snapshot failed: {err}");
                Vec::new()
            }
        };

        state.is_loading = false;
        let (state_tx, state_rx) = watch::channel(state.clone());
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let flag_tx = input_tx.clone();
        let subscription = transport.subscribe(
            &trigger_flag_path(&device_id),
            Box::new(move |snapshot| {
                let _ = flag_tx.send(Input::Flag(snapshot));
            }),
        );

        let loop_task = tokio::spawn(run_loop(state, meds, state_tx, input_rx, input_tx, timeout));

        Self {
            device_id,
            channel,
            state_rx,
            subscription: Mutex::new(Some(subscription)),
            loop_task: Some(loop_task),
        }
    }

    /// Current published snapshot.
    pub fn state(&self) -> AlarmSessionState {
        self.state_rx.borrow().clone()
    }

    /// Watch handle for consumers that want push updates.
    pub fn watch(&self) -> watch::Receiver<AlarmSessionState> {
        self.state_rx.clone()
    }

    /// Ask the device to drop its trigger flag. Does not touch local
    /// state: idle is reached only when the subscription observes false,
    /// so local state can lag the device for a moment.
    pub async fn dismiss(&self) -> Result<(), CoreError> {
        self.channel
            .send(&self.device_id, CommandPatch::topo(false))
            .await
    }

    /// Detach the subscription and stop the event loop.
    pub fn stop(&self) {
        if let Some(subscription) = self.subscription.lock().unwrap().take() {
            subscription.unsubscribe();
        }
        if let Some(task) = &self.loop_task {
            task.abort();
        }
    }
}

impl Drop for AlarmSessionMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(
    mut state: AlarmSessionState,
    medications: Vec<Medication>,
    state_tx: watch::Sender<AlarmSessionState>,
    mut input_rx: mpsc::UnboundedReceiver<Input>,
    input_tx: mpsc::UnboundedSender<Input>,
    timeout: Duration,
) {
    let mut last_flag: Option<bool> = None;
    let mut generation: u64 = 0;
    let mut timer: Option<JoinHandle<()>> = None;

    while let Some(input) = input_rx.recv().await {
        let event = match input {
            Input::Flag(Ok(snapshot)) => {
                let flag = flag_value(snapshot.as_ref());
                let event = match (last_flag.unwrap_or(false), flag) {
                    (false, true) => Some(AlarmEvent::FlagRaised),
                    (true, false) => Some(AlarmEvent::FlagCleared),
                    _ => None,
                };
                last_flag = Some(flag);
                match event {
                    Some(event) => event,
                    None => continue,
                }
            }
            Input::Flag(Err(err)) => {
                tracing::error!(device_id = %state.device_id, "trigger subscription error: {err}");
                AlarmEvent::SubscriptionFailed(err.user_message())
            }
            Input::Timeout { generation: fired } => {
                if fired != generation {
                    continue; // timer of a superseded session
                }
                AlarmEvent::TimeoutElapsed
            }
        };

        let (next, directives) = reduce(&state, &event, Utc::now(), &medications);
        for directive in directives {
            match directive {
                Directive::StartTimeout => {
                    generation += 1;
                    if let Some(old) = timer.take() {
                        old.abort();
                    }
                    let tx = input_tx.clone();
                    let fired = generation;
                    timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        let _ = tx.send(Input::Timeout { generation: fired });
                    }));
                }
                Directive::ClearTimeout => {
                    generation += 1;
                    if let Some(old) = timer.take() {
                        old.abort();
                    }
                }
                Directive::SendDismiss => {
                    // dismiss() performs the write directly; nothing to do
                    // from the loop.
                }
            }
        }

        if next != state {
            state = next;
            let _ = state_tx.send(state.clone());
        }
    }

    if let Some(old) = timer.take() {
        old.abort();
    }
}

/// Interpret a trigger-flag snapshot. Only an explicit boolean true
/// raises; null, missing and malformed values all read as false.
fn flag_value(snapshot: Option<&Value>) -> bool {
    matches!(snapshot, Some(Value::Bool(true)))
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
