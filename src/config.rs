//! Application-level constants and timing defaults.

use std::time::Duration;

pub const APP_NAME: &str = "Pastillero";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long an alarm may ring before the session is flagged as timed out.
/// The flag is advisory: it never clears the hardware trigger by itself.
pub const ALARM_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Visual "Confirming" window shown after the trigger flag clears.
pub const CONFIRMING_WINDOW: Duration = Duration::from_millis(3_500);

/// Maximum distance between the current time-of-day and a scheduled dose
/// for the dose to be considered the one that triggered the alarm.
pub const MATCH_WINDOW_MINUTES: i64 = 120;

/// A slot counts as resolved when a terminal intake record exists within
/// this many minutes of its nominal time.
pub const RESOLVE_TOLERANCE_MINUTES: i64 = 5;

/// Default log filter when RUST_LOG is unset.
pub fn default_log_filter() -> String {
    format!("{}=info", env!("CARGO_PKG_NAME").replace('-', "_"))
}
