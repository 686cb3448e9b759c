//! Pastillero companion core.
//!
//! Connects a caregiver-facing application to a networked medication
//! dispenser: compiles medication lists into the device's weekly
//! activation grid, writes named commands to its command document,
//! tracks alarm sessions from the hardware trigger flag, drives the
//! confirmation overlay, and records confirmed intakes.
//!
//! Backends (auth, document database, push transport, key-value storage)
//! are trait seams in [`store`]; the core never names a concrete vendor.

pub mod channel;
pub mod config;
pub mod error;
pub mod models;
pub mod monitor;
pub mod overlay;
pub mod reconcile;
pub mod schedule;
pub mod store;

pub use channel::CommandChannel;
pub use error::{CoreError, RetryPolicy};
pub use monitor::{AlarmSessionMonitor, AlarmSessionState};
pub use overlay::{ConfirmReport, OverlayPhase, SessionOverlayController};
pub use reconcile::IntakeReconciler;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// default crate-level filter. Idempotent: a second call is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
