//! Device command channel.
//!
//! Named commands (topo, buzzer, led, ledColor, reboot) and the bulk grid
//! write, all funneled through `send`: partial merge against the command
//! document, with full-overwrite fallback when the merge itself fails at
//! the transport level. The fallback can erase fields another writer set
//! concurrently; the document carries no version, so last write wins.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{retry_with_backoff, CoreError, RetryPolicy};
use crate::models::{CommandPatch, DesiredConfig, DeviceStatus};
use crate::store::{AuthProvider, DocumentStore};

/// Characters the document path syntax reserves. A device id containing
/// any of these never reaches the store.
pub const RESERVED_ID_CHARS: [char; 6] = ['/', '.', '#', '$', '[', ']'];

/// Reject empty ids and ids with path-reserved characters.
pub fn validate_device_id(device_id: &str) -> Result<(), CoreError> {
    if device_id.is_empty() {
        return Err(CoreError::validation("device_id", "id vacío"));
    }
    if device_id.contains(RESERVED_ID_CHARS) {
        return Err(CoreError::validation(
            "device_id",
            format!("id contiene caracteres reservados: {device_id}"),
        ));
    }
    Ok(())
}

/// Document path of a device's command document.
pub fn command_doc_path(device_id: &str) -> String {
    format!("devices/{device_id}/commands")
}

/// Document path of the trigger flag within the command document.
pub fn trigger_flag_path(device_id: &str) -> String {
    format!("devices/{device_id}/commands/topo")
}

fn state_doc_path(device_id: &str) -> String {
    format!("devices/{device_id}/state")
}

fn config_doc_path(device_id: &str) -> String {
    format!("devices/{device_id}/config")
}

/// Transport-facing command channel. One instance serves all devices.
pub struct CommandChannel {
    auth: Arc<dyn AuthProvider>,
    store: Arc<dyn DocumentStore>,
    retry: RetryPolicy,
}

impl CommandChannel {
    pub fn new(auth: Arc<dyn AuthProvider>, store: Arc<dyn DocumentStore>) -> Self {
        Self::with_retry(auth, store, RetryPolicy::default())
    }

    pub fn with_retry(
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn DocumentStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self { auth, store, retry }
    }

    /// Write a partial command. Requires a signed-in principal; merges the
    /// given fields and falls back to a full overwrite if the merge fails
    /// in transport (not on a business error).
    pub async fn send(&self, device_id: &str, patch: CommandPatch) -> Result<(), CoreError> {
        validate_device_id(device_id)?;
        self.require_principal().await?;
        if patch.is_empty() {
            tracing::debug!(device_id, "empty command patch, nothing to send");
            return Ok(());
        }

        let path = command_doc_path(device_id);
        let fields = patch.into_fields();
        retry_with_backoff(&self.retry, || {
            let path = path.clone();
            let fields = fields.clone();
            async move {
                match self.store.merge(&path, fields.clone()).await {
                    Ok(()) => Ok(()),
                    Err(err @ CoreError::Transport { .. }) => {
                        tracing::warn!(
                            %path,
                            "command merge failed in transport, overwriting document: {err}"
                        );
                        self.store.set(&path, fields).await
                    }
                    Err(other) => Err(other),
                }
            }
        })
        .await
    }

    /// Raise the trigger flag (manual alarm test).
    pub async fn trigger_topo(&self, device_id: &str) -> Result<(), CoreError> {
        self.send(device_id, CommandPatch::topo(true)).await
    }

    pub async fn trigger_buzzer(&self, device_id: &str, enabled: bool) -> Result<(), CoreError> {
        self.send(device_id, CommandPatch::buzzer(enabled)).await
    }

    pub async fn set_led(&self, device_id: &str, enabled: bool) -> Result<(), CoreError> {
        self.send(device_id, CommandPatch::led(enabled)).await
    }

    /// Set the LED color (implies led=true). Channels are validated before
    /// any remote call.
    pub async fn set_led_color(
        &self,
        device_id: &str,
        r: u16,
        g: u16,
        b: u16,
    ) -> Result<(), CoreError> {
        for (name, channel) in [("r", r), ("g", g), ("b", b)] {
            if channel > 255 {
                return Err(CoreError::validation(
                    "led_color",
                    format!("canal {name} = {channel} fuera de rango [0,255]"),
                ));
            }
        }
        self.send(device_id, CommandPatch::led_color(r as u8, g as u8, b as u8))
            .await
    }

    pub async fn reboot(&self, device_id: &str) -> Result<(), CoreError> {
        self.send(device_id, CommandPatch::reboot()).await
    }

    /// Silence and darken everything: topo/buzzer/led/reboot false,
    /// ledColor removed.
    pub async fn clear_all(&self, device_id: &str) -> Result<(), CoreError> {
        self.send(device_id, CommandPatch::clear_all()).await
    }

    /// Bulk write of the 28-key activation grid. Every key is written,
    /// including the false ones; each sync overwrites the whole grid.
    pub async fn write_grid(
        &self,
        device_id: &str,
        grid: BTreeMap<String, bool>,
    ) -> Result<(), CoreError> {
        self.send(device_id, CommandPatch::from_grid(grid)).await
    }

    /// Read the raw command document.
    pub async fn read(&self, device_id: &str) -> Result<Option<Map<String, Value>>, CoreError> {
        validate_device_id(device_id)?;
        self.store.get(&command_doc_path(device_id)).await
    }

    /// Read the device-reported state document.
    pub async fn read_status(&self, device_id: &str) -> Result<Option<DeviceStatus>, CoreError> {
        validate_device_id(device_id)?;
        let doc = self.store.get(&state_doc_path(device_id)).await?;
        match doc {
            None => Ok(None),
            Some(fields) => serde_json::from_value(Value::Object(fields))
                .map(Some)
                .map_err(|e| CoreError::Unknown(format!("malformed state document: {e}"))),
        }
    }

    /// Validate and persist the desired alarm configuration. Validation
    /// failures surface before any remote call; the write itself is a
    /// plain merge (the overwrite fallback is a command-document quirk).
    pub async fn save_desired_config(
        &self,
        device_id: &str,
        config: &DesiredConfig,
    ) -> Result<(), CoreError> {
        validate_device_id(device_id)?;
        config.validate()?;
        self.require_principal().await?;

        let fields = match serde_json::to_value(config) {
            Ok(Value::Object(map)) => map,
            _ => return Err(CoreError::Unknown("config did not serialize to an object".into())),
        };
        let path = config_doc_path(device_id);
        retry_with_backoff(&self.retry, || {
            let path = path.clone();
            let fields = fields.clone();
            async move { self.store.merge(&path, fields).await }
        })
        .await
    }

    async fn require_principal(&self) -> Result<(), CoreError> {
        match self.auth.current_principal().await {
            Some(_) => Ok(()),
            None => Err(CoreError::Auth("sin sesión activa".into())),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
