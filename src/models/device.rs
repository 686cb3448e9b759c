//! Device-facing document shapes: the command document, the read-only
//! state document, and the desired-configuration document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

// ═══════════════════════════════════════════════════════════
// Command document
// ═══════════════════════════════════════════════════════════

/// Partial write against a device's command document. Every field is
/// independently settable; the document carries no version or sequence
/// number, so concurrent writers can clobber each other under the
/// merge-fallback path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandPatch {
    pub topo: Option<bool>,
    pub buzzer: Option<bool>,
    pub led: Option<bool>,
    /// Outer `None` leaves the field untouched; `Some(None)` deletes it;
    /// `Some(Some(_))` sets an "R,G,B" string.
    pub led_color: Option<Option<String>>,
    pub reboot: Option<bool>,
    /// Schedule activation keys (`<day><timeband>`), written in bulk.
    pub grid: BTreeMap<String, bool>,
}

impl CommandPatch {
    pub fn topo(value: bool) -> Self {
        Self { topo: Some(value), ..Default::default() }
    }

    pub fn buzzer(value: bool) -> Self {
        Self { buzzer: Some(value), ..Default::default() }
    }

    pub fn led(value: bool) -> Self {
        Self { led: Some(value), ..Default::default() }
    }

    /// Setting a color implies turning the LED on.
    pub fn led_color(r: u8, g: u8, b: u8) -> Self {
        Self {
            led: Some(true),
            led_color: Some(Some(format!("{r},{g},{b}"))),
            ..Default::default()
        }
    }

    pub fn reboot() -> Self {
        Self { reboot: Some(true), ..Default::default() }
    }

    /// Everything off: topo, buzzer, led and reboot false, color removed.
    pub fn clear_all() -> Self {
        Self {
            topo: Some(false),
            buzzer: Some(false),
            led: Some(false),
            led_color: Some(None),
            reboot: Some(false),
            grid: BTreeMap::new(),
        }
    }

    pub fn from_grid(grid: BTreeMap<String, bool>) -> Self {
        Self { grid, ..Default::default() }
    }

    /// Document field map for the store. `Value::Null` requests deletion.
    pub fn into_fields(self) -> Map<String, Value> {
        let mut fields = Map::new();
        if let Some(v) = self.topo {
            fields.insert("topo".into(), Value::Bool(v));
        }
        if let Some(v) = self.buzzer {
            fields.insert("buzzer".into(), Value::Bool(v));
        }
        if let Some(v) = self.led {
            fields.insert("led".into(), Value::Bool(v));
        }
        match self.led_color {
            Some(Some(color)) => {
                fields.insert("ledColor".into(), Value::String(color));
            }
            Some(None) => {
                fields.insert("ledColor".into(), Value::Null);
            }
            None => {}
        }
        if let Some(v) = self.reboot {
            fields.insert("reboot".into(), Value::Bool(v));
        }
        for (key, active) in self.grid {
            fields.insert(key, Value::Bool(active));
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.topo.is_none()
            && self.buzzer.is_none()
            && self.led.is_none()
            && self.led_color.is_none()
            && self.reboot.is_none()
            && self.grid.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════
// State document (read-only input)
// ═══════════════════════════════════════════════════════════

/// Device-reported state. The core only reads this document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub battery_level: Option<u8>,
    #[serde(default)]
    pub current_status: Option<String>,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(default)]
    pub time_synced: bool,
    #[serde(default)]
    pub wifi_signal_strength: Option<i32>,
}

// ═══════════════════════════════════════════════════════════
// Desired configuration
// ═══════════════════════════════════════════════════════════

/// How the device should announce an alarm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmMode {
    Off,
    Sound,
    Led,
    #[default]
    Both,
}

impl AlarmMode {
    /// Parse the enum from its document string form.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "off" => Ok(AlarmMode::Off),
            "sound" => Ok(AlarmMode::Sound),
            "led" => Ok(AlarmMode::Led),
            "both" => Ok(AlarmMode::Both),
            other => Err(CoreError::validation(
                "alarm_mode",
                format!("valor desconocido: {other}"),
            )),
        }
    }
}

/// Caregiver-authored alarm configuration, validated before any remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredConfig {
    pub alarm_mode: AlarmMode,
    /// PWM intensity, 0..=1023.
    pub led_intensity: u16,
    /// RGB channels, each 0..=255.
    pub led_color_rgb: [u16; 3],
}

impl Default for DesiredConfig {
    fn default() -> Self {
        Self {
            alarm_mode: AlarmMode::Both,
            led_intensity: 512,
            led_color_rgb: [0, 128, 255],
        }
    }
}

impl DesiredConfig {
    /// Range checks, raised before touching the store.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.led_intensity > 1023 {
            return Err(CoreError::validation(
                "led_intensity",
                format!("{} fuera de rango [0,1023]", self.led_intensity),
            ));
        }
        for (idx, channel) in self.led_color_rgb.iter().enumerate() {
            if *channel > 255 {
                return Err(CoreError::validation(
                    "led_color_rgb",
                    format!("canal {idx} = {channel} fuera de rango [0,255]"),
                ));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_all_resets_every_command_field() {
        let fields = CommandPatch::clear_all().into_fields();
        assert_eq!(fields["topo"], Value::Bool(false));
        assert_eq!(fields["buzzer"], Value::Bool(false));
        assert_eq!(fields["led"], Value::Bool(false));
        assert_eq!(fields["ledColor"], Value::Null);
        assert_eq!(fields["reboot"], Value::Bool(false));
        assert_eq!(fields.len(), 5);
    }

    #[test]
    fn led_color_patch_implies_led_on() {
        let fields = CommandPatch::led_color(255, 0, 128).into_fields();
        assert_eq!(fields["led"], Value::Bool(true));
        assert_eq!(fields["ledColor"], Value::String("255,0,128".into()));
    }

    #[test]
    fn untouched_fields_are_absent() {
        let fields = CommandPatch::topo(false).into_fields();
        assert_eq!(fields.len(), 1);
        assert!(!fields.contains_key("buzzer"));
        assert!(!fields.contains_key("ledColor"));
    }

    #[test]
    fn grid_keys_pass_through() {
        let mut grid = BTreeMap::new();
        grid.insert("lunesmañana".to_string(), true);
        grid.insert("lunesnoche".to_string(), false);
        let fields = CommandPatch::from_grid(grid).into_fields();
        assert_eq!(fields["lunesmañana"], Value::Bool(true));
        assert_eq!(fields["lunesnoche"], Value::Bool(false));
    }

    #[test]
    fn empty_patch_reports_empty() {
        assert!(CommandPatch::default().is_empty());
        assert!(!CommandPatch::reboot().is_empty());
    }

    #[test]
    fn alarm_mode_parses_document_strings() {
        assert_eq!(AlarmMode::parse("off").unwrap(), AlarmMode::Off);
        assert_eq!(AlarmMode::parse("both").unwrap(), AlarmMode::Both);
        assert!(matches!(
            AlarmMode::parse("loud"),
            Err(CoreError::Validation { .. })
        ));
    }

    #[test]
    fn desired_config_accepts_boundary_values() {
        let cfg = DesiredConfig {
            alarm_mode: AlarmMode::Led,
            led_intensity: 1023,
            led_color_rgb: [255, 255, 255],
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn desired_config_rejects_out_of_range_intensity() {
        let cfg = DesiredConfig {
            led_intensity: 1024,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "led_intensity"));
    }

    #[test]
    fn desired_config_rejects_out_of_range_color() {
        let cfg = DesiredConfig {
            led_color_rgb: [256, 0, 0],
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "led_color_rgb"));
    }

    #[test]
    fn device_status_tolerates_sparse_documents() {
        let status: DeviceStatus = serde_json::from_str(r#"{"is_online": true}"#).unwrap();
        assert!(status.is_online);
        assert!(status.battery_level.is_none());
        assert!(!status.time_synced);
    }
}
