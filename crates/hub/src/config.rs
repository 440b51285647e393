//! TOML config file loading with defaults for every option.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-phase trip current in amperes. Strictly-greater comparison.
    pub amperage_threshold: f64,
    /// Master switch for the phase-threshold safety shutdown.
    pub safety_enabled: bool,
    /// MCB status re-read period (authoritative local channel).
    pub polling_interval_ms: u64,
    /// Minimum interval between two safety trips.
    pub switch_off_cooldown_ms: u64,
    /// Temperature at or above which the operator is alerted.
    pub temperature_alert_celsius: f64,
    pub notification_cooldown_ms: NotificationCooldowns,
    pub web_port: u16,
    pub mqtt: MqttConfig,
    pub mcb: McbConfig,
    pub ventilator: VentilatorConfig,
    pub floor_heating: FloorHeatingConfig,
    pub notifier: Option<NotifierConfig>,
    pub flic: FlicConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            amperage_threshold: 25.0,
            safety_enabled: true,
            polling_interval_ms: 5_000,
            switch_off_cooldown_ms: 10_000,
            temperature_alert_celsius: 85.0,
            notification_cooldown_ms: NotificationCooldowns::default(),
            web_port: 8080,
            mqtt: MqttConfig::default(),
            mcb: McbConfig::default(),
            ventilator: VentilatorConfig::default(),
            floor_heating: FloorHeatingConfig::default(),
            notifier: None,
            flic: FlicConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationCooldowns {
    pub safety_shutdown: u64,
    pub temperature_alert: u64,
}

impl Default for NotificationCooldowns {
    fn default() -> Self {
        Self {
            safety_shutdown: 60_000,
            temperature_alert: 300_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Phase currents arrive on `<prefix>/<segment>` where the last segment
    /// names the phase (`l1_a`, `l2_a`, `l3_a`).
    pub phase_topic_prefix: Option<String>,
    pub ruuvi_topic: Option<String>,
    pub door_topic: Option<String>,
    pub button_topic: Option<String>,
    pub ventilator_status_topic: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "sauna-hub".to_string(),
            username: None,
            password: None,
            phase_topic_prefix: None,
            ruuvi_topic: None,
            door_topic: None,
            button_topic: None,
            ventilator_status_topic: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McbConfig {
    /// Address of the breaker's local RPC endpoint. Authoritative source.
    pub host: Option<String>,
    pub timeout_ms: u64,
    /// Optional MQTT topic observed as a fallback status source.
    pub status_topic: Option<String>,
}

impl Default for McbConfig {
    fn default() -> Self {
        Self {
            host: None,
            timeout_ms: 5_000,
            status_topic: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VentilatorConfig {
    /// Relay address. Ventilator control is disabled when unset.
    pub ip: Option<String>,
    pub delay_off_minutes: u64,
    pub keep_alive_minutes: u64,
    pub timeout_ms: u64,
}

impl Default for VentilatorConfig {
    fn default() -> Self {
        Self {
            ip: None,
            delay_off_minutes: 60,
            keep_alive_minutes: 25,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FloorHeatingConfig {
    /// Thermostat address. Floor-heating control is disabled when unset.
    pub host: Option<String>,
    pub device_id: String,
    pub local_key: String,
    pub protocol_version: String,
    pub target_on_c: f64,
    pub target_off_c: f64,
    pub poll_interval_s: u64,
    pub timeout_ms: u64,
}

impl Default for FloorHeatingConfig {
    fn default() -> Self {
        Self {
            host: None,
            device_id: String::new(),
            local_key: String::new(),
            protocol_version: "3.3".to_string(),
            target_on_c: 21.0,
            target_off_c: 5.0,
            poll_interval_s: 30,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_notifier_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_notifier_timeout_ms() -> u64 {
    10_000
}

/// What a flic button gesture maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlicAction {
    Toggle,
    ForceOn,
    ForceOff,
    None,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FlicConfig {
    pub click: FlicAction,
    pub double_click: FlicAction,
    pub hold: FlicAction,
}

impl Default for FlicConfig {
    fn default() -> Self {
        Self {
            click: FlicAction::Toggle,
            double_click: FlicAction::ForceOff,
            hold: FlicAction::ForceOn,
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file. A missing file is not an error: the
/// hub runs on defaults (useful in development), with a warning.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        warn!(path, "config file not found, running with defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
