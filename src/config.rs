//! System configuration parameters
//!
//! All tunable parameters for the gate controller's link stack.
//! Values can be overridden via NVS (non-volatile storage); see
//! [`ConfigPort`](crate::app::ports::ConfigPort).

use serde::{Deserialize, Serialize};

use crate::app::ports::ConfigError;
use crate::text;

/// Longest broker host name; with the credential limits below the whole
/// `AT+CMQTTCONNECT` line fits the AT command buffer.
pub const MAX_HOST_LEN: usize = 64;
pub const MAX_CREDENTIAL_LEN: usize = 32;
/// Matches the modem client's inbound topic buffer.
pub const MAX_TOPIC_LEN: usize = 128;

/// Core link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    // --- Identity ---
    /// Device identifier used in client ids and status messages
    pub device_id: String,
    /// Firmware version reported in status heartbeats
    pub fw_version: String,

    // --- MQTT broker ---
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
    /// Keep-alive interval negotiated with the broker (seconds)
    pub mqtt_keep_alive_secs: u16,

    // --- MQTT topics ---
    pub cmd_topic: String,
    pub ack_topic: String,
    pub status_topic: String,
    pub diagnostics_topic: String,

    // --- Cellular ---
    /// Carrier access point name
    pub apn: String,

    // --- Recovery thresholds ---
    /// Consecutive MQTT failures before the PPP session is rebuilt
    pub mqtt_fails_before_ppp_rebuild: u8,
    /// Consecutive PPP failures before the modem is hard-reset
    pub ppp_fails_before_modem_reset: u8,

    // --- Backoff (MQTT reconnect) ---
    pub backoff_base_ms: u32,
    pub backoff_max_ms: u32,

    // --- Timeouts ---
    /// Per-command AT response timeout
    pub at_cmd_timeout_ms: u32,
    /// Handshake window before the modem is re-sequenced from power-on
    pub at_init_timeout_ms: u32,
    /// Bound on one whole PPP bring-up attempt
    pub ppp_timeout_ms: u32,

    // --- Gate ---
    /// Minimum spacing between two gate openings
    pub gate_cooldown_ms: u32,
    /// Relay pulse width
    pub relay_pulse_ms: u32,

    // --- Timing ---
    /// Status heartbeat interval
    pub status_interval_ms: u32,
    /// Main loop tick period
    pub tick_interval_ms: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_id: "mitspe6-gate-001".into(),
            fw_version: concat!("fw-", env!("CARGO_PKG_VERSION")).into(),

            mqtt_host: "localhost".into(),
            mqtt_port: 1883,
            mqtt_username: "pgr_device_mitspe6".into(),
            mqtt_password: String::new(),
            mqtt_keep_alive_secs: 60,

            cmd_topic: "pgr/mitspe6/gate/cmd".into(),
            ack_topic: "pgr/mitspe6/gate/ack".into(),
            status_topic: "pgr/mitspe6/gate/status".into(),
            diagnostics_topic: "pgr/mitspe6/gate/diagnostics".into(),

            apn: "internetg".into(),

            mqtt_fails_before_ppp_rebuild: 3,
            ppp_fails_before_modem_reset: 2,

            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,

            at_cmd_timeout_ms: 5_000,
            at_init_timeout_ms: 30_000,
            ppp_timeout_ms: 60_000,

            gate_cooldown_ms: 5_000,
            relay_pulse_ms: 500,

            status_interval_ms: 5_000,
            tick_interval_ms: 50, // 20 Hz
        }
    }
}

impl LinkConfig {
    /// Range-check every field.  Called before persisting and after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !quotable(&self.device_id, 1, 32) {
            return Err(ConfigError::ValidationFailed(
                "device_id must be 1-32 printable bytes without quotes",
            ));
        }
        if !quotable(&self.mqtt_host, 1, MAX_HOST_LEN) {
            return Err(ConfigError::ValidationFailed(
                "mqtt_host must be 1-64 printable bytes without quotes",
            ));
        }
        if self.mqtt_port == 0 {
            return Err(ConfigError::ValidationFailed("mqtt_port must be non-zero"));
        }
        if !quotable(&self.mqtt_username, 0, MAX_CREDENTIAL_LEN)
            || !quotable(&self.mqtt_password, 0, MAX_CREDENTIAL_LEN)
        {
            return Err(ConfigError::ValidationFailed(
                "mqtt credentials must be 0-32 printable bytes without quotes",
            ));
        }
        let topics = [
            &self.cmd_topic,
            &self.ack_topic,
            &self.status_topic,
            &self.diagnostics_topic,
        ];
        if !topics.iter().all(|t| quotable(t, 1, MAX_TOPIC_LEN)) {
            return Err(ConfigError::ValidationFailed(
                "topics must be 1-128 printable bytes without quotes",
            ));
        }
        if !quotable(&self.apn, 1, 63) {
            return Err(ConfigError::ValidationFailed(
                "apn must be 1-63 printable bytes without quotes",
            ));
        }
        if self.mqtt_fails_before_ppp_rebuild == 0 || self.ppp_fails_before_modem_reset == 0 {
            return Err(ConfigError::ValidationFailed("escalation thresholds must be >= 1"));
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::ValidationFailed(
                "backoff_base_ms must be 1..=backoff_max_ms",
            ));
        }
        if self.at_cmd_timeout_ms == 0 || self.at_cmd_timeout_ms > self.at_init_timeout_ms {
            return Err(ConfigError::ValidationFailed(
                "at_cmd_timeout_ms must be 1..=at_init_timeout_ms",
            ));
        }
        if self.ppp_timeout_ms < self.at_cmd_timeout_ms {
            return Err(ConfigError::ValidationFailed(
                "ppp_timeout_ms must be >= at_cmd_timeout_ms",
            ));
        }
        if !(50..=5_000).contains(&self.relay_pulse_ms) {
            return Err(ConfigError::ValidationFailed("relay_pulse_ms must be 50-5000"));
        }
        if self.tick_interval_ms == 0 || self.tick_interval_ms > 1_000 {
            return Err(ConfigError::ValidationFailed("tick_interval_ms must be 1-1000"));
        }
        Ok(())
    }
}

/// Fits between the quotes of an AT command argument, `min..=max` bytes long.
fn quotable(value: &str, min: usize, max: usize) -> bool {
    (min..=max).contains(&value.len()) && text::is_at_quotable(value)
}

/// Fixed modem hardware timings (A7670 datasheet values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModemTiming {
    pub uart_baud: u32,
    /// Settle time between the power-on sequence and the first `AT`
    pub boot_settle_ms: u64,
    /// Reset line assertion time
    pub reset_pulse_ms: u32,
    /// Quiet time on either side of a GPIO edge
    pub gpio_guard_ms: u32,
    /// PWRKEY high pulse width
    pub pwrkey_pulse_ms: u32,
    /// Off time during a power cycle
    pub power_drain_ms: u32,
    /// Wait after releasing reset in `hard_reset`
    pub reset_settle_ms: u32,
}

impl Default for ModemTiming {
    fn default() -> Self {
        Self {
            uart_baud: 115_200,
            boot_settle_ms: 5_000,
            reset_pulse_ms: 2_600,
            gpio_guard_ms: 100,
            pwrkey_pulse_ms: 100,
            power_drain_ms: 2_000,
            reset_settle_ms: 2_000,
        }
    }
}

/// PPP bring-up pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PppTiming {
    pub registration_poll_ms: u64,
    pub apn_retry_ms: u64,
    pub activate_attempts: u8,
    pub activate_backoff_base_ms: u32,
    pub activate_backoff_max_ms: u32,
    pub activation_settle_ms: u64,
    pub ip_attempts: u8,
    pub ip_poll_ms: u64,
}

impl Default for PppTiming {
    fn default() -> Self {
        Self {
            registration_poll_ms: 1_000,
            apn_retry_ms: 2_000,
            activate_attempts: 3,
            activate_backoff_base_ms: 1_000,
            activate_backoff_max_ms: 4_000,
            activation_settle_ms: 2_000,
            ip_attempts: 5,
            ip_poll_ms: 1_000,
        }
    }
}
