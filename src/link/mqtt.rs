//! MQTT session maintenance.
//!
//! One reconnection policy for every [`MqttTransport`]: a healthy session is
//! left alone, reconnects are throttled by an exponential [`Backoff`], and
//! consecutive failures (refused connects, rejected subscriptions, dropped
//! sessions) build a streak that eventually asks the supervisor to rebuild
//! the PPP session underneath.
//!
//! Backoff bookkeeping: the first failure of a streak schedules the retry at
//! the base delay; each further consecutive failure doubles it.
//!
//! An attempt may span several calls: while the transport answers
//! [`TransportError::WouldBlock`] the session stays in
//! [`SessionPhase::Connecting`] or [`SessionPhase::Subscribing`] and the next
//! call picks it up where it left off.

use core::fmt::Write as _;

use log::{debug, info, warn};

use crate::app::ports::{CommandHandler, ConnectOptions, MqttTransport, QoS, TransportError};
use crate::backoff::Backoff;
use crate::config::LinkConfig;

/// Broker and identity settings copied out of [`LinkConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub device_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub keep_alive_secs: u16,
    pub cmd_topic: String,
}

impl From<&LinkConfig> for MqttSettings {
    fn from(c: &LinkConfig) -> Self {
        Self {
            device_id: c.device_id.clone(),
            host: c.mqtt_host.clone(),
            port: c.mqtt_port,
            username: c.mqtt_username.clone(),
            password: c.mqtt_password.clone(),
            keep_alive_secs: c.mqtt_keep_alive_secs,
            cmd_topic: c.cmd_topic.clone(),
        }
    }
}

pub type ClientId = heapless::String<64>;

/// Where the broker session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Down,
    /// Connect dialogue in flight.
    Connecting,
    /// Connected; command topic subscription in flight.
    Subscribing,
    Up,
}

pub struct MqttManager {
    settings: MqttSettings,
    backoff: Backoff,
    phase: SessionPhase,
    client_id: ClientId,
    fail_streak: u8,
    rebuild_threshold: u8,
    last_attempt_ms: Option<u64>,
    attempts: u32,
    id_seed: u32,
}

impl MqttManager {
    /// `id_seed` salts client ids so two boots do not reuse the same id.
    pub fn new(config: &LinkConfig, id_seed: u32) -> Self {
        Self {
            settings: MqttSettings::from(config),
            backoff: Backoff::new(config.backoff_base_ms, config.backoff_max_ms),
            phase: SessionPhase::Down,
            client_id: ClientId::new(),
            fail_streak: 0,
            rebuild_threshold: config.mqtt_fails_before_ppp_rebuild,
            last_attempt_ms: None,
            attempts: 0,
            id_seed,
        }
    }

    /// Ensure a session exists.
    ///
    /// Returns `true` without I/O when the session is healthy and `false`
    /// without I/O while the backoff delay since the last attempt has not
    /// elapsed.  Otherwise starts (or continues) exactly one connect +
    /// subscribe attempt; `false` while it is still running.
    pub fn connect<T: MqttTransport + ?Sized>(&mut self, transport: &mut T, now_ms: u64) -> bool {
        if self.phase == SessionPhase::Up {
            if transport.is_connected() {
                return true;
            }
            warn!("MQTT: session dropped");
            self.record_failure(now_ms);
        }

        if self.phase == SessionPhase::Down {
            if let Some(last) = self.last_attempt_ms {
                if now_ms.saturating_sub(last) < u64::from(self.backoff.next_delay()) {
                    return false;
                }
            }
            self.attempts = self.attempts.wrapping_add(1);
            self.client_id = self.next_client_id();
            info!(
                "MQTT: connecting to {}:{} as {}",
                self.settings.host, self.settings.port, self.client_id
            );
            self.phase = SessionPhase::Connecting;
        }

        if self.phase == SessionPhase::Connecting {
            let opts = ConnectOptions {
                client_id: &self.client_id,
                host: &self.settings.host,
                port: self.settings.port,
                username: &self.settings.username,
                password: &self.settings.password,
                keep_alive_secs: self.settings.keep_alive_secs,
            };
            match transport.connect(&opts) {
                Ok(()) => self.phase = SessionPhase::Subscribing,
                Err(TransportError::WouldBlock) => return false,
                Err(e) => {
                    warn!("MQTT: connection failed — {}", e);
                    self.record_failure(now_ms);
                    return false;
                }
            }
        }

        match transport.subscribe(&self.settings.cmd_topic, QoS::AtLeastOnce) {
            Ok(()) => {}
            Err(TransportError::WouldBlock) => return false,
            Err(e) => {
                warn!(
                    "MQTT: failed to subscribe to {} — {}",
                    self.settings.cmd_topic, e
                );
                transport.disconnect();
                self.record_failure(now_ms);
                return false;
            }
        }

        info!("MQTT: connected, subscribed to {}", self.settings.cmd_topic);
        self.phase = SessionPhase::Up;
        self.last_attempt_ms = Some(now_ms);
        self.reset_fail_streak();
        self.backoff.reset();
        true
    }

    /// Pump inbound traffic.  Messages on the command topic go to `handler`.
    ///
    /// Returns `false` if the session was found dead, in which case the loss
    /// is recorded exactly like a failed connect.
    pub fn poll<T, H>(&mut self, transport: &mut T, handler: &mut H, now_ms: u64) -> bool
    where
        T: MqttTransport + ?Sized,
        H: CommandHandler + ?Sized,
    {
        if self.phase != SessionPhase::Up {
            return false;
        }
        let cmd_topic = self.settings.cmd_topic.as_str();
        transport.poll(&mut |topic, payload| {
            if topic == cmd_topic {
                debug!("MQTT: command received ({} bytes)", payload.len());
                handler.on_command(topic, payload);
            } else {
                debug!("MQTT: ignoring message on {}", topic);
            }
        });
        if !transport.is_connected() {
            warn!("MQTT: connection lost");
            self.record_failure(now_ms);
            return false;
        }
        true
    }

    /// One publish.  `false` when not connected, when the transport refuses,
    /// or while the publish is still in flight (repeat the call to finish it).
    pub fn publish<T: MqttTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        topic: &str,
        payload: &[u8],
        retained: bool,
    ) -> bool {
        if self.phase != SessionPhase::Up {
            debug!("MQTT: cannot publish to {}: not connected", topic);
            return false;
        }
        match transport.publish(topic, payload, retained) {
            Ok(()) => true,
            Err(TransportError::WouldBlock) => false,
            Err(e) => {
                warn!("MQTT: publish to {} failed — {}", topic, e);
                false
            }
        }
    }

    pub fn disconnect<T: MqttTransport + ?Sized>(&mut self, transport: &mut T) {
        if self.phase != SessionPhase::Down {
            info!("MQTT: disconnecting");
            transport.disconnect();
            self.phase = SessionPhase::Down;
        }
    }

    /// Drop the session without I/O (the link underneath is gone).  An
    /// attempt in flight is abandoned; the next one uses a fresh client id.
    pub fn mark_disconnected(&mut self) {
        self.phase = SessionPhase::Down;
    }

    pub fn is_connected(&self) -> bool {
        self.phase == SessionPhase::Up
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn fail_streak(&self) -> u8 {
        self.fail_streak
    }

    pub fn should_rebuild_ppp(&self) -> bool {
        self.fail_streak >= self.rebuild_threshold
    }

    pub fn reset_fail_streak(&mut self) {
        if self.fail_streak > 0 {
            info!("MQTT: resetting failure streak (was {})", self.fail_streak);
        }
        self.fail_streak = 0;
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn last_attempt_ms(&self) -> Option<u64> {
        self.last_attempt_ms
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }

    fn record_failure(&mut self, now_ms: u64) {
        self.phase = SessionPhase::Down;
        if self.fail_streak > 0 {
            self.backoff.increment();
        }
        self.fail_streak = self.fail_streak.saturating_add(1);
        self.last_attempt_ms = Some(now_ms);
        warn!(
            "MQTT: failure streak {}, next retry in {} ms",
            self.fail_streak,
            self.backoff.next_delay()
        );
        if self.should_rebuild_ppp() {
            warn!("MQTT: failure threshold reached, PPP rebuild due");
        }
    }

    /// `gate_<device>_<hex>`, distinct for every attempt of this manager.
    fn next_client_id(&self) -> ClientId {
        let mut id = ClientId::new();
        let tag = mix(self.id_seed.wrapping_add(self.attempts));
        let _ = write!(id, "gate_{}_{:08x}", self.settings.device_id, tag);
        id
    }
}

/// Bijective 32-bit scramble (lowbias32).
fn mix(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}
