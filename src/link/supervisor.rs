//! Cross-layer escalation.
//!
//! Polls each layer once per [`tick`](LinkSupervisor::tick), bottom-up, and
//! turns failure streaks into proportional recovery:
//!
//! | Condition                        | Action                               |
//! |----------------------------------|--------------------------------------|
//! | MQTT streak ≥ rebuild threshold  | disconnect MQTT, stop PPP            |
//! | PPP streak ≥ reset threshold     | stop PPP, hard-reset the modem       |
//!
//! The surrounding loop (cadence, watchdog, what to publish) stays with the
//! caller.

use log::{info, warn};

use crate::app::events::LinkEvent;
use crate::app::ports::{CommandHandler, EventSink, ModemPort, MqttLink, Progress};
use crate::config::{LinkConfig, PppTiming};
use crate::link::mqtt::MqttManager;
use crate::link::ppp::PppManager;

/// Snapshot returned by every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStatus {
    pub modem_ready: bool,
    pub ppp_up: bool,
    pub mqtt_connected: bool,
    pub rssi_dbm: Option<i16>,
}

pub struct LinkSupervisor {
    ppp: PppManager,
    mqtt: MqttManager,
    ppp_timeout_ms: u32,
}

impl LinkSupervisor {
    pub fn new(config: &LinkConfig, ppp_timing: PppTiming, id_seed: u32) -> Self {
        Self {
            ppp: PppManager::new(config, ppp_timing),
            mqtt: MqttManager::new(config, id_seed),
            ppp_timeout_ms: config.ppp_timeout_ms,
        }
    }

    pub fn ppp(&self) -> &PppManager {
        &self.ppp
    }

    pub fn mqtt(&self) -> &MqttManager {
        &self.mqtt
    }

    /// Drive every layer one step and apply the escalation policy.
    pub fn tick<M, L, H, E>(
        &mut self,
        modem: &mut M,
        link: &mut L,
        handler: &mut H,
        sink: &mut E,
    ) -> LinkStatus
    where
        M: ModemPort,
        L: MqttLink<M>,
        H: CommandHandler + ?Sized,
        E: EventSink + ?Sized,
    {
        // ── Modem ──────────────────────────────────────────────
        if !modem.is_ready() {
            if modem.init() == Progress::Failed {
                sink.emit(&LinkEvent::ModemInitFailed.into());
            }
            // The step that enters `Complete` still reports `Pending`.
            if modem.is_ready() {
                let rssi_dbm = modem.info().rssi_dbm;
                sink.emit(&LinkEvent::ModemReady { rssi_dbm }.into());
            } else {
                if self.ppp.is_up() || self.ppp.is_starting() {
                    self.ppp.abandon();
                }
                self.mqtt.mark_disconnected();
                return self.status(modem);
            }
        }

        // ── PPP ────────────────────────────────────────────────
        if self.ppp.should_hard_reset() {
            let ppp_streak = self.ppp.fail_streak();
            warn!("Link: PPP failed {} times, hard-resetting modem", ppp_streak);
            sink.emit(&LinkEvent::ModemResetEscalated { ppp_streak }.into());
            self.ppp.stop(modem);
            modem.hard_reset();
            self.ppp.reset_fail_streak();
            self.mqtt.mark_disconnected();
            return self.status(modem);
        }

        if !self.ppp.is_up() {
            self.ppp.start(modem);
            let streak_before = self.ppp.fail_streak();
            if self.ppp.wait_for_up(modem, self.ppp_timeout_ms) {
                if let Some(ip) = self.ppp.ip() {
                    sink.emit(&LinkEvent::PppUp { ip }.into());
                }
            } else {
                if self.ppp.fail_streak() > streak_before {
                    if let Some(reason) = self.ppp.last_failure() {
                        let streak = self.ppp.fail_streak();
                        sink.emit(&LinkEvent::PppFailed { reason, streak }.into());
                    }
                }
                self.mqtt.mark_disconnected();
                return self.status(modem);
            }
        }

        // ── MQTT ───────────────────────────────────────────────
        if self.mqtt.should_rebuild_ppp() {
            let mqtt_streak = self.mqtt.fail_streak();
            warn!("Link: MQTT failed {} times, rebuilding PPP", mqtt_streak);
            sink.emit(&LinkEvent::PppRebuildEscalated { mqtt_streak }.into());
            let mqtt = &mut self.mqtt;
            link.with_transport(modem, |t| mqtt.disconnect(t));
            self.ppp.stop(modem);
            self.mqtt.reset_fail_streak();
            return self.status(modem);
        }

        let now = modem.now_ms();
        let was_connected = self.mqtt.is_connected();
        let streak_before = self.mqtt.fail_streak();
        let mqtt = &mut self.mqtt;
        let alive = link.with_transport(modem, |t| {
            mqtt.connect(&mut *t, now) && mqtt.poll(&mut *t, &mut *handler, now)
        });

        let streak = self.mqtt.fail_streak();
        if alive && !was_connected {
            info!("Link: fully connected");
            sink.emit(&LinkEvent::MqttConnected.into());
        } else if !alive && was_connected {
            sink.emit(&LinkEvent::MqttLost { streak }.into());
        } else if !alive && streak > streak_before {
            sink.emit(&LinkEvent::MqttFailed { streak }.into());
        }

        self.status(modem)
    }

    /// Publish through the current transport.  `false` when MQTT is down.
    pub fn publish<M, L>(
        &mut self,
        modem: &mut M,
        link: &mut L,
        topic: &str,
        payload: &[u8],
        retained: bool,
    ) -> bool
    where
        M: ModemPort,
        L: MqttLink<M>,
    {
        if !self.mqtt.is_connected() {
            return false;
        }
        let mqtt = &mut self.mqtt;
        link.with_transport(modem, |t| mqtt.publish(t, topic, payload, retained))
    }

    fn status<M: ModemPort>(&self, modem: &M) -> LinkStatus {
        LinkStatus {
            modem_ready: modem.is_ready(),
            ppp_up: self.ppp.is_up(),
            mqtt_connected: self.mqtt.is_connected(),
            rssi_dbm: self.ppp.signal_dbm().or(modem.info().rssi_dbm),
        }
    }
}

