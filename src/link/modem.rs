//! Modem bring-up state machine.
//!
//! ```text
//!  PowerOn ─▶ WaitPower ─▶ AtHandshake ─▶ DisableEcho ─▶ QuerySim ─▶ QueryNetwork ─▶ QueryRssi ─▶ Complete
//!     ▲                        │               │
//!     └──── window expired ────┘               │
//!     └──────────── ATE0 failed ───────────────┘
//! ```
//!
//! Transitions are computed by the pure [`transition`] function; the
//! [`ModemManager`] performs the I/O each state needs and feeds the outcome
//! back in as an [`Observation`].  Each [`init`](ModemManager::init) call
//! advances at most one transition and only `PowerOn` blocks (GPIO sequencing).

use log::{debug, info, warn};

use crate::app::ports::{
    AtPoll, AtPort, Clock, ModemLine, ModemLines, ModemPort, Progress, SerialPort,
    UrcLine,
};
use crate::config::{LinkConfig, ModemTiming};
use crate::link::at::{self, AtChannel, RegistrationStatus};

// ───────────────────────────────────────────────────────────────
// State
// ───────────────────────────────────────────────────────────────

/// Bring-up stage.  Entry timestamps travel with the states that need them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemState {
    PowerOn,
    WaitPower { entered_ms: u64 },
    AtHandshake { window_start_ms: u64 },
    DisableEcho,
    QuerySim,
    QueryNetwork,
    QueryRssi,
    Complete,
}

impl ModemState {
    /// The AT command issued in this state, if any.
    pub fn command(self) -> Option<&'static str> {
        match self {
            Self::AtHandshake { .. } => Some("AT"),
            Self::DisableEcho => Some("ATE0"),
            Self::QuerySim => Some("AT+CCID"),
            Self::QueryNetwork => Some("AT+CREG?"),
            Self::QueryRssi => Some("AT+CSQ"),
            _ => None,
        }
    }
}

/// What the manager saw while servicing the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The power-on GPIO sequence finished.
    PoweredOn { now_ms: u64 },
    /// Time passed without a command outcome.
    Elapsed { now_ms: u64 },
    /// The state's AT command completed.
    Command { ok: bool, now_ms: u64 },
}

impl Observation {
    fn now_ms(self) -> u64 {
        match self {
            Self::PoweredOn { now_ms } | Self::Elapsed { now_ms } | Self::Command { now_ms, .. } => {
                now_ms
            }
        }
    }
}

/// The two windows the transition function measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BringUpWindows {
    /// Settle time after the power-on sequence.
    pub boot_settle_ms: u64,
    /// Maximum time in `AtHandshake` before starting over.
    pub handshake_window_ms: u64,
}

/// Pure bring-up transition.
///
/// `Ready` is only ever returned from `Complete`; `Failed` only on the edge
/// back to `PowerOn`.
pub fn transition(
    state: ModemState,
    obs: Observation,
    windows: &BringUpWindows,
) -> (ModemState, Progress) {
    use ModemState::*;

    let now = obs.now_ms();
    match (state, obs) {
        (PowerOn, Observation::PoweredOn { now_ms }) => {
            (WaitPower { entered_ms: now_ms }, Progress::Pending)
        }
        (PowerOn, _) => (PowerOn, Progress::Pending),

        (WaitPower { entered_ms }, _) => {
            if now.saturating_sub(entered_ms) > windows.boot_settle_ms {
                (AtHandshake { window_start_ms: now }, Progress::Pending)
            } else {
                (state, Progress::Pending)
            }
        }

        (AtHandshake { .. }, Observation::Command { ok: true, .. }) => {
            (DisableEcho, Progress::Pending)
        }
        (AtHandshake { window_start_ms }, _) => {
            if now.saturating_sub(window_start_ms) > windows.handshake_window_ms {
                (PowerOn, Progress::Failed)
            } else {
                (state, Progress::Pending)
            }
        }

        (DisableEcho, Observation::Command { ok: true, .. }) => (QuerySim, Progress::Pending),
        (DisableEcho, Observation::Command { ok: false, .. }) => (PowerOn, Progress::Failed),

        // Informational queries advance regardless of outcome.
        (QuerySim, Observation::Command { .. }) => (QueryNetwork, Progress::Pending),
        (QueryNetwork, Observation::Command { .. }) => (QueryRssi, Progress::Pending),
        (QueryRssi, Observation::Command { .. }) => (Complete, Progress::Pending),

        (Complete, _) => (Complete, Progress::Ready),

        (DisableEcho | QuerySim | QueryNetwork | QueryRssi, _) => (state, Progress::Pending),
    }
}

// ───────────────────────────────────────────────────────────────
// Modem information gathered during bring-up
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModemInfo {
    pub iccid: Option<heapless::String<24>>,
    pub registration: Option<RegistrationStatus>,
    pub rssi_dbm: Option<i16>,
}

// ───────────────────────────────────────────────────────────────
// ModemManager
// ───────────────────────────────────────────────────────────────

/// Owns the modem UART (through an [`AtChannel`]) and its control lines.
pub struct ModemManager<S, L, C> {
    at: AtChannel<S, C>,
    lines: L,
    state: ModemState,
    timing: ModemTiming,
    windows: BringUpWindows,
    cmd_timeout_ms: u32,
    info: ModemInfo,
}

impl<S: SerialPort, L: ModemLines, C: Clock> ModemManager<S, L, C> {
    pub fn new(serial: S, lines: L, clock: C, config: &LinkConfig, timing: ModemTiming) -> Self {
        Self {
            at: AtChannel::new(serial, clock),
            lines,
            state: ModemState::PowerOn,
            timing,
            windows: BringUpWindows {
                boot_settle_ms: timing.boot_settle_ms,
                handshake_window_ms: u64::from(config.at_init_timeout_ms),
            },
            cmd_timeout_ms: config.at_cmd_timeout_ms,
            info: ModemInfo::default(),
        }
    }

    pub fn state(&self) -> ModemState {
        self.state
    }

    /// Borrow the control lines (diagnostics and tests).
    pub fn lines(&self) -> &L {
        &self.lines
    }

    fn step(&mut self) -> Progress {
        let prev = self.state;
        let obs = match prev {
            ModemState::PowerOn => {
                self.power_on_sequence();
                Observation::PoweredOn {
                    now_ms: self.at.now_ms(),
                }
            }
            ModemState::WaitPower { .. } | ModemState::Complete => Observation::Elapsed {
                now_ms: self.at.now_ms(),
            },
            _ => self.poll_command(prev),
        };

        let (next, progress) = transition(prev, obs, &self.windows);
        if next != prev {
            self.on_enter(prev, next);
        }
        self.state = next;
        progress
    }

    fn poll_command(&mut self, state: ModemState) -> Observation {
        let Some(cmd) = state.command() else {
            return Observation::Elapsed {
                now_ms: self.at.now_ms(),
            };
        };
        let poll = self.at.exchange(cmd, "OK", self.cmd_timeout_ms);
        let now_ms = self.at.now_ms();
        match poll {
            AtPoll::Pending => Observation::Elapsed { now_ms },
            AtPoll::Matched(resp) => {
                self.record_query(state, &resp);
                Observation::Command { ok: true, now_ms }
            }
            AtPoll::Error(_) | AtPoll::TimedOut(_) => {
                match state {
                    ModemState::QuerySim => warn!("Modem: SIM query failed (non-critical)"),
                    ModemState::QueryNetwork => warn!("Modem: network query failed (non-critical)"),
                    ModemState::QueryRssi => warn!("Modem: RSSI query failed (non-critical)"),
                    _ => debug!("Modem: '{}' failed", cmd),
                }
                Observation::Command { ok: false, now_ms }
            }
        }
    }

    fn record_query(&mut self, state: ModemState, resp: &str) {
        match state {
            ModemState::QuerySim => {
                self.info.iccid = at::parse_ccid(resp);
                info!("Modem: SIM ICCID={:?}", self.info.iccid.as_deref());
            }
            ModemState::QueryNetwork => {
                self.info.registration = at::parse_registration(resp);
                info!("Modem: registration={:?}", self.info.registration);
            }
            ModemState::QueryRssi => {
                self.info.rssi_dbm = at::parse_csq(resp);
                info!("Modem: RSSI={:?} dBm", self.info.rssi_dbm);
            }
            _ => {}
        }
    }

    fn on_enter(&mut self, from: ModemState, to: ModemState) {
        match to {
            ModemState::PowerOn => {
                self.at.cancel();
                match from {
                    ModemState::AtHandshake { .. } => warn!("Modem: AT handshake timeout"),
                    ModemState::DisableEcho => warn!("Modem: failed to disable echo"),
                    _ => {}
                }
            }
            ModemState::WaitPower { .. } => {
                info!("Modem: hardware initialised, waiting for boot");
            }
            ModemState::AtHandshake { .. } => {
                info!("Modem: starting AT handshake");
                self.at.flush_input();
            }
            ModemState::DisableEcho => info!("Modem: AT handshake OK"),
            ModemState::QuerySim => info!("Modem: echo disabled"),
            ModemState::Complete => info!("Modem: initialisation complete"),
            _ => {}
        }
    }

    // ── GPIO sequencing (blocking) ────────────────────────────────

    fn power_on_sequence(&mut self) {
        let t = self.timing;
        info!("Modem: powering on (UART {} baud)", t.uart_baud);
        self.at.cancel();
        self.at.configure(t.uart_baud);

        self.lines.set_level(ModemLine::PowerEnable, true);
        self.at.delay_ms(t.gpio_guard_ms);

        self.reset_pulse();

        self.lines.set_level(ModemLine::Dtr, false);
        self.at.delay_ms(t.gpio_guard_ms);

        self.pwrkey_pulse();
    }

    fn reset_pulse(&mut self) {
        let t = self.timing;
        self.lines.set_level(ModemLine::Reset, false);
        self.at.delay_ms(t.gpio_guard_ms);
        self.lines.set_level(ModemLine::Reset, true);
        self.at.delay_ms(t.reset_pulse_ms);
        self.lines.set_level(ModemLine::Reset, false);
        self.at.delay_ms(t.gpio_guard_ms);
    }

    fn pwrkey_pulse(&mut self) {
        let t = self.timing;
        self.lines.set_level(ModemLine::PowerKey, false);
        self.at.delay_ms(t.gpio_guard_ms);
        self.lines.set_level(ModemLine::PowerKey, true);
        self.at.delay_ms(t.pwrkey_pulse_ms);
        self.lines.set_level(ModemLine::PowerKey, false);
        self.at.delay_ms(t.gpio_guard_ms);
    }
}

impl<S: SerialPort, L: ModemLines, C: Clock> AtPort for ModemManager<S, L, C> {
    fn now_ms(&self) -> u64 {
        self.at.now_ms()
    }

    fn exchange(&mut self, cmd: &str, expect: &str, timeout_ms: u32) -> AtPoll {
        self.at.exchange(cmd, expect, timeout_ms)
    }

    fn exchange_data(&mut self, data: &[u8], expect: &str, timeout_ms: u32) -> AtPoll {
        self.at.exchange_data(data, expect, timeout_ms)
    }

    fn take_urc(&mut self) -> Option<UrcLine> {
        self.at.take_urc()
    }
}

impl<S: SerialPort, L: ModemLines, C: Clock> ModemPort for ModemManager<S, L, C> {
    fn init(&mut self) -> Progress {
        self.step()
    }

    fn is_ready(&self) -> bool {
        self.state == ModemState::Complete
    }

    fn hard_reset(&mut self) {
        warn!("Modem: hard reset");
        self.at.cancel();
        self.reset_pulse();
        self.at.delay_ms(self.timing.reset_settle_ms);
        self.state = ModemState::PowerOn;
        self.info = ModemInfo::default();
        self.at.flush_input();
    }

    fn power_cycle(&mut self) {
        warn!("Modem: power cycling");
        self.at.cancel();
        self.lines.set_level(ModemLine::PowerEnable, false);
        self.lines.set_level(ModemLine::PowerKey, false);
        self.at.delay_ms(self.timing.power_drain_ms);
        self.lines.set_level(ModemLine::PowerEnable, true);
        self.pwrkey_pulse();
        self.state = ModemState::PowerOn;
        self.info = ModemInfo::default();
    }

    fn info(&self) -> &ModemInfo {
        &self.info
    }
}
