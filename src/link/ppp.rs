//! Packet-data session lifecycle.
//!
//! ```text
//!  Init ─▶ WaitRegistration ─▶ SetApn ─▶ ActivateNetwork ─▶ GetIp ─▶ Connected
//!              │ denied                      │ exhausted        │ no address
//!              └──────────────┬──────────────┴──────────────────┘
//!                             ▼
//!                   terminal failure (stop, streak + 1, back to Init)
//! ```
//!
//! Driven one step per [`wait_for_up`](PppManager::wait_for_up) call over a
//! borrowed [`AtPort`].  Every wait is a deadline held in the state, so no
//! call blocks longer than one non-blocking AT poll.

use core::fmt::Write as _;
use core::net::Ipv4Addr;

use log::{debug, info, warn};

use crate::app::ports::{AtPoll, AtPort};
use crate::backoff::Backoff;
use crate::config::{LinkConfig, PppTiming};
use crate::error::PppError;
use crate::link::at::{self, RegistrationStatus};

const CMD_REGISTRATION: &str = "AT+CEREG?";
const CMD_SIGNAL: &str = "AT+CSQ";
const CMD_ACTIVATE: &str = "AT+CGACT=1,1";
const CMD_DEACTIVATE: &str = "AT+CGACT=0,1";
const CMD_ADDRESS: &str = "AT+CGPADDR=1";

/// Which half of a registration poll is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationPhase {
    Status,
    Signal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PppState {
    Init,
    WaitRegistration {
        next_poll_ms: u64,
        phase: RegistrationPhase,
    },
    SetApn {
        retry_at_ms: u64,
    },
    ActivateNetwork {
        attempt: u8,
        retry_at_ms: u64,
    },
    GetIp {
        attempt: u8,
        next_poll_ms: u64,
    },
    Connected,
}

pub struct PppManager {
    state: PppState,
    up: bool,
    starting: bool,
    start_ms: u64,
    fail_streak: u8,
    reset_threshold: u8,
    cmd_timeout_ms: u32,
    timing: PppTiming,
    activate_backoff: Backoff,
    apn_cmd: heapless::String<96>,
    registration: Option<RegistrationStatus>,
    signal_dbm: Option<i16>,
    ip: Option<Ipv4Addr>,
    last_failure: Option<PppError>,
}

impl PppManager {
    pub fn new(config: &LinkConfig, timing: PppTiming) -> Self {
        let mut apn_cmd = heapless::String::new();
        // APN length is bounded by LinkConfig::validate.
        let _ = write!(apn_cmd, "AT+CGDCONT=1,\"IP\",\"{}\"", config.apn);
        Self {
            state: PppState::Init,
            up: false,
            starting: false,
            start_ms: 0,
            fail_streak: 0,
            reset_threshold: config.ppp_fails_before_modem_reset,
            cmd_timeout_ms: config.at_cmd_timeout_ms,
            timing,
            activate_backoff: Backoff::new(
                timing.activate_backoff_base_ms,
                timing.activate_backoff_max_ms,
            ),
            apn_cmd,
            registration: None,
            signal_dbm: None,
            ip: None,
            last_failure: None,
        }
    }

    /// Begin an attempt.  Non-blocking; returns `true` once an attempt is
    /// running or the session is already up.
    pub fn start<A: AtPort + ?Sized>(&mut self, at: &mut A) -> bool {
        if self.starting || self.up {
            return true;
        }
        info!("PPP: starting session (APN command '{}')", self.apn_cmd);
        let now = at.now_ms();
        self.starting = true;
        self.start_ms = now;
        self.ip = None;
        self.registration = None;
        self.activate_backoff.reset();
        self.state = PppState::WaitRegistration {
            next_poll_ms: now,
            phase: RegistrationPhase::Status,
        };
        true
    }

    /// Advance the running attempt by one step.  `true` iff the session is up.
    ///
    /// An attempt older than `timeout_ms` is stopped and counted as a failure.
    pub fn wait_for_up<A: AtPort + ?Sized>(&mut self, at: &mut A, timeout_ms: u32) -> bool {
        if self.up {
            return true;
        }
        if !self.starting {
            return false;
        }

        let now = at.now_ms();
        if now.saturating_sub(self.start_ms) > u64::from(timeout_ms) {
            warn!("PPP: timeout waiting for session ({} ms)", timeout_ms);
            self.fail(at, PppError::Timeout);
            return false;
        }

        if let Err(reason) = self.step(at, now) {
            self.fail(at, reason);
        }
        self.up
    }

    /// Best-effort deactivation.  Returns to `Init` with both flags cleared.
    pub fn stop<A: AtPort + ?Sized>(&mut self, at: &mut A) {
        if !self.up && !self.starting {
            return;
        }
        info!("PPP: stopping session");
        // Fire and forget: the modem acts on the line even if nobody reads the reply.
        let _ = at.exchange(CMD_DEACTIVATE, "OK", self.cmd_timeout_ms);
        self.state = PppState::Init;
        self.up = false;
        self.starting = false;
        self.ip = None;
    }

    /// Forget the session without touching the modem (it is being reset).
    pub fn abandon(&mut self) {
        self.state = PppState::Init;
        self.up = false;
        self.starting = false;
        self.ip = None;
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    pub fn is_starting(&self) -> bool {
        self.starting
    }

    pub fn state(&self) -> PppState {
        self.state
    }

    pub fn fail_streak(&self) -> u8 {
        self.fail_streak
    }

    pub fn should_hard_reset(&self) -> bool {
        self.fail_streak >= self.reset_threshold
    }

    pub fn reset_fail_streak(&mut self) {
        if self.fail_streak > 0 {
            info!("PPP: resetting failure streak (was {})", self.fail_streak);
        }
        self.fail_streak = 0;
    }

    pub fn last_failure(&self) -> Option<PppError> {
        self.last_failure
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.ip
    }

    pub fn signal_dbm(&self) -> Option<i16> {
        self.signal_dbm
    }

    pub fn registration(&self) -> Option<RegistrationStatus> {
        self.registration
    }

    // ───────────────────────────────────────────────────────────
    // State machine
    // ───────────────────────────────────────────────────────────

    fn step<A: AtPort + ?Sized>(&mut self, at: &mut A, now: u64) -> Result<(), PppError> {
        match self.state {
            PppState::Init => {
                self.state = PppState::WaitRegistration {
                    next_poll_ms: now,
                    phase: RegistrationPhase::Status,
                };
            }

            PppState::WaitRegistration { next_poll_ms, .. } if now < next_poll_ms => {}

            PppState::WaitRegistration {
                phase: RegistrationPhase::Status,
                next_poll_ms,
            } => {
                let poll = at.exchange(CMD_REGISTRATION, "OK", self.cmd_timeout_ms);
                if poll.is_pending() {
                    return Ok(());
                }
                if let AtPoll::Matched(resp) = &poll {
                    self.registration = at::parse_registration(resp);
                }
                self.state = PppState::WaitRegistration {
                    next_poll_ms,
                    phase: RegistrationPhase::Signal,
                };
            }

            PppState::WaitRegistration {
                phase: RegistrationPhase::Signal,
                ..
            } => {
                let poll = at.exchange(CMD_SIGNAL, "OK", self.cmd_timeout_ms);
                if poll.is_pending() {
                    return Ok(());
                }
                if let AtPoll::Matched(resp) = &poll {
                    self.signal_dbm = at::parse_csq(resp);
                }
                match self.registration {
                    Some(RegistrationStatus::Denied) => {
                        warn!("PPP: registration denied");
                        return Err(PppError::RegistrationDenied);
                    }
                    Some(reg) if reg.is_registered() => {
                        info!("PPP: registered ({:?}, {:?} dBm)", reg, self.signal_dbm);
                        self.state = PppState::SetApn { retry_at_ms: now };
                    }
                    other => {
                        debug!("PPP: waiting for registration ({:?})", other);
                        self.state = PppState::WaitRegistration {
                            next_poll_ms: now + self.timing.registration_poll_ms,
                            phase: RegistrationPhase::Status,
                        };
                    }
                }
            }

            PppState::SetApn { retry_at_ms } if now < retry_at_ms => {}

            PppState::SetApn { .. } => match at.exchange(&self.apn_cmd, "OK", self.cmd_timeout_ms) {
                AtPoll::Pending => {}
                AtPoll::Matched(_) => {
                    info!("PPP: PDP context configured");
                    self.activate_backoff.reset();
                    self.state = PppState::ActivateNetwork {
                        attempt: 1,
                        retry_at_ms: now,
                    };
                }
                AtPoll::Error(_) | AtPoll::TimedOut(_) => {
                    warn!("PPP: failed to configure PDP context, retrying");
                    self.state = PppState::SetApn {
                        retry_at_ms: now + self.timing.apn_retry_ms,
                    };
                }
            },

            PppState::ActivateNetwork { retry_at_ms, .. } if now < retry_at_ms => {}

            PppState::ActivateNetwork { attempt, .. } => {
                match at.exchange(CMD_ACTIVATE, "OK", self.cmd_timeout_ms) {
                    AtPoll::Pending => {}
                    AtPoll::Matched(_) => {
                        info!("PPP: PDP context activated");
                        self.state = PppState::GetIp {
                            attempt: 0,
                            next_poll_ms: now + self.timing.activation_settle_ms,
                        };
                    }
                    AtPoll::Error(_) | AtPoll::TimedOut(_) => {
                        if attempt >= self.timing.activate_attempts {
                            warn!("PPP: PDP activation failed {} times", attempt);
                            return Err(PppError::ActivationExhausted);
                        }
                        let delay = self.activate_backoff.next_delay();
                        self.activate_backoff.increment();
                        warn!(
                            "PPP: PDP activation attempt {} failed, retry in {} ms",
                            attempt, delay
                        );
                        self.state = PppState::ActivateNetwork {
                            attempt: attempt + 1,
                            retry_at_ms: now + u64::from(delay),
                        };
                    }
                }
            }

            PppState::GetIp { next_poll_ms, .. } if now < next_poll_ms => {}

            PppState::GetIp { attempt, .. } => {
                let poll = at.exchange(CMD_ADDRESS, "OK", self.cmd_timeout_ms);
                if poll.is_pending() {
                    return Ok(());
                }
                let addr = match &poll {
                    AtPoll::Matched(resp) => at::parse_pdp_address(resp),
                    _ => None,
                };
                if let Some(ip) = addr {
                    self.on_up(ip);
                    return Ok(());
                }
                let polls = attempt + 1;
                if polls >= self.timing.ip_attempts {
                    warn!("PPP: no IP address after {} polls", polls);
                    return Err(PppError::NoIpAddress);
                }
                self.state = PppState::GetIp {
                    attempt: polls,
                    next_poll_ms: now + self.timing.ip_poll_ms,
                };
            }

            PppState::Connected => {}
        }
        Ok(())
    }

    fn on_up(&mut self, ip: Ipv4Addr) {
        self.ip = Some(ip);
        self.up = true;
        self.starting = false;
        self.last_failure = None;
        self.state = PppState::Connected;
        self.reset_fail_streak();
        info!("PPP: session UP, IP={}", ip);
    }

    fn fail<A: AtPort + ?Sized>(&mut self, at: &mut A, reason: PppError) {
        self.stop(at);
        self.last_failure = Some(reason);
        self.fail_streak = self.fail_streak.saturating_add(1);
        warn!("PPP: attempt failed ({}), failure streak {}", reason, self.fail_streak);
        if self.should_hard_reset() {
            warn!("PPP: failure threshold reached, modem hard reset due");
        }
    }
}
