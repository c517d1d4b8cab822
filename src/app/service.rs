//! Gate service — the application core above the link.
//!
//! [`GateService`] receives commands through the [`CommandHandler`] port,
//! applies dedupe and cooldown before pulsing the relay, and queues every
//! outbound message (acks, status heartbeats, diagnostics uploads) until the
//! caller can publish them.  It never touches the link directly, so the whole
//! service is testable with a mock relay and a closure standing in for MQTT.
//!
//! ```text
//!  CommandHandler ──▶ ┌─────────────────────────┐ ──▶ EventSink
//!                     │       GateService        │
//!      RelayPort ◀─── │ dedupe · cooldown · acks │ ──▶ outbox ──▶ publish
//!                     └─────────────────────────┘
//! ```

use core::fmt::Write as _;

use log::{debug, info, warn};

use crate::config::LinkConfig;
use crate::diagnostics::DiagnosticLog;
use crate::gate::GateControl;
use crate::link::supervisor::LinkStatus;
use crate::protocol::{self, RequestId, error_code};

use super::commands::GateCommand;
use super::events::GateEvent;
use super::ports::{CommandHandler, EventSink, RelayPort, StoragePort};

/// Commands buffered between MQTT polls.
const INBOX_DEPTH: usize = 4;
/// Messages buffered while the link is down.
const OUTBOX_DEPTH: usize = 8;

/// Which topic an outbound message goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundKind {
    Ack,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub kind: OutboundKind,
    pub payload: Vec<u8>,
}

// ───────────────────────────────────────────────────────────────
// GateService
// ───────────────────────────────────────────────────────────────

pub struct GateService<R> {
    relay: R,
    gate: GateControl,
    device_id: String,
    fw_version: String,
    session_id: heapless::String<8>,
    ack_topic: String,
    status_topic: String,
    diagnostics_topic: String,
    status_interval_ms: u64,
    inbox: heapless::Deque<GateCommand, INBOX_DEPTH>,
    outbox: heapless::Deque<Outbound, OUTBOX_DEPTH>,
    last_status_ms: Option<u64>,
    was_connected: bool,
    diagnostics_due: bool,
}

impl<R: RelayPort> GateService<R> {
    /// `session_seed` distinguishes uploads from different boots.
    pub fn new(relay: R, config: &LinkConfig, session_seed: u32) -> Self {
        let mut session_id = heapless::String::new();
        let _ = write!(session_id, "{:08x}", session_seed);
        Self {
            relay,
            gate: GateControl::new(config.gate_cooldown_ms),
            device_id: config.device_id.clone(),
            fw_version: config.fw_version.clone(),
            session_id,
            ack_topic: config.ack_topic.clone(),
            status_topic: config.status_topic.clone(),
            diagnostics_topic: config.diagnostics_topic.clone(),
            status_interval_ms: u64::from(config.status_interval_ms),
            inbox: heapless::Deque::new(),
            outbox: heapless::Deque::new(),
            last_status_ms: None,
            was_connected: false,
            diagnostics_due: false,
        }
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    pub fn gate(&self) -> &GateControl {
        &self.gate
    }

    pub fn pending_commands(&self) -> usize {
        self.inbox.len()
    }

    pub fn outbox(&self) -> impl Iterator<Item = &Outbound> {
        self.outbox.iter()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // ── Command execution ────────────────────────────────────

    /// Execute every queued command.
    pub fn process(&mut self, now_ms: u64, sink: &mut impl EventSink) {
        while let Some(cmd) = self.inbox.pop_front() {
            match cmd {
                GateCommand::Invalid(e) => {
                    warn!("Gate: dropping undecodable command — {}", e);
                    sink.emit(&GateEvent::Malformed(e).into());
                }
                GateCommand::Unsupported {
                    request_id,
                    command,
                } => {
                    warn!("Gate: unknown command '{}' ({})", command, request_id);
                    self.reject(request_id, error_code::UNKNOWN_COMMAND, sink);
                }
                GateCommand::Open { request_id, .. } => self.open(request_id, now_ms, sink),
            }
        }
    }

    fn open(&mut self, request_id: RequestId, now_ms: u64, sink: &mut impl EventSink) {
        if self.gate.was_processed(&request_id) {
            info!("Gate: {} already handled, re-acking", request_id);
            self.queue_ack(&request_id, true, None);
            sink.emit(&GateEvent::Duplicate { request_id }.into());
            return;
        }

        let (allowed, remaining_ms) = self.gate.can_execute_now(now_ms);
        if !allowed {
            info!("Gate: cooldown, {} ms remaining ({})", remaining_ms, request_id);
            self.reject(request_id, error_code::COOLDOWN, sink);
            return;
        }

        self.relay.activate_pulse();
        self.gate.record_open(now_ms);
        self.gate.mark_processed(&request_id);
        self.queue_ack(&request_id, true, None);
        sink.emit(&GateEvent::Opened { request_id }.into());
    }

    fn reject(&mut self, request_id: RequestId, code: &'static str, sink: &mut impl EventSink) {
        self.queue_ack(&request_id, false, Some(code));
        sink.emit(&GateEvent::Rejected { request_id, code }.into());
    }

    // ── Outbound traffic ─────────────────────────────────────

    /// Follow the link: schedule a diagnostics upload on every reconnect and a
    /// status heartbeat every `status_interval_ms` while connected.
    pub fn on_link<S: StoragePort>(
        &mut self,
        status: &LinkStatus,
        now_ms: u64,
        diag: &DiagnosticLog<S>,
    ) {
        let connected = status.mqtt_connected;
        if connected && !self.was_connected {
            self.diagnostics_due = diag.has_entries();
            self.last_status_ms = None;
        }
        self.was_connected = connected;
        if !connected {
            return;
        }

        let due = self
            .last_status_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.status_interval_ms);
        if due {
            match protocol::create_status(
                &self.device_id,
                true,
                now_ms,
                status.rssi_dbm,
                Some(&self.fw_version),
            ) {
                Ok(payload) => {
                    // A heartbeat is never worth evicting an ack for.
                    if self.outbox.is_full() {
                        debug!("Gate: outbox full, skipping status");
                    } else {
                        let _ = self.outbox.push_back(Outbound {
                            kind: OutboundKind::Status,
                            payload,
                        });
                    }
                    self.last_status_ms = Some(now_ms);
                }
                Err(e) => warn!("Gate: status encode failed — {}", e),
            }
        }
    }

    /// Publish queued traffic, oldest first, until `publish(topic, payload,
    /// retained)` refuses.  Status heartbeats are retained.
    ///
    /// The diagnostics upload goes first after a reconnect; the uploaded
    /// entries are removed from `diag` only once the publish succeeds.
    /// Returns the number of messages published.
    pub fn flush<S, P>(&mut self, diag: &mut DiagnosticLog<S>, mut publish: P) -> usize
    where
        S: StoragePort,
        P: FnMut(&str, &[u8], bool) -> bool,
    {
        let mut sent = 0;

        if self.diagnostics_due {
            let entries = diag.snapshot();
            if entries.is_empty() {
                self.diagnostics_due = false;
            } else {
                match protocol::create_diagnostics(
                    &self.device_id,
                    &self.fw_version,
                    Some(&self.session_id),
                    &entries,
                ) {
                    Ok(payload) => {
                        if !publish(&self.diagnostics_topic, &payload, false) {
                            return sent;
                        }
                        info!("Gate: uploaded {} diagnostic entries", entries.len());
                        diag.remove_first(entries.len());
                        self.diagnostics_due = false;
                        sent += 1;
                    }
                    Err(e) => {
                        warn!("Gate: diagnostics encode failed — {}", e);
                        self.diagnostics_due = false;
                    }
                }
            }
        }

        while let Some(msg) = self.outbox.front() {
            let (topic, retained) = match msg.kind {
                OutboundKind::Ack => (&self.ack_topic, false),
                OutboundKind::Status => (&self.status_topic, true),
            };
            if !publish(topic, &msg.payload, retained) {
                break;
            }
            self.outbox.pop_front();
            sent += 1;
        }
        sent
    }

    fn queue_ack(&mut self, request_id: &str, ok: bool, code: Option<&str>) {
        let payload = match protocol::create_ack(request_id, ok, code) {
            Ok(p) => p,
            Err(e) => {
                warn!("Gate: ack encode failed — {}", e);
                return;
            }
        };
        if self.outbox.is_full() {
            warn!("Gate: outbox full, dropping oldest message");
            self.outbox.pop_front();
        }
        let _ = self.outbox.push_back(Outbound {
            kind: OutboundKind::Ack,
            payload,
        });
    }
}

impl<R: RelayPort> CommandHandler for GateService<R> {
    fn on_command(&mut self, _topic: &str, payload: &[u8]) {
        let cmd = GateCommand::from(protocol::parse_command(payload));
        if self.inbox.is_full() {
            match cmd.request_id() {
                Some(id) => {
                    warn!("Gate: busy, refusing {}", id);
                    let id: RequestId = crate::text::truncate(id);
                    self.queue_ack(&id, false, Some(error_code::BUSY));
                }
                None => warn!("Gate: busy, dropping undecodable command"),
            }
            return;
        }
        let _ = self.inbox.push_back(cmd);
    }
}
