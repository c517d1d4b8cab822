//! Log-based event sinks.
//!
//! [`LogEventSink`] writes every [`AppEvent`] to the ESP-IDF logger (UART /
//! USB-CDC in production).  [`DiagnosticSink`] does the same and also
//! appends the event to the persistent diagnostic ring, so connectivity
//! trouble survives a reset and is uploaded after the next reconnect.

use log::{error, info, warn};

use crate::app::events::{AppEvent, GateEvent, LinkEvent};
use crate::app::ports::{EventSink, StoragePort};
use crate::diagnostics::DiagnosticLog;

/// Adapter that logs every [`AppEvent`] to the serial console.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &AppEvent) {
        match event {
            AppEvent::Link(link) => log_link(link),
            AppEvent::Gate(gate) => log_gate(gate),
        }
    }
}

fn log_link(event: &LinkEvent) {
    match *event {
        LinkEvent::ModemReady { rssi_dbm } => match rssi_dbm {
            Some(r) => info!("LINK | modem ready, rssi={} dBm", r),
            None => info!("LINK | modem ready, rssi unknown"),
        },
        LinkEvent::ModemInitFailed => warn!("LINK | modem bring-up restarted"),
        LinkEvent::PppUp { ip } => info!("LINK | data session up, ip={}", ip),
        LinkEvent::PppFailed { reason, streak } => {
            warn!("LINK | data session failed: {} (streak {})", reason, streak);
        }
        LinkEvent::ModemResetEscalated { ppp_streak } => {
            error!("LINK | {} data session failures, hard-resetting modem", ppp_streak);
        }
        LinkEvent::PppRebuildEscalated { mqtt_streak } => {
            error!("LINK | {} broker failures, rebuilding data session", mqtt_streak);
        }
        LinkEvent::MqttConnected => info!("LINK | broker connected"),
        LinkEvent::MqttFailed { streak } => warn!("LINK | broker connect failed (streak {})", streak),
        LinkEvent::MqttLost { streak } => warn!("LINK | broker connection lost (streak {})", streak),
    }
}

fn log_gate(event: &GateEvent) {
    match event {
        GateEvent::Opened { request_id } => info!("GATE | opened for {}", request_id),
        GateEvent::Duplicate { request_id } => info!("GATE | duplicate {}", request_id),
        GateEvent::Rejected { request_id, code } => {
            warn!("GATE | rejected {} ({})", request_id, code);
        }
        GateEvent::Malformed(e) => warn!("GATE | malformed command: {}", e),
    }
}

/// Logs and persists events for one tick.
///
/// Borrowed fresh each tick so the caller keeps ownership of the log between
/// ticks (the service reads and trims it when uploading).
pub struct DiagnosticSink<'a, S> {
    now_ms: u64,
    diag: &'a mut DiagnosticLog<S>,
}

impl<'a, S: StoragePort> DiagnosticSink<'a, S> {
    pub fn new(now_ms: u64, diag: &'a mut DiagnosticLog<S>) -> Self {
        Self { now_ms, diag }
    }
}

impl<S: StoragePort> EventSink for DiagnosticSink<'_, S> {
    fn emit(&mut self, event: &AppEvent) {
        LogEventSink.emit(event);
        self.diag.record(self.now_ms, event);
    }
}
