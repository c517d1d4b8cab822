//! Persistent diagnostic log.
//!
//! A ring of up to 32 recovery events (oldest overwritten first) kept in RAM
//! and mirrored to NVS under the `pgr_diag` namespace as one postcard blob,
//! so entries survive the resets they often describe.  After MQTT reconnects
//! the gate service uploads the ring and removes what was sent.
//!
//! A custom panic hook appends a final `panic` entry before the reset.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::app::events::{AppEvent, GateEvent, LinkEvent};
use crate::app::ports::StoragePort;
use crate::text;

pub const DIAG_CAPACITY: usize = 32;
pub const DIAG_EVENT_LEN: usize = 19;
pub const DIAG_MESSAGE_LEN: usize = 31;

const DIAG_NAMESPACE: &str = "pgr_diag";
const DIAG_KEY: &str = "ring";
/// Upper bound on the serialised ring.
const DIAG_BLOB_MAX: usize = 2_560;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    /// Milliseconds since boot at the time of the event.
    pub ts: u64,
    pub level: DiagnosticLevel,
    pub event: heapless::String<DIAG_EVENT_LEN>,
    pub message: Option<heapless::String<DIAG_MESSAGE_LEN>>,
}

impl DiagnosticEntry {
    pub fn new(ts: u64, level: DiagnosticLevel, event: &str, message: Option<&str>) -> Self {
        Self {
            ts,
            level,
            event: text::truncate(event),
            message: message.filter(|m| !m.is_empty()).map(text::truncate),
        }
    }
}

/// NVS-backed ring of [`DiagnosticEntry`].
pub struct DiagnosticLog<S> {
    storage: S,
    entries: heapless::Deque<DiagnosticEntry, DIAG_CAPACITY>,
}

impl<S: StoragePort> DiagnosticLog<S> {
    /// Create the log and restore whatever was persisted.
    pub fn new(storage: S) -> Self {
        let mut log = Self {
            storage,
            entries: heapless::Deque::new(),
        };
        log.load();
        log
    }

    /// Reload from storage.  A missing or corrupt blob yields an empty ring.
    pub fn load(&mut self) {
        self.entries.clear();
        let mut buf = vec![0u8; DIAG_BLOB_MAX];
        let Ok(len) = self.storage.read(DIAG_NAMESPACE, DIAG_KEY, &mut buf) else {
            return;
        };
        match postcard::from_bytes::<heapless::Vec<DiagnosticEntry, DIAG_CAPACITY>>(&buf[..len]) {
            Ok(stored) => {
                for e in stored {
                    let _ = self.entries.push_back(e);
                }
            }
            Err(_) => warn!("Diag: stored ring unreadable, starting empty"),
        }
    }

    pub fn append(&mut self, ts: u64, level: DiagnosticLevel, event: &str, message: Option<&str>) {
        if event.is_empty() {
            return;
        }
        if self.entries.is_full() {
            self.entries.pop_front();
        }
        let _ = self
            .entries
            .push_back(DiagnosticEntry::new(ts, level, event, message));
        self.save();
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Entry `index`, oldest first.
    pub fn entry(&self, index: usize) -> Option<&DiagnosticEntry> {
        self.entries.iter().nth(index)
    }

    /// Copy of every entry, oldest first.
    pub fn snapshot(&self) -> heapless::Vec<DiagnosticEntry, DIAG_CAPACITY> {
        self.entries.iter().cloned().collect()
    }

    pub fn has_entries(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        if let Err(e) = self.storage.delete(DIAG_NAMESPACE, DIAG_KEY) {
            warn!("Diag: clear failed — {}", e);
        }
    }

    /// Drop the `n` oldest entries (typically the batch just uploaded).
    pub fn remove_first(&mut self, n: usize) {
        if n >= self.entries.len() {
            self.clear();
            return;
        }
        for _ in 0..n {
            self.entries.pop_front();
        }
        self.save();
    }

    /// Record `event` if it is worth keeping across a reset.
    pub fn record(&mut self, ts: u64, event: &AppEvent) {
        if let Some((level, name, message)) = describe(event) {
            self.append(ts, level, name, message.as_deref());
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn save(&mut self) {
        let stored: heapless::Vec<DiagnosticEntry, DIAG_CAPACITY> =
            self.entries.iter().cloned().collect();
        match postcard::to_allocvec(&stored) {
            Ok(bytes) => {
                if let Err(e) = self.storage.write(DIAG_NAMESPACE, DIAG_KEY, &bytes) {
                    warn!("Diag: persist failed — {}", e);
                }
            }
            Err(_) => warn!("Diag: encode failed"),
        }
    }
}

type Message = heapless::String<DIAG_MESSAGE_LEN>;

fn message(args: core::fmt::Arguments<'_>) -> Option<Message> {
    let mut m = Message::new();
    // Overflow just truncates the message.
    let _ = core::fmt::Write::write_fmt(&mut m, args);
    Some(m)
}

/// Map an event to `(level, event name, message)`.  Routine successes that
/// happen every tick are not recorded.
fn describe(event: &AppEvent) -> Option<(DiagnosticLevel, &'static str, Option<Message>)> {
    use DiagnosticLevel::{Error, Info, Warn};
    Some(match event {
        AppEvent::Link(link) => match *link {
            LinkEvent::ModemReady { rssi_dbm } => (
                Info,
                "modem_ready",
                rssi_dbm.and_then(|r| message(format_args!("rssi {r}"))),
            ),
            LinkEvent::ModemInitFailed => (Warn, "modem_init_failed", None),
            LinkEvent::PppUp { ip } => (Info, "ppp_up", message(format_args!("{ip}"))),
            LinkEvent::PppFailed { reason, streak } => (
                Warn,
                "ppp_failed",
                message(format_args!("{reason} #{streak}")),
            ),
            LinkEvent::ModemResetEscalated { ppp_streak } => (
                Error,
                "modem_hard_reset",
                message(format_args!("ppp streak {ppp_streak}")),
            ),
            LinkEvent::PppRebuildEscalated { mqtt_streak } => (
                Error,
                "ppp_rebuild",
                message(format_args!("mqtt streak {mqtt_streak}")),
            ),
            LinkEvent::MqttConnected => (Info, "connection_restored", None),
            LinkEvent::MqttFailed { streak } => (
                Warn,
                "mqtt_connect_fail",
                message(format_args!("streak {streak}")),
            ),
            LinkEvent::MqttLost { streak } => (
                Warn,
                "connection_lost",
                message(format_args!("streak {streak}")),
            ),
        },
        AppEvent::Gate(GateEvent::Malformed(e)) => {
            (Warn, "bad_command", message(format_args!("{e}")))
        }
        AppEvent::Gate(_) => return None,
    })
}

// ───────────────────────────────────────────────────────────────
// Custom panic handler — appends a `panic` entry before reset
// ───────────────────────────────────────────────────────────────

/// Install a panic hook that persists the panic reason to the diagnostic log.
///
/// Must be called once during init, after NVS is ready.
pub fn install_panic_handler() {
    std::panic::set_hook(Box::new(|info| {
        let reason = if let Some(msg) = info.payload().downcast_ref::<&str>() {
            *msg
        } else if let Some(msg) = info.payload().downcast_ref::<String>() {
            msg.as_str()
        } else {
            "unknown panic"
        };

        log::error!("PANIC: {}", reason);

        #[cfg(feature = "espidf")]
        {
            // SAFETY: esp_timer_get_time is a plain counter read, safe in panic context.
            let uptime_ms = (unsafe { esp_idf_svc::sys::esp_timer_get_time() }) as u64 / 1_000;

            // Relies on the NVS session opened in main(); if it was never
            // initialised the write silently fails.
            match crate::adapters::nvs::NvsAdapter::new() {
                Ok(nvs) => {
                    let mut diag = DiagnosticLog::new(nvs);
                    diag.append(uptime_ms, DiagnosticLevel::Error, "panic", Some(reason));
                }
                Err(_) => {
                    log::error!("Panic handler: NVS unavailable — entry not persisted");
                }
            }
        }
    }));
}
