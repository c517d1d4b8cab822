//! Port traits — the hexagonal boundary between link logic and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ ModemManager / PppManager / MqttManager / GateService
//! ```
//!
//! Driven adapters (UART, GPIO lines, relay, MQTT transports, storage, event
//! sinks) implement these traits.  The link layers consume them via generics,
//! so the state machines never touch hardware directly and run unchanged on
//! the host under test.
//!
//! Ownership follows the cellular stack: the modem owns the UART and its
//! control lines and lends them out through [`AtPort`] for the duration of a
//! single call.

use crate::config::LinkConfig;
use crate::link::modem::ModemInfo;

// ───────────────────────────────────────────────────────────────
// Clock port
// ───────────────────────────────────────────────────────────────

/// Monotonic millisecond clock plus a blocking delay.
///
/// Only GPIO sequencing and the relay pulse call [`delay_ms`](Clock::delay_ms);
/// everything else reads [`now_ms`](Clock::now_ms) and keeps its waits as
/// state.
pub trait Clock {
    fn now_ms(&self) -> u64;
    fn delay_ms(&mut self, ms: u32);
}

// ───────────────────────────────────────────────────────────────
// Serial port (driven adapter: modem UART)
// ───────────────────────────────────────────────────────────────

/// Raw byte transport to the modem.
pub trait SerialPort {
    /// (Re)configure the line rate.  Called at the start of every power-on.
    fn configure(&mut self, baud: u32);

    /// Write all of `data`.
    fn write(&mut self, data: &[u8]) -> Result<(), SerialError>;

    /// Non-blocking read.  Returns the number of bytes placed in `buf`
    /// (0 when nothing is pending).
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

// ───────────────────────────────────────────────────────────────
// Modem control lines (driven adapter: GPIO)
// ───────────────────────────────────────────────────────────────

/// The four board lines used to sequence the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemLine {
    /// Modem rail power switch.
    PowerEnable,
    /// Hardware reset (logical level; adapters apply board polarity).
    Reset,
    /// Sleep-inhibit.  Held low while the modem must stay awake.
    Dtr,
    /// Power key.
    PowerKey,
}

pub trait ModemLines {
    /// Drive `line` to a logical level.  `true` = asserted / high.
    fn set_level(&mut self, line: ModemLine, high: bool);
}

// ───────────────────────────────────────────────────────────────
// AT command port (lent by the modem to PPP and the modem MQTT stack)
// ───────────────────────────────────────────────────────────────

/// Capacity of the rolling response window.
pub const AT_RESPONSE_CAPACITY: usize = 256;
/// Capacity of a single buffered unsolicited line.
pub const URC_LINE_CAPACITY: usize = 256;

/// Accumulated modem response text.
pub type AtResponse = heapless::String<AT_RESPONSE_CAPACITY>;
/// One line received outside (or alongside) a command exchange.
pub type UrcLine = heapless::String<URC_LINE_CAPACITY>;

/// Outcome of one poll of a non-blocking AT exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtPoll {
    /// Still waiting; call again with the same command.
    Pending,
    /// The expected token arrived.
    Matched(AtResponse),
    /// The modem answered `ERROR`.
    Error(AtResponse),
    /// Neither arrived in time.
    TimedOut(AtResponse),
}

impl AtPoll {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Line-terminated command/response exchange with the modem.
pub trait AtPort {
    /// Current time on the clock the channel measures timeouts with.
    fn now_ms(&self) -> u64;

    /// Non-blocking exchange.  The first call with a given `cmd` flushes
    /// stale input and writes `cmd\r\n`; later calls with the same `cmd`
    /// accumulate the response.  A different `cmd` abandons the in-flight one.
    fn exchange(&mut self, cmd: &str, expect: &str, timeout_ms: u32) -> AtPoll;

    /// Non-blocking raw write, for the bytes owed after a `>` prompt.  The
    /// first call writes `data` as-is (no line ending, no input flush); later
    /// calls with the same bytes accumulate the response.
    fn exchange_data(&mut self, data: &[u8], expect: &str, timeout_ms: u32) -> AtPoll;

    /// Next buffered line received from the modem, oldest first.
    fn take_urc(&mut self) -> Option<UrcLine>;
}

impl<T: AtPort + ?Sized> AtPort for &mut T {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
    fn exchange(&mut self, cmd: &str, expect: &str, timeout_ms: u32) -> AtPoll {
        (**self).exchange(cmd, expect, timeout_ms)
    }
    fn exchange_data(&mut self, data: &[u8], expect: &str, timeout_ms: u32) -> AtPoll {
        (**self).exchange_data(data, expect, timeout_ms)
    }
    fn take_urc(&mut self) -> Option<UrcLine> {
        (**self).take_urc()
    }
}

// ───────────────────────────────────────────────────────────────
// Modem port
// ───────────────────────────────────────────────────────────────

/// Result of one non-blocking bring-up step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Ready,
    Failed,
}

/// A modem: the AT channel plus its bring-up state machine and escape hatches.
pub trait ModemPort: AtPort {
    /// Advance bring-up by at most one transition.
    fn init(&mut self) -> Progress;

    fn is_ready(&self) -> bool;

    /// Pulse the reset line and restart bring-up from power-on.
    fn hard_reset(&mut self);

    /// Cut and restore modem power, restarting bring-up from power-on.
    fn power_cycle(&mut self);

    /// Results of the informational queries made during bring-up.
    fn info(&self) -> &ModemInfo;
}

// ───────────────────────────────────────────────────────────────
// MQTT transport (driven adapter: broker session)
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

impl QoS {
    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
        }
    }
}

/// Broker session parameters for one connect attempt.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions<'a> {
    pub client_id: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub username: &'a str,
    pub password: &'a str,
    pub keep_alive_secs: u16,
}

/// Publish/subscribe/health-check capability shared by every transport, so
/// one [`MqttManager`](crate::link::mqtt::MqttManager) policy covers them all.
///
/// `connect`, `subscribe` and `publish` never wait on the network: a transport
/// whose dialogue is still running returns [`TransportError::WouldBlock`] and
/// expects the same call again on a later tick.  A `connect` with a different
/// client id abandons whatever was in flight.
pub trait MqttTransport {
    fn connect(&mut self, opts: &ConnectOptions<'_>) -> Result<(), TransportError>;

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool)
    -> Result<(), TransportError>;

    /// Best-effort; never fails.
    fn disconnect(&mut self);

    /// Live session health (may inspect the underlying client).
    fn is_connected(&mut self) -> bool;

    /// Deliver every pending inbound message to `on_message`.
    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8]));
}

impl<T: MqttTransport + ?Sized> MqttTransport for &mut T {
    fn connect(&mut self, opts: &ConnectOptions<'_>) -> Result<(), TransportError> {
        (**self).connect(opts)
    }
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        (**self).subscribe(topic, qos)
    }
    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retained: bool,
    ) -> Result<(), TransportError> {
        (**self).publish(topic, payload, retained)
    }
    fn disconnect(&mut self) {
        (**self).disconnect();
    }
    fn is_connected(&mut self) -> bool {
        (**self).is_connected()
    }
    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) {
        (**self).poll(on_message);
    }
}

/// Hands out an [`MqttTransport`] for one call.
///
/// Transports that live on the modem need the AT channel to do anything, so
/// the supervisor lends it for the duration of `f`.  Transports that own
/// their own socket simply ignore `at`.
pub trait MqttLink<A: ?Sized> {
    fn with_transport<R>(&mut self, at: &mut A, f: impl FnOnce(&mut dyn MqttTransport) -> R)
    -> R;
}

// ───────────────────────────────────────────────────────────────
// Inbound command handler (driving adapter: broker → domain)
// ───────────────────────────────────────────────────────────────

/// Receives messages arriving on the command topic.  Passed into
/// [`MqttManager::poll`](crate::link::mqtt::MqttManager::poll) on every call.
pub trait CommandHandler {
    fn on_command(&mut self, topic: &str, payload: &[u8]);
}

// ───────────────────────────────────────────────────────────────
// Relay port (driven adapter: domain → gate motor)
// ───────────────────────────────────────────────────────────────

pub trait RelayPort {
    /// Close the contact for the configured pulse width, then open it.
    /// Blocks for the pulse duration.
    fn activate_pulse(&mut self);
}

// ───────────────────────────────────────────────────────────────
// Event sink port (driven adapter: domain → logging / diagnostics)
// ───────────────────────────────────────────────────────────────

/// The link supervisor and gate service emit structured
/// [`AppEvent`](super::events::AppEvent)s through this port.  Adapters decide
/// where they go (serial log, persistent diagnostic ring).
pub trait EventSink {
    fn emit(&mut self, event: &super::events::AppEvent);
}

// ───────────────────────────────────────────────────────────────
// Configuration port (driven adapter: domain ↔ persistent config)
// ───────────────────────────────────────────────────────────────

/// Loads and persists the link configuration.
///
/// Implementations MUST call [`LinkConfig::validate`] before persisting.
/// Invalid values are rejected with [`ConfigError::ValidationFailed`], not
/// silently clamped.
pub trait ConfigPort {
    /// Load configuration from persistent storage.
    /// Returns [`LinkConfig::default()`] if no stored config exists.
    fn load(&self) -> Result<LinkConfig, ConfigError>;

    /// Validate and persist configuration.
    fn save(&self, config: &LinkConfig) -> Result<(), ConfigError>;
}

// ───────────────────────────────────────────────────────────────
// Storage port (driven adapter: domain ↔ NVS / flash)
// ───────────────────────────────────────────────────────────────

/// Persistent key-value storage for config and the diagnostic ring.
///
/// Keys are namespaced to prevent collisions between subsystems.  Writes
/// MUST be atomic; the ESP-IDF NVS API guarantees this natively.
pub trait StoragePort {
    /// Read a value.  Returns the number of bytes written to `buf`.
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Write a value atomically.
    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Delete a key.  Returns `Ok(())` even if the key didn't exist.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError>;

    /// Check whether a key exists without reading it.
    fn exists(&self, namespace: &str, key: &str) -> bool;
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`SerialPort`] writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialError {
    /// The driver accepted fewer bytes than requested.
    ShortWrite,
    /// Generic UART driver error.
    Io,
}

/// Errors from [`MqttTransport`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The broker refused or the network never answered.
    ConnectRefused,
    /// The broker rejected the subscription.
    SubscribeRejected,
    /// The publish was not accepted.
    PublishFailed,
    /// No session is open.
    NotConnected,
    /// The modem did not answer an AT step.
    Modem,
    /// A value cannot be spliced into an AT command line (too long, or
    /// carries a quote or control character).
    InvalidArgument,
    /// The operation is still running; repeat the call later.
    WouldBlock,
}

/// Errors from [`ConfigPort`] operations.
#[derive(Debug)]
pub enum ConfigError {
    /// No config found in storage (first boot).
    NotFound,
    /// Stored config failed integrity / deserialization check.
    Corrupted,
    /// A config field failed range validation.
    /// The `&'static str` describes which field and why.
    ValidationFailed(&'static str),
    /// Underlying storage is full.
    StorageFull,
    /// Generic I/O error from the storage backend.
    IoError,
}

/// Errors from [`StoragePort`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Requested key does not exist.
    NotFound,
    /// Storage partition is full.
    Full,
    /// Generic I/O error.
    IoError,
    /// Caller buffer is smaller than the stored value.
    BufferTooSmall,
}

impl core::fmt::Display for SerialError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ShortWrite => write!(f, "short write"),
            Self::Io => write!(f, "UART I/O error"),
        }
    }
}

impl core::fmt::Display for TransportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ConnectRefused => write!(f, "connect refused"),
            Self::SubscribeRejected => write!(f, "subscribe rejected"),
            Self::PublishFailed => write!(f, "publish failed"),
            Self::NotConnected => write!(f, "not connected"),
            Self::Modem => write!(f, "modem did not answer"),
            Self::InvalidArgument => write!(f, "argument does not fit an AT command"),
            Self::WouldBlock => write!(f, "in progress"),
        }
    }
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "config not found"),
            Self::Corrupted => write!(f, "config corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {}", msg),
            Self::StorageFull => write!(f, "storage full"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl core::fmt::Display for StorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Full => write!(f, "storage full"),
            Self::IoError => write!(f, "I/O error"),
            Self::BufferTooSmall => write!(f, "buffer too small"),
        }
    }
}

impl From<ConfigError> for crate::error::Error {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::ValidationFailed(msg) => Self::Config(msg),
            ConfigError::NotFound => Self::Config("not found"),
            ConfigError::Corrupted => Self::Config("corrupted"),
            ConfigError::StorageFull => Self::Config("storage full"),
            ConfigError::IoError => Self::Config("I/O error"),
        }
    }
}
