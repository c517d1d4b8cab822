//! Unified error types for the gate controller firmware.
//!
//! A single `Error` enum that every subsystem can convert into, keeping the
//! top-level loop's error handling uniform.  All variants are `Copy` so they
//! can be passed through the link supervisor and event sink without
//! allocation.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level firmware error
// ---------------------------------------------------------------------------

/// Every fallible operation in the firmware funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The modem did not complete bring-up.
    Modem(ModemError),
    /// A packet-data attempt ended without an IP address.
    Ppp(PppError),
    /// The MQTT session could not be established or used.
    Mqtt(MqttError),
    /// An inbound message could not be decoded.
    Protocol(ProtocolError),
    /// Peripheral initialisation failed.
    Init(&'static str),
    /// Configuration is invalid or could not be loaded.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Modem(e) => write!(f, "modem: {e}"),
            Self::Ppp(e) => write!(f, "ppp: {e}"),
            Self::Mqtt(e) => write!(f, "mqtt: {e}"),
            Self::Protocol(e) => write!(f, "protocol: {e}"),
            Self::Init(msg) => write!(f, "init: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Modem errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemError {
    /// No `OK` to `AT` inside the handshake window.
    HandshakeTimeout,
    /// `ATE0` was rejected or timed out.
    EchoDisableFailed,
}

impl fmt::Display for ModemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeTimeout => write!(f, "AT handshake timeout"),
            Self::EchoDisableFailed => write!(f, "failed to disable echo"),
        }
    }
}

impl From<ModemError> for Error {
    fn from(e: ModemError) -> Self {
        Self::Modem(e)
    }
}

// ---------------------------------------------------------------------------
// PPP errors
// ---------------------------------------------------------------------------

/// Why a PPP bring-up attempt ended.  Every variant is attempt-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PppError {
    /// The network refused registration.
    RegistrationDenied,
    /// `AT+CGACT` failed on every retry.
    ActivationExhausted,
    /// The modem never reported a usable address.
    NoIpAddress,
    /// The whole attempt overran its time budget.
    Timeout,
}

impl fmt::Display for PppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegistrationDenied => write!(f, "registration denied"),
            Self::ActivationExhausted => write!(f, "PDP activation retries exhausted"),
            Self::NoIpAddress => write!(f, "no IP address assigned"),
            Self::Timeout => write!(f, "attempt timed out"),
        }
    }
}

impl From<PppError> for Error {
    fn from(e: PppError) -> Self {
        Self::Ppp(e)
    }
}

// ---------------------------------------------------------------------------
// MQTT errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttError {
    ConnectFailed,
    SubscribeFailed,
    ConnectionLost,
    PublishFailed,
    NotConnected,
}

impl fmt::Display for MqttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed => write!(f, "broker connect failed"),
            Self::SubscribeFailed => write!(f, "command topic subscribe failed"),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::PublishFailed => write!(f, "publish failed"),
            Self::NotConnected => write!(f, "not connected"),
        }
    }
}

impl From<MqttError> for Error {
    fn from(e: MqttError) -> Self {
        Self::Mqtt(e)
    }
}

// ---------------------------------------------------------------------------
// Protocol errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload is not valid JSON.
    Malformed,
    /// A required field is absent or has the wrong JSON type.
    MissingField(&'static str),
    /// An outbound message could not be serialised.
    Encode,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed JSON"),
            Self::MissingField(name) => write!(f, "missing or invalid {name}"),
            Self::Encode => write!(f, "encode failed"),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
