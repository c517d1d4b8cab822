//! Outbound application events.
//!
//! The [`LinkSupervisor`](crate::link::supervisor::LinkSupervisor) and the
//! [`GateService`](super::service::GateService) emit these through the
//! [`EventSink`](super::ports::EventSink) port.  Adapters on the other side
//! decide what to do with them — log to serial, append to the persistent
//! diagnostic ring, etc.

use core::net::Ipv4Addr;

use crate::error::{PppError, ProtocolError};
use crate::protocol::RequestId;

/// Structured events emitted by the application core.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Link(LinkEvent),
    Gate(GateEvent),
}

/// Connectivity milestones and escalations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Modem bring-up reached `Complete`.
    ModemReady { rssi_dbm: Option<i16> },
    /// Bring-up fell back to power-on (handshake window or ATE0).
    ModemInitFailed,
    PppUp { ip: Ipv4Addr },
    PppFailed { reason: PppError, streak: u8 },
    /// PPP streak crossed its threshold; the modem is being hard-reset.
    ModemResetEscalated { ppp_streak: u8 },
    /// MQTT streak crossed its threshold; the PPP session is being rebuilt.
    PppRebuildEscalated { mqtt_streak: u8 },
    MqttConnected,
    MqttFailed { streak: u8 },
    MqttLost { streak: u8 },
}

/// Gate command outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum GateEvent {
    /// Relay pulsed for this request.
    Opened { request_id: RequestId },
    /// Already handled; acknowledged again without actuation.
    Duplicate { request_id: RequestId },
    /// Refused with an ack error code.
    Rejected {
        request_id: RequestId,
        code: &'static str,
    },
    /// Payload could not be decoded; no ack is possible.
    Malformed(ProtocolError),
}

impl From<LinkEvent> for AppEvent {
    fn from(e: LinkEvent) -> Self {
        Self::Link(e)
    }
}

impl From<GateEvent> for AppEvent {
    fn from(e: GateEvent) -> Self {
        Self::Gate(e)
    }
}
