//! JSON wire format for the gate topics.
//!
//! | Topic         | Direction | Body                                                    |
//! |---------------|-----------|---------------------------------------------------------|
//! | `…/cmd`       | in        | `{requestId, command, userId, issuedAt}`                |
//! | `…/ack`       | out       | `{requestId, ok, errorCode?}`                           |
//! | `…/status`    | out       | `{deviceId, online, updatedAt, rssi?, fwVersion?}`      |
//! | `…/diagnostics` | out     | `{deviceId, entries: [{ts, level, event, message?}], fwVersion, sessionId?}` |
//!
//! Inbound strings are truncated at a character boundary to fixed
//! capacities so a hostile payload cannot grow the dedupe ring.

use serde::Serialize;
use serde_json::Value;

use crate::diagnostics::{DiagnosticEntry, DiagnosticLevel};
use crate::error::ProtocolError;
use crate::text;

pub type RequestId = heapless::String<36>;
pub type CommandName = heapless::String<15>;
pub type UserId = heapless::String<63>;

/// The only command the gate understands.
pub const COMMAND_OPEN: &str = "open";

/// Ack error codes.
pub mod error_code {
    pub const UNKNOWN_COMMAND: &str = "UNKNOWN_COMMAND";
    pub const COOLDOWN: &str = "COOLDOWN";
    pub const BUSY: &str = "BUSY";
}

/// A decoded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub request_id: RequestId,
    pub command: CommandName,
    pub user_id: UserId,
    /// Backend timestamp (ms).  Negative or fractional inputs are saturated
    /// / truncated toward zero.
    pub issued_at: u64,
}

fn required_str<'a>(doc: &'a Value, field: &'static str) -> Result<&'a str, ProtocolError> {
    doc.get(field)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField(field))
}

/// Decode a command payload.  Every field must be present with the right
/// JSON type; `issuedAt` accepts any JSON number.
pub fn parse_command(json: &[u8]) -> Result<CommandResult, ProtocolError> {
    let doc: Value = serde_json::from_slice(json).map_err(|_| ProtocolError::Malformed)?;
    if !doc.is_object() {
        return Err(ProtocolError::Malformed);
    }

    let request_id = required_str(&doc, "requestId")?;
    let command = required_str(&doc, "command")?;
    let user_id = required_str(&doc, "userId")?;

    let issued = doc
        .get("issuedAt")
        .filter(|v| v.is_number())
        .ok_or(ProtocolError::MissingField("issuedAt"))?;
    let issued_at = issued
        .as_u64()
        .or_else(|| issued.as_i64().map(|_| 0))
        .or_else(|| issued.as_f64().map(|f| f as u64))
        .ok_or(ProtocolError::MissingField("issuedAt"))?;

    Ok(CommandResult {
        request_id: text::truncate(request_id),
        command: text::truncate(command),
        user_id: text::truncate(user_id),
        issued_at,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Ack<'a> {
    request_id: &'a str,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<&'a str>,
}

/// `errorCode` is only emitted when `ok` is false.
pub fn create_ack(
    request_id: &str,
    ok: bool,
    error_code: Option<&str>,
) -> Result<Vec<u8>, ProtocolError> {
    let ack = Ack {
        request_id,
        ok,
        error_code: if ok { None } else { error_code },
    };
    serde_json::to_vec(&ack).map_err(|_| ProtocolError::Encode)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Status<'a> {
    device_id: &'a str,
    online: bool,
    updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    rssi: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fw_version: Option<&'a str>,
}

/// Heartbeat.  An RSSI of 0 is treated as unknown and omitted.
pub fn create_status(
    device_id: &str,
    online: bool,
    updated_at: u64,
    rssi: Option<i16>,
    fw_version: Option<&str>,
) -> Result<Vec<u8>, ProtocolError> {
    let status = Status {
        device_id,
        online,
        updated_at,
        rssi: rssi.filter(|r| *r != 0),
        fw_version,
    };
    serde_json::to_vec(&status).map_err(|_| ProtocolError::Encode)
}

#[derive(Serialize)]
struct WireEntry<'a> {
    ts: u64,
    level: DiagnosticLevel,
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Diagnostics<'a> {
    device_id: &'a str,
    entries: Vec<WireEntry<'a>>,
    fw_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

/// Batch of diagnostic ring entries, oldest first.
pub fn create_diagnostics(
    device_id: &str,
    fw_version: &str,
    session_id: Option<&str>,
    entries: &[DiagnosticEntry],
) -> Result<Vec<u8>, ProtocolError> {
    let body = Diagnostics {
        device_id,
        entries: entries
            .iter()
            .map(|e| WireEntry {
                ts: e.ts,
                level: e.level,
                event: &e.event,
                message: e.message.as_deref(),
            })
            .collect(),
        fw_version,
        session_id,
    };
    serde_json::to_vec(&body).map_err(|_| ProtocolError::Encode)
}
