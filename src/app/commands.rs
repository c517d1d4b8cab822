//! Inbound commands to the gate service.
//!
//! Decoded from the command topic by
//! [`GateService`](super::service::GateService)'s
//! [`CommandHandler`](super::ports::CommandHandler) impl and queued until the
//! next [`process`](super::service::GateService::process) call.

use crate::error::ProtocolError;
use crate::protocol::{COMMAND_OPEN, CommandName, CommandResult, RequestId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateCommand {
    /// Pulse the relay.
    Open {
        request_id: RequestId,
        user_id: UserId,
        issued_at: u64,
    },
    /// Well-formed, but not a command this device understands.
    Unsupported {
        request_id: RequestId,
        command: CommandName,
    },
    /// The payload did not decode.
    Invalid(ProtocolError),
}

impl GateCommand {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Open { request_id, .. } | Self::Unsupported { request_id, .. } => {
                Some(request_id.as_str())
            }
            Self::Invalid(_) => None,
        }
    }
}

impl From<CommandResult> for GateCommand {
    fn from(c: CommandResult) -> Self {
        if c.command == COMMAND_OPEN {
            Self::Open {
                request_id: c.request_id,
                user_id: c.user_id,
                issued_at: c.issued_at,
            }
        } else {
            Self::Unsupported {
                request_id: c.request_id,
                command: c.command,
            }
        }
    }
}

impl From<Result<CommandResult, ProtocolError>> for GateCommand {
    fn from(r: Result<CommandResult, ProtocolError>) -> Self {
        r.map_or_else(Self::Invalid, Self::from)
    }
}
