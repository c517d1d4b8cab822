//! GPIO / peripheral pin assignments for the LilyGo T-A7670 gate board.
//!
//! Single source of truth — every driver references this module rather than
//! hard-coding pin numbers.  Change a pin here and it propagates everywhere.

// ---------------------------------------------------------------------------
// Cellular modem (SIMCom A7670)
// ---------------------------------------------------------------------------

/// Board power switch for the modem rail.  HIGH = modem powered.
pub const MODEM_POWER_ON_GPIO: i32 = 12;
/// Modem PWRKEY.  A HIGH pulse boots the modem.
pub const MODEM_PWRKEY_GPIO: i32 = 4;
/// Modem RESET.  Active HIGH on this board.
pub const MODEM_RESET_GPIO: i32 = 5;
/// Modem DTR.  Held LOW to keep the modem out of sleep.
pub const MODEM_DTR_GPIO: i32 = 25;
/// Ring indicator (unused, reserved).
pub const MODEM_RING_GPIO: i32 = 33;

/// Reset line level that holds the modem in reset.
pub const MODEM_RESET_ACTIVE_HIGH: bool = true;

// ---------------------------------------------------------------------------
// Modem UART
// ---------------------------------------------------------------------------

pub const MODEM_UART_NUM: u8 = 1;
pub const MODEM_TX_GPIO: i32 = 26;
pub const MODEM_RX_GPIO: i32 = 27;

// ---------------------------------------------------------------------------
// Gate relay
// ---------------------------------------------------------------------------

/// Relay driver input.  HIGH = contact closed (gate motor triggered).
pub const RELAY_GPIO: i32 = 13;
