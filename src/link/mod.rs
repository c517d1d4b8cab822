//! Cellular link stack, bottom-up.
//!
//! | Layer        | Type                                   | Recovers by                 |
//! |--------------|----------------------------------------|-----------------------------|
//! | `at`         | [`AtChannel`](at::AtChannel)           | timeout / cancel            |
//! | `modem`      | [`ModemManager`](modem::ModemManager)  | re-sequence from power-on   |
//! | `ppp`        | [`PppManager`](ppp::PppManager)        | fail streak → modem reset   |
//! | `mqtt`       | [`MqttManager`](mqtt::MqttManager)     | backoff, streak → PPP rebuild |
//! | `supervisor` | [`LinkSupervisor`](supervisor::LinkSupervisor) | applies the escalations |

pub mod at;
pub mod modem;
pub mod mqtt;
pub mod ppp;
pub mod supervisor;
