//! Actuator drivers, modem line control, and the task watchdog.

pub mod modem_lines;
pub mod relay;
pub mod watchdog;
