//! Application core — pure domain logic, zero I/O.
//!
//! The gate rules (dedupe, cooldown, acks, heartbeats, diagnostics upload)
//! live in [`service`].  All interaction with hardware and the link happens
//! through **port traits** defined in [`ports`], keeping this layer fully
//! testable without a modem attached.

pub mod commands;
pub mod events;
pub mod ports;
pub mod service;
