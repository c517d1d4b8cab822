//! Gatelink firmware library.
//!
//! Cellular connectivity core for a remote gate controller: modem bring-up,
//! data session management, broker session management, and the escalation
//! policy that ties their failure streaks together.  Exposes every module for
//! integration testing; ESP-IDF-specific code is guarded by
//! `#[cfg(feature = "espidf")]` within each module.

#![deny(unused_must_use)]

pub mod app;
pub mod backoff;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod gate;
pub mod link;
pub mod pins;
pub mod protocol;
pub mod text;

pub mod adapters;
pub mod drivers;
