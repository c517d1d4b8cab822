//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises one layer of the link
//! stack (or the gate service on top of it) against the simulated modem and
//! the fakes in `mock_hw`.  All tests run on the host with no real hardware.

mod escalation_tests;
mod gate_service_tests;
mod mock_hw;
mod modem_tests;
mod mqtt_tests;
