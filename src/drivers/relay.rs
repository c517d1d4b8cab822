//! Gate relay driver.
//!
//! A single GPIO closes the gate motor's contact for a fixed pulse.  The
//! output is low at rest, high for `pulse_ms`, then low again, blocking the
//! caller for the duration of the pulse.
//!
//! Generic over [`OutputPin`] so the same driver runs on a `PinDriver` on
//! ESP-IDF and on a recording pin in tests.

use embedded_hal::digital::OutputPin;
use log::{info, warn};

use crate::app::ports::{Clock, RelayPort};

pub struct Relay<P, C> {
    pin: P,
    clock: C,
    pulse_ms: u32,
    pulses: u32,
}

impl<P: OutputPin, C: Clock> Relay<P, C> {
    /// Takes ownership of `pin` and drives it low.
    pub fn new(mut pin: P, clock: C, pulse_ms: u32) -> Self {
        if pin.set_low().is_err() {
            warn!("Relay: failed to drive output low at init");
        }
        Self {
            pin,
            clock,
            pulse_ms,
            pulses: 0,
        }
    }

    pub fn pulse_ms(&self) -> u32 {
        self.pulse_ms
    }

    /// Pulses issued since boot.
    pub fn pulse_count(&self) -> u32 {
        self.pulses
    }

    pub fn pin(&self) -> &P {
        &self.pin
    }
}

impl<P: OutputPin, C: Clock> RelayPort for Relay<P, C> {
    fn activate_pulse(&mut self) {
        if self.pin.set_high().is_err() {
            warn!("Relay: set_high failed, pulse skipped");
            return;
        }
        self.clock.delay_ms(self.pulse_ms);
        // Retry once; a relay stuck closed keeps the motor running.
        if self.pin.set_low().is_err() && self.pin.set_low().is_err() {
            warn!("Relay: set_low failed after pulse");
        }
        self.pulses = self.pulses.wrapping_add(1);
        info!("Relay: pulsed {} ms", self.pulse_ms);
    }
}
