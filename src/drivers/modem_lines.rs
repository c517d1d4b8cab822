//! Modem control lines over GPIO.
//!
//! Maps the logical [`ModemLine`]s onto four output pins and applies the
//! board's reset polarity.  Pin numbers live in [`crate::pins`].

use embedded_hal::digital::{OutputPin, PinState};
use log::warn;

use crate::app::ports::{ModemLine, ModemLines};
use crate::pins;

pub struct GpioModemLines<P> {
    power_enable: P,
    reset: P,
    dtr: P,
    power_key: P,
    reset_active_high: bool,
}

impl<P: OutputPin> GpioModemLines<P> {
    /// Pins are driven to their idle levels: rail off, reset released,
    /// DTR low, PWRKEY low.
    pub fn new(power_enable: P, reset: P, dtr: P, power_key: P) -> Self {
        let mut lines = Self {
            power_enable,
            reset,
            dtr,
            power_key,
            reset_active_high: pins::MODEM_RESET_ACTIVE_HIGH,
        };
        lines.set_level(ModemLine::PowerEnable, false);
        lines.set_level(ModemLine::Reset, false);
        lines.set_level(ModemLine::Dtr, false);
        lines.set_level(ModemLine::PowerKey, false);
        lines
    }

    /// Override the reset polarity for boards wired active-low.
    pub fn with_reset_active_high(mut self, active_high: bool) -> Self {
        self.reset_active_high = active_high;
        self
    }

    fn pin(&mut self, line: ModemLine) -> &mut P {
        match line {
            ModemLine::PowerEnable => &mut self.power_enable,
            ModemLine::Reset => &mut self.reset,
            ModemLine::Dtr => &mut self.dtr,
            ModemLine::PowerKey => &mut self.power_key,
        }
    }
}

impl<P: OutputPin> ModemLines for GpioModemLines<P> {
    fn set_level(&mut self, line: ModemLine, high: bool) {
        let level = match line {
            ModemLine::Reset if !self.reset_active_high => !high,
            _ => high,
        };
        if self.pin(line).set_state(PinState::from(level)).is_err() {
            warn!("Modem: failed to drive {:?}", line);
        }
    }
}
