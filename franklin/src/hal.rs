//! Hardware collaborators consumed by the core
//!
//! A board backend implements [`Pins`], [`Adc`] and [`Clock`]. Logical pins are described by
//! [`Pin`] values that carry validity and inversion flags next to the pin number, so the same
//! machine description can drive native registers or the table-driven simulator in [`crate::sim`].

use crate::encoding::{ReadError, Readable, Writable};
use crate::output_buffer::OutputBuffer;

/// Set when the pin is configured
pub const PIN_VALID: u16 = 0x100;
/// Set when the pin is active low
pub const PIN_INVERTED: u16 = 0x200;

/// A logical pin: number in the low byte, flags above
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pin(pub u16);

impl Pin {
    /// Unconfigured pin; all operations on it are no-ops
    pub const NONE: Pin = Pin(0);

    pub const fn new(number: u8, inverted: bool) -> Self {
        let flags = if inverted {
            PIN_VALID | PIN_INVERTED
        } else {
            PIN_VALID
        };
        Pin(number as u16 | flags)
    }

    pub const fn number(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub const fn is_valid(self) -> bool {
        self.0 & PIN_VALID != 0
    }

    pub const fn is_inverted(self) -> bool {
        self.0 & PIN_INVERTED != 0
    }

    pub fn make_output(self, pins: &mut impl Pins) {
        if self.is_valid() {
            pins.set_output(self.number());
        }
    }

    pub fn make_input(self, pins: &mut impl Pins) {
        if self.is_valid() {
            pins.set_input(self.number());
        }
    }

    /// Drives the pin to its logical state, honouring inversion
    pub fn drive(self, pins: &mut impl Pins, active: bool) {
        if !self.is_valid() {
            return;
        }
        if active != self.is_inverted() {
            pins.set(self.number());
        } else {
            pins.reset(self.number());
        }
    }

    /// Logical state of the pin; an unconfigured pin is never active
    pub fn is_active(self, pins: &impl Pins) -> bool {
        self.is_valid() && pins.get(self.number()) != self.is_inverted()
    }

    /// Emits one step pulse
    pub fn pulse(self, pins: &mut impl Pins) {
        self.drive(pins, true);
        self.drive(pins, false);
    }
}

impl Readable<'_> for Pin {
    fn read(data: &mut &[u8]) -> Result<Self, ReadError> {
        u16::read(data).map(Pin)
    }
}

impl Writable for Pin {
    fn write(&self, output: &mut impl OutputBuffer) {
        self.0.write(output)
    }
}

/// Digital pin access by pin number
pub trait Pins {
    fn set_output(&mut self, pin: u8);
    fn set_input(&mut self, pin: u8);
    fn set(&mut self, pin: u8);
    fn reset(&mut self, pin: u8);
    fn get(&self, pin: u8) -> bool;
}

/// Analog sampling, one conversion at a time
pub trait Adc {
    fn start(&mut self, pin: u8);
    fn ready(&self, pin: u8) -> bool;
    fn get(&mut self, pin: u8) -> u16;
}

/// Monotonic time source
pub trait Clock {
    fn micros(&self) -> u32;

    fn millis(&self) -> u32 {
        self.micros() / 1000
    }
}

impl<T: Pins> Pins for &mut T {
    fn set_output(&mut self, pin: u8) {
        (**self).set_output(pin)
    }
    fn set_input(&mut self, pin: u8) {
        (**self).set_input(pin)
    }
    fn set(&mut self, pin: u8) {
        (**self).set(pin)
    }
    fn reset(&mut self, pin: u8) {
        (**self).reset(pin)
    }
    fn get(&self, pin: u8) -> bool {
        (**self).get(pin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPins;

    #[test]
    fn inverted_pins_drive_low_when_active() {
        let mut pins = SimPins::new();
        let pin = Pin::new(4, true);
        pin.drive(&mut pins, true);
        assert!(!pins.level(4));
        assert!(pin.is_active(&pins));
    }

    #[test]
    fn unconfigured_pins_are_ignored() {
        let mut pins = SimPins::new();
        Pin::NONE.pulse(&mut pins);
        assert_eq!(pins.rising_edges(0), 0);
        assert!(!Pin::NONE.is_active(&pins));
    }
}
