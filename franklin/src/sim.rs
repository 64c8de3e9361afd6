//! Table-driven hardware backend for the simulator and tests

use crate::hal::{Adc, Clock, Pins};
use core::cell::Cell;

#[derive(Debug, Clone, Copy, Default)]
struct PinState {
    output: bool,
    level: bool,
    rising_edges: u32,
}

/// Pin-state table indexed by pin number
pub struct SimPins {
    table: [PinState; 256],
}

impl SimPins {
    pub fn new() -> Self {
        SimPins {
            table: [PinState::default(); 256],
        }
    }

    pub fn level(&self, pin: u8) -> bool {
        self.table[pin as usize].level
    }

    pub fn is_output(&self, pin: u8) -> bool {
        self.table[pin as usize].output
    }

    /// Number of low to high transitions, i.e. step pulses, seen on `pin`
    pub fn rising_edges(&self, pin: u8) -> u32 {
        self.table[pin as usize].rising_edges
    }

    /// Drives an input from the outside, e.g. a limit switch
    pub fn force(&mut self, pin: u8, level: bool) {
        self.table[pin as usize].level = level;
    }
}

impl Default for SimPins {
    fn default() -> Self {
        Self::new()
    }
}

impl Pins for SimPins {
    fn set_output(&mut self, pin: u8) {
        self.table[pin as usize].output = true;
    }

    fn set_input(&mut self, pin: u8) {
        self.table[pin as usize].output = false;
    }

    fn set(&mut self, pin: u8) {
        let state = &mut self.table[pin as usize];
        if !state.level {
            state.rising_edges += 1;
        }
        state.level = true;
    }

    fn reset(&mut self, pin: u8) {
        self.table[pin as usize].level = false;
    }

    fn get(&self, pin: u8) -> bool {
        self.table[pin as usize].level
    }
}

/// ADC whose readings are set by the test or simulator; conversions finish immediately
pub struct SimAdc {
    values: [u16; 256],
    started: Option<u8>,
}

impl SimAdc {
    pub fn new() -> Self {
        SimAdc {
            values: [0; 256],
            started: None,
        }
    }

    pub fn set(&mut self, pin: u8, value: u16) {
        self.values[pin as usize] = value;
    }
}

impl Default for SimAdc {
    fn default() -> Self {
        Self::new()
    }
}

impl Adc for SimAdc {
    fn start(&mut self, pin: u8) {
        self.started = Some(pin);
    }

    fn ready(&self, pin: u8) -> bool {
        self.started == Some(pin)
    }

    fn get(&mut self, pin: u8) -> u16 {
        self.started = None;
        self.values[pin as usize]
    }
}

/// Manually advanced clock
#[derive(Debug, Default)]
pub struct SimClock {
    now: Cell<u32>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, micros: u32) {
        self.now.set(self.now.get().wrapping_add(micros));
    }
}

impl Clock for SimClock {
    fn micros(&self) -> u32 {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_rising_edges_only() {
        let mut pins = SimPins::new();
        pins.set(3);
        pins.set(3);
        pins.reset(3);
        pins.set(3);
        assert_eq!(pins.rising_edges(3), 2);
    }

    #[test]
    fn adc_reports_after_start() {
        let mut adc = SimAdc::new();
        adc.set(1, 512);
        assert!(!adc.ready(1));
        adc.start(1);
        assert!(adc.ready(1));
        assert_eq!(adc.get(1), 512);
    }

    #[test]
    fn clock_wraps() {
        let clock = SimClock::new();
        clock.advance(u32::MAX);
        clock.advance(2_000);
        assert_eq!(clock.millis(), 1);
    }
}
