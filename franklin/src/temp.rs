//! Thermistor sampling and bang-bang heater control

use crate::hal::{Adc, Pin, Pins};
use crate::object::Persist;
use crate::store::{read_float, read_u16, write_float, write_u16, Store, StoreError};
use libm::log;

pub const MAX_TEMPS: usize = 4;
/// Full-scale reading of the ADC
pub const ADC_MAX: u16 = 1023;

const KELVIN: f64 = 273.15;

/// A heater with its thermistor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Temp {
    pub power_pin: Pin,
    pub thermistor_pin: Pin,
    pub beta: f64,
    /// Calibration temperature in °C
    pub t0: f64,
    /// ADC reading at `t0`
    pub adc0: f64,
    /// Setpoint in °C; NaN or non-positive switches the heater off
    pub target: f64,
    pub min_alarm: f64,
    pub max_alarm: f64,
    pub alarm_armed: bool,
    pub heater_on: bool,
    /// Last measured temperature, NaN before the first sample
    pub last: f64,
}

impl Default for Temp {
    fn default() -> Self {
        Temp {
            power_pin: Pin::NONE,
            thermistor_pin: Pin::NONE,
            beta: 3950.,
            t0: 25.,
            adc0: 512.,
            target: f64::NAN,
            min_alarm: f64::NAN,
            max_alarm: f64::NAN,
            alarm_armed: false,
            heater_on: false,
            last: f64::NAN,
        }
    }
}

impl Temp {
    /// Converts a raw reading to °C; rails and missing calibration give NaN
    pub fn to_celsius(&self, adc: u16) -> f64 {
        let max = ADC_MAX as f64;
        let adc = adc as f64;
        if !(adc > 0. && adc < max && self.adc0 > 0. && self.adc0 < max && self.beta != 0.) {
            return f64::NAN;
        }
        let ratio = (adc / (max - adc)) / (self.adc0 / (max - self.adc0));
        1. / (1. / (self.t0 + KELVIN) + log(ratio) / self.beta) - KELVIN
    }

    /// Arms a one-shot alarm for the window `[min, max]`; NaN bounds are open
    pub fn arm_alarm(&mut self, min: f64, max: f64) {
        self.min_alarm = min;
        self.max_alarm = max;
        self.alarm_armed = true;
    }

    fn in_window(&self, value: f64) -> bool {
        !value.is_nan() && !(value < self.min_alarm) && !(value > self.max_alarm)
    }

    /// Records a new reading and updates the heater
    ///
    /// Returns true when an armed alarm fired; the alarm is then disarmed.
    pub fn update(&mut self, adc: u16, pins: &mut impl Pins) -> bool {
        self.last = self.to_celsius(adc);
        let heat = self.target > 0. && self.last < self.target;
        if heat != self.heater_on {
            log::debug!("heater {}", if heat { "on" } else { "off" });
        }
        self.heater_on = heat;
        self.power_pin.drive(pins, heat);

        if self.alarm_armed && self.in_window(self.last) {
            self.alarm_armed = false;
            return true;
        }
        false
    }

    pub fn set_target(&mut self, target: f64, pins: &mut impl Pins) {
        self.target = target;
        if !(target > 0.) {
            self.heater_on = false;
            self.power_pin.drive(pins, false);
        }
    }
}

impl Persist for Temp {
    fn load(&mut self, store: &impl Store, addr: &mut usize) -> Result<(), StoreError> {
        self.power_pin = Pin(read_u16(store, addr)?);
        self.thermistor_pin = Pin(read_u16(store, addr)?);
        self.beta = read_float(store, addr)?;
        self.t0 = read_float(store, addr)?;
        self.adc0 = read_float(store, addr)?;
        Ok(())
    }

    fn save(&self, store: &mut impl Store, addr: &mut usize) -> Result<(), StoreError> {
        write_u16(store, addr, self.power_pin.0)?;
        write_u16(store, addr, self.thermistor_pin.0)?;
        write_float(store, addr, self.beta)?;
        write_float(store, addr, self.t0)?;
        write_float(store, addr, self.adc0)
    }
}

/// Round-robin sampler, one conversion in flight at a time
#[derive(Debug, Default)]
pub struct TempSampler {
    current: usize,
    converting: bool,
}

impl TempSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances sampling; returns the index of a temp whose alarm fired
    pub fn poll(
        &mut self,
        temps: &mut [Temp],
        adc: &mut impl Adc,
        pins: &mut impl Pins,
    ) -> Option<usize> {
        if temps.is_empty() {
            return None;
        }
        if self.current >= temps.len() {
            self.current = 0;
            self.converting = false;
        }
        let index = self.current;
        let pin = temps[index].thermistor_pin;
        if !pin.is_valid() {
            self.current = (index + 1) % temps.len();
            return None;
        }
        if !self.converting {
            adc.start(pin.number());
            self.converting = true;
            return None;
        }
        if !adc.ready(pin.number()) {
            return None;
        }
        let value = adc.get(pin.number());
        self.converting = false;
        self.current = (index + 1) % temps.len();
        temps[index].update(value, pins).then_some(index)
    }
}
