use super::{pass_through, Geometry, Infeasible};
use crate::store::{read_float, write_float, Store, StoreError};
use core::f64::consts::PI;
use libm::{atan2, cos, hypot, round, sin};

/// Radius and angle motors; further axes pass through
///
/// The angle motor is not bounded, so a target angle is unwrapped to the representation
/// closest to the current motor angle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Polar {
    /// Largest reachable radius; NaN for unbounded
    pub max_r: f64,
}

impl Default for Polar {
    fn default() -> Self {
        Polar { max_r: f64::NAN }
    }
}

/// Returns the angle equivalent to `raw` within `[previous - π, previous + π]`
pub fn unwrap_angle(raw: f64, previous: f64) -> f64 {
    if !previous.is_finite() {
        return raw;
    }
    raw + 2. * PI * round((previous - raw) / (2. * PI))
}

impl Geometry for Polar {
    fn xyz2motors(&self, axes: &[f64], motors: &mut [f64]) {
        let r = hypot(axes[0], axes[1]);
        let previous = motors[1];
        motors[0] = r;
        if r > 0. {
            motors[1] = unwrap_angle(atan2(axes[1], axes[0]), previous);
        }
        pass_through(2, axes, motors);
    }

    fn motors2xyz(&self, motors: &[f64], axes: &mut [f64]) -> Result<(), Infeasible> {
        axes[0] = motors[0] * cos(motors[1]);
        axes[1] = motors[0] * sin(motors[1]);
        pass_through(2, motors, axes);
        Ok(())
    }

    fn check_position(&self, axes: &mut [f64]) -> bool {
        let r = hypot(axes[0], axes[1]);
        if r > self.max_r {
            axes[0] *= self.max_r / r;
            axes[1] *= self.max_r / r;
            return false;
        }
        true
    }

    fn load(&mut self, store: &impl Store, addr: &mut usize) -> Result<(), StoreError> {
        self.max_r = read_float(store, addr)?;
        Ok(())
    }

    fn save(&self, store: &mut impl Store, addr: &mut usize) -> Result<(), StoreError> {
        write_float(store, addr, self.max_r)
    }
}
