use super::{pass_through, Geometry, Infeasible};
use crate::store::{read_float, write_float, Store, StoreError};
use libm::{hypot, sqrt};

/// Pen hanging from two cables; motors are the cable lengths
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Drawbot {
    pub left: [f64; 2],
    pub right: [f64; 2],
}

impl Default for Drawbot {
    fn default() -> Self {
        Drawbot {
            left: [-500., 500.],
            right: [500., 500.],
        }
    }
}

impl Geometry for Drawbot {
    fn xyz2motors(&self, axes: &[f64], motors: &mut [f64]) {
        motors[0] = hypot(axes[0] - self.left[0], axes[1] - self.left[1]);
        motors[1] = hypot(axes[0] - self.right[0], axes[1] - self.right[1]);
        pass_through(2, axes, motors);
    }

    fn motors2xyz(&self, motors: &[f64], axes: &mut [f64]) -> Result<(), Infeasible> {
        let (dx, dy) = (self.right[0] - self.left[0], self.right[1] - self.left[1]);
        let d = hypot(dx, dy);
        if !(d > 0.) {
            return Err(Infeasible);
        }
        let (r0, r1) = (motors[0], motors[1]);
        let a = (r0 * r0 - r1 * r1 + d * d) / (2. * d);
        let h2 = r0 * r0 - a * a;
        if !(h2 >= 0.) {
            return Err(Infeasible);
        }
        let h = sqrt(h2);
        let (px, py) = (self.left[0] + a * dx / d, self.left[1] + a * dy / d);
        let (ox, oy) = (-dy * h / d, dx * h / d);
        let (x, y) = if py + oy <= py - oy {
            (px + ox, py + oy)
        } else {
            (px - ox, py - oy)
        };
        axes[0] = x;
        axes[1] = y;
        pass_through(2, motors, axes);
        Ok(())
    }

    fn check_position(&self, axes: &mut [f64]) -> bool {
        let ceiling = self.left[1].min(self.right[1]);
        if axes[1] > ceiling {
            axes[1] = ceiling;
            return false;
        }
        true
    }

    fn load(&mut self, store: &impl Store, addr: &mut usize) -> Result<(), StoreError> {
        for v in self.left.iter_mut().chain(self.right.iter_mut()) {
            *v = read_float(store, addr)?;
        }
        Ok(())
    }

    fn save(&self, store: &mut impl Store, addr: &mut usize) -> Result<(), StoreError> {
        for v in self.left.iter().chain(self.right.iter()) {
            write_float(store, addr, *v)?;
        }
        Ok(())
    }
}
