//! Linear delta: three carriages on vertical towers, each tied to the effector by a rod
//!
//! Motor positions are carriage heights. Tower `i` stands at `radius` from the centre at angle
//! `angle + i * 120°`.

use super::{Geometry, Infeasible};
use crate::store::{read_float, write_float, Store, StoreError};
use core::f64::consts::PI;
use libm::{cos, hypot, sin, sqrt};

/// Offset used when sliding a target back inside the radial bound
const RADIAL_EPSILON: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tower {
    /// Lowest allowed radial projection from the tower towards the centre; NaN for `-rodlength`
    pub axis_min: f64,
    /// Largest allowed planar distance from the tower; NaN for `rodlength`
    pub axis_max: f64,
    pub rodlength: f64,
    pub radius: f64,
}

impl Default for Tower {
    fn default() -> Self {
        Tower {
            axis_min: f64::NAN,
            axis_max: f64::NAN,
            rodlength: 250.,
            radius: 125.,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Delta {
    pub towers: [Tower; 3],
    /// Angle of the first tower in degrees
    pub angle: f64,
}

impl Delta {
    fn tower_angle(&self, i: usize) -> f64 {
        (self.angle + 120. * i as f64) * PI / 180.
    }

    /// Planar position of tower `i`
    pub fn tower_position(&self, i: usize) -> (f64, f64) {
        let a = self.tower_angle(i);
        let r = self.towers[i].radius;
        (r * cos(a), r * sin(a))
    }

    fn clamp_pass(&self, x: &mut f64, y: &mut f64) -> bool {
        let mut ok = true;
        for (i, tower) in self.towers.iter().enumerate() {
            let (tx, ty) = self.tower_position(i);

            let limit = tower.axis_max.min(tower.rodlength);
            let (dx, dy) = (*x - tx, *y - ty);
            let dist = hypot(dx, dy);
            if dist > limit {
                *x = tx + dx * limit / dist;
                *y = ty + dy * limit / dist;
                ok = false;
            }

            let floor = tower.axis_min.max(-tower.rodlength);
            let a = self.tower_angle(i);
            let (ux, uy) = (-cos(a), -sin(a));
            let projection = (*x - tx) * ux + (*y - ty) * uy;
            if projection < floor {
                let shift = floor - projection + RADIAL_EPSILON;
                *x += shift * ux;
                *y += shift * uy;
                ok = false;
            }
        }
        ok
    }
}

type Vec3 = [f64; 3];

fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: Vec3, b: Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn scale(a: Vec3, k: f64) -> Vec3 {
    [a[0] * k, a[1] * k, a[2] * k]
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn norm(a: Vec3) -> f64 {
    sqrt(dot(a, a))
}

impl Geometry for Delta {
    fn xyz2motors(&self, axes: &[f64], motors: &mut [f64]) {
        for (i, tower) in self.towers.iter().enumerate() {
            let (tx, ty) = self.tower_position(i);
            let (dx, dy) = (axes[0] - tx, axes[1] - ty);
            let r2 = dx * dx + dy * dy;
            let l2 = tower.rodlength * tower.rodlength;
            motors[i] = if r2 > l2 {
                f64::NAN
            } else {
                axes[2] + sqrt(l2 - r2)
            };
        }
    }

    fn motors2xyz(&self, motors: &[f64], axes: &mut [f64]) -> Result<(), Infeasible> {
        let centre = |i: usize| {
            let (x, y) = self.tower_position(i);
            [x, y, motors[i]]
        };
        let (p1, p2, p3) = (centre(0), centre(1), centre(2));
        let r1 = self.towers[0].rodlength;
        let r2 = self.towers[1].rodlength;
        let r3 = self.towers[2].rodlength;

        let d = norm(sub(p2, p1));
        if !(d > 0.) {
            return Err(Infeasible);
        }
        let ex = scale(sub(p2, p1), 1. / d);
        let i = dot(ex, sub(p3, p1));
        let ey_raw = sub(sub(p3, p1), scale(ex, i));
        let ey_len = norm(ey_raw);
        if !(ey_len > 0.) {
            return Err(Infeasible);
        }
        let ey = scale(ey_raw, 1. / ey_len);
        let ez = cross(ex, ey);
        let j = dot(ey, sub(p3, p1));

        let x = (r1 * r1 - r2 * r2 + d * d) / (2. * d);
        let y = (r1 * r1 - r3 * r3 + i * i + j * j) / (2. * j) - i * x / j;
        let z2 = r1 * r1 - x * x - y * y;
        if !(z2 >= 0.) {
            return Err(Infeasible);
        }
        let z = sqrt(z2);

        let base = [
            p1[0] + x * ex[0] + y * ey[0],
            p1[1] + x * ex[1] + y * ey[1],
            p1[2] + x * ex[2] + y * ey[2],
        ];
        let a = [base[0] + z * ez[0], base[1] + z * ez[1], base[2] + z * ez[2]];
        let b = [base[0] - z * ez[0], base[1] - z * ez[1], base[2] - z * ez[2]];
        let lower = if a[2] <= b[2] { a } else { b };
        axes[..3].copy_from_slice(&lower);
        Ok(())
    }

    fn check_position(&self, axes: &mut [f64]) -> bool {
        let (mut x, mut y) = (axes[0], axes[1]);
        let mut accepted = true;
        for _ in 0..2 {
            if self.clamp_pass(&mut x, &mut y) {
                break;
            }
            accepted = false;
        }
        axes[0] = x;
        axes[1] = y;
        accepted
    }

    fn load(&mut self, store: &impl Store, addr: &mut usize) -> Result<(), StoreError> {
        for tower in self.towers.iter_mut() {
            tower.axis_min = read_float(store, addr)?;
            tower.axis_max = read_float(store, addr)?;
            tower.rodlength = read_float(store, addr)?;
            tower.radius = read_float(store, addr)?;
        }
        self.angle = read_float(store, addr)?;
        Ok(())
    }

    fn save(&self, store: &mut impl Store, addr: &mut usize) -> Result<(), StoreError> {
        for tower in self.towers.iter() {
            write_float(store, addr, tower.axis_min)?;
            write_float(store, addr, tower.axis_max)?;
            write_float(store, addr, tower.rodlength)?;
            write_float(store, addr, tower.radius)?;
        }
        write_float(store, addr, self.angle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn delta() -> Delta {
        Delta {
            towers: [Tower {
                rodlength: 200.,
                radius: 100.,
                ..Tower::default()
            }; 3],
            angle: 0.,
        }
    }

    #[test]
    fn target_on_rod_boundary_is_accepted() {
        // Tower 0 stands at (100, 0); (-100, 0) is exactly one rod length away.
        let mut axes = [-100., 0., 0.];
        assert!(delta().check_position(&mut axes));
        assert_eq!(axes, [-100., 0., 0.]);
    }

    #[test]
    fn target_beyond_rod_is_pulled_back() {
        let d = delta();
        let mut axes = [-100.5, 0., 0.];
        assert!(!d.check_position(&mut axes));
        let (tx, ty) = d.tower_position(0);
        assert_relative_eq!(hypot(axes[0] - tx, axes[1] - ty), 200., epsilon = 1e-9);
    }

    #[test]
    fn target_behind_tower_slides_inward() {
        let d = Delta {
            towers: [Tower {
                axis_min: -10.,
                rodlength: 200.,
                radius: 100.,
                ..Tower::default()
            }; 3],
            angle: 0.,
        };
        // 20 units behind tower 0, measured towards the centre.
        let mut axes = [120., 0., 0.];
        assert!(!d.check_position(&mut axes));
        assert_relative_eq!(axes[0], 110. - RADIAL_EPSILON, epsilon = 1e-9);
    }

    #[test]
    fn forward_inverse_round_trip() {
        let d = delta();
        for &(x, y, z) in &[(0., 0., 0.), (12.5, -30., 4.), (-60., 25., -10.), (40., 40., 80.)] {
            let mut motors = [0.; 3];
            d.xyz2motors(&[x, y, z], &mut motors);
            let mut axes = [0.; 3];
            d.motors2xyz(&motors, &mut axes).unwrap();
            assert_relative_eq!(axes[0], x, epsilon = 1e-6);
            assert_relative_eq!(axes[1], y, epsilon = 1e-6);
            assert_relative_eq!(axes[2], z, epsilon = 1e-6);

            let mut again = [0.; 3];
            d.xyz2motors(&axes, &mut again);
            for (a, m) in again.iter().zip(motors) {
                assert_relative_eq!(*a, m, max_relative = 1e-6);
            }
        }
    }

    #[test]
    fn disjoint_spheres_are_infeasible() {
        let mut axes = [0.; 3];
        assert_eq!(delta().motors2xyz(&[0., 0., 1000.], &mut axes), Err(Infeasible));
    }

    #[test]
    fn unreachable_target_yields_nan() {
        let mut motors = [0.; 3];
        delta().xyz2motors(&[-150., 0., 0.], &mut motors);
        assert!(motors[0].is_nan());
    }
}
