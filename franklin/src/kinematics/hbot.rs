use super::{pass_through, Geometry, Infeasible};
use crate::store::{Store, StoreError};

/// Two motors on a shared belt: `u = x + y`, `v = x - y`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HBot;

impl Geometry for HBot {
    fn xyz2motors(&self, axes: &[f64], motors: &mut [f64]) {
        motors[0] = axes[0] + axes[1];
        motors[1] = axes[0] - axes[1];
        pass_through(2, axes, motors);
    }

    fn motors2xyz(&self, motors: &[f64], axes: &mut [f64]) -> Result<(), Infeasible> {
        axes[0] = (motors[0] + motors[1]) / 2.;
        axes[1] = (motors[0] - motors[1]) / 2.;
        pass_through(2, motors, axes);
        Ok(())
    }

    fn check_position(&self, _axes: &mut [f64]) -> bool {
        true
    }

    fn load(&mut self, _store: &impl Store, _addr: &mut usize) -> Result<(), StoreError> {
        Ok(())
    }

    fn save(&self, _store: &mut impl Store, _addr: &mut usize) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixes_and_unmixes() {
        let mut motors = [0.; 3];
        HBot.xyz2motors(&[3., 1., 7.], &mut motors);
        assert_eq!(motors, [4., 2., 7.]);
        let mut axes = [0.; 3];
        HBot.motors2xyz(&motors, &mut axes).unwrap();
        assert_eq!(axes, [3., 1., 7.]);
    }
}
