use super::{pass_through, Geometry, Infeasible};
use crate::store::{Store, StoreError};

/// One motor per axis
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Cartesian;

impl Geometry for Cartesian {
    fn xyz2motors(&self, axes: &[f64], motors: &mut [f64]) {
        pass_through(0, axes, motors);
    }

    fn motors2xyz(&self, motors: &[f64], axes: &mut [f64]) -> Result<(), Infeasible> {
        pass_through(0, motors, axes);
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
