use super::{pass_through, Geometry, Infeasible};
use crate::space::MAX_AXES;
use crate::store::{read_float, write_float, Store, StoreError};

/// One axis and motor per extruder, each with a nozzle offset
///
/// The offset of the selected tool is added to the first three axes of space 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extruder {
    offsets: [[f64; 3]; MAX_AXES],
    count: usize,
}

impl Extruder {
    pub fn new(count: usize) -> Self {
        Extruder {
            offsets: [[0.; 3]; MAX_AXES],
            count: count.min(MAX_AXES),
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn offset(&self, extruder: usize) -> Option<[f64; 3]> {
        (extruder < self.count).then(|| self.offsets[extruder])
    }

    pub fn set_offset(&mut self, extruder: usize, offset: [f64; 3]) {
        if extruder < self.count {
            self.offsets[extruder] = offset;
        }
    }
}

impl Geometry for Extruder {
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

    fn load(&mut self, store: &impl Store, addr: &mut usize) -> Result<(), StoreError> {
        for offset in self.offsets[..self.count].iter_mut() {
            for v in offset.iter_mut() {
                *v = read_float(store, addr)?;
            }
        }
        Ok(())
    }

    fn save(&self, store: &mut impl Store, addr: &mut usize) -> Result<(), StoreError> {
        for offset in self.offsets[..self.count].iter() {
            for v in offset {
                write_float(store, addr, *v)?;
            }
        }
        Ok(())
    }
}
