//! Axis space to motor space transforms
//!
//! Each machine geometry implements [`Geometry`]. A space holds one [`Kinematics`] value, the
//! closed set of supported geometries, which dispatches to the variant.

mod cartesian;
mod delta;
mod drawbot;
mod extruder;
mod follower;
mod hbot;
mod polar;

pub use cartesian::Cartesian;
pub use delta::{Delta, Tower};
pub use drawbot::Drawbot;
pub use extruder::Extruder;
pub use follower::{Follower, MotorRef};
pub use hbot::HBot;
pub use polar::Polar;

use crate::store::{Store, StoreError};

/// Motor positions that correspond to no reachable point
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("position not reachable by this geometry")]
pub struct Infeasible;

/// A machine geometry
pub trait Geometry {
    /// Maps axis positions to motor positions in units
    ///
    /// On entry `motors` holds the current motor positions, which geometries with periodic
    /// coordinates use to stay continuous. A motor that cannot reach the target becomes NaN.
    fn xyz2motors(&self, axes: &[f64], motors: &mut [f64]);

    /// Maps motor positions back to axis positions
    fn motors2xyz(&self, motors: &[f64], axes: &mut [f64]) -> Result<(), Infeasible>;

    /// Moves `axes` into the reachable region; true when nothing had to change
    fn check_position(&self, axes: &mut [f64]) -> bool;

    fn load(&mut self, store: &impl Store, addr: &mut usize) -> Result<(), StoreError>;

    fn save(&self, store: &mut impl Store, addr: &mut usize) -> Result<(), StoreError>;
}

/// Kind byte of each geometry in settings images
pub mod kind {
    pub const CARTESIAN: u8 = 0;
    pub const DELTA: u8 = 1;
    pub const POLAR: u8 = 2;
    pub const HBOT: u8 = 3;
    pub const DRAWBOT: u8 = 4;
    pub const EXTRUDER: u8 = 5;
    pub const FOLLOWER: u8 = 6;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kinematics {
    Cartesian(Cartesian),
    Delta(Delta),
    Polar(Polar),
    HBot(HBot),
    Drawbot(Drawbot),
    Extruder(Extruder),
    Follower(Follower),
}

macro_rules! dispatch {
    ( $self:expr, $g:ident => $body:expr ) => {
        match $self {
            Kinematics::Cartesian($g) => $body,
            Kinematics::Delta($g) => $body,
            Kinematics::Polar($g) => $body,
            Kinematics::HBot($g) => $body,
            Kinematics::Drawbot($g) => $body,
            Kinematics::Extruder($g) => $body,
            Kinematics::Follower($g) => $body,
        }
    };
}

impl Kinematics {
    /// Default geometry of `kind`, checked against the space shape
    pub fn new(kind: u8, axes: usize, motors: usize) -> Result<Self, StoreError> {
        let same = axes == motors;
        let k = match kind {
            kind::CARTESIAN if same => Kinematics::Cartesian(Cartesian),
            kind::DELTA if same && axes == 3 => Kinematics::Delta(Delta::default()),
            kind::POLAR if same && axes >= 2 => Kinematics::Polar(Polar::default()),
            kind::HBOT if same && axes >= 2 => Kinematics::HBot(HBot),
            kind::DRAWBOT if same && axes >= 2 => Kinematics::Drawbot(Drawbot::default()),
            kind::EXTRUDER if same => Kinematics::Extruder(Extruder::new(axes)),
            kind::FOLLOWER if axes == 0 => Kinematics::Follower(Follower::new(motors)),
            _ => return Err(StoreError::Invalid),
        };
        Ok(k)
    }

    pub fn kind(&self) -> u8 {
        match self {
            Kinematics::Cartesian(_) => kind::CARTESIAN,
            Kinematics::Delta(_) => kind::DELTA,
            Kinematics::Polar(_) => kind::POLAR,
            Kinematics::HBot(_) => kind::HBOT,
            Kinematics::Drawbot(_) => kind::DRAWBOT,
            Kinematics::Extruder(_) => kind::EXTRUDER,
            Kinematics::Follower(_) => kind::FOLLOWER,
        }
    }

    pub fn as_follower(&self) -> Option<&Follower> {
        match self {
            Kinematics::Follower(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_extruder(&self) -> Option<&Extruder> {
        match self {
            Kinematics::Extruder(e) => Some(e),
            _ => None,
        }
    }
}

impl Default for Kinematics {
    fn default() -> Self {
        Kinematics::Cartesian(Cartesian)
    }
}

impl Geometry for Kinematics {
    fn xyz2motors(&self, axes: &[f64], motors: &mut [f64]) {
        dispatch!(self, g => g.xyz2motors(axes, motors))
    }

    fn motors2xyz(&self, motors: &[f64], axes: &mut [f64]) -> Result<(), Infeasible> {
        dispatch!(self, g => g.motors2xyz(motors, axes))
    }

    fn check_position(&self, axes: &mut [f64]) -> bool {
        dispatch!(self, g => g.check_position(axes))
    }

    fn load(&mut self, store: &impl Store, addr: &mut usize) -> Result<(), StoreError> {
        dispatch!(self, g => g.load(store, addr))
    }

    fn save(&self, store: &mut impl Store, addr: &mut usize) -> Result<(), StoreError> {
        dispatch!(self, g => g.save(store, addr))
    }
}

/// Copies the axes beyond `from` straight to the motors
pub(crate) fn pass_through(from: usize, src: &[f64], dst: &mut [f64]) {
    for (d, s) in dst.iter_mut().zip(src).skip(from) {
        *d = *s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_are_checked() {
        assert!(Kinematics::new(kind::DELTA, 3, 3).is_ok());
        assert_eq!(Kinematics::new(kind::DELTA, 2, 2), Err(StoreError::Invalid));
        assert_eq!(Kinematics::new(kind::FOLLOWER, 1, 1), Err(StoreError::Invalid));
        assert_eq!(Kinematics::new(9, 1, 1), Err(StoreError::Invalid));
        assert_eq!(
            Kinematics::new(kind::HBOT, 3, 3).map(|k| k.kind()),
            Ok(kind::HBOT)
        );
    }
}
