use crate::hal::Pin;
use crate::kinematics::{Geometry, Kinematics};
use crate::object::Persist;
use crate::store::{
    read_float, read_u16, read_u8, write_float, write_u16, write_u8, Store, StoreError,
};
use core::ops::Range;

pub const MAX_SPACES: usize = 4;
pub const MAX_AXES: usize = 6;
pub const MAX_MOTORS: usize = 6;
/// Axes across all spaces, i.e. the GOTO position channels
pub const MAX_AXES_TOTAL: usize = MAX_SPACES * MAX_AXES;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Axis {
    /// Added to every commanded target
    pub offset: f64,
    /// Lower bound in machine coordinates; NaN for none
    pub min: f64,
    /// Upper bound in machine coordinates; NaN for none
    pub max: f64,
    /// Planned position
    pub current: f64,
    /// Position at the start of the move in progress
    pub source: f64,
    /// Last commanded target; NaN when the axis was not addressed
    pub target: f64,
}

impl Default for Axis {
    fn default() -> Self {
        Axis {
            offset: 0.,
            min: f64::NAN,
            max: f64::NAN,
            current: 0.,
            source: 0.,
            target: f64::NAN,
        }
    }
}

impl Axis {
    pub fn clamp(&self, value: f64) -> f64 {
        if value < self.min {
            self.min
        } else if value > self.max {
            self.max
        } else {
            value
        }
    }
}

impl Persist for Axis {
    fn load(&mut self, store: &impl Store, addr: &mut usize) -> Result<(), StoreError> {
        self.offset = read_float(store, addr)?;
        self.min = read_float(store, addr)?;
        self.max = read_float(store, addr)?;
        Ok(())
    }

    fn save(&self, store: &mut impl Store, addr: &mut usize) -> Result<(), StoreError> {
        write_float(store, addr, self.offset)?;
        write_float(store, addr, self.min)?;
        write_float(store, addr, self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Motor {
    pub step: Pin,
    pub dir: Pin,
    pub enable: Pin,
    pub limit_min: Pin,
    pub limit_max: Pin,
    pub sense: Pin,
    pub steps_per_unit: f64,
    /// Speed limit in units per second; NaN for none
    pub max_v: f64,
}

impl Default for Motor {
    fn default() -> Self {
        Motor {
            step: Pin::NONE,
            dir: Pin::NONE,
            enable: Pin::NONE,
            limit_min: Pin::NONE,
            limit_max: Pin::NONE,
            sense: Pin::NONE,
            steps_per_unit: 100.,
            max_v: f64::NAN,
        }
    }
}

impl Motor {
    /// Fastest speed in units per second, bounded by `max_v` and the steps a sample can hold
    pub fn speed_limit(&self, sample_time: f64, max_steps_per_sample: u8) -> f64 {
        let by_steps = max_steps_per_sample as f64 / (self.steps_per_unit.abs() * sample_time);
        if self.max_v > 0. {
            self.max_v.min(by_steps)
        } else {
            by_steps
        }
    }
}

impl Persist for Motor {
    fn load(&mut self, store: &impl Store, addr: &mut usize) -> Result<(), StoreError> {
        for pin in [
            &mut self.step,
            &mut self.dir,
            &mut self.enable,
            &mut self.limit_min,
            &mut self.limit_max,
            &mut self.sense,
        ] {
            *pin = Pin(read_u16(store, addr)?);
        }
        self.steps_per_unit = read_float(store, addr)?;
        self.max_v = read_float(store, addr)?;
        Ok(())
    }

    fn save(&self, store: &mut impl Store, addr: &mut usize) -> Result<(), StoreError> {
        for pin in [
            self.step,
            self.dir,
            self.enable,
            self.limit_min,
            self.limit_max,
            self.sense,
        ] {
            write_u16(store, addr, pin.0)?;
        }
        write_float(store, addr, self.steps_per_unit)?;
        write_float(store, addr, self.max_v)
    }
}

/// A coordinate system: one geometry with its axes and motors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Space {
    pub kinematics: Kinematics,
    pub axes: heapless::Vec<Axis, MAX_AXES>,
    pub motors: heapless::Vec<Motor, MAX_MOTORS>,
}

impl Space {
    pub fn new(kind: u8, axes: usize, motors: usize) -> Result<Self, StoreError> {
        let mut space = Space {
            kinematics: Kinematics::new(kind, axes, motors)?,
            ..Space::default()
        };
        space.reshape(axes, motors)?;
        Ok(space)
    }

    fn reshape(&mut self, axes: usize, motors: usize) -> Result<(), StoreError> {
        if axes > MAX_AXES || motors > MAX_MOTORS {
            return Err(StoreError::Invalid);
        }
        self.axes.truncate(axes);
        while self.axes.len() < axes {
            let _ = self.axes.push(Axis::default());
        }
        self.motors.truncate(motors);
        while self.motors.len() < motors {
            let _ = self.motors.push(Motor::default());
        }
        Ok(())
    }

    pub fn is_follower(&self) -> bool {
        self.kinematics.as_follower().is_some()
    }

    /// Axis positions implied by motor positions in units
    pub fn position(&self, motors: &[f64], axes: &mut [f64]) -> bool {
        if self.is_follower() {
            return false;
        }
        self.kinematics.motors2xyz(motors, axes).is_ok()
    }
}

impl Persist for Space {
    fn load(&mut self, store: &impl Store, addr: &mut usize) -> Result<(), StoreError> {
        let kind = read_u8(store, addr)?;
        let axes = read_u8(store, addr)? as usize;
        let motors = read_u8(store, addr)? as usize;
        if axes > MAX_AXES || motors > MAX_MOTORS {
            return Err(StoreError::Invalid);
        }
        let mut kinematics = Kinematics::new(kind, axes, motors)?;
        kinematics.load(store, addr)?;
        self.kinematics = kinematics;
        self.reshape(axes, motors)
    }

    fn save(&self, store: &mut impl Store, addr: &mut usize) -> Result<(), StoreError> {
        write_u8(store, addr, self.kinematics.kind())?;
        write_u8(store, addr, self.axes.len() as u8)?;
        write_u8(store, addr, self.motors.len() as u8)?;
        self.kinematics.save(store, addr)
    }
}

/// Flat numbering of axes and motors over all spaces
///
/// Axis `a` of space `s` is channel `axes(s).start + a` of a GOTO; motors are numbered the same
/// way for the fragment buffer and the tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    axis_base: [usize; MAX_SPACES + 1],
    motor_base: [usize; MAX_SPACES + 1],
    spaces: usize,
}

impl Layout {
    pub fn of(spaces: &[Space]) -> Self {
        let mut layout = Layout {
            axis_base: [0; MAX_SPACES + 1],
            motor_base: [0; MAX_SPACES + 1],
            spaces: spaces.len().min(MAX_SPACES),
        };
        for s in 0..MAX_SPACES {
            let (axes, motors) = spaces
                .get(s)
                .map_or((0, 0), |space| (space.axes.len(), space.motors.len()));
            layout.axis_base[s + 1] = layout.axis_base[s] + axes;
            layout.motor_base[s + 1] = layout.motor_base[s] + motors;
        }
        layout
    }

    pub fn axes(&self, space: usize) -> Range<usize> {
        let s = space.min(MAX_SPACES - 1);
        self.axis_base[s]..self.axis_base[s + 1]
    }

    pub fn motors(&self, space: usize) -> Range<usize> {
        let s = space.min(MAX_SPACES - 1);
        self.motor_base[s]..self.motor_base[s + 1]
    }

    pub fn axis_count(&self) -> usize {
        self.axis_base[MAX_SPACES]
    }

    pub fn motor_count(&self) -> usize {
        self.motor_base[MAX_SPACES]
    }

    pub fn motor_counts(&self) -> [usize; MAX_SPACES] {
        core::array::from_fn(|s| self.motor_base[s + 1] - self.motor_base[s])
    }

    /// Space and index within the space of a flat motor number
    pub fn locate_motor(&self, motor: usize) -> Option<(usize, usize)> {
        (0..self.spaces)
            .find(|&s| self.motors(s).contains(&motor))
            .map(|s| (s, motor - self.motor_base[s]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::kind;
    use crate::store::BufferStore;
    use approx::assert_relative_eq;

    #[test]
    fn nan_bounds_do_not_clamp() {
        let axis = Axis {
            max: 10.,
            ..Axis::default()
        };
        assert_eq!(axis.clamp(-1e9), -1e9);
        assert_eq!(axis.clamp(11.), 10.);
    }

    #[test]
    fn motor_speed_limit_honours_step_rate() {
        let motor = Motor {
            steps_per_unit: 100.,
            max_v: 1000.,
            ..Motor::default()
        };
        assert_relative_eq!(motor.speed_limit(0.001, 3), 30., epsilon = 1e-9);
        let slow = Motor {
            max_v: 5.,
            ..motor
        };
        assert_eq!(slow.speed_limit(0.001, 3), 5.);
    }

    #[test]
    fn loading_a_space_reshapes_it() {
        let polar = Space::new(kind::POLAR, 3, 3).unwrap();
        let mut store = BufferStore::new();
        polar.save(&mut store, &mut 0).unwrap();

        let mut space = Space::new(kind::CARTESIAN, 1, 1).unwrap();
        space.load(&store, &mut 0).unwrap();
        assert_eq!(space.kinematics.kind(), kind::POLAR);
        assert_eq!(space.axes.len(), 3);
        assert_eq!(space.motors.len(), 3);
    }

    #[test]
    fn layout_numbers_across_spaces() {
        let spaces = [
            Space::new(kind::CARTESIAN, 3, 3).unwrap(),
            Space::new(kind::EXTRUDER, 2, 2).unwrap(),
        ];
        let layout = Layout::of(&spaces);
        assert_eq!(layout.axes(1), 3..5);
        assert_eq!(layout.motors(2), 5..5);
        assert_eq!(layout.axis_count(), 5);
        assert_eq!(layout.motor_counts(), [3, 2, 0, 0]);
        assert_eq!(layout.locate_motor(4), Some((1, 1)));
        assert_eq!(layout.locate_motor(5), None);
    }

    #[test]
    fn bad_shapes_leave_the_space_alone() {
        let mut store = BufferStore::new();
        let mut addr = 0;
        for b in [kind::DELTA, 2, 2] {
            write_u8(&mut store, &mut addr, b).unwrap();
        }
        let mut space = Space::new(kind::CARTESIAN, 1, 1).unwrap();
        assert_eq!(space.load(&store, &mut 0), Err(StoreError::Invalid));
        assert_eq!(space.kinematics.kind(), kind::CARTESIAN);
    }
}
