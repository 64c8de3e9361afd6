//! Persisted objects and settings images
//!
//! An image is `header, space count, temp count`, then for every space the space itself, its
//! axes and its motors, then every temp. Each object writes its own fields in a fixed order.

use crate::protocol::ObjectId;
use crate::space::{Axis, Motor, Space, MAX_AXES, MAX_MOTORS, MAX_SPACES};
use crate::store::{self, Store, StoreError};
use crate::temp::{Temp, MAX_TEMPS};

/// Load and save against a byte store
pub trait Persist {
    fn load(&mut self, store: &impl Store, addr: &mut usize) -> Result<(), StoreError>;
    fn save(&self, store: &mut impl Store, addr: &mut usize) -> Result<(), StoreError>;
}

/// A single object of the machine registry
pub enum Object<'a> {
    Space(&'a mut Space),
    Axis(&'a mut Axis),
    Motor(&'a mut Motor),
    Temp(&'a mut Temp),
}

impl Object<'_> {
    pub fn load(&mut self, store: &impl Store, addr: &mut usize) -> Result<(), StoreError> {
        match self {
            Object::Space(o) => o.load(store, addr),
            Object::Axis(o) => o.load(store, addr),
            Object::Motor(o) => o.load(store, addr),
            Object::Temp(o) => o.load(store, addr),
        }
    }

    pub fn save(&self, store: &mut impl Store, addr: &mut usize) -> Result<(), StoreError> {
        match self {
            Object::Space(o) => o.save(store, addr),
            Object::Axis(o) => o.save(store, addr),
            Object::Motor(o) => o.save(store, addr),
            Object::Temp(o) => o.save(store, addr),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SpaceLayout {
    at: usize,
    axes: [usize; MAX_AXES],
    motors: [usize; MAX_MOTORS],
}

/// Contents of a settings image together with the address of every object
#[derive(Debug, Clone, Default)]
pub struct Image {
    pub spaces: heapless::Vec<Space, MAX_SPACES>,
    pub temps: heapless::Vec<Temp, MAX_TEMPS>,
    space_layout: [SpaceLayout; MAX_SPACES],
    temp_layout: [usize; MAX_TEMPS],
}

impl Image {
    pub fn read(store: &impl Store) -> Result<Self, StoreError> {
        let mut addr = 0;
        store::check_header(store, &mut addr)?;
        let spaces = store::read_u8(store, &mut addr)? as usize;
        let temps = store::read_u8(store, &mut addr)? as usize;
        if spaces > MAX_SPACES || temps > MAX_TEMPS {
            return Err(StoreError::Invalid);
        }

        let mut image = Image::default();
        for s in 0..spaces {
            let layout = &mut image.space_layout[s];
            let mut space = Space::default();
            layout.at = addr;
            space.load(store, &mut addr)?;
            for (a, axis) in space.axes.iter_mut().enumerate() {
                layout.axes[a] = addr;
                axis.load(store, &mut addr)?;
            }
            for (m, motor) in space.motors.iter_mut().enumerate() {
                layout.motors[m] = addr;
                motor.load(store, &mut addr)?;
            }
            image
                .spaces
                .push(space)
                .map_err(|_| StoreError::Invalid)?;
        }
        for t in 0..temps {
            image.temp_layout[t] = addr;
            let mut temp = Temp::default();
            temp.load(store, &mut addr)?;
            image.temps.push(temp).map_err(|_| StoreError::Invalid)?;
        }
        Ok(image)
    }

    /// Writes a complete image
    pub fn write(spaces: &[Space], temps: &[Temp], store: &mut impl Store) -> Result<(), StoreError> {
        let mut addr = 0;
        store::write_header(store, &mut addr)?;
        store::write_u8(store, &mut addr, spaces.len() as u8)?;
        store::write_u8(store, &mut addr, temps.len() as u8)?;
        for space in spaces {
            space.save(store, &mut addr)?;
            for axis in space.axes.iter() {
                axis.save(store, &mut addr)?;
            }
            for motor in space.motors.iter() {
                motor.save(store, &mut addr)?;
            }
        }
        for temp in temps {
            temp.save(store, &mut addr)?;
        }
        Ok(())
    }

    /// Address of a fixed-size object within the image
    ///
    /// Spaces are variable in size and have no stable address.
    pub fn address(&self, id: ObjectId) -> Option<usize> {
        match id {
            ObjectId::Axis { space, axis } => {
                let s = self.spaces.get(space as usize)?;
                (usize::from(axis) < s.axes.len())
                    .then(|| self.space_layout[space as usize].axes[axis as usize])
            }
            ObjectId::Motor { space, motor } => {
                let s = self.spaces.get(space as usize)?;
                (usize::from(motor) < s.motors.len())
                    .then(|| self.space_layout[space as usize].motors[motor as usize])
            }
            ObjectId::Temp(t) => {
                (usize::from(t) < self.temps.len()).then(|| self.temp_layout[t as usize])
            }
            ObjectId::Space(_) | ObjectId::All => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::Pin;
    use crate::kinematics::kind;
    use crate::store::MemoryStore;

    fn machine() -> (heapless::Vec<Space, MAX_SPACES>, heapless::Vec<Temp, MAX_TEMPS>) {
        let mut spaces = heapless::Vec::new();
        let mut xy = Space::new(kind::CARTESIAN, 2, 2).unwrap();
        xy.motors[1].steps_per_unit = 80.;
        xy.motors[1].step = Pin::new(5, false);
        xy.axes[0].max = 200.;
        spaces.push(xy).unwrap();
        spaces.push(Space::new(kind::DELTA, 3, 3).unwrap()).unwrap();
        let mut temps = heapless::Vec::new();
        temps
            .push(Temp {
                beta: 3950.,
                ..Temp::default()
            })
            .unwrap();
        (spaces, temps)
    }

    #[test]
    fn image_round_trip() {
        let (spaces, temps) = machine();
        let mut store = MemoryStore::<512>::new();
        Image::write(&spaces, &temps, &mut store).unwrap();

        let image = Image::read(&store).unwrap();
        assert_eq!(image.spaces.len(), 2);
        assert_eq!(image.spaces[0].motors[1].steps_per_unit, 80.);
        assert_eq!(image.spaces[0].motors[1].step, Pin::new(5, false));
        assert_eq!(image.spaces[0].axes[0].max, 200.);
        assert!(image.spaces[0].axes[0].min.is_nan());
        assert_eq!(image.spaces[1].kinematics.kind(), kind::DELTA);
        assert_eq!(image.temps.len(), 1);
        assert_eq!(image.temps[0].beta, 3950.);
    }

    #[test]
    fn fixed_objects_can_be_rewritten_in_place() {
        let (mut spaces, temps) = machine();
        let mut store = MemoryStore::<512>::new();
        Image::write(&spaces, &temps, &mut store).unwrap();

        let image = Image::read(&store).unwrap();
        let id = ObjectId::Motor { space: 1, motor: 2 };
        let mut addr = image.address(id).unwrap();
        spaces[1].motors[2].max_v = 42.;
        Object::Motor(&mut spaces[1].motors[2])
            .save(&mut store, &mut addr)
            .unwrap();

        let image = Image::read(&store).unwrap();
        assert_eq!(image.spaces[1].motors[2].max_v, 42.);
        assert_eq!(image.address(ObjectId::Motor { space: 1, motor: 3 }), None);
    }

    #[test]
    fn erased_store_is_rejected() {
        let store = MemoryStore::<64>::new();
        assert_eq!(Image::read(&store).err(), Some(StoreError::BadHeader));
    }
}
