use super::{Geometry, Infeasible};
use crate::space::MAX_MOTORS;
use crate::store::{read_u8, write_u8, Store, StoreError};

/// A motor in some space, by index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotorRef {
    pub space: u8,
    pub motor: u8,
}

/// Space without axes whose motors copy motors of other spaces
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Follower {
    leaders: [MotorRef; MAX_MOTORS],
    count: usize,
}

impl Follower {
    pub fn new(count: usize) -> Self {
        Follower {
            leaders: [MotorRef::default(); MAX_MOTORS],
            count: count.min(MAX_MOTORS),
        }
    }

    pub fn set_leader(&mut self, motor: usize, leader: MotorRef) {
        if motor < self.count {
            self.leaders[motor] = leader;
        }
    }

    /// Resolves the motor that `motor` mirrors
    ///
    /// `motor_counts[s]` is the number of motors in space `s`; references that do not name an
    /// existing motor resolve to `None`.
    pub fn follow(&self, motor: usize, motor_counts: &[usize]) -> Option<(usize, usize)> {
        if motor >= self.count {
            return None;
        }
        let leader = self.leaders[motor];
        let (space, leader_motor) = (leader.space as usize, leader.motor as usize);
        let count = *motor_counts.get(space)?;
        (leader_motor < count).then_some((space, leader_motor))
    }
}

impl Geometry for Follower {
    /// Followers have no axes; the planner copies leader positions instead of calling this
    fn xyz2motors(&self, _axes: &[f64], _motors: &mut [f64]) {
        panic!("xyz2motors called on a follower space");
    }

    fn motors2xyz(&self, _motors: &[f64], _axes: &mut [f64]) -> Result<(), Infeasible> {
        panic!("motors2xyz called on a follower space");
    }

    fn check_position(&self, _axes: &mut [f64]) -> bool {
        true
    }

    fn load(&mut self, store: &impl Store, addr: &mut usize) -> Result<(), StoreError> {
        for leader in self.leaders[..self.count].iter_mut() {
            leader.space = read_u8(store, addr)?;
            leader.motor = read_u8(store, addr)?;
        }
        Ok(())
    }

    fn save(&self, store: &mut impl Store, addr: &mut usize) -> Result<(), StoreError> {
        for leader in self.leaders[..self.count].iter() {
            write_u8(store, addr, leader.space)?;
            write_u8(store, addr, leader.motor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follow_checks_the_range() {
        let mut follower = Follower::new(2);
        follower.set_leader(0, MotorRef { space: 0, motor: 1 });
        follower.set_leader(1, MotorRef { space: 3, motor: 0 });
        assert_eq!(follower.follow(0, &[2, 1]), Some((0, 1)));
        assert_eq!(follower.follow(1, &[2, 1]), None);
        assert_eq!(follower.follow(2, &[2, 1]), None);
    }

    #[test]
    #[should_panic(expected = "follower")]
    fn forward_geometry_is_fatal() {
        Follower::new(1).xyz2motors(&[], &mut [0.0]);
    }

    #[test]
    #[should_panic(expected = "follower")]
    fn inverse_geometry_is_fatal() {
        let _ = Follower::new(1).motors2xyz(&[0.0], &mut []);
    }
}
