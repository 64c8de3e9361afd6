//! Step fragments and the queue handing them to the real-time tick
//!
//! A fragment covers up to [`SAMPLES_PER_FRAGMENT`] tick periods. For every motor it stores a
//! direction, an active flag and 2 bits per sample giving the number of step pulses (0..=3) to
//! emit in that sample.

use crate::ring::{Full, Ring};
use core::cell::RefCell;
use critical_section::Mutex;

pub const SAMPLES_PER_FRAGMENT: usize = 64;
pub const BYTES_PER_FRAGMENT: usize = SAMPLES_PER_FRAGMENT / 4;
pub const FRAGMENTS_PER_BUFFER: usize = 8;
/// Most step pulses a motor can take in one sample
pub const MAX_STEPS_PER_SAMPLE: u8 = 3;
/// Motors across all spaces
pub const MAX_MOTORS_TOTAL: usize = 12;

/// Step data of one motor within a fragment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotorSteps {
    pub active: bool,
    pub positive: bool,
    pub data: [u8; BYTES_PER_FRAGMENT],
}

impl MotorSteps {
    pub fn steps(&self, sample: usize) -> u8 {
        (self.data[sample / 4] >> ((sample % 4) * 2)) & 0x3
    }

    pub fn set_steps(&mut self, sample: usize, steps: u8) {
        let shift = (sample % 4) * 2;
        let byte = &mut self.data[sample / 4];
        *byte = (*byte & !(0x3 << shift)) | ((steps.min(MAX_STEPS_PER_SAMPLE)) << shift);
    }

    /// Steps over the whole fragment
    pub fn total(&self) -> u32 {
        self.data
            .iter()
            .map(|b| (0..4).map(|i| ((b >> (i * 2)) & 0x3) as u32).sum::<u32>())
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// Samples in use
    pub length: u8,
    /// Completion callbacks owed once the fragment has been executed
    pub callbacks: u8,
    /// No further fragment follows; running out after this one is not an underrun
    pub last: bool,
    pub motors: [MotorSteps; MAX_MOTORS_TOTAL],
}

impl Fragment {
    pub const fn new() -> Self {
        Fragment {
            length: 0,
            callbacks: 0,
            last: false,
            motors: [MotorSteps {
                active: false,
                positive: false,
                data: [0; BYTES_PER_FRAGMENT],
            }; MAX_MOTORS_TOTAL],
        }
    }

    pub fn active_count(&self) -> usize {
        self.motors.iter().filter(|m| m.active).count()
    }

    pub fn is_full(&self) -> bool {
        self.length as usize >= SAMPLES_PER_FRAGMENT
    }

    pub fn clear(&mut self) {
        *self = Fragment::new();
    }
}

impl Default for Fragment {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-producer single-consumer fragment ring
///
/// The planner pushes from the main loop while the tick pops from the timer interrupt; each
/// handoff runs inside a critical section so a slot changes owner atomically.
pub struct FragmentQueue {
    ring: Mutex<RefCell<Ring<Fragment, FRAGMENTS_PER_BUFFER>>>,
}

impl FragmentQueue {
    pub const fn new() -> Self {
        FragmentQueue {
            ring: Mutex::new(RefCell::new(Ring::new())),
        }
    }

    pub fn push(&self, fragment: Fragment) -> Result<(), Full<Fragment>> {
        critical_section::with(|cs| self.ring.borrow_ref_mut(cs).try_push(fragment))
    }

    pub fn pop(&self) -> Option<Fragment> {
        critical_section::with(|cs| self.ring.borrow_ref_mut(cs).try_pop())
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.ring.borrow_ref(cs).len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        critical_section::with(|cs| self.ring.borrow_ref(cs).is_full())
    }

    /// Drops every queued fragment, returning the callbacks they carried
    pub fn clear(&self) -> u32 {
        critical_section::with(|cs| {
            let mut ring = self.ring.borrow_ref_mut(cs);
            let callbacks = ring.iter().map(|f| f.callbacks as u32).sum();
            ring.clear();
            callbacks
        })
    }
}

impl Default for FragmentQueue {
    fn default() -> Self {
        Self::new()
    }
}
