//! The real-time tick: executes fragments one sample at a time

use crate::fragment::{Fragment, FragmentQueue, MAX_MOTORS_TOTAL};
use crate::hal::{Pin, Pins};
use crate::hwc::HwcReply;
use crate::ring::Ring;
use log::warn;

pub const EVENT_QUEUE_LENGTH: usize = 16;

/// Pins of one motor as seen by the tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepperMotor {
    pub step: Pin,
    pub dir: Pin,
    pub enable: Pin,
    pub limit_min: Pin,
    pub limit_max: Pin,
    pub sense: Pin,
}

impl StepperMotor {
    pub fn setup_pins(&self, pins: &mut impl Pins) {
        self.step.make_output(pins);
        self.dir.make_output(pins);
        self.enable.make_output(pins);
        self.limit_min.make_input(pins);
        self.limit_max.make_input(pins);
        self.sense.make_input(pins);
    }
}

#[derive(Debug, Clone, Copy)]
struct Current {
    fragment: Fragment,
    sample: usize,
}

/// Step generator state
///
/// Positions are in steps since the last reset of the tick. Events produced inside the tick are
/// queued and drained by the main loop with [`Stepper::pop_event`].
pub struct Stepper {
    motors: [StepperMotor; MAX_MOTORS_TOTAL],
    positions: [i32; MAX_MOTORS_TOTAL],
    sense_state: [bool; MAX_MOTORS_TOTAL],
    count: usize,
    current: Option<Current>,
    running: bool,
    paused: bool,
    flushed: u32,
    /// A limit that found the event queue full; it is never dropped
    limit_hit: Option<HwcReply>,
    events: Ring<HwcReply, EVENT_QUEUE_LENGTH>,
}

impl Default for Stepper {
    fn default() -> Self {
        Self::new()
    }
}

impl Stepper {
    pub const fn new() -> Self {
        Stepper {
            motors: [StepperMotor {
                step: Pin::NONE,
                dir: Pin::NONE,
                enable: Pin::NONE,
                limit_min: Pin::NONE,
                limit_max: Pin::NONE,
                sense: Pin::NONE,
            }; MAX_MOTORS_TOTAL],
            positions: [0; MAX_MOTORS_TOTAL],
            sense_state: [false; MAX_MOTORS_TOTAL],
            count: 0,
            current: None,
            running: false,
            paused: false,
            flushed: 0,
            limit_hit: None,
            events: Ring::new(),
        }
    }

    pub fn configure(&mut self, index: usize, motor: StepperMotor) {
        if index < MAX_MOTORS_TOTAL {
            self.motors[index] = motor;
            self.count = self.count.max(index + 1);
        }
    }

    /// Drops motors beyond `count`
    pub fn set_motor_count(&mut self, count: usize) {
        let count = count.min(MAX_MOTORS_TOTAL);
        for m in count..self.count {
            self.motors[m] = StepperMotor::default();
            self.positions[m] = 0;
        }
        self.count = count;
    }

    pub fn motor_count(&self) -> usize {
        self.count
    }

    pub fn motor(&self, index: usize) -> StepperMotor {
        self.motors[index]
    }

    pub fn position(&self, motor: usize) -> i32 {
        self.positions[motor]
    }

    pub fn positions(&self) -> &[i32] {
        &self.positions[..self.count]
    }

    pub fn set_position(&mut self, motor: usize, position: i32) {
        if motor < MAX_MOTORS_TOTAL {
            self.positions[motor] = position;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Freezes the tick in place; queued fragments are kept
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn pop_event(&mut self) -> Option<HwcReply> {
        let event = self.events.try_pop();
        if let Some(limit) = self.limit_hit.take() {
            // The freed slot goes to the parked limit before the tick can refill it.
            if let Err(full) = self.events.try_push(limit) {
                self.limit_hit = Some(full.0);
            }
        }
        event.or_else(|| self.events.try_pop())
    }

    /// Callbacks of fragments that were dropped instead of executed
    pub fn take_flushed(&mut self) -> u32 {
        core::mem::take(&mut self.flushed)
    }

    fn push_event(&mut self, event: HwcReply) {
        if let Err(full) = self.events.try_push(event) {
            match full.0 {
                HwcReply::Done(callbacks) => self.flushed += callbacks as u32,
                limit @ HwcReply::Limit { .. } => {
                    warn!("tick event queue full, parking {limit:?}");
                    self.limit_hit.get_or_insert(limit);
                }
                other => warn!("tick event queue full, dropping {other:?}"),
            }
        }
    }

    /// Stops stepping and drops all queued work
    ///
    /// Returns the callbacks of the fragment in progress, of the queue and of earlier flushes.
    pub fn abort(&mut self, queue: &FragmentQueue) -> u32 {
        let mut callbacks = self.take_flushed() + queue.clear();
        if let Some(current) = self.current.take() {
            callbacks += current.fragment.callbacks as u32;
        }
        self.running = false;
        self.paused = false;
        callbacks
    }

    fn begin(&mut self, fragment: Fragment, pins: &mut impl Pins) {
        for (motor, steps) in self.motors[..self.count]
            .iter()
            .zip(fragment.motors.iter())
            .filter(|(_, s)| s.active)
        {
            motor.dir.drive(pins, steps.positive);
        }
        self.current = Some(Current {
            fragment,
            sample: 0,
        });
        self.running = true;
    }

    /// Executes one sample
    pub fn tick(&mut self, queue: &FragmentQueue, pins: &mut impl Pins) {
        if self.paused {
            return;
        }
        if self.current.is_none() {
            match queue.pop() {
                Some(fragment) => self.begin(fragment, pins),
                None => {
                    if self.running {
                        self.running = false;
                        self.push_event(HwcReply::Underrun);
                    }
                    return;
                }
            }
        }
        let Some(current) = self.current else {
            return;
        };
        let fragment = &current.fragment;
        let sample = current.sample;

        if sample < fragment.length as usize {
            for m in 0..self.count {
                let steps = &fragment.motors[m];
                if !steps.active || steps.steps(sample) == 0 {
                    continue;
                }
                let motor = self.motors[m];
                let limit = if steps.positive {
                    motor.limit_max
                } else {
                    motor.limit_min
                };
                if limit.is_active(pins) {
                    let mut callbacks = fragment.callbacks as u32 + queue.clear();
                    callbacks += self.take_flushed();
                    self.flushed = callbacks;
                    self.current = None;
                    self.running = false;
                    self.push_event(HwcReply::Limit {
                        motor: m as u8,
                        position: self.positions[m],
                    });
                    return;
                }
            }

            let before = self.positions;
            for m in 0..self.count {
                let steps = &fragment.motors[m];
                if !steps.active {
                    continue;
                }
                let n = steps.steps(sample);
                for _ in 0..n {
                    self.motors[m].step.pulse(pins);
                }
                let delta = n as i32;
                self.positions[m] += if steps.positive { delta } else { -delta };
            }

            for m in 0..self.count {
                let sense = self.motors[m].sense;
                if !sense.is_valid() {
                    continue;
                }
                let state = sense.is_active(pins);
                if state != self.sense_state[m] {
                    self.sense_state[m] = state;
                    self.push_event(HwcReply::Sense {
                        motor: m as u8,
                        state,
                        before: before[m],
                        after: self.positions[m],
                    });
                }
            }
        }

        let next = sample + 1;
        if next >= fragment.length as usize {
            let done = HwcReply::Done(fragment.callbacks);
            let last = fragment.last;
            self.current = None;
            self.push_event(done);
            if last {
                self.running = false;
            }
        } else if let Some(current) = self.current.as_mut() {
            current.sample = next;
        }
    }
}
