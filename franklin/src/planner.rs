//! Move queue and sample-by-sample motion planning
//!
//! Moves arrive as axis targets with a start and an end rate. [`Planner::fill`] turns the queue
//! into step fragments: every sample the axes are interpolated along the move, mapped through the
//! geometry of their space and rounded to whole steps. Mapping every sample keeps non-linear
//! geometries on a straight path.

use crate::fragment::{Fragment, MAX_MOTORS_TOTAL, MAX_STEPS_PER_SAMPLE};
use crate::kinematics::Geometry;
use crate::protocol::{Channels, CHANNEL_F0, CHANNEL_F1, RATE_CHANNELS};
use crate::ring::Ring;
use crate::space::{Layout, Space, MAX_AXES, MAX_AXES_TOTAL, MAX_MOTORS};
use libm::round;
use log::debug;

pub const MOVE_QUEUE_LENGTH: usize = 16;
/// Rate of a move that names none, in moves per second
pub const DEFAULT_RATE: f64 = 1.0;
/// Seconds per sample
pub const DEFAULT_SAMPLE_TIME: f64 = 0.001;

/// The move was refused; nothing changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("move refused")]
pub struct Stall;

/// Queue state after an accepted move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Ready,
    /// The move took the last slot
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Move {
    /// Rate at the start, in moves per second
    pub f0: f64,
    /// Rate at the end
    pub f1: f64,
    /// Target of every axis over all spaces; NaN keeps the axis where it is
    pub targets: [f64; MAX_AXES_TOTAL],
    /// Report completion with MOVECB
    pub callback: bool,
}

impl Move {
    pub fn new(f0: f64, f1: f64, targets: &[f64], callback: bool) -> Result<Self, Stall> {
        let f0 = if f0.is_nan() { DEFAULT_RATE } else { f0 };
        let f1 = if f1.is_nan() { f0 } else { f1 };
        if !(f0 >= 0. && f1 >= 0. && f0 + f1 > 0.) || !(f0 + f1).is_finite() {
            return Err(Stall);
        }
        let mut mv = Move {
            f0,
            f1,
            targets: [f64::NAN; MAX_AXES_TOTAL],
            callback,
        };
        for (t, v) in mv.targets.iter_mut().zip(targets) {
            *t = *v;
        }
        Ok(mv)
    }

    pub fn from_channels(channels: &Channels, callback: bool) -> Result<Self, Stall> {
        let targets = channels.values().get(RATE_CHANNELS..).unwrap_or(&[]);
        Move::new(
            channels.get(CHANNEL_F0),
            channels.get(CHANNEL_F1),
            targets,
            callback,
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveMove {
    start: [f64; MAX_AXES_TOTAL],
    end: [f64; MAX_AXES_TOTAL],
    end_steps: [i32; MAX_MOTORS_TOTAL],
    f0: f64,
    f1: f64,
    duration: f64,
    sample: u32,
    callback: bool,
}

impl ActiveMove {
    /// Fraction of the move covered at `t`
    fn fraction(&self, t: f64) -> f64 {
        let s = self.f0 * t + (self.f1 - self.f0) * t * t / (2. * self.duration);
        s.clamp(0., 1.)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Run {
    space: usize,
    axis: usize,
    speed: f64,
}

/// Produces fragments from queued moves
pub struct Planner {
    queue: Ring<Move, MOVE_QUEUE_LENGTH>,
    active: Option<ActiveMove>,
    run: Option<Run>,
    planned: [i32; MAX_MOTORS_TOTAL],
    sample_time: f64,
    tool_offset: [f64; 3],
    in_motion: bool,
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}

fn current_axes(spaces: &[Space]) -> [f64; MAX_AXES_TOTAL] {
    let mut axes = [f64::NAN; MAX_AXES_TOTAL];
    for (v, axis) in axes.iter_mut().zip(spaces.iter().flat_map(|s| s.axes.iter())) {
        *v = axis.current;
    }
    axes
}

impl Planner {
    pub fn new() -> Self {
        Planner {
            queue: Ring::new(),
            active: None,
            run: None,
            planned: [0; MAX_MOTORS_TOTAL],
            sample_time: DEFAULT_SAMPLE_TIME,
            tool_offset: [0.; 3],
            in_motion: false,
        }
    }

    pub fn sample_time(&self) -> f64 {
        self.sample_time
    }

    pub fn set_sample_time(&mut self, seconds: f64) {
        if seconds > 0. {
            self.sample_time = seconds;
        }
    }

    /// Offset of the selected tool, added to the first three axes of space 0
    pub fn set_tool_offset(&mut self, offset: [f64; 3]) {
        self.tool_offset = offset;
    }

    pub fn tool_offset(&self) -> [f64; 3] {
        self.tool_offset
    }

    /// Steps committed to fragments so far, per motor
    pub fn planned(&self) -> &[i32] {
        &self.planned
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    /// A move is queued or in progress; a constant-speed run does not count
    pub fn has_moves(&self) -> bool {
        !self.queue.is_empty() || self.active.is_some()
    }

    /// Nothing queued, nothing moving
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.active.is_none() && self.run.is_none()
    }

    pub fn enqueue(&mut self, mv: Move) -> Result<QueueState, Stall> {
        self.queue.try_push(mv).map_err(|_| Stall)?;
        self.run = None;
        Ok(if self.queue.is_full() {
            QueueState::Full
        } else {
            QueueState::Ready
        })
    }

    /// Moves one axis at constant speed until it reaches a bound or a move is queued
    ///
    /// A speed of zero stops the run.
    pub fn run(&mut self, space: usize, axis: usize, speed: f64) {
        self.run = (speed != 0. && speed.is_finite()).then_some(Run { space, axis, speed });
    }

    /// Step targets of every motor for the axis positions `axes`
    fn motor_steps(
        &self,
        spaces: &[Space],
        layout: &Layout,
        axes: &[f64; MAX_AXES_TOTAL],
    ) -> [i32; MAX_MOTORS_TOTAL] {
        let mut units = [f64::NAN; MAX_MOTORS_TOTAL];
        let motors = || spaces.iter().flat_map(|s| s.motors.iter()).take(MAX_MOTORS_TOTAL);
        for ((u, motor), &steps) in units.iter_mut().zip(motors()).zip(&self.planned) {
            *u = steps as f64 / motor.steps_per_unit;
        }

        for (s, space) in spaces.iter().enumerate() {
            let range = layout.motors(s);
            if space.is_follower() || range.end > MAX_MOTORS_TOTAL {
                continue;
            }
            space
                .kinematics
                .xyz2motors(&axes[layout.axes(s)], &mut units[range]);
        }

        let counts = layout.motor_counts();
        for (s, space) in spaces.iter().enumerate() {
            let Some(follower) = space.kinematics.as_follower() else {
                continue;
            };
            for m in 0..space.motors.len() {
                let Some((ls, lm)) = follower.follow(m, &counts) else {
                    continue;
                };
                if spaces[ls].is_follower() {
                    continue;
                }
                let (src, dst) = (layout.motors(ls).start + lm, layout.motors(s).start + m);
                if src < MAX_MOTORS_TOTAL && dst < MAX_MOTORS_TOTAL {
                    units[dst] = units[src];
                }
            }
        }

        let mut steps = self.planned;
        for ((target, motor), u) in steps.iter_mut().zip(motors()).zip(units) {
            let value = round(u * motor.steps_per_unit);
            if value.is_finite() {
                *target = value as i32;
            }
        }
        steps
    }

    fn start_next(&mut self, spaces: &mut [Space], layout: &Layout) -> bool {
        let Some(mv) = self.queue.try_pop() else {
            return false;
        };
        self.run = None;
        let start = current_axes(spaces);
        let mut end = start;
        for (s, space) in spaces.iter_mut().enumerate() {
            if space.is_follower() {
                continue;
            }
            let range = layout.axes(s);
            for (a, axis) in space.axes.iter_mut().enumerate() {
                let g = range.start + a;
                axis.source = start[g];
                axis.target = mv.targets[g];
                if mv.targets[g].is_nan() {
                    continue;
                }
                let mut value = mv.targets[g] + axis.offset;
                if s == 0 && a < 3 {
                    value += self.tool_offset[a];
                }
                end[g] = axis.clamp(value);
            }
            if !space.kinematics.check_position(&mut end[range]) {
                debug!("target in space {s} moved into reach");
            }
        }

        let end_steps = self.motor_steps(spaces, layout, &end);
        let peak = mv.f0.max(mv.f1);
        let mut scale: f64 = 1.;
        let motors = spaces.iter().flat_map(|s| s.motors.iter()).take(MAX_MOTORS_TOTAL);
        for (m, motor) in motors.enumerate() {
            if motor.steps_per_unit == 0. {
                continue;
            }
            let steps = end_steps[m].abs_diff(self.planned[m]) as f64;
            let distance = steps / motor.steps_per_unit.abs();
            let limit = motor.speed_limit(self.sample_time, MAX_STEPS_PER_SAMPLE);
            if distance * peak * scale > limit {
                scale = limit / (distance * peak);
            }
        }
        if scale < 1. {
            debug!("move slowed to {scale:.3} of the requested rate");
        }
        let (f0, f1) = (mv.f0 * scale, mv.f1 * scale);
        self.active = Some(ActiveMove {
            start,
            end,
            end_steps,
            f0,
            f1,
            duration: 2. / (f0 + f1),
            sample: 0,
            callback: mv.callback,
        });
        true
    }

    fn complete(&mut self, spaces: &mut [Space], fragment: &mut Fragment) {
        let Some(active) = self.active.take() else {
            return;
        };
        let axes = spaces.iter_mut().flat_map(|s| s.axes.iter_mut());
        for (axis, &end) in axes.zip(&active.end) {
            axis.current = end;
        }
        if active.callback {
            fragment.callbacks = fragment.callbacks.saturating_add(1);
        }
    }

    fn run_targets(
        &self,
        spaces: &[Space],
        layout: &Layout,
        run: Run,
    ) -> Option<([i32; MAX_MOTORS_TOTAL], f64)> {
        let space = spaces.get(run.space)?;
        let axis = space.axes.get(run.axis)?;
        let limit = space
            .motors
            .iter()
            .map(|m| m.speed_limit(self.sample_time, MAX_STEPS_PER_SAMPLE))
            .fold(f64::INFINITY, f64::min);
        let speed = run.speed.clamp(-limit, limit);
        let next = axis.clamp(axis.current + speed * self.sample_time);
        if next == axis.current {
            return None;
        }
        let mut axes = current_axes(spaces);
        let range = layout.axes(run.space);
        axes[range.start + run.axis] = next;
        if !space.kinematics.check_position(&mut axes[range]) {
            return None;
        }
        Some((self.motor_steps(spaces, layout, &axes), next))
    }

    /// Fills `fragment` with the next samples of planned motion
    ///
    /// Returns false when there is nothing to hand to the tick. A fragment ends early when a
    /// motor would reverse within it; the last fragment before the planner runs dry is marked
    /// `last`.
    pub fn fill(&mut self, spaces: &mut [Space], fragment: &mut Fragment) -> bool {
        fragment.clear();
        let layout = Layout::of(spaces);
        let motors = layout.motor_count().min(MAX_MOTORS_TOTAL);
        let mut directions = [None::<bool>; MAX_MOTORS_TOTAL];
        let mut dry = false;

        while !fragment.is_full() {
            if self.active.is_none() && !self.start_next(spaces, &layout) && self.run.is_none() {
                dry = true;
                break;
            }

            let (targets, run_next) = if let Some(active) = self.active {
                if active.sample == 0 && active.end_steps[..motors] == self.planned[..motors] {
                    self.complete(spaces, fragment);
                    continue;
                }
                let t = (active.sample + 1) as f64 * self.sample_time;
                let targets = if t >= active.duration * (1. - 1e-9) {
                    active.end_steps
                } else {
                    let s = active.fraction(t);
                    let mut axes = active.start;
                    for (a, (&from, &to)) in axes.iter_mut().zip(active.start.iter().zip(&active.end)) {
                        *a = from + s * (to - from);
                    }
                    self.motor_steps(spaces, &layout, &axes)
                };
                (targets, None)
            } else if let Some(run) = self.run {
                match self.run_targets(spaces, &layout, run) {
                    Some((targets, next)) => (targets, Some((run, next))),
                    None => {
                        debug!("run stopped");
                        self.run = None;
                        continue;
                    }
                }
            } else {
                dry = true;
                break;
            };

            let mut steps = [0u8; MAX_MOTORS_TOTAL];
            let mut reverses = false;
            for m in 0..motors {
                let diff = targets[m] - self.planned[m];
                if diff == 0 {
                    continue;
                }
                if directions[m].is_some_and(|positive| positive != (diff > 0)) {
                    reverses = true;
                    break;
                }
                steps[m] = diff.unsigned_abs().min(MAX_STEPS_PER_SAMPLE as u32) as u8;
            }
            if reverses {
                break;
            }

            let sample = fragment.length as usize;
            for m in (0..motors).filter(|&m| steps[m] > 0) {
                let positive = targets[m] > self.planned[m];
                let motor = &mut fragment.motors[m];
                if !motor.active {
                    motor.active = true;
                    motor.positive = positive;
                    directions[m] = Some(positive);
                }
                motor.set_steps(sample, steps[m]);
                let n = steps[m] as i32;
                self.planned[m] += if positive { n } else { -n };
            }
            fragment.length += 1;

            if let Some((run, next)) = run_next {
                spaces[run.space].axes[run.axis].current = next;
            } else if let Some(active) = self.active.as_mut() {
                active.sample += 1;
                let elapsed = active.sample as f64 * self.sample_time;
                let caught_up = active.end_steps[..motors] == self.planned[..motors];
                if elapsed >= active.duration * (1. - 1e-9) && caught_up {
                    self.complete(spaces, fragment);
                }
            }
        }

        if fragment.length > 0 || fragment.callbacks > 0 {
            fragment.last = dry;
            self.in_motion = !dry;
            return true;
        }
        if self.in_motion && dry {
            // Tell the tick that the motion ended on the previous fragment.
            fragment.last = true;
            self.in_motion = false;
            return true;
        }
        false
    }

    /// Drops all moves and resynchronizes with the tick
    ///
    /// Returns the callbacks of the dropped moves.
    pub fn abort(&mut self, spaces: &mut [Space], positions: &[i32]) -> u32 {
        let mut callbacks = self.queue.iter().filter(|m| m.callback).count() as u32;
        if let Some(active) = self.active.take() {
            callbacks += active.callback as u32;
        }
        self.queue.clear();
        self.run = None;
        self.in_motion = false;
        self.sync(spaces, positions);
        callbacks
    }

    /// Takes motor positions from the tick and recomputes axis positions from them
    pub fn sync(&mut self, spaces: &mut [Space], positions: &[i32]) {
        self.planned = [0; MAX_MOTORS_TOTAL];
        for (p, &position) in self.planned.iter_mut().zip(positions) {
            *p = position;
        }
        let layout = Layout::of(spaces);
        for (s, space) in spaces.iter_mut().enumerate() {
            let range = layout.motors(s);
            if space.is_follower() || range.end > MAX_MOTORS_TOTAL {
                continue;
            }
            let mut units = [0.; MAX_MOTORS];
            for ((u, motor), &steps) in units
                .iter_mut()
                .zip(space.motors.iter())
                .zip(&self.planned[range])
            {
                *u = steps as f64 / motor.steps_per_unit;
            }
            let mut axes = [0.; MAX_AXES];
            let (motors, n) = (space.motors.len(), space.axes.len());
            if space.position(&units[..motors], &mut axes[..n]) {
                for (axis, &v) in space.axes.iter_mut().zip(&axes[..n]) {
                    axis.current = v;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::{kind, Kinematics, MotorRef};

    fn xy() -> heapless::Vec<Space, 4> {
        let mut spaces = heapless::Vec::new();
        spaces
            .push(Space::new(kind::CARTESIAN, 2, 2).unwrap())
            .unwrap();
        spaces
    }

    fn goto(x: f64, f: f64, callback: bool) -> Move {
        Move::new(f, f, &[x, f64::NAN], callback).unwrap()
    }

    fn drain(planner: &mut Planner, spaces: &mut [Space]) -> Vec<Fragment> {
        let mut fragments = Vec::new();
        let mut fragment = Fragment::new();
        while planner.fill(spaces, &mut fragment) {
            fragments.push(fragment);
            assert!(fragments.len() < 10_000);
        }
        fragments
    }

    fn total(fragments: &[Fragment], motor: usize) -> i64 {
        fragments
            .iter()
            .map(|f| {
                let steps = f.motors[motor].total() as i64;
                if f.motors[motor].positive {
                    steps
                } else {
                    -steps
                }
            })
            .sum()
    }

    #[test]
    fn rates_default_and_validate() {
        let mv = Move::new(f64::NAN, f64::NAN, &[], false).unwrap();
        assert_eq!((mv.f0, mv.f1), (DEFAULT_RATE, DEFAULT_RATE));
        let mv = Move::new(2., f64::NAN, &[], false).unwrap();
        assert_eq!(mv.f1, 2.);
        assert_eq!(Move::new(0., 0., &[], false), Err(Stall));
        assert_eq!(Move::new(-1., 0.5, &[], false), Err(Stall));
    }

    #[test]
    fn straight_move_produces_exact_steps() {
        let mut spaces = xy();
        let mut planner = Planner::new();
        planner.enqueue(goto(10., 1., true)).unwrap();
        let fragments = drain(&mut planner, &mut spaces);

        assert_eq!(fragments.len(), 16);
        assert_eq!(total(&fragments, 0), 1000);
        assert!(fragments.iter().all(|f| !f.motors[1].active));
        assert!(fragments[..15].iter().all(|f| f.is_full() && !f.last));
        let end = fragments[15];
        assert_eq!(end.length, 40);
        assert_eq!(end.callbacks, 1);
        assert!(end.last);
        assert_eq!(spaces[0].axes[0].current, 10.);
        assert!(planner.is_idle());
    }

    #[test]
    fn fast_moves_are_slowed_to_the_step_limit() {
        let mut spaces = xy();
        let mut planner = Planner::new();
        planner.enqueue(goto(100., 1., false)).unwrap();
        let fragments = drain(&mut planner, &mut spaces);
        assert_eq!(total(&fragments, 0), 10_000);
        let samples: usize = fragments.iter().map(|f| f.length as usize).sum();
        assert!(samples >= 10_000 / MAX_STEPS_PER_SAMPLE as usize);
        assert!(samples < 3400);
    }

    #[test]
    fn reversal_ends_the_fragment() {
        let mut spaces = xy();
        let mut planner = Planner::new();
        planner.enqueue(goto(1., 10., false)).unwrap();
        planner.enqueue(goto(0., 10., false)).unwrap();
        let fragments = drain(&mut planner, &mut spaces);
        assert_eq!(fragments[0].length, 64);
        assert_eq!(fragments[1].length, 36);
        assert!(fragments[1].motors[0].positive);
        assert!(!fragments[2].motors[0].positive);
        assert_eq!(total(&fragments, 0), 0);
    }

    #[test]
    fn standing_still_completes_immediately() {
        let mut spaces = xy();
        let mut planner = Planner::new();
        planner.enqueue(goto(f64::NAN, 1., true)).unwrap();
        let fragments = drain(&mut planner, &mut spaces);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].length, 0);
        assert_eq!(fragments[0].callbacks, 1);
        assert!(fragments[0].last);
    }

    #[test]
    fn offsets_and_bounds_shape_the_target() {
        let mut spaces = xy();
        spaces[0].axes[0].offset = 1.;
        spaces[0].axes[1].max = 2.;
        let mut planner = Planner::new();
        planner
            .enqueue(Move::new(10., 10., &[2., 5.], false).unwrap())
            .unwrap();
        let fragments = drain(&mut planner, &mut spaces);
        assert_eq!(total(&fragments, 0), 300);
        assert_eq!(total(&fragments, 1), 200);
        assert_eq!(spaces[0].axes[1].current, 2.);
        assert_eq!(spaces[0].axes[0].target, 2.);
    }

    #[test]
    fn full_queue_refuses_without_change() {
        let mut planner = Planner::new();
        for _ in 0..MOVE_QUEUE_LENGTH - 1 {
            assert_eq!(planner.enqueue(goto(1., 1., false)), Ok(QueueState::Ready));
        }
        assert_eq!(planner.enqueue(goto(1., 1., false)), Ok(QueueState::Full));
        assert_eq!(planner.enqueue(goto(1., 1., false)), Err(Stall));
        assert_eq!(planner.queued(), MOVE_QUEUE_LENGTH);
    }

    #[test]
    fn abort_returns_callbacks_and_resyncs() {
        let mut spaces = xy();
        let mut planner = Planner::new();
        planner.enqueue(goto(10., 1., true)).unwrap();
        planner.enqueue(goto(20., 1., true)).unwrap();
        planner.enqueue(goto(30., 1., false)).unwrap();
        let mut fragment = Fragment::new();
        assert!(planner.fill(&mut spaces, &mut fragment));

        assert_eq!(planner.abort(&mut spaces, &[250, -100]), 2);
        assert_eq!(planner.abort(&mut spaces, &[250, -100]), 0);
        assert!(planner.is_idle());
        assert_eq!(spaces[0].axes[0].current, 2.5);
        assert_eq!(spaces[0].axes[1].current, -1.);
        assert_eq!(planner.planned()[..2], [250, -100]);
    }

    #[test]
    fn run_stops_at_the_bound() {
        let mut spaces = xy();
        spaces[0].axes[0].max = 0.5;
        let mut planner = Planner::new();
        planner.run(0, 0, 10.);
        let fragments = drain(&mut planner, &mut spaces);
        assert_eq!(total(&fragments, 0), 50);
        assert!(fragments.last().is_some_and(|f| f.last));
        assert!(planner.is_idle());
    }

    #[test]
    fn followers_mirror_their_leader() {
        let mut spaces = xy();
        let mut follower = Space::new(kind::FOLLOWER, 0, 1).unwrap();
        if let Kinematics::Follower(f) = &mut follower.kinematics {
            f.set_leader(0, MotorRef { space: 0, motor: 1 });
        }
        spaces.push(follower).unwrap();
        let mut planner = Planner::new();
        planner
            .enqueue(Move::new(10., 10., &[f64::NAN, -1.], false).unwrap())
            .unwrap();
        let fragments = drain(&mut planner, &mut spaces);
        assert_eq!(total(&fragments, 1), -100);
        assert_eq!(total(&fragments, 2), -100);
        assert_eq!(total(&fragments, 0), 0);
    }
}
