//! The firmware command layer
//!
//! [`Machine`] owns the object registry (spaces, axes, motors, temps) together with the motion
//! pipeline, and answers the commands the link delivers to it. The main loop calls
//! [`Machine::service`]; the timer calls [`Machine::tick`]. The two only share the fragment
//! queue, whose handoff runs inside critical sections.

use crate::encoding::{read_f64, ReadError, Readable};
use crate::fragment::{Fragment, FragmentQueue, MAX_MOTORS_TOTAL};
use crate::hal::{Adc, Pins};
use crate::hwc::HwcReply;
use crate::link::{Outbox, PacketHandler};
use crate::object::{Image, Object, Persist};
use crate::packet::{Packet, MAX_PAYLOAD};
use crate::planner::{Move, Planner, QueueState};
use crate::protocol::{
    command, event, Channels, ObjectId, Reply, PROTOCOL_VERSION, RATE_CHANNELS,
};
use crate::space::{Layout, Motor, Space, MAX_AXES, MAX_MOTORS, MAX_SPACES};
use crate::stepper::{Stepper, StepperMotor};
use crate::store::{BufferStore, Store, StoreError};
use crate::temp::{Temp, TempSampler, MAX_TEMPS};
use log::{debug, info, warn};

/// Selects extruder offsets with TOOL
const NO_TOOL: u8 = 0xFF;

fn stepper_motor(motor: &Motor) -> StepperMotor {
    StepperMotor {
        step: motor.step,
        dir: motor.dir,
        enable: motor.enable,
        limit_min: motor.limit_min,
        limit_max: motor.limit_max,
        sense: motor.sense,
    }
}

fn object<'a>(spaces: &'a mut [Space], temps: &'a mut [Temp], id: ObjectId) -> Option<Object<'a>> {
    match id {
        ObjectId::Space(s) => spaces.get_mut(s as usize).map(Object::Space),
        ObjectId::Axis { space, axis } => spaces
            .get_mut(space as usize)?
            .axes
            .get_mut(axis as usize)
            .map(Object::Axis),
        ObjectId::Motor { space, motor } => spaces
            .get_mut(space as usize)?
            .motors
            .get_mut(motor as usize)
            .map(Object::Motor),
        ObjectId::Temp(t) => temps.get_mut(t as usize).map(Object::Temp),
        ObjectId::All => None,
    }
}

/// Loads `target` from `store` without touching it unless the whole load succeeds
fn load_into<T: Persist + Clone>(target: &mut T, store: &impl Store) -> Result<(), StoreError> {
    let mut copy = target.clone();
    copy.load(store, &mut 0)?;
    *target = copy;
    Ok(())
}

pub struct Machine<P: Pins, A: Adc, S: Store> {
    spaces: heapless::Vec<Space, MAX_SPACES>,
    temps: heapless::Vec<Temp, MAX_TEMPS>,
    planner: Planner,
    stepper: Stepper,
    fragments: FragmentQueue,
    outbox: Outbox,
    sampler: TempSampler,
    pins: P,
    adc: A,
    store: S,
    tool: Option<u8>,
    continue_wanted: bool,
    motors_enabled: bool,
}

impl<P: Pins, A: Adc, S: Store> Machine<P, A, S> {
    pub fn new(pins: P, adc: A, store: S) -> Self {
        Machine {
            spaces: heapless::Vec::new(),
            temps: heapless::Vec::new(),
            planner: Planner::new(),
            stepper: Stepper::new(),
            fragments: FragmentQueue::new(),
            outbox: Outbox::new(),
            sampler: TempSampler::new(),
            pins,
            adc,
            store,
            tool: None,
            continue_wanted: false,
            motors_enabled: false,
        }
    }

    /// Adds a space; refused when the registry or the fragment buffer has no room for it
    pub fn add_space(&mut self, space: Space) -> Result<(), Space> {
        let motors = Layout::of(&self.spaces).motor_count() + space.motors.len();
        if motors > MAX_MOTORS_TOTAL {
            return Err(space);
        }
        self.spaces.push(space)?;
        self.configure();
        Ok(())
    }

    pub fn add_temp(&mut self, temp: Temp) -> Result<(), Temp> {
        temp.power_pin.make_output(&mut self.pins);
        self.temps.push(temp)
    }

    /// Replaces the registry with the settings image in the store
    pub fn load_settings(&mut self) -> Result<(), StoreError> {
        let image = Image::read(&self.store)?;
        if self.apply_image(image) == Reply::Stall {
            return Err(StoreError::Invalid);
        }
        Ok(())
    }

    /// Writes the whole registry to the store
    pub fn save_settings(&mut self) -> Result<(), StoreError> {
        Image::write(&self.spaces, &self.temps, &mut self.store)
    }

    pub fn spaces(&self) -> &[Space] {
        &self.spaces
    }

    pub fn temps(&self) -> &[Temp] {
        &self.temps
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn stepper(&self) -> &Stepper {
        &self.stepper
    }

    pub fn fragments(&self) -> &FragmentQueue {
        &self.fragments
    }

    pub fn outbox_mut(&mut self) -> &mut Outbox {
        &mut self.outbox
    }

    pub fn pins(&self) -> &P {
        &self.pins
    }

    pub fn pins_mut(&mut self) -> &mut P {
        &mut self.pins
    }

    pub fn adc_mut(&mut self) -> &mut A {
        &mut self.adc
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// The selected extruder, if any
    pub fn tool(&self) -> Option<u8> {
        self.tool
    }

    /// Seconds per tick
    pub fn sample_time(&self) -> f64 {
        self.planner.sample_time()
    }

    /// Rebuilds the tick's motor table from the registry
    fn configure(&mut self) {
        let mut count = 0;
        let motors = self.spaces.iter().flat_map(|s| s.motors.iter());
        for (index, motor) in motors.take(MAX_MOTORS_TOTAL).enumerate() {
            let config = stepper_motor(motor);
            config.setup_pins(&mut self.pins);
            self.stepper.configure(index, config);
            count = index + 1;
        }
        self.stepper.set_motor_count(count);
        self.planner.sync(&mut self.spaces, self.stepper.positions());
    }

    fn set_motors_enabled(&mut self, enabled: bool) {
        for motor in self.spaces.iter().flat_map(|s| s.motors.iter()) {
            motor.enable.drive(&mut self.pins, enabled);
        }
        self.motors_enabled = enabled;
    }

    /// Stops all motion and drops queued work
    ///
    /// Callbacks of everything dropped are reported with MOVECB. Calling it again has no
    /// further effect.
    pub fn abort(&mut self) {
        let mut callbacks = self.stepper.abort(&self.fragments);
        callbacks += self
            .planner
            .abort(&mut self.spaces, self.stepper.positions());
        self.continue_wanted = false;
        if callbacks > 0 {
            debug!("abort flushed {callbacks} callbacks");
            self.outbox.add_movecb(callbacks);
        }
    }

    /// The real-time tick
    ///
    /// Only the fragment queue is guarded by a critical section; the [`Stepper`] itself is
    /// reached through `&mut self` here and in [`Machine::service`] and [`Machine::abort`]. That
    /// is sound while the tick and the main loop are driven from one context, as in
    /// [`crate::Firmware`] and the host simulator. A port that runs the tick from a timer
    /// interrupt must move the `Stepper` behind the same `critical_section::Mutex<RefCell<_>>`
    /// as the queue.
    pub fn tick(&mut self) {
        self.stepper.tick(&self.fragments, &mut self.pins);
    }

    /// Main-loop work between link polls
    pub fn service(&mut self) {
        while let Some(reply) = self.stepper.pop_event() {
            self.tick_event(reply);
        }
        let flushed = self.stepper.take_flushed();
        if flushed > 0 {
            self.outbox.add_movecb(flushed);
        }

        while !self.fragments.is_full() {
            let mut fragment = Fragment::new();
            if !self.planner.fill(&mut self.spaces, &mut fragment) {
                break;
            }
            if self.fragments.push(fragment).is_err() {
                warn!("fragment queue refused a fragment");
                break;
            }
        }

        if self.continue_wanted && !self.planner.is_full() {
            self.continue_wanted = false;
            self.outbox.request_continue();
        }

        if let Some(t) = self
            .sampler
            .poll(&mut self.temps, &mut self.adc, &mut self.pins)
        {
            debug!("temp {t} reached its window");
            self.outbox.set_tempcb(t as u8);
        }
    }

    fn position_units(&self, space: usize, motor: usize, steps: i32) -> f32 {
        let spu = self
            .spaces
            .get(space)
            .and_then(|s| s.motors.get(motor))
            .map_or(1., |m| m.steps_per_unit);
        (steps as f64 / spu) as f32
    }

    fn tick_event(&mut self, reply: HwcReply) {
        let layout = Layout::of(&self.spaces);
        match reply {
            HwcReply::Done(callbacks) => self.outbox.add_movecb(callbacks as u32),
            HwcReply::Limit { motor, position } => {
                let (s, m) = layout
                    .locate_motor(motor as usize)
                    .unwrap_or((0, motor as usize));
                warn!("motor {m} of space {s} hit its limit at step {position}");
                self.abort();
                let packet = Packet::new(event::LIMIT)
                    .with(s as u8)
                    .with(m as u8)
                    .with(self.position_units(s, m, position));
                self.outbox.push_position(packet);
            }
            HwcReply::Sense {
                motor,
                state,
                before,
                after,
            } => {
                let (s, m) = layout
                    .locate_motor(motor as usize)
                    .unwrap_or((0, motor as usize));
                let packet = Packet::new(event::SENSE)
                    .with(s as u8)
                    .with(m as u8)
                    .with(state)
                    .with(self.position_units(s, m, before))
                    .with(self.position_units(s, m, after));
                self.outbox.push_position(packet);
            }
            HwcReply::Underrun => warn!("step fragments ran out"),
            other => debug!("ignoring tick event {other:?}"),
        }
    }

    fn reply(&mut self, packet: Packet) -> Reply {
        match self.outbox.set_reply(packet) {
            Ok(()) => Reply::Ack,
            Err(_) => Reply::Stall,
        }
    }

    fn dispatch(&mut self, cmd: u8, data: &mut &[u8]) -> Result<Reply, ReadError> {
        let replies = matches!(
            cmd,
            command::BEGIN | command::PING | command::READTEMP | command::READ | command::GETPOS
        );
        if replies && self.outbox.has_reply() {
            return Ok(Reply::Stall);
        }

        let reply = match cmd {
            command::BEGIN => {
                let version = u8::read(data)?;
                if version != PROTOCOL_VERSION {
                    warn!("host speaks protocol {version}, firmware {PROTOCOL_VERSION}");
                }
                self.abort();
                self.tool = None;
                self.planner.set_tool_offset([0.; 3]);
                info!("session started");
                let start = Packet::new(event::START)
                    .with(PROTOCOL_VERSION)
                    .with(self.spaces.len() as u8)
                    .with(self.temps.len() as u8);
                self.reply(start)
            }
            command::PING => {
                let code = u8::read(data)?;
                self.reply(Packet::new(event::PONG).with(code))
            }
            command::GOTO | command::GOTOCB => self.goto(data, cmd == command::GOTOCB)?,
            command::RUN => {
                let space = u8::read(data)? as usize;
                let axis = u8::read(data)? as usize;
                let speed = read_f64(data)?;
                let valid = self
                    .spaces
                    .get(space)
                    .is_some_and(|s| !s.is_follower() && axis < s.axes.len());
                if !valid || self.planner.has_moves() {
                    return Ok(Reply::Stall);
                }
                if !self.motors_enabled {
                    self.set_motors_enabled(true);
                }
                self.planner.run(space, axis, speed);
                Reply::Ack
            }
            command::SLEEP => {
                let sleeping = bool::read(data)?;
                self.abort();
                self.set_motors_enabled(!sleeping);
                Reply::Ack
            }
            command::SETTEMP => {
                let t = u8::read(data)? as usize;
                let target = read_f64(data)?;
                match self.temps.get_mut(t) {
                    Some(temp) => {
                        temp.set_target(target, &mut self.pins);
                        Reply::Ack
                    }
                    None => Reply::Stall,
                }
            }
            command::WAITTEMP => {
                let t = u8::read(data)? as usize;
                let min = read_f64(data)?;
                let max = read_f64(data)?;
                match self.temps.get_mut(t) {
                    Some(temp) => {
                        temp.arm_alarm(min, max);
                        Reply::Ack
                    }
                    None => Reply::Stall,
                }
            }
            command::READTEMP => {
                let t = u8::read(data)?;
                match self.temps.get(t as usize) {
                    Some(temp) => {
                        let packet = Packet::new(event::TEMP).with(t).with(temp.last as f32);
                        self.reply(packet)
                    }
                    None => Reply::Stall,
                }
            }
            command::LOAD => {
                let id = ObjectId::read(data)?;
                self.load(id)
            }
            command::SAVE => {
                let id = ObjectId::read(data)?;
                self.save(id)
            }
            command::READ => {
                let id = ObjectId::read(data)?;
                self.read_object(id)
            }
            command::WRITE => {
                let id = ObjectId::read(data)?;
                self.write_object(id, data)
            }
            command::PAUSE => {
                let paused = bool::read(data)?;
                self.stepper.set_paused(paused);
                Reply::Ack
            }
            command::STOP => {
                self.abort();
                Reply::Ack
            }
            command::TOOL => {
                let tool = u8::read(data)?;
                self.select_tool(tool)
            }
            command::GETPOS => {
                let space = u8::read(data)? as usize;
                self.position(space)
            }
            other => {
                warn!("unknown command {other:#04x}");
                Reply::Stall
            }
        };
        Ok(reply)
    }

    fn goto(&mut self, data: &mut &[u8], callback: bool) -> Result<Reply, ReadError> {
        let count = RATE_CHANNELS + Layout::of(&self.spaces).axis_count();
        let channels = Channels::read(data, count)?;
        let Ok(mv) = Move::from_channels(&channels, callback) else {
            return Ok(Reply::Stall);
        };
        let reply = match self.planner.enqueue(mv) {
            Ok(QueueState::Ready) => Reply::Ack,
            Ok(QueueState::Full) => {
                self.continue_wanted = true;
                Reply::AckWait
            }
            Err(_) => return Ok(Reply::Stall),
        };
        if !self.motors_enabled {
            self.set_motors_enabled(true);
        }
        Ok(reply)
    }

    fn select_tool(&mut self, tool: u8) -> Reply {
        if tool == NO_TOOL {
            self.tool = None;
            self.planner.set_tool_offset([0.; 3]);
            return Reply::Ack;
        }
        let offset = self
            .spaces
            .iter()
            .find_map(|s| s.kinematics.as_extruder())
            .and_then(|e| e.offset(tool as usize));
        match offset {
            Some(offset) => {
                self.tool = Some(tool);
                self.planner.set_tool_offset(offset);
                Reply::Ack
            }
            None => Reply::Stall,
        }
    }

    /// POSITION from the motor positions of the tick, in user coordinates
    fn position(&mut self, s: usize) -> Reply {
        let Some(space) = self.spaces.get(s) else {
            return Reply::Stall;
        };
        let range = Layout::of(&self.spaces).motors(s);
        if space.is_follower() || range.end > MAX_MOTORS_TOTAL {
            return Reply::Stall;
        }
        let mut units = [0.; MAX_MOTORS];
        for ((u, motor), m) in units.iter_mut().zip(space.motors.iter()).zip(range) {
            *u = self.stepper.position(m) as f64 / motor.steps_per_unit;
        }
        let mut axes = [0.; MAX_AXES];
        let (nm, na) = (space.motors.len(), space.axes.len());
        if !space.position(&units[..nm], &mut axes[..na]) {
            return Reply::Stall;
        }
        let tool_offset = self.planner.tool_offset();
        let mut packet = Packet::new(event::POSITION).with(s as u8);
        for (a, (axis, &value)) in space.axes.iter().zip(&axes[..na]).enumerate() {
            let mut value = value - axis.offset;
            if s == 0 && a < 3 {
                value -= tool_offset[a];
            }
            packet.push(value as f32);
        }
        self.reply(packet)
    }

    fn motors_fit(&self, space: usize, replacement: &Space) -> bool {
        let current = self.spaces.get(space).map_or(0, |s| s.motors.len());
        Layout::of(&self.spaces).motor_count() - current + replacement.motors.len()
            <= MAX_MOTORS_TOTAL
    }

    fn apply_image(&mut self, image: Image) -> Reply {
        if Layout::of(&image.spaces).motor_count() > MAX_MOTORS_TOTAL {
            return Reply::Stall;
        }
        self.abort();
        for temp in self.temps.iter_mut() {
            temp.set_target(f64::NAN, &mut self.pins);
        }
        self.spaces = image.spaces;
        self.temps = image.temps;
        for temp in self.temps.iter() {
            temp.power_pin.make_output(&mut self.pins);
        }
        self.configure();
        info!(
            "loaded {} spaces and {} temps",
            self.spaces.len(),
            self.temps.len()
        );
        Reply::Ack
    }

    fn load(&mut self, id: ObjectId) -> Reply {
        let image = match Image::read(&self.store) {
            Ok(image) => image,
            Err(e) => {
                warn!("cannot load settings: {e}");
                return Reply::Stall;
            }
        };
        match id {
            ObjectId::All => self.apply_image(image),
            ObjectId::Space(s) => {
                let s = s as usize;
                let Some(space) = image.spaces.get(s) else {
                    return Reply::Stall;
                };
                if s >= self.spaces.len() || !self.motors_fit(s, space) {
                    return Reply::Stall;
                }
                self.abort();
                self.spaces[s] = space.clone();
                self.configure();
                Reply::Ack
            }
            _ => {
                let Some(mut addr) = image.address(id) else {
                    return Reply::Stall;
                };
                let Some(mut target) = object(&mut self.spaces, &mut self.temps, id) else {
                    return Reply::Stall;
                };
                if let Err(e) = target.load(&self.store, &mut addr) {
                    warn!("cannot load {id:?}: {e}");
                    return Reply::Stall;
                }
                if matches!(id, ObjectId::Motor { .. }) {
                    self.abort();
                    self.configure();
                }
                Reply::Ack
            }
        }
    }

    fn save(&mut self, id: ObjectId) -> Reply {
        let in_place = Image::read(&self.store)
            .ok()
            .and_then(|image| image.address(id));
        let result = match in_place {
            Some(mut addr) => match object(&mut self.spaces, &mut self.temps, id) {
                Some(target) => target.save(&mut self.store, &mut addr),
                None => return Reply::Stall,
            },
            None => {
                let exists = id == ObjectId::All
                    || object(&mut self.spaces, &mut self.temps, id).is_some();
                if !exists {
                    return Reply::Stall;
                }
                Image::write(&self.spaces, &self.temps, &mut self.store)
            }
        };
        match result {
            Ok(()) => Reply::Ack,
            Err(e) => {
                warn!("cannot save {id:?}: {e}");
                Reply::Stall
            }
        }
    }

    fn read_object(&mut self, id: ObjectId) -> Reply {
        let mut buffer = BufferStore::new();
        let saved = match object(&mut self.spaces, &mut self.temps, id) {
            Some(target) => target.save(&mut buffer, &mut 0),
            None => return Reply::Stall,
        };
        let id_bytes = id.to_bytes();
        if saved.is_err() || id_bytes.len() + buffer.as_slice().len() > MAX_PAYLOAD {
            return Reply::Stall;
        }
        let packet = Packet::new(event::DATA)
            .with(&id_bytes[..])
            .with(buffer.as_slice());
        self.reply(packet)
    }

    fn write_object(&mut self, id: ObjectId, data: &[u8]) -> Reply {
        let buffer = BufferStore::from_slice(data);
        let result = match id {
            ObjectId::Space(s) => {
                let s = s as usize;
                let Some(current) = self.spaces.get(s) else {
                    return Reply::Stall;
                };
                let mut space = current.clone();
                if space.load(&buffer, &mut 0).is_err() || !self.motors_fit(s, &space) {
                    return Reply::Stall;
                }
                self.abort();
                self.spaces[s] = space;
                self.configure();
                return Reply::Ack;
            }
            ObjectId::Axis { space, axis } => match self
                .spaces
                .get_mut(space as usize)
                .and_then(|s| s.axes.get_mut(axis as usize))
            {
                Some(target) => load_into(target, &buffer),
                None => return Reply::Stall,
            },
            ObjectId::Motor { space, motor } => match self
                .spaces
                .get_mut(space as usize)
                .and_then(|s| s.motors.get_mut(motor as usize))
            {
                Some(target) => {
                    let mut copy = *target;
                    let loaded = copy.load(&buffer, &mut 0);
                    if loaded.is_ok() {
                        self.abort();
                        if let Some(target) = self
                            .spaces
                            .get_mut(space as usize)
                            .and_then(|s| s.motors.get_mut(motor as usize))
                        {
                            *target = copy;
                        }
                        self.configure();
                    }
                    loaded
                }
                None => return Reply::Stall,
            },
            ObjectId::Temp(t) => match self.temps.get_mut(t as usize) {
                Some(target) => load_into(target, &buffer),
                None => return Reply::Stall,
            },
            ObjectId::All => return Reply::Stall,
        };
        match result {
            Ok(()) => Reply::Ack,
            Err(e) => {
                warn!("malformed settings for {id:?}: {e}");
                Reply::Stall
            }
        }
    }
}

impl<P: Pins, A: Adc, S: Store> PacketHandler for Machine<P, A, S> {
    fn handle(&mut self, command: u8, payload: &[u8]) -> Reply {
        let mut data = payload;
        match self.dispatch(command, &mut data) {
            Ok(reply) => reply,
            Err(_) => {
                warn!("malformed payload for command {command:#04x}");
                Reply::Stall
            }
        }
    }

    fn link_reset(&mut self) {
        self.outbox.clear();
        self.abort();
    }
}
