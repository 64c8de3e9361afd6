//! Hardware sub-protocol
//!
//! A bare board that only executes step fragments speaks this opcode set; the host plans moves
//! itself and streams finished fragments with START_MOVE followed by one MOVE per active motor.
//! Packets use the same framing and link engine as the motion protocol. The replies double as the
//! event type of the real-time tick.

use crate::encoding::{ReadError, Readable};
use crate::fragment::{Fragment, FragmentQueue, MotorSteps, BYTES_PER_FRAGMENT, FRAGMENTS_PER_BUFFER, MAX_MOTORS_TOTAL, SAMPLES_PER_FRAGMENT};
use crate::hal::{Adc, Pin, Pins};
use crate::link::{PacketHandler, PacketSource};
use crate::packet::Packet;
use crate::protocol::{Reply, PROTOCOL_VERSION};
use crate::ring::{Full, Ring};
use crate::stepper::{Stepper, StepperMotor};
use log::{debug, warn};

pub mod opcode {
    pub const BEGIN: u8 = 0x00;
    pub const PING: u8 = 0x01;
    pub const RESET: u8 = 0x02;
    pub const SETUP: u8 = 0x03;
    pub const MSETUP: u8 = 0x04;
    pub const ASETUP: u8 = 0x05;
    pub const START_MOVE: u8 = 0x06;
    pub const MOVE: u8 = 0x07;
    pub const START: u8 = 0x08;
    pub const STOP: u8 = 0x09;
    pub const ABORT: u8 = 0x0A;
    pub const DISCARD: u8 = 0x0B;
    pub const GETPIN: u8 = 0x0C;
    pub const SETPIN: u8 = 0x0D;

    pub const READY: u8 = 0x10;
    pub const PONG: u8 = 0x11;
    pub const PIN: u8 = 0x12;
    pub const STOPPED: u8 = 0x13;
    pub const DONE: u8 = 0x14;
    pub const UNDERRUN: u8 = 0x15;
    pub const ADC: u8 = 0x16;
    pub const LIMIT: u8 = 0x17;
    pub const TIMEOUT: u8 = 0x18;
    pub const SENSE0: u8 = 0x19;
    pub const SENSE1: u8 = 0x1a;
    pub const PINCHANGE: u8 = 0x1b;
}

/// ADC channels a board samples
pub const MAX_ADC: usize = 4;

/// Host to board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwcCommand {
    Begin,
    Ping(u8),
    Reset,
    Setup {
        led: Pin,
        /// Idle time in ms after which motors are released; 0 disables
        timeout_ms: u16,
    },
    MotorSetup {
        motor: u8,
        config: StepperMotor,
    },
    AdcSetup {
        adc: u8,
        pin: Pin,
    },
    StartMove {
        samples: u8,
        motors: u8,
        callbacks: u8,
        last: bool,
    },
    Move {
        motor: u8,
        positive: bool,
        data: [u8; BYTES_PER_FRAGMENT],
    },
    Start,
    Stop,
    Abort,
    Discard,
    GetPin(u8),
    SetPin {
        pin: u8,
        state: bool,
    },
}

impl HwcCommand {
    pub fn decode(command: u8, payload: &[u8]) -> Result<Self, ReadError> {
        let data = &mut &payload[..];
        let cmd = match command {
            opcode::BEGIN => HwcCommand::Begin,
            opcode::PING => HwcCommand::Ping(u8::read(data)?),
            opcode::RESET => HwcCommand::Reset,
            opcode::SETUP => HwcCommand::Setup {
                led: Pin::read(data)?,
                timeout_ms: u16::read(data)?,
            },
            opcode::MSETUP => HwcCommand::MotorSetup {
                motor: u8::read(data)?,
                config: StepperMotor {
                    step: Pin::read(data)?,
                    dir: Pin::read(data)?,
                    enable: Pin::read(data)?,
                    limit_min: Pin::read(data)?,
                    limit_max: Pin::read(data)?,
                    sense: Pin::read(data)?,
                },
            },
            opcode::ASETUP => HwcCommand::AdcSetup {
                adc: u8::read(data)?,
                pin: Pin::read(data)?,
            },
            opcode::START_MOVE => HwcCommand::StartMove {
                samples: u8::read(data)?,
                motors: u8::read(data)?,
                callbacks: u8::read(data)?,
                last: bool::read(data)?,
            },
            opcode::MOVE => HwcCommand::Move {
                motor: u8::read(data)?,
                positive: bool::read(data)?,
                data: crate::encoding::take(data)?,
            },
            opcode::START => HwcCommand::Start,
            opcode::STOP => HwcCommand::Stop,
            opcode::ABORT => HwcCommand::Abort,
            opcode::DISCARD => HwcCommand::Discard,
            opcode::GETPIN => HwcCommand::GetPin(u8::read(data)?),
            opcode::SETPIN => HwcCommand::SetPin {
                pin: u8::read(data)?,
                state: bool::read(data)?,
            },
            _ => return Err(ReadError),
        };
        Ok(cmd)
    }

    pub fn packet(&self) -> Packet {
        match *self {
            HwcCommand::Begin => Packet::new(opcode::BEGIN),
            HwcCommand::Ping(code) => Packet::new(opcode::PING).with(code),
            HwcCommand::Reset => Packet::new(opcode::RESET),
            HwcCommand::Setup { led, timeout_ms } => {
                Packet::new(opcode::SETUP).with(led).with(timeout_ms)
            }
            HwcCommand::MotorSetup { motor, config } => Packet::new(opcode::MSETUP)
                .with(motor)
                .with(config.step)
                .with(config.dir)
                .with(config.enable)
                .with(config.limit_min)
                .with(config.limit_max)
                .with(config.sense),
            HwcCommand::AdcSetup { adc, pin } => Packet::new(opcode::ASETUP).with(adc).with(pin),
            HwcCommand::StartMove {
                samples,
                motors,
                callbacks,
                last,
            } => Packet::new(opcode::START_MOVE)
                .with(samples)
                .with(motors)
                .with(callbacks)
                .with(last),
            HwcCommand::Move {
                motor,
                positive,
                data,
            } => Packet::new(opcode::MOVE)
                .with(motor)
                .with(positive)
                .with(&data[..]),
            HwcCommand::Start => Packet::new(opcode::START),
            HwcCommand::Stop => Packet::new(opcode::STOP),
            HwcCommand::Abort => Packet::new(opcode::ABORT),
            HwcCommand::Discard => Packet::new(opcode::DISCARD),
            HwcCommand::GetPin(pin) => Packet::new(opcode::GETPIN).with(pin),
            HwcCommand::SetPin { pin, state } => Packet::new(opcode::SETPIN).with(pin).with(state),
        }
    }

    /// The START_MOVE/MOVE sequence transferring `fragment`
    pub fn for_fragment(fragment: &Fragment) -> heapless::Vec<HwcCommand, { MAX_MOTORS_TOTAL + 1 }> {
        let mut commands = heapless::Vec::new();
        let _ = commands.push(HwcCommand::StartMove {
            samples: fragment.length,
            motors: fragment.active_count() as u8,
            callbacks: fragment.callbacks,
            last: fragment.last,
        });
        for (motor, steps) in fragment.motors.iter().enumerate().filter(|(_, m)| m.active) {
            let _ = commands.push(HwcCommand::Move {
                motor: motor as u8,
                positive: steps.positive,
                data: steps.data,
            });
        }
        commands
    }
}

/// Board to host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwcReply {
    Ready {
        protocol: u8,
        motors: u8,
        fragments: u8,
    },
    Pong(u8),
    Pin {
        pin: u8,
        state: bool,
    },
    Stopped,
    /// A fragment finished, carrying its callback count
    Done(u8),
    Underrun,
    Adc {
        adc: u8,
        value: u16,
    },
    /// A motor ran into its limit switch; motion was aborted
    Limit {
        motor: u8,
        position: i32,
    },
    Timeout,
    /// A sense pin changed; positions before and after the sample
    Sense {
        motor: u8,
        state: bool,
        before: i32,
        after: i32,
    },
    PinChange {
        pin: u8,
        state: bool,
    },
}

impl HwcReply {
    pub fn code(&self) -> u8 {
        match self {
            HwcReply::Ready { .. } => opcode::READY,
            HwcReply::Pong(_) => opcode::PONG,
            HwcReply::Pin { .. } => opcode::PIN,
            HwcReply::Stopped => opcode::STOPPED,
            HwcReply::Done(_) => opcode::DONE,
            HwcReply::Underrun => opcode::UNDERRUN,
            HwcReply::Adc { .. } => opcode::ADC,
            HwcReply::Limit { .. } => opcode::LIMIT,
            HwcReply::Timeout => opcode::TIMEOUT,
            HwcReply::Sense { state: false, .. } => opcode::SENSE0,
            HwcReply::Sense { state: true, .. } => opcode::SENSE1,
            HwcReply::PinChange { .. } => opcode::PINCHANGE,
        }
    }

    pub fn packet(&self) -> Packet {
        let packet = Packet::new(self.code());
        match *self {
            HwcReply::Ready {
                protocol,
                motors,
                fragments,
            } => packet.with(protocol).with(motors).with(fragments),
            HwcReply::Pong(code) => packet.with(code),
            HwcReply::Pin { pin, state } | HwcReply::PinChange { pin, state } => {
                packet.with(pin).with(state)
            }
            HwcReply::Done(callbacks) => packet.with(callbacks),
            HwcReply::Adc { adc, value } => packet.with(adc).with(value),
            HwcReply::Limit { motor, position } => packet.with(motor).with(position),
            HwcReply::Sense {
                motor,
                before,
                after,
                ..
            } => packet.with(motor).with(before).with(after),
            HwcReply::Stopped | HwcReply::Underrun | HwcReply::Timeout => packet,
        }
    }

    pub fn decode(command: u8, payload: &[u8]) -> Result<Self, ReadError> {
        let data = &mut &payload[..];
        let reply = match command {
            opcode::READY => HwcReply::Ready {
                protocol: u8::read(data)?,
                motors: u8::read(data)?,
                fragments: u8::read(data)?,
            },
            opcode::PONG => HwcReply::Pong(u8::read(data)?),
            opcode::PIN => HwcReply::Pin {
                pin: u8::read(data)?,
                state: bool::read(data)?,
            },
            opcode::STOPPED => HwcReply::Stopped,
            opcode::DONE => HwcReply::Done(u8::read(data)?),
            opcode::UNDERRUN => HwcReply::Underrun,
            opcode::ADC => HwcReply::Adc {
                adc: u8::read(data)?,
                value: u16::read(data)?,
            },
            opcode::LIMIT => HwcReply::Limit {
                motor: u8::read(data)?,
                position: i32::read(data)?,
            },
            opcode::TIMEOUT => HwcReply::Timeout,
            opcode::SENSE0 | opcode::SENSE1 => HwcReply::Sense {
                motor: u8::read(data)?,
                state: command == opcode::SENSE1,
                before: i32::read(data)?,
                after: i32::read(data)?,
            },
            opcode::PINCHANGE => HwcReply::PinChange {
                pin: u8::read(data)?,
                state: bool::read(data)?,
            },
            _ => return Err(ReadError),
        };
        Ok(reply)
    }
}

/// Rebuilds fragments from START_MOVE and MOVE commands
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    pending: Option<(Fragment, u8)>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(
        &mut self,
        samples: u8,
        motors: u8,
        callbacks: u8,
        last: bool,
        queue: &FragmentQueue,
    ) -> Reply {
        if queue.is_full() {
            return Reply::Stall;
        }
        if samples as usize > SAMPLES_PER_FRAGMENT || motors as usize > MAX_MOTORS_TOTAL {
            warn!("malformed fragment header");
            return Reply::Stall;
        }
        let mut fragment = Fragment::new();
        fragment.length = samples;
        fragment.callbacks = callbacks;
        fragment.last = last;
        self.pending = Some((fragment, motors));
        self.complete(queue)
    }

    pub fn add(
        &mut self,
        motor: u8,
        positive: bool,
        data: [u8; BYTES_PER_FRAGMENT],
        queue: &FragmentQueue,
    ) -> Reply {
        let Some((fragment, remaining)) = self.pending.as_mut() else {
            warn!("MOVE without START_MOVE");
            return Reply::Stall;
        };
        let Some(slot) = fragment.motors.get_mut(motor as usize) else {
            return Reply::Stall;
        };
        if !slot.active {
            if *remaining == 0 {
                return Reply::Stall;
            }
            *remaining -= 1;
        }
        *slot = MotorSteps {
            active: true,
            positive,
            data,
        };
        self.complete(queue)
    }

    fn complete(&mut self, queue: &FragmentQueue) -> Reply {
        match self.pending {
            Some((fragment, 0)) => match queue.push(fragment) {
                Ok(()) => {
                    self.pending = None;
                    Reply::Ack
                }
                Err(Full(_)) => Reply::Stall,
            },
            _ => Reply::Ack,
        }
    }

    pub fn reset(&mut self) {
        self.pending = None;
    }
}

const REPLY_QUEUE_LENGTH: usize = 16;

/// A bare stepping board: executes fragments streamed by the host
pub struct HwcDevice<P: Pins, A: Adc> {
    pins: P,
    adc: A,
    stepper: Stepper,
    fragments: FragmentQueue,
    assembler: FragmentAssembler,
    replies: Ring<HwcReply, REPLY_QUEUE_LENGTH>,
    adc_pins: [Pin; MAX_ADC],
    adc_next: usize,
    adc_converting: bool,
    led: Pin,
    watch: Option<(u8, bool)>,
    timeout_ms: u16,
    last_activity_ms: u32,
    motors_enabled: bool,
}

impl<P: Pins, A: Adc> HwcDevice<P, A> {
    pub fn new(pins: P, adc: A) -> Self {
        HwcDevice {
            pins,
            adc,
            stepper: Stepper::new(),
            fragments: FragmentQueue::new(),
            assembler: FragmentAssembler::new(),
            replies: Ring::new(),
            adc_pins: [Pin::NONE; MAX_ADC],
            adc_next: 0,
            adc_converting: false,
            led: Pin::NONE,
            watch: None,
            timeout_ms: 0,
            last_activity_ms: 0,
            motors_enabled: false,
        }
    }

    pub fn pins(&self) -> &P {
        &self.pins
    }

    pub fn pins_mut(&mut self) -> &mut P {
        &mut self.pins
    }

    pub fn stepper(&self) -> &Stepper {
        &self.stepper
    }

    pub fn fragments(&self) -> &FragmentQueue {
        &self.fragments
    }

    fn reply(&mut self, reply: HwcReply) {
        if self.replies.try_push(reply).is_err() {
            warn!("reply queue full, dropping {:#04x}", reply.code());
        }
    }

    fn abort(&mut self) {
        self.stepper.abort(&self.fragments);
        self.assembler.reset();
    }

    fn set_motors_enabled(&mut self, enabled: bool) {
        for m in 0..self.stepper.motor_count() {
            self.stepper.motor(m).enable.drive(&mut self.pins, enabled);
        }
        self.motors_enabled = enabled;
    }

    /// The real-time tick
    pub fn tick(&mut self) {
        self.stepper.tick(&self.fragments, &mut self.pins);
    }

    /// Main-loop work: forwards tick events, samples ADCs and watches pins
    pub fn poll(&mut self, now_ms: u32) {
        while let Some(event) = self.stepper.pop_event() {
            self.reply(event);
        }
        if self.stepper.is_running() {
            self.last_activity_ms = now_ms;
            self.led.drive(&mut self.pins, true);
        } else {
            self.led.drive(&mut self.pins, false);
        }

        if let Some((pin, state)) = self.watch {
            let level = self.pins.get(pin);
            if level != state {
                self.watch = Some((pin, level));
                self.reply(HwcReply::PinChange { pin, state: level });
            }
        }

        self.poll_adc();

        if self.timeout_ms > 0
            && self.motors_enabled
            && now_ms.wrapping_sub(self.last_activity_ms) > self.timeout_ms as u32
        {
            debug!("idle timeout, releasing motors");
            self.set_motors_enabled(false);
            self.reply(HwcReply::Timeout);
        }
    }

    fn poll_adc(&mut self) {
        let configured = self.adc_pins.iter().filter(|p| p.is_valid()).count();
        if configured == 0 {
            return;
        }
        let pin = self.adc_pins[self.adc_next];
        if !pin.is_valid() {
            self.adc_next = (self.adc_next + 1) % MAX_ADC;
            return;
        }
        if !self.adc_converting {
            self.adc.start(pin.number());
            self.adc_converting = true;
        } else if self.adc.ready(pin.number()) {
            let value = self.adc.get(pin.number());
            self.adc_converting = false;
            self.reply(HwcReply::Adc {
                adc: self.adc_next as u8,
                value,
            });
            self.adc_next = (self.adc_next + 1) % MAX_ADC;
        }
    }

    fn dispatch(&mut self, command: HwcCommand) -> Reply {
        match command {
            HwcCommand::Begin => {
                self.abort();
                self.reply(HwcReply::Ready {
                    protocol: PROTOCOL_VERSION,
                    motors: MAX_MOTORS_TOTAL as u8,
                    fragments: FRAGMENTS_PER_BUFFER as u8,
                });
            }
            HwcCommand::Ping(code) => self.reply(HwcReply::Pong(code)),
            HwcCommand::Reset => {
                self.abort();
                self.stepper = Stepper::new();
                self.adc_pins = [Pin::NONE; MAX_ADC];
                self.watch = None;
            }
            HwcCommand::Setup { led, timeout_ms } => {
                led.make_output(&mut self.pins);
                self.led = led;
                self.timeout_ms = timeout_ms;
            }
            HwcCommand::MotorSetup { motor, config } => {
                if motor as usize >= MAX_MOTORS_TOTAL {
                    return Reply::Stall;
                }
                config.setup_pins(&mut self.pins);
                self.stepper.configure(motor as usize, config);
            }
            HwcCommand::AdcSetup { adc, pin } => match self.adc_pins.get_mut(adc as usize) {
                Some(slot) => *slot = pin,
                None => return Reply::Stall,
            },
            HwcCommand::StartMove {
                samples,
                motors,
                callbacks,
                last,
            } => {
                let reply = self
                    .assembler
                    .start(samples, motors, callbacks, last, &self.fragments);
                if !self.motors_enabled {
                    self.set_motors_enabled(true);
                }
                return reply;
            }
            HwcCommand::Move {
                motor,
                positive,
                data,
            } => return self.assembler.add(motor, positive, data, &self.fragments),
            HwcCommand::Start => self.stepper.set_paused(false),
            HwcCommand::Stop => {
                self.stepper.set_paused(true);
                self.reply(HwcReply::Stopped);
            }
            HwcCommand::Abort => {
                self.abort();
                self.reply(HwcReply::Stopped);
            }
            HwcCommand::Discard => {
                self.fragments.clear();
                self.assembler.reset();
            }
            HwcCommand::GetPin(pin) => {
                let state = self.pins.get(pin);
                self.watch = Some((pin, state));
                self.reply(HwcReply::Pin { pin, state });
            }
            HwcCommand::SetPin { pin, state } => {
                self.pins.set_output(pin);
                if state {
                    self.pins.set(pin);
                } else {
                    self.pins.reset(pin);
                }
            }
        }
        Reply::Ack
    }
}

impl<P: Pins, A: Adc> PacketHandler for HwcDevice<P, A> {
    fn handle(&mut self, command: u8, payload: &[u8]) -> Reply {
        match HwcCommand::decode(command, payload) {
            Ok(cmd) => self.dispatch(cmd),
            Err(_) => {
                warn!("malformed hardware command {command:#04x}");
                Reply::Stall
            }
        }
    }

    fn link_reset(&mut self) {
        self.abort();
    }
}

impl<P: Pins, A: Adc> PacketSource for HwcDevice<P, A> {
    fn next_packet(&mut self) -> Option<Packet> {
        self.replies.try_pop().map(|r| r.packet())
    }
}
