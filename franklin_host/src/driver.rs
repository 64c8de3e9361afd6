//! Host side of the link: sends commands to a board and collects its events

use crate::serial::Port;
use anyhow::{bail, Result};
use franklin::encoding::{ReadError, Readable};
use franklin::link::{Delivery, PacketHandler, PacketSource};
use franklin::packet::Packet;
use franklin::protocol::{
    command, event, Channels, ObjectId, Reply, PROTOCOL_VERSION, RATE_CHANNELS,
};
use franklin::{Link, LinkConfig};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::time::Duration;

/// Longest wait for the acknowledgement of one command
const REQUEST_TIMEOUT_US: u32 = 2_000_000;

/// Longest wait for the reply event of a request
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A packet the board sent
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start { version: u8, spaces: u8, temps: u8 },
    Temp { temp: u8, celsius: f32 },
    Data { id: ObjectId, data: Vec<u8> },
    Pong(u8),
    MoveCb(u8),
    TempCb(u8),
    Continue,
    Limit { space: u8, motor: u8, position: f32 },
    Sense {
        space: u8,
        motor: u8,
        state: bool,
        before: f32,
        after: f32,
    },
    Position { space: u8, axes: Vec<f32> },
}

impl Event {
    pub fn decode(command: u8, payload: &[u8]) -> Result<Self, ReadError> {
        let data = &mut &payload[..];
        let ev = match command {
            event::START => Event::Start {
                version: u8::read(data)?,
                spaces: u8::read(data)?,
                temps: u8::read(data)?,
            },
            event::TEMP => Event::Temp {
                temp: u8::read(data)?,
                celsius: f32::read(data)?,
            },
            event::DATA => Event::Data {
                id: ObjectId::read(data)?,
                data: <&[u8]>::read(data)?.to_vec(),
            },
            event::PONG => Event::Pong(u8::read(data)?),
            event::MOVECB => Event::MoveCb(u8::read(data)?),
            event::TEMPCB => Event::TempCb(u8::read(data)?),
            event::CONTINUE => Event::Continue,
            event::LIMIT => Event::Limit {
                space: u8::read(data)?,
                motor: u8::read(data)?,
                position: f32::read(data)?,
            },
            event::SENSE => Event::Sense {
                space: u8::read(data)?,
                motor: u8::read(data)?,
                state: bool::read(data)?,
                before: f32::read(data)?,
                after: f32::read(data)?,
            },
            event::POSITION => {
                let space = u8::read(data)?;
                let mut axes = Vec::new();
                while !data.is_empty() {
                    axes.push(f32::read(data)?);
                }
                Event::Position { space, axes }
            }
            _ => return Err(ReadError),
        };
        Ok(ev)
    }
}

#[derive(Default)]
struct Inbox {
    events: VecDeque<Event>,
}

impl PacketHandler for Inbox {
    fn handle(&mut self, command: u8, payload: &[u8]) -> Reply {
        match Event::decode(command, payload) {
            Ok(ev) => {
                match &ev {
                    Event::Limit {
                        space,
                        motor,
                        position,
                    } => warn!("motor {motor} of space {space} hit its limit at {position}"),
                    other => debug!("event {other:?}"),
                }
                self.events.push_back(ev);
                Reply::Ack
            }
            Err(_) => {
                warn!("undecodable event {command:#04x}");
                Reply::Stall
            }
        }
    }

    fn link_reset(&mut self) {
        info!("board restarted");
    }
}

struct NoPackets;

impl PacketSource for NoPackets {
    fn next_packet(&mut self) -> Option<Packet> {
        None
    }
}

/// Shape of one space as the board reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceShape {
    pub kind: u8,
    pub axes: u8,
    pub motors: u8,
}

/// What the board announced at the start of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub version: u8,
    pub spaces: Vec<SpaceShape>,
    pub temps: u8,
}

pub struct Driver<P: Port> {
    port: P,
    link: Link<Vec<u8>>,
    inbox: Inbox,
    rx: Vec<u8>,
    axes: Vec<usize>,
    queue_full: bool,
}

impl<P: Port> Driver<P> {
    pub fn new(port: P, config: LinkConfig) -> Self {
        Driver {
            port,
            link: Link::new(Vec::new(), config),
            inbox: Inbox::default(),
            rx: Vec::new(),
            axes: Vec::new(),
            queue_full: false,
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    fn flush(&mut self) -> Result<()> {
        let out = std::mem::take(self.link.output());
        if !out.is_empty() {
            self.port.send(&out)?;
        }
        Ok(())
    }

    /// Sends pending bytes, then waits up to `timeout` for input and feeds it to the link
    pub fn pump(&mut self, timeout: Duration) -> Result<()> {
        self.flush()?;
        self.port.recv(&mut self.rx, timeout)?;
        let now = self.port.now();
        self.link.receive(&mut self.rx, now, &mut self.inbox)?;
        self.link.poll_send(now, &mut NoPackets)?;
        self.flush()
    }

    fn expired(&self, since: u32, limit_us: u32) -> bool {
        self.port.now().wrapping_sub(since) > limit_us
    }

    /// Sends one packet and waits for the board's answer
    pub fn request(&mut self, packet: &Packet) -> Result<Delivery> {
        let start = self.port.now();
        while !self.link.is_idle() {
            if self.expired(start, REQUEST_TIMEOUT_US) {
                bail!("link busy");
            }
            self.pump(POLL_INTERVAL)?;
        }
        self.link.take_delivery();

        self.link.send(packet, self.port.now());
        let start = self.port.now();
        loop {
            self.pump(POLL_INTERVAL)?;
            if let Some(delivery) = self.link.take_delivery() {
                return Ok(delivery);
            }
            if self.link.is_idle() {
                bail!("board restarted during command {:#04x}", packet.command);
            }
            if self.expired(start, REQUEST_TIMEOUT_US) {
                bail!("no answer to command {:#04x}", packet.command);
            }
        }
    }

    fn command(&mut self, packet: &Packet) -> Result<Delivery> {
        match self.request(packet)? {
            Delivery::Stall => bail!("board refused command {:#04x}", packet.command),
            delivery => Ok(delivery),
        }
    }

    /// Removes the first queued event `pick` accepts and returns what it made of it
    ///
    /// Waits up to `timeout` for such an event; other events stay queued.
    pub fn wait_for<T>(
        &mut self,
        mut pick: impl FnMut(&Event) -> Option<T>,
        timeout: Duration,
    ) -> Result<T> {
        let start = self.port.now();
        let limit = timeout.as_micros().min(u32::MAX as u128) as u32;
        loop {
            let found = self
                .inbox
                .events
                .iter()
                .enumerate()
                .find_map(|(i, e)| pick(e).map(|v| (i, v)));
            if let Some((i, value)) = found {
                self.inbox.events.remove(i);
                return Ok(value);
            }
            if self.expired(start, limit) {
                bail!("timed out waiting for an event");
            }
            self.pump(POLL_INTERVAL)?;
        }
    }

    /// Events received and not yet consumed
    pub fn take_events(&mut self) -> Vec<Event> {
        self.inbox.events.drain(..).collect()
    }

    /// Resets both ends of the link
    pub fn reset(&mut self) -> Result<()> {
        let start = self.port.now();
        self.link.reset_request(start);
        loop {
            self.pump(POLL_INTERVAL)?;
            match self.link.take_delivery() {
                Some(Delivery::Reset) => break,
                // A restart announcement cleared the request.
                _ if self.link.is_idle() => self.link.reset_request(self.port.now()),
                _ => {}
            }
            if self.expired(start, REQUEST_TIMEOUT_US) {
                bail!("board did not acknowledge the reset");
            }
        }
        self.inbox.events.clear();
        self.queue_full = false;
        Ok(())
    }

    /// Resets the link, starts a session and learns the shape of every space
    pub fn begin(&mut self) -> Result<Session> {
        self.reset()?;
        self.command(&Packet::new(command::BEGIN).with(PROTOCOL_VERSION))?;
        let (version, spaces, temps) = self.wait_for(
            |e| match *e {
                Event::Start {
                    version,
                    spaces,
                    temps,
                } => Some((version, spaces, temps)),
                _ => None,
            },
            REPLY_TIMEOUT,
        )?;
        if version != PROTOCOL_VERSION {
            warn!("board speaks protocol {version}, host {PROTOCOL_VERSION}");
        }

        let mut shapes = Vec::new();
        for s in 0..spaces {
            let id = ObjectId::Space(s);
            self.command(&Packet::new(command::READ).with(&id.to_bytes()[..]))?;
            let data = self.wait_for(
                |e| match e {
                    Event::Data { id: i, data } if *i == id => Some(data.clone()),
                    _ => None,
                },
                REPLY_TIMEOUT,
            )?;
            let [kind, axes, motors, ..] = data[..] else {
                bail!("short description of space {s}");
            };
            shapes.push(SpaceShape { kind, axes, motors });
        }
        self.axes = shapes.iter().map(|s| s.axes as usize).collect();
        info!("session started: {} spaces, {temps} temps", shapes.len());
        Ok(Session {
            version,
            spaces: shapes,
            temps,
        })
    }

    pub fn ping(&mut self, code: u8) -> Result<()> {
        self.command(&Packet::new(command::PING).with(code))?;
        self.wait_for(|e| (*e == Event::Pong(code)).then_some(()), REPLY_TIMEOUT)
    }

    /// Queues a move to the given (channel, value) targets
    ///
    /// Channels number the axes of all spaces in order. When the board reported a full queue,
    /// this first waits for its CONTINUE.
    pub fn goto(&mut self, targets: &[(usize, f64)], callback: bool) -> Result<()> {
        let total: usize = self.axes.iter().sum();
        let mut channels = Channels::new(RATE_CHANNELS + total);
        for &(axis, value) in targets {
            if axis >= total {
                bail!("no axis {axis}, the board has {total}");
            }
            channels.set(RATE_CHANNELS + axis, value);
        }
        let cmd = if callback {
            command::GOTOCB
        } else {
            command::GOTO
        };
        let mut packet = Packet::new(cmd);
        channels.write(&mut packet);

        if self.queue_full {
            // A queued move has to finish first.
            self.wait_for(
                |e| (*e == Event::Continue).then_some(()),
                Duration::from_secs(60),
            )?;
            self.queue_full = false;
        }
        if self.command(&packet)? == Delivery::AckWait {
            self.queue_full = true;
        }
        Ok(())
    }

    /// Waits until `count` move callbacks were reported
    pub fn wait_moves(&mut self, mut count: u32, timeout: Duration) -> Result<()> {
        while count > 0 {
            let done = self.wait_for(
                |e| match *e {
                    Event::MoveCb(n) => Some(Some(n)),
                    Event::Limit { .. } => Some(None),
                    _ => None,
                },
                timeout,
            )?;
            match done {
                Some(n) => count = count.saturating_sub(n as u32),
                None => bail!("motion stopped at a limit switch"),
            }
        }
        Ok(())
    }

    /// Current axis positions of `space`
    pub fn position(&mut self, space: u8) -> Result<Vec<f32>> {
        self.command(&Packet::new(command::GETPOS).with(space))?;
        self.wait_for(
            |e| match e {
                Event::Position { space: s, axes } if *s == space => Some(axes.clone()),
                _ => None,
            },
            REPLY_TIMEOUT,
        )
    }

    /// Last measured temperature of a heater
    pub fn read_temp(&mut self, temp: u8) -> Result<f32> {
        self.command(&Packet::new(command::READTEMP).with(temp))?;
        self.wait_for(
            |e| match *e {
                Event::Temp { temp: t, celsius } if t == temp => Some(celsius),
                _ => None,
            },
            REPLY_TIMEOUT,
        )
    }

    pub fn stop(&mut self) -> Result<()> {
        self.command(&Packet::new(command::STOP))?;
        self.queue_full = false;
        Ok(())
    }
}
