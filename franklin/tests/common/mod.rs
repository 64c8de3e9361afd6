#![allow(dead_code)]

use franklin::hal::Pin;
use franklin::kinematics::kind;
use franklin::link::{Delivery, PacketHandler, PacketSource};
use franklin::packet::Packet;
use franklin::protocol::{command, Channels, Reply, RATE_CHANNELS};
use franklin::sim::{SimAdc, SimPins};
use franklin::space::Space;
use franklin::store::MemoryStore;
use franklin::{FifoBuffer, Firmware, Link, LinkConfig, Machine};

/// Microseconds per tick
pub const SAMPLE_US: u32 = 1_000;

pub type Wire = FifoBuffer<2048>;
pub type Store = MemoryStore<1024>;
pub type Board = Firmware<Wire, SimPins, SimAdc, Store>;
pub type BoardMachine = Machine<SimPins, SimAdc, Store>;

/// Packets the board sent to the host, in arrival order
#[derive(Default)]
pub struct Events {
    pub packets: Vec<(u8, Vec<u8>)>,
}

impl Events {
    /// Payloads of every received packet with `command`
    pub fn of(&self, command: u8) -> Vec<Vec<u8>> {
        self.packets
            .iter()
            .filter(|(c, _)| *c == command)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }
}

impl PacketHandler for Events {
    fn handle(&mut self, command: u8, payload: &[u8]) -> Reply {
        self.packets.push((command, payload.to_vec()));
        Reply::Ack
    }
}

struct Nothing;

impl PacketSource for Nothing {
    fn next_packet(&mut self) -> Option<Packet> {
        None
    }
}

fn transfer(from: &mut Wire, to: &mut Wire) {
    if to.extend(from.data()) {
        from.clear();
    }
}

/// A board and a host link joined by two in-memory wires
pub struct Bench {
    pub board: Board,
    pub host: Link<Wire>,
    pub events: Events,
    to_board: Wire,
    to_host: Wire,
    pub now: u32,
}

impl Bench {
    pub fn new(machine: BoardMachine) -> Self {
        let mut board = Firmware::new(Wire::new(), LinkConfig::default(), machine);
        board.start();
        let mut bench = Bench {
            board,
            host: Link::new(Wire::new(), LinkConfig::default()),
            events: Events::default(),
            to_board: Wire::new(),
            to_host: Wire::new(),
            now: 0,
        };
        bench.step();
        bench
    }

    /// Moves bytes both ways, runs both main loops once and ticks the board once
    pub fn step(&mut self) {
        self.exchange(false);
    }

    /// A step in which everything the board transmits is lost
    pub fn step_losing_board_output(&mut self) {
        self.exchange(true);
    }

    fn exchange(&mut self, lose: bool) {
        transfer(self.host.output(), &mut self.to_board);
        self.board
            .poll(&mut self.to_board, self.now)
            .expect("board link failed");
        if lose {
            self.board.link.output().clear();
        }
        transfer(self.board.link.output(), &mut self.to_host);
        self.host
            .receive(&mut self.to_host, self.now, &mut self.events)
            .expect("host link failed");
        self.host
            .poll_send(self.now, &mut Nothing)
            .expect("host link failed");
        self.now = self.now.wrapping_add(SAMPLE_US);
        self.board.tick();
    }

    pub fn run(&mut self, samples: usize) {
        for _ in 0..samples {
            self.step();
        }
    }

    /// Puts raw bytes on the wire towards the board
    pub fn inject(&mut self, bytes: &[u8]) {
        assert!(self.to_board.extend(bytes));
    }

    /// Sends `packet` once the host link is free and runs until the board answers it
    pub fn command(&mut self, packet: &Packet) -> Delivery {
        for _ in 0..200 {
            if self.host.is_idle() {
                break;
            }
            self.step();
        }
        self.host.send(packet, self.now);
        for _ in 0..200 {
            self.step();
            if let Some(delivery) = self.host.take_delivery() {
                return delivery;
            }
        }
        panic!("no answer to command {:#04x}", packet.command);
    }

    /// Runs until nothing moves and no event is outstanding
    pub fn settle(&mut self) {
        for _ in 0..20_000 {
            let machine = &self.board.machine;
            let busy = machine.planner().has_moves()
                || !machine.fragments().is_empty()
                || machine.stepper().is_running();
            if !busy && self.board.link.is_idle() {
                break;
            }
            self.step();
        }
        self.run(50);
    }

    pub fn machine(&self) -> &BoardMachine {
        &self.board.machine
    }
}

/// A motor with step and dir pins starting at `base`
pub fn wired(space: &mut Space, motor: usize, base: u8) {
    let m = &mut space.motors[motor];
    m.step = Pin::new(base, false);
    m.dir = Pin::new(base + 1, false);
    m.enable = Pin::new(base + 2, true);
}

/// A machine with one Cartesian space of `axes` axes, motor `i` wired from pin `20 + 4 * i`
pub fn cartesian(axes: usize) -> BoardMachine {
    let mut machine = Machine::new(SimPins::new(), SimAdc::new(), Store::new());
    let mut space = Space::new(kind::CARTESIAN, axes, axes).expect("cartesian space");
    for m in 0..axes {
        wired(&mut space, m, 20 + 4 * m as u8);
    }
    machine.add_space(space).expect("room for the space");
    machine
}

/// GOTO (or GOTOCB) setting the given channels of a machine with `axes` axes in total
pub fn goto(axes: usize, targets: &[(usize, f64)], callback: bool) -> Packet {
    let cmd = if callback {
        command::GOTOCB
    } else {
        command::GOTO
    };
    let mut packet = Packet::new(cmd);
    let mut channels = Channels::new(RATE_CHANNELS + axes);
    for &(axis, value) in targets {
        channels.set(RATE_CHANNELS + axis, value);
    }
    channels.write(&mut packet);
    packet
}

/// Decodes consecutive little-endian f32 values
pub fn floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
