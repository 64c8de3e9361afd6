//! The firmware core running on the host against simulated hardware

use crate::serial::Port;
use crate::store::FileStore;
use anyhow::Result;
use franklin::hal::Clock;
use franklin::sim::{SimAdc, SimPins};
use franklin::store::Store;
use franklin::{Firmware, LinkConfig, Machine};
use log::{debug, warn};
use std::time::Duration;

/// Most ticks run in one poll; a simulator that fell further behind skips the rest
const MAX_CATCH_UP: u32 = 100;

pub type SimMachine<S> = Machine<SimPins, SimAdc, S>;

pub struct Simulator<C: Clock, S: Store> {
    firmware: Firmware<Vec<u8>, SimPins, SimAdc, S>,
    clock: C,
    input: Vec<u8>,
    sample_us: u32,
    next_tick: u32,
}

impl<C: Clock, S: Store> Simulator<C, S> {
    pub fn new(machine: SimMachine<S>, config: LinkConfig, clock: C) -> Self {
        let sample_us = ((machine.sample_time() * 1e6).round() as u32).max(1);
        let mut firmware = Firmware::new(Vec::new(), config, machine);
        firmware.start();
        let next_tick = clock.micros().wrapping_add(sample_us);
        Simulator {
            firmware,
            clock,
            input: Vec::new(),
            sample_us,
            next_tick,
        }
    }

    /// Microseconds per tick
    pub fn sample_us(&self) -> u32 {
        self.sample_us
    }

    /// Queues bytes from the host
    pub fn receive(&mut self, bytes: &[u8]) {
        self.input.extend_from_slice(bytes);
    }

    /// Runs the ticks that came due and one pass of the main loop; returns the bytes to send
    pub fn poll(&mut self) -> Vec<u8> {
        let now = self.clock.micros();
        let mut ticks = 0;
        while now.wrapping_sub(self.next_tick) as i32 >= 0 {
            if ticks == MAX_CATCH_UP {
                warn!("simulator fell behind, skipping ticks");
                self.next_tick = now.wrapping_add(self.sample_us);
                break;
            }
            self.firmware.tick();
            self.next_tick = self.next_tick.wrapping_add(self.sample_us);
            ticks += 1;
        }

        // Failures are logged and recovered by the firmware itself.
        if self.firmware.poll(&mut self.input, now).is_err() {
            debug!("link reset after a failure");
        }
        std::mem::take(self.firmware.link.output())
    }

    pub fn machine(&self) -> &SimMachine<S> {
        &self.firmware.machine
    }

    pub fn machine_mut(&mut self) -> &mut SimMachine<S> {
        &mut self.firmware.machine
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}

/// Runs `sim` against `port` until the port fails
///
/// Settings the firmware saves are written to the store's file right away.
pub fn serve<C: Clock>(sim: &mut Simulator<C, FileStore>, port: &mut impl Port) -> Result<()> {
    let wait = Duration::from_micros(sim.sample_us() as u64);
    let mut incoming = Vec::new();
    loop {
        incoming.clear();
        port.recv(&mut incoming, wait)?;
        sim.receive(&incoming);
        let outgoing = sim.poll();
        if !outgoing.is_empty() {
            port.send(&outgoing)?;
        }
        let store = sim.machine_mut().store_mut();
        if store.is_dirty() {
            store.flush()?;
        }
    }
}

/// A simulator on a simulated clock, seen as a port
///
/// Each millisecond of waiting in `recv` advances the clock by one tick.
#[cfg(test)]
pub struct Loopback {
    pub sim: Simulator<franklin::sim::SimClock, franklin::store::MemoryStore<1024>>,
}

#[cfg(test)]
impl Loopback {
    pub fn new(machine: SimMachine<franklin::store::MemoryStore<1024>>) -> Self {
        Loopback {
            sim: Simulator::new(
                machine,
                LinkConfig::default(),
                franklin::sim::SimClock::new(),
            ),
        }
    }
}

#[cfg(test)]
impl Port for Loopback {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.sim.receive(data);
        Ok(())
    }

    fn recv(&mut self, into: &mut Vec<u8>, timeout: Duration) -> Result<usize> {
        let steps = (timeout.as_millis() as u32).max(1);
        for _ in 0..steps {
            self.sim.clock().advance(self.sim.sample_us());
            let out = self.sim.poll();
            if !out.is_empty() {
                into.extend_from_slice(&out);
                return Ok(out.len());
            }
        }
        Ok(0)
    }

    fn now(&self) -> u32 {
        self.sim.clock().micros()
    }
}
