use franklin::hal::Clock;
use lazy_static::lazy_static;
use std::time::Instant;

/// Microseconds since the first call, wrapping at 32 bits like a board timer
pub fn micros() -> u32 {
    lazy_static! {
        static ref BEGIN: Instant = Instant::now();
    }
    (BEGIN.elapsed().as_micros() & 0xFFFF_FFFF) as u32
}

/// Wall-clock time source for the simulator
#[derive(Debug, Default, Clone, Copy)]
pub struct HostClock;

impl Clock for HostClock {
    fn micros(&self) -> u32 {
        micros()
    }
}
