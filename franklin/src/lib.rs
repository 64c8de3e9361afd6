//! Franklin is the motion core of a multi-architecture 3D printer and CNC controller
//!
//! The crate holds everything that runs on the controller board and everything the host needs to
//! talk to it:
//!
//!   * the packet codec with its per-group check bytes ([`packet`], [`checksum`])
//!   * the link engine that acknowledges, retransmits and deduplicates packets ([`link`])
//!   * the motion pipeline: the move [`planner`] produces step fragments that the real-time
//!     [`stepper`] tick consumes
//!   * the geometries mapping axis positions to motor positions ([`kinematics`])
//!   * persisted settings ([`store`], [`object`]) and heater control ([`temp`])
//!   * the bare-board sub-protocol ([`hwc`])
//!
//! The crate is `no_std`. Enabling the `std` feature adds a critical-section implementation and
//! `Vec`-backed buffers for hosted targets. The table-driven hardware in [`sim`] backs the
//! simulator and the tests.
//!
//! A board port supplies three collaborators: a [`TransportOutput`] for the transmit side, and
//! [`hal::Pins`] plus [`hal::Adc`] for the hardware. With those it builds a [`Firmware`]:
//! ```ignore
//! let machine = Machine::new(pins, adc, eeprom);
//! let mut firmware = Firmware::new(&TX_BUFFER, LinkConfig::default(), machine);
//! firmware.start();
//! loop {
//!     let mut input = SliceInputBuffer::new(rx.data());
//!     firmware.poll(&mut input, clock.micros())?;
//!     rx.pop(rx.len() - input.available());
//! }
//! ```
//! The board timer calls [`Firmware::tick`] once per sample. The tick and the main loop only
//! share the fragment queue, which hands fragments over inside critical sections.
//!
//! The host side drives the same [`link::Link`] against the serial device, with its own
//! [`link::PacketHandler`] receiving the firmware's events.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

pub mod checksum;
pub mod encoding;
pub mod input_buffer;
pub mod output_buffer;
pub mod packet;
pub mod protocol;
pub mod transport_output;

pub mod link;

pub mod fragment;
pub mod planner;
pub mod ring;
pub mod stepper;

pub mod kinematics;
pub mod object;
pub mod space;
pub mod store;
pub mod temp;

pub mod hal;
pub mod hwc;
pub mod sim;

mod firmware;
mod machine;

mod fifo_buffer;

pub use fifo_buffer::FifoBuffer;
pub use firmware::Firmware;
pub use input_buffer::{InputBuffer, SliceInputBuffer};
pub use link::{Link, LinkConfig, LinkError};
pub use machine::Machine;
pub use output_buffer::{OutputBuffer, ScratchOutput};
pub use transport_output::TransportOutput;
