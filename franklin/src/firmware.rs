use crate::hal::{Adc, Pins};
use crate::input_buffer::InputBuffer;
use crate::link::{Link, LinkConfig, LinkError};
use crate::machine::Machine;
use crate::store::Store;
use crate::transport_output::TransportOutput;
use log::error;

/// A link bound to a machine: the firmware main loop
pub struct Firmware<O: TransportOutput, P: Pins, A: Adc, S: Store> {
    pub link: Link<O>,
    pub machine: Machine<P, A, S>,
}

impl<O: TransportOutput, P: Pins, A: Adc, S: Store> Firmware<O, P, A, S> {
    pub fn new(output: O, config: LinkConfig, machine: Machine<P, A, S>) -> Self {
        Firmware {
            link: Link::new(output, config),
            machine,
        }
    }

    /// Announces the firmware to the host with INIT
    pub fn start(&mut self) {
        self.link.announce();
    }

    /// One pass of the main loop
    ///
    /// Feeds received bytes to the link, services the machine and sends the next pending
    /// event. A link failure aborts all motion and resets the link before it is returned.
    pub fn poll(&mut self, input: &mut impl InputBuffer, now: u32) -> Result<(), LinkError> {
        let result = self
            .link
            .receive(input, now, &mut self.machine)
            .and_then(|()| {
                self.machine.service();
                self.link.poll_send(now, self.machine.outbox_mut())
            });
        if let Err(e) = result {
            error!("{e}, aborting motion");
            self.machine.abort();
            self.machine.outbox_mut().clear();
            self.link.reset();
        }
        result
    }

    /// The real-time tick
    pub fn tick(&mut self) {
        self.machine.tick();
    }
}
