use crate::fifo_buffer::FifoBuffer;
use core::cell::RefCell;
use critical_section::Mutex;

/// Trait representing the capability to put raw bytes on the link
///
/// The link engine hands over complete units only: a whole framed packet or a single control
/// byte. Implementations must either transmit the unit entirely or drop it entirely.
pub trait TransportOutput {
    /// Queue `data` for transmission
    fn output(&mut self, data: &[u8]);
}

impl<T> TransportOutput for &mut T
where
    T: TransportOutput,
{
    fn output(&mut self, data: &[u8]) {
        (**self).output(data)
    }
}

impl<const BUF_SIZE: usize> TransportOutput for FifoBuffer<BUF_SIZE> {
    fn output(&mut self, data: &[u8]) {
        self.extend(data);
    }
}

/// A transmit FIFO shared with the interrupt handler that drains it
///
/// Appends run inside a critical section, so a UART interrupt never observes half a packet.
pub struct SharedTxBuffer<const BUF_SIZE: usize> {
    inner: Mutex<RefCell<FifoBuffer<BUF_SIZE>>>,
}

impl<const BUF_SIZE: usize> SharedTxBuffer<BUF_SIZE> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(FifoBuffer::new())),
        }
    }

    /// Moves up to `into.len()` queued bytes into `into`, returning the count
    pub fn drain_into(&self, into: &mut [u8]) -> usize {
        critical_section::with(|cs| {
            let mut fifo = self.inner.borrow_ref_mut(cs);
            let n = fifo.len().min(into.len());
            into[..n].copy_from_slice(&fifo.data()[..n]);
            fifo.pop(n);
            n
        })
    }
}

impl<const BUF_SIZE: usize> Default for SharedTxBuffer<BUF_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const BUF_SIZE: usize> TransportOutput for &SharedTxBuffer<BUF_SIZE> {
    fn output(&mut self, data: &[u8]) {
        critical_section::with(|cs| {
            self.inner.borrow_ref_mut(cs).extend(data);
        });
    }
}

#[cfg(any(feature = "std", test))]
impl TransportOutput for Vec<u8> {
    fn output(&mut self, data: &[u8]) {
        self.extend_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_buffer_drains_in_order() {
        let shared = SharedTxBuffer::<16>::new();
        let mut tx = &shared;
        tx.output(&[1, 2, 3]);
        tx.output(&[4]);

        let mut chunk = [0u8; 3];
        assert_eq!(shared.drain_into(&mut chunk), 3);
        assert_eq!(chunk, [1, 2, 3]);
        assert_eq!(shared.drain_into(&mut chunk), 1);
        assert_eq!(chunk[0], 4);
        assert_eq!(shared.drain_into(&mut chunk), 0);
    }
}
