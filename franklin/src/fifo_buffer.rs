/// Fixed-capacity byte queue for the serial paths
///
/// On the receive side the driver appends what the UART delivered and the link pops what it
/// consumed. On the transmit side the link appends whole packets and control codes and the
/// driver drains them.
pub struct FifoBuffer<const N: usize> {
    bytes: [u8; N],
    used: usize,
}

impl<const N: usize> FifoBuffer<N> {
    /// Const so that it can initialise a `static` shared with an interrupt handler
    pub const fn new() -> Self {
        FifoBuffer {
            bytes: [0u8; N],
            used: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn len(&self) -> usize {
        self.used
    }

    /// Appends `buf` whole, or nothing when it does not fit
    ///
    /// A dropped packet is recovered by the sender's retransmission timer.
    pub fn extend(&mut self, buf: &[u8]) -> bool {
        let end = self.used + buf.len();
        if end > N {
            log::warn!("fifo overrun, dropping {} bytes", buf.len());
            return false;
        }
        self.bytes[self.used..end].copy_from_slice(buf);
        self.used = end;
        true
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes[..self.used]
    }

    /// Drops `n` bytes from the front, shifting the rest down
    pub fn pop(&mut self, n: usize) {
        let n = n.min(self.used);
        self.bytes.copy_within(n..self.used, 0);
        self.used -= n;
    }

    pub fn clear(&mut self) {
        self.used = 0;
    }
}

impl<const N: usize> Default for FifoBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_keeps_the_tail() {
        let mut fifo = FifoBuffer::<8>::new();
        assert!(fifo.extend(&[1, 2, 3, 4]));
        fifo.pop(3);
        assert_eq!(fifo.data(), &[4]);
        fifo.pop(10);
        assert!(fifo.is_empty());
    }

    #[test]
    fn oversized_writes_are_dropped_whole() {
        let mut fifo = FifoBuffer::<4>::new();
        assert!(fifo.extend(&[1, 2, 3]));
        assert!(!fifo.extend(&[4, 5]));
        assert_eq!(fifo.data(), &[1, 2, 3]);
        assert!(fifo.extend(&[4]));
        assert_eq!(fifo.len(), 4);
    }
}
