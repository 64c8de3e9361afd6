use crate::fifo_buffer::FifoBuffer;

/// Source of raw link bytes
///
/// The link engine only removes what it fully consumed. A partially received packet stays in
/// place until the rest of it arrives or its reassembly deadline passes.
pub trait InputBuffer {
    fn data(&self) -> &[u8];

    /// Discards `count` bytes from the front
    fn pop(&mut self, count: usize);

    fn available(&self) -> usize {
        self.data().len()
    }
}

/// Borrowed bytes, e.g. a DMA receive window
///
/// After a `receive` the caller compares `available()` with the original length to learn how
/// much of its own buffer it may release.
pub struct SliceInputBuffer<'a> {
    rest: &'a [u8],
}

impl<'a> SliceInputBuffer<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        SliceInputBuffer { rest: bytes }
    }
}

impl InputBuffer for SliceInputBuffer<'_> {
    fn data(&self) -> &[u8] {
        self.rest
    }

    fn pop(&mut self, count: usize) {
        self.rest = &self.rest[count.min(self.rest.len())..];
    }
}

impl<const N: usize> InputBuffer for FifoBuffer<N> {
    fn data(&self) -> &[u8] {
        FifoBuffer::data(self)
    }

    fn pop(&mut self, count: usize) {
        FifoBuffer::pop(self, count)
    }
}

#[cfg(any(feature = "std", test))]
impl InputBuffer for Vec<u8> {
    fn data(&self) -> &[u8] {
        self
    }

    fn pop(&mut self, count: usize) {
        self.drain(..count.min(self.len()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_pops_past_the_end() {
        let bytes = [1, 2, 3];
        let mut input = SliceInputBuffer::new(&bytes);
        input.pop(2);
        assert_eq!(input.data(), &[3]);
        input.pop(5);
        assert_eq!(input.available(), 0);
    }
}
