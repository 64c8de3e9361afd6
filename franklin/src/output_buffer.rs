/// Sink for encoded bytes
///
/// Framing appends the header and payload first and then reads them back through a cursor to
/// compute the check bytes, so every sink must be able to hand out what it received since a
/// remembered position.
pub trait OutputBuffer {
    type Cursor: Copy;

    /// Appends `buf`; bytes past the capacity of a bounded sink are dropped
    fn output(&mut self, buf: &[u8]);

    fn output_byte(&mut self, byte: u8) {
        self.output(&[byte])
    }

    /// Position of the next byte to be appended
    fn cur_position(&self) -> Self::Cursor;

    /// Everything appended since `cursor` was taken
    fn data_since(&self, cursor: Self::Cursor) -> &[u8];
}

/// Largest number of bytes a single framed packet occupies on the wire
pub const WIRE_MAX: usize = 192;

/// Inline buffer for a single framed packet
///
/// The link keeps the last transmitted packet in one of these so that a retransmission is
/// byte-for-byte identical to the original.
#[derive(Clone)]
pub struct ScratchOutput<const N: usize = WIRE_MAX> {
    bytes: heapless::Vec<u8, N>,
}

impl<const N: usize> ScratchOutput<N> {
    pub const fn new() -> Self {
        ScratchOutput {
            bytes: heapless::Vec::new(),
        }
    }

    pub fn result(&self) -> &[u8] {
        &self.bytes
    }

    pub fn reset(&mut self) {
        self.bytes.clear();
    }
}

impl<const N: usize> Default for ScratchOutput<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> OutputBuffer for ScratchOutput<N> {
    type Cursor = usize;

    fn output(&mut self, buf: &[u8]) {
        self.bytes.output(buf)
    }

    fn cur_position(&self) -> usize {
        self.bytes.len()
    }

    fn data_since(&self, cursor: usize) -> &[u8] {
        self.bytes.data_since(cursor)
    }
}

impl<const N: usize> OutputBuffer for heapless::Vec<u8, N> {
    type Cursor = usize;

    fn output(&mut self, buf: &[u8]) {
        let room = (N - self.len()).min(buf.len());
        // `room` always fits
        let _ = self.extend_from_slice(&buf[..room]);
    }

    fn cur_position(&self) -> usize {
        self.len()
    }

    fn data_since(&self, cursor: usize) -> &[u8] {
        self.get(cursor..).unwrap_or(&[])
    }
}

#[cfg(any(feature = "std", test))]
impl OutputBuffer for Vec<u8> {
    type Cursor = usize;

    fn output(&mut self, buf: &[u8]) {
        self.extend_from_slice(buf)
    }

    fn cur_position(&self) -> usize {
        self.len()
    }

    fn data_since(&self, cursor: usize) -> &[u8] {
        self.get(cursor..).unwrap_or(&[])
    }
}
