//! Packet framing
//!
//! A packet on the wire is
//!
//! | byte              | content                                  |
//! |-------------------|------------------------------------------|
//! | 0                 | `length`, the number of frame bytes      |
//! | 1                 | command, bit 7 carries the flip-flop bit |
//! | 2 .. length       | payload                                  |
//! | length ..         | `ceil(length / 3)` check bytes           |
//!
//! Bit 7 of the length byte is always clear, which is what separates a packet from a single-byte
//! control code. Lengths 0, 1, 2 and 4 are never valid; a sender pads short payloads with zeros.

use crate::checksum;
use crate::encoding::Writable;
use crate::output_buffer::OutputBuffer;
use log::error;

/// Largest valid value of the length byte
pub const MAX_LENGTH: usize = 0x7F;
/// Length and command byte
pub const HEADER_SIZE: usize = 2;
/// Largest payload a single packet can carry
pub const MAX_PAYLOAD: usize = MAX_LENGTH - HEADER_SIZE;
/// Flip-flop bit within the command byte
pub const FLIPFLOP_BIT: u8 = 0x80;
/// Mask of the command code within the command byte
pub const COMMAND_MASK: u8 = 0x7F;

/// Error type for a frame that must be rejected with a NACK
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("invalid packet length {0}")]
    InvalidLength(u8),
    #[error("bad check byte for group {0}")]
    Checksum(usize),
    #[error("packet incomplete")]
    Truncated,
    #[error("payload of {0} bytes does not fit in a packet")]
    TooLong(usize),
}

/// Returns whether `len` may appear in a length byte
pub const fn is_valid_length(len: usize) -> bool {
    len <= MAX_LENGTH && !matches!(len, 0 | 1 | 2 | 4)
}

/// Number of bytes a packet with length byte `len` occupies on the wire
pub const fn wire_length(len: usize) -> usize {
    len + checksum::checksum_len(len)
}

/// Smallest valid frame length able to hold `payload_len` payload bytes
pub const fn padded_length(payload_len: usize) -> usize {
    let len = HEADER_SIZE + payload_len;
    if len == 2 || len == 4 {
        len + 1
    } else {
        len
    }
}

/// A validated incoming packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub command: u8,
    pub flipflop: bool,
    pub payload: &'a [u8],
}

/// Validates the packet at the start of `wire`
///
/// `wire` must hold at least `wire_length(wire[0])` bytes.
pub fn decode(wire: &[u8]) -> Result<Frame<'_>, PacketError> {
    let len = *wire.first().ok_or(PacketError::Truncated)? as usize;
    if !is_valid_length(len) {
        return Err(PacketError::InvalidLength(len as u8));
    }
    if wire.len() < wire_length(len) {
        return Err(PacketError::Truncated);
    }
    let (frame, checks) = wire.split_at(len);
    for (tag, check) in checks[..checksum::checksum_len(len)].iter().enumerate() {
        let group = checksum::group(frame, tag);
        if !checksum::validate(tag as u8, &group, *check) {
            return Err(PacketError::Checksum(tag));
        }
    }
    Ok(Frame {
        command: frame[1] & COMMAND_MASK,
        flipflop: frame[1] & FLIPFLOP_BIT != 0,
        payload: &frame[HEADER_SIZE..],
    })
}

/// Frames `payload` and appends the complete packet to `output`
///
/// Nothing is written when the payload exceeds [`MAX_PAYLOAD`].
pub fn encode(
    output: &mut impl OutputBuffer,
    command: u8,
    flipflop: bool,
    payload: &[u8],
) -> Result<(), PacketError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(PacketError::TooLong(payload.len()));
    }
    write_frame(output, command, flipflop, payload);
    Ok(())
}

fn write_frame(output: &mut impl OutputBuffer, command: u8, flipflop: bool, payload: &[u8]) {
    let len = padded_length(payload.len());
    let start = output.cur_position();
    let command = (command & COMMAND_MASK) | if flipflop { FLIPFLOP_BIT } else { 0 };
    output.output(&[len as u8, command]);
    output.output(payload);
    for _ in HEADER_SIZE + payload.len()..len {
        output.output(&[0]);
    }

    let mut checks = [0u8; checksum::checksum_len(MAX_LENGTH)];
    let count = checksum::checksum_len(len);
    {
        let frame = output.data_since(start);
        for (tag, check) in checks[..count].iter_mut().enumerate() {
            *check = checksum::compute(tag as u8, &checksum::group(frame, tag));
        }
    }
    output.output(&checks[..count]);
}

/// An outgoing packet waiting for the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: u8,
    pub payload: heapless::Vec<u8, MAX_PAYLOAD>,
}

impl Packet {
    pub fn new(command: u8) -> Self {
        Packet {
            command,
            payload: heapless::Vec::new(),
        }
    }

    /// Appends a field to the payload
    pub fn with(mut self, value: impl Writable) -> Self {
        self.push(value);
        self
    }

    /// Appends a field to the payload in place
    ///
    /// Overflowing the payload is a bug in the caller: debug builds panic, release builds log
    /// the command and keep the truncated payload.
    pub fn push(&mut self, value: impl Writable) -> &mut Self {
        let mut sink = Bounded {
            payload: &mut self.payload,
            overflow: false,
        };
        value.write(&mut sink);
        let overflow = sink.overflow;
        debug_assert!(
            !overflow,
            "payload of command {:#04x} exceeds {MAX_PAYLOAD} bytes",
            self.command
        );
        if overflow {
            error!("payload of command {:#04x} truncated", self.command);
        }
        self
    }

    /// Frames the packet with the given flip-flop bit
    pub fn encode(&self, flipflop: bool, output: &mut impl OutputBuffer) {
        write_frame(output, self.command, flipflop, &self.payload)
    }
}

/// Payload sink that remembers whether anything was cut off
struct Bounded<'a> {
    payload: &'a mut heapless::Vec<u8, MAX_PAYLOAD>,
    overflow: bool,
}

impl OutputBuffer for Bounded<'_> {
    type Cursor = usize;

    fn output(&mut self, buf: &[u8]) {
        if self.payload.len() + buf.len() > MAX_PAYLOAD {
            self.overflow = true;
        }
        self.payload.output(buf)
    }

    fn cur_position(&self) -> usize {
        self.payload.cur_position()
    }

    fn data_since(&self, cursor: usize) -> &[u8] {
        self.payload.data_since(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output_buffer::ScratchOutput;

    fn framed(command: u8, flipflop: bool, payload: &[u8]) -> ScratchOutput {
        let mut out = ScratchOutput::new();
        encode(&mut out, command, flipflop, payload).unwrap();
        out
    }

    #[test]
    fn degenerate_lengths_are_padded() {
        let out = framed(0x01, false, &[]);
        assert_eq!(out.result()[0], 3);
        assert_eq!(out.result().len(), wire_length(3));

        let out = framed(0x01, false, &[7, 8]);
        assert_eq!(out.result()[0], 5);
        let frame = decode(out.result()).unwrap();
        assert_eq!(frame.payload, &[7, 8, 0]);
    }

    #[test]
    fn decode_recovers_command_and_flipflop() {
        let out = framed(0x02, true, &[1, 2, 3, 4, 5]);
        let frame = decode(out.result()).unwrap();
        assert_eq!(frame.command, 0x02);
        assert!(frame.flipflop);
        assert_eq!(frame.payload, &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn invalid_lengths_are_rejected() {
        for len in [0u8, 1, 2, 4] {
            assert_eq!(
                decode(&[len, 0, 0, 0, 0, 0, 0, 0]),
                Err(PacketError::InvalidLength(len))
            );
        }
    }

    #[test]
    fn corrupted_byte_fails_its_group() {
        let out = framed(0x05, false, &[9, 9, 9, 9, 9, 9, 9]);
        let mut wire = out.result().to_vec();
        wire[4] ^= 0x10;
        assert_eq!(decode(&wire), Err(PacketError::Checksum(1)));
    }

    #[test]
    fn oversized_payloads_are_refused() {
        let mut out = ScratchOutput::<256>::new();
        let payload = [0u8; MAX_PAYLOAD + 1];
        assert_eq!(
            encode(&mut out, 0x05, false, &payload),
            Err(PacketError::TooLong(MAX_PAYLOAD + 1))
        );
        assert!(out.result().is_empty());
        assert!(encode(&mut out, 0x05, false, &payload[..MAX_PAYLOAD]).is_ok());
        assert_eq!(out.result()[0] as usize, MAX_LENGTH);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "exceeds")]
    fn overfilled_packet_is_a_bug() {
        let mut packet = Packet::new(0x22);
        packet.push(&[0u8; MAX_PAYLOAD][..]);
        packet.push(1u8);
    }

    #[test]
    fn truncated_packets_are_reported() {
        let out = framed(0x05, false, &[1, 2, 3]);
        let wire = out.result();
        assert_eq!(decode(&wire[..wire.len() - 1]), Err(PacketError::Truncated));
    }
}
