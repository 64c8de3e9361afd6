//! Command and event codes of the host ↔ firmware protocol

use crate::encoding::{read_f64, ReadError, Readable};
use crate::packet::Packet;

/// Protocol version exchanged in BEGIN/START
pub const PROTOCOL_VERSION: u8 = 1;

/// Single-byte control codes, sent without framing
pub mod control {
    pub const ACK: u8 = 0x80;
    pub const NACK: u8 = 0xE1;
    pub const ACKWAIT: u8 = 0xD2;
    pub const STALL: u8 = 0xB3;
    pub const RESET: u8 = 0xF4;
    pub const INIT: u8 = 0x95;
    pub const ACKRESET: u8 = 0xA6;
}

/// Commands sent by the host
pub mod command {
    pub const BEGIN: u8 = 0x00;
    pub const PING: u8 = 0x01;
    pub const GOTO: u8 = 0x02;
    pub const GOTOCB: u8 = 0x03;
    pub const RUN: u8 = 0x04;
    pub const SLEEP: u8 = 0x05;
    pub const SETTEMP: u8 = 0x06;
    pub const WAITTEMP: u8 = 0x07;
    pub const READTEMP: u8 = 0x08;
    pub const LOAD: u8 = 0x09;
    pub const SAVE: u8 = 0x0A;
    pub const READ: u8 = 0x0B;
    pub const WRITE: u8 = 0x0C;
    pub const PAUSE: u8 = 0x0D;
    pub const STOP: u8 = 0x0E;
    pub const TOOL: u8 = 0x0F;
    pub const GETPOS: u8 = 0x10;
}

/// Events sent by the firmware
pub mod event {
    pub const START: u8 = 0x20;
    pub const TEMP: u8 = 0x21;
    pub const DATA: u8 = 0x22;
    pub const PONG: u8 = 0x23;
    pub const MOVECB: u8 = 0x24;
    pub const TEMPCB: u8 = 0x25;
    pub const CONTINUE: u8 = 0x26;
    pub const LIMIT: u8 = 0x27;
    pub const SENSE: u8 = 0x28;
    pub const POSITION: u8 = 0x29;
}

/// Reply sent in answer to an accepted packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Command applied
    Ack,
    /// Command applied, do not send more moves until CONTINUE
    AckWait,
    /// Command rejected, nothing was applied
    Stall,
}

impl Reply {
    pub const fn code(self) -> u8 {
        match self {
            Reply::Ack => control::ACK,
            Reply::AckWait => control::ACKWAIT,
            Reply::Stall => control::STALL,
        }
    }
}

/// Channel index of the start rate in a GOTO
pub const CHANNEL_F0: usize = 0;
/// Channel index of the end rate in a GOTO
pub const CHANNEL_F1: usize = 1;
/// Number of leading rate channels in a GOTO
pub const RATE_CHANNELS: usize = 2;
/// Largest number of channels a GOTO can address
pub const MAX_CHANNELS: usize = 32;

/// Channel values decoded from a GOTO payload
///
/// Channels absent from the mask are NaN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Channels {
    values: [f64; MAX_CHANNELS],
    count: usize,
}

impl Channels {
    pub fn new(count: usize) -> Self {
        Channels {
            values: [f64::NAN; MAX_CHANNELS],
            count: count.min(MAX_CHANNELS),
        }
    }

    /// Decodes `mask bytes, f32 per set bit` for a machine with `count` channels
    pub fn read(data: &mut &[u8], count: usize) -> Result<Self, ReadError> {
        let mut channels = Channels::new(count);
        let used = mask_len(channels.count);
        let mut mask = [0u8; mask_len(MAX_CHANNELS)];
        for byte in mask[..used].iter_mut() {
            *byte = u8::read(data)?;
        }
        for c in 0..channels.count {
            if mask[c / 8] & (1 << (c % 8)) != 0 {
                channels.values[c] = read_f64(data)?;
            }
        }
        Ok(channels)
    }

    /// Encodes the present (non-NaN) channels
    pub fn write(&self, packet: &mut Packet) {
        let mut mask = [0u8; mask_len(MAX_CHANNELS)];
        for (c, v) in self.values().iter().enumerate() {
            if !v.is_nan() {
                mask[c / 8] |= 1 << (c % 8);
            }
        }
        for byte in &mask[..mask_len(self.count)] {
            packet.push(*byte);
        }
        for v in self.values().iter().filter(|v| !v.is_nan()) {
            packet.push(*v as f32);
        }
    }

    pub fn set(&mut self, channel: usize, value: f64) {
        if channel < self.count {
            self.values[channel] = value;
        }
    }

    pub fn get(&self, channel: usize) -> f64 {
        self.values()
            .get(channel)
            .copied()
            .unwrap_or(f64::NAN)
    }

    pub fn values(&self) -> &[f64] {
        &self.values[..self.count]
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

const fn mask_len(count: usize) -> usize {
    (count + 7) / 8
}

/// Kind byte of an object identifier
pub mod object_kind {
    pub const SPACE: u8 = 0;
    pub const AXIS: u8 = 1;
    pub const MOTOR: u8 = 2;
    pub const TEMP: u8 = 3;
    pub const ALL: u8 = 0xFF;
}

/// Identifies a persisted object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectId {
    Space(u8),
    Axis { space: u8, axis: u8 },
    Motor { space: u8, motor: u8 },
    Temp(u8),
    All,
}

impl Readable<'_> for ObjectId {
    fn read(data: &mut &[u8]) -> Result<Self, ReadError> {
        let mut cursor = *data;
        let kind = u8::read(&mut cursor)?;
        let index = u8::read(&mut cursor).unwrap_or(0);
        let sub = u8::read(&mut cursor).unwrap_or(0);
        let id = match kind {
            object_kind::SPACE => ObjectId::Space(index),
            object_kind::AXIS => ObjectId::Axis {
                space: index,
                axis: sub,
            },
            object_kind::MOTOR => ObjectId::Motor {
                space: index,
                motor: sub,
            },
            object_kind::TEMP => ObjectId::Temp(index),
            object_kind::ALL => ObjectId::All,
            _ => return Err(ReadError),
        };
        *data = cursor;
        Ok(id)
    }
}

impl ObjectId {
    pub fn to_bytes(self) -> [u8; 3] {
        match self {
            ObjectId::Space(s) => [object_kind::SPACE, s, 0],
            ObjectId::Axis { space, axis } => [object_kind::AXIS, space, axis],
            ObjectId::Motor { space, motor } => [object_kind::MOTOR, space, motor],
            ObjectId::Temp(t) => [object_kind::TEMP, t, 0],
            ObjectId::All => [object_kind::ALL, 0, 0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_mask_selects_present_values() {
        let mut packet = Packet::new(command::GOTO);
        let mut channels = Channels::new(4);
        channels.set(2, 10.0);
        channels.write(&mut packet);
        assert_eq!(packet.payload.len(), 1 + 4);
        assert_eq!(packet.payload[0], 0b0100);

        let decoded = Channels::read(&mut &packet.payload[..], 4).unwrap();
        assert!(decoded.get(0).is_nan());
        assert_eq!(decoded.get(2), 10.0);
    }

    #[test]
    fn mask_spans_bytes_for_many_channels() {
        let mut payload = vec![0u8, 0b10];
        payload.extend_from_slice(&2.5f32.to_le_bytes());
        let decoded = Channels::read(&mut &payload[..], 10).unwrap();
        assert_eq!(decoded.get(9), 2.5);
        assert!(decoded.get(1).is_nan());
    }

    #[test]
    fn missing_channel_value_is_an_error() {
        assert_eq!(Channels::read(&mut &[0b11u8, 0, 0][..], 2), Err(ReadError));
    }

    #[test]
    fn object_ids_reject_unknown_kinds() {
        assert_eq!(ObjectId::read(&mut &[7u8, 0, 0][..]), Err(ReadError));
        assert_eq!(
            ObjectId::read(&mut &[2u8, 1, 3][..]),
            Ok(ObjectId::Motor { space: 1, motor: 3 })
        );
    }
}
