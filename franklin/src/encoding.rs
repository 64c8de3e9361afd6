use crate::output_buffer::OutputBuffer;

/// Error type for representing a failed read
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("payload too short")]
pub struct ReadError;

/// Trait implemented for types that can be read from a packet payload
///
/// The `'de` lifetime allows the implementation to return references to the original data buffer.
/// This permits zero-copy reading of trailing byte arrays.
pub trait Readable<'de>: Sized {
    /// Attempt to read a `Self` from the input buffer, advancing the buffer if successful.
    ///
    /// If the operation fails, `data` should not be advanced and a `ReadError` should be
    /// returned.
    fn read(data: &mut &'de [u8]) -> Result<Self, ReadError>;
}

/// Trait implemented for types that can be written to an `OutputBuffer`
pub trait Writable: Sized {
    /// Outputs the type to an `OutputBuffer`
    ///
    /// This operation cannot fail. An overfull buffer truncates the message, which the peer will
    /// then reject. It is up to the user to avoid this situation.
    fn write(&self, output: &mut impl OutputBuffer);
}

pub(crate) fn take<'de, const N: usize>(data: &mut &'de [u8]) -> Result<[u8; N], ReadError> {
    if data.len() < N {
        return Err(ReadError);
    }
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&data[..N]);
    *data = &data[N..];
    Ok(bytes)
}

macro_rules! le_readwrite {
    ( $type:tt ) => {
        impl Readable<'_> for $type {
            fn read(data: &mut &[u8]) -> Result<Self, ReadError> {
                take(data).map($type::from_le_bytes)
            }
        }

        impl Writable for $type {
            fn write(&self, output: &mut impl OutputBuffer) {
                output.output(&self.to_le_bytes())
            }
        }
    };
}

le_readwrite!(u8);
le_readwrite!(u16);
le_readwrite!(u32);
le_readwrite!(i32);
le_readwrite!(f32);

impl Readable<'_> for bool {
    fn read(data: &mut &[u8]) -> Result<Self, ReadError> {
        u8::read(data).map(|v| v != 0)
    }
}

impl Writable for bool {
    fn write(&self, output: &mut impl OutputBuffer) {
        output.output(&[u8::from(*self)])
    }
}

/// Reads all remaining bytes
impl<'de> Readable<'de> for &'de [u8] {
    fn read(data: &mut &'de [u8]) -> Result<&'de [u8], ReadError> {
        let ret = *data;
        *data = &[];
        Ok(ret)
    }
}

impl Writable for &[u8] {
    fn write(&self, output: &mut impl OutputBuffer) {
        output.output(self);
    }
}

/// Reads a float and widens it for the kinematics math
pub fn read_f64(data: &mut &[u8]) -> Result<f64, ReadError> {
    f32::read(data).map(f64::from)
}
