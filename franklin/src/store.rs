//! Byte-addressable settings storage
//!
//! Objects serialize themselves field by field through the primitives below, each of which
//! advances an address cursor. The same code writes EEPROM images and READ/WRITE payloads.

use crate::packet::MAX_PAYLOAD;

/// Magic bytes at address 0 of a settings image
pub const MAGIC: [u8; 2] = *b"FR";
/// Layout version following the magic
pub const FORMAT_VERSION: u16 = 1;
/// Magic plus version
pub const HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("address {0} outside the store")]
    OutOfRange(usize),
    #[error("no settings image")]
    BadHeader,
    #[error("unsupported settings format {0}")]
    Version(u16),
    #[error("invalid stored value")]
    Invalid,
}

pub trait Store {
    fn len(&self) -> usize;
    fn read(&self, addr: usize) -> Result<u8, StoreError>;
    fn write(&mut self, addr: usize, value: u8) -> Result<(), StoreError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Store> Store for &mut T {
    fn len(&self) -> usize {
        (**self).len()
    }
    fn read(&self, addr: usize) -> Result<u8, StoreError> {
        (**self).read(addr)
    }
    fn write(&mut self, addr: usize, value: u8) -> Result<(), StoreError> {
        (**self).write(addr, value)
    }
}

pub fn read_u8(store: &impl Store, addr: &mut usize) -> Result<u8, StoreError> {
    let value = store.read(*addr)?;
    *addr += 1;
    Ok(value)
}

pub fn read_u16(store: &impl Store, addr: &mut usize) -> Result<u16, StoreError> {
    let low = read_u8(store, addr)?;
    let high = read_u8(store, addr)?;
    Ok(u16::from_le_bytes([low, high]))
}

/// Reads a raw little-endian f32 and widens it
pub fn read_float(store: &impl Store, addr: &mut usize) -> Result<f64, StoreError> {
    let mut bytes = [0u8; 4];
    for b in bytes.iter_mut() {
        *b = read_u8(store, addr)?;
    }
    Ok(f32::from_le_bytes(bytes) as f64)
}

pub fn write_u8(store: &mut impl Store, addr: &mut usize, value: u8) -> Result<(), StoreError> {
    store.write(*addr, value)?;
    *addr += 1;
    Ok(())
}

pub fn write_u16(store: &mut impl Store, addr: &mut usize, value: u16) -> Result<(), StoreError> {
    for b in value.to_le_bytes() {
        write_u8(store, addr, b)?;
    }
    Ok(())
}

pub fn write_float(store: &mut impl Store, addr: &mut usize, value: f64) -> Result<(), StoreError> {
    for b in (value as f32).to_le_bytes() {
        write_u8(store, addr, b)?;
    }
    Ok(())
}

pub fn write_header(store: &mut impl Store, addr: &mut usize) -> Result<(), StoreError> {
    write_u8(store, addr, MAGIC[0])?;
    write_u8(store, addr, MAGIC[1])?;
    write_u16(store, addr, FORMAT_VERSION)
}

pub fn check_header(store: &impl Store, addr: &mut usize) -> Result<(), StoreError> {
    if [read_u8(store, addr)?, read_u8(store, addr)?] != MAGIC {
        return Err(StoreError::BadHeader);
    }
    match read_u16(store, addr)? {
        FORMAT_VERSION => Ok(()),
        other => Err(StoreError::Version(other)),
    }
}

/// RAM-backed store, erased to 0xFF like an EEPROM
pub struct MemoryStore<const N: usize> {
    data: [u8; N],
}

impl<const N: usize> MemoryStore<N> {
    pub const fn new() -> Self {
        MemoryStore { data: [0xFF; N] }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl<const N: usize> Default for MemoryStore<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Store for MemoryStore<N> {
    fn len(&self) -> usize {
        N
    }

    fn read(&self, addr: usize) -> Result<u8, StoreError> {
        self.data.get(addr).copied().ok_or(StoreError::OutOfRange(addr))
    }

    fn write(&mut self, addr: usize, value: u8) -> Result<(), StoreError> {
        let slot = self.data.get_mut(addr).ok_or(StoreError::OutOfRange(addr))?;
        *slot = value;
        Ok(())
    }
}

/// Store over a packet payload, used by READ and WRITE
///
/// Writes may overwrite existing bytes or append directly after the end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStore {
    data: heapless::Vec<u8, MAX_PAYLOAD>,
}

impl BufferStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps received data; anything past `MAX_PAYLOAD` is dropped
    pub fn from_slice(data: &[u8]) -> Self {
        let data = &data[..data.len().min(MAX_PAYLOAD)];
        let mut store = BufferStore::new();
        // Cannot fail, the slice was truncated to capacity
        let _ = store.data.extend_from_slice(data);
        store
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Store for BufferStore {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn read(&self, addr: usize) -> Result<u8, StoreError> {
        self.data.get(addr).copied().ok_or(StoreError::OutOfRange(addr))
    }

    fn write(&mut self, addr: usize, value: u8) -> Result<(), StoreError> {
        if addr < self.data.len() {
            self.data[addr] = value;
            Ok(())
        } else if addr == self.data.len() {
            self.data
                .push(value)
                .map_err(|_| StoreError::OutOfRange(addr))
        } else {
            Err(StoreError::OutOfRange(addr))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_advance_the_cursor() {
        let mut store = MemoryStore::<16>::new();
        let mut addr = 0;
        write_u8(&mut store, &mut addr, 7).unwrap();
        write_u16(&mut store, &mut addr, 0x1234).unwrap();
        write_float(&mut store, &mut addr, 2.5).unwrap();
        assert_eq!(addr, 7);
        assert_eq!(&store.data()[..3], &[7, 0x34, 0x12]);

        let mut addr = 0;
        assert_eq!(read_u8(&store, &mut addr), Ok(7));
        assert_eq!(read_u16(&store, &mut addr), Ok(0x1234));
        assert_eq!(read_float(&store, &mut addr), Ok(2.5));
    }

    #[test]
    fn erased_store_has_no_header() {
        let store = MemoryStore::<8>::new();
        assert_eq!(check_header(&store, &mut 0), Err(StoreError::BadHeader));
    }

    #[test]
    fn out_of_range_access_fails() {
        let mut store = MemoryStore::<2>::new();
        assert_eq!(write_u16(&mut store, &mut 1, 0), Err(StoreError::OutOfRange(2)));
    }

    #[test]
    fn buffer_store_appends() {
        let mut store = BufferStore::new();
        let mut addr = 0;
        write_u16(&mut store, &mut addr, 0xBEEF).unwrap();
        assert_eq!(store.as_slice(), &[0xEF, 0xBE]);
        assert_eq!(store.write(5, 0), Err(StoreError::OutOfRange(5)));
    }
}
