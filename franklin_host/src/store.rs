use anyhow::{Context, Result};
use franklin::store::{Store, StoreError};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

/// Size of the simulated settings memory
pub const IMAGE_SIZE: usize = 4096;

/// Settings memory backed by a file, or by nothing
///
/// Writes land in memory; [`FileStore::flush`] writes the image out when it changed.
pub struct FileStore {
    path: Option<PathBuf>,
    data: Vec<u8>,
    dirty: bool,
}

impl FileStore {
    pub fn in_memory() -> Self {
        FileStore {
            path: None,
            data: vec![0xFF; IMAGE_SIZE],
            dirty: false,
        }
    }

    /// Opens `path`, starting blank when it does not exist yet
    pub fn open(path: &Path) -> Result<Self> {
        let mut data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Could not read {}", path.display()))
            }
        };
        data.resize(IMAGE_SIZE, 0xFF);
        Ok(FileStore {
            path: Some(path.to_owned()),
            data,
            dirty: false,
        })
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(path) = &self.path {
            fs::write(path, &self.data)
                .with_context(|| format!("Could not write {}", path.display()))?;
            debug!("settings written to {}", path.display());
        }
        self.dirty = false;
        Ok(())
    }
}

impl Store for FileStore {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn read(&self, addr: usize) -> Result<u8, StoreError> {
        self.data
            .get(addr)
            .copied()
            .ok_or(StoreError::OutOfRange(addr))
    }

    fn write(&mut self, addr: usize, value: u8) -> Result<(), StoreError> {
        let byte = self
            .data
            .get_mut(addr)
            .ok_or(StoreError::OutOfRange(addr))?;
        if *byte != value {
            *byte = value;
            self.dirty = true;
        }
        Ok(())
    }
}
