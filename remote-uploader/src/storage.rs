//! Nonvolatile staging for an image while it is being received
//!
//! The programmer writes every accepted data packet through to a
//! [StagingStore] and reads the image back page by page when flashing. Both
//! operations are byte-exact and synchronous: data is durable once `write`
//! returns.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use log::trace;

use crate::error::{Error, StoreError};

/// Capacity of a 24LC256, the usual staging EEPROM
pub const DEFAULT_CAPACITY: usize = 32 * 1024;

/// Byte-addressable nonvolatile storage
pub trait StagingStore {
    /// Write `data` starting at `address`
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error>;

    /// Fill `buf` with the bytes starting at `address`
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error>;
}

impl<S: StagingStore + ?Sized> StagingStore for &mut S {
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        (**self).write(address, data)
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error> {
        (**self).read(address, buf)
    }
}

impl<S: StagingStore + ?Sized> StagingStore for Box<S> {
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        (**self).write(address, data)
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error> {
        (**self).read(address, buf)
    }
}

fn check_range(address: u32, len: usize, capacity: usize) -> Result<usize, StoreError> {
    let start = address as usize;
    match start.checked_add(len) {
        Some(end) if end <= capacity => Ok(start),
        _ => Err(StoreError::OutOfRange {
            address,
            len,
            capacity,
        }),
    }
}

/// A staging store held in memory
///
/// Unwritten bytes read back as `0xff`, like an erased EEPROM.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    data: Vec<u8>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        MemoryStore {
            data: vec![0xff; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Raw contents of the whole store
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new(DEFAULT_CAPACITY)
    }
}

impl StagingStore for MemoryStore {
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        let start = check_range(address, data.len(), self.data.len())?;
        self.data[start..start + data.len()].copy_from_slice(data);
        trace!("store write {:#06x}: {} bytes", address, data.len());
        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error> {
        let start = check_range(address, buf.len(), self.data.len())?;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }
}

/// A staging store backed by a file of fixed size
#[derive(Debug)]
pub struct FileStore {
    file: File,
    capacity: usize,
}

impl FileStore {
    /// Open or create the backing file, growing it to `capacity` bytes
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;

        let len = file
            .metadata()
            .map_err(|e| Error::FileOpenError(path.display().to_string(), e))?
            .len();
        if len < capacity as u64 {
            file.set_len(capacity as u64)
                .map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;
        }

        Ok(FileStore { file, capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl StagingStore for FileStore {
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        check_range(address, data.len(), self.capacity)?;

        let result = self
            .file
            .seek(SeekFrom::Start(address as u64))
            .and_then(|_| self.file.write_all(data))
            .and_then(|_| self.file.sync_data());

        result.map_err(|source| {
            StoreError::Write {
                address,
                len: data.len(),
                source,
            }
            .into()
        })
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error> {
        check_range(address, buf.len(), self.capacity)?;

        let len = buf.len();
        self.file
            .seek(SeekFrom::Start(address as u64))
            .and_then(|_| self.file.read_exact(buf))
            .map_err(|source| StoreError::Read { address, len, source }.into())
    }
}
