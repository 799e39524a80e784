//! The block device adapter.
//!
//! Byte-exact, synchronous, fail-stop read/write of fixed-size sectors.
//! No partial transfers: an implementation either fills/persists the
//! whole sector or reports [`DeviceError`].

use std::sync::Mutex;

use crate::error::DeviceError;
use crate::param::SECTOR_SIZE;

pub type SectorId = u32;

/// One sector's worth of bytes.
pub type SectorBuf = [u8; SECTOR_SIZE];

/// Synchronous, fail-stop sector storage.
///
/// Both operations are expected to block the calling thread until the
/// transfer completes; the cache relies on this to hold its table lock
/// across a fill-on-miss `read` (see [`crate::cache::Cache`]).
pub trait BlockDevice: Send + Sync {
    /// Fill `out_buf` with the current contents of `sector`.
    fn read(&self, sector: SectorId, out_buf: &mut SectorBuf) -> Result<(), DeviceError>;

    /// Persist `in_buf` to `sector`.
    fn write(&self, sector: SectorId, in_buf: &SectorBuf) -> Result<(), DeviceError>;

    /// Total number of addressable sectors, if known. Used only by test
    /// tooling to size a `FreeMap`; not part of the cache/inode contract.
    fn capacity(&self) -> usize;
}

/// Reference `BlockDevice`: a flat, in-memory array of sectors.
///
/// This is the adapter every test and doc example in this crate is built
/// against. It is not part of the cache or inode algorithm; a real
/// embedder would back `BlockDevice` with an actual disk or virtio queue.
pub struct MemBlockDevice {
    sectors: Mutex<Vec<SectorBuf>>,
}

impl MemBlockDevice {
    pub fn new(capacity: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; capacity]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read(&self, sector: SectorId, out_buf: &mut SectorBuf) -> Result<(), DeviceError> {
        let sectors = self.sectors.lock().unwrap();
        let data = sectors.get(sector as usize).ok_or(DeviceError {
            sector,
            reason: "sector out of range",
        })?;
        out_buf.copy_from_slice(data);
        Ok(())
    }

    fn write(&self, sector: SectorId, in_buf: &SectorBuf) -> Result<(), DeviceError> {
        let mut sectors = self.sectors.lock().unwrap();
        let data = sectors.get_mut(sector as usize).ok_or(DeviceError {
            sector,
            reason: "sector out of range",
        })?;
        data.copy_from_slice(in_buf);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.sectors.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_what_was_written() {
        let dev = MemBlockDevice::new(4);
        let mut buf = [7u8; SECTOR_SIZE];
        dev.write(2, &buf).unwrap();
        buf = [0u8; SECTOR_SIZE];
        dev.read(2, &mut buf).unwrap();
        assert_eq!(buf, [7u8; SECTOR_SIZE]);
    }

    #[test]
    fn out_of_range_sector_errors() {
        let dev = MemBlockDevice::new(1);
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(dev.read(5, &mut buf).is_err());
    }
}
