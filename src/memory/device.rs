//! Byte-addressed device RAM.
//!
//! Stands in for the board's physical memory: the receiver writes overlay
//! bytes into it and the loader copies, zeroes and reads it by absolute
//! address.

use crate::error::{LinkError, Result};
use crate::memory::layout::{MemorySpec, Region};

pub struct DeviceMemory {
    base: u32,
    bytes: Vec<u8>,
}

impl DeviceMemory {
    pub fn new(spec: MemorySpec) -> Self {
        Self {
            base: spec.base,
            bytes: vec![0; spec.size as usize],
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    fn offset(&self, addr: u32, len: usize) -> Result<usize> {
        let off = addr
            .checked_sub(self.base)
            .map(|o| o as usize)
            .filter(|o| o.checked_add(len).is_some_and(|end| end <= self.bytes.len()))
            .ok_or(LinkError::OutOfBounds { addr, len })?;
        Ok(off)
    }

    pub fn read(&self, addr: u32, len: usize) -> Result<&[u8]> {
        let off = self.offset(addr, len)?;
        Ok(&self.bytes[off..off + len])
    }

    pub fn slice_mut(&mut self, addr: u32, len: usize) -> Result<&mut [u8]> {
        let off = self.offset(addr, len)?;
        Ok(&mut self.bytes[off..off + len])
    }

    /// The bytes backing a planned region.
    pub fn region_mut(&mut self, region: &Region) -> Result<&mut [u8]> {
        self.slice_mut(region.base, region.size as usize)
    }

    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.slice_mut(addr, data.len())?.copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&mut self, addr: u32, len: usize, value: u8) -> Result<()> {
        self.slice_mut(addr, len)?.fill(value);
        Ok(())
    }

    pub fn read_u32(&self, addr: u32) -> Result<u32> {
        let b = self.read(addr, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

impl std::fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("base", &format_args!("{:#010x}", self.base))
            .field("size", &self.bytes.len())
            .finish()
    }
}
