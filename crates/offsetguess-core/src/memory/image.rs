//! Sparse in-process memory image
//!
//! A `MemoryImage` stands in for kernel memory: a set of mapped regions plus
//! ranges that always fault. Anything outside a mapped region faults too, so
//! probing a garbage pointer behaves like `bpf_probe_read_kernel` hitting an
//! invalid address.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::error::{Error, Result};
use crate::memory::ReadMemory;

#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    regions: BTreeMap<u64, Vec<u8>>,
    faults: Vec<Range<u64>>,
}

impl MemoryImage {
    pub fn builder() -> MemoryImageBuilder {
        MemoryImageBuilder::default()
    }

    /// Overwrite bytes inside an existing mapped region
    pub fn write_bytes(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        let end = checked_end(address, bytes.len())?;
        let (base, region) = self
            .regions
            .range_mut(..=address)
            .next_back()
            .ok_or_else(|| unmapped(address))?;
        let start = (address - *base) as usize;
        let stop = (end - *base) as usize;
        if stop > region.len() {
            return Err(unmapped(address));
        }
        region[start..stop].copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u16(&mut self, address: u64, value: u16) -> Result<()> {
        self.write_bytes(address, &value.to_ne_bytes())
    }

    /// Store a u16 in network byte order
    pub fn write_u16_be(&mut self, address: u64, value: u16) -> Result<()> {
        self.write_bytes(address, &value.to_be_bytes())
    }

    pub fn write_u32(&mut self, address: u64, value: u32) -> Result<()> {
        self.write_bytes(address, &value.to_ne_bytes())
    }

    pub fn write_u64(&mut self, address: u64, value: u64) -> Result<()> {
        self.write_bytes(address, &value.to_ne_bytes())
    }

    pub fn is_mapped(&self, address: u64, size: usize) -> bool {
        self.region_slice(address, size).is_some()
    }

    fn faults_on(&self, address: u64, end: u64) -> bool {
        self.faults
            .iter()
            .any(|range| address < range.end && range.start < end)
    }

    fn region_slice(&self, address: u64, size: usize) -> Option<&[u8]> {
        let end = address.checked_add(size as u64)?;
        let (base, region) = self.regions.range(..=address).next_back()?;
        let start = (address - base) as usize;
        let stop = (end - base) as usize;
        region.get(start..stop)
    }
}

impl ReadMemory for MemoryImage {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let end = checked_end(address, size)?;
        if self.faults_on(address, end) {
            return Err(Error::MemoryReadFailed {
                address,
                message: "address range is marked as faulting".to_string(),
            });
        }
        self.region_slice(address, size)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| unmapped(address))
    }
}

fn checked_end(address: u64, size: usize) -> Result<u64> {
    address
        .checked_add(size as u64)
        .ok_or_else(|| Error::MemoryReadFailed {
            address,
            message: format!("range of {} bytes overflows the address space", size),
        })
}

fn unmapped(address: u64) -> Error {
    Error::MemoryReadFailed {
        address,
        message: "address is not mapped".to_string(),
    }
}

/// Builder for MemoryImage
#[derive(Debug, Clone, Default)]
pub struct MemoryImageBuilder {
    image: MemoryImage,
    pending: Vec<(u64, Vec<u8>)>,
}

impl MemoryImageBuilder {
    /// Map a zero-filled region
    pub fn region(mut self, base: u64, size: usize) -> Self {
        self.image.regions.insert(base, vec![0; size]);
        self
    }

    /// Mark an address range as always faulting, even if mapped
    pub fn fault(mut self, range: Range<u64>) -> Self {
        self.image.faults.push(range);
        self
    }

    pub fn bytes(mut self, address: u64, bytes: &[u8]) -> Self {
        self.pending.push((address, bytes.to_vec()));
        self
    }

    pub fn u16(self, address: u64, value: u16) -> Self {
        self.bytes(address, &value.to_ne_bytes())
    }

    pub fn u16_be(self, address: u64, value: u16) -> Self {
        self.bytes(address, &value.to_be_bytes())
    }

    pub fn u32(self, address: u64, value: u32) -> Self {
        self.bytes(address, &value.to_ne_bytes())
    }

    pub fn u64(self, address: u64, value: u64) -> Self {
        self.bytes(address, &value.to_ne_bytes())
    }

    /// Build the image; fails if a staged write falls outside every region
    pub fn build(self) -> Result<MemoryImage> {
        let mut image = self.image;
        for (address, bytes) in self.pending {
            image.write_bytes(address, &bytes)?;
        }
        Ok(image)
    }
}
