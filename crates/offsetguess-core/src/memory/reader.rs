use crate::error::{Error, Result};

/// Fault-tolerant access to kernel memory.
///
/// Implementations must never panic on an invalid address: an unmapped or
/// inaccessible range is reported as [`Error::MemoryReadFailed`], which the
/// probes treat as an expected, recoverable outcome.
pub trait ReadMemory {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>>;

    fn read_array<const N: usize>(&self, address: u64) -> Result<[u8; N]> {
        let bytes = self.read_bytes(address, N)?;
        <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| Error::MemoryReadFailed {
            address,
            message: format!("short read: expected {} bytes, got {}", N, bytes.len()),
        })
    }

    fn read_u16(&self, address: u64) -> Result<u16> {
        Ok(u16::from_ne_bytes(self.read_array(address)?))
    }

    /// Read a u16 stored in network byte order and convert it to host order
    fn read_u16_be(&self, address: u64) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array(address)?))
    }

    fn read_u32(&self, address: u64) -> Result<u32> {
        Ok(u32::from_ne_bytes(self.read_array(address)?))
    }

    fn read_u64(&self, address: u64) -> Result<u64> {
        Ok(u64::from_ne_bytes(self.read_array(address)?))
    }

    fn read_ptr(&self, address: u64) -> Result<u64> {
        self.read_u64(address)
    }
}

impl<R: ReadMemory + ?Sized> ReadMemory for &R {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        (**self).read_bytes(address, size)
    }
}
