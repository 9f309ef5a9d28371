//! Block device contract.
//!
//! The core does not ship storage drivers; it consumes this trait where
//! a filesystem needs backing media (tarfs mounts, the initrd). The
//! in-memory implementation backs both the boot archive and the tests.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{OsResult, OsStatus};

/// Random-access read-only media.
pub trait BlockDevice: Send + Sync {
    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Read `buffer.len()` bytes at `offset`. Short reads are errors;
    /// reads past the end return `OutOfBounds`.
    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> OsResult;
}

/// A block device over an owned byte buffer.
pub struct MemoryBlockDevice {
    bytes: Vec<u8>,
}

impl MemoryBlockDevice {
    pub fn new(bytes: Vec<u8>) -> Arc<MemoryBlockDevice> {
        Arc::new(MemoryBlockDevice { bytes })
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> OsResult {
        let offset = offset as usize;
        let end = offset
            .checked_add(buffer.len())
            .ok_or(OsStatus::InvalidSpan)?;
        if end > self.bytes.len() {
            return Err(OsStatus::OutOfBounds);
        }

        buffer.copy_from_slice(&self.bytes[offset..end]);
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::vec;

    use super::*;

    #[test]
    fn reads_in_bounds() {
        let device = MemoryBlockDevice::new(vec![1, 2, 3, 4, 5]);
        let mut buffer = [0u8; 3];
        device.read_at(1, &mut buffer).unwrap();
        assert_eq!(buffer, [2, 3, 4]);
    }

    #[test]
    fn reads_past_the_end_fail() {
        let device = MemoryBlockDevice::new(vec![0; 8]);
        let mut buffer = [0u8; 4];
        assert_eq!(
            device.read_at(6, &mut buffer).unwrap_err(),
            OsStatus::OutOfBounds
        );
    }
}
