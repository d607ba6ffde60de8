use super::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use super::block_error::BlockError;
use alloc::{vec, vec::Vec};

/// A RAM-backed block device.
///
/// Stands in for an IDE disk when the kernel runs hosted, and lets tests
/// inject I/O failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemDisk {
    data: Vec<u8>,
    fail_reads: bool,
    fail_writes: bool,
}

impl MemDisk {
    /// A zeroed disk of `sectors` sectors.
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            data: vec![0; sectors as usize * BLOCK_SECTOR_SIZE],
            fail_reads: false,
            fail_writes: false,
        }
    }

    /// Make every subsequent read fail.
    pub fn failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    /// Make every subsequent write fail.
    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    fn range(&self, sector: BlockSector) -> Result<core::ops::Range<usize>, BlockError> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        let end = start + BLOCK_SECTOR_SIZE;
        if end > self.data.len() {
            return Err(BlockError::SectorOutOfBounds(sector));
        }
        Ok(start..end)
    }
}

impl BlockOp for MemDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        if self.fail_reads {
            return Err(BlockError::ReadError(sector));
        }
        let range = self.range(sector)?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        if self.fail_writes {
            return Err(BlockError::WriteError(sector));
        }
        let range = self.range(sector)?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_failures() {
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        let mut disk = MemDisk::new(1).failing_reads();
        assert_eq!(disk.read(0, &mut buf), Err(BlockError::ReadError(0)));
        assert!(disk.write(0, &buf).is_ok());

        let mut disk = MemDisk::new(1).failing_writes();
        assert_eq!(disk.write(0, &buf), Err(BlockError::WriteError(0)));
    }
}
