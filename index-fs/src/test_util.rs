use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use block_dev::{BlockDevice, DeviceError};

use crate::{SectorData, SECTOR_SIZE};

/// 内存里的块设备，记录读写次数
pub struct RamDisk {
    sectors: Mutex<Vec<SectorData>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new(sectors: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; sectors]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn sector(&self, id: usize) -> SectorData {
        self.sectors.lock().unwrap()[id]
    }

    pub fn set_sector(&self, id: usize, data: &SectorData) {
        self.sectors.lock().unwrap()[id] = *data;
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        let sectors = self.sectors.lock().unwrap();
        let sector = sectors.get(block_id).ok_or(DeviceError::OutOfRange(block_id))?;
        buf.copy_from_slice(sector);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DeviceError> {
        let mut sectors = self.sectors.lock().unwrap();
        let sector = sectors
            .get_mut(block_id)
            .ok_or(DeviceError::OutOfRange(block_id))?;
        sector.copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn num_blocks(&self) -> usize {
        self.sectors.lock().unwrap().len()
    }
}
