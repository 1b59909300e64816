use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Mutex, PoisonError};

use block_dev::{BlockDevice, DeviceError, BLOCK_SIZE};

/// 以宿主机上的镜像文件充当块设备
#[derive(Debug)]
pub struct BlockFile {
    inner: Mutex<File>,
    blocks: usize,
}

impl BlockFile {
    /// 块数由文件长度决定，不足一块的尾部被忽略
    pub fn new(fd: File) -> io::Result<Self> {
        let blocks = fd.metadata()?.len() as usize / BLOCK_SIZE;
        Ok(Self {
            inner: Mutex::new(fd),
            blocks,
        })
    }

    fn check(&self, block_id: usize, len: usize) -> Result<(), DeviceError> {
        if block_id >= self.blocks {
            return Err(DeviceError::OutOfRange(block_id));
        }
        if len != BLOCK_SIZE {
            return Err(DeviceError::BadBuffer(len));
        }
        Ok(())
    }
}

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.check(block_id, buf.len())?;
        let mut file = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .and_then(|_| file.read_exact(buf))
            .map_err(|err| {
                log::error!("reading block {block_id}: {err}");
                DeviceError::Io(block_id)
            })
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DeviceError> {
        self.check(block_id, buf.len())?;
        let mut file = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .and_then(|_| file.write_all(buf))
            .map_err(|err| {
                log::error!("writing block {block_id}: {err}");
                DeviceError::Io(block_id)
            })
    }

    fn num_blocks(&self) -> usize {
        self.blocks
    }
}
