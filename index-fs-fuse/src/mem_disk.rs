use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use block_dev::{BlockDevice, DeviceError, BLOCK_SIZE};

type Block = [u8; BLOCK_SIZE];

/// 内存里的块设备，可以让指定的块读写失败
#[derive(Debug)]
pub struct MemDisk {
    blocks: Mutex<Vec<Block>>,
    /// 从该块号起的读写都失败
    failing_from: AtomicUsize,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemDisk {
    pub fn new(blocks: usize) -> Self {
        Self {
            blocks: Mutex::new(vec![[0; BLOCK_SIZE]; blocks]),
            failing_from: AtomicUsize::new(usize::MAX),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 之后对 `block_id` 及更大块号的读写都报告 I/O 错误
    pub fn fail_from(&self, block_id: usize) {
        self.failing_from.store(block_id, Ordering::Relaxed);
    }

    pub fn heal(&self) {
        self.failing_from.store(usize::MAX, Ordering::Relaxed);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 直接读出某块，绕过文件系统
    pub fn block(&self, block_id: usize) -> Block {
        self.lock()[block_id]
    }

    /// 直接改写某块，用来制造损坏
    pub fn set_block(&self, block_id: usize, data: &Block) {
        self.lock()[block_id] = *data;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Block>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, block_id: usize, len: usize, blocks: usize) -> Result<(), DeviceError> {
        if block_id >= blocks {
            return Err(DeviceError::OutOfRange(block_id));
        }
        if len != BLOCK_SIZE {
            return Err(DeviceError::BadBuffer(len));
        }
        if block_id >= self.failing_from.load(Ordering::Relaxed) {
            return Err(DeviceError::Io(block_id));
        }
        Ok(())
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        let blocks = self.lock();
        self.check(block_id, buf.len(), blocks.len())?;
        buf.copy_from_slice(&blocks[block_id]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DeviceError> {
        let mut blocks = self.lock();
        self.check(block_id, buf.len(), blocks.len())?;
        blocks[block_id].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn num_blocks(&self) -> usize {
        self.lock().len()
    }
}
