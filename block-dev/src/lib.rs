//! # 块设备接口层
//!
//! 块设备是以**块**为单位存储数据的设备，例如磁盘、光盘、U盘等；
//! [`BlockDevice`] 就是对读写块设备的抽象，
//! 实现了此特质的类型称为**块设备驱动**。
//!
//! 文件系统只能通过块设备驱动读写整块，且读写都是同步完成的。

#![no_std]

use core::any::Any;

use derive_more::Display;

/// 块（扇区）大小
pub const BLOCK_SIZE: usize = 512;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// 块号超出设备范围
    #[display(fmt = "block {} is out of range", _0)]
    OutOfRange(usize),
    /// 缓冲区不是恰好一块
    #[display(fmt = "buffer of {} bytes is not a whole block", _0)]
    BadBuffer(usize),
    /// 设备报告读写失败
    #[display(fmt = "I/O failure on block {}", _0)]
    Io(usize),
}

/// 块设备驱动特质
pub trait BlockDevice: Send + Sync + Any {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DeviceError>;
    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DeviceError>;
    /// 设备总块数
    fn num_blocks(&self) -> usize;
}
