use block_dev::DeviceError;
use derive_more::Display;

use crate::SectorId;

pub type Result<T> = core::result::Result<T, FsError>;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// 空闲扇区不足
    #[display(fmt = "no free sector left")]
    NoSpace,
    /// 超出三级索引所能寻址的范围
    #[display(fmt = "file would exceed the indexable size")]
    FileTooLarge,
    #[display(fmt = "directory has no free entry")]
    DirectoryFull,
    /// 魔数不符或指针越界，该 inode 不可信
    #[display(fmt = "corrupted inode at sector {}", sector)]
    Corrupted { sector: SectorId },
    #[display(fmt = "no such file or directory")]
    NotFound,
    #[display(fmt = "entry already exists")]
    AlreadyExists,
    #[display(fmt = "not a directory")]
    NotADirectory,
    #[display(fmt = "is a directory")]
    IsADirectory,
    #[display(fmt = "directory not empty")]
    DirectoryNotEmpty,
    #[display(fmt = "file name too long")]
    NameTooLong,
    #[display(fmt = "invalid path")]
    InvalidPath,
    /// 文件正被禁止写入（如运行中的可执行文件）
    #[display(fmt = "file is write-protected")]
    WriteDenied,
    /// 字节区间跨越了扇区边界
    #[display(fmt = "range {}+{} crosses a sector boundary", offset, len)]
    SectorOverrun { offset: usize, len: usize },
    #[display(fmt = "device error: {}", _0)]
    Device(DeviceError),
}

impl From<DeviceError> for FsError {
    #[inline]
    fn from(err: DeviceError) -> Self {
        Self::Device(err)
    }
}
