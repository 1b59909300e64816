use enumflags2::{bitflags, BitFlags};

use crate::{FsError, Result, SectorId};

/// 名字的最大字节数
pub const NAME_MAX: usize = 14;
/// 单个目录最多容纳的目录项数
pub const DIR_ENTRY_MAX: usize = 64;

const NAME_FIELD: usize = 16;

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFlag {
    /// 槽位正被使用
    InUse = 0b01,
    Directory = 0b10,
}

/// 目录中的一项，磁盘上恒为 24 字节：
/// 标志（1 字节）| 保留（3 字节）| inode 扇区（4 字节）| 名字（16 字节，`\0` 填充）
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirEntry {
    flags: BitFlags<EntryFlag>,
    sector: SectorId,
    name: [u8; NAME_FIELD],
}

impl DirEntry {
    pub const SIZE: usize = 24;

    pub fn new(name: &str, sector: SectorId, is_dir: bool) -> Result<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.contains(&b'/') || bytes.contains(&0) {
            return Err(FsError::InvalidPath);
        }
        if bytes.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }

        let mut name = [0; NAME_FIELD];
        name[..bytes.len()].copy_from_slice(bytes);

        let mut flags = BitFlags::from(EntryFlag::InUse);
        if is_dir {
            flags |= EntryFlag::Directory;
        }

        Ok(Self {
            flags,
            sector,
            name,
        })
    }

    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(NAME_FIELD);
        core::str::from_utf8(&self.name[..len]).unwrap_or_default()
    }

    #[inline]
    pub fn sector(&self) -> SectorId {
        self.sector
    }

    #[inline]
    pub fn in_use(&self) -> bool {
        self.flags.contains(EntryFlag::InUse)
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.flags.contains(EntryFlag::Directory)
    }

    /// `.` 与 `..`
    #[inline]
    pub fn is_dot(&self) -> bool {
        matches!(self.name(), "." | "..")
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        bytes[0] = self.flags.bits();
        bytes[4..8].copy_from_slice(&self.sector.to_le_bytes());
        bytes[8..].copy_from_slice(&self.name);
        bytes
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        let mut name = [0; NAME_FIELD];
        name.copy_from_slice(&bytes[8..]);

        Self {
            flags: BitFlags::from_bits_truncate(bytes[0]),
            sector: SectorId::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            name,
        }
    }
}
