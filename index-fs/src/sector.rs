//! 扇区编号

use derive_more::{Display, From, Into};

/// 扇区编号。
///
/// 在 inode 的指针字段里，[`SectorId::NONE`] 表示“尚未分配”；
/// 0 号扇区固定属于空闲位图的 inode，不会被当作数据或索引扇区。
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into,
)]
#[repr(transparent)]
pub struct SectorId(u32);

impl SectorId {
    pub const NONE: Self = Self(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }
}

impl From<SectorId> for usize {
    #[inline]
    fn from(id: SectorId) -> Self {
        id.0 as usize
    }
}
