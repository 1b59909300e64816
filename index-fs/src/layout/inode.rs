//! 磁盘上的 inode 与多级索引
//!
//! - 直接索引：inode 内连续存储 [`DIRECT_COUNT`] 个**数据扇区**编号
//! - 一级索引：整个扇区连续存储编号，每个编号都指向一个数据扇区
//! - 二级索引：整个扇区连续存储编号，每个编号都指向一个一级索引扇区
//!
//! 编号为 0 表示尚未分配：读出来是全零，写入时才分配（并清零）。
//!
//! ## 磁盘格式
//!
//! 一个 inode 恰好占一个扇区，小端序：
//!
//! | 偏移 | 字段 |
//! |------|------|
//! | 0 | 长度 `u32` |
//! | 4 | 直接索引 `[u32; 16]` |
//! | 68 | 一级索引 `u32` |
//! | 72 | 二级索引 `u32` |
//! | 76 | 类型 `u32` |
//! | 80 | 魔数 `u32` |
//! | 84 | 填充至扇区末尾 |

use alloc::vec::Vec;

use crate::{BufferCache, FsError, Result, SectorData, SectorId, INODE_MAGIC, SECTOR_SIZE};

/// 直接索引的个数
pub const DIRECT_COUNT: usize = 16;
/// 索引扇区的编号容量
pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / 4;

/// 直接索引时的编号容量
const DIRECT_CAP: usize = DIRECT_COUNT;
/// 用上一级索引时的编号容量
const INDIRECT_CAP: usize = DIRECT_CAP + PTRS_PER_SECTOR;
/// 用上二级索引时的编号容量
const DOUBLY_CAP: usize = INDIRECT_CAP + PTRS_PER_SECTOR * PTRS_PER_SECTOR;

/// 单个文件最多的数据扇区数
pub const MAX_FILE_SECTORS: usize = DOUBLY_CAP;

const LENGTH_AT: usize = 0;
const DIRECT_AT: usize = 4;
const INDIRECT_AT: usize = DIRECT_AT + DIRECT_COUNT * 4;
const DOUBLY_AT: usize = INDIRECT_AT + 4;
const KIND_AT: usize = DOUBLY_AT + 4;
const MAGIC_AT: usize = KIND_AT + 4;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiskInode {
    /// 字节长度
    pub length: u32,
    pub direct: [SectorId; DIRECT_COUNT],
    /// 指向一个一级索引扇区
    pub indirect: SectorId,
    /// 指向一个二级索引扇区
    pub doubly_indirect: SectorId,
    pub kind: DiskInodeKind,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum DiskInodeKind {
    #[default]
    File,
    Directory,
}

/// 逻辑扇区在索引结构中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPos {
    Direct(usize),
    /// 一级索引扇区内的下标
    Indirect(usize),
    /// 二级索引扇区内的下标，以及所选一级索引扇区内的下标
    Doubly(usize, usize),
}

impl BlockPos {
    /// 逻辑扇区下标（字节偏移 / 扇区大小）到索引位置的映射
    pub fn locate(index: usize) -> Option<Self> {
        if index < DIRECT_CAP {
            Some(Self::Direct(index))
        } else if index < INDIRECT_CAP {
            Some(Self::Indirect(index - DIRECT_CAP))
        } else if index < DOUBLY_CAP {
            // 剔去直接索引与一级索引的部分
            let index = index - INDIRECT_CAP;
            Some(Self::Doubly(
                index / PTRS_PER_SECTOR,
                index % PTRS_PER_SECTOR,
            ))
        } else {
            None
        }
    }
}

impl DiskInode {
    #[inline]
    pub fn new(kind: DiskInodeKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.kind == DiskInodeKind::Directory
    }

    pub fn encode(&self) -> SectorData {
        let mut bytes = [0; SECTOR_SIZE];
        put_u32(&mut bytes, LENGTH_AT, self.length);
        for (i, sector) in self.direct.iter().enumerate() {
            put_u32(&mut bytes, DIRECT_AT + i * 4, sector.raw());
        }
        put_u32(&mut bytes, INDIRECT_AT, self.indirect.raw());
        put_u32(&mut bytes, DOUBLY_AT, self.doubly_indirect.raw());
        put_u32(&mut bytes, KIND_AT, self.kind as u32);
        put_u32(&mut bytes, MAGIC_AT, INODE_MAGIC);
        bytes
    }

    /// 解码 `sector` 上的 inode，魔数或类型不符即视为损坏
    pub fn decode(bytes: &SectorData, sector: SectorId) -> Result<Self> {
        if get_u32(bytes, MAGIC_AT) != INODE_MAGIC {
            log::error!("bad inode magic at sector {sector}");
            return Err(FsError::Corrupted { sector });
        }

        let kind = match get_u32(bytes, KIND_AT) {
            0 => DiskInodeKind::File,
            1 => DiskInodeKind::Directory,
            other => {
                log::error!("unknown inode kind {other} at sector {sector}");
                return Err(FsError::Corrupted { sector });
            }
        };

        let mut direct = [SectorId::NONE; DIRECT_COUNT];
        for (i, slot) in direct.iter_mut().enumerate() {
            *slot = SectorId::new(get_u32(bytes, DIRECT_AT + i * 4));
        }

        Ok(Self {
            length: get_u32(bytes, LENGTH_AT),
            direct,
            indirect: SectorId::new(get_u32(bytes, INDIRECT_AT)),
            doubly_indirect: SectorId::new(get_u32(bytes, DOUBLY_AT)),
            kind,
        })
    }

    /// 经由块缓存读出 `sector` 上的 inode
    pub fn load(cache: &BufferCache, sector: SectorId) -> Result<Self> {
        cache.with_sector(sector, |bytes| Self::decode(bytes, sector))?
    }

    pub fn store(&self, cache: &BufferCache, sector: SectorId) -> Result<()> {
        let bytes = self.encode();
        cache.with_sector_mut(sector, |data| *data = bytes)
    }

    /// 逻辑上 inode 指向一系列数据扇区，此处传入的是这些扇区的逻辑下标，
    /// 返回给**块缓存层**使用的扇区号；尚未分配时返回空。
    ///
    /// `owner` 是该 inode 自己所在的扇区，仅用于报告损坏。
    pub fn resolve(
        &self,
        index: usize,
        cache: &BufferCache,
        owner: SectorId,
    ) -> Result<Option<SectorId>> {
        let check = |sector| check_pointer(sector, cache, owner);

        let sector = match BlockPos::locate(index).ok_or(FsError::FileTooLarge)? {
            BlockPos::Direct(i) => check(self.direct[i])?,
            BlockPos::Indirect(i) => {
                if self.indirect.is_none() {
                    return Ok(None);
                }
                check(read_pointer(cache, check(self.indirect)?, i)?)?
            }
            BlockPos::Doubly(outer, inner) => {
                if self.doubly_indirect.is_none() {
                    return Ok(None);
                }
                let indirect = check(read_pointer(cache, check(self.doubly_indirect)?, outer)?)?;
                if indirect.is_none() {
                    return Ok(None);
                }
                check(read_pointer(cache, indirect, inner)?)?
            }
        };

        Ok((!sector.is_none()).then_some(sector))
    }

    /// 确保逻辑下标 `index` 有对应的数据扇区并返回之。
    /// 路径上缺失的索引扇区与数据扇区都向 `alloc` 索取，
    /// `alloc` 交出的扇区必须已经清零。
    pub fn install(
        &mut self,
        index: usize,
        cache: &BufferCache,
        owner: SectorId,
        alloc: &mut dyn FnMut() -> Result<SectorId>,
    ) -> Result<SectorId> {
        match BlockPos::locate(index).ok_or(FsError::FileTooLarge)? {
            BlockPos::Direct(i) => ensure_field(&mut self.direct[i], cache, owner, alloc),
            BlockPos::Indirect(i) => {
                let indirect = ensure_field(&mut self.indirect, cache, owner, alloc)?;
                ensure_entry(indirect, i, cache, owner, alloc)
            }
            BlockPos::Doubly(outer, inner) => {
                let doubly = ensure_field(&mut self.doubly_indirect, cache, owner, alloc)?;
                let indirect = ensure_entry(doubly, outer, cache, owner, alloc)?;
                ensure_entry(indirect, inner, cache, owner, alloc)
            }
        }
    }

    /// 收集该 inode 引用的全部数据扇区与索引扇区（不含 inode 自身）
    pub fn owned_sectors(&self, cache: &BufferCache, owner: SectorId) -> Result<Vec<SectorId>> {
        let check = |sector| check_pointer(sector, cache, owner);
        let mut sectors: Vec<SectorId> = Vec::new();

        for &sector in &self.direct {
            if !check(sector)?.is_none() {
                sectors.push(sector);
            }
        }

        if !check(self.indirect)?.is_none() {
            collect_entries(self.indirect, cache, owner, &mut sectors)?;
            sectors.push(self.indirect);
        }

        if !check(self.doubly_indirect)?.is_none() {
            let mut indirects = Vec::new();
            collect_entries(self.doubly_indirect, cache, owner, &mut indirects)?;
            for &indirect in &indirects {
                collect_entries(indirect, cache, owner, &mut sectors)?;
            }
            sectors.extend(indirects);
            sectors.push(self.doubly_indirect);
        }

        Ok(sectors)
    }

    /// 计算容纳指定字节数需要多少个**数据扇区**
    #[inline]
    pub fn count_data_sectors(length: usize) -> usize {
        length.div_ceil(SECTOR_SIZE)
    }

    /// 计算完整容纳指定字节数需要多少个**数据扇区**和**索引扇区**
    pub fn count_total_sectors(length: usize) -> usize {
        let data = Self::count_data_sectors(length);
        let mut total = data;

        // 超出直接索引，使用一级索引扇区
        if data > DIRECT_CAP {
            total += 1;
        }

        // 超出一级索引，使用二级索引扇区及其下的若干一级索引扇区
        if data > INDIRECT_CAP {
            total += 1 + (data - INDIRECT_CAP).div_ceil(PTRS_PER_SECTOR);
        }

        total
    }
}

/// 指针越界说明 inode 已不可信
fn check_pointer(sector: SectorId, cache: &BufferCache, owner: SectorId) -> Result<SectorId> {
    if usize::from(sector) >= cache.sectors() {
        log::error!("inode at sector {owner} points outside the device: {sector}");
        return Err(FsError::Corrupted { sector: owner });
    }
    Ok(sector)
}

fn ensure_field(
    field: &mut SectorId,
    cache: &BufferCache,
    owner: SectorId,
    alloc: &mut dyn FnMut() -> Result<SectorId>,
) -> Result<SectorId> {
    if field.is_none() {
        *field = alloc()?;
    }
    check_pointer(*field, cache, owner)
}

fn ensure_entry(
    block: SectorId,
    index: usize,
    cache: &BufferCache,
    owner: SectorId,
    alloc: &mut dyn FnMut() -> Result<SectorId>,
) -> Result<SectorId> {
    let sector = read_pointer(cache, block, index)?;
    if !sector.is_none() {
        return check_pointer(sector, cache, owner);
    }

    let sector = alloc()?;
    write_pointer(cache, block, index, sector)?;
    Ok(sector)
}

fn collect_entries(
    block: SectorId,
    cache: &BufferCache,
    owner: SectorId,
    out: &mut Vec<SectorId>,
) -> Result<()> {
    let entries = cache.with_sector(block, |data| {
        data.chunks_exact(4)
            .map(|raw| SectorId::new(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])))
            .filter(|sector| !sector.is_none())
            .collect::<Vec<_>>()
    })?;
    for sector in entries {
        out.push(check_pointer(sector, cache, owner)?);
    }
    Ok(())
}

#[inline]
fn read_pointer(cache: &BufferCache, block: SectorId, index: usize) -> Result<SectorId> {
    let mut raw = [0; 4];
    cache.read(block, &mut raw, index * 4)?;
    Ok(SectorId::from_le_bytes(raw))
}

#[inline]
fn write_pointer(cache: &BufferCache, block: SectorId, index: usize, sector: SectorId) -> Result<()> {
    cache.write(block, &sector.to_le_bytes(), index * 4)
}

#[inline]
fn put_u32(bytes: &mut SectorData, at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn get_u32(bytes: &SectorData, at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::test_util::RamDisk;
    use crate::CacheConfig;

    #[test]
    fn locate_tier_boundaries() {
        assert_eq!(BlockPos::locate(0), Some(BlockPos::Direct(0)));
        assert_eq!(BlockPos::locate(15), Some(BlockPos::Direct(15)));
        assert_eq!(BlockPos::locate(16), Some(BlockPos::Indirect(0)));
        assert_eq!(BlockPos::locate(143), Some(BlockPos::Indirect(127)));
        assert_eq!(BlockPos::locate(144), Some(BlockPos::Doubly(0, 0)));
        assert_eq!(BlockPos::locate(144 + 128 + 5), Some(BlockPos::Doubly(1, 5)));
        assert_eq!(
            BlockPos::locate(MAX_FILE_SECTORS - 1),
            Some(BlockPos::Doubly(127, 127))
        );
        assert_eq!(BlockPos::locate(MAX_FILE_SECTORS), None);
    }

    #[test]
    fn total_sectors_include_index_blocks() {
        assert_eq!(DiskInode::count_total_sectors(0), 0);
        assert_eq!(DiskInode::count_total_sectors(1), 1);
        assert_eq!(DiskInode::count_total_sectors(16 * SECTOR_SIZE), 16);
        assert_eq!(DiskInode::count_total_sectors(16 * SECTOR_SIZE + 1), 18);
        assert_eq!(DiskInode::count_total_sectors(144 * SECTOR_SIZE), 145);
        // 二级索引扇区 + 一个一级索引扇区 + 一个数据扇区
        assert_eq!(DiskInode::count_total_sectors(144 * SECTOR_SIZE + 1), 148);
    }

    #[test]
    fn encoding_keeps_field_order() {
        let mut inode = DiskInode::new(DiskInodeKind::Directory);
        inode.length = 0x1234;
        inode.direct[0] = SectorId::new(7);
        inode.doubly_indirect = SectorId::new(9);

        let bytes = inode.encode();
        assert_eq!(&bytes[0..4], &0x1234u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &7u32.to_le_bytes());
        assert_eq!(&bytes[72..76], &9u32.to_le_bytes());
        assert_eq!(&bytes[76..80], &1u32.to_le_bytes());
        assert_eq!(&bytes[80..84], &INODE_MAGIC.to_le_bytes());
        assert!(bytes[84..].iter().all(|&b| b == 0));

        assert_eq!(DiskInode::decode(&bytes, SectorId::new(3)), Ok(inode));
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut bytes = DiskInode::default().encode();
        bytes[MAGIC_AT] ^= 0xff;
        assert_eq!(
            DiskInode::decode(&bytes, SectorId::new(5)),
            Err(FsError::Corrupted {
                sector: SectorId::new(5)
            })
        );
    }

    #[test]
    fn install_then_resolve_every_tier() {
        let cache = BufferCache::new(Arc::new(RamDisk::new(512)), CacheConfig::with_capacity(8));
        let owner = SectorId::new(2);
        let mut next = 10u32;
        let mut alloc = || -> Result<SectorId> {
            let sector = SectorId::new(next);
            next += 1;
            cache.zero(sector)?;
            Ok(sector)
        };

        let mut inode = DiskInode::default();
        let direct = inode.install(3, &cache, owner, &mut alloc).unwrap();
        let indirect = inode.install(20, &cache, owner, &mut alloc).unwrap();
        let doubly = inode.install(400, &cache, owner, &mut alloc).unwrap();

        assert_eq!(inode.resolve(3, &cache, owner), Ok(Some(direct)));
        assert_eq!(inode.resolve(20, &cache, owner), Ok(Some(indirect)));
        assert_eq!(inode.resolve(400, &cache, owner), Ok(Some(doubly)));
        // 同一索引扇区里的空位仍是未分配
        assert_eq!(inode.resolve(21, &cache, owner), Ok(None));
        assert_eq!(inode.resolve(401, &cache, owner), Ok(None));

        // 3 个数据扇区 + 一级索引 + 二级索引 + 其下一个一级索引
        let mut owned = inode.owned_sectors(&cache, owner).unwrap();
        owned.sort();
        assert_eq!(owned, (10..16).map(SectorId::new).collect::<Vec<_>>());
    }

    #[test]
    fn pointer_outside_device_is_corruption() {
        let cache = BufferCache::new(Arc::new(RamDisk::new(32)), CacheConfig::with_capacity(4));
        let mut inode = DiskInode::default();
        inode.direct[1] = SectorId::new(1000);
        assert_eq!(
            inode.resolve(1, &cache, SectorId::new(4)),
            Err(FsError::Corrupted {
                sector: SectorId::new(4)
            })
        );
    }
}
