//! # 空闲扇区位图
//!
//! 每个扇区对应一位，1 表示已分配。位按 `u64` 分组，
//! 组内按小端序存放，整张位图作为 0 号扇区上 inode 的文件内容保存。
//!
//! 每次分配或释放都在同一把锁下完成：先改内存中的位图，
//! 再把受影响的位图扇区经由块缓存写回文件。

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::{
    BufferCache, DiskInode, DiskInodeKind, FsError, Result, SectorId, FREE_MAP_SECTOR,
    ROOT_DIR_SECTOR, SECTOR_SIZE,
};

/// 每个位图扇区容纳的位组数
const GROUPS_PER_SECTOR: usize = SECTOR_SIZE / 8;
/// 每个位图扇区指示的扇区数
const BITS_PER_SECTOR: usize = SECTOR_SIZE * 8;

pub struct FreeMap {
    cache: Arc<BufferCache>,
    inner: Mutex<Bitmap>,
}

struct Bitmap {
    groups: Vec<u64>,
    /// 设备总扇区数，超出的位永不分配
    total: usize,
    /// 位图文件的 inode
    file: DiskInode,
}

impl FreeMap {
    /// 格式化时调用：标记两个固定扇区，
    /// 为位图文件一次性分配好扇区，再整体写出。
    pub fn create(cache: Arc<BufferCache>) -> Result<Self> {
        let total = cache.sectors();
        if total <= usize::from(ROOT_DIR_SECTOR) {
            return Err(FsError::NoSpace);
        }

        let mut bitmap = Bitmap {
            groups: alloc::vec![0; total.div_ceil(64)],
            total,
            file: DiskInode::new(DiskInodeKind::File),
        };
        bitmap.mark(FREE_MAP_SECTOR);
        bitmap.mark(ROOT_DIR_SECTOR);

        let length = bitmap.byte_len();
        let mut sectors = bitmap
            .find_free(DiskInode::count_total_sectors(length))
            .ok_or(FsError::NoSpace)?
            .into_iter();
        for &sector in sectors.as_slice() {
            bitmap.mark(sector);
            cache.zero(sector)?;
        }

        for index in 0..DiskInode::count_data_sectors(length) {
            bitmap.file.install(index, &cache, FREE_MAP_SECTOR, &mut || {
                sectors.next().ok_or(FsError::NoSpace)
            })?;
        }
        bitmap.file.length = length as u32;
        bitmap.file.store(&cache, FREE_MAP_SECTOR)?;

        for index in 0..bitmap.file_sectors() {
            bitmap.write_sector(&cache, index)?;
        }
        log::debug!(
            "free map created: {total} sectors, {} free",
            bitmap.free_count()
        );

        Ok(Self {
            cache,
            inner: Mutex::new(bitmap),
        })
    }

    /// 挂载时调用：从 0 号扇区的 inode 读回位图
    pub fn load(cache: Arc<BufferCache>) -> Result<Self> {
        let total = cache.sectors();
        let file = DiskInode::load(&cache, FREE_MAP_SECTOR)?;
        let mut bitmap = Bitmap {
            groups: alloc::vec![0; total.div_ceil(64)],
            total,
            file,
        };

        if bitmap.file.is_dir() || bitmap.file.length as usize != bitmap.byte_len() {
            log::error!(
                "free map file holds {} bytes, expected {}",
                bitmap.file.length,
                bitmap.byte_len()
            );
            return Err(FsError::Corrupted {
                sector: FREE_MAP_SECTOR,
            });
        }

        for index in 0..bitmap.file_sectors() {
            bitmap.read_sector(&cache, index)?;
        }

        if !bitmap.is_set(FREE_MAP_SECTOR) || !bitmap.is_set(ROOT_DIR_SECTOR) {
            log::error!("free map does not reserve its fixed sectors");
            return Err(FsError::Corrupted {
                sector: FREE_MAP_SECTOR,
            });
        }

        Ok(Self {
            cache,
            inner: Mutex::new(bitmap),
        })
    }

    /// 分配 `count` 个互不相同的扇区。
    /// 要么全部成功，要么什么也不保留并返回 [`FsError::NoSpace`]。
    pub fn allocate(&self, count: usize) -> Result<Vec<SectorId>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut bitmap = self.inner.lock();
        let Some(sectors) = bitmap.find_free(count) else {
            log::debug!("cannot allocate {count} sectors, {} free", bitmap.free_count());
            return Err(FsError::NoSpace);
        };

        for &sector in &sectors {
            bitmap.mark(sector);
        }
        if let Err(err) = bitmap.persist(&self.cache, &sectors) {
            for &sector in &sectors {
                bitmap.unmark(sector);
            }
            return Err(err);
        }

        log::debug!("allocated {count} sectors starting at {}", sectors[0]);
        Ok(sectors)
    }

    #[inline]
    pub fn allocate_one(&self) -> Result<SectorId> {
        let mut sectors = self.allocate(1)?;
        sectors.pop().ok_or(FsError::NoSpace)
    }

    /// 释放从 `start` 起连续的 `count` 个扇区
    pub fn release(&self, start: SectorId, count: usize) -> Result<()> {
        let first = usize::from(start);
        match first.checked_add(count) {
            Some(end) if end <= self.cache.sectors() => {
                let sectors: Vec<_> = (first..end).map(|id| SectorId::new(id as u32)).collect();
                self.release_all(&sectors)
            }
            _ => {
                log::error!("release of {count} sectors from {start} beyond the device");
                Err(FsError::Corrupted {
                    sector: FREE_MAP_SECTOR,
                })
            }
        }
    }

    /// 释放任意一组扇区
    pub(crate) fn release_all(&self, sectors: &[SectorId]) -> Result<()> {
        if sectors.is_empty() {
            return Ok(());
        }

        let mut bitmap = self.inner.lock();
        if let Some(sector) = sectors
            .iter()
            .find(|&&sector| usize::from(sector) >= bitmap.total)
        {
            log::error!("release of sector {sector} beyond the device");
            return Err(FsError::Corrupted {
                sector: FREE_MAP_SECTOR,
            });
        }

        for &sector in sectors {
            if !bitmap.is_set(sector) {
                // 重复释放，只记录不修复
                log::error!("sector {sector} released twice");
            }
            bitmap.unmark(sector);
        }

        log::debug!("released {} sectors", sectors.len());
        bitmap.persist(&self.cache, sectors)
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free_count()
    }

    pub fn is_allocated(&self, sector: SectorId) -> bool {
        let bitmap = self.inner.lock();
        usize::from(sector) < bitmap.total && bitmap.is_set(sector)
    }

    /// 位图文件自身占用的扇区，含索引扇区
    pub fn file_sectors(&self) -> Result<Vec<SectorId>> {
        let bitmap = self.inner.lock();
        bitmap.file.owned_sectors(&self.cache, FREE_MAP_SECTOR)
    }
}

impl Bitmap {
    #[inline]
    fn locate(sector: SectorId) -> (usize, u32) {
        let id = usize::from(sector);
        (id / 64, (id % 64) as u32)
    }

    #[inline]
    fn is_set(&self, sector: SectorId) -> bool {
        let (group, bit) = Self::locate(sector);
        self.groups[group] & (1 << bit) != 0
    }

    #[inline]
    fn mark(&mut self, sector: SectorId) {
        let (group, bit) = Self::locate(sector);
        self.groups[group] |= 1 << bit;
    }

    #[inline]
    fn unmark(&mut self, sector: SectorId) {
        let (group, bit) = Self::locate(sector);
        self.groups[group] &= !(1 << bit);
    }

    /// 首次适配地找出 `count` 个空闲扇区，不修改位图
    fn find_free(&self, count: usize) -> Option<Vec<SectorId>> {
        let mut found = Vec::with_capacity(count);
        if count == 0 {
            return Some(found);
        }

        for (group_index, &group) in self.groups.iter().enumerate() {
            let mut bits = group;
            while bits != u64::MAX {
                let id = group_index * 64 + bits.trailing_ones() as usize;
                if id >= self.total {
                    break;
                }
                bits |= 1 << (id % 64);
                found.push(SectorId::new(id as u32));
                if found.len() == count {
                    return Some(found);
                }
            }
        }

        None
    }

    fn free_count(&self) -> usize {
        let used: usize = self
            .groups
            .iter()
            .map(|group| group.count_ones() as usize)
            .sum();
        self.total - used
    }

    #[inline]
    fn byte_len(&self) -> usize {
        self.groups.len() * 8
    }

    #[inline]
    fn file_sectors(&self) -> usize {
        DiskInode::count_data_sectors(self.byte_len())
    }

    /// 写回记录了 `sectors` 的位图扇区
    fn persist(&self, cache: &BufferCache, sectors: &[SectorId]) -> Result<()> {
        let mut touched: Vec<usize> = sectors
            .iter()
            .map(|&sector| usize::from(sector) / BITS_PER_SECTOR)
            .collect();
        touched.sort_unstable();
        touched.dedup();

        touched
            .into_iter()
            .try_for_each(|index| self.write_sector(cache, index))
    }

    fn file_sector(&self, cache: &BufferCache, index: usize) -> Result<SectorId> {
        self.file
            .resolve(index, cache, FREE_MAP_SECTOR)?
            .ok_or(FsError::Corrupted {
                sector: FREE_MAP_SECTOR,
            })
    }

    fn groups_of(&self, index: usize) -> core::ops::Range<usize> {
        let start = index * GROUPS_PER_SECTOR;
        start..(start + GROUPS_PER_SECTOR).min(self.groups.len())
    }

    fn write_sector(&self, cache: &BufferCache, index: usize) -> Result<()> {
        let sector = self.file_sector(cache, index)?;
        let groups = &self.groups[self.groups_of(index)];
        cache.with_sector_mut(sector, |data| {
            for (raw, group) in data.chunks_exact_mut(8).zip(groups) {
                raw.copy_from_slice(&group.to_le_bytes());
            }
        })
    }

    fn read_sector(&mut self, cache: &BufferCache, index: usize) -> Result<()> {
        let sector = self.file_sector(cache, index)?;
        let range = self.groups_of(index);
        let groups = &mut self.groups[range];
        cache.with_sector(sector, |data| {
            for (raw, group) in data.chunks_exact(8).zip(groups.iter_mut()) {
                let mut bytes = [0; 8];
                bytes.copy_from_slice(raw);
                *group = u64::from_le_bytes(bytes);
            }
        })
    }
}
