//! # 索引节点层
//!
//! 每个 inode 由其所在扇区唯一标识。内存中同一扇区至多一个 [`Inode`]，
//! 所有打开者共享它，由 [`InodeTable`] 去重并记录打开次数。
//!
//! 文件长度只增不减：写到文件末尾之后时才为写到的扇区分配（并清零）
//! 数据扇区与所需的索引扇区，从未写过的扇区读出全零。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::{Mutex, MutexGuard};

use crate::{
    BufferCache, DiskInode, DiskInodeKind, FileSystem, FreeMap, FsError, Result, SectorId,
    MAX_FILE_SECTORS, SECTOR_SIZE,
};

/// 单个文件的字节上限
const MAX_FILE_BYTES: usize = MAX_FILE_SECTORS * SECTOR_SIZE;

pub struct Inode {
    /// 磁盘 inode 所在扇区，也是 inode 的编号
    sector: SectorId,
    state: Mutex<InodeState>,
    /// 磁盘 inode 的副本；持有这把锁即串行化了扩展
    disk: Mutex<DiskInode>,
    /// 目录的“查找后修改”须整体完成
    dir_lock: Mutex<()>,
}

#[derive(Debug, Default)]
struct InodeState {
    open_count: usize,
    /// 已从目录中删除，最后一次关闭时回收
    removed: bool,
    /// 大于零时拒绝写入
    deny_write: usize,
}

/// 已打开 inode 的登记表
#[derive(Default)]
pub struct InodeTable {
    inodes: Mutex<BTreeMap<SectorId, Arc<Inode>>>,
}

impl Inode {
    /// 在 `sector` 上写出一个长度为 `length` 的新 inode。
    ///
    /// 覆盖该长度所需的数据扇区与索引扇区一次性分配并清零；
    /// 任何一步失败都会释放它们。`sector` 本身由调用者分配。
    pub fn create(
        cache: &BufferCache,
        free_map: &FreeMap,
        sector: SectorId,
        length: usize,
        kind: DiskInodeKind,
    ) -> Result<()> {
        if length > MAX_FILE_BYTES {
            return Err(FsError::FileTooLarge);
        }

        let sectors = free_map.allocate(DiskInode::count_total_sectors(length))?;
        if let Err(err) = lay_out(cache, sector, length, kind, &sectors) {
            if let Err(release_err) = free_map.release_all(&sectors) {
                log::error!("failed to roll back inode {sector}: {release_err}");
            }
            return Err(err);
        }

        log::debug!("created inode {sector} ({kind:?}, {length} bytes)");
        Ok(())
    }

    /// 按编号打开 inode。已回收的扇区上只剩旧 inode 的残骸，不能打开。
    pub fn open(fs: &FileSystem, sector: SectorId) -> Result<Arc<Self>> {
        if !fs.free_map().is_allocated(sector) {
            return Err(FsError::NotFound);
        }
        fs.inodes().open(fs.cache(), sector)
    }

    /// 再打开一次已经打开的 inode
    pub fn reopen(self: &Arc<Self>) -> Arc<Self> {
        self.state.lock().open_count += 1;
        Arc::clone(self)
    }

    #[inline]
    pub fn close(self: Arc<Self>, fs: &FileSystem) -> Result<()> {
        fs.inodes().close(self, fs.cache(), fs.free_map())
    }

    /// 从 `offset` 起读入 `buf`，返回实际读到的字节数，文件末尾处会读得更少
    pub fn read_at(&self, fs: &FileSystem, buf: &mut [u8], offset: usize) -> Result<usize> {
        let cache = fs.cache();
        // 读不必等待写，取一份快照即可
        let disk = self.disk.lock().clone();
        let length = disk.length as usize;
        if offset >= length || buf.is_empty() {
            return Ok(0);
        }

        let end = length.min(offset + buf.len());
        let mut pos = offset;
        while pos < end {
            let in_sector = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - in_sector).min(end - pos);
            let dst = &mut buf[pos - offset..pos - offset + chunk];
            match disk.resolve(pos / SECTOR_SIZE, cache, self.sector)? {
                Some(sector) => cache.read(sector, dst, in_sector)?,
                None => dst.fill(0),
            }
            pos += chunk;
        }

        // 提示预读紧随其后的扇区
        let next = end.div_ceil(SECTOR_SIZE);
        if next * SECTOR_SIZE < length {
            if let Some(sector) = disk.resolve(next, cache, self.sector)? {
                cache.request_read_ahead(sector);
            }
        }

        Ok(end - offset)
    }

    /// 把 `data` 写到 `offset` 处，必要时扩展文件。
    ///
    /// 扇区不足时只写能写下的部分，长度恰好覆盖写入的字节，返回写入的字节数；
    /// 一个字节都没写成才返回错误。
    pub fn write_at(&self, fs: &FileSystem, data: &[u8], offset: usize) -> Result<usize> {
        if self.state.lock().deny_write > 0 {
            return Err(FsError::WriteDenied);
        }
        if offset >= MAX_FILE_BYTES {
            return Err(FsError::FileTooLarge);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let cache = fs.cache();
        let free_map = fs.free_map();
        let mut disk = self.disk.lock();
        let before = disk.clone();

        let mut written = 0;
        let mut fresh = || fresh_sector(cache, free_map);
        let outcome = loop {
            if written == data.len() {
                break Ok(());
            }
            let pos = offset + written;
            let in_sector = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - in_sector).min(data.len() - written);

            let sector = match disk.install(pos / SECTOR_SIZE, cache, self.sector, &mut fresh) {
                Ok(sector) => sector,
                Err(err) => break Err(err),
            };
            if let Err(err) = cache.write(sector, &data[written..written + chunk], in_sector) {
                break Err(err);
            }
            written += chunk;
        };

        if written > 0 {
            disk.length = disk.length.max((offset + written) as u32);
        }
        // 即使一个字节都没写成，也可能已经装上了索引扇区
        if *disk != before {
            disk.store(cache, self.sector)?;
        }

        match outcome {
            Ok(()) => Ok(written),
            Err(err) if written == 0 => Err(err),
            Err(err) => {
                log::debug!("short write to inode {}: {written} bytes, {err}", self.sector);
                Ok(written)
            }
        }
    }

    /// 标记为已删除，最后一次关闭时回收
    #[inline]
    pub fn mark_removed(&self) {
        self.state.lock().removed = true;
    }

    #[inline]
    pub fn deny_write(&self) {
        self.state.lock().deny_write += 1;
    }

    pub fn allow_write(&self) {
        let mut state = self.state.lock();
        match state.deny_write.checked_sub(1) {
            Some(count) => state.deny_write = count,
            None => log::error!("unbalanced allow_write on inode {}", self.sector),
        }
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.disk.lock().length as usize
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.disk.lock().is_dir()
    }

    #[inline]
    pub fn inumber(&self) -> SectorId {
        self.sector
    }

    #[inline]
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    /// 目录修改期间持有
    #[inline]
    pub(crate) fn lock_dir(&self) -> MutexGuard<'_, ()> {
        self.dir_lock.lock()
    }
}

impl InodeTable {
    /// 打开 `sector` 上的 inode；已打开的直接共享，不读磁盘
    pub fn open(&self, cache: &BufferCache, sector: SectorId) -> Result<Arc<Inode>> {
        let mut inodes = self.inodes.lock();
        if let Some(inode) = inodes.get(&sector) {
            inode.state.lock().open_count += 1;
            return Ok(Arc::clone(inode));
        }

        let disk = DiskInode::load(cache, sector)?;
        let inode = Arc::new(Inode {
            sector,
            state: Mutex::new(InodeState {
                open_count: 1,
                ..Default::default()
            }),
            disk: Mutex::new(disk),
            dir_lock: Mutex::new(()),
        });
        inodes.insert(sector, Arc::clone(&inode));
        Ok(inode)
    }

    /// 关闭一次。最后一次关闭时移出登记表，已删除的还要归还全部扇区。
    pub fn close(&self, inode: Arc<Inode>, cache: &BufferCache, free_map: &FreeMap) -> Result<()> {
        {
            let mut inodes = self.inodes.lock();
            let mut state = inode.state.lock();
            state.open_count -= 1;
            if state.open_count > 0 {
                return Ok(());
            }
            inodes.remove(&inode.sector);
            if !state.removed {
                return Ok(());
            }
        }

        let mut sectors = inode.disk.lock().owned_sectors(cache, inode.sector)?;
        sectors.push(inode.sector);
        log::debug!(
            "reclaiming inode {}: {} sectors",
            inode.sector,
            sectors.len()
        );
        free_map.release_all(&sectors)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inodes.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inodes.lock().is_empty()
    }
}

/// 把已分配的扇区清零并装入新 inode，最后写出 inode
fn lay_out(
    cache: &BufferCache,
    sector: SectorId,
    length: usize,
    kind: DiskInodeKind,
    sectors: &[SectorId],
) -> Result<()> {
    for &sector in sectors {
        cache.zero(sector)?;
    }

    let mut disk = DiskInode::new(kind);
    let mut supply = sectors.iter().copied();
    for index in 0..DiskInode::count_data_sectors(length) {
        disk.install(index, cache, sector, &mut || {
            supply.next().ok_or(FsError::NoSpace)
        })?;
    }
    disk.length = length as u32;
    disk.store(cache, sector)
}

/// 分配一个清零的扇区
fn fresh_sector(cache: &BufferCache, free_map: &FreeMap) -> Result<SectorId> {
    let sector = free_map.allocate_one()?;
    if let Err(err) = cache.zero(sector) {
        free_map.release(sector, 1)?;
        return Err(err);
    }
    Ok(sector)
}
