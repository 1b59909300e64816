//! # 文件系统层
//!
//! 把块缓存、空闲位图与 inode 登记表组装在一起，
//! 负责格式化、挂载、卸载，并按路径创建、打开与删除文件。
//!
//! 路径以 `/` 分隔：以 `/` 开头的从根目录解析，否则从给定的工作目录
//! （未给出时同样是根目录）解析。空的路径分量被忽略，
//! `.` 与 `..` 是每个目录里真实存在的目录项。

use alloc::sync::Arc;
use alloc::vec::Vec;

use block_dev::BlockDevice;

use crate::inode::InodeTable;
use crate::{
    BufferCache, CacheConfig, Dir, DiskInode, DiskInodeKind, File, FreeMap, FsError, Inode,
    Result, Runtime, SectorId, ROOT_DIR_SECTOR,
};

pub struct FileSystem {
    cache: Arc<BufferCache>,
    free_map: FreeMap,
    inodes: InodeTable,
}

impl FileSystem {
    /// 在设备上建立空的文件系统：空闲位图与只含 `.`、`..` 的根目录
    pub fn format(device: Arc<dyn BlockDevice>, config: CacheConfig) -> Result<Arc<Self>> {
        let cache = Arc::new(BufferCache::new(device, config));
        let free_map = FreeMap::create(Arc::clone(&cache))?;
        let fs = Arc::new(Self {
            cache,
            free_map,
            inodes: InodeTable::default(),
        });

        Dir::create(&fs, ROOT_DIR_SECTOR, ROOT_DIR_SECTOR)?;
        fs.cache.flush()?;
        log::info!(
            "formatted {} sectors, {} free",
            fs.total_sectors(),
            fs.free_map.free_count()
        );

        Ok(fs)
    }

    /// 挂载已有的文件系统，校验空闲位图与根目录
    pub fn mount(device: Arc<dyn BlockDevice>, config: CacheConfig) -> Result<Arc<Self>> {
        let cache = Arc::new(BufferCache::new(device, config));
        let free_map = FreeMap::load(Arc::clone(&cache))?;

        if !DiskInode::load(&cache, ROOT_DIR_SECTOR)?.is_dir() {
            log::error!("root inode is not a directory");
            return Err(FsError::Corrupted {
                sector: ROOT_DIR_SECTOR,
            });
        }

        log::info!(
            "mounted {} sectors, {} free",
            cache.sectors(),
            free_map.free_count()
        );
        Ok(Arc::new(Self {
            cache,
            free_map,
            inodes: InodeTable::default(),
        }))
    }

    /// 启动定时写回与预读
    pub fn spawn_daemons(&self, runtime: Arc<dyn Runtime>) {
        self.cache.spawn_daemons(runtime);
    }

    /// 卸载：停止后台任务并写回全部脏扇区
    pub fn done(&self) -> Result<()> {
        if !self.inodes.is_empty() {
            log::warn!("unmounting with {} inodes still open", self.inodes.len());
        }
        self.cache.shutdown()
    }

    #[inline]
    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    #[inline]
    pub fn free_map(&self) -> &FreeMap {
        &self.free_map
    }

    #[inline]
    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    #[inline]
    pub fn total_sectors(&self) -> usize {
        self.cache.sectors()
    }

    #[inline]
    pub fn open_inodes(&self) -> usize {
        self.inodes.len()
    }
}

impl FileSystem {
    /// 创建长度为 `initial_size` 的文件
    pub fn create(
        self: &Arc<Self>,
        cwd: Option<&Dir>,
        path: &str,
        initial_size: usize,
    ) -> Result<()> {
        let (parent, name) = self.walk(cwd, path)?;
        let name = name.ok_or(FsError::InvalidPath)?;
        if parent.lookup(name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let sector = self.free_map.allocate_one()?;
        if let Err(err) = Inode::create(
            &self.cache,
            &self.free_map,
            sector,
            initial_size,
            DiskInodeKind::File,
        ) {
            self.free_map.release(sector, 1)?;
            return Err(err);
        }

        if let Err(err) = parent.add(name, sector, false) {
            self.discard(sector)?;
            return Err(err);
        }
        Ok(())
    }

    pub fn create_dir(self: &Arc<Self>, cwd: Option<&Dir>, path: &str) -> Result<()> {
        let (parent, name) = self.walk(cwd, path)?;
        let name = name.ok_or(FsError::InvalidPath)?;
        if parent.lookup(name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let sector = self.free_map.allocate_one()?;
        if let Err(err) = Dir::create(self, sector, parent.inumber()) {
            self.free_map.release(sector, 1)?;
            return Err(err);
        }

        if let Err(err) = parent.add(name, sector, true) {
            self.discard(sector)?;
            return Err(err);
        }
        Ok(())
    }

    /// 打开文件或目录的 inode 作为文件句柄
    pub fn open(self: &Arc<Self>, cwd: Option<&Dir>, path: &str) -> Result<File> {
        let (parent, name) = self.walk(cwd, path)?;
        let inode = match name {
            None => parent.inode().reopen(),
            Some(name) => parent.open_entry(name)?.ok_or(FsError::NotFound)?.1,
        };
        Ok(File::new(self, inode))
    }

    pub fn open_dir(self: &Arc<Self>, cwd: Option<&Dir>, path: &str) -> Result<Dir> {
        let (parent, name) = self.walk(cwd, path)?;
        match name {
            None => Ok(parent),
            Some(name) => parent.open_dir(name),
        }
    }

    pub fn remove(self: &Arc<Self>, cwd: Option<&Dir>, path: &str) -> Result<()> {
        let (parent, name) = self.walk(cwd, path)?;
        parent.remove(name.ok_or(FsError::InvalidPath)?)
    }

    /// 解析路径，返回其 inode 编号。
    /// 编号只反映解析那一刻；要使用该文件应当 [`FileSystem::open`]。
    pub fn lookup(self: &Arc<Self>, cwd: Option<&Dir>, path: &str) -> Result<SectorId> {
        let (parent, name) = self.walk(cwd, path)?;
        match name {
            None => Ok(parent.inumber()),
            Some(name) => Ok(parent.lookup(name)?.ok_or(FsError::NotFound)?.sector()),
        }
    }
}

impl FileSystem {
    /// 走到路径最后一个分量的父目录。
    /// 路径只指向起点目录本身（如 `/`）时，最后一个分量为空。
    fn walk<'p>(self: &Arc<Self>, cwd: Option<&Dir>, path: &'p str) -> Result<(Dir, Option<&'p str>)> {
        if path.is_empty() {
            return Err(FsError::InvalidPath);
        }

        let mut dir = match cwd {
            Some(cwd) if !path.starts_with('/') => cwd.reopen(),
            _ => Dir::open_root(self)?,
        };

        let mut components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let last = components.pop();

        for component in components {
            dir = dir.open_dir(component)?;
        }

        Ok((dir, last))
    }

    /// 丢弃刚创建、尚未挂进目录的 inode
    fn discard(&self, sector: SectorId) -> Result<()> {
        let inode = Inode::open(self, sector)?;
        inode.mark_removed();
        inode.close(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RamDisk;
    use crate::FREE_MAP_SECTOR;

    fn format(sectors: usize) -> (Arc<RamDisk>, Arc<FileSystem>) {
        let disk = Arc::new(RamDisk::new(sectors));
        let fs = FileSystem::format(disk.clone(), CacheConfig::with_capacity(16)).unwrap();
        (disk, fs)
    }

    #[test]
    fn nested_paths() {
        let (_, fs) = format(512);
        fs.create_dir(None, "/a").unwrap();
        fs.create_dir(None, "a/b").unwrap();
        fs.create(None, "/a/b/c", 10).unwrap();

        let b = fs.open_dir(None, "//a/./b/").unwrap();
        assert_eq!(fs.lookup(Some(&b), "c"), fs.lookup(None, "/a/b/c"));
        assert_eq!(fs.lookup(Some(&b), ".."), fs.lookup(None, "/a"));
        assert_eq!(fs.lookup(Some(&b), "/"), Ok(ROOT_DIR_SECTOR));
        assert_eq!(fs.open(Some(&b), "c").unwrap().length(), 10);

        assert_eq!(fs.lookup(None, "/a/x/c"), Err(FsError::NotFound));
        assert_eq!(fs.lookup(None, "/a/b/c/d"), Err(FsError::NotADirectory));
        assert_eq!(fs.open_dir(None, "/a/b/c").map(|dir| dir.inumber()), Err(FsError::NotADirectory));
        assert_eq!(fs.create(None, "", 0), Err(FsError::InvalidPath));
        assert_eq!(fs.remove(None, "/"), Err(FsError::InvalidPath));
    }

    #[test]
    fn failed_create_releases_everything() {
        let (_, fs) = format(512);
        fs.create(None, "/f", 0).unwrap();
        let free = fs.free_map().free_count();

        assert_eq!(fs.create(None, "/f", 1000), Err(FsError::AlreadyExists));
        assert_eq!(
            fs.create(None, "/name-that-is-too-long", 1000),
            Err(FsError::NameTooLong)
        );
        assert_eq!(fs.free_map().free_count(), free);
    }

    #[test]
    fn reclaimed_inode_cannot_be_reopened() {
        let (_, fs) = format(512);
        fs.create(None, "/f", 1000).unwrap();
        let sector = fs.lookup(None, "/f").unwrap();
        fs.remove(None, "/f").unwrap();

        assert!(!fs.free_map().is_allocated(sector));
        assert_eq!(
            Inode::open(&fs, sector).map(|inode| inode.inumber()),
            Err(FsError::NotFound)
        );
        assert_eq!(fs.open(None, "/f").map(|file| file.inumber()), Err(FsError::NotFound));

        // 扇区被新文件复用时，登记表里没有旧 inode 的副本
        fs.create(None, "/g", 0).unwrap();
        assert_eq!(fs.lookup(None, "/g"), Ok(sector));
        let g = fs.open(None, "/g").unwrap();
        assert_eq!(g.length(), 0);
        assert_eq!(g.inode().open_count(), 1);
    }

    #[test]
    fn open_before_remove_defers_reclaim() {
        let (_, fs) = format(512);
        fs.create_dir(None, "/d").unwrap();
        fs.create(None, "/d/f", 1000).unwrap();
        let free = fs.free_map().free_count();

        let d = fs.open_dir(None, "/d").unwrap();
        let (entry, inode) = d.open_entry("f").unwrap().unwrap();
        fs.remove(None, "/d/f").unwrap();
        assert!(d.open_entry("f").unwrap().is_none());
        assert!(fs.free_map().is_allocated(entry.sector()));

        inode.close(&fs).unwrap();
        assert!(!fs.free_map().is_allocated(entry.sector()));
        assert_eq!(fs.free_map().free_count(), free + 3);
    }

    #[test]
    fn remount_keeps_contents() {
        let (disk, fs) = format(512);
        fs.create_dir(None, "/docs").unwrap();
        fs.create(None, "/docs/readme", 0).unwrap();
        fs.open(None, "/docs/readme")
            .unwrap()
            .write(b"index-fs")
            .unwrap();
        let free = fs.free_map().free_count();
        fs.done().unwrap();

        let fs = FileSystem::mount(disk, CacheConfig::default()).unwrap();
        assert_eq!(fs.free_map().free_count(), free);
        let mut file = fs.open(None, "/docs/readme").unwrap();
        let mut buf = [0; 8];
        assert_eq!(file.read(&mut buf), Ok(8));
        assert_eq!(&buf, b"index-fs");
    }

    #[test]
    fn mount_rejects_corrupted_root() {
        let (disk, fs) = format(128);
        fs.done().unwrap();

        let mut root = disk.sector(ROOT_DIR_SECTOR.into());
        root[80] ^= 0xff;
        disk.set_sector(ROOT_DIR_SECTOR.into(), &root);
        assert_eq!(
            FileSystem::mount(disk.clone(), CacheConfig::default()).map(|_| ()),
            Err(FsError::Corrupted {
                sector: ROOT_DIR_SECTOR
            })
        );

        disk.set_sector(FREE_MAP_SECTOR.into(), &[0; 512]);
        assert_eq!(
            FileSystem::mount(disk, CacheConfig::default()).map(|_| ()),
            Err(FsError::Corrupted {
                sector: FREE_MAP_SECTOR
            })
        );
    }
}
