//! # 目录
//!
//! 目录就是一个文件，其内容是至多 [`DIR_ENTRY_MAX`] 个定长目录项组成的平坦数组。
//! 删除只把目录项标记为未使用，不做压缩；新增时优先复用这些空槽。
//!
//! 每个目录的前两项是 `.` 与 `..`，[`Dir::readdir`] 不会返回它们。

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::{
    DirEntry, DiskInodeKind, FileSystem, FsError, Inode, Result, SectorId, DIR_ENTRY_MAX, NAME_MAX,
    ROOT_DIR_SECTOR,
};

pub struct Dir {
    fs: Arc<FileSystem>,
    inode: Arc<Inode>,
    /// 下一次 `readdir` 开始的槽位
    pos: usize,
    closed: bool,
}

impl Dir {
    /// 在 `sector` 上创建空目录，写入 `.` 与 `..`
    pub fn create(fs: &Arc<FileSystem>, sector: SectorId, parent: SectorId) -> Result<()> {
        Inode::create(
            fs.cache(),
            fs.free_map(),
            sector,
            2 * DirEntry::SIZE,
            DiskInodeKind::Directory,
        )?;

        let dir = Self::open(fs, sector)?;
        dir.write_slot(0, &DirEntry::new(".", sector, true)?)?;
        dir.write_slot(1, &DirEntry::new("..", parent, true)?)?;
        dir.close()
    }

    pub fn open(fs: &Arc<FileSystem>, sector: SectorId) -> Result<Self> {
        let inode = Inode::open(fs, sector)?;
        if !inode.is_dir() {
            inode.close(fs)?;
            return Err(FsError::NotADirectory);
        }
        Ok(Self::from_inode(fs, inode))
    }

    #[inline]
    pub fn open_root(fs: &Arc<FileSystem>) -> Result<Self> {
        Self::open(fs, ROOT_DIR_SECTOR)
    }

    pub fn reopen(&self) -> Self {
        Self::from_inode(&self.fs, self.inode.reopen())
    }

    /// 查找名为 `name` 的目录项
    pub fn lookup(&self, name: &str) -> Result<Option<DirEntry>> {
        Ok(self
            .slots()?
            .into_iter()
            .find(|entry| entry.in_use() && entry.name() == name))
    }

    /// 查找并打开名为 `name` 的目录项。
    ///
    /// 两步都在目录锁下完成，与 [`Dir::remove`] 互斥：
    /// 要么在删除前打开（回收推迟到关闭），要么找不到。
    pub fn open_entry(&self, name: &str) -> Result<Option<(DirEntry, Arc<Inode>)>> {
        let _guard = self.inode.lock_dir();
        let Some(entry) = self.lookup(name)? else {
            return Ok(None);
        };
        let inode = Inode::open(&self.fs, entry.sector())?;
        Ok(Some((entry, inode)))
    }

    /// 打开名为 `name` 的子目录
    pub fn open_dir(&self, name: &str) -> Result<Self> {
        let (entry, inode) = self.open_entry(name)?.ok_or(FsError::NotFound)?;
        if !entry.is_dir() || !inode.is_dir() {
            inode.close(&self.fs)?;
            return Err(FsError::NotADirectory);
        }
        Ok(Self::from_inode(&self.fs, inode))
    }

    /// 新增目录项，优先复用空槽
    pub fn add(&self, name: &str, sector: SectorId, is_dir: bool) -> Result<()> {
        let entry = DirEntry::new(name, sector, is_dir)?;

        let _guard = self.inode.lock_dir();
        // 已删除的目录不再接受新项
        if self.inode.is_removed() {
            return Err(FsError::NotFound);
        }

        let slots = self.slots()?;
        if slots.iter().any(|slot| slot.in_use() && slot.name() == name) {
            return Err(FsError::AlreadyExists);
        }

        let index = slots
            .iter()
            .position(|slot| !slot.in_use())
            .unwrap_or(slots.len());
        if index >= DIR_ENTRY_MAX {
            return Err(FsError::DirectoryFull);
        }

        self.write_slot(index, &entry)?;
        log::debug!("added {name} -> {sector} in directory {}", self.inumber());
        Ok(())
    }

    /// 删除目录项并标记其 inode 为已删除。
    /// 非空目录不能删除，`.` 与 `..` 也不能。
    pub fn remove(&self, name: &str) -> Result<()> {
        if matches!(name, "." | "..") {
            return Err(FsError::InvalidPath);
        }
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }

        let _guard = self.inode.lock_dir();
        let slots = self.slots()?;
        let (index, entry) = slots
            .iter()
            .enumerate()
            .find(|(_, slot)| slot.in_use() && slot.name() == name)
            .ok_or(FsError::NotFound)?;

        let inode = Inode::open(&self.fs, entry.sector())?;
        let result = self.unlink(index, &inode);
        inode.close(&self.fs)?;
        result?;

        log::debug!("removed {name} from directory {}", self.inumber());
        Ok(())
    }

    /// 返回下一个在用的名字，`.` 与 `..` 除外；读完后返回空
    pub fn readdir(&mut self) -> Result<Option<String>> {
        let slots = self.slots()?;
        while let Some(entry) = slots.get(self.pos) {
            self.pos += 1;
            if entry.in_use() && !entry.is_dot() {
                return Ok(Some(entry.name().to_string()));
            }
        }
        Ok(None)
    }

    #[inline]
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// 除 `.` 与 `..` 外没有在用的目录项
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self
            .slots()?
            .iter()
            .all(|entry| !entry.in_use() || entry.is_dot()))
    }

    /// 所有在用目录项的快照，`.` 与 `..` 除外
    pub fn entries(&self) -> Result<Vec<DirEntry>> {
        Ok(self
            .slots()?
            .into_iter()
            .filter(|entry| entry.in_use() && !entry.is_dot())
            .collect())
    }

    #[inline]
    pub fn inumber(&self) -> SectorId {
        self.inode.inumber()
    }

    #[inline]
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn close(mut self) -> Result<()> {
        self.release()
    }
}

impl Dir {
    fn from_inode(fs: &Arc<FileSystem>, inode: Arc<Inode>) -> Self {
        Self {
            fs: Arc::clone(fs),
            inode,
            pos: 0,
            closed: false,
        }
    }

    /// 读出全部槽位
    fn slots(&self) -> Result<Vec<DirEntry>> {
        let mut bytes = alloc::vec![0; self.inode.length()];
        let read = self.inode.read_at(&self.fs, &mut bytes, 0)?;
        Ok(bytes[..read]
            .chunks_exact(DirEntry::SIZE)
            .map(|raw| {
                let mut entry = [0; DirEntry::SIZE];
                entry.copy_from_slice(raw);
                DirEntry::decode(&entry)
            })
            .collect())
    }

    /// 清空第 `index` 个槽位并标记 `inode` 为已删除
    fn unlink(&self, index: usize, inode: &Arc<Inode>) -> Result<()> {
        // 检查为空到标记删除之间，子目录不能新增目录项
        let _child = inode.lock_dir();
        if inode.is_dir() && !Self::from_inode(&self.fs, inode.reopen()).is_empty()? {
            return Err(FsError::DirectoryNotEmpty);
        }

        self.write_slot(index, &DirEntry::default())?;
        inode.mark_removed();
        Ok(())
    }

    fn write_slot(&self, index: usize, entry: &DirEntry) -> Result<()> {
        let written = self
            .inode
            .write_at(&self.fs, &entry.encode(), index * DirEntry::SIZE)?;
        if written < DirEntry::SIZE {
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        Arc::clone(&self.inode).close(&self.fs)
    }
}

impl Drop for Dir {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            log::error!("failed to close directory {}: {err}", self.inumber());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RamDisk;
    use crate::CacheConfig;

    fn format() -> Arc<FileSystem> {
        FileSystem::format(Arc::new(RamDisk::new(512)), CacheConfig::with_capacity(16)).unwrap()
    }

    fn new_inode(fs: &FileSystem) -> SectorId {
        let sector = fs.free_map().allocate_one().unwrap();
        Inode::create(fs.cache(), fs.free_map(), sector, 0, DiskInodeKind::File).unwrap();
        sector
    }

    #[test]
    fn fresh_directory_has_dots_only() {
        let fs = format();
        let root = Dir::open_root(&fs).unwrap();
        assert!(root.is_empty().unwrap());
        assert_eq!(
            root.lookup("..").unwrap().map(|entry| entry.sector()),
            Some(ROOT_DIR_SECTOR)
        );

        let mut root = root;
        assert_eq!(root.readdir(), Ok(None));
    }

    #[test]
    fn names_are_unique() {
        let fs = format();
        let root = Dir::open_root(&fs).unwrap();
        let sector = new_inode(&fs);
        root.add("a", sector, false).unwrap();
        assert_eq!(root.add("a", sector, false), Err(FsError::AlreadyExists));
        assert_eq!(
            root.add("much-too-long-name", sector, false),
            Err(FsError::NameTooLong)
        );
        assert_eq!(root.lookup("a").unwrap().map(|e| e.sector()), Some(sector));
    }

    #[test]
    fn removed_slot_is_reused() {
        let fs = format();
        let root = Dir::open_root(&fs).unwrap();
        for name in ["a", "b", "c"] {
            root.add(name, new_inode(&fs), false).unwrap();
        }
        let length = root.inode().length();

        root.remove("b").unwrap();
        assert_eq!(root.lookup("b"), Ok(None));
        root.add("d", new_inode(&fs), false).unwrap();
        assert_eq!(root.inode().length(), length);

        let mut root = root;
        let mut names = Vec::new();
        while let Some(name) = root.readdir().unwrap() {
            names.push(name);
        }
        assert_eq!(names, ["a", "d", "c"]);

        root.rewind();
        assert_eq!(root.readdir(), Ok(Some("a".to_string())));
    }

    #[test]
    fn directory_fills_up() {
        let fs = format();
        let root = Dir::open_root(&fs).unwrap();
        let sector = new_inode(&fs);
        // 两个槽位被 `.` 与 `..` 占用
        for i in 0..DIR_ENTRY_MAX - 2 {
            root.add(&alloc::format!("f{i}"), sector, false).unwrap();
        }
        assert_eq!(root.add("last", sector, false), Err(FsError::DirectoryFull));
    }

    #[test]
    fn non_empty_directory_is_kept() {
        let fs = format();
        let root = Dir::open_root(&fs).unwrap();
        let sector = fs.free_map().allocate_one().unwrap();
        Dir::create(&fs, sector, root.inumber()).unwrap();
        root.add("sub", sector, true).unwrap();

        let sub = Dir::open(&fs, sector).unwrap();
        sub.add("inner", new_inode(&fs), false).unwrap();
        assert_eq!(root.remove("sub"), Err(FsError::DirectoryNotEmpty));

        sub.remove("inner").unwrap();
        root.remove("sub").unwrap();
        // 已删除但仍打开的目录不再接受新项
        assert_eq!(sub.add("late", sector, false), Err(FsError::NotFound));
        assert_eq!(root.remove("."), Err(FsError::InvalidPath));
    }

    #[test]
    fn opening_a_file_as_directory_fails() {
        let fs = format();
        let sector = new_inode(&fs);
        let before = fs.open_inodes();
        assert_eq!(
            Dir::open(&fs, sector).map(|dir| dir.inumber()),
            Err(FsError::NotADirectory)
        );
        assert_eq!(fs.open_inodes(), before);
    }
}
