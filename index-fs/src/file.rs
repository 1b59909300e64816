//! 文件句柄：每次打开各自持有读写位置，底层 inode 则是共享的

use alloc::sync::Arc;

use crate::{FileSystem, FsError, Inode, Result, SectorId};

pub struct File {
    fs: Arc<FileSystem>,
    inode: Arc<Inode>,
    pos: usize,
    /// 本句柄是否调用过 [`File::deny_write`]
    deny_write: bool,
    closed: bool,
}

impl File {
    /// 接管一次已经计入的打开
    pub fn new(fs: &Arc<FileSystem>, inode: Arc<Inode>) -> Self {
        Self {
            fs: Arc::clone(fs),
            inode,
            pos: 0,
            deny_write: false,
            closed: false,
        }
    }

    pub fn reopen(&self) -> Self {
        Self::new(&self.fs, self.inode.reopen())
    }

    /// 从当前位置读，并前移位置
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let read = self.read_at(buf, self.pos)?;
        self.pos += read;
        Ok(read)
    }

    /// 从当前位置写，并前移位置
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let written = self.write_at(data, self.pos)?;
        self.pos += written;
        Ok(written)
    }

    #[inline]
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        self.inode.read_at(&self.fs, buf, offset)
    }

    pub fn write_at(&self, data: &[u8], offset: usize) -> Result<usize> {
        if self.inode.is_dir() {
            return Err(FsError::IsADirectory);
        }
        self.inode.write_at(&self.fs, data, offset)
    }

    /// 位置可以越过文件末尾，之后的写入会扩展文件
    #[inline]
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    #[inline]
    pub fn tell(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.inode.length()
    }

    /// 禁止任何句柄写入底层文件，直到本句柄允许或关闭
    pub fn deny_write(&mut self) {
        if !self.deny_write {
            self.deny_write = true;
            self.inode.deny_write();
        }
    }

    pub fn allow_write(&mut self) {
        if self.deny_write {
            self.deny_write = false;
            self.inode.allow_write();
        }
    }

    #[inline]
    pub fn inumber(&self) -> SectorId {
        self.inode.inumber()
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.inode.is_dir()
    }

    #[inline]
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.allow_write();
        self.closed = true;
        Arc::clone(&self.inode).close(&self.fs)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            log::error!("failed to close file {}: {err}", self.inumber());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RamDisk;
    use crate::CacheConfig;

    fn setup() -> (Arc<FileSystem>, File) {
        let fs = FileSystem::format(Arc::new(RamDisk::new(256)), CacheConfig::with_capacity(8))
            .unwrap();
        fs.create(None, "/f", 0).unwrap();
        let file = fs.open(None, "/f").unwrap();
        (fs, file)
    }

    #[test]
    fn cursor_advances() {
        let (_fs, mut file) = setup();
        assert_eq!(file.write(b"hello "), Ok(6));
        assert_eq!(file.write(b"world"), Ok(5));
        assert_eq!(file.tell(), 11);
        assert_eq!(file.length(), 11);

        file.seek(6);
        let mut buf = [0; 16];
        assert_eq!(file.read(&mut buf), Ok(5));
        assert_eq!(&buf[..5], b"world");
        assert_eq!(file.read(&mut buf), Ok(0));
    }

    #[test]
    fn handles_share_the_inode_but_not_the_cursor() {
        let (_fs, mut file) = setup();
        let mut other = file.reopen();
        file.write(b"abc").unwrap();

        assert_eq!(other.tell(), 0);
        let mut buf = [0; 3];
        other.read(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        assert_eq!(file.inode().open_count(), 2);
    }

    #[test]
    fn deny_write_lasts_until_close() {
        let (fs, mut file) = setup();
        let mut writer = fs.open(None, "f").unwrap();

        file.deny_write();
        file.deny_write();
        assert_eq!(writer.write(b"x"), Err(FsError::WriteDenied));

        file.close().unwrap();
        assert_eq!(writer.write(b"x"), Ok(1));
    }

    #[test]
    fn seek_past_end_then_write_extends() {
        let (_fs, mut file) = setup();
        file.seek(1000);
        file.write(b"!").unwrap();
        assert_eq!(file.length(), 1001);

        let mut buf = [0xff; 4];
        assert_eq!(file.read_at(&mut buf, 500), Ok(4));
        assert_eq!(buf, [0; 4]);
    }
}
