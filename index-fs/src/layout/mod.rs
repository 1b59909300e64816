//! # 磁盘数据结构层
//!
//! index-fs 没有超级块，磁盘布局只有两处固定：
//! 0 号扇区是空闲位图文件的 inode，1 号扇区是根目录的 inode；
//! 其余扇区由分配器动态决定用作 inode、索引或数据。

mod inode;
pub use inode::{DiskInode, DiskInodeKind, DIRECT_COUNT, MAX_FILE_SECTORS, PTRS_PER_SECTOR};

/// 目录项，也属于磁盘文件系统数据结构
mod dir_entry;
pub use dir_entry::{DirEntry, EntryFlag, DIR_ENTRY_MAX, NAME_MAX};
