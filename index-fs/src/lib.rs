#![cfg_attr(not(test), no_std)]

extern crate alloc;

/* index-fs 的整体架构，自上而下 */

// 文件系统层：格式化、挂载与路径解析
mod fs;

// 文件句柄：每次打开的读写游标
mod file;

// 目录：由目录项组成的平坦数组
mod directory;

// 索引节点层：内存中去重的 inode 及其读写
mod inode;

// 空闲扇区位图
mod free_map;

// 磁盘数据结构层：inode 与目录项的编解码
mod layout;

// 块缓存层：扇区缓存、写回与预读
mod buffer_cache;

// 后台任务：定时写回与预读
mod daemon;

mod config;
mod error;
mod sector;

#[cfg(test)]
mod test_util;

pub use block_dev::{BlockDevice, DeviceError};

pub use self::{
    buffer_cache::{BufferCache, CacheStats},
    config::CacheConfig,
    daemon::Runtime,
    directory::Dir,
    error::{FsError, Result},
    file::File,
    free_map::FreeMap,
    fs::FileSystem,
    inode::{Inode, InodeTable},
    layout::{
        DirEntry, DiskInode, DiskInodeKind, EntryFlag, DIRECT_COUNT, DIR_ENTRY_MAX,
        MAX_FILE_SECTORS, NAME_MAX, PTRS_PER_SECTOR,
    },
    sector::SectorId,
};

pub const SECTOR_SIZE: usize = block_dev::BLOCK_SIZE;
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// 空闲位图文件的 inode 所在扇区
pub const FREE_MAP_SECTOR: SectorId = SectorId::new(0);
/// 根目录的 inode 所在扇区
pub const ROOT_DIR_SECTOR: SectorId = SectorId::new(1);

type SectorData = [u8; SECTOR_SIZE];
