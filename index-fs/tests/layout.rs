use std::mem;

use index_fs::{
    DirEntry, DiskInode, SectorId, DIRECT_COUNT, DIR_ENTRY_MAX, MAX_FILE_SECTORS, NAME_MAX,
    PTRS_PER_SECTOR, SECTOR_SIZE,
};

#[test]
fn on_disk() {
    assert_eq!(SECTOR_SIZE, DiskInode::default().encode().len());
    assert_eq!(24, DirEntry::SIZE);
    assert_eq!(4, mem::size_of::<SectorId>());
    // 目录项的名字字段还要放下结尾的 `\0`
    assert!(NAME_MAX < 16);
}

#[test]
fn capacity() {
    assert_eq!(16, DIRECT_COUNT);
    assert_eq!(128, PTRS_PER_SECTOR);
    assert_eq!(16 + 128 + 128 * 128, MAX_FILE_SECTORS);
    assert!(DIR_ENTRY_MAX * DirEntry::SIZE <= 3 * SECTOR_SIZE);
}
