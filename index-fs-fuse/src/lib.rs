//! 在宿主机上使用 index-fs：镜像文件与内存块设备、基于线程的后台任务

mod block_file;
mod mem_disk;
mod runtime;
mod transfer;


pub use self::{
    block_file::BlockFile,
    mem_disk::MemDisk,
    runtime::StdRuntime,
    transfer::{copy_in, copy_out, to_io},
};
