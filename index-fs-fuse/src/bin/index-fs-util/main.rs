mod cli;

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use index_fs::{BlockDevice, CacheConfig, FileSystem};
use index_fs_fuse::{copy_in, copy_out, to_io, BlockFile};
use typed_bytesize::ByteSizeIec;

use self::cli::{Cli, Command};

fn main() -> io::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = CacheConfig {
        capacity: cli.cache_slots,
        access_cap: cli.access_cap,
        ..Default::default()
    };

    match cli.command {
        Command::Format { size_mib } => format(&cli.image, size_mib, config),
        command => {
            let fd = OpenOptions::new().read(true).write(true).open(&cli.image)?;
            let fs = FileSystem::mount(open_device(fd)?, config).map_err(to_io)?;
            let result = run(&fs, command);
            fs.done().map_err(to_io)?;
            log::debug!("cache stats: {:?}", fs.cache().stats());
            result
        }
    }
}

fn format(image: &Path, size_mib: u64, config: CacheConfig) -> io::Result<()> {
    let disk_size = ByteSizeIec::mib(size_mib).0;
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(image)?;
    fd.set_len(disk_size)?;

    let fs = FileSystem::format(open_device(fd)?, config).map_err(to_io)?;
    println!(
        "{}: {} sectors, {} free",
        image.display(),
        fs.total_sectors(),
        fs.free_map().free_count()
    );
    fs.done().map_err(to_io)
}

fn open_device(fd: File) -> io::Result<Arc<dyn BlockDevice>> {
    Ok(Arc::new(BlockFile::new(fd)?))
}

fn run(fs: &Arc<FileSystem>, command: Command) -> io::Result<()> {
    let mut stdout = io::stdout().lock();

    match command {
        Command::Format { .. } => unreachable!("handled before mounting"),
        Command::Ls { path } => {
            let dir = fs.open_dir(None, &path).map_err(to_io)?;
            for entry in dir.entries().map_err(to_io)? {
                let name = entry.name();
                // 列目录期间被删除的项直接跳过
                let Some((_, inode)) = dir.open_entry(name).map_err(to_io)? else {
                    continue;
                };
                let length = inode.length();
                inode.close(fs).map_err(to_io)?;
                if entry.is_dir() {
                    writeln!(stdout, "{:>10}  {name}/", "-")?;
                } else {
                    writeln!(stdout, "{length:>10}  {name}")?;
                }
            }
        }
        Command::Cat { path } => {
            copy_out(fs, &path, &mut stdout)?;
        }
        Command::Put { host, path } => {
            let written = copy_in(fs, &path, &mut File::open(host)?)?;
            log::info!("appended {written} bytes to {path}");
        }
        Command::Get { path, host } => {
            let read = copy_out(fs, &path, &mut File::create(host)?)?;
            log::info!("extracted {read} bytes from {path}");
        }
        Command::Mkdir { path } => fs.create_dir(None, &path).map_err(to_io)?,
        Command::Rm { path } => fs.remove(None, &path).map_err(to_io)?,
        Command::Stat { path } => {
            let file = fs.open(None, &path).map_err(to_io)?;
            writeln!(stdout, "inode:  {}", file.inumber())?;
            writeln!(
                stdout,
                "kind:   {}",
                if file.is_dir() { "directory" } else { "file" }
            )?;
            writeln!(stdout, "length: {}", file.length())?;
            writeln!(stdout, "opens:  {}", file.inode().open_count())?;
        }
    }

    Ok(())
}
