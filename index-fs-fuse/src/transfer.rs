//! 宿主文件与镜像内文件之间的拷贝

use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;

use index_fs::{FileSystem, FsError};

/// 拷贝时每次搬运的字节数
const CHUNK: usize = 4096;

pub fn to_io(err: FsError) -> io::Error {
    let kind = match err {
        FsError::NotFound => ErrorKind::NotFound,
        FsError::AlreadyExists => ErrorKind::AlreadyExists,
        FsError::WriteDenied => ErrorKind::PermissionDenied,
        FsError::NameTooLong | FsError::InvalidPath => ErrorKind::InvalidInput,
        FsError::Corrupted { .. } => ErrorKind::InvalidData,
        _ => ErrorKind::Other,
    };
    io::Error::new(kind, err.to_string())
}

/// 把 `src` 的全部内容追加到镜像内的 `path`，文件不存在时先创建
pub fn copy_in(fs: &Arc<FileSystem>, path: &str, src: &mut impl Read) -> io::Result<usize> {
    match fs.create(None, path, 0) {
        Ok(()) | Err(FsError::AlreadyExists) => {}
        Err(err) => return Err(to_io(err)),
    }

    let mut file = fs.open(None, path).map_err(to_io)?;
    file.seek(file.length());

    let mut buf = vec![0; CHUNK];
    let mut total = 0;
    loop {
        let read = src.read(&mut buf)?;
        if read == 0 {
            break;
        }
        let written = file.write(&buf[..read]).map_err(to_io)?;
        total += written;
        if written < read {
            return Err(io::Error::new(
                ErrorKind::Other,
                format!("{path}: only {total} bytes fit"),
            ));
        }
    }

    file.close().map_err(to_io)?;
    Ok(total)
}

/// 把镜像内 `path` 的全部内容写到 `dst`
pub fn copy_out(fs: &Arc<FileSystem>, path: &str, dst: &mut impl Write) -> io::Result<usize> {
    let mut file = fs.open(None, path).map_err(to_io)?;
    if file.is_dir() {
        return Err(to_io(FsError::IsADirectory));
    }

    let mut buf = vec![0; CHUNK];
    let mut total = 0;
    loop {
        let read = file.read(&mut buf).map_err(to_io)?;
        if read == 0 {
            break;
        }
        dst.write_all(&buf[..read])?;
        total += read;
    }

    file.close().map_err(to_io)?;
    Ok(total)
}
