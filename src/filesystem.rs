//! Thin, typed wrappers around the handful of filesystem primitives the
//! storage engine needs: open/read/write/rename/sync/lock/mmap. Grounded on
//! `original_source/Storage/FilesystemUtil.cc`'s split between "POSIX calls
//! that can fail for reasons worth distinguishing" and the rest of the
//! engine, which only ever sees `StorageResult`.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use fs4::FileExt;
use memmap2::Mmap;

use crate::error::StorageError;
use crate::error::StorageResult;

/// Opens (creating if absent) a file for read/write, matching the
/// teacher's preference for explicit `OpenOptions` over `File::create`.
pub fn open_read_write(path: &Path) -> StorageResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|e| StorageError::Io(e))
}

pub fn open_read_only(path: &Path) -> StorageResult<File> {
    OpenOptions::new().read(true).open(path).map_err(StorageError::Io)
}

pub fn create_dir_all(path: &Path) -> StorageResult<()> {
    std::fs::create_dir_all(path).map_err(StorageError::Io)
}

pub fn read_whole_file(path: &Path) -> StorageResult<Vec<u8>> {
    let mut file = open_read_only(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(StorageError::Io)?;
    Ok(buf)
}

pub fn write_whole_file(path: &Path, contents: &[u8]) -> StorageResult<()> {
    let mut file = open_read_write(path)?;
    file.set_len(0).map_err(StorageError::Io)?;
    file.write_all(contents).map_err(StorageError::Io)?;
    fdatasync(&file)?;
    Ok(())
}

/// Preallocates `len` bytes without changing the reported file size more
/// than necessary, falling back to a plain `set_len` where `fallocate` is
/// unavailable (non-Linux targets).
pub fn fallocate(file: &File, len: u64) -> StorageResult<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len as libc::off_t) };
        if rc == 0 {
            return Ok(());
        }
        if rc != libc::EOPNOTSUPP && rc != libc::ENOSYS {
            return Err(StorageError::Io(std::io::Error::from_raw_os_error(rc)));
        }
    }
    file.set_len(len).map_err(StorageError::Io)
}

pub fn fdatasync(file: &File) -> StorageResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let rc = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if rc != 0 {
            return Err(StorageError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        file.sync_all().map_err(StorageError::Io)
    }
}

pub fn fsync(file: &File) -> StorageResult<()> {
    file.sync_all().map_err(StorageError::Io)
}

pub fn fsync_dir(dir: &Path) -> StorageResult<()> {
    let file = open_read_only(dir)?;
    fsync(&file)
}

pub fn rename(from: &Path, to: &Path) -> StorageResult<()> {
    std::fs::rename(from, to).map_err(StorageError::Io)
}

pub fn unlink(path: &Path) -> StorageResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::Io(e)),
    }
}

pub fn pread_at(file: &File, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, offset).map_err(StorageError::Io)?;
        Ok(buf)
    }
    #[cfg(not(unix))]
    {
        let mut file = file.try_clone().map_err(StorageError::Io)?;
        file.seek(SeekFrom::Start(offset)).map_err(StorageError::Io)?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).map_err(StorageError::Io)?;
        Ok(buf)
    }
}

pub fn pwrite_at(file: &File, offset: u64, data: &[u8]) -> StorageResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_all_at(data, offset).map_err(StorageError::Io)
    }
    #[cfg(not(unix))]
    {
        let mut file = file.try_clone().map_err(StorageError::Io)?;
        file.seek(SeekFrom::Start(offset)).map_err(StorageError::Io)?;
        file.write_all(data).map_err(StorageError::Io)
    }
}

/// A read-only mapping of a closed (immutable) file, used by `SegmentedLog`
/// to read closed segments without copying them into the process.
pub fn mmap_read_only(file: &File) -> StorageResult<Mmap> {
    // Safety: the mapped files are only ever mutated by this process through
    // the exclusive-writer segment/snapshot APIs, which never mutate a file
    // once it is closed and mapped.
    unsafe { Mmap::map(file) }.map_err(StorageError::Io)
}

/// Advisory exclusive lock on `path`, held for the process lifetime via the
/// returned `File` (§"one Raft process per data directory", `layout.rs`).
pub fn try_lock_exclusive(path: &Path) -> StorageResult<File> {
    let file = open_read_write(path)?;
    file.try_lock_exclusive()
        .map_err(|_| StorageError::fatal(format!("{} is locked by another process", path.display())))?;
    Ok(file)
}

/// Joins path components the way `layout.rs` assembles directory trees.
pub fn join(base: &Path, name: &str) -> PathBuf {
    base.join(name)
}
