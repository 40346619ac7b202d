//! Assembles and locks the on-disk directory tree one Raft server owns.
//!
//! Grounded on `original_source/Storage/Layout.cc`: a top directory holding
//! a `server` subdirectory (named by server id) containing `log/` (segments
//! and metadata files) and `snapshot/` (the current snapshot file plus its
//! staging file), guarded by a flock on `server/lock` for the process
//! lifetime.

use std::fs::File;
use std::path::Path;
use std::path::PathBuf;

use crate::error::StorageResult;
use crate::filesystem;

pub struct StorageLayout {
    pub top_dir: PathBuf,
    pub server_dir: PathBuf,
    pub log_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    lock_file: File,
}

impl StorageLayout {
    /// Creates the directory tree under `top_dir/server_id` if absent, and
    /// takes an exclusive flock on `server_id/lock` for as long as this
    /// value lives.
    pub fn init(top_dir: &Path, server_id: u64) -> StorageResult<Self> {
        filesystem::create_dir_all(top_dir)?;
        let server_dir = top_dir.join(server_id.to_string());
        filesystem::create_dir_all(&server_dir)?;
        let log_dir = server_dir.join("log");
        let snapshot_dir = server_dir.join("snapshot");
        filesystem::create_dir_all(&log_dir)?;
        filesystem::create_dir_all(&snapshot_dir)?;

        let lock_path = server_dir.join("lock");
        let lock_file = filesystem::try_lock_exclusive(&lock_path)?;

        Ok(Self {
            top_dir: top_dir.to_path_buf(),
            server_dir,
            log_dir,
            snapshot_dir,
            lock_file,
        })
    }

    pub fn metadata_path(&self, which: u8) -> PathBuf {
        self.log_dir.join(format!("metadata{which}"))
    }

    pub fn segment_path(&self, start_index: u64) -> PathBuf {
        self.log_dir.join(format!("{start_index:020}.segment"))
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.snapshot_dir.join("snapshot")
    }

    pub fn snapshot_staging_path(&self) -> PathBuf {
        self.snapshot_dir.join("snapshot.staging")
    }
}

impl Drop for StorageLayout {
    fn drop(&mut self) {
        let _ = fs4::FileExt::unlock(&self.lock_file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_tree_and_locks() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::init(dir.path(), 1).unwrap();
        assert!(layout.log_dir.is_dir());
        assert!(layout.snapshot_dir.is_dir());
    }

    #[test]
    fn second_lock_on_same_server_fails() {
        let dir = tempfile::tempdir().unwrap();
        let _layout = StorageLayout::init(dir.path(), 1).unwrap();
        let second = StorageLayout::init(dir.path(), 1);
        assert!(second.is_err());
    }
}
