//! The atomic, on-disk snapshot file: a staged writer and a mmap-backed
//! reader, grounded on `original_source/Storage/SnapshotFile.cc`.
//!
//! Layout (§3/§6): `format version byte (1) || metadata header (json,
//! length-prefixed) || state machine header+body (json, length-prefixed)`.
//! The writer never mutates the live `snapshot` file directly: it builds
//! `snapshot.staging`, fsyncs it, then renames it into place, so a crash
//! mid-write never corrupts the previous snapshot.

use std::fs::File;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::clock::ClusterTime;
use crate::error::StorageError;
use crate::error::StorageResult;
use crate::filesystem;
use crate::layout::StorageLayout;
use crate::membership::Configuration;
use crate::state_machine::StateMachineSnapshot;
use crate::LogId;

const FORMAT_VERSION: u8 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub last_included: LogId,
    pub last_cluster_time: ClusterTime,
    pub configuration: Configuration,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    header: SnapshotHeader,
    state_machine: StateMachineSnapshot,
}

fn write_framed(file: &File, offset: u64, body: &[u8]) -> StorageResult<u64> {
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(body);
    filesystem::pwrite_at(file, offset, &framed)?;
    Ok(offset + framed.len() as u64)
}

fn read_framed(bytes: &[u8], offset: usize) -> StorageResult<(Vec<u8>, usize)> {
    let len = u32::from_le_bytes(
        bytes
            .get(offset..offset + 4)
            .ok_or_else(|| StorageError::fatal("snapshot file truncated"))?
            .try_into()
            .unwrap(),
    ) as usize;
    let body = bytes
        .get(offset + 4..offset + 4 + len)
        .ok_or_else(|| StorageError::fatal("snapshot file truncated"))?
        .to_vec();
    Ok((body, offset + 4 + len))
}

/// A staged, in-progress snapshot write. One writer exists at a time; a
/// concurrent earlier-index writer is simply dropped by its owner when a
/// newer one begins (§4.9.8).
pub struct Writer {
    file: File,
    path: std::path::PathBuf,
    final_path: std::path::PathBuf,
    offset: u64,
    /// Bytes written so far, shared so a caller (e.g. a follower's
    /// `InstallSnapshot` handler reporting `bytes_stored`) can observe
    /// progress from another task without holding the writer.
    pub progress: Arc<AtomicU64>,
}

impl Writer {
    pub fn begin(layout: &StorageLayout, header: SnapshotHeader) -> StorageResult<Self> {
        let path = layout.snapshot_staging_path();
        let file = filesystem::open_read_write(&path)?;
        file.set_len(0).map_err(StorageError::Io)?;
        let header_bytes = serde_json::to_vec(&header).map_err(|e| StorageError::Serde(e.to_string()))?;
        let mut offset = 1u64;
        filesystem::pwrite_at(&file, 0, &[FORMAT_VERSION])?;
        offset = write_framed(&file, offset, &header_bytes)?;
        Ok(Self {
            file,
            path,
            final_path: layout.snapshot_path(),
            offset,
            progress: Arc::new(AtomicU64::new(offset)),
        })
    }

    /// Appends raw bytes at the current write position and returns the new
    /// position (`byte_offset`/`bytes_stored` in the `InstallSnapshot` RPC).
    pub fn append_chunk(&mut self, byte_offset: u64, data: &[u8]) -> StorageResult<u64> {
        if byte_offset != self.offset {
            return Err(StorageError::fatal(format!(
                "snapshot writer expected offset {}, got {byte_offset}",
                self.offset
            )));
        }
        filesystem::pwrite_at(&self.file, self.offset, data)?;
        self.offset += data.len() as u64;
        self.progress.store(self.offset, Ordering::Relaxed);
        Ok(self.offset)
    }

    pub fn write_state_machine(&mut self, snapshot: &StateMachineSnapshot) -> StorageResult<u64> {
        let body = serde_json::to_vec(snapshot).map_err(|e| StorageError::Serde(e.to_string()))?;
        self.offset = write_framed(&self.file, self.offset, &body)?;
        self.progress.store(self.offset, Ordering::Relaxed);
        Ok(self.offset)
    }

    pub fn bytes_written(&self) -> u64 {
        self.offset
    }

    /// Fsyncs the staging file and atomically renames it into place.
    pub fn finish(self) -> StorageResult<()> {
        filesystem::fsync(&self.file)?;
        filesystem::rename(&self.path, &self.final_path)?;
        Ok(())
    }
}

/// A read-only, mmap-backed view of the current snapshot file.
pub struct Reader {
    mmap: memmap2::Mmap,
    pub header: SnapshotHeader,
    body_offset: usize,
}

impl Reader {
    pub fn open(layout: &StorageLayout) -> StorageResult<Option<Self>> {
        let path = layout.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }
        let file = filesystem::open_read_only(&path)?;
        let mmap = filesystem::mmap_read_only(&file)?;
        if mmap.first().copied() != Some(FORMAT_VERSION) {
            return Err(StorageError::fatal("unrecognized snapshot format version"));
        }
        let (header_bytes, next) = read_framed(&mmap, 1)?;
        let header: SnapshotHeader = serde_json::from_slice(&header_bytes).map_err(|e| StorageError::Serde(e.to_string()))?;
        Ok(Some(Self {
            mmap,
            header,
            body_offset: next,
        }))
    }

    pub fn state_machine(&self) -> StorageResult<StateMachineSnapshot> {
        let (body, _) = read_framed(&self.mmap, self.body_offset)?;
        serde_json::from_slice(&body).map_err(|e| StorageError::Serde(e.to_string()))
    }

    /// The raw bytes of the snapshot file from `byte_offset` on, used by a
    /// leader's replication task to stream `InstallSnapshot` chunks.
    pub fn chunk(&self, byte_offset: u64, max_len: usize) -> &[u8] {
        let start = (byte_offset as usize).min(self.mmap.len());
        let end = (start + max_len).min(self.mmap.len());
        &self.mmap[start..end]
    }

    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreeset;

    fn header() -> SnapshotHeader {
        SnapshotHeader {
            last_included: LogId::new(1, 10),
            last_cluster_time: 42,
            configuration: Configuration::stable(1, btreeset! {1}),
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::init(dir.path(), 1).unwrap();
        let sm = crate::state_machine::StateMachineSnapshot {
            version_history: vec![(0, 1)],
            sessions: vec![],
            tree: crate::tree::Tree::new().to_snapshot(),
            last_applied: 10,
        };
        let mut writer = Writer::begin(&layout, header()).unwrap();
        writer.write_state_machine(&sm).unwrap();
        writer.finish().unwrap();

        let reader = Reader::open(&layout).unwrap().expect("snapshot present");
        assert_eq!(reader.header.last_included, LogId::new(1, 10));
        let restored = reader.state_machine().unwrap();
        assert_eq!(restored.last_applied, 10);
    }

    #[test]
    fn chunked_append_rejects_wrong_offset() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::init(dir.path(), 1).unwrap();
        let mut writer = Writer::begin(&layout, header()).unwrap();
        let pos = writer.bytes_written();
        assert!(writer.append_chunk(pos + 1, b"x").is_err());
        assert!(writer.append_chunk(pos, b"x").is_ok());
    }

    #[test]
    fn missing_snapshot_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::init(dir.path(), 1).unwrap();
        assert!(Reader::open(&layout).unwrap().is_none());
    }
}
