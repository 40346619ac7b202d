//! The alternating two-file metadata record: `current_term`, `voted_for`,
//! and `log_start_index`, persisted so a restart never forgets a vote
//! already cast.
//!
//! Grounded on `original_source/Storage/Log.cc`'s metadata handling: two
//! files (`metadata0`/`metadata1`) are written alternately so a crash mid
//! write always leaves one intact, readable copy; each write is framed as
//! `length(u32) || crc32(u32) || bincode(Metadata)`, and on open the newer
//! of the two valid copies (by an embedded monotonic version) wins.

use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::error::StorageError;
use crate::error::StorageResult;
use crate::filesystem;
use crate::layout::StorageLayout;
use crate::NodeId;

#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Metadata {
    pub version: u64,
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub log_start_index: u64,
}

pub struct MetadataFile {
    layout_paths: [std::path::PathBuf; 2],
    current: Metadata,
    /// Which of the two files holds `current`; the next write targets the
    /// other one.
    next_slot: u8,
}

fn frame(metadata: &Metadata) -> StorageResult<Vec<u8>> {
    let body = metadata_to_bytes(metadata)?;
    let crc = crc32fast::hash(&body);
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn metadata_to_bytes(metadata: &Metadata) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(metadata).map_err(|e| StorageError::Serde(e.to_string()))
}

fn metadata_from_bytes(bytes: &[u8]) -> StorageResult<Metadata> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Serde(e.to_string()))
}

fn read_one(path: &Path) -> Option<Metadata> {
    let bytes = filesystem::read_whole_file(path).ok()?;
    if bytes.len() < 8 {
        return None;
    }
    let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let crc = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let body = bytes.get(8..8 + len)?;
    if crc32fast::hash(body) != crc {
        tracing::warn!(?path, "metadata file failed checksum, ignoring");
        return None;
    }
    metadata_from_bytes(body).ok()
}

impl MetadataFile {
    /// Reads both metadata files and keeps the higher-`version` valid copy;
    /// if neither parses, starts from a pristine `Metadata::default()`.
    pub fn open(layout: &StorageLayout) -> StorageResult<Self> {
        let paths = [layout.metadata_path(0), layout.metadata_path(1)];
        let a = read_one(&paths[0]);
        let b = read_one(&paths[1]);
        let (current, next_slot) = match (a, b) {
            (Some(a), Some(b)) if a.version >= b.version => (a, 1),
            (Some(_a), Some(b)) => (b, 0),
            (Some(a), None) => (a, 1),
            (None, Some(b)) => (b, 0),
            (None, None) => (Metadata::default(), 0),
        };
        Ok(Self {
            layout_paths: paths,
            current,
            next_slot,
        })
    }

    pub fn get(&self) -> &Metadata {
        &self.current
    }

    /// Writes a new version of the metadata to the other file and fsyncs
    /// it, so that the previous (still intact) file remains the recovery
    /// fallback until this write lands.
    pub fn store(&mut self, mut metadata: Metadata) -> StorageResult<()> {
        metadata.version = self.current.version + 1;
        let bytes = frame(&metadata)?;
        let path = &self.layout_paths[self.next_slot as usize];
        filesystem::write_whole_file(path, &bytes)?;
        self.current = metadata;
        self.next_slot = 1 - self.next_slot;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_and_alternates_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::init(dir.path(), 1).unwrap();
        let mut file = MetadataFile::open(&layout).unwrap();
        assert_eq!(file.get().current_term, 0);

        file.store(Metadata {
            version: 0,
            current_term: 5,
            voted_for: Some(2),
            log_start_index: 1,
        })
        .unwrap();
        assert_eq!(file.get().current_term, 5);
        assert_eq!(file.get().version, 1);

        file.store(Metadata {
            current_term: 6,
            ..file.get().clone()
        })
        .unwrap();
        assert_eq!(file.get().version, 2);

        let reopened = MetadataFile::open(&layout).unwrap();
        assert_eq!(reopened.get().current_term, 6);
    }

    #[test]
    fn corrupt_file_falls_back_to_other_copy() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::init(dir.path(), 1).unwrap();
        let mut file = MetadataFile::open(&layout).unwrap();
        file.store(Metadata {
            current_term: 1,
            ..Metadata::default()
        })
        .unwrap();
        file.store(Metadata {
            current_term: 2,
            ..file.get().clone()
        })
        .unwrap();
        // Corrupt the most recently written file (now at slot `next_slot`'s
        // complement).
        let written_slot = 1 - file_slot(&file);
        std::fs::write(&file.layout_paths[written_slot as usize], b"garbage").unwrap();

        let reopened = MetadataFile::open(&layout).unwrap();
        assert_eq!(reopened.get().current_term, 1);
    }

    fn file_slot(file: &MetadataFile) -> u8 {
        file.next_slot
    }
}
