//! A durable, segmented implementation of [`Log`].
//!
//! Grounded on `original_source/Storage/SegmentedLog.cc`: entries are
//! appended to an "open" segment file until it reaches
//! `Config::storage_segment_bytes`, at which point it is closed (renamed to
//! a name encoding its `[start_index, end_index]` range) and a fresh open
//! segment is started. Each entry is framed as `length(u32) || crc32(u32) ||
//! json(Entry)`, the same framing `metadata.rs` uses, so a partially
//! written trailing entry (the result of a crash mid-append) is detected
//! and dropped on recovery rather than corrupting the segment.
//!
//! Every segment file opens with a single [`SEGMENT_FORMAT_VERSION`] byte,
//! mirroring `snapshot.rs`'s `FORMAT_VERSION` check. A closed segment with a
//! missing or wrong header byte is corruption: recovery treats it as fatal.
//! An open segment (the one still being written to) can pick up a bad header
//! from a crash between file creation and the header write landing, so that
//! case is just logged and the file is discarded, starting a fresh segment.
//!
//! The on-disk segments are the durability boundary; an in-memory index
//! mirrors their contents so reads don't have to re-parse segment files,
//! the way a production log wraps a write-ahead file with a cache.

use std::collections::BTreeMap;
use std::fs::File;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::StorageError;
use crate::error::StorageResult;
use crate::filesystem;
use crate::layout::StorageLayout;
use crate::network::AppData;
use crate::raft::Entry;
use crate::LogId;

use super::Log;

const SEGMENT_FORMAT_VERSION: u8 = 1;

struct ClosedSegment {
    start_index: u64,
    end_index: u64,
    path: std::path::PathBuf,
}

struct OpenSegment {
    file: File,
    path: std::path::PathBuf,
    start_index: u64,
    bytes_written: u64,
}

fn frame_entry<D: AppData>(entry: &Entry<D>) -> StorageResult<Vec<u8>> {
    let body = serde_json::to_vec(entry).map_err(|e| StorageError::Serde(e.to_string()))?;
    let crc = crc32fast::hash(&body);
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Reads every well-framed entry from `path`, stopping (without error) at
/// the first truncated or checksum-mismatched frame. `is_closed` selects how
/// a missing/invalid header byte is handled: fatal for a closed segment,
/// warn-and-discard for the still-open one.
fn recover_segment<D: AppData>(path: &std::path::Path, is_closed: bool) -> StorageResult<Vec<Entry<D>>> {
    let bytes = filesystem::read_whole_file(path)?;
    match bytes.first().copied() {
        Some(SEGMENT_FORMAT_VERSION) => {}
        Some(other) if is_closed => {
            return Err(StorageError::fatal(format!(
                "segment {path:?} has invalid header byte {other} (expected {SEGMENT_FORMAT_VERSION})"
            )));
        }
        None if is_closed => {
            return Err(StorageError::fatal(format!("segment {path:?} is empty, expected a header byte")));
        }
        header => {
            tracing::warn!(?path, ?header, "open segment has missing/invalid header, discarding");
            let _ = filesystem::unlink(path);
            return Ok(Vec::new());
        }
    }
    let mut out = Vec::new();
    let mut pos = 1usize;
    while pos + 8 <= bytes.len() {
        let len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().unwrap());
        let Some(body) = bytes.get(pos + 8..pos + 8 + len) else {
            break;
        };
        if crc32fast::hash(body) != crc {
            tracing::warn!(?path, at = pos, "segment entry failed checksum, truncating recovery here");
            break;
        }
        let entry: Entry<D> = serde_json::from_slice(body).map_err(|e| StorageError::Serde(e.to_string()))?;
        out.push(entry);
        pos += 8 + len;
    }
    Ok(out)
}

/// Parses `NNNN.segment` / `NNNN-MMMM.segment` file names left by previous
/// runs: the open segment carries only its start index, closed segments
/// carry `start-end`.
fn parse_segment_name(name: &str) -> Option<(u64, Option<u64>)> {
    let stem = name.strip_suffix(".segment")?;
    if let Some((start, end)) = stem.split_once('-') {
        Some((start.parse().ok()?, Some(end.parse().ok()?)))
    } else {
        Some((stem.parse().ok()?, None))
    }
}

pub struct SegmentedLog<D: AppData> {
    layout: Arc<StorageLayout>,
    config: Arc<Config>,
    closed: Vec<ClosedSegment>,
    open: OpenSegment,
    cache: BTreeMap<u64, Entry<D>>,
    start_index: u64,
    last_log_id: LogId,
}

impl<D: AppData> SegmentedLog<D> {
    /// Scans `layout.log_dir` for segment files left by a previous run,
    /// replays their entries into the in-memory cache, and opens (or
    /// starts) the current open segment.
    pub fn open(layout: Arc<StorageLayout>, config: Arc<Config>) -> StorageResult<Self> {
        let mut found: Vec<(u64, Option<u64>, std::path::PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&layout.log_dir).map_err(StorageError::Io)? {
            let entry = entry.map_err(StorageError::Io)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((start, end)) = parse_segment_name(name) {
                found.push((start, end, entry.path()));
            }
        }
        found.sort_by_key(|(start, _, _)| *start);

        let mut cache = BTreeMap::new();
        let mut closed = Vec::new();
        let mut open_candidate = None;
        for (start, end, path) in found {
            let entries: Vec<Entry<D>> = recover_segment(&path, end.is_some())?;
            for entry in &entries {
                cache.insert(entry.log_id.index, entry.clone());
            }
            match end {
                Some(end) => closed.push(ClosedSegment {
                    start_index: start,
                    end_index: end,
                    path,
                }),
                None => open_candidate = Some((start, path, entries.len() as u64)),
            }
        }

        let start_index = closed.first().map(|s| s.start_index).unwrap_or(1);
        let last_log_id = cache.values().next_back().map(|e| e.log_id).unwrap_or_default();

        let (open_path, open_start) = match &open_candidate {
            Some((start, path, _)) => (path.clone(), *start),
            None => (layout.segment_path(last_log_id.index + 1), last_log_id.index + 1),
        };
        let file = filesystem::open_read_write(&open_path)?;
        let file_len = file.metadata().map_err(StorageError::Io)?.len();
        let bytes_written = if file_len == 0 {
            filesystem::pwrite_at(&file, 0, &[SEGMENT_FORMAT_VERSION])?;
            filesystem::fdatasync(&file)?;
            0
        } else {
            file_len - 1
        };

        Ok(Self {
            layout,
            config,
            closed,
            open: OpenSegment {
                file,
                path: open_path,
                start_index: open_start,
                bytes_written,
            },
            cache,
            start_index,
            last_log_id,
        })
    }

    fn rollover(&mut self) -> StorageResult<()> {
        let closed_path = self
            .layout
            .log_dir
            .join(format!("{:020}-{:020}.segment", self.open.start_index, self.last_log_id.index));
        filesystem::fsync(&self.open.file)?;
        filesystem::rename(&self.open.path, &closed_path)?;
        self.closed.push(ClosedSegment {
            start_index: self.open.start_index,
            end_index: self.last_log_id.index,
            path: closed_path,
        });

        let new_start = self.last_log_id.index + 1;
        let new_path = self.layout.segment_path(new_start);
        let file = filesystem::open_read_write(&new_path)?;
        filesystem::fallocate(&file, self.config.storage_segment_bytes)?;
        filesystem::pwrite_at(&file, 0, &[SEGMENT_FORMAT_VERSION])?;
        filesystem::fdatasync(&file)?;
        self.open = OpenSegment {
            file,
            path: new_path,
            start_index: new_start,
            bytes_written: 0,
        };
        self.reclaim_retired_segments();
        Ok(())
    }

    /// Unlinks closed segments whose `end_index` falls outside the
    /// snapshot-ratio retention window (§4.9.8's open-question resolution).
    fn reclaim_retired_segments(&mut self) {
        let last_snapshot_index = self.start_index.saturating_sub(1);
        if last_snapshot_index == 0 {
            return;
        }
        let ratio_window = (self.config.snapshot_policy.snapshot_ratio * last_snapshot_index as f64) as u64;
        let window = self.config.snapshot_retention_entries.max(ratio_window).max(1);
        let floor = last_snapshot_index.saturating_sub(window);
        self.closed.retain(|seg| {
            let retire = seg.end_index < floor && seg.end_index < self.start_index;
            if retire {
                let _ = filesystem::unlink(&seg.path);
            }
            !retire
        });
    }
}

#[async_trait]
impl<D: AppData> Log<D> for SegmentedLog<D> {
    async fn append(&mut self, entries: Vec<Entry<D>>) -> StorageResult<()> {
        for entry in entries {
            if self.open.bytes_written >= self.config.storage_segment_bytes && self.open.bytes_written > 0 {
                self.rollover()?;
            }
            let framed = frame_entry(&entry)?;
            filesystem::pwrite_at(&self.open.file, 1 + self.open.bytes_written, &framed)?;
            filesystem::fdatasync(&self.open.file)?;
            self.open.bytes_written += framed.len() as u64;
            self.last_log_id = entry.log_id;
            self.cache.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn entries(&self, start: u64, stop: u64) -> StorageResult<Vec<Entry<D>>> {
        Ok(self.cache.range(start..stop).map(|(_, e)| e.clone()).collect())
    }

    async fn entry(&self, index: u64) -> StorageResult<Option<Entry<D>>> {
        Ok(self.cache.get(&index).cloned())
    }

    fn last_log_id(&self) -> LogId {
        self.last_log_id
    }

    fn log_start_index(&self) -> u64 {
        self.start_index
    }

    async fn truncate_suffix(&mut self, last_kept_index: u64) -> StorageResult<()> {
        self.cache.retain(|&index, _| index <= last_kept_index);

        // If the truncation point falls inside or before the open segment's
        // start, the open segment is rewritten from the surviving cache;
        // closed segments entirely past `last_kept_index` are unlinked.
        self.closed.retain(|seg| {
            let drop = seg.start_index > last_kept_index;
            if drop {
                let _ = filesystem::unlink(&seg.path);
            }
            !drop
        });

        let open_start = self.closed.last().map(|s| s.end_index + 1).unwrap_or(self.start_index);
        filesystem::unlink(&self.open.path)?;
        let new_path = self.layout.segment_path(open_start);
        let file = filesystem::open_read_write(&new_path)?;
        filesystem::pwrite_at(&file, 0, &[SEGMENT_FORMAT_VERSION])?;
        let mut bytes_written = 0u64;
        for (_, entry) in self.cache.range(open_start..) {
            let framed = frame_entry(entry)?;
            filesystem::pwrite_at(&file, 1 + bytes_written, &framed)?;
            bytes_written += framed.len() as u64;
        }
        filesystem::fdatasync(&file)?;
        self.open = OpenSegment {
            file,
            path: new_path,
            start_index: open_start,
            bytes_written,
        };
        self.last_log_id = self.cache.values().next_back().map(|e| e.log_id).unwrap_or(LogId {
            term: self.last_log_id.term,
            index: last_kept_index,
        });
        Ok(())
    }

    async fn truncate_prefix(&mut self, new_start_index: u64) -> StorageResult<()> {
        self.cache.retain(|&index, _| index >= new_start_index);
        self.start_index = new_start_index;
        self.reclaim_retired_segments();
        Ok(())
    }
}

impl<D: AppData> std::fmt::Debug for SegmentedLog<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedLog")
            .field("start_index", &self.start_index)
            .field("last_log_id", &self.last_log_id)
            .field("n_closed_segments", &self.closed.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::Command;

    fn test_config(segment_bytes: u64) -> Arc<Config> {
        Arc::new(
            Config::builder("test", 1)
                .storage_path(std::path::PathBuf::from("/tmp/unused"))
                .storage_segment_bytes(segment_bytes)
                .build()
                .unwrap(),
        )
    }

    fn entry(index: u64, term: u64) -> Entry<Command> {
        Entry::new_noop(LogId::new(term, index), index)
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(StorageLayout::init(dir.path(), 1).unwrap());
        let mut log = SegmentedLog::<Command>::open(layout, test_config(1 << 20)).unwrap();
        log.append(vec![entry(1, 1), entry(2, 1), entry(3, 2)]).await.unwrap();
        let got = log.entries(1, 4).await.unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(log.last_log_id(), LogId::new(2, 3));
    }

    #[tokio::test]
    async fn recovers_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(StorageLayout::init(dir.path(), 1).unwrap());
        {
            let mut log = SegmentedLog::<Command>::open(layout.clone(), test_config(1 << 20)).unwrap();
            log.append(vec![entry(1, 1), entry(2, 1)]).await.unwrap();
        }
        let reopened = SegmentedLog::<Command>::open(layout, test_config(1 << 20)).unwrap();
        assert_eq!(reopened.last_log_id(), LogId::new(1, 2));
        assert!(reopened.entry(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rolls_over_into_a_new_segment() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(StorageLayout::init(dir.path(), 1).unwrap());
        // Tiny segment size forces a rollover after the first entry.
        let mut log = SegmentedLog::<Command>::open(layout, test_config(8)).unwrap();
        log.append(vec![entry(1, 1)]).await.unwrap();
        log.append(vec![entry(2, 1)]).await.unwrap();
        assert_eq!(log.closed.len(), 1);
        assert_eq!(log.last_log_id(), LogId::new(1, 2));
    }

    #[tokio::test]
    async fn truncate_suffix_across_open_segment() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(StorageLayout::init(dir.path(), 1).unwrap());
        let mut log = SegmentedLog::<Command>::open(layout, test_config(8)).unwrap();
        log.append(vec![entry(1, 1)]).await.unwrap();
        log.append(vec![entry(2, 1)]).await.unwrap();
        log.append(vec![entry(3, 1)]).await.unwrap();
        // rolled over at least once; truncate back into the closed segment.
        log.truncate_suffix(1).await.unwrap();
        assert_eq!(log.last_log_id(), LogId::new(1, 1));
        log.append(vec![entry(2, 2)]).await.unwrap();
        assert_eq!(log.entry(3).await.unwrap(), None);
        assert_eq!(log.last_log_id(), LogId::new(2, 2));
    }

    #[tokio::test]
    async fn truncate_prefix_advances_start_and_reclaims_segments() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(StorageLayout::init(dir.path(), 1).unwrap());
        let mut log = SegmentedLog::<Command>::open(layout, test_config(8)).unwrap();
        for i in 1..=4u64 {
            log.append(vec![entry(i, 1)]).await.unwrap();
        }
        log.truncate_prefix(3).await.unwrap();
        assert_eq!(log.log_start_index(), 3);
        assert!(log.entry(1).await.unwrap().is_none());
        assert!(log.entry(3).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn closed_segment_with_bad_header_is_fatal_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(StorageLayout::init(dir.path(), 1).unwrap());
        {
            let mut log = SegmentedLog::<Command>::open(layout.clone(), test_config(8)).unwrap();
            log.append(vec![entry(1, 1)]).await.unwrap();
            log.append(vec![entry(2, 1)]).await.unwrap();
            assert_eq!(log.closed.len(), 1);
        }
        let closed_path = &layout.log_dir.join(format!("{:020}-{:020}.segment", 1, 1));
        let mut bytes = std::fs::read(closed_path).unwrap();
        bytes[0] = 9;
        std::fs::write(closed_path, bytes).unwrap();

        let err = SegmentedLog::<Command>::open(layout, test_config(8)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn open_segment_with_bad_header_is_discarded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(StorageLayout::init(dir.path(), 1).unwrap());
        let open_path;
        {
            let mut log = SegmentedLog::<Command>::open(layout.clone(), test_config(1 << 20)).unwrap();
            log.append(vec![entry(1, 1)]).await.unwrap();
            open_path = log.open.path.clone();
        }
        let mut bytes = std::fs::read(&open_path).unwrap();
        bytes[0] = 9;
        std::fs::write(&open_path, bytes).unwrap();

        let reopened = SegmentedLog::<Command>::open(layout, test_config(1 << 20)).unwrap();
        assert_eq!(reopened.last_log_id(), LogId::default());
        assert!(reopened.entry(1).await.unwrap().is_none());
    }
}
