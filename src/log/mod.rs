//! The replicated log: an ordered, durable sequence of entries with a
//! movable start index (advanced by compaction) and a movable end (appended
//! to by the leader, truncated by conflicting `AppendEntries`).

pub mod memory;
pub mod segmented;

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::network::AppData;
use crate::raft::Entry;
use crate::LogId;

pub use memory::MemoryLog;
pub use segmented::SegmentedLog;

/// Storage for the replicated log, implemented by [`MemoryLog`] (tests) and
/// [`SegmentedLog`] (production). All index arguments are log indices, not
/// array offsets; index 0 never names a real entry.
#[async_trait]
pub trait Log<D: AppData>: Send + Sync + 'static {
    /// Appends `entries` in order. Callers guarantee `entries` are
    /// contiguous and start at `last_log_id().index + 1`.
    async fn append(&mut self, entries: Vec<Entry<D>>) -> StorageResult<()>;

    /// Entries in `[start, stop)`.
    async fn entries(&self, start: u64, stop: u64) -> StorageResult<Vec<Entry<D>>>;

    async fn entry(&self, index: u64) -> StorageResult<Option<Entry<D>>>;

    fn last_log_id(&self) -> LogId;

    /// The smallest index still retained; entries below this have been
    /// compacted into a snapshot.
    fn log_start_index(&self) -> u64;

    /// Discards all entries with index > `last_kept_index` (§4.9.5 step 4:
    /// `truncate_suffix(i-1)` before appending a conflicting entry).
    async fn truncate_suffix(&mut self, last_kept_index: u64) -> StorageResult<()>;

    /// Discards all entries with index < `new_start_index`, advancing
    /// `log_start_index` (§4.9.8 `snapshot_done`).
    async fn truncate_prefix(&mut self, new_start_index: u64) -> StorageResult<()>;
}
