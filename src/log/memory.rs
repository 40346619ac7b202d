//! An in-memory, non-durable [`Log`], used to back test fixtures that need a
//! `Log` implementation without touching disk.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::network::AppData;
use crate::raft::Entry;
use crate::LogId;

use super::Log;

#[derive(Default)]
pub struct MemoryLog<D: AppData> {
    /// `entries[0]` holds log index `start_index`.
    entries: VecDeque<Entry<D>>,
    start_index: u64,
    last_log_id: LogId,
}

impl<D: AppData> MemoryLog<D> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            start_index: 1,
            last_log_id: LogId::default(),
        }
    }

    fn offset(&self, index: u64) -> Option<usize> {
        if index < self.start_index || index > self.last_log_id.index {
            return None;
        }
        Some((index - self.start_index) as usize)
    }
}

#[async_trait]
impl<D: AppData> Log<D> for MemoryLog<D> {
    async fn append(&mut self, entries: Vec<Entry<D>>) -> StorageResult<()> {
        for entry in entries {
            self.last_log_id = entry.log_id;
            self.entries.push_back(entry);
        }
        Ok(())
    }

    async fn entries(&self, start: u64, stop: u64) -> StorageResult<Vec<Entry<D>>> {
        let mut out = Vec::new();
        for index in start..stop {
            if let Some(offset) = self.offset(index) {
                out.push(self.entries[offset].clone());
            }
        }
        Ok(out)
    }

    async fn entry(&self, index: u64) -> StorageResult<Option<Entry<D>>> {
        Ok(self.offset(index).map(|off| self.entries[off].clone()))
    }

    fn last_log_id(&self) -> LogId {
        self.last_log_id
    }

    fn log_start_index(&self) -> u64 {
        self.start_index
    }

    async fn truncate_suffix(&mut self, last_kept_index: u64) -> StorageResult<()> {
        if last_kept_index < self.start_index.saturating_sub(1) {
            self.entries.clear();
            self.last_log_id = LogId::default();
            return Ok(());
        }
        if let Some(offset) = self.offset(last_kept_index + 1) {
            self.entries.truncate(offset);
        }
        self.last_log_id = self.entries.back().map(|e| e.log_id).unwrap_or(LogId {
            term: self.last_log_id.term,
            index: last_kept_index,
        });
        Ok(())
    }

    async fn truncate_prefix(&mut self, new_start_index: u64) -> StorageResult<()> {
        while self.start_index < new_start_index {
            if self.entries.pop_front().is_some() {
                self.start_index += 1;
            } else {
                self.start_index = new_start_index;
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::Command;

    fn entry(index: u64, term: u64) -> Entry<Command> {
        Entry::new_noop(LogId::new(term, index), index)
    }

    #[tokio::test]
    async fn append_then_read_range() {
        let mut log = MemoryLog::<Command>::new();
        log.append(vec![entry(1, 1), entry(2, 1), entry(3, 2)]).await.unwrap();
        let got = log.entries(2, 4).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(log.last_log_id(), LogId::new(2, 3));
    }

    #[tokio::test]
    async fn truncate_suffix_drops_conflicting_tail() {
        let mut log = MemoryLog::<Command>::new();
        log.append(vec![entry(1, 1), entry(2, 1), entry(3, 1)]).await.unwrap();
        log.truncate_suffix(1).await.unwrap();
        assert_eq!(log.last_log_id().index, 1);
        log.append(vec![entry(2, 2)]).await.unwrap();
        assert_eq!(log.last_log_id(), LogId::new(2, 2));
    }

    #[tokio::test]
    async fn truncate_prefix_advances_start() {
        let mut log = MemoryLog::<Command>::new();
        log.append(vec![entry(1, 1), entry(2, 1), entry(3, 1)]).await.unwrap();
        log.truncate_prefix(3).await.unwrap();
        assert_eq!(log.log_start_index(), 3);
        assert!(log.entry(1).await.unwrap().is_none());
        assert!(log.entry(3).await.unwrap().is_some());
    }
}
