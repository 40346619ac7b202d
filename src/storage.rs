//! The `RaftStorage` trait `RaftCore` drives, and `DiskStorage`: the
//! concrete implementation composing the segmented log, the snapshot file,
//! the state machine, and the membership manager.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::clock::ClusterClock;
use crate::config::Config;
use crate::error::RaftResult;
use crate::error::StorageError;
use crate::error::StorageResult;
use crate::filesystem;
use crate::layout::StorageLayout;
use crate::log::Log;
use crate::log::MemoryLog;
use crate::log::SegmentedLog;
use crate::membership::Configuration;
use crate::membership::ConfigurationManager;
use crate::metadata::Metadata;
use crate::metadata::MetadataFile;
use crate::network::AppData;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::snapshot;
use crate::snapshot::SnapshotHeader;
use crate::state_machine::Command;
use crate::state_machine::CommandResponse;
use crate::state_machine::StateMachine;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::SnapshotId;

impl AppDataResponse for CommandResponse {}

/// The only `InstallSnapshot` wire version this crate understands. There is
/// no version-1 fallback: an `InstallSnapshotRequest` carrying any other
/// value is rejected outright rather than falling back to legacy behavior.
pub const SUPPORTED_SNAPSHOT_VERSION: u8 = 2;

/// The persisted hard state (§3): current term and the vote cast in it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// The state a freshly spawned `RaftCore` reads on startup.
#[derive(Clone, Debug)]
pub struct InitialState {
    pub last_log_id: LogId,
    pub last_applied_log: LogId,
    pub hard_state: HardState,
    pub membership: Configuration,
    pub log_start_index: u64,
}

impl InitialState {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            last_log_id: LogId::default(),
            last_applied_log: LogId::default(),
            hard_state: HardState::default(),
            membership: Configuration::new_initial(id),
            log_start_index: 1,
        }
    }
}

/// Metadata describing a completed snapshot, exchanged with the leader's
/// `InstallSnapshot` sender.
#[derive(Clone, Debug)]
pub struct SnapshotMeta {
    pub last_log_id: LogId,
    pub last_cluster_time: u64,
    pub membership: Configuration,
    pub snapshot_id: SnapshotId,
}

/// Storage interface `RaftCore` drives; implemented by [`DiskStorage`].
#[async_trait]
pub trait RaftStorage<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    async fn get_membership_config(&self) -> RaftResult<Configuration>;

    async fn get_initial_state(&self) -> RaftResult<InitialState>;

    async fn save_hard_state(&self, hs: &HardState) -> RaftResult<()>;

    async fn get_log_entries(&self, start: u64, stop: u64) -> RaftResult<Vec<Entry<D>>>;

    async fn try_get_log_entry(&self, index: u64) -> RaftResult<Option<Entry<D>>>;

    async fn get_last_log_id(&self) -> RaftResult<LogId>;

    async fn get_log_start_index(&self) -> RaftResult<u64>;

    async fn delete_logs_from(&self, last_kept_index: u64) -> RaftResult<()>;

    async fn append_to_log(&self, entries: Vec<Entry<D>>) -> RaftResult<()>;

    /// Applies committed entries in order, returning one response per
    /// entry (§4.10: sessions, `AdvanceVersion`, and plain `Tree` writes all
    /// flow through here).
    async fn apply_to_state_machine(&self, entries: &[Entry<D>]) -> RaftResult<Vec<R>>;

    async fn get_last_applied(&self) -> RaftResult<u64>;

    /// Runs a query against the current state machine (linearizable reads
    /// are gated by the caller confirming leadership first).
    async fn query_state_machine(&self, op: &crate::tree::TreeOp) -> RaftResult<crate::tree::TreeResult>;

    /// Begins a new snapshot covering the log through `through_index`,
    /// writes the state machine's current contents into it, and installs
    /// it as the current snapshot. Returns the metadata clients of this
    /// method use to truncate the log prefix.
    async fn do_log_compaction(&self, through_index: u64) -> RaftResult<SnapshotMeta>;

    /// Applies one chunk of an incoming `InstallSnapshot` stream. On
    /// `done`, finalizes the snapshot, restores the state machine from it,
    /// and truncates the log prefix. `version` is the sender's wire format
    /// version; anything other than [`SUPPORTED_SNAPSHOT_VERSION`] is
    /// rejected (no legacy fallback).
    #[allow(clippy::too_many_arguments)]
    async fn install_snapshot_chunk(
        &self,
        last_snapshot_index: u64,
        last_snapshot_term: u64,
        byte_offset: u64,
        data: &[u8],
        done: bool,
        version: u8,
    ) -> RaftResult<u64>;

    async fn get_current_snapshot(&self) -> RaftResult<Option<SnapshotMeta>>;
}

struct InstallState {
    writer: snapshot::Writer,
    last_snapshot_index: u64,
    last_snapshot_term: u64,
}

/// The production storage engine: a durable log (segmented or in-memory),
/// an alternating metadata file, an atomic snapshot file, and the
/// session-aware state machine, all guarded by `StorageLayout`'s flock.
pub struct DiskStorage<L: Log<Command>> {
    layout: Arc<StorageLayout>,
    config: Arc<Config>,
    log: Mutex<L>,
    metadata: Mutex<MetadataFile>,
    configuration: Mutex<ConfigurationManager>,
    state_machine: Arc<StateMachine>,
    clock: Mutex<ClusterClock>,
    install_in_progress: Mutex<Option<InstallState>>,
    next_snapshot_id: AtomicU64,
}

impl DiskStorage<SegmentedLog<Command>> {
    /// Opens (or initializes) the on-disk storage engine rooted at
    /// `config.storage_path`, replaying segments and the snapshot left by a
    /// previous run.
    pub fn open(config: Arc<Config>) -> StorageResult<Arc<Self>> {
        let layout = Arc::new(StorageLayout::init(&config.storage_path, config.server_id)?);
        let log = SegmentedLog::open(layout.clone(), config.clone())?;
        Self::from_parts(layout, config, log)
    }
}

impl DiskStorage<MemoryLog<Command>> {
    /// A non-durable instance for tests, still backed by a real
    /// `StorageLayout` (so locking/snapshot-path behavior matches
    /// production) but with an in-memory log.
    pub fn open_in_memory(config: Arc<Config>) -> StorageResult<Arc<Self>> {
        let layout = Arc::new(StorageLayout::init(&config.storage_path, config.server_id)?);
        Self::from_parts(layout, config, MemoryLog::new())
    }
}

impl<L: Log<Command>> DiskStorage<L> {
    fn from_parts(layout: Arc<StorageLayout>, config: Arc<Config>, log: L) -> StorageResult<Arc<Self>> {
        let metadata = MetadataFile::open(&layout)?;
        let mut configuration = ConfigurationManager::new();

        let mut clock = ClusterClock::new();
        let mut last_applied = 0u64;
        let mut restored_sm = None;

        if let Some(reader) = snapshot::Reader::open(&layout)? {
            configuration.set_snapshot(reader.header.last_included.index, reader.header.configuration.clone());
            clock.new_epoch(reader.header.last_cluster_time);
            restored_sm = Some(reader.state_machine()?);
            last_applied = reader.header.last_included.index;
        }

        let state_machine = StateMachine::new(config.session_timeout.as_nanos() as u64);

        let storage = Arc::new(Self {
            layout,
            config,
            log: Mutex::new(log),
            metadata: Mutex::new(metadata),
            configuration: Mutex::new(configuration),
            state_machine,
            clock: Mutex::new(clock),
            install_in_progress: Mutex::new(None),
            next_snapshot_id: AtomicU64::new(1),
        });

        if let Some(sm_snapshot) = restored_sm {
            let sm = storage.state_machine.clone();
            // Only used during construction; no concurrent access yet.
            futures::executor::block_on(sm.restore(sm_snapshot));
        }
        let _ = last_applied;
        Ok(storage)
    }

    fn snapshot_id(&self) -> SnapshotId {
        self.next_snapshot_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Ordinary I/O/(de)serialization failures become a recoverable
/// `RaftError::RaftStorage`; only `StorageError::Fatal` carries through as
/// `RaftError::Fatal`, so a caller checking `is_fatal()` sees corruption and
/// broken invariants but not a transient write failure.
fn to_storage_err(e: StorageError) -> crate::error::RaftError {
    if e.is_fatal() {
        crate::error::RaftError::Fatal(e)
    } else {
        crate::error::RaftError::RaftStorage(e.to_string())
    }
}

#[async_trait]
impl<L: Log<Command>> RaftStorage<Command, CommandResponse> for DiskStorage<L> {
    async fn get_membership_config(&self) -> RaftResult<Configuration> {
        let last_index = self.log.lock().await.last_log_id().index;
        Ok(self.configuration.lock().await.active(last_index))
    }

    async fn get_initial_state(&self) -> RaftResult<InitialState> {
        let log = self.log.lock().await;
        let metadata = self.metadata.lock().await;
        let md = metadata.get().clone();
        let membership = self.configuration.lock().await.active(log.last_log_id().index);
        Ok(InitialState {
            last_log_id: log.last_log_id(),
            last_applied_log: LogId::new(log.last_log_id().term, self.state_machine.last_applied().await),
            hard_state: HardState {
                current_term: md.current_term,
                voted_for: md.voted_for,
            },
            membership,
            log_start_index: log.log_start_index(),
        })
    }

    async fn save_hard_state(&self, hs: &HardState) -> RaftResult<()> {
        let mut metadata = self.metadata.lock().await;
        let prior = metadata.get().clone();
        metadata
            .store(Metadata {
                version: prior.version,
                current_term: hs.current_term,
                voted_for: hs.voted_for,
                log_start_index: prior.log_start_index,
            })
            .map_err(to_storage_err)
    }

    async fn get_log_entries(&self, start: u64, stop: u64) -> RaftResult<Vec<Entry<Command>>> {
        self.log.lock().await.entries(start, stop).await.map_err(to_storage_err)
    }

    async fn try_get_log_entry(&self, index: u64) -> RaftResult<Option<Entry<Command>>> {
        self.log.lock().await.entry(index).await.map_err(to_storage_err)
    }

    async fn get_last_log_id(&self) -> RaftResult<LogId> {
        Ok(self.log.lock().await.last_log_id())
    }

    async fn get_log_start_index(&self) -> RaftResult<u64> {
        Ok(self.log.lock().await.log_start_index())
    }

    async fn delete_logs_from(&self, last_kept_index: u64) -> RaftResult<()> {
        let mut log = self.log.lock().await;
        log.truncate_suffix(last_kept_index).await.map_err(to_storage_err)?;
        self.configuration.lock().await.retain_range(log.log_start_index(), last_kept_index);
        Ok(())
    }

    async fn append_to_log(&self, entries: Vec<Entry<Command>>) -> RaftResult<()> {
        let mut clock = self.clock.lock().await;
        let mut configuration = self.configuration.lock().await;
        for entry in &entries {
            clock.new_epoch(entry.cluster_time);
            if let EntryPayload::ConfigChange(cfg) = &entry.payload {
                configuration.add(entry.log_id.index, cfg.clone());
            }
        }
        drop(configuration);
        drop(clock);
        self.log.lock().await.append(entries).await.map_err(to_storage_err)
    }

    async fn apply_to_state_machine(&self, entries: &[Entry<Command>]) -> RaftResult<Vec<CommandResponse>> {
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let command = match &entry.payload {
                EntryPayload::Normal(cmd) => Some(cmd),
                EntryPayload::Blank | EntryPayload::ConfigChange(_) => None,
            };
            out.push(self.state_machine.apply(entry.log_id.index, entry.cluster_time, command).await.map_err(to_storage_err)?);
        }
        Ok(out)
    }

    async fn get_last_applied(&self) -> RaftResult<u64> {
        Ok(self.state_machine.last_applied().await)
    }

    async fn query_state_machine(&self, op: &crate::tree::TreeOp) -> RaftResult<crate::tree::TreeResult> {
        Ok(self.state_machine.query(op).await)
    }

    async fn do_log_compaction(&self, through_index: u64) -> RaftResult<SnapshotMeta> {
        let log = self.log.lock().await;
        let entry_at_index = log.entry(through_index).await.map_err(to_storage_err)?;
        let last_included_term = entry_at_index.map(|e| e.log_id.term).unwrap_or(log.last_log_id().term);
        drop(log);

        let configuration = self.configuration.lock().await.latest_as_of(through_index);
        let last_cluster_time = self.clock.lock().await.current();

        let header = SnapshotHeader {
            last_included: LogId::new(last_included_term, through_index),
            last_cluster_time,
            configuration: configuration.clone(),
        };
        let sm_snapshot = self.state_machine.snapshot_clone().await;
        let mut writer = snapshot::Writer::begin(&self.layout, header).map_err(to_storage_err)?;
        writer.write_state_machine(&sm_snapshot).map_err(to_storage_err)?;
        writer.finish().map_err(to_storage_err)?;

        self.configuration.lock().await.set_snapshot(through_index, configuration.clone());
        self.log.lock().await.truncate_prefix(through_index + 1).await.map_err(to_storage_err)?;

        Ok(SnapshotMeta {
            last_log_id: LogId::new(last_included_term, through_index),
            last_cluster_time,
            membership: configuration,
            snapshot_id: self.snapshot_id(),
        })
    }

    async fn install_snapshot_chunk(
        &self,
        last_snapshot_index: u64,
        last_snapshot_term: u64,
        byte_offset: u64,
        data: &[u8],
        done: bool,
        version: u8,
    ) -> RaftResult<u64> {
        if version != SUPPORTED_SNAPSHOT_VERSION {
            return Err(crate::error::RaftError::UnsupportedSnapshotVersion {
                supported: SUPPORTED_SNAPSHOT_VERSION,
                got: version,
            });
        }

        let mut in_progress = self.install_in_progress.lock().await;

        if byte_offset == 0 {
            let header = SnapshotHeader {
                last_included: LogId::new(last_snapshot_term, last_snapshot_index),
                last_cluster_time: self.clock.lock().await.current(),
                configuration: self.configuration.lock().await.active(last_snapshot_index),
            };
            let writer = snapshot::Writer::begin(&self.layout, header).map_err(to_storage_err)?;
            *in_progress = Some(InstallState {
                writer,
                last_snapshot_index,
                last_snapshot_term,
            });
        }

        let state = in_progress
            .as_mut()
            .ok_or_else(|| to_storage_err(StorageError::fatal("install_snapshot_chunk: no writer in progress")))?;
        if state.last_snapshot_index != last_snapshot_index {
            return Err(crate::error::RaftError::SnapshotMismatch {
                expect: crate::error::SnapshotSegmentId {
                    id: state.last_snapshot_index,
                    offset: state.writer.bytes_written(),
                },
                got: crate::error::SnapshotSegmentId {
                    id: last_snapshot_index,
                    offset: byte_offset,
                },
            });
        }

        let bytes_stored = if data.is_empty() {
            state.writer.bytes_written()
        } else {
            if byte_offset != state.writer.bytes_written() {
                return Err(crate::error::RaftError::SnapshotMismatch {
                    expect: crate::error::SnapshotSegmentId {
                        id: state.last_snapshot_index,
                        offset: state.writer.bytes_written(),
                    },
                    got: crate::error::SnapshotSegmentId {
                        id: last_snapshot_index,
                        offset: byte_offset,
                    },
                });
            }
            state.writer.append_chunk(byte_offset, data).map_err(to_storage_err)?
        };

        if !done {
            return Ok(bytes_stored);
        }

        let InstallState {
            writer,
            last_snapshot_index,
            last_snapshot_term,
        } = in_progress.take().unwrap();
        writer.finish().map_err(to_storage_err)?;

        let reader = snapshot::Reader::open(&self.layout)
            .map_err(to_storage_err)?
            .ok_or_else(|| to_storage_err(StorageError::fatal("snapshot missing immediately after finish()")))?;
        let sm_snapshot = reader.state_machine().map_err(to_storage_err)?;
        self.state_machine.restore(sm_snapshot).await;

        self.configuration
            .lock()
            .await
            .set_snapshot(last_snapshot_index, reader.header.configuration.clone());
        self.clock.lock().await.new_epoch(reader.header.last_cluster_time);
        self.log
            .lock()
            .await
            .truncate_prefix(last_snapshot_index + 1)
            .await
            .map_err(to_storage_err)?;
        let _ = last_snapshot_term;

        Ok(bytes_stored)
    }

    async fn get_current_snapshot(&self) -> RaftResult<Option<SnapshotMeta>> {
        let reader = match snapshot::Reader::open(&self.layout).map_err(to_storage_err)? {
            Some(r) => r,
            None => return Ok(None),
        };
        Ok(Some(SnapshotMeta {
            last_log_id: reader.header.last_included,
            last_cluster_time: reader.header.last_cluster_time,
            membership: reader.header.configuration.clone(),
            snapshot_id: self.snapshot_id(),
        }))
    }
}
