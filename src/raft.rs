//! The public `Raft` handle and the wire types it exchanges with peers.
//!
//! `RaftCore` (in `core/`) owns all mutable state and runs as its own tokio
//! task; `Raft` is a cheaply `Clone`able handle that forwards calls to it
//! over an internal `mpsc` channel and awaits a `oneshot` reply.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::ClusterTime;
use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ChangeConfigError;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::membership::Configuration;
use crate::metrics::RaftMetrics;
use crate::network::AppData;
use crate::network::RaftNetwork;
use crate::storage::RaftStorage;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

/// Minimum/maximum state-machine version a server will accept, advertised on
/// every `AppendEntries` response (§4.9.5, §4.9.9 `stateMachineUpdaterTask`).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct ServerCapabilities {
    pub min_supported_version: u16,
    pub max_supported_version: u16,
}

impl Default for ServerCapabilities {
    fn default() -> Self {
        Self {
            min_supported_version: 1,
            max_supported_version: crate::state_machine::MAX_SUPPORTED_VERSION,
        }
    }
}

/// One log entry: its identity, the cluster time it was stamped with, and
/// its payload (§3 `LogEntry`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,
    pub cluster_time: ClusterTime,
    pub payload: EntryPayload<D>,
}

impl<D: AppData> Entry<D> {
    pub fn new_noop(log_id: LogId, cluster_time: ClusterTime) -> Self {
        Self {
            log_id,
            cluster_time,
            payload: EntryPayload::Blank,
        }
    }

    pub fn new_config(log_id: LogId, cluster_time: ClusterTime, membership: Configuration) -> Self {
        Self {
            log_id,
            cluster_time,
            payload: EntryPayload::ConfigChange(membership),
        }
    }
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        match &self.payload {
            EntryPayload::Blank => format!("noop@{}", self.log_id),
            EntryPayload::Normal(_) => format!("data@{}", self.log_id),
            EntryPayload::ConfigChange(c) => format!("config({:?})@{}", c.state, self.log_id),
        }
    }
}

/// The three entry kinds from §3: `NOOP`, `DATA`, `CONFIGURATION`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    Blank,
    Normal(D),
    ConfigChange(Configuration),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<Entry<D>>,
    pub commit_index: u64,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={} leader={} prev=({}@{}) n_entries={} commit_index={}",
            self.term,
            self.leader_id,
            self.prev_log_index,
            self.prev_log_term,
            self.entries.len(),
            self.commit_index
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub last_log_index: u64,
    pub server_capabilities: ServerCapabilities,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

impl VoteRequest {
    pub fn new(term: u64, candidate_id: NodeId, last_log_index: u64, last_log_term: u64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
    /// Whether the candidate's log was at least as up to date as ours,
    /// independent of whether a vote was actually cast (§4.9.4).
    pub log_ok: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub last_snapshot_index: u64,
    pub last_snapshot_term: u64,
    pub byte_offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
    pub version: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub bytes_stored: u64,
}

/// A client's submitted command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientWriteRequest<D: AppData> {
    pub payload: D,
}

impl<D: AppData> ClientWriteRequest<D> {
    pub fn new(payload: D) -> Self {
        Self { payload }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse<R: AppDataResponse> {
    pub log_id: LogId,
    pub data: R,
}

/// Linearizable read: the caller only needs a quorum-confirmed leadership
/// check (§4.10, `client_read`); the query itself runs against the local
/// state machine once `last_applied` reaches `read_index`.
#[derive(Clone, Debug)]
pub struct ClientReadRequest {
    pub query: crate::tree::TreeOp,
}

/// Internal API messages sent from the `Raft` handle to `RaftCore`'s main
/// loop, each carrying its own `oneshot` reply channel.
pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: oneshot::Sender<RaftResult<AppendEntriesResponse>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<RaftResult<VoteResponse>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<RaftResult<InstallSnapshotResponse>>,
    },
    ClientWriteRequest {
        rpc: ClientWriteRequest<D>,
        tx: oneshot::Sender<Result<ClientWriteResponse<R>, ClientWriteError>>,
    },
    ClientReadRequest {
        rpc: ClientReadRequest,
        tx: oneshot::Sender<Result<crate::tree::TreeResult, ClientReadError>>,
    },
    Initialize {
        members: BTreeSet<NodeId>,
        tx: oneshot::Sender<Result<(), InitializeError>>,
    },
    AddNonVoter {
        id: NodeId,
        tx: oneshot::Sender<Result<(), ChangeConfigError>>,
    },
    ChangeMembership {
        members: BTreeSet<NodeId>,
        tx: oneshot::Sender<Result<(), ChangeConfigError>>,
    },
}

struct RaftInner<D: AppData, R: AppDataResponse> {
    tx_api: mpsc::UnboundedSender<RaftMsg<D, R>>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: std::sync::Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

/// A cheaply-`Clone`able handle to a running Raft node. Every method sends a
/// message to the node's private task and awaits the reply; the node itself
/// never exposes its state behind a shared lock.
pub struct Raft<D, R, N, S>
where
    D: AppData,
    R: AppDataResponse,
    N: RaftNetwork<D>,
    S: RaftStorage<D, R>,
{
    inner: Arc<RaftInner<D, R>>,
    _marker: std::marker::PhantomData<(N, S)>,
}

impl<D, R, N, S> Clone for Raft<D, R, N, S>
where
    D: AppData,
    R: AppDataResponse,
    N: RaftNetwork<D>,
    S: RaftStorage<D, R>,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: std::marker::PhantomData,
        }
    }
}

/// `RaftCore` is written against the concrete `Command`/`CommandResponse`
/// application type (it drives the tree state machine directly), so the
/// constructor that spawns it is only available at that instantiation even
/// though `Raft` itself stays generic, matching how `DiskStorage` only ever
/// implements `RaftStorage<Command, CommandResponse>` despite the
/// `RaftStorage<D, R>` trait being fully generic.
impl<N, S> Raft<crate::state_machine::Command, crate::state_machine::CommandResponse, N, S>
where
    N: RaftNetwork<crate::state_machine::Command>,
    S: RaftStorage<crate::state_machine::Command, crate::state_machine::CommandResponse>,
{
    /// Spawns the node's `RaftCore` task and returns a handle to it.
    pub fn new(id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));

        let raft_handle = RaftCore::spawn(id, config, network, storage, rx_api, tx_metrics, rx_shutdown);

        let inner = Arc::new(RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: std::sync::Mutex::new(Some(raft_handle)),
            tx_shutdown: std::sync::Mutex::new(Some(tx_shutdown)),
        });

        Self {
            inner,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<D, R, N, S> Raft<D, R, N, S>
where
    D: AppData,
    R: AppDataResponse,
    N: RaftNetwork<D>,
    S: RaftStorage<D, R>,
{
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> RaftResult<AppendEntriesResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::AppendEntries { rpc, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    pub async fn vote(&self, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::RequestVote { rpc, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::InstallSnapshot { rpc, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.inner.rx_metrics.borrow().current_leader
    }

    pub async fn client_write(&self, rpc: ClientWriteRequest<D>) -> Result<ClientWriteResponse<R>, ClientWriteError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::ClientWriteRequest { rpc, tx })
            .map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))?
    }

    pub async fn client_read(&self, rpc: ClientReadRequest) -> Result<crate::tree::TreeResult, ClientReadError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::ClientReadRequest { rpc, tx })
            .map_err(|_| ClientReadError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| ClientReadError::RaftError(RaftError::ShuttingDown))?
    }

    pub async fn initialize(&self, members: BTreeSet<NodeId>) -> Result<(), InitializeError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::Initialize { members, tx })
            .map_err(|_| InitializeError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| InitializeError::RaftError(RaftError::ShuttingDown))?
    }

    pub async fn add_non_voter(&self, id: NodeId) -> Result<(), ChangeConfigError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::AddNonVoter { id, tx })
            .map_err(|_| ChangeConfigError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| ChangeConfigError::RaftError(RaftError::ShuttingDown))?
    }

    pub async fn change_membership(&self, members: BTreeSet<NodeId>) -> Result<(), ChangeConfigError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::ChangeMembership { members, tx })
            .map_err(|_| ChangeConfigError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| ChangeConfigError::RaftError(RaftError::ShuttingDown))?
    }

    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Signals shutdown and waits for the node's task to exit.
    pub async fn shutdown(&self) -> RaftResult<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        let handle = self.inner.raft_handle.lock().unwrap().take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| RaftError::ChannelClosed(format!("RaftCore task panicked: {e}")))?,
            None => Ok(()),
        }
    }
}
