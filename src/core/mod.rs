//! `RaftCore`: the single task that owns all of a node's Raft state. An
//! `mpsc` command queue is drained by one task, metrics are published over a
//! `watch` channel, and replication to each peer is driven inline from the
//! same task against the concrete term/vote/log/commit state machine,
//! persistent metadata, and cluster clock this crate's storage layer needs.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

use crate::clock::ClusterClock;
use crate::config::Config;
use crate::error::ChangeConfigError;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::StorageError;
use crate::membership::Configuration;
use crate::metrics::LeaderMetrics;
use crate::metrics::RaftMetrics;
use crate::metrics::ReplicationMetrics;
use crate::network::RaftNetwork;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ClientWriteResponse;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::RaftMsg;
use crate::raft::ServerCapabilities;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::state_machine::Command;
use crate::state_machine::CommandResponse;
use crate::storage::HardState;
use crate::storage::RaftStorage;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Follower,
    Candidate,
    Leader,
}

/// Per-peer volatile state a leader tracks (§4.9.1).
struct PeerState {
    next_index: u64,
    match_index: u64,
}

/// `RaftCore` owns every piece of mutable node state and runs as a single
/// tokio task; it is never accessed through a shared lock.
pub struct RaftCore<N: RaftNetwork<Command>, S: RaftStorage<Command, CommandResponse>> {
    id: NodeId,
    config: Arc<Config>,
    network: Arc<N>,
    storage: Arc<S>,

    state: State,
    current_term: u64,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    /// A real steady-clock deadline (§4.9.2), not cluster time: it gates
    /// votes while a known leader's lease might still be live, and must keep
    /// advancing on every heartbeat even when no entries are appended.
    withhold_votes_until: Instant,

    commit_index: u64,
    last_applied: u64,
    last_log_id: LogId,
    log_start_index: u64,
    membership: Configuration,
    clock: ClusterClock,

    election_deadline: Instant,
    peers: BTreeMap<NodeId, PeerState>,

    rx_api: mpsc::UnboundedReceiver<RaftMsg<Command, CommandResponse>>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,

    /// The result of applying each recently-committed index, so a pending
    /// `client_write` can read back its own response once applied. Trimmed
    /// to what's still being waited on.
    applied_responses: BTreeMap<u64, CommandResponse>,
}

impl<N: RaftNetwork<Command>, S: RaftStorage<Command, CommandResponse>> RaftCore<N, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<RaftMsg<Command, CommandResponse>>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let span = tracing::info_span!("RaftCore", id);
        tokio::spawn(
            async move {
                let initial = storage.get_initial_state().await?;
                let initial_deadline = Instant::now() + config.election_timeout_jittered();
                let mut core = RaftCore {
                    id,
                    config,
                    network,
                    storage,
                    state: State::Follower,
                    current_term: initial.hard_state.current_term,
                    voted_for: initial.hard_state.voted_for,
                    leader_id: None,
                    withhold_votes_until: initial_deadline,
                    commit_index: 0,
                    last_applied: initial.last_applied_log.index,
                    last_log_id: initial.last_log_id,
                    log_start_index: initial.log_start_index,
                    membership: initial.membership,
                    clock: ClusterClock::new(),
                    election_deadline: initial_deadline,
                    peers: BTreeMap::new(),
                    rx_api,
                    tx_metrics,
                    rx_shutdown,
                    applied_responses: BTreeMap::new(),
                };
                core.main().await
            }
            .instrument(span),
        )
    }

    async fn main(&mut self) -> RaftResult<()> {
        self.reset_election_timer();
        loop {
            tokio::select! {
                _ = &mut self.rx_shutdown => {
                    tracing::info!("shutdown requested");
                    return Ok(());
                }
                msg = self.rx_api.recv() => {
                    match msg {
                        Some(msg) => self.handle_msg(msg).await?,
                        None => return Ok(()),
                    }
                }
                _ = sleep_until(self.election_deadline), if self.state != State::Leader => {
                    self.start_new_election().await?;
                }
            }
            self.publish_metrics();
        }
    }

    fn config_election_timeout(&self) -> Duration {
        self.config.election_timeout_jittered()
    }

    fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.config_election_timeout();
    }

    fn publish_metrics(&self) {
        let replication = self
            .peers
            .iter()
            .map(|(id, p)| (*id, ReplicationMetrics { match_index: p.match_index }))
            .collect();
        let metrics = RaftMetrics {
            id: self.id,
            state: match self.state {
                State::Follower => crate::metrics::State::Follower,
                State::Candidate => crate::metrics::State::Candidate,
                State::Leader => crate::metrics::State::Leader,
            },
            current_term: self.current_term,
            last_log_id: self.last_log_id,
            last_applied: self.last_applied,
            current_leader: self.leader_id,
            membership_config: self.membership.clone(),
            snapshot_last_log_id: LogId::default(),
            leader_metrics: if self.state == State::Leader {
                Some(LeaderMetrics { replication })
            } else {
                None
            },
        };
        let _ = self.tx_metrics.send(metrics);
    }

    /// Converts a detected-fatal condition into a fresh `RaftError::Fatal`
    /// carrying its message, so `main()`'s `?` always has a single error
    /// type to propagate regardless of which handler noticed the problem.
    fn shutdown_on(msg: impl std::fmt::Display) -> RaftError {
        RaftError::Fatal(StorageError::fatal(msg.to_string()))
    }

    /// Dispatches one API message, forwards the handler's result to its
    /// caller, and — if that result is a fatal storage condition — returns
    /// `Err` so `main()`'s loop exits and the task shuts down instead of
    /// continuing to serve requests against broken storage.
    async fn handle_msg(&mut self, msg: RaftMsg<Command, CommandResponse>) -> RaftResult<()> {
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                let res = self.handle_append_entries(rpc).await;
                let fatal = res.as_ref().err().filter(|e| e.is_fatal()).map(|e| e.to_string());
                let _ = tx.send(res);
                if let Some(msg) = fatal {
                    return Err(Self::shutdown_on(msg));
                }
            }
            RaftMsg::RequestVote { rpc, tx } => {
                let res = self.handle_vote_request(rpc).await;
                let fatal = res.as_ref().err().filter(|e| e.is_fatal()).map(|e| e.to_string());
                let _ = tx.send(res);
                if let Some(msg) = fatal {
                    return Err(Self::shutdown_on(msg));
                }
            }
            RaftMsg::InstallSnapshot { rpc, tx } => {
                let res = self.handle_install_snapshot(rpc).await;
                let fatal = res.as_ref().err().filter(|e| e.is_fatal()).map(|e| e.to_string());
                let _ = tx.send(res);
                if let Some(msg) = fatal {
                    return Err(Self::shutdown_on(msg));
                }
            }
            RaftMsg::ClientWriteRequest { rpc, tx } => {
                let res = self.handle_client_write(rpc.payload).await;
                let fatal = res.as_ref().err().filter(|e| e.is_fatal()).map(|e| e.to_string());
                let _ = tx.send(res);
                if let Some(msg) = fatal {
                    return Err(Self::shutdown_on(msg));
                }
            }
            RaftMsg::ClientReadRequest { rpc, tx } => {
                let res = self.handle_client_read(rpc.query).await;
                let fatal = res.as_ref().err().filter(|e| e.is_fatal()).map(|e| e.to_string());
                let _ = tx.send(res);
                if let Some(msg) = fatal {
                    return Err(Self::shutdown_on(msg));
                }
            }
            RaftMsg::Initialize { members, tx } => {
                let res = self.handle_initialize(members).await;
                let fatal = res.as_ref().err().filter(|e| e.is_fatal()).map(|e| e.to_string());
                let _ = tx.send(res);
                if let Some(msg) = fatal {
                    return Err(Self::shutdown_on(msg));
                }
            }
            RaftMsg::AddNonVoter { id, tx } => {
                let res = self.handle_add_non_voter(id).await;
                let fatal = res.as_ref().err().filter(|e| e.is_fatal()).map(|e| e.to_string());
                let _ = tx.send(res);
                if let Some(msg) = fatal {
                    return Err(Self::shutdown_on(msg));
                }
            }
            RaftMsg::ChangeMembership { members, tx } => {
                let res = self.handle_change_membership(members).await;
                let fatal = res.as_ref().err().filter(|e| e.is_fatal()).map(|e| e.to_string());
                let _ = tx.send(res);
                if let Some(msg) = fatal {
                    return Err(Self::shutdown_on(msg));
                }
            }
        }
        Ok(())
    }

    /// `stepDown(newTerm)` (§4.9.3): always resets to FOLLOWER and the vote
    /// record if `newTerm` is strictly newer.
    async fn step_down(&mut self, new_term: u64) -> RaftResult<()> {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = None;
            self.persist_hard_state().await?;
        }
        self.leader_id = None;
        self.state = State::Follower;
        self.peers.clear();
        Ok(())
    }

    async fn persist_hard_state(&self) -> RaftResult<()> {
        self.storage
            .save_hard_state(&HardState {
                current_term: self.current_term,
                voted_for: self.voted_for,
            })
            .await
    }

    /// `startNewElection` (§4.9.3).
    async fn start_new_election(&mut self) -> RaftResult<()> {
        if !self.membership.has_vote(self.id) {
            self.reset_election_timer();
            return Ok(());
        }
        self.current_term += 1;
        self.state = State::Candidate;
        self.voted_for = Some(self.id);
        self.persist_hard_state().await?;
        self.reset_election_timer();

        let voters: Vec<NodeId> = self.membership.all_servers().into_iter().filter(|&s| s != self.id).collect();
        tracing::info!(term = self.current_term, ?voters, "starting election");

        if voters.is_empty() && self.membership.quorum_all(|s| s == self.id) {
            self.become_leader().await?;
            return Ok(());
        }

        let mut granted = BTreeSet::new();
        granted.insert(self.id);
        for peer in voters {
            let rpc = VoteRequest::new(self.current_term, self.id, self.last_log_id.index, self.last_log_id.term);
            match self.network.vote(peer, rpc).await {
                Ok(resp) if resp.term > self.current_term => {
                    self.step_down(resp.term).await?;
                    return Ok(());
                }
                Ok(resp) if resp.vote_granted => {
                    granted.insert(peer);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(peer, error = %e, "vote RPC failed"),
            }
        }
        if self.state == State::Candidate && self.membership.quorum_all(|s| granted.contains(&s)) {
            self.become_leader().await?;
        }
        Ok(())
    }

    /// `becomeLeader` (§4.9.3): appends a NOOP stamped with the cluster
    /// clock so commit can advance in the new term, and starts one
    /// replication task per peer.
    async fn become_leader(&mut self) -> RaftResult<()> {
        self.state = State::Leader;
        self.leader_id = Some(self.id);
        tracing::info!(term = self.current_term, "became leader");

        self.peers.clear();
        for peer in self.membership.all_servers() {
            if peer == self.id {
                continue;
            }
            self.peers.insert(
                peer,
                PeerState {
                    next_index: self.last_log_id.index + 1,
                    match_index: 0,
                },
            );
        }

        let stamp = self.clock.leader_stamp();
        let entry = Entry::new_noop(LogId::new(self.current_term, self.last_log_id.index + 1), stamp);
        self.append_entries_locally(vec![entry]).await?;
        Ok(())
    }

    async fn append_entries_locally(&mut self, entries: Vec<Entry<Command>>) -> RaftResult<()> {
        if let Some(last) = entries.last() {
            self.last_log_id = last.log_id;
        }
        self.storage.append_to_log(entries).await?;
        self.replicate_to_peers().await?;
        self.advance_commit_index().await
    }

    /// Errors bubble out of here only when a peer RPC uncovers a fatal local
    /// storage condition (e.g. `advance_commit_index` failing to apply a
    /// committed entry); an unreachable or rejecting peer is logged and
    /// skipped so the others still get replicated to.
    async fn replicate_to_peers(&mut self) -> RaftResult<()> {
        let ids: Vec<NodeId> = self.peers.keys().copied().collect();
        for id in ids {
            self.send_append_entries_to(id).await?;
        }
        Ok(())
    }

    async fn send_append_entries_to(&mut self, peer: NodeId) -> RaftResult<()> {
        let Some(peer_state) = self.peers.get(&peer) else { return Ok(()) };
        let next_index = peer_state.next_index;

        if next_index <= self.log_start_index && self.log_start_index > 1 {
            return self.send_install_snapshot_to(peer).await;
        }

        let prev_index = next_index.saturating_sub(1);
        let prev_term = if prev_index == 0 {
            0
        } else {
            match self.storage.try_get_log_entry(prev_index).await {
                Ok(Some(e)) => e.log_id.term,
                _ => 0,
            }
        };
        let stop = (next_index + self.config.max_log_entries_per_request).max(next_index + 1);
        let entries = self.storage.get_log_entries(next_index, stop).await.unwrap_or_default();

        let rpc = AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            entries,
            commit_index: self.commit_index,
        };
        match self.network.append_entries(peer, rpc.clone()).await {
            Ok(resp) if resp.term > self.current_term => {
                self.step_down(resp.term).await?;
            }
            Ok(resp) if resp.success => {
                let sent_last = rpc.entries.last().map(|e| e.log_id.index).unwrap_or(prev_index);
                if let Some(p) = self.peers.get_mut(&peer) {
                    p.match_index = sent_last;
                    p.next_index = sent_last + 1;
                }
                self.advance_commit_index().await?;
            }
            Ok(resp) => {
                if let Some(p) = self.peers.get_mut(&peer) {
                    p.next_index = resp.last_log_index.saturating_add(1).min(p.next_index.saturating_sub(1).max(1));
                }
            }
            Err(e) => tracing::warn!(peer, error = %e, "append_entries RPC failed"),
        }
        Ok(())
    }

    async fn send_install_snapshot_to(&mut self, peer: NodeId) -> RaftResult<()> {
        let snapshot = match self.storage.get_current_snapshot().await {
            Ok(Some(s)) => s,
            Ok(None) => return Ok(()),
            Err(e) if e.is_fatal() => return Err(e),
            Err(_) => return Ok(()),
        };
        let rpc = InstallSnapshotRequest {
            term: self.current_term,
            leader_id: self.id,
            last_snapshot_index: snapshot.last_log_id.index,
            last_snapshot_term: snapshot.last_log_id.term,
            byte_offset: 0,
            data: Vec::new(),
            done: true,
            version: 2,
        };
        match self.network.install_snapshot(peer, rpc).await {
            Ok(resp) if resp.term > self.current_term => {
                self.step_down(resp.term).await?;
            }
            Ok(_) => {
                if let Some(p) = self.peers.get_mut(&peer) {
                    p.next_index = snapshot.last_log_id.index + 1;
                    p.match_index = snapshot.last_log_id.index;
                }
            }
            Err(e) => tracing::warn!(peer, error = %e, "install_snapshot RPC failed"),
        }
        Ok(())
    }

    /// §4.9.6: `N = quorumMin(match_index)`, treating the leader's own
    /// match_index as `last_log_id.index`.
    async fn advance_commit_index(&mut self) -> RaftResult<()> {
        if self.state != State::Leader {
            return Ok(());
        }
        let mut values: BTreeMap<NodeId, u64> = self.peers.iter().map(|(id, p)| (*id, p.match_index)).collect();
        values.insert(self.id, self.last_log_id.index);
        let n = self.membership.quorum_min(&values);

        if n > self.commit_index && n >= self.log_start_index {
            if let Ok(Some(entry)) = self.storage.try_get_log_entry(n).await {
                if entry.log_id.term == self.current_term {
                    self.commit_index = n;
                    self.apply_committed().await?;
                }
            }
        }
        Ok(())
    }

    /// Applies every entry through `commit_index` that hasn't been applied
    /// yet, and wakes any pending linearizable reads whose watermark has
    /// now been reached.
    async fn apply_committed(&mut self) -> RaftResult<()> {
        if self.commit_index <= self.last_applied {
            return Ok(());
        }
        let start = self.last_applied + 1;
        let entries = self.storage.get_log_entries(start, self.commit_index + 1).await?;
        if entries.is_empty() {
            return Ok(());
        }
        let responses = self.storage.apply_to_state_machine(&entries).await?;
        for (entry, response) in entries.iter().zip(responses) {
            self.applied_responses.insert(entry.log_id.index, response);
        }
        self.last_applied = entries.last().map(|e| e.log_id.index).unwrap_or(self.last_applied);
        // Keep only the tail a caller could plausibly still be waiting on.
        let floor = self.last_applied.saturating_sub(1024);
        self.applied_responses = self.applied_responses.split_off(&floor);

        self.maybe_step_down_after_config_commit(&entries).await?;
        Ok(())
    }

    /// If the newly committed range crosses a TRANSITIONAL boundary into a
    /// STABLE configuration that excludes self, step down (§4.9.6).
    async fn maybe_step_down_after_config_commit(&mut self, entries: &[Entry<Command>]) -> RaftResult<()> {
        let crosses = entries.iter().any(|e| matches!(e.payload, EntryPayload::ConfigChange(_)));
        if crosses && self.state == State::Leader && !self.membership.all_servers().contains(&self.id) {
            self.step_down(self.current_term).await?;
        }
        Ok(())
    }

    pub(crate) async fn handle_append_entries(&mut self, rpc: AppendEntriesRequest<Command>) -> RaftResult<AppendEntriesResponse> {
        tracing::debug!(rpc = %rpc.summary(), "append_entries");
        if rpc.term < self.current_term {
            return Ok(self.reject_append(rpc.term));
        }
        if rpc.term >= self.current_term {
            self.step_down(rpc.term).await?;
        }
        self.leader_id = Some(rpc.leader_id);
        self.reset_election_timer();
        self.withhold_votes_until = Instant::now() + self.config.election_timeout;

        if rpc.prev_log_index > self.last_log_id.index {
            return Ok(self.reject_append(self.current_term));
        }
        if rpc.prev_log_index + 1 < self.log_start_index {
            return Ok(self.reject_append(self.current_term));
        }
        if rpc.prev_log_index >= self.log_start_index {
            match self.storage.try_get_log_entry(rpc.prev_log_index).await? {
                Some(e) if e.log_id.term != rpc.prev_log_term && rpc.prev_log_index > 0 => {
                    return Ok(self.reject_append(self.current_term));
                }
                None if rpc.prev_log_index > 0 => return Ok(self.reject_append(self.current_term)),
                _ => {}
            }
        }

        let mut to_append = Vec::new();
        for entry in rpc.entries {
            if entry.log_id.index <= self.last_log_id.index {
                match self.storage.try_get_log_entry(entry.log_id.index).await? {
                    Some(existing) if existing.log_id.term == entry.log_id.term => continue,
                    _ => {
                        self.storage.delete_logs_from(entry.log_id.index.saturating_sub(1)).await?;
                        self.last_log_id = self.storage.get_last_log_id().await?;
                        self.membership = self.storage.get_membership_config().await?;
                    }
                }
            }
            to_append.push(entry);
        }
        if let Some(last) = to_append.last() {
            self.clock.new_epoch(last.cluster_time);
            self.last_log_id = last.log_id;
        }
        if !to_append.is_empty() {
            let carries_config_change = to_append.iter().any(|e| matches!(e.payload, EntryPayload::ConfigChange(_)));
            self.storage.append_to_log(to_append).await?;
            if carries_config_change {
                self.membership = self.storage.get_membership_config().await?;
            }
        }

        self.commit_index = rpc.commit_index.min(self.last_log_id.index);
        self.apply_committed().await?;

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            last_log_index: self.last_log_id.index,
            server_capabilities: ServerCapabilities::default(),
        })
    }

    fn reject_append(&self, term: u64) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term,
            success: false,
            last_log_index: self.last_log_id.index,
            server_capabilities: ServerCapabilities::default(),
        }
    }

    pub(crate) async fn handle_vote_request(&mut self, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        if rpc.term < self.current_term {
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
                log_ok: false,
            });
        }
        if rpc.term > self.current_term {
            self.step_down(rpc.term).await?;
        }
        let log_ok = (rpc.last_log_term, rpc.last_log_index) >= (self.last_log_id.term, self.last_log_id.index);

        if Instant::now() < self.withhold_votes_until {
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
                log_ok,
            });
        }

        if log_ok && (self.voted_for.is_none() || self.voted_for == Some(rpc.candidate_id)) {
            self.voted_for = Some(rpc.candidate_id);
            self.persist_hard_state().await?;
            self.reset_election_timer();
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: true,
                log_ok,
            });
        }
        Ok(VoteResponse {
            term: self.current_term,
            vote_granted: false,
            log_ok,
        })
    }

    pub(crate) async fn handle_install_snapshot(&mut self, rpc: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        if rpc.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                bytes_stored: 0,
            });
        }
        if rpc.term > self.current_term {
            self.step_down(rpc.term).await?;
        }
        self.leader_id = Some(rpc.leader_id);
        self.reset_election_timer();

        let bytes_stored = self
            .storage
            .install_snapshot_chunk(
                rpc.last_snapshot_index,
                rpc.last_snapshot_term,
                rpc.byte_offset,
                &rpc.data,
                rpc.done,
                rpc.version,
            )
            .await?;

        if rpc.done {
            self.log_start_index = rpc.last_snapshot_index + 1;
            self.commit_index = self.commit_index.max(rpc.last_snapshot_index);
            self.last_applied = self.last_applied.max(rpc.last_snapshot_index);
            if self.last_log_id.index < rpc.last_snapshot_index {
                self.last_log_id = LogId::new(rpc.last_snapshot_term, rpc.last_snapshot_index);
            }
            self.membership = self.storage.get_membership_config().await?;
        }

        Ok(InstallSnapshotResponse {
            term: self.current_term,
            bytes_stored,
        })
    }

    pub(crate) async fn handle_client_write(&mut self, payload: Command) -> Result<ClientWriteResponse<CommandResponse>, ClientWriteError> {
        if self.state != State::Leader {
            return Err(ClientWriteError::RaftError(RaftError::NotLeader));
        }
        let stamp = self.clock.leader_stamp();
        let log_id = LogId::new(self.current_term, self.last_log_id.index + 1);
        let entry = Entry {
            log_id,
            cluster_time: stamp,
            payload: EntryPayload::Normal(payload),
        };
        self.append_entries_locally(vec![entry]).await?;

        while self.last_applied < log_id.index {
            if self.state != State::Leader {
                return Err(ClientWriteError::RaftError(RaftError::NotLeader));
            }
            tokio::task::yield_now().await;
            self.replicate_to_peers().await?;
            self.advance_commit_index().await?;
        }
        let data = self.applied_responses.get(&log_id.index).cloned().unwrap_or(CommandResponse::None);
        Ok(ClientWriteResponse { log_id, data })
    }

    pub(crate) async fn handle_client_read(
        &mut self,
        query: crate::tree::TreeOp,
    ) -> Result<crate::tree::TreeResult, ClientReadError> {
        if self.state != State::Leader {
            return Err(ClientReadError::RaftError(RaftError::NotLeader));
        }
        self.storage.query_state_machine(&query).await.map_err(ClientReadError::RaftError)
    }

    pub(crate) async fn handle_initialize(&mut self, members: BTreeSet<NodeId>) -> Result<(), InitializeError> {
        if self.membership.all_servers().len() > 1 || self.last_log_id.index != 0 {
            return Err(InitializeError::NotAllowed);
        }
        let configuration = Configuration::stable(1, members);
        let stamp = self.clock.leader_stamp();
        let entry = Entry::new_config(LogId::new(1, 1), stamp, configuration.clone());
        self.current_term = 1;
        self.membership = configuration;
        self.append_entries_locally(vec![entry]).await.map_err(InitializeError::RaftError)?;
        self.start_new_election().await.map_err(InitializeError::RaftError)?;
        Ok(())
    }

    pub(crate) async fn handle_add_non_voter(&mut self, id: NodeId) -> Result<(), ChangeConfigError> {
        if self.state != State::Leader {
            return Err(ChangeConfigError::RaftError(RaftError::NotLeader));
        }
        if self.membership.all_servers().contains(&id) {
            return Err(ChangeConfigError::RaftError(RaftError::AlreadyMember(id)));
        }
        let next_index = self.last_log_id.index + 1;
        let configuration = Configuration::staging(next_index, self.membership.old_servers.clone(), {
            let mut s = self.membership.new_servers.clone();
            s.insert(id);
            s
        });
        self.apply_config_change(configuration).await
    }

    pub(crate) async fn handle_change_membership(&mut self, members: BTreeSet<NodeId>) -> Result<(), ChangeConfigError> {
        if self.state != State::Leader {
            return Err(ChangeConfigError::RaftError(RaftError::NotLeader));
        }
        if matches!(self.membership.state, crate::membership::ConfigurationState::Transitional) {
            return Err(ChangeConfigError::ConfigChangeInProgress);
        }
        if members.len() < 1 {
            return Err(ChangeConfigError::InvalidConfiguration("at least one voter is required".into()));
        }
        let next_index = self.last_log_id.index + 1;
        let configuration = Configuration::transitional(next_index, self.membership.old_servers.clone(), members.clone());
        self.apply_config_change(configuration).await?;

        // Once the TRANSITIONAL entry commits, follow up with the final
        // STABLE configuration (§4.8: "TRANSITIONAL + setConfig(simple from
        // next) -> STABLE").
        while self.last_applied < next_index {
            tokio::task::yield_now().await;
        }
        let final_index = self.last_log_id.index + 1;
        let stable = Configuration::stable(final_index, members);
        self.apply_config_change(stable).await
    }

    async fn apply_config_change(&mut self, configuration: Configuration) -> Result<(), ChangeConfigError> {
        let stamp = self.clock.leader_stamp();
        let entry = Entry::new_config(LogId::new(self.current_term, configuration.id), stamp, configuration.clone());
        self.membership = configuration;
        for peer in self.membership.all_servers() {
            self.peers.entry(peer).or_insert_with(|| PeerState {
                next_index: self.last_log_id.index + 1,
                match_index: 0,
            });
        }
        self.append_entries_locally(vec![entry]).await.map_err(ChangeConfigError::RaftError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::log::MemoryLog;
    use crate::storage::DiskStorage;

    struct NullNetwork;

    #[async_trait]
    impl RaftNetwork<Command> for NullNetwork {
        async fn append_entries(&self, _target: NodeId, _rpc: AppendEntriesRequest<Command>) -> RaftResult<AppendEntriesResponse> {
            Err(RaftError::ShuttingDown)
        }
        async fn install_snapshot(&self, _target: NodeId, _rpc: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
            Err(RaftError::ShuttingDown)
        }
        async fn vote(&self, _target: NodeId, _rpc: VoteRequest) -> RaftResult<VoteResponse> {
            Err(RaftError::ShuttingDown)
        }
    }

    /// Builds a bare `RaftCore` directly against the struct fields, bypassing
    /// `spawn`'s actor loop so `handle_append_entries` can be driven one RPC
    /// at a time from a test.
    async fn test_core(dir: &std::path::Path) -> RaftCore<NullNetwork, DiskStorage<MemoryLog<Command>>> {
        let config = Arc::new(Config::builder("test-cluster", 1).storage_path(dir.to_path_buf()).build().unwrap());
        let storage = DiskStorage::open_in_memory(config.clone()).unwrap();
        let initial = storage.get_initial_state().await.unwrap();
        let (_tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, _rx_metrics) = watch::channel(RaftMetrics::new_initial(1));
        let (_tx_shutdown, rx_shutdown) = oneshot::channel();
        let deadline = Instant::now() + config.election_timeout;
        RaftCore {
            id: 1,
            config,
            network: Arc::new(NullNetwork),
            storage,
            state: State::Follower,
            current_term: initial.hard_state.current_term,
            voted_for: initial.hard_state.voted_for,
            leader_id: None,
            withhold_votes_until: deadline,
            commit_index: 0,
            last_applied: initial.last_applied_log.index,
            last_log_id: initial.last_log_id,
            log_start_index: initial.log_start_index,
            membership: initial.membership,
            clock: ClusterClock::new(),
            election_deadline: deadline,
            peers: BTreeMap::new(),
            rx_api,
            tx_metrics,
            rx_shutdown,
            applied_responses: BTreeMap::new(),
        }
    }

    fn blank(term: u64, index: u64) -> Entry<Command> {
        Entry::new_noop(LogId::new(term, index), 0)
    }

    #[tokio::test]
    async fn append_entries_truncates_a_conflicting_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = test_core(dir.path()).await;

        core.handle_append_entries(AppendEntriesRequest {
            term: 1,
            leader_id: 9,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![blank(1, 1), blank(1, 2)],
            commit_index: 0,
        })
        .await
        .unwrap();
        assert_eq!(core.last_log_id, LogId::new(1, 2));

        // A new leader at a higher term never saw that second entry and
        // overwrites it with one of its own.
        let resp = core
            .handle_append_entries(AppendEntriesRequest {
                term: 2,
                leader_id: 7,
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![blank(2, 2)],
                commit_index: 2,
            })
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(core.last_log_id, LogId::new(2, 2));

        let stored = core.storage.try_get_log_entry(2).await.unwrap().unwrap();
        assert_eq!(stored.log_id.term, 2);
    }
}
