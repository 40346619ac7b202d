//! An in-process network harness for exercising a handful of `Raft` nodes
//! together: each node is a real `DiskStorage` over a `MemoryLog`, rooted in
//! its own `tempfile::TempDir`, so locking and snapshot-path behavior match
//! production even though nothing touches a real segmented log.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use raftcabin::config::Config;
use raftcabin::error::RaftResult;
use raftcabin::raft::AppendEntriesRequest;
use raftcabin::raft::AppendEntriesResponse;
use raftcabin::raft::InstallSnapshotRequest;
use raftcabin::raft::InstallSnapshotResponse;
use raftcabin::raft::VoteRequest;
use raftcabin::raft::VoteResponse;
use raftcabin::state_machine::Command;
use raftcabin::state_machine::CommandResponse;
use raftcabin::storage::DiskStorage;
use raftcabin::NodeId;
use raftcabin::Raft;
use raftcabin::RaftNetwork;

type Node = Raft<Command, CommandResponse, RouterNetwork, DiskStorage<raftcabin::log::MemoryLog<Command>>>;

/// Routes RPCs between the nodes registered with it; nodes reach peers
/// exclusively through this handle, never each other directly. A node in
/// `partitioned` drops every RPC addressed to or from it, simulating a
/// network split without tearing down its `RaftCore` task.
pub struct RouterNetwork {
    nodes: Mutex<BTreeMap<NodeId, Node>>,
    partitioned: Mutex<BTreeSet<NodeId>>,
}

impl RouterNetwork {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(BTreeMap::new()),
            partitioned: Mutex::new(BTreeSet::new()),
        })
    }

    fn register(&self, id: NodeId, node: Node) {
        self.nodes.lock().unwrap().insert(id, node);
    }

    fn get(&self, id: NodeId) -> Option<Node> {
        if self.partitioned.lock().unwrap().contains(&id) {
            return None;
        }
        self.nodes.lock().unwrap().get(&id).cloned()
    }

    fn partition(&self, id: NodeId) {
        self.partitioned.lock().unwrap().insert(id);
    }

    fn heal(&self, id: NodeId) {
        self.partitioned.lock().unwrap().remove(&id);
    }
}

#[async_trait]
impl RaftNetwork<Command> for RouterNetwork {
    async fn append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<Command>) -> RaftResult<AppendEntriesResponse> {
        let node = self.get(target).ok_or(raftcabin::RaftError::ShuttingDown)?;
        node.append_entries(rpc).await
    }

    async fn install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        let node = self.get(target).ok_or(raftcabin::RaftError::ShuttingDown)?;
        node.install_snapshot(rpc).await
    }

    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        let node = self.get(target).ok_or(raftcabin::RaftError::ShuttingDown)?;
        node.vote(rpc).await
    }
}

/// A small in-process cluster: every node shares the same `RouterNetwork`
/// so they can call each other directly by `NodeId`.
pub struct RaftRouter {
    network: Arc<RouterNetwork>,
    nodes: BTreeMap<NodeId, Node>,
    _dirs: Vec<tempfile::TempDir>,
}

impl RaftRouter {
    /// Builds `ids.len()` nodes, all pointing at the same network, none
    /// initialized yet.
    pub fn new(ids: &[NodeId]) -> Self {
        let network = RouterNetwork::new();
        let mut nodes = BTreeMap::new();
        let mut dirs = Vec::new();

        for &id in ids {
            let dir = tempfile::tempdir().unwrap();
            let config = Arc::new(
                Config::builder("test-cluster", id)
                    .storage_path(dir.path().to_path_buf())
                    .election_timeout(Duration::from_millis(60))
                    .heartbeat_period(Duration::from_millis(15))
                    .build()
                    .unwrap(),
            );
            let storage = DiskStorage::open_in_memory(config.clone()).unwrap();
            let node = Raft::new(id, config, network.clone(), storage);
            network.register(id, node.clone());
            nodes.insert(id, node);
            dirs.push(dir);
        }

        Self {
            network,
            nodes,
            _dirs: dirs,
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(&id).expect("unknown node id")
    }

    /// Initializes a single-node cluster with `leader` as its only voter.
    pub async fn initialize_single(&self, leader: NodeId) {
        self.node(leader).initialize(BTreeSet::from([leader])).await.unwrap();
    }

    /// Initializes a cluster with every id in `members` as a voter from the
    /// first boot, driven by `members`'s lowest id (the others just need to
    /// be running to answer its RequestVote RPCs).
    pub async fn initialize_cluster(&self, members: &[NodeId]) {
        let bootstrapper = *members.iter().min().expect("at least one member");
        self.node(bootstrapper).initialize(members.iter().copied().collect()).await.unwrap();
    }

    pub async fn wait_for_leader(&self, id: NodeId) {
        let mut rx = self.node(id).metrics();
        loop {
            if rx.borrow().current_leader.is_some() {
                return;
            }
            rx.changed().await.unwrap();
        }
    }

    /// Drops every RPC addressed to `id` until [`Self::heal`] is called.
    pub fn partition(&self, id: NodeId) {
        self.network.partition(id);
    }

    pub fn heal(&self, id: NodeId) {
        self.network.heal(id);
    }
}

impl Drop for RaftRouter {
    fn drop(&mut self) {
        let _ = &self.network;
    }
}
