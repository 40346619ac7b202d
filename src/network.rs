//! The pluggable async transport, kept strictly as an interface.
//!
//! RPC framing/transport is an explicit external collaborator: this crate
//! calls through `RaftNetwork` from peer replication tasks but ships no
//! concrete implementation.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::NodeId;

/// Command payload carried by `DATA` log entries; see `state_machine::Command`.
pub trait AppData: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

#[async_trait]
pub trait RaftNetwork<D>: Send + Sync + 'static
where D: AppData
{
    async fn append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse>;

    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> RaftResult<VoteResponse>;
}
