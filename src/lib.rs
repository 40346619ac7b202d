//! A Raft consensus node with a durable, segmented on-disk log, atomic
//! snapshot files, and a session-aware state machine over an in-memory
//! hierarchical tree.
//!
//! The actor architecture (`RaftCore`, the public `Raft` handle) follows the
//! async-raft lineage this crate grew from, with replication to each peer
//! driven inline from the leader's own task rather than a decoupled
//! per-peer background task; the storage engine underneath (`filesystem`,
//! `layout`, `metadata`, `log`, `snapshot`) is a from-scratch, concrete
//! implementation of a segmented log and atomic snapshot file, in the
//! style of a production Raft storage layer rather than an in-memory
//! reference store.

pub mod clock;
pub mod config;
pub mod core;
pub mod error;
pub mod filesystem;
pub mod layout;
pub mod log;
pub mod membership;
pub mod metadata;
pub mod metrics;
pub mod network;
pub mod raft;
pub mod snapshot;
pub mod state_machine;
pub mod storage;
pub mod tree;

pub use config::Config;
pub use config::ConfigBuilder;
pub use core::RaftCore;
pub use error::RaftError;
pub use network::AppData;
pub use network::RaftNetwork;
pub use raft::Raft;
pub use storage::DiskStorage;
pub use storage::RaftStorage;

use serde::Deserialize;
use serde::Serialize;

/// A cluster member identifier, stable across restarts and configuration
/// changes (the "cyclic ownership" key from the design notes).
pub type NodeId = u64;

/// A command's result, returned from `StateMachine::apply` and carried back
/// to the client that submitted it.
pub trait AppDataResponse: Clone + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static {}

/// A `(term, index)` pair identifying a log entry; `index == 0` means "no
/// entry" regardless of term.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub const fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.index, self.term)
    }
}

/// A unique identifier for a snapshot transfer, so a follower can tell a
/// fresh `InstallSnapshot` stream from a continuation of the one in flight.
pub type SnapshotId = u64;

/// Terse one-line summaries for `tracing` fields, implemented by the wire
/// types passed through `core`'s RPC handlers.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
