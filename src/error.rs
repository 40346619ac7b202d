//! Error types used throughout the crate.
//!
//! Two tiers, per the error handling design: [`RaftError`] for conditions a
//! caller should see and possibly retry, and [`StorageError`] for the
//! storage engine's fatal/recoverable split. A `StorageError::Fatal` is never
//! unwound with a panic; it is returned up to the owning task's main loop,
//! which converts it into a clean shutdown.

use thiserror::Error;

use crate::NodeId;

pub type RaftResult<T> = Result<T, RaftError>;
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("raft storage error: {0}")]
    RaftStorage(String),

    #[error("snapshot segment mismatch: expected {expect:?}, got {got:?}")]
    SnapshotMismatch {
        expect: SnapshotSegmentId,
        got: SnapshotSegmentId,
    },

    #[error("install_snapshot version {got} is not supported (expected {supported})")]
    UnsupportedSnapshotVersion { supported: u8, got: u8 },

    #[error("the cluster is not initialized")]
    NotInitialized,

    #[error("node {0} is already a member of the cluster")]
    AlreadyMember(NodeId),

    #[error("node {0} is not a member of the cluster")]
    NotMember(NodeId),

    #[error("a configuration change is already in progress")]
    ConfigChangeInProgress,

    #[error("the new configuration would leave too few voters ({0})")]
    TooFewVoters(usize),

    #[error("this node is not the current leader")]
    NotLeader,

    #[error("the client session has expired")]
    SessionExpired,

    #[error("request vote withheld until election timer settles")]
    VotesWithheld,

    #[error("raft node is shutting down")]
    ShuttingDown,

    #[error("internal channel closed unexpectedly: {0}")]
    ChannelClosed(String),

    #[error(transparent)]
    Fatal(#[from] StorageError),
}

impl RaftError {
    /// Whether this condition indicates the storage engine is broken and the
    /// owning `RaftCore` task must stop making progress rather than keep
    /// serving requests against it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Fatal(e) if e.is_fatal())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotSegmentId {
    pub id: u64,
    pub offset: u64,
}

/// Storage-layer errors, split along the fatal/recoverable/warned-and-dropped
/// lines.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A condition that indicates on-disk corruption or a broken invariant.
    /// The owning task must stop making progress and shut down cleanly; it
    /// must never attempt to paper over a fatal error and keep running.
    #[error("fatal storage error: {0}")]
    Fatal(String),

    /// Ordinary I/O failure (e.g. ENOSPC, permission denied) that the caller
    /// can retry or surface.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("(de)serialization error: {0}")]
    Serde(String),
}

impl StorageError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        StorageError::Fatal(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::Fatal(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum ChangeConfigError {
    #[error(transparent)]
    RaftError(#[from] RaftError),

    #[error("a configuration change is already in progress")]
    ConfigChangeInProgress,

    #[error("the new configuration is invalid: {0}")]
    InvalidConfiguration(String),
}

impl ChangeConfigError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChangeConfigError::RaftError(e) if e.is_fatal())
    }
}

#[derive(Debug, Error)]
pub enum ClientWriteError {
    #[error(transparent)]
    RaftError(#[from] RaftError),

    #[error("the client session referenced by this request has expired")]
    SessionExpired,

    #[error("this command was already applied with a different result")]
    LookupError,
}

impl ClientWriteError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientWriteError::RaftError(e) if e.is_fatal())
    }
}

#[derive(Debug, Error)]
pub enum ClientReadError {
    #[error(transparent)]
    RaftError(#[from] RaftError),

    #[error("this node could not confirm leadership in time")]
    QuorumNotConfirmed,
}

impl ClientReadError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientReadError::RaftError(e) if e.is_fatal())
    }
}

#[derive(Debug, Error)]
pub enum InitializeError {
    #[error(transparent)]
    RaftError(#[from] RaftError),

    #[error("the node is not in a pristine, un-initialized state")]
    NotAllowed,
}

impl InitializeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, InitializeError::RaftError(e) if e.is_fatal())
    }
}
