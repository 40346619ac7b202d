//! Metrics published by a running node, mirrored over a `watch` channel
//! every time the core's state changes.

use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::membership::Configuration;
use crate::LogId;
use crate::NodeId;

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub enum State {
    Follower,
    Candidate,
    Leader,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub state: State,
    pub current_term: u64,
    pub last_log_id: LogId,
    pub last_applied: u64,
    pub current_leader: Option<NodeId>,
    pub membership_config: Configuration,
    pub snapshot_last_log_id: LogId,
    pub leader_metrics: Option<LeaderMetrics>,
}

impl RaftMetrics {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_id: LogId::default(),
            last_applied: 0,
            current_leader: None,
            membership_config: Configuration::new_initial(id),
            snapshot_last_log_id: LogId::default(),
            leader_metrics: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationMetrics {
    pub match_index: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct LeaderMetrics {
    pub replication: BTreeMap<NodeId, ReplicationMetrics>,
}

/// Whether a state change requires an immediate metrics publish.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Update<T = ()> {
    Ignore,
    Update(T),
}
