//! Joint-consensus membership: [`Configuration`] (the value) and
//! [`ConfigurationManager`] (keeps it consistent with log and snapshot
//! mutations).

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::NodeId;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub enum ConfigurationState {
    Blank,
    Stable,
    Staging,
    Transitional,
}

/// A cluster membership description: which servers vote, and (under
/// transitional/staging configurations) which are only receiving the log.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct Configuration {
    pub state: ConfigurationState,
    pub old_servers: BTreeSet<NodeId>,
    pub new_servers: BTreeSet<NodeId>,
    /// The log index this configuration was appended at; 0 if none (BLANK).
    pub id: u64,
}

impl Configuration {
    pub fn blank() -> Self {
        Self {
            state: ConfigurationState::Blank,
            old_servers: BTreeSet::new(),
            new_servers: BTreeSet::new(),
            id: 0,
        }
    }

    pub fn new_initial(id: NodeId) -> Self {
        let mut servers = BTreeSet::new();
        servers.insert(id);
        Self {
            state: ConfigurationState::Stable,
            old_servers: servers,
            new_servers: BTreeSet::new(),
            id: 0,
        }
    }

    pub fn stable(index: u64, servers: BTreeSet<NodeId>) -> Self {
        Self {
            state: ConfigurationState::Stable,
            old_servers: servers,
            new_servers: BTreeSet::new(),
            id: index,
        }
    }

    pub fn staging(index: u64, old: BTreeSet<NodeId>, listeners: BTreeSet<NodeId>) -> Self {
        Self {
            state: ConfigurationState::Staging,
            old_servers: old,
            new_servers: listeners,
            id: index,
        }
    }

    pub fn transitional(index: u64, old: BTreeSet<NodeId>, new: BTreeSet<NodeId>) -> Self {
        Self {
            state: ConfigurationState::Transitional,
            old_servers: old,
            new_servers: new,
            id: index,
        }
    }

    /// All servers that should receive the replicated log, voting or not.
    pub fn all_servers(&self) -> BTreeSet<NodeId> {
        self.old_servers.union(&self.new_servers).copied().collect()
    }

    /// Whether `server` casts a vote under this configuration, per §4.8.
    pub fn has_vote(&self, server: NodeId) -> bool {
        match self.state {
            ConfigurationState::Blank => false,
            ConfigurationState::Stable | ConfigurationState::Staging => self.old_servers.contains(&server),
            ConfigurationState::Transitional => {
                self.old_servers.contains(&server) || self.new_servers.contains(&server)
            }
        }
    }

    fn majority(set: &BTreeSet<NodeId>, predicate: &dyn Fn(NodeId) -> bool) -> bool {
        if set.is_empty() {
            return true;
        }
        let count = set.iter().filter(|&&s| predicate(s)).count();
        count * 2 > set.len()
    }

    /// `quorumAll(P)`: true iff `P` holds for a quorum under this
    /// configuration (joint majority of old AND new under TRANSITIONAL).
    pub fn quorum_all(&self, predicate: impl Fn(NodeId) -> bool) -> bool {
        match self.state {
            ConfigurationState::Blank => false,
            ConfigurationState::Stable | ConfigurationState::Staging => {
                Self::majority(&self.old_servers, &predicate)
            }
            ConfigurationState::Transitional => {
                Self::majority(&self.old_servers, &predicate) && Self::majority(&self.new_servers, &predicate)
            }
        }
    }

    /// `quorumMin(f)`: the largest value `v` such that `quorum_all(|s| f(s) >= v)` holds.
    pub fn quorum_min(&self, values: &BTreeMap<NodeId, u64>) -> u64 {
        let get = |s: NodeId| values.get(&s).copied().unwrap_or(0);
        let old_min = Self::majority_min(&self.old_servers, &get);
        match self.state {
            ConfigurationState::Blank => 0,
            ConfigurationState::Stable | ConfigurationState::Staging => old_min,
            ConfigurationState::Transitional => {
                let new_min = Self::majority_min(&self.new_servers, &get);
                old_min.min(new_min)
            }
        }
    }

    fn majority_min(set: &BTreeSet<NodeId>, get: &dyn Fn(NodeId) -> u64) -> u64 {
        if set.is_empty() {
            return u64::MAX;
        }
        let mut values: Vec<u64> = set.iter().map(|&s| get(s)).collect();
        values.sort_unstable();
        // The (n - majority_size)-th smallest value is held by a majority.
        let majority_size = values.len() / 2 + 1;
        values[values.len() - majority_size]
    }
}

/// A `(index, Configuration)` keyed by the log index the configuration was
/// appended at, plus the single snapshot-slot description, kept consistent
/// with log append/truncate and snapshot completion.
#[derive(Debug, Default)]
pub struct ConfigurationManager {
    descriptions: BTreeMap<u64, Configuration>,
    snapshot: Option<(u64, Configuration)>,
}

impl ConfigurationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called on log append of a CONFIGURATION entry.
    pub fn add(&mut self, index: u64, configuration: Configuration) {
        self.descriptions.insert(index, configuration);
    }

    /// Called on `truncate_prefix`/`truncate_suffix`: drop descriptions
    /// outside `[first_kept, last_kept]`.
    pub fn retain_range(&mut self, first_kept: u64, last_kept: u64) {
        self.descriptions.retain(|&idx, _| idx >= first_kept && idx <= last_kept);
    }

    /// Called on snapshot completion: replace the snapshot slot and drop any
    /// log-indexed description at or below the new snapshot index.
    pub fn set_snapshot(&mut self, snapshot_index: u64, configuration: Configuration) {
        self.snapshot = Some((snapshot_index, configuration));
        self.descriptions.retain(|&idx, _| idx > snapshot_index);
    }

    /// The active configuration: the description at the largest index <=
    /// `last_log_index`, else the snapshot's, else BLANK.
    pub fn active(&self, last_log_index: u64) -> Configuration {
        if let Some((_, desc)) = self.descriptions.range(..=last_log_index).next_back() {
            return desc.clone();
        }
        if let Some((_, desc)) = &self.snapshot {
            return desc.clone();
        }
        Configuration::blank()
    }

    /// The configuration active as of `index`, used to stamp a snapshot's
    /// header with `configurationManager.latestAsOf(lastIndex)` (§4.9.8).
    pub fn latest_as_of(&self, index: u64) -> Configuration {
        self.active(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreeset;

    #[test]
    fn stable_quorum_is_simple_majority() {
        let cfg = Configuration::stable(1, btreeset! {1, 2, 3});
        assert!(cfg.quorum_all(|s| s == 1 || s == 2));
        assert!(!cfg.quorum_all(|s| s == 1));
    }

    #[test]
    fn transitional_requires_both_majorities() {
        let cfg = Configuration::transitional(1, btreeset! {1, 2, 3}, btreeset! {3, 4, 5});
        // majority of old (1,2) but no majority of new.
        assert!(!cfg.quorum_all(|s| s == 1 || s == 2));
        assert!(cfg.quorum_all(|s| s != 10));
    }

    #[test]
    fn has_vote_matches_state() {
        let staging = Configuration::staging(1, btreeset! {1, 2}, btreeset! {3});
        assert!(staging.has_vote(1));
        assert!(!staging.has_vote(3));

        let transitional = Configuration::transitional(1, btreeset! {1, 2}, btreeset! {3});
        assert!(transitional.has_vote(3));
    }

    #[test]
    fn manager_tracks_active_across_append_and_snapshot() {
        let mut mgr = ConfigurationManager::new();
        mgr.add(1, Configuration::new_initial(1));
        assert_eq!(mgr.active(1).id, 0);

        mgr.add(5, Configuration::stable(5, btreeset! {1, 2}));
        assert_eq!(mgr.active(10).id, 5);

        mgr.set_snapshot(5, Configuration::stable(5, btreeset! {1, 2}));
        assert_eq!(mgr.active(5).id, 5);
    }

    #[test]
    fn quorum_min_picks_majority_held_value() {
        let cfg = Configuration::stable(1, btreeset! {1, 2, 3});
        let mut values = BTreeMap::new();
        values.insert(1, 10);
        values.insert(2, 7);
        values.insert(3, 5);
        assert_eq!(cfg.quorum_min(&values), 7);
    }
}
